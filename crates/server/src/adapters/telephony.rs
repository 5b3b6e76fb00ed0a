use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use setter_core::config::TelephonyConfig;
use setter_core::ports::{CollaboratorError, PlaceCallRequest, TelephonyProvider};
use tracing::info;

use super::{classify_send_error, decode_json, endpoint, expect_success};

const SERVICE: &str = "telephony";
const STATUS_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

/// Twilio-style REST telephony: form-encoded call creation with basic auth.
pub struct TwilioTelephony {
    client: Client,
    api_base_url: String,
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
    machine_detection: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedCall {
    sid: String,
}

impl TwilioTelephony {
    pub fn new(client: Client, config: &TelephonyConfig) -> Self {
        Self {
            client,
            api_base_url: config.api_base_url.clone(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
            machine_detection: config.machine_detection,
        }
    }

    fn calls_url(&self) -> String {
        endpoint(&self.api_base_url, &format!("Accounts/{}/Calls.json", self.account_sid))
    }

    fn call_url(&self, provider_call_id: &str) -> String {
        endpoint(
            &self.api_base_url,
            &format!("Accounts/{}/Calls/{provider_call_id}.json", self.account_sid),
        )
    }

    fn call_form(&self, request: &PlaceCallRequest) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("To", request.to.as_str().to_string()),
            ("From", self.from_number.clone()),
            ("Url", request.callback_url.clone()),
            ("StatusCallback", request.status_callback_url.clone()),
            ("Timeout", request.ring_timeout_secs.to_string()),
        ];
        form.extend(STATUS_EVENTS.iter().map(|event| ("StatusCallbackEvent", event.to_string())));
        if self.machine_detection {
            form.push(("MachineDetection", "Enable".to_string()));
        }
        form
    }
}

#[async_trait]
impl TelephonyProvider for TwilioTelephony {
    async fn place_call(&self, request: PlaceCallRequest) -> Result<String, CollaboratorError> {
        let response = self
            .client
            .post(self.calls_url())
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&self.call_form(&request))
            .send()
            .await
            .map_err(|error| classify_send_error(SERVICE, error))?;
        let response = expect_success(SERVICE, response).await?;
        let created: CreatedCall = decode_json(SERVICE, response).await?;

        info!(
            event_name = "telephony.call_created",
            attempt_id = %request.attempt_id,
            lead_id = %request.lead_id,
            provider_call_id = %created.sid,
            "provider accepted dial request"
        );
        Ok(created.sid)
    }

    async fn hang_up(&self, provider_call_id: &str) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(self.call_url(provider_call_id))
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[("Status", "completed")])
            .send()
            .await
            .map_err(|error| classify_send_error(SERVICE, error))?;
        expect_success(SERVICE, response).await?;
        Ok(())
    }
}
