use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use setter_core::config::SchedulingConfig;
use setter_core::domain::qualification::MeetingSlot;
use setter_core::ports::{CollaboratorError, MeetingRequest, SchedulingService};

use super::{classify_send_error, decode_json, endpoint, expect_success};

const SERVICE: &str = "scheduling";

/// JSON scheduling API: `POST {base_url}/meetings`.
pub struct HttpScheduling {
    client: Client,
    url: String,
    api_key: Option<SecretString>,
    duration_minutes: u32,
}

#[derive(Debug, Serialize)]
struct BookingRequest<'a> {
    #[serde(flatten)]
    meeting: &'a MeetingRequest,
    duration_minutes: u32,
}

#[derive(Debug, Deserialize)]
struct Booking {
    starts_at: DateTime<Utc>,
    duration_minutes: Option<u32>,
    booking_reference: String,
}

impl HttpScheduling {
    /// `None` when scheduling is disabled or has no endpoint.
    pub fn from_config(client: Client, config: &SchedulingConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let base_url = config.base_url.as_deref()?;
        Some(Self {
            client,
            url: endpoint(base_url, "meetings"),
            api_key: config.api_key.clone(),
            duration_minutes: config.meeting_duration_minutes,
        })
    }

    fn slot(&self, booking: Booking) -> MeetingSlot {
        MeetingSlot {
            starts_at: booking.starts_at,
            duration_minutes: booking.duration_minutes.unwrap_or(self.duration_minutes),
            booking_reference: booking.booking_reference,
        }
    }
}

#[async_trait]
impl SchedulingService for HttpScheduling {
    async fn propose_slot(
        &self,
        request: MeetingRequest,
    ) -> Result<MeetingSlot, CollaboratorError> {
        let body = BookingRequest { meeting: &request, duration_minutes: self.duration_minutes };
        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }
        let response = builder.send().await.map_err(|error| classify_send_error(SERVICE, error))?;
        let response = expect_success(SERVICE, response).await?;
        let booking: Booking = decode_json(SERVICE, response).await?;
        Ok(self.slot(booking))
    }
}

/// Used when no scheduling service is configured. Qualified leads are left
/// for a person to book.
pub struct DisabledScheduling;

#[async_trait]
impl SchedulingService for DisabledScheduling {
    async fn propose_slot(
        &self,
        _request: MeetingRequest,
    ) -> Result<MeetingSlot, CollaboratorError> {
        Err(CollaboratorError::Rejected("scheduling is disabled".to_string()))
    }
}
