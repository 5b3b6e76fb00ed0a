use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use setter_core::config::CrmConfig;
use setter_core::domain::lead::RawLead;
use setter_core::ports::{CollaboratorError, LeadSource};
use tracing::{debug, warn};

use super::{classify_send_error, decode_json, endpoint, expect_success};

const SERVICE: &str = "crm";
const PAGE_SIZE: u32 = 100;
const MAX_PAGES: u32 = 50;

/// Lead source backed by a CRM contacts API (GoHighLevel v1 shape).
pub struct CrmLeadSource {
    client: Client,
    base_url: String,
    api_key: SecretString,
    location_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContactPage {
    #[serde(default)]
    contacts: Vec<Contact>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Contact {
    id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    company_name: Option<String>,
    #[serde(alias = "createdAt")]
    date_added: Option<String>,
}

impl CrmLeadSource {
    /// `None` when the CRM section lacks credentials.
    pub fn from_config(client: Client, config: &CrmConfig) -> Option<Self> {
        let api_key = config.api_key.clone()?;
        let location_id = config.location_id.clone()?;
        Some(Self { client, base_url: config.base_url.clone(), api_key, location_id })
    }

    async fn fetch_page(&self, skip: u32) -> Result<ContactPage, CollaboratorError> {
        let limit = PAGE_SIZE.to_string();
        let skip = skip.to_string();
        let response = self
            .client
            .get(endpoint(&self.base_url, "contacts/"))
            .bearer_auth(self.api_key.expose_secret())
            .query(&[
                ("locationId", self.location_id.as_str()),
                ("limit", limit.as_str()),
                ("skip", skip.as_str()),
            ])
            .send()
            .await
            .map_err(|error| classify_send_error(SERVICE, error))?;
        let response = expect_success(SERVICE, response).await?;
        decode_json(SERVICE, response).await
    }
}

#[async_trait]
impl LeadSource for CrmLeadSource {
    async fn fetch_new_leads(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawLead>, CollaboratorError> {
        // Pages until a short one comes back.
        let mut contacts = Vec::new();
        let mut pages = 0;
        loop {
            let page = self.fetch_page(pages * PAGE_SIZE).await?;
            pages += 1;
            let full = page.contacts.len() >= PAGE_SIZE as usize;
            contacts.extend(page.contacts);
            if !full {
                break;
            }
            if pages >= MAX_PAGES {
                warn!(
                    event_name = "crm.page_limit_reached",
                    pages,
                    total = contacts.len(),
                    "stopped paging crm contacts"
                );
                break;
            }
        }

        let total = contacts.len();
        let leads = leads_since(contacts, since);
        debug!(
            event_name = "crm.contacts_fetched",
            total,
            pages,
            recent = leads.len(),
            since = %since,
            "fetched crm contacts"
        );
        Ok(leads)
    }
}

/// Contacts created at or after `since`. A contact without a readable
/// creation time is skipped, since its age cannot be checked.
fn leads_since(contacts: Vec<Contact>, since: DateTime<Utc>) -> Vec<RawLead> {
    contacts
        .into_iter()
        .filter_map(|contact| {
            let created_at = contact
                .date_added
                .as_deref()
                .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
                .map(|value| value.with_timezone(&Utc));
            let Some(created_at) = created_at else {
                warn!(
                    event_name = "crm.contact_skipped",
                    lead_id = %contact.id,
                    "contact has no readable creation time"
                );
                return None;
            };
            (created_at >= since).then(|| RawLead {
                id: contact.id,
                first_name: contact.first_name,
                last_name: contact.last_name,
                phone: contact.phone,
                email: contact.email,
                company: contact.company_name,
                created_at,
            })
        })
        .collect()
}
