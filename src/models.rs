use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Base URL for Outlook on the web message deep links
pub const OUTLOOK_DEEPLINK_BASE: &str = "https://outlook.office.com/mail/deeplink/read/";

/// Fields requested from Graph for every message listing
pub const MESSAGE_SELECT_FIELDS: &str = "id,subject,bodyPreview,receivedDateTime,from,body";

/// A message as returned by `GET /me/messages`.
///
/// Every field except `id` may be missing or `null` in the service response.
/// Accessors return an empty string (or `None`) for absent data so filters
/// treat it as "no match".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ItemBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_date_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<EmailAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MessageRecord {
    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    pub fn body_preview(&self) -> &str {
        self.body_preview.as_deref().unwrap_or("")
    }

    /// Full body content, empty when the body was not selected
    pub fn body_content(&self) -> &str {
        self.body
            .as_ref()
            .and_then(|b| b.content.as_deref())
            .unwrap_or("")
    }

    pub fn sender_address(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.email_address.as_ref())
            .and_then(|e| e.address.as_deref())
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.from
            .as_ref()
            .and_then(|f| f.email_address.as_ref())
            .and_then(|e| e.name.as_deref())
    }

    /// Parsed `receivedDateTime`, if present and valid RFC 3339
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_date_time
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn outlook_link(&self) -> String {
        outlook_link(&self.id)
    }

    /// Project into the flat structure used for display
    pub fn format(&self) -> FormattedMessage {
        let timestamp = match self.received_date_time.as_deref() {
            None | Some("") => "Unknown".to_string(),
            // Wall time in the offset the service sent, not converted to UTC
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
                Err(_) => raw.to_string(),
            },
        };

        let sender_email = self.sender_address().unwrap_or("Unknown").to_string();
        let sender_name = self
            .sender_name()
            .map(str::to_string)
            .unwrap_or_else(|| sender_email.clone());

        FormattedMessage {
            id: self.id.clone(),
            timestamp,
            sender_name,
            sender_email,
            subject: self.subject().to_string(),
            preview: self.body_preview().to_string(),
            outlook_link: self.outlook_link(),
        }
    }
}

/// Deep link into Outlook on the web; empty id yields an empty string
pub fn outlook_link(message_id: &str) -> String {
    if message_id.is_empty() {
        return String::new();
    }
    format!("{}{}", OUTLOOK_DEEPLINK_BASE, message_id)
}

/// Display-oriented projection of a [`MessageRecord`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedMessage {
    pub id: String,
    pub timestamp: String,
    pub sender_name: String,
    pub sender_email: String,
    pub subject: String,
    pub preview: String,
    pub outlook_link: String,
}
