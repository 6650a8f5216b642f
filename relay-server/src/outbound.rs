//! Outbound messages through the Graph API.
//!
//! A thin client: every call is a single POST to
//! `{base}/{version}/{phone_number_id}/messages`. Failures are returned to
//! the caller; nothing here retries.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::Config;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("outbound messaging is not configured: {0} is missing")]
    NotConfigured(&'static str),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// One entry of a bulk send request.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkRecipient {
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GraphClient {
    http: Client,
    messages_url: String,
    access_token: String,
    bulk_concurrency: usize,
}

impl GraphClient {
    pub fn new(
        base_url: &str,
        version: &str,
        phone_number_id: &str,
        access_token: impl Into<String>,
        request_timeout: Duration,
        bulk_concurrency: usize,
    ) -> Result<Self, SendError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(bulk_concurrency.max(1))
            .build()?;

        Ok(Self {
            http,
            messages_url: format!(
                "{}/{}/{}/messages",
                base_url.trim_end_matches('/'),
                version,
                phone_number_id
            ),
            access_token: access_token.into(),
            bulk_concurrency: bulk_concurrency.max(1),
        })
    }

    /// Build a client from configuration; both credentials are required.
    pub fn from_config(config: &Config) -> Result<Self, SendError> {
        let phone_number_id = config
            .phone_number_id
            .as_deref()
            .ok_or(SendError::NotConfigured("PHONE_NUMBER_ID"))?;
        let access_token = config
            .access_token
            .as_deref()
            .ok_or(SendError::NotConfigured("ACCESS_TOKEN"))?;

        Self::new(
            &config.graph_base_url,
            &config.graph_api_version,
            phone_number_id,
            access_token,
            config.request_timeout,
            config.bulk_concurrency,
        )
    }

    pub async fn send_text(&self, to: &str, body: &str) -> Result<Value, SendError> {
        self.post(to, &text_message(to, body)).await
    }

    pub async fn send_template(
        &self,
        to: &str,
        template_name: &str,
        language: &str,
        parameters: &[String],
    ) -> Result<Value, SendError> {
        self.post(to, &template_message(to, template_name, language, parameters))
            .await
    }

    /// Send a text to each recipient with at most `bulk_concurrency`
    /// requests in flight. Incomplete entries count as failures.
    pub async fn send_bulk(&self, recipients: Vec<BulkRecipient>) -> BulkReport {
        let mut report = BulkReport {
            total: recipients.len(),
            ..BulkReport::default()
        };

        let mut results = stream::iter(recipients)
            .map(|recipient| async move {
                if recipient.phone.is_empty() || recipient.message.is_empty() {
                    return Err(format!("incomplete recipient {:?}", recipient.phone));
                }
                self.send_text(&recipient.phone, &recipient.message)
                    .await
                    .map(|_| ())
                    .map_err(|e| format!("{}: {}", recipient.phone, e))
            })
            .buffer_unordered(self.bulk_concurrency);

        while let Some(result) = results.next().await {
            match result {
                Ok(()) => report.successful += 1,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(e);
                }
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            "outbound_bulk_complete"
        );

        report
    }

    async fn post(&self, to: &str, body: &Value) -> Result<Value, SendError> {
        let resp = self
            .http
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(to = %to, error = %e, "outbound_request_failed");
                SendError::Http(e)
            })?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            warn!(to = %to, status_code = status.as_u16(), body = %text, "outbound_rejected");
            return Err(SendError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        info!(to = %to, kind = ?body.get("type"), "outbound_sent");
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

pub fn text_message(to: &str, body: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "text",
        "text": { "body": body },
    })
}

/// Template message; body parameters become a single `body` component.
pub fn template_message(to: &str, template_name: &str, language: &str, parameters: &[String]) -> Value {
    let mut template = json!({
        "name": template_name,
        "language": { "code": language },
    });

    if !parameters.is_empty() {
        template["components"] = json!([{
            "type": "body",
            "parameters": parameters
                .iter()
                .map(|p| json!({ "type": "text", "text": p }))
                .collect::<Vec<_>>(),
        }]);
    }

    json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": "template",
        "template": template,
    })
}
