//! Configuration module for environment variable parsing.
//!
//! Every setting has a default so the server boots with an empty environment;
//! malformed values are logged and replaced by the default.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::relay::ProcessorSettings;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the web server to listen on
    pub port: u16,

    /// WebSocket endpoint that receives relayed webhook payloads
    pub websocket_url: String,

    /// Upper bound on a single delivery to the WebSocket endpoint
    pub delivery_timeout: Duration,

    /// Upper bound on a liveness probe of the WebSocket endpoint
    pub probe_timeout: Duration,

    /// Pause after a failed delivery before the same payload is retried
    pub retry_delay: Duration,

    /// How long the consumer blocks waiting for the next payload
    pub pop_timeout: Duration,

    /// Attempt ceiling before a payload is dead-lettered (None = retry forever)
    pub max_attempts: Option<u32>,

    /// Number of dead letters retained in memory. When full, the oldest is
    /// evicted and logged as `dead_letter_evicted`; 0 keeps every one.
    pub dead_letter_capacity: usize,

    /// How long a restart waits for the old consumer to stop
    pub shutdown_grace: Duration,

    // =========================================================================
    // Contact Cache
    // =========================================================================

    /// SQLite database file holding registered contacts
    pub contacts_db_path: String,

    // =========================================================================
    // Webhook Verification
    // =========================================================================

    /// Token expected in the `hub.verify_token` subscription handshake
    pub verify_token: String,

    /// App secret for `X-Hub-Signature-256` verification
    pub app_secret: Option<String>,

    // =========================================================================
    // Outbound Graph API
    // =========================================================================

    /// Sender phone number id
    pub phone_number_id: Option<String>,

    /// Bearer token for the Graph API
    pub access_token: Option<String>,

    /// Graph API version segment, e.g. "v17.0"
    pub graph_api_version: String,

    /// Graph API base URL
    pub graph_base_url: String,

    /// Maximum concurrent requests during a bulk send
    pub bulk_concurrency: usize,

    /// HTTP request timeout for outbound calls
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let delivery_timeout = parse_millis("DELIVERY_TIMEOUT_MS", 10_000);

        Config {
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5050),

            websocket_url: env::var("WEBSOCKET_URL")
                .unwrap_or_else(|_| "ws://localhost:8080/ws".to_string()),

            delivery_timeout,

            probe_timeout: parse_millis("PROBE_TIMEOUT_MS", 5_000),

            retry_delay: parse_millis("RELAY_RETRY_DELAY_MS", 5_000),

            pop_timeout: parse_millis("RELAY_POP_TIMEOUT_MS", 1_000),

            max_attempts: match env::var("RELAY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
            {
                Some(0) | None => None,
                Some(n) => Some(n),
            },

            dead_letter_capacity: env::var("RELAY_DEAD_LETTER_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),

            shutdown_grace: parse_millis(
                "RELAY_SHUTDOWN_GRACE_MS",
                delivery_timeout.as_millis() as u64 + 1_000,
            ),

            contacts_db_path: env::var("CONTACTS_DB_PATH")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "contacts.db".to_string()),

            verify_token: env::var("VERIFY_TOKEN").unwrap_or_else(|_| "hola".to_string()),

            app_secret: non_empty("APP_SECRET"),

            phone_number_id: non_empty("PHONE_NUMBER_ID"),

            access_token: non_empty("ACCESS_TOKEN"),

            graph_api_version: env::var("GRAPH_API_VERSION")
                .unwrap_or_else(|_| "v17.0".to_string()),

            graph_base_url: env::var("GRAPH_BASE_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com".to_string()),

            bulk_concurrency: env::var("BULK_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(5),

            request_timeout: parse_millis("REQUEST_TIMEOUT_MS", 10_000),
        }
    }

    /// Consumer loop settings derived from this configuration.
    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            pop_timeout: self.pop_timeout,
            retry_delay: self.retry_delay,
            delivery_timeout: self.delivery_timeout,
            max_attempts: self.max_attempts,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Parse a millisecond count into a `Duration`, falling back to the default.
fn parse_millis(name: &str, default_ms: u64) -> Duration {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return Duration::from_millis(default_ms),
    };

    match raw.trim().parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => {
            warn!(env_var = name, value = %raw, "Invalid millisecond value, using default");
            Duration::from_millis(default_ms)
        }
    }
}

/// Read a variable, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_millis_valid() {
        env::set_var("TEST_RELAY_MILLIS", "250");
        assert_eq!(parse_millis("TEST_RELAY_MILLIS", 0), Duration::from_millis(250));
        env::remove_var("TEST_RELAY_MILLIS");
    }

    #[test]
    fn test_parse_millis_invalid_uses_default() {
        env::set_var("TEST_RELAY_MILLIS_BAD", "soon");
        assert_eq!(
            parse_millis("TEST_RELAY_MILLIS_BAD", 42),
            Duration::from_millis(42)
        );
        env::remove_var("TEST_RELAY_MILLIS_BAD");
    }

    #[test]
    fn test_parse_millis_default() {
        assert_eq!(
            parse_millis("NONEXISTENT_RELAY_VAR", 10),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_non_empty() {
        env::set_var("TEST_RELAY_BLANK", "   ");
        assert_eq!(non_empty("TEST_RELAY_BLANK"), None);
        env::set_var("TEST_RELAY_BLANK", " secret ");
        assert_eq!(non_empty("TEST_RELAY_BLANK"), Some("secret".to_string()));
        env::remove_var("TEST_RELAY_BLANK");
    }
}
