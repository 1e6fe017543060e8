//! Webhook delivery for terminal submissions
//!
//! Single best-effort POST of the final record; the store stays the source
//! of truth, so failures are logged and dropped.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to build callback client: {0}")]
    Client(reqwest::Error),
}

/// Fires webhook callbacks for terminal submissions
#[derive(Debug, Clone)]
pub struct CallbackEmitter {
    client: reqwest::Client,
}

impl CallbackEmitter {
    /// Create an emitter whose requests time out after `timeout_ms`
    pub fn new(timeout_ms: u64) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(CallbackError::Client)?;
        Ok(Self { client })
    }

    /// POST the terminal record to the URL, once.
    ///
    /// Non-2xx responses and transport errors are logged at warn and
    /// swallowed.
    pub async fn emit(&self, url: &str, record: &Value) {
        match self.client.post(url).json(record).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url, status = %response.status(), "callback delivered");
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "callback rejected");
            }
            Err(e) => {
                warn!(url, error = %e, "callback delivery failed");
            }
        }
    }
}
