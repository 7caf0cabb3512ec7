use std::collections::HashMap;
use std::time::Duration;

use derive_builder::Builder;
use serde_json::Value;

use crate::endpoints::EndpointManager;
use crate::error::Error;

/// Configuration for a [`crate::client::Client`].
///
/// Construct with [`ClientOptionsBuilder`]; only `api_key` is required, every
/// other field has a production-sane default matching this codebase's other
/// client configurations.
#[derive(Builder, Debug, Clone)]
#[builder(setter(into), build_fn(validate = "Self::validate", error = "Error"))]
pub struct ClientOptions {
    /// Project API key, sent on capture and remote-evaluation requests.
    pub api_key: String,

    /// Personal API key. Required to enable local evaluation.
    #[builder(default)]
    pub personal_api_key: Option<String>,

    /// Ingestion/API host. Defaults to the US ingestion endpoint.
    #[builder(default = "crate::endpoints::DEFAULT_HOST.to_string()")]
    pub host: String,

    /// Enable the local flag evaluator + ruleset poller.
    #[builder(default = "false")]
    pub enable_local_evaluation: bool,

    /// Ruleset poll interval, in seconds.
    #[builder(default = "30")]
    pub poll_interval_seconds: u64,

    /// Number of queued events that triggers an immediate flush.
    #[builder(default = "20")]
    pub flush_at: usize,

    /// Maximum time between flushes, in seconds.
    #[builder(default = "30")]
    pub flush_interval_seconds: u64,

    /// Maximum number of events per outgoing batch.
    #[builder(default = "100")]
    pub max_batch_size: usize,

    /// Bound on the in-memory producer queue; beyond this, `capture` drops
    /// events rather than blocking the caller.
    #[builder(default = "10_000")]
    pub max_queue_size: usize,

    /// Bound on the number of distinct `(distinct_id, flag, value)` tuples
    /// tracked for `$feature_flag_called` deduplication.
    #[builder(default = "50_000")]
    pub feature_flag_sent_cache_size_limit: usize,

    /// How long a `$feature_flag_called` dedup entry survives, in seconds.
    #[builder(default = "2 * 24 * 60 * 60")]
    pub feature_flag_sent_cache_sliding_expiration_seconds: u64,

    /// Properties merged into every captured event.
    #[builder(default)]
    pub super_properties: HashMap<String, Value>,

    /// Disables IP-based geolocation server-side.
    #[builder(default = "true")]
    pub geoip_disable: bool,

    /// Timeout for capture/batch requests, in seconds.
    #[builder(default = "10")]
    pub request_timeout_seconds: u64,

    /// Timeout for remote flag-evaluation requests, in seconds.
    #[builder(default = "3")]
    pub feature_flags_request_timeout_seconds: u64,

    /// Kill switch: when true, `capture` becomes a no-op.
    #[builder(default = "false")]
    pub disabled: bool,
}

impl ClientOptionsBuilder {
    fn validate(&self) -> Result<(), Error> {
        match &self.api_key {
            Some(k) if !k.trim().is_empty() => {}
            _ => return Err(Error::Config("api_key must be set and non-empty".into())),
        }
        if self.enable_local_evaluation == Some(true)
            && matches!(&self.personal_api_key, None | Some(None))
        {
            return Err(Error::Config(
                "personal_api_key is required when enable_local_evaluation is true".into(),
            ));
        }
        Ok(())
    }
}

impl From<&str> for ClientOptions {
    fn from(api_key: &str) -> Self {
        ClientOptionsBuilder::default()
            .api_key(api_key)
            .build()
            .expect("api_key is non-empty")
    }
}

impl ClientOptions {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn feature_flags_request_timeout(&self) -> Duration {
        Duration::from_secs(self.feature_flags_request_timeout_seconds)
    }

    pub fn endpoints(&self) -> EndpointManager {
        EndpointManager::new(Some(self.host.clone()))
    }
}
