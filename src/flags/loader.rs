//! Ruleset loader: background poller with ETag conditional GETs, quota
//! handling and atomic ruleset publication (spec component C5, §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ClientOptions;
use crate::error::Error;
use crate::transport::{Method, Transport};

use super::model::{LocalEvaluationResponse, Ruleset};

#[derive(Debug, Deserialize)]
struct QuotaLimitedBody {
    #[serde(default)]
    r#type: String,
}

/// Owns the latest [`Ruleset`] snapshot and the single background task that
/// keeps it fresh. Readers get an `Arc` clone and never block on the poller.
pub struct RulesetLoader {
    options: Arc<ClientOptions>,
    transport: Arc<dyn Transport>,
    ruleset: RwLock<Option<Arc<Ruleset>>>,
    etag: RwLock<Option<String>>,
    quota_limited: AtomicBool,
    is_running: tokio::sync::RwLock<bool>,
    stop: Arc<tokio::sync::Notify>,
}

impl RulesetLoader {
    pub fn new(options: Arc<ClientOptions>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            options,
            transport,
            ruleset: RwLock::new(None),
            etag: RwLock::new(None),
            quota_limited: AtomicBool::new(false),
            is_running: tokio::sync::RwLock::new(false),
            stop: Arc::new(tokio::sync::Notify::new()),
        })
    }

    pub fn current(&self) -> Option<Arc<Ruleset>> {
        self.ruleset.read().expect("ruleset lock poisoned").clone()
    }

    /// Starts the poll loop if it isn't already running. Idempotent and safe
    /// to call from multiple tasks concurrently — only one loop ever runs.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return;
            }
            *running = true;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.poll_loop().await;
        });
    }

    pub fn shutdown(&self) {
        self.stop.notify_waiters();
    }

    async fn poll_loop(self: Arc<Self>) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "initial ruleset fetch failed");
        }

        let mut interval = tokio::time::interval(self.options.poll_interval());
        interval.tick().await; // first tick fires immediately; already fetched above

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.quota_limited.load(Ordering::SeqCst) {
                        debug!("skipping poll: quota limited until next explicit refresh");
                        continue;
                    }
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "ruleset poll failed, keeping prior ruleset");
                    }
                }
                _ = self.stop.notified() => {
                    info!("ruleset poller shutting down");
                    break;
                }
            }
        }
    }

    /// Forces an immediate fetch, bypassing the quota-limited gate. Returns
    /// the newly published ruleset, or the existing one on a 304/error.
    pub async fn refresh(&self) -> Result<Option<Arc<Ruleset>>, Error> {
        let personal_api_key = self
            .options
            .personal_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("local evaluation requires a personal_api_key".into()))?;

        let url = self.options.endpoints().build_local_eval_url(&self.options.api_key);
        let auth = format!("Bearer {personal_api_key}");
        let etag = self.etag.read().expect("etag lock poisoned").clone();
        let mut headers = vec![("Authorization", auth.as_str())];
        if let Some(etag) = &etag {
            headers.push(("If-None-Match", etag.as_str()));
        }

        let response = self.transport.request(Method::Get, &url, &headers, None).await?;

        match response.status {
            304 => {
                if let Some(new_etag) = response.header("etag") {
                    *self.etag.write().expect("etag lock poisoned") = Some(new_etag.to_string());
                }
                Ok(self.current())
            }
            402 => {
                let body = response.json::<QuotaLimitedBody>().ok();
                warn!(kind = ?body.map(|b| b.r#type), "ruleset fetch quota limited, pausing poller until explicit refresh");
                self.quota_limited.store(true, Ordering::SeqCst);
                *self.etag.write().expect("etag lock poisoned") = None;
                Ok(self.current())
            }
            _ if response.is_success() => {
                self.quota_limited.store(false, Ordering::SeqCst);
                if let Some(new_etag) = response.header("etag") {
                    *self.etag.write().expect("etag lock poisoned") = Some(new_etag.to_string());
                }
                let body = response.json::<LocalEvaluationResponse>().map_err(|e| {
                    warn!(error = %e, "malformed ruleset body, keeping prior ruleset");
                    *self.etag.write().expect("etag lock poisoned") = None;
                    e
                })?;
                let ruleset = Arc::new(Ruleset::from(body));
                *self.ruleset.write().expect("ruleset lock poisoned") = Some(ruleset.clone());
                Ok(Some(ruleset))
            }
            other => {
                warn!(status = other, "unexpected ruleset fetch status, keeping prior ruleset");
                Ok(self.current())
            }
        }
    }
}
