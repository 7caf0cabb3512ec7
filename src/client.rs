//! Public facade (spec component C10, §4.6): `capture`, `get_feature_flag`,
//! `get_all_flags`, `identify`, `group_identify`, `flush`, `shutdown`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{instrument, warn};

use crate::capture::enricher::Enricher;
use crate::capture::queue::EventQueue;
use crate::config::ClientOptions;
use crate::error::Error;
use crate::event::{feature_flag_called_event, Event, Group, Groups};
use crate::flags::model::FlagValue;
use crate::flags::FlagsEngine;
use crate::transport::{ReqwestTransport, Transport};

/// Options accepted by [`Client::get_feature_flag`] / [`Client::get_all_flags`].
#[derive(Debug, Clone, Default)]
pub struct FlagLookupOptions {
    pub person_properties: Option<Value>,
    pub groups: Option<Groups>,
    pub group_properties: Option<HashMap<String, Value>>,
    /// Never fall back to the remote evaluation endpoint.
    pub only_evaluate_locally: bool,
    /// Skip the `$feature_flag_called` event for this call.
    pub send_feature_flag_events: bool,
}

impl FlagLookupOptions {
    pub fn new() -> Self {
        Self {
            send_feature_flag_events: true,
            ..Default::default()
        }
    }
}

/// Entry point of the crate: owns the event queue, the flag engine and the
/// enricher, and exposes the operations applications call directly.
pub struct Client {
    options: Arc<ClientOptions>,
    flags: Arc<FlagsEngine>,
    enricher: Arc<Enricher>,
    queue: EventQueue,
}

/// Builds and starts a client: spins up the ruleset poller (if local
/// evaluation is enabled) and the background event shipper.
pub async fn client<C: Into<ClientOptions>>(options: C) -> Client {
    let options = Arc::new(options.into());
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(&options));
    let flags = Arc::new(FlagsEngine::new(options.clone(), transport.clone()));
    flags.start().await;
    let enricher = Arc::new(Enricher::new(options.clone(), flags.clone()));
    let queue = EventQueue::start(options.clone(), transport);
    Client {
        options,
        flags,
        enricher,
        queue,
    }
}

impl Client {
    #[instrument(skip(self, event))]
    pub async fn capture(&self, mut event: Event) -> Result<(), Error> {
        if self.options.disabled {
            return Ok(());
        }

        let base = self.enricher.base_properties();
        for (key, value) in base {
            event.properties.props.entry(key).or_insert(value);
        }
        self.enricher.merge_groups(&mut event.properties.props, Some(&event.groups));

        if event.event != "$feature_flag_called" {
            self.enricher
                .enrich_with_flags(
                    &event.properties.distinct_id,
                    &mut event.properties.props,
                    None,
                    Some(&event.groups),
                    !event.send_feature_flags,
                )
                .await;
        }

        let body = serde_json::to_value(&event)?;
        if !self.queue.try_capture(body) {
            warn!(distinct_id = %event.properties.distinct_id, "event queue full, dropping event");
            return Err(Error::QueueFull);
        }
        Ok(())
    }

    #[instrument(skip(self, opts))]
    pub async fn get_feature_flag(
        &self,
        key: &str,
        distinct_id: &str,
        opts: FlagLookupOptions,
    ) -> Result<Option<FlagValue>, Error> {
        let value = self
            .flags
            .get_feature_flag(
                key,
                distinct_id,
                opts.person_properties.as_ref(),
                opts.groups.as_ref(),
                opts.group_properties.as_ref(),
                opts.only_evaluate_locally,
            )
            .await?;

        if let Some(v) = &value {
            if opts.send_feature_flag_events
                && self.enricher.should_emit_feature_flag_called(distinct_id, key, v)
            {
                let called = feature_flag_called_event(distinct_id, key, &v.as_json());
                if let Err(e) = self.capture(called).await {
                    warn!(error = %e, "failed to capture $feature_flag_called");
                }
            }
        }

        Ok(value)
    }

    pub async fn is_feature_enabled(
        &self,
        key: &str,
        distinct_id: &str,
        opts: FlagLookupOptions,
    ) -> Result<bool, Error> {
        Ok(self
            .get_feature_flag(key, distinct_id, opts)
            .await?
            .map(|v| v.is_truthy())
            .unwrap_or(false))
    }

    pub async fn get_all_flags(
        &self,
        distinct_id: &str,
        opts: FlagLookupOptions,
    ) -> Result<HashMap<String, FlagValue>, Error> {
        self.flags
            .get_all_flags(
                distinct_id,
                opts.person_properties.as_ref(),
                opts.groups.as_ref(),
                opts.group_properties.as_ref(),
                opts.only_evaluate_locally,
            )
            .await
    }

    pub async fn identify(&self, distinct_id: &str, properties: HashMap<String, Value>) -> Result<(), Error> {
        let mut event = Event::new("$identify", distinct_id);
        for (k, v) in properties {
            event.insert_prop(k, v)?;
        }
        self.capture(event).await
    }

    pub async fn group_identify(
        &self,
        group_type: &str,
        group_key: &str,
        properties: HashMap<String, Value>,
    ) -> Result<(), Error> {
        let mut event = Event::new("$groupidentify", group_key);
        event.insert_prop("$group_type", group_type)?;
        event.insert_prop("$group_key", group_key)?;
        event.insert_prop("$group_set", properties)?;
        let mut groups = Groups::new();
        groups.insert(Group::new(group_type, group_key));
        event.set_groups(groups);
        self.capture(event).await
    }

    /// Forces an immediate ruleset fetch, bypassing the poll interval.
    pub async fn reload_feature_flags(&self) -> Result<(), Error> {
        self.flags.reload().await
    }

    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    pub async fn shutdown(&self) {
        self.flags.shutdown();
        self.queue.shutdown().await;
    }
}
