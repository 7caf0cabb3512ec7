//! Remote flag evaluation (spec component C6, §6.3).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ClientOptions;
use crate::endpoints::Endpoint;
use crate::error::{ApiErrorBody, Error};
use crate::event::Groups;
use crate::transport::{Method, Transport};

use super::model::FlagValue;

#[derive(Debug, Serialize)]
struct RemoteEvalRequest<'a> {
    token: &'a str,
    distinct_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    person_properties: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_properties: Option<&'a HashMap<String, Value>>,
    disable_geoip: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RemoteFlagsResult {
    #[serde(default, rename = "featureFlags")]
    pub feature_flags: HashMap<String, FlagValue>,
    #[serde(default, rename = "featureFlagPayloads")]
    pub feature_flag_payloads: HashMap<String, Value>,
    #[serde(default, rename = "errorsWhileComputingFlags")]
    pub errors_while_computing_flags: bool,
}

/// Thin wrapper over the remote flags endpoint, routed through the shared
/// [`Transport`] boundary rather than owning its own HTTP client.
pub struct RemoteFlagFetcher {
    transport: Arc<dyn Transport>,
    options: Arc<ClientOptions>,
}

impl RemoteFlagFetcher {
    pub fn new(transport: Arc<dyn Transport>, options: Arc<ClientOptions>) -> Self {
        Self { transport, options }
    }

    pub async fn fetch(
        &self,
        distinct_id: &str,
        person_properties: Option<&Value>,
        groups: Option<&Groups>,
        group_properties: Option<&HashMap<String, Value>>,
    ) -> Result<RemoteFlagsResult, Error> {
        let url = self.options.endpoints().build_url(Endpoint::Flags);
        let body = RemoteEvalRequest {
            token: &self.options.api_key,
            distinct_id,
            person_properties,
            groups: groups.map(Groups::to_map),
            group_properties,
            disable_geoip: self.options.geoip_disable,
        };
        let body = serde_json::to_value(&body)?;

        let response = self.transport.request(Method::Post, &url, &[], Some(&body)).await?;
        if !response.is_success() {
            let status = response.status;
            let error_body = response.json::<ApiErrorBody>().unwrap_or(ApiErrorBody {
                r#type: "unknown".into(),
                code: String::new(),
                detail: String::new(),
                attr: Value::Null,
            });
            return Err(Error::Api(status, error_body));
        }

        response.json::<RemoteFlagsResult>()
    }
}
