use flagcore::{client, ClientOptionsBuilder, FlagLookupOptions};
use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn local_evaluation_with_mock_server() {
    let server = MockServer::start();

    let mock_flags = json!({
        "flags": [
            {
                "key": "feature-a",
                "active": true,
                "filters": {
                    "groups": [
                        {
                            "properties": [],
                            "rollout_percentage": 50.0,
                            "variant": null
                        }
                    ],
                    "multivariate": null,
                    "payloads": {}
                }
            },
            {
                "key": "feature-b",
                "active": true,
                "filters": {
                    "groups": [
                        {
                            "properties": [
                                {
                                    "key": "email",
                                    "value": "@company.com",
                                    "operator": "icontains"
                                }
                            ],
                            "rollout_percentage": 100.0,
                            "variant": null
                        }
                    ],
                    "multivariate": null,
                    "payloads": {}
                }
            }
        ],
        "group_type_mapping": {},
        "cohorts": {}
    });

    let eval_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/api/feature_flag/local_evaluation/")
            .header("Authorization", "Bearer test_personal_key")
            .query_param("token", "test_project_key")
            .query_param("send_cohorts", "");
        then.status(200).json_body(mock_flags);
    });

    let options = ClientOptionsBuilder::default()
        .host(server.base_url())
        .api_key("test_project_key".to_string())
        .personal_api_key("test_personal_key".to_string())
        .enable_local_evaluation(true)
        .poll_interval_seconds(60u64)
        .build()
        .unwrap();

    let client = client(options).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut properties = serde_json::Map::new();
    properties.insert("email".to_string(), json!("test@company.com"));

    let mut opts = FlagLookupOptions::new();
    opts.person_properties = Some(serde_json::Value::Object(properties));
    opts.send_feature_flag_events = false;

    let result = client.get_feature_flag("feature-b", "user-123", opts).await;

    assert!(result.is_ok());
    assert_eq!(result.unwrap(), Some(flagcore::FlagValue::Boolean(true)));

    eval_mock.assert();
}

#[tokio::test]
async fn returns_none_when_only_local_and_flag_is_unknown() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/api/feature_flag/local_evaluation/");
        then.status(200).json_body(json!({"flags": [], "group_type_mapping": {}, "cohorts": {}}));
    });

    let options = ClientOptionsBuilder::default()
        .host(server.base_url())
        .api_key("test_project_key".to_string())
        .personal_api_key("test_personal_key".to_string())
        .enable_local_evaluation(true)
        .poll_interval_seconds(60u64)
        .build()
        .unwrap();

    let client = client(options).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut opts = FlagLookupOptions::new();
    opts.only_evaluate_locally = true;
    opts.send_feature_flag_events = false;

    let result = client.get_feature_flag("missing-flag", "user-123", opts).await.unwrap();
    assert_eq!(result, None);
}
