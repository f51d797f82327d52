// File: tests/providers_anthropic_prefill.rs
use httpmock::prelude::*;
use serde_json::json;

use augur::providers::openai::RemoteArgs;
use augur::providers::Model;
use augur::schema::Target;
use augur::{AnthropicModel, Thread};

fn make_model(base_url: &str) -> AnthropicModel {
    AnthropicModel::new(
        "claude-test",
        RemoteArgs {
            api_key: Some("test-key".to_string()),
            base_url: Some(base_url.to_string()),
            ctx_len: Some(8192),
            max_tokens_limit: Some(4096),
            ..Default::default()
        },
    )
    .expect("model creation")
}

#[test]
fn test_free_json_prefill_round_trip() {
    let server = MockServer::start();

    let messages_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/messages")
            .header("x-api-key", "test-key")
            .header("anthropic-version", "2023-06-01")
            // the wire conversation was extended with a '{' prefill
            .body_contains("\"role\":\"assistant\",\"content\":\"{\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "stop_reason": "end_turn",
                    // the completion continues after the prefill
                    "content": [{"type": "text", "text": "\"answer\": 42}"}]
                })
                .to_string(),
            );
    });

    let model = make_model(&server.base_url());
    let value = model
        .json(&Thread::make_in("The answer?"), None, None, false)
        .expect("json generation");

    assert_eq!(value, json!({"answer": 42}));
    assert_eq!(messages_mock.hits(), 1);
}

#[test]
fn test_classification_via_forced_tool() {
    let server = MockServer::start();

    let messages_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/messages")
            .body_contains("\"input_schema\"")
            .body_contains("\"tool_choice\"")
            .body_contains("\"bus\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "stop_reason": "tool_use",
                    "content": [{
                        "type": "tool_use",
                        "name": "json_out",
                        "input": {"output": "bus"}
                    }]
                })
                .to_string(),
            );
    });

    let model = make_model(&server.base_url());
    let labels = Target::enum_str(&["dog", "horse", "car", "bus"]);
    let value = model
        .classify(
            &labels,
            &Thread::make_in("Many people travelling together in a city"),
            None,
            false,
        )
        .expect("classification");

    assert_eq!(value.as_str(), Some("bus"));
    assert_eq!(messages_mock.hits(), 1);
}

#[tokio::test]
async fn test_async_extract_bool() {
    let server = MockServer::start_async().await;

    let messages_mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/messages").body_contains("\"max_tokens\"");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    json!({
                        "stop_reason": "tool_use",
                        "content": [{
                            "type": "tool_use",
                            "name": "json_out",
                            "input": {"output": true}
                        }]
                    })
                    .to_string(),
                );
        })
        .await;

    let model = make_model(&server.base_url());
    let value = model
        .extract_async(
            &Target::Bool,
            &Thread::make_in("It's a great time to surf"),
            None,
            false,
        )
        .await
        .expect("extraction");

    assert_eq!(value.as_bool(), Some(true));
    assert_eq!(messages_mock.hits(), 1);
}

#[test]
fn test_system_instruction_sent_separately() {
    let server = MockServer::start();

    let messages_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/messages")
            .body_contains("\"system\":\"Answer like a pirate\"");
        then.status(200)
            .header("content-type", "application/json")
            .body(
                json!({
                    "stop_reason": "end_turn",
                    "content": [{"type": "text", "text": "Arr, aye!"}]
                })
                .to_string(),
            );
    });

    let model = make_model(&server.base_url());
    let thread = Thread::make_inst_in("Answer like a pirate", "Do you agree?");
    let text = model.call(&thread, None, false).expect("generation");

    assert_eq!(text, "Arr, aye!");
    assert_eq!(messages_mock.hits(), 1);
}

#[test]
fn test_rate_limit_is_transport_error() {
    let server = MockServer::start();

    server.mock(|when, then| {
        when.method(POST).path("/messages");
        then.status(429)
            .header("content-type", "application/json")
            .body(r#"{"error": {"type": "rate_limit_error"}}"#);
    });

    let model = make_model(&server.base_url());
    let err = model.gen(&Thread::make_in("hi"), None);
    assert!(matches!(
        err,
        Err(augur::AugurError::Transport(
            augur::TransportError::RateLimited { .. }
        ))
    ));
}
