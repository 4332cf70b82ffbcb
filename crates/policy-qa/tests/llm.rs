mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use common::serve;
use policy_qa::answer::{AnswerComposer, AnswerError, RetryPolicy};
use policy_qa::config::LlmConfig;
use policy_qa::llm::ChatCompletionsClient;
use policy_qa_core::error::LanguageModelError;
use policy_qa_core::llm::{ChatMessage, LanguageModel};
use policy_qa_core::models::{AnswerStatus, RetrievedPassage, SourceKind};
use policy_qa_core::prompt::PromptConfig;

#[derive(Clone)]
struct Mock {
    hits: Arc<AtomicUsize>,
    /// Status to return for the first `failures` requests.
    fail_with: StatusCode,
    failures: usize,
}

async fn chat(State(mock): State<Mock>, headers: HeaderMap, Json(body): Json<serde_json::Value>) -> Response {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst);
    if n < mock.failures {
        return (mock.fail_with, "mock failure").into_response();
    }
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth != "Bearer test-key" {
        return (StatusCode::UNAUTHORIZED, "bad key").into_response();
    }
    let question = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    let answer = format!("Answering '{}': the fee is 5% per day [1].", question);
    if body["stream"] == json!(true) {
        let mut events = String::from(": stream opened\n\n");
        for (i, piece) in answer.split_inclusive(' ').enumerate() {
            let chunk = json!({
                "model": body["model"],
                "choices": [{ "index": 0, "delta": { "content": piece } }]
            });
            // Fields other than data must be ignored.
            if i == 0 {
                events.push_str("event: message\n");
            }
            events.push_str(&format!("data: {}\n\n", chunk));
        }
        events.push_str("data: [DONE]\n\n");
        return ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response();
    }
    Json(json!({
        "model": body["model"],
        "choices": [{
            "message": {
                "role": "assistant",
                "content": answer
            }
        }]
    }))
    .into_response()
}

async fn mock_llm(fail_with: StatusCode, failures: usize) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/v1/chat/completions", post(chat))
        .with_state(Mock {
            hits: Arc::clone(&hits),
            fail_with,
            failures,
        });
    let base = serve(app).await;
    (format!("{}/v1", base), hits)
}

fn client(base_url: String, key: Option<&str>) -> ChatCompletionsClient {
    let config = LlmConfig {
        base_url,
        timeout_secs: 5,
        ..Default::default()
    };
    ChatCompletionsClient::new(&config, key.map(str::to_string)).unwrap()
}

fn passage() -> RetrievedPassage {
    RetrievedPassage {
        chunk_id: "fees-0000".into(),
        document_id: "fees".into(),
        text: "Late submissions incur a 5% fee per day".into(),
        source_uri: "reference/manual.pdf".into(),
        source_kind: SourceKind::Pdf,
        page: Some(12),
        sequence_index: 0,
        similarity_score: 0.61,
    }
}

#[tokio::test]
async fn test_completion_round_trip() {
    let (base, hits) = mock_llm(StatusCode::OK, 0).await;
    let completion = client(base, Some("test-key"))
        .complete(&[ChatMessage::system("rules"), ChatMessage::user("late fee?")])
        .await
        .unwrap();
    assert_eq!(completion.model, "llama-3.1-8b-instant");
    assert!(completion.text.contains("'late fee?'"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_status_classification() {
    let (base, _) = mock_llm(StatusCode::TOO_MANY_REQUESTS, usize::MAX).await;
    let err = client(base, Some("test-key"))
        .complete(&[ChatMessage::user("q")])
        .await
        .unwrap_err();
    assert!(matches!(err, LanguageModelError::RateLimited(_)));
    assert!(err.is_retryable());

    let (base, _) = mock_llm(StatusCode::BAD_GATEWAY, usize::MAX).await;
    let err = client(base, Some("test-key"))
        .complete(&[ChatMessage::user("q")])
        .await
        .unwrap_err();
    assert!(matches!(err, LanguageModelError::Server { status: 502, .. }));

    let (base, _) = mock_llm(StatusCode::OK, 0).await;
    let err = client(base, Some("wrong-key"))
        .complete(&[ChatMessage::user("q")])
        .await
        .unwrap_err();
    assert!(matches!(err, LanguageModelError::Client { status: 401, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    // Bind and drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = client(format!("http://127.0.0.1:{}/v1", port), Some("test-key"))
        .complete(&[ChatMessage::user("q")])
        .await
        .unwrap_err();
    assert!(matches!(err, LanguageModelError::Network(_)));
}

#[tokio::test]
async fn test_composer_retries_server_errors() {
    let (base, hits) = mock_llm(StatusCode::INTERNAL_SERVER_ERROR, 2).await;
    let composer = AnswerComposer::new(
        Arc::new(client(base, Some("test-key"))),
        PromptConfig::default(),
        RetryPolicy::immediate(3),
    );
    let result = composer
        .answer("What is the late fee?", &[passage()], &[])
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(result.status, AnswerStatus::Answered);
    assert!(result.grounded);
    assert!(result.citations.contains("reference/manual.pdf"));
}

#[tokio::test]
async fn test_composer_gives_up_after_budget() {
    let (base, hits) = mock_llm(StatusCode::SERVICE_UNAVAILABLE, usize::MAX).await;
    let composer = AnswerComposer::new(
        Arc::new(client(base, Some("test-key"))),
        PromptConfig::default(),
        RetryPolicy::immediate(2),
    );
    let err = composer
        .answer("What is the late fee?", &[passage()], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AnswerError::Exhausted { attempts: 3, .. }));
    assert!(!err.is_timeout());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_composer_does_not_retry_client_errors() {
    let (base, hits) = mock_llm(StatusCode::BAD_REQUEST, usize::MAX).await;
    let composer = AnswerComposer::new(
        Arc::new(client(base, Some("test-key"))),
        PromptConfig::default(),
        RetryPolicy::immediate(3),
    );
    let err = composer
        .answer("What is the late fee?", &[passage()], &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AnswerError::Rejected(LanguageModelError::Client { status: 400, .. })
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streamed_completion_arrives_in_pieces() {
    let (base, hits) = mock_llm(StatusCode::OK, 0).await;
    let mut deltas: Vec<String> = Vec::new();
    let completion = client(base, Some("test-key"))
        .complete_stream(&[ChatMessage::user("late fee?")], &mut |d: &str| {
            deltas.push(d.to_string())
        })
        .await
        .unwrap();
    assert!(deltas.len() > 1);
    assert_eq!(completion.text, deltas.concat());
    assert_eq!(completion.text, "Answering 'late fee?': the fee is 5% per day [1].");
    assert_eq!(completion.model, "llama-3.1-8b-instant");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_streamed_request_errors_are_classified() {
    let (base, _) = mock_llm(StatusCode::TOO_MANY_REQUESTS, usize::MAX).await;
    let mut deltas: Vec<String> = Vec::new();
    let err = client(base, Some("test-key"))
        .complete_stream(&[ChatMessage::user("q")], &mut |d: &str| {
            deltas.push(d.to_string())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LanguageModelError::RateLimited(_)));
    assert!(deltas.is_empty());
}

#[tokio::test]
async fn test_composer_streams_after_retrying_server_errors() {
    let (base, hits) = mock_llm(StatusCode::INTERNAL_SERVER_ERROR, 1).await;
    let composer = AnswerComposer::new(
        Arc::new(client(base, Some("test-key"))),
        PromptConfig::default(),
        RetryPolicy::immediate(3),
    );
    let mut deltas: Vec<String> = Vec::new();
    let result = composer
        .answer_streaming("What is the late fee?", &[passage()], &[], &mut |d: &str| {
            deltas.push(d.to_string())
        })
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(result.text, deltas.concat());
    assert!(result.grounded);
    assert!(result.citations.contains("reference/manual.pdf"));
}
