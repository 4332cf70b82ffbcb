mod common;

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use common::{offline_pipeline, serve, ScriptedLlm};
use policy_qa::answer::{AnswerError, RetryPolicy};
use policy_qa::pipeline::{IngestStage, QueryError, QueryRequest};
use policy_qa::progress::NoProgress;
use policy_qa_core::chunk::{chunk_document, ChunkParams, ChunkUnit};
use policy_qa_core::embedding::{EmbeddingModel, HashingEmbedder};
use policy_qa_core::error::{IndexError, LanguageModelError, RetrieveError};
use policy_qa_core::llm::ChatRole;
use policy_qa_core::models::{AnswerStatus, ConversationTurn, Document, SourceDescriptor, SourceKind};

const FEES_PAGE: &str = r#"<html><head><title>Fees</title></head><body>
<nav><a href="/">Home</a><a href="/fees">Fees</a></nav>
<main><p>Late submissions incur a 5% fee per day.</p></main>
<footer>Contact the registrar</footer></body></html>"#;

const GRADING_PAGE: &str = r#"<html><body><article>
<h1>Grading</h1><p>Letter grade A requires 85 marks or above.</p>
</article></body></html>"#;

async fn policy_site() -> String {
    let app = Router::new()
        .route("/fees", get(|| async { axum::response::Html(FEES_PAGE) }))
        .route("/grading", get(|| async { axum::response::Html(GRADING_PAGE) }))
        .route("/gone", get(|| async { StatusCode::NOT_FOUND }));
    serve(app).await
}

#[tokio::test]
async fn test_late_fee_question_is_grounded_and_cited() {
    let base = policy_site().await;
    let llm = ScriptedLlm::answering("Late submissions incur a 5% fee per day [1].");
    let pipeline = offline_pipeline(llm.clone());

    let fees_url = format!("{}/fees", base);
    let report = pipeline
        .refresh(
            &[
                SourceDescriptor::web(fees_url.clone()),
                SourceDescriptor::web(format!("{}/grading", base)),
            ],
            &NoProgress,
        )
        .await
        .unwrap();
    assert!(report.committed());
    assert_eq!(report.sources_loaded, 2);
    assert!(report.failures.is_empty());

    let passages = pipeline
        .retrieve("What is the late fee?", 3, 0.3)
        .await
        .unwrap();
    assert!(!passages.is_empty());
    assert_eq!(passages[0].source_uri, fees_url);
    assert!(passages.iter().all(|p| p.similarity_score >= 0.3));

    let result = pipeline
        .query(&QueryRequest {
            top_k: Some(3),
            similarity_threshold: Some(0.3),
            ..QueryRequest::new("What is the late fee?")
        })
        .await
        .unwrap();
    assert!(result.grounded);
    assert_eq!(result.status, AnswerStatus::Answered);
    assert!(result.citations.contains(&fees_url));
    assert_eq!(llm.calls(), 1);

    // Boilerplate never reaches the prompt.
    let system = &llm.last_messages()[0];
    assert_eq!(system.role, ChatRole::System);
    assert!(system.content.contains("5% fee per day"));
    assert!(!system.content.contains("Contact the registrar"));
}

#[tokio::test]
async fn test_unreachable_threshold_refuses_without_model_call() {
    let base = policy_site().await;
    let llm = ScriptedLlm::answering("should never be produced [1]");
    let pipeline = offline_pipeline(llm.clone());
    pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/fees", base))], &NoProgress)
        .await
        .unwrap();

    let passages = pipeline
        .retrieve("What is the late fee?", 3, 1.1)
        .await
        .unwrap();
    assert!(passages.is_empty());

    let result = pipeline
        .query(&QueryRequest {
            similarity_threshold: Some(1.1),
            ..QueryRequest::new("What is the late fee?")
        })
        .await
        .unwrap();
    assert!(!result.grounded);
    assert_eq!(result.status, AnswerStatus::Refused);
    assert!(result.citations.is_empty());
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_exhausted_retries_become_unavailable() {
    let base = policy_site().await;
    let llm = ScriptedLlm::new(vec![Err(LanguageModelError::Timeout)]);
    let pipeline = offline_pipeline(llm.clone()).with_retry_policy(RetryPolicy::immediate(2));
    pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/fees", base))], &NoProgress)
        .await
        .unwrap();

    let request = QueryRequest::new("What is the late fee?");
    let result = pipeline.query(&request).await.unwrap();
    assert_eq!(result.status, AnswerStatus::Unavailable);
    assert!(!result.grounded);
    assert_eq!(llm.calls(), 3);

    // The lower-level call keeps the failure distinct and retryable.
    let passages = pipeline
        .retrieve("What is the late fee?", 3, 0.3)
        .await
        .unwrap();
    let err = pipeline
        .answer("What is the late fee?", &passages, &[])
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_rejected_request_is_an_error() {
    let base = policy_site().await;
    let llm = ScriptedLlm::new(vec![Err(LanguageModelError::NotConfigured(
        "no API key".into(),
    ))]);
    let pipeline = offline_pipeline(llm.clone());
    pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/fees", base))], &NoProgress)
        .await
        .unwrap();

    let err = pipeline
        .query(&QueryRequest::new("What is the late fee?"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Answer(AnswerError::Rejected(_))));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_history_is_bounded_in_prompt() {
    let base = policy_site().await;
    let llm = ScriptedLlm::answering("5% per day [1]");
    let pipeline = offline_pipeline(llm.clone());
    pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/fees", base))], &NoProgress)
        .await
        .unwrap();

    let history: Vec<ConversationTurn> = (0..30)
        .map(|i| {
            if i % 2 == 0 {
                ConversationTurn::user(format!("question {}", i))
            } else {
                ConversationTurn::assistant(format!("answer {}", i))
            }
        })
        .collect();
    pipeline
        .query(&QueryRequest::new("What is the late fee?").with_history(history))
        .await
        .unwrap();

    let messages = llm.last_messages();
    // system + max_history (10) + current question
    assert_eq!(messages.len(), 12);
    assert_eq!(messages[1].content, "question 20");
    assert_eq!(messages[11].content, "What is the late fee?");
}

#[tokio::test]
async fn test_invalid_queries_rejected() {
    let pipeline = offline_pipeline(ScriptedLlm::answering("unused"));
    let err = pipeline
        .query(&QueryRequest::new("  ?  "))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Retrieve(RetrieveError::InvalidQuery(_))
    ));

    let err = pipeline
        .retrieve("late fee", 3, f32::NAN)
        .await
        .unwrap_err();
    assert!(matches!(err, RetrieveError::InvalidThreshold(_)));
}

#[tokio::test]
async fn test_partial_source_failure_is_reported() {
    let base = policy_site().await;
    let pipeline = offline_pipeline(ScriptedLlm::answering("unused"));
    let report = pipeline
        .refresh(
            &[
                SourceDescriptor::web(format!("{}/gone", base)),
                SourceDescriptor::pdf("/no/such/manual.pdf"),
                SourceDescriptor::web(format!("{}/fees", base)),
            ],
            &NoProgress,
        )
        .await
        .unwrap();

    assert!(report.committed());
    assert_eq!(report.sources_requested, 3);
    assert_eq!(report.sources_loaded, 1);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| f.stage == IngestStage::Load));
    assert!(report.failures[0].location.ends_with("/gone"));
    assert_eq!(pipeline.index().len(), report.embedded);
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_index() {
    let base = policy_site().await;
    let pipeline = offline_pipeline(ScriptedLlm::answering("unused"));
    let first = pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/fees", base))], &NoProgress)
        .await
        .unwrap();
    let before = pipeline.index().snapshot();

    let second = pipeline
        .refresh(&[SourceDescriptor::web(format!("{}/gone", base))], &NoProgress)
        .await
        .unwrap();
    assert!(!second.committed());
    assert_eq!(second.embedded, 0);

    let after = pipeline.index().snapshot();
    assert_eq!(after.generation(), first.generation.unwrap());
    assert!(Arc::ptr_eq(&before, &after));
}

#[tokio::test]
async fn test_concurrent_refresh_rejected() {
    let pipeline = offline_pipeline(ScriptedLlm::answering("unused"));
    let guard = pipeline.index().begin_rebuild().unwrap();
    let err = pipeline
        .refresh(&[SourceDescriptor::pdf("/no/such.pdf")], &NoProgress)
        .await
        .unwrap_err();
    assert_eq!(err, IndexError::RebuildInProgress);
    drop(guard);

    let report = pipeline
        .refresh(&[SourceDescriptor::pdf("/no/such.pdf")], &NoProgress)
        .await
        .unwrap();
    assert!(!report.committed());
}

#[tokio::test]
async fn test_duplicate_sources_are_ingested_once() {
    let base = policy_site().await;
    let pipeline = offline_pipeline(ScriptedLlm::answering("unused"));
    let url = format!("{}/fees", base);
    let report = pipeline
        .refresh(
            &[SourceDescriptor::web(url.clone()), SourceDescriptor::web(url)],
            &NoProgress,
        )
        .await
        .unwrap();
    assert!(report.committed());
    assert_eq!(report.documents, 1);
}

async fn corpus(prefix: &str, docs: usize) -> Vec<(policy_qa_core::models::Chunk, Vec<f32>)> {
    let embedder = HashingEmbedder::default();
    let params = ChunkParams::new(12, 3, ChunkUnit::Words).unwrap();
    let mut items = Vec::new();
    for d in 0..docs {
        let text = format!(
            "{} policy {} covers the late fee for assignments, the appeal deadline, \
             attendance rules, and the fee waiver process for semester {}",
            prefix, d, d
        );
        let doc = Document::new(format!("{}-{}.pdf", prefix, d), SourceKind::Pdf, Some(1), text);
        for chunk in chunk_document(&doc, &params) {
            let vector = embedder.embed(&chunk.text).await.unwrap();
            items.push((chunk, vector));
        }
    }
    items
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebuild_during_concurrent_retrieves() {
    let pipeline = Arc::new(offline_pipeline(ScriptedLlm::answering("unused")));
    let old_items = corpus("old", 20).await;
    let new_items = corpus("new", 20).await;

    let old_ids: HashSet<String> = old_items.iter().map(|(c, _)| c.id.clone()).collect();
    let new_ids: HashSet<String> = new_items.iter().map(|(c, _)| c.id.clone()).collect();
    assert!(old_ids.is_disjoint(&new_ids));

    pipeline.index().rebuild(old_items).unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            let mut results = Vec::new();
            for _ in 0..20 {
                let passages = pipeline
                    .retrieve("late fee appeal deadline", 50, 0.0)
                    .await
                    .unwrap();
                results.push(passages);
                tokio::task::yield_now().await;
            }
            results
        }));
    }

    let rebuilder = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.index().rebuild(new_items).unwrap() })
    };

    let generation = rebuilder.await.unwrap();
    assert_eq!(generation, 2);

    for handle in handles {
        for passages in handle.await.unwrap() {
            assert!(!passages.is_empty());
            let all_old = passages.iter().all(|p| old_ids.contains(&p.chunk_id));
            let all_new = passages.iter().all(|p| new_ids.contains(&p.chunk_id));
            assert!(all_old || all_new, "result mixed two index generations");
        }
    }

    let passages = pipeline
        .retrieve("late fee appeal deadline", 50, 0.0)
        .await
        .unwrap();
    assert!(passages.iter().all(|p| new_ids.contains(&p.chunk_id)));
}

#[tokio::test]
async fn test_streaming_query_delivers_answer_and_refuses_silently() {
    let base = policy_site().await;
    let llm = ScriptedLlm::answering("Late submissions incur a 5% fee per day [1].");
    let pipeline = offline_pipeline(llm.clone());
    let fees_url = format!("{}/fees", base);
    pipeline
        .refresh(&[SourceDescriptor::web(fees_url.clone())], &NoProgress)
        .await
        .unwrap();

    let mut streamed = String::new();
    let result = pipeline
        .query_streaming(&QueryRequest::new("What is the late fee?"), &mut |d: &str| {
            streamed.push_str(d)
        })
        .await
        .unwrap();
    assert_eq!(result.status, AnswerStatus::Answered);
    assert!(result.grounded);
    assert!(result.citations.contains(&fees_url));
    assert_eq!(streamed, result.text);
    assert_eq!(llm.calls(), 1);

    let mut streamed = String::new();
    let refused = pipeline
        .query_streaming(
            &QueryRequest {
                similarity_threshold: Some(1.1),
                ..QueryRequest::new("What is the late fee?")
            },
            &mut |d: &str| streamed.push_str(d),
        )
        .await
        .unwrap();
    assert_eq!(refused.status, AnswerStatus::Refused);
    assert!(streamed.is_empty());
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn test_markup_in_query_is_rejected_before_retrieval() {
    let llm = ScriptedLlm::answering("unused [1]");
    let pipeline = offline_pipeline(llm.clone());
    let err = pipeline
        .query(&QueryRequest::new("late fee <script>alert(1)</script>"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Retrieve(RetrieveError::InvalidQuery(_))
    ));
    assert_eq!(llm.calls(), 0);
}
