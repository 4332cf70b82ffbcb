#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};

use policy_qa::config::{parse_config, Config};
use policy_qa::pipeline::RagPipeline;
use policy_qa_core::embedding::HashingEmbedder;
use policy_qa_core::error::LanguageModelError;
use policy_qa_core::index::VectorIndex;
use policy_qa_core::llm::{ChatMessage, Completion, LanguageModel};

/// Serve `app` on an ephemeral local port; returns the base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A minimal PDF with one text line per page.
pub fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

/// Offline pipeline configuration: hashing embedder, no scrape target.
pub fn offline_config() -> Config {
    parse_config(
        r#"
        [chunking]
        chunk_size = 200
        chunk_overlap = 20

        [retrieval]
        top_k = 3
        similarity_threshold = 0.3

        [embedding]
        provider = "hashing"

        [sources]
        scrape_enabled = false
        "#,
    )
    .unwrap()
}

pub fn offline_pipeline(llm: Arc<dyn LanguageModel>) -> RagPipeline {
    RagPipeline::new(
        &offline_config(),
        Arc::new(HashingEmbedder::default()),
        llm,
        Arc::new(VectorIndex::new()),
    )
    .unwrap()
}

/// Language-model double that replays a script and counts calls.
/// Once the script is exhausted the last entry repeats.
pub struct ScriptedLlm {
    script: Mutex<Vec<Result<String, LanguageModelError>>>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<ChatMessage>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<Result<String, LanguageModelError>>) -> Arc<Self> {
        assert!(!script.is_empty());
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        })
    }

    pub fn answering(text: &str) -> Arc<Self> {
        Self::new(vec![Ok(text.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<ChatMessage> {
        self.last_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, LanguageModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap() = messages.to_vec();
        let script = self.script.lock().unwrap();
        let entry = &script[n.min(script.len() - 1)];
        match entry {
            Ok(text) => Ok(Completion {
                text: text.clone(),
                model: "scripted".to_string(),
            }),
            Err(e) => Err(e.clone()),
        }
    }
}
