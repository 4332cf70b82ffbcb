//! `ask ingest`: rebuild the index from the configured sources and store it.

use anyhow::{bail, Result};

use policy_qa_core::index::{IndexSnapshot, VectorIndex};
use policy_qa_core::models::SourceDescriptor;

use crate::ask::{build_pipeline, open_pool};
use crate::config::Config;
use crate::pipeline::IngestStage;
use crate::progress::ProgressMode;
use crate::store;

/// Source overrides from the command line.
#[derive(Debug, Default, Clone)]
pub struct IngestOptions {
    pub extra_pdfs: Vec<String>,
    pub extra_urls: Vec<String>,
    pub no_scrape: bool,
}

/// Configured sources plus command-line additions, in ingestion order.
pub fn resolve_sources(config: &Config, options: &IngestOptions) -> Vec<SourceDescriptor> {
    let mut sources = config.sources.clone();
    if options.no_scrape {
        sources.scrape_enabled = false;
    }
    sources
        .pdf_paths
        .extend(options.extra_pdfs.iter().map(Into::into));
    sources.extra_urls.extend(options.extra_urls.iter().cloned());
    sources.descriptors()
}

pub async fn run_ingest(config: &Config, options: &IngestOptions, progress: ProgressMode) -> Result<()> {
    let sources = resolve_sources(config, options);
    if sources.is_empty() {
        bail!("No sources configured. Set sources.pdf_paths / sources.scrape_url or pass --pdf / --url.");
    }

    // Start empty at the stored generation; stored vectors are replaced
    // wholesale and may belong to another model.
    let pool = open_pool(config).await?;
    let generation = store::read_info(&pool)
        .await?
        .map(|info| info.generation)
        .unwrap_or(0);
    let index = VectorIndex::from_snapshot(IndexSnapshot::build(generation, Vec::new())?);
    let pipeline = build_pipeline(config, index)?;
    let reporter = progress.reporter();
    let report = pipeline.refresh(&sources, reporter.as_ref()).await?;

    println!("ingest");
    println!(
        "  sources loaded: {} / {}",
        report.sources_loaded, report.sources_requested
    );
    println!("  documents: {}", report.documents);
    println!("  chunks: {}", report.chunks);
    println!("  embedded: {}", report.embedded);
    if !report.failures.is_empty() {
        println!("  skipped: {}", report.failures.len());
        for failure in &report.failures {
            let stage = match failure.stage {
                IngestStage::Load => "load",
                IngestStage::Embed => "embed",
            };
            println!("    {:<5} {}", stage, failure.error);
        }
    }

    let Some(generation) = report.generation else {
        pool.close().await;
        bail!("Nothing was embedded; the existing index was left unchanged.");
    };

    let snapshot = pipeline.index().snapshot();
    store::save_snapshot(&pool, pipeline.embedder().model_name(), &snapshot).await?;
    println!("  generation: {}", generation);
    println!("  stored: {}", config.index.path.display());
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use policy_qa_core::models::SourceKind;

    #[test]
    fn test_resolve_sources_order_and_overrides() {
        let config = parse_config(
            r#"
            [sources]
            pdf_paths = ["manual.pdf"]
            scrape_url = "https://example.edu/policies/"
            extra_urls = ["https://example.edu/fees"]
            "#,
        )
        .unwrap();

        let all = resolve_sources(
            &config,
            &IngestOptions {
                extra_pdfs: vec!["addendum.pdf".into()],
                ..Default::default()
            },
        );
        let locations: Vec<&str> = all.iter().map(|s| s.location.as_str()).collect();
        assert_eq!(
            locations,
            vec![
                "manual.pdf",
                "addendum.pdf",
                "https://example.edu/policies/",
                "https://example.edu/fees"
            ]
        );
        assert_eq!(all[1].kind, SourceKind::Pdf);

        let no_scrape = resolve_sources(
            &config,
            &IngestOptions {
                no_scrape: true,
                ..Default::default()
            },
        );
        assert_eq!(no_scrape.len(), 2);
        assert!(no_scrape
            .iter()
            .all(|s| s.location != "https://example.edu/policies/"));
    }
}
