//! `ask stats`: what the stored index contains.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::migrate::run_migrations;
use crate::store;

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(&config.index.path).await?;
    run_migrations(&pool).await?;
    let info = store::read_info(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.index.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Policy QA Index Stats");
    println!("=====================");
    println!();
    println!("  Index:       {}", config.index.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    let Some(info) = info else {
        println!("  Nothing ingested yet. Run `ask ingest`.");
        println!();
        return Ok(());
    };

    println!("  Model:       {} ({} dims)", info.model, info.dims);
    println!("  Generation:  {}", info.generation);
    println!(
        "  Built:       {}",
        info.built_at
            .as_deref()
            .map(format_built_at)
            .unwrap_or_else(|| "unknown".to_string())
    );
    println!("  Chunks:      {}", info.chunks);

    if !info.sources.is_empty() {
        println!();
        println!("  By source:");
        println!("  {:<56} {:>8}", "SOURCE", "CHUNKS");
        println!("  {}", "-".repeat(65));
        for (source, chunks) in &info.sources {
            println!("  {:<56} {:>8}", source, chunks);
        }
    }
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_built_at(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| rfc3339.to_string())
}
