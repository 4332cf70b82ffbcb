//! SQLite persistence of the vector index.
//!
//! `ask ingest` builds an [`IndexSnapshot`] in memory and stores it here so
//! later `query` / `chat` invocations start without re-embedding the
//! corpus. The stored snapshot is replaced wholesale inside one
//! transaction, mirroring the in-memory copy-then-swap: a reader opening
//! the database sees either the previous corpus or the new one.
//!
//! Vectors are stored as little-endian `f32` BLOBs in `chunk_vectors`.
//! On load every chunk's text hash is re-checked, and the stored model name
//! and dimensionality must match the configured embedder; vectors from
//! another model are not comparable and the index must be rebuilt.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use policy_qa_core::chunk::content_hash;
use policy_qa_core::embedding::{blob_to_vec, vec_to_blob};
use policy_qa_core::error::IndexError;
use policy_qa_core::index::IndexSnapshot;
use policy_qa_core::models::{Chunk, EmbeddingVector, Provenance, SourceKind};

/// Summary of the stored index, for `ask stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredIndexInfo {
    pub model: String,
    pub dims: usize,
    pub generation: u64,
    pub built_at: Option<String>,
    pub chunks: i64,
    /// `(source_uri, chunk count)`, largest first.
    pub sources: Vec<(String, i64)>,
}

/// Replace the stored index with `snapshot`.
pub async fn save_snapshot(
    pool: &SqlitePool,
    model_name: &str,
    snapshot: &IndexSnapshot,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors")
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM index_meta")
        .execute(&mut *tx)
        .await?;

    for entry in snapshot.entries() {
        let chunk = &entry.chunk;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, sequence_index, text, start_offset, end_offset,
                                byte_start, byte_end, hash, source_uri, source_kind, page, title)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.sequence_index as i64)
        .bind(&chunk.text)
        .bind(chunk.start_offset as i64)
        .bind(chunk.end_offset as i64)
        .bind(chunk.byte_start as i64)
        .bind(chunk.byte_end as i64)
        .bind(&chunk.hash)
        .bind(&chunk.source.source_uri)
        .bind(chunk.source.source_kind.as_str())
        .bind(chunk.source.page.map(i64::from))
        .bind(&chunk.source.title)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunk_vectors (chunk_id, dims, embedding) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(entry.vector.len() as i64)
            .bind(vec_to_blob(&entry.vector))
            .execute(&mut *tx)
            .await?;
    }

    let meta = [
        ("model", model_name.to_string()),
        (
            "dims",
            snapshot.dims().map(|d| d.to_string()).unwrap_or_default(),
        ),
        ("generation", snapshot.generation().to_string()),
        ("built_at", chrono::Utc::now().to_rfc3339()),
    ];
    for (key, value) in meta {
        sqlx::query("INSERT INTO index_meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Load the stored snapshot, or `None` when nothing has been ingested.
///
/// Fails with [`IndexError::Corrupt`] when the stored model differs from
/// `model_name`, the stored vectors are not `dims` wide, or any row fails
/// verification.
pub async fn load_snapshot(
    pool: &SqlitePool,
    model_name: &str,
    dims: usize,
) -> Result<Option<IndexSnapshot>> {
    let Some(stored_model) = meta_value(pool, "model").await? else {
        return Ok(None);
    };
    if stored_model != model_name {
        return Err(IndexError::Corrupt(format!(
            "index was built with embedding model '{}' but '{}' is configured; run `ask ingest` to rebuild",
            stored_model, model_name
        ))
        .into());
    }
    let stored_dims = meta_value(pool, "dims").await?.unwrap_or_default();
    if !stored_dims.is_empty() && stored_dims.parse::<usize>().ok() != Some(dims) {
        return Err(IndexError::Corrupt(format!(
            "index holds {}-dimensional vectors but the embedder produces {}; run `ask ingest` to rebuild",
            stored_dims, dims
        ))
        .into());
    }
    let generation = meta_value(pool, "generation")
        .await?
        .and_then(|g| g.parse::<u64>().ok())
        .unwrap_or(0);

    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.sequence_index, c.text, c.start_offset, c.end_offset,
               c.byte_start, c.byte_end, c.hash, c.source_uri, c.source_kind, c.page, c.title,
               cv.embedding
        FROM chunks c
        JOIN chunk_vectors cv ON cv.chunk_id = c.id
        ORDER BY c.rowid
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut items: Vec<(Chunk, EmbeddingVector)> = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.try_get("id")?;
        let text: String = row.try_get("text")?;
        let hash: String = row.try_get("hash")?;
        if content_hash(&text) != hash {
            return Err(IndexError::Corrupt(format!("text hash mismatch for chunk {}", id)).into());
        }

        let kind: String = row.try_get("source_kind")?;
        let source_kind = SourceKind::parse(&kind)
            .ok_or_else(|| IndexError::Corrupt(format!("unknown source kind '{}' for {}", kind, id)))?;
        let blob: Vec<u8> = row.try_get("embedding")?;
        let vector = blob_to_vec(&blob)
            .filter(|v| v.len() == dims)
            .ok_or_else(|| IndexError::Corrupt(format!("malformed vector for chunk {}", id)))?;
        let page: Option<i64> = row.try_get("page")?;

        let chunk = Chunk {
            document_id: row.try_get("document_id")?,
            text,
            start_offset: row.try_get::<i64, _>("start_offset")? as usize,
            end_offset: row.try_get::<i64, _>("end_offset")? as usize,
            byte_start: row.try_get::<i64, _>("byte_start")? as usize,
            byte_end: row.try_get::<i64, _>("byte_end")? as usize,
            sequence_index: row.try_get::<i64, _>("sequence_index")? as usize,
            hash,
            source: Provenance {
                source_uri: row.try_get("source_uri")?,
                source_kind,
                page: page.map(|p| p as u32),
                title: row.try_get("title")?,
            },
            id,
        };
        items.push((chunk, vector));
    }

    Ok(Some(IndexSnapshot::build(generation, items)?))
}

/// Metadata and per-source counts of the stored index.
pub async fn read_info(pool: &SqlitePool) -> Result<Option<StoredIndexInfo>> {
    let Some(model) = meta_value(pool, "model").await? else {
        return Ok(None);
    };
    let dims = meta_value(pool, "dims")
        .await?
        .and_then(|d| d.parse().ok())
        .unwrap_or(0);
    let generation = meta_value(pool, "generation")
        .await?
        .and_then(|g| g.parse().ok())
        .unwrap_or(0);
    let built_at = meta_value(pool, "built_at").await?;

    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;

    let source_rows = sqlx::query(
        r#"
        SELECT source_uri, COUNT(*) AS chunk_count
        FROM chunks
        GROUP BY source_uri
        ORDER BY chunk_count DESC, source_uri ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    let mut sources = Vec::with_capacity(source_rows.len());
    for row in source_rows {
        sources.push((row.try_get("source_uri")?, row.try_get("chunk_count")?));
    }

    Ok(Some(StoredIndexInfo {
        model,
        dims,
        generation,
        built_at,
        chunks,
        sources,
    }))
}

async fn meta_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    Ok(
        sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use policy_qa_core::chunk::{chunk_document, ChunkParams, ChunkUnit};
    use policy_qa_core::models::Document;

    fn sample_snapshot() -> IndexSnapshot {
        let params = ChunkParams::new(4, 2, ChunkUnit::Words).unwrap();
        let doc = Document::new("handbook.pdf", SourceKind::Pdf, Some(3), "A B C D E F G H");
        let items = chunk_document(&doc, &params)
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, vec![1.0, i as f32, 0.5]));
        IndexSnapshot::build(4, items).unwrap()
    }

    async fn pool_in(dir: &tempfile::TempDir) -> SqlitePool {
        let pool = db::connect(&dir.path().join("index.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        let snapshot = sample_snapshot();
        save_snapshot(&pool, "hashing-v1", &snapshot).await.unwrap();

        let loaded = load_snapshot(&pool, "hashing-v1", 3).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.generation(), 4);
        assert_eq!(loaded.dims(), Some(3));
        let first = &loaded.entries()[0].chunk;
        assert_eq!(first.source.source_uri, "handbook.pdf");
        assert_eq!(first.source.source_kind, SourceKind::Pdf);
        assert_eq!(first.source.page, Some(3));
        assert_eq!(first.text, "A B C D");
        for (a, b) in snapshot.entries().iter().zip(loaded.entries()) {
            assert_eq!(a.chunk, b.chunk);
            for (x, y) in a.vector.iter().zip(&b.vector) {
                assert!((x - y).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_database_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        assert!(load_snapshot(&pool, "hashing-v1", 3).await.unwrap().is_none());
        assert!(read_info(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        let err = load_snapshot(&pool, "all-minilm-l6-v2", 3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_text_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        sqlx::query("UPDATE chunks SET text = 'tampered' WHERE sequence_index = 1")
            .execute(&pool)
            .await
            .unwrap();
        let err = load_snapshot(&pool, "hashing-v1", 3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corrupt(_))
        ));
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[tokio::test]
    async fn test_dims_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        let err = load_snapshot(&pool, "hashing-v1", 128).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corrupt(_))
        ));
        assert!(err.to_string().contains("3-dimensional"));
    }

    #[tokio::test]
    async fn test_malformed_vector_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        sqlx::query("UPDATE chunk_vectors SET embedding = X'0102030405' WHERE rowid = 1")
            .execute(&pool)
            .await
            .unwrap();
        let err = load_snapshot(&pool, "hashing-v1", 3).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IndexError>(),
            Some(IndexError::Corrupt(_))
        ));
        assert!(err.to_string().contains("malformed vector"));
    }

    #[tokio::test]
    async fn test_short_vector_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        sqlx::query("UPDATE chunk_vectors SET embedding = ? WHERE rowid = 2")
            .bind(vec_to_blob(&[1.0, 0.0]))
            .execute(&pool)
            .await
            .unwrap();
        let err = load_snapshot(&pool, "hashing-v1", 3).await.unwrap_err();
        assert!(err.to_string().contains("malformed vector"));
    }

    #[tokio::test]
    async fn test_save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        save_snapshot(&pool, "hashing-v1", &IndexSnapshot::default())
            .await
            .unwrap();
        let info = read_info(&pool).await.unwrap().unwrap();
        assert_eq!(info.chunks, 0);
        assert!(info.sources.is_empty());
    }

    #[tokio::test]
    async fn test_read_info_counts_sources() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_in(&dir).await;
        save_snapshot(&pool, "hashing-v1", &sample_snapshot())
            .await
            .unwrap();
        let info = read_info(&pool).await.unwrap().unwrap();
        assert_eq!(info.model, "hashing-v1");
        assert_eq!(info.dims, 3);
        assert_eq!(info.chunks, 3);
        assert_eq!(info.sources, vec![("handbook.pdf".to_string(), 3)]);
    }
}
