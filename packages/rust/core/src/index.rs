//! Brute-force similarity search over stored chunk embeddings.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use librarian_shared::{Result, StoredChunk};
use librarian_storage::{ChunkScope, Storage};

use crate::providers::SimilarityIndex;

/// Ranks the stored chunks of a scope by cosine distance.
pub struct StoredChunkIndex {
    storage: Arc<Storage>,
}

impl StoredChunkIndex {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SimilarityIndex for StoredChunkIndex {
    async fn search(
        &self,
        query: &[f32],
        scope: &ChunkScope,
        limit: usize,
    ) -> Result<Vec<(StoredChunk, f32)>> {
        let chunks = self.storage.list_chunks(scope).await?;
        let candidates = chunks.len();

        let mut ranked: Vec<(StoredChunk, f32)> = chunks
            .into_iter()
            .filter_map(|chunk| {
                let distance = cosine_distance(query, &chunk.embedding)?;
                Some((chunk, distance))
            })
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(limit);

        debug!(candidates, returned = ranked.len(), "similarity search");
        Ok(ranked)
    }
}

/// `1 - cos(a, b)`; `None` for mismatched dimensions or zero vectors.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(1.0 - dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_file, test_storage};
    use librarian_shared::TextChunk;

    #[test]
    fn distance_basics() {
        assert_eq!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]), Some(0.0));
        assert_eq!(cosine_distance(&[1.0, 0.0], &[0.0, 1.0]), Some(1.0));
        assert_eq!(cosine_distance(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), None);
    }

    #[tokio::test]
    async fn nearest_chunks_first() {
        let storage = Arc::new(test_storage().await);
        let file = seed_file(&storage, Some("m")).await;
        let task = storage
            .insert_processing_task(&file.id, &file.library_id, &Default::default(), 60_000)
            .await
            .expect("task");

        let vectors = [vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let chunks: Vec<(TextChunk, Vec<f32>)> = ["about alpha", "about beta", "alpha and beta"]
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(index, (text, vector))| {
                let chunk = TextChunk {
                    index,
                    section: None,
                    text: text.to_string(),
                };
                (chunk, vector)
            })
            .collect();
        storage
            .replace_file_chunks(&file.id, &file.library_id, &task.id, &chunks)
            .await
            .expect("chunks");

        let index = StoredChunkIndex::new(Arc::clone(&storage));
        let hits = index
            .search(&[0.0, 1.0], &ChunkScope::File(file.id.clone()), 2)
            .await
            .expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.text, "about beta");
        assert_eq!(hits[1].0.text, "alpha and beta");
        assert!(hits[0].1 < hits[1].1);
    }
}
