//! Embedding collaborator: trait, OpenAI-compatible client, vector helpers.

pub mod openai;
pub mod similarity;
pub mod storage;

use async_trait::async_trait;

use crate::error::Result;

pub use openai::OpenAIEmbedder;
pub use similarity::cosine_similarity;
pub use storage::{blob_to_embedding, embedding_to_blob};

/// Turns text into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, one vector per input in the same order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension of every returned vector.
    fn dimensions(&self) -> usize;
}
