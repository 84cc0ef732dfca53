//! Vector store backends behind one upsert contract.

use async_trait::async_trait;

use crate::model::Point;
use crate::sink::SinkError;

pub mod pinecone;
pub mod qdrant;

pub use pinecone::PineconeStore;
pub use qdrant::QdrantStore;

/// Upsert is idempotent by point id: writing the same id twice overwrites.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, points: &[Point]) -> Result<(), SinkError>;
}
