use thiserror::Error;

pub mod checkpoint;

pub use checkpoint::{CheckpointSummary, SqlCheckpointStore};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}
