//! Live market-data streaming

mod ingestor;

pub use ingestor::{IngestState, StreamIngestor};

use thiserror::Error;

/// Connection-level stream failures. Per-frame problems never surface
/// here; they are logged and dropped inside the ingestor.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("parse error: {0}")]
    Parse(String),
}
