use std::path::PathBuf;
use thiserror::Error;

mod backend;
pub use backend::*;
mod clock;
pub use clock::*;
mod engine;
pub use engine::*;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("source not found: {0}")]
    SourceMissing(PathBuf),
    #[error("unsupported source extension: {0}")]
    UnsupportedExtension(PathBuf),
    #[error("no source opened")]
    NotOpened,
}
