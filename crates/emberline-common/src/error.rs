use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Workspace-wide error type. Variants carry a human-readable description;
/// callers that need a user-facing message map these at the pipeline surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("search error: {0}")]
    Search(String),
}
