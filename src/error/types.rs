// src/error/types.rs
use crate::key::KeyError;
use crate::store::StoreError;
use thiserror::Error;

/// Failures surfaced by repositories, queries and units of work.
///
/// Concurrency conflicts are always reported as [`Error::Concurrency`] and
/// never folded into [`Error::Commit`]; everything the store reports outside
/// of a commit travels through [`Error::Store`] unchanged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("unknown fetch path `{path}` for set `{set}`")]
    UnknownFetchPath { set: &'static str, path: String },

    #[error("sequence contains no matching element")]
    NoElement,

    #[error("sequence contains more than one matching element")]
    MultipleElements,

    #[error("scope error: {0}")]
    Scope(&'static str),

    #[error("context disposed")]
    Disposed,

    #[error("commit failed due to a concurrency conflict")]
    Concurrency(#[source] StoreError),

    #[error("commit failed")]
    Commit(#[source] StoreError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Background(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures caused by how the caller used the API, as opposed
    /// to failures coming out of the persistence layer.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::Key(_)
                | Error::UnknownFetchPath { .. }
                | Error::Scope(_)
                | Error::Disposed
        )
    }
}
