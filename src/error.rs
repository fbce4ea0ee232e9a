use crate::item::ItemId;
use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMetadataError {
    #[error("metadata document is not a JSON object")]
    NotAnObject,
    #[error("metadata document is missing `{0}`")]
    MissingField(&'static str),
    #[error("metadata field `{field}` has the wrong type")]
    WrongType { field: &'static str },
    #[error("metadata describes item {found}, expected {expected}")]
    IdMismatch { expected: ItemId, found: u64 },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for item {id} failed: {message}")]
    Transport { id: ItemId, message: String },
    #[error("catalog returned an unusable answer for item {id}: {reason}")]
    InvalidResponse { id: ItemId, reason: String },
}

impl FetchError {
    pub fn id(&self) -> ItemId {
        match self {
            FetchError::Transport { id, .. } | FetchError::InvalidResponse { id, .. } => *id,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("scan root {path:?} is missing or not a directory")]
pub struct InvalidRootError {
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialize metadata cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("background worker stopped before reporting a result")]
pub struct WorkerLost;
