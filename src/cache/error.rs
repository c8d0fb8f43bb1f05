use thiserror::Error;

/// Failures of the key-value layer.
///
/// All of them are transient from the reader's point of view: cached state
/// is derived, so callers fall back to the store instead of failing.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable during `{op}`")]
    Unavailable { op: &'static str },
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt cache value at `{key}`: {reason}")]
    Corrupt { key: String, reason: String },
}

impl CacheError {
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
