use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid request state: {0}")]
    InvalidState(String),
    #[error("request not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("server answered with status {0}")]
    HttpStatus(u16),
    #[error("server rejected resume: {0}")]
    ServerRejectedResume(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("disk error: {0}")]
    Disk(String),
    #[error("corrupt asset: {0}")]
    CacheCorruption(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("config error: {0}")]
    Config(String),
}

impl CoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Network(_) => true,
            CoreError::HttpStatus(code) => *code == 408 || *code == 429 || *code >= 500,
            _ => false,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            CoreError::Network(_) | CoreError::HttpStatus(_) => FailureReason::NetworkError,
            CoreError::ServerRejectedResume(_) => FailureReason::ServerRejectedResume,
            CoreError::Validation(_) | CoreError::CacheCorruption(_) => {
                FailureReason::ValidationError
            }
            CoreError::Disk(_) => FailureReason::DiskError,
            _ => FailureReason::Internal,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Reason code attached to a terminal request state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    NetworkError,
    ServerRejectedResume,
    ValidationError,
    DiskError,
    CancelledByUser,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NetworkError => "network_error",
            FailureReason::ServerRejectedResume => "server_rejected_resume",
            FailureReason::ValidationError => "validation_error",
            FailureReason::DiskError => "disk_error",
            FailureReason::CancelledByUser => "cancelled_by_user",
            FailureReason::Internal => "internal",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "network_error" => Some(FailureReason::NetworkError),
            "server_rejected_resume" => Some(FailureReason::ServerRejectedResume),
            "validation_error" => Some(FailureReason::ValidationError),
            "disk_error" => Some(FailureReason::DiskError),
            "cancelled_by_user" => Some(FailureReason::CancelledByUser),
            "internal" => Some(FailureReason::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an asset lookup that could not produce a committed file.
///
/// Cloneable so that every caller coalesced onto one fetch observes the
/// same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("asset unavailable: {0}")]
    AssetUnavailable(String),
    #[error("cache disk error: {0}")]
    Disk(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
