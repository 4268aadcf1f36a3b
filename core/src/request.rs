use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::checksum::ChecksumRequest;
use crate::error::FailureReason;

pub type RequestId = Uuid;

/// Stable id for a (url, destination) pair. Enqueuing the same pair twice
/// always lands on the same id.
pub fn request_id(url: &str, dest_path: &Path) -> RequestId {
    let mut name = Vec::with_capacity(url.len() + 1 + dest_path.as_os_str().len());
    name.extend_from_slice(url.as_bytes());
    name.push(b'\n');
    name.extend_from_slice(dest_path.to_string_lossy().as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, &name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RequestState {
    Queued,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Queued => "queued",
            RequestState::Active => "active",
            RequestState::Paused => "paused",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RequestState::Queued),
            "active" => Some(RequestState::Active),
            "paused" => Some(RequestState::Paused),
            "completed" => Some(RequestState::Completed),
            "failed" => Some(RequestState::Failed),
            "cancelled" => Some(RequestState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller asks for; the manager turns it into a [`DownloadRequest`].
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub dest_path: PathBuf,
    pub priority: i32,
    pub expected_size: Option<u64>,
    pub checksum: Option<ChecksumRequest>,
}

impl RequestSpec {
    pub fn new(url: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_path: dest_path.into(),
            priority: 0,
            expected_size: None,
            checksum: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn checksum(mut self, checksum: ChecksumRequest) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub id: RequestId,
    pub url: String,
    pub dest_path: PathBuf,
    pub state: RequestState,
    pub priority: i32,
    /// Admission order; breaks priority ties FIFO.
    pub seq: u64,
    pub expected_size: Option<u64>,
    pub total_bytes: Option<u64>,
    pub bytes_done: u64,
    pub attempts: u32,
    pub checksum: Option<ChecksumRequest>,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DownloadRequest {
    pub fn new(spec: RequestSpec, seq: u64) -> Self {
        let now = now_epoch();
        Self {
            id: request_id(&spec.url, &spec.dest_path),
            url: spec.url,
            dest_path: spec.dest_path,
            state: RequestState::Queued,
            priority: spec.priority,
            seq,
            expected_size: spec.expected_size,
            total_bytes: spec.expected_size,
            bytes_done: 0,
            attempts: 0,
            checksum: spec.checksum,
            reason: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_epoch();
    }

    pub fn transition(&mut self, state: RequestState) {
        self.state = state;
        self.touch();
    }

    pub fn fail(&mut self, reason: FailureReason, error: Option<String>) {
        self.reason = Some(reason);
        self.error = error;
        self.transition(RequestState::Failed);
    }
}

pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_depends_on_url_and_destination() {
        let a = request_id("https://example.com/a.zip", Path::new("/roms/gba/a.zip"));
        let b = request_id("https://example.com/a.zip", Path::new("/roms/gba/a.zip"));
        let c = request_id("https://example.com/a.zip", Path::new("/roms/gbc/a.zip"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn new_request_starts_queued() {
        let spec = RequestSpec::new("https://example.com/a.zip", "/roms/a.zip")
            .priority(3)
            .expected_size(42);
        let request = DownloadRequest::new(spec, 7);
        assert_eq!(request.state, RequestState::Queued);
        assert_eq!(request.priority, 3);
        assert_eq!(request.seq, 7);
        assert_eq!(request.total_bytes, Some(42));
        assert!(!request.state.is_terminal());
    }
}
