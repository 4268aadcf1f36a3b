use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::request::{DownloadRequest, RequestId};

#[cfg(feature = "sqlite")]
use crate::checksum::{ChecksumRequest, ChecksumType};
#[cfg(feature = "sqlite")]
use crate::error::FailureReason;
#[cfg(feature = "sqlite")]
use crate::request::RequestState;
#[cfg(feature = "sqlite")]
use rusqlite::params;
#[cfg(feature = "sqlite")]
use std::path::{Path, PathBuf};

/// Durable copy of the request table so a restart can pick up where it left.
pub trait Storage: Send + Sync {
    fn save_request(&mut self, request: &DownloadRequest) -> CoreResult<()>;
    fn list_requests(&self) -> CoreResult<Vec<DownloadRequest>>;
    fn delete_request(&mut self, id: &RequestId) -> CoreResult<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    requests: HashMap<RequestId, DownloadRequest>,
}

impl Storage for MemoryStorage {
    fn save_request(&mut self, request: &DownloadRequest) -> CoreResult<()> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    fn list_requests(&self) -> CoreResult<Vec<DownloadRequest>> {
        let mut requests: Vec<DownloadRequest> = self.requests.values().cloned().collect();
        requests.sort_by_key(|request| request.seq);
        Ok(requests)
    }

    fn delete_request(&mut self, id: &RequestId) -> CoreResult<()> {
        self.requests.remove(id);
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
pub struct SqliteStorage {
    pub path: PathBuf,
}

#[cfg(feature = "sqlite")]
impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> CoreResult<Self> {
        let storage = Self {
            path: path.as_ref().to_path_buf(),
        };
        storage.init()?;
        Ok(storage)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(|err| CoreError::Storage(err.to_string()))
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                state TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                seq INTEGER NOT NULL,
                expected_size INTEGER,
                total_bytes INTEGER,
                bytes_done INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                checksum_type TEXT,
                checksum_hex TEXT,
                reason TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS requests_dispatch ON requests(state, priority DESC, seq ASC);
            ",
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
const SELECT_REQUEST: &str = "
    SELECT id, url, dest_path, state, priority, seq, expected_size, total_bytes,
           bytes_done, attempts, checksum_type, checksum_hex, reason, error,
           created_at, updated_at
    FROM requests";

#[cfg(feature = "sqlite")]
fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRequest> {
    let id: String = row.get(0)?;
    let state: String = row.get(3)?;
    let checksum_type: Option<String> = row.get(10)?;
    let checksum_hex: Option<String> = row.get(11)?;
    let checksum = match (checksum_type, checksum_hex) {
        (Some(kind), Some(hex)) => {
            ChecksumType::from_str(&kind).map(|kind| ChecksumRequest::new(kind, hex))
        }
        _ => None,
    };
    let reason: Option<String> = row.get(12)?;
    Ok(DownloadRequest {
        id: RequestId::parse_str(&id).map_err(|_| rusqlite::Error::InvalidQuery)?,
        url: row.get(1)?,
        dest_path: PathBuf::from(row.get::<_, String>(2)?),
        state: RequestState::from_str(&state).ok_or(rusqlite::Error::InvalidQuery)?,
        priority: row.get(4)?,
        seq: row.get::<_, i64>(5)? as u64,
        expected_size: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
        total_bytes: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        bytes_done: row.get::<_, i64>(8)? as u64,
        attempts: row.get::<_, i64>(9)? as u32,
        checksum,
        reason: reason.as_deref().and_then(FailureReason::from_str),
        error: row.get(13)?,
        created_at: row.get::<_, i64>(14)? as u64,
        updated_at: row.get::<_, i64>(15)? as u64,
    })
}

#[cfg(feature = "sqlite")]
impl Storage for SqliteStorage {
    fn save_request(&mut self, request: &DownloadRequest) -> CoreResult<()> {
        let conn = self.conn()?;
        let (checksum_type, checksum_hex) = match &request.checksum {
            Some(req) => (Some(req.checksum_type.as_str()), Some(req.expected_hex.as_str())),
            None => (None, None),
        };
        let dest_path = request.dest_path.to_string_lossy().into_owned();
        conn.execute(
            "
            INSERT INTO requests (
                id, url, dest_path, state, priority, seq, expected_size, total_bytes,
                bytes_done, attempts, checksum_type, checksum_hex, reason, error,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                state=excluded.state,
                priority=excluded.priority,
                seq=excluded.seq,
                expected_size=excluded.expected_size,
                total_bytes=excluded.total_bytes,
                bytes_done=excluded.bytes_done,
                attempts=excluded.attempts,
                checksum_type=excluded.checksum_type,
                checksum_hex=excluded.checksum_hex,
                reason=excluded.reason,
                error=excluded.error,
                updated_at=excluded.updated_at
            ",
            params![
                request.id.to_string(),
                request.url.as_str(),
                dest_path,
                request.state.as_str(),
                request.priority,
                request.seq as i64,
                request.expected_size.map(|v| v as i64),
                request.total_bytes.map(|v| v as i64),
                request.bytes_done as i64,
                request.attempts as i64,
                checksum_type,
                checksum_hex,
                request.reason.map(|reason| reason.as_str()),
                request.error.as_deref(),
                request.created_at as i64,
                request.updated_at as i64,
            ],
        )
        .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }

    fn list_requests(&self) -> CoreResult<Vec<DownloadRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} ORDER BY seq ASC", SELECT_REQUEST))
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        let rows = stmt
            .query_map([], request_from_row)
            .map_err(|err| CoreError::Storage(err.to_string()))?;

        let mut requests = Vec::new();
        for row in rows {
            requests.push(row.map_err(|err| CoreError::Storage(err.to_string()))?);
        }
        Ok(requests)
    }

    fn delete_request(&mut self, id: &RequestId) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM requests WHERE id = ?1", params![id.to_string()])
            .map_err(|err| CoreError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestSpec;

    #[test]
    fn memory_lists_in_admission_order() {
        let mut storage = MemoryStorage::default();
        let late = DownloadRequest::new(RequestSpec::new("https://a.test/2.zip", "/r/2.zip"), 2);
        let early = DownloadRequest::new(RequestSpec::new("https://a.test/1.zip", "/r/1.zip"), 1);
        storage.save_request(&late).unwrap();
        storage.save_request(&early).unwrap();

        let seqs: Vec<u64> = storage.list_requests().unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        storage.delete_request(&early.id).unwrap();
        let left: Vec<RequestId> = storage.list_requests().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(left, vec![late.id]);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_keeps_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let spec = RequestSpec::new("https://a.test/game.zip", "/roms/gba/game.zip")
            .priority(4)
            .expected_size(1_024)
            .checksum(ChecksumRequest::new(ChecksumType::Sha1, "abcd"));
        let mut request = DownloadRequest::new(spec, 11);
        request.bytes_done = 512;
        request.attempts = 2;
        request.fail(FailureReason::NetworkError, Some("reset".into()));

        {
            let mut storage = SqliteStorage::new(&path).unwrap();
            storage.save_request(&request).unwrap();
        }
        let mut storage = SqliteStorage::new(&path).unwrap();
        let mut listed = storage.list_requests().unwrap();
        assert_eq!(listed.len(), 1);
        let loaded = listed.remove(0);
        assert_eq!(loaded.id, request.id);
        assert_eq!(loaded.state, RequestState::Failed);
        assert_eq!(loaded.reason, Some(FailureReason::NetworkError));
        assert_eq!(loaded.dest_path, PathBuf::from("/roms/gba/game.zip"));
        assert_eq!(loaded.priority, 4);
        assert_eq!(loaded.seq, 11);
        assert_eq!(loaded.total_bytes, Some(1_024));
        assert_eq!(loaded.bytes_done, 512);
        assert_eq!(loaded.checksum, request.checksum);

        storage.delete_request(&request.id).unwrap();
        assert!(storage.list_requests().unwrap().is_empty());
    }
}
