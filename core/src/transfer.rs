use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::artifact::{available_space, Artifact, ResumeMeta};
use crate::checksum::{verify_checksum, ChecksumRequest};
use crate::config::TransferConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{NetClient, NetRequest, NetResponse};
use crate::progress::{ProgressMeter, TransferProgress};
use crate::request::RequestId;
use crate::throttle::Throttle;

const STOP_NONE: u8 = 0;
const STOP_PAUSED: u8 = 1;
const STOP_CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Streaming,
    Finalizing,
    Cancelling,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Cancelled,
}

/// Cooperative stop signal shared between the manager and one worker.
#[derive(Debug, Default)]
pub struct TransferControl {
    stop: AtomicU8,
    gate: Mutex<()>,
    wake: Condvar,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause never downgrades a pending cancel.
    pub fn request_pause(&self) {
        let _ = self
            .stop
            .compare_exchange(STOP_NONE, STOP_PAUSED, Ordering::SeqCst, Ordering::SeqCst);
        self.notify();
    }

    pub fn request_cancel(&self) {
        self.stop.store(STOP_CANCELLED, Ordering::SeqCst);
        self.notify();
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.stop.load(Ordering::SeqCst) {
            STOP_PAUSED => Some(StopReason::Paused),
            STOP_CANCELLED => Some(StopReason::Cancelled),
            _ => None,
        }
    }

    /// Sleeps for `duration` unless a stop arrives first.
    pub fn sleep(&self, duration: Duration) -> Option<StopReason> {
        let deadline = Instant::now() + duration;
        let Ok(mut guard) = self.gate.lock() else {
            thread::sleep(duration);
            return self.stop_reason();
        };
        loop {
            if let Some(reason) = self.stop_reason() {
                return Some(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.wake.wait_timeout(guard, deadline - now) {
                Ok((next, _)) => guard = next,
                Err(_) => return self.stop_reason(),
            }
        }
    }

    fn notify(&self) {
        let _guard = self.gate.lock();
        self.wake.notify_all();
    }
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: RequestId,
    pub url: String,
    pub dest_path: PathBuf,
    pub expected_size: Option<u64>,
    pub checksum: Option<ChecksumRequest>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    Paused { bytes_done: u64 },
    Cancelled,
    Failed(CoreError),
}

enum AttemptEnd {
    Completed(u64),
    Stopped(StopReason),
}

/// Runs one resumable transfer into `dest.part`, promoting it onto the
/// destination only after size and checksum verification.
pub struct TransferWorker {
    net: Arc<dyn NetClient>,
    config: TransferConfig,
    throttle: Throttle,
    state: WorkerState,
    meter: ProgressMeter,
    free_space: fn(&Path) -> Option<u64>,
}

impl TransferWorker {
    pub fn new(net: Arc<dyn NetClient>, config: TransferConfig, throttle: Throttle) -> Self {
        let meter = ProgressMeter::new(
            Duration::from_millis(config.speed_window_ms),
            Duration::from_millis(config.progress_interval_ms),
            config.progress_interval_bytes,
        );
        Self {
            net,
            config,
            throttle,
            state: WorkerState::Idle,
            meter,
            free_space: available_space,
        }
    }

    /// Replaces the free-space lookup used before a transfer starts.
    pub fn with_free_space(mut self, free_space: fn(&Path) -> Option<u64>) -> Self {
        self.free_space = free_space;
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn run(
        &mut self,
        job: &TransferJob,
        control: &TransferControl,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> TransferOutcome {
        self.state = WorkerState::Idle;
        let artifact = Artifact::for_dest(&job.dest_path);
        let mut restarted = false;
        loop {
            match self.attempt(job, &artifact, control, on_progress) {
                Ok(AttemptEnd::Completed(bytes)) => {
                    self.state = WorkerState::Done;
                    return TransferOutcome::Completed { bytes };
                }
                Ok(AttemptEnd::Stopped(StopReason::Paused)) => {
                    self.state = WorkerState::Idle;
                    return TransferOutcome::Paused {
                        bytes_done: self.meter.bytes_done(),
                    };
                }
                Ok(AttemptEnd::Stopped(StopReason::Cancelled)) => {
                    self.state = WorkerState::Cancelling;
                    debug!("transfer {} cancelled", job.id);
                    self.state = WorkerState::Failed;
                    return TransferOutcome::Cancelled;
                }
                Err(CoreError::ServerRejectedResume(detail)) if !restarted => {
                    info!("transfer {} restarting from zero: {}", job.id, detail);
                    restarted = true;
                    if let Err(err) = artifact.discard() {
                        self.state = WorkerState::Failed;
                        return TransferOutcome::Failed(err);
                    }
                }
                Err(err) => {
                    // Bytes that failed verification are worthless for a resume.
                    if matches!(err, CoreError::Validation(_)) {
                        if let Err(discard_err) = artifact.discard() {
                            warn!("transfer {} cleanup failed: {}", job.id, discard_err);
                        }
                    }
                    self.state = WorkerState::Failed;
                    return TransferOutcome::Failed(err);
                }
            }
        }
    }

    fn attempt(
        &mut self,
        job: &TransferJob,
        artifact: &Artifact,
        control: &TransferControl,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> CoreResult<AttemptEnd> {
        self.state = WorkerState::Connecting;
        if let Some(reason) = control.stop_reason() {
            return Ok(AttemptEnd::Stopped(reason));
        }
        if let Some(parent) = job.dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| CoreError::Disk(format!("{}: {}", parent.display(), err)))?;
            }
        }

        let saved = self.resumable_state(job, artifact)?;
        if let Some((offset, meta)) = &saved {
            if meta.total_bytes == Some(*offset) {
                debug!("transfer {} already has every byte on disk", job.id);
                self.meter.start_at(*offset, meta.total_bytes);
                return self.finalize(job, artifact, meta.total_bytes, on_progress);
            }
        }

        let known_size = self.preflight(job, saved.as_ref())?;
        let request = match &saved {
            Some((offset, meta)) => NetRequest::new(&job.url).resume_from(*offset, meta.validator()),
            None => NetRequest::new(&job.url),
        };
        debug!(
            "transfer {} requesting {} from byte {}",
            job.id,
            job.url,
            request.range_start.unwrap_or(0)
        );
        let response = self.net.get(&request)?;
        let start = resume_offset(&response, saved.as_ref())?;
        let learned = if saved.is_none() { known_size } else { None };
        let total = response
            .meta
            .resource_size()
            .or(job.expected_size)
            .or(learned);
        if start == 0 && saved.is_some() {
            info!("transfer {}: server sent the whole resource, restarting", job.id);
        }

        artifact.save_meta(&ResumeMeta {
            url: job.url.clone(),
            etag: response.meta.etag.clone(),
            last_modified: response.meta.last_modified.clone(),
            total_bytes: total,
        })?;
        let mut file = open_part(artifact, start)?;

        self.meter.start_at(start, total);
        on_progress(self.meter.emit(Instant::now()));
        self.state = WorkerState::Streaming;
        if let Some(reason) = self.stream(response, &mut file, control, on_progress)? {
            return Ok(AttemptEnd::Stopped(reason));
        }
        file.sync_all()
            .map_err(|err| CoreError::Disk(format!("{}: {}", artifact.part.display(), err)))?;
        drop(file);
        self.finalize(job, artifact, total, on_progress)
    }

    /// Learns the resource size before any body byte moves and refuses to
    /// start when the destination volume cannot hold the rest of it.
    fn preflight(
        &self,
        job: &TransferJob,
        saved: Option<&(u64, ResumeMeta)>,
    ) -> CoreResult<Option<u64>> {
        let offset = saved.map(|(offset, _)| *offset).unwrap_or(0);
        let recorded = saved.and_then(|(_, meta)| meta.total_bytes);
        let size = match job.expected_size.or(recorded) {
            Some(size) => Some(size),
            None => match self.net.head(&NetRequest::new(&job.url)) {
                Ok(meta) if meta.is_success() => meta.resource_size(),
                Ok(meta) => {
                    debug!("transfer {}: HEAD answered {}", job.id, meta.status_code);
                    None
                }
                Err(err) => {
                    debug!("transfer {}: HEAD failed: {}", job.id, err);
                    None
                }
            },
        };
        let Some(size) = size else {
            return Ok(None);
        };
        let needed = size.saturating_sub(offset);
        let dir = job
            .dest_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if let Some(free) = (self.free_space)(dir) {
            if needed > free {
                return Err(CoreError::Disk(format!(
                    "{} needs {} more bytes but only {} are free",
                    dir.display(),
                    needed,
                    free
                )));
            }
        }
        Ok(Some(size))
    }

    /// Partial bytes worth resuming, or `None` after discarding anything
    /// that cannot belong to this resource.
    fn resumable_state(
        &self,
        job: &TransferJob,
        artifact: &Artifact,
    ) -> CoreResult<Option<(u64, ResumeMeta)>> {
        let partial = artifact.partial_len().unwrap_or(0);
        if partial == 0 {
            if artifact.exists() {
                artifact.discard()?;
            }
            return Ok(None);
        }
        let consistent = match artifact.load_meta() {
            Some(meta) if meta.url == job.url => {
                let total_ok = match (meta.total_bytes, job.expected_size) {
                    (Some(total), Some(expected)) => total == expected,
                    _ => true,
                };
                let len_ok = meta.total_bytes.map(|total| partial <= total).unwrap_or(true);
                if total_ok && len_ok {
                    Some(meta)
                } else {
                    None
                }
            }
            _ => None,
        };
        match consistent {
            Some(meta) => Ok(Some((partial, meta))),
            None => {
                info!(
                    "transfer {}: discarding inconsistent partial file {}",
                    job.id,
                    artifact.part.display()
                );
                artifact.discard()?;
                Ok(None)
            }
        }
    }

    fn stream(
        &mut self,
        mut response: NetResponse,
        file: &mut File,
        control: &TransferControl,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> CoreResult<Option<StopReason>> {
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            if let Some(reason) = control.stop_reason() {
                let _ = file.flush();
                return Ok(Some(reason));
            }
            let read = match response.body.read(&mut buffer) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = file.flush();
                    return Err(CoreError::Network(err.to_string()));
                }
            };
            if read == 0 {
                return Ok(None);
            }
            file.write_all(&buffer[..read])
                .map_err(|err| CoreError::Disk(err.to_string()))?;
            if let Some(progress) = self.meter.advance(read as u64, Instant::now()) {
                on_progress(progress);
            }
            let wait = self.throttle.reserve(read as u64);
            if !wait.is_zero() {
                if let Some(reason) = control.sleep(wait) {
                    let _ = file.flush();
                    return Ok(Some(reason));
                }
            }
        }
    }

    fn finalize(
        &mut self,
        job: &TransferJob,
        artifact: &Artifact,
        total: Option<u64>,
        on_progress: &mut dyn FnMut(TransferProgress),
    ) -> CoreResult<AttemptEnd> {
        self.state = WorkerState::Finalizing;
        let size = artifact
            .partial_len()
            .ok_or_else(|| CoreError::Disk(format!("{} vanished", artifact.part.display())))?;
        if let Some(total) = total {
            if size != total {
                return Err(CoreError::Validation(format!(
                    "size mismatch: expected {} bytes, got {}",
                    total, size
                )));
            }
        }
        if let Some(expected) = job.expected_size {
            if size != expected {
                return Err(CoreError::Validation(format!(
                    "size mismatch: expected {} bytes, got {}",
                    expected, size
                )));
            }
        }
        if let Some(checksum) = &job.checksum {
            verify_checksum(&artifact.part, checksum)?;
        }
        artifact.promote()?;
        on_progress(self.meter.emit(Instant::now()));
        Ok(AttemptEnd::Completed(size))
    }
}

/// Offset the response body starts at, given what we asked for.
fn resume_offset(response: &NetResponse, saved: Option<&(u64, ResumeMeta)>) -> CoreResult<u64> {
    let meta = &response.meta;
    let Some((offset, saved)) = saved else {
        if !meta.is_success() {
            return Err(CoreError::HttpStatus(meta.status_code));
        }
        if meta.status_code == 206 && meta.content_range.map(|r| r.start).unwrap_or(0) != 0 {
            return Err(CoreError::ServerRejectedResume(
                "partial content for a full request".into(),
            ));
        }
        return Ok(0);
    };
    match meta.status_code {
        206 => {
            let Some(range) = meta.content_range else {
                return Err(CoreError::ServerRejectedResume("missing Content-Range".into()));
            };
            if range.start != *offset {
                return Err(CoreError::ServerRejectedResume(format!(
                    "asked for byte {}, got {}",
                    offset, range.start
                )));
            }
            if let (Some(before), Some(now)) = (saved.total_bytes, range.total) {
                if before != now {
                    return Err(CoreError::ServerRejectedResume(format!(
                        "resource size changed from {} to {}",
                        before, now
                    )));
                }
            }
            if let (Some(before), Some(now)) = (&saved.etag, &meta.etag) {
                if before != now {
                    return Err(CoreError::ServerRejectedResume("etag changed".into()));
                }
            }
            if let (Some(before), Some(now)) = (&saved.last_modified, &meta.last_modified) {
                if before != now {
                    return Err(CoreError::ServerRejectedResume("last-modified changed".into()));
                }
            }
            Ok(*offset)
        }
        416 => Err(CoreError::ServerRejectedResume("range not satisfiable".into())),
        200 => Ok(0),
        code => Err(CoreError::HttpStatus(code)),
    }
}

fn open_part(artifact: &Artifact, start: u64) -> CoreResult<File> {
    let disk = |err: std::io::Error| CoreError::Disk(format!("{}: {}", artifact.part.display(), err));
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&artifact.part)
        .map_err(disk)?;
    file.set_len(start).map_err(disk)?;
    file.seek(SeekFrom::Start(start)).map_err(disk)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;
    use crate::testing::{FakeNet, FakeResource};
    use uuid::Uuid;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn job(dir: &std::path::Path, url: &str) -> TransferJob {
        TransferJob {
            id: Uuid::from_u128(1),
            url: url.to_string(),
            dest_path: dir.join("roms").join("game.zip"),
            expected_size: None,
            checksum: None,
        }
    }

    fn worker(net: &Arc<FakeNet>) -> TransferWorker {
        let config = TransferConfig {
            chunk_size: 1_000,
            ..TransferConfig::default()
        };
        TransferWorker::new(net.clone(), config, Throttle::unlimited())
    }

    #[test]
    fn fresh_transfer_promotes_verified_file() {
        let dir = tempfile::tempdir().unwrap();
        let body = payload(10_000);
        let net = Arc::new(FakeNet::new());
        net.insert("https://cdn.test/game.zip", FakeResource::new(body.clone()));

        let mut job = job(dir.path(), "https://cdn.test/game.zip");
        job.checksum = Some(ChecksumRequest::new(
            ChecksumType::Sha256,
            crate::checksum::sha256_bytes(&body),
        ));
        let mut worker = worker(&net);
        let mut seen = Vec::new();
        let outcome = worker.run(&job, &TransferControl::new(), &mut |p| seen.push(p.bytes_done));

        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 10_000 }));
        assert_eq!(worker.state(), WorkerState::Done);
        assert_eq!(fs::read(&job.dest_path).unwrap(), body);
        assert!(!Artifact::for_dest(&job.dest_path).exists());
        assert_eq!(seen.last(), Some(&10_000));
    }

    #[test]
    fn resumes_from_partial_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let body = payload(8_000);
        let net = Arc::new(FakeNet::new());
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(body.clone()).etag("\"v1\"").fail_after(3_000),
        );
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let mut worker = worker(&net);

        let first = worker.run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(first, TransferOutcome::Failed(CoreError::Network(_))));
        let artifact = Artifact::for_dest(&job.dest_path);
        assert_eq!(artifact.partial_len(), Some(3_000));

        let second = worker.run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(second, TransferOutcome::Completed { bytes: 8_000 }));
        assert_eq!(fs::read(&job.dest_path).unwrap(), body);

        let requests = net.requests();
        let last = requests.last().unwrap();
        assert_eq!(last.range_start, Some(3_000));
        assert_eq!(last.if_range.as_deref(), Some("\"v1\""));
    }

    #[test]
    fn server_ignoring_range_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let body = payload(5_000);
        let net = Arc::new(FakeNet::new());
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(body.clone()).without_ranges(),
        );
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let artifact = Artifact::for_dest(&job.dest_path);
        fs::create_dir_all(job.dest_path.parent().unwrap()).unwrap();
        fs::write(&artifact.part, &body[..1_234]).unwrap();
        artifact
            .save_meta(&ResumeMeta {
                url: job.url.clone(),
                total_bytes: Some(5_000),
                ..ResumeMeta::default()
            })
            .unwrap();

        let mut worker = worker(&net);
        let mut first_seen = None;
        let outcome = worker.run(&job, &TransferControl::new(), &mut |p| {
            first_seen.get_or_insert(p.bytes_done);
        });
        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 5_000 }));
        assert_eq!(first_seen, Some(0));
        assert_eq!(fs::read(&job.dest_path).unwrap(), body);
    }

    #[test]
    fn changed_etag_discards_partial_and_restarts_once() {
        let dir = tempfile::tempdir().unwrap();
        let body = payload(4_000);
        let net = Arc::new(FakeNet::new());
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(body.clone()).etag("\"v2\"").ignore_if_range(),
        );
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let artifact = Artifact::for_dest(&job.dest_path);
        fs::create_dir_all(job.dest_path.parent().unwrap()).unwrap();
        fs::write(&artifact.part, vec![0xAA; 1_000]).unwrap();
        artifact
            .save_meta(&ResumeMeta {
                url: job.url.clone(),
                etag: Some("\"v1\"".into()),
                ..ResumeMeta::default()
            })
            .unwrap();

        let outcome = worker(&net).run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(outcome, TransferOutcome::Completed { bytes: 4_000 }));
        assert_eq!(fs::read(&job.dest_path).unwrap(), body);
        assert_eq!(net.requests().len(), 2);
    }

    #[test]
    fn changed_last_modified_restarts_instead_of_splicing() {
        let dir = tempfile::tempdir().unwrap();
        let old = payload(6_000);
        let new: Vec<u8> = payload(6_000).into_iter().map(|b| b ^ 0x5A).collect();
        let net = Arc::new(FakeNet::new());
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(old)
                .last_modified("Mon, 01 Jan 2024 00:00:00 GMT")
                .fail_after(2_000),
        );
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let mut worker = worker(&net);

        let first = worker.run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(first, TransferOutcome::Failed(CoreError::Network(_))));
        assert_eq!(Artifact::for_dest(&job.dest_path).partial_len(), Some(2_000));

        // Same length, new date, and a server that serves the range anyway.
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(new.clone())
                .last_modified("Tue, 02 Jan 2024 00:00:00 GMT")
                .ignore_if_range(),
        );
        let second = worker.run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(second, TransferOutcome::Completed { bytes: 6_000 }));
        assert_eq!(fs::read(&job.dest_path).unwrap(), new);

        let requests = net.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].range_start, Some(2_000));
        assert_eq!(
            requests[1].if_range.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
        assert_eq!(requests[2].range_start, None);
    }

    #[test]
    fn refuses_to_start_without_room_for_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNet::new());
        net.insert("https://cdn.test/game.zip", FakeResource::new(payload(10_000)));
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let mut worker = worker(&net).with_free_space(|_| Some(4_096));

        let outcome = worker.run(&job, &TransferControl::new(), &mut |_| {});
        assert!(matches!(outcome, TransferOutcome::Failed(CoreError::Disk(_))));
        assert!(net.requests().is_empty());
        assert!(!job.dest_path.exists());
        assert!(!Artifact::for_dest(&job.dest_path).exists());
    }

    #[test]
    fn short_body_fails_validation_and_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNet::new());
        net.insert(
            "https://cdn.test/game.zip",
            FakeResource::new(payload(1_000)).announce_len(2_000),
        );
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let outcome = worker(&net).run(&job, &TransferControl::new(), &mut |_| {});

        assert!(matches!(outcome, TransferOutcome::Failed(CoreError::Validation(_))));
        assert!(!job.dest_path.exists());
        assert!(!Artifact::for_dest(&job.dest_path).exists());
    }

    #[test]
    fn cancel_before_connect_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let net = Arc::new(FakeNet::new());
        net.insert("https://cdn.test/game.zip", FakeResource::new(payload(10)));
        let job = job(dir.path(), "https://cdn.test/game.zip");
        let control = TransferControl::new();
        control.request_pause();
        control.request_cancel();
        assert_eq!(control.stop_reason(), Some(StopReason::Cancelled));

        let mut worker = worker(&net);
        let outcome = worker.run(&job, &control, &mut |_| {});
        assert!(matches!(outcome, TransferOutcome::Cancelled));
        assert_eq!(worker.state(), WorkerState::Failed);
        assert!(net.requests().is_empty());
    }

    #[test]
    fn control_sleep_wakes_on_stop() {
        let control = Arc::new(TransferControl::new());
        let remote = Arc::clone(&control);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.request_pause();
        });
        let started = Instant::now();
        assert_eq!(control.sleep(Duration::from_secs(30)), Some(StopReason::Paused));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
        assert_eq!(control.sleep(Duration::ZERO), Some(StopReason::Paused));
        assert_eq!(TransferControl::new().sleep(Duration::from_millis(1)), None);
    }
}
