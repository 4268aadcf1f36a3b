use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use url::Url;

use crate::artifact::{sweep_stale, Artifact};
use crate::config::AcquisitionConfig;
use crate::error::{CoreError, CoreResult, FailureReason};
use crate::events::{DownloadEvent, EventBus};
use crate::net::{NetClient, ReqwestNetClient};
use crate::progress::TransferProgress;
use crate::queue::{QueueItem, RequestQueue};
use crate::request::{request_id, DownloadRequest, RequestId, RequestSpec, RequestState};
use crate::scheduler::{RetryPolicy, Scheduler};
use crate::storage::{MemoryStorage, Storage};
use crate::throttle::Throttle;
use crate::transfer::{StopReason, TransferControl, TransferJob, TransferOutcome, TransferWorker};

/// Owns every download request, hands queued ones to a bounded pool of
/// transfer threads and is the only writer of request state.
pub struct DownloadQueueManager {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: AcquisitionConfig,
    scheduler: Scheduler,
    retry: RetryPolicy,
    net: Arc<dyn NetClient>,
    throttle: Throttle,
    storage: Mutex<Box<dyn Storage>>,
    events: EventBus,
    table: Mutex<Table>,
    changed: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Table {
    requests: HashMap<RequestId, DownloadRequest>,
    queue: RequestQueue,
    running: HashMap<RequestId, Running>,
    next_seq: u64,
    restored: bool,
    started: bool,
    shutting_down: bool,
}

struct Running {
    control: Arc<TransferControl>,
    paused_by_user: bool,
}

enum Finish {
    Completed(u64),
    Stopped(StopReason),
    Failed(CoreError),
}

impl DownloadQueueManager {
    pub fn new(config: AcquisitionConfig) -> CoreResult<Self> {
        config.validate()?;
        let net = ReqwestNetClient::new(
            &config.user_agent,
            config.transfer.connect_timeout(),
            config.transfer.read_timeout(),
        )?;
        Self::with_parts(config, Arc::new(net), Box::new(MemoryStorage::default()))
    }

    pub fn with_parts(
        mut config: AcquisitionConfig,
        net: Arc<dyn NetClient>,
        storage: Box<dyn Storage>,
    ) -> CoreResult<Self> {
        config.validate()?;
        if config.download_root.is_relative() {
            let cwd = env::current_dir().map_err(|err| CoreError::Config(err.to_string()))?;
            config.download_root = cwd.join(&config.download_root);
        }
        let shared = Shared {
            scheduler: Scheduler::new(config.queue.max_workers),
            retry: RetryPolicy::from_config(&config.queue),
            throttle: Throttle::new(config.transfer.speed_limit_bytes_per_sec),
            config,
            net,
            storage: Mutex::new(storage),
            events: EventBus::default(),
            table: Mutex::new(Table::default()),
            changed: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        };
        Ok(Self {
            shared: Arc::new(shared),
            dispatcher: Mutex::new(None),
        })
    }

    /// Replaces the request store. Only takes effect before [`start`](Self::start).
    pub fn with_storage(mut self, storage: Box<dyn Storage>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.storage = Mutex::new(storage);
        }
        self
    }

    /// Replaces the HTTP client. Only takes effect before [`start`](Self::start).
    pub fn with_net_client(mut self, net: Arc<dyn NetClient>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.net = net;
        }
        self
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.shared.config
    }

    /// Loads persisted requests into the table without dispatching them.
    /// Requests that were active when the process stopped come back queued.
    pub fn restore(&self) -> CoreResult<usize> {
        let restored = {
            let storage = self.shared.storage()?;
            storage.list_requests()?
        };
        let mut table = self.shared.table()?;
        if table.restored {
            return Ok(0);
        }
        table.restored = true;
        let mut count = 0usize;
        for mut request in restored {
            if table.requests.contains_key(&request.id) {
                continue;
            }
            table.next_seq = table.next_seq.max(request.seq + 1);
            if request.state == RequestState::Active {
                request.transition(RequestState::Queued);
            }
            table.requests.insert(request.id, request);
            count += 1;
        }
        debug!("restored {} requests", count);
        Ok(count)
    }

    /// Restores persisted requests, clears temp artifacts nobody owns and
    /// starts dispatching.
    pub fn start(&self) -> CoreResult<()> {
        self.restore()?;
        let keep = {
            let mut table = self.shared.table()?;
            if table.started {
                return Ok(());
            }
            table.started = true;
            table.shutting_down = false;
            let queued: Vec<QueueItem> = table
                .requests
                .values()
                .filter(|request| request.state == RequestState::Queued)
                .map(QueueItem::for_request)
                .collect();
            table.queue = RequestQueue::default();
            for item in queued {
                table.queue.push(item);
            }
            table
                .requests
                .values()
                .filter(|request| {
                    !matches!(request.state, RequestState::Completed | RequestState::Cancelled)
                })
                .map(|request| request.dest_path.clone())
                .collect::<HashSet<PathBuf>>()
        };

        let removed = sweep_stale(&self.shared.config.download_root, &keep)?;
        if removed > 0 {
            info!("removed {} stale temp artifacts", removed);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || shared.dispatch_loop());
        *self
            .dispatcher
            .lock()
            .map_err(|_| CoreError::Storage("dispatcher lock poisoned".to_string()))? = Some(handle);
        self.shared.changed.notify_all();
        info!(
            "download queue started with {} workers",
            self.shared.scheduler.max_active
        );
        Ok(())
    }

    pub fn enqueue(&self, url: &str, dest_path: impl AsRef<Path>, priority: i32) -> CoreResult<RequestId> {
        self.enqueue_request(RequestSpec::new(url, dest_path.as_ref()).priority(priority))
    }

    pub fn enqueue_request(&self, mut spec: RequestSpec) -> CoreResult<RequestId> {
        spec.url = validate_url(&spec.url)?;
        spec.dest_path = self.resolve_dest(&spec.dest_path)?;
        ensure_writable(&spec.dest_path)?;
        let id = request_id(&spec.url, &spec.dest_path);

        let mut table = self.shared.table()?;
        if let Some(existing) = table.requests.get(&id) {
            if !existing.state.is_terminal() {
                debug!("request {} already {}", id, existing.state);
                return Ok(id);
            }
        }
        let claimed = table.requests.values().any(|other| {
            other.id != id && other.dest_path == spec.dest_path && !other.state.is_terminal()
        });
        if claimed {
            return Err(CoreError::InvalidRequest(format!(
                "{} is already the destination of another request",
                spec.dest_path.display()
            )));
        }

        let seq = table.next_seq;
        table.next_seq += 1;
        let request = DownloadRequest::new(spec, seq);
        info!("queued {} -> {}", request.url, request.dest_path.display());
        table.queue.remove(&id);
        table.queue.push(QueueItem::for_request(&request));
        table.requests.insert(id, request);
        self.shared.events.publish(DownloadEvent::Queued { id });
        self.shared.changed.notify_all();
        self.shared.persist(table, &[id])?;
        Ok(id)
    }

    pub fn cancel(&self, id: &RequestId) -> CoreResult<()> {
        let mut table = self.shared.table()?;
        let Table {
            requests,
            queue,
            running,
            ..
        } = &mut *table;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if let Some(running) = running.get(id) {
            // The worker's exit path finishes the cancel.
            running.control.request_cancel();
            queue.remove(id);
            debug!("cancel of {} signalled to its worker", id);
            return Ok(());
        }
        match request.state {
            RequestState::Queued | RequestState::Paused => {
                queue.remove(id);
                // No worker owns the artifact, and none can start while the table is held.
                Artifact::for_dest(&request.dest_path).discard()?;
                request.reason = Some(FailureReason::CancelledByUser);
                request.error = None;
                request.transition(RequestState::Cancelled);
                info!("cancelled {}", id);
                self.shared.publish_state(request);
                self.shared.changed.notify_all();
                self.shared.persist(table, &[*id])
            }
            state => Err(CoreError::InvalidState(format!(
                "cannot cancel request in state {}",
                state
            ))),
        }
    }

    /// Forgets a finished request. Leftover temp artifacts go with it; a
    /// completed file stays where it is.
    pub fn remove(&self, id: &RequestId) -> CoreResult<()> {
        let mut table = self.shared.table()?;
        let request = table
            .requests
            .get(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        if !request.state.is_terminal() || table.running.contains_key(id) {
            return Err(CoreError::InvalidState(format!(
                "cannot remove request in state {}",
                request.state
            )));
        }
        Artifact::for_dest(&request.dest_path).discard()?;
        table.requests.remove(id);
        table.queue.remove(id);
        info!("removed {}", id);
        let mut storage = self.shared.storage()?;
        drop(table);
        storage.delete_request(id)
    }

    pub fn pause(&self, id: &RequestId) -> CoreResult<()> {
        let mut table = self.shared.table()?;
        let Table {
            requests,
            queue,
            running,
            ..
        } = &mut *table;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        match request.state {
            RequestState::Paused => return Ok(()),
            RequestState::Active | RequestState::Queued => {}
            state => {
                return Err(CoreError::InvalidState(format!(
                    "cannot pause request in state {}",
                    state
                )))
            }
        }
        queue.remove(id);
        if let Some(running) = running.get_mut(id) {
            running.paused_by_user = true;
            running.control.request_pause();
        }
        request.transition(RequestState::Paused);
        info!("paused {}", id);
        self.shared.publish_state(request);
        self.shared.changed.notify_all();
        self.shared.persist(table, &[*id])
    }

    /// Re-admits a paused or failed request at its original priority and
    /// FIFO position. Partial bytes on disk are resumed.
    pub fn resume(&self, id: &RequestId) -> CoreResult<()> {
        let mut table = self.shared.table()?;
        let Table {
            requests,
            queue,
            running,
            ..
        } = &mut *table;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        match request.state {
            RequestState::Queued | RequestState::Active => return Ok(()),
            RequestState::Paused => {}
            RequestState::Failed => request.attempts = 0,
            state => {
                return Err(CoreError::InvalidState(format!(
                    "cannot resume request in state {}",
                    state
                )))
            }
        }
        if let Some(running) = running.get_mut(id) {
            running.paused_by_user = false;
        }
        request.reason = None;
        request.error = None;
        request.transition(RequestState::Queued);
        queue.remove(id);
        queue.push(QueueItem::for_request(request));
        info!("resumed {}", id);
        self.shared.publish_state(request);
        self.shared.changed.notify_all();
        self.shared.persist(table, &[*id])
    }

    pub fn get(&self, id: &RequestId) -> CoreResult<DownloadRequest> {
        let table = self.shared.table()?;
        table
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Snapshot of every request in admission order.
    pub fn list(&self) -> CoreResult<Vec<DownloadRequest>> {
        let table = self.shared.table()?;
        let mut requests: Vec<DownloadRequest> = table.requests.values().cloned().collect();
        requests.sort_by_key(|request| request.seq);
        Ok(requests)
    }

    /// 1-based rank among queued requests, `None` when not queued.
    pub fn queue_position(&self, id: &RequestId) -> CoreResult<Option<usize>> {
        let table = self.shared.table()?;
        let mut queued: Vec<QueueItem> = table
            .requests
            .values()
            .filter(|request| request.state == RequestState::Queued)
            .map(QueueItem::for_request)
            .collect();
        queued.sort_by(|a, b| b.cmp(a));
        Ok(queued
            .iter()
            .position(|item| &item.id == id)
            .map(|index| index + 1))
    }

    pub fn subscribe(&self) -> Receiver<DownloadEvent> {
        self.shared.events.subscribe()
    }

    /// Blocks until nothing is queued or running. Returns `false` on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> CoreResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table()?;
        loop {
            let busy = !table.running.is_empty()
                || table
                    .requests
                    .values()
                    .any(|request| request.state == RequestState::Queued);
            if !busy {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            table = self
                .shared
                .changed
                .wait_timeout(table, deadline - now)
                .map_err(|_| CoreError::Storage("request table lock poisoned".to_string()))?
                .0;
        }
    }

    /// Stops dispatching and pauses in-flight transfers; they are stored as
    /// queued so the next `start` picks them up again.
    pub fn shutdown(&self) {
        if let Ok(mut table) = self.shared.table.lock() {
            if !table.started || table.shutting_down {
                return;
            }
            table.shutting_down = true;
            for running in table.running.values() {
                running.control.request_pause();
            }
        }
        self.shared.changed.notify_all();
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            if let Some(handle) = dispatcher.take() {
                let _ = handle.join();
            }
        }
        // The dispatcher may have handed out jobs after the first pass.
        if let Ok(table) = self.shared.table.lock() {
            for running in table.running.values() {
                running.control.request_pause();
            }
        }
        let handles: Vec<JoinHandle<()>> = match self.shared.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.join();
        }
        if let Ok(mut table) = self.shared.table.lock() {
            table.started = false;
        }
        info!("download queue stopped");
    }

    fn resolve_dest(&self, dest_path: &Path) -> CoreResult<PathBuf> {
        if dest_path.as_os_str().is_empty() {
            return Err(CoreError::InvalidRequest("destination path is empty".to_string()));
        }
        if dest_path.is_absolute() {
            Ok(dest_path.to_path_buf())
        } else {
            Ok(self.shared.config.download_root.join(dest_path))
        }
    }
}

impl Drop for DownloadQueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn table(&self) -> CoreResult<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| CoreError::Storage("request table lock poisoned".to_string()))
    }

    fn storage(&self) -> CoreResult<MutexGuard<'_, Box<dyn Storage>>> {
        self.storage
            .lock()
            .map_err(|_| CoreError::Storage("storage lock poisoned".to_string()))
    }

    /// Writes the given requests after releasing the table. The storage lock
    /// is taken first so writes land in the order the table changed.
    fn persist(&self, table: MutexGuard<'_, Table>, ids: &[RequestId]) -> CoreResult<()> {
        let snapshots: Vec<DownloadRequest> = ids
            .iter()
            .filter_map(|id| table.requests.get(id).cloned())
            .collect();
        let mut storage = self.storage()?;
        drop(table);
        for snapshot in &snapshots {
            storage.save_request(snapshot)?;
        }
        Ok(())
    }

    fn persist_logged(&self, table: MutexGuard<'_, Table>, ids: &[RequestId]) {
        if let Err(err) = self.persist(table, ids) {
            warn!("failed to persist request state: {}", err);
        }
    }

    fn publish_state(&self, request: &DownloadRequest) {
        self.events.publish(DownloadEvent::StateChanged {
            id: request.id,
            state: request.state,
            reason: request.reason,
        });
    }

    fn dispatch_loop(self: Arc<Self>) {
        loop {
            let jobs = {
                let Ok(mut table) = self.table.lock() else {
                    warn!("request table poisoned, dispatcher exiting");
                    return;
                };
                loop {
                    if table.shutting_down {
                        return;
                    }
                    let jobs = self.claim_ready(&mut table);
                    if !jobs.is_empty() {
                        let ids: Vec<RequestId> = jobs.iter().map(|(job, _)| job.id).collect();
                        self.persist_logged(table, &ids);
                        break jobs;
                    }
                    table = match self.changed.wait(table) {
                        Ok(table) => table,
                        Err(_) => return,
                    };
                }
            };
            self.reap_workers();
            for (job, control) in jobs {
                let shared = Arc::clone(&self);
                let handle = thread::spawn(move || shared.run_job(job, control));
                if let Ok(mut workers) = self.workers.lock() {
                    workers.push(handle);
                }
            }
        }
    }

    /// Moves as many queued requests to Active as the pool allows. A request
    /// whose previous worker is still exiting waits for it.
    fn claim_ready(&self, table: &mut Table) -> Vec<(TransferJob, Arc<TransferControl>)> {
        let mut jobs = Vec::new();
        let mut deferred = Vec::new();
        while self.scheduler.can_start(table.running.len()) {
            let Some(item) = table.queue.pop() else {
                break;
            };
            if table.running.contains_key(&item.id) {
                deferred.push(item);
                continue;
            }
            let Some(request) = table.requests.get_mut(&item.id) else {
                continue;
            };
            if request.state != RequestState::Queued {
                continue;
            }
            request.reason = None;
            request.error = None;
            request.transition(RequestState::Active);
            self.publish_state(request);
            info!("starting {} ({})", request.id, request.url);

            let control = Arc::new(TransferControl::new());
            let job = TransferJob {
                id: request.id,
                url: request.url.clone(),
                dest_path: request.dest_path.clone(),
                expected_size: request.expected_size,
                checksum: request.checksum.clone(),
            };
            table.running.insert(
                item.id,
                Running {
                    control: Arc::clone(&control),
                    paused_by_user: false,
                },
            );
            jobs.push((job, control));
        }
        for item in deferred {
            table.queue.push(item);
        }
        jobs
    }

    fn reap_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            let mut index = 0usize;
            while index < workers.len() {
                if workers[index].is_finished() {
                    let handle = workers.remove(index);
                    let _ = handle.join();
                } else {
                    index += 1;
                }
            }
        }
    }

    fn run_job(&self, job: TransferJob, control: Arc<TransferControl>) {
        let mut worker = TransferWorker::new(
            Arc::clone(&self.net),
            self.config.transfer.clone(),
            self.throttle.clone(),
        );
        // The retry budget is per run, independent of `request.attempts`.
        let mut tries = 0u32;
        let mut validation_failures = 0u32;
        let mut last_persisted = 0u64;
        let finish = loop {
            let Some(attempt) = self.begin_attempt(&job.id) else {
                break Finish::Failed(CoreError::Storage("request vanished".to_string()));
            };
            tries += 1;
            debug!("transfer {} attempt {}", job.id, attempt);
            let outcome = worker.run(&job, &control, &mut |progress| {
                self.record_progress(&job.id, progress, &mut last_persisted)
            });
            let err = match outcome {
                TransferOutcome::Completed { bytes } => break Finish::Completed(bytes),
                TransferOutcome::Paused { .. } => break Finish::Stopped(StopReason::Paused),
                TransferOutcome::Cancelled => break Finish::Stopped(StopReason::Cancelled),
                TransferOutcome::Failed(err) => err,
            };
            let retry = if err.is_transient() {
                self.retry.allows_retry(tries)
            } else if matches!(err, CoreError::Validation(_)) {
                validation_failures += 1;
                validation_failures <= self.retry.validation_retries
            } else {
                false
            };
            if !retry {
                break Finish::Failed(err);
            }
            let delay = self.retry.delay(tries);
            warn!(
                "transfer {} attempt {} failed: {}; retrying in {:?}",
                job.id, attempt, err, delay
            );
            self.note_error(&job.id, &err);
            if let Some(reason) = control.sleep(delay) {
                break Finish::Stopped(reason);
            }
        };
        self.finish(&job, &control, finish);
    }

    fn begin_attempt(&self, id: &RequestId) -> Option<u32> {
        let mut table = self.table.lock().ok()?;
        let request = table.requests.get_mut(id)?;
        request.attempts += 1;
        request.touch();
        let attempt = request.attempts;
        self.persist_logged(table, &[*id]);
        Some(attempt)
    }

    fn note_error(&self, id: &RequestId, err: &CoreError) {
        if let Ok(mut table) = self.table.lock() {
            if let Some(request) = table.requests.get_mut(id) {
                request.error = Some(err.to_string());
                request.touch();
            }
        }
    }

    fn record_progress(&self, id: &RequestId, progress: TransferProgress, last_persisted: &mut u64) {
        let Ok(mut table) = self.table.lock() else {
            return;
        };
        let Some(request) = table.requests.get_mut(id) else {
            return;
        };
        request.bytes_done = progress.bytes_done;
        if progress.total_bytes.is_some() {
            request.total_bytes = progress.total_bytes;
        }
        self.events.publish(DownloadEvent::Progress { id: *id, progress });

        // A restart from zero also gets written straight away.
        let flush = progress.bytes_done < *last_persisted
            || progress.bytes_done - *last_persisted >= self.config.transfer.progress_flush_bytes;
        if flush {
            *last_persisted = progress.bytes_done;
            request.touch();
            self.persist_logged(table, &[*id]);
        }
    }

    fn finish(&self, job: &TransferJob, control: &TransferControl, finish: Finish) {
        let Ok(mut guard) = self.table.lock() else {
            warn!("request table poisoned, dropping result of {}", job.id);
            return;
        };
        let cancelled = control.stop_reason() == Some(StopReason::Cancelled)
            && !matches!(finish, Finish::Completed(_));
        if cancelled {
            // Still listed as running, so nothing can reuse the destination meanwhile.
            drop(guard);
            if let Err(err) = Artifact::for_dest(&job.dest_path).discard() {
                warn!("cleanup after cancelling {} failed: {}", job.id, err);
            }
            guard = match self.table.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
        let table = &mut *guard;
        let shutting_down = table.shutting_down;
        let running = table.running.remove(&job.id);
        let paused_by_user = running.map(|running| running.paused_by_user).unwrap_or(false);
        let Some(request) = table.requests.get_mut(&job.id) else {
            self.changed.notify_all();
            return;
        };

        match finish {
            Finish::Completed(bytes) => {
                request.bytes_done = bytes;
                request.total_bytes = Some(bytes);
                request.reason = None;
                request.error = None;
                request.transition(RequestState::Completed);
                info!("completed {} ({} bytes)", job.id, bytes);
            }
            _ if cancelled => {
                request.reason = Some(FailureReason::CancelledByUser);
                request.error = None;
                request.transition(RequestState::Cancelled);
                info!("cancelled {}", job.id);
            }
            // Resumed while this worker was still winding down; already queued.
            _ if request.state == RequestState::Queued => {}
            _ if paused_by_user => {
                request.transition(RequestState::Paused);
            }
            Finish::Stopped(_) => {
                // Only shutdown stops a worker without a user pause.
                let next = if shutting_down {
                    RequestState::Queued
                } else {
                    RequestState::Paused
                };
                request.transition(next);
            }
            Finish::Failed(err) => {
                warn!("transfer {} failed: {}", job.id, err);
                request.fail(err.reason(), Some(err.to_string()));
            }
        }
        if request.state == RequestState::Queued && !shutting_down {
            table.queue.remove(&job.id);
            table.queue.push(QueueItem::for_request(request));
        }
        self.publish_state(request);
        self.changed.notify_all();
        self.persist_logged(guard, &[job.id]);
    }
}

fn validate_url(raw: &str) -> CoreResult<String> {
    let parsed = Url::parse(raw.trim())
        .map_err(|err| CoreError::InvalidRequest(format!("malformed url {}: {}", raw, err)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        _ => Err(CoreError::InvalidRequest(format!(
            "unsupported url {}",
            raw
        ))),
    }
}

fn ensure_writable(dest_path: &Path) -> CoreResult<()> {
    if dest_path.is_dir() {
        return Err(CoreError::InvalidRequest(format!(
            "{} is a directory",
            dest_path.display()
        )));
    }
    let parent = dest_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| {
            CoreError::InvalidRequest(format!("{} has no parent directory", dest_path.display()))
        })?;
    fs::create_dir_all(parent).map_err(|err| {
        CoreError::InvalidRequest(format!("{} is not writable: {}", parent.display(), err))
    })?;
    let meta = fs::metadata(parent)
        .map_err(|err| CoreError::InvalidRequest(format!("{}: {}", parent.display(), err)))?;
    if !meta.is_dir() || meta.permissions().readonly() {
        return Err(CoreError::InvalidRequest(format!(
            "{} is not writable",
            parent.display()
        )));
    }
    Ok(())
}
