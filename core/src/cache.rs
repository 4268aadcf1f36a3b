//! Local store for cover art.
//!
//! Lookups are cache-first. A miss walks the configured sources in order,
//! writes the first valid image under a temp name and renames it into place
//! before the entry becomes visible. Concurrent lookups for one key share a
//! single fetch. After every commit the least recently used entries are
//! evicted until the store fits its budget; entries held by a live
//! [`AssetLease`] or still being fetched are never evicted.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use image::ImageFormat;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{remove_if_exists, write_atomic};
use crate::checksum::sha256_bytes;
use crate::config::{AcquisitionConfig, CacheConfig};
use crate::error::{CacheError, CacheResult, CoreError, CoreResult};
use crate::net::{NetClient, NetRequest, ReqwestNetClient};
use crate::request::now_epoch;

const INDEX_FILE: &str = "index.json";
const INDEX_VERSION: u32 = 1;
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetKey {
    pub platform: String,
    pub item: String,
}

impl AssetKey {
    pub fn new(platform: impl Into<String>, item: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            item: item.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.platform, self.item)
    }
}

/// A committed image. Only committed entries are ever stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: AssetKey,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
    pub origin_url: String,
    pub last_access: u64,
    #[serde(default)]
    pub access_seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

#[derive(Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    entries: Vec<CacheEntry>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pins: HashMap<String, usize>,
    total_bytes: u64,
    access_seq: u64,
    hits: u64,
    misses: u64,
    failures: u64,
}

impl CacheState {
    fn touch(&mut self, id: &str) {
        self.access_seq += 1;
        let seq = self.access_seq;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.access_seq = seq;
            entry.last_access = now_epoch();
        }
    }

    fn pin(&mut self, id: &str, count: usize) {
        *self.pins.entry(id.to_string()).or_insert(0) += count;
    }

    fn unpin(&mut self, id: &str) {
        if let Some(count) = self.pins.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pins.remove(id);
            }
        }
    }

    fn snapshot(&self) -> CacheIndex {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.access_seq);
        CacheIndex {
            version: INDEX_VERSION,
            entries,
        }
    }
}

#[derive(Default)]
struct FlightState {
    waiters: usize,
    result: Option<CacheResult<PathBuf>>,
}

/// One in-progress fetch that late callers wait on.
#[derive(Default)]
struct Flight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl Flight {
    fn wait(&self) -> CacheResult<PathBuf> {
        let Ok(mut state) = self.state.lock() else {
            return Err(CacheError::Disk("fetch state poisoned".to_string()));
        };
        loop {
            if let Some(result) = &state.result {
                return result.clone();
            }
            state = match self.done.wait(state) {
                Ok(state) => state,
                Err(_) => return Err(CacheError::Disk("fetch state poisoned".to_string())),
            };
        }
    }

    fn complete(&self, result: CacheResult<PathBuf>) {
        if let Ok(mut state) = self.state.lock() {
            state.result = Some(result);
        }
        self.done.notify_all();
    }
}

struct CacheInner {
    root: PathBuf,
    config: CacheConfig,
    placeholder: Option<PathBuf>,
    net: Arc<dyn NetClient>,
    // Lock order: inflight, then state, then index_lock.
    inflight: Mutex<HashMap<String, Arc<Flight>>>,
    state: Mutex<CacheState>,
    index_lock: Mutex<()>,
}

/// Keeps a cached file from being evicted while held.
pub struct AssetLease {
    cache: Arc<CacheInner>,
    id: String,
    path: PathBuf,
}

impl AssetLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AssetLease {
    fn drop(&mut self) {
        self.cache.release(&self.id);
    }
}

impl std::fmt::Debug for AssetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetLease")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

struct Fetched {
    origin_url: String,
    bytes: Vec<u8>,
    format: ImageFormat,
}

#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<CacheInner>,
}

impl AssetCache {
    /// Opens (or creates) the cache under `config.cache_root`, sharing `net`
    /// with the rest of the application.
    pub fn open(config: &AcquisitionConfig, net: Arc<dyn NetClient>) -> CoreResult<Self> {
        let root = config.cache_root.clone();
        fs::create_dir_all(&root)
            .map_err(|err| CoreError::Disk(format!("{}: {}", root.display(), err)))?;
        let inner = CacheInner {
            root,
            config: config.cache.clone(),
            placeholder: config.placeholder_image.clone(),
            net,
            inflight: Mutex::new(HashMap::new()),
            state: Mutex::new(CacheState::default()),
            index_lock: Mutex::new(()),
        };
        let cache = Self {
            inner: Arc::new(inner),
        };
        cache.inner.load_index()?;
        Ok(cache)
    }

    /// Opens the cache with its own HTTP client tuned to the image timeouts.
    pub fn open_default(config: &AcquisitionConfig) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(
            &config.user_agent,
            config.cache.connect_timeout(),
            config.cache.read_timeout(),
        )?;
        Self::open(config, Arc::new(net))
    }

    pub fn get_or_fetch(&self, key: &AssetKey) -> CacheResult<AssetLease> {
        self.get_or_fetch_with(key, &[])
    }

    /// Like [`get_or_fetch`](Self::get_or_fetch), trying `extra_sources`
    /// after the configured templates.
    pub fn get_or_fetch_with(&self, key: &AssetKey, extra_sources: &[String]) -> CacheResult<AssetLease> {
        let id = key.id();
        let (flight, leader) = {
            let mut inflight = self.inner.inflight()?;
            if let Some(flight) = inflight.get(&id) {
                if let Ok(mut state) = flight.state.lock() {
                    state.waiters += 1;
                }
                (Arc::clone(flight), false)
            } else {
                let mut state = self.inner.state()?;
                if let Some(path) = state.entries.get(&id).map(|entry| entry.local_path.clone()) {
                    state.hits += 1;
                    state.touch(&id);
                    state.pin(&id, 1);
                    return Ok(self.lease(id, path));
                }
                state.misses += 1;
                let flight = Arc::new(Flight::default());
                inflight.insert(id.clone(), Arc::clone(&flight));
                (flight, true)
            }
        };

        if !leader {
            let path = flight.wait()?;
            return Ok(self.lease(id, path));
        }

        let sources = self.inner.sources(key, extra_sources);
        let result = self
            .inner
            .fetch(key, &sources)
            .and_then(|fetched| self.inner.write_committed(key, fetched));
        let path = self.inner.finish_flight(&id, &flight, result)?;
        Ok(self.lease(id, path))
    }

    /// Path of the configured "no art" image, when it exists.
    pub fn placeholder(&self) -> Option<PathBuf> {
        self.inner
            .placeholder
            .clone()
            .filter(|path| path.is_file())
    }

    /// Drops a committed entry. Returns `false` when the key is unknown,
    /// pinned or being fetched.
    pub fn invalidate(&self, key: &AssetKey) -> CacheResult<bool> {
        let id = key.id();
        let inflight = self.inner.inflight()?;
        if inflight.contains_key(&id) {
            return Ok(false);
        }
        let mut state = self.inner.state()?;
        if state.pins.contains_key(&id) {
            return Ok(false);
        }
        let Some(entry) = state.entries.remove(&id) else {
            return Ok(false);
        };
        state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
        let index = state.snapshot();
        let index_guard = self.inner.index_guard()?;
        drop(state);
        drop(inflight);
        remove_if_exists(&entry.local_path).map_err(|err| CacheError::Disk(err.to_string()))?;
        self.inner
            .save_index(&index, index_guard)
            .map_err(|err| CacheError::Disk(err.to_string()))?;
        debug!("invalidated {}", id);
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        match self.inner.state.lock() {
            Ok(state) => CacheStats {
                entries: state.entries.len(),
                total_bytes: state.total_bytes,
                budget_bytes: self.inner.config.budget_bytes,
                pinned: state.pins.len(),
                hits: state.hits,
                misses: state.misses,
                failures: state.failures,
            },
            Err(_) => CacheStats::default(),
        }
    }

    pub fn entry(&self, key: &AssetKey) -> Option<CacheEntry> {
        let state = self.inner.state.lock().ok()?;
        state.entries.get(&key.id()).cloned()
    }

    fn lease(&self, id: String, path: PathBuf) -> AssetLease {
        AssetLease {
            cache: Arc::clone(&self.inner),
            id,
            path,
        }
    }
}

impl CacheInner {
    fn inflight(&self) -> CacheResult<MutexGuard<'_, HashMap<String, Arc<Flight>>>> {
        self.inflight
            .lock()
            .map_err(|_| CacheError::Disk("inflight lock poisoned".to_string()))
    }

    fn state(&self) -> CacheResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| CacheError::Disk("cache lock poisoned".to_string()))
    }

    fn index_guard(&self) -> CacheResult<MutexGuard<'_, ()>> {
        self.index_lock
            .lock()
            .map_err(|_| CacheError::Disk("index lock poisoned".to_string()))
    }

    fn sources(&self, key: &AssetKey, extra: &[String]) -> Vec<String> {
        let platform = urlencoding::encode(&key.platform);
        let item = urlencoding::encode(&key.item);
        let mut seen = HashSet::new();
        self.config
            .source_templates
            .iter()
            .map(|template| {
                template
                    .replace("{platform}", &platform)
                    .replace("{item}", &item)
            })
            .chain(extra.iter().cloned())
            .filter(|url| !url.trim().is_empty())
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    /// First source yielding a valid image wins.
    fn fetch(&self, key: &AssetKey, sources: &[String]) -> CacheResult<Fetched> {
        let mut last_error = String::from("no sources configured");
        for url in sources {
            let mut delays = self.config.retry_delays_ms.iter();
            loop {
                match self.fetch_source(url) {
                    Ok((bytes, format)) => {
                        return Ok(Fetched {
                            origin_url: url.clone(),
                            bytes,
                            format,
                        })
                    }
                    Err(err) if err.is_transient() => match delays.next() {
                        Some(delay) => {
                            debug!("retrying {} in {}ms: {}", url, delay, err);
                            thread::sleep(Duration::from_millis(*delay));
                        }
                        None => {
                            last_error = format!("{}: {}", url, err);
                            break;
                        }
                    },
                    Err(err) => {
                        debug!("source {} rejected for {}: {}", url, key.id(), err);
                        last_error = format!("{}: {}", url, err);
                        break;
                    }
                }
            }
        }
        Err(CacheError::AssetUnavailable(format!("{}: {}", key.id(), last_error)))
    }

    fn fetch_source(&self, url: &str) -> CoreResult<(Vec<u8>, ImageFormat)> {
        let mut response = self.net.get(&NetRequest::new(url))?;
        if !response.meta.is_success() {
            return Err(CoreError::HttpStatus(response.meta.status_code));
        }
        let cap = self.config.max_asset_bytes;
        if response.meta.content_length.map(|len| len > cap).unwrap_or(false) {
            return Err(CoreError::CacheCorruption(format!("larger than {} bytes", cap)));
        }
        let mut bytes = Vec::new();
        response
            .body
            .by_ref()
            .take(cap + 1)
            .read_to_end(&mut bytes)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if bytes.len() as u64 > cap {
            return Err(CoreError::CacheCorruption(format!("larger than {} bytes", cap)));
        }
        let format = validate_image(&bytes)?;
        Ok((bytes, format))
    }

    /// Temp file, validate, rename. The file stays invisible to lookups
    /// until the entry is committed to the index.
    fn write_committed(&self, key: &AssetKey, fetched: Fetched) -> CacheResult<CacheEntry> {
        let dir = self.root.join(safe_component(&key.platform));
        fs::create_dir_all(&dir).map_err(|err| CacheError::Disk(err.to_string()))?;
        let ext = fetched.format.extensions_str().first().copied().unwrap_or("img");
        let stem = format!(
            "{}-{:016x}",
            &sha256_bytes(key.id().as_bytes())[..24],
            rand::random::<u64>()
        );
        let final_path = dir.join(format!("{}.{}", stem, ext));
        let temp_path = dir.join(format!("{}{}", stem, TEMP_SUFFIX));

        let written = (|| -> std::io::Result<u64> {
            let mut file = File::create(&temp_path)?;
            file.write_all(&fetched.bytes)?;
            file.sync_all()?;
            Ok(fs::metadata(&temp_path)?.len())
        })();
        let size = match written {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(CacheError::Disk(format!("{}: {}", temp_path.display(), err)));
            }
        };
        if size == 0 || size != fetched.bytes.len() as u64 {
            let _ = fs::remove_file(&temp_path);
            return Err(CacheError::Disk(format!(
                "short write for {}",
                temp_path.display()
            )));
        }
        fs::rename(&temp_path, &final_path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            CacheError::Disk(format!("{}: {}", final_path.display(), err))
        })?;

        Ok(CacheEntry {
            key: key.clone(),
            local_path: final_path,
            size_bytes: size,
            sha256: sha256_bytes(&fetched.bytes),
            origin_url: fetched.origin_url,
            last_access: now_epoch(),
            access_seq: 0,
        })
    }

    /// Publishes the fetch result to every waiter. On success the entry is
    /// committed and pinned once per caller before anyone can evict it.
    fn finish_flight(
        &self,
        id: &str,
        flight: &Flight,
        result: CacheResult<CacheEntry>,
    ) -> CacheResult<PathBuf> {
        let mut inflight = self.inflight()?;
        inflight.remove(id);
        let waiters = flight.state.lock().map(|state| state.waiters).unwrap_or(0);

        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                if let Ok(mut state) = self.state.lock() {
                    state.failures += 1;
                }
                warn!("no art for {}: {}", id, err);
                flight.complete(Err(err.clone()));
                return Err(err);
            }
        };

        let path = entry.local_path.clone();
        let mut state = self.state()?;
        if let Some(old) = state.entries.remove(id) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size_bytes);
        }
        state.total_bytes += entry.size_bytes;
        state.entries.insert(id.to_string(), entry);
        state.touch(id);
        state.pin(id, waiters + 1);
        let victims = self.evict_locked(&mut state, &inflight);
        let index = state.snapshot();
        let index_guard = self.index_guard()?;
        drop(state);
        flight.complete(Ok(path.clone()));
        drop(inflight);

        self.remove_files(&victims);
        if let Err(err) = self.save_index(&index, index_guard) {
            warn!("failed to write cache index: {}", err);
        }
        debug!("cached {} at {}", id, path.display());
        Ok(path)
    }

    /// Picks least recently used, unpinned, settled entries until the
    /// store fits the budget. Returns the files to delete.
    fn evict_locked(
        &self,
        state: &mut CacheState,
        inflight: &HashMap<String, Arc<Flight>>,
    ) -> Vec<PathBuf> {
        let mut victims = Vec::new();
        while state.total_bytes > self.config.budget_bytes {
            let candidate = state
                .entries
                .iter()
                .filter(|(id, _)| !state.pins.contains_key(*id) && !inflight.contains_key(*id))
                .min_by_key(|(_, entry)| entry.access_seq)
                .map(|(id, _)| id.clone());
            let Some(id) = candidate else {
                debug!(
                    "cache over budget ({} > {}) but every entry is in use",
                    state.total_bytes, self.config.budget_bytes
                );
                break;
            };
            if let Some(entry) = state.entries.remove(&id) {
                state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
                info!("evicted {} ({} bytes)", id, entry.size_bytes);
                victims.push(entry.local_path);
            }
        }
        victims
    }

    fn release(&self, id: &str) {
        let Ok(inflight) = self.inflight.lock() else {
            return;
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.unpin(id);
        if state.total_bytes <= self.config.budget_bytes {
            return;
        }
        let victims = self.evict_locked(&mut state, &inflight);
        if victims.is_empty() {
            return;
        }
        let index = state.snapshot();
        let Ok(index_guard) = self.index_lock.lock() else {
            return;
        };
        drop(state);
        drop(inflight);
        self.remove_files(&victims);
        if let Err(err) = self.save_index(&index, index_guard) {
            warn!("failed to write cache index: {}", err);
        }
    }

    fn remove_files(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(err) = remove_if_exists(path) {
                warn!("failed to remove evicted file: {}", err);
            }
        }
    }

    fn save_index(&self, index: &CacheIndex, _guard: MutexGuard<'_, ()>) -> CoreResult<()> {
        let raw = serde_json::to_vec_pretty(index).map_err(|err| CoreError::Disk(err.to_string()))?;
        write_atomic(&self.root.join(INDEX_FILE), &raw)
    }

    /// Rebuilds state from the persisted index, dropping entries whose file
    /// vanished or changed size, and clears temp and unreferenced files.
    fn load_index(&self) -> CoreResult<()> {
        let index_path = self.root.join(INDEX_FILE);
        let stored: Vec<CacheEntry> = match fs::read(&index_path) {
            Ok(raw) => match serde_json::from_slice::<CacheIndex>(&raw) {
                Ok(index) => index.entries,
                Err(err) => {
                    warn!("ignoring unreadable cache index: {}", err);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let mut state = CacheState::default();
        let mut dropped = 0usize;
        for mut entry in stored {
            let on_disk = fs::metadata(&entry.local_path).map(|meta| meta.len()).ok();
            if on_disk != Some(entry.size_bytes) {
                dropped += 1;
                continue;
            }
            state.access_seq += 1;
            entry.access_seq = state.access_seq;
            state.total_bytes += entry.size_bytes;
            state.entries.insert(entry.key.id(), entry);
        }

        let referenced: HashSet<PathBuf> = state
            .entries
            .values()
            .map(|entry| entry.local_path.clone())
            .collect();
        let strays = self.remove_strays(&referenced)?;
        let inflight = HashMap::new();
        let victims = self.evict_locked(&mut state, &inflight);
        self.remove_files(&victims);
        if dropped > 0 || strays > 0 || !victims.is_empty() {
            info!(
                "cache index reloaded: {} entries, {} dropped, {} stray files removed",
                state.entries.len(),
                dropped,
                strays
            );
        }

        let index = state.snapshot();
        *self
            .state
            .lock()
            .map_err(|_| CoreError::Disk("cache lock poisoned".to_string()))? = state;
        let guard = self
            .index_lock
            .lock()
            .map_err(|_| CoreError::Disk("index lock poisoned".to_string()))?;
        self.save_index(&index, guard)
    }

    fn remove_strays(&self, referenced: &HashSet<PathBuf>) -> CoreResult<usize> {
        let mut removed = 0usize;
        let dirs = fs::read_dir(&self.root).map_err(|err| CoreError::Disk(err.to_string()))?;
        for dir in dirs.flatten() {
            let dir_path = dir.path();
            if !dir_path.is_dir() {
                if dir_path.to_string_lossy().ends_with(TEMP_SUFFIX) {
                    remove_if_exists(&dir_path)?;
                    removed += 1;
                }
                continue;
            }
            let files = fs::read_dir(&dir_path).map_err(|err| CoreError::Disk(err.to_string()))?;
            for file in files.flatten() {
                let path = file.path();
                if path.is_file() && !referenced.contains(&path) {
                    if Some(path.as_path()) == self.placeholder.as_deref() {
                        continue;
                    }
                    remove_if_exists(&path)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Rejects bodies that are empty or not a recognised image.
pub fn validate_image(bytes: &[u8]) -> CoreResult<ImageFormat> {
    if bytes.is_empty() {
        return Err(CoreError::CacheCorruption("empty body".to_string()));
    }
    image::guess_format(bytes)
        .map_err(|err| CoreError::CacheCorruption(format!("not an image: {}", err)))
}

fn safe_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
