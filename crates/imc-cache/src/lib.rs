//! Boundary geometry cache with a persisted TTL record, plus the coordinate validator.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use imc_core::{BoundaryGeometry, Coordinates, OutboundEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "imc-cache";

/// Fixed storage key of the persisted boundary record.
pub const CACHE_KEY: &str = "us_boundaries_cache";
pub const CACHE_VERSION: u32 = 1;

pub type OutboundSender = mpsc::UnboundedSender<OutboundEvent>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing cache record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("no boundary data within {0:?}")]
    Timeout(Duration),
    #[error("boundary source closed before replying")]
    SourceClosed,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub cache_dir: PathBuf,
    pub fetch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            cache_dir: PathBuf::from("./.imc-cache"),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Persisted record shape. `timestamp` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub version: u32,
    pub boundaries: Vec<BoundaryGeometry>,
    pub timestamp: i64,
}

impl CacheRecord {
    pub fn new(boundaries: Vec<BoundaryGeometry>, written_at: DateTime<Utc>) -> Self {
        Self {
            version: CACHE_VERSION,
            boundaries,
            timestamp: written_at.timestamp_millis(),
        }
    }

    /// A record stamped after `now` is never fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age_ms = i128::from(now.timestamp_millis()) - i128::from(self.timestamp);
        age_ms >= 0 && age_ms < ttl.as_millis() as i128
    }
}

#[derive(Debug, Clone)]
pub struct PersistedCacheStore {
    dir: PathBuf,
}

impl PersistedCacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{CACHE_KEY}.json"))
    }

    /// Missing, unreadable, malformed or foreign-version records all read as a miss.
    pub async fn load(&self) -> Option<CacheRecord> {
        let path = self.path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "persisted boundary cache unreadable");
                return None;
            }
        };

        match serde_json::from_slice::<CacheRecord>(&bytes) {
            Ok(record) if record.version == CACHE_VERSION => Some(record),
            Ok(record) => {
                warn!(version = record.version, "discarding boundary cache with unknown version");
                self.discard().await;
                None
            }
            Err(err) => {
                warn!(error = %err, "discarding malformed boundary cache");
                self.discard().await;
                None
            }
        }
    }

    /// Write the record through a temp file and an atomic rename.
    pub async fn store(&self, record: &CacheRecord) -> Result<PathBuf, CacheError> {
        let bytes = serde_json::to_vec(record)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| io_error(&self.dir, source))?;

        let path = self.path();
        let temp_path = self.dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        file.write_all(&bytes)
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        file.flush()
            .await
            .map_err(|source| io_error(&temp_path, source))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(&path, source));
        }
        Ok(path)
    }

    async fn discard(&self) {
        let path = self.path();
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to discard boundary cache");
            }
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where boundary geometry comes from on a cold cache.
#[async_trait]
pub trait BoundarySource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<BoundaryGeometry>, CacheError>;
}

/// Boundary source over the event bus: sends `get_us_boundaries` and waits for the
/// matching `us_boundaries_data` to be handed to [`BusBoundarySource::deliver`].
#[derive(Debug)]
pub struct BusBoundarySource {
    outbound: OutboundSender,
    waiter: Mutex<Option<oneshot::Sender<Vec<BoundaryGeometry>>>>,
}

impl BusBoundarySource {
    pub fn new(outbound: OutboundSender) -> Self {
        Self {
            outbound,
            waiter: Mutex::new(None),
        }
    }

    /// Hand inbound data to the waiting fetch. Gives the data back when nobody is waiting.
    pub async fn deliver(
        &self,
        boundaries: Vec<BoundaryGeometry>,
    ) -> Result<(), Vec<BoundaryGeometry>> {
        match self.waiter.lock().await.take() {
            Some(tx) => tx.send(boundaries),
            None => Err(boundaries),
        }
    }
}

#[async_trait]
impl BoundarySource for BusBoundarySource {
    async fn fetch(&self) -> Result<Vec<BoundaryGeometry>, CacheError> {
        let (tx, rx) = oneshot::channel();
        *self.waiter.lock().await = Some(tx);
        self.outbound
            .send(OutboundEvent::GetUsBoundaries {})
            .map_err(|_| CacheError::SourceClosed)?;
        rx.await.map_err(|_| CacheError::SourceClosed)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    boundaries: Vec<BoundaryGeometry>,
    timestamp: DateTime<Utc>,
}

/// TTL cache over memory and the persisted record. At most one source fetch per cold period.
pub struct BoundaryCache<S> {
    config: CacheConfig,
    store: PersistedCacheStore,
    source: Arc<S>,
    memory: Mutex<Option<CacheEntry>>,
    fetch_lock: Mutex<()>,
}

impl<S: BoundarySource> BoundaryCache<S> {
    pub fn new(config: CacheConfig, source: Arc<S>) -> Self {
        let store = PersistedCacheStore::new(config.cache_dir.clone());
        Self {
            config,
            store,
            source,
            memory: Mutex::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &PersistedCacheStore {
        &self.store
    }

    pub async fn get(&self) -> Result<Vec<BoundaryGeometry>, CacheError> {
        if let Some(hit) = self.fresh_in_memory().await {
            return Ok(hit);
        }

        // Concurrent cold callers queue here and find the cache warm once the first returns.
        let _flight = self.fetch_lock.lock().await;
        if let Some(hit) = self.fresh_in_memory().await {
            return Ok(hit);
        }

        let now = Utc::now();
        if let Some(record) = self.store.load().await {
            if record.is_fresh(now, self.config.ttl) {
                let timestamp = DateTime::from_timestamp_millis(record.timestamp).unwrap_or(now);
                *self.memory.lock().await = Some(CacheEntry {
                    boundaries: record.boundaries.clone(),
                    timestamp,
                });
                debug!(features = record.boundaries.len(), "boundary cache served from disk");
                return Ok(record.boundaries);
            }
            debug!("persisted boundary cache expired");
        }

        let boundaries = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch())
            .instrument(info_span!("boundary_fetch"))
            .await
            .map_err(|_| CacheError::Timeout(self.config.fetch_timeout))??;
        self.write_through(boundaries.clone(), Utc::now()).await;
        Ok(boundaries)
    }

    /// Write data that arrived without a fetch waiting for it.
    pub async fn accept_push(&self, boundaries: Vec<BoundaryGeometry>) {
        self.write_through(boundaries, Utc::now()).await;
    }

    async fn fresh_in_memory(&self) -> Option<Vec<BoundaryGeometry>> {
        let memory = self.memory.lock().await;
        let entry = memory.as_ref()?;
        let age = Utc::now().signed_duration_since(entry.timestamp);
        let fresh = age.to_std().is_ok_and(|age| age < self.config.ttl);
        fresh.then(|| entry.boundaries.clone())
    }

    async fn write_through(&self, boundaries: Vec<BoundaryGeometry>, now: DateTime<Utc>) {
        let record = CacheRecord::new(boundaries.clone(), now);
        *self.memory.lock().await = Some(CacheEntry {
            boundaries,
            timestamp: now,
        });
        if let Err(err) = self.store.store(&record).await {
            warn!(error = %err, "boundary cache kept in memory only");
        }
    }
}

/// Inclusive latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    pub fn contains(&self, at: &Coordinates) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&at.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&at.longitude)
    }
}

impl Default for BoundingBox {
    /// The map's maximum bounds over the target territory.
    fn default() -> Self {
        Self {
            min_latitude: 20.0,
            max_latitude: 50.0,
            min_longitude: -130.0,
            max_longitude: -60.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    pub timeout: Duration,
    pub fallback: BoundingBox,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            fallback: BoundingBox::default(),
        }
    }
}

type PendingValidations = VecDeque<(Uuid, oneshot::Sender<bool>)>;

/// Asks the server whether a point is eligible, falling back to a local box on timeout.
#[derive(Debug, Clone)]
pub struct CoordinateValidator {
    config: ValidatorConfig,
    outbound: OutboundSender,
    pending: Arc<Mutex<PendingValidations>>,
}

impl CoordinateValidator {
    pub fn new(config: ValidatorConfig, outbound: OutboundSender) -> Self {
        Self {
            config,
            outbound,
            pending: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn fallback(&self, at: &Coordinates) -> bool {
        self.config.fallback.contains(at)
    }

    pub async fn validate(&self, at: Coordinates) -> bool {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push_back((request_id, tx));

        let sent = self.outbound.send(OutboundEvent::ValidateCoordinates {
            latitude: at.latitude,
            longitude: at.longitude,
            request_id,
        });
        if sent.is_err() {
            self.forget(request_id).await;
            warn!("event bus closed; using local bounding box");
            return self.fallback(&at);
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(_)) => self.fallback(&at),
            Err(_) => {
                self.forget(request_id).await;
                warn!(%request_id, "no validation answer in time; using local bounding box");
                self.fallback(&at)
            }
        }
    }

    /// Route a server answer to its waiting request, or the oldest one when uncorrelated.
    /// Returns false when nothing was waiting.
    pub async fn resolve(&self, valid: bool, request_id: Option<Uuid>) -> bool {
        let mut pending = self.pending.lock().await;
        let slot = match request_id {
            Some(id) => pending
                .iter()
                .position(|(pending_id, _)| *pending_id == id)
                .and_then(|idx| pending.remove(idx)),
            None => pending.pop_front(),
        };
        match slot {
            Some((_, tx)) => tx.send(valid).is_ok(),
            None => {
                debug!(?request_id, "late validation result ignored");
                false
            }
        }
    }

    async fn forget(&self, request_id: Uuid) {
        self.pending.lock().await.retain(|(id, _)| *id != request_id);
    }
}
