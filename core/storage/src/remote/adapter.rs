//! Storage provider backed by the remote API, with an offline write queue.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tarotsync_common::{Error, Memos, Result, Session, SessionDate, SpreadRecord};

use super::client::TransportClient;
use super::connectivity::ConnectivityObserver;
use super::queue::{DrainOutcome, DrainReport, OfflineQueue, Operation, QueuedOperation};
use super::wire::{decode_session, SaveSessionResponse, SessionListResponse, SessionPayload, SpreadListResponse};
use crate::provider::{ensure_same_date, StorageProvider};

/// Number of sessions requested when listing.
const SESSION_LIST_LIMIT: usize = 100;

/// Last values seen from, or written to, the server.
#[derive(Default)]
struct ReadCache {
    sessions: HashMap<SessionDate, Session>,
    spreads: Option<Vec<SpreadRecord>>,
}

/// Storage provider used while signed in.
///
/// Writes made while offline, or while earlier writes are still queued, are
/// deferred and replayed in order once connectivity returns. The caller's
/// future resolves when its write finally runs. Reads never queue: offline
/// they answer from the cache of last-known values.
pub struct RemoteStorageAdapter {
    transport: Arc<TransportClient>,
    online: Arc<AtomicBool>,
    queue: Arc<OfflineQueue>,
    cache: Mutex<ReadCache>,
}

impl RemoteStorageAdapter {
    pub fn new(transport: Arc<TransportClient>) -> Self {
        Self {
            transport,
            online: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(OfflineQueue::new()),
            cache: Mutex::new(ReadCache::default()),
        }
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Number of writes waiting for connectivity.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Record a connectivity change; going online starts a drain.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::AcqRel);

        if online && !was_online {
            info!("Connectivity restored; {} queued write(s)", self.queue.len());
            self.spawn_drain();
        } else if !online && was_online {
            info!("Connectivity lost; writes will be queued");
        }
    }

    /// Follow `observer` until it or this adapter goes away.
    pub fn spawn_connectivity_listener(
        self: &Arc<Self>,
        observer: &dyn ConnectivityObserver,
    ) -> JoinHandle<()> {
        let mut rx = observer.subscribe();
        self.set_online(rx.borrow_and_update().is_online());

        let adapter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connectivity = *rx.borrow_and_update();
                let Some(adapter) = adapter.upgrade() else {
                    return;
                };
                adapter.set_online(connectivity.is_online());
            }
        })
    }

    /// Replay queued writes now.
    ///
    /// # Errors
    /// - `NetworkUnavailable` if offline or the drain stopped on a
    ///   connectivity failure
    /// - `QueueAborted` if a queued write was rejected
    pub async fn sync_offline_data(&self) -> Result<usize> {
        if !self.is_online() {
            return Err(Error::NetworkUnavailable(
                "Cannot sync queued writes while offline".to_string(),
            ));
        }

        let report = drain(&self.queue, &self.online).await;
        match report.outcome {
            DrainOutcome::Completed | DrainOutcome::AlreadyDraining => Ok(report.executed),
            DrainOutcome::Paused => Err(Error::NetworkUnavailable(format!(
                "{} queued write(s) still pending",
                self.queue.len()
            ))),
            DrainOutcome::Aborted { aborted } => Err(Error::QueueAborted(format!(
                "A queued write was rejected; {} later write(s) dropped",
                aborted
            ))),
        }
    }

    /// Drop every queued write; their callers see `AuthenticationRequired`.
    pub fn clear_offline_queue(&self) -> usize {
        let dropped = self.queue.abort_all(|label| {
            Error::AuthenticationRequired(format!("Signed out before {} ran", label))
        });
        if dropped > 0 {
            warn!("Discarded {} queued write(s)", dropped);
        }
        dropped
    }

    /// Forget every cached read.
    pub fn clear_cache(&self) {
        *self.lock_cache() = ReadCache::default();
    }

    /// Upload a session immediately, bypassing the queue.
    pub async fn push_session(&self, session: &Session) -> Result<()> {
        upload_session(&self.transport, session).await
    }

    /// Upload a spread immediately, bypassing the queue.
    pub async fn push_spread(&self, spread: &SpreadRecord) -> Result<()> {
        upload_spread(&self.transport, spread).await
    }

    /// Server-side health and record counts.
    pub async fn sync_status(&self) -> Result<Value> {
        self.transport.get("/sync/status").await.map_err(translate)
    }

    /// Full export of the signed-in user's data.
    pub async fn export_data(&self) -> Result<Value> {
        self.transport.get("/sync/export").await.map_err(translate)
    }

    /// Bulk import of previously exported data.
    pub async fn import_data(&self, data: Value) -> Result<Value> {
        self.transport
            .post("/sync/import", data)
            .await
            .map_err(translate)
    }

    /// Append `operation` behind earlier writes and wait for it to run.
    ///
    /// Every write goes through the queue, so a write can never overtake one
    /// that is still being replayed. Online, this kicks a drain; if one is
    /// already running it picks the new entry up before finishing.
    async fn execute_write(&self, label: String, operation: Operation) -> Result<()> {
        let (queued, done) = QueuedOperation::new(label.clone(), operation);
        self.queue.push(queued);

        if self.is_online() {
            self.spawn_drain();
        } else {
            debug!("Queued {} while offline ({} pending)", label, self.queue.len());
        }

        match done.await {
            Ok(result) => result,
            Err(_) => Err(Error::QueueAborted(format!("{} was dropped", label))),
        }
    }

    fn spawn_drain(&self) {
        let queue = self.queue.clone();
        let online = self.online.clone();
        tokio::spawn(async move {
            drain(&queue, &online).await;
        });
    }

    fn cached_session(&self, date: &SessionDate) -> Option<Session> {
        self.lock_cache().sessions.get(date).cloned()
    }

    fn cache_session(&self, session: Option<Session>, date: &SessionDate) {
        let mut cache = self.lock_cache();
        match session {
            Some(session) => {
                cache.sessions.insert(date.clone(), session);
            }
            None => {
                cache.sessions.remove(date);
            }
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, ReadCache> {
        match self.cache.lock() {
            Ok(cache) => cache,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn drain(queue: &OfflineQueue, online: &AtomicBool) -> DrainReport {
    let report = queue.drain(|| online.load(Ordering::Acquire)).await;

    match &report.outcome {
        DrainOutcome::Completed if report.executed > 0 => {
            info!("Replayed {} queued write(s)", report.executed);
        }
        DrainOutcome::Paused => {
            info!(
                "Queue drain paused after {} write(s); {} pending",
                report.executed,
                queue.len()
            );
        }
        _ => {}
    }

    report
}

/// Map transport errors to storage-level errors.
fn translate(error: Error) -> Error {
    match error {
        Error::Http { status: 401, message } => Error::AuthenticationRequired(message),
        Error::Http { status, message } => Error::RemoteRejected { status, message },
        other => other,
    }
}

async fn upload_session(transport: &TransportClient, session: &Session) -> Result<()> {
    let body = serde_json::to_value(SessionPayload::new(session))?;
    transport
        .post::<SaveSessionResponse>("/daily-sessions", body)
        .await
        .map_err(translate)?;
    Ok(())
}

/// Update the spread in place, creating it when the server has no such id.
async fn upload_spread(transport: &TransportClient, spread: &SpreadRecord) -> Result<()> {
    let body = serde_json::to_value(spread)?;
    match transport
        .put::<Value>(&format!("/spreads/{}", spread.id), body.clone())
        .await
    {
        Ok(_) => return Ok(()),
        Err(Error::Http { status: 404, .. }) => {
            debug!("Spread {} not on server yet; creating", spread.id);
        }
        Err(e) => return Err(translate(e)),
    }

    transport
        .post::<Value>("/spreads", body)
        .await
        .map_err(translate)?;
    Ok(())
}

async fn remove_spread(transport: &TransportClient, id: &str) -> Result<()> {
    match transport.delete::<Value>(&format!("/spreads/{}", id)).await {
        Ok(_) => Ok(()),
        Err(Error::Http { status: 404, .. }) => {
            debug!("Spread {} already absent on server", id);
            Ok(())
        }
        Err(e) => Err(translate(e)),
    }
}

async fn fetch_session(transport: &TransportClient, date: &SessionDate) -> Result<Option<Session>> {
    match transport.get::<Value>(&format!("/daily-sessions/{}", date)).await {
        Ok(body) => decode_session(body).map_err(|e| Error::Decode(format!("Malformed session: {}", e))),
        Err(Error::Http { status: 404, .. }) => Ok(None),
        Err(e) => Err(translate(e)),
    }
}

/// Read-modify-write of one day's memos; runs at execution time when queued.
async fn merge_memos(transport: &TransportClient, date: &SessionDate, memos: &Memos) -> Result<()> {
    let mut session = fetch_session(transport, date)
        .await?
        .unwrap_or_else(|| Session::new(date.clone()));
    session.set_memos(memos.clone());
    upload_session(transport, &session).await
}

#[async_trait]
impl StorageProvider for RemoteStorageAdapter {
    fn name(&self) -> &str {
        "remote"
    }

    async fn get_session(&self, date: &SessionDate) -> Result<Option<Session>> {
        if !self.is_online() {
            return Ok(self.cached_session(date));
        }

        match fetch_session(&self.transport, date).await {
            Ok(session) => {
                self.cache_session(session.clone(), date);
                Ok(session)
            }
            Err(e) if e.is_transient() => {
                warn!("Reading session {} failed ({}); using cache", date, e);
                Ok(self.cached_session(date))
            }
            Err(e) => Err(e),
        }
    }

    async fn save_session(&self, date: &SessionDate, session: Session) -> Result<()> {
        ensure_same_date(date, &session)?;
        let previous = self.cached_session(date);
        self.cache_session(Some(session.clone()), date);

        let transport = self.transport.clone();
        let operation: Operation = Box::new(move || {
            let transport = transport.clone();
            let session = session.clone();
            Box::pin(async move { upload_session(&transport, &session).await })
        });

        let result = self
            .execute_write(format!("save session {}", date), operation)
            .await;
        if result.is_err() {
            self.cache_session(previous, date);
        }
        result
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let cached = || {
            let mut sessions: Vec<Session> =
                self.lock_cache().sessions.values().cloned().collect();
            sessions.sort_by(|a, b| a.date.cmp(&b.date));
            sessions
        };

        if !self.is_online() {
            return Ok(cached());
        }

        let path = format!("/daily-sessions?limit={}", SESSION_LIST_LIMIT);
        match self.transport.get::<SessionListResponse>(&path).await {
            Ok(body) => {
                let mut sessions: Vec<Session> = body.sessions.into_iter().map(Session::from).collect();
                sessions.sort_by(|a, b| a.date.cmp(&b.date));

                let mut cache = self.lock_cache();
                for session in &sessions {
                    cache.sessions.insert(session.date.clone(), session.clone());
                }
                Ok(sessions)
            }
            Err(e) if e.is_transient() => {
                warn!("Listing sessions failed ({}); using cache", e);
                Ok(cached())
            }
            Err(e) => Err(translate(e)),
        }
    }

    async fn get_spreads(&self) -> Result<Vec<SpreadRecord>> {
        let cached = || self.lock_cache().spreads.clone().unwrap_or_default();

        if !self.is_online() {
            return Ok(cached());
        }

        match self.transport.get::<SpreadListResponse>("/spreads").await {
            Ok(body) => {
                self.lock_cache().spreads = Some(body.spreads.clone());
                Ok(body.spreads)
            }
            Err(e) if e.is_transient() => {
                warn!("Listing spreads failed ({}); using cache", e);
                Ok(cached())
            }
            Err(e) => Err(translate(e)),
        }
    }

    async fn save_spread(&self, spread: SpreadRecord) -> Result<()> {
        if let Some(spreads) = self.lock_cache().spreads.as_mut() {
            match spreads.iter_mut().find(|s| s.id == spread.id) {
                Some(existing) => *existing = spread.clone(),
                None => spreads.push(spread.clone()),
            }
        }

        let label = format!("save spread {}", spread.id);
        let transport = self.transport.clone();
        let operation: Operation = Box::new(move || {
            let transport = transport.clone();
            let spread = spread.clone();
            Box::pin(async move { upload_spread(&transport, &spread).await })
        });

        self.execute_write(label, operation).await
    }

    async fn delete_spread(&self, id: &str) -> Result<()> {
        if let Some(spreads) = self.lock_cache().spreads.as_mut() {
            spreads.retain(|s| s.id != id);
        }

        let transport = self.transport.clone();
        let target = id.to_string();
        let operation: Operation = Box::new(move || {
            let transport = transport.clone();
            let target = target.clone();
            Box::pin(async move { remove_spread(&transport, &target).await })
        });

        self.execute_write(format!("delete spread {}", id), operation)
            .await
    }

    async fn get_memos(&self, date: &SessionDate) -> Result<Memos> {
        Ok(self
            .get_session(date)
            .await?
            .map(|session| session.memos)
            .unwrap_or_default())
    }

    async fn save_memos(&self, date: &SessionDate, memos: Memos) -> Result<()> {
        {
            let mut cache = self.lock_cache();
            let session = cache
                .sessions
                .entry(date.clone())
                .or_insert_with(|| Session::new(date.clone()));
            session.set_memos(memos.clone());
        }

        let transport = self.transport.clone();
        let day = date.clone();
        let operation: Operation = Box::new(move || {
            let transport = transport.clone();
            let day = day.clone();
            let memos = memos.clone();
            Box::pin(async move { merge_memos(&transport, &day, &memos).await })
        });

        self.execute_write(format!("save memos {}", date), operation)
            .await
    }
}

/// Build an import body for [`RemoteStorageAdapter::import_data`] from local records.
pub fn export_payload(sessions: &[Session], spreads: &[SpreadRecord]) -> Result<Value> {
    let sessions = sessions
        .iter()
        .map(|session| serde_json::to_value(SessionPayload::new(session)))
        .collect::<serde_json::Result<Vec<_>>>()?;

    Ok(json!({
        "dailySessions": sessions,
        "spreadReadings": spreads,
    }))
}
