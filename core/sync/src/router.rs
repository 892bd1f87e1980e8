//! Storage router: one `StorageProvider` that follows the sign-in state.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock, Weak};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tarotsync_common::{AuthState, Memos, Result, Session, SessionDate, SpreadRecord};
use tarotsync_storage::{RemoteStorageAdapter, StorageProvider};

use crate::migration::{migrate_local_data, MigrationReport};
use crate::state::{RouterPhase, RouterStatus};

/// Restores the published phase if a migration is cancelled midway.
struct MigratingGuard<'a> {
    phase: &'a StdRwLock<RouterPhase>,
    finished: bool,
}

impl Drop for MigratingGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            write_phase(self.phase, RouterPhase::Local);
        }
    }
}

fn write_phase(phase: &StdRwLock<RouterPhase>, value: RouterPhase) {
    match phase.write() {
        Ok(mut phase) => *phase = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

/// Delegates every storage call to the local or remote backend.
///
/// The backend is chosen from the router's phase, which only changes in
/// [`StorageRouter::update_auth_state`]. A transition holds the phase lock
/// for writing from start to finish, so concurrent transitions run one
/// after another and storage calls issued mid-migration wait for it.
pub struct StorageRouter {
    local: Arc<dyn StorageProvider>,
    remote: Arc<RemoteStorageAdapter>,
    /// Settled phase (`Local` or `Cloud`); write-locked during transitions.
    backend: RwLock<RouterPhase>,
    /// Published phase, including `Migrating`.
    published: StdRwLock<RouterPhase>,
    last_migration: Mutex<Option<MigrationReport>>,
}

impl StorageRouter {
    /// Create a router in the local phase.
    pub fn new(local: Arc<dyn StorageProvider>, remote: Arc<RemoteStorageAdapter>) -> Self {
        Self {
            local,
            remote,
            backend: RwLock::new(RouterPhase::Local),
            published: StdRwLock::new(RouterPhase::Local),
            last_migration: Mutex::new(None),
        }
    }

    pub fn remote(&self) -> &Arc<RemoteStorageAdapter> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<dyn StorageProvider> {
        &self.local
    }

    pub fn phase(&self) -> RouterPhase {
        match self.published.read() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> RouterStatus {
        let phase = self.phase();
        RouterStatus {
            phase,
            is_authenticated: phase.is_authenticated(),
            is_online: self.remote.is_online(),
            queue_size: self.remote.queue_size(),
        }
    }

    /// Report of the most recent migration, if any ran.
    pub fn last_migration(&self) -> Option<MigrationReport> {
        self.lock_last_migration().clone()
    }

    /// Follow an authentication state.
    ///
    /// # Postconditions
    /// - Signed out → signed in: local data has been pushed once and the
    ///   router delegates to the remote adapter; returns the migration report
    /// - Signed in → signed out: queued remote writes are abandoned, the read
    ///   cache is cleared and the router delegates to local storage
    /// - Otherwise nothing changes and `None` is returned
    pub async fn update_auth_state(&self, state: &AuthState) -> Option<MigrationReport> {
        let mut backend = self.backend.write().await;

        match (*backend, state.is_authenticated()) {
            (RouterPhase::Local, true) => {
                let mut guard = MigratingGuard {
                    phase: &self.published,
                    finished: false,
                };
                write_phase(&self.published, RouterPhase::Migrating);
                info!("Signed in; migrating local data before switching to cloud storage");

                let report = migrate_local_data(self.local.as_ref(), &self.remote).await;

                *backend = RouterPhase::Cloud;
                write_phase(&self.published, RouterPhase::Cloud);
                guard.finished = true;
                *self.lock_last_migration() = Some(report.clone());
                info!("Storage router now using cloud storage");
                Some(report)
            }
            (RouterPhase::Cloud, false) => {
                self.remote.clear_offline_queue();
                self.remote.clear_cache();
                *backend = RouterPhase::Local;
                write_phase(&self.published, RouterPhase::Local);
                info!("Signed out; storage router now using local storage");
                None
            }
            (phase, authenticated) => {
                debug!(
                    "No storage transition needed (phase: {}, authenticated: {})",
                    phase, authenticated
                );
                None
            }
        }
    }

    /// Enter the cloud phase for a restored session without migrating.
    ///
    /// For sessions whose local data was already pushed when they first
    /// signed in. Returns `false` if `state` is signed out or the router is
    /// already in the cloud phase.
    pub async fn resume_session(&self, state: &AuthState) -> bool {
        let mut backend = self.backend.write().await;
        if !state.is_authenticated() || *backend == RouterPhase::Cloud {
            return false;
        }

        *backend = RouterPhase::Cloud;
        write_phase(&self.published, RouterPhase::Cloud);
        info!("Resumed session; storage router now using cloud storage");
        true
    }

    /// Apply every state published on `states`, starting with the current one.
    pub fn spawn_auth_listener(
        self: &Arc<Self>,
        mut states: watch::Receiver<AuthState>,
    ) -> JoinHandle<()> {
        let router: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let state = states.borrow_and_update().clone();
                let Some(strong) = router.upgrade() else {
                    return;
                };
                strong.update_auth_state(&state).await;
                drop(strong);

                if states.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Replay queued remote writes. Nothing to do while signed out.
    pub async fn sync_offline_data(&self) -> Result<usize> {
        let backend = self.backend.read().await;
        match *backend {
            RouterPhase::Cloud => self.remote.sync_offline_data().await,
            _ => Ok(0),
        }
    }

    /// Backend for the current phase, waiting out any running transition.
    async fn current(&self) -> Arc<dyn StorageProvider> {
        let backend = self.backend.read().await;
        match *backend {
            RouterPhase::Cloud => self.remote.clone() as Arc<dyn StorageProvider>,
            _ => self.local.clone(),
        }
    }

    fn lock_last_migration(&self) -> MutexGuard<'_, Option<MigrationReport>> {
        match self.last_migration.lock() {
            Ok(report) => report,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl StorageProvider for StorageRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn get_session(&self, date: &SessionDate) -> Result<Option<Session>> {
        self.current().await.get_session(date).await
    }

    async fn save_session(&self, date: &SessionDate, session: Session) -> Result<()> {
        self.current().await.save_session(date, session).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.current().await.list_sessions().await
    }

    async fn get_spreads(&self) -> Result<Vec<SpreadRecord>> {
        self.current().await.get_spreads().await
    }

    async fn save_spread(&self, spread: SpreadRecord) -> Result<()> {
        self.current().await.save_spread(spread).await
    }

    async fn delete_spread(&self, id: &str) -> Result<()> {
        self.current().await.delete_spread(id).await
    }

    async fn get_memos(&self, date: &SessionDate) -> Result<Memos> {
        self.current().await.get_memos(date).await
    }

    async fn save_memos(&self, date: &SessionDate, memos: Memos) -> Result<()> {
        self.current().await.save_memos(date, memos).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tarotsync_common::Error;
    use tarotsync_storage::test_support::{test_config, FakeServer};
    use tarotsync_storage::{LocalAdapter, MemoryStore, TokenAuthority, TransportClient};

    struct Harness {
        server: Arc<FakeServer>,
        authority: Arc<TokenAuthority>,
        local: Arc<LocalAdapter<MemoryStore>>,
        router: Arc<StorageRouter>,
    }

    fn harness() -> Harness {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = TokenAuthority::new(test_config(), server.clone()).unwrap();
        let transport = Arc::new(TransportClient::new(authority.clone()));
        let remote = Arc::new(RemoteStorageAdapter::new(transport));
        let local = Arc::new(LocalAdapter::new(MemoryStore::new()));
        let router = Arc::new(StorageRouter::new(local.clone(), remote));

        Harness {
            server,
            authority,
            local,
            router,
        }
    }

    impl Harness {
        async fn login(&self) -> Option<MigrationReport> {
            self.authority
                .login("reader@example.com", "secret")
                .await
                .unwrap();
            self.router
                .update_auth_state(&self.authority.auth_state())
                .await
        }
    }

    fn date(s: &str) -> SessionDate {
        SessionDate::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_signed_out_calls_stay_local() {
        let h = harness();

        h.router
            .save_spread(SpreadRecord::new("Local", "one-card"))
            .await
            .unwrap();
        let day = date("2025-05-01");
        h.router
            .save_memos(&day, Memos::from([(1, "note".to_string())]))
            .await
            .unwrap();

        assert_eq!(h.local.get_spreads().await.unwrap().len(), 1);
        assert_eq!(h.router.get_memos(&day).await.unwrap().len(), 1);
        assert!(h.server.calls().is_empty());
        assert_eq!(h.router.phase(), RouterPhase::Local);
    }

    #[tokio::test]
    async fn test_login_migrates_then_routes_to_cloud() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Before login", "three-card"))
            .await
            .unwrap();
        let day = date("2025-05-02");
        h.router
            .save_session(&day, Session::new(day.clone()))
            .await
            .unwrap();

        let report = h.login().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.migrated_spreads, 1);
        assert_eq!(report.migrated_sessions, 1);
        assert_eq!(h.router.phase(), RouterPhase::Cloud);
        assert_eq!(h.router.last_migration(), Some(report));

        h.router
            .save_spread(SpreadRecord::new("After login", "one-card"))
            .await
            .unwrap();
        assert_eq!(h.server.spreads().len(), 2);
        assert_eq!(h.local.get_spreads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_transitions_migrate_once() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Once", "one-card"))
            .await
            .unwrap();
        h.authority
            .login("reader@example.com", "secret")
            .await
            .unwrap();
        h.server.set_latency(Duration::from_millis(20));
        let state = h.authority.auth_state();

        let (first, second) = tokio::join!(
            h.router.update_auth_state(&state),
            h.router.update_auth_state(&state)
        );

        assert_eq!(first.is_some() as u8 + second.is_some() as u8, 1);
        assert_eq!(h.server.count_calls("POST", "/spreads"), 1);
    }

    #[tokio::test]
    async fn test_calls_during_migration_wait_and_go_to_cloud() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Old", "one-card"))
            .await
            .unwrap();
        h.authority
            .login("reader@example.com", "secret")
            .await
            .unwrap();
        h.server.set_latency(Duration::from_millis(50));

        let transition = tokio::spawn({
            let router = h.router.clone();
            let state = h.authority.auth_state();
            async move { router.update_auth_state(&state).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.router.phase(), RouterPhase::Migrating);

        h.router
            .save_spread(SpreadRecord::new("New", "one-card"))
            .await
            .unwrap();

        assert!(transition.await.unwrap().is_some());
        let titles: Vec<_> = h
            .server
            .spreads()
            .iter()
            .map(|s| s["title"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(titles, vec!["Old", "New"]);
        assert_eq!(h.local.get_spreads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_refresh_does_not_remigrate() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Once", "one-card"))
            .await
            .unwrap();
        h.login().await.unwrap();

        h.authority.refresh().await.unwrap();
        let again = h
            .router
            .update_auth_state(&h.authority.auth_state())
            .await;

        assert!(again.is_none());
        assert_eq!(h.server.count_calls("POST", "/spreads"), 1);
    }

    #[tokio::test]
    async fn test_logout_reverts_to_local_without_data_loss() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Mine", "one-card"))
            .await
            .unwrap();
        h.login().await.unwrap();
        h.router.remote().set_online(false);

        let queued = tokio::spawn({
            let router = h.router.clone();
            async move { router.save_spread(SpreadRecord::new("Queued", "one-card")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(h.router.status().queue_size, 1);

        h.authority.logout().await;
        assert!(h
            .router
            .update_auth_state(&h.authority.auth_state())
            .await
            .is_none());

        assert!(matches!(
            queued.await.unwrap(),
            Err(Error::AuthenticationRequired(_))
        ));
        assert_eq!(h.router.phase(), RouterPhase::Local);
        assert_eq!(h.router.status().queue_size, 0);
        let spreads = h.router.get_spreads().await.unwrap();
        assert_eq!(spreads.len(), 1);
        assert_eq!(spreads[0].title, "Mine");
    }

    #[tokio::test]
    async fn test_partial_migration_still_enters_cloud() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Rejected", "one-card"))
            .await
            .unwrap();
        h.server.fail_next("POST", "/spreads", 500);

        let report = h.login().await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(h.router.phase(), RouterPhase::Cloud);
        assert!(matches!(
            h.router.last_migration().unwrap().into_result(),
            Err(Error::MigrationPartialFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_listener_follows_authority() {
        let h = harness();
        let _listener = h.router.spawn_auth_listener(h.authority.subscribe());

        h.authority
            .login("reader@example.com", "secret")
            .await
            .unwrap();
        wait_for_phase(&h.router, RouterPhase::Cloud).await;

        h.authority.logout().await;
        wait_for_phase(&h.router, RouterPhase::Local).await;
    }

    #[tokio::test]
    async fn test_resume_session_skips_migration() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Already pushed", "one-card"))
            .await
            .unwrap();
        h.authority
            .login("reader@example.com", "secret")
            .await
            .unwrap();

        assert!(h.router.resume_session(&h.authority.auth_state()).await);
        assert!(!h.router.resume_session(&h.authority.auth_state()).await);

        assert_eq!(h.router.phase(), RouterPhase::Cloud);
        assert_eq!(h.server.count_calls("POST", "/spreads"), 0);
        assert!(h.router.last_migration().is_none());
        assert!(h.router.get_spreads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_connectivity() {
        let h = harness();
        h.login().await.unwrap();
        h.router.remote().set_online(false);

        let status = h.router.status();
        assert_eq!(status.phase, RouterPhase::Cloud);
        assert!(status.is_authenticated);
        assert!(!status.is_online);
        assert!(matches!(
            h.router.sync_offline_data().await,
            Err(Error::NetworkUnavailable(_))
        ));
    }

    /// Spread saved locally, migrated on login, then offline saves of a
    /// spread and a session that drain once connectivity returns and read
    /// back from the server.
    #[tokio::test]
    async fn test_offline_round_trip_after_login() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("S1", "three-card"))
            .await
            .unwrap();

        h.login().await.unwrap();
        let titles: Vec<_> = h.server.spreads().iter().map(|s| s["title"].clone()).collect();
        assert_eq!(titles, vec![serde_json::json!("S1")]);

        h.router.remote().set_online(false);
        let pending = tokio::spawn({
            let router = h.router.clone();
            async move { router.save_spread(SpreadRecord::new("S2", "one-card")).await }
        });
        tokio::task::yield_now().await;

        let day = date("2025-06-01");
        let mut session = Session::new(day.clone());
        session.cards[9] = serde_json::json!({"name": "The Hermit"});
        session.insights = "drawn on the train".to_string();
        let pending_session = tokio::spawn({
            let router = h.router.clone();
            let day = day.clone();
            let session = session.clone();
            async move { router.save_session(&day, session).await }
        });
        tokio::task::yield_now().await;

        assert_eq!(h.router.status().queue_size, 2);
        assert_eq!(h.server.spreads().len(), 1);
        assert!(h.server.session("2025-06-01").is_none());

        h.router.remote().set_online(true);
        pending.await.unwrap().unwrap();
        pending_session.await.unwrap().unwrap();

        let spreads = h.router.get_spreads().await.unwrap();
        let titles: Vec<_> = spreads.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["S1", "S2"]);

        h.router.remote().clear_cache();
        let loaded = h.router.get_session(&day).await.unwrap().unwrap();
        assert_eq!(loaded.cards[9]["name"], "The Hermit");
        assert_eq!(loaded.insights, "drawn on the train");
        assert_eq!(h.server.session("2025-06-01").unwrap()["insights"], "drawn on the train");
    }

    #[tokio::test]
    async fn test_relogin_remigrates_spreads_already_on_server() {
        let h = harness();
        h.router
            .save_spread(SpreadRecord::new("Kept", "one-card"))
            .await
            .unwrap();
        assert!(h.login().await.unwrap().is_complete());

        h.authority.logout().await;
        h.router
            .update_auth_state(&h.authority.auth_state())
            .await;
        let report = h.login().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.migrated_spreads, 1);
        assert_eq!(h.server.spreads().len(), 1);
        let id = h.local.get_spreads().await.unwrap()[0].id.clone();
        assert_eq!(h.server.count_calls("POST", "/spreads"), 1);
        assert_eq!(h.server.count_calls("PUT", &format!("/spreads/{}", id)), 2);
    }

    async fn wait_for_phase(router: &StorageRouter, phase: RouterPhase) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while router.phase() != phase {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
