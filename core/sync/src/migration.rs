//! One-shot push of the local corpus to the server after sign-in.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use tarotsync_common::{Error, MigrationFailure, Result};
use tarotsync_storage::{RemoteStorageAdapter, StorageProvider};

/// Outcome of a migration pass.
///
/// Failed records are reported, never retried; the router enters the
/// cloud phase regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated_sessions: usize,
    pub migrated_spreads: usize,
    pub failures: Vec<MigrationFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl MigrationReport {
    fn started() -> Self {
        let now = Utc::now();
        Self {
            migrated_sessions: 0,
            migrated_spreads: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn migrated(&self) -> usize {
        self.migrated_sessions + self.migrated_spreads
    }

    /// Turn recorded failures into an error.
    ///
    /// # Errors
    /// - `MigrationPartialFailure` listing every record that failed
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(Error::MigrationPartialFailure(self.failures))
        }
    }

    fn record_failure(&mut self, kind: &'static str, key: impl Into<String>, error: &Error) {
        let key = key.into();
        warn!("Failed to migrate {} {}: {}", kind, key, error);
        self.failures.push(MigrationFailure {
            kind,
            key,
            reason: error.to_string(),
        });
    }
}

/// Push every local spread, then every local session, to the server.
///
/// Records are pushed one at a time, directly rather than through the
/// offline queue. Local data is left in place.
pub async fn migrate_local_data(
    local: &dyn StorageProvider,
    remote: &RemoteStorageAdapter,
) -> MigrationReport {
    let mut report = MigrationReport::started();
    info!("Migrating local data to the server");

    match local.get_spreads().await {
        Ok(spreads) => {
            for spread in &spreads {
                match remote.push_spread(spread).await {
                    Ok(()) => report.migrated_spreads += 1,
                    Err(e) => report.record_failure("spread", spread.id.as_str(), &e),
                }
            }
        }
        Err(e) => report.record_failure("spread", "*", &e),
    }

    match local.list_sessions().await {
        Ok(sessions) => {
            for session in &sessions {
                match remote.push_session(session).await {
                    Ok(()) => report.migrated_sessions += 1,
                    Err(e) => report.record_failure("session", session.date.as_str(), &e),
                }
            }
        }
        Err(e) => report.record_failure("session", "*", &e),
    }

    report.finished_at = Utc::now();
    info!(
        "Migration finished: {} spread(s), {} session(s), {} failure(s)",
        report.migrated_spreads,
        report.migrated_sessions,
        report.failures.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tarotsync_common::{Session, SessionDate, SpreadRecord};
    use tarotsync_storage::test_support::{test_config, FakeServer};
    use tarotsync_storage::{LocalAdapter, MemoryStore, TokenAuthority, TransportClient};

    async fn remote(server: &Arc<FakeServer>) -> RemoteStorageAdapter {
        let authority = TokenAuthority::new(test_config(), server.clone()).unwrap();
        authority.login("reader@example.com", "secret").await.unwrap();
        RemoteStorageAdapter::new(Arc::new(TransportClient::new(authority)))
    }

    #[tokio::test]
    async fn test_migrates_spreads_and_sessions() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let remote = remote(&server).await;
        let local = LocalAdapter::new(MemoryStore::new());
        local.save_spread(SpreadRecord::new("Past", "three-card")).await.unwrap();
        let day = SessionDate::parse("2025-01-05").unwrap();
        local.save_session(&day, Session::new(day.clone())).await.unwrap();

        let report = migrate_local_data(&local, &remote).await;

        assert!(report.is_complete());
        assert_eq!(report.migrated_spreads, 1);
        assert_eq!(report.migrated_sessions, 1);
        assert_eq!(server.spreads().len(), 1);
        assert!(server.session("2025-01-05").is_some());
        assert_eq!(local.get_spreads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_fatal() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let remote = remote(&server).await;
        let local = LocalAdapter::new(MemoryStore::new());
        let doomed = SpreadRecord::new("Doomed", "one-card");
        local.save_spread(doomed.clone()).await.unwrap();
        local.save_spread(SpreadRecord::new("Fine", "one-card")).await.unwrap();
        server.fail_next("POST", "/spreads", 500);

        let report = migrate_local_data(&local, &remote).await;

        assert_eq!(report.migrated_spreads, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, "spread");
        assert_eq!(report.failures[0].key, doomed.id);
        assert!(matches!(
            report.into_result(),
            Err(Error::MigrationPartialFailure(failures)) if failures.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_empty_corpus() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let remote = remote(&server).await;
        let local = LocalAdapter::new(MemoryStore::new());

        let report = migrate_local_data(&local, &remote).await;

        assert_eq!(report.migrated(), 0);
        assert!(report.into_result().is_ok());
    }
}
