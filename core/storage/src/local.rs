//! Local storage adapter over an on-device key-value store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::kv::KeyValueStore;
use crate::provider::{ensure_same_date, StorageProvider};
use tarotsync_common::{Memos, Result, Session, SessionDate, SpreadRecord};

/// Key prefix for per-day session records.
const SESSION_KEY_PREFIX: &str = "daily_tarot_";
/// Key of the sorted list of dates that have a saved session.
const SESSION_INDEX_KEY: &str = "daily_tarot_index";
/// Key of the saved spread list.
const SPREADS_KEY: &str = "saved_spreads";

/// Storage provider used while the app is signed out.
///
/// Sessions are stored one record per day plus a date index so the full
/// corpus can be enumerated for migration. Spreads are stored as one list.
pub struct LocalAdapter<K: KeyValueStore> {
    store: K,
    /// Serializes read-modify-write cycles on the index and spread list.
    write_lock: Mutex<()>,
}

impl<K: KeyValueStore> LocalAdapter<K> {
    /// Create a new local adapter over `store`.
    pub fn new(store: K) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &K {
        &self.store
    }

    fn session_key(date: &SessionDate) -> String {
        format!("{}{}", SESSION_KEY_PREFIX, date)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw).await
    }

    async fn read_index(&self) -> Result<BTreeSet<SessionDate>> {
        Ok(self.read_json(SESSION_INDEX_KEY).await?.unwrap_or_default())
    }

    async fn read_spreads(&self) -> Result<Vec<SpreadRecord>> {
        Ok(self.read_json(SPREADS_KEY).await?.unwrap_or_default())
    }

    /// Persist a session. Caller must hold `write_lock`.
    async fn write_session(&self, mut session: Session) -> Result<()> {
        session.saved_at = Some(Utc::now());
        self.write_json(&Self::session_key(&session.date), &session)
            .await?;

        let mut index = self.read_index().await?;
        if index.insert(session.date.clone()) {
            self.write_json(SESSION_INDEX_KEY, &index).await?;
        }

        debug!("Saved local session {}", session.date);
        Ok(())
    }
}

#[async_trait]
impl<K: KeyValueStore> StorageProvider for LocalAdapter<K> {
    fn name(&self) -> &str {
        "local"
    }

    async fn get_session(&self, date: &SessionDate) -> Result<Option<Session>> {
        self.read_json(&Self::session_key(date)).await
    }

    async fn save_session(&self, date: &SessionDate, session: Session) -> Result<()> {
        ensure_same_date(date, &session)?;
        let _guard = self.write_lock.lock().await;
        self.write_session(session).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let index = self.read_index().await?;
        let mut sessions = Vec::with_capacity(index.len());

        for date in index {
            match self.get_session(&date).await? {
                Some(session) => sessions.push(session),
                None => warn!("Session index lists {} but no record exists", date),
            }
        }

        Ok(sessions)
    }

    async fn get_spreads(&self) -> Result<Vec<SpreadRecord>> {
        self.read_spreads().await
    }

    async fn save_spread(&self, spread: SpreadRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut spreads = self.read_spreads().await?;

        match spreads.iter_mut().find(|s| s.id == spread.id) {
            Some(existing) => *existing = spread,
            None => spreads.push(spread),
        }

        self.write_json(SPREADS_KEY, &spreads).await
    }

    async fn delete_spread(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut spreads = self.read_spreads().await?;
        let before = spreads.len();
        spreads.retain(|s| s.id != id);

        if spreads.len() != before {
            self.write_json(SPREADS_KEY, &spreads).await?;
        }
        Ok(())
    }

    async fn get_memos(&self, date: &SessionDate) -> Result<Memos> {
        Ok(self
            .get_session(date)
            .await?
            .map(|session| session.memos)
            .unwrap_or_default())
    }

    async fn save_memos(&self, date: &SessionDate, memos: Memos) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .get_session(date)
            .await?
            .unwrap_or_else(|| Session::new(date.clone()));
        session.set_memos(memos);
        self.write_session(session).await
    }
}
