//! Storage provider trait definition.

use async_trait::async_trait;

use tarotsync_common::{Memos, Result, Session, SessionDate, SpreadRecord};

/// Backend-agnostic storage contract used by the application.
///
/// The local adapter, the remote adapter and the router all implement it
/// with identical semantics, so call sites never change when the backend
/// behind them does.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g., "local", "remote", "router").
    fn name(&self) -> &str;

    /// Get the session saved for `date`.
    ///
    /// # Returns
    /// `None` if nothing has been saved for that day.
    async fn get_session(&self, date: &SessionDate) -> Result<Option<Session>>;

    /// Insert or replace the session for `date`.
    ///
    /// # Preconditions
    /// - `session.date` must equal `date`
    ///
    /// # Errors
    /// - `InvalidInput` if the dates disagree
    async fn save_session(&self, date: &SessionDate, session: Session) -> Result<()>;

    /// List every saved session.
    async fn list_sessions(&self) -> Result<Vec<Session>>;

    /// List every saved spread.
    async fn get_spreads(&self) -> Result<Vec<SpreadRecord>>;

    /// Insert or replace a spread, keyed by its id.
    async fn save_spread(&self, spread: SpreadRecord) -> Result<()>;

    /// Delete a spread. Deleting a missing spread is not an error.
    async fn delete_spread(&self, id: &str) -> Result<()>;

    /// Get the hourly memos for `date` (empty if no session exists).
    async fn get_memos(&self, date: &SessionDate) -> Result<Memos>;

    /// Replace the hourly memos for `date`, creating the session if needed.
    async fn save_memos(&self, date: &SessionDate, memos: Memos) -> Result<()>;
}

/// Reject a save whose payload date differs from its key.
pub(crate) fn ensure_same_date(date: &SessionDate, session: &Session) -> Result<()> {
    if &session.date != date {
        return Err(tarotsync_common::Error::InvalidInput(format!(
            "Session dated {} cannot be saved under {}",
            session.date, date
        )));
    }
    Ok(())
}
