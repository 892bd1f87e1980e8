//! JSON shapes exchanged with the remote API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tarotsync_common::types::null_as_default;
use tarotsync_common::{Credentials, Memos, Session, SessionDate, SpreadRecord, UserInfo, HOURS_PER_DAY};

/// Token pair as returned by the auth endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<String>,
}

impl AuthTokens {
    pub fn into_credentials(self) -> Credentials {
        let expires_in = self.expires_in.as_deref().unwrap_or("");
        Credentials::from_expires_in(&self.access_token, &self.refresh_token, expires_in)
    }
}

/// Response of `/auth/login` and `/auth/register`.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub user: Option<UserInfo>,
    #[serde(default)]
    pub tokens: Option<AuthTokens>,
}

/// Response of `/auth/refresh-token`.
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub tokens: AuthTokens,
}

/// Response of `/auth/me`.
#[derive(Debug, Deserialize)]
pub struct MeResponse {
    pub user: UserInfo,
}

/// Registration request body.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub language: String,
    pub timezone: String,
}

impl RegisterRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            name: None,
            language: "ko".to_string(),
            timezone: "Asia/Seoul".to_string(),
        }
    }
}

/// Session body for `POST`/`PUT /daily-sessions`.
#[derive(Debug, Serialize)]
pub struct SessionPayload<'a> {
    date: &'a SessionDate,
    cards: Vec<serde_json::Value>,
    memos: &'a Memos,
    insights: &'a str,
    duration: usize,
}

impl<'a> SessionPayload<'a> {
    pub fn new(session: &'a Session) -> Self {
        let mut cards = session.cards.clone();
        cards.resize(HOURS_PER_DAY, serde_json::Value::Null);

        Self {
            date: &session.date,
            cards,
            memos: &session.memos,
            insights: &session.insights,
            duration: HOURS_PER_DAY,
        }
    }
}

/// Session as the server describes it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    #[serde(default)]
    id: Option<String>,
    date: SessionDate,
    #[serde(default, deserialize_with = "null_as_default")]
    cards: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    memos: Memos,
    #[serde(default, deserialize_with = "null_as_default")]
    insights: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    /// `false` when the server answers with an empty placeholder.
    #[serde(default)]
    exists: Option<bool>,
}

impl From<RemoteSession> for Session {
    fn from(remote: RemoteSession) -> Self {
        Session {
            id: remote.id,
            date: remote.date,
            cards: remote.cards,
            memos: remote.memos,
            insights: remote.insights,
            saved_at: remote.updated_at.or(remote.created_at),
        }
    }
}

/// Decode the body of `GET /daily-sessions/:date`.
///
/// The server answers a missing day either with `exists: false` and empty
/// slots, or with `{"session": null}`.
pub fn decode_session(value: serde_json::Value) -> serde_json::Result<Option<Session>> {
    let value = match value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Object(mut map) if map.contains_key("session") => {
            map.remove("session").unwrap_or(serde_json::Value::Null)
        }
        other => other,
    };

    if value.is_null() {
        return Ok(None);
    }

    let remote: RemoteSession = serde_json::from_value(value)?;
    if remote.exists == Some(false) {
        return Ok(None);
    }
    Ok(Some(remote.into()))
}

/// Response of `POST /daily-sessions`.
#[derive(Debug, Deserialize)]
pub struct SaveSessionResponse {
    #[serde(default)]
    pub session: Option<RemoteSession>,
}

/// Response of `GET /daily-sessions`.
#[derive(Debug, Deserialize)]
pub struct SessionListResponse {
    #[serde(default)]
    pub sessions: Vec<RemoteSession>,
}

/// Response of `GET /spreads`.
#[derive(Debug, Deserialize)]
pub struct SpreadListResponse {
    #[serde(default)]
    pub spreads: Vec<SpreadRecord>,
}

/// Response of `POST /spreads`.
#[derive(Debug, Deserialize)]
pub struct SaveSpreadResponse {
    #[serde(default)]
    pub spread: Option<SpreadRecord>,
}

/// Error body the server attaches to non-success responses.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
