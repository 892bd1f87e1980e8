//! Authentication state shared between the token authority and its observers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Lifetime assumed when the server reports an unreadable `expiresIn`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Access/refresh token pair with expiration tracking.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    access_token: String,
    refresh_token: String,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl Credentials {
    /// Create credentials expiring at an absolute time.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Create credentials from a server-reported lifetime such as `"7d"`.
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: &str,
    ) -> Self {
        let now = Utc::now();
        let expires_at = parse_expires_in(expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_LIFETIME_SECS));
        Self::new(access_token, refresh_token, expires_at)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Moment at which a proactive refresh should happen.
    pub fn refresh_deadline(&self, margin: Duration) -> DateTime<Utc> {
        self.expires_at
            .checked_sub_signed(margin)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Check if the access token is expired or within `margin` of expiring.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        self.refresh_deadline(margin) <= Utc::now()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Parse a lifetime like `"15m"`, `"7d"`, `"3600s"` or `"3600"`.
///
/// Returns `None` for unknown units and for amounts too large to represent.
pub fn parse_expires_in(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount.parse().ok()?;

    match unit.trim() {
        "" | "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => None,
    }
}

/// Account information returned by the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub subscription_status: Option<String>,
    #[serde(default)]
    pub trial_end_date: Option<String>,
}

/// Whether the app is currently signed in, and with what.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    LoggedOut,
    Authenticated {
        credentials: Credentials,
        user: UserInfo,
    },
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            AuthState::Authenticated { credentials, .. } => Some(credentials),
            AuthState::LoggedOut => None,
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials().map(Credentials::access_token)
    }

    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            AuthState::Authenticated { user, .. } => Some(user),
            AuthState::LoggedOut => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserInfo {
        UserInfo {
            id: "u1".to_string(),
            email: "reader@example.com".to_string(),
            name: None,
            language: Some("ko".to_string()),
            timezone: None,
            subscription_status: None,
            trial_end_date: None,
        }
    }

    #[test]
    fn test_parse_expires_in() {
        assert_eq!(parse_expires_in("7d"), Some(Duration::days(7)));
        assert_eq!(parse_expires_in("15m"), Some(Duration::minutes(15)));
        assert_eq!(parse_expires_in("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_expires_in("3600s"), Some(Duration::seconds(3600)));
        assert_eq!(parse_expires_in("3600"), Some(Duration::seconds(3600)));
        assert_eq!(parse_expires_in("soon"), None);
        assert_eq!(parse_expires_in("5w"), None);
    }

    #[test]
    fn test_unparseable_lifetime_defaults_to_an_hour() {
        let creds = Credentials::from_expires_in("a", "r", "whenever");
        let remaining = creds.expires_at() - Utc::now();
        assert!(remaining > Duration::minutes(59));
        assert!(remaining <= Duration::hours(1));
    }

    #[test]
    fn test_oversized_lifetime_falls_back_to_default() {
        assert_eq!(parse_expires_in("99999999999999999d"), None);

        let creds = Credentials::from_expires_in("a", "r", "100000000d");
        let remaining = creds.expires_at() - Utc::now();
        assert!(remaining > Duration::minutes(59));
        assert!(remaining <= Duration::hours(1));

        let creds = Credentials::from_expires_in("a", "r", "9223372036854775807");
        assert!(creds.expires_at() - Utc::now() <= Duration::hours(1));
    }

    #[test]
    fn test_needs_refresh_within_margin() {
        let margin = Duration::minutes(5);
        let soon = Credentials::new("a", "r", Utc::now() + Duration::minutes(4));
        assert!(soon.needs_refresh(margin));

        let later = Credentials::new("a", "r", Utc::now() + Duration::hours(1));
        assert!(!later.needs_refresh(margin));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let creds = Credentials::new("secret-access", "secret-refresh", Utc::now());
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret-access"));
        assert!(!rendered.contains("secret-refresh"));
    }

    #[test]
    fn test_auth_state_accessors() {
        assert!(!AuthState::LoggedOut.is_authenticated());
        assert_eq!(AuthState::default(), AuthState::LoggedOut);

        let state = AuthState::Authenticated {
            credentials: Credentials::new("a", "r", Utc::now()),
            user: user(),
        };
        assert!(state.is_authenticated());
        assert_eq!(state.access_token(), Some("a"));
        assert_eq!(state.user().map(|u| u.id.as_str()), Some("u1"));
    }
}
