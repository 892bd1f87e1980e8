//! Domain records exchanged between the storage backends.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Number of hourly card slots in a daily session.
pub const HOURS_PER_DAY: usize = 24;

/// Memos attached to a daily session, keyed by hour (0-23).
pub type Memos = BTreeMap<u8, String>;

/// Deserialize a field that the server may send as `null`.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Calendar date identifying a daily session, always `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionDate(String);

impl SessionDate {
    /// Parse a session date.
    ///
    /// # Errors
    /// - Returns error unless `date` is a real calendar date in `YYYY-MM-DD` form
    pub fn parse(date: &str) -> crate::Result<Self> {
        let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|e| {
            crate::Error::InvalidInput(format!("Invalid session date '{}': {}", date, e))
        })?;

        // chrono accepts unpadded fields; the server does not
        let canonical = parsed.format("%Y-%m-%d").to_string();
        if canonical != date {
            return Err(crate::Error::InvalidInput(format!(
                "Session date must be zero-padded YYYY-MM-DD, got '{}'",
                date
            )));
        }

        Ok(Self(canonical))
    }

    /// Session date for a calendar day.
    pub fn from_naive(date: NaiveDate) -> Self {
        Self(date.format("%Y-%m-%d").to_string())
    }

    /// Today's date in UTC.
    pub fn today() -> Self {
        Self::from_naive(Utc::now().date_naive())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionDate {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<SessionDate> for String {
    fn from(date: SessionDate) -> Self {
        date.0
    }
}

impl fmt::Display for SessionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One day's tarot draw.
///
/// The sync layer treats `cards` as opaque; only `date` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Server-assigned identifier, absent until the session reaches the server.
    #[serde(default)]
    pub id: Option<String>,
    /// Identity key.
    pub date: SessionDate,
    /// One slot per hour; `null` for hours without a drawn card.
    #[serde(default, deserialize_with = "null_as_default")]
    pub cards: Vec<serde_json::Value>,
    /// Free-form notes per hour.
    #[serde(default, deserialize_with = "null_as_default")]
    pub memos: Memos,
    #[serde(default, deserialize_with = "null_as_default")]
    pub insights: String,
    /// When the session was last saved.
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create an empty session with all hourly slots unset.
    pub fn new(date: SessionDate) -> Self {
        Self {
            id: None,
            date,
            cards: vec![serde_json::Value::Null; HOURS_PER_DAY],
            memos: Memos::new(),
            insights: String::new(),
            saved_at: None,
        }
    }

    /// Pad or truncate `cards` to exactly one slot per hour.
    pub fn normalize_cards(&mut self) {
        self.cards.resize(HOURS_PER_DAY, serde_json::Value::Null);
    }

    /// Replace the memo map, dropping hours outside the day.
    pub fn set_memos(&mut self, memos: Memos) {
        self.memos = memos
            .into_iter()
            .filter(|(hour, _)| (*hour as usize) < HOURS_PER_DAY)
            .collect();
    }
}

/// A saved multi-card spread reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadRecord {
    /// Identity key.
    pub id: String,
    pub title: String,
    pub spread_type: String,
    #[serde(default)]
    pub spread_name: Option<String>,
    #[serde(default)]
    pub spread_name_en: Option<String>,
    /// Card placed at each position; opaque to the sync layer.
    #[serde(default, deserialize_with = "null_as_default")]
    pub positions: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub insights: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
}

impl SpreadRecord {
    /// Create a spread with a freshly generated id.
    pub fn new(title: impl Into<String>, spread_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            spread_type: spread_type.into(),
            spread_name: None,
            spread_name_en: None,
            positions: Vec::new(),
            insights: String::new(),
            created_at: Utc::now(),
            tags: Vec::new(),
        }
    }
}
