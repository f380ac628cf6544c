//! Core domain model for the daily hot-list pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "dailyhot-core";

/// Raw timestamps above this value are treated as milliseconds.
pub const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// 2100-01-01T00:00:00Z in milliseconds; the upper bound for any raw timestamp.
pub const MAX_RAW_TIMESTAMP: i64 = 4_102_444_800_000;

/// Longest `last_error` kept on a row.
pub const MAX_ERROR_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    #[error("timestamp {0} is outside 1970..2100")]
    OutOfRange(i64),
    #[error("timestamp {0:?} is not an integer")]
    Malformed(String),
    #[error("timestamp {0} cannot be represented")]
    Unrepresentable(i64),
}

/// Convert an upstream numeric timestamp (seconds or milliseconds) into UTC.
pub fn publish_time_from_raw(raw: i64) -> Result<DateTime<Utc>, TimestampError> {
    if !(0..=MAX_RAW_TIMESTAMP).contains(&raw) {
        return Err(TimestampError::OutOfRange(raw));
    }
    let parsed = if raw > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(raw)
    } else {
        DateTime::from_timestamp(raw, 0)
    };
    parsed.ok_or(TimestampError::Unrepresentable(raw))
}

/// Timestamp exactly as the listing API sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn as_integer(&self) -> Result<i64, TimestampError> {
        match self {
            Self::Integer(v) => Ok(*v),
            Self::Float(v) if v.is_finite() && *v >= i64::MIN as f64 && *v <= i64::MAX as f64 => {
                Ok(v.trunc() as i64)
            }
            Self::Float(v) => Err(TimestampError::Malformed(v.to_string())),
            Self::Text(text) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| TimestampError::Malformed(text.clone())),
        }
    }

    pub fn to_publish_time(&self) -> Result<DateTime<Utc>, TimestampError> {
        publish_time_from_raw(self.as_integer()?)
    }

    /// Empty strings and zero are how the API says "no timestamp".
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Integer(v) => *v == 0,
            Self::Float(v) => *v == 0.0,
            Self::Text(text) => text.trim().is_empty(),
        }
    }
}

/// A category route advertised by the listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub path: String,
}

/// One entry of a category listing, before it is mapped onto a stored row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub hot: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mobile_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
}

/// Accept numbers and numeric strings; anything else is treated as absent.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Some(JsonValue::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// A fetched category listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HotList {
    pub title: Option<String>,
    pub kind: Option<String>,
    pub update_time: Option<String>,
    pub items: Vec<RawItem>,
}

/// Retry bookkeeping for enrichment, one per row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub fail_count: u32,
    pub last_error: Option<String>,
    pub skip: bool,
}

impl RetryState {
    pub fn record_failure(&mut self, descriptor: impl AsRef<str>) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_error = Some(truncate_error(descriptor.as_ref()));
    }

    pub fn clear(&mut self) {
        self.fail_count = 0;
        self.last_error = None;
    }

    pub fn is_exhausted(&self, max_failures: u32) -> bool {
        self.fail_count >= max_failures
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn truncate_error(message: &str) -> String {
    let message = message.trim();
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

/// Latest known state of a trending entry; unique per (category, title).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotItem {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub hot_score: Option<i64>,
    pub url: Option<String>,
    pub mobile_url: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    pub ai_summary: Option<String>,
    pub ai_tags: Option<Vec<String>>,
    pub last_summarized_at: Option<DateTime<Utc>>,
    pub retry: RetryState,
}

impl HotItem {
    /// Selection predicate for the enrichment pass.
    pub fn is_pending_enrichment(&self) -> bool {
        self.last_summarized_at.is_none() && self.url.as_deref().is_some_and(|u| !u.is_empty())
    }

    pub fn is_enriched(&self) -> bool {
        self.ai_summary.is_some() && self.ai_tags.is_some()
    }

    /// Ready for the digest reader: every ranking and enrichment field is present.
    pub fn is_digest_ready(&self) -> bool {
        self.is_enriched() && self.hot_score.is_some() && self.publish_time.is_some()
    }

    /// Usable url for the enricher, if any.
    pub fn enrichment_url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn cursor(&self) -> PageCursor {
        PageCursor {
            collected_at: self.collected_at,
            id: self.id,
        }
    }
}

/// Keyset position for paging eligible rows newest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub collected_at: DateTime<Utc>,
    pub id: i64,
}

impl PageCursor {
    /// True when `item` sorts strictly after this cursor in (collected_at DESC, id DESC) order.
    pub fn admits(&self, item: &HotItem) -> bool {
        (item.collected_at, item.id) < (self.collected_at, self.id)
    }
}

/// Payload returned by a summarization service, not yet validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// A validated enrichment result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub tags: Vec<String>,
}

impl AnalysisResponse {
    pub fn into_analysis(self) -> Option<Analysis> {
        let summary = self.summary?.trim().to_string();
        if summary.is_empty() {
            return None;
        }
        let tags = self
            .tags?
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>();
        if tags.is_empty() {
            return None;
        }
        Some(Analysis { summary, tags })
    }
}
