use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Discriminator carried by full-state chart frames.
pub const SNAPSHOT_TYPE: &str = "snapshot";

/// Inbound rank fields whose presence marks a ranking broadcast.
const RANK_FIELDS: [&str; 2] = ["rank_tokens_percent", "rank_clear_time_percent"];

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame matches no known shape: {0}")]
    UnknownShape(String),
}

/// Stage code that records are grouped and ranked by.
///
/// The feed emits stages both as strings (`"A1"`) and integers (`11`); both
/// decode into the same textual key so `11` and `"11"` compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(String);

impl Category {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Category {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for Category {
    fn from(code: String) -> Self {
        Self(code)
    }
}

impl From<u32> for Category {
    fn from(code: u32) -> Self {
        Self(code.to_string())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(code) => Ok(Self(code)),
            Value::Number(code) => Ok(Self(integral_code(&code))),
            other => Err(de::Error::custom(format!(
                "stage must be a string or an integer, got {}",
                other
            ))),
        }
    }
}

/// `11`, `11.0` and `"11"` must all name the same stage.
fn integral_code(code: &serde_json::Number) -> String {
    if let Some(unsigned) = code.as_u64() {
        return unsigned.to_string();
    }
    if let Some(signed) = code.as_i64() {
        return signed.to_string();
    }
    match code.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            (f as i64).to_string()
        }
        _ => code.to_string(),
    }
}

/// A participant's result for one stage. Lower score and lower duration are better.
///
/// This is the canonical wire schema shared by outbound run frames and chart rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "id")]
    pub participant_id: String,
    #[serde(rename = "stage")]
    pub category: Category,
    #[serde(rename = "tokens", default, deserialize_with = "sanitize::count_or_zero")]
    pub score: u64,
    #[serde(
        rename = "clear_time",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub duration_ms: u64,
}

impl Record {
    pub fn new(
        participant_id: impl Into<String>,
        category: impl Into<Category>,
        score: u64,
        duration_ms: u64,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            category: category.into(),
            score,
            duration_ms,
        }
    }

    /// Ordering key: score first, duration breaks ties.
    pub fn rank_key(&self) -> (u64, u64) {
        (self.score, self.duration_ms)
    }

    /// Strictly better; an equal record never displaces an existing one.
    pub fn is_better_than(&self, other: &Record) -> bool {
        self.rank_key() < other.rank_key()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received on the stream channel, decoded in fixed priority:
/// ranking broadcast, then plain acknowledgement, then rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Ranking(RankingResult),
    Ack { received_text: Option<String> },
    Rejected { reason: String },
}

impl ServerFrame {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;

        let ack = value
            .get("ack")
            .and_then(Value::as_bool)
            .ok_or_else(|| ProtocolError::UnknownShape(preview(raw)))?;

        if !ack {
            let reason = ["error", "db_error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .unwrap_or("unknown")
                .to_string();
            return Ok(ServerFrame::Rejected { reason });
        }

        if RANK_FIELDS.iter().any(|key| value.get(*key).is_some()) {
            return Ok(ServerFrame::Ranking(RankingResult::deserialize(value)?));
        }

        let received_text = value
            .get("received_text")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(ServerFrame::Ack { received_text })
    }
}

/// Server-computed placement of a submitted run within its stage.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RankingResult {
    #[serde(rename = "user_id", default)]
    pub participant_id: String,
    #[serde(rename = "stage", default)]
    pub category: Category,
    /// Top-percent placement by score.
    #[serde(
        rename = "rank_tokens_percent",
        default,
        deserialize_with = "sanitize::ratio_or_zero"
    )]
    pub score_percentile: f64,
    #[serde(
        rename = "rank_clear_time_percent",
        default,
        deserialize_with = "sanitize::ratio_or_zero"
    )]
    pub duration_percentile: f64,
    #[serde(
        rename = "rank_tokens",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub score_rank: u64,
    #[serde(
        rename = "rank_clear_time",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub duration_rank: u64,
    #[serde(default, deserialize_with = "sanitize::count_or_zero")]
    pub total_records: u64,
    #[serde(default)]
    pub received_text: Option<String>,
}

/// Frames received on the chart feed: a full replacement or one new record.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Snapshot(Vec<Record>),
    Single(Record),
}

impl FeedEvent {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;

        match value.get("type").and_then(Value::as_str) {
            Some(SNAPSHOT_TYPE) => {
                let rows = value
                    .get("rows")
                    .filter(|rows| rows.is_array())
                    .ok_or_else(|| ProtocolError::UnknownShape(preview(raw)))?;
                Ok(FeedEvent::Snapshot(Vec::<Record>::deserialize(rows)?))
            }
            Some(other) => Err(ProtocolError::UnknownShape(format!(
                "unsupported feed type {:?}",
                other
            ))),
            None if value.is_object() => Ok(FeedEvent::Single(Record::deserialize(value)?)),
            None => Err(ProtocolError::UnknownShape(preview(raw))),
        }
    }
}

/// Body of the registration call.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    #[serde(rename = "user_id")]
    pub participant_id: String,
}

/// Prompt frame sent on the action channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRequest {
    #[serde(rename = "userId")]
    pub participant_id: String,
    #[serde(rename = "stageId")]
    pub category: Category,
    pub prompt: String,
}

impl PromptRequest {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Reply to a prompt: the action it mapped to, or an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ActionResponse {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(
        rename = "promptLen",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub prompt_length: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(ProtocolError::UnknownShape(preview(raw)));
        }
        Ok(ActionResponse::deserialize(value)?)
    }

    /// Server-side failure, if any. An empty message counts as none.
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|reason| !reason.is_empty())
    }
}

/// Per-participant stage progress as served by the progress endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProgressReport {
    #[serde(rename = "user_id", default)]
    pub participant_id: String,
    #[serde(default)]
    pub stages: Vec<StageProgress>,
}

impl ProgressReport {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn unlocked_codes(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| stage.unlocked)
            .map(|stage| stage.code.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StageProgress {
    pub code: String,
    #[serde(default, deserialize_with = "sanitize::flag_or_false")]
    pub unlocked: bool,
    #[serde(default, deserialize_with = "sanitize::flag_or_false")]
    pub cleared: bool,
    #[serde(
        rename = "prompt_length",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub score: u64,
    #[serde(
        rename = "clear_time_ms",
        default,
        deserialize_with = "sanitize::count_or_zero"
    )]
    pub duration_ms: u64,
    #[serde(default)]
    pub cleared_at: Option<String>,
}

/// Deserialization-boundary coercions.
///
/// Numeric fields that arrive as `null`, as non-numeric text, or as negative
/// numbers become `0` instead of failing the whole frame.
pub mod sanitize {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn count_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        Ok(count_from_value(&Value::deserialize(deserializer)?))
    }

    pub fn ratio_or_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(ratio_from_value(&Value::deserialize(deserializer)?))
    }

    pub fn flag_or_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(flag) => flag,
            Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
            _ => false,
        })
    }

    pub fn count_from_value(value: &Value) -> u64 {
        match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.is_finite() && *f >= 0.0)
                        .map(|f| f as u64)
                })
                .unwrap_or(0),
            Value::String(s) => s.trim().parse::<u64>().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn ratio_from_value(value: &Value) -> f64 {
        let ratio = match value {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            _ => 0.0,
        };
        if ratio.is_finite() {
            ratio
        } else {
            0.0
        }
    }
}

fn preview(raw: &str) -> String {
    const LIMIT: usize = 120;
    match raw.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}
