//! Turns raw NLU output into a [`ParsedCommand`].
//!
//! Validation is best effort and total: the response is first parsed as
//! generic JSON, then every field is checked against its expected shape.
//! A field that fails is replaced with a safe default and recorded as a
//! warning. A response that cannot be parsed at all degrades to a
//! low-confidence command built from the transcript. Nothing here returns
//! an error.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::model::{
    CommandBody, CommandKind, MaterialOrderDraft, ParsedCommand, TaskDraft, WorksiteDraft,
    WorktimeDraft,
};
use super::time::{minutes_of_day, normalize_time, parse_date, TIME_SENTINEL};
use crate::db::models::{Category, Priority};

pub const UNPARSEABLE: &str = "unparseable response";

/// Confidence of a command built without usable NLU output.
pub const FALLBACK_CONFIDENCE: f64 = 0.1;

const MISSING_CONFIDENCE: f64 = 0.5;
const WARNING_PENALTY: f64 = 0.1;

pub fn validate(raw: &str, transcript: &str, today: NaiveDate) -> ParsedCommand {
    let Some(object) = parse_object(raw) else {
        debug!("NLU response is not a JSON object: {:?}", truncate(raw, 200));
        return fallback(transcript, today, vec![UNPARSEABLE.to_string()]);
    };

    let discriminant = ["type", "kind", "command"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str));
    let Some(kind) = discriminant.and_then(CommandKind::from_discriminant) else {
        let reason = match discriminant {
            Some(other) => format!("unknown command type '{other}'"),
            None => "missing command type".to_string(),
        };
        return fallback(transcript, today, vec![reason]);
    };

    let mut fields = Fields {
        object: section(&object, kind),
        warnings: Vec::new(),
    };
    let body = match kind {
        CommandKind::CreateWorksite => CommandBody::CreateWorksite(WorksiteDraft {
            customer_name: fields.required_str(&["name", "customerName"]),
            street: fields.required_str(&["address", "street"]),
            city: fields.required_str(&["city"]),
            zip_code: fields.optional_str(&["zipCode", "zip"]),
            description: fields.optional_str(&["description"]),
            is_existing: fields.boolean(&["isExisting"]),
        }),
        CommandKind::CreateTask => CommandBody::CreateTask(TaskDraft {
            worksite_address_hint: fields.required_str(&["projectAddress", "worksiteAddressHint"]),
            description: fields.required_str(&["description"]),
            priority: fields.enumeration(&["priority"], Priority::Medium),
            category: fields.enumeration(&["category"], Category::Work),
        }),
        CommandKind::LogWorktime => {
            let worksite_address_hint =
                fields.required_str(&["projectAddress", "worksiteAddressHint"]);
            let date = fields.date(&["date"], today);
            let before = fields.warnings.len();
            let start_time = fields.time(&["startTime"]);
            let end_time = fields.time(&["endTime"]);
            let times_valid = fields.warnings.len() == before;
            let worktime = WorktimeDraft {
                worksite_address_hint,
                date,
                start_time,
                end_time,
                break_minutes: fields.minutes(&["breakMinutes"]),
                description: fields.required_str(&["description"]),
            };
            if times_valid {
                fields.check_duration(&worktime);
            }
            CommandBody::LogWorktime(worktime)
        }
        CommandKind::OrderMaterial => CommandBody::OrderMaterial(MaterialOrderDraft {
            worksite_address_hint: fields.required_str(&["projectAddress", "worksiteAddressHint"]),
            description: fields.required_str(&["description"]),
        }),
    };

    let mut warnings = fields.warnings;
    let stated = match object.get("confidence") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_f64() {
            Some(c) => Some(c.clamp(0.0, 1.0)),
            None => {
                warnings.push("field 'confidence' is not a number".to_string());
                None
            }
        },
    };
    let confidence = degrade(stated.unwrap_or(MISSING_CONFIDENCE), warnings.len());

    for warning in &warnings {
        warn!("{}: {}", kind.as_str(), warning);
    }

    ParsedCommand {
        body,
        confidence,
        warnings,
    }
}

/// Command for a response that could not be used at all. The kind is guessed
/// from the transcript and the transcript becomes the description.
pub fn fallback(transcript: &str, today: NaiveDate, warnings: Vec<String>) -> ParsedCommand {
    let description = transcript.trim().to_string();
    let kind = guess_kind(transcript);
    warn!(
        "degrading to fallback {} command: {}",
        kind.as_str(),
        warnings.join("; ")
    );

    let body = match kind {
        CommandKind::CreateWorksite => CommandBody::CreateWorksite(WorksiteDraft {
            customer_name: String::new(),
            street: String::new(),
            city: String::new(),
            zip_code: None,
            description: Some(description).filter(|d| !d.is_empty()),
            is_existing: false,
        }),
        CommandKind::LogWorktime => CommandBody::LogWorktime(WorktimeDraft {
            worksite_address_hint: String::new(),
            date: today.format("%Y-%m-%d").to_string(),
            start_time: TIME_SENTINEL.to_string(),
            end_time: TIME_SENTINEL.to_string(),
            break_minutes: None,
            description,
        }),
        CommandKind::OrderMaterial => CommandBody::OrderMaterial(MaterialOrderDraft {
            worksite_address_hint: String::new(),
            description,
        }),
        CommandKind::CreateTask => CommandBody::CreateTask(TaskDraft {
            worksite_address_hint: String::new(),
            description,
            priority: Priority::Medium,
            category: Category::Work,
        }),
    };

    ParsedCommand {
        body,
        confidence: FALLBACK_CONFIDENCE,
        warnings,
    }
}

/// Best-effort command kind from keywords in the transcript.
pub fn guess_kind(transcript: &str) -> CommandKind {
    let text = transcript.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| text.contains(w));

    if has(&["arbeitszeit", "stunden", "gearbeitet", "worktime", "hours"]) {
        CommandKind::LogWorktime
    } else if has(&["material", "bestell", "order"]) {
        CommandKind::OrderMaterial
    } else if has(&["baustelle", "projekt", "project", "worksite"]) {
        CommandKind::CreateWorksite
    } else {
        CommandKind::CreateTask
    }
}

fn degrade(confidence: f64, warnings: usize) -> f64 {
    if warnings == 0 {
        return confidence;
    }
    let lowered = confidence - WARNING_PENALTY * warnings as f64;
    lowered.max(FALLBACK_CONFIDENCE).min(confidence)
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)```").expect("valid fence regex"))
}

/// Strip code fences and surrounding prose, then parse as a JSON object.
fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    let unfenced = fence_re()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw, |m| m.as_str());
    let start = unfenced.find('{')?;
    let end = unfenced.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str(&unfenced[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// The fields of a command live under `projectInfo`/`taskInfo`/
/// `worktimeInfo`, or directly on the root for flat responses.
fn section(object: &Map<String, Value>, kind: CommandKind) -> Map<String, Value> {
    let key = match kind {
        CommandKind::CreateWorksite => "projectInfo",
        CommandKind::CreateTask | CommandKind::OrderMaterial => "taskInfo",
        CommandKind::LogWorktime => "worktimeInfo",
    };
    match object.get(key) {
        Some(Value::Object(inner)) => inner.clone(),
        _ => object.clone(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

struct Fields {
    object: Map<String, Value>,
    warnings: Vec<String>,
}

impl Fields {
    fn lookup(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .filter_map(|k| self.object.get(*k))
            .find(|v| !v.is_null())
    }

    fn warn(&mut self, key: &str, problem: &str) {
        self.warnings.push(format!("field '{key}' {problem}"));
    }

    fn required_str(&mut self, keys: &[&str]) -> String {
        match self.lookup(keys).cloned() {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::String(_)) => {
                self.warn(keys[0], "is empty");
                String::new()
            }
            Some(_) => {
                self.warn(keys[0], "is not a string");
                String::new()
            }
            None => {
                self.warn(keys[0], "is missing");
                String::new()
            }
        }
    }

    fn optional_str(&mut self, keys: &[&str]) -> Option<String> {
        match self.lookup(keys).cloned() {
            Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
            Some(_) => {
                self.warn(keys[0], "is not a string");
                None
            }
            None => None,
        }
    }

    fn boolean(&mut self, keys: &[&str]) -> bool {
        match self.lookup(keys) {
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                self.warn(keys[0], "is not a boolean, assuming false");
                false
            }
            None => {
                self.warn(keys[0], "is missing, assuming false");
                false
            }
        }
    }

    fn enumeration<T>(&mut self, keys: &[&str], default: T) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        match self.lookup(keys).and_then(Value::as_str).map(str::to_string) {
            Some(raw) => match raw.parse() {
                Ok(value) => value,
                Err(_) => {
                    self.warn(keys[0], &format!("has unknown value '{raw}', using '{default}'"));
                    default
                }
            },
            None => {
                self.warn(keys[0], &format!("is missing or not a string, using '{default}'"));
                default
            }
        }
    }

    fn date(&mut self, keys: &[&str], today: NaiveDate) -> String {
        let raw = self.lookup(keys).and_then(Value::as_str).map(str::to_string);
        match raw.as_deref().and_then(parse_date) {
            Some(date) => date.format("%Y-%m-%d").to_string(),
            None => {
                let today = today.format("%Y-%m-%d").to_string();
                self.warn(keys[0], &format!("is not a YYYY-MM-DD date, using {today}"));
                today
            }
        }
    }

    fn time(&mut self, keys: &[&str]) -> String {
        let raw = self.lookup(keys).and_then(Value::as_str).map(str::to_string);
        match raw.as_deref().and_then(normalize_time) {
            Some(time) => time,
            None => {
                self.warn(keys[0], &format!("is not an HH:MM time, using {TIME_SENTINEL}"));
                TIME_SENTINEL.to_string()
            }
        }
    }

    fn minutes(&mut self, keys: &[&str]) -> Option<u32> {
        let value = self.lookup(keys)?.clone();
        let minutes = value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|m| u32::try_from(m).ok());
        if minutes.is_none() {
            self.warn(keys[0], "is not a non-negative whole number, ignoring it");
        }
        minutes
    }

    /// Only meaningful once both times passed their shape check.
    fn check_duration(&mut self, worktime: &WorktimeDraft) {
        let (Some(start), Some(end)) = (
            minutes_of_day(&worktime.start_time),
            minutes_of_day(&worktime.end_time),
        ) else {
            return;
        };
        if end <= start {
            self.warn(
                "endTime",
                "is not later than startTime, duration clamped to zero",
            );
        } else if worktime.break_minutes.unwrap_or(0) > end - start {
            self.warn(
                "breakMinutes",
                "exceeds the worked span, duration clamped to zero",
            );
        }
    }
}
