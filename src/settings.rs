//! Flat, named settings as handed to the merge core by an external settings
//! store.
//!
//! Values are kept as strings and parsed on read, so the same map can carry
//! byte sizes (`"2mb"`), ratios (`"0.1"` or `"true"`) and counts.

use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Deleted-docs percentage a segment must exceed to be expunged.
pub const EXPUNGE_DELETES_ALLOWED: &str = "index.merge.policy.expunge_deletes_allowed";
/// Segments smaller than this are rounded up for merge selection.
pub const FLOOR_SEGMENT: &str = "index.merge.policy.floor_segment";
/// Maximum segments merged at once during normal merging.
pub const MAX_MERGE_AT_ONCE: &str = "index.merge.policy.max_merge_at_once";
/// Maximum segments merged at once during force merge or expunge deletes.
pub const MAX_MERGE_AT_ONCE_EXPLICIT: &str = "index.merge.policy.max_merge_at_once_explicit";
/// Maximum size of a segment produced by normal merging.
pub const MAX_MERGED_SEGMENT: &str = "index.merge.policy.max_merged_segment";
/// Allowed number of segments per tier.
pub const SEGMENTS_PER_TIER: &str = "index.merge.policy.segments_per_tier";
/// How strongly merges that reclaim deletes are favored.
pub const RECLAIM_DELETES_WEIGHT: &str = "index.merge.policy.reclaim_deletes_weight";
/// Compound-file ratio, a boolean or a value in `[0, 1]`.
pub const COMPOUND_FORMAT: &str = "index.compound_format";
/// Escape hatch that disables merging entirely.
pub const MERGE_ENABLED: &str = "index.merge.enabled";
/// Number of merge worker threads.
pub const SCHEDULER_MAX_THREAD_COUNT: &str = "index.merge.scheduler.max_thread_count";
/// Maximum number of merges queued or running at once.
pub const SCHEDULER_MAX_MERGE_COUNT: &str = "index.merge.scheduler.max_merge_count";

/// All keys understood by the merge policy configuration.
pub const MERGE_POLICY_KEYS: &[&str] = &[
    EXPUNGE_DELETES_ALLOWED,
    FLOOR_SEGMENT,
    MAX_MERGE_AT_ONCE,
    MAX_MERGE_AT_ONCE_EXPLICIT,
    MAX_MERGED_SEGMENT,
    SEGMENTS_PER_TIER,
    RECLAIM_DELETES_WEIGHT,
    COMPOUND_FORMAT,
    MERGE_ENABLED,
];

lazy_static! {
    static ref BYTE_SIZE: Regex =
        Regex::new(r"^(?i)\s*([0-9]+(?:\.[0-9]+)?)\s*(b|kb|mb|gb|tb|pb)?\s*$").unwrap();
}

/// A flat map of setting names to raw string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Create an empty settings map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings from a flat JSON object. Numbers and booleans are
    /// accepted as well as strings.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)?;
        let values = raw
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();
        Ok(Settings { values })
    }

    /// Builder-style insert.
    pub fn with<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.put(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn put<K: Into<String>, V: ToString>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.to_string());
    }

    /// Raw value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Read a float, falling back to `default` when absent or unparsable.
    pub fn get_as_f64(&self, key: &str, default: f64) -> f64 {
        self.parse_or(key, default, parse_f64)
    }

    /// Read an unsigned integer, falling back to `default`.
    pub fn get_as_u32(&self, key: &str, default: u32) -> u32 {
        self.parse_or(key, default, parse_u32)
    }

    /// Read a byte size (`"5gb"`, `"512kb"`, `"1048576"`), falling back to
    /// `default`.
    pub fn get_as_bytes(&self, key: &str, default: u64) -> u64 {
        self.parse_or(key, default, parse_byte_size)
    }

    /// Read a boolean, falling back to `default`.
    pub fn get_as_bool(&self, key: &str, default: bool) -> bool {
        self.parse_or(key, default, parse_bool)
    }

    fn parse_or<T: fmt::Debug>(&self, key: &str, default: T, parse: fn(&str) -> Option<T>) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => parse(raw).unwrap_or_else(|| {
                warn!("ignoring unparsable value [{raw}] for [{key}], using [{default:?}]");
                default
            }),
        }
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = Settings::new();
        for (key, value) in iter {
            settings.put(key, value);
        }
        settings
    }
}

/// Parse a finite float.
pub fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an unsigned 32-bit integer.
pub fn parse_u32(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok()
}

/// Parse `true`/`false`, case-insensitively.
pub fn parse_bool(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Parse a byte size with an optional unit suffix. Units are binary
/// (`1kb` = 1024 bytes) and fractional values are allowed.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let caps = BYTE_SIZE.captures(raw)?;
    let number: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: u64 = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        None => 1,
        Some(unit) => match unit.as_str() {
            "b" => 1,
            "kb" => 1 << 10,
            "mb" => 1 << 20,
            "gb" => 1 << 30,
            "tb" => 1 << 40,
            "pb" => 1 << 50,
            _ => return None,
        },
    };
    let bytes = number * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return None;
    }
    Some(bytes as u64)
}

/// Render a byte count with the largest unit that divides it evenly,
/// e.g. `2mb` or `1536b`.
pub fn format_byte_size(bytes: u64) -> String {
    const UNITS: [(&str, u64); 5] = [
        ("pb", 1 << 50),
        ("tb", 1 << 40),
        ("gb", 1 << 30),
        ("mb", 1 << 20),
        ("kb", 1 << 10),
    ];
    if bytes == 0 {
        return "0b".to_string();
    }
    for (unit, size) in UNITS {
        if bytes % size == 0 {
            return format!("{}{unit}", bytes / size);
        }
    }
    format!("{bytes}b")
}
