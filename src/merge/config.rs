//! Merge policy tunables and their live holder.
//!
//! [`MergePolicyConfig`] is a plain, validated value. [`MergePolicySettings`]
//! owns the current value behind an `Arc` and swaps in a fresh copy on every
//! settings change, so a policy invocation that grabbed a snapshot never sees
//! a half-applied update.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{PhalanxError, Result};
use crate::event::{EngineEvent, EngineEventListener};
use crate::settings::{
    self, COMPOUND_FORMAT, EXPUNGE_DELETES_ALLOWED, FLOOR_SEGMENT, MAX_MERGE_AT_ONCE,
    MAX_MERGE_AT_ONCE_EXPLICIT, MAX_MERGED_SEGMENT, MERGE_ENABLED, MERGE_POLICY_KEYS,
    RECLAIM_DELETES_WEIGHT, SEGMENTS_PER_TIER, Settings, format_byte_size,
};

pub const DEFAULT_EXPUNGE_DELETES_ALLOWED: f64 = 10.0;
pub const DEFAULT_FLOOR_SEGMENT: u64 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_MERGE_AT_ONCE: u32 = 10;
pub const DEFAULT_MAX_MERGE_AT_ONCE_EXPLICIT: u32 = 30;
pub const DEFAULT_MAX_MERGED_SEGMENT: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_SEGMENTS_PER_TIER: f64 = 10.0;
pub const DEFAULT_RECLAIM_DELETES_WEIGHT: f64 = 2.0;
pub const DEFAULT_NO_CFS_RATIO: f64 = 0.1;

/// Validated merge policy tunables.
///
/// Setters clamp out-of-range values instead of failing; only the compound
/// file ratio is strict. `max_merge_at_once` never exceeds
/// `segments_per_tier`: when it would, the effective value is lowered to
/// `max(2, floor(segments_per_tier))`. The requested value is kept, so a later
/// increase of `segments_per_tier` brings it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMergePolicyConfig")]
pub struct MergePolicyConfig {
    expunge_deletes_allowed_pct: f64,
    floor_segment_bytes: u64,
    max_merge_at_once: u32,
    requested_max_merge_at_once: u32,
    max_merge_at_once_explicit: u32,
    max_merged_segment_bytes: u64,
    segments_per_tier: f64,
    reclaim_deletes_weight: f64,
    no_cfs_ratio: f64,
    merges_enabled: bool,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig {
            expunge_deletes_allowed_pct: DEFAULT_EXPUNGE_DELETES_ALLOWED,
            floor_segment_bytes: DEFAULT_FLOOR_SEGMENT,
            max_merge_at_once: DEFAULT_MAX_MERGE_AT_ONCE,
            requested_max_merge_at_once: DEFAULT_MAX_MERGE_AT_ONCE,
            max_merge_at_once_explicit: DEFAULT_MAX_MERGE_AT_ONCE_EXPLICIT,
            max_merged_segment_bytes: DEFAULT_MAX_MERGED_SEGMENT,
            segments_per_tier: DEFAULT_SEGMENTS_PER_TIER,
            reclaim_deletes_weight: DEFAULT_RECLAIM_DELETES_WEIGHT,
            no_cfs_ratio: DEFAULT_NO_CFS_RATIO,
            merges_enabled: true,
        }
    }
}

/// Wire form of [`MergePolicyConfig`]. Deserialized values go through the
/// setters, so the tier clamp and the ratio check still apply.
#[derive(Deserialize)]
struct RawMergePolicyConfig {
    expunge_deletes_allowed_pct: f64,
    floor_segment_bytes: u64,
    requested_max_merge_at_once: u32,
    max_merge_at_once_explicit: u32,
    max_merged_segment_bytes: u64,
    segments_per_tier: f64,
    reclaim_deletes_weight: f64,
    no_cfs_ratio: f64,
    merges_enabled: bool,
}

impl TryFrom<RawMergePolicyConfig> for MergePolicyConfig {
    type Error = PhalanxError;

    fn try_from(raw: RawMergePolicyConfig) -> Result<Self> {
        let mut config = MergePolicyConfig::default();
        config.set_expunge_deletes_allowed_pct(raw.expunge_deletes_allowed_pct);
        config.set_floor_segment_bytes(raw.floor_segment_bytes);
        config.set_max_merge_at_once_explicit(raw.max_merge_at_once_explicit);
        config.set_max_merged_segment_bytes(raw.max_merged_segment_bytes);
        config.set_segments_per_tier(raw.segments_per_tier);
        config.set_max_merge_at_once(raw.requested_max_merge_at_once);
        config.set_reclaim_deletes_weight(raw.reclaim_deletes_weight);
        config.set_no_cfs_ratio(raw.no_cfs_ratio)?;
        config.set_merges_enabled(raw.merges_enabled);
        Ok(config)
    }
}

impl MergePolicyConfig {
    /// Build a config from index settings. Missing or unparsable values use
    /// the defaults; an invalid compound file ratio is an error.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut config = MergePolicyConfig::default();
        for key in MERGE_POLICY_KEYS {
            if let Some(value) = settings.get(key) {
                config.apply(key, value)?;
            }
        }

        debug!(
            "using [tiered] merge policy with expunge_deletes_allowed[{}], floor_segment[{}], \
             max_merge_at_once[{}], max_merge_at_once_explicit[{}], max_merged_segment[{}], \
             segments_per_tier[{}], reclaim_deletes_weight[{}]",
            config.expunge_deletes_allowed_pct,
            format_byte_size(config.floor_segment_bytes),
            config.max_merge_at_once,
            config.max_merge_at_once_explicit,
            format_byte_size(config.max_merged_segment_bytes),
            config.segments_per_tier,
            config.reclaim_deletes_weight,
        );
        Ok(config)
    }

    pub fn expunge_deletes_allowed_pct(&self) -> f64 {
        self.expunge_deletes_allowed_pct
    }

    pub fn floor_segment_bytes(&self) -> u64 {
        self.floor_segment_bytes
    }

    /// Effective value, after the tier clamp.
    pub fn max_merge_at_once(&self) -> u32 {
        self.max_merge_at_once
    }

    /// Value asked for by the operator, before the tier clamp.
    pub fn requested_max_merge_at_once(&self) -> u32 {
        self.requested_max_merge_at_once
    }

    pub fn max_merge_at_once_explicit(&self) -> u32 {
        self.max_merge_at_once_explicit
    }

    pub fn max_merged_segment_bytes(&self) -> u64 {
        self.max_merged_segment_bytes
    }

    pub fn segments_per_tier(&self) -> f64 {
        self.segments_per_tier
    }

    pub fn reclaim_deletes_weight(&self) -> f64 {
        self.reclaim_deletes_weight
    }

    pub fn no_cfs_ratio(&self) -> f64 {
        self.no_cfs_ratio
    }

    /// When false every policy invocation returns an empty specification.
    pub fn is_merging_enabled(&self) -> bool {
        self.merges_enabled
    }

    pub fn set_expunge_deletes_allowed_pct(&mut self, pct: f64) -> bool {
        let pct = pct.clamp(0.0, 100.0);
        replace(&mut self.expunge_deletes_allowed_pct, pct)
    }

    pub fn set_floor_segment_bytes(&mut self, bytes: u64) -> bool {
        replace(&mut self.floor_segment_bytes, bytes.max(1))
    }

    pub fn set_max_merge_at_once(&mut self, count: u32) -> bool {
        self.requested_max_merge_at_once = count.max(2);
        self.adjust_max_merge_at_once()
    }

    pub fn set_max_merge_at_once_explicit(&mut self, count: u32) -> bool {
        replace(&mut self.max_merge_at_once_explicit, count.max(2))
    }

    pub fn set_max_merged_segment_bytes(&mut self, bytes: u64) -> bool {
        replace(&mut self.max_merged_segment_bytes, bytes.max(1))
    }

    pub fn set_segments_per_tier(&mut self, segments: f64) -> bool {
        let changed = replace(&mut self.segments_per_tier, segments.max(2.0));
        self.adjust_max_merge_at_once() || changed
    }

    pub fn set_reclaim_deletes_weight(&mut self, weight: f64) -> bool {
        replace(&mut self.reclaim_deletes_weight, weight.max(0.0))
    }

    /// Set the compound file ratio. Values outside `[0, 1]` are rejected.
    pub fn set_no_cfs_ratio(&mut self, ratio: f64) -> Result<bool> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(PhalanxError::config(format!(
                "NoCFSRatio must be in the interval [0..1] but was: [{ratio}]"
            )));
        }
        Ok(replace(&mut self.no_cfs_ratio, ratio))
    }

    pub fn set_merges_enabled(&mut self, enabled: bool) -> bool {
        if !enabled {
            warn!(
                "[{MERGE_ENABLED}] is set to false, this should only be used in tests and can \
                 cause serious problems in production environments"
            );
        }
        replace(&mut self.merges_enabled, enabled)
    }

    /// Apply one named setting and log the change. Returns whether the
    /// effective config changed. Unknown keys are ignored.
    pub fn update(&mut self, key: &str, value: &str) -> Result<bool> {
        let before = self.display_value(key);
        let changed = self.apply(key, value)?;
        if changed {
            info!(
                "updating [{}] from [{}] to [{}]",
                short_name(key),
                before.unwrap_or_default(),
                self.display_value(key).unwrap_or_default()
            );
        }
        Ok(changed)
    }

    /// Apply every merge setting present in `settings`. Values are validated
    /// before anything is applied, so on error the config is unchanged.
    /// Returns the keys whose effective value changed.
    pub fn refresh(&mut self, settings: &Settings) -> Result<Vec<String>> {
        let mut next = self.clone();
        let mut changed = Vec::new();
        for key in MERGE_POLICY_KEYS {
            if let Some(value) = settings.get(key) {
                if next.apply(key, value)? {
                    changed.push((*key).to_string());
                }
            }
        }

        for key in &changed {
            info!(
                "updating [{}] from [{}] to [{}]",
                short_name(key),
                self.display_value(key).unwrap_or_default(),
                next.display_value(key).unwrap_or_default()
            );
        }
        *self = next;
        Ok(changed)
    }

    /// Current value of a setting, rendered the way it would be written.
    pub fn display_value(&self, key: &str) -> Option<String> {
        let value = match key {
            EXPUNGE_DELETES_ALLOWED => self.expunge_deletes_allowed_pct.to_string(),
            FLOOR_SEGMENT => format_byte_size(self.floor_segment_bytes),
            MAX_MERGE_AT_ONCE => self.max_merge_at_once.to_string(),
            MAX_MERGE_AT_ONCE_EXPLICIT => self.max_merge_at_once_explicit.to_string(),
            MAX_MERGED_SEGMENT => format_byte_size(self.max_merged_segment_bytes),
            SEGMENTS_PER_TIER => self.segments_per_tier.to_string(),
            RECLAIM_DELETES_WEIGHT => self.reclaim_deletes_weight.to_string(),
            COMPOUND_FORMAT => self.no_cfs_ratio.to_string(),
            MERGE_ENABLED => self.merges_enabled.to_string(),
            _ => return None,
        };
        Some(value)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<bool> {
        let changed = match key {
            EXPUNGE_DELETES_ALLOWED => parsed(key, value, settings::parse_f64)
                .is_some_and(|v| self.set_expunge_deletes_allowed_pct(v)),
            FLOOR_SEGMENT => parsed(key, value, settings::parse_byte_size)
                .is_some_and(|v| self.set_floor_segment_bytes(v)),
            MAX_MERGE_AT_ONCE => parsed(key, value, settings::parse_u32)
                .is_some_and(|v| self.set_max_merge_at_once(v)),
            MAX_MERGE_AT_ONCE_EXPLICIT => parsed(key, value, settings::parse_u32)
                .is_some_and(|v| self.set_max_merge_at_once_explicit(v)),
            MAX_MERGED_SEGMENT => parsed(key, value, settings::parse_byte_size)
                .is_some_and(|v| self.set_max_merged_segment_bytes(v)),
            SEGMENTS_PER_TIER => parsed(key, value, settings::parse_f64)
                .is_some_and(|v| self.set_segments_per_tier(v)),
            RECLAIM_DELETES_WEIGHT => parsed(key, value, settings::parse_f64)
                .is_some_and(|v| self.set_reclaim_deletes_weight(v)),
            COMPOUND_FORMAT => self.set_no_cfs_ratio(parse_no_cfs_ratio(value)?)?,
            MERGE_ENABLED => parsed(key, value, settings::parse_bool)
                .is_some_and(|v| self.set_merges_enabled(v)),
            _ => {
                warn!("ignoring unknown merge setting [{key}]");
                false
            }
        };
        Ok(changed)
    }

    fn adjust_max_merge_at_once(&mut self) -> bool {
        let requested = self.requested_max_merge_at_once;
        let effective = if self.segments_per_tier >= requested as f64 {
            requested
        } else {
            let adjusted = (self.segments_per_tier.floor() as u32).max(2);
            debug!(
                "changing max_merge_at_once from [{requested}] to [{adjusted}] because \
                 segments_per_tier [{}] has to be higher or equal to it",
                self.segments_per_tier
            );
            adjusted
        };
        replace(&mut self.max_merge_at_once, effective)
    }
}

/// Parse the compound file setting: `true` is 1.0, `false` is 0.0, anything
/// else must be a ratio in `[0, 1]`.
pub fn parse_no_cfs_ratio(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        return Ok(1.0);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Ok(0.0);
    }
    let value: f64 = raw.parse().map_err(|_| {
        PhalanxError::config(format!(
            "Expected a boolean or a value in the interval [0..1] but was: [{raw}]"
        ))
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(PhalanxError::config(format!(
            "NoCFSRatio must be in the interval [0..1] but was: [{value}]"
        )));
    }
    Ok(value)
}

fn parsed<T>(key: &str, raw: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    let value = parse(raw);
    if value.is_none() {
        warn!("ignoring unparsable value [{raw}] for [{key}]");
    }
    value
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn short_name(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

/// Lifecycle of a [`MergePolicySettings`] holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsState {
    Active,
    SettingsChanging,
    Closing,
    Closed,
}

impl SettingsState {
    fn is_open(self) -> bool {
        matches!(self, SettingsState::Active | SettingsState::SettingsChanging)
    }
}

#[derive(Debug)]
struct HolderState {
    state: SettingsState,
    current: Arc<MergePolicyConfig>,
    version: u64,
    writers: usize,
}

/// Live, swappable merge policy configuration.
///
/// Readers call [`snapshot`](Self::snapshot) once per policy invocation.
/// Writers copy the current config outside the lock, change the copy and
/// compare-and-swap it in by version. A writer that lost the race reapplies
/// its change to the newer config.
pub struct MergePolicySettings {
    inner: Mutex<HolderState>,
    listener: Arc<dyn EngineEventListener>,
}

impl fmt::Debug for MergePolicySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MergePolicySettings")
            .field("state", &inner.state)
            .field("version", &inner.version)
            .field("current", &inner.current)
            .finish()
    }
}

impl MergePolicySettings {
    pub fn new(config: MergePolicyConfig, listener: Arc<dyn EngineEventListener>) -> Self {
        MergePolicySettings {
            inner: Mutex::new(HolderState {
                state: SettingsState::Active,
                current: Arc::new(config),
                version: 0,
                writers: 0,
            }),
            listener,
        }
    }

    /// The config to use for one policy invocation.
    pub fn snapshot(&self) -> Arc<MergePolicyConfig> {
        Arc::clone(&self.inner.lock().current)
    }

    pub fn state(&self) -> SettingsState {
        self.inner.lock().state
    }

    /// Number of successful swaps so far.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Change one setting. Returns whether the effective config changed.
    pub fn update(&self, key: &str, value: &str) -> Result<bool> {
        let changed = self.change(|config| {
            Ok(if config.update(key, value)? {
                vec![key.to_string()]
            } else {
                Vec::new()
            })
        })?;
        Ok(!changed.is_empty())
    }

    /// Apply every merge setting present in `settings`. Returns the keys
    /// whose effective value changed.
    pub fn refresh(&self, settings: &Settings) -> Result<Vec<String>> {
        self.change(|config| config.refresh(settings))
    }

    /// Stop accepting updates. Idempotent. Writers still computing a change
    /// fail when they try to swap.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SettingsState::Closed {
            return;
        }
        inner.state = SettingsState::Closing;
        debug!("closing merge policy settings at version {}", inner.version);
        inner.state = SettingsState::Closed;
    }

    fn change<F>(&self, apply: F) -> Result<Vec<String>>
    where
        F: Fn(&mut MergePolicyConfig) -> Result<Vec<String>>,
    {
        let (mut base, mut version) = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SettingsState::Closing | SettingsState::Closed) {
                return Err(PhalanxError::closed("merge policy settings are closed"));
            }
            inner.state = SettingsState::SettingsChanging;
            inner.writers += 1;
            (Arc::clone(&inner.current), inner.version)
        };

        loop {
            let mut next = (*base).clone();
            let result = apply(&mut next);

            let mut inner = self.inner.lock();
            if result.is_ok() && inner.version != version && inner.state.is_open() {
                // Another writer swapped first; redo the change on top of it.
                base = Arc::clone(&inner.current);
                version = inner.version;
                continue;
            }

            inner.writers -= 1;
            if inner.writers == 0 && inner.state == SettingsState::SettingsChanging {
                inner.state = SettingsState::Active;
            }
            if !inner.state.is_open() {
                return Err(PhalanxError::closed("merge policy settings are closed"));
            }
            let changed = result?;
            if changed.is_empty() {
                return Ok(changed);
            }
            let next = Arc::new(next);
            inner.current = Arc::clone(&next);
            inner.version += 1;
            drop(inner);

            for key in &changed {
                self.listener.on_event(&EngineEvent::SettingsUpdated {
                    key: key.clone(),
                    value: next.display_value(key).unwrap_or_default(),
                });
            }
            return Ok(changed);
        }
    }
}
