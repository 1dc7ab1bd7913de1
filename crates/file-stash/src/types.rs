//! Stash types

use crate::id::StashId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a stash
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Directory holding one container per stashed item
    pub stash_dir: PathBuf,
    /// Items older than this are removed by the sweeper
    pub max_item_age: Duration,
    /// Remove an item as soon as it has been read to the end once
    pub delete_after_access: bool,
    /// Time between sweep cycles
    pub sweep_interval: Duration,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            stash_dir: std::env::temp_dir().join("stashDir"),
            max_item_age: Duration::from_millis(5000),
            delete_after_access: true,
            sweep_interval: Duration::from_millis(1000),
        }
    }
}

/// Lifecycle of a stashed item. Transitions only ever go forward, except
/// that a failed removal hands a `Deleting` item back as `Present` so that
/// a later sweep can retry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemState {
    Present = 0,
    Deleting = 1,
    Gone = 2,
}

impl ItemState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ItemState::Present,
            1 => ItemState::Deleting,
            _ => ItemState::Gone,
        }
    }
}

/// One row of a store listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: StashId,
    pub created_at: DateTime<Utc>,
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// This call removed the container
    Removed,
    /// There was nothing left to remove
    AlreadyGone,
    /// Another deleter owns the removal
    InProgress,
}

/// Summary of a single sweep cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Counters describing stash activity since startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StashStats {
    pub stored: u64,
    pub failed_uploads: u64,
    pub hits: u64,
    pub misses: u64,
    /// Items removed after being read
    pub consumed: u64,
    /// Items removed by the sweeper
    pub swept: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StashConfig::default();
        assert_eq!(config.stash_dir, std::env::temp_dir().join("stashDir"));
        assert_eq!(config.max_item_age, Duration::from_millis(5000));
        assert!(config.delete_after_access);
        assert_eq!(config.sweep_interval, Duration::from_millis(1000));
    }

    #[test]
    fn test_item_state_from_u8() {
        assert_eq!(ItemState::from_u8(ItemState::Present as u8), ItemState::Present);
        assert_eq!(ItemState::from_u8(ItemState::Deleting as u8), ItemState::Deleting);
        assert_eq!(ItemState::from_u8(ItemState::Gone as u8), ItemState::Gone);
    }

    #[test]
    fn test_stash_stats_default() {
        let stats = StashStats::default();
        assert_eq!(stats.stored, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.swept, 0);
    }

    #[test]
    fn test_sweep_report_serialization() {
        let report = SweepReport {
            scanned: 3,
            expired: 2,
            removed: 1,
            failed: 1,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"expired\":2"));

        let deserialized: SweepReport = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, report);
    }
}
