use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity and sync state reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    pub version: String,
    pub network: String,
    pub block_height: u64,
    #[serde(default)]
    pub address: Option<String>,
}

/// Liveness summary reported by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthInfo {
    pub status: String,
    pub uptime_seconds: u64,
    pub synced: bool,
}

/// One row of the active validator set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    pub address: String,
    pub stake: u64,
    pub active: bool,
    #[serde(default)]
    pub uptime_pct: f64,
}

/// One row of the recent-blocks list, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub height: u64,
    pub hash: String,
    pub timestamp: u64,
    #[serde(default)]
    pub tx_count: u32,
}

/// Epoch and reward-pool summary. `remaining_secs` of 0 can legitimately
/// occur at an epoch boundary and is not trusted by the countdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardInfo {
    pub epoch: u64,
    pub epoch_duration_secs: u64,
    pub remaining_secs: u64,
    pub pool_cil: u64,
    pub validator_count: u32,
}

/// Composite network view gathered in one poll cycle. Replaced
/// wholesale on success, never partially merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub node_info: NodeInfo,
    pub health: HealthInfo,
    pub validators: Vec<ValidatorInfo>,
    pub recent_blocks: Vec<BlockSummary>,
    pub peers: BTreeSet<String>,
    pub reward: Option<RewardInfo>,
    pub fetched_at_unix: i64,
}

impl DashboardSnapshot {
    pub fn new(
        node_info: NodeInfo,
        health: HealthInfo,
        validators: Vec<ValidatorInfo>,
        recent_blocks: Vec<BlockSummary>,
        peers: BTreeSet<String>,
        reward: Option<RewardInfo>,
    ) -> Self {
        Self {
            node_info,
            health,
            validators,
            recent_blocks,
            peers,
            reward,
            fetched_at_unix: Utc::now().timestamp(),
        }
    }

    /// Whether `address` is present in the validator set of this view.
    pub fn contains_validator(&self, address: &str) -> bool {
        self.validators.iter().any(|v| v.address == address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_validator(addr: &str) -> DashboardSnapshot {
        DashboardSnapshot::new(
            NodeInfo::default(),
            HealthInfo::default(),
            vec![ValidatorInfo {
                address: addr.into(),
                stake: 1_000,
                active: true,
                uptime_pct: 99.5,
            }],
            vec![],
            BTreeSet::new(),
            None,
        )
    }

    #[test]
    fn contains_validator_matches_exact_address() {
        let snap = snapshot_with_validator("KEEL1abc");
        assert!(snap.contains_validator("KEEL1abc"));
        assert!(!snap.contains_validator("KEEL1abcd"));
    }

    #[test]
    fn snapshot_stamps_fetch_time() {
        let snap = snapshot_with_validator("KEEL1abc");
        assert!(snap.fetched_at_unix > 0);
    }
}
