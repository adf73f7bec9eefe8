//! Quota, capacity, and health models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Quota read model.
///
/// `None` means the backend does not account that figure (no usage tracking,
/// or no enforced limit).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub used_bytes: Option<u64>,
    pub limit_bytes: Option<u64>,
}

impl QuotaUsage {
    pub fn new(used_bytes: Option<u64>, limit_bytes: Option<u64>) -> Self {
        Self {
            used_bytes,
            limit_bytes,
        }
    }

    /// A scope that exists but carries neither accounting nor a limit.
    pub fn untracked() -> Self {
        Self::default()
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit_bytes.is_none()
    }
}

/// Rejected quota configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QuotaConfigError {
    #[error("quota limit must be greater than zero")]
    ZeroLimit,
}

/// Quota write model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub limit_bytes: u64,
}

impl QuotaConfig {
    pub fn new(limit_bytes: u64) -> Self {
        Self { limit_bytes }
    }

    pub fn validate(&self) -> Result<(), QuotaConfigError> {
        if self.limit_bytes == 0 {
            return Err(QuotaConfigError::ZeroLimit);
        }
        Ok(())
    }
}

/// Capacity of a whole volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityUsage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

impl CapacityUsage {
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// File count and byte total of a subtree.
///
/// `-1/-1` is the "too many to count" sentinel returned when a walk exceeds
/// its time budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeUsage {
    pub file_count: i64,
    pub used_bytes: i64,
}

impl TreeUsage {
    pub fn new(file_count: i64, used_bytes: i64) -> Self {
        Self {
            file_count,
            used_bytes,
        }
    }

    pub fn too_many() -> Self {
        Self::new(-1, -1)
    }

    pub fn is_too_many(&self) -> bool {
        self.file_count < 0 && self.used_bytes < 0
    }
}

/// Coarse health of a volume.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unavailable,
}

/// Health snapshot reported by `get_hwinfo`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareMetadata {
    pub status: HealthStatus,
    pub status_info: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Point-in-time performance figures of a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FsPerfMetric {
    pub iops_read: u64,
    pub iops_write: u64,
    pub io_bytes_read: u64,
    pub io_bytes_write: u64,
    pub io_usec_read: f64,
    pub io_usec_write: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_config_rejects_zero() {
        assert_eq!(QuotaConfig::new(0).validate(), Err(QuotaConfigError::ZeroLimit));
        assert!(QuotaConfig::new(1).validate().is_ok());
    }

    #[test]
    fn test_tree_usage_sentinel() {
        assert!(TreeUsage::too_many().is_too_many());
        assert!(!TreeUsage::new(0, 0).is_too_many());
    }

    #[test]
    fn test_capacity_available() {
        let cap = CapacityUsage {
            capacity_bytes: 100,
            used_bytes: 30,
        };
        assert_eq!(cap.available_bytes(), 70);
        let over = CapacityUsage {
            capacity_bytes: 10,
            used_bytes: 30,
        };
        assert_eq!(over.available_bytes(), 0);
    }
}
