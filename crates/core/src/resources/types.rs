use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{PressureThresholds, ResourcesConfig};
use crate::job::Priority;

/// Worst pressure level across CPU, memory and disk.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Healthy,
    Moderate,
    High,
    Critical,
}

impl ResourceStatus {
    pub const ALL: [ResourceStatus; 4] = [
        ResourceStatus::Healthy,
        ResourceStatus::Moderate,
        ResourceStatus::High,
        ResourceStatus::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Healthy => "healthy",
            ResourceStatus::Moderate => "moderate",
            ResourceStatus::High => "high",
            ResourceStatus::Critical => "critical",
        }
    }

    /// Level of one resource given its percent used.
    pub fn of(percent: f32, thresholds: &PressureThresholds) -> Self {
        if percent >= thresholds.critical {
            ResourceStatus::Critical
        } else if percent >= thresholds.high {
            ResourceStatus::High
        } else if percent >= thresholds.moderate {
            ResourceStatus::Moderate
        } else {
            ResourceStatus::Healthy
        }
    }

    /// Jobs allowed to run at once under this level, given the configured cap.
    pub fn effective_capacity(self, cap: usize) -> usize {
        match self {
            ResourceStatus::Healthy => cap,
            ResourceStatus::Moderate => ((cap as f64 * 0.75) as usize).max(1),
            ResourceStatus::High => (cap / 2).max(1),
            ResourceStatus::Critical => 0,
        }
    }

    /// Critical refuses everything; High refuses work below `normal`.
    pub fn admits(self, priority: Priority) -> bool {
        match self {
            ResourceStatus::Critical => false,
            ResourceStatus::High => priority <= Priority::Normal,
            _ => true,
        }
    }

    pub(super) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(super) fn from_u8(value: u8) -> Self {
        Self::ALL
            .get(value as usize)
            .copied()
            .unwrap_or(ResourceStatus::Critical)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample of host usage, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// None when the watched filesystem could not be found.
    pub disk_percent: Option<f32>,
}

impl ResourceSnapshot {
    pub fn status(&self, config: &ResourcesConfig) -> ResourceStatus {
        let cpu = ResourceStatus::of(self.cpu_percent, &config.cpu);
        let memory = ResourceStatus::of(self.memory_percent, &config.memory);
        let disk = self
            .disk_percent
            .map(|percent| ResourceStatus::of(percent, &config.disk))
            .unwrap_or_default();
        cpu.max(memory).max(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_boundaries_are_inclusive() {
        let thresholds = PressureThresholds::new(70.0, 85.0, 95.0);
        assert_eq!(ResourceStatus::of(69.9, &thresholds), ResourceStatus::Healthy);
        assert_eq!(ResourceStatus::of(70.0, &thresholds), ResourceStatus::Moderate);
        assert_eq!(ResourceStatus::of(85.0, &thresholds), ResourceStatus::High);
        assert_eq!(ResourceStatus::of(95.0, &thresholds), ResourceStatus::Critical);
        assert_eq!(ResourceStatus::of(100.0, &thresholds), ResourceStatus::Critical);
    }

    #[test]
    fn test_status_to_capacity() {
        let caps: Vec<usize> = ResourceStatus::ALL
            .iter()
            .map(|status| status.effective_capacity(8))
            .collect();
        assert_eq!(caps, vec![8, 6, 4, 0]);

        // Small caps never drop to zero short of critical.
        assert_eq!(ResourceStatus::Moderate.effective_capacity(1), 1);
        assert_eq!(ResourceStatus::High.effective_capacity(1), 1);
        assert_eq!(ResourceStatus::Moderate.effective_capacity(2), 1);
        assert_eq!(ResourceStatus::High.effective_capacity(5), 2);
    }

    #[test]
    fn test_admission_by_priority() {
        for priority in Priority::ALL {
            assert!(ResourceStatus::Healthy.admits(priority));
            assert!(ResourceStatus::Moderate.admits(priority));
            assert!(!ResourceStatus::Critical.admits(priority));
        }
        assert!(ResourceStatus::High.admits(Priority::Urgent));
        assert!(ResourceStatus::High.admits(Priority::Normal));
        assert!(!ResourceStatus::High.admits(Priority::Low));
        assert!(!ResourceStatus::High.admits(Priority::Background));
    }

    #[test]
    fn test_snapshot_takes_worst_resource() {
        let config = ResourcesConfig::default();
        let snapshot = ResourceSnapshot {
            cpu_percent: 10.0,
            memory_percent: 88.0,
            disk_percent: Some(81.0),
        };
        assert_eq!(snapshot.status(&config), ResourceStatus::High);

        let no_disk = ResourceSnapshot {
            cpu_percent: 10.0,
            memory_percent: 10.0,
            disk_percent: None,
        };
        assert_eq!(no_disk.status(&config), ResourceStatus::Healthy);
    }

    #[test]
    fn test_u8_round_trip() {
        for status in ResourceStatus::ALL {
            assert_eq!(ResourceStatus::from_u8(status.as_u8()), status);
        }
    }
}
