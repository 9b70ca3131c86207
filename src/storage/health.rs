// Health checking helpers for local storage
//
// Disk usage inspection for the blob store's health report. Thresholds
// default to warn at 85% and error at 95% of the filesystem holding the
// base path.

use crate::types::{CheckStatus, HealthCheckResult};
use std::path::Path;
use sysinfo::Disks;

/// Disk usage thresholds as used fractions in [0, 1]
#[derive(Debug, Clone, Copy)]
pub struct DiskThresholds {
    /// Used fraction at which the check reports a warning
    pub warning: f64,

    /// Used fraction at which the check reports an error
    pub error: f64,
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self {
            warning: 0.85,
            error: 0.95,
        }
    }
}

/// Check usage of the filesystem containing `path`.
pub fn disk_usage_check(path: &Path, thresholds: DiskThresholds) -> HealthCheckResult {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    // Pick the disk whose mount point is the longest prefix of the path.
    let mut best: Option<(usize, u64, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if target.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _, _)| depth > d).unwrap_or(true) {
                best = Some((depth, disk.total_space(), disk.available_space()));
            }
        }
    }

    let Some((_, total, available)) = best else {
        return HealthCheckResult::warning(format!(
            "no filesystem found for {}",
            target.display()
        ));
    };
    if total == 0 {
        return HealthCheckResult::warning("filesystem reports zero capacity");
    }

    let used_fraction = 1.0 - available as f64 / total as f64;
    let message = format!(
        "{:.1}% used ({} of {} bytes free)",
        used_fraction * 100.0,
        available,
        total
    );
    let status = if used_fraction >= thresholds.error {
        CheckStatus::Error
    } else if used_fraction >= thresholds.warning {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    };
    HealthCheckResult { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_usage_for_temp_dir() {
        let result = disk_usage_check(&std::env::temp_dir(), DiskThresholds::default());
        // The temp filesystem exists, so the check must produce a message
        // either way; the status depends on the machine.
        assert!(!result.message.is_empty());
    }

    #[test]
    fn thresholds_order_statuses() {
        // With an impossible error threshold everything is at worst warning.
        let result = disk_usage_check(
            &std::env::temp_dir(),
            DiskThresholds {
                warning: 2.0,
                error: 3.0,
            },
        );
        assert_ne!(result.status, CheckStatus::Error);
    }
}
