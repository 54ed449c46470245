//! NTFS per-user disk quotas via `fsutil quota`

use crate::platform;
use crate::{Error, Result};

/// `fsutil` encodes "no limit" as all bits set
pub const NO_LIMIT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskQuota {
    pub limit_bytes: u64,
    pub used_bytes: u64,
}

#[cfg_attr(test, mockall::automock)]
pub trait DiskQuotaManager: Send + Sync {
    fn set_quota(&self, volume: &str, user_name: &str, limit_bytes: u64) -> Result<()>;
    fn quota(&self, volume: &str, user_name: &str) -> Result<DiskQuota>;
    fn delete_quota(&self, volume: &str, user_name: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct FsutilQuotaManager;

fn volume_arg(volume: &str) -> &str {
    volume.trim_end_matches(['\\', '/'])
}

impl DiskQuotaManager for FsutilQuotaManager {
    fn set_quota(&self, volume: &str, user_name: &str, limit_bytes: u64) -> Result<()> {
        let limit = limit_bytes.to_string();
        platform::run_command(
            "fsutil",
            &["quota", "modify", volume_arg(volume), &limit, &limit, user_name],
        )?;
        tracing::debug!(volume, user = user_name, limit_bytes, "disk quota set");
        Ok(())
    }

    fn quota(&self, volume: &str, user_name: &str) -> Result<DiskQuota> {
        let output = platform::run_command("fsutil", &["quota", "query", volume_arg(volume)])?;
        Ok(parse_quota_report(&output, user_name).unwrap_or(DiskQuota {
            limit_bytes: NO_LIMIT,
            used_bytes: 0,
        }))
    }

    fn delete_quota(&self, volume: &str, user_name: &str) -> Result<()> {
        // fsutil cannot remove an entry; lifting the limit is equivalent
        match self.set_quota(volume, user_name, NO_LIMIT) {
            Err(Error::Command { stderr, .. }) if stderr.contains("not found") => Ok(()),
            other => other,
        }
    }
}

/// Pick the entry for `user_name` out of `fsutil quota query` output
pub(crate) fn parse_quota_report(report: &str, user_name: &str) -> Option<DiskQuota> {
    let wanted = user_name.to_lowercase();
    let mut in_entry = false;
    let mut quota = DiskQuota::default();
    let mut found = false;

    for line in report.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "SID Name" => {
                if found {
                    break;
                }
                // "HOST\c_ABC (User)"
                let account = value.split(" (").next().unwrap_or(value).to_lowercase();
                let name = account.rsplit('\\').next().unwrap_or(account.as_str());
                in_entry = name == wanted;
                found = in_entry;
            }
            "Quota Used" if in_entry => quota.used_bytes = value.parse().unwrap_or(0),
            "Quota Limit" if in_entry => quota.limit_bytes = value.parse().unwrap_or(NO_LIMIT),
            _ => {}
        }
    }
    found.then_some(quota)
}
