//! Local NFS role: whether this host can serve exports, mount them, and what it has mounted.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use crate::mounts::{self, NfsMount};

const SERVER_UNITS: [&str; 3] = ["nfs-server", "nfs-kernel-server", "nfs-utils"];
const CLIENT_HELPER: &str = "mount.nfs";
const SBIN_DIRS: [&str; 2] = ["/sbin", "/usr/sbin"];
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMount {
    /// `server:export`
    pub source: String,
    pub mount_point: String,
}

impl From<&NfsMount> for ActiveMount {
    fn from(m: &NfsMount) -> Self {
        Self {
            source: format!("{}:{}", m.server, m.export),
            mount_point: m.mount_point.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NfsRole {
    pub is_server: bool,
    pub is_client: bool,
    pub active_mounts: Vec<ActiveMount>,
    pub hostname: String,
    pub platform: String,
    pub release: String,
}

/// Inspect the local host. Every check degrades to "no" instead of failing.
pub async fn detect(mount_table: &Path) -> NfsRole {
    let (is_server, helper, hostname, release) = tokio::join!(
        detect_server(),
        find_executable(CLIENT_HELPER, search_dirs()),
        read_kernel_value("/proc/sys/kernel/hostname"),
        read_kernel_value("/proc/sys/kernel/osrelease"),
    );
    let active_mounts = match mounts::read_nfs_mounts(mount_table).await {
        Ok(list) => list.iter().map(ActiveMount::from).collect(),
        Err(e) => {
            warn!("{e:#}");
            Vec::new()
        }
    };
    NfsRole {
        is_server,
        is_client: helper.is_some(),
        active_mounts,
        hostname,
        platform: env::consts::OS.to_string(),
        release,
    }
}

/// Whether `systemctl list-unit-files` output has an NFS server unit that is enabled or static.
pub fn server_unit_enabled(unit_files: &str) -> bool {
    unit_files.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let (Some(unit), Some(state)) = (fields.next(), fields.next()) else {
            return false;
        };
        let name = unit.rsplit_once('.').map_or(unit, |(name, _)| name);
        SERVER_UNITS.contains(&name) && matches!(state, "enabled" | "static")
    })
}

/// First directory in `dirs` holding a file called `name`.
pub async fn find_executable<I>(name: &str, dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    for dir in dirs {
        let candidate = dir.join(name);
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            if meta.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// `$PATH` plus the sbin directories, which are often missing from a service's path.
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = env::var_os("PATH")
        .map(|p| env::split_paths(&p).collect())
        .unwrap_or_default();
    for extra in SBIN_DIRS {
        let extra = PathBuf::from(extra);
        if !dirs.contains(&extra) {
            dirs.push(extra);
        }
    }
    dirs
}

async fn detect_server() -> bool {
    let run = Command::new("systemctl")
        .arg("list-unit-files")
        .arg("--no-legend")
        .kill_on_drop(true)
        .output();
    match time::timeout(SYSTEMCTL_TIMEOUT, run).await {
        Ok(Ok(out)) => server_unit_enabled(&String::from_utf8_lossy(&out.stdout)),
        Ok(Err(e)) => {
            debug!("systemctl unavailable: {e}");
            false
        }
        Err(_) => {
            debug!("systemctl timed out");
            false
        }
    }
}

async fn read_kernel_value(path: &str) -> String {
    tokio::fs::read_to_string(path)
        .await
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_units_need_enabled_or_static_state() {
        let listing = "\
nfs-blkmap.service                     disabled        enabled
nfs-server.service                     enabled         enabled
ssh.service                            enabled         enabled
";
        assert!(server_unit_enabled(listing));
        assert!(server_unit_enabled("nfs-utils.service static -\n"));
        assert!(!server_unit_enabled("nfs-kernel-server.service masked enabled\n"));
        assert!(!server_unit_enabled("nfs-serverless.service enabled enabled\n"));
        assert!(!server_unit_enabled(""));
    }

    #[tokio::test]
    async fn finds_helper_in_later_directory() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join(CLIENT_HELPER), b"").unwrap();

        let dirs = vec![empty.path().to_path_buf(), bin.path().to_path_buf()];
        assert_eq!(find_executable(CLIENT_HELPER, dirs).await, Some(bin.path().join(CLIENT_HELPER)));
        assert_eq!(find_executable(CLIENT_HELPER, vec![empty.path().to_path_buf()]).await, None);
    }

    #[tokio::test]
    async fn role_lists_mounts_from_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(&table, "10.0.0.5:/srv/share /mnt/share nfs4 rw 0 0\n/dev/sda1 / ext4 rw 0 0\n").unwrap();

        let role = detect(&table).await;
        assert_eq!(
            role.active_mounts,
            vec![ActiveMount { source: "10.0.0.5:/srv/share".into(), mount_point: "/mnt/share".into() }]
        );
        assert_eq!(role.platform, env::consts::OS);

        let missing = detect(&dir.path().join("missing")).await;
        assert!(missing.active_mounts.is_empty());
    }
}
