use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

pub const MOUNT_TABLE: &str = "/proc/mounts";

/// One NFS entry of the local mount table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NfsMount {
    pub server: String,
    pub export: String,
    pub mount_point: String,
    pub options: Vec<String>,
    #[serde(rename = "type")]
    pub fs_type: String,
}

/// Parse `/proc/mounts` content, keeping `nfs` and `nfs4` entries only.
pub fn parse_nfs_mounts(table: &str) -> Vec<NfsMount> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = unescape(fields.next()?);
            let mount_point = unescape(fields.next()?);
            let fs_type = fields.next()?;
            if fs_type != "nfs" && fs_type != "nfs4" {
                return None;
            }
            let options = fields
                .next()
                .map(|o| o.split(',').map(str::to_string).collect())
                .unwrap_or_default();
            let (server, export) = source.split_once(':')?;
            Some(NfsMount {
                server: server.to_string(),
                export: export.to_string(),
                mount_point,
                options,
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

pub async fn read_nfs_mounts(table: &Path) -> Result<Vec<NfsMount>> {
    let content = tokio::fs::read_to_string(table)
        .await
        .with_context(|| format!("failed to read mount table: {}", table.display()))?;
    Ok(parse_nfs_mounts(&content))
}

pub fn is_mounted(mounts: &[NfsMount], server: &str, export: &str) -> bool {
    mounts.iter().any(|m| m.server == server && m.export == export)
}

/// The kernel writes space, tab, newline and backslash as `\ooo` octal escapes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let code = bytes[i + 1..i + 4].iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(b) = u8::try_from(code) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
