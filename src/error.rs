use thiserror::Error;

/// Errors surfaced by the discovery service to its callers.
///
/// Per-host probe failures never show up here; they degrade to "not found"
/// inside the prober. Sweep-fatal errors are recorded on the scan snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("{0} required")]
    MissingParameter(&'static str),

    #[error("invalid network: {0:?} (expected a.b.c, a.b.c.0 or a.b.c.0/24)")]
    InvalidNetwork(String),

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("scan {0} already exists")]
    DuplicateScan(String),

    #[error("scan {0} not found")]
    ScanNotFound(String),

    #[error("scan {0} has already finished")]
    ScanFinished(String),
}

impl DiscoveryError {
    /// Whether the caller sent something unusable (maps to HTTP 400).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter(_) | Self::InvalidNetwork(_) | Self::InvalidAddress(_)
        )
    }
}
