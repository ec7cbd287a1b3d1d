//! Library crate for nfs-discover-rs: background NFS server discovery with pollable progress.
pub mod config;
pub mod error;
pub mod mounts;
pub mod netdetect;
pub mod plan;
pub mod probe;
pub mod registry;
pub mod role;
pub mod scanner;
pub mod server;
pub mod service;
pub mod types;
