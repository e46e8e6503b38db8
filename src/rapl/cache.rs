//! Capability cache (ambient component M, SPEC_FULL.md §4.E).
//!
//! Probing which RAPL domains exist and which kernel interface serves them
//! takes tens of milliseconds (opening every sysfs file, or every
//! `/dev/cpu/N/msr`). On a fixed machine the answer never changes between
//! runs, so the detection result is cached to disk keyed by [`CpuIdentity`]
//! and invalidated whenever the CPU identity changes (e.g. a container
//! moved to different hardware).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::cpu::CpuIdentity;
use super::domains::RaplDomain;
use super::DomainOrigin;

/// Bumped whenever [`CachedCapabilities`]'s shape changes; a cache file
/// written by an older/newer format is treated as absent rather than parsed
/// (spec.md §6: "safe to discard").
pub const CACHE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedCapabilities {
    pub format_version: u32,
    pub cpu: CpuIdentity,
    pub domains: Vec<RaplDomain>,
    pub origin: CachedOrigin,
}

impl CachedCapabilities {
    pub fn new(cpu: CpuIdentity, domains: Vec<RaplDomain>, origin: CachedOrigin) -> Self {
        Self {
            format_version: CACHE_FORMAT_VERSION,
            cpu,
            domains,
            origin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedOrigin {
    Both,
    PowercapOnly,
    MsrOnly,
}

impl From<DomainOrigin> for CachedOrigin {
    fn from(origin: DomainOrigin) -> Self {
        match origin {
            DomainOrigin::Both => CachedOrigin::Both,
            DomainOrigin::PowercapOnly => CachedOrigin::PowercapOnly,
            DomainOrigin::MsrOnly => CachedOrigin::MsrOnly,
        }
    }
}

pub fn default_cache_path() -> PathBuf {
    PathBuf::from("/var/cache/nemb/rapl_capabilities.toml")
}

/// Reads the cache file, returning `None` if it is absent or stale (belongs
/// to a different CPU identity than `current`).
pub fn load(path: &Path, current: &CpuIdentity) -> Option<CachedCapabilities> {
    let content = std::fs::read_to_string(path).ok()?;
    let cached: CachedCapabilities = toml::from_str(&content).ok()?;
    if cached.format_version != CACHE_FORMAT_VERSION {
        log::info!(
            "RAPL capability cache has format_version {}, expected {}; discarding and re-probing",
            cached.format_version,
            CACHE_FORMAT_VERSION
        );
        return None;
    }
    if &cached.cpu == current {
        Some(cached)
    } else {
        log::info!("RAPL capability cache is stale (CPU identity changed); re-probing");
        None
    }
}

pub fn store(path: &Path, capabilities: &CachedCapabilities) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(capabilities).context("failed to serialize RAPL capability cache")?;
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}
