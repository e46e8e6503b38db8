//! CPU identification used to select MSR addresses and key the capability cache.
//!
//! Reads `/proc/cpuinfo` directly (vendor/family/model) rather than
//! shelling out to `lscpu`, so detection does not depend on that binary
//! being installed (see DESIGN.md).

use anyhow::{Context, Result, anyhow};
use std::{fs, num::ParseIntError, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

/// A CPU identifier: logical cpu number and the socket (package) that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId {
    pub cpu: u32,
    pub socket: u32,
}

/// Stable identity of the detected CPU, used as the capability-cache key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CpuIdentity {
    pub vendor: String,
    pub family: u32,
    pub model: u32,
}

pub fn cpu_vendor() -> Result<CpuVendor> {
    cpu_vendor_from_cpuinfo(Path::new("/proc/cpuinfo"))
}

fn cpu_vendor_from_cpuinfo(path: &Path) -> Result<CpuVendor> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse_vendor(&content)
}

fn parse_vendor(cpuinfo: &str) -> Result<CpuVendor> {
    let vendor_id = cpuinfo
        .lines()
        .find_map(|line| line.strip_prefix("vendor_id").and_then(|rest| rest.split(':').nth(1)))
        .map(str::trim)
        .context("vendor_id not found in /proc/cpuinfo")?;

    match vendor_id {
        "GenuineIntel" => Ok(CpuVendor::Intel),
        "AuthenticAMD" => Ok(CpuVendor::Amd),
        other => Err(anyhow!("unsupported CPU vendor {other}")),
    }
}

pub fn cpu_identity() -> Result<CpuIdentity> {
    cpu_identity_from_cpuinfo(Path::new("/proc/cpuinfo"))
}

fn cpu_identity_from_cpuinfo(path: &Path) -> Result<CpuIdentity> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let vendor = parse_vendor(&content)?;

    fn field(cpuinfo: &str, key: &str) -> Result<u32> {
        cpuinfo
            .lines()
            .find_map(|line| line.strip_prefix(key).and_then(|rest| rest.split(':').nth(1)))
            .map(str::trim)
            .context(format!("{key} not found in /proc/cpuinfo"))?
            .parse()
            .with_context(|| format!("failed to parse {key}"))
    }

    Ok(CpuIdentity {
        vendor: match vendor {
            CpuVendor::Intel => "GenuineIntel".to_owned(),
            CpuVendor::Amd => "AuthenticAMD".to_owned(),
        },
        family: field(&content, "cpu family")?,
        model: field(&content, "model")?,
    })
}

fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    fn parse_item(item: &str) -> Result<Vec<u32>, ParseIntError> {
        let bounds = item.split('-').map(str::parse).collect::<Result<Vec<u32>, _>>()?;
        Ok(match *bounds.as_slice() {
            [start, end] => (start..=end).collect(),
            [n] => vec![n],
            _ => vec![],
        })
    }

    list.trim_end()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|item| parse_item(item).with_context(|| format!("invalid cpu list item: {item}")))
        .collect::<Result<Vec<Vec<u32>>>>()
        .map(|v| v.into_iter().flatten().collect())
}

/// One CPU to monitor per socket, assuming `/sys/devices/power/cpumask` (or
/// an equivalent online-cpu list) returns one representative CPU per socket.
pub fn cpus_to_monitor() -> Result<Vec<CpuId>> {
    cpus_to_monitor_from_path(Path::new("/sys/devices/power/cpumask"))
}

fn cpus_to_monitor_from_path(path: &Path) -> Result<Vec<CpuId>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let cpus = parse_cpu_list(&raw)?;
    Ok(cpus
        .into_iter()
        .enumerate()
        .map(|(i, cpu)| CpuId { cpu, socket: i as u32 })
        .collect())
}
