//! sysfs powercap backend (spec.md §4.E, §6).
//!
//! Walks the `name`/`energy_uj`/`max_energy_range_uj` sysfs file layout
//! with a "rewind + read_to_end" read pattern. Raw microjoule counters are
//! fed through [`crate::counter::WraparoundCounter`] (time-qualified reset
//! detection), and the probe reports *cumulative* joules rather than a
//! per-tick delta, since the correlator (§4.H) interpolates a cumulative
//! energy curve.

use anyhow::{Context, Result, anyhow};
use std::{
    fmt,
    fs::{self, File},
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use crate::counter::{WraparoundCounter, WraparoundUpdate};
use crate::rapl::domains::RaplDomain;

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
const POWER_ZONE_PREFIX: &str = "intel-rapl";
const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microjoule

#[derive(Debug, Clone, PartialEq)]
pub struct PowerZone {
    pub name: String,
    pub domain: RaplDomain,
    pub path: PathBuf,
    pub socket_id: Option<u32>,
    pub children: Vec<PowerZone>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }
}

impl fmt::Display for PowerZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.domain)
    }
}

pub fn all_power_zones() -> Result<Vec<PowerZone>> {
    all_power_zones_from_path(Path::new(POWERCAP_RAPL_PATH))
}

pub fn all_power_zones_from_path(path: &Path) -> Result<Vec<PowerZone>> {
    fn collect(zone: &PowerZone, flat: &mut Vec<PowerZone>) {
        flat.push(zone.clone());
        for child in &zone.children {
            collect(child, flat);
        }
    }

    let mut flat = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))? {
        let entry_path = entry?.path();
        if let Some(zone) = zone_from_path(&entry_path)? {
            collect(&zone, &mut flat);
        }
    }
    flat.sort_by_key(|z| z.path.to_string_lossy().into_owned());
    Ok(flat)
}

fn is_zone_path(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    path.is_dir() && name.starts_with(POWER_ZONE_PREFIX)
}

fn zone_from_path(path: &Path) -> Result<Option<PowerZone>> {
    if !is_zone_path(path) {
        return Ok(None);
    }

    let name = fs::read_to_string(path.join("name"))?.trim().to_owned();
    let socket_id = socket_id_from_name(&name).or_else(|| {
        path.parent()
            .and_then(|parent| fs::read_to_string(parent.join("name")).ok())
            .and_then(|parent_name| socket_id_from_name(parent_name.trim()))
    });
    let domain: RaplDomain = name.parse().map_err(|_| anyhow!("unknown RAPL powercap zone {name}"))?;

    let mut children = Vec::new();
    for entry in fs::read_dir(path)? {
        let child_path = entry?.path();
        if let Some(child) = zone_from_path(&child_path)? {
            children.push(child);
        }
    }

    Ok(Some(PowerZone {
        name,
        domain,
        path: path.to_path_buf(),
        socket_id,
        children,
    }))
}

fn socket_id_from_name(name: &str) -> Option<u32> {
    name.strip_prefix("package-").and_then(|id| id.parse().ok())
}

/// An opened zone, ready to be polled for its cumulative energy.
pub struct OpenedZone {
    file: File,
    pub domain: RaplDomain,
    pub socket_id: u32,
    counter: WraparoundCounter,
}

impl OpenedZone {
    pub fn open(zone: &PowerZone) -> Result<Self> {
        let file = File::open(zone.energy_path())
            .with_context(|| format!("could not open {}", zone.energy_path().display()))?;
        let max_energy_uj: u64 = fs::read_to_string(zone.max_energy_path())
            .with_context(|| format!("could not read {}", zone.max_energy_path().display()))?
            .trim_end()
            .parse()
            .context("failed to parse max_energy_range_uj")?;

        Ok(Self {
            file,
            domain: zone.domain,
            socket_id: zone.socket_id.unwrap_or(0),
            counter: WraparoundCounter::new(max_energy_uj),
        })
    }

    fn read_raw_uj(&mut self, buf: &mut Vec<u8>) -> Result<u64> {
        self.file.rewind().context("failed to rewind energy_uj")?;
        buf.clear();
        self.file.read_to_end(buf).context("failed to read energy_uj")?;
        std::str::from_utf8(buf)
            .context("energy_uj is not valid utf-8")?
            .trim_end()
            .parse()
            .context("failed to parse energy_uj")
    }

    /// Reads the current value and returns the cumulative energy in joules,
    /// or `None` on the very first read (no delta/accumulation exists yet).
    pub fn poll_cumulative_joules(&mut self, t_ns: u64, buf: &mut Vec<u8>) -> Result<Option<f64>> {
        let raw = self.read_raw_uj(buf)?;
        match self.counter.update(raw, t_ns) {
            WraparoundUpdate::FirstTime => Ok(None),
            WraparoundUpdate::Reset => {
                log::debug!("counter reset on powercap zone {:?}", self.domain);
                Ok(Some(self.counter.accumulated() as f64 * POWERCAP_ENERGY_UNIT))
            }
            WraparoundUpdate::Wraparound(_) | WraparoundUpdate::Difference(_) => {
                Ok(Some(self.counter.accumulated() as f64 * POWERCAP_ENERGY_UNIT))
            }
        }
    }

    pub fn wraparound_count(&self) -> u64 {
        self.counter.wraparound_count()
    }

    pub fn reset_count(&self) -> u64 {
        self.counter.reset_count()
    }
}

/// A domain is available (spec.md §4.E point 4) iff its counter reads
/// successfully twice in a row with a non-negative delta.
pub fn probe_zone_availability(zone: &PowerZone, timer: &crate::timer::PrecisionTimer) -> bool {
    let Ok(mut opened) = OpenedZone::open(zone) else {
        return false;
    };
    let mut buf = Vec::with_capacity(16);
    let first = opened.poll_cumulative_joules(timer.now_ns(), &mut buf);
    std::thread::sleep(std::time::Duration::from_millis(1));
    let second = opened.poll_cumulative_joules(timer.now_ns(), &mut buf);
    matches!((first, second), (Ok(_), Ok(_)))
}
