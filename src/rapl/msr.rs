//! MSR backend (spec.md §4.E, §6): reads RAPL energy counters directly from
//! Model Specific Registers via `/dev/cpu/<n>/msr`.
//!
//! Grounded in the comparative-analysis example's `rapl_probes::msr` module:
//! the register address tables, the `pread`-at-offset read pattern, and the
//! energy-unit bit extraction are kept close to the original. What changes:
//! vendor detection goes through [`crate::rapl::cpu`] (no `lscpu` subprocess),
//! and every domain's 32-bit counter is fed through
//! [`crate::counter::WraparoundCounter`] since MSR registers wrap far more
//! often than sysfs `energy_uj` (§4.B, §4.E point 5).

use anyhow::{Context, Result, anyhow};
use std::{fs::File, os::unix::fs::FileExt};

use crate::counter::WraparoundCounter;
use crate::rapl::cpu::CpuVendor;
use crate::rapl::domains::RaplDomain;

type Addr = u64;

mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x0000_0606;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x0000_0611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x0000_0639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x0000_0641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x0000_0619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000_064D;
}

mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc001_0299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001_029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001_029b;
}

const MSR_ENERGY_MASK: u64 = 0xffff_ffff;
const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

/// Resolves the MSR address for `domain` on `vendor`, or `None` if that
/// vendor's RAPL implementation doesn't expose the domain over MSR.
pub fn domain_msr_address(domain: RaplDomain, vendor: CpuVendor) -> Option<Addr> {
    match vendor {
        CpuVendor::Intel => match domain {
            RaplDomain::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomain::Pp0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomain::Pp1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomain::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomain::Psys => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        CpuVendor::Amd => match domain {
            RaplDomain::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomain::Pp0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomain::Pp1 | RaplDomain::Dram | RaplDomain::Psys => None,
        },
    }
}

pub fn domains_available_on(vendor: CpuVendor) -> Vec<RaplDomain> {
    RaplDomain::ALL
        .into_iter()
        .filter(|d| domain_msr_address(*d, vendor).is_some())
        .collect()
}

fn read_msr(fd: &File, at: Addr) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    fd.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

/// Bits 12:8 of `MSR_RAPL_POWER_UNIT` give the energy unit as `1/(2^esu)` joules.
fn read_energy_unit(fd: &File, vendor: CpuVendor) -> Result<f64> {
    let offset = match vendor {
        CpuVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        CpuVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    let raw = read_msr(fd, offset).context("failed to read MSR_RAPL_POWER_UNIT")?;
    let esu = (raw & 0x1F00) >> 8;
    Ok(0.5_f64.powi(esu as i32))
}

/// One open `/dev/cpu/<n>/msr` handle, tracking one socket's worth of domains.
pub struct MsrSocket {
    fd: File,
    pub socket_id: u32,
    pub energy_unit_joules: f64,
    counters: Vec<(RaplDomain, Addr, WraparoundCounter)>,
}

impl MsrSocket {
    pub fn open(cpu: u32, socket_id: u32, vendor: CpuVendor, domains: &[RaplDomain]) -> Result<Self> {
        let path = format!("/dev/cpu/{cpu}/msr");
        let fd = File::open(&path).with_context(|| format!("failed to open {path}"))?;
        let energy_unit_joules = read_energy_unit(&fd, vendor)?;

        let counters = domains
            .iter()
            .map(|&domain| {
                let addr =
                    domain_msr_address(domain, vendor).ok_or_else(|| anyhow!("{domain} has no MSR address on {vendor:?}"))?;
                Ok((domain, addr, WraparoundCounter::new(MSR_MAX_ENERGY)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fd,
            socket_id,
            energy_unit_joules,
            counters,
        })
    }

    /// Polls every tracked domain once, returning `(domain, cumulative_joules)`
    /// pairs; a domain is omitted on its very first poll (no delta exists yet).
    pub fn poll(&mut self, t_ns: u64) -> Result<Vec<(RaplDomain, f64)>> {
        let mut out = Vec::with_capacity(self.counters.len());
        for (domain, addr, counter) in &mut self.counters {
            let raw = read_msr(&self.fd, *addr)
                .with_context(|| format!("failed to read MSR {addr:#x} for {domain}"))?
                & MSR_ENERGY_MASK;
            match counter.update(raw, t_ns) {
                crate::counter::WraparoundUpdate::FirstTime => {}
                _ => out.push((*domain, counter.accumulated() as f64 * self.energy_unit_joules)),
            }
        }
        Ok(out)
    }

    pub fn wraparound_count(&self) -> u64 {
        self.counters.iter().map(|(_, _, c)| c.wraparound_count()).sum()
    }

    pub fn reset_count(&self) -> u64 {
        self.counters.iter().map(|(_, _, c)| c.reset_count()).sum()
    }
}
