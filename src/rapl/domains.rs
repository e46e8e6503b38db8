//! RAPL domain identifiers, shared by both the sysfs powercap and MSR backends.

use std::{fmt, str::FromStr};

/// A named subset of RAPL energy accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, enum_map::Enum, serde::Serialize, serde::Deserialize)]
pub enum RaplDomain {
    /// Entire socket.
    Package,
    /// Power plane 0: cores.
    Pp0,
    /// Power plane 1: uncore (graphics on client parts).
    Pp1,
    /// DRAM.
    Dram,
    /// Platform-wide ("psys"), only on recent client platforms.
    Psys,
}

impl RaplDomain {
    pub const ALL: [RaplDomain; 5] = [
        RaplDomain::Package,
        RaplDomain::Pp0,
        RaplDomain::Pp1,
        RaplDomain::Dram,
        RaplDomain::Psys,
    ];

    /// Lowercase name used in `component_breakdown` keys and sysfs `name` files.
    pub fn as_str(&self) -> &'static str {
        match self {
            RaplDomain::Package => "package",
            RaplDomain::Pp0 => "pp0",
            RaplDomain::Pp1 => "pp1",
            RaplDomain::Dram => "dram",
            RaplDomain::Psys => "psys",
        }
    }

    /// Whether this domain is a strict subset of [`RaplDomain::Package`] and
    /// must never be summed alongside it (spec.md §4.C).
    pub fn is_package_subset(&self) -> bool {
        matches!(self, RaplDomain::Pp0 | RaplDomain::Pp1)
    }
}

impl fmt::Display for RaplDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RaplDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "package" | "pkg" | "package-0" => Ok(RaplDomain::Package),
            "pp0" | "core" => Ok(RaplDomain::Pp0),
            "pp1" | "uncore" => Ok(RaplDomain::Pp1),
            "dram" | "ram" => Ok(RaplDomain::Dram),
            "platform" | "psys" => Ok(RaplDomain::Psys),
            other if other.starts_with("package-") => Ok(RaplDomain::Package),
            other => Err(other.to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for domain in RaplDomain::ALL {
            let parsed: RaplDomain = domain.as_str().parse().unwrap();
            assert_eq!(parsed, domain);
        }
    }

    #[test]
    fn package_subsets_are_flagged() {
        assert!(RaplDomain::Pp0.is_package_subset());
        assert!(RaplDomain::Pp1.is_package_subset());
        assert!(!RaplDomain::Package.is_package_subset());
        assert!(!RaplDomain::Psys.is_package_subset());
    }

    #[test]
    fn package_n_parses_to_package() {
        assert_eq!("package-1".parse::<RaplDomain>().unwrap(), RaplDomain::Package);
    }
}
