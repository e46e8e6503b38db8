//! Data model (spec.md §3) and the abstract energy provider contract (§4.D).

use std::collections::BTreeMap;

use crate::error::ProviderError;

/// Energy/power contribution of one named hardware domain (e.g. `"package"`, `"dram"`).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ComponentReading {
    pub energy_joules: f64,
    pub power_watts: f64,
}

/// One provider, one point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnergyReading {
    /// Monotonic timestamp, midpoint of the read pass (see §4.E).
    pub timestamp_ns: u64,
    pub provider_name: String,
    pub is_valid: bool,
    pub error_message: Option<String>,

    /// Cumulative energy across all active domains, in joules.
    pub total_energy_joules: f64,
    /// Average power over the interval since the previous successful reading.
    pub total_power_watts: f64,

    pub component_breakdown: BTreeMap<String, ComponentReading>,

    pub uncertainty_percent: f64,
    pub confidence: f64,
}

impl EnergyReading {
    /// `total_energy_joules == sum(component_breakdown)` within `tolerance` (relative).
    pub fn breakdown_is_consistent(&self, tolerance: f64) -> bool {
        let sum: f64 = self.component_breakdown.values().map(|c| c.energy_joules).sum();
        if self.total_energy_joules == 0.0 {
            return sum.abs() <= tolerance;
        }
        ((sum - self.total_energy_joules) / self.total_energy_joules).abs() <= tolerance
    }
}

/// Static capabilities of a provider, as reported by [`EnergyProvider::get_specification`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSpecification {
    pub provider_name: String,
    pub max_update_frequency_hz: f64,
    pub energy_resolution_joules: f64,
    pub typical_accuracy_percent: f64,
    pub supported_domains: Vec<String>,
    /// Whether this provider's readings are shared with other processes/providers
    /// (e.g. RAPL package counters are visible system-wide, not per-process).
    pub is_shared_resource: bool,
}

/// Uniform reading/specification/self-test contract implemented by every
/// concrete energy source (currently only [`crate::rapl::IntelRaplProvider`]).
///
/// Implementations are polymorphic over a small, known-at-compile-time set of
/// capabilities, so a plain trait object (`Box<dyn EnergyProvider>`) is used
/// rather than an enum dispatch table; the coordinator only ever calls these
/// methods from a single thread at a time (see spec.md §4.D).
pub trait EnergyProvider: Send {
    /// Detects hardware, opens handles, takes initial counter readings.
    fn initialize(&mut self) -> Result<(), ProviderError>;

    /// A single non-blocking read of all configured domains.
    ///
    /// On partial failure (some but not all domains readable), still returns
    /// `Ok` with `is_valid=false` and an explanatory `error_message`; the
    /// provider remains usable for future calls. Only total failure to read
    /// any domain is a hard [`ProviderError`].
    fn get_reading(&mut self) -> Result<EnergyReading, ProviderError>;

    fn get_specification(&self) -> ProviderSpecification;

    /// Takes two readings separated by at least 10ms and checks monotonicity,
    /// positive elapsed time, and non-negative energy delta. `initialize()`
    /// must call this (directly or per-domain) and fail with
    /// [`ProviderError::SelfTestFailed`] if it returns `Ok(false)` or errors.
    fn self_test(&mut self) -> Result<bool, ProviderError> {
        let a = self.get_reading()?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        let b = self.get_reading()?;
        Ok(a.is_valid
            && b.is_valid
            && b.timestamp_ns > a.timestamp_ns
            && b.total_energy_joules >= a.total_energy_joules)
    }

    /// Cumulative `(wraparounds, resets)` the backend's hardware counters
    /// have gone through so far (spec.md §4.B, §4.I). Providers with no
    /// wrapping hardware counter (e.g. a scripted test provider) report
    /// `(0, 0)`.
    fn wraparound_diagnostics(&self) -> (u64, u64) {
        (0, 0)
    }

    /// Releases handles. Idempotent.
    fn shutdown(&mut self);

    fn name(&self) -> &str;
}
