//! In-memory test harness (enabled by the `test` feature): a scriptable
//! [`EnergyProvider`] for exercising [`crate::coordinator::Coordinator`] and
//! [`crate::session::Session`] without real RAPL hardware.
//!
//! Scoped to this crate's simple, thread-based provider contract: one
//! struct that replays a fixed sequence of [`EnergyReading`]s.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use crate::error::ProviderError;
use crate::provider::{ComponentReading, EnergyProvider, EnergyReading, ProviderSpecification};

/// An [`EnergyProvider`] that replays a scripted sequence of readings, then
/// reports [`ProviderError::Unavailable`] once exhausted.
pub struct MockProvider {
    name: String,
    supported_domains: Vec<String>,
    readings: Mutex<VecDeque<EnergyReading>>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>, supported_domains: Vec<String>, readings: Vec<EnergyReading>) -> Self {
        Self {
            name: name.into(),
            supported_domains,
            readings: Mutex::new(readings.into()),
        }
    }
}

impl EnergyProvider for MockProvider {
    fn initialize(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn get_reading(&mut self) -> Result<EnergyReading, ProviderError> {
        self.readings.lock().expect("mock provider readings lock poisoned").pop_front().ok_or_else(|| {
            ProviderError::Unavailable {
                provider: self.name.clone(),
                source: anyhow::anyhow!("scripted readings exhausted"),
            }
        })
    }

    fn get_specification(&self) -> ProviderSpecification {
        ProviderSpecification {
            provider_name: self.name.clone(),
            max_update_frequency_hz: 1000.0,
            energy_resolution_joules: 1e-6,
            typical_accuracy_percent: 0.0,
            supported_domains: self.supported_domains.clone(),
            is_shared_resource: false,
        }
    }

    fn shutdown(&mut self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

/// Builds a valid, single-component [`EnergyReading`] at `timestamp_ns`, for
/// tests that only care about one domain's cumulative energy.
pub fn fixed_reading(timestamp_ns: u64, domain: &str, cumulative_joules: f64) -> EnergyReading {
    let mut component_breakdown = BTreeMap::new();
    component_breakdown.insert(
        domain.to_owned(),
        ComponentReading {
            energy_joules: cumulative_joules,
            power_watts: 0.0,
        },
    );
    EnergyReading {
        timestamp_ns,
        provider_name: "mock".to_owned(),
        is_valid: true,
        error_message: None,
        total_energy_joules: cumulative_joules,
        total_power_watts: 0.0,
        component_breakdown,
        uncertainty_percent: 0.0,
        confidence: 1.0,
    }
}
