//! Session (spec.md §4.I): starts, runs, and stops one measurement, owning
//! the sample buffer and every thread's checkpoint log, and producing the
//! immutable [`SessionResult`] collaborators consume.
//!
//! Grounded in the coordinator's own `Stopped -> Starting -> Running ->
//! Stopping -> Stopped` state machine (spec.md §4.F): the session is a thin
//! state holder one layer up, driving the coordinator's lifecycle and,
//! at `stop()`, handing the coordinator's sample buffer and the checkpoint
//! recorder's thread logs to the offline correlator (§4.H).

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use crate::checkpoint::{self, ThreadLogSnapshot};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::correlator::{self, RegionAttribution};
use crate::error::SessionError;
use crate::provider::EnergyProvider;
use crate::rapl::IntelRaplProvider;
use crate::rapl::domains::RaplDomain;
use crate::timer::PrecisionTimer;

/// Below this, an attribution counts toward `low_confidence_intervals` in
/// [`SessionDiagnostics`] (spec.md §4.H: low confidence is flagged whenever
/// fewer than 2 samples fall in the interval or it straddles a misaligned
/// tick; both cases depress `confidence` well under this threshold).
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// Diagnostic counters copied out of the coordinator, checkpoint recorder,
/// and correlator at `stop()` (spec.md §4.I).
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SessionDiagnostics {
    pub provider_restarts: u32,
    pub wraparounds_detected: u32,
    pub orphan_checkpoints: u32,
    pub low_confidence_intervals: u32,
}

/// The stable, immutable result handed to collaborators once a session is
/// stopped (spec.md §4.I). Deterministic given the same checkpoint logs and
/// sample buffer (spec.md §8 property 8).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionResult {
    pub total_duration_ns: u64,
    /// Cumulative energy reported by each active provider at the last tick.
    pub total_energy_per_provider_joules: BTreeMap<String, f64>,
    /// Cumulative energy per hardware domain, summed across providers, at
    /// the last tick.
    pub total_energy_per_domain_joules: BTreeMap<String, f64>,
    /// Keyed by `(region_id, thread_id, invocation_index)` per spec.md §4.I.
    pub attributions: BTreeMap<(u32, u64, u32), RegionAttribution>,
    pub diagnostics: SessionDiagnostics,
}

impl SessionResult {
    fn empty() -> Self {
        Self {
            total_duration_ns: 0,
            total_energy_per_provider_joules: BTreeMap::new(),
            total_energy_per_domain_joules: BTreeMap::new(),
            attributions: BTreeMap::new(),
            diagnostics: SessionDiagnostics::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    NotStarted,
    Running,
    Stopped,
}

/// Owns one coordinator and the handoff of checkpoint logs to the
/// correlator. Not `Clone`: a session models one measurement run.
pub struct Session {
    config: Config,
    coordinator: Coordinator,
    state: Mutex<SessionState>,
    start_time_ns: Mutex<u64>,
    /// Thread logs handed over explicitly (e.g. by a language runtime shim
    /// that manages its own thread lifecycle rather than using this crate's
    /// `thread_local!` registry), merged with the live global registry at
    /// `stop()`/`snapshot()`.
    extra_thread_logs: Mutex<Vec<ThreadLogSnapshot>>,
    /// Cached so that `stop()` is idempotent (spec.md §8 property 6):
    /// calling it twice returns a bit-identical result without re-running
    /// the correlator.
    result: Mutex<Option<SessionResult>>,
}

impl Session {
    /// Builds a session with one `intel_rapl` provider registered per
    /// `config.providers.intel_rapl` (spec.md §6). Registration happens here
    /// rather than lazily in `start()` because `add_provider` is only valid
    /// while the coordinator is `Stopped` (spec.md §4.F).
    pub fn new(config: Config) -> Self {
        let coordinator = Coordinator::new(config.clone());
        if config.providers.intel_rapl.enabled {
            let provider: Box<dyn EnergyProvider> = match &config.providers.intel_rapl.domains {
                Some(names) => {
                    let domains: Vec<RaplDomain> = names.iter().filter_map(|n| n.parse().ok()).collect();
                    Box::new(IntelRaplProvider::with_domains(domains))
                }
                None => Box::new(IntelRaplProvider::new()),
            };
            // A lone provider's coverage is trivially disjoint from nothing.
            let _ = coordinator.add_provider(provider, true);
        }
        Self {
            config,
            coordinator,
            state: Mutex::new(SessionState::NotStarted),
            start_time_ns: Mutex::new(0),
            extra_thread_logs: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        }
    }

    /// Starts the measurement. Fails only on a fatal condition (spec.md §7):
    /// no monotonic clock, or zero providers could be initialized.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state == SessionState::Running {
            return Ok(());
        }

        if !self.config.enabled {
            *state = SessionState::Running;
            return Ok(());
        }

        let timer = PrecisionTimer::probe().map_err(SessionError::NoMonotonicClock)?;
        *self.start_time_ns.lock().expect("start time lock poisoned") = timer.now_ns();

        self.coordinator.start_measurements().map_err(SessionError::CoordinatorStartFailed)?;
        *state = SessionState::Running;
        Ok(())
    }

    /// Registers a thread's checkpoint log out-of-band, for shims that do
    /// not record through this crate's `thread_local!` path (spec.md §4.I).
    pub fn add_thread_log(&self, log: ThreadLogSnapshot) {
        self.extra_thread_logs.lock().expect("extra thread logs lock poisoned").push(log);
    }

    /// Stops the measurement and produces the final result. Idempotent:
    /// calling this more than once returns the same result without
    /// recomputing it (spec.md §8 property 6). Always succeeds, per spec.md
    /// §7's "after start succeeds, stop always produces a result" policy —
    /// and even a session that never started produces an empty result
    /// rather than panicking.
    pub fn stop(&self) -> SessionResult {
        if let Some(cached) = self.result.lock().expect("session result lock poisoned").clone() {
            return cached;
        }

        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state == SessionState::NotStarted {
            *state = SessionState::Stopped;
            let empty = SessionResult::empty();
            *self.result.lock().expect("session result lock poisoned") = Some(empty.clone());
            return empty;
        }

        let timer = PrecisionTimer::probe().expect("stop requires a monotonic clock, just as start did");
        let stop_time_ns = timer.now_ns();
        self.coordinator.stop_measurements();
        *state = SessionState::Stopped;

        let start_time_ns = *self.start_time_ns.lock().expect("start time lock poisoned");
        let samples = self.coordinator.buffer().snapshot();

        let mut logs = checkpoint::snapshot_all();
        logs.extend(self.extra_thread_logs.lock().expect("extra thread logs lock poisoned").iter().cloned());

        let attributions = correlator::attribute(&logs, &samples, stop_time_ns);

        let mut total_energy_per_provider_joules = BTreeMap::new();
        let mut total_energy_per_domain_joules = BTreeMap::new();
        if let Some(last) = samples.last() {
            for reading in &last.readings {
                total_energy_per_provider_joules.insert(reading.provider_name.clone(), reading.total_energy_joules);
            }
            for (domain, joules) in correlator::domain_energies(last) {
                total_energy_per_domain_joules.insert(domain, joules);
            }
        }

        let orphan_checkpoints = logs.iter().flat_map(|l| l.records.iter()).filter(|r| r.orphan).count() as u32;
        let low_confidence_intervals = attributions
            .iter()
            .filter(|a| a.insufficient_samples || a.confidence < LOW_CONFIDENCE_THRESHOLD)
            .count() as u32;
        let diagnostics = self.coordinator.diagnostics();

        let result = SessionResult {
            total_duration_ns: stop_time_ns.saturating_sub(start_time_ns),
            total_energy_per_provider_joules,
            total_energy_per_domain_joules,
            attributions: attributions
                .into_iter()
                .map(|a| ((a.region_id, a.thread_id, a.invocation_index), a))
                .collect(),
            diagnostics: SessionDiagnostics {
                provider_restarts: diagnostics.provider_restarts.load(Ordering::Relaxed),
                wraparounds_detected: diagnostics.wraparounds_detected.load(Ordering::Relaxed),
                orphan_checkpoints,
                low_confidence_intervals,
            },
        };

        *self.result.lock().expect("session result lock poisoned") = Some(result.clone());
        result
    }

    /// A partial result computed without stopping the session, for live
    /// monitoring (spec.md §4.I). Never caches; `stop_time_ns` for unclosed
    /// regions is "now".
    pub fn snapshot(&self) -> SessionResult {
        if *self.state.lock().expect("session state lock poisoned") != SessionState::Running {
            return SessionResult::empty();
        }
        let timer = PrecisionTimer::probe().expect("snapshot requires a monotonic clock");
        let now_ns = timer.now_ns();
        let start_time_ns = *self.start_time_ns.lock().expect("start time lock poisoned");
        let samples = self.coordinator.buffer().snapshot();

        let mut logs = checkpoint::snapshot_all();
        logs.extend(self.extra_thread_logs.lock().expect("extra thread logs lock poisoned").iter().cloned());
        let attributions = correlator::attribute(&logs, &samples, now_ns);

        let mut total_energy_per_provider_joules = BTreeMap::new();
        let mut total_energy_per_domain_joules = BTreeMap::new();
        if let Some(last) = samples.last() {
            for reading in &last.readings {
                total_energy_per_provider_joules.insert(reading.provider_name.clone(), reading.total_energy_joules);
            }
            for (domain, joules) in correlator::domain_energies(last) {
                total_energy_per_domain_joules.insert(domain, joules);
            }
        }

        let diagnostics = self.coordinator.diagnostics();
        SessionResult {
            total_duration_ns: now_ns.saturating_sub(start_time_ns),
            total_energy_per_provider_joules,
            total_energy_per_domain_joules,
            attributions: attributions
                .into_iter()
                .map(|a| ((a.region_id, a.thread_id, a.invocation_index), a))
                .collect(),
            diagnostics: SessionDiagnostics {
                provider_restarts: diagnostics.provider_restarts.load(Ordering::Relaxed),
                wraparounds_detected: diagnostics.wraparounds_detected.load(Ordering::Relaxed),
                orphan_checkpoints: 0,
                low_confidence_intervals: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointKind;
    use crate::error::ProviderError;
    use crate::provider::{ComponentReading, EnergyReading, ProviderSpecification};
    use serial_test::serial;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

    struct FakeProvider {
        power_w: f64,
        reading_count: AtomicU64,
    }

    impl EnergyProvider for FakeProvider {
        fn initialize(&mut self) -> Result<(), ProviderError> {
            Ok(())
        }
        fn get_reading(&mut self) -> Result<EnergyReading, ProviderError> {
            let n = self.reading_count.fetch_add(1, AtomicOrdering::Relaxed);
            let t_ns = n * 1_000_000;
            let energy = self.power_w * (n as f64) * 0.001;
            let mut breakdown = Map::new();
            breakdown.insert(
                "package".to_owned(),
                ComponentReading {
                    energy_joules: energy,
                    power_watts: self.power_w,
                },
            );
            Ok(EnergyReading {
                timestamp_ns: t_ns,
                provider_name: "fake".to_owned(),
                is_valid: true,
                error_message: None,
                total_energy_joules: energy,
                total_power_watts: self.power_w,
                component_breakdown: breakdown,
                uncertainty_percent: 3.0,
                confidence: 1.0,
            })
        }
        fn get_specification(&self) -> ProviderSpecification {
            ProviderSpecification {
                provider_name: "fake".to_owned(),
                max_update_frequency_hz: 1000.0,
                energy_resolution_joules: 1e-6,
                typical_accuracy_percent: 3.0,
                supported_domains: vec!["package".to_owned()],
                is_shared_resource: true,
            }
        }
        fn shutdown(&mut self) {}
        fn name(&self) -> &str {
            "fake"
        }
    }

    fn session_with_fake_provider() -> Session {
        let mut config = Config::default();
        config.interval_ms = 1;
        config.providers.intel_rapl.enabled = false;
        let session = Session::new(config);
        session
            .coordinator
            .add_provider(
                Box::new(FakeProvider {
                    power_w: 10.0,
                    reading_count: AtomicU64::new(0),
                }),
                true,
            )
            .unwrap();
        session
    }

    #[test]
    #[serial]
    fn stop_without_start_returns_an_empty_result() {
        checkpoint::reset();
        let session = session_with_fake_provider();
        let result = session.stop();
        assert!(result.attributions.is_empty());
        assert_eq!(result.total_duration_ns, 0);
    }

    /// spec.md §8 property 6: `stop` is idempotent.
    #[test]
    #[serial]
    fn stop_is_idempotent() {
        checkpoint::reset();
        let session = session_with_fake_provider();
        session.start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let first = session.stop();
        let second = session.stop();
        assert_eq!(first.total_duration_ns, second.total_duration_ns);
        assert_eq!(first.attributions.len(), second.attributions.len());
    }

    /// spec.md §8 property 9: zero checkpoints, attribution tree empty, and
    /// totals come straight from the coordinator.
    #[test]
    #[serial]
    fn zero_checkpoints_yields_empty_attributions_but_nonzero_totals() {
        checkpoint::reset();
        let session = session_with_fake_provider();
        session.start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let result = session.stop();
        assert!(result.attributions.is_empty());
        assert!(result.total_energy_per_provider_joules.contains_key("fake"));
    }

    #[test]
    #[serial]
    fn disabled_session_is_a_no_op() {
        checkpoint::reset();
        let mut config = Config::default();
        config.enabled = false;
        config.providers.intel_rapl.enabled = false;
        let session = Session::new(config);
        session.start().unwrap();
        let result = session.stop();
        assert!(result.attributions.is_empty());
    }

    #[test]
    #[serial]
    fn checkpoints_recorded_during_a_session_are_attributed() {
        checkpoint::reset();
        let session = session_with_fake_provider();
        session.start().unwrap();

        let timer = PrecisionTimer::probe().unwrap();
        checkpoint::record(timer.now_ns(), "hot_loop", CheckpointKind::Enter);
        std::thread::sleep(std::time::Duration::from_millis(5));
        checkpoint::record(timer.now_ns(), "hot_loop", CheckpointKind::Exit);
        std::thread::sleep(std::time::Duration::from_millis(5));

        let result = session.stop();
        assert_eq!(result.attributions.len(), 1);
        let attribution = result.attributions.values().next().unwrap();
        assert!(attribution.duration_ns > 0);
    }
}
