//! Measurement coordinator (spec.md §4.F, §5).
//!
//! Built on plain OS threads, no async runtime (see `REDESIGN FLAGS` in
//! SPEC_FULL.md): the sampler and health monitor are `std::thread::spawn`'d
//! loops, cooperative cancellation is a shared atomic flag, and the
//! per-provider state machine is a small CAS-guarded `AtomicU8`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::buffer::{SampleBuffer, SynchronizedReading};
use crate::config::Config;
use crate::error::CoordinatorError;
use crate::provider::EnergyProvider;
use crate::timer::PrecisionTimer;

/// A provider is skipped by the sampler unless it is `Active`; the health
/// monitor moves it through `HealthCheck` while restarting it (spec.md §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProviderState {
    Active = 0,
    HealthCheck = 1,
    Failed = 2,
    Shutdown = 3,
}

impl ProviderState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProviderState::Active,
            1 => ProviderState::HealthCheck,
            2 => ProviderState::Failed,
            _ => ProviderState::Shutdown,
        }
    }
}

struct AtomicProviderState(AtomicU8);

impl AtomicProviderState {
    fn new(state: ProviderState) -> Self {
        Self(AtomicU8::new(state as u8))
    }
    fn load(&self) -> ProviderState {
        ProviderState::from_u8(self.0.load(Ordering::Acquire))
    }
    fn store(&self, state: ProviderState) {
        self.0.store(state as u8, Ordering::Release);
    }
    /// Succeeds only if the current state matches `current`.
    fn compare_set(&self, current: ProviderState, new: ProviderState) -> bool {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct ManagedProvider {
    provider: Mutex<Box<dyn EnergyProvider>>,
    state: AtomicProviderState,
    consecutive_failures: AtomicU32,
    /// Declared once at registration: whether this provider's coverage is
    /// disjoint from the others and should be summed into
    /// `total_system_*` (spec.md §4.C, §4.F).
    disjoint: bool,
    permanently_failed: AtomicBool,
    /// Cumulative wraparound/reset counts last observed on this provider's
    /// backend, used to fold only the *new* events into
    /// `CoordinatorDiagnostics.wraparounds_detected` each tick.
    last_wraparound_count: AtomicU64,
    last_reset_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// How many consecutive restart attempts a provider may fail before the
/// health monitor gives up on it permanently (spec.md §4.F).
const MAX_RESTART_ATTEMPTS: u32 = 5;
const CONSECUTIVE_FAILURES_BEFORE_RESTART: u32 = 3;
const EMA_WINDOW: usize = 5;
const OUTLIER_WINDOW: usize = 100;
const OUTLIER_SIGMA: f64 = 3.0;

pub struct Coordinator {
    config: Config,
    state: Mutex<CoordinatorState>,
    providers: Mutex<Vec<Arc<ManagedProvider>>>,
    buffer: Arc<SampleBuffer>,
    stop_flag: Arc<AtomicBool>,
    sampler_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    health_wakeup: Arc<(Mutex<bool>, Condvar)>,
    diagnostics: Arc<CoordinatorDiagnostics>,
}

/// Diagnostic counters, copied out into `SessionResult` at stop (spec.md §4.I).
#[derive(Default)]
pub struct CoordinatorDiagnostics {
    pub provider_restarts: AtomicU32,
    pub wraparounds_detected: AtomicU32,
    pub low_confidence_ticks: AtomicU32,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let buffer_size = config.buffer_size;
        Self {
            config,
            state: Mutex::new(CoordinatorState::Stopped),
            providers: Mutex::new(Vec::new()),
            buffer: Arc::new(SampleBuffer::new(buffer_size)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            sampler_handle: Mutex::new(None),
            health_handle: Mutex::new(None),
            health_wakeup: Arc::new((Mutex::new(false), Condvar::new())),
            diagnostics: Arc::new(CoordinatorDiagnostics::default()),
        }
    }

    pub fn buffer(&self) -> Arc<SampleBuffer> {
        self.buffer.clone()
    }

    pub fn diagnostics(&self) -> Arc<CoordinatorDiagnostics> {
        self.diagnostics.clone()
    }

    fn current_state(&self) -> CoordinatorState {
        *self.state.lock().expect("coordinator state lock poisoned")
    }

    /// Registers a provider. Valid only while `Stopped` (spec.md §4.F).
    pub fn add_provider(&self, provider: Box<dyn EnergyProvider>, disjoint: bool) -> Result<(), CoordinatorError> {
        if self.current_state() != CoordinatorState::Stopped {
            return Err(CoordinatorError::InvalidState {
                expected: "Stopped".to_owned(),
                actual: format!("{:?}", self.current_state()),
            });
        }
        let managed = Arc::new(ManagedProvider {
            provider: Mutex::new(provider),
            state: AtomicProviderState::new(ProviderState::Shutdown),
            consecutive_failures: AtomicU32::new(0),
            disjoint,
            permanently_failed: AtomicBool::new(false),
            last_wraparound_count: AtomicU64::new(0),
            last_reset_count: AtomicU64::new(0),
        });
        self.providers.lock().expect("providers lock poisoned").push(managed);
        Ok(())
    }

    /// Removes every registered provider whose name matches. Valid only while `Stopped`.
    pub fn remove_provider(&self, name: &str) -> Result<(), CoordinatorError> {
        if self.current_state() != CoordinatorState::Stopped {
            return Err(CoordinatorError::InvalidState {
                expected: "Stopped".to_owned(),
                actual: format!("{:?}", self.current_state()),
            });
        }
        let mut providers = self.providers.lock().expect("providers lock poisoned");
        providers.retain(|p| p.provider.lock().expect("provider lock poisoned").name() != name);
        Ok(())
    }

    /// Initializes every registered provider and starts the sampler and
    /// health-monitor threads. Fails only if zero providers initialize.
    pub fn start_measurements(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = self.state.lock().expect("coordinator state lock poisoned");
            if *state != CoordinatorState::Stopped {
                return Err(CoordinatorError::InvalidState {
                    expected: "Stopped".to_owned(),
                    actual: format!("{state:?}"),
                });
            }
            *state = CoordinatorState::Starting;
        }

        let providers = self.providers.lock().expect("providers lock poisoned").clone();
        let mut succeeded = 0;
        for managed in &providers {
            let mut provider = managed.provider.lock().expect("provider lock poisoned");
            match provider.initialize() {
                Ok(()) => {
                    managed.state.store(ProviderState::Active);
                    succeeded += 1;
                }
                Err(e) => {
                    log::warn!("provider {} failed to initialize: {e}", provider.name());
                    managed.state.store(ProviderState::Failed);
                }
            }
        }

        if succeeded == 0 {
            *self.state.lock().expect("coordinator state lock poisoned") = CoordinatorState::Stopped;
            return Err(CoordinatorError::NoProvidersAvailable);
        }

        self.stop_flag.store(false, Ordering::SeqCst);

        let sampler = spawn_sampler_thread(
            providers.clone(),
            self.buffer.clone(),
            self.stop_flag.clone(),
            self.config.clone(),
            self.diagnostics.clone(),
        )
        .map_err(CoordinatorError::ThreadSpawnFailed)?;
        *self.sampler_handle.lock().expect("sampler handle lock poisoned") = Some(sampler);

        let health = spawn_health_thread(
            providers,
            self.stop_flag.clone(),
            self.health_wakeup.clone(),
            self.config.clone(),
            self.diagnostics.clone(),
        )
        .map_err(CoordinatorError::ThreadSpawnFailed)?;
        *self.health_handle.lock().expect("health handle lock poisoned") = Some(health);

        *self.state.lock().expect("coordinator state lock poisoned") = CoordinatorState::Running;
        Ok(())
    }

    /// Idempotent: calling this while already `Stopped` is a no-op.
    pub fn stop_measurements(&self) {
        {
            let mut state = self.state.lock().expect("coordinator state lock poisoned");
            if *state == CoordinatorState::Stopped {
                return;
            }
            *state = CoordinatorState::Stopping;
        }

        self.stop_flag.store(true, Ordering::SeqCst);
        {
            let (lock, cvar) = &*self.health_wakeup;
            *lock.lock().expect("health wakeup lock poisoned") = true;
            cvar.notify_all();
        }

        if let Some(handle) = self.sampler_handle.lock().expect("sampler handle lock poisoned").take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.health_handle.lock().expect("health handle lock poisoned").take() {
            let _ = handle.join();
        }

        for managed in self.providers.lock().expect("providers lock poisoned").iter() {
            managed.provider.lock().expect("provider lock poisoned").shutdown();
            managed.state.store(ProviderState::Shutdown);
        }

        *self.state.lock().expect("coordinator state lock poisoned") = CoordinatorState::Stopped;
    }
}

fn spawn_sampler_thread(
    providers: Vec<Arc<ManagedProvider>>,
    buffer: Arc<SampleBuffer>,
    stop_flag: Arc<AtomicBool>,
    config: Config,
    diagnostics: Arc<CoordinatorDiagnostics>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("nemb-sampler".into()).spawn(move || {
        let _timer = PrecisionTimer::probe().expect("sampler requires a monotonic clock");
        let interval = config.measurement_interval();
        let tolerance_ns = (config.alignment_tolerance_ms * 1_000_000.0) as u64;
        let mut power_history: VecDeque<f64> = VecDeque::with_capacity(OUTLIER_WINDOW);
        let mut ema_power: Option<f64> = None;

        let mut deadline = Instant::now() + interval;
        while !stop_flag.load(Ordering::SeqCst) {
            let reading = sample_tick(&providers, tolerance_ns, config.cross_validation_threshold, &diagnostics);
            if let Some(mut reading) = reading {
                if config.enable_filtering {
                    let alpha = 2.0 / (EMA_WINDOW as f64 + 1.0);
                    ema_power = Some(match ema_power {
                        Some(prev) => alpha * reading.total_system_power_watts + (1.0 - alpha) * prev,
                        None => reading.total_system_power_watts,
                    });
                }
                if config.enable_outlier_detection {
                    if power_history.len() == OUTLIER_WINDOW {
                        power_history.pop_front();
                    }
                    power_history.push_back(reading.total_system_power_watts);
                    if power_history.len() >= 2 {
                        let is_outlier = is_outlier_3sigma(&power_history, reading.total_system_power_watts);
                        if is_outlier {
                            log::debug!("power reading flagged as an outlier (not dropped): {}", reading.total_system_power_watts);
                        }
                    }
                }
                if !reading.temporal_alignment_valid {
                    diagnostics.low_confidence_ticks.fetch_add(1, Ordering::Relaxed);
                }
                reading.max_provider_uncertainty = reading
                    .readings
                    .iter()
                    .map(|r| r.uncertainty_percent)
                    .fold(0.0_f64, f64::max);
                buffer.push(reading);
            }

            let now = Instant::now();
            if now < deadline {
                std::thread::sleep(deadline - now);
            }
            deadline += interval;
            if stop_flag.load(Ordering::SeqCst) {
                break;
            }
        }
    })
}

fn is_outlier_3sigma(history: &VecDeque<f64>, value: f64) -> bool {
    let n = history.len() as f64;
    let mean: f64 = history.iter().sum::<f64>() / n;
    let variance: f64 = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();
    stddev > 0.0 && (value - mean).abs() > OUTLIER_SIGMA * stddev
}

fn sample_tick(
    providers: &[Arc<ManagedProvider>],
    tolerance_ns: u64,
    cross_validation_threshold: f64,
    diagnostics: &CoordinatorDiagnostics,
) -> Option<SynchronizedReading> {
    let mut readings = Vec::new();
    let mut providers_active = Vec::new();
    let mut providers_failed = Vec::new();

    for managed in providers {
        if managed.state.load() != ProviderState::Active {
            continue;
        }
        let mut provider = managed.provider.lock().expect("provider lock poisoned");
        match provider.get_reading() {
            Ok(reading) => {
                let name = provider.name().to_owned();
                if reading.is_valid {
                    managed.consecutive_failures.store(0, Ordering::Relaxed);
                    providers_active.push(name);
                } else {
                    managed.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    providers_failed.push(name);
                }

                let (wraps, resets) = provider.wraparound_diagnostics();
                let prev_wraps = managed.last_wraparound_count.swap(wraps, Ordering::Relaxed);
                let prev_resets = managed.last_reset_count.swap(resets, Ordering::Relaxed);
                let new_events = wraps.saturating_sub(prev_wraps) + resets.saturating_sub(prev_resets);
                if new_events > 0 {
                    diagnostics.wraparounds_detected.fetch_add(new_events.min(u32::MAX as u64) as u32, Ordering::Relaxed);
                }

                readings.push((reading, managed.disjoint));
            }
            Err(e) => {
                log::warn!("provider {} failed to read: {e}", provider.name());
                managed.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                providers_failed.push(provider.name().to_owned());
            }
        }
    }

    if readings.is_empty() {
        return None;
    }

    let timestamps: Vec<u64> = readings.iter().map(|(r, _)| r.timestamp_ns).collect();
    let earliest = *timestamps.iter().min().unwrap();
    let latest = *timestamps.iter().max().unwrap();
    let common_timestamp_ns = earliest + (latest - earliest) / 2;
    let temporal_alignment_valid = latest.saturating_sub(earliest) <= tolerance_ns;

    let powers: Vec<f64> = readings.iter().map(|(r, _)| r.total_power_watts).collect();
    let mut cross_validation_passed = true;
    let mut max_provider_deviation = 0.0;
    for i in 0..powers.len() {
        for j in (i + 1)..powers.len() {
            let (p1, p2) = (powers[i], powers[j]);
            let denom = p1.max(p2);
            if denom <= 0.0 {
                continue;
            }
            let deviation = (p1 - p2).abs() / denom;
            max_provider_deviation = max_provider_deviation.max(deviation);
            if deviation > cross_validation_threshold {
                cross_validation_passed = false;
            }
        }
    }

    let total_system_power_watts: f64 = readings.iter().filter(|(_, disjoint)| *disjoint).map(|(r, _)| r.total_power_watts).sum();
    let total_system_energy_joules: f64 = readings
        .iter()
        .filter(|(_, disjoint)| *disjoint)
        .map(|(r, _)| r.total_energy_joules)
        .sum();

    if !cross_validation_passed {
        diagnostics.low_confidence_ticks.fetch_add(1, Ordering::Relaxed);
    }

    Some(SynchronizedReading {
        common_timestamp_ns,
        readings: readings.into_iter().map(|(r, _)| r).collect(),
        total_system_power_watts,
        total_system_energy_joules,
        providers_active,
        providers_failed,
        temporal_alignment_valid,
        max_provider_uncertainty: 0.0, // filled in by the caller
        cross_validation_passed,
        max_provider_deviation,
    })
}

fn spawn_health_thread(
    providers: Vec<Arc<ManagedProvider>>,
    stop_flag: Arc<AtomicBool>,
    wakeup: Arc<(Mutex<bool>, Condvar)>,
    config: Config,
    diagnostics: Arc<CoordinatorDiagnostics>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("nemb-health-monitor".into()).spawn(move || {
        let interval = config.restart_interval();
        let (lock, cvar) = &*wakeup;

        while !stop_flag.load(Ordering::SeqCst) {
            let guard = lock.lock().expect("health wakeup lock poisoned");
            let (_guard, _timeout) = cvar
                .wait_timeout_while(guard, interval, |woken| !*woken && !stop_flag.load(Ordering::SeqCst))
                .expect("health wakeup lock poisoned");

            if stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if !config.auto_restart {
                continue;
            }

            for managed in &providers {
                if managed.permanently_failed.load(Ordering::Relaxed) {
                    continue;
                }
                let failures = managed.consecutive_failures.load(Ordering::Relaxed);
                if failures < CONSECUTIVE_FAILURES_BEFORE_RESTART {
                    continue;
                }
                if !managed.state.compare_set(ProviderState::Active, ProviderState::HealthCheck) {
                    continue;
                }

                let mut provider = managed.provider.lock().expect("provider lock poisoned");
                provider.shutdown();
                match provider.initialize() {
                    Ok(()) => {
                        managed.consecutive_failures.store(0, Ordering::Relaxed);
                        managed.state.store(ProviderState::Active);
                        diagnostics.provider_restarts.fetch_add(1, Ordering::Relaxed);
                        log::info!("provider {} restarted successfully", provider.name());
                    }
                    Err(e) => {
                        log::warn!("provider {} failed to restart: {e}", provider.name());
                        let attempt = managed.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if attempt >= MAX_RESTART_ATTEMPTS {
                            managed.permanently_failed.store(true, Ordering::Relaxed);
                            managed.state.store(ProviderState::Failed);
                            log::error!("provider {} permanently failed after {attempt} restart attempts", provider.name());
                        } else {
                            managed.state.store(ProviderState::Active); // retry next cycle
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::{ComponentReading, EnergyReading, ProviderSpecification};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU64;

    /// A deterministic fake provider for coordinator-level tests.
    struct FakeProvider {
        name: String,
        power_w: f64,
        reading_count: AtomicU64,
        fail_init: bool,
    }

    impl EnergyProvider for FakeProvider {
        fn initialize(&mut self) -> Result<(), ProviderError> {
            if self.fail_init {
                return Err(ProviderError::Unavailable {
                    provider: self.name.clone(),
                    source: anyhow::anyhow!("synthetic failure"),
                });
            }
            Ok(())
        }

        fn get_reading(&mut self) -> Result<EnergyReading, ProviderError> {
            let n = self.reading_count.fetch_add(1, Ordering::Relaxed);
            let t_ns = n * 1_000_000;
            let energy = self.power_w * (n as f64) * 0.001;
            let mut breakdown = BTreeMap::new();
            breakdown.insert(
                "package".to_owned(),
                ComponentReading {
                    energy_joules: energy,
                    power_watts: self.power_w,
                },
            );
            Ok(EnergyReading {
                timestamp_ns: t_ns,
                provider_name: self.name.clone(),
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
                provider_name: self.name.clone(),
                max_update_frequency_hz: 1000.0,
                energy_resolution_joules: 1e-6,
                typical_accuracy_percent: 3.0,
                supported_domains: vec!["package".to_owned()],
                is_shared_resource: true,
            }
        }

        fn shutdown(&mut self) {}

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn fake(name: &str, power_w: f64) -> Box<dyn EnergyProvider> {
        Box::new(FakeProvider {
            name: name.to_owned(),
            power_w,
            reading_count: AtomicU64::new(0),
            fail_init: false,
        })
    }

    #[test]
    fn start_fails_with_zero_providers_available() {
        let coordinator = Coordinator::new(Config::default());
        let failing = Box::new(FakeProvider {
            name: "dead".to_owned(),
            power_w: 0.0,
            reading_count: AtomicU64::new(0),
            fail_init: true,
        });
        coordinator.add_provider(failing, true).unwrap();
        assert!(matches!(
            coordinator.start_measurements(),
            Err(CoordinatorError::NoProvidersAvailable)
        ));
    }

    #[test]
    fn add_provider_rejected_once_running() {
        let mut config = Config::default();
        config.interval_ms = 2;
        let coordinator = Coordinator::new(config);
        coordinator.add_provider(fake("p1", 10.0), true).unwrap();
        coordinator.start_measurements().unwrap();

        let result = coordinator.add_provider(fake("p2", 5.0), true);
        assert!(result.is_err());

        coordinator.stop_measurements();
    }

    #[test]
    fn stop_is_idempotent() {
        let coordinator = Coordinator::new(Config::default());
        coordinator.stop_measurements();
        coordinator.stop_measurements();
    }

    #[test]
    fn sampler_produces_monotonic_buffer_entries() {
        let mut config = Config::default();
        config.interval_ms = 1;
        config.buffer_size = 50;
        let coordinator = Coordinator::new(config);
        coordinator.add_provider(fake("p1", 20.0), true).unwrap();
        coordinator.start_measurements().unwrap();

        std::thread::sleep(Duration::from_millis(30));
        coordinator.stop_measurements();

        let snapshot = coordinator.buffer().snapshot();
        assert!(!snapshot.is_empty());
        for pair in snapshot.windows(2) {
            assert!(pair[1].common_timestamp_ns > pair[0].common_timestamp_ns);
        }
    }

    /// Seed scenario S4 from spec.md §8.
    #[test]
    fn seed_s4_cross_validation() {
        struct Diag(CoordinatorDiagnostics);
        let diagnostics = Diag(CoordinatorDiagnostics::default()).0;

        let make_managed = |power_w: f64| {
            Arc::new(ManagedProvider {
                provider: Mutex::new(fake("p", power_w)),
                state: AtomicProviderState::new(ProviderState::Active),
                consecutive_failures: AtomicU32::new(0),
                disjoint: true,
                permanently_failed: AtomicBool::new(false),
                last_wraparound_count: AtomicU64::new(0),
                last_reset_count: AtomicU64::new(0),
            })
        };

        let timer = PrecisionTimer::probe().unwrap();

        let providers = vec![make_managed(50.0), make_managed(48.0)];
        let reading = sample_tick(&providers, u64::MAX, 0.05, &diagnostics).unwrap();
        assert!((reading.max_provider_deviation - 0.04).abs() < 1e-9);
        assert!(reading.cross_validation_passed);

        let providers = vec![make_managed(50.0), make_managed(45.0)];
        let reading = sample_tick(&providers, u64::MAX, 0.05, &diagnostics).unwrap();
        assert!((reading.max_provider_deviation - 0.1).abs() < 1e-9);
        assert!(!reading.cross_validation_passed);
    }

    /// Seed scenario S3 from spec.md §8.
    #[test]
    fn seed_s3_alignment_failure() {
        struct FixedOffsetProvider {
            name: String,
            offset_ns: u64,
            tick: AtomicU64,
        }
        impl EnergyProvider for FixedOffsetProvider {
            fn initialize(&mut self) -> Result<(), ProviderError> {
                Ok(())
            }
            fn get_reading(&mut self) -> Result<EnergyReading, ProviderError> {
                let n = self.tick.fetch_add(1, Ordering::Relaxed);
                let t_ns = n * 1_000_000 + self.offset_ns;
                Ok(EnergyReading {
                    timestamp_ns: t_ns,
                    provider_name: self.name.clone(),
                    is_valid: true,
                    error_message: None,
                    total_energy_joules: 0.0,
                    total_power_watts: 10.0,
                    component_breakdown: BTreeMap::new(),
                    uncertainty_percent: 3.0,
                    confidence: 1.0,
                })
            }
            fn get_specification(&self) -> ProviderSpecification {
                ProviderSpecification {
                    provider_name: self.name.clone(),
                    max_update_frequency_hz: 1000.0,
                    energy_resolution_joules: 1e-6,
                    typical_accuracy_percent: 3.0,
                    supported_domains: vec![],
                    is_shared_resource: true,
                }
            }
            fn shutdown(&mut self) {}
            fn name(&self) -> &str {
                &self.name
            }
        }

        let diagnostics = CoordinatorDiagnostics::default();
        let timer = PrecisionTimer::probe().unwrap();
        // tolerance = 0.1ms = 100_000ns; offset between A and B is 500us = 500_000ns > tolerance.
        let tolerance_ns = 100_000;
        let providers = vec![
            Arc::new(ManagedProvider {
                provider: Mutex::new(Box::new(FixedOffsetProvider {
                    name: "a".to_owned(),
                    offset_ns: 0,
                    tick: AtomicU64::new(0),
                }) as Box<dyn EnergyProvider>),
                state: AtomicProviderState::new(ProviderState::Active),
                consecutive_failures: AtomicU32::new(0),
                disjoint: true,
                permanently_failed: AtomicBool::new(false),
                last_wraparound_count: AtomicU64::new(0),
                last_reset_count: AtomicU64::new(0),
            }),
            Arc::new(ManagedProvider {
                provider: Mutex::new(Box::new(FixedOffsetProvider {
                    name: "b".to_owned(),
                    offset_ns: 500_000,
                    tick: AtomicU64::new(0),
                }) as Box<dyn EnergyProvider>),
                state: AtomicProviderState::new(ProviderState::Active),
                consecutive_failures: AtomicU32::new(0),
                disjoint: true,
                permanently_failed: AtomicBool::new(false),
                last_wraparound_count: AtomicU64::new(0),
                last_reset_count: AtomicU64::new(0),
            }),
        ];

        for _ in 0..3 {
            let reading = sample_tick(&providers, tolerance_ns, 0.05, &diagnostics).unwrap();
            assert!(!reading.temporal_alignment_valid);
        }
    }
}
