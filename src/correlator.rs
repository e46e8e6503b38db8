//! Offline checkpoint-to-energy correlator (spec.md §4.H).
//!
//! Built on the binary-search-then-linearly-interpolate idiom of the
//! teacher's `timeseries::interpolate` module (`find_points_around` +
//! `LinearInterpolator`), generalized from a single-metric `Timeseries` to
//! the coordinator's multi-domain `SynchronizedReading` buffer and from one
//! interpolation timestamp to an enter/exit interval pair per invocation.

use std::collections::{BTreeMap, HashMap};

use crate::buffer::SynchronizedReading;
use crate::checkpoint::{CheckpointKind, CheckpointRecord, ThreadLogSnapshot};

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegionAttribution {
    pub region_id: u32,
    pub thread_id: u64,
    pub invocation_index: u32,

    pub t_enter_ns: u64,
    pub t_exit_ns: u64,
    pub duration_ns: u64,

    pub energy_joules: f64,
    pub average_power_watts: f64,
    pub component_breakdown: BTreeMap<String, f64>,

    pub confidence: f64,
    pub truncated: bool,
    pub insufficient_samples: bool,

    /// Timestamps of `mark` records whose enclosing region and invocation
    /// matched this attribution.
    pub marks_ns: Vec<u64>,
}

/// A search position kept across successive interpolation queries for one
/// timeseries, mirroring `interpolate.rs`'s `search_start` cursor reuse.
struct Cursor<'a> {
    samples: &'a [SynchronizedReading],
    hint: usize,
}

enum PointSearch {
    At(usize),
    Around(usize, usize),
    NotFound,
}

impl<'a> Cursor<'a> {
    fn new(samples: &'a [SynchronizedReading]) -> Self {
        Self { samples, hint: 0 }
    }

    fn find_around(&mut self, t_ns: u64) -> PointSearch {
        let mut before = None;
        let mut after = None;
        for i in self.hint..self.samples.len() {
            let ts = self.samples[i].common_timestamp_ns;
            if ts == t_ns {
                self.hint = i;
                return PointSearch::At(i);
            } else if ts < t_ns {
                before = Some(i);
            } else {
                after = Some(i);
                break;
            }
        }
        match (before, after) {
            (Some(b), Some(a)) => {
                self.hint = b;
                PointSearch::Around(b, a)
            }
            _ => PointSearch::NotFound,
        }
    }
}

/// Cumulative energy per domain at a sample, keyed by domain name.
pub(crate) fn domain_energies(reading: &SynchronizedReading) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for r in &reading.readings {
        for (domain, component) in &r.component_breakdown {
            *out.entry(domain.clone()).or_insert(0.0) += component.energy_joules;
        }
    }
    out
}

fn linear_interpolate(t: u64, t_before: u64, e_before: f64, t_after: u64, e_after: f64) -> f64 {
    if t_after == t_before {
        return e_before;
    }
    let u = (t - t_before) as f64 / (t_after - t_before) as f64;
    (1.0 - u) * e_before + u * e_after
}

/// Interpolated per-domain cumulative energy at `t_ns`, or `None` if `t_ns`
/// falls outside the buffer's covered range (never extrapolated, per
/// spec.md §8 property 10).
fn interpolate_domain_energies(cursor: &mut Cursor, t_ns: u64) -> Option<BTreeMap<String, f64>> {
    match cursor.find_around(t_ns) {
        PointSearch::At(i) => Some(domain_energies(&cursor.samples[i]).into_iter().collect()),
        PointSearch::Around(before_i, after_i) => {
            let before = &cursor.samples[before_i];
            let after = &cursor.samples[after_i];
            let before_energies = domain_energies(before);
            let after_energies = domain_energies(after);
            let mut out = BTreeMap::new();
            let mut domains: Vec<&String> = before_energies.keys().chain(after_energies.keys()).collect();
            domains.sort();
            domains.dedup();
            for domain in domains {
                let e_before = before_energies.get(domain).copied().unwrap_or(0.0);
                let e_after = after_energies.get(domain).copied().unwrap_or(0.0);
                out.insert(
                    domain.clone(),
                    linear_interpolate(t_ns, before.common_timestamp_ns, e_before, after.common_timestamp_ns, e_after),
                );
            }
            Some(out)
        }
        PointSearch::NotFound => None,
    }
}

fn samples_in_interval(samples: &[SynchronizedReading], t_enter: u64, t_exit: u64) -> usize {
    samples
        .iter()
        .filter(|s| s.common_timestamp_ns >= t_enter && s.common_timestamp_ns <= t_exit)
        .count()
}

fn min_confidence_in_interval(samples: &[SynchronizedReading], t_enter: u64, t_exit: u64) -> f64 {
    samples
        .iter()
        .filter(|s| s.common_timestamp_ns >= t_enter && s.common_timestamp_ns <= t_exit)
        .flat_map(|s| s.readings.iter())
        .map(|r| r.confidence)
        .fold(1.0_f64, f64::min)
}

fn straddles_misaligned_tick(samples: &[SynchronizedReading], t_enter: u64, t_exit: u64) -> bool {
    samples
        .iter()
        .filter(|s| s.common_timestamp_ns >= t_enter && s.common_timestamp_ns <= t_exit)
        .any(|s| !s.temporal_alignment_valid)
}

struct PairedInvocation {
    region_id: u32,
    thread_id: u64,
    invocation_index: u32,
    t_enter_ns: u64,
    t_exit_ns: Option<u64>,
}

/// Reconstructs enter/exit pairs from one thread's flat record list, using
/// `(region_id, invocation_index)` to match them (the recorder already
/// LIFO-paired these at record time; here we only need to find each pair's
/// two endpoints). `open_stack` is the snapshot's authoritative list of
/// enters still unmatched at snapshot time; it is trusted directly rather
/// than re-derived from `records`, so a record list that can't be replayed
/// exactly (e.g. truncated mid-log) still reports the correct open set.
fn pair_invocations(records: &[CheckpointRecord], open_stack: &[(u32, u32)]) -> Vec<PairedInvocation> {
    let mut enter_times: HashMap<(u32, u32), u64> = HashMap::new();
    let mut pairs = Vec::new();

    for record in records {
        match record.kind {
            CheckpointKind::Enter => {
                enter_times.insert((record.region_id, record.invocation_index), record.timestamp_ns);
            }
            CheckpointKind::Exit if !record.orphan => {
                if let Some(t_enter) = enter_times.remove(&(record.region_id, record.invocation_index)) {
                    pairs.push(PairedInvocation {
                        region_id: record.region_id,
                        thread_id: record.thread_id,
                        invocation_index: record.invocation_index,
                        t_enter_ns: t_enter,
                        t_exit_ns: Some(record.timestamp_ns),
                    });
                }
            }
            CheckpointKind::Exit | CheckpointKind::Mark => {}
        }
    }

    for &(region_id, invocation_index) in open_stack {
        if let Some(t_enter_ns) = enter_times.get(&(region_id, invocation_index)).copied() {
            pairs.push(PairedInvocation {
                region_id,
                thread_id: records.first().map(|r| r.thread_id).unwrap_or(0),
                invocation_index,
                t_enter_ns,
                t_exit_ns: None,
            });
        }
    }

    pairs
}

fn marks_for(records: &[CheckpointRecord], region_id: u32, invocation_index: u32) -> Vec<u64> {
    records
        .iter()
        .filter(|r| {
            r.kind == CheckpointKind::Mark
                && r.enclosing_region_id == Some(region_id)
                && r.invocation_index == invocation_index
        })
        .map(|r| r.timestamp_ns)
        .collect()
}

/// Attributes energy to every region invocation across every thread log,
/// against the given sorted sample buffer. `stop_time_ns` is used as the
/// synthetic exit time for regions still open at session stop.
pub fn attribute(logs: &[ThreadLogSnapshot], samples: &[SynchronizedReading], stop_time_ns: u64) -> Vec<RegionAttribution> {
    let mut out = Vec::new();

    for log in logs {
        let pairs = pair_invocations(&log.records, &log.open_stack);
        for pair in pairs {
            let (t_exit_ns, truncated) = match pair.t_exit_ns {
                Some(t) => (t, false),
                None => (stop_time_ns, true),
            };

            let mut enter_cursor = Cursor::new(samples);
            let mut exit_cursor = Cursor::new(samples);
            let e_enter = interpolate_domain_energies(&mut enter_cursor, pair.t_enter_ns);
            let e_exit = interpolate_domain_energies(&mut exit_cursor, t_exit_ns);

            let n_samples = samples_in_interval(samples, pair.t_enter_ns, t_exit_ns);
            let insufficient_samples = samples.len() < 2 || n_samples < 1;

            let (component_breakdown, energy_joules, confidence) = match (e_enter, e_exit) {
                (Some(enter_map), Some(exit_map)) if samples.len() >= 2 => {
                    let mut breakdown = BTreeMap::new();
                    let mut domains: Vec<&String> = enter_map.keys().chain(exit_map.keys()).collect();
                    domains.sort();
                    domains.dedup();
                    for domain in domains {
                        let a = enter_map.get(domain).copied().unwrap_or(0.0);
                        let b = exit_map.get(domain).copied().unwrap_or(0.0);
                        breakdown.insert(domain.clone(), b - a);
                    }
                    let total: f64 = breakdown.values().sum();

                    let sample_ratio = if n_samples == 0 {
                        0.0
                    } else {
                        (n_samples as f64 / 2.0).clamp(0.0, 1.0)
                    };
                    let mut confidence = min_confidence_in_interval(samples, pair.t_enter_ns, t_exit_ns) * sample_ratio;
                    if n_samples < 2 || straddles_misaligned_tick(samples, pair.t_enter_ns, t_exit_ns) {
                        confidence *= 0.5;
                    }
                    (breakdown, total, confidence)
                }
                _ => (BTreeMap::new(), 0.0, 0.0),
            };

            let duration_ns = t_exit_ns.saturating_sub(pair.t_enter_ns);
            let average_power_watts = if duration_ns > 0 {
                energy_joules / (duration_ns as f64 / 1e9)
            } else {
                0.0
            };

            out.push(RegionAttribution {
                region_id: pair.region_id,
                thread_id: pair.thread_id,
                invocation_index: pair.invocation_index,
                t_enter_ns: pair.t_enter_ns,
                t_exit_ns,
                duration_ns,
                energy_joules,
                average_power_watts,
                component_breakdown,
                confidence,
                truncated,
                insufficient_samples,
                marks_ns: marks_for(&log.records, pair.region_id, pair.invocation_index),
            });
        }
    }

    out.sort_by(|a, b| (a.thread_id, a.region_id, a.invocation_index).cmp(&(b.thread_id, b.region_id, b.invocation_index)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointKind;
    use crate::provider::{ComponentReading, EnergyReading};
    use pretty_assertions::assert_eq;

    fn sample(t_ns: u64, cumulative_joules: f64) -> SynchronizedReading {
        let mut breakdown = BTreeMap::new();
        breakdown.insert(
            "package".to_owned(),
            ComponentReading {
                energy_joules: cumulative_joules,
                power_watts: 0.0,
            },
        );
        SynchronizedReading {
            common_timestamp_ns: t_ns,
            readings: vec![EnergyReading {
                timestamp_ns: t_ns,
                provider_name: "intel_rapl".to_owned(),
                is_valid: true,
                error_message: None,
                total_energy_joules: cumulative_joules,
                total_power_watts: 0.0,
                component_breakdown: breakdown,
                uncertainty_percent: 3.0,
                confidence: 1.0,
            }],
            total_system_power_watts: 0.0,
            total_system_energy_joules: cumulative_joules,
            providers_active: vec!["intel_rapl".to_owned()],
            providers_failed: Vec::new(),
            temporal_alignment_valid: true,
            max_provider_uncertainty: 3.0,
            cross_validation_passed: true,
            max_provider_deviation: 0.0,
        }
    }

    fn record(t: u64, region_id: u32, kind: CheckpointKind, invocation_index: u32) -> CheckpointRecord {
        CheckpointRecord {
            timestamp_ns: t,
            thread_id: 1,
            region_id,
            kind,
            invocation_index,
            orphan: false,
            enclosing_region_id: None,
        }
    }

    /// Seed scenario S2 from spec.md §8.
    #[test]
    fn seed_s2_correlator_exact() {
        let samples = vec![sample(0, 0.0), sample(1_000_000, 0.001), sample(2_000_000, 0.003), sample(3_000_000, 0.006)];
        let logs = vec![ThreadLogSnapshot {
            thread_id: 1,
            records: vec![
                record(500_000, 7, CheckpointKind::Enter, 0),
                record(2_500_000, 7, CheckpointKind::Exit, 0),
            ],
            open_stack: Vec::new(),
        }];

        let attributions = attribute(&logs, &samples, 10_000_000);
        assert_eq!(attributions.len(), 1);
        let a = &attributions[0];
        assert!((a.energy_joules - 0.004).abs() < 1e-9, "energy = {}", a.energy_joules);
        assert_eq!(a.duration_ns, 2_000_000);
        assert!((a.average_power_watts - 2.0).abs() < 1e-9);
    }

    /// Seed scenario S5 from spec.md §8.
    #[test]
    fn seed_s5_recursion() {
        let samples = vec![sample(0, 0.0), sample(100, 1.0)];
        let logs = vec![ThreadLogSnapshot {
            thread_id: 1,
            records: vec![
                record(10, 9, CheckpointKind::Enter, 0),
                record(20, 9, CheckpointKind::Enter, 1),
                record(30, 9, CheckpointKind::Exit, 1),
                record(40, 9, CheckpointKind::Exit, 0),
            ],
            open_stack: Vec::new(),
        }];

        let mut attributions = attribute(&logs, &samples, 1000);
        attributions.sort_by_key(|a| a.invocation_index);
        assert_eq!(attributions.len(), 2);
        assert_eq!(attributions[0].invocation_index, 0);
        assert_eq!((attributions[0].t_enter_ns, attributions[0].t_exit_ns), (10, 40));
        assert_eq!(attributions[1].invocation_index, 1);
        assert_eq!((attributions[1].t_enter_ns, attributions[1].t_exit_ns), (20, 30));
    }

    /// Seed scenario S6 from spec.md §8.
    #[test]
    fn seed_s6_truncation() {
        let samples = vec![sample(0, 0.0), sample(2000, 1.0)];
        let logs = vec![ThreadLogSnapshot {
            thread_id: 1,
            records: vec![record(100, 3, CheckpointKind::Enter, 0)],
            open_stack: vec![(3, 0)],
        }];

        let attributions = attribute(&logs, &samples, 1000);
        assert_eq!(attributions.len(), 1);
        assert!(attributions[0].truncated);
        assert_eq!(attributions[0].t_exit_ns, 1000);
    }

    #[test]
    fn zero_checkpoints_yield_empty_attribution_tree() {
        let samples = vec![sample(0, 0.0), sample(1000, 1.0)];
        let logs: Vec<ThreadLogSnapshot> = Vec::new();
        assert!(attribute(&logs, &samples, 5000).is_empty());
    }

    #[test]
    fn single_sample_marks_insufficient_and_zero_energy() {
        let samples = vec![sample(500, 1.0)];
        let logs = vec![ThreadLogSnapshot {
            thread_id: 1,
            records: vec![record(0, 1, CheckpointKind::Enter, 0), record(1000, 1, CheckpointKind::Exit, 0)],
            open_stack: Vec::new(),
        }];

        let attributions = attribute(&logs, &samples, 2000);
        assert_eq!(attributions.len(), 1);
        assert!(attributions[0].insufficient_samples);
        assert_eq!(attributions[0].energy_joules, 0.0);
    }
}
