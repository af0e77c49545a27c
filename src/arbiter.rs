// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The frequency arbiter: combines the regression model's performance
//! bound with an observed utilization cap and a power-efficiency estimate
//! into a single operating frequency.

use crate::profile::Profile;
use crate::regression::Model;

/// Per-tick utilization cap (dvfs.c line ~610): the core frequency that, at
/// the observed `gpu_util_pct`, is empirically sufficient to clear
/// `perf_floor`. `max(1, gpu_util)` guards the division when the GPU was
/// sampled fully idle.
pub fn this_cap(freq_mhz: f64, gpu_util_pct: f64, f_max: f64, perf_floor: f64) -> f64 {
    let util = gpu_util_pct.max(1.0);
    freq_mhz / ((1.0 - perf_floor) * (freq_mhz / f_max + 100.0 / util - 1.0) + freq_mhz / f_max)
}

/// Running cap over a burst: `cap := max(cap, this_cap)`, seeded from the
/// first probe tick's value.
#[derive(Debug, Clone, Copy)]
pub struct CapTracker(Option<f64>);

impl CapTracker {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn observe(&mut self, freq_mhz: f64, gpu_util_pct: f64, f_max: f64, perf_floor: f64) {
        let candidate = this_cap(freq_mhz, gpu_util_pct, f_max, perf_floor);
        self.0 = Some(match self.0 {
            Some(cap) => cap.max(candidate),
            None => candidate,
        });
    }

    pub fn value(&self) -> f64 {
        self.0.unwrap_or(f64::INFINITY)
    }
}

impl Default for CapTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Model-estimated mem-bandwidth response at each probe index, used only to
/// rank power efficiency (dvfs.c lines ~888-943).
fn model_perf(model: &Model, probe: &[f64]) -> Vec<f64> {
    match model {
        Model::Single(fit) => probe
            .iter()
            .map(|&x| {
                if fit.slope > 0.0 {
                    fit.slope * x + fit.intercept
                } else {
                    // Lowest frequency's performance is assumed maximal.
                    fit.slope * probe[0] + fit.intercept
                }
            })
            .collect(),
        Model::Fold { turn, fit } => {
            let (a1, b1, a2, b2) = (fit.a1, fit.b1, fit.a2, fit.b2);
            if a1 > 0.0 && a2 > 0.0 {
                probe
                    .iter()
                    .enumerate()
                    .map(|(j, &x)| if j >= *turn { a2 * x + b2 } else { a1 * x + b1 })
                    .collect()
            } else if a1 > 0.0 {
                // a2 <= 0: maximum sits at the knee; flat beyond it.
                let at_cross = (a2 * b1 - a1 * b2) / (a2 - a1);
                probe
                    .iter()
                    .enumerate()
                    .map(|(j, &x)| if j < *turn { a1 * x + b1 } else { at_cross })
                    .collect()
            } else {
                // a1 <= 0: performance never improves with frequency.
                let v = a1 * probe[0] + b1;
                vec![v; probe.len()]
            }
        }
    }
}

/// Performance-bound frequency `f_perf` (dvfs.c lines ~978-1025).
fn f_perf_bound(model: &Model, probe: &[f64], f_max: f64, perf_floor: f64) -> f64 {
    match model {
        Model::Single(fit) => {
            if fit.slope > 0.0 {
                (perf_floor * (fit.slope * f_max + fit.intercept) - fit.intercept) / fit.slope
            } else {
                probe[0]
            }
        }
        Model::Fold { fit, .. } => {
            let (a1, b1, a2, b2) = (fit.a1, fit.b1, fit.a2, fit.b2);
            if a1 <= 0.0 {
                return probe[0];
            }
            let f_cross = (b1 - b2) / (a2 - a1);
            if a2 > 0.0 {
                let critical_perf = perf_floor * (a2 * f_max + b2);
                let x = (critical_perf - b2) / a2;
                if x <= f_cross {
                    (critical_perf - b1) / a1
                } else {
                    x
                }
            } else {
                // Performance saturates at the knee.
                let critical_perf = perf_floor * (a1 * f_cross + b1);
                (critical_perf - b1) / a1
            }
        }
    }
}

/// Most power-efficient probed frequency: `argmax(modelPerf[j] /
/// avg_power[j])` (dvfs.c lines ~945-973).
fn f_eff_from_model(model: &Model, probe: &[f64], avg_power: &[f64]) -> f64 {
    let perf = model_perf(model, probe);
    let mut best_j = 0;
    let mut best = perf[0] / avg_power[0];
    for j in 1..perf.len() {
        let eff = perf[j] / avg_power[j];
        if eff > best {
            best = eff;
            best_j = j;
        }
    }
    probe[best_j]
}

/// Lowest probe index whose memory-bandwidth utilization is at least 99% of
/// the burst's max, used by the `use_regression = false` alternative path
/// (dvfs.c lines ~1042-1064).
fn argmax_gmem_floor(avg_gmem: &[f64]) -> usize {
    let max_gmem = avg_gmem.iter().cloned().fold(f64::MIN, f64::max);
    avg_gmem
        .iter()
        .position(|&g| g >= 0.99 * max_gmem)
        .unwrap_or(0)
}

/// Final decision for one device's burst completion: the performance-bound
/// and efficient frequencies, and the resulting target before the profile's
/// own snap-up/clamp; the caller performs the snap-up itself via
/// `Profile::snap_up` since only it knows whether to retain the previous
/// operating frequency.
pub struct Decision {
    pub f_perf: f64,
    pub f_eff_chosen: f64,
    pub f_target: f64,
}

#[allow(clippy::too_many_arguments)]
pub fn decide(
    model: &Model,
    skip_model: bool,
    sum_y: f64,
    probe: &[f64],
    avg_power: &[f64],
    avg_gmem: &[f64],
    cap: &CapTracker,
    profile: &Profile,
    perf_floor: f64,
    use_cap: bool,
    use_regression: bool,
) -> Decision {
    let f_max = profile.f_max as f64;
    let f_eff_fallback = profile.f_eff as f64;

    let (f_perf, f_eff_chosen) = if !use_regression {
        let j = argmax_gmem_floor(avg_gmem);
        (probe[j], f_eff_fallback)
    } else if skip_model || sum_y <= 0.0 {
        (f_max, f_eff_fallback)
    } else {
        (
            f_perf_bound(model, probe, f_max, perf_floor),
            f_eff_from_model(model, probe, avg_power),
        )
    };

    let f_after_cap = if use_cap { f_perf.min(cap.value()) } else { f_perf };
    let f_target = f_after_cap
        .max(f_eff_chosen)
        .clamp(profile.f_min as f64, f_max);

    Decision { f_perf, f_eff_chosen, f_target }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Machine;
    use crate::regression::{FoldFit, LineFit};

    fn v100_300w() -> Profile {
        Profile::for_machine(Machine::V100_300w)
    }

    #[test]
    fn cap_tracks_the_burst_maximum() {
        let mut cap = CapTracker::new();
        cap.observe(952.0, 50.0, 1530.0, 0.9);
        let first = cap.value();
        cap.observe(1530.0, 99.0, 1530.0, 0.9);
        assert!(cap.value() >= first);
    }

    #[test]
    fn compute_bound_single_line_solves_performance_floor() {
        // Compute-bound: performance grows linearly with frequency, so the
        // perf-floor threshold is a simple line intersection.
        let fit = LineFit { slope: 0.05, intercept: 0.0, sse: 0.0 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        let expected = 0.9 * 1530.0;
        assert!((decision.f_perf - expected).abs() < 1e-6);
    }

    #[test]
    fn flat_response_floors_to_lowest_probe() {
        let fit = LineFit { slope: -0.01, intercept: 50.0, sse: 0.0 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        assert_eq!(decision.f_perf, 952.0);
    }

    #[test]
    fn skip_model_forces_max_freq_and_profile_efficiency() {
        let fit = LineFit { slope: 1.0, intercept: 0.0, sse: 1e9 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, true, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        assert_eq!(decision.f_perf, profile.f_max as f64);
        assert_eq!(decision.f_eff_chosen, profile.f_eff as f64);
    }

    #[test]
    fn no_memory_activity_falls_back_to_max_and_profile_efficiency() {
        let fit = LineFit { slope: 1.0, intercept: 0.0, sse: 0.0 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 0.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        assert_eq!(decision.f_perf, profile.f_max as f64);
    }

    #[test]
    fn fold_line_rising_both_segments_prefers_high_segment_when_above_cross() {
        let fit = FoldFit { a1: 0.1, b1: 0.0, a2: 0.03, b2: 84.0, sse: 0.0 };
        let model = Model::Fold { turn: 2, fit };
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.95, false, true,
        );
        // critical_perf at f_max on the high segment; with a high enough
        // perf floor the solved x lands above f_cross, so the high-segment
        // solution is kept (no re-solve on the low segment).
        let f_cross = (fit.b1 - fit.b2) / (fit.a2 - fit.a1);
        let critical_perf = 0.95 * (fit.a2 * 1530.0 + fit.b2);
        let x = (critical_perf - fit.b2) / fit.a2;
        assert!(x > f_cross);
        assert!((decision.f_perf - x).abs() < 1e-6);
    }

    #[test]
    fn fold_line_saturating_segment_solves_at_the_knee() {
        // a2 <= 0: performance saturates past the knee.
        let fit = FoldFit { a1: 0.1, b1: 0.0, a2: -0.01, b2: 100.0, sse: 0.0 };
        let model = Model::Fold { turn: 2, fit };
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        let f_cross = (fit.b1 - fit.b2) / (fit.a2 - fit.a1);
        let critical_perf = 0.9 * (fit.a1 * f_cross + fit.b1);
        let expected = (critical_perf - fit.b1) / fit.a1;
        assert!((decision.f_perf - expected).abs() < 1e-6);
    }

    #[test]
    fn non_positive_low_segment_floors_to_lowest_probe() {
        let fit = FoldFit { a1: -0.01, b1: 50.0, a2: -0.05, b2: 60.0, sse: 0.0 };
        let model = Model::Fold { turn: 2, fit };
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &CapTracker::new(), &profile,
            0.9, false, true,
        );
        assert_eq!(decision.f_perf, 952.0);
    }

    #[test]
    fn cap_pulls_the_operating_frequency_down() {
        let fit = LineFit { slope: 0.1, intercept: 0.0, sse: 0.0 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_power = vec![100.0, 130.0, 160.0, 200.0];
        let profile = v100_300w();
        let mut cap = CapTracker::new();
        cap.observe(952.0, 40.0, profile.f_max as f64, 0.9);
        let decision = decide(
            &model, false, 100.0, &probe, &avg_power, &probe, &cap, &profile, 0.9, true, true,
        );
        assert!(decision.f_target <= cap.value() + 1e-6);
    }

    #[test]
    fn use_regression_false_picks_saturating_gmem_frequency() {
        let fit = LineFit { slope: 1.0, intercept: 0.0, sse: 0.0 };
        let model = Model::Single(fit);
        let probe = vec![952.0, 1147.0, 1335.0, 1530.0];
        let avg_gmem = vec![40.0, 95.0, 96.0, 96.0];
        let profile = v100_300w();
        let decision = decide(
            &model, false, 100.0, &probe, &probe, &avg_gmem, &CapTracker::new(), &profile, 0.9,
            false, false,
        );
        assert_eq!(decision.f_perf, 1335.0);
        assert_eq!(decision.f_eff_chosen, profile.f_eff as f64);
    }
}
