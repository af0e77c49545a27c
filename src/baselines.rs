// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The naive baseline policies, sitting alongside the Assure controller on
//! the same dispatch ladder as dvfs.c lines ~522-572. Each holds whatever
//! per-device state it needs between ticks and returns the frequency to
//! command this tick, or `None` to skip actuation (mirroring
//! `applyFreqSet` in the original).

use clap::ValueEnum;

/// CLI-selectable baseline identity (the `policy` values other than
/// `assure`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum BaselineKind {
    MaxFreq,
    EfficientFix,
    NVboost,
    UtilizScale,
}

/// One device's per-tick counter for `UtilizScale`, the only baseline with
/// state across ticks.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct UtilizScaleState {
    cycle: u32,
    held_freq: u32,
}

/// A baseline frequency-setting policy (dvfs.c's `freqsetAlg` dispatch,
/// `MaxFreq`/`EfficientFix`/`NVboost`/`UtilizScale` arms).
pub enum Baseline {
    /// Command `f_max` on the first tick only, then hold.
    MaxFreq,
    /// Command `f_eff` on the first tick only, then hold.
    EfficientFix,
    /// Never actuate; the driver's own boost governor decides.
    NVboost,
    /// Probe `f_max` on cycle 1 to observe utilization headroom, snap a
    /// proportional `util% * f_max` target on cycle 2, then hold.
    UtilizScale { state: Vec<UtilizScaleState> },
}

impl Baseline {
    pub fn new(kind: BaselineKind, device_count: u32) -> Self {
        match kind {
            BaselineKind::MaxFreq => Baseline::MaxFreq,
            BaselineKind::EfficientFix => Baseline::EfficientFix,
            BaselineKind::NVboost => Baseline::NVboost,
            BaselineKind::UtilizScale => Baseline::UtilizScale {
                state: vec![UtilizScaleState::default(); device_count as usize],
            },
        }
    }

    /// The frequency to command device `dev` this tick given its current
    /// `gpu_util_pct`, or `None` to skip actuation entirely this tick.
    /// `snap_up` is the profile's snap function, used identically to the
    /// Assure path for the cycle-2 utilization scaling.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        dev: usize,
        gpu_util_pct: f64,
        tick_idx: u64,
        f_min: u32,
        f_eff: u32,
        f_max: u32,
        snap_up: impl Fn(f64) -> Option<u32>,
    ) -> Option<u32> {
        match self {
            Baseline::MaxFreq => (tick_idx == 0).then_some(f_max),
            Baseline::EfficientFix => (tick_idx == 0).then_some(f_eff),
            Baseline::NVboost => None,
            Baseline::UtilizScale { state } => {
                let s = &mut state[dev];
                let out = match s.cycle {
                    0 => Some(f_max),
                    1 => {
                        let target = (gpu_util_pct / 100.0 * f_max as f64).max(f_min as f64);
                        let freq = snap_up(target).unwrap_or(f_min);
                        s.held_freq = freq;
                        Some(freq)
                    }
                    _ => None,
                };
                s.cycle += 1;
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Machine, Profile};

    #[test]
    fn max_freq_commands_once_then_holds() {
        let mut p = Baseline::new(BaselineKind::MaxFreq, 1);
        let id = |x: f64| Some(x as u32);
        assert_eq!(p.tick(0, 50.0, 0, 952, 952, 1530, id), Some(1530));
        assert_eq!(p.tick(0, 50.0, 1, 952, 952, 1530, id), None);
    }

    #[test]
    fn efficient_fix_commands_once_then_holds() {
        let mut p = Baseline::new(BaselineKind::EfficientFix, 1);
        let id = |x: f64| Some(x as u32);
        assert_eq!(p.tick(0, 50.0, 0, 952, 1000, 1530, id), Some(1000));
        assert_eq!(p.tick(0, 50.0, 1, 952, 1000, 1530, id), None);
    }

    #[test]
    fn nv_boost_never_actuates() {
        let mut p = Baseline::new(BaselineKind::NVboost, 1);
        let id = |x: f64| Some(x as u32);
        assert_eq!(p.tick(0, 50.0, 0, 952, 952, 1530, id), None);
    }

    #[test]
    fn utiliz_scale_probes_scales_then_holds() {
        let profile = Profile::for_machine(Machine::V100_300w);
        let mut p = Baseline::new(BaselineKind::UtilizScale, 1);
        assert_eq!(
            p.tick(0, 10.0, 0, profile.f_min, profile.f_eff, profile.f_max, |t| profile.snap_up(t)),
            Some(1530)
        );
        let fitted = p
            .tick(0, 50.0, 1, profile.f_min, profile.f_eff, profile.f_max, |t| profile.snap_up(t))
            .unwrap();
        assert!(fitted >= profile.f_min && fitted <= profile.f_max);
        assert_eq!(
            p.tick(0, 50.0, 2, profile.f_min, profile.f_eff, profile.f_max, |t| profile.snap_up(t)),
            None
        );
    }
}
