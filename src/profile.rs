// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-SKU machine profiles: the immutable numeric tuples and supported
//! clock lists a policy is bounded by. Frequencies are in MHz throughout.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Selects a machine profile on the command line. Each key maps to the exact
/// numeric tuple validated against `nvidia-smi -q -d SUPPORTED_CLOCKS` on
/// that SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[value(rename_all = "kebab-case")]
pub enum Machine {
    V100Maxq,
    V100_300w,
    A100Insp,
}

/// Immutable per-SKU record. `probe` is a strictly increasing subset of
/// `supported`, typically 4 points spanning `[f_min, f_max]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Lower bound for setting core frequency (MHz).
    pub f_min: u32,
    /// Globally efficient fallback core frequency (MHz).
    pub f_eff: u32,
    /// Max core frequency supported (MHz).
    pub f_max: u32,
    /// Fixed memory frequency (MHz) used whenever the applications-clock
    /// pair is actuated.
    pub f_mem: u32,
    /// All core frequencies the device accepts, ascending.
    pub supported: Vec<u32>,
    /// Probe frequencies used during a burst, ascending, `probe[0] >=
    /// f_min`, `probe[last] <= f_max`.
    pub probe: Vec<u32>,
}

impl Profile {
    pub fn for_machine(machine: Machine) -> Self {
        match machine {
            Machine::V100Maxq => Profile {
                f_min: 855,
                f_eff: 855,
                f_max: 1440,
                f_mem: 810,
                supported: step_alternating(135, 1440, 7, 8),
                probe: vec![855, 1050, 1245, 1440],
            },
            Machine::V100_300w => Profile {
                f_min: 952,
                f_eff: 952,
                f_max: 1530,
                f_mem: 877,
                supported: step_alternating(135, 1530, 7, 8),
                probe: vec![952, 1147, 1335, 1530],
            },
            Machine::A100Insp => Profile {
                f_min: 1110,
                f_eff: 1110,
                f_max: 1410,
                f_mem: 1593,
                supported: step_uniform(210, 1410, 15),
                probe: vec![1110, 1215, 1320, 1410],
            },
        }
    }

    /// Largest element of `supported` strictly below `target`, paired with
    /// the next element if one exists. `None` if `target <= supported[0]`.
    fn floor_index(&self, target: f64) -> Option<usize> {
        self.supported
            .iter()
            .rposition(|&f| (f as f64) < target)
    }

    /// Snap-up: the smallest supported frequency `>= target` (§4.6, §8
    /// property 1). `None` means "leave `operating_freq` unchanged" — the
    /// edge case `target <= supported[0]`, where the scan finds no element
    /// strictly below `target` and the caller must retain the prior tick's
    /// operating frequency (dvfs.c's snap-up loop falls through without a
    /// `break`, leaving `optimizedFreqs[i]` untouched).
    pub fn snap_up(&self, target: f64) -> Option<u32> {
        match self.floor_index(target) {
            Some(i) if i + 1 < self.supported.len() => Some(self.supported[i + 1]),
            Some(i) => Some(self.supported[i]),
            None => None,
        }
    }
}

/// Reproduces the vendor step pattern alternating `+step_a`/`+step_b` MHz
/// starting from `base` up to and including `max` (dvfs.c
/// `getAvailableFreqs`, v100 branches).
fn step_alternating(base: u32, max: u32, step_a: u32, step_b: u32) -> Vec<u32> {
    let mut freqs = vec![base];
    let mut freq = base;
    let mut use_a = true;
    while freq <= max {
        freq += if use_a { step_a } else { step_b };
        use_a = !use_a;
        if freq <= max {
            freqs.push(freq);
        }
    }
    freqs
}

/// Reproduces the uniform `+step` MHz pattern (dvfs.c `getAvailableFreqs`,
/// a100 branch).
fn step_uniform(base: u32, max: u32, step: u32) -> Vec<u32> {
    let mut freqs = vec![base];
    let mut freq = base;
    while freq <= max {
        freq += step;
        if freq <= max {
            freqs.push(freq);
        }
    }
    freqs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v100_300w_matches_spec_s5() {
        let p = Profile::for_machine(Machine::V100_300w);
        assert_eq!(p.f_max, 1530);
        assert_eq!(p.f_min, 952);
        assert_eq!(p.f_mem, 877);
        assert_eq!(p.supported.len(), 187);
        assert_eq!(p.probe, vec![952, 1147, 1335, 1530]);
    }

    #[test]
    fn snap_up_exact_grid_point_is_identity() {
        // 1200 MHz is itself on the +7/+8 grid (...1192, 1200, 1207...), so the
        // smallest supported frequency >= 1200 is 1200 itself (property 1).
        let p = Profile::for_machine(Machine::V100_300w);
        assert_eq!(p.snap_up(1200.0), Some(1200));
    }

    #[test]
    fn snap_up_just_above_grid_point_advances() {
        let p = Profile::for_machine(Machine::V100_300w);
        assert_eq!(p.snap_up(1200.5), Some(1207));
    }

    #[test]
    fn snap_up_at_or_below_floor_leaves_operating_freq_unchanged() {
        let p = Profile::for_machine(Machine::V100_300w);
        assert_eq!(p.snap_up(0.0), None);
        assert_eq!(p.snap_up(135.0), None);
    }

    #[test]
    fn a100_uniform_step() {
        let p = Profile::for_machine(Machine::A100Insp);
        assert_eq!(*p.supported.last().unwrap(), 1410);
        assert!(p.supported.windows(2).all(|w| w[1] - w[0] == 15));
    }
}
