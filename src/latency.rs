// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! `--bench-latency` (§11): a standalone microbenchmark of the vendor
//! library's set-then-read round trip, grounded on
//! `examples/original_source/latency/measure_latency.c`. It measures the
//! same ~80ms set-clock / ~13ms read-clock costs the control loop's pacing
//! design (§5) is built around, without running the controller itself.

use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

use crate::device::{ActuationMode, DeviceApi};

/// Summary statistics over `iterations` set-then-read round trips.
#[derive(Debug, Clone, Copy)]
pub struct LatencyReport {
    pub iterations: u32,
    pub min_us: u64,
    pub mean_us: f64,
    pub max_us: u64,
}

/// Run `iterations` rounds of `set_app_clocks` followed by `sample`,
/// alternating the commanded core frequency between `f_low` and `f_high` to
/// force an actual clock transition on the driver each round (the original
/// source's `changeFreq` oscillation).
pub fn run<D: DeviceApi>(
    api: &D,
    dev: u32,
    f_mem: u32,
    f_low: u32,
    f_high: u32,
    mode: ActuationMode,
    iterations: u32,
) -> Result<LatencyReport> {
    let mut samples = Vec::with_capacity(iterations as usize);
    for i in 0..iterations {
        let target = if i % 2 == 0 { f_high } else { f_low };
        let started = Instant::now();
        api.set_app_clocks(dev, f_mem, target, mode)
            .context("set_app_clocks failed during latency benchmark")?;
        api.sample(dev)
            .context("sample failed during latency benchmark")?;
        let elapsed_us = started.elapsed().as_micros() as u64;
        info!("latency bench iteration {i}: {elapsed_us}us");
        samples.push(elapsed_us);
    }

    let min_us = *samples.iter().min().unwrap_or(&0);
    let max_us = *samples.iter().max().unwrap_or(&0);
    let mean_us = samples.iter().sum::<u64>() as f64 / samples.len().max(1) as f64;

    Ok(LatencyReport { iterations, min_us, mean_us, max_us })
}
