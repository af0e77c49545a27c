// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The control loop and shutdown coordinator (§4, §5, §7): the fixed-cadence
//! per-tick driver for the Assure policy, and the symmetric startup/shutdown
//! reset bracket shared by every policy.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::arbiter::{self, CapTracker};
use crate::device::{ActuationMode, DeviceApi, DriverError, Sample};
use crate::profile::Profile;
use crate::regression::{self, Model};
use crate::scheduler::{zigzag_index, Command, ProbeScheduler};
use crate::stats::{RingCursor, UtilWindow};

/// Tunable knobs of the Assure policy (§3 `PolicyConfig`). Deserializable so
/// a verbose run can dump its resolved configuration as JSON for diagnosis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub perf_floor: f64,
    pub loop_period_ms: u64,
    pub probe_interval_s: f64,
    pub probe_repetitions: usize,
    pub window_w: usize,
    pub reg_err_threshold: f64,
    pub use_cap: bool,
    pub use_regression: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            perf_floor: 0.90,
            loop_period_ms: 200,
            probe_interval_s: 15.0,
            probe_repetitions: 2,
            window_w: 16,
            reg_err_threshold: 100.0,
            use_cap: true,
            use_regression: true,
        }
    }
}

/// Per-device state living for the lifetime of the process (§3
/// `DeviceState`). Exclusively owned by the control loop.
struct DeviceState {
    util_window: UtilWindow,
    probe_mem: Vec<Vec<f64>>,
    probe_power: Vec<Vec<f64>>,
    cap: CapTracker,
    operating_freq: u32,
}

impl DeviceState {
    fn new(window: usize, k: usize, f_max: u32) -> Self {
        Self {
            util_window: UtilWindow::new(window),
            probe_mem: vec![Vec::new(); k],
            probe_power: vec![Vec::new(); k],
            cap: CapTracker::new(),
            operating_freq: f_max,
        }
    }

    fn reset_burst(&mut self, k: usize) {
        self.probe_mem = vec![Vec::new(); k];
        self.probe_power = vec![Vec::new(); k];
        self.cap = CapTracker::new();
    }
}

/// One device's observation for a single tick, formatted into the §6
/// stdout line by the caller.
pub struct TickRecord {
    pub dev: u32,
    pub sample: Sample,
    /// `None` means actuation was skipped this tick (reported as `-1`).
    pub commanded: Option<u32>,
}

/// The Assure control loop (§4.4-§4.7): owns every device's ring statistics,
/// probe-burst accumulation, and post-probe operating frequency.
pub struct Assure {
    profile: Profile,
    config: PolicyConfig,
    scheduler: ProbeScheduler,
    devices: Vec<DeviceState>,
    ring_cursor: RingCursor,
}

impl Assure {
    pub fn new(profile: Profile, config: PolicyConfig, device_count: u32) -> Self {
        let k = profile.probe.len();
        let devices = (0..device_count)
            .map(|_| DeviceState::new(config.window_w, k, profile.f_max))
            .collect();
        let scheduler = ProbeScheduler::new(
            k,
            config.probe_repetitions,
            config.loop_period_ms,
            config.probe_interval_s,
        );
        Self {
            profile,
            config,
            scheduler,
            devices,
            ring_cursor: RingCursor::new(config.window_w),
        }
    }

    /// Drive one tick across every device: sample, update ring statistics,
    /// resolve the probe scheduler's command, actuate, and record the
    /// one-tick-lagged telemetry into the current burst (§4.4 invariants).
    pub fn tick<D: DeviceApi>(
        &mut self,
        api: &D,
        only_device: Option<u32>,
        mode: ActuationMode,
        dry_run: bool,
    ) -> Result<Vec<TickRecord>> {
        let command = self.scheduler.command();
        let apply = self.scheduler.apply_freq_set();
        let record_slot = self.scheduler.record_slot();
        let k = self.profile.probe.len();

        if self.scheduler.burst_just_started() {
            for state in &mut self.devices {
                state.reset_burst(k);
            }
        }

        let mut records = Vec::with_capacity(self.devices.len());

        for (dev_idx, state) in self.devices.iter_mut().enumerate() {
            let dev = dev_idx as u32;
            let sample = match api.sample(dev) {
                Ok(s) => s,
                Err(DriverError::NotSupported) => {
                    warn!("sample not supported on device {dev}");
                    Sample::default()
                }
                Err(e) => return Err(e.into()),
            };

            state.util_window.push(self.ring_cursor.idx(), sample.gpu_util_pct);

            if let Some(slot) = record_slot {
                let j = zigzag_index(slot, k);
                state.probe_mem[j].push(sample.mem_util_pct as f64);
                state.probe_power[j].push(sample.power_mw as f64 / 1000.0);
                if self.config.use_cap {
                    state.cap.observe(
                        sample.sm_freq_mhz as f64,
                        sample.gpu_util_pct as f64,
                        self.profile.f_max as f64,
                        self.config.perf_floor,
                    );
                }
            }

            let target = match command {
                Command::Probe(j) => self.profile.probe[j],
                Command::Operating | Command::Hold => state.operating_freq,
            };

            let should_actuate =
                apply && !dry_run && only_device.is_none_or(|only| only == dev);
            let commanded = if should_actuate {
                match api.set_app_clocks(dev, self.profile.f_mem, target, mode) {
                    Ok(()) => Some(target),
                    Err(DriverError::NoPermission) => {
                        bail!("device {dev}: NVML denied clock actuation (need elevated privileges)")
                    }
                    Err(DriverError::NotSupported) => {
                        warn!("clock actuation not supported on device {dev}");
                        None
                    }
                    Err(DriverError::Other(msg)) => {
                        bail!("device {dev}: failed to set clocks: {msg}")
                    }
                }
            } else {
                None
            };

            records.push(TickRecord { dev, sample, commanded });
        }

        self.ring_cursor.advance();

        if self.scheduler.burst_just_ended() {
            debug!("probe burst complete, counter={}", self.scheduler.counter());
            self.finish_burst()?;
        }

        Ok(records)
    }

    /// Advance the probe scheduler's gate after every device has been
    /// processed this tick (§4.4). `elapsed_us` is this tick's wall-clock
    /// duration.
    pub fn after_tick(&mut self, elapsed_us: u64) {
        let sum_util_mean: f64 = self.devices.iter().map(|d| d.util_window.mean()).sum();
        self.scheduler.after_tick(elapsed_us, sum_util_mean);
    }

    /// Fit the regression model and arbitrate the next operating frequency
    /// for every device, on the tick the probe burst just completed (§4.5,
    /// §4.6).
    fn finish_burst(&mut self) -> Result<()> {
        let probe: Vec<f64> = self.profile.probe.iter().map(|&f| f as f64).collect();
        let k_r = self.profile.probe.len() * self.config.probe_repetitions;

        for (dev, state) in self.devices.iter_mut().enumerate() {
            let model = regression::select_model(&probe, &state.probe_mem);
            let skip_model = regression::should_skip(&model, self.config.reg_err_threshold, k_r);
            let sum_y: f64 = state.probe_mem.iter().flatten().sum();

            let avg_power: Vec<f64> = state
                .probe_power
                .iter()
                .map(|samples| mean_or(samples, 1.0))
                .collect();
            let avg_gmem: Vec<f64> = state.probe_mem.iter().map(|samples| mean_or(samples, 0.0)).collect();

            let decision = arbiter::decide(
                &model,
                skip_model,
                sum_y,
                &probe,
                &avg_power,
                &avg_gmem,
                &state.cap,
                &self.profile,
                self.config.perf_floor,
                self.config.use_cap,
                self.config.use_regression,
            );

            if let Some(freq) = self.profile.snap_up(decision.f_target) {
                state.operating_freq = freq;
            }

            debug!(
                "device {dev}: model={}, skip_model={skip_model}, f_perf={:.1}, f_eff={:.1}, operating_freq={}, util_mean={:.1}, util_std={:.2}",
                model_label(&model),
                decision.f_perf,
                decision.f_eff_chosen,
                state.operating_freq,
                state.util_window.mean(),
                state.util_window.std(),
            );
        }

        Ok(())
    }
}

fn mean_or(samples: &[f64], default: f64) -> f64 {
    if samples.is_empty() {
        default
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

fn model_label(model: &Model) -> &'static str {
    match model {
        Model::Single(_) => "single-line",
        Model::Fold { .. } => "fold-line",
    }
}

/// Shutdown Coordinator (§4 / §5 / §7): reset every device's clocks. Used
/// symmetrically at startup and on cooperative shutdown; idempotent, since
/// `NotSupported` is logged rather than propagated.
pub fn reset_all<D: DeviceApi>(api: &D, device_count: u32) -> Result<()> {
    for dev in 0..device_count {
        match api.reset_clocks(dev) {
            Ok(()) => {}
            Err(DriverError::NotSupported) => {
                warn!("clock reset not supported on device {dev}");
            }
            Err(DriverError::NoPermission) => {
                bail!("device {dev}: NVML denied clock reset (need elevated privileges)")
            }
            Err(DriverError::Other(msg)) => {
                bail!("device {dev}: failed to reset clocks: {msg}")
            }
        }
    }
    info!("reset clocks on {device_count} device(s)");
    Ok(())
}

/// Format the §6 per-tick stdout telemetry line: `timestamp` followed by
/// each device's `gpu_util, mem_util, power_mW, observed_freq,
/// commanded_freq` tuple (`-1` when actuation was skipped), then the tick
/// duration in microseconds.
pub fn format_tick_line(timestamp: &str, records: &[TickRecord], duration_us: u64) -> String {
    let mut line = String::from(timestamp);
    for r in records {
        line.push_str(&format!(
            ", dev{}: {}, {}, {}, {}, {}",
            r.dev,
            r.sample.gpu_util_pct,
            r.sample.mem_util_pct,
            r.sample.power_mw,
            r.sample.sm_freq_mhz,
            r.commanded.map(|f| f as i64).unwrap_or(-1),
        ));
    }
    line.push_str(&format!(", {duration_us}"));
    line
}
