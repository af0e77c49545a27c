// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod arbiter;
mod baselines;
mod cli;
mod control;
mod device;
mod latency;
mod profile;
mod regression;
mod scheduler;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use baselines::Baseline;
use cli::{Mode, Opts, PolicyArg};
use control::{Assure, PolicyConfig};
use device::{ActuationMode, DeviceApi, NvmlDeviceApi};
use profile::Profile;

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Warn
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.mode != Mode::Mod {
        bail!("unsupported mode: only `mod` is accepted");
    }

    let perf_floor = match opts.policy {
        PolicyArg::Assure if opts.bench_latency.is_none() => opts
            .perf_floor
            .context("policy `assure` requires a perf-floor tag (p85, p90, or p95)")?
            .value(),
        _ => 0.90,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;

    let api = NvmlDeviceApi::init().context("failed to initialize NVML")?;
    let device_count = api.device_count().context("failed to query device count")?;
    info!("found {device_count} device(s)");

    // Startup reset bracket is symmetric with shutdown (§5).
    control::reset_all(&api, device_count).context("startup clock reset failed")?;

    let result = run(&opts, &api, device_count, perf_floor, shutdown);

    // Shutdown Coordinator: always attempt to reset clocks before exit,
    // whether the run above succeeded, failed, or was interrupted.
    if let Err(e) = control::reset_all(&api, device_count) {
        warn!("shutdown clock reset failed: {e:#}");
    }

    result
}

fn run<D: DeviceApi>(
    opts: &Opts,
    api: &D,
    device_count: u32,
    perf_floor: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    if let Some(iterations) = opts.bench_latency {
        let profile = Profile::for_machine(opts.machine);
        let mode = actuation_mode(opts);
        let dev = opts.only_device.unwrap_or(0);
        let report = latency::run(
            api,
            dev,
            profile.f_mem,
            profile.f_min,
            profile.f_max,
            mode,
            iterations,
        )?;
        println!(
            "latency over {} iterations: min={}us mean={:.1}us max={}us",
            report.iterations, report.min_us, report.mean_us, report.max_us
        );
        return Ok(());
    }

    let profile = Profile::for_machine(opts.machine);
    let mode = actuation_mode(opts);
    let loop_period = Duration::from_millis(opts.loop_period_ms);

    match opts.policy.as_baseline() {
        Some(kind) => run_baseline(kind, opts, api, &profile, mode, device_count, loop_period, shutdown),
        None => run_assure(opts, api, profile, mode, device_count, perf_floor, loop_period, shutdown),
    }
}

fn actuation_mode(opts: &Opts) -> ActuationMode {
    if opts.locked_clocks {
        ActuationMode::GpuLockedClocks
    } else {
        ActuationMode::ApplicationsClocks
    }
}

#[allow(clippy::too_many_arguments)]
fn run_assure<D: DeviceApi>(
    opts: &Opts,
    api: &D,
    profile: Profile,
    mode: ActuationMode,
    device_count: u32,
    perf_floor: f64,
    loop_period: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let config = PolicyConfig {
        perf_floor,
        loop_period_ms: opts.loop_period_ms,
        probe_interval_s: opts.probe_interval_s,
        probe_repetitions: opts.probe_repetitions,
        window_w: opts.window_w,
        reg_err_threshold: opts.reg_err_threshold,
        use_cap: opts.use_cap,
        use_regression: opts.use_regression,
    };
    if opts.verbose {
        info!("resolved config: {}", serde_json::to_string(&config)?);
    }

    let mut assure = Assure::new(profile, config, device_count);

    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();
        let records = assure.tick(api, opts.only_device, mode, opts.dry_run)?;
        let elapsed = started.elapsed();
        let elapsed_us = elapsed.as_micros() as u64;

        let timestamp = chrono::Local::now().to_rfc3339();
        println!("{}", control::format_tick_line(&timestamp, &records, elapsed_us));

        assure.after_tick(elapsed_us);

        if elapsed < loop_period {
            std::thread::sleep(loop_period - elapsed);
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_baseline<D: DeviceApi>(
    kind: baselines::BaselineKind,
    opts: &Opts,
    api: &D,
    profile: &Profile,
    mode: ActuationMode,
    device_count: u32,
    loop_period: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut baseline = Baseline::new(kind, device_count);
    let mut tick_idx: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();

        for dev in 0..device_count {
            let sample = api.sample(dev)?;
            let commanded = baseline.tick(
                dev as usize,
                sample.gpu_util_pct as f64,
                tick_idx,
                profile.f_min,
                profile.f_eff,
                profile.f_max,
                |target| profile.snap_up(target),
            );
            if let Some(freq) = commanded {
                if !opts.dry_run && opts.only_device.is_none_or(|only| only == dev) {
                    api.set_app_clocks(dev, profile.f_mem, freq, mode)?;
                }
            }
        }

        tick_idx += 1;
        let elapsed = started.elapsed();
        if elapsed < loop_period {
            std::thread::sleep(loop_period - elapsed);
        }
    }

    Ok(())
}
