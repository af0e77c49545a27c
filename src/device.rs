// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The DeviceAPI adapter (§4.2): a thin, uniform interface over the vendor
//! library. `NvmlDeviceApi` is the production implementation; `MockDeviceApi`
//! (test-only) drives the controller from a scripted telemetry timeline for
//! the property tests in §8.

use anyhow::{Context, Result};
use nvml_wrapper::enum_wrappers::device::Clock;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

/// A single atomic telemetry snapshot for one device (§4.2 `sample`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Sample {
    pub gpu_util_pct: u32,
    pub mem_util_pct: u32,
    pub sm_freq_mhz: u32,
    pub power_mw: u32,
}

/// The driver error taxonomy of §7: `NoPermission` is always fatal,
/// `NotSupported` is logged and skipped per-call, `Other` is fatal for
/// sample/enumerate and for set-clocks.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("operation requires elevated privileges")]
    NoPermission,
    #[error("operation not supported on this device")]
    NotSupported,
    #[error("driver error: {0}")]
    Other(String),
}

impl From<NvmlError> for DriverError {
    fn from(err: NvmlError) -> Self {
        match err {
            NvmlError::NoPermission => DriverError::NoPermission,
            NvmlError::NotSupported => DriverError::NotSupported,
            other => DriverError::Other(other.to_string()),
        }
    }
}

/// Whether to pair mem+core clocks via the applications-clock API (default,
/// `onlySetAppFreq = true` in the original source) or hard-lock the core
/// clock alone via the GPU-locked-clocks API (`--locked-clocks`, §11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationMode {
    ApplicationsClocks,
    GpuLockedClocks,
}

/// Uniform interface over the vendor library (§4.2). One production
/// implementation (`NvmlDeviceApi`) and a scripted mock for tests.
pub trait DeviceApi {
    fn device_count(&self) -> Result<u32, DriverError>;
    fn sample(&self, dev: u32) -> Result<Sample, DriverError>;
    fn set_app_clocks(
        &self,
        dev: u32,
        f_mem: u32,
        f_core: u32,
        mode: ActuationMode,
    ) -> Result<(), DriverError>;
    fn reset_clocks(&self, dev: u32) -> Result<(), DriverError>;
}

/// Production implementation: a thin wrapper over `nvml_wrapper::Nvml`.
/// `init()`/`Drop` bracket the vendor library exactly once per process
/// (§4.2, §5 Resources).
pub struct NvmlDeviceApi {
    nvml: Nvml,
}

impl NvmlDeviceApi {
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init().context("failed to initialize NVML")?;
        Ok(Self { nvml })
    }
}

impl DeviceApi for NvmlDeviceApi {
    fn device_count(&self) -> Result<u32, DriverError> {
        Ok(self.nvml.device_count()?)
    }

    fn sample(&self, dev: u32) -> Result<Sample, DriverError> {
        let device = self.nvml.device_by_index(dev)?;
        let util = device.utilization_rates()?;
        let sm_freq_mhz = device.clock_info(Clock::SM)?;
        let power_mw = device.power_usage()?;
        Ok(Sample {
            gpu_util_pct: util.gpu,
            mem_util_pct: util.memory,
            sm_freq_mhz,
            power_mw,
        })
    }

    fn set_app_clocks(
        &self,
        dev: u32,
        f_mem: u32,
        f_core: u32,
        mode: ActuationMode,
    ) -> Result<(), DriverError> {
        let mut device = self.nvml.device_by_index(dev)?;
        match mode {
            ActuationMode::ApplicationsClocks => {
                device.set_applications_clocks(f_mem, f_core)?;
            }
            ActuationMode::GpuLockedClocks => {
                use nvml_wrapper::enums::device::GpuLockedClocksSetting;
                device.set_gpu_locked_clocks(GpuLockedClocksSetting::Numeric {
                    min_clock_mhz: f_core,
                    max_clock_mhz: f_core,
                })?;
            }
        }
        Ok(())
    }

    fn reset_clocks(&self, dev: u32) -> Result<(), DriverError> {
        let mut device = self.nvml.device_by_index(dev)?;
        // Both reset calls are attempted; a NotSupported on either is
        // logged by the caller and is not itself fatal (§7).
        let app_reset = device.reset_applications_clocks();
        let locked_reset = device.reset_gpu_locked_clocks();
        match (app_reset, locked_reset) {
            (Err(e), _) if !matches!(e, NvmlError::NotSupported) => Err(e.into()),
            (_, Err(e)) if !matches!(e, NvmlError::NotSupported) => Err(e.into()),
            (Err(NvmlError::NotSupported), Err(NvmlError::NotSupported)) => {
                Err(DriverError::NotSupported)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A recorded telemetry timeline: `timeline[dev][tick]` is the sample
    /// that `sample(dev)` returns on the Nth call for that device, holding
    /// the last entry once exhausted. Drives the controller through a
    /// scripted scenario (S1-S6) without touching hardware.
    #[derive(Default)]
    pub struct MockDeviceApi {
        timelines: Vec<Vec<Sample>>,
        cursors: RefCell<Vec<usize>>,
        pub commanded: RefCell<HashMap<u32, Vec<(u32, u32)>>>,
        pub resets: RefCell<Vec<u32>>,
        fail_permission: RefCell<Option<u32>>,
    }

    impl MockDeviceApi {
        pub fn new(timelines: Vec<Vec<Sample>>) -> Self {
            let cursors = RefCell::new(vec![0; timelines.len()]);
            Self {
                timelines,
                cursors,
                commanded: RefCell::new(HashMap::new()),
                resets: RefCell::new(Vec::new()),
                fail_permission: RefCell::new(None),
            }
        }

        pub fn fail_permission_for(&self, dev: u32) {
            *self.fail_permission.borrow_mut() = Some(dev);
        }

        pub fn commands_for(&self, dev: u32) -> Vec<(u32, u32)> {
            self.commanded
                .borrow()
                .get(&dev)
                .cloned()
                .unwrap_or_default()
        }
    }

    impl DeviceApi for MockDeviceApi {
        fn device_count(&self) -> Result<u32, DriverError> {
            Ok(self.timelines.len() as u32)
        }

        fn sample(&self, dev: u32) -> Result<Sample, DriverError> {
            let timeline = &self.timelines[dev as usize];
            let mut cursors = self.cursors.borrow_mut();
            let cursor = &mut cursors[dev as usize];
            let sample = timeline[(*cursor).min(timeline.len() - 1)];
            if *cursor + 1 < timeline.len() {
                *cursor += 1;
            }
            Ok(sample)
        }

        fn set_app_clocks(
            &self,
            dev: u32,
            f_mem: u32,
            f_core: u32,
            _mode: ActuationMode,
        ) -> Result<(), DriverError> {
            if self.fail_permission.borrow().as_ref() == Some(&dev) {
                return Err(DriverError::NoPermission);
            }
            self.commanded
                .borrow_mut()
                .entry(dev)
                .or_default()
                .push((f_mem, f_core));
            Ok(())
        }

        fn reset_clocks(&self, dev: u32) -> Result<(), DriverError> {
            self.resets.borrow_mut().push(dev);
            Ok(())
        }
    }
}
