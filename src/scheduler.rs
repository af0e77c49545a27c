// SPDX-License-Identifier: GPL-2.0
//
// geepafs: GPU Energy-Efficient and Performance-Assured Frequency Scaling
// Copyright (c) 2025 RitzDaCat
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The probe scheduler (§4.4): a small state machine driven by the integer
//! `probe_counter in [-99, k*r]`. Grounded directly on the gating logic at
//! the tail of `dvfs.c`'s main loop (lines ~1121-1163), which is more
//! precise than the prose summary about exactly when `accum_time_us`
//! accumulates versus resets.

/// Zig-zag traversal of a `k`-length probe pattern: forward then backward.
/// `iprob` is the 0-based tick offset since burst start.
pub fn zigzag_index(iprob: usize, k: usize) -> usize {
    let period = 2 * k;
    let reminder = iprob % period;
    if reminder < k {
        reminder
    } else {
        period - 1 - reminder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Command probe-pattern index `P[idx]`.
    Probe(usize),
    /// Command the post-probe operating frequency (`probe_counter == -1`).
    Operating,
    /// Hold: skip the actuation call entirely (`probe_counter <= -2`).
    Hold,
}

pub struct ProbeScheduler {
    counter: i64,
    prev_counter: i64,
    k: usize,
    r: usize,
    loop_period_us: u64,
    probe_interval_us: u64,
    accum_time_us: u64,
}

impl ProbeScheduler {
    pub fn new(k: usize, r: usize, loop_period_ms: u64, probe_interval_s: f64) -> Self {
        let kr = (k * r) as i64;
        Self {
            counter: kr,
            prev_counter: 0,
            k,
            r,
            loop_period_us: loop_period_ms * 1000,
            probe_interval_us: (probe_interval_s * 1_000_000.0) as u64,
            accum_time_us: 0,
        }
    }

    pub fn kr(&self) -> i64 {
        (self.k * self.r) as i64
    }

    pub fn counter(&self) -> i64 {
        self.counter
    }

    /// What frequency to command this tick.
    pub fn command(&self) -> Command {
        let kr = self.kr();
        if self.counter > 0 {
            let iprob = (kr - self.counter) as usize;
            Command::Probe(zigzag_index(iprob, self.k))
        } else if self.counter == 0 {
            // Actuation continuity: still command the last pattern freq.
            let iprob = (kr - 1).max(0) as usize;
            Command::Probe(zigzag_index(iprob, self.k))
        } else if self.counter == -1 {
            Command::Operating
        } else {
            Command::Hold
        }
    }

    /// Whether the actuation call should be issued this tick at all
    /// (`applyFreqSet`).
    pub fn apply_freq_set(&self) -> bool {
        self.counter >= -1
    }

    /// Slot in `[0, k*r)` that this tick's telemetry (recorded for the
    /// frequency commanded *last* tick) belongs in, or `None` outside a
    /// burst. One-tick actuation lag (§3 invariants).
    pub fn record_slot(&self) -> Option<usize> {
        if self.prev_counter > 0 {
            Some((self.kr() - self.prev_counter) as usize)
        } else {
            None
        }
    }

    /// True exactly on the tick the burst just completed: the regression
    /// engine and arbiter run after this tick's device loop.
    pub fn burst_just_ended(&self) -> bool {
        self.counter == 0
    }

    /// True on the first tick of a fresh burst — callers should reset
    /// per-device probe sample buffers before recording into them.
    pub fn burst_just_started(&self) -> bool {
        self.counter == self.kr()
    }

    /// Advance the state machine by one tick (dvfs.c lines ~1121-1163).
    /// `add_time_us` is `max(elapsed, loop_period_us)`; `sum_util_mean` is
    /// the sum of `util_mean` across all devices.
    pub fn after_tick(&mut self, elapsed_us: u64, sum_util_mean: f64) {
        self.prev_counter = self.counter;
        let add_time_us = elapsed_us.max(self.loop_period_us);

        if self.accum_time_us >= self.probe_interval_us {
            self.counter = if sum_util_mean >= 1.0 { self.kr() } else { -2 };
            self.accum_time_us = 0;
        } else {
            if self.counter > -1 {
                self.accum_time_us = 0;
            } else {
                self.accum_time_us += add_time_us;
            }
            if self.counter > -99 {
                self.counter -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_pattern_is_deterministic_zigzag() {
        // k=4, r=2: 8 ticks, P[0],P[1],P[2],P[3],P[3],P[2],P[1],P[0].
        let expected = [0, 1, 2, 3, 3, 2, 1, 0];
        for (iprob, &want) in expected.iter().enumerate() {
            assert_eq!(zigzag_index(iprob, 4), want);
        }
    }

    #[test]
    fn burst_commands_and_records_with_one_tick_lag() {
        let mut sched = ProbeScheduler::new(4, 2, 200, 15.0);
        let mut commands = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..8 {
            commands.push(sched.command());
            slots.push(sched.record_slot());
            sched.after_tick(200_000, 50.0);
        }
        assert_eq!(
            commands,
            vec![
                Command::Probe(0),
                Command::Probe(1),
                Command::Probe(2),
                Command::Probe(3),
                Command::Probe(3),
                Command::Probe(2),
                Command::Probe(1),
                Command::Probe(0),
            ]
        );
        // first tick: nothing recorded yet (prev_counter starts at 0).
        assert_eq!(slots[0], None);
        assert_eq!(slots[1], Some(0));
        assert_eq!(slots[7], Some(6));
    }

    #[test]
    fn idle_gate_skips_burst_and_holds() {
        let mut sched = ProbeScheduler::new(4, 2, 200, 1000.0);
        // Drain the initial burst (8 ticks for k=4, r=2) down past -1: one
        // tick per counter value from 8 down to -2 inclusive is 10 ticks.
        for _ in 0..10 {
            sched.after_tick(200_000, 0.0);
        }
        assert_eq!(sched.counter(), -2);
        // Idle util means the controller parks at -2 well within the
        // (large) probe interval: no actuation call is issued.
        for _ in 0..5 {
            assert!(matches!(sched.command(), Command::Hold));
            assert!(!sched.apply_freq_set());
            sched.after_tick(200_000, 0.0);
        }
    }

    #[test]
    fn nonidle_gate_restarts_burst_after_interval() {
        let mut sched = ProbeScheduler::new(4, 2, 200, 0.0004); // 400us interval
        for _ in 0..10 {
            sched.after_tick(200_000, 0.0);
        }
        assert_eq!(sched.counter(), -2);
        // Once accum_time_us crosses the interval and util is non-idle,
        // the gate restarts a burst.
        sched.after_tick(200_000, 5.0);
        assert_eq!(sched.counter(), sched.kr());
    }
}
