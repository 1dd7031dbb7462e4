// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scheduler configuration.
//!
//! Everything here is fixed at startup. There's no runtime reconfiguration:
//! once the dispatcher is running, the tick rate and the stack budget are what
//! they are.

use crate::time::Ticks;

/// Startup parameters for a [`Scheduler`][crate::exec::Scheduler].
///
/// ```ignore
/// let config = Config::DEFAULT.with_stack_budget(2048);
/// let mut sched = Scheduler::new(config)?;
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Config {
    /// Rate of the tick interrupt, in Hz. Only used to convert wall-clock
    /// intervals into ticks; the scheduler itself counts ticks.
    pub tick_hz: u32,
    /// Total bytes that task creation may reserve as task stacks. Each
    /// `create_task` call reserves its declared stack size from this budget
    /// and fails with `ResourceExhausted` once it runs out.
    pub stack_budget: usize,
}

impl Config {
    /// 1 kHz tick (one tick per millisecond), 8 KiB of task stacks.
    pub const DEFAULT: Self = Self {
        tick_hz: 1_000,
        stack_budget: 8 * 1024,
    };

    /// Replaces the tick rate.
    pub const fn with_tick_hz(self, tick_hz: u32) -> Self {
        Self { tick_hz, ..self }
    }

    /// Replaces the stack budget.
    pub const fn with_stack_budget(self, stack_budget: usize) -> Self {
        Self { stack_budget, ..self }
    }

    /// Converts milliseconds into ticks at this configuration's tick rate,
    /// rounding down.
    pub const fn ticks_from_millis(&self, ms: u64) -> Ticks {
        Ticks::from_millis(ms, self.tick_hz)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
