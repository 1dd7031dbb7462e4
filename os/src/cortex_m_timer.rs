// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cortex-M SysTick as the tick source.

use cortex_m::peripheral::{syst::SystClkSource, SYST};
use cortex_m_rt::exception;

use crate::exec::Kernel;

/// Sets up SysTick to interrupt `tick_hz` times per second, assuming a CPU
/// core clock of `clock_hz`. Pass the same rate as your
/// [`Config::tick_hz`][crate::config::Config::tick_hz].
///
/// Call this after creating the [`Scheduler`][crate::exec::Scheduler] and
/// before [`start`][crate::exec::Scheduler::start].
pub fn initialize_sys_tick(syst: &mut SYST, clock_hz: u32, tick_hz: u32) {
    let cycles_per_tick = clock_hz / tick_hz;
    syst.set_reload(cycles_per_tick - 1);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_interrupt();
    syst.enable_counter();
}

/// System tick ISR. Advances the clock of the system scheduler and wakes any
/// task whose deadline has arrived.
#[doc(hidden)]
#[exception]
fn SysTick() {
    Kernel::system().tick();
}
