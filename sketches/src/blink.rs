// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two-phase blink: one task turns the LED on, another turns it off.
//!
//! Chaining "on for 1000, then off for 1500" as two relative delays would let
//! each task's execution time creep into the cycle, and the LED would slowly
//! slide out of phase with everything else. Instead both tasks run on the
//! same 2500-tick grid, anchored to one origin, and the "off" task is simply
//! shifted by the on-time:
//!
//! ```text
//! tick    0        1000           2500     3500           5000
//! on      ^                       ^                       ^
//! off              ^                       ^
//! LED     ##########..............##########..............
//! ```

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;

use cadence::{Error, Kernel, PeriodicActivity, Priority, Scheduler, TaskHandle, TickTime, Ticks};

use crate::hw::{DigitalOutput, Level};
use crate::TASK_STACK;

/// The on-board LED of a Raspberry Pi Pico.
pub const LED_PIN: u8 = 25;
/// How long the LED stays lit each cycle.
pub const ON_TIME: Ticks = Ticks(1000);
/// How long the LED stays dark each cycle.
pub const OFF_TIME: Ticks = Ticks(1500);

/// Everything the blink tasks share.
#[derive(Debug)]
pub struct Blink<'a, O> {
    /// Clock both tasks are scheduled against.
    pub kernel: Kernel,
    /// Where the LED is.
    pub output: &'a O,
    /// Which pin the LED is on.
    pub pin: u8,
    /// Start of the first cycle. The LED turns on here.
    pub origin: TickTime,
    /// Lit part of each cycle.
    pub on_time: Ticks,
    /// Dark part of each cycle.
    pub off_time: Ticks,
}

impl<'a, O: DigitalOutput> Blink<'a, O> {
    /// The standard blink on [`LED_PIN`], starting now.
    pub fn new(kernel: Kernel, output: &'a O) -> Self {
        Self {
            kernel,
            output,
            pin: LED_PIN,
            origin: kernel.now(),
            on_time: ON_TIME,
            off_time: OFF_TIME,
        }
    }

    /// Length of one whole on/off cycle.
    pub fn period(&self) -> Ticks {
        self.on_time + self.off_time
    }

    fn phase(&self, offset: Ticks) -> PeriodicActivity {
        PeriodicActivity::phased(self.kernel, self.origin, offset, self.period())
    }
}

/// Task body: drives the LED high at the start of every cycle.
pub async fn led_on<O: DigitalOutput>(ctx: &Blink<'_, O>) -> Infallible {
    ctx.phase(Ticks::ZERO)
        .run(|_| ctx.output.set_level(ctx.pin, Level::High))
        .await
}

/// Task body: drives the LED low `on_time` into every cycle.
pub async fn led_off<O: DigitalOutput>(ctx: &Blink<'_, O>) -> Infallible {
    ctx.phase(ctx.on_time)
        .run(|_| ctx.output.set_level(ctx.pin, Level::Low))
        .await
}

/// Registers the two blink tasks, created from [`led_on`] and [`led_off`]
/// and pinned by the caller.
pub fn spawn_blink<'t>(
    sched: &mut Scheduler<'t>,
    on: Pin<&'t mut dyn Future<Output = Infallible>>,
    off: Pin<&'t mut dyn Future<Output = Infallible>>,
) -> Result<[TaskHandle; 2], Error> {
    let on = sched.create_task(on, "LedOn", TASK_STACK, Priority::DEFAULT)?;
    let off = sched.create_task(off, "LedOff", TASK_STACK, Priority::DEFAULT)?;
    log::debug!("blink tasks ready");
    Ok([on, off])
}
