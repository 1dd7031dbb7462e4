// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Small control sketches built on `cadence`.
//!
//! - [`blink`]: an LED lit for 1000 ticks and dark for 1500, driven by two
//!   tasks locked to one grid.
//! - [`thermometer`]: the RP2040 internal temperature sensor, sampled every
//!   2000 ticks by one task and printed by another.
//! - [`sampler`]: a free-running converter whose FIFO interrupt feeds a
//!   printing task.
//!
//! Each sketch is a handful of `async fn` task bodies taking a context struct
//! (kernel handle, channel, hardware capabilities from [`hw`]), plus a
//! `spawn_*` function that registers the pinned tasks with a scheduler. A
//! board's `main` looks like:
//!
//! ```ignore
//! let mut sched = Scheduler::new(Config::DEFAULT)?;
//! let kernel = sched.kernel();
//! let readings = Readings::new();
//! let ctx = Thermometer::new(kernel, &readings, &uart);
//! let producer = pin!(read_temperature(&ctx, adc));
//! let consumer = pin!(print_temperature(&ctx));
//! spawn_thermometer(&mut sched, producer, consumer)?;
//! initialize_sys_tick(&mut cp.SYST, 125_000_000, 1_000);
//! sched.start()
//! ```

#![no_std]

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs,
    unreachable_pub,
    unused_qualifications,
)]

pub mod hw;
pub mod blink;
pub mod thermometer;
pub mod sampler;

/// Stack bytes reserved for each sketch task.
pub const TASK_STACK: usize = 256;
