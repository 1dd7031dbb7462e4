//! Periodic scheduling and bounded channels for small real-time control
//! programs, built on Rust `Future`s.
//!
//! `cadence` runs a fixed set of tasks on a single core. Each task is a
//! `Future` that never completes. A fixed-priority dispatcher polls tasks
//! when they're ready, a tick interrupt drives the clock, and interrupt
//! handlers hand data to tasks through bounded channels.
//!
//! # Design principles
//!
//! 1. Be compact. No heap, no proc macros. Every table has a size you can see
//!    in the type.
//!
//! 2. Be predictable. Periodic work is scheduled against absolute deadlines,
//!    so it doesn't drift however long each cycle takes. Waiters on a channel
//!    are served in the order they arrived.
//!
//! 3. Never block an interrupt. Everything an interrupt handler may call
//!    (`Kernel::tick`, `Kernel::request_yield`,
//!    `Channel::send_from_interrupt`, wakers) completes in bounded time.
//!
//! # Pieces
//!
//! - [`exec`]: the [`Scheduler`], its copyable [`Kernel`] handle, and the
//!   sleep and timeout futures.
//! - [`periodic`]: [`PeriodicActivity`], absolute-deadline re-arming.
//! - [`channel`]: [`Channel`], a fixed-capacity FIFO mailbox.
//! - [`irq`]: moving samples from an interrupt into a channel, and binding
//!   handlers to interrupt lines.
//! - [`time`], [`config`], [`error`]: the vocabulary shared by the above.
//!
//! Here is a task that toggles an LED twice per second, starting at its
//! scheduler's creation:
//!
//! ```ignore
//! async fn blinky(kernel: Kernel, led: &Led) -> Infallible {
//!     let mut cycle = PeriodicActivity::new(kernel, TickTime::ZERO, Ticks(500));
//!     loop {
//!         led.toggle();
//!         cycle.next_cycle().await;
//!     }
//! }
//! ```
//!
//! (Note: the natural way to write that function would be with a return type of
//! `!`, but doing this requires the unstable toolchain, so we rely on
//! `core::convert::Infallible` instead.)
//!
//! # Interrupts
//!
//! Interrupts may preempt task code at any point. Tasks and interrupt handlers
//! share state only through atomics (wake bits, the tick counter) and through
//! [`critical_section`]-guarded channel state. On Cortex-M the critical section
//! masks interrupts; on a host it's a global lock, which is how the tests run.

#![no_std]

#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications,
)]

/// Internal assert macro that doesn't stringify its expression or generate any
/// fancy messages. This means failures must be diagnosed by file:line only, so,
/// don't use this more than once on the same line. In exchange, this makes
/// asserts significantly smaller in terms of text size.
macro_rules! cheap_assert {
    ($x:expr) => {
        if !$x { panic!(); };
    }
}
pub(crate) use cheap_assert;

pub mod error;
pub mod config;
pub mod time;
pub mod exec;
pub mod periodic;
pub mod channel;
pub mod irq;

#[cfg(all(target_arch = "arm", feature = "systick"))]
pub mod cortex_m_timer;

pub use channel::{Channel, Receiver, Sender};
pub use config::Config;
pub use error::{Error, SendError};
pub use exec::{Kernel, Priority, Scheduler, TaskHandle, TaskInfo, TaskState};
pub use periodic::PeriodicActivity;
pub use time::{TickTime, Ticks, Timeout};
