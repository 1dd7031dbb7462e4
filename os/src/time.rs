// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Timekeeping in ticks.
//!
//! Each scheduler owns a monotonic counter recording the number of ticks since
//! it was created. Something -- normally a hardware timer interrupt, see
//! [`Kernel::tick`] -- advances it. This module provides the types used to
//! talk about that counter and the futures that wait on it.
//!
//! # Types for describing time
//!
//! `TickTime` represents a specific point in time, measured as a number of
//! ticks since the scheduler was created. It's a 64-bit count, which at a
//! 1 kHz tick overflows every 584 million years. This lets us ignore overflows
//! in timestamps, making everything simpler. `TickTime` is analogous to
//! `std::time::Instant` from the Rust standard library.
//!
//! `Ticks` represents a relative time interval. This uses the same
//! representation as `TickTime`, so adding them together is cheap.
//!
//! `Timeout` bounds a blocking channel operation: either a number of ticks, or
//! `Forever`.
//!
//! There's deliberately no `Duration` support in the sleep APIs: a sleep is
//! always performed in whole ticks, so being able to pass (say) nanoseconds is
//! misleading. Use [`Ticks::from_millis`] to convert at your tick rate.
//!
//! # Imposing a timeout on an operation
//!
//! If you want to stop a concurrent process if it's not done by a certain time,
//! see [`Kernel::with_deadline`] (and its relative friend,
//! [`Kernel::with_timeout`]). These let you impose a deadline on any future,
//! such that if it hasn't resolved by a certain time, it will be dropped
//! (cancelled).

use core::future::Future;
use core::ops::{Add, AddAssign};
use core::pin::Pin;
use core::task::{Context, Poll};

use pin_project::pin_project;

use crate::exec::Kernel;

/// Represents a moment in time by the value of a scheduler's tick counter.
/// System-specific analog of `std::time::Instant`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Hash)]
pub struct TickTime(u64);

impl TickTime {
    /// The moment the scheduler was created.
    pub const ZERO: Self = TickTime(0);

    /// Constructs a `TickTime` value describing a certain number of ticks
    /// since the scheduler was created.
    pub const fn from_ticks_since_boot(t: u64) -> Self {
        Self(t)
    }

    /// Number of ticks between scheduler creation and `self`.
    pub const fn ticks_since_boot(self) -> u64 {
        self.0
    }

    /// Subtracts an earlier time from this time, giving the number of ticks
    /// between them.
    ///
    /// # Panics
    ///
    /// If this time is not actually `>= earlier`.
    pub fn ticks_since(self, earlier: TickTime) -> Ticks {
        match self.0.checked_sub(earlier.0) {
            Some(t) => Ticks(t),
            None => panic!("TickTime::ticks_since called with a later time"),
        }
    }

    /// Like [`ticks_since`][TickTime::ticks_since] but produces zero if
    /// `earlier` is actually later.
    pub fn saturating_ticks_since(self, earlier: TickTime) -> Ticks {
        Ticks(self.0.saturating_sub(earlier.0))
    }

    /// Adds some ticks to `self`, checking for overflow. Note that since we
    /// use 64 bit ticks, overflow is unlikely in practice.
    pub fn checked_add(self, ticks: Ticks) -> Option<Self> {
        self.0.checked_add(ticks.0).map(TickTime)
    }

    /// Subtracts some ticks from `self`, checking for overflow. Overflow can
    /// occur if `ticks` is longer than the time from boot to `self`.
    pub fn checked_sub(self, ticks: Ticks) -> Option<Self> {
        self.0.checked_sub(ticks.0).map(TickTime)
    }
}

impl From<TickTime> for u64 {
    fn from(t: TickTime) -> Self {
        t.0
    }
}

/// A period of time measured in ticks.
///
/// This plays a role similar to `core::time::Duration` but is cheaper to use:
/// since ticks are the unit used for internal timekeeping, a `Ticks` can be
/// used for any deadline or timeout computation without unit conversions.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default, Hash)]
pub struct Ticks(pub u64);

impl Ticks {
    /// No time at all.
    pub const ZERO: Self = Ticks(0);

    /// Converts milliseconds to ticks at `tick_hz`, rounding down. Durations
    /// too long to count in a `u64` saturate at `u64::MAX` ticks.
    pub const fn from_millis(ms: u64, tick_hz: u32) -> Self {
        let ticks = ms as u128 * tick_hz as u128 / 1000;
        if ticks > u64::MAX as u128 {
            Ticks(u64::MAX)
        } else {
            Ticks(ticks as u64)
        }
    }

    /// Raw tick count.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Adds a number of ticks to a `TickTime` with normal `+` overflow behavior
/// (i.e. checked in debug builds, optionally not checked in release builds).
impl Add<Ticks> for TickTime {
    type Output = Self;
    fn add(self, other: Ticks) -> Self::Output {
        TickTime(self.0 + other.0)
    }
}

/// Adds a number of ticks to a `TickTime` with normal `+=` overflow behavior
/// (i.e. checked in debug builds, optionally not checked in release builds).
impl AddAssign<Ticks> for TickTime {
    fn add_assign(&mut self, other: Ticks) {
        self.0 += other.0;
    }
}

impl Add for Ticks {
    type Output = Self;
    fn add(self, other: Ticks) -> Self::Output {
        Ticks(self.0 + other.0)
    }
}

impl From<Ticks> for u64 {
    fn from(x: Ticks) -> Self {
        x.0
    }
}

impl From<u64> for Ticks {
    fn from(x: u64) -> Self {
        Self(x)
    }
}

/// How long a task-side channel operation may block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Timeout {
    /// Give up once this many ticks have passed since the operation started.
    /// `After(Ticks::ZERO)` never blocks.
    After(Ticks),
    /// Block until the operation completes, however long that takes.
    Forever,
}

impl Timeout {
    /// Don't block at all: fail immediately if the operation can't complete.
    pub const NONE: Self = Timeout::After(Ticks::ZERO);

    /// Shorthand for `Timeout::After(Ticks(n))`.
    pub const fn ticks(n: u64) -> Self {
        Timeout::After(Ticks(n))
    }

    /// Computes the absolute deadline for an operation starting at `now`, or
    /// `None` for `Forever`.
    pub fn deadline_from(self, now: TickTime) -> Option<TickTime> {
        match self {
            Timeout::After(t) => Some(now + t),
            Timeout::Forever => None,
        }
    }
}

impl From<Ticks> for Timeout {
    fn from(t: Ticks) -> Self {
        Timeout::After(t)
    }
}

/// Future returned by [`Kernel::sleep_until`] and [`Kernel::sleep_for`].
///
/// Polls as `Pending` until the kernel's tick counter is `>= deadline`.
///
/// # Cancellation
///
/// **Cancel safety:** Strict.
///
/// Dropping this future may leave the task's timer armed, which costs at most
/// one spurious wakeup.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep {
    kernel: Kernel,
    deadline: TickTime,
}

impl Sleep {
    pub(crate) fn new(kernel: Kernel, deadline: TickTime) -> Self {
        Self { kernel, deadline }
    }

    /// The time this sleep resolves at.
    pub fn deadline(&self) -> TickTime {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.kernel.now() >= self.deadline {
            return Poll::Ready(());
        }
        self.kernel.arm_timer(self.deadline, cx.waker());
        // The tick interrupt may have fired between the check above and arming
        // the timer, in which case nobody would wake us.
        if self.kernel.now() >= self.deadline {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// A future-wrapper that gates polling a future `B` on whether another
/// future `A` has resolved.
///
/// Once `A` resolved, `B` is no longer polled and the combined future
/// resolves to `None`. If `B` resolves first, its result is produced
/// wrapped in `Some`.
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project]
pub(crate) struct TimeLimited<A, B> {
    #[pin]
    limiter: A,
    #[pin]
    process: B,
}

impl<A, B> TimeLimited<A, B> {
    pub(crate) fn new(limiter: A, process: B) -> Self {
        Self { limiter, process }
    }
}

impl<A, B> Future for TimeLimited<A, B>
    where A: Future<Output = ()>,
          B: Future,
{
    type Output = Option<B::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let p = self.project();
        // We always check the limiter first. If the limiter's condition has
        // occurred, we bail, even if the limited process is also ready.
        if let Poll::Ready(()) = p.limiter.poll(cx) {
            return Poll::Ready(None);
        }
        p.process.poll(cx).map(Some)
    }
}
