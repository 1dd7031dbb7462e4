// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Doing something periodically, accurately.

use core::convert::Infallible;

use crate::exec::Kernel;
use crate::time::{TickTime, Ticks};

/// Re-arms a task at absolute deadlines.
///
/// A `PeriodicActivity` gates (pauses) a task until the next point on a
/// periodic grid, `origin + n * period`. To call `f` every 30 ticks you would
/// write:
///
/// ```ignore
/// let mut cycle = PeriodicActivity::starting_now(kernel, Ticks(30));
/// loop {
///     cycle.next_cycle().await;
///     f();
/// }
/// ```
///
/// This maintains the 30-tick interval consistently, even if `f()` takes
/// several ticks to run, and even if `f()` is sometimes fast and sometimes
/// slow. Each deadline is computed from the previous _deadline_, not from the
/// time the task got around to waiting, so execution time never accumulates
/// into drift. A loop around [`Kernel::sleep_for`] is different: it guarantees
/// a minimum gap _between_ runs and drifts by the runtime of `f` every cycle.
///
/// Activities built from the same `origin` stay in step with one another
/// forever; see [`phased`][PeriodicActivity::phased].
///
/// # Overruns
///
/// If a cycle takes longer than `period`, the next deadline is already in the
/// past when the activity waits for it. The activity then runs again at once,
/// and keeps doing so until it has caught up with the grid. No activation is
/// skipped; this preserves the number of activations per unit time, which
/// might not be what you want. Each late cycle is counted in
/// [`overruns`][PeriodicActivity::overruns] and logged at `warn` level.
#[derive(Debug)]
pub struct PeriodicActivity {
    kernel: Kernel,
    period: Ticks,
    next: TickTime,
    cycles: u64,
    overruns: u64,
}

impl PeriodicActivity {
    /// Creates an activity that's first released at `origin` and then every
    /// `period` ticks after that.
    pub fn new(kernel: Kernel, origin: TickTime, period: Ticks) -> Self {
        Self {
            kernel,
            period,
            next: origin,
            cycles: 0,
            overruns: 0,
        }
    }

    /// Creates an activity released every `period`, starting right now.
    pub fn starting_now(kernel: Kernel, period: Ticks) -> Self {
        Self::new(kernel, kernel.now(), period)
    }

    /// Creates an activity released at `origin + offset + n * period`.
    ///
    /// This is how several activities share one grid but act at different
    /// points in it. For instance, two halves of a 2500-tick blink:
    ///
    /// ```ignore
    /// let on = PeriodicActivity::phased(kernel, origin, Ticks(0), Ticks(2500));
    /// let off = PeriodicActivity::phased(kernel, origin, Ticks(1000), Ticks(2500));
    /// ```
    pub fn phased(kernel: Kernel, origin: TickTime, offset: Ticks, period: Ticks) -> Self {
        Self::new(kernel, origin + offset, period)
    }

    /// Time between releases.
    pub fn period(&self) -> Ticks {
        self.period
    }

    /// The deadline the next call to [`next_cycle`][Self::next_cycle] waits
    /// for.
    pub fn next_deadline(&self) -> TickTime {
        self.next
    }

    /// Number of releases so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Number of releases that happened after their deadline had already
    /// passed.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Waits for the next deadline on the grid, then returns that deadline.
    ///
    /// # Cancellation
    ///
    /// **Cancel safety:** Strict.
    ///
    /// The deadline only advances once this resolves, so dropping the future
    /// and calling `next_cycle` again waits for the same deadline.
    pub async fn next_cycle(&mut self) -> TickTime {
        let deadline = self.next;
        let now = self.kernel.now();
        if now > deadline {
            self.overruns += 1;
            log::warn!(
                "periodic activity released {} ticks late (deadline {}, now {})",
                now.ticks_since(deadline).as_u64(),
                deadline.ticks_since_boot(),
                now.ticks_since_boot(),
            );
        }
        self.kernel.sleep_until(deadline).await;
        self.next += self.period;
        self.cycles += 1;
        deadline
    }

    /// Runs `effect` at every deadline, forever, passing it the deadline it
    /// was released for. Suitable as an entire task body.
    pub async fn run(mut self, mut effect: impl FnMut(TickTime)) -> Infallible {
        loop {
            let deadline = self.next_cycle().await;
            effect(deadline);
        }
    }
}
