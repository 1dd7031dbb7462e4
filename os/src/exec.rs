// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: a fixed-priority dispatcher over a tick clock.
//!
//! Only interrupts preempt task code. Tasks are futures sharing one stack, so
//! switching between them is cooperative: a more urgent task that becomes
//! ready takes over at the running task's next `.await` that suspends it
//! (sleeping, sending, receiving or [`yield_cpu`]), not in the middle of its
//! computation. Keep the stretches between suspension points short.
//!
//! **Note:** for our purposes, a _task_ is an independent top-level future
//! handed to the [`Scheduler`] at startup with [`Scheduler::create_task`].
//! Tasks never complete -- their output type is [`Infallible`], an awkward way
//! of writing `!` -- and are never destroyed.
//!
//!
//! # Starting the scheduler
//!
//! ```ignore
//! let mut sched = Scheduler::new(Config::DEFAULT)?;
//! let kernel = sched.kernel();
//! let blinky = pin!(blinky(kernel, &led));
//! sched.create_task(blinky, "blinky", 256, Priority::DEFAULT)?;
//! sched.start()
//! ```
//!
//! [`Scheduler::start`] never returns. Code after it is unreachable, and the
//! scheduler treats any exit from its dispatch loop as fatal: it logs the
//! event and panics, rather than spinning quietly.
//!
//!
//! # Wake bits
//!
//! The dispatcher could simply poll every task in a big loop, but that wastes
//! energy and makes response times depend on how many tasks exist. Instead,
//! each scheduler keeps a word of _wake bits_, one per task. The `Waker` handed
//! to task `n` sets bit `n` when invoked, and the dispatcher only polls tasks
//! whose bits are set. Setting a bit is a single atomic `fetch_or`, so wakers
//! may be invoked from interrupt handlers.
//!
//! Wake bits live in a small static table of _kernel slots_, which a scheduler
//! claims when it's created and releases when it's dropped (which, on a real
//! target, is never). A waker names its slot and task by number instead of
//! holding a pointer, so a stale waker can at worst cause a spurious wakeup.
//!
//! Tasks must tolerate spurious wakeups. All the futures in this crate do.
//!
//!
//! # Dispatch order
//!
//! Each time the dispatcher chooses a task, it picks the most urgent ready
//! task, where a numerically lower [`Priority`] is more urgent. Among ready
//! tasks of equal priority it rotates in creation order, starting just after
//! whichever task ran last. The choice is re-made after every poll, so a task
//! made ready by an interrupt or by another task runs at the next decision
//! rather than at the next tick.
//!
//!
//! # Timers
//!
//! [`Kernel::sleep_until`] arms a per-task timer holding the earliest
//! deadline that task is waiting for. [`Kernel::tick`], called from the timer
//! interrupt, advances the clock and sets the wake bit of every task whose
//! timer has expired.
//!
//! A task's timer is disarmed each time the task is polled, and every timed
//! wait that is still pending re-arms it from its `poll`. So the timer always
//! reflects what the task is waiting for now, not a timeout it has already
//! left behind.

use core::cell::RefCell;
use core::convert::Infallible;
use core::future::Future;
use core::ops::ControlFlow;
use core::pin::Pin;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::config::Config;
use crate::error::Error;
use crate::time::{Sleep, TickTime, Ticks, TimeLimited};

/// Maximum number of tasks per scheduler. Bounded by the width of the wake
/// bit word on 32-bit targets.
pub const MAX_TASKS: usize = 32;

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        /// Number of schedulers that can exist at once. A bare-metal image runs
        /// exactly one.
        pub const KERNEL_SLOTS: usize = 1;
    } else {
        /// Number of schedulers that can exist at once. Hosted builds
        /// (simulations, tests) may run several side by side.
        pub const KERNEL_SLOTS: usize = 64;
    }
}

/// Shared, interrupt-safe part of a scheduler: wake bits, tick counter and
/// per-task timers.
struct Core {
    claimed: AtomicBool,
    /// Accumulates bitmasks from wakers as they are invoked. The dispatcher
    /// atomically takes and clears this before each decision.
    ready: AtomicUsize,
    /// Bottom 32 bits of the tick counter. Updated by `Kernel::tick`.
    tick: AtomicU32,
    /// Top 32 bits of the tick counter. Updated by `Kernel::tick`.
    epoch: AtomicU32,
    yield_requested: AtomicBool,
    /// Earliest pending wake-up deadline per task.
    timers: Mutex<RefCell<[Option<TickTime>; MAX_TASKS]>>,
}

impl Core {
    const fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            ready: AtomicUsize::new(0),
            tick: AtomicU32::new(0),
            epoch: AtomicU32::new(0),
            yield_requested: AtomicBool::new(false),
            timers: Mutex::new(RefCell::new([None; MAX_TASKS])),
        }
    }

    fn reset(&self) {
        self.ready.store(0, Ordering::SeqCst);
        self.tick.store(0, Ordering::SeqCst);
        self.epoch.store(0, Ordering::SeqCst);
        self.yield_requested.store(false, Ordering::SeqCst);
        critical_section::with(|cs| {
            *self.timers.borrow_ref_mut(cs) = [None; MAX_TASKS];
        });
    }

    fn now(&self) -> TickTime {
        // This loop will only repeat if e != e2, which means we raced the
        // tick ISR. Since that ISR only occurs once per tick, this loop should
        // repeat at most twice.
        loop {
            let e = self.epoch.load(Ordering::SeqCst);
            let t = self.tick.load(Ordering::SeqCst);
            let e2 = self.epoch.load(Ordering::SeqCst);
            if e == e2 {
                break TickTime::from_ticks_since_boot(((e as u64) << 32) | (t as u64));
            }
        }
    }

    fn wake(&self, mask: usize) {
        self.ready.fetch_or(mask, Ordering::SeqCst);
    }
}

static CORES: [Core; KERNEL_SLOTS] = [const { Core::new() }; KERNEL_SLOTS];

/// Computes the wake bit mask for the task with the given index.
const fn wake_mask_for_index(index: usize) -> usize {
    1 << index
}

/// VTable for our wakers. Our wakers store `slot * MAX_TASKS + index` in their
/// "pointer" member, and atomically OR the task's bit into that slot's wake
/// bits when invoked.
static VTABLE: RawWakerVTable = RawWakerVTable::new(
    // clone
    |p| RawWaker::new(p, &VTABLE),
    // wake
    |p| wake_by_token(p as usize),
    // wake_by_ref
    |p| wake_by_token(p as usize),
    // drop
    |_| (),
);

fn wake_by_token(token: usize) {
    let (slot, index) = (token / MAX_TASKS, token % MAX_TASKS);
    if let Some(core) = CORES.get(slot) {
        core.wake(wake_mask_for_index(index));
    }
}

/// Produces a `Waker` that will wake task `index` of kernel `slot`.
fn waker_for_task(slot: usize, index: usize) -> Waker {
    let token = slot * MAX_TASKS + index;
    // Safety: Waker::from_raw is unsafe because bad things happen if the
    // combination of this particular pointer and the functions in the vtable
    // don't meet the Waker contract or are incompatible. In our case, our
    // vtable functions never dereference the pointer, since we're passing an
    // integer as a pointer.
    unsafe {
        Waker::from_raw(RawWaker::new(token as *const (), &VTABLE))
    }
}

/// Recovers `(slot, index)` from a waker produced by `waker_for_task`, or
/// `None` for a waker from some other executor.
fn decode_waker(waker: &Waker) -> Option<(usize, usize)> {
    if core::ptr::eq(waker.vtable(), &VTABLE) {
        let token = waker.data() as usize;
        Some((token / MAX_TASKS, token % MAX_TASKS))
    } else {
        None
    }
}

/// Cheap, copyable handle onto a scheduler's clock and wake state.
///
/// Unlike the [`Scheduler`] itself, a `Kernel` can be handed to every task at
/// creation time and used from interrupt handlers: [`now`][Kernel::now],
/// [`tick`][Kernel::tick] and [`request_yield`][Kernel::request_yield] are all
/// interrupt-safe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Kernel {
    slot: usize,
}

impl Kernel {
    /// Handle onto the first kernel slot, which is the one a bare-metal
    /// image's only scheduler claims. Being `const`, this is how statics
    /// (interrupt adapters, the SysTick handler) name the kernel before the
    /// scheduler exists.
    pub const fn system() -> Self {
        Kernel { slot: 0 }
    }

    fn core(&self) -> &'static Core {
        &CORES[self.slot]
    }

    /// Retrieves the current value of the tick counter.
    pub fn now(&self) -> TickTime {
        self.core().now()
    }

    /// Advances the tick counter by one and wakes any task whose timer has
    /// expired. Returns the new time.
    ///
    /// This is the body of the periodic timer interrupt. On Cortex-M with the
    /// `systick` feature, the SysTick exception calls it for you; elsewhere
    /// (simulations, tests, other timers) call it yourself. It should have a
    /// single caller at a time.
    pub fn tick(&self) -> TickTime {
        let core = self.core();
        if core.tick.fetch_add(1, Ordering::Release) == u32::MAX {
            core.epoch.fetch_add(1, Ordering::Release);
        }
        let now = core.now();

        critical_section::with(|cs| {
            let mut timers = core.timers.borrow_ref_mut(cs);
            let mut expired = 0;
            for (i, timer) in timers.iter_mut().enumerate() {
                if matches!(*timer, Some(deadline) if deadline <= now) {
                    *timer = None;
                    expired |= wake_mask_for_index(i);
                }
            }
            if expired != 0 {
                core.wake(expired);
            }
        });

        now
    }

    /// Asks the dispatcher to re-evaluate promptly instead of idling until
    /// the next interrupt. Interrupt handlers call this after making a task
    /// ready, before returning.
    pub fn request_yield(&self) {
        self.core().yield_requested.store(true, Ordering::SeqCst);
    }

    /// Checks whether any task has been woken, or a yield requested, since
    /// the dispatcher last looked.
    pub fn has_pending_work(&self) -> bool {
        let core = self.core();
        core.ready.load(Ordering::SeqCst) != 0
            || core.yield_requested.load(Ordering::SeqCst)
    }

    fn take_yield_request(&self) -> bool {
        self.core().yield_requested.swap(false, Ordering::SeqCst)
    }

    /// Arms the timer of the task owning `waker` so that it's woken at
    /// `deadline` (or earlier, if it's already waiting for something sooner).
    ///
    /// Wakers that don't belong to this kernel can't be attached to its
    /// timers; in that case the waker is invoked immediately, so the future
    /// gets re-polled and checks the clock again. That's correct but burns
    /// CPU, so don't do it on purpose.
    pub(crate) fn arm_timer(&self, deadline: TickTime, waker: &Waker) {
        match decode_waker(waker) {
            Some((slot, index)) if slot == self.slot => {
                critical_section::with(|cs| {
                    let mut timers = self.core().timers.borrow_ref_mut(cs);
                    let timer = &mut timers[index];
                    *timer = Some(match *timer {
                        Some(existing) => existing.min(deadline),
                        None => deadline,
                    });
                });
            }
            _ => waker.wake_by_ref(),
        }
    }

    fn disarm_timer(&self, index: usize) {
        critical_section::with(|cs| self.core().timers.borrow_ref_mut(cs)[index] = None);
    }

    fn timer_for(&self, index: usize) -> Option<TickTime> {
        critical_section::with(|cs| self.core().timers.borrow_ref(cs)[index])
    }

    /// Sleeps until the tick counter is equal to or greater than `deadline`.
    ///
    /// More precisely, `sleep_until(d)` returns a `Future` that will poll as
    /// `Pending` until `now() >= deadline`; then it will poll `Ready`. The task
    /// is Blocked in between.
    ///
    /// If `deadline` is already in the past, this will instantly become
    /// `Ready` -- a late caller doesn't wait at all, but it also doesn't get
    /// any time back. If you want to make an action periodic by sleeping in a
    /// loop, [`PeriodicActivity`][crate::periodic::PeriodicActivity] helps
    /// avoid the mistakes that cause timing drift.
    ///
    /// # Cancellation
    ///
    /// **Cancel safety:** Strict.
    ///
    /// Dropping this future does nothing in particular.
    pub fn sleep_until(&self, deadline: TickTime) -> Sleep {
        Sleep::new(*self, deadline)
    }

    /// Sleeps until the tick counter has increased by `d`.
    ///
    /// This captures the time when it's _called_, not when it's first polled.
    /// If `d` is 0, this will instantly become `Ready`.
    pub fn sleep_for(&self, d: Ticks) -> Sleep {
        self.sleep_until(self.now() + d)
    }

    /// Alters a future to impose a deadline on its completion.
    ///
    /// Concretely,
    /// - The output type is changed from `T` to `Option<T>`.
    /// - If the future resolves on any polling that starts before `deadline`,
    ///   its result will be produced, wrapped in `Some`.
    /// - If poll is called at or after `deadline`, the future resolves to
    ///   `None`.
    ///
    /// The wrapped future is _not_ immediately dropped if the timeout expires.
    /// It will be dropped when you drop the wrapped version.
    pub fn with_deadline<F>(&self, deadline: TickTime, code: F) -> impl Future<Output = Option<F::Output>>
        where F: Future,
    {
        TimeLimited::new(self.sleep_until(deadline), code)
    }

    /// Alters a future to impose a timeout on its completion.
    ///
    /// This is equivalent to [`with_deadline`][Kernel::with_deadline] using a
    /// deadline of `now() + timeout`, with the time captured when
    /// `with_timeout` is called.
    pub fn with_timeout<F>(&self, timeout: Ticks, code: F) -> impl Future<Output = Option<F::Output>>
        where F: Future,
    {
        self.with_deadline(self.now() + timeout, code)
    }
}

/// Task urgency. Numerically lower is more urgent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Most urgent.
    pub const HIGHEST: Priority = Priority(0);
    /// What tasks get when nobody has an opinion.
    pub const DEFAULT: Priority = Priority(1);
    /// Least urgent.
    pub const LOWEST: Priority = Priority(u8::MAX);
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Identifies a task within its scheduler. Tasks are numbered in creation
/// order starting at zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskHandle(usize);

impl TaskHandle {
    /// The task's creation index.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Scheduling state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaskState {
    /// Eligible to be dispatched.
    Ready,
    /// Currently being polled.
    Running,
    /// Waiting for a timer, a channel, or some other event.
    Blocked,
    /// Held out of dispatch by [`Scheduler::suspend`].
    Suspended,
}

/// Snapshot of a task's control block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskInfo {
    /// Name given at creation.
    pub name: &'static str,
    /// Priority given at creation.
    pub priority: Priority,
    /// Stack bytes reserved at creation.
    pub stack_size: usize,
    /// Current scheduling state.
    pub state: TaskState,
    /// Deadline of the timed wait the task is blocked in, if any.
    pub next_wake: Option<TickTime>,
    /// Number of times the task has been dispatched.
    pub polls: u64,
}

/// Dispatcher counters.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Total task polls.
    pub dispatches: u64,
    /// Polls that ran a different task than the previous poll.
    pub context_switches: u64,
    /// Times the dispatcher found nothing to do and went idle.
    pub idle_entries: u64,
}

struct Task<'t> {
    name: &'static str,
    priority: Priority,
    stack_size: usize,
    state: TaskState,
    polls: u64,
    entry: Pin<&'t mut dyn Future<Output = Infallible>>,
}

/// Owns a kernel slot; gives it back on drop.
struct SlotLease {
    slot: usize,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let core = &CORES[self.slot];
        core.reset();
        core.claimed.store(false, Ordering::Release);
        log::debug!("released kernel slot {}", self.slot);
    }
}

/// Fixed-priority dispatcher owning a fixed table of tasks.
///
/// See the module docs for the big picture.
pub struct Scheduler<'t> {
    lease: SlotLease,
    kernel: Kernel,
    config: Config,
    tasks: [Option<Task<'t>>; MAX_TASKS],
    task_count: usize,
    stack_used: usize,
    /// Wake bits collected from the kernel slot but not yet dispatched.
    pending: usize,
    suspended: usize,
    last: Option<usize>,
    stats: Stats,
}

impl core::fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("slot", &self.lease.slot)
            .field("config", &self.config)
            .field("task_count", &self.task_count)
            .field("stack_used", &self.stack_used)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<'t> Scheduler<'t> {
    /// Creates a scheduler with an empty task table and its clock at zero.
    ///
    /// Fails with [`Error::ResourceExhausted`] if all [`KERNEL_SLOTS`] are in
    /// use.
    pub fn new(config: Config) -> Result<Self, Error> {
        let slot = claim_slot().ok_or(Error::ResourceExhausted)?;
        CORES[slot].reset();
        log::debug!("claimed kernel slot {slot}: {config:?}");
        Ok(Self {
            lease: SlotLease { slot },
            kernel: Kernel { slot },
            config,
            tasks: [const { None }; MAX_TASKS],
            task_count: 0,
            stack_used: 0,
            pending: 0,
            suspended: 0,
            last: None,
            stats: Stats::default(),
        })
    }

    /// Handle for tasks and interrupt handlers.
    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    /// Configuration given at creation.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dispatcher counters so far.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Number of tasks created.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Stack bytes not yet reserved by any task.
    pub fn stack_available(&self) -> usize {
        self.config.stack_budget - self.stack_used
    }

    /// Adds a task. `entry` is the task's body, a future that never
    /// completes; it starts Ready and gets its first poll at the next
    /// dispatch.
    ///
    /// `stack_size` bytes are reserved from the configured stack budget.
    /// Fails with [`Error::ResourceExhausted`] if the task table is full or the
    /// budget can't cover the reservation. That failure is fatal to bring-up:
    /// propagate it rather than starting without the task.
    pub fn create_task(
        &mut self,
        entry: Pin<&'t mut dyn Future<Output = Infallible>>,
        name: &'static str,
        stack_size: usize,
        priority: Priority,
    ) -> Result<TaskHandle, Error> {
        let index = self.task_count;
        let fits = self.stack_used
            .checked_add(stack_size)
            .is_some_and(|total| total <= self.config.stack_budget);
        if index >= MAX_TASKS || !fits {
            log::warn!(
                "cannot create task {name}: {index} of {MAX_TASKS} slots used, \
                 {} of {} stack bytes available, {stack_size} requested",
                self.stack_available(),
                self.config.stack_budget,
            );
            return Err(Error::ResourceExhausted);
        }

        self.tasks[index] = Some(Task {
            name,
            priority,
            stack_size,
            state: TaskState::Ready,
            polls: 0,
            entry,
        });
        self.task_count += 1;
        self.stack_used += stack_size;
        self.pending |= wake_mask_for_index(index);
        log::debug!("created task {name} (#{index}, {priority:?}, {stack_size} bytes of stack)");
        Ok(TaskHandle(index))
    }

    /// Reports on a task.
    ///
    /// # Panics
    ///
    /// If `task` didn't come from this scheduler.
    pub fn task_info(&self, task: TaskHandle) -> TaskInfo {
        let t = self.task(task.0);
        TaskInfo {
            name: t.name,
            priority: t.priority,
            stack_size: t.stack_size,
            state: t.state,
            next_wake: self.kernel.timer_for(task.0),
            polls: t.polls,
        }
    }

    /// Holds a task out of dispatch until [`resume`][Scheduler::resume]. Wake
    /// events that arrive in the meantime are kept, not lost.
    pub fn suspend(&mut self, task: TaskHandle) {
        self.task(task.0);
        self.suspended |= wake_mask_for_index(task.0);
        self.task_mut(task.0).state = TaskState::Suspended;
    }

    /// Makes a suspended task eligible for dispatch again. The task is polled
    /// at the next opportunity, so it can re-check whatever it was waiting for.
    pub fn resume(&mut self, task: TaskHandle) {
        let mask = wake_mask_for_index(task.0);
        if self.suspended & mask != 0 {
            self.suspended &= !mask;
            self.pending |= mask;
            self.task_mut(task.0).state = TaskState::Ready;
        }
    }

    fn task(&self, index: usize) -> &Task<'t> {
        match self.tasks.get(index) {
            Some(Some(t)) => t,
            _ => panic!("task handle from another scheduler"),
        }
    }

    fn task_mut(&mut self, index: usize) -> &mut Task<'t> {
        match self.tasks.get_mut(index) {
            Some(Some(t)) => t,
            _ => panic!("task handle from another scheduler"),
        }
    }

    fn collect_wakes(&mut self) {
        self.pending |= self.kernel.core().ready.swap(0, Ordering::SeqCst);
    }

    /// Chooses the most urgent runnable task, rotating among equals starting
    /// just after the last one dispatched.
    fn pick(&self, runnable: usize) -> Option<usize> {
        let n = self.task_count;
        let start = self.last.map_or(0, |i| i + 1);
        let mut best: Option<(Priority, usize)> = None;
        for k in 0..n {
            let i = (start + k) % n;
            if runnable & wake_mask_for_index(i) == 0 {
                continue;
            }
            let p = self.task(i).priority;
            if best.map_or(true, |(bp, _)| p < bp) {
                best = Some((p, i));
            }
        }
        best.map(|(_, i)| i)
    }

    /// Polls the single most urgent ready task, if there is one, and returns
    /// which task ran.
    pub fn dispatch(&mut self) -> Option<TaskHandle> {
        self.collect_wakes();
        let index = self.pick(self.pending & !self.suspended)?;
        let mask = wake_mask_for_index(index);
        self.pending &= !mask;

        if self.last != Some(index) {
            self.stats.context_switches += 1;
        }
        self.last = Some(index);
        self.stats.dispatches += 1;

        let waker = waker_for_task(self.kernel.slot, index);
        self.kernel.disarm_timer(index);
        {
            let task = self.task_mut(index);
            cheap_assert!(task.state != TaskState::Suspended);
            task.state = TaskState::Running;
            task.polls += 1;
            log::trace!("dispatching {} (#{index})", task.name);
            match task.entry.as_mut().poll(&mut Context::from_waker(&waker)) {
                Poll::Pending => (),
                Poll::Ready(never) => match never {},
            }
        }

        self.collect_wakes();
        let still_ready = self.pending & mask != 0;
        self.task_mut(index).state = if still_ready {
            TaskState::Ready
        } else {
            TaskState::Blocked
        };
        Some(TaskHandle(index))
    }

    /// Dispatches tasks until none is ready, and returns how many polls that
    /// took. Also consumes any pending yield request, since the point of one
    /// is to get here promptly.
    ///
    /// This does not return while tasks keep waking each other (or
    /// themselves, e.g. with [`yield_cpu`]).
    pub fn run_until_idle(&mut self) -> usize {
        self.kernel.take_yield_request();
        let mut polls = 0;
        while self.dispatch().is_some() {
            polls += 1;
        }
        polls
    }

    /// Drives the scheduler from a simulated tick source: `n` times, runs
    /// every ready task and then advances the clock by one tick. Finishes by
    /// running whatever the last tick woke.
    ///
    /// This is how hosted simulations and tests stand in for the timer
    /// interrupt.
    pub fn run_ticks(&mut self, n: u64) {
        for _ in 0..n {
            self.run_until_idle();
            self.kernel.tick();
        }
        self.run_until_idle();
    }

    /// Like [`run_ticks`][Scheduler::run_ticks], but stops once the clock
    /// reads `deadline` or later (after running everything ready at that
    /// point). Tasks that advance the clock themselves, to simulate execution
    /// time, don't make this overshoot by more than they advanced it.
    pub fn run_until(&mut self, deadline: TickTime) {
        loop {
            self.run_until_idle();
            if self.kernel.now() >= deadline {
                break;
            }
            self.kernel.tick();
        }
    }

    /// Transfers control to the dispatcher permanently. When no task is ready
    /// the processor waits for an interrupt (`WFI` on Cortex-M).
    pub fn start(self) -> ! {
        self.start_with_idle(default_idle)
    }

    /// Extended version of [`start`][Scheduler::start] that replaces the
    /// default idle behavior with code of your choosing. The hook runs each
    /// time no task is ready and no yield was requested.
    ///
    /// The hook returns `ControlFlow::Continue(())` to keep going. Returning
    /// `Break` reports that the platform can no longer drive the scheduler
    /// (say, a simulated tick source ran dry); since the dispatcher must never
    /// return, that is treated as a fatal invariant violation: it's logged,
    /// then this panics.
    pub fn start_with_idle(mut self, mut idle_hook: impl FnMut(Kernel) -> ControlFlow<()>) -> ! {
        log::debug!("starting dispatcher with {} tasks", self.task_count);
        loop {
            self.run_until_idle();
            if self.kernel.has_pending_work() {
                continue;
            }
            self.stats.idle_entries += 1;
            if idle_hook(self.kernel).is_break() {
                break;
            }
        }
        dispatcher_exited(&self.stats)
    }
}

fn claim_slot() -> Option<usize> {
    CORES.iter().position(|core| {
        core.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    })
}

fn default_idle(kernel: Kernel) -> ControlFlow<()> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "arm")] {
            critical_section::with(|_| {
                // Interrupts are masked here, so a wake can't slip in between
                // the check and the WFI; a pending interrupt still ends the
                // WFI, and runs once the critical section is over.
                if !kernel.has_pending_work() {
                    cortex_m::asm::wfi();
                }
            });
            // This works around an undocumented erratum on STM32 processors
            // when WFI is set to go to "Sleep" level while a debug agent keeps
            // clocks running. On other Cortex processors it costs a few cycles.
            cortex_m::asm::isb();
        } else {
            let _ = kernel;
            core::hint::spin_loop();
        }
    }
    ControlFlow::Continue(())
}

/// The fatal path behind [`Scheduler::start`]: the dispatcher must not
/// return, so if it does, say so loudly.
fn dispatcher_exited(stats: &Stats) -> ! {
    log::error!("scheduler dispatcher exited after {stats:?}; the system cannot continue");
    panic!("scheduler dispatcher returned");
}

/// Returns a future that will be pending exactly once before resolving.
///
/// This can be used to give up CPU to any other tasks that are currently ready
/// to run, and then take it back without waiting for an event.
///
/// # Cancellation
///
/// **Cancel safety:** Strict.
///
/// Dropping this future does nothing in particular.
pub fn yield_cpu() -> impl Future<Output = ()> {
    YieldCpu { polled: false }
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
struct YieldCpu {
    polled: bool,
}

impl Future for YieldCpu {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if core::mem::replace(&mut self.polled, true) {
            Poll::Ready(())
        } else {
            // Ensure that we get called next round.
            cx.waker().wake_by_ref();

            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::pin::pin;

    async fn park() -> Infallible {
        core::future::pending().await
    }

    #[test]
    fn test_wakers_round_trip_slot_and_index() {
        let w = waker_for_task(3, 17);
        assert_eq!(decode_waker(&w), Some((3, 17)));
        assert_eq!(decode_waker(&w.clone()), Some((3, 17)));
        assert_eq!(decode_waker(futures::task::noop_waker_ref()), None);
    }

    #[test]
    fn test_live_schedulers_have_distinct_slots() {
        let a = Scheduler::new(Config::DEFAULT).unwrap();
        let b = Scheduler::new(Config::DEFAULT).unwrap();
        assert_ne!(a.kernel(), b.kernel());
        a.kernel().tick();
        assert_eq!(b.kernel().now(), TickTime::ZERO);
    }

    #[test]
    fn test_fresh_scheduler_clock_starts_at_zero() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let k = sched.kernel();
        assert_eq!(k.now(), TickTime::ZERO);
        k.tick();
        k.tick();
        assert_eq!(k.now(), TickTime::from_ticks_since_boot(2));
    }

    #[test]
    fn test_tick_carries_into_epoch() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let k = sched.kernel();
        k.core().tick.store(u32::MAX, Ordering::SeqCst);
        assert_eq!(k.tick(), TickTime::from_ticks_since_boot(1 << 32));
    }

    #[test]
    fn test_new_tasks_get_a_first_poll_then_block() {
        let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
        let polled = Cell::new(0);
        let t = pin!(async {
            polled.set(polled.get() + 1);
            park().await
        });
        let h = sched.create_task(t, "parked", 64, Priority::DEFAULT).unwrap();
        assert_eq!(sched.task_info(h).state, TaskState::Ready);

        assert_eq!(sched.run_until_idle(), 1);
        assert_eq!(polled.get(), 1);
        let info = sched.task_info(h);
        assert_eq!(info.state, TaskState::Blocked);
        assert_eq!(info.polls, 1);
        assert_eq!(info.name, "parked");
        assert_eq!(sched.run_until_idle(), 0);
    }

    #[test]
    fn test_stack_budget_is_enforced() {
        let mut sched = Scheduler::new(Config::DEFAULT.with_stack_budget(300)).unwrap();
        let a = pin!(park());
        let b = pin!(park());
        let c = pin!(park());
        sched.create_task(a, "a", 200, Priority::DEFAULT).unwrap();
        assert_eq!(
            sched.create_task(b, "b", 101, Priority::DEFAULT),
            Err(Error::ResourceExhausted),
        );
        sched.create_task(c, "c", 100, Priority::DEFAULT).unwrap();
        assert_eq!(sched.stack_available(), 0);
        assert_eq!(sched.task_count(), 2);
    }

    #[test]
    fn test_timers_track_earliest_deadline() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let k = sched.kernel();
        let w = waker_for_task(sched.lease.slot, 4);
        k.arm_timer(TickTime::from_ticks_since_boot(9), &w);
        k.arm_timer(TickTime::from_ticks_since_boot(5), &w);
        k.arm_timer(TickTime::from_ticks_since_boot(7), &w);
        assert_eq!(k.timer_for(4), Some(TickTime::from_ticks_since_boot(5)));

        for _ in 0..4 {
            k.tick();
        }
        assert_eq!(k.core().ready.load(Ordering::SeqCst), 0);
        k.tick();
        assert_eq!(k.core().ready.load(Ordering::SeqCst), 1 << 4);
        assert_eq!(k.timer_for(4), None);
    }

    #[test]
    fn test_foreign_wakers_are_woken_immediately() {
        let ours = Scheduler::new(Config::DEFAULT).unwrap();
        let theirs = Scheduler::new(Config::DEFAULT).unwrap();
        let w = waker_for_task(theirs.lease.slot, 2);
        ours.kernel().arm_timer(TickTime::from_ticks_since_boot(100), &w);
        assert_eq!(theirs.kernel().core().ready.load(Ordering::SeqCst), 1 << 2);
        assert_eq!(ours.kernel().timer_for(2), None);
    }

    #[test]
    fn test_yield_requests_are_pending_work() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let k = sched.kernel();
        assert!(!k.has_pending_work());
        k.request_yield();
        assert!(k.has_pending_work());
        assert!(k.take_yield_request());
        assert!(!k.has_pending_work());
    }

    #[test]
    #[should_panic(expected = "scheduler dispatcher returned")]
    fn test_dispatcher_exit_is_fatal() {
        let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
        let t = pin!(park());
        sched.create_task(t, "parked", 64, Priority::DEFAULT).unwrap();
        let mut idles = 0;
        sched.start_with_idle(|k| {
            idles += 1;
            k.tick();
            if idles < 3 { ControlFlow::Continue(()) } else { ControlFlow::Break(()) }
        });
    }
}
