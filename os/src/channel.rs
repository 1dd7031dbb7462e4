// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A bounded FIFO channel between tasks and interrupt handlers.
//!
//! A [`Channel<T, C>`] holds up to `C` items of type `T`. It's created with a
//! `const fn`, so it can live in a `static` or on the stack of whatever code
//! creates the scheduler, and then be shared by reference.
//!
//! Tasks use it through [`Sender`] and [`Receiver`] endpoints, whose `send`
//! and `receive` operations block (asynchronously) for up to a
//! [`Timeout`]. Interrupt handlers use
//! [`send_from_interrupt`][Channel::send_from_interrupt], which never blocks:
//! if the channel is full the item is handed back as
//! [`Error::Dropped`] and counted.
//!
//! # Ordering
//!
//! Items come out in the order they went in. Tasks blocked on the same
//! operation are served in the order they started waiting: a new `receive`
//! can't overtake a receiver that's already queued, even if it happens to be
//! polled first. When a waiter times out or is dropped while at the head of
//! the queue, it passes its turn to the next waiter, so no wakeup is lost.
//!
//! # Implementation
//!
//! All state lives in a `critical_section::Mutex`. On a single-core Cortex-M
//! that means interrupts are masked for the few instructions each operation
//! takes; on a host it's a global lock. Waiters record their task's `Waker`
//! in a fixed-size queue sized for [`MAX_TASKS`] waiters per direction.

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use critical_section::Mutex;
use heapless::{Deque, Vec};
use pin_project::{pin_project, pinned_drop};
use portable_atomic::{AtomicU32, Ordering};

use crate::error::{Error, SendError};
use crate::exec::{Kernel, MAX_TASKS};
use crate::time::{TickTime, Timeout};

/// A fixed-capacity, single-typed mailbox.
///
/// `C` must be at least 1; `Channel::<T, 0>::new()` fails to compile.
pub struct Channel<T, const C: usize> {
    state: Mutex<RefCell<State<T, C>>>,
    dropped: AtomicU32,
}

struct State<T, const C: usize> {
    items: Deque<T, C>,
    receivers: WaitQueue,
    senders: WaitQueue,
    next_ticket: u32,
}

struct Waiter {
    ticket: u32,
    waker: Waker,
}

/// Tasks blocked in one direction, oldest first.
struct WaitQueue {
    waiters: Vec<Waiter, MAX_TASKS>,
}

impl WaitQueue {
    const fn new() -> Self {
        Self { waiters: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Checks whether the holder of `ticket` (or a newcomer, for `None`) is
    /// allowed to act now without overtaking anyone.
    fn may_proceed(&self, ticket: Option<u32>) -> bool {
        match ticket.and_then(|t| self.position(t)) {
            Some(i) => i == 0,
            None => self.waiters.is_empty(),
        }
    }

    fn position(&self, ticket: u32) -> Option<usize> {
        self.waiters.iter().position(|w| w.ticket == ticket)
    }

    /// Records (or refreshes) the waker for `ticket`. Returns `false` if the
    /// queue is full and the waiter could not be recorded.
    fn register(&mut self, ticket: u32, waker: &Waker) -> bool {
        match self.position(ticket) {
            Some(i) => {
                let w = &mut self.waiters[i];
                if !w.waker.will_wake(waker) {
                    w.waker = waker.clone();
                }
                true
            }
            None => self.waiters
                .push(Waiter { ticket, waker: waker.clone() })
                .is_ok(),
        }
    }

    fn remove(&mut self, ticket: u32) {
        if let Some(i) = self.position(ticket) {
            self.waiters.remove(i);
        }
    }

    /// Wakes the oldest waiter, if any, and reports whether there was one.
    fn wake_head(&self) -> bool {
        match self.waiters.first() {
            Some(w) => {
                w.waker.wake_by_ref();
                true
            }
            None => false,
        }
    }
}

impl<T, const C: usize> Channel<T, C> {
    const NONZERO_CAPACITY: () = assert!(C > 0, "channel capacity must be at least 1");

    /// Creates an empty channel.
    pub const fn new() -> Self {
        let () = Self::NONZERO_CAPACITY;
        Self {
            state: Mutex::new(RefCell::new(State {
                items: Deque::new(),
                receivers: WaitQueue::new(),
                senders: WaitQueue::new(),
                next_ticket: 0,
            })),
            dropped: AtomicU32::new(0),
        }
    }

    fn with_state<R>(&self, body: impl FnOnce(&mut State<T, C>) -> R) -> R {
        critical_section::with(|cs| body(&mut self.state.borrow_ref_mut(cs)))
    }

    /// Maximum number of items held at once.
    pub const fn capacity(&self) -> usize {
        C
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.with_state(|s| s.items.len())
    }

    /// Checks whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.with_state(|s| s.items.is_empty())
    }

    /// Checks whether the channel is at capacity.
    pub fn is_full(&self) -> bool {
        self.with_state(|s| s.items.is_full())
    }

    /// Number of items discarded by
    /// [`send_from_interrupt`][Channel::send_from_interrupt] because the
    /// channel was full.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns the task-side sending endpoint, using `kernel`'s clock for
    /// timeouts.
    pub fn sender(&self, kernel: Kernel) -> Sender<'_, T, C> {
        Sender { channel: self, kernel }
    }

    /// Returns the task-side receiving endpoint, using `kernel`'s clock for
    /// timeouts.
    pub fn receiver(&self, kernel: Kernel) -> Receiver<'_, T, C> {
        Receiver { channel: self, kernel }
    }

    /// Puts `item` at the back of the channel if that can be done right now
    /// without overtaking a blocked sender. Otherwise hands it back with
    /// [`Error::Timeout`], as a `send` with a zero timeout would.
    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        self.with_state(|s| {
            if !s.senders.is_empty() {
                return Err(SendError { reason: Error::Timeout, item });
            }
            match s.items.push_back(item) {
                Ok(()) => {
                    s.receivers.wake_head();
                    Ok(())
                }
                Err(item) => Err(SendError { reason: Error::Timeout, item }),
            }
        })
    }

    /// Takes the item at the front of the channel if there is one and no
    /// receiver is already queued for it. Otherwise fails with
    /// [`Error::Timeout`], as a `receive` with a zero timeout would.
    pub fn try_receive(&self) -> Result<T, Error> {
        self.with_state(|s| {
            if !s.receivers.is_empty() {
                return Err(Error::Timeout);
            }
            let item = s.items.pop_front().ok_or(Error::Timeout)?;
            s.senders.wake_head();
            Ok(item)
        })
    }

    /// Sends from interrupt context. Never blocks.
    ///
    /// On success, returns `true` if a blocked receiver was made ready. In
    /// that case the interrupt handler should call
    /// [`Kernel::request_yield`] before returning, so the receiver runs
    /// promptly.
    ///
    /// If the channel is full, the item is handed back with
    /// [`Error::Dropped`], the drop counter is incremented and a warning is
    /// logged. The items already queued are untouched.
    pub fn send_from_interrupt(&self, item: T) -> Result<bool, SendError<T>> {
        let result = self.with_state(|s| {
            s.items.push_back(item).map(|()| s.receivers.wake_head())
        });
        result.map_err(|item| {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            log::warn!("channel full in interrupt context, item dropped ({total} so far)");
            SendError { reason: Error::Dropped, item }
        })
    }
}

impl<T, const C: usize> Default for Channel<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const C: usize> core::fmt::Debug for Channel<T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &C)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Task-side sending endpoint of a [`Channel`].
pub struct Sender<'a, T, const C: usize> {
    channel: &'a Channel<T, C>,
    kernel: Kernel,
}

impl<'a, T, const C: usize> Sender<'a, T, C> {
    /// Sends `item`, waiting up to `timeout` for space.
    ///
    /// If the channel has room and no other sender is waiting, the item goes
    /// in at once and the oldest blocked receiver, if any, is woken.
    /// Otherwise the calling task blocks until space frees up and its turn
    /// comes, or until `timeout` has passed since this was called, in which
    /// case the item is handed back with [`Error::Timeout`].
    ///
    /// # Cancellation
    ///
    /// **Cancel safety:** Strict.
    ///
    /// Dropping the future before it resolves leaves the channel as it was.
    /// The item is dropped with the future.
    pub fn send(&self, item: T, timeout: Timeout) -> Sending<'a, T, C> {
        Sending {
            channel: self.channel,
            kernel: self.kernel,
            item: Some(item),
            ticket: None,
            deadline: timeout.deadline_from(self.kernel.now()),
        }
    }

    /// See [`Channel::try_send`].
    pub fn try_send(&self, item: T) -> Result<(), SendError<T>> {
        self.channel.try_send(item)
    }

    /// The channel this sends into.
    pub fn channel(&self) -> &'a Channel<T, C> {
        self.channel
    }
}

impl<T, const C: usize> Clone for Sender<'_, T, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const C: usize> Copy for Sender<'_, T, C> {}

impl<T, const C: usize> core::fmt::Debug for Sender<'_, T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sender").field("channel", self.channel).finish()
    }
}

/// Task-side receiving endpoint of a [`Channel`].
pub struct Receiver<'a, T, const C: usize> {
    channel: &'a Channel<T, C>,
    kernel: Kernel,
}

impl<'a, T, const C: usize> Receiver<'a, T, C> {
    /// Receives the oldest item, waiting up to `timeout` for one to arrive.
    ///
    /// Taking an item wakes the oldest blocked sender, if any. With a zero
    /// timeout this fails with [`Error::Timeout`] on the first poll if
    /// nothing is queued; with [`Timeout::Forever`] it never fails.
    ///
    /// # Cancellation
    ///
    /// **Cancel safety:** Strict.
    ///
    /// Items are only removed from the channel when this resolves, so
    /// dropping it loses nothing.
    pub fn receive(&self, timeout: Timeout) -> Receiving<'a, T, C> {
        Receiving {
            channel: self.channel,
            kernel: self.kernel,
            ticket: None,
            deadline: timeout.deadline_from(self.kernel.now()),
        }
    }

    /// See [`Channel::try_receive`].
    pub fn try_receive(&self) -> Result<T, Error> {
        self.channel.try_receive()
    }

    /// The channel this receives from.
    pub fn channel(&self) -> &'a Channel<T, C> {
        self.channel
    }
}

impl<T, const C: usize> Clone for Receiver<'_, T, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const C: usize> Copy for Receiver<'_, T, C> {}

impl<T, const C: usize> core::fmt::Debug for Receiver<'_, T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Receiver").field("channel", self.channel).finish()
    }
}

/// Leaves a wait queue, handing the turn on to the next waiter if it could
/// now make progress.
fn leave(queue: &mut WaitQueue, ticket: &mut Option<u32>, next_can_proceed: bool) {
    if let Some(t) = ticket.take() {
        queue.remove(t);
        if next_can_proceed {
            queue.wake_head();
        }
    }
}

/// Joins (or stays in) a wait queue with the current task's waker.
fn block(
    queue: &mut WaitQueue,
    ticket: &mut Option<u32>,
    next_ticket: impl FnOnce() -> u32,
    cx: &mut Context<'_>,
) {
    let t = *ticket.get_or_insert_with(next_ticket);
    if !queue.register(t, cx.waker()) {
        // Nowhere to record the waker. Ask to be polled again instead.
        cx.waker().wake_by_ref();
    }
}

/// Arms the timeout, catching a deadline that passed while we were queueing.
fn arm_deadline(kernel: Kernel, deadline: Option<TickTime>, cx: &mut Context<'_>) {
    if let Some(d) = deadline {
        kernel.arm_timer(d, cx.waker());
        if kernel.now() >= d {
            cx.waker().wake_by_ref();
        }
    }
}

/// Future returned by [`Sender::send`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project(PinnedDrop)]
pub struct Sending<'a, T, const C: usize> {
    channel: &'a Channel<T, C>,
    kernel: Kernel,
    item: Option<T>,
    ticket: Option<u32>,
    deadline: Option<TickTime>,
}

impl<T, const C: usize> Future for Sending<'_, T, C> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let now = this.kernel.now();
        let Some(item) = this.item.take() else {
            panic!("send polled after completion");
        };

        let outcome = critical_section::with(|cs| {
            let mut s = this.channel.state.borrow_ref_mut(cs);
            let s = &mut *s;
            let item = if s.senders.may_proceed(*this.ticket) {
                match s.items.push_back(item) {
                    Ok(()) => {
                        s.receivers.wake_head();
                        leave(&mut s.senders, this.ticket, !s.items.is_full());
                        return Poll::Ready(Ok(()));
                    }
                    Err(item) => item,
                }
            } else {
                item
            };

            if this.deadline.is_some_and(|d| now >= d) {
                leave(&mut s.senders, this.ticket, !s.items.is_full());
                return Poll::Ready(Err(SendError { reason: Error::Timeout, item }));
            }

            *this.item = Some(item);
            let next_ticket = &mut s.next_ticket;
            block(&mut s.senders, this.ticket, || take(next_ticket), cx);
            Poll::Pending
        });

        if outcome.is_pending() {
            arm_deadline(*this.kernel, *this.deadline, cx);
        }
        outcome
    }
}

#[pinned_drop]
impl<T, const C: usize> PinnedDrop for Sending<'_, T, C> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if this.ticket.is_some() {
            let channel = *this.channel;
            critical_section::with(|cs| {
                let mut s = channel.state.borrow_ref_mut(cs);
                let can_proceed = !s.items.is_full();
                leave(&mut s.senders, this.ticket, can_proceed);
            });
        }
    }
}

impl<T, const C: usize> core::fmt::Debug for Sending<'_, T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sending")
            .field("ticket", &self.ticket)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Future returned by [`Receiver::receive`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project(PinnedDrop)]
pub struct Receiving<'a, T, const C: usize> {
    channel: &'a Channel<T, C>,
    kernel: Kernel,
    ticket: Option<u32>,
    deadline: Option<TickTime>,
}

impl<T, const C: usize> Future for Receiving<'_, T, C> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let now = this.kernel.now();

        let outcome = critical_section::with(|cs| {
            let mut s = this.channel.state.borrow_ref_mut(cs);
            let s = &mut *s;
            if s.receivers.may_proceed(*this.ticket) {
                if let Some(item) = s.items.pop_front() {
                    s.senders.wake_head();
                    leave(&mut s.receivers, this.ticket, !s.items.is_empty());
                    return Poll::Ready(Ok(item));
                }
            }

            if this.deadline.is_some_and(|d| now >= d) {
                leave(&mut s.receivers, this.ticket, !s.items.is_empty());
                return Poll::Ready(Err(Error::Timeout));
            }

            let next_ticket = &mut s.next_ticket;
            block(&mut s.receivers, this.ticket, || take(next_ticket), cx);
            Poll::Pending
        });

        if outcome.is_pending() {
            arm_deadline(*this.kernel, *this.deadline, cx);
        }
        outcome
    }
}

#[pinned_drop]
impl<T, const C: usize> PinnedDrop for Receiving<'_, T, C> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if this.ticket.is_some() {
            let channel = *this.channel;
            critical_section::with(|cs| {
                let mut s = channel.state.borrow_ref_mut(cs);
                let can_proceed = !s.items.is_empty();
                leave(&mut s.receivers, this.ticket, can_proceed);
            });
        }
    }
}

impl<T, const C: usize> core::fmt::Debug for Receiving<'_, T, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Receiving")
            .field("ticket", &self.ticket)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Hands out the next waiter ticket.
fn take(next_ticket: &mut u32) -> u32 {
    let t = *next_ticket;
    *next_ticket = t.wrapping_add(1);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exec::Scheduler;
    use core::pin::pin;
    use futures::task::noop_waker_ref;

    fn poll_once<F: Future>(f: Pin<&mut F>) -> Poll<F::Output> {
        f.poll(&mut Context::from_waker(noop_waker_ref()))
    }

    #[test]
    fn test_try_operations_round_trip_in_order() {
        let ch: Channel<u8, 3> = Channel::new();
        assert_eq!(ch.capacity(), 3);
        assert!(ch.is_empty());
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        ch.try_send(3).unwrap();
        assert!(ch.is_full());
        assert_eq!(ch.try_send(4), Err(SendError { reason: Error::Timeout, item: 4 }));
        assert_eq!(ch.try_receive(), Ok(1));
        assert_eq!(ch.try_receive(), Ok(2));
        assert_eq!(ch.try_receive(), Ok(3));
        assert_eq!(ch.try_receive(), Err(Error::Timeout));
    }

    #[test]
    fn test_interrupt_send_drops_when_full() {
        let ch: Channel<u16, 1> = Channel::new();
        assert_eq!(ch.send_from_interrupt(10), Ok(false));
        assert_eq!(ch.send_from_interrupt(11), Err(SendError { reason: Error::Dropped, item: 11 }));
        assert_eq!(ch.dropped(), 1);
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.try_receive(), Ok(10));
    }

    #[test]
    fn test_zero_timeout_receive_fails_on_first_poll() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let ch: Channel<u8, 1> = Channel::new();
        let rx = ch.receiver(sched.kernel());
        let f = pin!(rx.receive(Timeout::NONE));
        assert_eq!(poll_once(f), Poll::Ready(Err(Error::Timeout)));
    }

    #[test]
    fn test_newcomers_queue_behind_blocked_receivers() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let ch: Channel<u8, 2> = Channel::new();
        let rx = ch.receiver(sched.kernel());

        let mut first = pin!(rx.receive(Timeout::Forever));
        assert!(poll_once(first.as_mut()).is_pending());

        ch.try_send(7).unwrap();
        // Not the head of the queue, so it can't take the item.
        let mut second = pin!(rx.receive(Timeout::Forever));
        assert!(poll_once(second.as_mut()).is_pending());
        assert_eq!(ch.try_receive(), Err(Error::Timeout));

        assert_eq!(poll_once(first.as_mut()), Poll::Ready(Ok(7)));
        assert!(poll_once(second.as_mut()).is_pending());
        ch.try_send(8).unwrap();
        assert_eq!(poll_once(second.as_mut()), Poll::Ready(Ok(8)));
    }

    #[test]
    fn test_dropping_a_waiter_leaves_the_queue() {
        let sched = Scheduler::new(Config::DEFAULT).unwrap();
        let ch: Channel<u8, 1> = Channel::new();
        let rx = ch.receiver(sched.kernel());
        {
            let f = pin!(rx.receive(Timeout::Forever));
            assert!(poll_once(f).is_pending());
        }
        ch.try_send(1).unwrap();
        assert_eq!(ch.try_receive(), Ok(1));
    }

    #[test]
    fn test_wait_queue_serves_oldest_first() {
        let mut q = WaitQueue::new();
        let w = noop_waker_ref();
        assert!(q.may_proceed(None));
        assert!(q.register(5, w));
        assert!(q.register(6, w));
        assert!(q.register(5, w));
        assert!(q.may_proceed(Some(5)));
        assert!(!q.may_proceed(Some(6)));
        assert!(!q.may_proceed(None));
        // A ticket that isn't queued counts as a newcomer.
        assert!(!q.may_proceed(Some(9)));
        q.remove(5);
        assert!(q.may_proceed(Some(6)));
        assert!(q.wake_head());
        q.remove(6);
        assert!(!q.wake_head());
    }
}
