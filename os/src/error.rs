// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy shared by the scheduler, channels and interrupt adapters.
//!
//! There are deliberately few kinds of failure:
//!
//! - [`Error::ResourceExhausted`] comes out of setup (claiming a kernel slot,
//!   creating a task, binding an interrupt line). Nothing useful can run
//!   without the thing you failed to create, so treat it as fatal and stop
//!   before starting the dispatcher.
//! - [`Error::Timeout`] means a task-side send or receive did not complete
//!   within the bound you asked for. The caller decides whether to retry.
//! - [`Error::Dropped`] means an interrupt-side send found its channel full.
//!   The item is lost (well, handed back to the ISR, which usually has nowhere
//!   to put it). This is counted, not crashed on.
//! - [`Error::AlreadyRegistered`] means an interrupt line was bound twice.

use core::fmt;

/// Things that can go wrong in `cadence`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// A task control block, stack reservation, kernel slot or interrupt
    /// vector could not be allocated.
    ResourceExhausted,
    /// A task-side channel operation did not complete before its deadline.
    Timeout,
    /// An interrupt-side send found the channel full and discarded the item.
    Dropped,
    /// An interrupt line already has a handler bound to it.
    AlreadyRegistered,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::ResourceExhausted => "resource exhausted",
            Error::Timeout => "timed out",
            Error::Dropped => "dropped: channel full in interrupt context",
            Error::AlreadyRegistered => "interrupt line already registered",
        };
        f.write_str(s)
    }
}

impl core::error::Error for Error {}

/// A send that didn't happen. Ownership of the item comes back to the caller
/// along with the reason, so nothing is silently destroyed on the task side.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SendError<T> {
    /// Why the item was rejected: [`Error::Timeout`] for task-side sends,
    /// [`Error::Dropped`] for interrupt-side sends.
    pub reason: Error,
    /// The item that was not sent.
    pub item: T,
}

impl<T> SendError<T> {
    /// Discards the reason and returns the rejected item.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.reason)
    }
}

impl<T: fmt::Debug> core::error::Error for SendError<T> {}

impl<T> From<SendError<T>> for Error {
    fn from(e: SendError<T>) -> Self {
        e.reason
    }
}
