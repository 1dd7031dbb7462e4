// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving data from interrupt handlers into channels.
//!
//! A [`SampleIrq`] is bound, at setup time, to three things: a hardware sample
//! source implementing [`SampleFifo`], the [`Channel`] its samples go into,
//! and the [`Kernel`] whose tasks consume them. The interrupt handler itself
//! shrinks to one call:
//!
//! ```ignore
//! static SAMPLES: Channel<u16, 4> = Channel::new();
//! static ADC_IRQ: SampleIrq<'static, AdcFifo, 4> =
//!     SampleIrq::new(AdcFifo::new(), &SAMPLES, Kernel::system());
//!
//! #[interrupt]
//! fn ADC_IRQ_FIFO() {
//!     ADC_IRQ.service();
//! }
//! ```
//!
//! Platforms that demultiplex interrupts in software can collect handlers in
//! an [`InterruptTable`] instead, and route each line number to its handler.

use core::cell::RefCell;

use critical_section::Mutex;
use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::channel::Channel;
use crate::error::Error;
use crate::exec::Kernel;

/// A hardware queue of samples that raises an interrupt while non-empty,
/// such as an ADC result FIFO.
pub trait SampleFifo {
    /// Type of one sample.
    type Sample;

    /// Number of samples ready to be popped right now.
    fn pending_count(&mut self) -> usize;

    /// Pops one sample. Only called after `pending_count` reported one.
    fn pop_sample(&mut self) -> Self::Sample;

    /// Acknowledges the interrupt condition.
    fn clear_pending(&mut self);
}

/// Something that can be invoked when an interrupt line fires.
pub trait InterruptHandler: Sync {
    /// Handles one firing of the line.
    fn on_interrupt(&self);
}

/// What one [`SampleIrq::service`] call did.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IrqReport {
    /// Samples that made it into the channel.
    pub delivered: usize,
    /// Samples discarded because the channel was full.
    pub dropped: usize,
    /// Whether a reschedule was requested because a receiver was woken.
    pub yield_requested: bool,
}

/// Interrupt adapter: drains a [`SampleFifo`] into a [`Channel`].
pub struct SampleIrq<'c, S: SampleFifo, const C: usize> {
    source: Mutex<RefCell<S>>,
    channel: &'c Channel<S::Sample, C>,
    kernel: Kernel,
    busy: AtomicBool,
    delivered: AtomicU32,
    dropped: AtomicU32,
}

impl<'c, S: SampleFifo, const C: usize> SampleIrq<'c, S, C> {
    /// Binds `source` to `channel`, waking tasks of `kernel`.
    pub const fn new(source: S, channel: &'c Channel<S::Sample, C>, kernel: Kernel) -> Self {
        Self {
            source: Mutex::new(RefCell::new(source)),
            channel,
            kernel,
            busy: AtomicBool::new(false),
            delivered: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    /// The body of the interrupt handler.
    ///
    /// Reads exactly the samples the source reports pending and sends each
    /// into the channel with
    /// [`send_from_interrupt`][Channel::send_from_interrupt]. Samples that
    /// don't fit are dropped (and counted). Then clears the source's pending
    /// condition and, if any blocked receiver was woken, requests a yield so
    /// the receiver runs as soon as the interrupt returns.
    ///
    /// Not reentrant: if this is somehow entered again while already running
    /// for the same adapter, the nested call does nothing and returns an empty
    /// report.
    pub fn service(&self) -> IrqReport {
        if self.busy.swap(true, Ordering::Acquire) {
            return IrqReport::default();
        }
        let _busy = scopeguard::guard((), |()| self.busy.store(false, Ordering::Release));

        let mut report = IrqReport::default();
        let mut woke = false;
        let pending = self.with_source(|s| s.pending_count());
        for _ in 0..pending {
            let sample = self.with_source(|s| s.pop_sample());
            match self.channel.send_from_interrupt(sample) {
                Ok(w) => {
                    report.delivered += 1;
                    woke |= w;
                }
                Err(_) => report.dropped += 1,
            }
        }
        self.with_source(|s| s.clear_pending());

        if woke {
            self.kernel.request_yield();
            report.yield_requested = true;
        }
        self.delivered.fetch_add(report.delivered as u32, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u32, Ordering::Relaxed);
        report
    }

    /// Gives `body` exclusive access to the sample source, e.g. to configure
    /// it before enabling its interrupt.
    pub fn with_source<R>(&self, body: impl FnOnce(&mut S) -> R) -> R {
        critical_section::with(|cs| body(&mut self.source.borrow_ref_mut(cs)))
    }

    /// Total samples delivered so far.
    pub fn delivered(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Total samples dropped so far.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<S: SampleFifo, const C: usize> InterruptHandler for SampleIrq<'_, S, C>
    where S: Send,
          S::Sample: Send,
{
    fn on_interrupt(&self) {
        self.service();
    }
}

impl<S: SampleFifo, const C: usize> core::fmt::Debug for SampleIrq<'_, S, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SampleIrq")
            .field("kernel", &self.kernel)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("delivered", &self.delivered())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

/// Maps interrupt line numbers `0..N` to bound handlers.
///
/// Registration happens during setup, before interrupts are enabled. After
/// that the table is only read, so it can be shared with the vector code by
/// reference.
pub struct InterruptTable<'h, const N: usize> {
    handlers: [Option<&'h dyn InterruptHandler>; N],
}

impl<'h, const N: usize> InterruptTable<'h, N> {
    /// Creates a table with no lines bound.
    pub const fn new() -> Self {
        Self { handlers: [None; N] }
    }

    /// Binds `handler` to `line`.
    ///
    /// Fails with [`Error::ResourceExhausted`] if `line` is beyond the table,
    /// or [`Error::AlreadyRegistered`] if the line already has a handler.
    pub fn register(&mut self, line: usize, handler: &'h dyn InterruptHandler) -> Result<(), Error> {
        let slot = self.handlers.get_mut(line).ok_or(Error::ResourceExhausted)?;
        if slot.is_some() {
            return Err(Error::AlreadyRegistered);
        }
        *slot = Some(handler);
        log::debug!("bound interrupt line {line}");
        Ok(())
    }

    /// Checks whether `line` has a handler.
    pub fn is_registered(&self, line: usize) -> bool {
        matches!(self.handlers.get(line), Some(Some(_)))
    }

    /// Runs the handler bound to `line`. Returns `false` if there is none,
    /// i.e. the interrupt was spurious.
    pub fn dispatch(&self, line: usize) -> bool {
        match self.handlers.get(line) {
            Some(Some(h)) => {
                h.on_interrupt();
                true
            }
            _ => false,
        }
    }
}

impl<const N: usize> Default for InterruptTable<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> core::fmt::Debug for InterruptTable<'_, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let bound = self.handlers.iter().filter(|h| h.is_some()).count();
        f.debug_struct("InterruptTable")
            .field("lines", &N)
            .field("bound", &bound)
            .finish()
    }
}
