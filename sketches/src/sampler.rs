// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt-fed sampling: the ADC runs free, its FIFO interrupt moves
//! samples into a channel, and a task prints them.
//!
//! Setup binds the interrupt adapter to its channel and kernel, so the
//! interrupt handler needs nothing but the adapter:
//!
//! ```ignore
//! static SAMPLES: Samples = Channel::new();
//! static ADC_IRQ: SampleIrq<'static, AdcFifo, SAMPLE_CAPACITY> =
//!     SampleIrq::new(AdcFifo::new(), &SAMPLES, Kernel::system());
//!
//! #[interrupt]
//! fn ADC_IRQ_FIFO() {
//!     ADC_IRQ.service();
//! }
//! ```
//!
//! If samples arrive faster than the consumer prints them, the interrupt
//! drops what doesn't fit; the consumer reports how many were lost after the
//! next sample it prints.

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;

use cadence::irq::{SampleFifo, SampleIrq};
use cadence::{Channel, Error, Kernel, Priority, Scheduler, TaskHandle, Timeout};

use crate::hw::Console;
use crate::thermometer::celsius_from_raw;
use crate::TASK_STACK;

/// Samples buffered between the interrupt and the consumer.
pub const SAMPLE_CAPACITY: usize = 4;

/// Channel carrying raw converter readings.
pub type Samples = Channel<u16, SAMPLE_CAPACITY>;

/// Everything the sampler shares between interrupt and task.
#[derive(Debug)]
pub struct Sampler<'a, W> {
    /// Kernel whose tasks consume the samples.
    pub kernel: Kernel,
    /// Interrupt to consumer.
    pub samples: &'a Samples,
    /// Where the consumer prints.
    pub console: &'a W,
}

impl<'a, W: Console> Sampler<'a, W> {
    /// Bundles the sampler's shared state.
    pub fn new(kernel: Kernel, samples: &'a Samples, console: &'a W) -> Self {
        Self { kernel, samples, console }
    }

    /// Binds `fifo` to this sampler's channel. Call
    /// [`SampleIrq::service`] on the result from the FIFO's interrupt.
    pub fn bind_interrupt<F>(&self, fifo: F) -> SampleIrq<'a, F, SAMPLE_CAPACITY>
        where F: SampleFifo<Sample = u16>,
    {
        SampleIrq::new(fifo, self.samples, self.kernel)
    }
}

/// Task body: prints every sample the interrupt delivers, converted to
/// degrees Celsius, and reports drops.
pub async fn print_samples<W: Console>(ctx: &Sampler<'_, W>) -> Infallible {
    let rx = ctx.samples.receiver(ctx.kernel);
    let mut dropped = 0;
    loop {
        let raw = match rx.receive(Timeout::Forever).await {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("no sample: {e}");
                continue;
            }
        };
        ctx.console.write_line(format_args!("Sample {raw}: {:.2} C", celsius_from_raw(raw)));

        let total = ctx.samples.dropped();
        if total != dropped {
            ctx.console.write_line(format_args!("{} samples dropped", total.wrapping_sub(dropped)));
            dropped = total;
        }
    }
}

/// Registers the consumer task, created from [`print_samples`] and pinned by
/// the caller.
pub fn spawn_sampler<'t>(
    sched: &mut Scheduler<'t>,
    consumer: Pin<&'t mut dyn Future<Output = Infallible>>,
) -> Result<TaskHandle, Error> {
    let consumer = sched.create_task(consumer, "PrintSamples", TASK_STACK, Priority::DEFAULT)?;
    log::debug!("sampler task ready");
    Ok(consumer)
}
