// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod common;

use cadence::irq::InterruptTable;
use cadence::{Config, Scheduler};
use cadence_sketches::sampler::{print_samples, spawn_sampler, Sampler, Samples};
use cadence_sketches::thermometer::celsius_from_raw;
use pin_utils::pin_mut;

use common::{ConsoleRecorder, FakeFifo};

/// Line number the fake converter FIFO interrupts on.
const ADC_IRQ_FIFO: usize = 22;

fn line_for(raw: u16) -> String {
    format!("Sample {raw}: {:.2} C", celsius_from_raw(raw))
}

#[test]
fn test_interrupt_samples_reach_the_console() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let kernel = sched.kernel();
    let samples = Samples::new();
    let console = ConsoleRecorder::default();
    let ctx = Sampler::new(kernel, &samples, &console);
    let irq = ctx.bind_interrupt(FakeFifo::default());
    let mut vectors: InterruptTable<'_, 32> = InterruptTable::new();
    vectors.register(ADC_IRQ_FIFO, &irq).unwrap();

    let consumer = print_samples(&ctx);
    pin_mut!(consumer);
    spawn_sampler(&mut sched, consumer).unwrap();
    sched.run_ticks(10);

    irq.with_source(|f| f.queued.extend([800, 810]));
    assert!(vectors.dispatch(ADC_IRQ_FIFO));
    assert!(kernel.has_pending_work());
    sched.run_until_idle();
    assert_eq!(*console.lines.borrow(), [line_for(800), line_for(810)]);
}

#[test]
fn test_overflow_is_reported_after_next_sample() {
    let mut sched = Scheduler::new(Config::DEFAULT).unwrap();
    let kernel = sched.kernel();
    let samples = Samples::new();
    let console = ConsoleRecorder::default();
    let ctx = Sampler::new(kernel, &samples, &console);
    let irq = ctx.bind_interrupt(FakeFifo::default());

    let consumer = print_samples(&ctx);
    pin_mut!(consumer);
    spawn_sampler(&mut sched, consumer).unwrap();
    sched.run_until_idle();

    // Six samples at once into room for four.
    irq.with_source(|f| f.queued.extend([1, 2, 3, 4, 5, 6]));
    let report = irq.service();
    assert_eq!((report.delivered, report.dropped), (4, 2));
    sched.run_until_idle();

    assert_eq!(
        *console.lines.borrow(),
        [
            line_for(1),
            "2 samples dropped".to_string(),
            line_for(2),
            line_for(3),
            line_for(4),
        ],
    );
}
