// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Internal temperature sensor: one task samples, another prints.
//!
//! The two tasks meet at a channel of capacity 1. The producer waits forever
//! for room, so it can never get more than one reading ahead of the console.

use core::convert::Infallible;
use core::future::Future;
use core::pin::Pin;

use cadence::{
    Channel, Error, Kernel, PeriodicActivity, Priority, Scheduler, TaskHandle, Ticks, Timeout,
};

use crate::hw::{AnalogInput, Console};
use crate::TASK_STACK;

/// Channel carrying readings in degrees Celsius.
pub type Readings = Channel<f32, 1>;

/// Time between readings.
pub const SAMPLE_PERIOD: Ticks = Ticks(2000);

/// Converts a 12-bit reading of the RP2040 temperature sensor to degrees
/// Celsius.
///
/// The sensor reads 0.706 V at 27 C and falls by 1.721 mV per degree; the
/// converter spans 0 to 3.3 V in 4096 steps.
pub fn celsius_from_raw(raw: u16) -> f32 {
    let volts = f32::from(raw) * 3.3 / 4095.0;
    27.0 - (volts - 0.706) / 0.001721
}

/// Everything the thermometer tasks share.
#[derive(Debug)]
pub struct Thermometer<'a, W> {
    /// Clock the producer is scheduled against.
    pub kernel: Kernel,
    /// Producer to consumer.
    pub readings: &'a Readings,
    /// Where the consumer prints.
    pub console: &'a W,
    /// Time between readings.
    pub period: Ticks,
}

impl<'a, W: Console> Thermometer<'a, W> {
    /// The standard thermometer, sampling every [`SAMPLE_PERIOD`].
    pub fn new(kernel: Kernel, readings: &'a Readings, console: &'a W) -> Self {
        Self { kernel, readings, console, period: SAMPLE_PERIOD }
    }
}

/// Task body: reads the sensor every period, starting now, and sends each
/// reading to the consumer. Waits as long as it takes for the consumer to
/// make room.
pub async fn read_temperature<W, A: AnalogInput>(ctx: &Thermometer<'_, W>, mut adc: A) -> Infallible {
    let tx = ctx.readings.sender(ctx.kernel);
    let mut cycle = PeriodicActivity::starting_now(ctx.kernel, ctx.period);
    loop {
        cycle.next_cycle().await;
        let celsius = celsius_from_raw(adc.read_sample());
        if let Err(e) = tx.send(celsius, Timeout::Forever).await {
            log::warn!("temperature reading lost: {e}");
        }
    }
}

/// Task body: prints each reading as it arrives.
pub async fn print_temperature<W: Console>(ctx: &Thermometer<'_, W>) -> Infallible {
    let rx = ctx.readings.receiver(ctx.kernel);
    loop {
        match rx.receive(Timeout::Forever).await {
            Ok(celsius) => ctx.console.write_line(format_args!("Internal temperature: {celsius:.2} C")),
            Err(e) => log::warn!("no temperature reading: {e}"),
        }
    }
}

/// Registers the producer (from [`read_temperature`]) and consumer (from
/// [`print_temperature`]) tasks, pinned by the caller.
pub fn spawn_thermometer<'t>(
    sched: &mut Scheduler<'t>,
    producer: Pin<&'t mut dyn Future<Output = Infallible>>,
    consumer: Pin<&'t mut dyn Future<Output = Infallible>>,
) -> Result<[TaskHandle; 2], Error> {
    let producer = sched.create_task(producer, "ReadTemp", TASK_STACK, Priority::DEFAULT)?;
    let consumer = sched.create_task(consumer, "PrintTemp", TASK_STACK, Priority::DEFAULT)?;
    log::debug!("thermometer tasks ready");
    Ok([producer, consumer])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_point_is_27_degrees() {
        // 0.706 V is 876.1 counts; the nearest readings straddle 27 C.
        assert!((celsius_from_raw(876) - 27.0).abs() < 0.1);
        assert!(celsius_from_raw(877) < celsius_from_raw(876));
    }

    #[test]
    fn test_conversion_endpoints() {
        assert!((celsius_from_raw(0) - 437.22).abs() < 0.01);
        assert!((celsius_from_raw(4095) - (-1480.27)).abs() < 0.01);
    }
}
