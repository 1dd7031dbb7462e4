// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware capabilities the sketches need, and nothing more.
//!
//! Board support code implements these for real peripherals; the tests
//! implement them with recorders. The sample FIFO used by the interrupt-fed
//! sketch is [`cadence::irq::SampleFifo`].

use core::cell::RefCell;
use core::fmt;

use critical_section::Mutex;
use embedded_hal::digital::v2::OutputPin;

/// Logic level of a digital output.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Level {
    /// Driven low.
    Low,
    /// Driven high.
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

/// A bank of digital outputs addressed by pin number.
pub trait DigitalOutput {
    /// Drives `pin` to `level`.
    fn set_level(&self, pin: u8, level: Level);
}

/// A single-channel analog-to-digital converter.
pub trait AnalogInput {
    /// Performs one conversion and returns the raw reading. The RP2040's
    /// converter produces 12 bits, so readings are in `0..=4095`.
    fn read_sample(&mut self) -> u16;
}

/// A line-oriented text sink, e.g. a UART or USB serial console.
pub trait Console {
    /// Writes one line of text. The implementation supplies the line ending.
    fn write_line(&self, args: fmt::Arguments<'_>);
}

/// Adapts `embedded-hal` output pins to [`DigitalOutput`].
///
/// Pin `first + i` maps to `pins[i]`. The pins sit behind a critical section,
/// so one `HalPins` can be shared by every task (and interrupt) that drives
/// them.
pub struct HalPins<P, const N: usize> {
    first: u8,
    pins: Mutex<RefCell<[P; N]>>,
}

impl<P, const N: usize> HalPins<P, N> {
    /// Wraps `pins`, the first of which is pin number `first`.
    pub const fn new(first: u8, pins: [P; N]) -> Self {
        Self { first, pins: Mutex::new(RefCell::new(pins)) }
    }
}

impl<P, const N: usize> DigitalOutput for HalPins<P, N>
    where P: OutputPin,
          P::Error: fmt::Debug,
{
    fn set_level(&self, pin: u8, level: Level) {
        let Some(index) = pin.checked_sub(self.first).map(usize::from).filter(|&i| i < N) else {
            log::warn!("pin {pin} is not in this bank");
            return;
        };
        let result = critical_section::with(|cs| {
            let p = &mut self.pins.borrow_ref_mut(cs)[index];
            match level {
                Level::High => p.set_high(),
                Level::Low => p.set_low(),
            }
        });
        if let Err(e) = result {
            log::warn!("failed to drive pin {pin} {level:?}: {e:?}");
        }
    }
}

impl<P, const N: usize> fmt::Debug for HalPins<P, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HalPins")
            .field("first", &self.first)
            .field("count", &N)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::pin::{Mock, State, Transaction};

    #[test]
    fn test_hal_pins_drive_the_addressed_pin() {
        let mut led = Mock::new(&[
            Transaction::set(State::High),
            Transaction::set(State::Low),
        ]);
        let untouched: [Transaction; 0] = [];
        let mut other = Mock::new(&untouched);
        let bank = HalPins::new(24, [other.clone(), led.clone()]);

        bank.set_level(25, Level::High);
        bank.set_level(25, Level::Low);
        // Outside the bank: ignored.
        bank.set_level(23, Level::High);
        bank.set_level(26, Level::High);

        led.done();
        other.done();
    }

    #[test]
    fn test_levels_from_bools() {
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::from(false), Level::Low);
    }
}
