// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording stand-ins for the sketch hardware.

#![allow(dead_code)]

use core::cell::RefCell;
use core::fmt;
use std::collections::VecDeque;

use cadence::irq::SampleFifo;
use cadence::Kernel;
use cadence_sketches::hw::{AnalogInput, Console, DigitalOutput, Level};

/// Records every pin change with the tick it happened at.
pub struct PinRecorder {
    pub kernel: Kernel,
    pub changes: RefCell<Vec<(u64, u8, Level)>>,
}

impl PinRecorder {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel, changes: RefCell::new(Vec::new()) }
    }

    /// Level of `pin` just after `tick`, if it was ever driven by then.
    pub fn level_at(&self, pin: u8, tick: u64) -> Option<Level> {
        self.changes
            .borrow()
            .iter()
            .filter(|&&(t, p, _)| p == pin && t <= tick)
            .last()
            .map(|&(_, _, l)| l)
    }
}

impl DigitalOutput for PinRecorder {
    fn set_level(&self, pin: u8, level: Level) {
        self.changes.borrow_mut().push((self.kernel.now().ticks_since_boot(), pin, level));
    }
}

/// Collects console lines.
#[derive(Default)]
pub struct ConsoleRecorder {
    pub lines: RefCell<Vec<String>>,
}

impl Console for ConsoleRecorder {
    fn write_line(&self, args: fmt::Arguments<'_>) {
        self.lines.borrow_mut().push(args.to_string());
    }
}

/// Converter that plays back a script of readings, then repeats the last.
pub struct ScriptedAdc {
    pub readings: VecDeque<u16>,
    pub last: u16,
}

impl ScriptedAdc {
    pub fn new(readings: &[u16]) -> Self {
        Self { readings: readings.iter().copied().collect(), last: 0 }
    }
}

impl AnalogInput for ScriptedAdc {
    fn read_sample(&mut self) -> u16 {
        if let Some(r) = self.readings.pop_front() {
            self.last = r;
        }
        self.last
    }
}

/// Converter FIFO that holds whatever the test pushes into it.
#[derive(Default)]
pub struct FakeFifo {
    pub queued: VecDeque<u16>,
}

impl SampleFifo for FakeFifo {
    type Sample = u16;

    fn pending_count(&mut self) -> usize {
        self.queued.len()
    }

    fn pop_sample(&mut self) -> u16 {
        self.queued.pop_front().expect("pop without pending sample")
    }

    fn clear_pending(&mut self) {}
}
