//! Keyboard device.
//!
//! Register window, four bytes at `base_0`:
//!
//! ```text
//! +0  ack        firmware writes 1 after consuming a scan code;
//!                the device clears it back to 0
//! +2  scan code  latest 16-bit scan code, little-endian
//! ```
//!
//! The host front end injects scan codes through a [`KeyboardHandle`].
//! The device latches one code at a time: it writes the code, raises
//! its interrupt line, and holds further codes until firmware
//! acknowledges through the ack register.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::memory::OutOfBounds;

use super::{class, poll_loop, Device, DeviceCtx, DeviceRecord};

/// Size of the register window.
pub const WINDOW: u32 = 4;

/// Offset of the ack register.
const REG_ACK: u32 = 0;

/// Offset of the latched scan code.
const REG_SCAN_CODE: u32 = 2;

/// Host-side handle for injecting key events.
#[derive(Clone)]
pub struct KeyboardHandle {
    events: Sender<u16>,
}

impl KeyboardHandle {
    /// Queue a scan code. Returns false if the device is gone.
    #[allow(dead_code)]
    pub fn inject(&self, scan_code: u16) -> bool {
        self.events.send(scan_code).is_ok()
    }
}

/// The keyboard device.
pub struct Keyboard {
    id: u8,
    line: u8,
    base: u32,
    events: Receiver<u16>,
    /// Scan code latched in the window, not yet acknowledged.
    pending: Option<u16>,
}

impl Keyboard {
    pub fn new(id: u8, line: u8, base: u32) -> (Self, KeyboardHandle) {
        let (tx, rx) = channel();
        let keyboard = Self {
            id,
            line,
            base,
            events: rx,
            pending: None,
        };
        (keyboard, KeyboardHandle { events: tx })
    }

    /// Latch the next scan code or complete a pending acknowledge.
    pub fn service(&mut self, ctx: &DeviceCtx) -> Result<bool, OutOfBounds> {
        if let Some(code) = self.pending {
            if ctx.memory.read_u8(self.base + REG_ACK)? != 0 {
                ctx.memory.write_u8(self.base + REG_ACK, 0)?;
                self.pending = None;
                log::trace!("keyboard: scan code {code:#06x} acknowledged");
                return Ok(true);
            }
            return Ok(false);
        }

        match self.events.try_recv() {
            Ok(code) => {
                ctx.memory.write_u16(self.base + REG_SCAN_CODE, code)?;
                self.pending = Some(code);
                ctx.irq.raise(self.line);
                log::trace!("keyboard: latched scan code {code:#06x}");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

impl Device for Keyboard {
    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            class: class::KEYBOARD,
            interrupt_line: self.line,
            base_0: self.base,
            limit_0: WINDOW,
            base_1: 0,
            limit_1: 0,
        }
    }

    fn run(mut self: Box<Self>, ctx: DeviceCtx) {
        poll_loop(&ctx, |ctx| self.service(ctx));
    }
}
