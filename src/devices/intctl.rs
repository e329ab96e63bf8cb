//! Interrupt controller.
//!
//! The controller gates hardware interrupt delivery. Its register
//! window is three bytes at `base_0`:
//!
//! ```text
//! +0  enable   non-zero enables hardware interrupt delivery
//! +1  mask     16-bit line mask, little-endian; a set bit masks
//! +2           that line, 0 unmasks all
//! ```
//!
//! The device thread mirrors the window into an [`IrqGate`] that
//! [`IrqLine::raise`](crate::vm::IrqLine::raise) consults on every
//! hardware raise. The window starts zeroed, so attaching a controller
//! leaves hardware lines disabled until firmware writes the enable
//! byte. The syscall line is raised by the CPU itself and bypasses the
//! gate.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use crate::memory::OutOfBounds;

use super::{class, poll_loop, Device, DeviceCtx, DeviceRecord};

/// Size of the register window.
pub const WINDOW: u32 = 3;

/// Shared gate state consulted on every hardware interrupt raise.
///
/// A machine without an interrupt controller keeps the gate in its
/// initial open state and delivers every line.
pub struct IrqGate {
    enabled: AtomicBool,
    mask: AtomicU16,
}

impl IrqGate {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            mask: AtomicU16::new(0),
        }
    }

    /// Whether `line` may currently be delivered.
    pub fn allows(&self, line: u8) -> bool {
        self.enabled.load(Ordering::Acquire) && self.mask.load(Ordering::Acquire) & (1 << line) == 0
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn set_mask(&self, mask: u16) {
        self.mask.store(mask, Ordering::Release);
    }
}

impl Default for IrqGate {
    fn default() -> Self {
        Self::new()
    }
}

/// The interrupt controller device.
pub struct InterruptController {
    id: u8,
    base: u32,
    gate: Arc<IrqGate>,
}

impl InterruptController {
    pub fn new(id: u8, base: u32, gate: Arc<IrqGate>) -> Self {
        Self { id, base, gate }
    }

    /// Mirror the register window into the gate.
    pub fn service(&mut self, ctx: &DeviceCtx) -> Result<bool, OutOfBounds> {
        let enable = ctx.memory.read_u8(self.base)?;
        let mask = ctx.memory.read_u16(self.base + 1)?;
        self.gate.set_enabled(enable != 0);
        self.gate.set_mask(mask);
        Ok(false)
    }
}

impl Device for InterruptController {
    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            class: class::INTERRUPT_CONTROLLER,
            interrupt_line: 0,
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
