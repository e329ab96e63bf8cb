//! Memory-mapped devices and the device host.
//!
//! Every device owns a 19-byte record describing itself to firmware and
//! runs on its own thread for the lifetime of the machine. Devices
//! interact with the rest of the system through exactly two channels:
//!
//! - their mapped windows in shared [`Memory`], which they poll and
//!   write directly, concurrently with firmware;
//! - raising their interrupt line through an [`IrqLine`] handle, never
//!   through an owning reference to the CPU.
//!
//! Firmware discovers devices by querying the enumeration port (see
//! [`enumport`]) and reading back records:
//!
//! ```text
//! offset  field           width
//! 0       id              1
//! 1       class           1
//! 2       interrupt_line  1
//! 3       base_0          4
//! 7       limit_0         4
//! 11      base_1          4
//! 15      limit_1         4
//! ```

pub mod disk;
pub mod enumport;
pub mod intctl;
pub mod keyboard;
pub mod monitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::memory::{Memory, OutOfBounds};
use crate::vm::IrqLine;

/// Device class codes reported in records. The full table is part of
/// the enumeration contract even where this host has no device of the
/// class to offer.
#[allow(dead_code)]
pub mod class {
    pub const MEMORY: u8 = 0x1;
    pub const DISK: u8 = 0x2;
    pub const INTERRUPT_CONTROLLER: u8 = 0x3;
    pub const TIMER: u8 = 0x4;
    pub const POWER: u8 = 0x5;
    pub const MOUSE: u8 = 0x10;
    pub const KEYBOARD: u8 = 0x11;
    pub const MONITOR: u8 = 0x20;
}

/// How often idle device loops re-poll their windows.
pub const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// The descriptor firmware reads through the enumeration port.
///
/// `base_0`/`limit_0` and `base_1`/`limit_1` describe up to two mapped
/// windows; devices with a single window leave the other pair zero. A
/// device that never interrupts carries line 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: u8,
    pub class: u8,
    pub interrupt_line: u8,
    pub base_0: u32,
    pub limit_0: u32,
    pub base_1: u32,
    pub limit_1: u32,
}

impl DeviceRecord {
    /// Serialized size: packed, no padding.
    pub const SIZE: usize = 19;

    /// Serialize to the packed little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.id;
        bytes[1] = self.class;
        bytes[2] = self.interrupt_line;
        bytes[3..7].copy_from_slice(&self.base_0.to_le_bytes());
        bytes[7..11].copy_from_slice(&self.limit_0.to_le_bytes());
        bytes[11..15].copy_from_slice(&self.base_1.to_le_bytes());
        bytes[15..19].copy_from_slice(&self.limit_1.to_le_bytes());
        bytes
    }

    /// Deserialize from the packed wire layout (the firmware-side view;
    /// hosts mostly serialize).
    #[allow(dead_code)]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self {
            id: bytes[0],
            class: bytes[1],
            interrupt_line: bytes[2],
            base_0: word(3),
            limit_0: word(7),
            base_1: word(11),
            limit_1: word(15),
        }
    }
}

/// Everything a device thread needs from the machine.
pub struct DeviceCtx {
    /// The shared physical memory.
    pub memory: Arc<Memory>,
    /// Handle for raising the device's interrupt line.
    pub irq: IrqLine,
    /// Set by the VM when device threads should exit.
    pub shutdown: Arc<AtomicBool>,
}

impl DeviceCtx {
    /// Whether the VM asked device threads to exit.
    pub fn should_exit(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

/// A memory-mapped device the VM can host.
pub trait Device: Send {
    /// The record firmware sees through the enumeration port.
    fn record(&self) -> DeviceRecord;

    /// Thread body. Runs until `ctx.should_exit()`.
    fn run(self: Box<Self>, ctx: DeviceCtx);
}

/// Drive a polling service function until shutdown.
///
/// The service returns `Ok(true)` when it made progress (poll again
/// immediately) and `Ok(false)` when idle. An out-of-bounds window
/// means the host wired the device outside physical memory; the device
/// logs it once and stops.
pub fn poll_loop<F>(ctx: &DeviceCtx, mut service: F)
where
    F: FnMut(&DeviceCtx) -> Result<bool, OutOfBounds>,
{
    while !ctx.should_exit() {
        match service(ctx) {
            Ok(true) => {}
            Ok(false) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                log::error!("device window unreachable, stopping: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn test_ctx(mem_size: usize) -> DeviceCtx {
    use crate::devices::intctl::IrqGate;

    DeviceCtx {
        memory: Arc::new(Memory::new(mem_size)),
        irq: IrqLine::new(Arc::new(IrqGate::new())),
        shutdown: Arc::new(AtomicBool::new(false)),
    }
}
