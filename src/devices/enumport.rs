//! Device enumeration port.
//!
//! Firmware discovers the machine's devices through a single
//! memory-mapped port at `0xF0000`:
//!
//! ```text
//! Firmware                            Host
//!   │ write id        -> 0xF0001       │
//!   │ write cmd 0x01  -> 0xF0000 ──────►
//!   │                                  │ status 0x02 (busy)
//!   │                                  │ look up record by id
//!   │                                  │ copy record -> 0xF0001..0xF0014
//!   │                                  │ status 0x01 (present) or 0x00
//!   │◄───────────────────────── (poll) │
//! ```
//!
//! Iterating ids 0..=255 enumerates every device. The port is served by
//! the device host thread from the records registered at attach time;
//! it is not itself an enumerable device.

use std::thread;

use crate::boot::layout;
use crate::memory::OutOfBounds;

use super::{DeviceCtx, DeviceRecord, POLL_INTERVAL};

/// Query a device record by id.
pub const CMD_QUERY: u8 = 0x01;

/// No device with the requested id.
pub const STATUS_ABSENT: u8 = 0x00;

/// Record copied into the record window.
pub const STATUS_PRESENT: u8 = 0x01;

/// Query in progress.
pub const STATUS_BUSY: u8 = 0x02;

/// The enumeration port server.
pub struct EnumPort {
    records: Vec<DeviceRecord>,
}

impl EnumPort {
    pub fn new(records: Vec<DeviceRecord>) -> Self {
        Self { records }
    }

    /// Thread body: serve queries until shutdown.
    ///
    /// Always sleeps between passes: a completed "present" status reads
    /// back as the query command (both are 0x01), so pacing every pass
    /// keeps the re-service churn bounded.
    pub fn run(mut self, ctx: DeviceCtx) {
        while !ctx.should_exit() {
            match self.service(&ctx) {
                Ok(_) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    log::error!("enumeration port unreachable, stopping: {e}");
                    break;
                }
            }
        }
    }

    /// Handle at most one pending query.
    pub fn service(&mut self, ctx: &DeviceCtx) -> Result<bool, OutOfBounds> {
        if ctx.memory.read_u8(layout::ENUM_PORT)? != CMD_QUERY {
            return Ok(false);
        }

        ctx.memory.write_u8(layout::ENUM_PORT, STATUS_BUSY)?;
        let id = ctx.memory.read_u8(layout::ENUM_RECORD)?;

        match self.records.iter().find(|r| r.id == id) {
            Some(record) => {
                ctx.memory.write_from(layout::ENUM_RECORD, &record.to_bytes())?;
                ctx.memory.write_u8(layout::ENUM_PORT, STATUS_PRESENT)?;
                log::debug!("enumeration: id {id:#04x} present (class {:#04x})", record.class);
            }
            None => {
                ctx.memory.write_u8(layout::ENUM_PORT, STATUS_ABSENT)?;
                log::debug!("enumeration: id {id:#04x} absent");
            }
        }
        Ok(true)
    }
}
