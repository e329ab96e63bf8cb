//! CPU core: registers, flags, and interrupt entry.
//!
//! The CPU is a 32-bit little-endian RISC machine with sixteen
//! general-purpose registers and a variable-length instruction encoding.
//! It executes one instruction per `step` call against a shared
//! [`Memory`] and never blocks; faults surface as [`Fault`] values and
//! the host decides whether to halt the machine.
//!
//! # Register Set
//!
//! | Register | Role |
//! |----------|------|
//! | r0       | Hard-wired zero (forced to 0 after every instruction) |
//! | r1-r12   | General purpose |
//! | r13      | MUL result low word / DIV remainder |
//! | r14      | MUL result high word / DIV quotient |
//! | r15      | Stack pointer (grows toward lower addresses) |
//!
//! # Interrupt Model
//!
//! Sixteen interrupt lines vector through a table of handler addresses
//! at `0xF2000`. Lines 0-14 are raised by devices; line 15 is the
//! syscall vector raised by the SYSCALL instruction. Delivery is gated
//! by the `INTERRUPT` flag: while it is clear, raised lines are dropped
//! silently. Entry pushes a 16-byte frame and IRET unwinds it:
//!
//! ```text
//! sp - 16  return ip     <- r15 after entry, IRET reads ip here
//! sp - 12  saved r15
//! sp -  8  saved flags (zero-extended)
//! sp -  4  reserved (0)
//! ```

mod exec;

#[cfg(test)]
pub mod asm;

use bitflags::bitflags;
use thiserror::Error;

use crate::boot::layout;
use crate::memory::{Memory, OutOfBounds};

/// Hard-wired zero register.
pub const REG_ZERO: usize = 0;

/// MUL result low word; DIV remainder.
pub const REG_RESULT_LO: usize = 13;

/// MUL result high word; DIV quotient.
pub const REG_RESULT_HI: usize = 14;

/// Stack pointer.
pub const REG_SP: usize = 15;

/// Interrupt line raised by the SYSCALL instruction.
pub const SYSCALL_LINE: u8 = 15;

bitflags! {
    /// Packed CPU status flags.
    ///
    /// IRET restores the whole low byte of the saved word, so the
    /// reserved bits 4-7 round-trip through interrupt frames intact.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u8 {
        /// Set while executing firmware in user mode; cleared on
        /// interrupt entry.
        const USER_MODE = 1 << 0;
        /// Interrupts are delivered only while this is set.
        const INTERRUPT = 1 << 1;
        /// Result of the last compare instruction.
        const COMPARE = 1 << 2;
        /// Reserved for address translation; the core never consults it.
        const PAGING = 1 << 3;
    }
}

/// Faults that stop instruction execution.
///
/// A fault aborts the instruction with no observable register, flag,
/// ip, or memory change.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Unrecognized primary or sub-opcode, or an instruction fetch
    /// (opcode byte, mode byte, or immediate) that ran out of bounds.
    #[error("invalid opcode at {ip:#010x}")]
    InvalidOpcode { ip: u32 },

    /// A data-side memory access was out of bounds.
    #[error("protection fault: {0}")]
    Protection(#[from] OutOfBounds),

    /// DIV with a zero divisor.
    #[error("division by zero at {ip:#010x}")]
    DivideByZero { ip: u32 },
}

/// CPU state.
pub struct Cpu {
    /// General-purpose registers r0-r15.
    pub regs: [u32; 16],
    /// Instruction pointer.
    pub ip: u32,
    /// Status flags.
    pub flags: Flags,
}

impl Cpu {
    /// Create a CPU in reset state: all registers zero, all flags
    /// clear, ip at the boot entry point.
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            ip: layout::BOOT_BASE,
            flags: Flags::empty(),
        }
    }

    /// Deliver interrupt `line`.
    ///
    /// Returns `Ok(false)` when the `INTERRUPT` flag is clear and the
    /// interrupt was dropped. Otherwise pushes the interrupt frame,
    /// clears `USER_MODE` and `INTERRUPT`, and jumps through the vector
    /// table; the return value `Ok(true)` means the handler is now the
    /// current instruction stream.
    ///
    /// Faults (vector table or frame out of bounds) leave the CPU
    /// unchanged.
    pub fn interrupt(&mut self, memory: &Memory, line: u8) -> Result<bool, Fault> {
        if !self.flags.contains(Flags::INTERRUPT) {
            return Ok(false);
        }

        let handler = memory.read_u32(layout::ivt_entry(line))?;

        let sp = self.regs[REG_SP];
        let frame_base = sp.wrapping_sub(16);
        let mut frame = [0u8; 16];
        frame[0..4].copy_from_slice(&self.ip.to_le_bytes());
        frame[4..8].copy_from_slice(&sp.to_le_bytes());
        frame[8..12].copy_from_slice(&u32::from(self.flags.bits()).to_le_bytes());
        memory.write_from(frame_base, &frame)?;

        self.regs[REG_SP] = frame_base;
        self.flags.remove(Flags::USER_MODE | Flags::INTERRUPT);
        self.ip = handler;
        Ok(true)
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}
