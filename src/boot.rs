//! Boot image loading and the physical memory layout.
//!
//! A boot image is a raw byte stream of instructions and data with no
//! header. It is copied to physical offset `0x200` and execution begins
//! there with all registers zero.
//!
//! # Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 - 0x0000_0200  Reserved (initial stack space, scratch)
//! 0x0000_0200 - ...          Boot image (code + data), entry point
//! 0x000F_0000 - 0x000F_0014  Device enumeration port + record window
//! 0x000F_1000 - ...          Device register windows (host-assigned)
//! 0x000F_2000 - 0x000F_2040  Interrupt vector table (16 x 4 bytes)
//! 0x0010_0000 - 0x001E_1000  Monitor framebuffer (640x360x4)
//! ...         - mem_size     Free RAM
//! ```
//!
//! Only the boot base, the enumeration port, and the vector table are
//! architectural. The device windows are host wiring choices that
//! firmware is expected to discover through the enumeration port.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::memory::Memory;

/// Physical layout constants.
pub mod layout {
    /// Where the boot image lands and where execution begins.
    pub const BOOT_BASE: u32 = 0x200;

    /// Base of the interrupt vector table: 16 little-endian handler
    /// addresses, one per interrupt line.
    pub const IVT_BASE: u32 = 0xF2000;

    /// Number of interrupt lines. Lines 0-14 are hardware; line 15 is
    /// the syscall vector.
    pub const IVT_ENTRIES: u32 = 16;

    /// First address past the vector table. Physical memory must reach
    /// at least this far for the table to be addressable.
    pub const IVT_END: u32 = IVT_BASE + IVT_ENTRIES * 4;

    /// Device enumeration command/status port.
    pub const ENUM_PORT: u32 = 0xF0000;

    /// Device record window used by the enumeration protocol.
    pub const ENUM_RECORD: u32 = 0xF0001;

    /// Interrupt controller register window.
    pub const INTCTL_BASE: u32 = 0xF1000;

    /// Keyboard register window.
    pub const KEYBOARD_BASE: u32 = 0xF1100;

    /// Disk controller register window.
    pub const DISK_REG_BASE: u32 = 0xF1200;

    /// Disk controller sector buffer (512 bytes).
    pub const DISK_BUF_BASE: u32 = 0xF1400;

    /// Monitor framebuffer base.
    pub const FRAMEBUFFER_BASE: u32 = 0x10_0000;

    /// Address of the vector table entry for an interrupt line.
    pub fn ivt_entry(line: u8) -> u32 {
        IVT_BASE + u32::from(line) * 4
    }
}

/// Errors that can occur while loading a boot image.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("failed to read boot image: {0}")]
    ReadImage(#[source] std::io::Error),

    #[error("boot image too large: {len} bytes (max {max})")]
    ImageTooLarge { len: usize, max: usize },
}

/// Load a boot image file into memory at the boot base.
///
/// Returns the image size in bytes.
pub fn load_image(memory: &Memory, path: &Path) -> Result<usize, BootError> {
    let image = fs::read(path).map_err(BootError::ReadImage)?;

    let max = memory.len().saturating_sub(layout::BOOT_BASE as usize);
    memory.load_boot(&image).map_err(|_| BootError::ImageTooLarge {
        len: image.len(),
        max,
    })?;

    log::info!(
        "loaded boot image: {} ({} bytes at {:#x})",
        path.display(),
        image.len(),
        layout::BOOT_BASE
    );
    Ok(image.len())
}
