//! Disk controller.
//!
//! The controller fronts up to eight raw disk images, addressed in
//! 512-byte sectors. Its register window is six bytes at `base_0` and
//! its sector buffer is 512 bytes at `base_1`:
//!
//! ```text
//! +0  command   0x01 read sector, 0x04 select disk, 0x08 sector count;
//!               cleared to 0 by the controller when the operation
//!               completes (firmware polls for 0)
//! +1  argument  u32, little-endian: sector number for reads, disk
//!               index for select; receives the sector count result
//! +5  present   bitmap of attached disks, maintained by the controller
//! ```
//!
//! A completed sector read leaves the data in the sector buffer and
//! raises the controller's interrupt line.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::memory::OutOfBounds;

use super::{class, poll_loop, Device, DeviceCtx, DeviceRecord};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the register window.
pub const WINDOW: u32 = 6;

/// Maximum number of attached disks (one bit each in the present map).
pub const MAX_DISKS: usize = 8;

/// Register offsets within the window.
mod regs {
    pub const COMMAND: u32 = 0;
    pub const ARG: u32 = 1;
    pub const PRESENT: u32 = 5;
}

/// Command codes.
mod cmd {
    pub const READ_SECTOR: u8 = 0x01;
    pub const SELECT_DISK: u8 = 0x04;
    pub const SECTOR_COUNT: u8 = 0x08;
}

/// A raw disk image addressed in 512-byte sectors.
pub struct DiskImage {
    file: File,
    sectors: u32,
}

impl DiskImage {
    /// Open a raw image file. A trailing partial sector is ignored.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let sectors = (file.metadata()?.len() / SECTOR_SIZE as u64).min(u64::from(u32::MAX)) as u32;
        log::info!("disk image {}: {} sectors", path.display(), sectors);
        Ok(Self { file, sectors })
    }

    /// Number of addressable sectors.
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    fn read_sector(&mut self, sector: u32, out: &mut [u8; SECTOR_SIZE]) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))?;
        self.file.read_exact(out)
    }
}

/// The disk controller device.
pub struct DiskController {
    id: u8,
    line: u8,
    reg_base: u32,
    buf_base: u32,
    disks: Vec<DiskImage>,
    selected: usize,
}

impl DiskController {
    pub fn new(id: u8, line: u8, reg_base: u32, buf_base: u32) -> Self {
        Self {
            id,
            line,
            reg_base,
            buf_base,
            disks: Vec::new(),
            selected: 0,
        }
    }

    /// Attach a disk image. Images beyond [`MAX_DISKS`] are refused.
    pub fn attach(&mut self, disk: DiskImage) {
        if self.disks.len() >= MAX_DISKS {
            log::warn!("disk controller full, image dropped");
            return;
        }
        self.disks.push(disk);
    }

    fn present_bitmap(&self) -> u8 {
        ((1u16 << self.disks.len()) - 1) as u8
    }

    /// Execute at most one pending command.
    pub fn service(&mut self, ctx: &DeviceCtx) -> Result<bool, OutOfBounds> {
        ctx.memory
            .write_u8(self.reg_base + regs::PRESENT, self.present_bitmap())?;

        let command = ctx.memory.read_u8(self.reg_base + regs::COMMAND)?;
        if command == 0 {
            return Ok(false);
        }
        let arg = ctx.memory.read_u32(self.reg_base + regs::ARG)?;

        match command {
            cmd::READ_SECTOR => self.read_into_buffer(ctx, arg)?,
            cmd::SELECT_DISK => {
                if (arg as usize) < self.disks.len() {
                    self.selected = arg as usize;
                } else {
                    log::warn!("select of absent disk {arg}");
                }
            }
            cmd::SECTOR_COUNT => {
                let count = self.disks.get(self.selected).map_or(0, DiskImage::sectors);
                ctx.memory.write_u32(self.reg_base + regs::ARG, count)?;
            }
            _ => log::warn!("unknown disk command {command:#04x}"),
        }

        // Completion: firmware polls the command byte for 0.
        ctx.memory.write_u8(self.reg_base + regs::COMMAND, 0)?;
        Ok(true)
    }

    fn read_into_buffer(&mut self, ctx: &DeviceCtx, sector: u32) -> Result<(), OutOfBounds> {
        let mut buf = [0u8; SECTOR_SIZE];
        match self.disks.get_mut(self.selected) {
            Some(disk) if sector < disk.sectors() => {
                if let Err(e) = disk.read_sector(sector, &mut buf) {
                    log::error!("disk read failed at sector {sector}: {e}");
                    buf = [0u8; SECTOR_SIZE];
                }
            }
            Some(disk) => {
                log::warn!("read past end of disk: sector {sector} of {}", disk.sectors());
            }
            None => log::warn!("read with no disk attached"),
        }
        ctx.memory.write_from(self.buf_base, &buf)?;
        ctx.irq.raise(self.line);
        Ok(())
    }
}

impl Device for DiskController {
    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            class: class::DISK,
            interrupt_line: self.line,
            base_0: self.reg_base,
            limit_0: WINDOW,
            base_1: self.buf_base,
            limit_1: SECTOR_SIZE as u32,
        }
    }

    fn run(mut self: Box<Self>, ctx: DeviceCtx) {
        poll_loop(&ctx, |ctx| self.service(ctx));
    }
}
