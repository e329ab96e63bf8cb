//! Monitor device.
//!
//! The monitor exposes a raw framebuffer as its second mapped window:
//! 640x360 pixels, 4 bytes per pixel (`0x00RRGGBB`), little-endian
//! words. Firmware draws by storing into the window; the device thread
//! snapshots the framebuffer at roughly 60 Hz and hands each frame to a
//! host [`FrameSink`]. Presenting the frame on an actual display is the
//! host front end's business, not the core's.

use std::thread;
use std::time::Duration;

use crate::memory::OutOfBounds;

use super::{class, Device, DeviceCtx, DeviceRecord};

/// Framebuffer width in pixels.
pub const WIDTH: u32 = 640;

/// Framebuffer height in pixels.
pub const HEIGHT: u32 = 360;

/// Bytes per pixel (0x00RRGGBB words).
pub const BYTES_PER_PIXEL: u32 = 4;

/// Total framebuffer size in bytes.
pub const FRAMEBUFFER_LEN: u32 = WIDTH * HEIGHT * BYTES_PER_PIXEL;

/// Snapshot cadence (~60 Hz).
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Receives framebuffer snapshots from the monitor thread.
pub trait FrameSink: Send {
    /// Called with one complete frame of `FRAMEBUFFER_LEN` bytes.
    fn present(&mut self, frame: &[u8]);
}

/// Sink for headless hosts: frames are dropped.
pub struct DiscardSink;

impl FrameSink for DiscardSink {
    fn present(&mut self, _frame: &[u8]) {}
}

/// The monitor device.
pub struct Monitor {
    id: u8,
    base: u32,
    sink: Box<dyn FrameSink>,
    frame: Vec<u8>,
}

impl Monitor {
    pub fn new(id: u8, base: u32, sink: Box<dyn FrameSink>) -> Self {
        Self {
            id,
            base,
            sink,
            frame: vec![0; FRAMEBUFFER_LEN as usize],
        }
    }

    /// Snapshot the framebuffer and present it.
    pub fn refresh(&mut self, ctx: &DeviceCtx) -> Result<(), OutOfBounds> {
        ctx.memory.read_into(self.base, &mut self.frame)?;
        self.sink.present(&self.frame);
        Ok(())
    }
}

impl Device for Monitor {
    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            id: self.id,
            class: class::MONITOR,
            interrupt_line: 0,
            base_0: 0,
            limit_0: 0,
            base_1: self.base,
            limit_1: FRAMEBUFFER_LEN,
        }
    }

    fn run(mut self: Box<Self>, ctx: DeviceCtx) {
        while !ctx.should_exit() {
            if let Err(e) = self.refresh(&ctx) {
                log::error!("monitor framebuffer unreachable, stopping: {e}");
                break;
            }
            thread::sleep(FRAME_INTERVAL);
        }
    }
}
