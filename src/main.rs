//! Argon - a software virtual machine for a 32-bit little-endian RISC ISA.
//!
//! The machine is a flat physical memory, a 16-register CPU stepped one
//! instruction at a time, and memory-mapped devices on their own
//! threads. A raw boot image is loaded at `0x200` and executed until
//! the CPU faults.

mod boot;
mod cpu;
mod devices;
mod memory;
mod vm;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use boot::layout;
use devices::disk::{DiskController, DiskImage};
use devices::intctl::InterruptController;
use devices::keyboard::Keyboard;
use devices::monitor::{DiscardSink, Monitor};
use vm::Vm;

#[derive(Parser, Debug)]
#[command(name = "argon")]
#[command(about = "A software virtual machine for a 32-bit little-endian RISC ISA")]
struct Args {
    /// Path to the boot image
    #[arg(short, long)]
    boot: PathBuf,

    /// Physical memory size in megabytes
    #[arg(short, long, default_value = "128")]
    memory: usize,

    /// Path to a raw disk image (repeatable)
    #[arg(short, long)]
    disk: Vec<PathBuf>,
}

/// Host-assigned device ids.
mod ids {
    pub const INTCTL: u8 = 0;
    pub const KEYBOARD: u8 = 1;
    pub const DISK: u8 = 2;
    pub const MONITOR: u8 = 3;
}

/// Host-assigned interrupt lines.
mod lines {
    pub const KEYBOARD: u8 = 1;
    pub const DISK: u8 = 2;
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut vm = Vm::new(args.memory * 1024 * 1024)?;
    boot::load_image(vm.memory(), &args.boot)?;

    vm.attach(Box::new(InterruptController::new(
        ids::INTCTL,
        layout::INTCTL_BASE,
        vm.gate(),
    )));

    let (keyboard, keyboard_input) =
        Keyboard::new(ids::KEYBOARD, lines::KEYBOARD, layout::KEYBOARD_BASE);
    vm.attach(Box::new(keyboard));

    let mut disk = DiskController::new(
        ids::DISK,
        lines::DISK,
        layout::DISK_REG_BASE,
        layout::DISK_BUF_BASE,
    );
    for path in &args.disk {
        disk.attach(DiskImage::open(path)?);
    }
    vm.attach(Box::new(disk));

    vm.attach(Box::new(Monitor::new(
        ids::MONITOR,
        layout::FRAMEBUFFER_BASE,
        Box::new(DiscardSink),
    )));

    vm.start()?;

    // Key-event wiring belongs to a display front end; keep the channel
    // open so the keyboard device stays serviceable.
    let _keyboard_input = keyboard_input;

    vm.run()?;
    Ok(())
}
