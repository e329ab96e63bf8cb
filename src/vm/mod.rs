//! Machine assembly: memory, CPU, and the device host.
//!
//! The [`Vm`] owns the shared physical memory, the CPU, and every
//! device thread. One thread (the caller of [`Vm::run`]) steps the CPU
//! in a tight loop; each attached device runs on its own thread and
//! reaches back only through shared memory and an [`IrqLine`] handle.
//!
//! # Interrupt delivery
//!
//! There is no interrupt queue. [`IrqLine::raise`] stores the line into
//! a single pending slot, latest raise wins, and the run loop drains
//! the slot between instructions. Concurrent raises race: at most one
//! becomes a handler entry and the others are lost. A line raised while
//! the CPU has interrupts masked is dropped at observation time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::boot::layout;
use crate::cpu::{Cpu, Fault};
use crate::devices::enumport::EnumPort;
use crate::devices::intctl::IrqGate;
use crate::devices::{Device, DeviceCtx, DeviceRecord};
use crate::memory::Memory;

/// Errors from machine assembly and execution.
#[derive(Error, Debug)]
pub enum VmError {
    /// The interrupt vector table would not be addressable.
    #[error("physical memory too small: {size} bytes (minimum {min})")]
    MemoryTooSmall { size: usize, min: usize },

    /// A device thread could not be spawned.
    #[error("failed to start device thread: {0}")]
    SpawnDevice(#[source] std::io::Error),

    /// The CPU halted on a fault.
    #[error("CPU halted: {0}")]
    Cpu(#[from] Fault),
}

/// Handle devices use to raise their interrupt line.
///
/// Cloneable and cheap; devices hold this instead of any reference to
/// the CPU, which stays owned by the VM.
#[derive(Clone)]
pub struct IrqLine {
    /// Pending line, stored as `line + 1` (0 means none).
    pending: Arc<AtomicU32>,
    /// Hardware gate mirrored from the interrupt controller.
    gate: Arc<IrqGate>,
}

impl IrqLine {
    pub(crate) fn new(gate: Arc<IrqGate>) -> Self {
        Self {
            pending: Arc::new(AtomicU32::new(0)),
            gate,
        }
    }

    /// Raise an interrupt line (0-15). Latest raise wins.
    pub fn raise(&self, line: u8) {
        let line = line & 0xF;
        if !self.gate.allows(line) {
            return;
        }
        self.pending.store(u32::from(line) + 1, Ordering::Release);
    }

    /// Drain the pending slot.
    pub(crate) fn take(&self) -> Option<u8> {
        match self.pending.swap(0, Ordering::Acquire) {
            0 => None,
            raised => Some((raised - 1) as u8),
        }
    }
}

/// The assembled machine.
pub struct Vm {
    memory: Arc<Memory>,
    cpu: Cpu,
    irq: IrqLine,
    gate: Arc<IrqGate>,
    devices: Vec<(DeviceRecord, Box<dyn Device>)>,
    records: Vec<DeviceRecord>,
    threads: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    started: bool,
}

impl Vm {
    /// Create a machine with `mem_size` bytes of physical memory.
    pub fn new(mem_size: usize) -> Result<Self, VmError> {
        let min = layout::IVT_END as usize;
        if mem_size < min {
            return Err(VmError::MemoryTooSmall {
                size: mem_size,
                min,
            });
        }

        let gate = Arc::new(IrqGate::new());
        Ok(Self {
            memory: Arc::new(Memory::new(mem_size)),
            cpu: Cpu::new(),
            irq: IrqLine::new(Arc::clone(&gate)),
            gate,
            devices: Vec::new(),
            records: Vec::new(),
            threads: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            started: false,
        })
    }

    /// The shared physical memory.
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// The hardware interrupt gate, for wiring an interrupt controller.
    pub fn gate(&self) -> Arc<IrqGate> {
        Arc::clone(&self.gate)
    }

    /// A handle for raising interrupt lines from outside the machine.
    #[allow(dead_code)]
    pub fn irq(&self) -> IrqLine {
        self.irq.clone()
    }

    /// Register a device. Its record becomes visible through the
    /// enumeration port once the machine starts.
    pub fn attach(&mut self, device: Box<dyn Device>) {
        let record = device.record();
        self.records.push(record);
        self.devices.push((record, device));
    }

    /// Spawn the enumeration port and every attached device thread.
    pub fn start(&mut self) -> Result<(), VmError> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let enum_port = EnumPort::new(self.records.clone());
        let ctx = self.device_ctx();
        let handle = thread::Builder::new()
            .name("enum-port".into())
            .spawn(move || enum_port.run(ctx))
            .map_err(VmError::SpawnDevice)?;
        self.threads.push(handle);

        let memory = Arc::clone(&self.memory);
        let irq = self.irq.clone();
        let shutdown = Arc::clone(&self.shutdown);
        for (record, device) in self.devices.drain(..) {
            let ctx = DeviceCtx {
                memory: Arc::clone(&memory),
                irq: irq.clone(),
                shutdown: Arc::clone(&shutdown),
            };
            let handle = thread::Builder::new()
                .name(format!("device-{:02x}", record.id))
                .spawn(move || device.run(ctx))
                .map_err(VmError::SpawnDevice)?;
            self.threads.push(handle);
        }

        log::info!(
            "machine started: {} bytes of memory, {} devices",
            self.memory.len(),
            self.records.len()
        );
        Ok(())
    }

    fn device_ctx(&self) -> DeviceCtx {
        DeviceCtx {
            memory: Arc::clone(&self.memory),
            irq: self.irq.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Step the CPU until it faults, draining the pending interrupt
    /// slot between instructions.
    ///
    /// The machine has no halt instruction, so this only returns when
    /// the CPU faults; the fault comes back as the error and the host
    /// decides what to do with the machine.
    pub fn run(&mut self) -> Result<(), VmError> {
        loop {
            if let Some(line) = self.irq.take() {
                if self.cpu.interrupt(&self.memory, line)? {
                    log::trace!("interrupt line {line} entered");
                }
            }
            self.cpu.step(&self.memory)?;
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
