//! Instruction decode and execution.
//!
//! Instructions are variable length. The first byte is the primary
//! opcode; depending on the form, a mode byte and one or two 32-bit
//! little-endian immediates follow:
//!
//! | Form | Encoding                      | Length |
//! |------|-------------------------------|--------|
//! | RR   | op, (a << 4) \| b             | 2      |
//! | R    | op, (sub << 4) \| a           | 2      |
//! | RI   | op, (sub << 4) \| b, imm      | 6      |
//! | I    | op, imm                       | 5      |
//! | II   | op, imm1, imm2                | 9      |
//! | -    | op                            | 1      |
//!
//! The RI groups (0x10 and 0x30) reuse the low nibble of the matching
//! register-register opcode as their sub-opcode, with the immediate
//! standing in for the `a` operand.
//!
//! Fetches of the opcode byte, mode byte, or immediates that run out of
//! bounds are `InvalidOpcode`; data-side accesses out of bounds are
//! `Protection`. Either way the instruction aborts with no observable
//! state change: memory writes are range-checked before they land and
//! register commits happen after the last fallible access.

use crate::memory::Memory;

use super::{Cpu, Fault, Flags, REG_RESULT_HI, REG_RESULT_LO, REG_SP, REG_ZERO, SYSCALL_LINE};

/// Primary opcodes.
mod opcode {
    pub const NOP: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const SUB: u8 = 0x02;
    pub const MUL: u8 = 0x03;
    pub const DIV: u8 = 0x04;
    pub const AND: u8 = 0x05;
    pub const OR: u8 = 0x06;
    pub const XOR: u8 = 0x07;
    pub const SHL: u8 = 0x08;
    pub const SHR: u8 = 0x09;
    pub const STB: u8 = 0x0A;
    pub const STW: u8 = 0x0B;
    pub const STD: u8 = 0x0C;
    pub const LDB: u8 = 0x0D;
    pub const LDW: u8 = 0x0E;
    pub const LDD: u8 = 0x0F;
    /// RI group: sub-opcode selects among 0x01-0x0F with an immediate.
    pub const ALU_RI: u8 = 0x10;
    /// Register stack/branch group: sub-opcode in the mode byte.
    pub const STACK: u8 = 0x20;
    pub const PUSHI: u8 = 0x21;
    pub const JI: u8 = 0x23;
    pub const JTI: u8 = 0x24;
    pub const JFI: u8 = 0x25;
    pub const CALLI: u8 = 0x29;
    pub const CGTQ: u8 = 0x2A;
    pub const CLT: u8 = 0x2F;
    /// RI group: MOVI plus the compare-immediate family.
    pub const MOV_RI: u8 = 0x30;
    pub const MOV: u8 = 0x31;
    pub const STBII: u8 = 0x32;
    pub const STWII: u8 = 0x33;
    pub const STDII: u8 = 0x34;
    pub const RET: u8 = 0x35;
    pub const SYSCALL: u8 = 0x40;
    pub const IRET: u8 = 0x41;
    pub const CLI: u8 = 0x42;
    pub const STI: u8 = 0x43;
}

/// Sub-opcodes of the 0x20 register stack/branch group.
mod stack_op {
    pub const PUSH: u8 = 0x1;
    pub const POP: u8 = 0x2;
    pub const JUMP: u8 = 0x3;
    pub const JUMP_TRUE: u8 = 0x4;
    pub const JUMP_FALSE: u8 = 0x5;
    pub const CALL: u8 = 0x9;
}

/// Sub-opcode of the 0x30 group selecting MOVI. The remaining
/// sub-opcodes 0xA-0xF are the compare-immediate family.
const MOVI_SUB: u8 = 0x1;

/// Instruction lengths by form.
const LEN_RR: u32 = 2;
const LEN_R: u32 = 2;
const LEN_I: u32 = 5;
const LEN_RI: u32 = 6;
const LEN_II: u32 = 9;

/// Memory access width selected by a store/load opcode triplet.
#[derive(Clone, Copy)]
enum Width {
    Byte,
    Half,
    Word,
}

/// Access width of a store/load opcode, shared by the RR form, the RI
/// sub-opcodes (same low nibbles), and the II form.
fn access_width(op: u8) -> Width {
    match op {
        opcode::STB | opcode::LDB | opcode::STBII => Width::Byte,
        opcode::STW | opcode::LDW | opcode::STWII => Width::Half,
        _ => Width::Word,
    }
}

/// Split an RR mode byte into its two register indices.
fn split_mode(mode: u8) -> (usize, usize) {
    ((mode >> 4) as usize, (mode & 0xF) as usize)
}

/// Evaluate a compare by the low nibble of its opcode. The Q-suffixed
/// names are historical: CGTQ is greater-or-equal, CLTQ less-or-equal.
fn compare(sel: u8, a: u32, b: u32) -> bool {
    match sel & 0xF {
        0xA => a >= b,
        0xB => a <= b,
        0xC => a == b,
        0xD => a != b,
        0xE => a > b,
        _ => a < b,
    }
}

impl Cpu {
    /// Execute exactly one instruction.
    ///
    /// On success `ip` has advanced (or been redirected by a branch) and
    /// r0 is zero. On a fault nothing changed.
    pub fn step(&mut self, memory: &Memory) -> Result<(), Fault> {
        let ip = self.ip;
        let op = self.fetch_u8(memory, ip)?;

        match op {
            opcode::NOP => {
                self.ip = ip.wrapping_add(1);
            }

            opcode::ADD..=opcode::SHR => {
                let (a, b) = split_mode(self.fetch_u8(memory, ip.wrapping_add(1))?);
                self.alu(op, self.regs[a], b, ip)?;
                self.ip = ip.wrapping_add(LEN_RR);
            }

            opcode::STB..=opcode::STD => {
                let (a, b) = split_mode(self.fetch_u8(memory, ip.wrapping_add(1))?);
                let width = access_width(op);
                store(memory, width, self.regs[b], self.regs[a])?;
                self.ip = ip.wrapping_add(LEN_RR);
            }

            opcode::LDB..=opcode::LDD => {
                let (a, b) = split_mode(self.fetch_u8(memory, ip.wrapping_add(1))?);
                let width = access_width(op);
                self.regs[b] = load(memory, width, self.regs[a])?;
                self.ip = ip.wrapping_add(LEN_RR);
            }

            opcode::ALU_RI => {
                let mode = self.fetch_u8(memory, ip.wrapping_add(1))?;
                let sub = mode >> 4;
                let b = (mode & 0xF) as usize;
                let imm = self.fetch_u32(memory, ip.wrapping_add(2))?;
                match sub {
                    opcode::ADD..=opcode::SHR => self.alu(sub, imm, b, ip)?,
                    opcode::STB..=opcode::STD => {
                        let width = access_width(sub);
                        store(memory, width, self.regs[b], imm)?;
                    }
                    opcode::LDB..=opcode::LDD => {
                        let width = access_width(sub);
                        self.regs[b] = load(memory, width, imm)?;
                    }
                    _ => return Err(Fault::InvalidOpcode { ip }),
                }
                self.ip = ip.wrapping_add(LEN_RI);
            }

            opcode::STACK => {
                let mode = self.fetch_u8(memory, ip.wrapping_add(1))?;
                let sub = mode >> 4;
                let a = (mode & 0xF) as usize;
                match sub {
                    stack_op::PUSH => {
                        let sp = self.regs[REG_SP].wrapping_sub(4);
                        let value = if a == REG_SP { sp } else { self.regs[a] };
                        memory.write_u32(sp, value)?;
                        self.regs[REG_SP] = sp;
                        self.ip = ip.wrapping_add(LEN_R);
                    }
                    stack_op::POP => {
                        let sp = self.regs[REG_SP];
                        let value = memory.read_u32(sp)?;
                        self.regs[REG_SP] = sp.wrapping_add(4);
                        self.regs[a] = value;
                        self.ip = ip.wrapping_add(LEN_R);
                    }
                    stack_op::JUMP => {
                        self.ip = self.regs[a];
                    }
                    stack_op::JUMP_TRUE => {
                        self.ip = if self.flags.contains(Flags::COMPARE) {
                            self.regs[a]
                        } else {
                            ip.wrapping_add(LEN_R)
                        };
                    }
                    stack_op::JUMP_FALSE => {
                        self.ip = if self.flags.contains(Flags::COMPARE) {
                            ip.wrapping_add(LEN_R)
                        } else {
                            self.regs[a]
                        };
                    }
                    stack_op::CALL => {
                        let sp = self.regs[REG_SP].wrapping_sub(4);
                        memory.write_u32(sp, ip.wrapping_add(LEN_R))?;
                        self.regs[REG_SP] = sp;
                        self.ip = self.regs[a];
                    }
                    _ => return Err(Fault::InvalidOpcode { ip }),
                }
            }

            opcode::PUSHI => {
                let imm = self.fetch_u32(memory, ip.wrapping_add(1))?;
                let sp = self.regs[REG_SP].wrapping_sub(4);
                memory.write_u32(sp, imm)?;
                self.regs[REG_SP] = sp;
                self.ip = ip.wrapping_add(LEN_I);
            }

            opcode::JI => {
                self.ip = self.fetch_u32(memory, ip.wrapping_add(1))?;
            }

            opcode::JTI => {
                let target = self.fetch_u32(memory, ip.wrapping_add(1))?;
                self.ip = if self.flags.contains(Flags::COMPARE) {
                    target
                } else {
                    ip.wrapping_add(LEN_I)
                };
            }

            opcode::JFI => {
                let target = self.fetch_u32(memory, ip.wrapping_add(1))?;
                self.ip = if self.flags.contains(Flags::COMPARE) {
                    ip.wrapping_add(LEN_I)
                } else {
                    target
                };
            }

            opcode::CALLI => {
                let target = self.fetch_u32(memory, ip.wrapping_add(1))?;
                let sp = self.regs[REG_SP].wrapping_sub(4);
                memory.write_u32(sp, ip.wrapping_add(LEN_I))?;
                self.regs[REG_SP] = sp;
                self.ip = target;
            }

            opcode::CGTQ..=opcode::CLT => {
                let (a, b) = split_mode(self.fetch_u8(memory, ip.wrapping_add(1))?);
                let result = compare(op, self.regs[a], self.regs[b]);
                self.flags.set(Flags::COMPARE, result);
                self.ip = ip.wrapping_add(LEN_RR);
            }

            opcode::MOV_RI => {
                let mode = self.fetch_u8(memory, ip.wrapping_add(1))?;
                let sub = mode >> 4;
                let b = (mode & 0xF) as usize;
                let imm = self.fetch_u32(memory, ip.wrapping_add(2))?;
                match sub {
                    MOVI_SUB => self.regs[b] = imm,
                    0xA..=0xF => {
                        let result = compare(sub, imm, self.regs[b]);
                        self.flags.set(Flags::COMPARE, result);
                    }
                    _ => return Err(Fault::InvalidOpcode { ip }),
                }
                self.ip = ip.wrapping_add(LEN_RI);
            }

            opcode::MOV => {
                let (a, b) = split_mode(self.fetch_u8(memory, ip.wrapping_add(1))?);
                self.regs[b] = self.regs[a];
                self.ip = ip.wrapping_add(LEN_RR);
            }

            opcode::STBII..=opcode::STDII => {
                let value = self.fetch_u32(memory, ip.wrapping_add(1))?;
                let addr = self.fetch_u32(memory, ip.wrapping_add(5))?;
                let width = access_width(op);
                store(memory, width, addr, value)?;
                self.ip = ip.wrapping_add(LEN_II);
            }

            opcode::RET => {
                let sp = self.regs[REG_SP];
                let target = memory.read_u32(sp)?;
                self.regs[REG_SP] = sp.wrapping_add(4);
                self.ip = target;
            }

            opcode::SYSCALL => {
                self.ip = ip.wrapping_add(1);
                if let Err(fault) = self.interrupt(memory, SYSCALL_LINE) {
                    self.ip = ip;
                    return Err(fault);
                }
            }

            opcode::IRET => {
                let sp = self.regs[REG_SP];
                let target = memory.read_u32(sp)?;
                let saved_sp = memory.read_u32(sp.wrapping_add(4))?;
                let saved_flags = memory.read_u32(sp.wrapping_add(8))?;
                self.regs[REG_SP] = saved_sp;
                self.flags = Flags::from_bits_retain(saved_flags as u8);
                self.ip = target;
            }

            opcode::CLI => {
                self.flags.remove(Flags::INTERRUPT);
                self.ip = ip.wrapping_add(1);
            }

            opcode::STI => {
                self.flags.insert(Flags::INTERRUPT);
                self.ip = ip.wrapping_add(1);
            }

            _ => return Err(Fault::InvalidOpcode { ip }),
        }

        self.regs[REG_ZERO] = 0;
        Ok(())
    }

    /// Fetch one instruction byte. Out of range means the instruction
    /// stream itself is broken, which is `InvalidOpcode`.
    fn fetch_u8(&self, memory: &Memory, at: u32) -> Result<u8, Fault> {
        memory
            .read_u8(at)
            .map_err(|_| Fault::InvalidOpcode { ip: self.ip })
    }

    /// Fetch a 32-bit immediate operand.
    fn fetch_u32(&self, memory: &Memory, at: u32) -> Result<u32, Fault> {
        memory
            .read_u32(at)
            .map_err(|_| Fault::InvalidOpcode { ip: self.ip })
    }

    /// Apply an arithmetic/logic operation selected by `sel` (the low
    /// opcode nibble shared between the RR and RI encodings). `a` is
    /// the first operand value, `b` the destination register index.
    fn alu(&mut self, sel: u8, a: u32, b: usize, ip: u32) -> Result<(), Fault> {
        match sel {
            opcode::ADD => self.regs[b] = self.regs[b].wrapping_add(a),
            opcode::SUB => self.regs[b] = self.regs[b].wrapping_sub(a),
            opcode::MUL => {
                let product = u64::from(self.regs[b]) * u64::from(a);
                self.regs[REG_RESULT_HI] = (product >> 32) as u32;
                self.regs[REG_RESULT_LO] = product as u32;
            }
            opcode::DIV => {
                if a == 0 {
                    return Err(Fault::DivideByZero { ip });
                }
                self.regs[REG_RESULT_HI] = self.regs[b] / a;
                self.regs[REG_RESULT_LO] = self.regs[b] % a;
            }
            opcode::AND => self.regs[b] &= a,
            opcode::OR => self.regs[b] |= a,
            opcode::XOR => self.regs[b] ^= a,
            // Shift counts are the full operand; 32 and up clears out.
            opcode::SHL => self.regs[b] = if a >= 32 { 0 } else { self.regs[b] << a },
            opcode::SHR => self.regs[b] = if a >= 32 { 0 } else { self.regs[b] >> a },
            _ => return Err(Fault::InvalidOpcode { ip }),
        }
        Ok(())
    }
}

/// Store the low `width` bytes of `value` at `addr`.
fn store(memory: &Memory, width: Width, addr: u32, value: u32) -> Result<(), Fault> {
    match width {
        Width::Byte => memory.write_u8(addr, value as u8)?,
        Width::Half => memory.write_u16(addr, value as u16)?,
        Width::Word => memory.write_u32(addr, value)?,
    }
    Ok(())
}

/// Load a zero-extended value of `width` bytes from `addr`.
fn load(memory: &Memory, width: Width, addr: u32) -> Result<u32, Fault> {
    let value = match width {
        Width::Byte => u32::from(memory.read_u8(addr)?),
        Width::Half => u32::from(memory.read_u16(addr)?),
        Width::Word => memory.read_u32(addr)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::super::asm::Asm;
    use super::*;
    use crate::boot::layout;
    use proptest::prelude::*;

    const MIB: usize = 1024 * 1024;

    /// Load `image` at the boot base of a 1 MiB machine.
    fn machine(image: &[u8]) -> (Cpu, Memory) {
        let mem = Memory::new(MIB);
        mem.load_boot(image).unwrap();
        (Cpu::new(), mem)
    }

    fn run_steps(cpu: &mut Cpu, mem: &Memory, n: usize) {
        for _ in 0..n {
            cpu.step(mem).unwrap();
        }
    }

    #[test]
    fn test_movi_then_loop() {
        // MOVI #42, r1 followed by JI back to the entry point.
        let image = Asm::new().movi(42, 1).ji(layout::BOOT_BASE).build();
        let (mut cpu, mem) = machine(&image);

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.regs[1], 42);
        assert_eq!(cpu.ip, layout::BOOT_BASE);
    }

    #[test]
    fn test_nop_advances_one() {
        let image = Asm::new().nop().build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.ip, layout::BOOT_BASE + 1);
    }

    #[test]
    fn test_r0_is_hard_wired_zero() {
        let image = Asm::new().movi(0xDEAD, 0).build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[REG_ZERO], 0);
    }

    #[test]
    fn test_add_wraps() {
        let image = Asm::new().rr(opcode::ADD, 1, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 1;
        cpu.regs[2] = 0xFFFF_FFFF;
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[1], 1);
    }

    #[test]
    fn test_sub_wraps() {
        let image = Asm::new().rr(opcode::SUB, 1, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 1;
        cpu.regs[2] = 0;
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[2], 0xFFFF_FFFF);
    }

    #[test]
    fn test_mul_wide_result() {
        let image = Asm::new().rr(opcode::MUL, 1, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 0xFFFF_FFFF;
        cpu.regs[2] = 0xFFFF_FFFF;
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[REG_RESULT_LO], 0x0000_0001);
        assert_eq!(cpu.regs[REG_RESULT_HI], 0xFFFF_FFFE);
    }

    #[test]
    fn test_div_quotient_and_remainder() {
        let image = Asm::new().rr(opcode::DIV, 1, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 5;
        cpu.regs[2] = 17;
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[REG_RESULT_HI], 3);
        assert_eq!(cpu.regs[REG_RESULT_LO], 2);
    }

    #[test]
    fn test_div_by_zero_faults_cleanly() {
        let image = Asm::new().rr(opcode::DIV, 1, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[2] = 17;
        let before = cpu.regs;

        assert_eq!(
            cpu.step(&mem),
            Err(Fault::DivideByZero {
                ip: layout::BOOT_BASE
            })
        );
        assert_eq!(cpu.regs, before);
        assert_eq!(cpu.ip, layout::BOOT_BASE);
    }

    #[test]
    fn test_shift_count_saturates() {
        let image = Asm::new()
            .rr(opcode::SHL, 1, 2)
            .rr(opcode::SHR, 1, 3)
            .rr(opcode::SHL, 4, 5)
            .build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 32;
        cpu.regs[2] = 0xFFFF_FFFF;
        cpu.regs[3] = 0xFFFF_FFFF;
        cpu.regs[4] = 4;
        cpu.regs[5] = 1;

        run_steps(&mut cpu, &mem, 3);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[3], 0);
        assert_eq!(cpu.regs[5], 0x10);
    }

    #[test]
    fn test_stack_round_trip() {
        let image = Asm::new()
            .movi(0x1000, 15)
            .movi(7, 1)
            .push(1)
            .pop(2)
            .build();
        let (mut cpu, mem) = machine(&image);

        run_steps(&mut cpu, &mem, 4);
        assert_eq!(cpu.regs[2], 7);
        assert_eq!(cpu.regs[REG_SP], 0x1000);
    }

    #[test]
    fn test_push_predecrements() {
        let image = Asm::new().movi(0x1000, 15).pushi(0x55AA).build();
        let (mut cpu, mem) = machine(&image);

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.regs[REG_SP], 0xFFC);
        assert_eq!(mem.read_u32(0xFFC).unwrap(), 0x55AA);
    }

    #[test]
    fn test_push_wraps_at_zero_sp() {
        // r15 == 0 wraps to 0xFFFFFFFC, which is out of bounds here.
        let image = Asm::new().push(1).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 9;

        assert!(matches!(cpu.step(&mem), Err(Fault::Protection(_))));
        assert_eq!(cpu.regs[REG_SP], 0);
        assert_eq!(cpu.ip, layout::BOOT_BASE);
    }

    #[test]
    fn test_call_and_ret() {
        // CALLI 0x300; the routine there sets r3 and returns.
        let image = Asm::new().movi(0x1000, 15).calli(0x300).build();
        let (mut cpu, mem) = machine(&image);
        let routine = Asm::new().movi(0x99, 3).ret().build();
        mem.write_from(0x300, &routine).unwrap();

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.ip, 0x300);
        assert_eq!(cpu.regs[REG_SP], 0x1000 - 4);

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.regs[3], 0x99);
        assert_eq!(cpu.ip, layout::BOOT_BASE + 6 + 5);
        assert_eq!(cpu.regs[REG_SP], 0x1000);
    }

    #[test]
    fn test_call_register_form() {
        let image = Asm::new().movi(0x1000, 15).movi(0x400, 1).call(1).build();
        let (mut cpu, mem) = machine(&image);
        mem.write_from(0x400, &Asm::new().ret().build()).unwrap();

        run_steps(&mut cpu, &mem, 3);
        assert_eq!(cpu.ip, 0x400);

        cpu.step(&mem).unwrap();
        assert_eq!(cpu.ip, layout::BOOT_BASE + 6 + 6 + 2);
        assert_eq!(cpu.regs[REG_SP], 0x1000);
    }

    #[test]
    fn test_compare_and_branch_taken() {
        let image = Asm::new()
            .movi(5, 1)
            .movi(5, 2)
            .rr(0x2C, 1, 2) // CEQ r1 r2
            .jti(0x500)
            .build();
        let (mut cpu, mem) = machine(&image);

        run_steps(&mut cpu, &mem, 4);
        assert_eq!(cpu.ip, 0x500);
        assert!(cpu.flags.contains(Flags::COMPARE));
    }

    #[test]
    fn test_compare_and_branch_not_taken() {
        let image = Asm::new()
            .movi(5, 1)
            .movi(6, 2)
            .rr(0x2C, 1, 2) // CEQ r1 r2
            .jti(0x500)
            .build();
        let (mut cpu, mem) = machine(&image);

        run_steps(&mut cpu, &mem, 4);
        assert_eq!(cpu.ip, layout::BOOT_BASE + 6 + 6 + 2 + 5);
        assert!(!cpu.flags.contains(Flags::COMPARE));
    }

    #[test]
    fn test_compare_family() {
        // (sel, a, b, expected)
        let cases = [
            (0x2A, 5u32, 5u32, true),  // CGTQ: a >= b
            (0x2A, 4, 5, false),
            (0x2B, 5, 5, true),        // CLTQ: a <= b
            (0x2B, 6, 5, false),
            (0x2C, 7, 7, true),        // CEQ
            (0x2D, 7, 7, false),       // CNQ
            (0x2E, 8, 7, true),        // CGT
            (0x2E, 7, 7, false),
            (0x2F, 6, 7, true),        // CLT
            (0x2F, 7, 6, false),
        ];
        for (sel, a, b, expected) in cases {
            let image = Asm::new().rr(sel, 1, 2).build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = a;
            cpu.regs[2] = b;
            cpu.step(&mem).unwrap();
            assert_eq!(
                cpu.flags.contains(Flags::COMPARE),
                expected,
                "op {sel:#04x} with a={a} b={b}"
            );
        }
    }

    #[test]
    fn test_compare_immediate() {
        // CEQI compares the immediate against the register.
        let image = Asm::new().ri(opcode::MOV_RI, 0xC, 7, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[2] = 7;
        cpu.step(&mem).unwrap();
        assert!(cpu.flags.contains(Flags::COMPARE));
    }

    #[test]
    fn test_jump_register_forms() {
        let image = Asm::new().movi(0x600, 1).jump(1).build();
        let (mut cpu, mem) = machine(&image);
        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.ip, 0x600);
    }

    #[test]
    fn test_jump_false_register_not_taken() {
        let image = Asm::new().movi(0x600, 1).jump_false(1).build();
        let (mut cpu, mem) = machine(&image);
        cpu.flags.insert(Flags::COMPARE);
        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.ip, layout::BOOT_BASE + 6 + 2);
    }

    #[test]
    fn test_mov_register() {
        let image = Asm::new().rr(opcode::MOV, 4, 5).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[4] = 0xCAFE;
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[5], 0xCAFE);
    }

    #[test]
    fn test_store_load_round_trip() {
        // STD r1 -> [r2], LDD [r2] -> r3.
        let image = Asm::new()
            .rr(opcode::STD, 1, 2)
            .rr(opcode::LDD, 2, 3)
            .build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 0x1234_5678;
        cpu.regs[2] = 0x8000;

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.regs[3], 0x1234_5678);
        assert_eq!(mem.read_u32(0x8000).unwrap(), 0x1234_5678);
    }

    #[test]
    fn test_store_truncates_and_load_zero_extends() {
        let image = Asm::new()
            .rr(opcode::STB, 1, 2)
            .rr(opcode::LDB, 2, 3)
            .rr(opcode::STW, 1, 4)
            .rr(opcode::LDW, 4, 5)
            .build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 0xAABB_CCDD;
        cpu.regs[2] = 0x8000;
        cpu.regs[4] = 0x9000;

        run_steps(&mut cpu, &mem, 4);
        assert_eq!(cpu.regs[3], 0xDD);
        assert_eq!(cpu.regs[5], 0xCCDD);
    }

    #[test]
    fn test_store_immediate_value() {
        // STBI stores the immediate byte at the address in the register.
        let image = Asm::new().ri(opcode::ALU_RI, 0xA, 0x41, 2).build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[2] = 0x8000;
        cpu.step(&mem).unwrap();
        assert_eq!(mem.read_u8(0x8000).unwrap(), 0x41);
    }

    #[test]
    fn test_load_immediate_address() {
        // LDDI loads the register from the immediate address.
        let image = Asm::new().ri(opcode::ALU_RI, 0xF, 0x8000, 1).build();
        let (mut cpu, mem) = machine(&image);
        mem.write_u32(0x8000, 0xFEED_F00D).unwrap();
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.regs[1], 0xFEED_F00D);
    }

    #[test]
    fn test_alu_immediate() {
        let image = Asm::new()
            .ri(opcode::ALU_RI, opcode::ADD, 10, 1)
            .ri(opcode::ALU_RI, opcode::SHL, 4, 1)
            .build();
        let (mut cpu, mem) = machine(&image);
        cpu.regs[1] = 5;

        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.regs[1], 15 << 4);
    }

    #[test]
    fn test_store_double_immediate() {
        let image = Asm::new().stdii(0xDEAD_BEEF, 0x8000).build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(mem.read_u32(0x8000).unwrap(), 0xDEAD_BEEF);
        assert_eq!(cpu.ip, layout::BOOT_BASE + 9);
    }

    #[test]
    fn test_store_byte_double_immediate_truncates() {
        let image = Asm::new().stbii(0x1234_56AB, 0x8000).build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(mem.read_u8(0x8000).unwrap(), 0xAB);
        assert_eq!(mem.read_u8(0x8001).unwrap(), 0);
    }

    #[test]
    fn test_jfi_taken_when_compare_clear() {
        let image = Asm::new().jfi(0x500).build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.ip, 0x500);
    }

    #[test]
    fn test_jump_true_register_taken() {
        let image = Asm::new().movi(0x640, 1).jump_true(1).build();
        let (mut cpu, mem) = machine(&image);
        cpu.flags.insert(Flags::COMPARE);
        run_steps(&mut cpu, &mem, 2);
        assert_eq!(cpu.ip, 0x640);
    }

    #[test]
    fn test_sti_cli() {
        let image = Asm::new().sti().cli().sti().build();
        let (mut cpu, mem) = machine(&image);

        cpu.step(&mem).unwrap();
        assert!(cpu.flags.contains(Flags::INTERRUPT));
        cpu.step(&mem).unwrap();
        assert!(!cpu.flags.contains(Flags::INTERRUPT));
        cpu.step(&mem).unwrap();
        assert!(cpu.flags.contains(Flags::INTERRUPT));
    }

    #[test]
    fn test_protection_fault_leaves_state() {
        // LDDI from 0xFFFFFFFC on a 1 MiB machine.
        let image = Asm::new().ri(opcode::ALU_RI, 0xF, 0xFFFF_FFFC, 1).build();
        let (mut cpu, mem) = machine(&image);
        let before = cpu.regs;

        assert!(matches!(cpu.step(&mem), Err(Fault::Protection(_))));
        assert_eq!(cpu.regs, before);
        assert_eq!(cpu.ip, layout::BOOT_BASE);
    }

    #[test]
    fn test_unknown_opcode() {
        let image = Asm::new().raw(&[0xFF]).build();
        let (mut cpu, mem) = machine(&image);
        assert_eq!(
            cpu.step(&mem),
            Err(Fault::InvalidOpcode {
                ip: layout::BOOT_BASE
            })
        );
    }

    #[test]
    fn test_unknown_sub_opcode() {
        // 0x10 group with sub-opcode 0 is not a real instruction.
        let image = Asm::new().raw(&[0x10, 0x01, 0, 0, 0, 0]).build();
        let (mut cpu, mem) = machine(&image);
        assert_eq!(
            cpu.step(&mem),
            Err(Fault::InvalidOpcode {
                ip: layout::BOOT_BASE
            })
        );
    }

    #[test]
    fn test_truncated_instruction() {
        // A PUSHI opcode as the last byte of memory has no room for its
        // immediate: that is a broken instruction stream.
        let mem = Memory::new(1024);
        mem.write_u8(1023, opcode::PUSHI).unwrap();
        let mut cpu = Cpu::new();
        cpu.ip = 1023;

        assert_eq!(cpu.step(&mem), Err(Fault::InvalidOpcode { ip: 1023 }));
    }

    #[test]
    fn test_fetch_past_end_of_memory() {
        let mem = Memory::new(1024);
        let mut cpu = Cpu::new();
        cpu.ip = 1024;
        assert_eq!(cpu.step(&mem), Err(Fault::InvalidOpcode { ip: 1024 }));
    }

    #[test]
    fn test_syscall_and_iret() {
        let image = Asm::new().movi(0x1000, 15).sti().syscall().build();
        let (mut cpu, mem) = machine(&image);
        mem.write_u32(layout::ivt_entry(SYSCALL_LINE), 0x700).unwrap();
        mem.write_from(0x700, &Asm::new().iret().build()).unwrap();

        run_steps(&mut cpu, &mem, 3);
        let after_syscall = layout::BOOT_BASE + 6 + 1 + 1;
        assert_eq!(cpu.ip, 0x700);
        assert_eq!(cpu.regs[REG_SP], 0x1000 - 16);
        assert!(!cpu.flags.contains(Flags::INTERRUPT));
        assert_eq!(mem.read_u32(0x1000 - 16).unwrap(), after_syscall);

        cpu.step(&mem).unwrap();
        assert_eq!(cpu.ip, after_syscall);
        assert_eq!(cpu.regs[REG_SP], 0x1000);
        assert!(cpu.flags.contains(Flags::INTERRUPT));
    }

    #[test]
    fn test_syscall_dropped_when_masked() {
        let image = Asm::new().syscall().build();
        let (mut cpu, mem) = machine(&image);
        cpu.step(&mem).unwrap();
        assert_eq!(cpu.ip, layout::BOOT_BASE + 1);
    }

    proptest! {
        #[test]
        fn prop_add_sub_wrap(a in any::<u32>(), b in any::<u32>()) {
            let image = Asm::new()
                .rr(opcode::ADD, 1, 2)
                .rr(opcode::SUB, 3, 4)
                .build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = a;
            cpu.regs[2] = b;
            cpu.regs[3] = a;
            cpu.regs[4] = b;

            cpu.step(&mem).unwrap();
            cpu.step(&mem).unwrap();
            prop_assert_eq!(cpu.regs[2], b.wrapping_add(a));
            prop_assert_eq!(cpu.regs[4], b.wrapping_sub(a));
        }

        #[test]
        fn prop_mul_matches_wide_product(a in any::<u32>(), b in any::<u32>()) {
            let image = Asm::new().rr(opcode::MUL, 1, 2).build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = a;
            cpu.regs[2] = b;

            cpu.step(&mem).unwrap();
            let product = u64::from(a) * u64::from(b);
            prop_assert_eq!(cpu.regs[REG_RESULT_LO], product as u32);
            prop_assert_eq!(cpu.regs[REG_RESULT_HI], (product >> 32) as u32);
        }

        #[test]
        fn prop_shift_ge_32_is_zero(v in any::<u32>(), count in 32u32..) {
            let image = Asm::new()
                .rr(opcode::SHL, 1, 2)
                .rr(opcode::SHR, 1, 3)
                .build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = count;
            cpu.regs[2] = v;
            cpu.regs[3] = v;

            cpu.step(&mem).unwrap();
            cpu.step(&mem).unwrap();
            prop_assert_eq!(cpu.regs[2], 0);
            prop_assert_eq!(cpu.regs[3], 0);
        }

        #[test]
        fn prop_push_pop_inverse(v in any::<u32>()) {
            let image = Asm::new().push(1).pop(2).build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = v;
            cpu.regs[REG_SP] = 0x1000;

            cpu.step(&mem).unwrap();
            cpu.step(&mem).unwrap();
            prop_assert_eq!(cpu.regs[2], v);
            prop_assert_eq!(cpu.regs[REG_SP], 0x1000);
        }

        #[test]
        fn prop_r0_zero_after_any_alu(op in 1u8..=9, a in any::<u32>()) {
            // Target r0 directly; it must still read zero afterwards.
            let image = Asm::new().rr(op, 1, 0).build();
            let (mut cpu, mem) = machine(&image);
            cpu.regs[1] = a.max(1);

            cpu.step(&mem).unwrap();
            prop_assert_eq!(cpu.regs[REG_ZERO], 0);
        }
    }
}
