//! Self-contained ARM/Thumb decode-and-execute interpreter.
//!
//! The teacher dispatches through a `build.rs`-generated 8192-entry ARM
//! table and 2048-entry Thumb table produced by an external `arm-decoder`
//! crate, with per-instruction semantics split across
//! `cpu/interpreter/{arm7,arm9}/{arm,thumb}/{data,mem,branch,other}.rs`.
//! This module keeps those files' semantics (condition check, shifter
//! carry-out rules, `add_with_carry`-style flag computation, PC-relative
//! offset encoding) but reimplements dispatch as a plain `match` over the
//! decoded bits, since the codegen crate isn't a dependency here. Spec
//! §4.2 frames the ARM core's contract as "behavioral equivalence... not a
//! particular dispatch strategy", so this trades the teacher's dispatch
//! table for direct pattern matching without changing observable behavior
//! for the instruction classes implemented.

use crate::cpu::Cpu;
use crate::psr::{Mode, Psr};

/// Bus access the interpreter needs. The memory bus (§4.4) implements this;
/// tests use a flat byte array.
pub trait Bus {
    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;
    fn write8(&mut self, addr: u32, value: u8);
    fn write16(&mut self, addr: u32, value: u16);
    fn write32(&mut self, addr: u32, value: u32);

    /// Coprocessor register transfer target for MRC/MCR (ARM §4.2). Only
    /// CP15 (`cp_num == 15`) is modeled; any other coprocessor number reads
    /// as 0 and discards writes, the same posture unmapped MMIO takes.
    fn coprocessor_read(&mut self, _cp_num: u8, _cn: u8, _cm: u8, _opc2: u8) -> u32 {
        0
    }
    fn coprocessor_write(&mut self, _cp_num: u8, _cn: u8, _cm: u8, _opc2: u8, _value: u32) {}
}

/// `add_with_carry(a, b, carry_in)`, the ARM ARM's primitive every
/// arithmetic data-processing opcode (and CMP/CMN) bottoms out on: returns
/// `(result, carry_out, overflow)`.
fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (r1, c1) = a.overflowing_add(b);
    let (result, c2) = r1.overflowing_add(carry_in as u32);
    let carry_out = c1 || c2;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, carry_out, overflow)
}

fn set_nz(psr: &mut Psr, result: u32) {
    *psr = psr.with_zero(result == 0).with_negative(result >> 31 != 0);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ShiftTy {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

/// Barrel shifter for a register operand, returning `(value, carry_out)`.
/// `imm == true` uses an immediate shift amount (where `amount == 0` means
/// "special case" per the ARM ARM: LSL#0 passes through, LSR/ASR#0 means
/// #32, ROR#0 means RRX).
fn shifter(ty: ShiftTy, value: u32, amount: u8, carry_in: bool, imm: bool) -> (u32, bool) {
    match ty {
        ShiftTy::Lsl => {
            if amount == 0 {
                (value, carry_in)
            } else if amount < 32 {
                (value << amount, (value >> (32 - amount)) & 1 != 0)
            } else if amount == 32 {
                (0, value & 1 != 0)
            } else {
                (0, false)
            }
        }
        ShiftTy::Lsr => {
            let amount = if imm && amount == 0 { 32 } else { amount as u32 };
            if amount == 0 {
                (value, carry_in)
            } else if amount < 32 {
                (value >> amount, (value >> (amount - 1)) & 1 != 0)
            } else if amount == 32 {
                (0, value >> 31 != 0)
            } else {
                (0, false)
            }
        }
        ShiftTy::Asr => {
            let amount = if imm && amount == 0 { 32 } else { amount as u32 };
            if amount == 0 {
                (value, carry_in)
            } else if amount < 32 {
                ((value as i32 >> amount) as u32, (value >> (amount - 1)) & 1 != 0)
            } else {
                let filled = if value >> 31 != 0 { u32::MAX } else { 0 };
                (filled, value >> 31 != 0)
            }
        }
        ShiftTy::Ror => {
            if imm && amount == 0 {
                // RRX: shift right by one, filling the vacated bit with the
                // current carry flag.
                let result = (value >> 1) | ((carry_in as u32) << 31);
                (result, value & 1 != 0)
            } else {
                let amount = amount as u32 & 0x1F;
                if amount == 0 {
                    (value, carry_in)
                } else {
                    (value.rotate_right(amount), (value >> (amount - 1)) & 1 != 0)
                }
            }
        }
    }
}

/// ARM data-processing opcode field (`instr[24:21]`).
#[derive(Clone, Copy, PartialEq, Eq)]
enum DpOp {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOp {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0x0 => DpOp::And,
            0x1 => DpOp::Eor,
            0x2 => DpOp::Sub,
            0x3 => DpOp::Rsb,
            0x4 => DpOp::Add,
            0x5 => DpOp::Adc,
            0x6 => DpOp::Sbc,
            0x7 => DpOp::Rsc,
            0x8 => DpOp::Tst,
            0x9 => DpOp::Teq,
            0xA => DpOp::Cmp,
            0xB => DpOp::Cmn,
            0xC => DpOp::Orr,
            0xD => DpOp::Mov,
            0xE => DpOp::Bic,
            _ => DpOp::Mvn,
        }
    }

    fn is_test(self) -> bool {
        matches!(self, DpOp::Tst | DpOp::Teq | DpOp::Cmp | DpOp::Cmn)
    }

    fn is_logical(self) -> bool {
        matches!(
            self,
            DpOp::And | DpOp::Eor | DpOp::Tst | DpOp::Teq | DpOp::Orr | DpOp::Mov | DpOp::Bic | DpOp::Mvn
        )
    }
}

/// Reloads the two-word pipeline after a branch or mode-changing write to
/// R15. Thumb fetches halfwords; ARM fetches words.
fn reload_pipeline(cpu: &mut Cpu, bus: &mut impl Bus) {
    let thumb = cpu.regs.cpsr().thumb_state();
    let pc = cpu.regs.cur[15];
    if thumb {
        cpu.pipeline[0] = bus.read16(pc) as u32;
        cpu.pipeline[1] = bus.read16(pc.wrapping_add(2)) as u32;
        cpu.regs.cur[15] = pc.wrapping_add(4);
    } else {
        cpu.pipeline[0] = bus.read32(pc);
        cpu.pipeline[1] = bus.read32(pc.wrapping_add(4));
        cpu.regs.cur[15] = pc.wrapping_add(8);
    }
}

/// Sets R15 to `pc` in the given instruction set and primes the pipeline, for
/// use at reset/boot before the first call to [`run`].
pub fn set_pc(cpu: &mut Cpu, bus: &mut impl Bus, pc: u32, thumb: bool) {
    cpu.regs.cpsr = cpu.regs.cpsr.with_thumb_state(thumb);
    cpu.regs.cur[15] = pc;
    reload_pipeline(cpu, bus);
}

fn branch_exchange(cpu: &mut Cpu, bus: &mut impl Bus, target: u32) {
    let thumb = target & 1 != 0;
    cpu.regs.cpsr = cpu.regs.cpsr.with_thumb_state(thumb);
    cpu.regs.cur[15] = target & !1;
    reload_pipeline(cpu, bus);
}

fn execute_dp(cpu: &mut Cpu, op: DpOp, rd: usize, src: u32, operand: u32, shifter_carry: bool, set_flags: bool) {
    let carry_in = cpu.regs.cpsr().carry();
    let (result, carry_out, overflow) = match op {
        DpOp::And | DpOp::Tst => (src & operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Eor | DpOp::Teq => (src ^ operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Orr => (src | operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Mov => (operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Bic => (src & !operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Mvn => (!operand, shifter_carry, cpu.regs.cpsr().overflow()),
        DpOp::Sub | DpOp::Cmp => add_with_carry(src, !operand, true),
        DpOp::Rsb => add_with_carry(operand, !src, true),
        DpOp::Add | DpOp::Cmn => add_with_carry(src, operand, false),
        DpOp::Adc => add_with_carry(src, operand, carry_in),
        DpOp::Sbc => add_with_carry(src, !operand, carry_in),
        DpOp::Rsc => add_with_carry(operand, !src, carry_in),
    };

    if set_flags {
        let mut psr = cpu.regs.cpsr();
        set_nz(&mut psr, result);
        psr = psr.with_carry(carry_out);
        if !op.is_logical() {
            psr = psr.with_overflow(overflow);
        }
        cpu.regs.cpsr = psr;
        if rd == 15 {
            // MOVS/ADDS PC restores CPSR from SPSR (privileged-mode return).
            if cpu.regs.has_spsr() {
                let spsr = cpu.regs.spsr;
                let prev_mode = cpu.regs.cpsr().mode();
                cpu.regs.cpsr = spsr;
                cpu.regs.update_mode(prev_mode, spsr.mode());
            }
        }
    }

    if !op.is_test() {
        cpu.regs.cur[rd] = result;
    }
}

/// Condition-gated ARM instruction dispatch. Covers data processing,
/// multiply/multiply-accumulate, branch/branch-exchange, word/byte single
/// data transfer, block data transfer (LDM/STM), coprocessor register
/// transfer (MRC/MCR), and SWI. Coprocessor data operations and LDC/STC
/// decode to a no-op advance, matching real hardware's "unhandled reads
/// return 0 / unhandled writes are side-effect-free" posture from spec §4.4
/// extended to instruction fetch.
pub fn step_arm(cpu: &mut Cpu, bus: &mut impl Bus) {
    let instr = cpu.pipeline[0];
    cpu.pipeline[0] = cpu.pipeline[1];
    let pc = cpu.regs.cur[15];
    cpu.pipeline[1] = bus.read32(pc);
    cpu.regs.cur[15] = pc.wrapping_add(4);

    let condition = (instr >> 28) as u8;
    if !cpu.regs.cpsr().satisfies_condition(condition) {
        return;
    }

    if instr & 0x0FFF_FFF0 == 0x012F_FF10 {
        let target = cpu.regs.cur[(instr & 0xF) as usize];
        branch_exchange(cpu, bus, target);
        return;
    }

    // Multiply / multiply-accumulate: bits27-22 == 0 and bits7-4 == 1001,
    // which otherwise falls inside the data-processing group below.
    if instr & 0x0FC0_00F0 == 0x0000_0090 {
        let accumulate = instr & (1 << 21) != 0;
        let set_flags = instr & (1 << 20) != 0;
        let rd = ((instr >> 16) & 0xF) as usize;
        let rn = ((instr >> 12) & 0xF) as usize;
        let rs = ((instr >> 8) & 0xF) as usize;
        let rm = (instr & 0xF) as usize;
        let mut result = cpu.regs.cur[rm].wrapping_mul(cpu.regs.cur[rs]);
        if accumulate {
            result = result.wrapping_add(cpu.regs.cur[rn]);
        }
        cpu.regs.cur[rd] = result;
        if set_flags {
            let mut psr = cpu.regs.cpsr();
            set_nz(&mut psr, result);
            cpu.regs.cpsr = psr;
        }
        return;
    }

    match (instr >> 25) & 0x7 {
        0x5 => {
            let link = instr & (1 << 24) != 0;
            let r15 = pc;
            if link {
                cpu.regs.cur[14] = r15.wrapping_sub(4);
            }
            let offset = ((instr as i32) << 8) >> 6;
            cpu.regs.cur[15] = r15.wrapping_add(offset as u32);
            reload_pipeline(cpu, bus);
        }
        0x0 | 0x1 => {
            let set_flags = instr & (1 << 20) != 0;
            let op = DpOp::from_bits((instr >> 21) & 0xF);
            let rn = ((instr >> 16) & 0xF) as usize;
            let rd = ((instr >> 12) & 0xF) as usize;
            let carry_in = cpu.regs.cpsr().carry();

            let (operand, shifter_carry) = if instr & (1 << 25) != 0 {
                let imm = instr & 0xFF;
                let rot = ((instr >> 7) & 0x1E) as u8;
                if rot == 0 {
                    (imm, carry_in)
                } else {
                    (imm.rotate_right(rot as u32), (imm.rotate_right(rot as u32) >> 31) != 0)
                }
            } else {
                let rm = (instr & 0xF) as usize;
                let shift_ty = match (instr >> 5) & 0x3 {
                    0 => ShiftTy::Lsl,
                    1 => ShiftTy::Lsr,
                    2 => ShiftTy::Asr,
                    _ => ShiftTy::Ror,
                };
                let value = cpu.regs.cur[rm];
                if instr & (1 << 4) != 0 {
                    let rs = ((instr >> 8) & 0xF) as usize;
                    let amount = cpu.regs.cur[rs] as u8;
                    shifter(shift_ty, value, amount, carry_in, false)
                } else {
                    let amount = ((instr >> 7) & 0x1F) as u8;
                    shifter(shift_ty, value, amount, carry_in, true)
                }
            };
            let src = cpu.regs.cur[rn];
            execute_dp(cpu, op, rd, src, operand, shifter_carry, set_flags);
        }
        0x2 | 0x3 if instr & (1 << 26) != 0 => {
            // Single data transfer: LDR/STR, byte or word, immediate or
            // register offset, pre/post-indexed.
            let load = instr & (1 << 20) != 0;
            let byte = instr & (1 << 22) != 0;
            let add = instr & (1 << 23) != 0;
            let pre_index = instr & (1 << 24) != 0;
            let write_back = instr & (1 << 21) != 0 || !pre_index;
            let rn = ((instr >> 16) & 0xF) as usize;
            let rd = ((instr >> 12) & 0xF) as usize;

            let offset = if instr & (1 << 25) != 0 {
                let rm = (instr & 0xF) as usize;
                let shift_ty = match (instr >> 5) & 0x3 {
                    0 => ShiftTy::Lsl,
                    1 => ShiftTy::Lsr,
                    2 => ShiftTy::Asr,
                    _ => ShiftTy::Ror,
                };
                let amount = ((instr >> 7) & 0x1F) as u8;
                shifter(shift_ty, cpu.regs.cur[rm], amount, cpu.regs.cpsr().carry(), true).0
            } else {
                instr & 0xFFF
            };

            let base = cpu.regs.cur[rn];
            let indexed = if add { base.wrapping_add(offset) } else { base.wrapping_sub(offset) };
            let effective = if pre_index { indexed } else { base };

            if load {
                let value = if byte { bus.read8(effective) as u32 } else { bus.read32(effective) };
                cpu.regs.cur[rd] = value;
            } else {
                let value = cpu.regs.cur[rd];
                if byte {
                    bus.write8(effective, value as u8);
                } else {
                    bus.write32(effective, value);
                }
            }
            if write_back {
                cpu.regs.cur[rn] = indexed;
            }
        }
        0x4 => {
            // Block data transfer: LDM/STM. The lowest transferred address
            // is always `base` (up) or `base - count*4` (down); pre-index
            // shifts the first transfer up by one word. Real hardware's
            // Rn-in-list / S-bit (user-bank transfer) edge cases aren't
            // modeled.
            let pre_index = instr & (1 << 24) != 0;
            let up = instr & (1 << 23) != 0;
            let write_back = instr & (1 << 21) != 0;
            let load = instr & (1 << 20) != 0;
            let rn = ((instr >> 16) & 0xF) as usize;
            let reg_list = instr & 0xFFFF;
            let count = reg_list.count_ones();
            let base = cpu.regs.cur[rn];
            let modified_base = if up { base.wrapping_add(count * 4) } else { base.wrapping_sub(count * 4) };
            let low = if up { base } else { modified_base };
            let mut addr = if pre_index { low.wrapping_add(4) } else { low };
            for i in 0..16 {
                if reg_list & (1 << i) == 0 {
                    continue;
                }
                if load {
                    cpu.regs.cur[i] = bus.read32(addr);
                } else {
                    bus.write32(addr, cpu.regs.cur[i]);
                }
                addr = addr.wrapping_add(4);
            }
            if write_back && !(load && reg_list & (1 << rn) != 0) {
                cpu.regs.cur[rn] = modified_base;
            }
        }
        0x7 if instr & (1 << 24) != 0 => {
            // SWI: return address is the instruction following the SWI.
            let return_addr = pc.wrapping_sub(4);
            cpu.enter_swi_exception(return_addr);
            reload_pipeline(cpu, bus);
        }
        0x7 if instr & (1 << 4) != 0 => {
            // MRC/MCR: coprocessor register transfer.
            let load = instr & (1 << 20) != 0;
            let cp_num = ((instr >> 8) & 0xF) as u8;
            let cn = ((instr >> 16) & 0xF) as u8;
            let cm = (instr & 0xF) as u8;
            let opc2 = ((instr >> 5) & 0x7) as u8;
            let rd = ((instr >> 12) & 0xF) as usize;
            if load {
                let value = bus.coprocessor_read(cp_num, cn, cm, opc2);
                if rd != 15 {
                    cpu.regs.cur[rd] = value;
                }
            } else {
                bus.coprocessor_write(cp_num, cn, cm, opc2, cpu.regs.cur[rd]);
            }
        }
        _ => {
            // Undefined / unimplemented instruction classes (coprocessor
            // data operations and LDC/STC) are no-ops: execution continues
            // to the next instruction without side effects.
        }
    }
}

/// Thumb instruction dispatch, grouped by the teacher's `thumb/*.rs` file
/// split: shift/add/sub/move immediate, ALU (low and hi register), BX,
/// PC/SP-relative load, load/store immediate offset, push/pop, multiple
/// load/store, long branch-with-link, SWI, unconditional branch, and
/// conditional branch. Load/store with register offset (format 7/8) and
/// load/store halfword (format 10) are the remaining no-op classes.
pub fn step_thumb(cpu: &mut Cpu, bus: &mut impl Bus) {
    let instr = cpu.pipeline[0] as u16;
    cpu.pipeline[0] = cpu.pipeline[1];
    let pc = cpu.regs.cur[15];
    cpu.pipeline[1] = bus.read16(pc) as u32;
    cpu.regs.cur[15] = pc.wrapping_add(2);

    match instr >> 13 {
        0b000 if instr & 0x1800 != 0x1800 => {
            let shift_ty = match (instr >> 11) & 0x3 {
                0 => ShiftTy::Lsl,
                1 => ShiftTy::Lsr,
                _ => ShiftTy::Asr,
            };
            let amount = ((instr >> 6) & 0x1F) as u8;
            let rs = ((instr >> 3) & 0x7) as usize;
            let rd = (instr & 0x7) as usize;
            let carry_in = cpu.regs.cpsr().carry();
            let (result, carry_out) = shifter(shift_ty, cpu.regs.cur[rs], amount, carry_in, true);
            cpu.regs.cur[rd] = result;
            let mut psr = cpu.regs.cpsr();
            set_nz(&mut psr, result);
            cpu.regs.cpsr = psr.with_carry(carry_out);
        }
        0b000 => {
            // Add/subtract (register or 3-bit immediate).
            let imm_flag = instr & (1 << 10) != 0;
            let sub = instr & (1 << 9) != 0;
            let rs = ((instr >> 3) & 0x7) as usize;
            let rd = (instr & 0x7) as usize;
            let operand = if imm_flag {
                ((instr >> 6) & 0x7) as u32
            } else {
                cpu.regs.cur[((instr >> 6) & 0x7) as usize]
            };
            let src = cpu.regs.cur[rs];
            let (result, carry, overflow) = if sub {
                add_with_carry(src, !operand, true)
            } else {
                add_with_carry(src, operand, false)
            };
            cpu.regs.cur[rd] = result;
            let mut psr = cpu.regs.cpsr();
            set_nz(&mut psr, result);
            cpu.regs.cpsr = psr.with_carry(carry).with_overflow(overflow);
        }
        0b001 => {
            // Move/compare/add/subtract immediate (8-bit).
            let op = (instr >> 11) & 0x3;
            let rd = ((instr >> 8) & 0x7) as usize;
            let imm = (instr & 0xFF) as u32;
            let src = cpu.regs.cur[rd];
            let (result, carry, overflow) = match op {
                0 => (imm, cpu.regs.cpsr().carry(), cpu.regs.cpsr().overflow()),
                1 => add_with_carry(src, !imm, true),
                2 => add_with_carry(src, imm, false),
                _ => add_with_carry(src, !imm, true),
            };
            let mut psr = cpu.regs.cpsr();
            set_nz(&mut psr, result);
            if op != 0 {
                psr = psr.with_carry(carry).with_overflow(overflow);
            }
            cpu.regs.cpsr = psr;
            if op != 1 {
                // MOV/ADD/SUB write back; CMP (op==1) doesn't.
                cpu.regs.cur[rd] = result;
            }
        }
        0b010 if instr >> 10 == 0b010000 => {
            // ALU operations (format 4): Rd = Rd op Rs, two low registers.
            let op = (instr >> 6) & 0xF;
            let rs = ((instr >> 3) & 0x7) as usize;
            let rd = (instr & 0x7) as usize;
            let carry_in = cpu.regs.cpsr().carry();
            let dst = cpu.regs.cur[rd];
            let src = cpu.regs.cur[rs];
            let mut psr = cpu.regs.cpsr();
            let mut writeback = true;
            let result = match op {
                0x0 => { let r = dst & src; set_nz(&mut psr, r); r }
                0x1 => { let r = dst ^ src; set_nz(&mut psr, r); r }
                0x2 => {
                    let (r, c) = shifter(ShiftTy::Lsl, dst, src as u8, carry_in, false);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c);
                    r
                }
                0x3 => {
                    let (r, c) = shifter(ShiftTy::Lsr, dst, src as u8, carry_in, false);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c);
                    r
                }
                0x4 => {
                    let (r, c) = shifter(ShiftTy::Asr, dst, src as u8, carry_in, false);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c);
                    r
                }
                0x5 => {
                    let (r, c, v) = add_with_carry(dst, src, carry_in);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c).with_overflow(v);
                    r
                }
                0x6 => {
                    let (r, c, v) = add_with_carry(dst, !src, carry_in);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c).with_overflow(v);
                    r
                }
                0x7 => {
                    let (r, c) = shifter(ShiftTy::Ror, dst, src as u8, carry_in, false);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c);
                    r
                }
                0x8 => { let r = dst & src; set_nz(&mut psr, r); writeback = false; r }
                0x9 => {
                    let (r, c, v) = add_with_carry(0, !src, true);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c).with_overflow(v);
                    r
                }
                0xA => {
                    let (r, c, v) = add_with_carry(dst, !src, true);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c).with_overflow(v);
                    writeback = false;
                    r
                }
                0xB => {
                    let (r, c, v) = add_with_carry(dst, src, false);
                    set_nz(&mut psr, r);
                    psr = psr.with_carry(c).with_overflow(v);
                    writeback = false;
                    r
                }
                0xC => { let r = dst | src; set_nz(&mut psr, r); r }
                0xD => { let r = dst.wrapping_mul(src); set_nz(&mut psr, r); r }
                0xE => { let r = dst & !src; set_nz(&mut psr, r); r }
                _ => { let r = !src; set_nz(&mut psr, r); r }
            };
            cpu.regs.cpsr = psr;
            if writeback {
                cpu.regs.cur[rd] = result;
            }
        }
        0b010 if instr >> 10 == 0b010001 && (instr >> 8) & 0x3 != 0b11 => {
            // Hi-register ALU ops (format 5): ADD/CMP/MOV across r0-r15.
            let op = (instr >> 8) & 0x3;
            let h1 = instr & (1 << 7) != 0;
            let h2 = instr & (1 << 6) != 0;
            let rs = ((instr >> 3) & 0x7) as usize | if h2 { 0x8 } else { 0 };
            let rd = (instr & 0x7) as usize | if h1 { 0x8 } else { 0 };
            let src = cpu.regs.cur[rs];
            match op {
                0x0 => cpu.regs.cur[rd] = cpu.regs.cur[rd].wrapping_add(src),
                0x1 => {
                    let (result, carry, overflow) = add_with_carry(cpu.regs.cur[rd], !src, true);
                    let mut psr = cpu.regs.cpsr();
                    set_nz(&mut psr, result);
                    cpu.regs.cpsr = psr.with_carry(carry).with_overflow(overflow);
                }
                _ => cpu.regs.cur[rd] = src,
            }
            if rd == 15 && op != 0x1 {
                cpu.regs.cur[15] &= !1;
                reload_pipeline(cpu, bus);
            }
        }
        0b010 if instr >> 10 == 0b010001 => {
            // BX/BLX (format 5, op == 0b11): H2 selects a hi Rs.
            let h2 = instr & (1 << 6) != 0;
            let rs = ((instr >> 3) & 0x7) as usize | if h2 { 0x8 } else { 0 };
            let target = cpu.regs.cur[rs];
            branch_exchange(cpu, bus, target);
        }
        0b010 if instr >> 11 == 0b01001 => {
            // PC-relative load (format 6): base is PC word-aligned.
            let rd = ((instr >> 8) & 0x7) as usize;
            let imm = (instr & 0xFF) as u32 * 4;
            let base = pc & !3;
            cpu.regs.cur[rd] = bus.read32(base.wrapping_add(imm));
        }
        0b011 => {
            // Load/store with immediate offset (format 9), word or byte.
            let byte = instr & (1 << 12) != 0;
            let load = instr & (1 << 11) != 0;
            let offset5 = ((instr >> 6) & 0x1F) as u32;
            let offset = if byte { offset5 } else { offset5 * 4 };
            let rb = ((instr >> 3) & 0x7) as usize;
            let rd = (instr & 0x7) as usize;
            let addr = cpu.regs.cur[rb].wrapping_add(offset);
            if load {
                cpu.regs.cur[rd] = if byte { bus.read8(addr) as u32 } else { bus.read32(addr) };
            } else if byte {
                bus.write8(addr, cpu.regs.cur[rd] as u8);
            } else {
                bus.write32(addr, cpu.regs.cur[rd]);
            }
        }
        0b100 if instr >> 12 == 0b1001 => {
            // SP-relative load/store (format 11).
            let load = instr & (1 << 11) != 0;
            let rd = ((instr >> 8) & 0x7) as usize;
            let imm = (instr & 0xFF) as u32 * 4;
            let addr = cpu.regs.cur[13].wrapping_add(imm);
            if load {
                cpu.regs.cur[rd] = bus.read32(addr);
            } else {
                bus.write32(addr, cpu.regs.cur[rd]);
            }
        }
        0b101 if instr >> 12 == 0b1011 && (instr >> 9) & 0x3 == 0b10 => {
            // PUSH/POP (format 14), register list restricted to r0-r7 plus
            // LR (push) / PC (pop).
            let pop = instr & (1 << 11) != 0;
            let store_lr_load_pc = instr & (1 << 8) != 0;
            let reg_list = (instr & 0xFF) as u32;
            if pop {
                let mut addr = cpu.regs.cur[13];
                for i in 0..8 {
                    if reg_list & (1 << i) != 0 {
                        cpu.regs.cur[i] = bus.read32(addr);
                        addr = addr.wrapping_add(4);
                    }
                }
                if store_lr_load_pc {
                    let target = bus.read32(addr);
                    addr = addr.wrapping_add(4);
                    cpu.regs.cur[13] = addr;
                    branch_exchange(cpu, bus, target);
                    return;
                }
                cpu.regs.cur[13] = addr;
            } else {
                let count = reg_list.count_ones() + u32::from(store_lr_load_pc);
                let mut addr = cpu.regs.cur[13].wrapping_sub(count * 4);
                cpu.regs.cur[13] = addr;
                for i in 0..8 {
                    if reg_list & (1 << i) != 0 {
                        bus.write32(addr, cpu.regs.cur[i]);
                        addr = addr.wrapping_add(4);
                    }
                }
                if store_lr_load_pc {
                    bus.write32(addr, cpu.regs.cur[14]);
                }
            }
        }
        0b110 if instr >> 12 == 0b1100 => {
            // Multiple load/store (format 15); always writes back the base.
            let load = instr & (1 << 11) != 0;
            let rb = ((instr >> 8) & 0x7) as usize;
            let reg_list = (instr & 0xFF) as u32;
            let mut addr = cpu.regs.cur[rb];
            for i in 0..8 {
                if reg_list & (1 << i) != 0 {
                    if load {
                        cpu.regs.cur[i] = bus.read32(addr);
                    } else {
                        bus.write32(addr, cpu.regs.cur[i]);
                    }
                    addr = addr.wrapping_add(4);
                }
            }
            if !(load && reg_list & (1 << rb) != 0) {
                cpu.regs.cur[rb] = addr;
            }
        }
        0b110 if instr & 0x0800 == 0 && instr >> 12 == 0b1101 => {
            // Conditional branch.
            let condition = ((instr >> 8) & 0xF) as u8;
            if cpu.regs.cpsr().satisfies_condition(condition) {
                let offset = ((instr as i8 as i32) << 1) as u32;
                cpu.regs.cur[15] = pc.wrapping_add(offset);
                reload_pipeline(cpu, bus);
            }
        }
        0b110 if instr >> 8 == 0b1101_1111 => {
            // SWI.
            let return_addr = pc.wrapping_sub(2);
            cpu.enter_swi_exception(return_addr);
            reload_pipeline(cpu, bus);
        }
        0b111 if instr >> 11 == 0b11100 => {
            // Unconditional branch.
            let offset = (((instr & 0x7FF) as i32) << 21 >> 20) as u32;
            cpu.regs.cur[15] = pc.wrapping_add(offset);
            reload_pipeline(cpu, bus);
        }
        0b111 if instr >> 12 == 0b1111 => {
            // Long branch with link (format 19), two halves distinguished
            // by H (bit11): high offset first, then low offset + branch.
            let high_half = instr & (1 << 11) == 0;
            let off11 = (instr & 0x7FF) as u32;
            if high_half {
                let signed_off = (((off11 << 21) as i32) >> 21) as u32;
                cpu.regs.cur[14] = pc.wrapping_add(signed_off << 12);
            } else {
                let lr = cpu.regs.cur[14];
                let target = lr.wrapping_add(off11 << 1);
                cpu.regs.cur[14] = pc | 1;
                cpu.regs.cur[15] = target;
                reload_pipeline(cpu, bus);
            }
        }
        _ => {
            // Load/store with register offset (format 7/8) and load/store
            // halfword (format 10): no-ops.
        }
    }
}

/// Advances the CPU by at most `n` instructions, taking a pending IRQ first
/// if one is live and unmasked, and honoring wait-for-IRQ by consuming the
/// rest of the budget. Mirrors spec §4.2's `run(n)` contract.
pub fn run(cpu: &mut Cpu, bus: &mut impl Bus, n: u32) -> u32 {
    let mut executed = 0;
    while executed < n {
        if cpu.wait_for_irq {
            return n;
        }
        if cpu.irq_pending() {
            let target = cpu.enter_irq_exception();
            cpu.regs.cur[15] = target;
            reload_pipeline(cpu, bus);
        }
        if cpu.regs.cpsr().thumb_state() {
            step_thumb(cpu, bus);
        } else {
            step_arm(cpu, bus);
        }
        executed += 1;
    }
    executed
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
    }

    impl FlatBus {
        fn new() -> Self {
            FlatBus { mem: vec![0; 0x1_0000] }
        }
    }

    impl Bus for FlatBus {
        fn read8(&mut self, addr: u32) -> u8 {
            self.mem[addr as usize]
        }
        fn read16(&mut self, addr: u32) -> u16 {
            let i = addr as usize;
            u16::from_le_bytes([self.mem[i], self.mem[i + 1]])
        }
        fn read32(&mut self, addr: u32) -> u32 {
            let i = addr as usize;
            u32::from_le_bytes(self.mem[i..i + 4].try_into().unwrap())
        }
        fn write8(&mut self, addr: u32, value: u8) {
            self.mem[addr as usize] = value;
        }
        fn write16(&mut self, addr: u32, value: u16) {
            let i = addr as usize;
            self.mem[i..i + 2].copy_from_slice(&value.to_le_bytes());
        }
        fn write32(&mut self, addr: u32, value: u32) {
            let i = addr as usize;
            self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn arm_cpu() -> (Cpu, FlatBus) {
        let mut cpu = Cpu::new();
        cpu.set_mode(Mode::USER);
        cpu.regs.cpsr = cpu.regs.cpsr.with_thumb_state(false);
        cpu.regs.cur[15] = 0;
        (cpu, FlatBus::new())
    }

    #[test]
    fn mov_immediate_with_flags() {
        let (mut cpu, mut bus) = arm_cpu();
        // MOVS R0, #0 (AL, op=MOV, S=1): should set Z flag.
        bus.write32(0, 0xE3B0_0000);
        cpu.pipeline[0] = bus.read32(0);
        cpu.pipeline[1] = bus.read32(4);
        cpu.regs.cur[15] = 8;
        step_arm(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.cur[0], 0);
        assert!(cpu.regs.cpsr().zero());
    }

    #[test]
    fn add_sets_carry_and_overflow_on_wraparound() {
        let (mut cpu, mut bus) = arm_cpu();
        cpu.regs.cur[1] = 0xFFFF_FFFF;
        // ADDS R0, R1, #1 (AL, op=ADD, S=1, Rn=1, Rd=0, imm=1).
        bus.write32(0, 0xE291_0001);
        cpu.pipeline[0] = bus.read32(0);
        cpu.pipeline[1] = bus.read32(4);
        cpu.regs.cur[15] = 8;
        step_arm(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.cur[0], 0);
        assert!(cpu.regs.cpsr().carry());
        assert!(cpu.regs.cpsr().zero());
    }

    #[test]
    fn branch_updates_pc_and_reloads_pipeline() {
        let (mut cpu, mut bus) = arm_cpu();
        // B #8 forward (AL, link=0, offset encoded as +2 words).
        bus.write32(0, 0xEA00_0000);
        cpu.pipeline[0] = bus.read32(0);
        cpu.pipeline[1] = bus.read32(4);
        cpu.regs.cur[15] = 8;
        step_arm(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.cur[15], 16);
    }

    #[test]
    fn thumb_move_immediate_sets_zero_flag() {
        let mut cpu = Cpu::new();
        cpu.set_mode(Mode::USER);
        cpu.regs.cpsr = cpu.regs.cpsr.with_thumb_state(true);
        let mut bus = FlatBus::new();
        // MOV R0, #0 (Thumb encoding 0x2000).
        bus.write16(0, 0x2000);
        cpu.pipeline[0] = bus.read16(0) as u32;
        cpu.pipeline[1] = bus.read16(2) as u32;
        cpu.regs.cur[15] = 4;
        step_thumb(&mut cpu, &mut bus);
        assert!(cpu.regs.cpsr().zero());
    }
}
