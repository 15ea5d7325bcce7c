//! ARM CPU state shared by both cores (spec §4.2): 16 GPRs with six banked
//! register sets, CPSR/SPSR, a two-word prefetch pipeline, and IRQ entry.
//! The bank-swap algorithm in [`Regs::update_mode`] is carried over from the
//! teacher's `cpu/interpreter/regs.rs` essentially verbatim; everything
//! downstream of "where a written-to register lives" is unique to this
//! implementation's match-based interpreter rather than the teacher's
//! generic `Engine` trait.

use crate::psr::{Bank, Mode, Psr};

#[derive(Clone, Debug)]
pub struct Regs {
    pub cur: [u32; 16],
    pub cpsr: Psr,
    is_in_priv_mode: bool,
    has_spsr: bool,
    pub spsr: Psr,
    r8_14_fiq: [u32; 7],
    r8_12_other: [u32; 5],
    r13_14_sys: [u32; 2],
    r13_14_irq: [u32; 2],
    r13_14_svc: [u32; 2],
    r13_14_abt: [u32; 2],
    r13_14_und: [u32; 2],
    spsr_fiq: Psr,
    spsr_irq: Psr,
    spsr_svc: Psr,
    spsr_abt: Psr,
    spsr_und: Psr,
}

impl Regs {
    fn startup() -> Self {
        Regs {
            cur: [0; 16],
            cpsr: Psr(0x13),
            is_in_priv_mode: true,
            has_spsr: true,
            spsr: Psr(0x10),
            r8_14_fiq: [0; 7],
            r8_12_other: [0; 5],
            r13_14_sys: [0; 2],
            r13_14_irq: [0; 2],
            r13_14_svc: [0; 2],
            r13_14_abt: [0; 2],
            r13_14_und: [0; 2],
            spsr_fiq: Psr(0x10),
            spsr_irq: Psr(0x10),
            spsr_svc: Psr(0x10),
            spsr_abt: Psr(0x10),
            spsr_und: Psr(0x10),
        }
    }

    #[inline]
    pub fn cpsr(&self) -> Psr {
        self.cpsr
    }

    #[inline]
    pub fn is_in_priv_mode(&self) -> bool {
        self.is_in_priv_mode
    }

    #[inline]
    pub fn has_spsr(&self) -> bool {
        self.has_spsr
    }

    /// Swaps R13/R14 (and R8-R12 to/from FIQ) and the active SPSR between
    /// the banks `prev_mode` and `new_mode` own. A same-bank switch (e.g.
    /// User <-> System) is a no-op for registers. Public so the interpreter
    /// can re-bank after a CPSR write that changes mode bits directly (e.g.
    /// `MOVS PC, LR` restoring a saved mode from SPSR).
    pub fn update_mode(&mut self, prev_mode: Mode, new_mode: Mode) {
        if new_mode == prev_mode {
            return;
        }

        let prev_reg_bank = prev_mode.reg_bank();
        let new_reg_bank = new_mode.reg_bank();
        if prev_reg_bank != new_reg_bank {
            match prev_reg_bank {
                Bank::System => {
                    self.r13_14_sys[0] = self.cur[13];
                    self.r13_14_sys[1] = self.cur[14];
                }
                Bank::Fiq => {
                    self.r8_14_fiq[..5].copy_from_slice(&self.cur[8..13]);
                    self.r8_14_fiq[5] = self.cur[13];
                    self.r8_14_fiq[6] = self.cur[14];
                    self.cur[8..13].copy_from_slice(&self.r8_12_other);
                }
                Bank::Irq => {
                    self.r13_14_irq[0] = self.cur[13];
                    self.r13_14_irq[1] = self.cur[14];
                }
                Bank::Supervisor => {
                    self.r13_14_svc[0] = self.cur[13];
                    self.r13_14_svc[1] = self.cur[14];
                }
                Bank::Abort => {
                    self.r13_14_abt[0] = self.cur[13];
                    self.r13_14_abt[1] = self.cur[14];
                }
                Bank::Undefined => {
                    self.r13_14_und[0] = self.cur[13];
                    self.r13_14_und[1] = self.cur[14];
                }
            }
            match new_reg_bank {
                Bank::System => {
                    self.cur[13] = self.r13_14_sys[0];
                    self.cur[14] = self.r13_14_sys[1];
                }
                Bank::Fiq => {
                    self.r8_12_other.copy_from_slice(&self.cur[8..13]);
                    self.cur[8..13].copy_from_slice(&self.r8_14_fiq[..5]);
                    self.cur[13] = self.r8_14_fiq[5];
                    self.cur[14] = self.r8_14_fiq[6];
                }
                Bank::Irq => {
                    self.cur[13] = self.r13_14_irq[0];
                    self.cur[14] = self.r13_14_irq[1];
                }
                Bank::Supervisor => {
                    self.cur[13] = self.r13_14_svc[0];
                    self.cur[14] = self.r13_14_svc[1];
                }
                Bank::Abort => {
                    self.cur[13] = self.r13_14_abt[0];
                    self.cur[14] = self.r13_14_abt[1];
                }
                Bank::Undefined => {
                    self.cur[13] = self.r13_14_und[0];
                    self.cur[14] = self.r13_14_und[1];
                }
            }
        }

        self.is_in_priv_mode = new_mode.is_privileged();
        self.has_spsr = new_mode.has_spsr();

        let prev_spsr_bank = prev_mode.spsr_bank();
        let new_spsr_bank = new_mode.spsr_bank();
        if prev_spsr_bank != new_spsr_bank {
            match prev_spsr_bank {
                Bank::System => {}
                Bank::Fiq => self.spsr_fiq = self.spsr,
                Bank::Irq => self.spsr_irq = self.spsr,
                Bank::Supervisor => self.spsr_svc = self.spsr,
                Bank::Abort => self.spsr_abt = self.spsr,
                Bank::Undefined => self.spsr_und = self.spsr,
            }
            self.spsr = match new_spsr_bank {
                Bank::System => self.spsr,
                Bank::Fiq => self.spsr_fiq,
                Bank::Irq => self.spsr_irq,
                Bank::Supervisor => self.spsr_svc,
                Bank::Abort => self.spsr_abt,
                Bank::Undefined => self.spsr_und,
            };
        }
    }
}

/// Behavioral state common to ARM7 and ARM9 (spec §4.2). Instruction decode
/// and execution live in [`crate::interpreter`]; this type owns only the
/// architectural state the interpreter operates on.
pub struct Cpu {
    pub regs: Regs,
    /// `opcode[0..1]`: the two in-flight prefetched words (ARM or Thumb).
    pub pipeline: [u32; 2],
    pub irq_line: bool,
    pub wait_for_irq: bool,
    pub exception_base: u32,
    pub unaligned_access_enabled: bool,
}

impl Cpu {
    pub fn new() -> Self {
        let mut cpu = Cpu {
            regs: Regs::startup(),
            pipeline: [0; 2],
            irq_line: false,
            wait_for_irq: false,
            exception_base: 0,
            unaligned_access_enabled: false,
        };
        cpu.reset();
        cpu
    }

    /// Zeroes all registers, sets CPSR to Supervisor with I/F masked, sets
    /// PC to the exception base, and clears wait-for-IRQ. Priming the
    /// pipeline with real fetches is the interpreter's job (it owns bus
    /// access); `pipeline` is left zeroed here.
    pub fn reset(&mut self) {
        self.regs = Regs::startup();
        let prev_mode = self.regs.cpsr().mode();
        self.regs.cpsr = Psr(0).with_mode_bits(Mode::SUPERVISOR.get()).with_irqs_disabled(true).with_fiqs_disabled(true);
        self.regs.update_mode(prev_mode, Mode::SUPERVISOR);
        self.regs.cur[15] = self.exception_base;
        self.pipeline = [0; 2];
        self.irq_line = false;
        self.wait_for_irq = false;
    }

    pub fn set_mode(&mut self, mode: Mode) {
        let prev_mode = self.regs.cpsr().mode();
        self.regs.cpsr.set_mode(mode);
        self.regs.update_mode(prev_mode, mode);
    }

    /// Whether an IRQ should be taken right now: the line is asserted and
    /// the CPSR's I bit doesn't mask it.
    pub fn irq_pending(&self) -> bool {
        self.irq_line && !self.regs.cpsr().irqs_disabled()
    }

    /// Enters the IRQ exception per spec §4.2: save CPSR to SPSR_irq,
    /// switch to IRQ mode, mask I, save the adjusted return address to LR,
    /// jump to `exception_base + 0x18`. Returns the address the interpreter
    /// should resume fetching from (always ARM-mode).
    pub fn enter_irq_exception(&mut self) -> u32 {
        let was_thumb = self.regs.cpsr().thumb_state();
        let return_addr = self.regs.cur[15].wrapping_sub(if was_thumb { 0 } else { 4 });
        let saved_cpsr = self.regs.cpsr();

        self.set_mode(Mode::IRQ);
        self.regs.spsr = saved_cpsr;
        self.regs.cpsr = self
            .regs
            .cpsr
            .with_irqs_disabled(true)
            .with_thumb_state(false);
        self.regs.cur[14] = return_addr;
        let target = self.exception_base + 0x18;
        self.regs.cur[15] = target;
        self.wait_for_irq = false;
        target
    }

    /// Enters the Supervisor exception for `SWI` per spec §4.2: save CPSR to
    /// SPSR_svc, switch to Supervisor mode, mask I, save `return_addr` (the
    /// caller computes it, since the ARM/Thumb return-address offset from
    /// the current PC differs) to LR, jump to `exception_base + 0x08`.
    /// Returns the target address, the same contract as
    /// [`Cpu::enter_irq_exception`].
    pub fn enter_swi_exception(&mut self, return_addr: u32) -> u32 {
        let saved_cpsr = self.regs.cpsr();
        self.set_mode(Mode::SUPERVISOR);
        self.regs.spsr = saved_cpsr;
        self.regs.cpsr = self.regs.cpsr.with_irqs_disabled(true).with_thumb_state(false);
        self.regs.cur[14] = return_addr;
        let target = self.exception_base + 0x08;
        self.regs.cur[15] = target;
        target
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_enters_supervisor_with_irq_and_fiq_masked() {
        let cpu = Cpu::new();
        assert_eq!(cpu.regs.cpsr().mode(), Mode::SUPERVISOR);
        assert!(cpu.regs.cpsr().irqs_disabled());
        assert!(cpu.regs.cpsr().fiqs_disabled());
    }

    #[test]
    fn fiq_mode_switch_banks_r8_through_r12() {
        let mut cpu = Cpu::new();
        cpu.set_mode(Mode::USER);
        cpu.regs.cur[8] = 0xAAAA;
        cpu.set_mode(Mode::FIQ);
        cpu.regs.cur[8] = 0xBBBB;
        cpu.set_mode(Mode::USER);
        assert_eq!(cpu.regs.cur[8], 0xAAAA, "user-mode R8 restored unchanged");
        cpu.set_mode(Mode::FIQ);
        assert_eq!(cpu.regs.cur[8], 0xBBBB, "fiq-banked R8 restored unchanged");
    }

    #[test]
    fn irq_entry_saves_cpsr_and_masks_i() {
        let mut cpu = Cpu::new();
        cpu.set_mode(Mode::USER);
        cpu.regs.cur[15] = 0x1000;
        cpu.exception_base = 0;
        cpu.irq_line = true;
        let saved_cpsr = cpu.regs.cpsr();
        let target = cpu.enter_irq_exception();
        assert_eq!(target, 0x18);
        assert_eq!(cpu.regs.cpsr().mode(), Mode::IRQ);
        assert!(cpu.regs.cpsr().irqs_disabled());
        assert_eq!(cpu.regs.spsr, saved_cpsr);
        assert_eq!(cpu.regs.cur[14], 0x1000 - 4);
    }
}
