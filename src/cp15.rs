//! ARM9's CP15 system coprocessor (spec §4.3). Grounded on the teacher's
//! `cpu/arm9/cp15.rs` `Control`/`TcmControl` bitfields, stripped of the
//! cache-timing and MMU permission-map machinery the teacher carries for its
//! interpreter's memory-access fast path (outside this core's scope): only
//! TCM windowing, the alternate vector bit, and the coprocessor register
//! contract spec'd in §4.2/§4.3 are implemented.

use proc_bitfield::bitfield;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Control(pub u32): Debug {
        pub pu_enabled: bool @ 0,
        pub data_cache_enabled: bool @ 2,
        pub big_endian: bool @ 7,
        pub code_cache_enabled: bool @ 12,
        pub high_exc_vectors: bool @ 13,
        pub t_bit_load_disabled: bool @ 15,
        pub dtcm_enabled: bool @ 16,
        pub dtcm_load_mode: bool @ 17,
        pub itcm_enabled: bool @ 18,
        pub itcm_load_mode: bool @ 19,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct TcmControl(pub u32): Debug {
        pub size_shift: u8 @ 1..=5,
        pub raw_base_addr: u32 @ 12..=31,
    }
}

impl TcmControl {
    #[inline]
    pub fn base_addr(self) -> u32 {
        self.0 & 0xFFFF_F000
    }

    #[inline]
    pub fn size(self) -> u64 {
        0x200 << self.size_shift()
    }

    #[inline]
    pub fn bounds(self) -> (u32, u32) {
        let base = self.base_addr();
        (base, (base as u64 + self.size() - 1) as u32)
    }
}

pub const MAIN_ID: u32 = 0x4105_9461;
pub const RESET_EXCEPTION_BASE: u32 = 0x0000_0000;
pub const HIGH_EXCEPTION_BASE: u32 = 0xFFFF_0000;

pub struct Cp15 {
    control: Control,
    dtcm_control: TcmControl,
    itcm_control: TcmControl,
    wait_for_irq: bool,
}

impl Default for Cp15 {
    fn default() -> Self {
        Cp15 {
            control: Control(0x0000_2078),
            dtcm_control: TcmControl(0),
            itcm_control: TcmControl(0),
            wait_for_irq: false,
        }
    }
}

impl Cp15 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> Control {
        self.control
    }

    pub fn dtcm_control(&self) -> TcmControl {
        self.dtcm_control
    }

    pub fn itcm_control(&self) -> TcmControl {
        self.itcm_control
    }

    /// The exception base the ARM core should use for entry vectors, per
    /// `Control.high_exc_vectors`.
    pub fn exception_base(&self) -> u32 {
        if self.control.high_exc_vectors() {
            HIGH_EXCEPTION_BASE
        } else {
            RESET_EXCEPTION_BASE
        }
    }

    /// Whether `addr` falls in the DTCM window and DTCM currently services
    /// reads (data accesses always hit DTCM when enabled and in-window; the
    /// load-mode bit only gates whether reads also hit, per spec §4.3).
    pub fn dtcm_hit(&self, addr: u32) -> bool {
        if !self.control.dtcm_enabled() {
            return false;
        }
        let (lo, hi) = self.dtcm_control.bounds();
        addr >= lo && addr <= hi
    }

    pub fn itcm_hit(&self, addr: u32) -> bool {
        if !self.control.itcm_enabled() {
            return false;
        }
        let (lo, hi) = self.itcm_control.bounds();
        addr >= lo && addr <= hi
    }

    pub fn take_wait_for_irq(&mut self) -> bool {
        std::mem::take(&mut self.wait_for_irq)
    }

    /// `mrc(opc1, cn, cm, opc2)`: unknown register reads as 0, per spec
    /// §4.2's "unknown coprocessor number reads as 0".
    pub fn mrc(&self, cn: u8, cm: u8, opc2: u8) -> u32 {
        match (cn, cm, opc2) {
            (0, 0, 0) => MAIN_ID,
            (1, 0, 0) => self.control.0,
            (9, 1, 0) => self.dtcm_control.0,
            (9, 1, 1) => self.itcm_control.0,
            _ => 0,
        }
    }

    /// `mcr(opc1, cn, cm, opc2, value)`.
    pub fn mcr(&mut self, cn: u8, cm: u8, opc2: u8, value: u32) {
        match (cn, cm, opc2) {
            (1, 0, 0) => self.control = Control(value),
            (9, 1, 0) => self.dtcm_control = TcmControl(value),
            (9, 1, 1) => self.itcm_control = TcmControl(value),
            (7, 0, 4) | (7, 8, 2) => self.wait_for_irq = true,
            _ => {}
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_id_is_fixed() {
        let cp15 = Cp15::new();
        assert_eq!(cp15.mrc(0, 0, 0), MAIN_ID);
    }

    #[test]
    fn unknown_coprocessor_register_reads_zero() {
        let cp15 = Cp15::new();
        assert_eq!(cp15.mrc(15, 15, 7), 0);
    }

    #[test]
    fn high_exc_vectors_relocates_exception_base() {
        let mut cp15 = Cp15::new();
        assert_eq!(cp15.exception_base(), RESET_EXCEPTION_BASE);
        cp15.mcr(1, 0, 0, cp15.control().with_high_exc_vectors(true).0);
        assert_eq!(cp15.exception_base(), HIGH_EXCEPTION_BASE);
    }

    #[test]
    fn dtcm_window_respects_enable_bit() {
        let mut cp15 = Cp15::new();
        let control = TcmControl(0).with_raw_base_addr(0x0080_0000 >> 12).with_size_shift(5);
        cp15.mcr(9, 1, 0, control.0);
        assert!(!cp15.dtcm_hit(0x0080_0000), "dtcm disabled by default");
        cp15.mcr(1, 0, 0, cp15.control().with_dtcm_enabled(true).0);
        assert!(cp15.dtcm_hit(0x0080_0000));
    }

    #[test]
    fn wait_for_irq_trigger_sets_and_consumes_flag() {
        let mut cp15 = Cp15::new();
        cp15.mcr(7, 0, 4, 0);
        assert!(cp15.take_wait_for_irq());
        assert!(!cp15.take_wait_for_irq());
    }
}
