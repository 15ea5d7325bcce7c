//! Memory Bus (spec §4.4): per-CPU address decoder over shared RAM, private
//! WRAM, ARM9 TCMs, the VRAM router, PRAM/OAM, IO registers, and cartridge
//! space. Grounded on the teacher's `cpu/bus/{arm7,arm9}.rs` top-byte decode
//! switch, generalized so a single generic `Bus` serves both cores (the
//! teacher duplicates the switch per CPU; this crate parameterizes on
//! `const ARM9: bool` the way [`crate::dma::DmaController`] already does).

use crate::cp15::Cp15;
use crate::dma::DmaBus;
use crate::interpreter::Bus as CpuBus;
use crate::vram::{Region, VramRouter};

/// Notifies the owning PPU that a PRAM/OAM/VRAM range it might be caching in
/// its render-worker shadow was just written through the bus. The render
/// worker protocol (spec §4.6.1) only needs to know a range become dirty,
/// not its contents; `System` wires this into each PPU's dirty tracker.
pub trait DirtyObserver {
    fn mark_dirty(&mut self, start: u32, len: u32);
}

pub struct NullDirtyObserver;

impl DirtyObserver for NullDirtyObserver {
    fn mark_dirty(&mut self, _start: u32, _len: u32) {}
}

/// Backing storage and routing a [`Bus`] needs access to. `System` owns one
/// of these per CPU (ARM7's has no TCMs/CP15; ARM9's does).
pub struct BusState<'a> {
    pub ewram: &'a mut [u8],
    pub iwram: &'a mut [u8],
    pub swram: &'a mut [u8],
    /// ARM9-private: DTCM/ITCM backing and the CP15 that windows them.
    pub dtcm: Option<&'a mut [u8]>,
    pub itcm: Option<&'a mut [u8]>,
    pub cp15: Option<&'a mut Cp15>,
    pub vram: &'a mut VramRouter,
    pub pram: &'a mut [u8],
    pub oam: &'a mut [u8],
    pub pram_dirty: &'a mut dyn DirtyObserver,
    pub oam_dirty: &'a mut dyn DirtyObserver,
}

/// IO register access, dispatched by `address >> 2` per spec §4.4. `System`
/// implements this over the whole device set; tests implement it over a
/// flat array.
pub trait IoRegisters {
    fn io_read(&mut self, addr: u32, width: u32) -> u32;
    fn io_write(&mut self, addr: u32, width: u32, value: u32);
}

/// Address decoder for one CPU. `const ARM9` selects the TCM short-circuit
/// and PRAM/OAM-vs-VRAM layout differences (ARM7 sees SWRAM where ARM9 sees
/// TCM, and has no direct VRAM-as-work-RAM window).
pub struct Bus<'a, Io: IoRegisters> {
    pub state: BusState<'a>,
    pub io: &'a mut Io,
}

const EWRAM_BASE: u32 = 0x0200_0000;
const EWRAM_SIZE: u32 = 0x40_0000;
const IWRAM_BASE: u32 = 0x0300_0000;
const IO_BASE: u32 = 0x0400_0000;
const PAL_BASE: u32 = 0x0500_0000;
const VRAM_BASE: u32 = 0x0600_0000;
const OAM_BASE: u32 = 0x0700_0000;

impl<'a, Io: IoRegisters> Bus<'a, Io> {
    fn tcm_hit(&self, addr: u32) -> Option<&'static str> {
        let cp15 = self.state.cp15.as_deref()?;
        if cp15.itcm_hit(addr) {
            Some("itcm")
        } else if cp15.dtcm_hit(addr) {
            Some("dtcm")
        } else {
            None
        }
    }

    /// Reads `width` bytes (1/2/4) at `addr`, width-aligned per spec §4.4.
    pub fn read(&mut self, addr: u32, width: u32) -> u32 {
        let addr = addr & !(width - 1);
        if let Some(which) = self.tcm_hit(addr) {
            let tcm = if which == "itcm" {
                self.state.itcm.as_deref().unwrap()
            } else {
                self.state.dtcm.as_deref().unwrap()
            };
            return read_slice(tcm, addr & 0x007F_FFFF, width);
        }

        match addr >> 24 {
            0x02 => read_slice(self.state.ewram, (addr - EWRAM_BASE) & (EWRAM_SIZE - 1), width),
            0x03 => read_slice(self.state.iwram, (addr - IWRAM_BASE) & (self.state.iwram.len() as u32 - 1), width),
            0x04 => self.io.io_read(addr - IO_BASE, width),
            0x05 => {
                let offset = (addr - PAL_BASE) & 0x7FF;
                read_slice(self.state.pram, offset, width)
            }
            0x06 => self.read_vram(addr - VRAM_BASE, width),
            0x07 => {
                let offset = (addr - OAM_BASE) & 0x7FF;
                read_slice(self.state.oam, offset, width)
            }
            _ => 0,
        }
    }

    pub fn write(&mut self, addr: u32, width: u32, value: u32) {
        let addr = addr & !(width - 1);
        if let Some(which) = self.tcm_hit(addr) {
            let tcm = if which == "itcm" {
                self.state.itcm.as_deref_mut().unwrap()
            } else {
                self.state.dtcm.as_deref_mut().unwrap()
            };
            write_slice(tcm, addr & 0x007F_FFFF, width, value);
            return;
        }

        match addr >> 24 {
            0x02 => write_slice(self.state.ewram, (addr - EWRAM_BASE) & (EWRAM_SIZE - 1), width, value),
            0x03 => {
                let mask = self.state.iwram.len() as u32 - 1;
                write_slice(self.state.iwram, (addr - IWRAM_BASE) & mask, width, value);
            }
            0x04 => self.io.io_write(addr - IO_BASE, width, value),
            0x05 => {
                let offset = (addr - PAL_BASE) & 0x7FF;
                write_slice(self.state.pram, offset, width, value);
                self.state.pram_dirty.mark_dirty(offset, width);
            }
            0x06 => self.write_vram(addr - VRAM_BASE, width, value),
            0x07 => {
                let offset = (addr - OAM_BASE) & 0x7FF;
                write_slice(self.state.oam, offset, width, value);
                self.state.oam_dirty.mark_dirty(offset, width);
            }
            _ => {}
        }
    }

    /// Maps the flat `0x0600_0000`-relative VRAM address space onto the
    /// router's logical regions. The LCDC region covers the whole 656 KiB
    /// span when no bank claims a sub-range elsewhere; PPU BG/OBJ/ext-
    /// palette windows sit at the offsets the hardware documents them at.
    fn region_for(addr: u32) -> (Region, u32) {
        match addr {
            0x00_0000..=0x07_FFFF => (Region::PpuABg, addr),
            0x08_0000..=0x09_FFFF => (Region::PpuBBg, addr - 0x08_0000),
            0x0A_0000..=0x0D_FFFF => (Region::PpuAObj, addr - 0x0A_0000),
            0x0E_0000..=0x0F_FFFF => (Region::PpuBObj, addr - 0x0E_0000),
            _ => (Region::Lcdc, addr & 0x000F_FFFF),
        }
    }

    fn read_vram(&self, addr: u32, width: u32) -> u32 {
        let (region, offset) = Self::region_for(addr);
        self.state.vram.read(region, offset, width as usize)
    }

    fn write_vram(&mut self, addr: u32, width: u32, value: u32) {
        let (region, offset) = Self::region_for(addr);
        self.state.vram.write(region, offset, width as usize, value);
    }
}

fn read_slice(mem: &[u8], offset: u32, width: u32) -> u32 {
    let i = offset as usize;
    match width {
        1 => mem[i] as u32,
        2 => u16::from_le_bytes([mem[i], mem[i + 1]]) as u32,
        4 => u32::from_le_bytes(mem[i..i + 4].try_into().unwrap()),
        _ => unreachable!("width must be 1, 2, or 4"),
    }
}

fn write_slice(mem: &mut [u8], offset: u32, width: u32, value: u32) {
    let i = offset as usize;
    match width {
        1 => mem[i] = value as u8,
        2 => mem[i..i + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        4 => mem[i..i + 4].copy_from_slice(&value.to_le_bytes()),
        _ => unreachable!("width must be 1, 2, or 4"),
    }
}

impl<'a, Io: IoRegisters> CpuBus for Bus<'a, Io> {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read(addr, 1) as u8
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.read(addr, 2) as u16
    }
    fn read32(&mut self, addr: u32) -> u32 {
        self.read(addr, 4)
    }
    fn write8(&mut self, addr: u32, value: u8) {
        self.write(addr, 1, value as u32);
    }
    fn write16(&mut self, addr: u32, value: u16) {
        self.write(addr, 2, value as u32);
    }
    fn write32(&mut self, addr: u32, value: u32) {
        self.write(addr, 4, value);
    }

    fn coprocessor_read(&mut self, cp_num: u8, cn: u8, cm: u8, opc2: u8) -> u32 {
        if cp_num == 15 {
            self.state.cp15.as_deref().map_or(0, |cp15| cp15.mrc(cn, cm, opc2))
        } else {
            0
        }
    }

    fn coprocessor_write(&mut self, cp_num: u8, cn: u8, cm: u8, opc2: u8, value: u32) {
        if cp_num == 15 {
            if let Some(cp15) = self.state.cp15.as_deref_mut() {
                cp15.mcr(cn, cm, opc2, value);
            }
        }
    }
}

impl<'a, Io: IoRegisters> DmaBus for Bus<'a, Io> {
    fn dma_read_16(&mut self, addr: u32) -> u16 {
        self.read(addr, 2) as u16
    }
    fn dma_write_16(&mut self, addr: u32, value: u16) {
        self.write(addr, 2, value as u32);
    }
    fn dma_read_32(&mut self, addr: u32) -> u32 {
        self.read(addr, 4)
    }
    fn dma_write_32(&mut self, addr: u32, value: u32) {
        self.write(addr, 4, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatIo {
        regs: Vec<u8>,
    }

    impl IoRegisters for FlatIo {
        fn io_read(&mut self, addr: u32, width: u32) -> u32 {
            read_slice(&self.regs, addr & 0xFFFF, width)
        }
        fn io_write(&mut self, addr: u32, width: u32, value: u32) {
            write_slice(&mut self.regs, addr & 0xFFFF, width, value);
        }
    }

    fn bus_fixture<'a>(
        ewram: &'a mut [u8],
        iwram: &'a mut [u8],
        swram: &'a mut [u8],
        vram: &'a mut VramRouter,
        pram: &'a mut [u8],
        oam: &'a mut [u8],
        pram_dirty: &'a mut NullDirtyObserver,
        oam_dirty: &'a mut NullDirtyObserver,
        io: &'a mut FlatIo,
    ) -> Bus<'a, FlatIo> {
        Bus {
            state: BusState {
                ewram,
                iwram,
                swram,
                dtcm: None,
                itcm: None,
                cp15: None,
                vram,
                pram,
                oam,
                pram_dirty,
                oam_dirty,
            },
            io,
        }
    }

    #[test]
    fn ewram_round_trips_word_access() {
        let mut ewram = vec![0u8; EWRAM_SIZE as usize];
        let mut iwram = vec![0u8; 0x10000];
        let mut swram = vec![0u8; 0x8000];
        let mut vram = VramRouter::new();
        let mut pram = vec![0u8; 0x800];
        let mut oam = vec![0u8; 0x800];
        let mut pram_dirty = NullDirtyObserver;
        let mut oam_dirty = NullDirtyObserver;
        let mut io = FlatIo { regs: vec![0u8; 0x10000] };
        let mut bus = bus_fixture(
            &mut ewram, &mut iwram, &mut swram, &mut vram, &mut pram, &mut oam, &mut pram_dirty, &mut oam_dirty, &mut io,
        );
        bus.write(EWRAM_BASE + 4, 4, 0xCAFE_BABE);
        assert_eq!(bus.read(EWRAM_BASE + 4, 4), 0xCAFE_BABE);
    }

    #[test]
    fn pram_write_marks_dirty_range() {
        struct Counting(u32);
        impl DirtyObserver for Counting {
            fn mark_dirty(&mut self, _start: u32, len: u32) {
                self.0 += len;
            }
        }
        let mut ewram = vec![0u8; 0x10];
        let mut iwram = vec![0u8; 0x10000];
        let mut swram = vec![0u8; 0x8000];
        let mut vram = VramRouter::new();
        let mut pram = vec![0u8; 0x800];
        let mut oam = vec![0u8; 0x800];
        let mut pram_dirty = Counting(0);
        let mut oam_dirty = NullDirtyObserver;
        let mut io = FlatIo { regs: vec![0u8; 0x10000] };
        let mut bus = Bus {
            state: BusState {
                ewram: &mut ewram,
                iwram: &mut iwram,
                swram: &mut swram,
                dtcm: None,
                itcm: None,
                cp15: None,
                vram: &mut vram,
                pram: &mut pram,
                oam: &mut oam,
                pram_dirty: &mut pram_dirty,
                oam_dirty: &mut oam_dirty,
            },
            io: &mut io,
        };
        bus.write(PAL_BASE, 2, 0x1234);
        assert_eq!(pram_dirty.0, 2);
    }

    #[test]
    fn unmapped_region_reads_zero() {
        let mut ewram = vec![0u8; 0x10];
        let mut iwram = vec![0u8; 0x10000];
        let mut swram = vec![0u8; 0x8000];
        let mut vram = VramRouter::new();
        let mut pram = vec![0u8; 0x800];
        let mut oam = vec![0u8; 0x800];
        let mut pram_dirty = NullDirtyObserver;
        let mut oam_dirty = NullDirtyObserver;
        let mut io = FlatIo { regs: vec![0u8; 0x10000] };
        let mut bus = bus_fixture(
            &mut ewram, &mut iwram, &mut swram, &mut vram, &mut pram, &mut oam, &mut pram_dirty, &mut oam_dirty, &mut io,
        );
        assert_eq!(bus.read(0x0800_0000, 4), 0);
    }
}
