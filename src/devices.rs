//! Capability contracts for peripherals this core treats as external
//! collaborators rather than owning outright (spec §9's "tagged polymorphic
//! devices" redesign: RTC, SPI/touchscreen/firmware, backup storage, the
//! cartridge key1 scrambler, 3D geometry/rasterization). Each gets a small
//! trait plus a trivial no-op default, grounded on the teacher's
//! `spi::Controller`/`ds_slot::rom` split between bus-facing registers and
//! the device behind them.

use bitflags::bitflags;
use proc_bitfield::bitfield;

bitflags! {
    /// The 12 physical buttons (spec §6's `SetKeyState`), named after the
    /// teacher's `emu::input::Keys`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Key: u32 {
        const A = 1 << 0;
        const B = 1 << 1;
        const SELECT = 1 << 2;
        const START = 1 << 3;
        const RIGHT = 1 << 4;
        const LEFT = 1 << 5;
        const UP = 1 << 6;
        const DOWN = 1 << 7;
        const R = 1 << 8;
        const L = 1 << 9;
        const X = 1 << 10;
        const Y = 1 << 11;
    }
}

bitfield! {
    /// `KEYINPUT`: active-low, bit set means the key is released.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct KeyInput(pub u16): Debug {
        pub a: bool @ 0,
        pub b: bool @ 1,
        pub select: bool @ 2,
        pub start: bool @ 3,
        pub right: bool @ 4,
        pub left: bool @ 5,
        pub up: bool @ 6,
        pub down: bool @ 7,
        pub r: bool @ 8,
        pub l: bool @ 9,
    }
}

bitfield! {
    /// `EXTKEYIN`: X/Y plus the debug/lid bits the ARM7 alone can see; only
    /// X/Y are wired to `SetKeyState` per spec §6.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ExtKeyInput(pub u16): Debug {
        pub x: bool @ 0,
        pub y: bool @ 1,
        pub pen_down: bool @ 6,
        pub lid_closed: bool @ 7,
    }
}

/// Tracks pressed/released state for all 12 keys and renders it into the
/// active-low `KEYINPUT`/`EXTKEYIN` register views the bus reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Keypad {
    pressed: Key,
    pen_down: bool,
    lid_closed: bool,
}

impl Keypad {
    pub fn new() -> Self {
        Keypad::default()
    }

    pub fn set_key(&mut self, key: Key, down: bool) {
        self.pressed.set(key, down);
    }

    pub fn set_pen_down(&mut self, down: bool) {
        self.pen_down = down;
    }

    pub fn set_lid_closed(&mut self, closed: bool) {
        self.lid_closed = closed;
    }

    pub fn key_input(&self) -> KeyInput {
        let p = self.pressed;
        KeyInput(0)
            .with_a(!p.contains(Key::A))
            .with_b(!p.contains(Key::B))
            .with_select(!p.contains(Key::SELECT))
            .with_start(!p.contains(Key::START))
            .with_right(!p.contains(Key::RIGHT))
            .with_left(!p.contains(Key::LEFT))
            .with_up(!p.contains(Key::UP))
            .with_down(!p.contains(Key::DOWN))
            .with_r(!p.contains(Key::R))
            .with_l(!p.contains(Key::L))
    }

    pub fn ext_key_input(&self) -> ExtKeyInput {
        let p = self.pressed;
        ExtKeyInput(0)
            .with_x(!p.contains(Key::X))
            .with_y(!p.contains(Key::Y))
            .with_pen_down(!self.pen_down)
            .with_lid_closed(self.lid_closed)
    }
}

/// The touchscreen/firmware/power-management chip-select bus (spec §1: SPI
/// is an external collaborator, only its transfer contract is modeled).
pub trait SpiDevice {
    fn select(&mut self);
    fn deselect(&mut self);
    fn transfer_byte(&mut self, value: u8) -> u8;
}

/// A device that never responds; used where no real peripheral is wired in.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSpiDevice;

impl SpiDevice for NoopSpiDevice {
    fn select(&mut self) {}
    fn deselect(&mut self) {}
    fn transfer_byte(&mut self, _value: u8) -> u8 {
        0xFF
    }
}

/// The cartridge ROM the DS slot reads from; backed by a caller-owned byte
/// buffer, so this core never touches the filesystem (spec's Non-goals).
pub trait Rom {
    fn size(&self) -> usize;
    fn read(&self, offset: usize, out: &mut [u8]);
}

impl Rom for [u8] {
    fn size(&self) -> usize {
        self.len()
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.get(offset + i).copied().unwrap_or(0xFF);
        }
    }
}

/// The real-time clock, RTC backup battery, and cartridge-slot coprocessors
/// CP14/CP15 beyond the core's own simplified CP15 (spec §1/§9).
pub trait Coprocessor {
    fn reset(&mut self);
    fn mrc(&mut self, cn: u8, cm: u8, opc2: u8) -> u32;
    fn mcr(&mut self, cn: u8, cm: u8, opc2: u8, value: u32);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCoprocessor;

impl Coprocessor for NoopCoprocessor {
    fn reset(&mut self) {}
    fn mrc(&mut self, _cn: u8, _cm: u8, _opc2: u8) -> u32 {
        0
    }
    fn mcr(&mut self, _cn: u8, _cm: u8, _opc2: u8, _value: u32) {}
}

/// The 3D geometry/rasterization pipeline (spec's Non-goals: only the
/// submit contract is modeled, not its internals). `submit_scanline` is
/// called once per visible scanline with the polygon RAM the GX FIFO has
/// accumulated so far; a real implementation renders into its own buffer
/// and the PPU's BG0-in-3D-mode layer samples it, which this core does not
/// yet do (see `DESIGN.md`).
pub trait Renderer3d {
    fn submit_scanline(&mut self, vcount: u16);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRenderer3d;

impl Renderer3d for NoopRenderer3d {
    fn submit_scanline(&mut self, _vcount: u16) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_input_is_active_low() {
        let mut pad = Keypad::new();
        assert_eq!(pad.key_input().0, 0x03FF);
        pad.set_key(Key::A, true);
        assert_eq!(pad.key_input().a(), false);
        assert_eq!(pad.key_input().0, 0x03FE);
    }

    #[test]
    fn ext_key_input_tracks_x_y_and_pen() {
        let mut pad = Keypad::new();
        assert_eq!(pad.ext_key_input().0 & 0x3, 0x3);
        pad.set_key(Key::X, true);
        pad.set_pen_down(true);
        let ext = pad.ext_key_input();
        assert!(!ext.x());
        assert!(!ext.pen_down());
    }

    #[test]
    fn noop_spi_reads_as_0xff() {
        let mut spi = NoopSpiDevice;
        spi.select();
        assert_eq!(spi.transfer_byte(0x00), 0xFF);
        spi.deselect();
    }
}
