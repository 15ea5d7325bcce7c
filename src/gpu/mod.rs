//! Two-screen PPU scanline pipeline (spec §4.6, §4.6.1, §4.7) with a
//! decoupled render worker per screen. Register layout and the
//! H-draw/H-blank/vcount state machine are grounded on the teacher's
//! `gpu.rs`/`gpu/engine_2d.rs` (`DispStatus`, `PowerControl`, `BgControl`
//! bitfields carried over nearly verbatim); the worker/condvar handoff is
//! NOT in the teacher (`dust` renders synchronously inline) and is instead
//! grounded directly on spec §4.6.1 and §5's suspension-point description,
//! since the teacher has no decoupled-worker pattern to imitate here.

pub mod compositor;
mod worker;

use crate::dma::{DmaBus, DmaController, Timing as DmaTiming};
use crate::irqs::{IrqController, IrqSource};
use crate::scheduler::Scheduler;
use crate::vram::VramRouter;

use proc_bitfield::bitfield;
pub use worker::{DirtyRange, RenderWorker};

pub const SCREEN_WIDTH: usize = 256;
pub const SCREEN_HEIGHT: usize = 192;
const TOTAL_SCANLINES: u16 = 263;

/// ARM7-clock cycle counts from spec §4.7: H-draw lasts 1606 cycles, then
/// H-blank lasts 524 before the next H-draw begins.
const HDRAW_TO_HBLANK: u64 = 1606;
const HBLANK_TO_HDRAW: u64 = 524;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DispCnt(pub u32): Debug {
        pub bg_mode: u8 @ 0..=2,
        pub bg0_3d: bool @ 3,
        pub tile_obj_mapping_1d: bool @ 4,
        pub bitmap_obj_2d: bool @ 5,
        pub bitmap_obj_mapping_1d: bool @ 6,
        pub forced_blank: bool @ 7,
        pub bg0_enabled: bool @ 8,
        pub bg1_enabled: bool @ 9,
        pub bg2_enabled: bool @ 10,
        pub bg3_enabled: bool @ 11,
        pub obj_enabled: bool @ 12,
        pub win0_enabled: bool @ 13,
        pub win1_enabled: bool @ 14,
        pub obj_win_enabled: bool @ 15,
        pub display_mode: u8 @ 16..=17,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DispStatus(pub u16): Debug {
        pub vblank: bool @ 0,
        pub hblank: bool @ 1,
        pub vcount_match: bool @ 2,
        pub vblank_irq_enabled: bool @ 3,
        pub hblank_irq_enabled: bool @ 4,
        pub vcount_match_irq_enabled: bool @ 5,
        pub vcount_compare_high: u8 @ 7..=7,
        pub vcount_compare_low: u8 @ 8..=15,
    }
}

impl DispStatus {
    #[inline]
    pub const fn vcount_compare(self) -> u16 {
        self.0 >> 8 | (self.0 << 1 & 0x100)
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct BgControl(pub u16): Debug {
        pub priority: u8 @ 0..=1,
        pub char_base_block: u8 @ 2..=5,
        pub mosaic: bool @ 6,
        pub palette_256: bool @ 7,
        pub screen_base_block: u8 @ 8..=12,
        pub overflow_wraps: bool @ 13,
        pub screen_size: u8 @ 14..=15,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct BldCnt(pub u16): Debug {
        pub target1_mask: u8 @ 0..=5,
        pub mode: u8 @ 6..=7,
        pub target2_mask: u8 @ 8..=13,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct MasterBrightness(pub u16): Debug {
        pub factor: u8 @ 0..=4,
        pub mode: u8 @ 14..=15,
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BrightnessMode {
    None,
    Up,
    Down,
}

impl MasterBrightness {
    pub fn effective_mode(self) -> BrightnessMode {
        match self.mode() {
            1 => BrightnessMode::Up,
            2 => BrightnessMode::Down,
            _ => BrightnessMode::None,
        }
    }
}

/// Internal 15-bit BGR pixel with the transparency marker at bit 15 (spec
/// §3's Pixel data-model entry).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Pixel(pub u16);

impl Pixel {
    pub const TRANSPARENT: Pixel = Pixel(0x8000);

    #[inline]
    pub fn is_transparent(self) -> bool {
        self.0 & 0x8000 != 0
    }

    #[inline]
    pub fn opaque(r: u8, g: u8, b: u8) -> Self {
        Pixel((r as u16 & 0x1F) | ((g as u16 & 0x1F) << 5) | ((b as u16 & 0x1F) << 10))
    }

    #[inline]
    pub fn r(self) -> u8 {
        (self.0 & 0x1F) as u8
    }
    #[inline]
    pub fn g(self) -> u8 {
        ((self.0 >> 5) & 0x1F) as u8
    }
    #[inline]
    pub fn b(self) -> u8 {
        ((self.0 >> 10) & 0x1F) as u8
    }

    /// Applies master brightness (spec §4.6: Up blends toward white,
    /// Down toward black, by `factor/16`, factor saturated to 16) then
    /// expands 5-bit channels to 8-bit by `(c<<3)|(c>>2)` and force-sets the
    /// alpha byte, matching spec §4.6's output-expansion rule.
    pub fn to_bgra(self, brightness: MasterBrightness) -> u32 {
        let factor = brightness.factor().min(16) as u16;
        let (r, g, b) = match brightness.effective_mode() {
            BrightnessMode::Up => (
                self.r() as u16 + (((31 - self.r() as u16) * factor) >> 4),
                self.g() as u16 + (((31 - self.g() as u16) * factor) >> 4),
                self.b() as u16 + (((31 - self.b() as u16) * factor) >> 4),
            ),
            BrightnessMode::Down => (
                self.r() as u16 - ((self.r() as u16 * factor) >> 4),
                self.g() as u16 - ((self.g() as u16 * factor) >> 4),
                self.b() as u16 - ((self.b() as u16 * factor) >> 4),
            ),
            BrightnessMode::None => (self.r() as u16, self.g() as u16, self.b() as u16),
        };
        let expand = |c: u16| -> u32 { (((c as u8) << 3) | (c as u8 >> 2)) as u32 };
        0xFF00_0000 | (expand(b) << 16) | (expand(g) << 8) | expand(r)
    }
}

/// Per-scanline MMIO snapshot (spec §9: "preserve as a fixed-size array,
/// this is the handoff boundary, its size is load-bearing"). Cheap enough
/// to clone wholesale: a couple dozen registers.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmioSnapshot {
    pub disp_cnt: u32,
    pub bg_cnt: [u16; 4],
    pub bg_h_ofs: [u16; 4],
    pub bg_v_ofs: [u16; 4],
    pub bg_affine: [[i16; 4]; 2],
    pub bg_ref_point: [[i32; 2]; 2],
    pub win_h: [(u8, u8); 2],
    pub win_v: [(u8, u8); 2],
    pub win_in: u16,
    pub win_out: u16,
    pub bld_cnt: u16,
    pub bld_alpha: u16,
    pub bld_y: u8,
    pub master_brightness: u16,
    pub backdrop: u16,
    pub engine_b: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScanlineEvent {
    EndHDraw,
    EndHBlank,
}

/// One PPU's register file and dirty-tracking state; owns no VRAM/PRAM/OAM
/// bytes (those live in [`VramRouter`]/`System`'s PRAM+OAM arrays and are
/// shared between both screens).
pub struct Ppu {
    pub disp_cnt: DispCnt,
    pub bg_cnt: [BgControl; 4],
    pub bg_h_ofs: [u16; 4],
    pub bg_v_ofs: [u16; 4],
    pub bg_affine: [[i16; 4]; 2],
    pub bg_ref_point: [[i32; 2]; 2],
    pub win_h: [(u8, u8); 2],
    pub win_v: [(u8, u8); 2],
    pub win_in: u16,
    pub win_out: u16,
    pub bld_cnt: BldCnt,
    pub bld_alpha: u16,
    pub bld_y: u8,
    pub master_brightness: MasterBrightness,
    pub backdrop: u16,
    pub mmio_shadow: Box<[MmioSnapshot; 263]>,
    pub worker: RenderWorker,
    engine_b: bool,
}

impl Ppu {
    pub fn new(engine_b: bool) -> Self {
        Ppu {
            engine_b,
            disp_cnt: DispCnt(0),
            bg_cnt: [BgControl(0); 4],
            bg_h_ofs: [0; 4],
            bg_v_ofs: [0; 4],
            bg_affine: [[0; 4]; 2],
            bg_ref_point: [[0; 2]; 2],
            win_h: [(0, 0); 2],
            win_v: [(0, 0); 2],
            win_in: 0,
            win_out: 0,
            bld_cnt: BldCnt(0),
            bld_alpha: 0,
            bld_y: 0,
            master_brightness: MasterBrightness(0),
            backdrop: 0,
            mmio_shadow: Box::new([MmioSnapshot::default(); 263]),
            worker: RenderWorker::new(),
        }
    }

    fn snapshot(&self) -> MmioSnapshot {
        MmioSnapshot {
            disp_cnt: self.disp_cnt.0,
            bg_cnt: self.bg_cnt.map(|c| c.0),
            bg_h_ofs: self.bg_h_ofs,
            bg_v_ofs: self.bg_v_ofs,
            bg_affine: self.bg_affine,
            bg_ref_point: self.bg_ref_point,
            win_h: self.win_h,
            win_v: self.win_v,
            win_in: self.win_in,
            win_out: self.win_out,
            bld_cnt: self.bld_cnt.0,
            bld_alpha: self.bld_alpha,
            bld_y: self.bld_y,
            master_brightness: self.master_brightness.0,
            backdrop: self.backdrop,
            engine_b: self.engine_b,
        }
    }

    /// Snapshots MMIO for `vcount` into the shadow array (spec §4.6.1, first
    /// bullet: "on entering a scanline, the PPU snapshots its MMIO").
    fn snapshot_scanline(&mut self, vcount: u16) {
        self.mmio_shadow[vcount as usize] = self.snapshot();
    }
}

/// Shared scanline state machine driving both PPUs (spec §4.7: "shared for
/// both PPUs"). Generic over the host's unified scheduler event type, the
/// same way [`crate::timers::Timers`] is.
pub struct ScanlinePipeline<Event: Copy> {
    pub vcount: u16,
    make_event: fn(ScanlineEvent) -> Event,
}

impl<Event: Copy> ScanlinePipeline<Event> {
    pub fn new(make_event: fn(ScanlineEvent) -> Event) -> Self {
        ScanlinePipeline { vcount: 0, make_event }
    }

    /// Primes the first H-draw-to-H-blank event; call once at boot/reset.
    pub fn start(&self, scheduler: &mut Scheduler<Event>) {
        scheduler.add(HDRAW_TO_HBLANK, (self.make_event)(ScanlineEvent::EndHDraw));
    }

    /// H-draw ends: sets HBlank flags, fires the HBlank IRQ, renders the
    /// scanline's BG/OBJ state into each PPU's shadow snapshot, triggers
    /// ARM9 HBlank-timed DMA, and schedules the next transition.
    #[allow(clippy::too_many_arguments)]
    pub fn end_hdraw(
        &mut self,
        ppu_a: &mut Ppu,
        ppu_b: &mut Ppu,
        disp_stat: &mut [DispStatus; 2],
        irqs: &mut [&mut IrqController; 2],
        arm9_dma: &mut DmaController<true>,
        bus: &mut impl DmaBus,
        scheduler: &mut Scheduler<Event>,
    ) {
        for side in 0..2 {
            disp_stat[side] = disp_stat[side].with_hblank(true);
            if disp_stat[side].hblank_irq_enabled() {
                irqs[side].request(IrqSource::H_BLANK);
            }
        }
        ppu_a.snapshot_scanline(self.vcount);
        ppu_b.snapshot_scanline(self.vcount);

        if self.vcount < SCREEN_HEIGHT as u16 {
            arm9_dma.request(DmaTiming::HBlank, bus);
        }

        scheduler.add(HBLANK_TO_HDRAW, (self.make_event)(ScanlineEvent::EndHBlank));
    }

    /// H-blank ends: clears HBlank flags, advances `vcount` (wrapping at
    /// 263), recomputes VMatch, and on entering VBlank (vcount==192) fires
    /// the VBlank IRQ and triggers VBlank-timed DMA on both CPUs.
    #[allow(clippy::too_many_arguments)]
    pub fn end_hblank(
        &mut self,
        disp_stat: &mut [DispStatus; 2],
        vcount_compare: [u16; 2],
        irqs: &mut [&mut IrqController; 2],
        arm7_dma: &mut DmaController<false>,
        arm9_dma: &mut DmaController<true>,
        bus7: &mut impl DmaBus,
        bus9: &mut impl DmaBus,
        scheduler: &mut Scheduler<Event>,
    ) -> bool {
        for side in 0..2 {
            disp_stat[side] = disp_stat[side].with_hblank(false);
        }
        self.vcount = self.vcount.wrapping_add(1);
        if self.vcount == TOTAL_SCANLINES {
            self.vcount = 0;
        }

        for side in 0..2 {
            let matched = self.vcount == vcount_compare[side];
            disp_stat[side] = disp_stat[side].with_vcount_match(matched);
            if matched && disp_stat[side].vcount_match_irq_enabled() {
                irqs[side].request(IrqSource::V_MATCH);
            }
        }

        let mut entered_vblank = false;
        if self.vcount == SCREEN_HEIGHT as u16 {
            entered_vblank = true;
            for side in 0..2 {
                disp_stat[side] = disp_stat[side].with_vblank(true);
                if disp_stat[side].vblank_irq_enabled() {
                    irqs[side].request(IrqSource::V_BLANK);
                }
            }
            arm7_dma.request(DmaTiming::VBlank, bus7);
            arm9_dma.request(DmaTiming::VBlank, bus9);
        } else if self.vcount == 0 {
            for side in 0..2 {
                disp_stat[side] = disp_stat[side].with_vblank(false);
            }
        }

        scheduler.add(HDRAW_TO_HBLANK, (self.make_event)(ScanlineEvent::EndHDraw));
        entered_vblank
    }
}

/// Renders one PPU's scanline `vcount` synchronously from a VRAM/PRAM/OAM
/// snapshot plus its `MmioSnapshot`, matching spec §8's invariant that
/// worker output is byte-identical to a synchronous render of the same
/// submit-time state. Backs both the render worker and any inline/testing
/// fallback path.
pub fn render_scanline(
    snapshot: &MmioSnapshot,
    vram: &VramRouter,
    pram: &[u8],
    oam: &[u8],
    vcount: u32,
    out: &mut [u32; SCREEN_WIDTH],
) {
    compositor::render(snapshot, vram, pram, oam, vcount, out);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backdrop_with_master_brightness_up_is_solid_white() {
        let snapshot = MmioSnapshot {
            disp_cnt: DispCnt(0).with_forced_blank(false).0,
            master_brightness: MasterBrightness(0).with_mode(1).with_factor(16).0,
            backdrop: 0x0000,
            ..Default::default()
        };
        let vram = VramRouter::new();
        let pram = vec![0u8; 0x800];
        let oam = vec![0u8; 0x800];
        let mut out = [0u32; SCREEN_WIDTH];
        render_scanline(&snapshot, &vram, &pram, &oam, 0, &mut out);
        assert!(out.iter().all(|&px| px == 0xFFFF_FFFF));
    }

    #[test]
    fn scanline_pipeline_advances_vcount_and_wraps() {
        fn ev(e: ScanlineEvent) -> ScanlineEvent {
            e
        }
        let mut pipeline: ScanlinePipeline<ScanlineEvent> = ScanlinePipeline::new(ev);
        let mut scheduler: Scheduler<ScanlineEvent> = Scheduler::new();
        let mut disp_stat = [DispStatus(0), DispStatus(0)];
        let mut arm7_irqs = IrqController::new();
        let mut arm9_irqs = IrqController::new();
        let mut arm7_dma: DmaController<false> = DmaController::new();
        let mut arm9_dma: DmaController<true> = DmaController::new();

        struct NoopBus;
        impl DmaBus for NoopBus {
            fn dma_read_16(&mut self, _: u32) -> u16 {
                0
            }
            fn dma_write_16(&mut self, _: u32, _: u16) {}
            fn dma_read_32(&mut self, _: u32) -> u32 {
                0
            }
            fn dma_write_32(&mut self, _: u32, _: u32) {}
        }
        let mut bus7 = NoopBus;
        let mut bus9 = NoopBus;

        for _ in 0..263 {
            let entered_vblank = pipeline.end_hblank(
                &mut disp_stat,
                [0, 0],
                &mut [&mut arm7_irqs, &mut arm9_irqs],
                &mut arm7_dma,
                &mut arm9_dma,
                &mut bus7,
                &mut bus9,
                &mut scheduler,
            );
            if pipeline.vcount == SCREEN_HEIGHT as u16 {
                assert!(entered_vblank);
            }
        }
        assert_eq!(pipeline.vcount, 0);
    }
}
