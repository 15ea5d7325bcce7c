//! Render worker (spec §4.6.1 / §5): one background thread per screen.
//! The teacher renders scanlines synchronously inline on the emulation
//! thread, so this has no direct teacher counterpart; grounded instead on
//! spec §5's literal description ("Worker -> emu signaling uses a condition
//! variable keyed on `ready: bool`... emu -> worker signaling uses atomic
//! `vcount_max` increments and a `notify_one`").

use std::sync::atomic::{AtomicU16, AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::{render_scanline, MmioSnapshot, SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::vram::VramRouter;

/// A contiguous byte range that changed since the worker last copied it.
/// `None` means nothing dirty. Ranges only ever grow between drains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyRange {
    start: usize,
    end: usize,
}

impl DirtyRange {
    pub fn mark(&mut self, offset: usize, len: usize) {
        let end = offset + len;
        if self.start == self.end {
            self.start = offset;
            self.end = end;
        } else {
            self.start = self.start.min(offset);
            self.end = self.end.max(end);
        }
    }

    pub fn take(&mut self) -> Option<(usize, usize)> {
        if self.start == self.end {
            None
        } else {
            let r = (self.start, self.end);
            self.start = 0;
            self.end = 0;
            Some(r)
        }
    }
}

/// A frame's worth of input the worker needs to render all 192 visible
/// scanlines without touching the live emulation-thread buffers: a full
/// copy of VRAM/PRAM/OAM taken at vcount==0 plus the per-scanline MMIO
/// shadow array.
struct FrameJob {
    mmio: Box<[MmioSnapshot; 263]>,
    vram: VramRouter,
    pram: Vec<u8>,
    oam: Vec<u8>,
}

struct Shared {
    job: Mutex<Option<FrameJob>>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
    running: AtomicBool,
    /// Scanlines the worker has completed rendering for the in-flight job;
    /// the emulation thread's `wait_for_render_worker` spins on this.
    worker_vcount: AtomicU16,
    framebuffer: Mutex<[u32; SCREEN_WIDTH * SCREEN_HEIGHT]>,
}

/// One screen's decoupled renderer. `System` owns two (PPU A, PPU B).
pub struct RenderWorker {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl RenderWorker {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            job: Mutex::new(None),
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
            running: AtomicBool::new(true),
            worker_vcount: AtomicU16::new(0),
            framebuffer: Mutex::new([0u32; SCREEN_WIDTH * SCREEN_HEIGHT]),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("nds-core-ppu-worker".into())
            .spawn(move || Self::run(worker_shared))
            .expect("failed to spawn render worker thread");
        RenderWorker {
            shared,
            handle: Some(handle),
        }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let mut ready = shared.ready.lock().unwrap();
            while !*ready && shared.running.load(Ordering::Acquire) {
                ready = shared.ready_cv.wait(ready).unwrap();
            }
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            *ready = false;
            drop(ready);

            let job = shared.job.lock().unwrap().take();
            let Some(job) = job else { continue };
            let mut fb = shared.framebuffer.lock().unwrap();
            for vcount in 0..SCREEN_HEIGHT {
                let mut line = [0u32; SCREEN_WIDTH];
                render_scanline(&job.mmio[vcount], &job.vram, &job.pram, &job.oam, vcount as u32, &mut line);
                fb[vcount * SCREEN_WIDTH..(vcount + 1) * SCREEN_WIDTH].copy_from_slice(&line);
                shared.worker_vcount.store(vcount as u16 + 1, Ordering::Release);
            }
        }
    }

    /// Submits a frame for rendering (called at vcount==0 per spec §4.6.1).
    /// `vram`/`pram`/`oam` are full copies taken at that moment; `System`
    /// clones its single live `VramRouter` rather than tracking per-byte
    /// dirty ranges across it, trading a per-frame copy for the simpler
    /// ownership story (see `DESIGN.md`).
    pub fn submit(&self, mmio: Box<[MmioSnapshot; 263]>, vram: VramRouter, pram: Vec<u8>, oam: Vec<u8>) {
        *self.shared.job.lock().unwrap() = Some(FrameJob { mmio, vram, pram, oam });
        self.shared.worker_vcount.store(0, Ordering::Release);
        *self.shared.ready.lock().unwrap() = true;
        self.shared.ready_cv.notify_one();
    }

    /// Spin-waits until the worker has rendered past `vcount` (spec §5's
    /// `wait_for_render_worker`), used on the rare mid-frame MMIO write path
    /// that must synchronously update a shadow the worker might still read.
    pub fn wait_for_scanline(&self, vcount: u16) {
        while self.shared.worker_vcount.load(Ordering::Acquire) <= vcount {
            std::hint::spin_loop();
        }
    }

    pub fn framebuffer(&self) -> [u32; SCREEN_WIDTH * SCREEN_HEIGHT] {
        *self.shared.framebuffer.lock().unwrap()
    }
}

impl Drop for RenderWorker {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        *self.shared.ready.lock().unwrap() = true;
        self.shared.ready_cv.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_renders_and_framebuffer_becomes_available() {
        let worker = RenderWorker::new();
        let mmio = Box::new([MmioSnapshot::default(); 263]);
        worker.submit(mmio, VramRouter::new(), vec![0u8; 0x800], vec![0u8; 0x800]);
        worker.wait_for_scanline((SCREEN_HEIGHT - 1) as u16);
        let fb = worker.framebuffer();
        assert_eq!(fb.len(), SCREEN_WIDTH * SCREEN_HEIGHT);
    }

    #[test]
    fn dirty_range_merges_overlapping_marks() {
        let mut dirty = DirtyRange::default();
        dirty.mark(10, 5);
        dirty.mark(20, 5);
        assert_eq!(dirty.take(), Some((10, 25)));
        assert_eq!(dirty.take(), None);
    }
}
