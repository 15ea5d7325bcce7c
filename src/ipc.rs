//! Inter-CPU `SYNC`/FIFO block (spec §4.9). Adapted from the teacher's
//! `ipc.rs`: two symmetric halves, each owning a send FIFO the other side
//! drains, onto this crate's own [`Fifo`] and [`IrqController`] rather than
//! the teacher's `arm7::Irqs`/`arm9::Irqs` wrappers.

use crate::fifo::Fifo;
use crate::irqs::{IrqController, IrqSource};

use proc_bitfield::bitfield;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Sync(pub u16): Debug {
        pub recv: u8 @ 0..=3,
        pub send: u8 @ 8..=11,
        pub send_irq: bool @ 13,
        pub irq_enabled: bool @ 14,
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FifoControl(pub u16): Debug {
        pub send_fifo_empty: bool @ 0,
        pub send_fifo_full: bool @ 1,
        pub send_fifo_empty_irq_enabled: bool @ 2,
        pub clear_send_fifo: bool @ 3,
        pub recv_fifo_empty: bool @ 8,
        pub recv_fifo_full: bool @ 9,
        pub recv_fifo_not_empty_irq_enabled: bool @ 10,
        pub error: bool @ 14,
        pub fifos_enabled: bool @ 15,
    }
}

struct Side {
    sync: Sync,
    fifo_control: FifoControl,
    send_fifo: Fifo<u32, 16>,
    last_word_received: u32,
}

impl Default for Side {
    fn default() -> Self {
        Side {
            sync: Sync(0),
            fifo_control: FifoControl(0x0101),
            send_fifo: Fifo::new(),
            last_word_received: 0,
        }
    }
}

/// Which CPU is issuing the call; used only to pick the side each method
/// acts as.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cpu {
    Arm7,
    Arm9,
}

pub struct Ipc {
    arm7: Side,
    arm9: Side,
}

impl Default for Ipc {
    fn default() -> Self {
        Ipc {
            arm7: Side::default(),
            arm9: Side::default(),
        }
    }
}

impl Ipc {
    pub fn new() -> Self {
        Self::default()
    }

    fn sides(&mut self, from: Cpu) -> (&mut Side, &mut Side) {
        match from {
            Cpu::Arm7 => (&mut self.arm7, &mut self.arm9),
            Cpu::Arm9 => (&mut self.arm9, &mut self.arm7),
        }
    }

    pub fn sync(&self, cpu: Cpu) -> Sync {
        match cpu {
            Cpu::Arm7 => self.arm7.sync,
            Cpu::Arm9 => self.arm9.sync,
        }
    }

    /// Writes `IPCSYNC` from `from`'s side: the low nibble of the other
    /// side's `SYNC` mirrors this side's `send` nibble, and a `send_irq`
    /// strobe raises `IPC_SYNC` on the other CPU if it has `irq_enabled` set.
    pub fn write_sync(&mut self, from: Cpu, value: Sync, other_irqs: &mut IrqController) {
        let (own, other) = self.sides(from);
        own.sync.0 = (own.sync.0 & 0x000F) | (value.0 & 0x4F00);
        other.sync.0 = (other.sync.0 & 0x4F00) | ((value.0 >> 8) & 0xF);
        if value.send_irq() && other.sync.irq_enabled() {
            other_irqs.request(IrqSource::IPC_SYNC);
        }
    }

    pub fn fifo_control(&self, cpu: Cpu) -> FifoControl {
        match cpu {
            Cpu::Arm7 => self.arm7.fifo_control,
            Cpu::Arm9 => self.arm9.fifo_control,
        }
    }

    /// Writes `IPCFIFOCNT` from `from`'s side.
    pub fn write_fifo_control(&mut self, from: Cpu, value: FifoControl, own_irqs: &mut IrqController) {
        let (own, other) = self.sides(from);
        let prev = own.fifo_control;
        if value.clear_send_fifo() {
            own.send_fifo.clear();
            own.fifo_control = own
                .fifo_control
                .with_send_fifo_empty(true)
                .with_send_fifo_full(false);
            other.fifo_control = other
                .fifo_control
                .with_recv_fifo_empty(true)
                .with_recv_fifo_full(false);
            own.last_word_received = 0;
        }
        own.fifo_control.0 = ((own.fifo_control.0 & 0x4303) | (value.0 & 0x8404)) & !(value.0 & 0x4000);
        if value.send_fifo_empty_irq_enabled()
            && own.fifo_control.send_fifo_empty()
            && (!prev.send_fifo_empty_irq_enabled() || !prev.send_fifo_empty())
        {
            own_irqs.request(IrqSource::IPC_SEND_FIFO_EMPTY);
        }
        if value.recv_fifo_not_empty_irq_enabled()
            && !prev.recv_fifo_empty()
            && !prev.recv_fifo_not_empty_irq_enabled()
        {
            own_irqs.request(IrqSource::IPC_RECV_FIFO_NOT_EMPTY);
        }
    }

    /// Pushes `value` onto `from`'s send FIFO, raising `IPC_RECV_FIFO_NOT_EMPTY`
    /// on the other CPU if its IRQ is enabled and the FIFO was empty.
    pub fn send(&mut self, from: Cpu, value: u32, other_irqs: &mut IrqController) {
        let (own, other) = self.sides(from);
        if !own.fifo_control.fifos_enabled() {
            return;
        }
        let was_empty = own.send_fifo.is_empty();
        if own.send_fifo.write(value).is_none() {
            own.fifo_control.set_error(true);
            return;
        }
        let full = own.send_fifo.is_full();
        own.fifo_control = own.fifo_control.with_send_fifo_empty(false).with_send_fifo_full(full);
        other.fifo_control = other.fifo_control.with_recv_fifo_empty(false).with_recv_fifo_full(full);
        if other.fifo_control.recv_fifo_not_empty_irq_enabled() && was_empty {
            other_irqs.request(IrqSource::IPC_RECV_FIFO_NOT_EMPTY);
        }
    }

    /// Peeks the word `from` would receive, without popping it.
    pub fn peek(&self, from: Cpu) -> u32 {
        let other = match from {
            Cpu::Arm7 => &self.arm9,
            Cpu::Arm9 => &self.arm7,
        };
        other.send_fifo.peek().unwrap_or(other.last_word_received)
    }

    /// Pops a word from the other side's send FIFO into `from`, raising
    /// `IPC_SEND_FIFO_EMPTY` on the other CPU if its FIFO just emptied and
    /// its IRQ is enabled.
    pub fn recv(&mut self, from: Cpu, own_irqs: &mut IrqController, other_irqs: &mut IrqController) -> u32 {
        let (own, other) = self.sides(from);
        if own.fifo_control.fifos_enabled() {
            if let Some(value) = other.send_fifo.read() {
                let empty = other.send_fifo.is_empty();
                own.fifo_control = own.fifo_control.with_recv_fifo_full(false).with_recv_fifo_empty(empty);
                other.fifo_control = other.fifo_control.with_send_fifo_full(false).with_send_fifo_empty(empty);
                if other.fifo_control.send_fifo_empty_irq_enabled() && empty {
                    other_irqs.request(IrqSource::IPC_SEND_FIFO_EMPTY);
                }
                own.last_word_received = value;
                value
            } else {
                own.fifo_control.set_error(true);
                own.last_word_received
            }
        } else {
            let _ = own_irqs;
            other.send_fifo.peek().unwrap_or(other.last_word_received)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_strobe_raises_irq_on_other_cpu_when_enabled() {
        let mut ipc = Ipc::new();
        let mut arm9_irqs = IrqController::new();
        // ARM9 opts into SYNC IRQs first.
        ipc.write_sync(Cpu::Arm9, Sync(0).with_irq_enabled(true), &mut IrqController::new());
        let value = Sync(0).with_send(0x3).with_send_irq(true);
        ipc.write_sync(Cpu::Arm7, value, &mut arm9_irqs);
        assert_eq!(ipc.sync(Cpu::Arm9).recv(), 0x3);
        assert!(arm9_irqs.irq_flag() & IrqSource::IPC_SYNC.bits() != 0);
    }

    #[test]
    fn send_then_recv_round_trips_and_tracks_fifo_state() {
        let mut ipc = Ipc::new();
        let mut arm7_irqs = IrqController::new();
        let mut arm9_irqs = IrqController::new();
        ipc.write_fifo_control(Cpu::Arm9, FifoControl(0).with_fifos_enabled(true), &mut arm9_irqs);
        ipc.write_fifo_control(Cpu::Arm7, FifoControl(0).with_fifos_enabled(true), &mut arm7_irqs);
        ipc.send(Cpu::Arm9, 0xDEAD_BEEF, &mut arm7_irqs);
        assert!(!ipc.fifo_control(Cpu::Arm7).recv_fifo_empty());
        let received = ipc.recv(Cpu::Arm7, &mut arm7_irqs, &mut arm9_irqs);
        assert_eq!(received, 0xDEAD_BEEF);
        assert!(ipc.fifo_control(Cpu::Arm7).recv_fifo_empty());
    }

    #[test]
    fn recv_on_empty_fifo_sets_error_and_keeps_last_value() {
        let mut ipc = Ipc::new();
        let mut arm7_irqs = IrqController::new();
        let mut arm9_irqs = IrqController::new();
        ipc.write_fifo_control(Cpu::Arm7, FifoControl(0).with_fifos_enabled(true), &mut arm7_irqs);
        let value = ipc.recv(Cpu::Arm7, &mut arm7_irqs, &mut arm9_irqs);
        assert_eq!(value, 0);
        assert!(ipc.fifo_control(Cpu::Arm7).error());
    }
}
