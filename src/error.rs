//! Error kinds surfaced by the core, per the propagation rules: only
//! [`CoreError::InvariantViolation`] unwinds the emulation step; everything
//! else is local and register-observable (an IO write is silently discarded,
//! a FIFO sets its own `error_flag`, a backup transfer returns `0xFF`).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A VRAMCNT combination or CP15 write the core refuses to emulate.
    /// Reported and continued from; never fatal.
    #[error("configuration fault: {0}")]
    ConfigurationFault(String),

    /// An IO read/write to an address not in any device's jurisdiction.
    /// Reads return 0, writes are discarded; logged once per address.
    #[error("unmapped IO access at {address:#010x}")]
    UnmappedIo { address: u32 },

    /// A scheduler heap overflow, an out-of-range backup access, or a ROM
    /// access out of bounds with wrap disabled. Fatal: unwinds the core.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// FRAM/EEPROM protect-mode blocked a write. Signalled on the SPI
    /// transfer by returning 0xFF, not by raising a fault.
    #[error("backup surface rejected the write (protect mode)")]
    BackupSurface,

    /// IPC FIFO under/overflow. Reflected in the FIFOCNT `error_flag` bit;
    /// never a fault.
    #[error("IPC FIFO error (under/overflow)")]
    FifoError,
}

pub type CoreResult<T> = Result<T, CoreError>;
