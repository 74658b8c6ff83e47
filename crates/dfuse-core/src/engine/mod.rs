//! The DFU/DfuSe control-transfer engine.
//!
//! Split the way the protocol splits: status arbitration
//! ([`StatusMachine`]), the write side with the DfuSe subcommands
//! ([`DownloadEngine`]) and the read side ([`UploadEngine`]).

pub mod download;
pub mod status;
pub mod upload;

pub use download::DownloadEngine;
pub use status::StatusMachine;
pub use upload::UploadEngine;

use thiserror::Error;

use crate::protocol::{DeviceStatus, State, Status};
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unexpected device state: {observed} (expected {expected})")]
    UnexpectedState {
        expected: State,
        observed: DeviceStatus,
    },

    #[error("Device stuck in {observed}, status not clearable")]
    StuckState { observed: DeviceStatus },

    #[error("Operation timed out after {elapsed_ms}ms (last state {observed})")]
    Timeout {
        elapsed_ms: u64,
        observed: DeviceStatus,
    },

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    #[error("Erase range start 0x{address:08X} is not page-aligned")]
    UnalignedErase { address: u32 },

    #[error("Address 0x{address:08X} is outside the device memory layout")]
    AddressNotInLayout { address: u32 },

    #[error("Device reported an error: {status}")]
    DeviceReported { status: Status, observed: DeviceStatus },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
