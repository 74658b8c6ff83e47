//! DFU 1.1 / DfuSe protocol definitions.

pub mod constants;
pub mod status;

pub use status::{DeviceStatus, State, Status};
