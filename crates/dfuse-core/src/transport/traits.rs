//! Transport trait for the DFU control endpoint.
//!
//! Defines the `DfuTransport` trait the protocol engine talks through,
//! allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("More than one matching DFU device found")]
    MultipleDevices,

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Device stalled the request")]
    Stall,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("No descriptor for configuration {config}, interface {interface}, alt {alt}")]
    DescriptorNotFound { config: u8, interface: u8, alt: u8 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract DFU control-endpoint interface.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
/// - Future alternative backends
///
/// All transfers are synchronous; one transport is driven by exactly
/// one programming session at a time.
pub trait DfuTransport {
    /// Issue a control IN transfer (device to host). Returns the
    /// number of bytes the device produced, which may be shorter than
    /// `buf`.
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError>;

    /// Issue a control OUT transfer (host to device), sending all of
    /// `data` (possibly empty).
    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Fetch the string descriptor attached to the given alternate
    /// setting of an interface. For DfuSe devices this carries the
    /// flash-geometry description.
    fn interface_description(
        &self,
        config: u8,
        interface: u8,
        alt: u8,
    ) -> Result<String, TransportError>;

    /// Release the device. Also performed implicitly on drop.
    fn close(&mut self) {}
}
