//! Protocol constants from the USB DFU 1.1 class specification and the
//! STMicroelectronics DfuSe extensions (AN3156).

// ============================================================================
// Device Identification
// ============================================================================

/// STMicroelectronics Vendor ID
pub const ST_VENDOR_ID: u16 = 0x0483;

/// STM32 ROM bootloader DFU Product ID
pub const ST_DFU_PRODUCT_ID: u16 = 0xDF11;

// ============================================================================
// Class Requests (bRequest)
// ============================================================================

pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;

/// bmRequestType for class requests directed at the DFU interface,
/// host-to-device.
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

/// bmRequestType for class requests directed at the DFU interface,
/// device-to-host.
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xA1;

/// wIndex for every request: the DFU interface number.
pub const DFU_INTERFACE: u16 = 0;

// ============================================================================
// DfuSe Subcommands (first payload byte of a DNLOAD with wValue = 0)
// ============================================================================

/// Set the address pointer. Args: 4-byte LE address.
pub const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;

/// Erase. With a 4-byte LE address argument: erase the page containing
/// that address. With no argument: mass erase.
pub const DFUSE_CMD_ERASE: u8 = 0x41;

/// Read unprotect. Never issued by this tool.
pub const DFUSE_CMD_READ_UNPROTECT: u8 = 0x92;

// ============================================================================
// Transfer Sizing
// ============================================================================

/// Block payload size. Matches the maximum wTransferSize advertised by
/// the STM32 DFU interface descriptor.
pub const TRANSFER_SIZE: usize = 2048;

/// First data block is sent with wValue = 2; wValue = 0 carries DfuSe
/// subcommands and wValue = 1 is reserved.
pub const BLOCK_NUMBER_OFFSET: u16 = 2;

/// Size of the GETSTATUS response record.
pub const STATUS_LENGTH: usize = 6;

// ============================================================================
// Engine Bounds
// ============================================================================

/// How many CLRSTATUS attempts the idle gate makes before reporting a
/// stuck device.
pub const MAX_CLEAR_RETRIES: u32 = 3;

/// Default wall-clock bound on a single busy-poll loop. Page erases
/// finish in tens of milliseconds; a mass erase of a large part can
/// take tens of seconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 60_000;

/// Default USB control-transfer timeout in milliseconds.
pub const DEFAULT_CONTROL_TIMEOUT_MS: u64 = 5_000;
