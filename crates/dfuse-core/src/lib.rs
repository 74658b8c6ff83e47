//! dfuse-core: host-side programming of STM32 DfuSe bootloaders.
//!
//! This crate implements the DfuSe flavour of USB DFU 1.1 as spoken by
//! the STM32 ROM bootloader (AN3156): the `.dfu` container format, the
//! flash-geometry descriptor string, and the control-transfer state
//! machine used to erase, write, verify and leave DFU mode.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: request constants, DFU state/status codes, the
//!   6-byte `GETSTATUS` record
//! - **Transport**: USB control-endpoint abstraction (nusb, mock)
//! - **File**: the layered DfuSe container (prefix / images /
//!   elements / suffix) with CRC enforcement
//! - **Layout**: the `@Internal Flash /0x08000000/...` geometry string
//! - **Engine**: status polling, the blocked download/upload loops and
//!   the DfuSe subcommands
//! - **Session**: high-level orchestrator (erase → write → verify →
//!   leave DFU) and progress fan-out
//!
//! # Example
//!
//! ```no_run
//! use dfuse_core::session::{ProgramOptions, Programmer};
//! use dfuse_core::transport::NusbTransport;
//! use dfuse_core::file::DfuFile;
//!
//! let bytes = std::fs::read("firmware.dfu").unwrap();
//! let file = DfuFile::from_bytes(&bytes).unwrap();
//! let transport = NusbTransport::open().unwrap();
//! let programmer = Programmer::new(transport, ProgramOptions::default());
//! programmer.program(&file).expect("programming failed");
//! ```

pub mod engine;
pub mod file;
pub mod layout;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use engine::{DownloadEngine, ProtocolError, StatusMachine, UploadEngine};
pub use file::{DecodeError, DfuElement, DfuFile, DfuImage};
pub use layout::{LayoutError, MemoryLayout, Region};
pub use progress::{ProgressList, ProgressSink, TracingProgress};
pub use protocol::{DeviceStatus, State, Status};
pub use session::{ProgramOptions, Programmer, ProgrammingError};
pub use transport::{DfuTransport, MockTransport, NusbTransport, TransportError};
