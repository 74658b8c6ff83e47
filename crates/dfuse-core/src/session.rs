//! High-level programming session: decode → erase → write → verify →
//! leave DFU.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::engine::{DownloadEngine, ProtocolError, StatusMachine, UploadEngine};
use crate::file::{DecodeError, DfuFile};
use crate::layout::{LayoutError, MemoryLayout};
use crate::progress::{ProgressList, ProgressSink};
use crate::protocol::constants::TRANSFER_SIZE;
use crate::transport::{DfuTransport, TransportError};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error(
        "Element at 0x{address:08X} declares {declared} bytes but carries {actual}"
    )]
    SizeMismatch {
        address: u32,
        declared: u32,
        actual: usize,
    },

    #[error("File contains no programmable elements")]
    Empty,
}

#[derive(Error, Debug)]
pub enum ProgrammingError {
    #[error("Firmware file rejected: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(
        "Verification failed at 0x{address:08X}: first mismatch at offset {first_mismatch_offset}"
    )]
    VerificationFailed {
        address: u32,
        first_mismatch_offset: usize,
    },
}

/// Knobs for one programming session. Mirrors the CLI flags and can be
/// persisted as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramOptions {
    /// Erase the whole part with one command instead of per-page.
    pub mass_erase: bool,
    /// Read everything back and byte-compare after writing.
    pub verify: bool,
    /// Tell the device to leave DFU mode when done.
    pub leave_dfu: bool,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            mass_erase: false,
            verify: true,
            leave_dfu: true,
        }
    }
}

impl ProgramOptions {
    /// Load options from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(std::io::Error::other)
    }

    /// Save options to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, content)
    }
}

/// Owns the transport for the duration of a programming session and
/// drives the engines in order. The device is released on drop.
pub struct Programmer<T: DfuTransport> {
    transport: T,
    progress: ProgressList,
    options: ProgramOptions,
}

impl<T: DfuTransport> Programmer<T> {
    pub fn new(transport: T, options: ProgramOptions) -> Self {
        Self {
            transport,
            progress: ProgressList::new(),
            options,
        }
    }

    /// Register a progress subscriber.
    pub fn add_progress(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress.add(sink);
    }

    /// Read the flash geometry advertised by the device.
    pub fn memory_layout(&self) -> Result<MemoryLayout, ProgrammingError> {
        let descriptor = self.transport.interface_description(1, 0, 0)?;
        info!(descriptor = %descriptor, "Device memory descriptor");
        Ok(MemoryLayout::parse(&descriptor)?)
    }

    /// A device left over from an aborted session may still sit in
    /// `dfuERROR`; clear once so the first real request is accepted.
    pub fn resynchronize(&self) -> Result<(), ProgrammingError> {
        StatusMachine::new(&self.transport).clear_status()?;
        Ok(())
    }

    /// Program every element of `file`: plan and run the erase, write
    /// all payloads, verify by read-back, then start manifestation.
    #[instrument(skip(self, file), fields(payload = file.payload_size()))]
    pub fn program(&self, file: &DfuFile) -> Result<(), ProgrammingError> {
        let elements: Vec<_> = file
            .images
            .iter()
            .flat_map(|image| &image.elements)
            .collect();
        let first = elements.first().copied().ok_or(ImageError::Empty)?;

        // Reject inconsistent elements before touching the flash.
        for element in &elements {
            if element.data.len() != element.size as usize {
                return Err(ImageError::SizeMismatch {
                    address: element.address,
                    declared: element.size,
                    actual: element.data.len(),
                }
                .into());
            }
        }

        let layout = self.memory_layout()?;
        let download = DownloadEngine::new(&self.transport, &self.progress);
        let upload = UploadEngine::new(&self.transport, &self.progress);

        // Erase.
        self.progress.reset();
        self.progress.set_status("Erasing");
        if self.options.mass_erase {
            self.progress.set_max(1);
            download.mass_erase()?;
            self.progress.increment();
        } else {
            let total_pages: u64 = elements
                .iter()
                .filter_map(|e| {
                    let region = layout.region_containing(e.address)?;
                    Some(e.size.div_ceil(region.page_size) as u64)
                })
                .sum();
            self.progress.set_max(total_pages);
            for element in &elements {
                download.erase_range(&layout, element.address, element.size)?;
            }
        }

        // Write.
        let total_blocks: u64 = elements
            .iter()
            .map(|e| e.data.len().div_ceil(TRANSFER_SIZE) as u64)
            .sum();
        self.progress.reset();
        self.progress.set_status("Writing");
        self.progress.set_increment(TRANSFER_SIZE as u64);
        self.progress.set_max(total_blocks);
        for element in &elements {
            info!(
                address = format!("0x{:08X}", element.address),
                bytes = element.data.len(),
                "Writing element"
            );
            download.write(element.address, &element.data)?;
        }

        // Verify.
        if self.options.verify {
            self.progress.reset();
            self.progress.set_status("Verifying");
            self.progress.set_max(total_blocks);
            for element in &elements {
                let readback = upload.read(element.address, element.size as usize)?;
                if let Some(offset) = first_mismatch(&readback, &element.data) {
                    return Err(ProgrammingError::VerificationFailed {
                        address: element.address,
                        first_mismatch_offset: offset,
                    });
                }
            }
            info!("Verification passed");
        }

        // Leave DFU mode, entering at the first element.
        if self.options.leave_dfu {
            self.progress.set_status("Starting application");
            download.leave_dfu(first.address)?;
        } else {
            warn!("Leaving device in DFU mode");
        }

        Ok(())
    }
}

impl<T: DfuTransport> Drop for Programmer<T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}

fn first_mismatch(a: &[u8], b: &[u8]) -> Option<usize> {
    if a.len() != b.len() {
        return Some(a.len().min(b.len()));
    }
    a.iter().zip(b).position(|(x, y)| x != y)
}
