//! The DFU read side: blocked UPLOAD loop, used for verification and
//! memory dumps.

use tracing::{debug, instrument};

use super::download::DownloadEngine;
use super::status::StatusMachine;
use super::ProtocolError;
use crate::progress::ProgressList;
use crate::protocol::constants::{
    BLOCK_NUMBER_OFFSET, DFU_INTERFACE, DFU_UPLOAD, MAX_CLEAR_RETRIES,
    REQUEST_TYPE_CLASS_INTERFACE_IN, TRANSFER_SIZE,
};
use crate::protocol::State;
use crate::transport::DfuTransport;

/// Read-side protocol engine.
pub struct UploadEngine<'a, T: DfuTransport> {
    transport: &'a T,
    status: StatusMachine<'a, T>,
    /// Set-address is a download subcommand even on the read path.
    download: DownloadEngine<'a, T>,
    progress: &'a ProgressList,
}

impl<'a, T: DfuTransport> UploadEngine<'a, T> {
    pub fn new(transport: &'a T, progress: &'a ProgressList) -> Self {
        Self {
            transport,
            status: StatusMachine::new(transport),
            download: DownloadEngine::new(transport, progress),
            progress,
        }
    }

    /// Gate before any UPLOAD: the device must sit in `dfuIDLE` or
    /// `dfuUPLOAD-IDLE`. A set-address leaves it in `dfuDNLOAD-IDLE`,
    /// which a CLRSTATUS moves back to idle without disturbing the
    /// address pointer.
    fn ensure_idle(&self) -> Result<(), ProtocolError> {
        let mut last = self.status.get_status()?;
        for _ in 0..MAX_CLEAR_RETRIES {
            if matches!(last.state, State::DfuIdle | State::DfuUploadIdle) {
                return Ok(());
            }
            debug!(state = %last.state, "Not ready for UPLOAD, clearing status");
            self.status.clear_status()?;
            last = self.status.get_status()?;
        }
        Err(ProtocolError::StuckState { observed: last })
    }

    /// One UPLOAD transfer into `buf`. The device must fill the whole
    /// buffer; anything less mid-range is a protocol violation.
    fn upload_block(&self, block_number: u16, buf: &mut [u8]) -> Result<(), ProtocolError> {
        let n = self.transport.control_in(
            REQUEST_TYPE_CLASS_INTERFACE_IN,
            DFU_UPLOAD,
            block_number,
            DFU_INTERFACE,
            buf,
        )?;
        if n != buf.len() {
            return Err(ProtocolError::ShortTransfer {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// Read `length` bytes starting at `base_address`, in transfer-size
    /// blocks with consecutive block numbers. Tail handling mirrors the
    /// write path: fresh set-address, block numbering restarted.
    #[instrument(skip(self), fields(address = format!("0x{base_address:08X}"), length))]
    pub fn read(&self, base_address: u32, length: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![0u8; length];
        if length == 0 {
            return Ok(out);
        }

        self.download.set_address(base_address)?;
        self.ensure_idle()?;

        let full_blocks = length / TRANSFER_SIZE;
        for i in 0..full_blocks {
            let chunk = &mut out[i * TRANSFER_SIZE..(i + 1) * TRANSFER_SIZE];
            self.upload_block(BLOCK_NUMBER_OFFSET + i as u16, chunk)?;
            self.progress.increment();
        }

        let tail_len = length % TRANSFER_SIZE;
        if tail_len > 0 {
            if full_blocks > 0 {
                let tail_address = base_address + (full_blocks * TRANSFER_SIZE) as u32;
                self.download.set_address(tail_address)?;
                self.ensure_idle()?;
            }
            let chunk = &mut out[full_blocks * TRANSFER_SIZE..];
            self.upload_block(BLOCK_NUMBER_OFFSET, chunk)?;
            self.progress.increment();
        }

        debug!(bytes = length, "Read complete");
        Ok(out)
    }
}
