//! The DfuSe write side: generic DNLOAD stepping, the set-address and
//! erase subcommands, the blocked write loop and the leave-DFU
//! sequence (AN3156).

use std::time::Duration;

use tracing::{debug, info, instrument};

use super::status::StatusMachine;
use super::ProtocolError;
use crate::layout::MemoryLayout;
use crate::progress::ProgressList;
use crate::protocol::constants::{
    BLOCK_NUMBER_OFFSET, DEFAULT_OPERATION_TIMEOUT_MS, DFU_DNLOAD, DFU_INTERFACE,
    DFUSE_CMD_ERASE, DFUSE_CMD_SET_ADDRESS, MAX_CLEAR_RETRIES, REQUEST_TYPE_CLASS_INTERFACE_OUT,
    TRANSFER_SIZE,
};
use crate::protocol::State;
use crate::transport::DfuTransport;

/// Write-side protocol engine.
pub struct DownloadEngine<'a, T: DfuTransport> {
    transport: &'a T,
    status: StatusMachine<'a, T>,
    progress: &'a ProgressList,
    operation_timeout: Duration,
}

impl<'a, T: DfuTransport> DownloadEngine<'a, T> {
    pub fn new(transport: &'a T, progress: &'a ProgressList) -> Self {
        Self {
            transport,
            status: StatusMachine::new(transport),
            progress,
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
        }
    }

    /// Bound each busy-poll loop by wall clock (default 60 s).
    pub fn set_operation_timeout(&mut self, timeout: Duration) {
        self.operation_timeout = timeout;
    }

    /// Gate before any DNLOAD: the device must sit in `dfuIDLE` or
    /// `dfuDNLOAD-IDLE`. Anything else gets a bounded number of
    /// CLRSTATUS attempts before the state is declared stuck.
    fn ensure_idle(&self) -> Result<(), ProtocolError> {
        let mut last = self.status.get_status()?;
        for _ in 0..MAX_CLEAR_RETRIES {
            if matches!(last.state, State::DfuIdle | State::DfuDnloadIdle) {
                return Ok(());
            }
            debug!(state = %last.state, "Not ready for DNLOAD, clearing status");
            self.status.clear_status()?;
            last = self.status.get_status()?;
        }
        Err(ProtocolError::StuckState { observed: last })
    }

    /// One complete download step: gate on idle, issue the DNLOAD,
    /// confirm the device enters `dfuDNBUSY`, then poll it through to
    /// `dfuDNLOAD-IDLE`.
    fn dnload(&self, block_number: u16, payload: &[u8]) -> Result<(), ProtocolError> {
        self.ensure_idle()?;

        self.transport.control_out(
            REQUEST_TYPE_CLASS_INTERFACE_OUT,
            DFU_DNLOAD,
            block_number,
            DFU_INTERFACE,
            payload,
        )?;

        // The first status read both reports dfuDNBUSY and triggers
        // the actual flash operation.
        let first = self.status.get_status()?;
        if first.state != State::DfuDnbusy {
            return Err(ProtocolError::UnexpectedState {
                expected: State::DfuDnbusy,
                observed: first,
            });
        }

        self.status.wait_until(
            |s| s == State::DfuDnbusy,
            &[State::DfuDnloadIdle],
            Some(self.operation_timeout),
        )?;
        Ok(())
    }

    /// DfuSe set address pointer subcommand.
    pub fn set_address(&self, address: u32) -> Result<(), ProtocolError> {
        debug!(address = format!("0x{address:08X}"), "Set address pointer");
        let mut cmd = [0u8; 5];
        cmd[0] = DFUSE_CMD_SET_ADDRESS;
        cmd[1..].copy_from_slice(&address.to_le_bytes());
        self.dnload(0, &cmd)
    }

    /// DfuSe page erase subcommand.
    pub fn erase_page(&self, address: u32) -> Result<(), ProtocolError> {
        debug!(address = format!("0x{address:08X}"), "Page erase");
        let mut cmd = [0u8; 5];
        cmd[0] = DFUSE_CMD_ERASE;
        cmd[1..].copy_from_slice(&address.to_le_bytes());
        self.dnload(0, &cmd)
    }

    /// DfuSe mass erase subcommand.
    #[instrument(skip(self))]
    pub fn mass_erase(&self) -> Result<(), ProtocolError> {
        info!("Mass erase");
        self.dnload(0, &[DFUSE_CMD_ERASE])
    }

    /// Erase every page overlapping `[address, address + length)`.
    ///
    /// The start must sit on a page boundary of the containing region;
    /// the page count rounds the length up to whole pages.
    #[instrument(skip(self, layout), fields(address = format!("0x{address:08X}"), length))]
    pub fn erase_range(
        &self,
        layout: &MemoryLayout,
        address: u32,
        length: u32,
    ) -> Result<(), ProtocolError> {
        if length == 0 {
            return Ok(());
        }
        let region = layout
            .region_containing(address)
            .ok_or(ProtocolError::AddressNotInLayout { address })?;

        let start_page = region.page_index(address);
        if region.start_address + start_page * region.page_size != address {
            return Err(ProtocolError::UnalignedErase { address });
        }

        let page_count = length.div_ceil(region.page_size);
        info!(
            pages = page_count,
            page_size = region.page_size,
            "Erasing pages"
        );
        for k in 0..page_count {
            self.erase_page(region.start_address + (start_page + k) * region.page_size)?;
            self.progress.increment();
        }
        Ok(())
    }

    /// Write `data` to `base_address` in transfer-size blocks with
    /// consecutive block numbers.
    ///
    /// A short final block gets a fresh set-address of its own
    /// destination with the block number restarted, so the device-side
    /// address computation `(wBlockNum - 2) * size + pointer` stays
    /// correct for the tail.
    #[instrument(skip(self, data), fields(address = format!("0x{base_address:08X}"), len = data.len()))]
    pub fn write(&self, base_address: u32, data: &[u8]) -> Result<(), ProtocolError> {
        if data.is_empty() {
            return Ok(());
        }
        self.set_address(base_address)?;

        let full_blocks = data.len() / TRANSFER_SIZE;
        for i in 0..full_blocks {
            let chunk = &data[i * TRANSFER_SIZE..(i + 1) * TRANSFER_SIZE];
            self.dnload(BLOCK_NUMBER_OFFSET + i as u16, chunk)?;
            self.progress.increment();
        }

        let tail = &data[full_blocks * TRANSFER_SIZE..];
        if !tail.is_empty() {
            if full_blocks > 0 {
                let tail_address = base_address + (full_blocks * TRANSFER_SIZE) as u32;
                self.set_address(tail_address)?;
            }
            self.dnload(BLOCK_NUMBER_OFFSET, tail)?;
            self.progress.increment();
        }

        debug!(blocks = data.len().div_ceil(TRANSFER_SIZE), "Write complete");
        Ok(())
    }

    /// Leave DFU mode: point the device at the entry address, then
    /// send the zero-length download that starts manifestation.
    ///
    /// The device resets once manifestation finishes; this engine
    /// issues no transfer past the manifest check.
    #[instrument(skip(self))]
    pub fn leave_dfu(&self, entry_address: u32) -> Result<(), ProtocolError> {
        info!(
            entry = format!("0x{entry_address:08X}"),
            "Leaving DFU mode"
        );
        self.set_address(entry_address)?;
        self.ensure_idle()?;

        self.transport.control_out(
            REQUEST_TYPE_CLASS_INTERFACE_OUT,
            DFU_DNLOAD,
            0,
            DFU_INTERFACE,
            &[],
        )?;

        let status = self.status.get_status()?;
        if status.state != State::DfuManifest {
            return Err(ProtocolError::UnexpectedState {
                expected: State::DfuManifest,
                observed: status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::DFU_CLRSTATUS;
    use crate::protocol::Status;
    use crate::transport::MockTransport;

    fn engine_over<'a>(mock: &'a MockTransport, progress: &'a ProgressList) -> DownloadEngine<'a, MockTransport> {
        DownloadEngine::new(mock, progress)
    }

    /// DNLOAD transfers with wValue 0 and an erase command payload.
    fn erase_addresses(mock: &MockTransport) -> Vec<u32> {
        mock.dnload_records()
            .into_iter()
            .filter(|(value, data)| *value == 0 && data.len() == 5 && data[0] == DFUSE_CMD_ERASE)
            .map(|(_, data)| u32::from_le_bytes([data[1], data[2], data[3], data[4]]))
            .collect()
    }

    #[test]
    fn test_erase_range_two_pages() {
        let mock = MockTransport::new();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();

        engine.erase_range(&layout, 0x0800_0400, 3000).unwrap();
        assert_eq!(erase_addresses(&mock), vec![0x0800_0400, 0x0800_0800]);
    }

    #[test]
    fn test_erase_range_rejects_unaligned_start() {
        let mock = MockTransport::new();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();

        let err = engine.erase_range(&layout, 0x0800_0200, 3000).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnalignedErase { address: 0x0800_0200 }
        ));
        assert!(erase_addresses(&mock).is_empty());
    }

    #[test]
    fn test_erase_range_rejects_unknown_address() {
        let mock = MockTransport::new();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();

        let err = engine.erase_range(&layout, 0x2000_0000, 16).unwrap_err();
        assert!(matches!(err, ProtocolError::AddressNotInLayout { .. }));
    }

    #[test]
    fn test_write_block_sequence_with_tail() {
        let mock = MockTransport::with_geometry("@Flash /0x08000000/16*1Ka", 0x0800_0000, 1024, 16);
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        engine.write(0x0800_0000, &data).unwrap();

        let dnloads = mock.dnload_records();
        // set-address(base), two full blocks, set-address(tail), tail block
        assert_eq!(dnloads.len(), 5);
        assert_eq!(dnloads[0].0, 0);
        assert_eq!(dnloads[0].1[0], DFUSE_CMD_SET_ADDRESS);
        assert_eq!(&dnloads[0].1[1..], &0x0800_0000u32.to_le_bytes());
        assert_eq!((dnloads[1].0, dnloads[1].1.len()), (2, 2048));
        assert_eq!((dnloads[2].0, dnloads[2].1.len()), (3, 2048));
        assert_eq!(dnloads[3].0, 0);
        assert_eq!(dnloads[3].1[0], DFUSE_CMD_SET_ADDRESS);
        assert_eq!(&dnloads[3].1[1..], &0x0800_1000u32.to_le_bytes());
        assert_eq!((dnloads[4].0, dnloads[4].1.len()), (2, 904));

        // The full payload landed contiguously.
        assert_eq!(mock.memory(0x0800_0000, 5000), data);
    }

    #[test]
    fn test_write_single_short_block() {
        let mock = MockTransport::new();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        engine.write(0x0800_0000, &[0xAA]).unwrap();

        let dnloads = mock.dnload_records();
        // One set-address, one data block numbered 2.
        assert_eq!(dnloads.len(), 2);
        assert_eq!(dnloads[0].0, 0);
        assert_eq!((dnloads[1].0, dnloads[1].1.as_slice()), (2, &[0xAA][..]));
        assert_eq!(mock.memory(0x0800_0000, 1), vec![0xAA]);
    }

    #[test]
    fn test_no_dnload_without_idle_gate() {
        let mock = MockTransport::new();
        mock.set_state(State::DfuError, Status::ErrVerify);
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        engine.write(0x0800_0000, &[0x01]).unwrap();

        // The stale error state was cleared before the first DNLOAD.
        let records = mock.records();
        let first_dnload = records.iter().position(|r| r.request == DFU_DNLOAD).unwrap();
        assert!(
            records[..first_dnload]
                .iter()
                .any(|r| r.request == DFU_CLRSTATUS),
            "expected CLRSTATUS before the first DNLOAD"
        );
    }

    #[test]
    fn test_stuck_state_surfaces_after_bounded_retries() {
        let mock = MockTransport::new();
        mock.set_state(State::DfuError, Status::ErrUnknown);
        mock.ignore_clear_status();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        let err = engine.set_address(0x0800_0000).unwrap_err();
        assert!(matches!(err, ProtocolError::StuckState { .. }));

        let clears = mock
            .records()
            .iter()
            .filter(|r| r.request == DFU_CLRSTATUS)
            .count();
        assert_eq!(clears as u32, MAX_CLEAR_RETRIES);
    }

    #[test]
    fn test_device_error_during_erase() {
        let mock = MockTransport::new();
        mock.fail_erase_with(Status::ErrAddress);
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);
        let layout = MemoryLayout::parse("@Flash /0x08000000/16*1Ka").unwrap();

        let err = engine.erase_range(&layout, 0x0800_0000, 1024).unwrap_err();
        match err {
            ProtocolError::DeviceReported { status, .. } => {
                assert_eq!(status, Status::ErrAddress)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_mass_erase_is_single_command() {
        let mock = MockTransport::new();
        mock.load_memory(0x0800_0000, &[0x00; 64]);
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        engine.mass_erase().unwrap();

        let dnloads = mock.dnload_records();
        assert_eq!(dnloads.len(), 1);
        assert_eq!(dnloads[0], (0, vec![DFUSE_CMD_ERASE]));
        assert_eq!(mock.memory(0x0800_0000, 64), vec![0xFF; 64]);
    }

    #[test]
    fn test_leave_dfu_sequence() {
        let mock = MockTransport::new();
        let progress = ProgressList::new();
        let engine = engine_over(&mock, &progress);

        engine.leave_dfu(0x0800_0000).unwrap();

        let dnloads = mock.dnload_records();
        assert_eq!(dnloads.len(), 2);
        assert_eq!(dnloads[0].1[0], DFUSE_CMD_SET_ADDRESS);
        // Zero-length download with wValue 0 starts manifestation.
        assert_eq!(dnloads[1], (0, Vec::new()));
    }
}
