//! Mock transport for testing.
//!
//! Models a well-behaved DfuSe bootloader behind the control endpoint:
//! a DFU state machine, an address pointer, a flash array with page
//! erase, and hooks for injecting device-side failures. Every control
//! transfer is logged so tests can assert on the exact request stream.

use std::sync::{Arc, Mutex};

use super::traits::{DfuTransport, TransportError};
use crate::protocol::constants::{
    DFU_CLRSTATUS, DFU_DNLOAD, DFU_GETSTATUS, DFU_UPLOAD, DFUSE_CMD_ERASE, DFUSE_CMD_SET_ADDRESS,
    TRANSFER_SIZE,
};
use crate::protocol::{DeviceStatus, State, Status};

/// One captured control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: u8,
    pub value: u16,
    /// OUT payload; empty for IN transfers and zero-length downloads.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    state: State,
    status: Status,
    /// Reported in every GETSTATUS response.
    poll_timeout_ms: u32,
    /// GETSTATUS polls that still see dfuDNBUSY before the transition.
    busy_polls: u8,
    after_busy: (State, Status),
    address_pointer: u32,
    mem_base: u32,
    page_size: u32,
    mem: Vec<u8>,
    descriptor: String,
    log: Vec<ControlRecord>,
    erase_fault: Option<Status>,
    write_fault: Option<Status>,
    /// Cap UPLOAD responses at this length to simulate short reads.
    upload_limit: Option<usize>,
    /// When set, CLRSTATUS leaves the state untouched.
    ignore_clear: bool,
    /// When set, the first byte of every written block is flipped.
    corrupt_writes: bool,
    closed: bool,
}

/// Mock transport simulating an STM32 DfuSe bootloader.
///
/// Clones share the device model, so a test can keep a handle while a
/// session owns the transport.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A device with 16 pages of 1 KiB flash at `0x0800_0000`,
    /// starting in `dfuIDLE`.
    pub fn new() -> Self {
        Self::with_geometry("@Internal Flash  /0x08000000/16*1Ka", 0x0800_0000, 1024, 16)
    }

    pub fn with_geometry(descriptor: &str, base: u32, page_size: u32, pages: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState {
                state: State::DfuIdle,
                status: Status::Ok,
                poll_timeout_ms: 0,
                busy_polls: 0,
                after_busy: (State::DfuIdle, Status::Ok),
                address_pointer: base,
                mem_base: base,
                page_size,
                mem: vec![0xFF; (page_size * pages) as usize],
                descriptor: descriptor.to_string(),
                log: Vec::new(),
                erase_fault: None,
                write_fault: None,
                upload_limit: None,
                ignore_clear: false,
                corrupt_writes: false,
                closed: false,
            })),
        }
    }

    /// Put the device in an arbitrary state (e.g. a stale `dfuERROR`).
    pub fn set_state(&self, state: State, status: Status) {
        let mut s = self.inner.lock().unwrap();
        s.state = state;
        s.status = status;
    }

    /// Report this poll interval in every GETSTATUS response.
    pub fn set_poll_timeout(&self, ms: u32) {
        self.inner.lock().unwrap().poll_timeout_ms = ms;
    }

    /// Fail the next erase commands with the given status.
    pub fn fail_erase_with(&self, status: Status) {
        self.inner.lock().unwrap().erase_fault = Some(status);
    }

    /// Fail data-block writes with the given status.
    pub fn fail_write_with(&self, status: Status) {
        self.inner.lock().unwrap().write_fault = Some(status);
    }

    /// Truncate UPLOAD responses to at most `len` bytes.
    pub fn truncate_uploads_to(&self, len: usize) {
        self.inner.lock().unwrap().upload_limit = Some(len);
    }

    /// Model a device whose error state does not clear.
    pub fn ignore_clear_status(&self) {
        self.inner.lock().unwrap().ignore_clear = true;
    }

    /// Model flash that silently corrupts written data: the first byte
    /// of every block is flipped on its way in.
    pub fn corrupt_writes(&self) {
        self.inner.lock().unwrap().corrupt_writes = true;
    }

    /// All captured control transfers, in issue order.
    pub fn records(&self) -> Vec<ControlRecord> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Captured DNLOAD transfers only: `(wValue, payload)`.
    pub fn dnload_records(&self) -> Vec<(u16, Vec<u8>)> {
        self.records()
            .into_iter()
            .filter(|r| r.request == DFU_DNLOAD)
            .map(|r| (r.value, r.data))
            .collect()
    }

    pub fn clear_records(&self) {
        self.inner.lock().unwrap().log.clear();
    }

    /// Preset flash content, for upload and verify tests.
    pub fn load_memory(&self, addr: u32, data: &[u8]) {
        let mut s = self.inner.lock().unwrap();
        let off = (addr - s.mem_base) as usize;
        s.mem[off..off + data.len()].copy_from_slice(data);
    }

    /// Current flash content at `addr`.
    pub fn memory(&self, addr: u32, len: usize) -> Vec<u8> {
        let s = self.inner.lock().unwrap();
        let off = (addr - s.mem_base) as usize;
        s.mem[off..off + len].to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn enter_busy(&mut self, outcome: (State, Status)) {
        self.state = State::DfuDnbusy;
        self.status = Status::Ok;
        self.busy_polls = 1;
        self.after_busy = outcome;
    }

    fn handle_dnload(&mut self, value: u16, data: &[u8]) {
        if value != 0 {
            // Data block: destination is derived from the address
            // pointer and the block number.
            let addr = self
                .address_pointer
                .wrapping_add((value as u32).wrapping_sub(2).wrapping_mul(TRANSFER_SIZE as u32));
            if let Some(fault) = self.write_fault {
                self.enter_busy((State::DfuError, fault));
                return;
            }
            let off = addr.wrapping_sub(self.mem_base) as usize;
            if off + data.len() <= self.mem.len() {
                self.mem[off..off + data.len()].copy_from_slice(data);
                if self.corrupt_writes && !data.is_empty() {
                    self.mem[off] ^= 0xFF;
                }
                self.enter_busy((State::DfuDnloadIdle, Status::Ok));
            } else {
                self.enter_busy((State::DfuError, Status::ErrAddress));
            }
            return;
        }

        if data.is_empty() {
            // Leave DFU: manifestation starts at the next GETSTATUS.
            self.state = State::DfuManifest;
            self.status = Status::Ok;
            return;
        }

        match data[0] {
            DFUSE_CMD_SET_ADDRESS if data.len() == 5 => {
                self.address_pointer = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                self.enter_busy((State::DfuDnloadIdle, Status::Ok));
            }
            DFUSE_CMD_ERASE => {
                if let Some(fault) = self.erase_fault {
                    self.enter_busy((State::DfuError, fault));
                    return;
                }
                if data.len() == 5 {
                    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
                    let off = addr.wrapping_sub(self.mem_base) as usize;
                    let page = self.page_size as usize;
                    if off + page <= self.mem.len() {
                        self.mem[off..off + page].fill(0xFF);
                        self.enter_busy((State::DfuDnloadIdle, Status::Ok));
                    } else {
                        self.enter_busy((State::DfuError, Status::ErrTarget));
                    }
                } else {
                    // Single command byte: mass erase.
                    self.mem.fill(0xFF);
                    self.enter_busy((State::DfuDnloadIdle, Status::Ok));
                }
            }
            _ => self.enter_busy((State::DfuError, Status::ErrStalledPkt)),
        }
    }
}

impl DfuTransport for MockTransport {
    fn control_in(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        let mut s = self.inner.lock().unwrap();
        s.log.push(ControlRecord {
            request,
            value,
            data: Vec::new(),
        });

        match request {
            DFU_GETSTATUS => {
                // The programming transition is observed across polls:
                // the first GETSTATUS after a DNLOAD reports dfuDNBUSY,
                // the next one reports the outcome.
                if s.state == State::DfuDnbusy {
                    if s.busy_polls == 0 {
                        let (state, status) = s.after_busy;
                        s.state = state;
                        s.status = status;
                    } else {
                        s.busy_polls -= 1;
                    }
                }
                let record = DeviceStatus {
                    status: s.status,
                    poll_timeout_ms: s.poll_timeout_ms,
                    state: s.state,
                    string_index: 0,
                };
                let bytes = record.to_bytes();
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(len)
            }
            DFU_UPLOAD => {
                let addr = s
                    .address_pointer
                    .wrapping_add((value as u32).wrapping_sub(2).wrapping_mul(TRANSFER_SIZE as u32));
                let off = addr.wrapping_sub(s.mem_base) as usize;
                let mut len = buf.len().min(s.mem.len().saturating_sub(off));
                if let Some(limit) = s.upload_limit {
                    len = len.min(limit);
                }
                buf[..len].copy_from_slice(&s.mem[off..off + len]);
                s.state = State::DfuUploadIdle;
                Ok(len)
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn control_out(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut s = self.inner.lock().unwrap();
        s.log.push(ControlRecord {
            request,
            value,
            data: data.to_vec(),
        });

        match request {
            DFU_CLRSTATUS => {
                if !s.ignore_clear {
                    s.state = State::DfuIdle;
                    s.status = Status::Ok;
                }
                Ok(())
            }
            DFU_DNLOAD => {
                s.handle_dnload(value, data);
                Ok(())
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn interface_description(
        &self,
        _config: u8,
        _interface: u8,
        _alt: u8,
    ) -> Result<String, TransportError> {
        Ok(self.inner.lock().unwrap().descriptor.clone())
    }

    fn close(&mut self) {
        self.inner.lock().unwrap().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{
        REQUEST_TYPE_CLASS_INTERFACE_IN, REQUEST_TYPE_CLASS_INTERFACE_OUT,
    };

    fn get_status(mock: &MockTransport) -> DeviceStatus {
        let mut buf = [0u8; 6];
        let n = mock
            .control_in(REQUEST_TYPE_CLASS_INTERFACE_IN, DFU_GETSTATUS, 0, 0, &mut buf)
            .unwrap();
        assert_eq!(n, 6);
        DeviceStatus::from_bytes(&buf).unwrap()
    }

    #[test]
    fn test_busy_then_idle_after_set_address() {
        let mock = MockTransport::new();
        let cmd = [DFUSE_CMD_SET_ADDRESS, 0x00, 0x00, 0x00, 0x08];
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 0, 0, &cmd)
            .unwrap();

        assert_eq!(get_status(&mock).state, State::DfuDnbusy);
        assert_eq!(get_status(&mock).state, State::DfuDnloadIdle);
    }

    #[test]
    fn test_page_erase_fills_page() {
        let mock = MockTransport::new();
        mock.load_memory(0x0800_0400, &[0x55; 1024]);

        let mut cmd = vec![DFUSE_CMD_ERASE];
        cmd.extend_from_slice(&0x0800_0400u32.to_le_bytes());
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 0, 0, &cmd)
            .unwrap();
        get_status(&mock);
        get_status(&mock);

        assert_eq!(mock.memory(0x0800_0400, 1024), vec![0xFF; 1024]);
    }

    #[test]
    fn test_write_lands_at_block_address() {
        let mock = MockTransport::new();
        let cmd = [DFUSE_CMD_SET_ADDRESS, 0x00, 0x00, 0x00, 0x08];
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 0, 0, &cmd)
            .unwrap();
        get_status(&mock);
        get_status(&mock);

        // Block 3 lands one transfer size past the address pointer.
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 3, 0, &[0xAB; 4])
            .unwrap();
        get_status(&mock);
        get_status(&mock);

        assert_eq!(mock.memory(0x0800_0800, 4), vec![0xAB; 4]);
    }

    #[test]
    fn test_erase_fault_reports_error_state() {
        let mock = MockTransport::new();
        mock.fail_erase_with(Status::ErrAddress);

        let mut cmd = vec![DFUSE_CMD_ERASE];
        cmd.extend_from_slice(&0x0800_0000u32.to_le_bytes());
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 0, 0, &cmd)
            .unwrap();

        assert_eq!(get_status(&mock).state, State::DfuDnbusy);
        let status = get_status(&mock);
        assert_eq!(status.state, State::DfuError);
        assert_eq!(status.status, Status::ErrAddress);
    }

    #[test]
    fn test_record_capture() {
        let mock = MockTransport::new();
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_CLRSTATUS, 0, 0, &[])
            .unwrap();
        mock.control_out(REQUEST_TYPE_CLASS_INTERFACE_OUT, DFU_DNLOAD, 2, 0, &[1, 2, 3])
            .unwrap();

        let dnloads = mock.dnload_records();
        assert_eq!(dnloads, vec![(2, vec![1, 2, 3])]);
        assert_eq!(mock.records().len(), 2);
    }
}
