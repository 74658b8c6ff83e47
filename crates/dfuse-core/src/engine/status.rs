//! GETSTATUS/CLRSTATUS primitives and state arbitration.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::ProtocolError;
use crate::protocol::constants::{
    DFU_CLRSTATUS, DFU_GETSTATUS, DFU_INTERFACE, REQUEST_TYPE_CLASS_INTERFACE_IN,
    REQUEST_TYPE_CLASS_INTERFACE_OUT, STATUS_LENGTH,
};
use crate::protocol::{DeviceStatus, State};
use crate::transport::DfuTransport;

/// Status polling over one transport.
pub struct StatusMachine<'a, T: DfuTransport> {
    transport: &'a T,
}

impl<'a, T: DfuTransport> StatusMachine<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Issue CLRSTATUS. Takes no status follow-up.
    pub fn clear_status(&self) -> Result<(), ProtocolError> {
        trace!("CLRSTATUS");
        self.transport
            .control_out(
                REQUEST_TYPE_CLASS_INTERFACE_OUT,
                DFU_CLRSTATUS,
                0,
                DFU_INTERFACE,
                &[],
            )
            .map_err(ProtocolError::from)
    }

    /// Issue GETSTATUS and decode the 6-byte record.
    ///
    /// The device dictates its own poll interval in the response; this
    /// call honours it before returning, so the next request on this
    /// transport is automatically spaced correctly.
    pub fn get_status(&self) -> Result<DeviceStatus, ProtocolError> {
        let mut raw = [0u8; STATUS_LENGTH];
        let n = self.transport.control_in(
            REQUEST_TYPE_CLASS_INTERFACE_IN,
            DFU_GETSTATUS,
            0,
            DFU_INTERFACE,
            &mut raw,
        )?;
        let status = DeviceStatus::from_bytes(&raw[..n]).ok_or(ProtocolError::ShortTransfer {
            expected: STATUS_LENGTH,
            actual: n,
        })?;
        trace!(state = %status.state, status = ?status.status, poll_ms = status.poll_timeout_ms, "GETSTATUS");

        if status.poll_timeout_ms > 0 {
            thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        }
        Ok(status)
    }

    /// Poll until the device reaches one of `accept`.
    ///
    /// States satisfying `busy` keep the loop going; `dfuERROR` is
    /// classified into the device-reported status; anything else is a
    /// protocol violation. `timeout` bounds the loop by wall clock.
    pub fn wait_until(
        &self,
        busy: impl Fn(State) -> bool,
        accept: &[State],
        timeout: Option<Duration>,
    ) -> Result<DeviceStatus, ProtocolError> {
        let started = Instant::now();
        loop {
            let status = self.get_status()?;
            if accept.contains(&status.state) {
                return Ok(status);
            }
            if status.state == State::DfuError {
                debug!(status = ?status.status, "Device entered dfuERROR");
                return Err(ProtocolError::DeviceReported {
                    status: status.status,
                    observed: status,
                });
            }
            if !busy(status.state) {
                return Err(ProtocolError::UnexpectedState {
                    expected: accept[0],
                    observed: status,
                });
            }
            if let Some(limit) = timeout
                && started.elapsed() > limit
            {
                return Err(ProtocolError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    observed: status,
                });
            }
        }
    }
}
