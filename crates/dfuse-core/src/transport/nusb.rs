//! nusb-based transport implementation.

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{Device, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{DfuTransport, TransportError};
use crate::protocol::constants::{DEFAULT_CONTROL_TIMEOUT_MS, ST_DFU_PRODUCT_ID, ST_VENDOR_ID};

/// US English, the language id every DFU bootloader provides.
const LANGUAGE_ID: u16 = 0x0409;

/// A DFU device reachable on the bus, as reported by [`NusbTransport::list`].
#[derive(Debug, Clone)]
pub struct DfuDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
}

/// nusb-based USB transport for a device already enumerated in DFU mode.
pub struct NusbTransport {
    device: Device,
    interface: Interface,
    timeout: Duration,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the single attached ST DFU bootloader (`0483:df11`).
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        Self::open_with_ids(ST_VENDOR_ID, ST_DFU_PRODUCT_ID)
    }

    /// Open the single attached device with the given VID/PID. Exactly
    /// one match must be present.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let mut matches = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| d.vendor_id() == vid && d.product_id() == pid);

        let device_info = matches
            .next()
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;
        if matches.next().is_some() {
            return Err(TransportError::MultipleDevices);
        }

        info!(
            bus = device_info.busnum(),
            address = device_info.device_address(),
            "Found DFU device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        debug!("Claimed DFU interface 0");

        Ok(Self {
            device,
            interface,
            timeout: Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS),
            vid,
            pid,
        })
    }

    /// List DFU devices matching the given VID/PID.
    pub fn list(vid: u16, pid: u16) -> Result<Vec<DfuDeviceInfo>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .filter(|d| d.vendor_id() == vid && d.product_id() == pid)
            .map(|d| DfuDeviceInfo {
                bus: d.busnum(),
                address: d.device_address(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                product: d.product_string().map(str::to_owned),
            })
            .collect();
        Ok(devices)
    }

    /// Override the per-transfer control timeout (default 5 s).
    pub fn set_control_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    pub fn product_id(&self) -> u16 {
        self.pid
    }
}

impl DfuTransport for NusbTransport {
    fn control_in(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, TransportError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length: buf.len() as u16,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))?;

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        debug!(request, value, bytes_read = len, "Control IN complete");
        Ok(len)
    }

    fn control_out(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))?;

        debug!(request, value, bytes_written = data.len(), "Control OUT complete");
        Ok(())
    }

    fn interface_description(
        &self,
        config: u8,
        interface: u8,
        alt: u8,
    ) -> Result<String, TransportError> {
        for cfg in self.device.configurations() {
            if cfg.configuration_value() != config {
                continue;
            }
            for group in cfg.interfaces() {
                if group.interface_number() != interface {
                    continue;
                }
                for setting in group.alt_settings() {
                    if setting.alternate_setting() != alt {
                        continue;
                    }
                    let index: NonZeroU8 = setting.string_index().ok_or(
                        TransportError::DescriptorNotFound {
                            config,
                            interface,
                            alt,
                        },
                    )?;
                    return self
                        .device
                        .get_string_descriptor(index, LANGUAGE_ID, self.timeout)
                        .wait()
                        .map_err(|e| TransportError::ControlFailed(e.to_string()));
                }
            }
        }
        Err(TransportError::DescriptorNotFound {
            config,
            interface,
            alt,
        })
    }

    fn close(&mut self) {
        // nusb releases the interface and device handle when dropped.
        debug!("Releasing DFU device");
    }
}
