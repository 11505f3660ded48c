//! Bootloader handoff over the DFU interface
//!
//! Interface 1 of the adapter implements the run-time part of the USB DFU
//! class. A detach request makes the firmware jump into the ST bootloader
//! after about 300 ms, which re-enumerates the device under a new identity.

use crate::constants::INTERFACE_DFU;
use crate::device::Candlelight;
use crate::error::Result;

/// DFU class requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Download = 1,
    Upload = 2,
    GetStatus = 3,
    ClearStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// Human readable name of a DFU request
pub fn request_name(request: u8) -> &'static str {
    match request {
        0 => "Detach",
        1 => "Download",
        2 => "Upload",
        3 => "GetStatus",
        4 => "ClearStatus",
        5 => "GetState",
        6 => "Abort",
        _ => "Unknown",
    }
}

/// Device states reported by GetStatus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    /// Detach received; the adapter waits for a USB reset
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    Other(u8),
}

impl From<u8> for DfuState {
    fn from(value: u8) -> Self {
        match value {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DownloadSync,
            4 => DfuState::DownloadBusy,
            5 => DfuState::DownloadIdle,
            other => DfuState::Other(other),
        }
    }
}

/// GetStatus response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    /// Minimum wait before the next GetStatus, in ms (24 bit)
    pub poll_timeout: u32,
    pub state: DfuState,
    /// String descriptor index describing the status
    pub string_index: u8,
}

impl DfuStatus {
    /// Size on the wire
    pub const SIZE: usize = 6;

    /// Unpack from bytes received via USB
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            status: data[0],
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: DfuState::from(data[4]),
            string_index: data[5],
        }
    }
}

impl Candlelight {
    /// Switch the adapter into its firmware update bootloader
    ///
    /// The session must be open on interface 1 and is consumed: the device
    /// leaves its current identity within a few hundred milliseconds.
    /// Returns true if the USB cable must be reconnected before the
    /// bootloader appears, which happens when the BOOT0 pin was disabled.
    pub fn enter_dfu_mode(mut self) -> Result<bool> {
        self.require_interface(INTERFACE_DFU)?;
        self.require_open("enter DFU mode")?;

        self.control_out(DfuRequest::Detach as u8, 0, &[])?;

        // legacy firmware detaches at once and fails this request
        let reconnect = match self.control_in(DfuRequest::GetStatus as u8, 0, DfuStatus::SIZE) {
            Ok(data) => {
                let status = DfuStatus::unpack(&data);
                log::debug!("DFU status {:?}", status);
                status.state == DfuState::AppDetach
            }
            Err(e) => {
                log::debug!("no DFU status after detach: {}", e);
                false
            }
        };

        log::info!(
            "adapter is entering DFU mode{}",
            if reconnect { ", reconnect required" } else { "" }
        );
        self.teardown();
        Ok(reconnect)
    }
}
