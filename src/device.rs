//! Candlelight adapter session
//!
//! This module provides the `Candlelight` struct that drives one adapter
//! through its lifetime: open, bit timing, filters, start, send, receive and
//! reset. Interface 0 carries the CAN protocol; a session opened on
//! interface 1 can only hand the device over to its bootloader (see `dfu`).

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acquisition::{rx_ring, AcquisitionEngine, RxConsumer, RxPoll};
use crate::bus_error::{decode_bus_error, BusError};
use crate::clock::{ClockModel, LocalClock, Timestamp};
use crate::constants::*;
use crate::dfu;
use crate::error::{CandleError, FramingError, Result};
use crate::frame::CanFrame;
use crate::message::{self, Message};
use crate::structures::{
    format_bcd_version, BitTiming, BoardInfo, Capability, DeviceMode, DeviceVersion, Feedback,
    Filter, PinCommand,
};
use crate::transport::{EndpointInfo, Transport, UsbInfo, UsbTransport};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Closed,
    /// Device identity read, no bit timing yet
    Opened,
    /// Nominal bit timing written
    Configured,
    /// Connected to the CAN bus
    Running,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame handed to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    /// Marker the matching `Received::Echo` will carry
    pub marker: u8,
    /// Local clock immediately before the bulk OUT write
    pub local_us: i64,
    /// `local_us` on the session's time of day; `None` with hardware
    /// timestamps, which run on the device clock instead
    pub timestamp: Option<Timestamp>,
}

/// One message pulled from the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Frame received from the bus
    Frame { frame: CanFrame, timestamp: Timestamp },
    /// A frame sent earlier has been acknowledged on the bus
    Echo {
        marker: u8,
        frame: CanFrame,
        timestamp: Timestamp,
    },
    /// Bus status or error report
    BusError { error: BusError, timestamp: Timestamp },
    /// Diagnostic text from the firmware
    Text(String),
    /// Bus load in percent
    Busload(u8),
}

/// Identity of the opened adapter
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub usb: UsbInfo,
    /// Classic capability, extended with the data phase limits on FD adapters
    pub capability: Capability,
    pub version: DeviceVersion,
    pub board: BoardInfo,
    /// BOOT0 pin enabled in the option bytes
    pub boot_pin_enabled: bool,
}

/// An open Candlelight adapter
///
/// # Example
///
/// ```no_run
/// use candlelight::{enumerate, CanFrame, Candlelight, Received, INTERFACE_CANDLE};
/// use std::time::Duration;
///
/// let devices = enumerate(INTERFACE_CANDLE)?;
/// let Some(entry) = devices.first() else {
///     println!("No Candlelight adapter found");
///     return Ok(());
/// };
///
/// let mut dev = Candlelight::open(&entry.path)?;
/// println!("{}", dev.set_bitrate(false, 2, 139, 20)?);
/// dev.start(candlelight::DEV_FLAG_HW_TIMESTAMP)?;
///
/// let sent = dev.send(&CanFrame::new(0x7DF, &[0x02, 0x01, 0x00]))?;
/// println!("sent with marker {}", sent.marker);
///
/// while let Some(received) = dev.receive(Duration::from_millis(500))? {
///     if let Received::Frame { frame, timestamp } = received {
///         println!("{} RX {}", timestamp, frame);
///     }
/// }
/// # Ok::<(), candlelight::CandleError>(())
/// ```
pub struct Candlelight {
    transport: Arc<dyn Transport>,
    interface: u8,
    state: SessionState,
    info: DeviceInfo,
    endpoint_in: u8,
    endpoint_out: u8,
    details: String,
    /// Hardware timestamps requested at start
    hw_timestamp: bool,
    /// Data phase bit timing written
    fd_timing: bool,
    /// Frame last sent with each marker
    echo: [Option<CanFrame>; ECHO_TABLE_SIZE],
    next_marker: u8,
    /// Last CAN Tx overflow report
    tx_guard: Option<Instant>,
    clock: ClockModel,
    local_clock: LocalClock,
    rx: Option<RxConsumer>,
    engine: Option<AcquisitionEngine>,
}

impl Candlelight {
    /// Open the adapter at a path returned by `enumerate`
    pub fn open(path: &str) -> Result<Self> {
        let transport = UsbTransport::open(path)?;
        Self::open_with(Arc::new(transport))
    }

    /// Open a session on an already claimed transport
    ///
    /// On interface 0 the device is reset and its capabilities, version and
    /// board identity are read; the firmware must speak the ElmüSoft
    /// protocol in a supported version. On interface 1 only the endpoint
    /// layout is checked.
    pub fn open_with(transport: Arc<dyn Transport>) -> Result<Self> {
        let usb = transport.info().clone();
        let interface = usb.interface_number;

        let mut session = Self {
            transport,
            interface,
            state: SessionState::Closed,
            info: DeviceInfo::default(),
            endpoint_in: 0,
            endpoint_out: 0,
            details: String::new(),
            hw_timestamp: false,
            fd_timing: false,
            echo: std::array::from_fn(|_| None),
            next_marker: 0,
            tx_guard: None,
            clock: ClockModel::new(),
            local_clock: LocalClock::new(),
            rx: None,
            engine: None,
        };
        session.describe_usb(&usb);
        session.info.usb = usb;

        match interface {
            INTERFACE_DFU => session.open_dfu()?,
            INTERFACE_CANDLE => session.open_candle()?,
            _ => return Err(CandleError::InvalidDevice("unknown interface")),
        }

        log::info!(
            "opened {:04X}:{:04X} \"{}\" on interface {}",
            session.info.usb.vendor_id,
            session.info.usb.product_id,
            session.info.usb.product,
            interface
        );
        Ok(session)
    }

    fn open_dfu(&mut self) -> Result<()> {
        // only SETUP requests on this interface
        if !self.info.usb.endpoints.is_empty() {
            return Err(CandleError::InvalidDevice("the DFU interface must not have endpoints"));
        }
        self.state = SessionState::Opened;
        Ok(())
    }

    fn open_candle(&mut self) -> Result<()> {
        let (ep_in, ep_out) = bulk_pair(&self.info.usb.endpoints)
            .ok_or(CandleError::InvalidDevice("expected one bulk IN and one bulk OUT endpoint"))?;
        self.endpoint_in = ep_in.address;
        self.endpoint_out = ep_out.address;
        self.detail(
            "USB Endpoint CTRL",
            format!("00,  max packet size: {} byte", self.info.usb.max_packet_size0),
        );
        self.detail(
            "USB Endpoint IN",
            format!("{:02X},  max packet size: {} byte", ep_in.address, ep_in.max_packet_size),
        );
        self.detail(
            "USB Endpoint OUT",
            format!("{:02X},  max packet size: {} byte", ep_out.address, ep_out.max_packet_size),
        );

        // the device may still be open from a previous session
        self.send_reset()?;

        let data = self.control_in(GS_REQ_GET_CAPABILITY, 0, Capability::SIZE)?;
        let mut capability = Capability::unpack(&data);
        if capability.supports_fd() {
            let data = self.control_in(GS_REQ_GET_CAPABILITY_FD, 0, Capability::SIZE_FD)?;
            capability = Capability::unpack_fd(&data);
        }
        let data = self.control_in(GS_REQ_GET_DEVICE_VERSION, 0, DeviceVersion::SIZE)?;
        let version = DeviceVersion::unpack(&data);
        self.info.capability = capability;
        self.info.version = version;

        self.detail("Hardware Version", version.hardware());
        self.detail("Firmware Version", version.software());
        self.detail(
            "Firmware Type",
            if capability.is_elmue() { "CANable 2.5" } else { "Legacy" },
        );
        self.detail(
            "Supports CAN FD",
            if capability.supports_fd() { "Yes" } else { "No" },
        );

        if !capability.is_elmue() {
            self.detail("CAN Clock", format!("{} MHz", capability.clock_mhz()));
            return Err(CandleError::LegacyFirmware);
        }

        let data = self.control_in(ELM_REQ_GET_BOARD_INFO, 0, BoardInfo::SIZE)?;
        let board = BoardInfo::unpack(&data);
        let boot_pin_enabled = self.read_boot_pin()?;

        self.detail("Target Board", board.board_name.clone());
        self.detail(
            "Processor",
            format!(
                "{}, CAN Clock: {} MHz, DeviceID: 0x{:X}",
                board.mcu_name,
                capability.clock_mhz(),
                board.mcu_device_id
            ),
        );
        self.detail(
            "Pin BOOT0",
            if boot_pin_enabled { "Enabled" } else { "Disabled" },
        );
        self.info.board = board;
        self.info.boot_pin_enabled = boot_pin_enabled;

        if version.sw_version_bcd < MIN_FIRMWARE_VERSION {
            return Err(CandleError::FirmwareTooOld {
                found: version.software(),
                required: format_bcd_version(MIN_FIRMWARE_VERSION),
            });
        }

        let (producer, consumer) = rx_ring(RX_RING_CAPACITY);
        self.engine = Some(AcquisitionEngine::spawn(
            self.transport.clone(),
            self.endpoint_in,
            producer,
            self.local_clock,
        )?);
        self.rx = Some(consumer);
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Write the bit timing of the nominal or the data phase
    ///
    /// The values are not range checked here, the firmware rejects invalid
    /// ones. Returns a summary like "Nominal Baudrate: 500k, Samplepoint: 87.5%".
    ///
    /// # Arguments
    /// * `fd` - Data phase timing (CAN FD) instead of nominal timing
    /// * `brp` - Baud rate prescaler
    /// * `seg1` - Time quanta before the sample point
    /// * `seg2` - Time quanta after the sample point
    pub fn set_bitrate(&mut self, fd: bool, brp: u32, seg1: u32, seg2: u32) -> Result<String> {
        self.require_configurable("set the bitrate")?;
        if fd && !self.info.capability.supports_fd() {
            return Err(CandleError::FdNotSupported);
        }

        let timing = BitTiming::new(brp, seg1, seg2);
        let request = if fd {
            GS_REQ_SET_BIT_TIMING_FD
        } else {
            GS_REQ_SET_BIT_TIMING
        };
        self.control_out(request, 0, &timing.pack())?;

        let summary = timing.describe(self.info.capability.clock_hz, fd);
        log::debug!("{}", summary);
        if fd {
            self.fd_timing = true;
        }
        // data phase timing alone does not allow a start
        if !fd && self.state == SessionState::Opened {
            self.state = SessionState::Configured;
        }
        Ok(summary)
    }

    /// Add an acceptance mask filter
    ///
    /// Once an 11-bit filter is set, no 29-bit identifiers pass unless a
    /// 29-bit filter is added as well, and vice versa.
    pub fn add_mask_filter(&mut self, extended: bool, filter: u32, mask: u32) -> Result<()> {
        self.require_configurable("add a filter")?;
        let operation = if extended {
            FILTER_OP_MASK_29
        } else {
            FILTER_OP_MASK_11
        };
        let record = Filter {
            operation,
            filter,
            mask,
        };
        self.control_out(ELM_REQ_SET_FILTER, 0, &record.pack())
    }

    /// Remove all acceptance filters
    pub fn clear_filters(&mut self) -> Result<()> {
        self.require_configurable("clear the filters")?;
        let record = Filter {
            operation: FILTER_OP_CLEAR_ALL,
            filter: 0,
            mask: 0,
        };
        self.control_out(ELM_REQ_SET_FILTER, 0, &record.pack())
    }

    /// Connect to the CAN bus
    ///
    /// # Arguments
    /// * `flags` - Combination of DEV_FLAG_* constants; the ElmüSoft
    ///   protocol flag is always added
    pub fn start(&mut self, flags: u32) -> Result<()> {
        self.require_interface(INTERFACE_CANDLE)?;
        if self.state != SessionState::Configured {
            return Err(self.state_error("start"));
        }

        let flags = flags | DEV_FLAG_PROTOCOL_ELMUE;
        let mode = DeviceMode::new(DEV_MODE_START, flags);
        self.control_out(GS_REQ_SET_DEVICE_MODE, 0, &mode.pack())?;

        self.hw_timestamp = flags & DEV_FLAG_HW_TIMESTAMP != 0;
        self.state = SessionState::Running;
        log::info!("started with flags 0x{:04X}", flags);
        Ok(())
    }

    /// Leave the CAN bus and reset all settings in the firmware
    ///
    /// Bit timing and filters must be written again before the next start.
    pub fn reset(&mut self) -> Result<()> {
        self.require_interface(INTERFACE_CANDLE)?;
        self.require_open("reset")?;
        self.state = SessionState::Opened;
        self.fd_timing = false;
        self.send_reset()?;
        log::info!("adapter reset");
        Ok(())
    }

    fn send_reset(&mut self) -> Result<()> {
        // legacy firmware ignores flags sent with reset
        let mode = DeviceMode::new(DEV_MODE_RESET, DEV_FLAG_PROTOCOL_ELMUE);
        self.control_out(GS_REQ_SET_DEVICE_MODE, 0, &mode.pack())
    }

    /// Blink the LEDs of the adapter
    pub fn identify(&mut self, blink: bool) -> Result<()> {
        self.require_candle("identify")?;
        self.control_out(GS_REQ_IDENTIFY, 0, &u32::from(blink).to_le_bytes())
    }

    /// Report the bus load every `interval` x 100 ms, 0 turns it off
    ///
    /// The firmware stays silent while the bus load is 0%.
    pub fn set_busload_report(&mut self, interval: u8) -> Result<()> {
        self.require_candle("set the bus load report")?;
        self.control_out(ELM_REQ_SET_BUSLOAD_REPORT, 0, &[interval])
    }

    /// Switch the termination resistor
    pub fn set_termination(&mut self, enabled: bool) -> Result<()> {
        self.require_candle("set the termination")?;
        let value = if enabled { TERMINATION_ON } else { TERMINATION_OFF };
        self.control_out(GS_REQ_SET_TERMINATION, 0, &value.to_le_bytes())
    }

    /// Termination resistor state; fails on boards that cannot switch it
    pub fn termination(&mut self) -> Result<bool> {
        self.require_candle("read the termination")?;
        let data = self.control_in(GS_REQ_GET_TERMINATION, 0, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == TERMINATION_ON)
    }

    /// Current value of the 32-bit device clock in microseconds
    pub fn device_time(&mut self) -> Result<u32> {
        self.require_candle("read the device time")?;
        let data = self.control_in(GS_REQ_GET_TIMESTAMP, 0, 4)?;
        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Disable the BOOT0 pin in the option bytes
    ///
    /// Entering DFU mode enables the pin again.
    pub fn disable_boot_pin(&mut self) -> Result<()> {
        self.require_candle("disable the boot pin")?;
        let command = PinCommand {
            operation: PIN_OP_DISABLE,
            pin: PIN_ID_BOOT0,
        };
        self.control_out(ELM_REQ_SET_PIN_STATUS, 0, &command.pack())?;
        self.info.boot_pin_enabled = false;
        Ok(())
    }

    /// Query the BOOT0 pin
    pub fn is_boot_pin_enabled(&mut self) -> Result<bool> {
        self.require_candle("query the boot pin")?;
        let enabled = self.read_boot_pin()?;
        self.info.boot_pin_enabled = enabled;
        Ok(enabled)
    }

    fn read_boot_pin(&self) -> Result<bool> {
        // the pin id travels in wValue
        let data = self.control_in(ELM_REQ_GET_PIN_STATUS, PIN_ID_BOOT0, 2)?;
        let status = u16::from_le_bytes([data[0], data[1]]);
        Ok(status & PIN_STATUS_ENABLED != 0)
    }

    /// Send a CAN frame
    ///
    /// The frame is checked before anything is transferred. Payloads above
    /// 8 bytes are zero padded to the next CAN FD length.
    pub fn send(&mut self, frame: &CanFrame) -> Result<Sent> {
        self.require_interface(INTERFACE_CANDLE)?;
        if self.state != SessionState::Running {
            return Err(self.state_error("send"));
        }

        let max = if self.fd_timing {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        };
        if frame.data.len() > max {
            return Err(CandleError::PayloadTooLong {
                len: frame.data.len(),
                max,
            });
        }
        if self.fd_timing && frame.remote {
            return Err(CandleError::RemoteInFdMode);
        }
        if !self.fd_timing && (frame.fd || frame.brs) {
            return Err(CandleError::FdWithoutDataTiming);
        }
        if self
            .tx_guard
            .is_some_and(|since| since.elapsed() < TX_OVERFLOW_GUARD)
        {
            return Err(CandleError::TxBufferFull);
        }
        if frame.id > frame.id_mask() {
            return Err(CandleError::InvalidId {
                id: frame.id,
                bits: if frame.extended { 29 } else { 11 },
            });
        }
        if frame.remote && frame.data.len() > 1 {
            return Err(CandleError::RemotePayload(frame.data.len()));
        }

        let marker = self.next_marker;
        let packet = message::encode_tx_frame(frame, marker);
        self.echo[marker as usize] = Some(frame.clone());

        let local_us = self.local_clock.now_us();
        self.transport
            .write_bulk(self.endpoint_out, &packet, USB_TIMEOUT)
            .map_err(CandleError::BulkTransfer)?;
        log::trace!("TX [{}] {}", marker, frame);

        self.next_marker = marker.wrapping_add(1);
        let timestamp = (!self.hw_timestamp).then(|| self.clock.convert(None, local_us));
        Ok(Sent {
            marker,
            local_us,
            timestamp,
        })
    }

    /// Wait up to `timeout` for the next message
    ///
    /// Returns `Ok(None)` when nothing arrived. A malformed message fails
    /// this call only; the next call continues with the following message.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Received>> {
        self.require_candle("receive")?;
        let rx = self.rx.as_ref().ok_or_else(|| self.state_error("receive"))?;

        let entry = match rx.pop(timeout) {
            RxPoll::Empty => return Ok(None),
            RxPoll::Overflow => {
                log::warn!("USB IN buffer overflow, the device held back messages");
                return Err(CandleError::BufferOverflow);
            }
            RxPoll::Item(entry) => entry,
        };
        let data = entry.payload.map_err(CandleError::BulkTransfer)?;
        log::trace!("RX {:02X?}", data);

        let message = message::decode(&data, self.hw_timestamp)?;
        let device_stamp = message.device_timestamp();

        let received = match message {
            Message::RxFrame { frame, .. } => Received::Frame {
                frame,
                timestamp: self.clock.convert(device_stamp, entry.captured_us),
            },
            Message::TxEcho { marker, .. } => {
                let frame = self.echo[marker as usize]
                    .clone()
                    .ok_or(CandleError::UnknownEchoMarker(marker))?;
                Received::Echo {
                    marker,
                    frame,
                    timestamp: self.clock.convert(device_stamp, entry.captured_us),
                }
            }
            Message::Error {
                error_id, data, ..
            } => {
                let error = decode_bus_error(error_id, &data);
                self.tx_guard = error.tx_overflow.then(Instant::now);
                Received::BusError {
                    error,
                    timestamp: self.clock.convert(device_stamp, entry.captured_us),
                }
            }
            Message::String(text) => Received::Text(text),
            Message::Busload(percent) => Received::Busload(percent),
            // only the host sends frames
            Message::TxFrame { .. } => {
                return Err(FramingError::UnknownType(MSG_TX_FRAME).into());
            }
        };
        Ok(Some(received))
    }

    /// Reset the adapter and release the interface
    ///
    /// Errors while resetting are logged and otherwise ignored.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.interface == INTERFACE_CANDLE {
            if let Err(e) = self.send_reset() {
                log::warn!("reset on close failed: {}", e);
            }
        }
        self.teardown();
    }

    /// Stop acquisition and mark the session closed without talking to the device
    pub(crate) fn teardown(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown();
        }
        self.rx = None;
        self.state = SessionState::Closed;
        log::debug!("session closed");
    }

    /// Multi-line report of the device identity collected at open
    pub fn details(&self) -> &str {
        &self.details
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// USB interface the session is open on
    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Identity read at open
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device timestamps are carried in received messages
    pub fn hardware_timestamps(&self) -> bool {
        self.hw_timestamp
    }

    /// Data phase bit timing has been written since the last reset
    pub fn fd_enabled(&self) -> bool {
        self.fd_timing
    }

    fn detail(&mut self, label: &str, value: impl std::fmt::Display) {
        let _ = writeln!(self.details, "{:<22}{}", format!("{}:", label), value);
    }

    fn describe_usb(&mut self, usb: &UsbInfo) {
        self.detail("USB Vendor", format!("\"{}\"", usb.manufacturer));
        self.detail("USB Product", format!("\"{}\"", usb.product));
        self.detail("USB Serial Nº", format!("\"{}\"", usb.serial_number));
        self.detail("USB Interface", format!("\"{}\"", usb.interface_name));
        self.detail("USB Vendor ID", format!("{:04X}", usb.vendor_id));
        self.detail("USB Product ID", format!("{:04X}", usb.product_id));
        self.detail("USB Device Version", &usb.device_version);
    }

    fn state_error(&self, operation: &'static str) -> CandleError {
        CandleError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }

    pub(crate) fn require_interface(&self, expected: u8) -> Result<()> {
        if self.interface != expected {
            return Err(CandleError::WrongInterface {
                expected,
                actual: self.interface,
            });
        }
        Ok(())
    }

    pub(crate) fn require_open(&self, operation: &'static str) -> Result<()> {
        if self.state == SessionState::Closed {
            return Err(self.state_error(operation));
        }
        Ok(())
    }

    fn require_candle(&self, operation: &'static str) -> Result<()> {
        self.require_interface(INTERFACE_CANDLE)?;
        self.require_open(operation)
    }

    fn require_configurable(&self, operation: &'static str) -> Result<()> {
        self.require_candle(operation)?;
        if self.state == SessionState::Running {
            return Err(self.state_error(operation));
        }
        Ok(())
    }

    fn request_type(&self, device_to_host: bool) -> u8 {
        // recipient interface; vendor requests on interface 0, class on 1
        let kind = if self.interface == INTERFACE_CANDLE {
            0x40
        } else {
            0x20
        };
        let direction = if device_to_host { 0x80 } else { 0x00 };
        direction | kind | 0x01
    }

    fn request_label(&self, request: u8) -> &'static str {
        if self.interface == INTERFACE_CANDLE {
            request_name(request)
        } else {
            dfu::request_name(request)
        }
    }

    /// Fetch the feedback of the previous command
    ///
    /// The firmware cannot stall the status stage of a SETUP request, so a
    /// rejection is only visible here. Legacy firmware stalls this request,
    /// which counts as no feedback.
    fn check_feedback(&self, request: u8, value: u16) -> Result<()> {
        if self.interface != INTERFACE_CANDLE {
            return Ok(());
        }
        let mut buf = [0u8; 4];
        let result = self.transport.read_control(
            self.request_type(true),
            ELM_REQ_GET_LAST_ERROR,
            value,
            self.interface as u16,
            &mut buf,
            USB_TIMEOUT,
        );
        match result {
            Ok(len) if len >= 1 => match Feedback::from_u8(buf[0]) {
                Feedback::Success => Ok(()),
                feedback => Err(CandleError::Rejected {
                    request: self.request_label(request),
                    feedback,
                }),
            },
            _ => Ok(()),
        }
    }

    /// Perform a control OUT transfer followed by the feedback check
    pub(crate) fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        log::debug!("{} ({} bytes)", self.request_label(request), data.len());
        let result = self.transport.write_control(
            self.request_type(false),
            request,
            value,
            self.interface as u16,
            data,
            USB_TIMEOUT,
        );
        self.check_feedback(request, value)?;
        result.map_err(|source| CandleError::ControlTransfer {
            request: self.request_label(request),
            source,
        })?;
        Ok(())
    }

    /// Perform a control IN transfer followed by the feedback check
    pub(crate) fn control_in(&self, request: u8, value: u16, length: usize) -> Result<Vec<u8>> {
        log::debug!("{}", self.request_label(request));
        let mut buf = vec![0u8; length];
        let result = self.transport.read_control(
            self.request_type(true),
            request,
            value,
            self.interface as u16,
            &mut buf,
            USB_TIMEOUT,
        );
        self.check_feedback(request, value)?;
        let len = result.map_err(|source| CandleError::ControlTransfer {
            request: self.request_label(request),
            source,
        })?;

        if len < length {
            return Err(CandleError::InvalidResponse {
                request: self.request_label(request),
                expected: length,
                actual: len,
            });
        }
        Ok(buf)
    }
}

/// Split the endpoints of interface 0 into the bulk IN and OUT pair
fn bulk_pair(endpoints: &[EndpointInfo]) -> Option<(EndpointInfo, EndpointInfo)> {
    let [a, b] = endpoints else {
        return None;
    };
    let (ep_in, ep_out) = if a.is_in() { (*a, *b) } else { (*b, *a) };
    (ep_in.bulk && ep_out.bulk && ep_in.is_in() && !ep_out.is_in()).then_some((ep_in, ep_out))
}

impl std::fmt::Display for Candlelight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Candlelight {:04X}:{:04X} (interface {}, {})",
            self.info.usb.vendor_id, self.info.usb.product_id, self.interface, self.state
        )
    }
}

impl std::fmt::Debug for Candlelight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candlelight")
            .field("interface", &self.interface)
            .field("state", &self.state)
            .field("hw_timestamp", &self.hw_timestamp)
            .field("fd_timing", &self.fd_timing)
            .field("next_marker", &self.next_marker)
            .finish()
    }
}

impl Drop for Candlelight {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::thread;

    use crate::bus_error::BusStatus;
    use crate::transport::mock::MockTransport;

    const WAIT: Duration = Duration::from_secs(2);

    pub(crate) fn candle_usb() -> UsbInfo {
        UsbInfo {
            vendor_id: 0x1D50,
            product_id: 0x606F,
            manufacturer: "ElmueSoft".into(),
            product: "CANable 2.5".into(),
            interface_number: INTERFACE_CANDLE,
            max_packet_size0: 64,
            endpoints: vec![
                EndpointInfo {
                    address: 0x81,
                    max_packet_size: 64,
                    bulk: true,
                },
                EndpointInfo {
                    address: 0x02,
                    max_packet_size: 64,
                    bulk: true,
                },
            ],
            ..UsbInfo::default()
        }
    }

    pub(crate) fn dfu_usb() -> UsbInfo {
        UsbInfo {
            interface_number: INTERFACE_DFU,
            endpoints: Vec::new(),
            ..candle_usb()
        }
    }

    pub(crate) fn scripted(usb: UsbInfo, feature: u32, firmware: u32) -> Arc<MockTransport> {
        let mock = MockTransport::new(usb);

        let mut capability = vec![0u8; Capability::SIZE_FD];
        capability[0..4].copy_from_slice(&feature.to_le_bytes());
        capability[4..8].copy_from_slice(&160_000_000u32.to_le_bytes());
        mock.respond(GS_REQ_GET_CAPABILITY, capability[..Capability::SIZE].to_vec());
        mock.respond(GS_REQ_GET_CAPABILITY_FD, capability);

        let mut version = vec![0u8; DeviceVersion::SIZE];
        version[4..8].copy_from_slice(&firmware.to_le_bytes());
        version[8..12].copy_from_slice(&0x0000_0201u32.to_le_bytes());
        mock.respond(GS_REQ_GET_DEVICE_VERSION, version);

        let mut board = vec![0u8; BoardInfo::SIZE];
        board[0..2].copy_from_slice(&0x468u16.to_le_bytes());
        board[2..13].copy_from_slice(b"STM32G431xx");
        board[27..39].copy_from_slice(b"MksMakerbase");
        mock.respond(ELM_REQ_GET_BOARD_INFO, board);
        mock.respond(ELM_REQ_GET_PIN_STATUS, vec![PIN_STATUS_ENABLED as u8, 0]);

        Arc::new(mock)
    }

    fn classic() -> Arc<MockTransport> {
        scripted(candle_usb(), DEV_FLAG_PROTOCOL_ELMUE, MIN_FIRMWARE_VERSION)
    }

    fn fd_capable() -> Arc<MockTransport> {
        scripted(
            candle_usb(),
            DEV_FLAG_PROTOCOL_ELMUE | DEV_FLAG_CAN_FD | DEV_FLAG_BIT_TIMING_FD,
            MIN_FIRMWARE_VERSION,
        )
    }

    fn running(mock: &Arc<MockTransport>, flags: u32) -> Candlelight {
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        dev.set_bitrate(false, 2, 139, 20).unwrap();
        dev.start(flags).unwrap();
        dev
    }

    fn receive(dev: &mut Candlelight) -> Received {
        dev.receive(WAIT).unwrap().expect("message expected")
    }

    #[test]
    fn test_open_sequence() {
        let mock = fd_capable();
        let dev = Candlelight::open_with(mock.clone()).unwrap();
        assert_eq!(dev.state(), SessionState::Opened);

        let requests: Vec<u8> = mock.commands().iter().map(|c| c.request).collect();
        assert_eq!(
            requests,
            vec![
                GS_REQ_SET_DEVICE_MODE,
                GS_REQ_GET_CAPABILITY,
                GS_REQ_GET_CAPABILITY_FD,
                GS_REQ_GET_DEVICE_VERSION,
                ELM_REQ_GET_BOARD_INFO,
                ELM_REQ_GET_PIN_STATUS,
            ]
        );

        let commands = mock.commands();
        assert_eq!(commands[0].request_type, 0x41);
        assert_eq!(commands[0].data, DeviceMode::new(0, DEV_FLAG_PROTOCOL_ELMUE).pack());
        assert_eq!(commands[1].request_type, 0xC1);
        assert_eq!(commands[5].value, PIN_ID_BOOT0);

        let info = dev.info();
        assert!(info.capability.data.is_some());
        assert_eq!(info.board.mcu_name, "STM32G431xx");
        assert_eq!(info.board.board_name, "MksMakerbase");
        assert!(info.boot_pin_enabled);
        assert!(dev.details().contains("Firmware Version:     25.11.18"));
        assert!(dev.details().contains("USB Endpoint IN:      81"));
    }

    #[test]
    fn test_feedback_read_after_every_command() {
        let mock = classic();
        let _dev = Candlelight::open_with(mock.clone()).unwrap();
        let calls = mock.controls.lock().unwrap().clone();
        // every command is directly followed by GetLastError
        for pair in calls.chunks(2) {
            assert_ne!(pair[0].request, ELM_REQ_GET_LAST_ERROR);
            assert_eq!(pair[1].request, ELM_REQ_GET_LAST_ERROR);
            assert_eq!(pair[1].request_type, 0xC1);
            assert_eq!(pair[1].value, pair[0].value);
        }
    }

    #[test]
    fn test_open_rejects_legacy_firmware() {
        let mock = scripted(candle_usb(), DEV_FLAG_HW_TIMESTAMP, MIN_FIRMWARE_VERSION);
        let err = Candlelight::open_with(mock.clone()).unwrap_err();
        assert!(matches!(err, CandleError::LegacyFirmware));
        // nothing is asked after the protocol check
        assert!(!mock
            .commands()
            .iter()
            .any(|c| c.request == ELM_REQ_GET_BOARD_INFO));
    }

    #[test]
    fn test_open_rejects_old_firmware() {
        let mock = scripted(candle_usb(), DEV_FLAG_PROTOCOL_ELMUE, 0x0025_1001);
        match Candlelight::open_with(mock).unwrap_err() {
            CandleError::FirmwareTooOld { found, required } => {
                assert_eq!(found, "25.10.01");
                assert_eq!(required, "25.11.18");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_checks_endpoint_shape() {
        let mut usb = candle_usb();
        usb.endpoints.pop();
        let mock = scripted(usb, DEV_FLAG_PROTOCOL_ELMUE, MIN_FIRMWARE_VERSION);
        assert!(matches!(
            Candlelight::open_with(mock.clone()),
            Err(CandleError::InvalidDevice(_))
        ));
        assert!(mock.commands().is_empty());

        let mut usb = candle_usb();
        usb.endpoints[1].address = 0x82;
        let mock = scripted(usb, DEV_FLAG_PROTOCOL_ELMUE, MIN_FIRMWARE_VERSION);
        assert!(matches!(
            Candlelight::open_with(mock),
            Err(CandleError::InvalidDevice(_))
        ));

        let mut usb = dfu_usb();
        usb.endpoints = candle_usb().endpoints;
        let mock = scripted(usb, DEV_FLAG_PROTOCOL_ELMUE, MIN_FIRMWARE_VERSION);
        assert!(matches!(
            Candlelight::open_with(mock),
            Err(CandleError::InvalidDevice(_))
        ));
    }

    #[test]
    fn test_open_dfu_interface_sends_nothing() {
        let mock = scripted(dfu_usb(), 0, 0);
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        assert_eq!(dev.state(), SessionState::Opened);
        assert!(mock.controls.lock().unwrap().is_empty());
        assert!(matches!(
            dev.set_bitrate(false, 2, 139, 20),
            Err(CandleError::WrongInterface {
                expected: 0,
                actual: 1
            })
        ));
        drop(dev);
        // no reset on the DFU interface
        assert!(mock.controls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rejection_names_command() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        mock.queue_feedback(b'2');
        match dev.set_bitrate(false, 2, 139, 20).unwrap_err() {
            CandleError::Rejected { request, feedback } => {
                assert_eq!(request, "SetBitTiming");
                assert_eq!(feedback, Feedback::InvalidParameter);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dev.state(), SessionState::Opened);
    }

    #[test]
    fn test_transport_error_without_feedback() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        mock.fail(GS_REQ_IDENTIFY);
        match dev.identify(true).unwrap_err() {
            CandleError::ControlTransfer { request, source } => {
                assert_eq!(request, "Identify");
                assert_eq!(source, rusb::Error::Pipe);
            }
            other => panic!("unexpected {:?}", other),
        }

        // feedback wins over the transport error
        mock.queue_feedback(b'3');
        assert!(matches!(
            dev.identify(false),
            Err(CandleError::Rejected {
                feedback: Feedback::AdapterMustBeOpen,
                ..
            })
        ));
    }

    #[test]
    fn test_short_response() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        mock.respond(GS_REQ_GET_TIMESTAMP, vec![1, 2]);
        assert!(matches!(
            dev.device_time(),
            Err(CandleError::InvalidResponse {
                expected: 4,
                actual: 2,
                ..
            })
        ));
        mock.respond(GS_REQ_GET_TIMESTAMP, 123_456u32.to_le_bytes().to_vec());
        assert_eq!(dev.device_time().unwrap(), 123_456);
    }

    #[test]
    fn test_set_bitrate_and_states() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        assert!(matches!(
            dev.start(0),
            Err(CandleError::InvalidState { operation: "start", state: "opened" })
        ));

        let summary = dev.set_bitrate(false, 2, 139, 20).unwrap();
        assert_eq!(summary, "Nominal Baudrate: 500k, Samplepoint: 87.5%");
        assert_eq!(dev.state(), SessionState::Configured);
        let last = mock.commands().pop().unwrap();
        assert_eq!(last.request, GS_REQ_SET_BIT_TIMING);
        assert_eq!(last.data, BitTiming::new(2, 139, 20).pack());

        assert!(matches!(
            dev.set_bitrate(true, 2, 29, 10),
            Err(CandleError::FdNotSupported)
        ));

        dev.start(DEV_FLAG_HW_TIMESTAMP).unwrap();
        assert_eq!(dev.state(), SessionState::Running);
        assert!(dev.hardware_timestamps());
        let last = mock.commands().pop().unwrap();
        assert_eq!(
            last.data,
            DeviceMode::new(1, DEV_FLAG_HW_TIMESTAMP | DEV_FLAG_PROTOCOL_ELMUE).pack()
        );

        assert!(matches!(
            dev.set_bitrate(false, 2, 139, 20),
            Err(CandleError::InvalidState { .. })
        ));

        dev.reset().unwrap();
        assert_eq!(dev.state(), SessionState::Opened);
        assert!(matches!(dev.start(0), Err(CandleError::InvalidState { .. })));
    }

    #[test]
    fn test_fd_bitrate() {
        let mock = fd_capable();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        dev.set_bitrate(false, 2, 139, 20).unwrap();
        let summary = dev.set_bitrate(true, 2, 29, 10).unwrap();
        assert_eq!(summary, "Data Baudrate: 2M, Samplepoint: 75.0%");
        assert!(dev.fd_enabled());
        assert_eq!(mock.commands().pop().unwrap().request, GS_REQ_SET_BIT_TIMING_FD);
    }

    #[test]
    fn test_data_timing_alone_does_not_configure() {
        let mock = fd_capable();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();

        dev.set_bitrate(true, 2, 29, 10).unwrap();
        assert!(dev.fd_enabled());
        assert_eq!(dev.state(), SessionState::Opened);
        assert!(matches!(
            dev.start(0),
            Err(CandleError::InvalidState { operation: "start", state: "opened" })
        ));
        assert_ne!(mock.commands().pop().unwrap().request, GS_REQ_SET_DEVICE_MODE);

        dev.set_bitrate(false, 2, 139, 20).unwrap();
        assert_eq!(dev.state(), SessionState::Configured);
        dev.start(0).unwrap();
        assert_eq!(dev.state(), SessionState::Running);
        assert!(dev.fd_enabled());
    }

    #[test]
    fn test_filters_and_pins() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();

        dev.add_mask_filter(true, 0x18DA_F100, 0x1FFF_FF00).unwrap();
        let last = mock.commands().pop().unwrap();
        assert_eq!(last.request, ELM_REQ_SET_FILTER);
        assert_eq!(last.data.len(), 17);
        assert_eq!(last.data[0], FILTER_OP_MASK_29);

        dev.clear_filters().unwrap();
        assert_eq!(mock.commands().pop().unwrap().data[0], FILTER_OP_CLEAR_ALL);

        dev.disable_boot_pin().unwrap();
        let last = mock.commands().pop().unwrap();
        assert_eq!(last.data[0..4], [5, 0, 1, 0]);
        assert!(!dev.info().boot_pin_enabled);

        mock.respond(ELM_REQ_GET_PIN_STATUS, vec![PIN_STATUS_HIGH as u8, 0]);
        assert!(!dev.is_boot_pin_enabled().unwrap());

        dev.set_busload_report(7).unwrap();
        assert_eq!(mock.commands().pop().unwrap().data, vec![7]);

        mock.respond(GS_REQ_GET_TERMINATION, TERMINATION_ON.to_le_bytes().to_vec());
        assert!(dev.termination().unwrap());
        dev.set_termination(false).unwrap();
        assert_eq!(mock.commands().pop().unwrap().data, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_send_checks() {
        let mock = classic();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        assert!(matches!(
            dev.send(&CanFrame::new(0x123, &[1])),
            Err(CandleError::InvalidState { operation: "send", .. })
        ));
        dev.set_bitrate(false, 2, 139, 20).unwrap();
        dev.start(0).unwrap();

        assert!(matches!(
            dev.send(&CanFrame::new(0x123, &[0; 9])),
            Err(CandleError::PayloadTooLong { len: 9, max: 8 })
        ));
        assert!(matches!(
            dev.send(&CanFrame::new_fd(0x123, false, &[1], false)),
            Err(CandleError::FdWithoutDataTiming)
        ));
        assert!(matches!(
            dev.send(&CanFrame::new(0x800, &[])),
            Err(CandleError::InvalidId { id: 0x800, bits: 11 })
        ));
        assert!(dev.send(&CanFrame::new_extended(0x800, &[])).is_ok());

        let mut remote = CanFrame::remote(0x7DF, false, 8);
        assert!(dev.send(&remote).is_ok());
        remote.data.push(0);
        assert!(matches!(
            dev.send(&remote),
            Err(CandleError::RemotePayload(2))
        ));

        // only the two accepted frames went out
        assert_eq!(mock.bulk_out.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_send_fd_frames() {
        let mock = fd_capable();
        let mut dev = Candlelight::open_with(mock.clone()).unwrap();
        dev.set_bitrate(false, 2, 139, 20).unwrap();
        dev.set_bitrate(true, 2, 29, 10).unwrap();
        dev.start(0).unwrap();

        assert!(matches!(
            dev.send(&CanFrame::remote(0x100, false, 1)),
            Err(CandleError::RemoteInFdMode)
        ));
        assert!(matches!(
            dev.send(&CanFrame::new_fd(0x100, false, &[0; 65], true)),
            Err(CandleError::PayloadTooLong { len: 65, max: 64 })
        ));

        let sent = dev.send(&CanFrame::new_fd(0x100, false, &[0xAA; 33], true)).unwrap();
        assert_eq!(sent.marker, 0);
        let packet = mock.bulk_out.lock().unwrap().pop().unwrap();
        assert_eq!(packet.len(), 8 + 48);
        assert_eq!(packet[0], 56);
        assert_eq!(packet[2], FRAME_FLAG_FDF | FRAME_FLAG_BRS);
        assert!(packet[8..41].iter().all(|&b| b == 0xAA));
        assert!(packet[41..].iter().all(|&b| b == 0));
    }

    fn echo_message(marker: u8) -> Vec<u8> {
        vec![3, MSG_TX_ECHO, marker]
    }

    #[test]
    fn test_echo_correlation_beyond_marker_space() {
        let mock = classic();
        let mut dev = running(&mock, 0);

        for i in 0..300u32 {
            let sent = dev.send(&CanFrame::new(i, &[i as u8])).unwrap();
            assert_eq!(sent.marker, (i % 256) as u8);
        }

        // frames 44..300 own the markers now, marker 0 belongs to frame 256
        let mut markers: Vec<u8> = (0..=255).collect();
        markers.reverse();
        markers.swap(3, 200);
        for batch in markers.chunks(10) {
            for &marker in batch {
                mock.push_in(Ok(echo_message(marker)));
            }
            for &marker in batch {
                match receive(&mut dev) {
                    Received::Echo {
                        marker: got, frame, ..
                    } => {
                        assert_eq!(got, marker);
                        let expected = if marker < 44 {
                            256 + marker as u32
                        } else {
                            marker as u32
                        };
                        assert_eq!(frame.id, expected);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
    }

    #[test]
    fn test_echo_for_unused_marker() {
        let mock = classic();
        let mut dev = running(&mock, 0);
        mock.push_in(Ok(echo_message(9)));
        assert!(matches!(
            dev.receive(WAIT),
            Err(CandleError::UnknownEchoMarker(9))
        ));
    }

    fn error_message(app_flags: u8) -> Vec<u8> {
        let mut msg = vec![14, MSG_ERROR, 0, 0, 0, 0];
        msg.extend_from_slice(&[0, 0, 0, 0, 0, app_flags, 0, 0]);
        msg
    }

    #[test]
    fn test_tx_overflow_guard() {
        let mock = classic();
        let mut dev = running(&mock, 0);
        let frame = CanFrame::new(0x123, &[1, 2]);

        mock.push_in(Ok(error_message(APP_FLAG_CAN_TX_OVERFLOW)));
        match receive(&mut dev) {
            Received::BusError { error, .. } => {
                assert!(error.tx_overflow);
                assert_eq!(error.status, BusStatus::Active);
            }
            other => panic!("unexpected {:?}", other),
        }

        // every send inside the window is rejected
        assert!(matches!(dev.send(&frame), Err(CandleError::TxBufferFull)));
        assert!(matches!(dev.send(&frame), Err(CandleError::TxBufferFull)));
        assert!(mock.bulk_out.lock().unwrap().is_empty());

        mock.push_in(Ok(error_message(0)));
        receive(&mut dev);
        assert!(dev.send(&frame).is_ok());
    }

    #[test]
    fn test_receive_dispatch() {
        let mock = classic();
        let mut dev = running(&mock, DEV_FLAG_HW_TIMESTAMP);

        // RxFrame: head, flags, id, timestamp, data
        let mut rx = vec![14, MSG_RX_FRAME, 0];
        rx.extend_from_slice(&(0x18DA_F110u32 | CAN_EFF_FLAG).to_le_bytes());
        rx.extend_from_slice(&1_000u32.to_le_bytes());
        rx.extend_from_slice(&[0x10, 0x20, 0x30]);
        mock.push_in(Ok(rx));

        let mut rx = vec![11, MSG_RX_FRAME, 0];
        rx.extend_from_slice(&0x7E8u32.to_le_bytes());
        rx.extend_from_slice(&3_500u32.to_le_bytes());
        mock.push_in(Ok(rx));

        let mut text = vec![0, MSG_STRING];
        text.extend_from_slice(b"Hello");
        text[0] = text.len() as u8;
        mock.push_in(Ok(text));
        mock.push_in(Ok(vec![3, MSG_BUSLOAD, 42]));

        let first = match receive(&mut dev) {
            Received::Frame { frame, timestamp } => {
                assert!(frame.extended);
                assert_eq!(frame.id, 0x18DA_F110);
                assert_eq!(frame.data, vec![0x10, 0x20, 0x30]);
                timestamp
            }
            other => panic!("unexpected {:?}", other),
        };
        match receive(&mut dev) {
            Received::Frame { frame, timestamp } => {
                assert_eq!(frame.id, 0x7E8);
                assert!(frame.data.is_empty());
                assert_eq!(timestamp.micros - first.micros, 2_500);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(receive(&mut dev), Received::Text("Hello".into()));
        assert_eq!(receive(&mut dev), Received::Busload(42));
        assert!(dev.receive(Duration::from_millis(20)).unwrap().is_none());
    }

    #[test]
    fn test_send_time_shares_receive_clock() {
        let mock = classic();
        let mut dev = running(&mock, 0);

        let first = dev.send(&CanFrame::new(0x100, &[1])).unwrap();
        let first_time = first.timestamp.expect("local send time");
        let offset = first_time.micros - first.local_us;

        thread::sleep(Duration::from_millis(20));
        let second = dev.send(&CanFrame::new(0x101, &[2])).unwrap();
        assert_eq!(second.timestamp.unwrap().micros - second.local_us, offset);

        // RxFrame without timestamp: head, flags, id, data
        let mut rx = vec![8, MSG_RX_FRAME, 0];
        rx.extend_from_slice(&0x7E8u32.to_le_bytes());
        rx.push(0xAA);
        mock.push_in(Ok(rx));
        match receive(&mut dev) {
            Received::Frame { timestamp, .. } => {
                let elapsed = timestamp.micros - first_time.micros;
                assert!(elapsed >= 20_000, "elapsed {}", elapsed);
                assert!(elapsed < 10_000_000, "elapsed {}", elapsed);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_send_time_absent_with_hardware_timestamps() {
        let mock = classic();
        let mut dev = running(&mock, DEV_FLAG_HW_TIMESTAMP);
        let sent = dev.send(&CanFrame::new(0x100, &[1])).unwrap();
        assert!(sent.timestamp.is_none());
    }

    #[test]
    fn test_overflow_reported_once_per_backlog() {
        let mock = classic();
        let mut dev = running(&mock, 0);

        for percent in 0..RX_RING_CAPACITY as u8 {
            mock.push_in(Ok(vec![3, MSG_BUSLOAD, percent]));
        }
        let deadline = Instant::now() + WAIT;
        while dev.rx.as_ref().unwrap().len() < RX_RING_CAPACITY {
            assert!(Instant::now() < deadline, "ring never filled");
            thread::sleep(Duration::from_millis(5));
        }
        // let the acquisition thread find the ring full
        thread::sleep(Duration::from_millis(100));

        for percent in 0..RX_RING_CAPACITY as u8 {
            assert_eq!(receive(&mut dev), Received::Busload(percent));
        }
        assert!(matches!(dev.receive(WAIT), Err(CandleError::BufferOverflow)));
        assert!(dev.receive(Duration::from_millis(20)).unwrap().is_none());

        mock.push_in(Ok(vec![3, MSG_BUSLOAD, 77]));
        assert_eq!(receive(&mut dev), Received::Busload(77));
        assert!(dev.receive(Duration::from_millis(20)).unwrap().is_none());
        assert_eq!(dev.state(), SessionState::Running);
    }

    #[test]
    fn test_bad_message_does_not_end_session() {
        let mock = classic();
        let mut dev = running(&mock, 0);

        mock.push_in(Ok(vec![9, MSG_BUSLOAD, 1]));
        mock.push_in(Ok(vec![3, MSG_BUSLOAD, 5]));
        mock.push_in(Err(rusb::Error::Io));
        mock.push_in(Ok(vec![3, MSG_BUSLOAD, 6]));

        assert!(matches!(
            dev.receive(WAIT),
            Err(CandleError::Framing(FramingError::SizeMismatch { .. }))
        ));
        assert_eq!(receive(&mut dev), Received::Busload(5));
        assert!(matches!(
            dev.receive(WAIT),
            Err(CandleError::BulkTransfer(rusb::Error::Io))
        ));
        assert_eq!(receive(&mut dev), Received::Busload(6));
    }

    #[test]
    fn test_device_tx_frame_is_rejected() {
        let mock = classic();
        let mut dev = running(&mock, 0);
        mock.push_in(Ok(message::encode_tx_frame(&CanFrame::new(1, &[]), 0)));
        assert!(matches!(
            dev.receive(WAIT),
            Err(CandleError::Framing(FramingError::UnknownType(MSG_TX_FRAME)))
        ));
    }

    #[test]
    fn test_close_resets_and_stops() {
        let mock = classic();
        let mut dev = running(&mock, 0);
        dev.close();
        assert_eq!(dev.state(), SessionState::Closed);

        let last = mock.commands().pop().unwrap();
        assert_eq!(last.request, GS_REQ_SET_DEVICE_MODE);
        assert_eq!(last.data[0..4], [0, 0, 0, 0]);
        assert!(matches!(
            dev.receive(Duration::ZERO),
            Err(CandleError::InvalidState { .. })
        ));

        // nothing more on drop
        let count = mock.commands().len();
        drop(dev);
        assert_eq!(mock.commands().len(), count);
    }

    #[test]
    fn test_close_swallows_reset_failure() {
        let mock = classic();
        let mut dev = running(&mock, 0);
        mock.fail(GS_REQ_SET_DEVICE_MODE);
        dev.close();
        assert_eq!(dev.state(), SessionState::Closed);
    }
}
