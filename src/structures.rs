//! Candlelight control structures
//!
//! Fixed-size records exchanged over control transfers: device mode, bit
//! timing, capabilities, versions, board identity, filters, pin operations
//! and the command feedback of the ElmüSoft firmware.

use crate::constants::{DEV_FLAG_BIT_TIMING_FD, DEV_FLAG_CAN_FD, DEV_FLAG_PROTOCOL_ELMUE};

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Format a BCD version as dot separated groups ("25.11.18")
pub fn format_bcd_version(mut version: u32) -> String {
    if version == 0 {
        return "0".to_string();
    }
    let mut groups = Vec::new();
    while version != 0 && groups.len() < 4 {
        groups.push(format!("{:02X}", version & 0xFF));
        version >>= 8;
    }
    groups.reverse();
    groups.join(".")
}

/// Device mode configuration
///
/// Used to start or reset the adapter with specific mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMode {
    /// Mode value (0 = reset, 1 = start)
    pub mode: u32,
    /// Mode flags (combination of DEV_FLAG_* constants)
    pub flags: u32,
}

impl DeviceMode {
    /// Create a new device mode configuration
    pub fn new(mode: u32, flags: u32) -> Self {
        Self { mode, flags }
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.mode.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf
    }
}

/// CAN bit timing configuration
///
/// The propagation segment is always 0 (it is part of segment 1) and the
/// synchronization jump width is the smaller of the two phase segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Propagation segment
    pub prop_seg: u32,
    /// Time quanta before the sample point
    pub phase_seg1: u32,
    /// Time quanta after the sample point
    pub phase_seg2: u32,
    /// Synchronization jump width
    pub sjw: u32,
    /// Baud rate prescaler
    pub brp: u32,
}

impl BitTiming {
    /// Build a timing from prescaler and phase segments
    pub fn new(brp: u32, phase_seg1: u32, phase_seg2: u32) -> Self {
        Self {
            prop_seg: 0,
            phase_seg1,
            phase_seg2,
            sjw: phase_seg1.min(phase_seg2),
            brp,
        }
    }

    /// Total time quanta per bit
    ///
    /// Wide enough for any segment values, so the result is never zero.
    pub fn total_quanta(&self) -> u64 {
        1 + self.phase_seg1 as u64 + self.phase_seg2 as u64
    }

    /// Resulting bitrate for a CAN clock in Hz
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        let per_brp = clock_hz.checked_div(self.brp).unwrap_or(0) as u64;
        (per_brp / self.total_quanta()) as u32
    }

    /// Sample point in per-mille (875 = 87.5%)
    pub fn sample_point(&self) -> u32 {
        (1000 * (1 + self.phase_seg1 as u64) / self.total_quanta()) as u32
    }

    /// One-line summary, e.g. "Nominal Baudrate: 500k, Samplepoint: 87.5%"
    pub fn describe(&self, clock_hz: u32, data_phase: bool) -> String {
        let mut baud = self.bitrate(clock_hz);
        // 83333 baud stays "83333", not "83k"
        let unit = if baud >= 1_000_000 && baud % 1_000_000 == 0 {
            baud /= 1_000_000;
            "M"
        } else if baud >= 1_000 && baud % 1_000 == 0 {
            baud /= 1_000;
            "k"
        } else {
            ""
        };
        let sample = self.sample_point();
        format!(
            "{} Baudrate: {}{}, Samplepoint: {}.{}%",
            if data_phase { "Data" } else { "Nominal" },
            baud,
            unit,
            sample / 10,
            sample % 10
        )
    }

    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 20] {
        let mut buf = [0u8; 20];
        buf[0..4].copy_from_slice(&self.prop_seg.to_le_bytes());
        buf[4..8].copy_from_slice(&self.phase_seg1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.phase_seg2.to_le_bytes());
        buf[12..16].copy_from_slice(&self.sjw.to_le_bytes());
        buf[16..20].copy_from_slice(&self.brp.to_le_bytes());
        buf
    }
}

impl std::fmt::Display for BitTiming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BRP: {}, Seg1: {}, Seg2: {}, SJW: {}",
            self.brp, self.phase_seg1, self.phase_seg2, self.sjw
        )
    }
}

/// Bit timing segment ranges reported by the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingLimits {
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_inc: u32,
}

impl TimingLimits {
    /// Size on the wire (8 x uint32)
    pub const SIZE: usize = 32;

    /// Unpack from 32 bytes
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            tseg1_min: read_u32(data, 0),
            tseg1_max: read_u32(data, 4),
            tseg2_min: read_u32(data, 8),
            tseg2_max: read_u32(data, 12),
            sjw_max: read_u32(data, 16),
            brp_min: read_u32(data, 20),
            brp_max: read_u32(data, 24),
            brp_inc: read_u32(data, 28),
        }
    }
}

impl std::fmt::Display for TimingLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TSEG1: {} - {}, TSEG2: {} - {}, SJW (max): {}, BRP: {} - {} (inc: {})",
            self.tseg1_min,
            self.tseg1_max,
            self.tseg2_min,
            self.tseg2_max,
            self.sjw_max,
            self.brp_min,
            self.brp_max,
            self.brp_inc
        )
    }
}

/// Device capability
///
/// Built from the classic response (40 bytes) and, on FD capable
/// adapters, extended with the data phase limits of the FD response (72 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capability {
    /// Feature bitfield (combination of DEV_FLAG_* constants)
    pub feature: u32,
    /// CAN clock frequency in Hz
    pub clock_hz: u32,
    /// Nominal (arbitration) phase limits
    pub nominal: TimingLimits,
    /// Data phase limits
    pub data: Option<TimingLimits>,
}

impl Capability {
    /// Size of the classic response
    pub const SIZE: usize = 40;
    /// Size of the FD response
    pub const SIZE_FD: usize = 72;

    /// Unpack from the classic response
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            feature: read_u32(data, 0),
            clock_hz: read_u32(data, 4),
            nominal: TimingLimits::unpack(&data[8..40]),
            data: None,
        }
    }

    /// Unpack from the FD response
    pub fn unpack_fd(data: &[u8]) -> Self {
        let mut cap = Self::unpack(data);
        cap.data = Some(TimingLimits::unpack(&data[40..72]));
        cap
    }

    /// Firmware speaks the ElmüSoft protocol
    pub fn is_elmue(&self) -> bool {
        self.feature & DEV_FLAG_PROTOCOL_ELMUE != 0
    }

    /// CAN FD with separate data phase timing
    pub fn supports_fd(&self) -> bool {
        self.feature & DEV_FLAG_CAN_FD != 0 && self.feature & DEV_FLAG_BIT_TIMING_FD != 0
    }

    /// Get clock frequency in MHz
    pub fn clock_mhz(&self) -> u32 {
        self.clock_hz / 1_000_000
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Feature bitfield: 0x{:08x}\nClock: {} MHz\nNominal: {}",
            self.feature,
            self.clock_mhz(),
            self.nominal
        )?;
        if let Some(data) = &self.data {
            write!(f, "\nData: {}", data)?;
        }
        Ok(())
    }
}

/// Hardware and firmware version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceVersion {
    /// Interface count (number of CAN channels - 1)
    pub icount: u8,
    /// Firmware version (BCD)
    pub sw_version_bcd: u32,
    /// Hardware version (BCD)
    pub hw_version_bcd: u32,
}

impl DeviceVersion {
    /// Size on the wire
    pub const SIZE: usize = 12;

    /// Unpack from bytes received via USB
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            icount: data[3],
            sw_version_bcd: read_u32(data, 4),
            hw_version_bcd: read_u32(data, 8),
        }
    }

    /// Firmware version as text
    pub fn software(&self) -> String {
        format_bcd_version(self.sw_version_bcd)
    }

    /// Hardware version as text
    pub fn hardware(&self) -> String {
        format_bcd_version(self.hw_version_bcd)
    }
}

/// MCU and board identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardInfo {
    /// MCU device ID (0x468 = STM32G431)
    pub mcu_device_id: u16,
    /// MCU name ("STM32G431xx")
    pub mcu_name: String,
    /// Board name ("MksMakerbase")
    pub board_name: String,
}

impl BoardInfo {
    /// Size on the wire (u16 + 2 x 25 chars)
    pub const SIZE: usize = 52;

    fn text(raw: &[u8]) -> String {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    /// Unpack from bytes received via USB
    pub fn unpack(data: &[u8]) -> Self {
        Self {
            mcu_device_id: u16::from_le_bytes([data[0], data[1]]),
            mcu_name: Self::text(&data[2..27]),
            board_name: Self::text(&data[27..52]),
        }
    }
}

/// Acceptance filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    /// FILTER_OP_* operation
    pub operation: u8,
    pub filter: u32,
    pub mask: u32,
}

impl Filter {
    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 17] {
        let mut buf = [0u8; 17];
        buf[0] = self.operation;
        buf[1..5].copy_from_slice(&self.filter.to_le_bytes());
        buf[5..9].copy_from_slice(&self.mask.to_le_bytes());
        buf
    }
}

/// Pin operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCommand {
    /// PIN_OP_* operation
    pub operation: u16,
    /// PIN_ID_* pin
    pub pin: u16,
}

impl PinCommand {
    /// Pack into bytes for USB transfer
    pub fn pack(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..2].copy_from_slice(&self.operation.to_le_bytes());
        buf[2..4].copy_from_slice(&self.pin.to_le_bytes());
        buf
    }
}

/// Result of the previous command, read with GetLastError
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    None,
    Success,
    InvalidCommand,
    InvalidParameter,
    AdapterMustBeOpen,
    AdapterMustBeClosed,
    ErrorFromHal,
    UnsupportedFeature,
    TxBufferOverflow,
    BusIsOff,
    NoTxInSilentMode,
    BaudrateNotSet,
    OptionBytesProgrammingFailed,
    ReconnectRequired,
    Unknown(u8),
}

impl Feedback {
    /// Decode the feedback byte
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Feedback::None,
            2 => Feedback::Success,
            b'1' => Feedback::InvalidCommand,
            b'2' => Feedback::InvalidParameter,
            b'3' => Feedback::AdapterMustBeOpen,
            b'4' => Feedback::AdapterMustBeClosed,
            b'5' => Feedback::ErrorFromHal,
            b'6' => Feedback::UnsupportedFeature,
            b'7' => Feedback::TxBufferOverflow,
            b'8' => Feedback::BusIsOff,
            b'9' => Feedback::NoTxInSilentMode,
            b':' => Feedback::BaudrateNotSet,
            b';' => Feedback::OptionBytesProgrammingFailed,
            b'<' => Feedback::ReconnectRequired,
            other => Feedback::Unknown(other),
        }
    }
}

impl std::fmt::Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Feedback::None => "No feedback",
            Feedback::Success => "Success",
            Feedback::InvalidCommand => "Invalid command",
            Feedback::InvalidParameter => "Invalid parameter",
            Feedback::AdapterMustBeOpen => "Adapter must be open",
            Feedback::AdapterMustBeClosed => "Adapter must be closed",
            Feedback::ErrorFromHal => "Error from HAL",
            Feedback::UnsupportedFeature => "Unsupported feature",
            Feedback::TxBufferOverflow => "Tx buffer overflow",
            Feedback::BusIsOff => "Bus is off",
            Feedback::NoTxInSilentMode => "No Tx in silent mode",
            Feedback::BaudrateNotSet => "Baudrate not set",
            Feedback::OptionBytesProgrammingFailed => "Option bytes programming failed",
            Feedback::ReconnectRequired => "Please reconnect the USB cable",
            Feedback::Unknown(code) => return write!(f, "Unknown feedback 0x{:02X}", code),
        };
        f.write_str(text)
    }
}
