//! Candlelight protocol constants
//!
//! Request codes, device flags, message tags and error flag bits used on the
//! wire between the host and an adapter running the ElmüSoft firmware.

use std::time::Duration;

// ============================================================================
// Control Request Codes (interface 0, vendor requests)
// ============================================================================

/// Set nominal bit timing
pub const GS_REQ_SET_BIT_TIMING: u8 = 1;
/// Set device mode (reset / start)
pub const GS_REQ_SET_DEVICE_MODE: u8 = 2;
/// Get classic capability (40 bytes)
pub const GS_REQ_GET_CAPABILITY: u8 = 4;
/// Get hardware / firmware version (12 bytes)
pub const GS_REQ_GET_DEVICE_VERSION: u8 = 5;
/// Get the current device timestamp
pub const GS_REQ_GET_TIMESTAMP: u8 = 6;
/// Blink the LEDs
pub const GS_REQ_IDENTIFY: u8 = 7;
/// Set data phase bit timing (CAN FD)
pub const GS_REQ_SET_BIT_TIMING_FD: u8 = 10;
/// Get FD capability (72 bytes)
pub const GS_REQ_GET_CAPABILITY_FD: u8 = 11;
/// Set termination resistor
pub const GS_REQ_SET_TERMINATION: u8 = 12;
/// Get termination resistor
pub const GS_REQ_GET_TERMINATION: u8 = 13;

/// Get MCU and board identity
pub const ELM_REQ_GET_BOARD_INFO: u8 = 20;
/// Add or clear acceptance filters
pub const ELM_REQ_SET_FILTER: u8 = 21;
/// Fetch the feedback of the previous command
pub const ELM_REQ_GET_LAST_ERROR: u8 = 22;
/// Set the bus load report interval
pub const ELM_REQ_SET_BUSLOAD_REPORT: u8 = 23;
/// Change a pin (BOOT0)
pub const ELM_REQ_SET_PIN_STATUS: u8 = 24;
/// Query a pin (pin id in wValue)
pub const ELM_REQ_GET_PIN_STATUS: u8 = 25;

/// Human readable name of an interface 0 request
pub fn request_name(request: u8) -> &'static str {
    match request {
        GS_REQ_SET_BIT_TIMING => "SetBitTiming",
        GS_REQ_SET_DEVICE_MODE => "SetDeviceMode",
        GS_REQ_GET_CAPABILITY => "GetCapability",
        GS_REQ_GET_DEVICE_VERSION => "GetDeviceVersion",
        GS_REQ_GET_TIMESTAMP => "GetTimestamp",
        GS_REQ_IDENTIFY => "Identify",
        GS_REQ_SET_BIT_TIMING_FD => "SetBitTimingFD",
        GS_REQ_GET_CAPABILITY_FD => "GetCapabilityFD",
        GS_REQ_SET_TERMINATION => "SetTermination",
        GS_REQ_GET_TERMINATION => "GetTermination",
        ELM_REQ_GET_BOARD_INFO => "GetBoardInfo",
        ELM_REQ_SET_FILTER => "SetFilter",
        ELM_REQ_GET_LAST_ERROR => "GetLastError",
        ELM_REQ_SET_BUSLOAD_REPORT => "SetBusLoadReport",
        ELM_REQ_SET_PIN_STATUS => "SetPinStatus",
        ELM_REQ_GET_PIN_STATUS => "GetPinStatus",
        _ => "Unknown",
    }
}

// ============================================================================
// Device Mode
// ============================================================================

/// Close the adapter and reset all settings in the firmware
pub const DEV_MODE_RESET: u32 = 0;
/// Connect to the CAN bus
pub const DEV_MODE_START: u32 = 1;

// ============================================================================
// Device Flags (feature bits in capabilities, mode flags in start)
// ============================================================================

/// Bus monitoring (with loopback: internal loopback)
pub const DEV_FLAG_LISTEN_ONLY: u32 = 0x0001;
/// External loopback (with listen-only: internal loopback)
pub const DEV_FLAG_LOOPBACK: u32 = 0x0002;
/// Three samples per bit
pub const DEV_FLAG_TRIPLE_SAMPLE: u32 = 0x0004;
/// No automatic retransmission
pub const DEV_FLAG_ONE_SHOT: u32 = 0x0008;
/// Device timestamps in TxEcho, RxFrame and Error messages
pub const DEV_FLAG_HW_TIMESTAMP: u32 = 0x0010;
/// Blink the LEDs
pub const DEV_FLAG_IDENTIFY: u32 = 0x0020;
/// User ID (not implemented by the firmware)
pub const DEV_FLAG_USER_ID: u32 = 0x0040;
/// Pad USB packets to the endpoint max packet size
pub const DEV_FLAG_PAD_PKTS: u32 = 0x0080;
/// CAN FD support
pub const DEV_FLAG_CAN_FD: u32 = 0x0100;
/// LPC546XX USB erratum workaround
pub const DEV_FLAG_QUIRK_LPC546XX: u32 = 0x0200;
/// Separate FD bit timing constants available
pub const DEV_FLAG_BIT_TIMING_FD: u32 = 0x0400;
/// Termination resistor switchable by software
pub const DEV_FLAG_TERMINATION: u32 = 0x0800;
/// Bus error reporting (not implemented by the firmware)
pub const DEV_FLAG_BERR_REPORTING: u32 = 0x1000;
/// Get state request (not implemented by the firmware)
pub const DEV_FLAG_GET_STATE: u32 = 0x2000;
/// ElmüSoft message protocol
pub const DEV_FLAG_PROTOCOL_ELMUE: u32 = 0x4000;
/// Suppress TxEcho messages
pub const DEV_FLAG_DISABLE_TX_ECHO: u32 = 0x8000;

// ============================================================================
// CAN ID Flags and Masks
// ============================================================================

/// Extended frame format flag (29-bit ID)
pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
/// Remote transmission request flag
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
/// Error frame flag (legacy protocol only)
pub const CAN_ERR_FLAG: u32 = 0x2000_0000;

/// Standard frame format mask (11-bit ID)
pub const CAN_SFF_MASK: u32 = 0x0000_07FF;
/// Extended frame format mask (29-bit ID)
pub const CAN_EFF_MASK: u32 = 0x1FFF_FFFF;

// ============================================================================
// CAN Payload Definitions
// ============================================================================

/// Maximum data length for classic CAN
pub const CAN_MAX_DLEN: usize = 8;
/// Maximum data length for CAN FD
pub const CANFD_MAX_DLEN: usize = 64;

/// DLC to data length conversion table for CAN FD
pub const CANFD_DLC_TO_LEN: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

// ============================================================================
// Frame Flags (flags byte of TxFrame / RxFrame)
// ============================================================================

/// Overflow (unused)
pub const FRAME_FLAG_OVERFLOW: u8 = 0x01;
/// CAN FD frame
pub const FRAME_FLAG_FDF: u8 = 0x02;
/// Bit rate switch
pub const FRAME_FLAG_BRS: u8 = 0x04;
/// Error state indicator
pub const FRAME_FLAG_ESI: u8 = 0x08;

// ============================================================================
// Message Types
// ============================================================================

/// CAN frame to be sent (host to device)
pub const MSG_TX_FRAME: u8 = 10;
/// Acknowledgment of a sent frame
pub const MSG_TX_ECHO: u8 = 11;
/// Frame received from the bus
pub const MSG_RX_FRAME: u8 = 12;
/// Bus and firmware error flags
pub const MSG_ERROR: u8 = 13;
/// ASCII diagnostic text
pub const MSG_STRING: u8 = 14;
/// Bus load in percent
pub const MSG_BUSLOAD: u8 = 15;

/// Longest text carried by a String message
pub const MAX_STRING_LEN: usize = 200;

// ============================================================================
// Error Message Flags
// ============================================================================

/// Error ID: Tx timeout
pub const ERR_ID_TX_TIMEOUT: u32 = 0x0001;
/// Error ID: arbitration lost
pub const ERR_ID_ARBITRATION_LOST: u32 = 0x0002;
/// Error ID: controller problem (details in byte 1)
pub const ERR_ID_CONTROLLER_PROBLEM: u32 = 0x0004;
/// Error ID: protocol violation (details in byte 2)
pub const ERR_ID_PROTOCOL_VIOLATION: u32 = 0x0008;
/// Error ID: transceiver error
pub const ERR_ID_TRANSCEIVER: u32 = 0x0010;
/// Error ID: no ACK received
pub const ERR_ID_NO_ACK: u32 = 0x0020;
/// Error ID: bus off
pub const ERR_ID_BUS_OFF: u32 = 0x0040;
/// Error ID: bus error
pub const ERR_ID_BUS_ERROR: u32 = 0x0080;
/// Error ID: controller restarted
pub const ERR_ID_RESTARTED: u32 = 0x0100;
/// Error ID: CRC error
pub const ERR_ID_CRC: u32 = 0x0200;

/// Byte 1: Rx buffer overflow
pub const ERR1_RX_OVERFLOW: u8 = 0x01;
/// Byte 1: Tx buffer overflow
pub const ERR1_TX_OVERFLOW: u8 = 0x02;
/// Byte 1: Rx errors at warning level
pub const ERR1_RX_WARNING: u8 = 0x04;
/// Byte 1: Tx errors at warning level
pub const ERR1_TX_WARNING: u8 = 0x08;
/// Byte 1: Rx error passive
pub const ERR1_RX_PASSIVE: u8 = 0x10;
/// Byte 1: Tx error passive
pub const ERR1_TX_PASSIVE: u8 = 0x20;
/// Byte 1: recovered to error active
pub const ERR1_BACK_TO_ACTIVE: u8 = 0x40;

/// Byte 2: single bit error
pub const ERR2_SINGLE_BIT: u8 = 0x01;
/// Byte 2: frame format error
pub const ERR2_FRAME_FORMAT: u8 = 0x02;
/// Byte 2: bit stuffing error
pub const ERR2_BIT_STUFFING: u8 = 0x04;
/// Byte 2: unable to send dominant bit
pub const ERR2_DOMINANT_BIT: u8 = 0x08;
/// Byte 2: unable to send recessive bit
pub const ERR2_RECESSIVE_BIT: u8 = 0x10;

/// Byte 5: reception failed in the firmware
pub const APP_FLAG_RX_FAILED: u8 = 0x01;
/// Byte 5: transmission failed in the firmware
pub const APP_FLAG_TX_FAILED: u8 = 0x02;
/// Byte 5: CAN Tx queue overflow
pub const APP_FLAG_CAN_TX_OVERFLOW: u8 = 0x04;
/// Byte 5: USB IN queue overflow
pub const APP_FLAG_USB_IN_OVERFLOW: u8 = 0x08;
/// Byte 5: Tx timeout
pub const APP_FLAG_TX_TIMEOUT: u8 = 0x10;

// ============================================================================
// Filter, Pin and Termination Operations
// ============================================================================

/// Remove all acceptance filters
pub const FILTER_OP_CLEAR_ALL: u8 = 0;
/// Add an 11-bit mask filter
pub const FILTER_OP_MASK_11: u8 = 1;
/// Add a 29-bit mask filter
pub const FILTER_OP_MASK_29: u8 = 2;

/// Disable a pin in the option bytes
pub const PIN_OP_DISABLE: u16 = 5;
/// Enable a pin in the option bytes
pub const PIN_OP_ENABLE: u16 = 6;
/// Pin BOOT0
pub const PIN_ID_BOOT0: u16 = 1;
/// Pin status bit: level is high
pub const PIN_STATUS_HIGH: u16 = 0x0001;
/// Pin status bit: pin is enabled
pub const PIN_STATUS_ENABLED: u16 = 0x0002;

/// Termination resistor off
pub const TERMINATION_OFF: u32 = 0;
/// Termination resistor on
pub const TERMINATION_ON: u32 = 1;

// ============================================================================
// USB Interfaces and Identities
// ============================================================================

/// Interface carrying the CAN protocol
pub const INTERFACE_CANDLE: u8 = 0;
/// Interface used for the bootloader handoff
pub const INTERFACE_DFU: u8 = 1;

/// Known (vendor, product) pairs of Candlelight adapters
pub const CANDLE_USB_IDS: [(u16, u16); 4] = [
    (0x1D50, 0x606F), // GS-USB / candleLight
    (0x1209, 0x2323), // candleLight (pid.codes)
    (0x1CD2, 0x606F), // CES CANext FD
    (0x16D0, 0x10B8), // ABE CANdebugger FD
];

/// Check if a USB vendor/product pair is a known Candlelight adapter
pub fn is_candle_device(vendor_id: u16, product_id: u16) -> bool {
    CANDLE_USB_IDS.contains(&(vendor_id, product_id))
}

// ============================================================================
// Timing and Sizing
// ============================================================================

/// Timeout of control transfers and bulk OUT writes
pub const USB_TIMEOUT: Duration = Duration::from_millis(500);

/// Ring buffer slots between the acquisition thread and the consumer
pub const RX_RING_CAPACITY: usize = 30;
/// Size of one bulk IN transfer buffer
pub const RX_BUFFER_SIZE: usize = 128;
/// Back-off after a failed bulk IN transfer
pub const RX_ERROR_BACKOFF: Duration = Duration::from_millis(50);
/// Interval at which a parked acquisition thread rechecks the ring
pub const RX_PARK_INTERVAL: Duration = Duration::from_millis(50);
/// Attempts to wait for the acquisition thread on shutdown
pub const SHUTDOWN_ATTEMPTS: u32 = 100;
/// Wait between shutdown attempts
pub const SHUTDOWN_INTERVAL: Duration = Duration::from_millis(10);

/// Sends are rejected this long after a CAN Tx overflow was reported
pub const TX_OVERFLOW_GUARD: Duration = Duration::from_millis(4000);

/// Oldest supported firmware (BCD, 0x251118 = 2025-11-18)
pub const MIN_FIRMWARE_VERSION: u32 = 0x0025_1118;

/// Number of echo markers
pub const ECHO_TABLE_SIZE: usize = 256;
