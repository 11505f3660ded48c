//! Error types for the Candlelight driver
//!
//! Transport failures, malformed messages from the device, feedback
//! rejections and caller misuse are kept apart so callers can react to
//! each kind separately.

use thiserror::Error;

use crate::structures::Feedback;

/// Result type alias for Candlelight operations
pub type Result<T> = std::result::Result<T, CandleError>;

/// A message from the device that cannot be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than the two byte head
    #[error("Message of {0} bytes has no complete header")]
    NoHeader(usize),

    /// Declared size and transferred byte count differ
    #[error("Message declares {declared} bytes but {actual} were received")]
    SizeMismatch { declared: usize, actual: usize },

    /// Shorter than the minimum of its variant
    #[error("{kind} message of {actual} bytes is shorter than the minimum of {minimum}")]
    TooShort {
        kind: &'static str,
        actual: usize,
        minimum: usize,
    },

    /// Type tag not known to this driver
    #[error("Unknown message type {0}")]
    UnknownType(u8),

    /// Declared size does not fit the variant
    #[error("{kind} message of {actual} bytes exceeds the maximum of {maximum}")]
    TooLong {
        kind: &'static str,
        actual: usize,
        maximum: usize,
    },
}

/// Error types for Candlelight operations
#[derive(Error, Debug)]
pub enum CandleError {
    /// USB error from the rusb library
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Thread or OS error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No adapter at the given path
    #[error("No Candlelight device found at {0}")]
    DeviceNotFound(String),

    /// Path string not understood
    #[error("Invalid device path: {0}")]
    InvalidPath(String),

    /// Kernel driver could not be detached
    #[error("Failed to detach kernel driver: {0}")]
    DetachKernelDriver(rusb::Error),

    /// Failed to claim interface
    #[error("Failed to claim USB interface: {0}")]
    ClaimInterface(rusb::Error),

    /// Descriptors do not describe a Candlelight adapter
    #[error("The USB device is not a valid Candlelight adapter: {0}")]
    InvalidDevice(&'static str),

    /// Firmware without the ElmüSoft protocol
    #[error("The adapter runs a legacy firmware without the ElmueSoft protocol")]
    LegacyFirmware,

    /// Firmware older than the supported floor
    #[error("Firmware {found} is too old, at least {required} is required")]
    FirmwareTooOld { found: String, required: String },

    /// Control transfer failed
    #[error("Control transfer {request} failed: {source}")]
    ControlTransfer {
        request: &'static str,
        source: rusb::Error,
    },

    /// Bulk transfer failed
    #[error("Bulk transfer failed: {0}")]
    BulkTransfer(rusb::Error),

    /// Device answered a command with an error feedback
    #[error("The device has rejected {request}: {feedback}")]
    Rejected {
        request: &'static str,
        feedback: Feedback,
    },

    /// Short answer to a control IN request
    #[error("Invalid response to {request}: expected {expected} bytes, got {actual}")]
    InvalidResponse {
        request: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Malformed message from the device
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// Operation not allowed in the current session state
    #[error("Cannot {operation} while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Operation belongs to the other USB interface
    #[error("Operation requires interface {expected}, the session is open on interface {actual}")]
    WrongInterface { expected: u8, actual: u8 },

    /// Device does not support CAN FD
    #[error("Device does not support CAN FD")]
    FdNotSupported,

    /// Payload longer than the negotiated mode allows
    #[error("CAN data must not be longer than {max} bytes, got {len}")]
    PayloadTooLong { len: usize, max: usize },

    /// Remote frame with FD bit timing configured
    #[error("A remote frame cannot be sent in CAN FD mode")]
    RemoteInFdMode,

    /// FDF or BRS requested without FD bit timing
    #[error("CAN FD frames require a data bit timing")]
    FdWithoutDataTiming,

    /// Identifier exceeds its 11 or 29 bit range
    #[error("Invalid CAN ID 0x{id:X} for a {bits} bit identifier")]
    InvalidId { id: u32, bits: u8 },

    /// Remote frame with more than the DLC byte
    #[error("Remote frames carry no data or one DLC byte, got {0} bytes")]
    RemotePayload(usize),

    /// Device reported a Tx queue overflow recently
    #[error("Sending is not possible because the Tx buffer is full")]
    TxBufferFull,

    /// Acquisition ring was full and device output was held back
    #[error("USB IN buffer overflow, received data was delayed")]
    BufferOverflow,

    /// TxEcho for a marker that was never sent
    #[error("TxEcho with unknown marker {0}")]
    UnknownEchoMarker(u8),
}

impl CandleError {
    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CandleError::Usb(rusb::Error::Timeout)
                | CandleError::BulkTransfer(rusb::Error::Timeout)
                | CandleError::ControlTransfer {
                    source: rusb::Error::Timeout,
                    ..
                }
        )
    }

    /// Check if this error is a USB transport error
    pub fn is_usb_error(&self) -> bool {
        matches!(
            self,
            CandleError::Usb(_)
                | CandleError::DetachKernelDriver(_)
                | CandleError::ClaimInterface(_)
                | CandleError::ControlTransfer { .. }
                | CandleError::BulkTransfer(_)
        )
    }

    /// Check if this error is a malformed device message
    pub fn is_framing_error(&self) -> bool {
        matches!(self, CandleError::Framing(_))
    }

    /// Check if the device has been disconnected
    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            CandleError::Usb(rusb::Error::NoDevice)
                | CandleError::BulkTransfer(rusb::Error::NoDevice)
                | CandleError::ControlTransfer {
                    source: rusb::Error::NoDevice,
                    ..
                }
        )
    }
}
