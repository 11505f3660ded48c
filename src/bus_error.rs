//! CAN bus error decoding
//!
//! Turns the raw flags of an Error message into a bus status, a severity and
//! a readable description. Bus conditions are information for the caller,
//! they never fail a receive call.

use crate::constants::{
    APP_FLAG_CAN_TX_OVERFLOW, APP_FLAG_RX_FAILED, APP_FLAG_TX_FAILED, APP_FLAG_TX_TIMEOUT,
    APP_FLAG_USB_IN_OVERFLOW, ERR1_BACK_TO_ACTIVE, ERR1_RX_PASSIVE, ERR1_RX_WARNING,
    ERR1_TX_PASSIVE, ERR1_TX_WARNING, ERR2_BIT_STUFFING, ERR2_DOMINANT_BIT, ERR2_FRAME_FORMAT,
    ERR2_RECESSIVE_BIT, ERR_ID_BUS_OFF, ERR_ID_CRC, ERR_ID_NO_ACK,
};

/// Coarse state of the CAN controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Active,
    /// 96 or more errors
    Warning,
    /// 128 or more errors
    Passive,
    /// 248 or more errors, the controller left the bus
    Off,
}

impl std::fmt::Display for BusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BusStatus::Active => "Active",
            BusStatus::Warning => "Warning",
            BusStatus::Passive => "Passive",
            BusStatus::Off => "Off",
        };
        f.write_str(name)
    }
}

/// How urgently an error should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Decoded Error message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusError {
    pub status: BusStatus,
    pub severity: Severity,
    /// Comma separated description
    pub description: String,
    /// Firmware reported a CAN Tx queue overflow
    pub tx_overflow: bool,
    /// Transmit error counter
    pub tx_errors: u8,
    /// Receive error counter
    pub rx_errors: u8,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description)
    }
}

/// Decode the error ID and the eight error bytes of an Error message
pub fn decode_bus_error(error_id: u32, data: &[u8; 8]) -> BusError {
    let byte1 = data[1];
    let byte2 = data[2];
    let app = data[5];
    let mut parts: Vec<String> = Vec::new();

    let (status, mut severity) = if error_id & ERR_ID_BUS_OFF != 0 {
        parts.push("Bus Off".into());
        (BusStatus::Off, Severity::High)
    } else if byte1 & (ERR1_RX_PASSIVE | ERR1_TX_PASSIVE) != 0 {
        parts.push("Bus Passive".into());
        (BusStatus::Passive, Severity::High)
    } else if byte1 & (ERR1_RX_WARNING | ERR1_TX_WARNING) != 0 {
        parts.push("Bus Warning".into());
        (BusStatus::Warning, Severity::Medium)
    } else {
        if byte1 & ERR1_BACK_TO_ACTIVE != 0 {
            parts.push("Back to Active".into());
        } else {
            parts.push("Bus Active".into());
        }
        (BusStatus::Active, Severity::Low)
    };

    // firmware failures are always serious
    if app != 0 {
        severity = Severity::High;
    }
    let app_texts = [
        (APP_FLAG_RX_FAILED, "Rx Failed"),
        (APP_FLAG_TX_FAILED, "Tx Failed"),
        (APP_FLAG_TX_TIMEOUT, "Tx Timeout"),
        (APP_FLAG_CAN_TX_OVERFLOW, "CAN Tx Overflow"),
        (APP_FLAG_USB_IN_OVERFLOW, "USB IN Overflow"),
    ];
    for (flag, text) in app_texts {
        if app & flag != 0 {
            parts.push(text.into());
        }
    }

    if error_id & ERR_ID_NO_ACK != 0 {
        parts.push("No ACK received".into());
    }
    if error_id & ERR_ID_CRC != 0 {
        parts.push("CRC Error".into());
    }
    let violation_texts = [
        (ERR2_BIT_STUFFING, "Bit Stuffing Error"),
        (ERR2_FRAME_FORMAT, "Frame Format Error"),
        (ERR2_DOMINANT_BIT, "Dominant Bit Error"),
        (ERR2_RECESSIVE_BIT, "Recessive Bit Error"),
    ];
    for (flag, text) in violation_texts {
        if byte2 & flag != 0 {
            parts.push(text.into());
        }
    }

    let tx_errors = data[6];
    let rx_errors = data[7];
    if tx_errors > 0 {
        parts.push(format!("Tx Errors: {}", tx_errors));
    }
    if rx_errors > 0 {
        parts.push(format!("Rx Errors: {}", rx_errors));
    }

    BusError {
        status,
        severity,
        description: parts.join(", "),
        tx_overflow: app & APP_FLAG_CAN_TX_OVERFLOW != 0,
        tx_errors,
        rx_errors,
    }
}
