//! CAN frame representation
//!
//! This module provides the `CanFrame` struct used for both directions of the
//! Candlelight protocol, including classic CAN, remote frames and CAN FD.

use crate::constants::{
    CANFD_DLC_TO_LEN, CANFD_MAX_DLEN, CAN_EFF_FLAG, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_RTR_FLAG,
    CAN_SFF_MASK, FRAME_FLAG_BRS, FRAME_FLAG_ESI, FRAME_FLAG_FDF,
};

/// Convert DLC to data length
pub fn dlc_to_len(dlc: u8, fd: bool) -> usize {
    if fd {
        if (dlc as usize) < CANFD_DLC_TO_LEN.len() {
            CANFD_DLC_TO_LEN[dlc as usize]
        } else {
            CANFD_MAX_DLEN
        }
    } else {
        (dlc as usize).min(CAN_MAX_DLEN)
    }
}

/// Convert data length to DLC
pub fn len_to_dlc(length: usize, fd: bool) -> u8 {
    if fd {
        for (dlc, &dlen) in CANFD_DLC_TO_LEN.iter().enumerate() {
            if dlen >= length {
                return dlc as u8;
            }
        }
        15 // Max DLC for CAN FD
    } else {
        length.min(CAN_MAX_DLEN) as u8
    }
}

/// Length a payload of `length` bytes occupies on the wire
///
/// Lengths that are not a legal CAN FD data length are rounded up to the next
/// one (9 -> 12, 33 -> 48). Lengths 0..=8 are legal and stay unchanged.
pub fn padded_len(length: usize) -> usize {
    dlc_to_len(len_to_dlc(length.min(CANFD_MAX_DLEN), true), true)
}

/// A CAN frame
///
/// The identifier is stored without flag bits; extended, remote and the FD
/// flags are separate fields. For remote frames the optional single data byte
/// holds the requested DLC.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CanFrame {
    /// Arbitration ID (11 or 29 bits)
    pub id: u32,
    /// 29-bit identifier
    pub extended: bool,
    /// Remote transmission request
    pub remote: bool,
    /// CAN FD frame
    pub fd: bool,
    /// Bit rate switch (FD only)
    pub brs: bool,
    /// Error state indicator (FD only)
    pub esi: bool,
    /// Payload (0 to 64 bytes)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a classic frame with an 11-bit identifier
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            data: data.to_vec(),
            ..Self::default()
        }
    }

    /// Create a classic frame with a 29-bit identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            extended: true,
            data: data.to_vec(),
            ..Self::default()
        }
    }

    /// Create a remote frame requesting `dlc` bytes
    pub fn remote(id: u32, extended: bool, dlc: u8) -> Self {
        Self {
            id,
            extended,
            remote: true,
            data: vec![dlc],
            ..Self::default()
        }
    }

    /// Create a CAN FD frame
    ///
    /// # Arguments
    /// * `id` - Arbitration ID
    /// * `extended` - Use a 29-bit identifier
    /// * `data` - Frame data (up to 64 bytes)
    /// * `brs` - Transmit the data phase at the data bitrate
    pub fn new_fd(id: u32, extended: bool, data: &[u8], brs: bool) -> Self {
        Self {
            id,
            extended,
            fd: true,
            brs,
            data: data.to_vec(),
            ..Self::default()
        }
    }

    /// Identifier with the extended and remote flag bits folded in
    pub fn raw_id(&self) -> u32 {
        let mut raw = self.id;
        if self.extended {
            raw |= CAN_EFF_FLAG;
        }
        if self.remote {
            raw |= CAN_RTR_FLAG;
        }
        raw
    }

    /// Largest identifier allowed for the frame's ID width
    pub fn id_mask(&self) -> u32 {
        if self.extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        }
    }

    /// Frame flags byte of a TxFrame / RxFrame message
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.fd {
            flags |= FRAME_FLAG_FDF;
        }
        if self.brs {
            flags |= FRAME_FLAG_BRS;
        }
        if self.esi {
            flags |= FRAME_FLAG_ESI;
        }
        flags
    }

    /// Rebuild a frame from the raw identifier and flags of an RxFrame
    pub fn from_raw(raw_id: u32, flags: u8, data: &[u8]) -> Self {
        let fd = flags & FRAME_FLAG_FDF != 0;
        Self {
            id: raw_id & CAN_EFF_MASK,
            extended: raw_id & CAN_EFF_FLAG != 0,
            remote: raw_id & CAN_RTR_FLAG != 0,
            fd,
            brs: fd && flags & FRAME_FLAG_BRS != 0,
            esi: fd && flags & FRAME_FLAG_ESI != 0,
            data: data.to_vec(),
        }
    }

    /// Requested DLC of a remote frame
    pub fn remote_dlc(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    /// Get the data length code matching the payload
    pub fn dlc(&self) -> u8 {
        if self.remote {
            return self.remote_dlc();
        }
        len_to_dlc(self.data.len(), self.fd)
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.extended {
            write!(f, "{:08X}: ", self.id & CAN_EFF_MASK)?;
        } else {
            write!(f, "{:03X}: ", self.id & CAN_SFF_MASK)?;
        }

        if self.remote {
            return write!(f, "RTR [{}]", self.remote_dlc());
        }

        for (i, byte) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", byte)?;
        }

        if self.fd || self.brs || self.esi {
            write!(f, " -")?;
        }
        if self.fd {
            write!(f, " FDF")?;
        }
        if self.brs {
            write!(f, " BRS")?;
        }
        if self.esi {
            write!(f, " ESI")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:08X}", self.id))
            .field("extended", &self.extended)
            .field("remote", &self.remote)
            .field("fd", &self.fd)
            .field("brs", &self.brs)
            .field("esi", &self.esi)
            .field("data", &self.data)
            .finish()
    }
}
