//! Message codec
//!
//! Every bulk transfer carries exactly one message: a two byte head (total
//! size, type tag) followed by the variant body. RxFrame, TxEcho and Error
//! carry a 32-bit device timestamp only while hardware timestamps are active,
//! so the minimum size of these variants depends on the timestamp mode.

use crate::constants::{
    CANFD_MAX_DLEN, MAX_STRING_LEN, MSG_BUSLOAD, MSG_ERROR, MSG_RX_FRAME, MSG_STRING, MSG_TX_ECHO,
    MSG_TX_FRAME,
};
use crate::error::FramingError;
use crate::frame::{padded_len, CanFrame};

/// Size of the common head (size + type)
pub const HEAD_SIZE: usize = 2;

const TX_FRAME_DATA: usize = 8; // size, type, flags, can_id, marker
const RX_FRAME_DATA: usize = 7; // size, type, flags, can_id
const TX_ECHO_STAMP: usize = 3; // size, type, marker
const ERROR_STAMP: usize = 14; // size, type, err_id, err_data[8]
const BUSLOAD_SIZE: usize = 3; // size, type, percent
const TIMESTAMP_SIZE: usize = 4;

/// A decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Frame to be sent, host to device
    TxFrame { marker: u8, frame: CanFrame },
    /// Frame received from the bus
    RxFrame {
        frame: CanFrame,
        timestamp: Option<u32>,
    },
    /// A sent frame has been acknowledged on the bus
    TxEcho { marker: u8, timestamp: Option<u32> },
    /// Raw bus and firmware error flags
    Error {
        error_id: u32,
        data: [u8; 8],
        timestamp: Option<u32>,
    },
    /// Diagnostic text from the firmware
    String(String),
    /// Bus load in percent
    Busload(u8),
}

impl Message {
    /// Wire type tag of this message
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::TxFrame { .. } => MSG_TX_FRAME,
            Message::RxFrame { .. } => MSG_RX_FRAME,
            Message::TxEcho { .. } => MSG_TX_ECHO,
            Message::Error { .. } => MSG_ERROR,
            Message::String(_) => MSG_STRING,
            Message::Busload(_) => MSG_BUSLOAD,
        }
    }

    /// Device timestamp carried by the message, if any
    pub fn device_timestamp(&self) -> Option<u32> {
        match self {
            Message::RxFrame { timestamp, .. }
            | Message::TxEcho { timestamp, .. }
            | Message::Error { timestamp, .. } => *timestamp,
            _ => None,
        }
    }
}

/// Name of a message type for diagnostics
pub fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_TX_FRAME => "TxFrame",
        MSG_TX_ECHO => "TxEcho",
        MSG_RX_FRAME => "RxFrame",
        MSG_ERROR => "Error",
        MSG_STRING => "String",
        MSG_BUSLOAD => "Busload",
        _ => "Unknown",
    }
}

/// Minimum size of a message type under the given timestamp mode
///
/// This is the offset of the first variable field, plus the timestamp for
/// the variants that carry one. Busload has no variable part.
pub fn min_size(msg_type: u8, hw_timestamp: bool) -> Option<usize> {
    let stamp = if hw_timestamp { TIMESTAMP_SIZE } else { 0 };
    match msg_type {
        MSG_TX_FRAME => Some(TX_FRAME_DATA),
        MSG_RX_FRAME => Some(RX_FRAME_DATA + stamp),
        MSG_TX_ECHO => Some(TX_ECHO_STAMP + stamp),
        MSG_ERROR => Some(ERROR_STAMP + stamp),
        MSG_STRING => Some(HEAD_SIZE),
        MSG_BUSLOAD => Some(BUSLOAD_SIZE),
        _ => None,
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Encode a frame as TxFrame message
///
/// The payload is zero padded to the next legal CAN FD data length. The
/// frame must already be validated (payload at most 64 bytes).
pub fn encode_tx_frame(frame: &CanFrame, marker: u8) -> Vec<u8> {
    let data_len = frame.data.len().min(CANFD_MAX_DLEN);
    let size = TX_FRAME_DATA + padded_len(data_len);

    let mut buf = Vec::with_capacity(size);
    buf.push(size as u8);
    buf.push(MSG_TX_FRAME);
    buf.push(frame.flags());
    buf.extend_from_slice(&frame.raw_id().to_le_bytes());
    buf.push(marker);
    buf.extend_from_slice(&frame.data[..data_len]);
    buf.resize(size, 0);
    buf
}

/// Decode one message received from the device
///
/// # Arguments
/// * `buf` - Exactly the bytes of one bulk IN transfer
/// * `hw_timestamp` - Hardware timestamps were requested at start
pub fn decode(buf: &[u8], hw_timestamp: bool) -> Result<Message, FramingError> {
    if buf.len() < HEAD_SIZE {
        return Err(FramingError::NoHeader(buf.len()));
    }

    let declared = buf[0] as usize;
    if declared != buf.len() {
        return Err(FramingError::SizeMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let msg_type = buf[1];
    let minimum = min_size(msg_type, hw_timestamp).ok_or(FramingError::UnknownType(msg_type))?;
    if buf.len() < minimum {
        return Err(FramingError::TooShort {
            kind: type_name(msg_type),
            actual: buf.len(),
            minimum,
        });
    }

    let check_max = |maximum: usize| {
        if buf.len() > maximum {
            Err(FramingError::TooLong {
                kind: type_name(msg_type),
                actual: buf.len(),
                maximum,
            })
        } else {
            Ok(())
        }
    };

    let stamp_at = |offset: usize| hw_timestamp.then(|| read_u32(buf, offset));

    let message = match msg_type {
        MSG_TX_FRAME => {
            check_max(minimum + CANFD_MAX_DLEN)?;
            Message::TxFrame {
                marker: buf[7],
                frame: CanFrame::from_raw(read_u32(buf, 3), buf[2], &buf[TX_FRAME_DATA..]),
            }
        }
        MSG_RX_FRAME => {
            check_max(minimum + CANFD_MAX_DLEN)?;
            Message::RxFrame {
                frame: CanFrame::from_raw(read_u32(buf, 3), buf[2], &buf[minimum..]),
                timestamp: stamp_at(RX_FRAME_DATA),
            }
        }
        MSG_TX_ECHO => Message::TxEcho {
            marker: buf[2],
            timestamp: stamp_at(TX_ECHO_STAMP),
        },
        MSG_ERROR => {
            let mut data = [0u8; 8];
            data.copy_from_slice(&buf[6..14]);
            Message::Error {
                error_id: read_u32(buf, 2),
                data,
                timestamp: stamp_at(ERROR_STAMP),
            }
        }
        MSG_STRING => {
            check_max(HEAD_SIZE + MAX_STRING_LEN)?;
            let text = &buf[HEAD_SIZE..];
            let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
            Message::String(String::from_utf8_lossy(&text[..end]).into_owned())
        }
        _ => Message::Busload(buf[2]),
    };

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CAN_EFF_FLAG, FRAME_FLAG_BRS, FRAME_FLAG_FDF};

    #[test]
    fn test_encode_tx_frame_layout() {
        let frame = CanFrame::new_extended(0x18DAF110, &[0x02, 0x10, 0x03]);
        let buf = encode_tx_frame(&frame, 0x7F);
        assert_eq!(buf.len(), 11);
        assert_eq!(buf[0], 11);
        assert_eq!(buf[1], MSG_TX_FRAME);
        assert_eq!(buf[2], 0);
        assert_eq!(buf[3..7], (0x18DAF110 | CAN_EFF_FLAG).to_le_bytes());
        assert_eq!(buf[7], 0x7F);
        assert_eq!(buf[8..], [0x02, 0x10, 0x03]);
    }

    #[test]
    fn test_encode_pads_to_fd_lengths() {
        for len in 0..=CANFD_MAX_DLEN {
            let payload: Vec<u8> = (1..=len as u8).collect();
            let frame = CanFrame::new_fd(0x100, false, &payload, false);
            let buf = encode_tx_frame(&frame, 0);
            let data = &buf[TX_FRAME_DATA..];

            let expected = if len <= 8 {
                len
            } else {
                *[12, 16, 20, 24, 32, 48, 64].iter().find(|&&b| b >= len).unwrap()
            };
            assert_eq!(data.len(), expected, "payload length {}", len);
            assert_eq!(buf[0] as usize, buf.len());
            assert_eq!(&data[..len], &payload[..]);
            assert!(data[len..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_decode_rx_frame_with_timestamp() {
        let mut buf = vec![0, MSG_RX_FRAME, FRAME_FLAG_FDF | FRAME_FLAG_BRS];
        buf.extend_from_slice(&0x123u32.to_le_bytes());
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        buf[0] = buf.len() as u8;

        match decode(&buf, true).unwrap() {
            Message::RxFrame { frame, timestamp } => {
                assert_eq!(timestamp, Some(0xDEADBEEF));
                assert_eq!(frame.id, 0x123);
                assert!(frame.fd && frame.brs && !frame.extended);
                assert_eq!(frame.data, (1..=12).collect::<Vec<u8>>());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_rx_frame_without_timestamp() {
        let mut buf = vec![9, MSG_RX_FRAME, 0];
        buf.extend_from_slice(&0x7E8u32.to_le_bytes());
        buf.extend_from_slice(&[0xAA, 0xBB]);

        let msg = decode(&buf, false).unwrap();
        assert_eq!(
            msg,
            Message::RxFrame {
                frame: CanFrame::new(0x7E8, &[0xAA, 0xBB]),
                timestamp: None
            }
        );
    }

    #[test]
    fn test_decode_fixed_variants() {
        assert_eq!(
            decode(&[3, MSG_TX_ECHO, 42], false).unwrap(),
            Message::TxEcho {
                marker: 42,
                timestamp: None
            }
        );
        assert_eq!(
            decode(&[7, MSG_TX_ECHO, 42, 1, 0, 0, 0], true).unwrap(),
            Message::TxEcho {
                marker: 42,
                timestamp: Some(1)
            }
        );
        assert_eq!(decode(&[3, MSG_BUSLOAD, 37], true).unwrap(), Message::Busload(37));

        let buf = [14, MSG_ERROR, 0x40, 0, 0, 0, 0, 0x20, 0, 0, 0, 0x04, 130, 7];
        match decode(&buf, false).unwrap() {
            Message::Error {
                error_id, data, ..
            } => {
                assert_eq!(error_id, 0x40);
                assert_eq!(data, [0, 0x20, 0, 0, 0, 0x04, 130, 7]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_string() {
        let mut buf = vec![0, MSG_STRING];
        buf.extend_from_slice(b"Firmware ready");
        buf[0] = buf.len() as u8;
        assert_eq!(
            decode(&buf, true).unwrap(),
            Message::String("Firmware ready".to_string())
        );
    }

    #[test]
    fn test_size_mismatch_for_every_variant() {
        for msg_type in MSG_TX_FRAME..=MSG_BUSLOAD {
            for hw in [false, true] {
                let len = min_size(msg_type, hw).unwrap() + 1;
                let mut buf = vec![0u8; len];
                buf[1] = msg_type;
                for declared in [0, len - 1, len + 1, 255] {
                    buf[0] = declared as u8;
                    assert!(
                        matches!(decode(&buf, hw), Err(FramingError::SizeMismatch { .. })),
                        "type {} declared {} actual {}",
                        msg_type,
                        declared,
                        len
                    );
                }
            }
        }
    }

    #[test]
    fn test_too_short_depends_on_timestamp_mode() {
        // TxEcho without timestamp is fine, but short when timestamps are on
        let buf = [3, MSG_TX_ECHO, 1];
        assert!(decode(&buf, false).is_ok());
        assert_eq!(
            decode(&buf, true),
            Err(FramingError::TooShort {
                kind: "TxEcho",
                actual: 3,
                minimum: 7
            })
        );

        let buf = [2, MSG_BUSLOAD];
        assert!(matches!(decode(&buf, false), Err(FramingError::TooShort { .. })));
    }

    #[test]
    fn test_unknown_type_and_missing_head() {
        assert_eq!(decode(&[3, 99, 0], false), Err(FramingError::UnknownType(99)));
        assert_eq!(decode(&[1], false), Err(FramingError::NoHeader(1)));
        assert_eq!(decode(&[], false), Err(FramingError::NoHeader(0)));
    }

    #[test]
    fn test_min_sizes() {
        assert_eq!(min_size(MSG_TX_FRAME, true), Some(8));
        assert_eq!(min_size(MSG_RX_FRAME, false), Some(7));
        assert_eq!(min_size(MSG_RX_FRAME, true), Some(11));
        assert_eq!(min_size(MSG_TX_ECHO, true), Some(7));
        assert_eq!(min_size(MSG_ERROR, false), Some(14));
        assert_eq!(min_size(MSG_ERROR, true), Some(18));
        assert_eq!(min_size(MSG_STRING, true), Some(2));
        assert_eq!(min_size(MSG_BUSLOAD, true), Some(3));
        assert_eq!(min_size(0, false), None);
    }
}
