//! Candlelight USB CAN adapter driver
//!
//! This crate drives CAN bus adapters running the CANable 2.5 firmware from
//! ElmüSoft through libusb. It speaks the Candlelight protocol with the
//! ElmüSoft extensions and can hand an adapter over to its DFU bootloader.
//!
//! # Features
//!
//! - Classic CAN and CAN FD with free bit timing
//! - Tx echo correlation through one byte markers
//! - Hardware timestamps extended across 32-bit rollovers
//! - Decoded bus errors with status and severity
//! - Acceptance filters, bus load reports, BOOT0 pin control
//! - Bootloader handoff over the DFU interface
//!
//! # Example
//!
//! ```no_run
//! use candlelight::{enumerate, CanFrame, Candlelight, Received, INTERFACE_CANDLE};
//! use std::time::Duration;
//!
//! fn main() -> candlelight::Result<()> {
//!     let devices = enumerate(INTERFACE_CANDLE)?;
//!     let Some(entry) = devices.first() else {
//!         println!("No Candlelight adapter found");
//!         return Ok(());
//!     };
//!
//!     let mut dev = Candlelight::open(&entry.path)?;
//!     print!("{}", dev.details());
//!
//!     // 500 kbaud at 160 MHz, sample point 87.5%
//!     println!("{}", dev.set_bitrate(false, 2, 139, 20)?);
//!     dev.start(candlelight::DEV_FLAG_HW_TIMESTAMP)?;
//!
//!     dev.send(&CanFrame::new(0x7DF, &[0x02, 0x01, 0x00]))?;
//!
//!     loop {
//!         match dev.receive(Duration::from_millis(100))? {
//!             Some(Received::Frame { frame, timestamp }) => println!("{} RX {}", timestamp, frame),
//!             Some(Received::BusError { error, timestamp }) => println!("{} {}", timestamp, error),
//!             Some(_) => {}
//!             None => continue,
//!         }
//!     }
//! }
//! ```
//!
//! # Supported Devices
//!
//! - GS-USB devices (VID: 0x1D50, PID: 0x606F)
//! - candleLight (VID: 0x1209, PID: 0x2323)
//! - CES CANext FD (VID: 0x1CD2, PID: 0x606F)
//! - ABE CANdebugger FD (VID: 0x16D0, PID: 0x10B8)

pub mod acquisition;
pub mod bus_error;
pub mod clock;
pub mod constants;
pub mod device;
pub mod dfu;
pub mod error;
pub mod frame;
pub mod message;
pub mod structures;
pub mod transport;

// Re-export main types at crate root
pub use constants::{
    // CAN ID flags and masks
    CAN_EFF_FLAG,
    CAN_EFF_MASK,
    CAN_RTR_FLAG,
    CAN_SFF_MASK,
    // Device flags for start
    DEV_FLAG_CAN_FD,
    DEV_FLAG_DISABLE_TX_ECHO,
    DEV_FLAG_HW_TIMESTAMP,
    DEV_FLAG_IDENTIFY,
    DEV_FLAG_LISTEN_ONLY,
    DEV_FLAG_LOOPBACK,
    DEV_FLAG_ONE_SHOT,
    DEV_FLAG_PAD_PKTS,
    DEV_FLAG_TRIPLE_SAMPLE,
    // Interfaces
    INTERFACE_CANDLE,
    INTERFACE_DFU,
};

pub use bus_error::{decode_bus_error, BusError, BusStatus, Severity};
pub use clock::Timestamp;
pub use device::{Candlelight, DeviceInfo, Received, Sent, SessionState};
pub use dfu::{DfuState, DfuStatus};
pub use error::{CandleError, FramingError, Result};
pub use frame::CanFrame;
pub use structures::{BitTiming, BoardInfo, Capability, DeviceVersion, Feedback};
pub use transport::{enumerate, DeviceEntry, Transport, UsbInfo};
