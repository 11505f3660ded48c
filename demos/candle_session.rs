//! Candlelight session example
//!
//! Opens the first adapter found, sets 500 kbaud, connects to the bus and
//! then sends a frame every second while printing everything received:
//! - frames and their echoes with timestamps
//! - bus errors with their severity
//! - bus load reports and firmware messages

use std::time::{Duration, Instant};

use candlelight::{
    enumerate, CanFrame, CandleError, Candlelight, Received, Severity, DEV_FLAG_HW_TIMESTAMP,
    INTERFACE_CANDLE,
};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candlelight::Result<()> {
    let devices = enumerate(INTERFACE_CANDLE)?;
    let Some(entry) = devices.first() else {
        println!("No Candlelight adapter found");
        return Ok(());
    };
    println!("Opening {} at {}", entry.name, entry.path);

    let mut dev = Candlelight::open(&entry.path)?;
    println!("{}", dev.details());

    // 160 MHz / 2 = 80 MHz, 160 quanta per bit
    println!("{}", dev.set_bitrate(false, 2, 139, 20)?);
    dev.set_busload_report(10)?;
    dev.start(DEV_FLAG_HW_TIMESTAMP)?;
    println!("Connected to the bus (press Ctrl+C to stop)\n");

    let frames = [
        CanFrame::new(0x7DF, &[0x02, 0x01, 0x00]),
        CanFrame::new(0x123, &[]),
        CanFrame::new_extended(0x18DA_F110, &[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]),
        CanFrame::remote(0x456, false, 4),
    ];
    let mut next_send = Instant::now();
    let mut index = 0;

    loop {
        if Instant::now() >= next_send {
            next_send = Instant::now() + Duration::from_secs(1);
            let frame = &frames[index];
            index = (index + 1) % frames.len();

            match dev.send(frame) {
                Ok(sent) => {
                    // with hardware timestamps only the echo carries bus time
                    let time = sent
                        .timestamp
                        .map_or_else(|| "No Timestamp    ".to_string(), |t| t.to_string());
                    println!("{}  TX   [{:3}] {}", time, sent.marker, frame)
                }
                Err(CandleError::TxBufferFull) => println!("TX  buffer full, waiting"),
                Err(e) => eprintln!("Send error: {}", e),
            }
        }

        match dev.receive(Duration::from_millis(50)) {
            Ok(Some(Received::Frame { frame, timestamp })) => {
                println!("{}  RX        {}", timestamp, frame)
            }
            Ok(Some(Received::Echo {
                marker,
                frame,
                timestamp,
            })) => println!("{}  ECHO [{:3}] {}", timestamp, marker, frame),
            Ok(Some(Received::BusError { error, timestamp })) => {
                let level = match error.severity {
                    Severity::High => "ERROR",
                    Severity::Medium => "WARN ",
                    Severity::Low => "INFO ",
                };
                println!("{}  {} {}", timestamp, level, error);
            }
            Ok(Some(Received::Busload(percent))) => println!("Bus load: {}%", percent),
            Ok(Some(Received::Text(text))) => println!("Firmware: {}", text),
            Ok(None) => {}
            Err(e) if e.is_disconnected() => return Err(e),
            Err(e) => eprintln!("Receive error: {}", e),
        }
    }
}
