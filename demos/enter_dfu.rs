//! Firmware update example
//!
//! Switches the first adapter into its DFU bootloader so that new firmware
//! can be flashed with a DFU tool.

use candlelight::{enumerate, Candlelight, INTERFACE_DFU};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> candlelight::Result<()> {
    let devices = enumerate(INTERFACE_DFU)?;
    let Some(entry) = devices.first() else {
        println!("No Candlelight adapter with a DFU interface found");
        return Ok(());
    };
    println!("Found {} at {}", entry.name, entry.path);

    let dev = Candlelight::open(&entry.path)?;
    if dev.enter_dfu_mode()? {
        println!("The BOOT0 pin was disabled. Reconnect the USB cable to start the bootloader.");
    } else {
        println!("The adapter is switching to the bootloader.");
    }
    Ok(())
}
