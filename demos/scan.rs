use tracing::{error, info};
use trainerlink::{scan_devices, Result, UsbConfig};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🔍 Looking for ANT USB sticks...");
    let sticks = match scan_devices(&UsbConfig::default()) {
        Ok(sticks) => sticks,
        Err(e) => {
            error!("❌ USB enumeration failed: {}", e);
            return Err(e);
        }
    };

    if sticks.is_empty() {
        info!("No ANT sticks found");
    }
    for (index, stick) in sticks.iter().enumerate() {
        info!("  [{}] {}", index, stick);
    }
    Ok(())
}
