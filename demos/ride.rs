use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use trainerlink::{
    BrakeConfig, ButtonPress, ButtonPressListener, BushidoBrake, Button, Node, NodeConfig, Result,
    TelemetryListener, UsbConfig, UsbTransport,
};

struct Dashboard;

impl TelemetryListener for Dashboard {
    fn on_speed_change(&self, speed: f64) {
        info!("🚴 {:.1} km/h", speed);
    }

    fn on_power_change(&self, power: f64) {
        info!("⚡ {:.0} W", power);
    }

    fn on_distance_change(&self, distance: f64) {
        info!("📏 {:.0} m", distance);
    }
}

struct Buttons;

impl ButtonPressListener for Buttons {
    fn on_button_press_finished(&self, press: &ButtonPress) {
        info!("🔘 {} released after {:?}", press.button, press.duration);
    }
}

/// Up/down on the headunit change the slope
struct SlopeButtons(Arc<BushidoBrake>);

impl ButtonPressListener for SlopeButtons {
    fn on_button_press_finished(&self, press: &ButtonPress) {
        match press.button {
            Button::Up => self.0.increment_slope(),
            Button::Down => self.0.decrement_slope(),
            _ => return,
        }
        info!("⛰️ Slope now {:.1} %", self.0.slope());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚲 trainerlink ride example");
    let transport = Arc::new(UsbTransport::open(UsbConfig::default())?);
    let node = Arc::new(Node::new(transport, NodeConfig::default()));
    let brake = Arc::new(BushidoBrake::new(node.clone(), BrakeConfig::default()));

    let dashboard: Arc<dyn TelemetryListener> = Arc::new(Dashboard);
    brake.register_data_listener(&dashboard);

    let buttons: Arc<dyn ButtonPressListener> = Arc::new(Buttons);
    let slope_buttons: Arc<dyn ButtonPressListener> = Arc::new(SlopeButtons(brake.clone()));
    brake.register_button_listener(&buttons);
    brake.register_button_listener(&slope_buttons);

    if let Err(e) = brake.start().await {
        error!("❌ Failed to start: {}", e);
        node.stop().await?;
        return Err(e);
    }
    info!("✅ Streaming; riding for five minutes");

    sleep(Duration::from_secs(300)).await;

    let telemetry = brake.telemetry();
    info!(
        "📊 Distance {:.0} m (measured {:.0} m)",
        telemetry.distance, telemetry.real_distance
    );

    if let Err(e) = brake.stop().await {
        error!("❌ Disconnect failed: {}", e);
    }
    brake.unregister_button_listener(&slope_buttons);
    node.stop().await?;
    info!("👋 Done");
    Ok(())
}
