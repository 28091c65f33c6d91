use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Brake controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// No session; `start()` may be called
    Disconnected,
    /// Channel configured, waiting for the headunit to accept INIT
    Connecting,
    /// Headunit accepted the connection
    Connected,
    /// Odometer reset in progress
    Calibrating,
    /// Exchanging telemetry
    Streaming,
    /// Disconnect handshake in progress
    Disconnecting,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Calibrating => write!(f, "Calibrating"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Snapshot of the brake's telemetry and the host-controlled slope
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryData {
    /// Speed in km/h
    pub speed: f64,
    /// Power in watts
    pub power: f64,
    /// Cadence in rpm
    pub cadence: f64,
    /// Distance in metres as measured by the brake
    pub real_distance: f64,
    /// Distance in metres adjusted for virtual downhill speed
    pub distance: f64,
    /// Heart rate in bpm
    pub heart_rate: f64,
    /// Virtual slope in percent
    pub slope: f64,
}

/// Headunit buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Button {
    /// Left arrow
    Left,
    /// Right arrow
    Right,
    /// Up arrow
    Up,
    /// Down arrow
    Down,
    /// OK / enter
    Ok,
    /// Unrecognised button code
    Unknown(u8),
}

impl From<u8> for Button {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Left,
            0x02 => Self::Right,
            0x03 => Self::Up,
            0x04 => Self::Down,
            0x05 => Self::Ok,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "Left"),
            Self::Right => write!(f, "Right"),
            Self::Up => write!(f, "Up"),
            Self::Down => write!(f, "Down"),
            Self::Ok => write!(f, "OK"),
            Self::Unknown(code) => write!(f, "Unknown({code:#04X})"),
        }
    }
}

/// A button press reported by the headunit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonPress {
    /// Which button
    pub button: Button,
    /// Whether the button is still held
    pub active: bool,
    /// How long it has been (or was) held
    pub duration: Duration,
}

/// Identification of an attached ANT USB stick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickInfo {
    /// USB bus number
    pub bus: u8,
    /// Device address on the bus
    pub address: u8,
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
}

impl fmt::Display for StickInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} (bus {:03} address {:03})",
            self.vendor_id, self.product_id, self.bus, self.address
        )
    }
}

/// 8-byte ANT network key
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey(pub [u8; 8]);

impl NetworkKey {
    /// The ANT public network key
    pub const PUBLIC: Self = Self([0; 8]);

    /// Key bytes
    #[must_use]
    pub const fn bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::PUBLIC {
            write!(f, "NetworkKey(PUBLIC)")
        } else {
            write!(f, "NetworkKey(..)")
        }
    }
}

impl Default for NetworkKey {
    fn default() -> Self {
        Self::PUBLIC
    }
}

/// USB transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbConfig {
    /// USB vendor id of the ANT stick
    pub vendor_id: u16,
    /// Accepted product ids
    pub product_ids: Vec<u16>,
    /// Which matching stick to use when several are attached
    pub device_index: usize,
    /// Interface number carrying the bulk endpoints
    pub interface: u8,
    /// Size of each bulk read
    pub read_buffer_len: usize,
    /// Bulk read timeout in milliseconds; bounds how long `stop()` waits for the reader
    pub read_timeout_ms: u64,
    /// Bulk write timeout in milliseconds
    pub write_timeout_ms: u64,
}

impl UsbConfig {
    /// Whether a USB vendor/product pair is an ANT stick under this configuration
    #[must_use]
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        vendor_id == self.vendor_id && self.product_ids.contains(&product_id)
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0FCF,
            product_ids: vec![0x1008, 0x1009],
            device_index: 0,
            interface: 0,
            read_buffer_len: 64,
            read_timeout_ms: 1_000,
            write_timeout_ms: 1_000,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of hardware channels on the radio
    pub max_channels: u8,
    /// How long configuration commands wait for their channel response
    pub response_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_channels: 8,
            response_timeout_ms: 2_000,
        }
    }
}

/// Brake controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrakeConfig {
    /// Network key loaded into network slot 0
    pub network_key: NetworkKey,
    /// Device number to pair with (0 = any)
    pub device_number: u16,
    /// ANT device type of the brake
    pub device_type: u8,
    /// Transmission type (0 = any)
    pub transmission_type: u8,
    /// RF frequency offset from 2400 MHz
    pub rf_frequency: u8,
    /// Channel period in 1/32768 s
    pub channel_period: u16,
    /// Search timeout in 2.5 s units (255 = infinite)
    pub search_timeout: u8,
    /// Attempts for the INIT and DISCONNECT handshakes
    pub init_retries: u32,
    /// Timeout per handshake attempt in milliseconds
    pub retry_timeout_ms: u64,
    /// Timeout for EVENT_TX acknowledgements in milliseconds
    pub ack_timeout_ms: u64,
    /// Deadline for the first distance update after an odometer reset
    pub distance_update_timeout_ms: u64,
    /// Deadline for the distance to settle to zero
    pub reset_odometer_timeout_ms: u64,
    /// Distance below which the odometer counts as reset
    pub distance_epsilon: f64,
    /// Depth of the outbound send queue
    pub send_queue_depth: usize,
    /// Default step for `increment_slope`/`decrement_slope`
    pub slope_step: f64,
    /// Rider weight in kg sent with every data reply
    pub rider_weight: u8,
}

impl Default for BrakeConfig {
    fn default() -> Self {
        Self {
            network_key: NetworkKey::PUBLIC,
            device_number: 0,
            device_type: 0x52,
            transmission_type: 0,
            rf_frequency: 60,
            channel_period: 4096,
            search_timeout: 255,
            init_retries: 20,
            retry_timeout_ms: 1_000,
            ack_timeout_ms: 10_000,
            distance_update_timeout_ms: 10_000,
            reset_odometer_timeout_ms: 5_000,
            distance_epsilon: 1e-6,
            send_queue_depth: 16,
            slope_step: 0.1,
            rider_weight: 70,
        }
    }
}
