//! ANT message model and wire framing.
//!
//! Every exchange with the USB stick is a frame:
//!
//! ```text
//! ┌──────┬────────┬────────────┬──────────────────────┬──────────┐
//! │ 0xA4 │ length │ message id │ payload (length B)   │ checksum │
//! └──────┴────────┴────────────┴──────────────────────┴──────────┘
//! ```
//!
//! The first payload byte is the channel number for channel-scoped messages
//! (the network number for [`MessageId::SetNetworkKey`]). Data messages may
//! carry an extension block introduced by a flag byte; see [`Capabilities`].

use crate::error::{Result, TrainerError};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame sync byte
pub const SYNC: u8 = 0xA4;

/// Length of the application data carried by broadcast/acknowledged messages
pub const DATA_LEN: usize = 8;

/// Sync, length, id and checksum bytes wrapped around every payload
pub const FRAME_OVERHEAD: usize = 4;

/// ANT message identifiers used by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageId {
    /// Channel response or channel event
    ChannelEvent = 0x40,
    /// Unassign a channel
    UnassignChannel = 0x41,
    /// Assign a channel to a network
    AssignChannel = 0x42,
    /// Set the channel message period
    ChannelPeriod = 0x43,
    /// Set the channel search timeout
    SearchTimeout = 0x44,
    /// Set the channel radio frequency
    RfFrequency = 0x45,
    /// Load a network key into a network slot
    SetNetworkKey = 0x46,
    /// Reset the radio
    ResetSystem = 0x4A,
    /// Open a channel
    OpenChannel = 0x4B,
    /// Close a channel
    CloseChannel = 0x4C,
    /// Ask the radio to send a specific message
    RequestMessage = 0x4D,
    /// Broadcast data
    BroadcastData = 0x4E,
    /// Acknowledged data
    AcknowledgedData = 0x4F,
    /// Set the channel id (device number, type, transmission type)
    ChannelId = 0x51,
    /// Channel status reply
    ChannelStatus = 0x52,
    /// Sent by the radio after power-up or reset
    StartupMessage = 0x6F,
}

/// Closed set of message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Broadcast data on a channel
    BroadcastData,
    /// Acknowledged data on a channel
    AcknowledgedData,
    /// Channel responses, events and radio notifications
    Response,
    /// Host-to-radio configuration commands
    Command,
}

impl MessageId {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x40 => Some(Self::ChannelEvent),
            0x41 => Some(Self::UnassignChannel),
            0x42 => Some(Self::AssignChannel),
            0x43 => Some(Self::ChannelPeriod),
            0x44 => Some(Self::SearchTimeout),
            0x45 => Some(Self::RfFrequency),
            0x46 => Some(Self::SetNetworkKey),
            0x4A => Some(Self::ResetSystem),
            0x4B => Some(Self::OpenChannel),
            0x4C => Some(Self::CloseChannel),
            0x4D => Some(Self::RequestMessage),
            0x4E => Some(Self::BroadcastData),
            0x4F => Some(Self::AcknowledgedData),
            0x51 => Some(Self::ChannelId),
            0x52 => Some(Self::ChannelStatus),
            0x6F => Some(Self::StartupMessage),
            _ => None,
        }
    }

    /// Kind this identifier belongs to
    #[must_use]
    pub const fn kind(self) -> MessageKind {
        match self {
            Self::BroadcastData => MessageKind::BroadcastData,
            Self::AcknowledgedData => MessageKind::AcknowledgedData,
            Self::ChannelEvent | Self::ChannelStatus | Self::StartupMessage => {
                MessageKind::Response
            }
            _ => MessageKind::Command,
        }
    }

    /// Fixed payload length, excluding any extension block
    #[must_use]
    pub const fn payload_len(self) -> usize {
        match self {
            Self::UnassignChannel
            | Self::ResetSystem
            | Self::OpenChannel
            | Self::CloseChannel
            | Self::StartupMessage => 1,
            Self::SearchTimeout
            | Self::RfFrequency
            | Self::RequestMessage
            | Self::ChannelStatus => 2,
            Self::ChannelEvent | Self::AssignChannel | Self::ChannelPeriod => 3,
            Self::ChannelId => 5,
            Self::SetNetworkKey | Self::BroadcastData | Self::AcknowledgedData => 1 + DATA_LEN,
        }
    }

    /// Whether the first payload byte names a channel
    #[must_use]
    pub const fn is_channel_scoped(self) -> bool {
        !matches!(
            self,
            Self::ResetSystem | Self::SetNetworkKey | Self::StartupMessage
        )
    }

    /// Whether messages of this id may carry an extension block
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::BroadcastData | Self::AcknowledgedData)
    }
}

/// Channel response and event codes reported in [`MessageId::ChannelEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Command accepted
    NoError,
    /// Search for a master timed out
    RxSearchTimeout,
    /// A receive slot was missed
    RxFail,
    /// A broadcast was transmitted
    Tx,
    /// Acknowledged or burst receive failed
    TransferRxFailed,
    /// Acknowledged transfer completed
    TransferTxCompleted,
    /// Acknowledged transfer failed
    TransferTxFailed,
    /// Channel has closed
    ChannelClosed,
    /// Channel dropped back to search
    RxFailGoToSearch,
    /// Another channel collided with this one
    ChannelCollision,
    /// Command not valid in the channel's state
    ChannelInWrongState,
    /// Channel is not open
    ChannelNotOpened,
    /// Channel id has not been set
    ChannelIdNotSet,
    /// A transfer is already in progress
    TransferInProgress,
    /// Malformed command
    InvalidMessage,
    /// Network number out of range
    InvalidNetworkNumber,
    /// Unrecognised code
    Unknown(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::NoError,
            0x01 => Self::RxSearchTimeout,
            0x02 => Self::RxFail,
            0x03 => Self::Tx,
            0x04 => Self::TransferRxFailed,
            0x05 => Self::TransferTxCompleted,
            0x06 => Self::TransferTxFailed,
            0x07 => Self::ChannelClosed,
            0x08 => Self::RxFailGoToSearch,
            0x09 => Self::ChannelCollision,
            0x15 => Self::ChannelInWrongState,
            0x16 => Self::ChannelNotOpened,
            0x18 => Self::ChannelIdNotSet,
            0x1F => Self::TransferInProgress,
            0x28 => Self::InvalidMessage,
            0x29 => Self::InvalidNetworkNumber,
            other => Self::Unknown(other),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::NoError => 0x00,
            ResponseCode::RxSearchTimeout => 0x01,
            ResponseCode::RxFail => 0x02,
            ResponseCode::Tx => 0x03,
            ResponseCode::TransferRxFailed => 0x04,
            ResponseCode::TransferTxCompleted => 0x05,
            ResponseCode::TransferTxFailed => 0x06,
            ResponseCode::ChannelClosed => 0x07,
            ResponseCode::RxFailGoToSearch => 0x08,
            ResponseCode::ChannelCollision => 0x09,
            ResponseCode::ChannelInWrongState => 0x15,
            ResponseCode::ChannelNotOpened => 0x16,
            ResponseCode::ChannelIdNotSet => 0x18,
            ResponseCode::TransferInProgress => 0x1F,
            ResponseCode::InvalidMessage => 0x28,
            ResponseCode::InvalidNetworkNumber => 0x29,
            ResponseCode::Unknown(other) => other,
        }
    }
}

/// Channel event responding-to id used for unsolicited RF events
pub const RF_EVENT: u8 = 0x01;

/// Channel types accepted by [`MessageId::AssignChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelType {
    /// Bidirectional slave (receive)
    Slave = 0x00,
    /// Bidirectional master (transmit)
    Master = 0x10,
    /// Shared bidirectional slave
    SharedSlave = 0x20,
    /// Shared bidirectional master
    SharedMaster = 0x30,
    /// Receive-only slave
    SlaveReceiveOnly = 0x40,
    /// Transmit-only master
    MasterTransmitOnly = 0x50,
}

/// Bit-packed field that can be read or written through the field table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Channel number
    Channel,
    /// Network slot number
    NetworkNumber,
    /// Channel type byte
    ChannelType,
    /// Device number of a channel id
    DeviceNumber,
    /// Device type of a channel id (7 bits)
    DeviceType,
    /// Pairing bit of a channel id
    PairingFlag,
    /// Transmission type of a channel id
    TransmissionType,
    /// Channel period in 1/32768 s
    Period,
    /// Search timeout in 2.5 s units
    SearchTimeout,
    /// RF frequency offset from 2400 MHz
    RfFrequency,
    /// Id of the message a channel event responds to
    RespondingTo,
    /// Response or event code
    ResponseCode,
    /// Id requested by a request message
    RequestedId,
    /// Channel state in a status reply
    ChannelState,
}

/// Location and legal range of a field inside one message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name used in validation errors
    pub name: &'static str,
    /// Byte offset into the payload
    pub offset: usize,
    /// Bit offset within the little-endian value starting at `offset`
    pub shift: u32,
    /// Width in bits
    pub width: u32,
    /// Smallest legal value
    pub min: u32,
    /// Largest legal value
    pub max: u32,
}

const fn spec(name: &'static str, offset: usize, shift: u32, width: u32, max: u32) -> FieldSpec {
    FieldSpec {
        name,
        offset,
        shift,
        width,
        min: 0,
        max,
    }
}

const CHANNEL: FieldSpec = spec("channel", 0, 0, 8, 0xFF);
const NETWORK: FieldSpec = spec("network_number", 0, 0, 8, 7);

impl Field {
    /// Field layout for a given message id, if that id carries the field
    #[must_use]
    pub const fn spec_for(self, id: MessageId) -> Option<FieldSpec> {
        use MessageId as M;
        match (self, id) {
            (Self::NetworkNumber, M::SetNetworkKey) => Some(NETWORK),
            (Self::NetworkNumber, M::AssignChannel) => Some(FieldSpec { offset: 2, ..NETWORK }),
            (Self::Channel, _) if id.is_channel_scoped() => Some(CHANNEL),
            (Self::ChannelType, M::AssignChannel) => Some(spec("channel_type", 1, 0, 8, 0x50)),
            (Self::DeviceNumber, M::ChannelId) => Some(spec("device_number", 1, 0, 16, 0xFFFF)),
            (Self::DeviceType, M::ChannelId) => Some(spec("device_type", 3, 0, 7, 0x7F)),
            (Self::PairingFlag, M::ChannelId) => Some(spec("pairing_flag", 3, 7, 1, 1)),
            (Self::TransmissionType, M::ChannelId) => {
                Some(spec("transmission_type", 4, 0, 8, 0xFF))
            }
            (Self::Period, M::ChannelPeriod) => Some(spec("period", 1, 0, 16, 0xFFFF)),
            (Self::SearchTimeout, M::SearchTimeout) => Some(spec("search_timeout", 1, 0, 8, 0xFF)),
            (Self::RfFrequency, M::RfFrequency) => Some(spec("rf_frequency", 1, 0, 8, 124)),
            (Self::RespondingTo, M::ChannelEvent) => Some(spec("responding_to", 1, 0, 8, 0xFF)),
            (Self::ResponseCode, M::ChannelEvent) => Some(spec("response_code", 2, 0, 8, 0xFF)),
            (Self::RequestedId, M::RequestMessage) => Some(spec("requested_id", 1, 0, 8, 0xFF)),
            (Self::ChannelState, M::ChannelStatus) => Some(spec("channel_state", 1, 0, 2, 3)),
            _ => None,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::NetworkNumber => "network_number",
            Self::ChannelType => "channel_type",
            Self::DeviceNumber => "device_number",
            Self::DeviceType => "device_type",
            Self::PairingFlag => "pairing_flag",
            Self::TransmissionType => "transmission_type",
            Self::Period => "period",
            Self::SearchTimeout => "search_timeout",
            Self::RfFrequency => "rf_frequency",
            Self::RespondingTo => "responding_to",
            Self::ResponseCode => "response_code",
            Self::RequestedId => "requested_id",
            Self::ChannelState => "channel_state",
        }
    }
}

fn validate(spec: &FieldSpec, value: u32) -> Result<()> {
    if value < spec.min || value > spec.max {
        return Err(TrainerError::Validation {
            field: spec.name,
            value: i64::from(value),
            min: i64::from(spec.min),
            max: i64::from(spec.max),
        });
    }
    Ok(())
}

/// Extension blocks present on a data message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    /// Channel id of the transmitting device
    pub const DEVICE_INFO: Self = Self(0x80);
    /// Received signal strength
    pub const RSSI: Self = Self(0x40);
    /// Receive timestamp
    pub const TIMESTAMP: Self = Self(0x20);

    /// Flags as the wire flag byte
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check whether every flag in `other` is set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// No extension present
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

/// Channel id of a transmitting device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device number
    pub device_number: u16,
    /// Device type (7 bits)
    pub device_type: u8,
    /// Pairing bit
    pub pairing: bool,
    /// Transmission type
    pub transmission_type: u8,
}

impl DeviceIdentity {
    /// Build a validated device identity
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] if any value is outside its field range.
    pub fn new(
        device_number: u32,
        device_type: u32,
        pairing: bool,
        transmission_type: u32,
    ) -> Result<Self> {
        let id = MessageId::ChannelId;
        for (field, value) in [
            (Field::DeviceNumber, device_number),
            (Field::DeviceType, device_type),
            (Field::TransmissionType, transmission_type),
        ] {
            if let Some(spec) = field.spec_for(id) {
                validate(&spec, value)?;
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            device_number: device_number as u16,
            device_type: device_type as u8,
            pairing,
            transmission_type: transmission_type as u8,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.device_number);
        buf.put_u8(self.device_type | if self.pairing { 0x80 } else { 0 });
        buf.put_u8(self.transmission_type);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            device_number: u16::from_le_bytes([bytes[0], bytes[1]]),
            device_type: bytes[2] & 0x7F,
            pairing: bytes[2] & 0x80 != 0,
            transmission_type: bytes[3],
        }
    }
}

/// Signal strength block of an extended data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssiInfo {
    /// Measurement type reported by the radio
    pub measurement_type: u8,
    /// Signal strength in dBm
    pub value: i8,
    /// Configured threshold in dBm
    pub threshold: i8,
}

/// An ANT message: identifier, payload and optional extension blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    payload: Vec<u8>,
    device: Option<DeviceIdentity>,
    rssi: Option<RssiInfo>,
    rx_timestamp: Option<u16>,
}

impl Message {
    /// Create a zero-filled message of the given id
    #[must_use]
    pub fn new(id: MessageId) -> Self {
        Self {
            id,
            payload: vec![0; id.payload_len()],
            device: None,
            rssi: None,
            rx_timestamp: None,
        }
    }

    /// Create a message addressed to a channel
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] if `id` is not channel-scoped.
    pub fn on_channel(id: MessageId, channel: u8) -> Result<Self> {
        let mut message = Self::new(id);
        message.set_field(Field::Channel, u32::from(channel))?;
        Ok(message)
    }

    /// Broadcast data message carrying `data` (zero-padded to 8 bytes)
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] if `data` is longer than 8 bytes.
    pub fn broadcast(channel: u8, data: &[u8]) -> Result<Self> {
        let mut message = Self::on_channel(MessageId::BroadcastData, channel)?;
        message.set_data(data)?;
        Ok(message)
    }

    /// Acknowledged data message carrying `data` (zero-padded to 8 bytes)
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] if `data` is longer than 8 bytes.
    pub fn acknowledged(channel: u8, data: &[u8]) -> Result<Self> {
        let mut message = Self::on_channel(MessageId::AcknowledgedData, channel)?;
        message.set_data(data)?;
        Ok(message)
    }

    /// Radio reset command
    #[must_use]
    pub fn reset_system() -> Self {
        Self::new(MessageId::ResetSystem)
    }

    /// Channel event/response message
    #[must_use]
    pub fn channel_event(channel: u8, responding_to: u8, code: ResponseCode) -> Self {
        let mut message = Self::new(MessageId::ChannelEvent);
        message.payload[0] = channel;
        message.payload[1] = responding_to;
        message.payload[2] = code.into();
        message
    }

    /// Message identifier
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Message kind
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.id.kind()
    }

    /// Channel number, for channel-scoped messages
    #[must_use]
    pub fn channel(&self) -> Option<u8> {
        self.id.is_channel_scoped().then(|| self.payload[0])
    }

    /// Raw payload including the leading channel/network byte
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Application data of a data message
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for non-data messages.
    pub fn data(&self) -> Result<&[u8]> {
        self.require_data("data")?;
        Ok(&self.payload[1..])
    }

    /// Replace the application data of a data message, zero-padding to 8 bytes
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for non-data messages and
    /// [`TrainerError::Validation`] if `data` is longer than 8 bytes.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        self.require_data("data")?;
        if data.len() > DATA_LEN {
            return Err(TrainerError::Validation {
                field: "data",
                value: i64::try_from(data.len()).unwrap_or(i64::MAX),
                min: 0,
                max: DATA_LEN as i64,
            });
        }
        self.payload[1..].fill(0);
        self.payload[1..=data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Replace the 8-byte key of a [`MessageId::SetNetworkKey`] message
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for any other message id.
    pub fn set_network_key(&mut self, key: &[u8; 8]) -> Result<()> {
        if self.id != MessageId::SetNetworkKey {
            return Err(self.missing("network_key"));
        }
        self.payload[1..].copy_from_slice(key);
        Ok(())
    }

    /// Read a field through the field table
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] if this message id does not carry `field`.
    pub fn field(&self, field: Field) -> Result<u32> {
        let spec = field
            .spec_for(self.id)
            .ok_or_else(|| self.missing(field.name()))?;
        let raw = self.read_le(&spec);
        Ok((raw >> spec.shift) & mask(spec.width))
    }

    /// Write a field through the field table, validating its range
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::Validation`] naming the field when `value` is outside
    /// the declared range, or [`TrainerError::CapabilityNotPresent`] if this message
    /// id does not carry `field`.
    pub fn set_field(&mut self, field: Field, value: u32) -> Result<()> {
        let spec = field
            .spec_for(self.id)
            .ok_or_else(|| self.missing(field.name()))?;
        validate(&spec, value)?;

        let field_mask = mask(spec.width) << spec.shift;
        let raw = (self.read_le(&spec) & !field_mask) | ((value << spec.shift) & field_mask);
        let len = byte_span(&spec);
        let bytes = raw.to_le_bytes();
        self.payload[spec.offset..spec.offset + len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    /// Builder form of [`Message::set_field`]
    ///
    /// # Errors
    ///
    /// Same as [`Message::set_field`].
    pub fn with_field(mut self, field: Field, value: u32) -> Result<Self> {
        self.set_field(field, value)?;
        Ok(self)
    }

    /// Response code of a channel event
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for other message ids.
    pub fn response_code(&self) -> Result<ResponseCode> {
        #[allow(clippy::cast_possible_truncation)]
        self.field(Field::ResponseCode)
            .map(|code| ResponseCode::from(code as u8))
    }

    /// Extension blocks present on this message
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        if self.device.is_some() {
            caps.insert(Capabilities::DEVICE_INFO);
        }
        if self.rssi.is_some() {
            caps.insert(Capabilities::RSSI);
        }
        if self.rx_timestamp.is_some() {
            caps.insert(Capabilities::TIMESTAMP);
        }
        caps
    }

    /// Channel id of the transmitting device
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] if the frame carried no device block.
    pub fn device_info(&self) -> Result<DeviceIdentity> {
        self.device.ok_or_else(|| self.missing("device info"))
    }

    /// Signal strength block
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] if the frame carried no RSSI block.
    pub fn rssi(&self) -> Result<RssiInfo> {
        self.rssi.ok_or_else(|| self.missing("rssi"))
    }

    /// Receive timestamp in 1/32768 s
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] if the frame carried no timestamp.
    pub fn rx_timestamp(&self) -> Result<u16> {
        self.rx_timestamp.ok_or_else(|| self.missing("rx timestamp"))
    }

    /// Attach a device block
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for non-data messages.
    pub fn set_device_info(&mut self, device: DeviceIdentity) -> Result<()> {
        self.require_data("device info")?;
        self.device = Some(device);
        Ok(())
    }

    /// Attach an RSSI block
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for non-data messages.
    pub fn set_rssi(&mut self, rssi: RssiInfo) -> Result<()> {
        self.require_data("rssi")?;
        self.rssi = Some(rssi);
        Ok(())
    }

    /// Attach a receive timestamp
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::CapabilityNotPresent`] for non-data messages.
    pub fn set_rx_timestamp(&mut self, timestamp: u16) -> Result<()> {
        self.require_data("rx timestamp")?;
        self.rx_timestamp = Some(timestamp);
        Ok(())
    }

    /// Serialize to a complete wire frame
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 10 + FRAME_OVERHEAD);
        buf.put_u8(SYNC);
        buf.put_u8(0);
        buf.put_u8(self.id as u8);
        buf.extend_from_slice(&self.payload);

        let caps = self.capabilities();
        if !caps.is_empty() {
            buf.put_u8(caps.bits());
            if let Some(device) = &self.device {
                device.encode(&mut buf);
            }
            if let Some(rssi) = &self.rssi {
                buf.put_u8(rssi.measurement_type);
                buf.put_i8(rssi.value);
                buf.put_i8(rssi.threshold);
            }
            if let Some(timestamp) = self.rx_timestamp {
                buf.put_u16_le(timestamp);
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = (buf.len() - 3) as u8;
        buf[1] = len;
        let checksum = checksum(&buf[1..]);
        buf.put_u8(checksum);
        buf.freeze()
    }

    /// Parse a complete wire frame
    ///
    /// # Errors
    ///
    /// Returns [`TrainerError::MalformedFrame`] on a bad sync byte, length,
    /// checksum, unknown id or extension layout.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_OVERHEAD + 1 {
            return Err(malformed(format!("frame too short: {} bytes", frame.len())));
        }
        if frame[0] != SYNC {
            return Err(malformed(format!("bad sync byte {:#04X}", frame[0])));
        }

        let declared = usize::from(frame[1]);
        if frame.len() != declared + FRAME_OVERHEAD {
            return Err(malformed(format!(
                "declared length {declared} does not match frame of {} bytes",
                frame.len()
            )));
        }

        let (body, trailer) = frame.split_at(frame.len() - 1);
        let expected = checksum(&body[1..]);
        if trailer[0] != expected {
            return Err(malformed(format!(
                "checksum {:#04X} does not match computed {expected:#04X}",
                trailer[0]
            )));
        }

        let id = MessageId::from_u8(frame[2])
            .ok_or_else(|| malformed(format!("unknown message id {:#04X}", frame[2])))?;
        let content = &body[3..];
        let base = id.payload_len();
        if content.len() < base {
            return Err(malformed(format!(
                "{id:?} payload of {} bytes, expected {base}",
                content.len()
            )));
        }

        let mut message = Self {
            id,
            payload: content[..base].to_vec(),
            device: None,
            rssi: None,
            rx_timestamp: None,
        };
        if content.len() > base {
            if !id.is_data() {
                return Err(malformed(format!(
                    "{id:?} payload of {} bytes, expected {base}",
                    content.len()
                )));
            }
            message.decode_extension(&content[base..])?;
        }
        Ok(message)
    }

    fn decode_extension(&mut self, ext: &[u8]) -> Result<()> {
        let caps = Capabilities(ext[0]);
        let mut rest = &ext[1..];
        let mut take = |n: usize| -> Result<&[u8]> {
            if rest.len() < n {
                return Err(malformed("truncated extension block".to_string()));
            }
            let (head, tail) = rest.split_at(n);
            rest = tail;
            Ok(head)
        };

        if caps.contains(Capabilities::DEVICE_INFO) {
            self.device = Some(DeviceIdentity::decode(take(4)?));
        }
        if caps.contains(Capabilities::RSSI) {
            let bytes = take(3)?;
            self.rssi = Some(RssiInfo {
                measurement_type: bytes[0],
                value: i8::from_le_bytes([bytes[1]]),
                threshold: i8::from_le_bytes([bytes[2]]),
            });
        }
        if caps.contains(Capabilities::TIMESTAMP) {
            let bytes = take(2)?;
            self.rx_timestamp = Some(u16::from_le_bytes([bytes[0], bytes[1]]));
        }
        if !rest.is_empty() {
            return Err(malformed(format!(
                "{} unexpected bytes after extension flag {:#04X}",
                rest.len(),
                caps.bits()
            )));
        }
        Ok(())
    }

    fn read_le(&self, spec: &FieldSpec) -> u32 {
        let mut bytes = [0u8; 4];
        let len = byte_span(spec);
        bytes[..len].copy_from_slice(&self.payload[spec.offset..spec.offset + len]);
        u32::from_le_bytes(bytes)
    }

    fn require_data(&self, capability: &'static str) -> Result<()> {
        if self.id.is_data() {
            Ok(())
        } else {
            Err(self.missing(capability))
        }
    }

    fn missing(&self, capability: &'static str) -> TrainerError {
        TrainerError::CapabilityNotPresent {
            capability,
            id: self.id as u8,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:02X?}", self.id, self.payload)
    }
}

const fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

const fn byte_span(spec: &FieldSpec) -> usize {
    ((spec.shift + spec.width + 7) / 8) as usize
}

fn malformed(reason: String) -> TrainerError {
    TrainerError::MalformedFrame(reason)
}

/// Bytes are folded as signed values modulo 0xFF before they are XORed in.
/// The remainder of a signed byte by 0xFF is the byte itself, so the fold
/// never alters the result; it is kept so the checksum stays bit-identical
/// with frames captured from existing host software.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn fold(byte: u8) -> u8 {
    ((byte as i8 as i16) % 0xFF) as u8
}

/// Frame checksum over everything after the sync byte (length, id, payload)
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(SYNC, |acc, &b| acc ^ fold(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_frame_bytes() {
        let frame = Message::reset_system().encode();
        assert_eq!(&frame[..], &[0xA4, 0x01, 0x4A, 0x00, 0xEF]);
    }

    #[test]
    fn test_broadcast_frame_layout() {
        let msg = Message::broadcast(2, &[0xAC, 0x03, 0x04]).unwrap();
        let frame = msg.encode();

        assert_eq!(frame.len(), 9 + FRAME_OVERHEAD);
        assert_eq!(frame[0], SYNC);
        assert_eq!(frame[1], 9);
        assert_eq!(frame[2], 0x4E);
        assert_eq!(frame[3], 2);
        assert_eq!(&frame[4..12], &[0xAC, 0x03, 0x04, 0, 0, 0, 0, 0]);
        assert_eq!(frame[12], checksum(&frame[1..12]));
    }

    #[test]
    fn test_checksum_fold_is_identity() {
        // 0xFF would become 0x00 under an unsigned modulo; the signed fold keeps it.
        for byte in 0..=u8::MAX {
            assert_eq!(fold(byte), byte);
        }
        assert_eq!(checksum(&[0xFF]), SYNC ^ 0xFF);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let frame = Message::broadcast(0, &[0xAD, 0x01, 0x04]).unwrap().encode();
        assert!(Message::decode(&frame).is_ok());

        for index in 0..frame.len() {
            let mut corrupted = frame.to_vec();
            corrupted[index] ^= 0x10;
            assert!(
                matches!(
                    Message::decode(&corrupted),
                    Err(TrainerError::MalformedFrame(_))
                ),
                "corruption at byte {index} was accepted"
            );
        }
    }

    #[test]
    fn test_decode_rejects_truncated_frame() {
        let frame = Message::reset_system().encode();
        assert!(matches!(
            Message::decode(&frame[..frame.len() - 1]),
            Err(TrainerError::MalformedFrame(_))
        ));
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_field_boundaries() {
        let mut msg = Message::on_channel(MessageId::ChannelId, 0).unwrap();

        assert!(msg.set_field(Field::DeviceType, 0).is_ok());
        assert!(msg.set_field(Field::DeviceType, 127).is_ok());
        match msg.set_field(Field::DeviceType, 128) {
            Err(TrainerError::Validation { field, .. }) => assert_eq!(field, "device_type"),
            other => panic!("expected validation error, got {other:?}"),
        }

        assert!(msg.set_field(Field::DeviceNumber, 65_535).is_ok());
        assert!(msg.set_field(Field::DeviceNumber, 65_536).is_err());
        assert!(msg.set_field(Field::PairingFlag, 2).is_err());

        let mut freq = Message::on_channel(MessageId::RfFrequency, 0).unwrap();
        assert!(freq.set_field(Field::RfFrequency, 124).is_ok());
        assert!(freq.set_field(Field::RfFrequency, 125).is_err());
    }

    #[test]
    fn test_bit_packed_fields_share_byte() {
        let msg = Message::on_channel(MessageId::ChannelId, 1)
            .unwrap()
            .with_field(Field::DeviceNumber, 0x1234)
            .unwrap()
            .with_field(Field::DeviceType, 0x52)
            .unwrap()
            .with_field(Field::PairingFlag, 1)
            .unwrap()
            .with_field(Field::TransmissionType, 5)
            .unwrap();

        assert_eq!(msg.payload(), &[1, 0x34, 0x12, 0xD2, 5]);
        assert_eq!(msg.field(Field::DeviceType).unwrap(), 0x52);
        assert_eq!(msg.field(Field::PairingFlag).unwrap(), 1);
        assert_eq!(msg.field(Field::DeviceNumber).unwrap(), 0x1234);
    }

    #[test]
    fn test_field_absent_on_kind() {
        let msg = Message::reset_system();
        assert!(matches!(
            msg.field(Field::Channel),
            Err(TrainerError::CapabilityNotPresent { .. })
        ));
        assert_eq!(msg.channel(), None);
    }

    #[test]
    fn test_capability_accessors() {
        let plain = Message::broadcast(0, &[1, 2, 3]).unwrap();
        assert!(plain.capabilities().is_empty());
        assert!(matches!(
            plain.device_info(),
            Err(TrainerError::CapabilityNotPresent { .. })
        ));

        let mut event = Message::channel_event(0, RF_EVENT, ResponseCode::Tx);
        assert!(event
            .set_device_info(DeviceIdentity::new(1, 2, false, 3).unwrap())
            .is_err());
        assert_eq!(event.response_code().unwrap(), ResponseCode::Tx);
    }

    #[test]
    fn test_extended_data_decodes() {
        let mut msg = Message::broadcast(0, &[0xDD, 0x01]).unwrap();
        msg.set_device_info(DeviceIdentity::new(513, 0x52, false, 1).unwrap())
            .unwrap();
        msg.set_rssi(RssiInfo {
            measurement_type: 0x20,
            value: -60,
            threshold: -90,
        })
        .unwrap();

        let frame = msg.encode();
        assert_eq!(frame[12], 0xC0);

        let decoded = Message::decode(&frame).unwrap();
        assert!(decoded.capabilities().contains(Capabilities::DEVICE_INFO));
        assert!(decoded.capabilities().contains(Capabilities::RSSI));
        assert_eq!(decoded.device_info().unwrap().device_number, 513);
        assert_eq!(decoded.rssi().unwrap().value, -60);
        assert!(decoded.rx_timestamp().is_err());
    }

    #[test]
    fn test_timestamp_block_decodes() {
        let mut msg = Message::acknowledged(2, &[0xAD, 0x01]).unwrap();
        msg.set_rx_timestamp(0xBEEF).unwrap();

        let frame = msg.encode();
        assert_eq!(frame[12], 0x20);
        assert_eq!(&frame[13..15], &[0xEF, 0xBE]);
        assert_eq!(frame.len(), 16);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.capabilities(), Capabilities::TIMESTAMP);
        assert_eq!(decoded.rx_timestamp().unwrap(), 0xBEEF);
        assert!(decoded.device_info().is_err());
        assert!(decoded.rssi().is_err());
    }

    #[test]
    fn test_all_blocks_in_flag_order() {
        let mut msg = Message::broadcast(0, &[0xDD]).unwrap();
        msg.set_rx_timestamp(0x0102).unwrap();
        msg.set_rssi(RssiInfo {
            measurement_type: 0x20,
            value: -45,
            threshold: -80,
        })
        .unwrap();
        msg.set_device_info(DeviceIdentity::new(7, 0x11, true, 5).unwrap())
            .unwrap();

        let frame = msg.encode();
        assert_eq!(frame[12], 0xE0);
        assert_eq!(&frame[13..17], &[0x07, 0x00, 0x91, 0x05]);
        assert_eq!(&frame[17..20], &[0x20, 0xD3, 0xB0]);
        assert_eq!(&frame[20..22], &[0x02, 0x01]);

        let decoded = Message::decode(&frame).unwrap();
        assert_eq!(decoded.rx_timestamp().unwrap(), 0x0102);
        assert!(decoded.device_info().unwrap().pairing);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_set_data_too_long() {
        let mut msg = Message::new(MessageId::BroadcastData);
        assert!(matches!(
            msg.set_data(&[0; 9]),
            Err(TrainerError::Validation { field: "data", .. })
        ));
    }

    #[test]
    fn test_response_code_mapping() {
        assert_eq!(ResponseCode::from(0x03), ResponseCode::Tx);
        assert_eq!(ResponseCode::from(0x07), ResponseCode::ChannelClosed);
        assert_eq!(ResponseCode::from(0x99), ResponseCode::Unknown(0x99));
        assert_eq!(u8::from(ResponseCode::ChannelInWrongState), 0x15);
    }
}
