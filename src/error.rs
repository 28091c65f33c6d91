use thiserror::Error;

/// Errors that can occur when driving an ANT+ brake unit
#[derive(Error, Debug)]
pub enum TrainerError {
    /// A message field was written with a value outside its declared range
    #[error("Value {value} out of range for field {field} ({min}..={max})")]
    Validation {
        /// Name of the offending field
        field: &'static str,
        /// Rejected value
        value: i64,
        /// Smallest legal value
        min: i64,
        /// Largest legal value
        max: i64,
    },

    /// A received frame failed length, sync or checksum validation
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A capability accessor was used on a message kind that does not carry it
    #[error("Message {id:#04X} does not carry {capability}")]
    CapabilityNotPresent {
        /// Capability that was requested
        capability: &'static str,
        /// Raw message id of the message that was queried
        id: u8,
    },

    /// The USB stick could not be found, claimed or has an unexpected layout
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Every hardware channel on the node is already allocated
    #[error("No free ANT channel available (capacity {capacity})")]
    NoChannelAvailable {
        /// Number of channels the node manages
        capacity: u8,
    },

    /// No acknowledgement matched within the allotted time
    #[error("Acknowledgement timed out after {timeout_ms}ms")]
    AckTimeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// A handshake step failed on every attempt
    #[error("Gave up after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Cause of the final failed attempt
        #[source]
        source: Box<TrainerError>,
    },

    /// Odometer reset did not observe a (zeroed) distance in time
    #[error("Calibration timed out: {0}")]
    CalibrationTimeout(String),

    /// The radio rejected a command with a non-success response code
    #[error("Command {id:#04X} rejected with response code {code:#04X}")]
    ResponseError {
        /// Raw id of the rejected command
        id: u8,
        /// Raw response code reported by the radio
        code: u8,
    },

    /// Operation is not allowed in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Description of the current state
        state: String,
    },

    /// libusb error
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for trainer operations
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Check if this error indicates the link itself is unusable
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::Usb(_) | Self::NoChannelAvailable { .. }
        )
    }

    /// Check if this error came from a bounded wait running out
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AckTimeout { .. } | Self::RetryExhausted { .. } | Self::CalibrationTimeout(_)
        )
    }

    /// Check if this error is recoverable by calling `start()` again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AckTimeout { .. }
                | Self::RetryExhausted { .. }
                | Self::CalibrationTimeout(_)
                | Self::ResponseError { .. }
                | Self::InvalidState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_classification() {
        let unavailable = TrainerError::TransportUnavailable("no stick".to_string());
        assert!(unavailable.is_connection_error());
        assert!(!unavailable.is_recoverable());
        assert!(!unavailable.is_timeout());

        let timeout = TrainerError::AckTimeout { timeout_ms: 1000 };
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_recoverable());
        assert!(timeout.is_timeout());

        let pool = TrainerError::NoChannelAvailable { capacity: 8 };
        assert!(pool.is_connection_error());
        assert!(!pool.is_recoverable());
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let error = TrainerError::RetryExhausted {
            attempts: 20,
            source: Box::new(TrainerError::AckTimeout { timeout_ms: 1000 }),
        };
        assert!(error.to_string().contains("20 attempts"));

        let cause = error.source().map(ToString::to_string);
        assert_eq!(cause.as_deref(), Some("Acknowledgement timed out after 1000ms"));
    }

    #[test]
    fn test_error_display() {
        let error = TrainerError::Validation {
            field: "device_type",
            value: 200,
            min: 0,
            max: 127,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("device_type"));
        assert!(error_string.contains("0..=127"));
    }
}
