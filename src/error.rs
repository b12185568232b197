//! Error type shared by the transport, the instrument drivers and the sweeps.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted on a driver whose session is closed.
    #[error("instrument not connected")]
    NotConnected,

    /// A sweep was handed an instrument that is not connected.
    #[error("cannot perform sweep: {instrument} not connected")]
    InstrumentNotConnected { instrument: String },

    /// Unsupported wire mode, malformed sweep range and similar setup mistakes.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The instrument answered with something that is not the expected numeric payload.
    #[error("could not parse measurement from response {response:?}")]
    MeasurementParse { response: String },

    /// Bus communication failure (open, write, query or close).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("plot error: {0}")]
    Plot(String),
}

impl Error {
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport(message.into())
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Error::InvalidConfiguration(message.into())
    }

    pub fn parse(response: impl Into<String>) -> Self {
        Error::MeasurementParse {
            response: response.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_instrument() {
        let err = Error::InstrumentNotConnected {
            instrument: "power meter".to_string(),
        };
        assert_eq!(err.to_string(), "cannot perform sweep: power meter not connected");
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
