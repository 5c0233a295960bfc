use std::path::PathBuf;

use thiserror::Error;

use crate::polarity::Polarity;

#[derive(Debug, Error)]
pub enum Error {
    /// An instrument could not be opened, or stopped answering
    #[error("instrument error ({instrument}): {message}")]
    Instrument {
        instrument: String,
        message: String,
    },

    #[error("resistor table {path:?}: {message}")]
    ResistorTable { path: PathBuf, message: String },

    #[error("resistor `{0}` is not in the resistor table")]
    UnknownResistor(String),

    /// Output of the bias-current stage is missing or malformed
    #[error("prior-stage results {path:?}: {message}")]
    Handoff { path: PathBuf, message: String },

    #[error("test incomplete: no accepted readings at {0} polarity")]
    IncompleteTest(Polarity),

    #[error("measurement aborted by operator")]
    Aborted,

    #[error("fit error: {0}")]
    Fit(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl Error {
    pub(crate) fn instrument(instrument: &str, message: impl std::fmt::Display) -> Self {
        Self::Instrument {
            instrument: instrument.to_owned(),
            message: message.to_string(),
        }
    }

    /// Conditions after which the operator may simply repeat the test
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::IncompleteTest(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
