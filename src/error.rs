use crate::DriverReturn;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaqError>;

#[derive(Debug, Error)]
pub enum DaqError {
    /// Bad plan, duration or selection. Raised before any device interaction.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Open, configure or stream start failed.
    #[error("device unavailable during {context}: {code}")]
    DeviceUnavailable {
        context: &'static str,
        code: DriverReturn,
    },

    /// A stream read failed and the single recovery attempt failed as well.
    #[error("stream read failed after recovery: {0}")]
    TransientRead(DriverReturn),

    /// The buffer has no room for another row.
    #[error("buffer full: {capacity_rows} rows allocated")]
    BufferFull { capacity_rows: usize },

    #[error("row has {actual} values, buffer rows are {expected} wide")]
    RowWidth { expected: usize, actual: usize },

    #[error("callback pool: {0}")]
    Dispatch(String),
}

impl DaqError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn unavailable(context: &'static str, code: DriverReturn) -> Self {
        Self::DeviceUnavailable { context, code }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
