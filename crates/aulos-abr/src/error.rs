use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AbrError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AbrError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

pub type AbrResult<T> = Result<T, AbrError>;
