use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::io::Error as IoError;
use thinglink_sdk::SdkError;
use thiserror::Error;
use tokio::task::JoinError;

pub type AppResult<T, E = AppError> = anyhow::Result<T, E>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Sdk(#[from] SdkError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("{0}")]
    Msg(String),
}

impl AppError {
    /// Wire code when the error originates in the SDK
    pub fn code(&self) -> Option<String> {
        match self {
            AppError::Sdk(e) => Some(e.code()),
            _ => None,
        }
    }
}

impl From<String> for AppError {
    #[inline]
    fn from(e: String) -> Self {
        AppError::Msg(e)
    }
}

impl From<&str> for AppError {
    #[inline]
    fn from(e: &str) -> Self {
        AppError::Msg(e.to_string())
    }
}
