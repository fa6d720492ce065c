// error.rs

use crate::*;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ESP-IDF error: {0}")]
    Esp(#[from] esp_idf_sys::EspError),
    #[error("invalid address: {0}")]
    AddrParse(#[from] net::AddrParseError),
}

pub type AppResult<T> = Result<T, AppError>;
// EOF
