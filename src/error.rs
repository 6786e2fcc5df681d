use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("A profiling session is already active")]
    SessionActive,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Report encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Report error: {0}")]
    Report(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const SESSION_ACTIVE: i32 = 3;
    pub const REPORT_ERROR: i32 = 4;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::SessionActive => exit_code::SESSION_ACTIVE,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => exit_code::INVALID_ARGUMENTS,
            Error::Encode(_) | Error::Report(_) => exit_code::REPORT_ERROR,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
