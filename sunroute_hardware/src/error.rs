use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio {0} is not usable for this function")]
    InvalidPin(i32),
    #[error("gpio {0} is already claimed")]
    PinInUse(u8),
    #[error("no one-shot timer left")]
    TimerExhausted,
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("meter timeout")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
