use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BlkError {
    #[error("I/O error")]
    Io,

    #[error("no space left on device")]
    NoSpace,

    #[error("operation would block")]
    WouldBlock,

    #[error("no such device")]
    NoDevice,

    #[error("attempt to access beyond end of device")]
    BeyondEnd,

    #[error("bio too big for device queue")]
    TooBig,

    #[error("request queue is dead")]
    DeadQueue,

    #[error("out of memory")]
    NoMemory,

    #[error("invalid argument")]
    InvalidArgument,
}

impl BlkError {
    // Negative errno as reported to end-of-I/O handlers.
    pub fn errno(&self) -> i32 {
        match self {
            BlkError::Io | BlkError::BeyondEnd | BlkError::TooBig | BlkError::DeadQueue => -5,
            BlkError::NoSpace => -28,
            BlkError::WouldBlock => -11,
            BlkError::NoDevice => -19,
            BlkError::NoMemory => -12,
            BlkError::InvalidArgument => -22,
        }
    }
}

pub type BlkResult<T> = Result<T, BlkError>;

// Outcome of a single I/O.
pub type IoStatus = Result<(), BlkError>;
