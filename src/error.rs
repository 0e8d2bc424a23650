use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    InvalidChannel(String),
    InvalidFrame(&'static str),
    MessageTooLong { length: usize, max: usize },
    Corrupt(&'static str),
    Unsupported(&'static str),
    UnsupportedVersion(u8),
    UnknownRegistration(i64),
    UnknownSubscription(i64),
    UnknownClient(i64),
    CounterSpaceExhausted,
    StaticCounterCollision { type_id: i32, registration_id: i64 },
    ImageRejected(String),
    Generic(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::InvalidChannel(msg) => write!(f, "invalid channel: {msg}"),
            Error::InvalidFrame(msg) => write!(f, "invalid frame: {msg}"),
            Error::MessageTooLong { length, max } => {
                write!(f, "message length {length} exceeds max {max}")
            }
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::UnsupportedVersion(version) => write!(f, "unsupported version: {version}"),
            Error::UnknownRegistration(id) => write!(f, "unknown publication: {id}"),
            Error::UnknownSubscription(id) => write!(f, "unknown subscription: {id}"),
            Error::UnknownClient(id) => write!(f, "unknown client: {id}"),
            Error::CounterSpaceExhausted => write!(f, "counter space exhausted"),
            Error::StaticCounterCollision { type_id, registration_id } => write!(
                f,
                "non-static counter collides with static: typeId={type_id} registrationId={registration_id}"
            ),
            Error::ImageRejected(reason) => write!(f, "image rejected: {reason}"),
            Error::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error codes carried on `ERROR` events back to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    GenericError = 0,
    InvalidChannel = 1,
    UnknownSubscription = 2,
    UnknownPublication = 3,
    ChannelEndpointError = 4,
    UnknownCounter = 5,
    UnknownCommandTypeId = 6,
    MalformedCommand = 7,
    NotSupported = 8,
    UnknownHost = 9,
    ResourceTemporarilyUnavailable = 10,
    StorageSpace = 11,
    UnauthorisedAction = 12,
    ImageRejected = 13,
    PublicationRevoked = 14,
}

impl ErrorCode {
    pub fn from_i32(value: i32) -> Option<ErrorCode> {
        match value {
            0 => Some(ErrorCode::GenericError),
            1 => Some(ErrorCode::InvalidChannel),
            2 => Some(ErrorCode::UnknownSubscription),
            3 => Some(ErrorCode::UnknownPublication),
            4 => Some(ErrorCode::ChannelEndpointError),
            5 => Some(ErrorCode::UnknownCounter),
            6 => Some(ErrorCode::UnknownCommandTypeId),
            7 => Some(ErrorCode::MalformedCommand),
            8 => Some(ErrorCode::NotSupported),
            9 => Some(ErrorCode::UnknownHost),
            10 => Some(ErrorCode::ResourceTemporarilyUnavailable),
            11 => Some(ErrorCode::StorageSpace),
            12 => Some(ErrorCode::UnauthorisedAction),
            13 => Some(ErrorCode::ImageRejected),
            14 => Some(ErrorCode::PublicationRevoked),
            _ => None,
        }
    }
}

impl Error {
    /// Maps a request failure onto the code surfaced to the requesting client.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::InvalidChannel(_) => ErrorCode::InvalidChannel,
            Error::UnknownRegistration(_) => ErrorCode::UnknownPublication,
            Error::UnknownSubscription(_) => ErrorCode::UnknownSubscription,
            Error::ImageRejected(_) => ErrorCode::ImageRejected,
            Error::Unsupported(_) => ErrorCode::NotSupported,
            Error::CounterSpaceExhausted => ErrorCode::ResourceTemporarilyUnavailable,
            _ => ErrorCode::GenericError,
        }
    }
}
