use thiserror::Error;

/// Result alias used across the protocol engine.
pub type Result<T> = std::result::Result<T, SlpError>;

/// RFC 2608 error codes carried by SrvAck, SrvRply, AttrRply, DAAdvert and SrvTypeRply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,
    LanguageNotSupported = 1,
    ParseError = 2,
    InvalidRegistration = 3,
    ScopeNotSupported = 4,
    AuthenticationUnknown = 5,
    AuthenticationAbsent = 6,
    AuthenticationFailed = 7,
    VersionNotSupported = 9,
    InternalError = 10,
    DaBusyNow = 11,
    OptionNotUnderstood = 12,
    InvalidUpdate = 13,
    MessageNotSupported = 14,
    RefreshRejected = 15,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        let code = match value {
            0 => ErrorCode::Success,
            1 => ErrorCode::LanguageNotSupported,
            2 => ErrorCode::ParseError,
            3 => ErrorCode::InvalidRegistration,
            4 => ErrorCode::ScopeNotSupported,
            5 => ErrorCode::AuthenticationUnknown,
            6 => ErrorCode::AuthenticationAbsent,
            7 => ErrorCode::AuthenticationFailed,
            9 => ErrorCode::VersionNotSupported,
            10 => ErrorCode::InternalError,
            11 => ErrorCode::DaBusyNow,
            12 => ErrorCode::OptionNotUnderstood,
            13 => ErrorCode::InvalidUpdate,
            14 => ErrorCode::MessageNotSupported,
            15 => ErrorCode::RefreshRejected,
            _ => return None,
        };
        Some(code)
    }

    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

#[derive(Debug, Error)]
pub enum SlpError {
    /// Malformed or truncated wire data. The offending frame is dropped.
    #[error("parse error: {0}")]
    Parse(String),

    /// A value does not fit its fixed-width wire field.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("service not registered: {0}")]
    NotFound(String),

    #[error("scope mismatch for {url}: registered {registered}, requested {requested}")]
    ScopeMismatch {
        url: String,
        registered: String,
        requested: String,
    },

    #[error("network error: {0}")]
    Network(String),

    /// The peer answered with a non-zero error code.
    #[error("peer replied with error code {code}")]
    Protocol { code: u16 },

    #[error("configuration error: {0}")]
    Config(String),
}

impl SlpError {
    pub fn parse(msg: impl Into<String>) -> Self {
        SlpError::Parse(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        SlpError::Encoding(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SlpError::Network(msg.into())
    }

    /// Numeric code sent back over the wire for this error.
    pub fn error_code(&self) -> u16 {
        match self {
            SlpError::Parse(_) => ErrorCode::ParseError.into(),
            SlpError::NotFound(_) => ErrorCode::InvalidRegistration.into(),
            SlpError::ScopeMismatch { .. } => ErrorCode::ScopeNotSupported.into(),
            SlpError::Protocol { code } => *code,
            SlpError::Encoding(_) | SlpError::Network(_) | SlpError::Config(_) => {
                ErrorCode::InternalError.into()
            }
        }
    }
}

impl From<std::io::Error> for SlpError {
    fn from(e: std::io::Error) -> Self {
        SlpError::Network(e.to_string())
    }
}
