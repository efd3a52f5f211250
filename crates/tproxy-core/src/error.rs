use thiserror::Error;

/// Errors produced while parsing a control command.
///
/// The `Display` text is what the client sees after `>>>ERROR_PARSE_COMMAND<<<`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("not all arguments received for {0}")]
    MissingArguments(&'static str),

    #[error("too many arguments received for {0}")]
    TooManyArguments(&'static str),

    #[error("incorrect IP address received in argument: {0}")]
    InvalidAddress(String),

    #[error("error parse {0} as port number")]
    InvalidPort(String),
}

/// Errors produced by the tproxy gateway.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("config error: {0}")]
    Config(String),

    #[error("connection limit: {0}")]
    LimitExceeded(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("relay error: {0}")]
    Relay(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
