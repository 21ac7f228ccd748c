use std::{io, sync::Arc};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure a leg can report through its pending handler.
///
/// There is no cancellation variant: a canceled operation never reports.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("end of stream")]
    Eof,
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("operation timed out")]
    Timeout,

    #[error("illegal socks5 request")]
    IllegalRequest,
    #[error("unsupported socks version")]
    UnsupportedVersion,
    #[error("no supported authentication method offered")]
    UnsupportedAuthenticationMethod,
    #[error("unsupported socks5 command")]
    UnsupportedCommand,
    #[error("unsupported socks5 address type")]
    UnsupportedAddressType,
    #[error("socks5 request incomplete")]
    RequestIncomplete,

    #[error("socks5 server version not supported")]
    ServerVersionNotSupported,
    #[error("socks5 server requires an unsupported authentication method")]
    AuthenticationNotSupported,
    #[error("socks5 authentication failed")]
    AuthenticationFailed,
    #[error("invalid proxy response")]
    InvalidResponse,
    #[error("socks5 server refused to connect (reply {0})")]
    ConnectionFailed(u8),

    #[error("invalid http request")]
    InvalidRequest,
    #[error("data received before the connect request finished")]
    DataBeforeConnectRequestFinish,
    #[error("http header too long")]
    HeaderTooLong,
    #[error("proxy answered connect with status {0}")]
    ConnectError(u16),

    #[error("tls error: {0}")]
    Tls(String),
    #[error("failed to resolve {0}")]
    Resolve(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// SOCKS5 `REP` field describing why the remote side could not be reached.
    pub fn socks_reply_code(&self) -> u8 {
        use io::ErrorKind::*;
        match self {
            Error::Io(e) => match e.kind() {
                ConnectionRefused => 0x05,
                HostUnreachable | NotFound => 0x04,
                NetworkUnreachable => 0x03,
                TimedOut => 0x06,
                _ => 0x01,
            },
            Error::Resolve(_) => 0x04,
            Error::Timeout => 0x06,
            Error::ConnectionFailed(code) => *code,
            Error::UnsupportedCommand => 0x07,
            Error::UnsupportedAddressType => 0x08,
            _ => 0x01,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::OutOfMemory => Error::ResourceExhausted,
            _ => Error::Io(Arc::new(value)),
        }
    }
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(value: tokio_rustls::rustls::Error) -> Self {
        Error::Tls(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_reply_codes() {
        let refused: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused.socks_reply_code(), 5);

        let timeout: Error = io::Error::from(io::ErrorKind::TimedOut).into();
        assert_eq!(timeout.socks_reply_code(), 6);

        assert_eq!(Error::Resolve("example.com".into()).socks_reply_code(), 4);
        assert_eq!(Error::InvalidResponse.socks_reply_code(), 1);
    }

    #[test]
    fn unexpected_eof_is_eof() {
        let e: Error = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert!(e.is_eof());
        assert!(!Error::Timeout.is_eof());
    }
}
