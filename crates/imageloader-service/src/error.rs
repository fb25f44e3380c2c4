use std::error::Error as _;
use std::fmt;

use thiserror::Error;

/// The reason a transport failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// There is no network connection.
    NotConnected,
    /// The transfer was cancelled.
    Cancelled,
    /// The transfer did not complete within the download timeout.
    TimedOut,
    /// The network is unavailable because roaming is turned off.
    InternationalRoamingOff,
    /// The network does not allow data transfers.
    DataNotAllowed,
    /// The host name could not be resolved.
    CannotFindHost,
    /// No connection to the host could be established.
    CannotConnectToHost,
    /// The server responded with an unsuccessful status code.
    BadStatus(u16),
    /// The server responded with an empty body.
    EmptyBody,
    /// Any other failure.
    Other,
}

impl TransportErrorKind {
    /// Whether the failure is tied to the network conditions rather than to the resource.
    ///
    /// Transient failures never mark a URL as failed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            TransportErrorKind::NotConnected
                | TransportErrorKind::Cancelled
                | TransportErrorKind::TimedOut
                | TransportErrorKind::InternationalRoamingOff
                | TransportErrorKind::DataNotAllowed
                | TransportErrorKind::CannotFindHost
                | TransportErrorKind::CannotConnectToHost
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::NotConnected => f.write_str("not connected"),
            TransportErrorKind::Cancelled => f.write_str("cancelled"),
            TransportErrorKind::TimedOut => f.write_str("timed out"),
            TransportErrorKind::InternationalRoamingOff => f.write_str("roaming is off"),
            TransportErrorKind::DataNotAllowed => f.write_str("data not allowed"),
            TransportErrorKind::CannotFindHost => f.write_str("cannot find host"),
            TransportErrorKind::CannotConnectToHost => f.write_str("cannot connect to host"),
            TransportErrorKind::BadStatus(status) => write!(f, "bad status {status}"),
            TransportErrorKind::EmptyBody => f.write_str("empty body"),
            TransportErrorKind::Other => f.write_str("transport failure"),
        }
    }
}

/// A failed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {details}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub details: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::TimedOut
        } else if let Some(status) = err.status() {
            TransportErrorKind::BadStatus(status.as_u16())
        } else if err.is_connect() {
            if is_dns_error(&err) {
                TransportErrorKind::CannotFindHost
            } else {
                TransportErrorKind::CannotConnectToHost
            }
        } else {
            TransportErrorKind::Other
        };

        let mut details = err.to_string();
        let mut source = err.source();
        while let Some(err) = source {
            details.push_str(": ");
            details.push_str(&err.to_string());
            source = err.source();
        }

        Self { kind, details }
    }
}

/// Checks whether a connect error was caused by name resolution.
fn is_dns_error(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(err) = source {
        let message = err.to_string();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

/// The error delivered to the completion of an image request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The URL is missing or cannot be parsed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// The URL failed permanently before and the retry option was not given.
    #[error("the URL failed permanently before")]
    Blacklisted,
    /// The download failed.
    #[error("download failed: {0}")]
    Transport(#[from] TransportError),
    /// The downloaded payload is not a valid image.
    #[error("failed to decode the downloaded image")]
    DecodeFailure,
    /// The request was cancelled.
    #[error("request was cancelled")]
    Cancelled,
    /// Nothing was cached and the delegate declined to download the URL.
    #[error("download was declined")]
    Declined,
}

impl ImageError {
    /// Whether the failure is expected to repeat on retry.
    ///
    /// URLs failing with a permanent error are refused on subsequent loads unless the retry
    /// option is given.
    pub fn is_permanent(&self) -> bool {
        match self {
            ImageError::Transport(err) => !err.kind.is_transient(),
            ImageError::DecodeFailure => true,
            _ => false,
        }
    }
}
