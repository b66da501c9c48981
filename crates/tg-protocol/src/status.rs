//! Numeric status codes carried in `error` instructions

use std::fmt;

/// Status codes understood by remote-desktop clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Internal gateway failure
    ServerError,
    /// The backend daemon did not respond in time
    UpstreamTimeout,
    /// The backend daemon reported or caused an error
    UpstreamError,
    /// The backend daemon could not be found
    UpstreamNotFound,
    /// The backend daemon refused the connection
    UpstreamUnavailable,
    /// The client was inactive for too long
    ClientTimeout,
}

impl Status {
    /// Numeric wire value
    pub fn code(self) -> u16 {
        match self {
            Status::ServerError => 0x0200,
            Status::UpstreamTimeout => 0x0202,
            Status::UpstreamError => 0x0203,
            Status::UpstreamNotFound => 0x0207,
            Status::UpstreamUnavailable => 0x0208,
            Status::ClientTimeout => 0x0308,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
