//! Errors surfaced by the resolver.

use std::sync::Arc;
use std::{error, fmt, io};
use crate::base::iana::Rcode;
use crate::base::message::ParseError;

//------------ Error ---------------------------------------------------------

/// The error type for lookups.
///
/// The type is `Clone` so a single failure can be fanned out to every caller
/// coalesced onto the same in-flight lookup; IO errors are wrapped in an arc
/// for that reason.
#[derive(Clone, Debug)]
pub enum Error {
    /// The host name failed validation.
    InvalidName,

    /// A resolve was asked for a record type other than A or AAAA.
    InvalidType,

    /// Neither upstream nor cache had records of any requested type.
    NoRecords(NoRecordsError),

    /// The request exceeded its timeout budget on all tried transports.
    Timeout(TimeoutError),

    /// An upstream exchange failed.
    Resolution(ResolutionError),

    /// A local socket could not be created.
    Socket(Arc<io::Error>),
}

impl Error {
    /// Creates a no-records error for the given name.
    pub(crate) fn no_records(name: &str, cached: bool) -> Self {
        Error::NoRecords(NoRecordsError {
            name: name.into(),
            cached,
        })
    }

    /// Creates a timeout error for a budget of `millis` milliseconds.
    pub(crate) fn timeout(millis: u64) -> Self {
        Error::Timeout(TimeoutError { millis })
    }

    /// Returns whether this is a timeout.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidName => f.write_str("invalid host name"),
            Error::InvalidType => {
                f.write_str("only A and AAAA records can be resolved")
            }
            Error::NoRecords(err) => err.fmt(f),
            Error::Timeout(err) => err.fmt(f),
            Error::Resolution(err) => err.fmt(f),
            Error::Socket(err) => {
                write!(f, "local socket unavailable: {}", err)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Socket(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<NoRecordsError> for Error {
    fn from(err: NoRecordsError) -> Self {
        Error::NoRecords(err)
    }
}

impl From<ResolutionError> for Error {
    fn from(err: ResolutionError) -> Self {
        Error::Resolution(err)
    }
}

impl From<ParseError> for Error {
    fn from(_: ParseError) -> Self {
        Error::Resolution(ResolutionError::MalformedResponse)
    }
}

//------------ NoRecordsError ------------------------------------------------

/// The name exists but has no records of the requested types.
#[derive(Clone, Debug)]
pub struct NoRecordsError {
    /// The looked-up name.
    name: String,

    /// Whether the absence came out of the cache.
    cached: bool,
}

impl NoRecordsError {
    /// Returns the name the lookup was for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether the empty result was served from the cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl fmt::Display for NoRecordsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No records returned for {}", self.name)?;
        if self.cached {
            f.write_str(" (cached result)")?;
        }
        Ok(())
    }
}

//------------ TimeoutError --------------------------------------------------

/// No response arrived within the request's timeout budget.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutError {
    /// The budget in milliseconds.
    millis: u64,
}

impl TimeoutError {
    /// Returns the timeout budget in milliseconds.
    pub fn millis(&self) -> u64 {
        self.millis
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request timed out after {}ms", self.millis)
    }
}

//------------ ResolutionError -----------------------------------------------

/// The ways an upstream exchange can fail.
#[derive(Clone, Debug)]
pub enum ResolutionError {
    /// The server answered with a non-zero response code.
    ServerFailure(Rcode),

    /// The response over TCP still had the truncation bit set.
    Truncated,

    /// A caller-supplied server string could not be parsed.
    InvalidServer(String),

    /// An alias chain exceeded the hop limit.
    ChainTooLong,

    /// Every configured upstream errored.
    AllServersFailed,

    /// The response could not be decoded.
    MalformedResponse,

    /// The inbound message was not a response at all.
    NotAResponse,

    /// The server's connection went away with requests outstanding.
    ConnectionLost,

    /// Every sixteen bit request ID is in use.
    TooManyRequests,

    /// The TCP connect to the server failed or timed out.
    ConnectFailed,

    /// A transport IO operation failed.
    Io(Arc<io::Error>),
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionError::ServerFailure(rcode) => {
                write!(f, "Server returned error code: {}", rcode.to_int())
            }
            ResolutionError::Truncated => {
                f.write_str("Server returned truncated response")
            }
            ResolutionError::InvalidServer(uri) => {
                write!(f, "Invalid server {}", uri)
            }
            ResolutionError::ChainTooLong => {
                f.write_str("CNAME or DNAME chain too long")
            }
            ResolutionError::AllServersFailed => {
                f.write_str("All name-resolution requests failed")
            }
            ResolutionError::MalformedResponse => {
                f.write_str("malformed response")
            }
            ResolutionError::NotAResponse => {
                f.write_str("message was not a response")
            }
            ResolutionError::ConnectionLost => {
                f.write_str("connection to server lost")
            }
            ResolutionError::TooManyRequests => {
                f.write_str("too many outstanding requests")
            }
            ResolutionError::ConnectFailed => {
                f.write_str("TCP connect to server failed")
            }
            ResolutionError::Io(err) => {
                write!(f, "transport error: {}", err)
            }
        }
    }
}

impl error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ResolutionError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for ResolutionError {
    fn from(err: io::Error) -> Self {
        ResolutionError::Io(Arc::new(err))
    }
}
