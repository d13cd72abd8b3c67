use std::{error::Error as StdError, fmt};

/// Errors produced while setting up or running a transport, as opposed to the per-RPC
/// [`Status`](crate::Status) surfaced to callers.
pub struct Error {
    kind: Kind,
    source: Option<crate::BoxError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Transport,
    InvalidUri,
    InvalidUserAgent,
}

impl Error {
    fn new(kind: Kind) -> Self {
        Self { kind, source: None }
    }

    pub(crate) fn from_source(source: impl Into<crate::BoxError>) -> Self {
        Self {
            kind: Kind::Transport,
            source: Some(source.into()),
        }
    }

    pub(crate) fn new_invalid_uri() -> Self {
        Self::new(Kind::InvalidUri)
    }

    pub(crate) fn new_invalid_user_agent() -> Self {
        Self::new(Kind::InvalidUserAgent)
    }

    fn description(&self) -> &'static str {
        match self.kind {
            Kind::Transport => "transport error",
            Kind::InvalidUri => "invalid URI",
            Kind::InvalidUserAgent => "user agent is not a valid header value",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Error").field(&self.kind).finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_deref().map(|s| s as _)
    }
}
