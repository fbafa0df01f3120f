//! Client identity extraction from request credentials.
//!
//! The bearer value is treated as an opaque key. Whether the token is genuine
//! is decided by whoever issued it, not here.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use http::header::AUTHORIZATION;
use http::HeaderMap;

const BEARER_PREFIX: &str = "Bearer ";

/// Opaque key partitioning rate-limit state. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity(Arc<str>);

/// Why a request carried no usable identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// No `Authorization` header.
    #[error("missing authorization header")]
    Missing,
    /// Header bytes are not visible ASCII.
    #[error("authorization header is not valid ASCII")]
    Malformed,
    /// Header present but not a bearer credential.
    #[error("authorization scheme is not Bearer")]
    UnsupportedScheme,
    /// `Bearer ` with nothing after it.
    #[error("bearer token is empty")]
    Empty,
}

impl ClientIdentity {
    /// Build an identity from a raw key, rejecting the empty string.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdentityError> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(Arc::from(raw)))
    }

    /// Parse `Authorization: Bearer <clientId>`.
    ///
    /// The scheme match is case-sensitive and the value is used verbatim.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, IdentityError> {
        let value = headers.get(AUTHORIZATION).ok_or(IdentityError::Missing)?;
        let value = value.to_str().map_err(|_| IdentityError::Malformed)?;
        let token = value.strip_prefix(BEARER_PREFIX).ok_or(IdentityError::UnsupportedScheme)?;
        Self::new(token)
    }

    /// Borrow the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ClientIdentity {
    type Error = IdentityError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}
