//! Command resource URIs.
//!
//! Resources are addressed either relative to the peer (`/presence`) or
//! absolutely with the owner identity (`lime://name@domain/presence`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::node::Identity;
use crate::error::{LimeError, Result};

/// URI scheme for absolute resource paths
pub const LIME_URI_SCHEME: &str = "lime";

/// Relative or absolute resource URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimeUri {
    path: String,
    identity: Option<Identity>,
}

impl LimeUri {
    /// Parse a relative (`/path`) or absolute (`lime://identity/path`) URI
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with('/') {
            return Ok(Self {
                path: s.to_string(),
                identity: None,
            });
        }

        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| LimeError::InvalidFormat(format!("Invalid LIME URI '{s}'")))?;

        if scheme != LIME_URI_SCHEME {
            return Err(LimeError::InvalidFormat(format!(
                "Invalid URI scheme '{scheme}'. The expected value is '{LIME_URI_SCHEME}'"
            )));
        }

        let (authority, resource) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, "/"),
        };
        let identity = Identity::parse(authority)?;

        Ok(Self {
            path: format!("{LIME_URI_SCHEME}://{identity}{resource}"),
            identity: Some(identity),
        })
    }

    /// Relative URI from a known-good path literal
    pub(crate) fn relative(path: &str) -> Self {
        Self {
            path: path.to_string(),
            identity: None,
        }
    }

    /// Get the path as written
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Check if the URI is relative to the peer
    pub fn is_relative(&self) -> bool {
        self.identity.is_none()
    }

    /// Owner identity of an absolute URI
    pub fn identity(&self) -> Result<&Identity> {
        self.identity.as_ref().ok_or_else(|| {
            LimeError::InvalidOperation("The URI is relative and has no identity".to_string())
        })
    }

    /// Resolve a relative URI against the owner `identity`
    pub fn to_absolute(&self, identity: &Identity) -> Result<LimeUri> {
        if !self.is_relative() {
            return Err(LimeError::InvalidOperation(
                "The URI is already absolute".to_string(),
            ));
        }
        LimeUri::parse(&format!("{LIME_URI_SCHEME}://{identity}{}", self.path))
    }
}

impl fmt::Display for LimeUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl FromStr for LimeUri {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self> {
        LimeUri::parse(s)
    }
}

impl Serialize for LimeUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> Deserialize<'de> for LimeUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        LimeUri::parse(&s).map_err(serde::de::Error::custom)
    }
}
