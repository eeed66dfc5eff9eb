//! Node and identity addressing.
//!
//! A node is written `name@domain/instance`. The identity is the
//! `name@domain` part. Domains compare case-insensitively and are stored
//! lowercased.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{LimeError, Result};

/// Peer identity (`name@domain`).
#[derive(Debug, Clone, Eq)]
pub struct Identity {
    /// Name segment, absent for domain-only identities
    pub name: Option<String>,
    /// Domain segment
    pub domain: String,
}

/// Peer address (`name@domain/instance`).
#[derive(Debug, Clone, Eq)]
pub struct Node {
    /// Name segment, absent for domain-only nodes
    pub name: Option<String>,
    /// Domain segment
    pub domain: String,
    /// Instance segment. `Some("")` when the separator is present but empty.
    pub instance: Option<String>,
}

impl Identity {
    /// Create an identity from its parts
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            domain: domain.into().to_lowercase(),
        }
    }

    /// Parse `name@domain`. An instance segment is rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let node = Node::parse(s)?;
        if node.instance.is_some() {
            return Err(LimeError::InvalidFormat(format!(
                "Identity '{s}' must not contain an instance"
            )));
        }
        Ok(node.to_identity())
    }

    /// Create a node for this identity on `instance`
    pub fn to_node(&self, instance: Option<String>) -> Node {
        Node {
            name: self.name.clone(),
            domain: self.domain.clone(),
            instance,
        }
    }
}

impl Node {
    /// Create a node from its parts
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        instance: Option<String>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            domain: domain.into().to_lowercase(),
            instance,
        }
    }

    /// Parse `name@domain/instance`, `name@domain`, `name@domain/` or `domain`.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(LimeError::InvalidFormat("Node string is empty".to_string()));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(LimeError::InvalidFormat(format!(
                "Node '{s}' contains whitespace"
            )));
        }

        let (identity, instance) = match s.split_once('/') {
            Some((identity, instance)) => (identity, Some(instance.to_string())),
            None => (s, None),
        };

        let (name, domain) = match identity.split_once('@') {
            Some((name, domain)) => {
                if name.is_empty() {
                    return Err(LimeError::InvalidFormat(format!(
                        "Node '{s}' has an empty name"
                    )));
                }
                (Some(name.to_string()), domain)
            },
            None => (None, identity),
        };

        if domain.is_empty() || domain.contains('@') {
            return Err(LimeError::InvalidFormat(format!(
                "Node '{s}' has an invalid domain"
            )));
        }

        Ok(Self {
            name,
            domain: domain.to_lowercase(),
            instance,
        })
    }

    /// Get the identity part of this node
    pub fn to_identity(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            domain: self.domain.clone(),
        }
    }

    /// Copy of this node on another instance
    pub fn with_instance(&self, instance: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
            ..self.clone()
        }
    }

    /// Check if the node has the mandatory segments filled
    pub fn is_complete(&self) -> bool {
        !self.domain.is_empty()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.domain.to_lowercase().hash(state);
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.domain.eq_ignore_ascii_case(&other.domain)
            && self.instance == other.instance
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.domain.to_lowercase().hash(state);
        self.instance.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}@{}", name, self.domain),
            None => write!(f, "{}", self.domain),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_identity())?;
        if let Some(instance) = &self.instance {
            write!(f, "/{instance}")?;
        }
        Ok(())
    }
}

impl FromStr for Node {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self> {
        Node::parse(s)
    }
}

impl FromStr for Identity {
    type Err = LimeError;

    fn from_str(s: &str) -> Result<Self> {
        Identity::parse(s)
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Node::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Identity::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_complete_node() {
        let node = Node::parse("name@domain.com/instance").unwrap();
        assert_eq!(node.name.as_deref(), Some("name"));
        assert_eq!(node.domain, "domain.com");
        assert_eq!(node.instance.as_deref(), Some("instance"));
    }

    #[test]
    fn test_parse_without_instance() {
        let node = Node::parse("a@b").unwrap();
        assert!(node.instance.is_none());
    }

    #[test]
    fn test_parse_empty_instance() {
        let node = Node::parse("a@b/").unwrap();
        assert_eq!(node.instance.as_deref(), Some(""));
        assert_eq!(node.to_string(), "a@b/");
    }

    #[test]
    fn test_round_trip() {
        assert_eq!(Node::parse("a@b/c").unwrap().to_string(), "a@b/c");
    }

    #[test]
    fn test_domain_only_node() {
        let node = Node::parse("limeprotocol.org").unwrap();
        assert!(node.name.is_none());
        assert_eq!(node.to_string(), "limeprotocol.org");
    }

    #[test]
    fn test_malformed_nodes() {
        for s in ["", "@domain", "name@", "name@/instance", "na me@domain", "a@b@c"] {
            assert!(
                matches!(Node::parse(s), Err(LimeError::InvalidFormat(_))),
                "'{s}' should not parse"
            );
        }
    }

    #[test]
    fn test_domain_case_insensitive_equality() {
        let a = Node::parse("user@Domain.COM/home").unwrap();
        let b = Node::new("user", "domain.com", Some("home".to_string()));
        assert_eq!(a, b);
        assert_ne!(a, b.with_instance("work"));
        assert_eq!(a.to_identity(), Identity::new("user", "DOMAIN.com"));
    }

    #[test]
    fn test_identity_rejects_instance() {
        assert!(Identity::parse("user@domain.com/home").is_err());
        let identity = Identity::parse("user@domain.com").unwrap();
        assert_eq!(
            identity.to_node(Some("x".into())).to_string(),
            "user@domain.com/x"
        );
    }

    #[test]
    fn test_serde_as_string() {
        let node = Node::parse("a@b/c").unwrap();
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, "\"a@b/c\"");
        let parsed: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, node);
    }

    proptest! {
        #[test]
        fn prop_parse_format_round_trip(
            name in "[a-z0-9._-]{1,12}",
            domain in "[a-z0-9.-]{1,12}",
            instance in proptest::option::of("[a-zA-Z0-9_-]{0,8}"),
        ) {
            let node = Node { name: Some(name), domain, instance };
            let parsed = Node::parse(&node.to_string()).unwrap();
            prop_assert_eq!(parsed, node);
        }
    }
}
