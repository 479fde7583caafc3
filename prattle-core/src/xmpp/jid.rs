use std::collections::HashMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use memchr::memchr;
use thiserror::Error;

/// Each part of a JID is capped at 1023 bytes after preparation.
const MAX_PART_LEN: usize = 1023;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JidError {
    #[error("JID is empty")]
    Empty,
    #[error("node part failed nodeprep")]
    InvalidNode,
    #[error("domain part failed nameprep")]
    InvalidDomain,
    #[error("resource part failed resourceprep")]
    InvalidResource,
    #[error("JID part is longer than {MAX_PART_LEN} bytes")]
    PartTooLong,
}

/// A Jabber identifier `node@domain/resource`.
///
/// Parts are canonicalized on construction (nodeprep, nameprep,
/// resourceprep), so equality and hashing operate on the canonical form and
/// preparation is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        let node = match node {
            Some(n) => Some(prep_node(n)?),
            None => None,
        };
        let domain = prep_domain(domain)?;
        let resource = match resource {
            Some(r) => Some(prep_resource(r)?),
            None => None,
        };
        Ok(Self {
            node,
            domain,
            resource,
        })
    }

    pub fn from_domain(domain: &str) -> Result<Self, JidError> {
        Self::new(None, domain, None)
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// Attaches a resource, replacing any existing one.
    pub fn bind(&self, resource: &str) -> Result<Jid, JidError> {
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(prep_resource(resource)?),
        })
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (node, rest) = match memchr(b'@', s.as_bytes()) {
            Some(at) => (Some(&s[..at]), &s[at + 1..]),
            None => (None, s),
        };
        let (domain, resource) = match memchr(b'/', rest.as_bytes()) {
            Some(slash) => (&rest[..slash], Some(&rest[slash + 1..])),
            None => (rest, None),
        };
        Jid::new(node, domain, resource)
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

fn check_len(part: &str) -> Result<(), JidError> {
    if part.len() > MAX_PART_LEN {
        return Err(JidError::PartTooLong);
    }
    Ok(())
}

pub fn prep_node(node: &str) -> Result<String, JidError> {
    if node.is_empty() {
        return Err(JidError::InvalidNode);
    }
    let prepped = stringprep::nodeprep(node).map_err(|_| JidError::InvalidNode)?;
    check_len(&prepped)?;
    Ok(prepped.into_owned())
}

pub fn prep_domain(domain: &str) -> Result<String, JidError> {
    if domain.is_empty() {
        return Err(JidError::Empty);
    }
    let prepped = stringprep::nameprep(domain).map_err(|_| JidError::InvalidDomain)?;
    check_len(&prepped)?;
    Ok(prepped.into_owned())
}

pub fn prep_resource(resource: &str) -> Result<String, JidError> {
    if resource.is_empty() {
        return Err(JidError::InvalidResource);
    }
    let prepped = stringprep::resourceprep(resource).map_err(|_| JidError::InvalidResource)?;
    check_len(&prepped)?;
    Ok(prepped.into_owned())
}

/// Memoises stringprep results. Preparation shows up on every routed stanza,
/// so the maps are bounded and flushed wholesale when full.
#[derive(Debug)]
pub struct PrepCache {
    domains: HashMap<String, String>,
    capacity: usize,
}

impl PrepCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            domains: HashMap::new(),
            capacity,
        }
    }

    pub fn domain(&mut self, raw: &str) -> Result<String, JidError> {
        if let Some(hit) = self.domains.get(raw) {
            return Ok(hit.clone());
        }
        let prepped = prep_domain(raw)?;
        if self.domains.len() >= self.capacity {
            self.domains.clear();
        }
        self.domains.insert(raw.to_string(), prepped.clone());
        Ok(prepped)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl Default for PrepCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_jid_splits_into_parts() {
        let jid: Jid = "alice@example.net/home".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.net");
        assert_eq!(jid.resource(), Some("home"));
    }

    #[test]
    fn bare_jid_has_no_resource() {
        let jid: Jid = "alice@example.net/home".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "alice@example.net");
    }

    #[test]
    fn domain_only_jid() {
        let jid: Jid = "example.net".parse().unwrap();
        assert_eq!(jid.node(), None);
        assert_eq!(jid.resource(), None);
    }

    #[test]
    fn empty_string_is_rejected() {
        assert!("".parse::<Jid>().is_err());
    }

    #[test]
    fn prep_lowercases_node_and_domain() {
        let jid: Jid = "Alice@Example.Net/Home".parse().unwrap();
        assert_eq!(jid.to_string(), "alice@example.net/Home");
    }

    #[test]
    fn prep_is_idempotent() {
        let once: Jid = "AlIcE@ExAmPlE.net/Desk".parse().unwrap();
        let twice: Jid = once.to_string().parse().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn prohibited_node_characters_are_rejected() {
        assert!("a b@example.net".parse::<Jid>().is_err());
    }

    #[test]
    fn oversized_part_is_rejected() {
        let node = "x".repeat(MAX_PART_LEN + 1);
        let raw = format!("{}@example.net", node);
        assert_eq!(raw.parse::<Jid>(), Err(JidError::PartTooLong));
    }

    #[test]
    fn bind_replaces_resource() {
        let jid: Jid = "alice@example.net/old".parse().unwrap();
        let bound = jid.bind("new").unwrap();
        assert_eq!(bound.to_string(), "alice@example.net/new");
    }

    #[test]
    fn cache_returns_prepped_domain() {
        let mut cache = PrepCache::new(4);
        assert_eq!(cache.domain("Example.Net").unwrap(), "example.net");
        assert_eq!(cache.domain("Example.Net").unwrap(), "example.net");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_flushes_at_capacity() {
        let mut cache = PrepCache::new(2);
        cache.domain("a.example").unwrap();
        cache.domain("b.example").unwrap();
        cache.domain("c.example").unwrap();
        assert_eq!(cache.len(), 1);
    }
}
