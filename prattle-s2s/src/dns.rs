use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use prattle_core::xml::Nad;

/// Namespace of the request/response elements exchanged with the external
/// resolver component.
pub const NS_RESOLVER: &str = "http://jabberd.jabberstudio.org/ns/resolver/1.0";

#[derive(Debug, Clone)]
pub struct DnsEntry {
    pub ip: String,
    pub port: u16,
    expire_at: Instant,
}

impl DnsEntry {
    pub fn ipport(&self) -> String {
        format!("{}/{}", self.ip, self.port)
    }
}

/// Name resolution cache fed by the resolver component. Resolution itself
/// happens out of process; this tracks results, expiry and in-flight
/// requests.
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: HashMap<String, DnsEntry>,
    pending: HashMap<String, Instant>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live entry for `name`; expired entries are evicted on the way.
    pub fn lookup(&mut self, name: &str) -> Option<DnsEntry> {
        if let Some(entry) = self.entries.get(name) {
            if entry.expire_at <= Instant::now() {
                self.entries.remove(name);
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    pub fn store(&mut self, name: &str, ip: &str, port: u16, ttl: Duration) {
        self.pending.remove(name);
        self.entries.insert(
            name.to_string(),
            DnsEntry {
                ip: ip.to_string(),
                port,
                expire_at: Instant::now() + ttl,
            },
        );
    }

    /// Marks a resolve in flight. Returns `false` when one already is, so
    /// the caller does not ask the resolver twice.
    pub fn mark_pending(&mut self, name: &str) -> bool {
        if self.pending.contains_key(name) {
            return false;
        }
        self.pending.insert(name.to_string(), Instant::now());
        true
    }

    pub fn clear_pending(&mut self, name: &str) {
        self.pending.remove(name);
    }

    /// Names whose resolve has been in flight longer than `limit`.
    pub fn stale_pending(&self, limit: Duration) -> Vec<String> {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|(_, &since)| now.duration_since(since) > limit)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// `<resolve name='…'/>` request payload for the resolver component.
pub fn resolve_request(name: &str) -> Nad {
    let mut nad = Nad::with_root("resolve", Some(NS_RESOLVER));
    let root = nad.root().expect("just appended");
    nad.append_attr(root, "name", name);
    nad
}

#[derive(Debug, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub ttl: u64,
}

/// Parses the resolver's `<resolve name ip port ttl/>` answer. An answer
/// without an ip means the name did not resolve.
pub fn parse_resolved(nad: &Nad) -> Option<Result<Resolved, String>> {
    let root = nad.root()?;
    if nad.name(root) != "resolve" || nad.ns_uri(root) != Some(NS_RESOLVER) {
        return None;
    }
    let name = nad.attr_val(root, "name")?.to_string();
    let Some(ip) = nad.attr_val(root, "ip") else {
        return Some(Err(name));
    };
    let port = nad
        .attr_val(root, "port")
        .and_then(|p| p.parse().ok())
        .unwrap_or(5269);
    let ttl = nad
        .attr_val(root, "ttl")
        .and_then(|t| t.parse().ok())
        .unwrap_or(300);
    Some(Ok(Resolved {
        name,
        ip: ip.to_string(),
        port,
        ttl,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_at_the_boundary() {
        let mut cache = DnsCache::new();
        cache.store("remote.example", "203.0.113.5", 5269, Duration::from_secs(60));
        assert!(cache.lookup("remote.example").is_some());

        time::advance(Duration::from_secs(60)).await;
        assert!(cache.lookup("remote.example").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_is_marked_once() {
        let mut cache = DnsCache::new();
        assert!(cache.mark_pending("remote.example"));
        assert!(!cache.mark_pending("remote.example"));
        cache.clear_pending("remote.example");
        assert!(cache.mark_pending("remote.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pending_shows_up_after_the_limit() {
        let mut cache = DnsCache::new();
        cache.mark_pending("slow.example");
        assert!(cache.stale_pending(Duration::from_secs(60)).is_empty());
        time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            cache.stale_pending(Duration::from_secs(60)),
            vec!["slow.example".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_clears_pending() {
        let mut cache = DnsCache::new();
        cache.mark_pending("remote.example");
        cache.store("remote.example", "203.0.113.5", 5269, Duration::from_secs(60));
        assert!(cache.stale_pending(Duration::ZERO).is_empty());
        assert_eq!(
            cache.lookup("remote.example").unwrap().ipport(),
            "203.0.113.5/5269"
        );
    }

    #[test]
    fn resolver_answer_round_trip() {
        let request = resolve_request("remote.example");
        let root = request.root().unwrap();
        assert_eq!(request.attr_val(root, "name"), Some("remote.example"));

        let mut answer = Nad::with_root("resolve", Some(NS_RESOLVER));
        let root = answer.root().unwrap();
        answer.append_attr(root, "name", "remote.example");
        answer.append_attr(root, "ip", "203.0.113.5");
        answer.append_attr(root, "port", "5269");
        answer.append_attr(root, "ttl", "120");
        assert_eq!(
            parse_resolved(&answer),
            Some(Ok(Resolved {
                name: "remote.example".to_string(),
                ip: "203.0.113.5".to_string(),
                port: 5269,
                ttl: 120,
            }))
        );
    }

    #[test]
    fn unresolvable_name_is_reported() {
        let mut answer = Nad::with_root("resolve", Some(NS_RESOLVER));
        let root = answer.root().unwrap();
        answer.append_attr(root, "name", "nowhere.example");
        assert_eq!(
            parse_resolved(&answer),
            Some(Err("nowhere.example".to_string()))
        );
    }
}
