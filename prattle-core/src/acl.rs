use std::collections::HashMap;
use std::net::IpAddr;

use serde::Deserialize;

/// Named access lists consulted for privileged component operations.
/// Membership in the `all` list grants every permission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessControl {
    #[serde(default)]
    lists: HashMap<String, Vec<String>>,
}

impl AccessControl {
    pub fn new(lists: HashMap<String, Vec<String>>) -> Self {
        Self { lists }
    }

    pub fn allows(&self, list: &str, user: &str) -> bool {
        if self.contains(list, user) {
            return true;
        }
        self.contains("all", user)
    }

    fn contains(&self, list: &str, user: &str) -> bool {
        self.lists
            .get(list)
            .map(|members| members.iter().any(|m| m == user))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessOrder {
    #[default]
    AllowDeny,
    DenyAllow,
}

/// Listener-level IP admission: allow/deny prefix lists evaluated in the
/// configured order, jabberd-style.
#[derive(Debug, Clone, Default)]
pub struct IpAccess {
    order: AccessOrder,
    allow: Vec<IpRule>,
    deny: Vec<IpRule>,
}

#[derive(Debug, Clone, Copy)]
struct IpRule {
    addr: IpAddr,
    prefix: u8,
}

impl IpRule {
    fn parse(rule: &str) -> Option<Self> {
        let (addr, prefix) = match rule.split_once('/') {
            Some((addr, prefix)) => (addr.parse().ok()?, prefix.parse().ok()?),
            None => {
                let addr: IpAddr = rule.parse().ok()?;
                let prefix = match addr {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                (addr, prefix)
            }
        };
        Some(Self { addr, prefix })
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(rule), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                u32::from(rule) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(rule), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                u128::from(rule) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl IpAccess {
    pub fn new(order: AccessOrder, allow: &[String], deny: &[String]) -> Self {
        Self {
            order,
            allow: allow.iter().filter_map(|r| IpRule::parse(r)).collect(),
            deny: deny.iter().filter_map(|r| IpRule::parse(r)).collect(),
        }
    }

    pub fn permits(&self, ip: IpAddr) -> bool {
        let allowed = self.allow.iter().any(|r| r.matches(ip));
        let denied = self.deny.iter().any(|r| r.matches(ip));
        match self.order {
            AccessOrder::AllowDeny => (self.allow.is_empty() || allowed) && !denied,
            AccessOrder::DenyAllow => !denied || allowed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_passes_named_list() {
        let mut lists = HashMap::new();
        lists.insert("bind".to_string(), vec!["s2s-user".to_string()]);
        let acl = AccessControl::new(lists);
        assert!(acl.allows("bind", "s2s-user"));
        assert!(!acl.allows("bind", "someone-else"));
    }

    #[test]
    fn all_list_grants_everything() {
        let mut lists = HashMap::new();
        lists.insert("all".to_string(), vec!["admin".to_string()]);
        let acl = AccessControl::new(lists);
        assert!(acl.allows("bind", "admin"));
        assert!(acl.allows("route", "admin"));
    }

    #[test]
    fn empty_allow_list_permits_by_default() {
        let access = IpAccess::new(AccessOrder::AllowDeny, &[], &[]);
        assert!(access.permits("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn deny_prefix_blocks() {
        let access = IpAccess::new(
            AccessOrder::AllowDeny,
            &[],
            &["192.0.2.0/24".to_string()],
        );
        assert!(!access.permits("192.0.2.77".parse().unwrap()));
        assert!(access.permits("198.51.100.1".parse().unwrap()));
    }

    #[test]
    fn deny_allow_order_lets_allow_win() {
        let access = IpAccess::new(
            AccessOrder::DenyAllow,
            &["192.0.2.10".to_string()],
            &["192.0.2.0/24".to_string()],
        );
        assert!(access.permits("192.0.2.10".parse().unwrap()));
        assert!(!access.permits("192.0.2.11".parse().unwrap()));
    }
}
