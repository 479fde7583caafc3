/// Peer-domain whitelist: a remote domain passes when it equals an entry
/// exactly, or ends with an entry aligned on a dot boundary.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    enabled: bool,
    domains: Vec<String>,
}

impl Whitelist {
    pub fn new(enabled: bool, domains: &[String]) -> Self {
        Self {
            enabled,
            domains: domains.iter().map(|d| d.to_lowercase()).collect(),
        }
    }

    pub fn permits(&self, remote: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let remote = remote.to_lowercase();
        self.domains.iter().any(|entry| {
            if remote == *entry {
                return true;
            }
            remote
                .strip_suffix(entry)
                .map(|prefix| prefix.ends_with('.'))
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist(entries: &[&str]) -> Whitelist {
        let domains: Vec<String> = entries.iter().map(|e| e.to_string()).collect();
        Whitelist::new(true, &domains)
    }

    #[test]
    fn disabled_whitelist_permits_everything() {
        let whitelist = Whitelist::new(false, &[]);
        assert!(whitelist.permits("anything.example"));
    }

    #[test]
    fn exact_match_passes() {
        assert!(whitelist(&["example"]).permits("example"));
    }

    #[test]
    fn suffix_match_must_align_on_a_dot() {
        let list = whitelist(&["example"]);
        assert!(list.permits("a.b.example"));
        assert!(!list.permits("ample"));
        assert!(!list.permits("notexample"));
    }

    #[test]
    fn unlisted_domain_fails() {
        assert!(!whitelist(&["example"]).permits("example.org"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert!(whitelist(&["Example.NET"]).permits("peer.example.net"));
    }
}
