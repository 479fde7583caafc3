use crate::xmpp::jid::Jid;

/// Attributes captured from (or written to) a `<stream:stream>` open tag.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub content_ns: Option<String>,
}

impl StreamHeader {
    /// The peer advertises XMPP 1.0 semantics (features, TLS, SASL).
    pub fn supports_features(&self) -> bool {
        match &self.version {
            Some(v) => {
                let major = v.split('.').next().unwrap_or("0");
                major.parse::<u32>().map(|m| m >= 1).unwrap_or(false)
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_one_supports_features() {
        let header = StreamHeader {
            version: Some("1.0".to_string()),
            ..Default::default()
        };
        assert!(header.supports_features());
    }

    #[test]
    fn missing_version_is_legacy() {
        assert!(!StreamHeader::default().supports_features());
    }
}
