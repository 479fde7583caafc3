use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::xml::{namespaces, Nad};
use crate::xmpp::error::StreamErrorCondition;
use crate::xmpp::stream_header::StreamHeader;

/// Serializing half of an XMPP stream.
///
/// The stream header and footer are emitted as raw fragments (they are not
/// complete elements); stanzas go out as serialized NADs. Every write is
/// flushed so negotiation replies are never stuck in a buffer.
pub struct StreamWriter<W: AsyncWrite + Unpin> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> StreamWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub async fn write_stream_header(
        &mut self,
        header: &StreamHeader,
        content_ns: &str,
        include_xml_declaration: bool,
    ) -> io::Result<()> {
        self.write_stream_header_full(header, content_ns, include_xml_declaration, false)
            .await
    }

    /// Header writer with the `jabber:server:dialback` declaration peers
    /// look for on server-to-server streams.
    pub async fn write_stream_header_full(
        &mut self,
        header: &StreamHeader,
        content_ns: &str,
        include_xml_declaration: bool,
        declare_dialback: bool,
    ) -> io::Result<()> {
        let mut out = String::new();
        if include_xml_declaration {
            out.push_str("<?xml version='1.0'?>");
        }
        out.push_str("<stream:stream xmlns=\"");
        out.push_str(content_ns);
        out.push_str("\" xmlns:stream=\"");
        out.push_str(namespaces::XMPP_STREAMS);
        out.push('"');
        if declare_dialback {
            out.push_str(" xmlns:db=\"");
            out.push_str(namespaces::XMPP_DIALBACK);
            out.push('"');
        }
        if let Some(from) = &header.from {
            out.push_str(" from=\"");
            out.push_str(&from.to_string());
            out.push('"');
        }
        if let Some(to) = &header.to {
            out.push_str(" to=\"");
            out.push_str(&to.to_string());
            out.push('"');
        }
        if let Some(id) = &header.id {
            out.push_str(" id=\"");
            out.push_str(id);
            out.push('"');
        }
        if let Some(version) = &header.version {
            out.push_str(" version=\"");
            out.push_str(version);
            out.push('"');
        }
        out.push('>');

        self.write_raw(&out).await
    }

    pub async fn write_nad(&mut self, nad: &Nad) -> io::Result<()> {
        let serialized = nad.serialize();
        self.write_raw(&serialized).await
    }

    pub async fn write_elem(&mut self, nad: &Nad, elem: usize) -> io::Result<()> {
        let serialized = nad.serialize_elem(elem);
        self.write_raw(&serialized).await
    }

    /// Emits a stream error followed by the stream footer. The caller is
    /// expected to close the connection afterwards.
    pub async fn write_stream_error(&mut self, condition: StreamErrorCondition) -> io::Result<()> {
        let fragment = format!(
            "<stream:error><{} xmlns=\"{}\"/></stream:error></stream:stream>",
            condition.name(),
            namespaces::XMPP_STREAM_ERRORS,
        );
        self.write_raw(&fragment).await
    }

    pub async fn write_stream_close(&mut self) -> io::Result<()> {
        self.write_raw("</stream:stream>").await
    }

    pub async fn write_raw(&mut self, fragment: &str) -> io::Result<()> {
        self.writer.write_all(fragment.as_bytes()).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::jid::Jid;

    #[tokio::test]
    async fn header_carries_identity_and_version() {
        let header = StreamHeader {
            from: Some("example.net".parse::<Jid>().unwrap()),
            to: None,
            id: Some("abc123".to_string()),
            version: Some("1.0".to_string()),
            content_ns: None,
        };
        let mut writer = StreamWriter::new(Vec::new());
        writer
            .write_stream_header(&header, namespaces::XMPP_CLIENT, true)
            .await
            .unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert!(out.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(out.contains("xmlns=\"jabber:client\""));
        assert!(out.contains("from=\"example.net\""));
        assert!(out.contains("id=\"abc123\""));
        assert!(out.contains("version=\"1.0\""));
        assert!(out.ends_with('>'));
    }

    #[tokio::test]
    async fn stream_error_closes_the_stream() {
        let mut writer = StreamWriter::new(Vec::new());
        writer
            .write_stream_error(StreamErrorCondition::HostGone)
            .await
            .unwrap();
        let out = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(
            out,
            "<stream:error><host-gone xmlns=\"urn:ietf:params:xml:ns:xmpp-streams\"/>\
             </stream:error></stream:stream>"
        );
    }
}
