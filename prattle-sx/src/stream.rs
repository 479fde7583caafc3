use std::fmt::Display;

use anyhow::{anyhow, Error};
use base64::prelude::*;
use rand::{RngCore, SeedableRng};
use tokio::io::{split, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;

use prattle_core::xml::stream_parser::{Frame, NadStreamParser};
use prattle_core::xml::stream_writer::StreamWriter;
use prattle_core::xml::Nad;
use prattle_core::xmpp::error::StreamErrorCondition;
use prattle_core::xmpp::jid::Jid;
use prattle_core::xmpp::stream_header::StreamHeader;

use crate::connection::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId(String);

impl StreamId {
    pub fn new() -> Self {
        let mut rng = rand_chacha::ChaCha20Rng::from_entropy();
        let mut raw = [0u8; 16];
        rng.fill_bytes(&mut raw);
        Self(BASE64_STANDARD.encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of stream establishment. Headers may arrive in either order
/// depending on role; `Open` means negotiation is finished and stanzas flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    None,
    HeaderSent,
    HeaderReceived,
    Stream,
    Open,
    Closed,
}

/// One bidirectional XML stream over one connection.
///
/// Owns the parser and writer halves, the stream id, the negotiated security
/// strength factor, and the header the peer sent. `reset` puts the machine
/// back to `None` on the same socket, which is what TLS and SASL completion
/// call for.
pub struct XmppStream<C: Connection> {
    state: StreamState,
    ssf: u32,
    id: StreamId,
    content_ns: String,
    max_stanza_size: Option<usize>,
    starttls_allowed: bool,
    declare_dialback: bool,
    peer_header: Option<StreamHeader>,
    reader: Option<NadStreamParser<ReadHalf<C>>>,
    writer: Option<StreamWriter<WriteHalf<C>>>,
}

impl<C: Connection> XmppStream<C> {
    pub fn new(connection: C, content_ns: &str, max_stanza_size: Option<usize>) -> Self {
        let ssf = connection.ssf();
        let starttls_allowed = connection.is_starttls_allowed();
        let (reader, writer) = split(connection);
        Self {
            state: StreamState::None,
            ssf,
            id: StreamId::new(),
            content_ns: content_ns.to_string(),
            max_stanza_size,
            starttls_allowed,
            declare_dialback: false,
            peer_header: None,
            reader: Some(NadStreamParser::new(reader).with_max_stanza_size(max_stanza_size)),
            writer: Some(StreamWriter::new(writer)),
        }
    }

    /// Declare `xmlns:db` on our headers (server-to-server streams).
    pub fn with_dialback(mut self) -> Self {
        self.declare_dialback = true;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn ssf(&self) -> u32 {
        self.ssf
    }

    pub fn is_secure(&self) -> bool {
        self.ssf > 0
    }

    pub fn is_starttls_allowed(&self) -> bool {
        self.starttls_allowed
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn peer_header(&self) -> Option<&StreamHeader> {
        self.peer_header.as_ref()
    }

    pub fn set_open(&mut self) {
        self.state = StreamState::Open;
    }

    fn writer_mut(&mut self) -> &mut StreamWriter<WriteHalf<C>> {
        self.writer.as_mut().expect("stream writer is present")
    }

    fn reader_mut(&mut self) -> &mut NadStreamParser<ReadHalf<C>> {
        self.reader.as_mut().expect("stream parser is present")
    }

    /// Sends our stream header. Servers include the generated stream id;
    /// initiators leave it to the peer.
    pub async fn send_header(
        &mut self,
        from: Option<&Jid>,
        to: Option<&Jid>,
        with_id: bool,
    ) -> Result<(), Error> {
        let header = StreamHeader {
            from: from.cloned(),
            to: to.cloned(),
            id: with_id.then(|| self.id.to_string()),
            version: Some("1.0".to_string()),
            content_ns: None,
        };
        let content_ns = self.content_ns.clone();
        let declare_dialback = self.declare_dialback;
        self.writer_mut()
            .write_stream_header_full(&header, &content_ns, true, declare_dialback)
            .await?;
        self.state = match self.state {
            StreamState::HeaderReceived => StreamState::Stream,
            _ => StreamState::HeaderSent,
        };
        Ok(())
    }

    /// Reads the peer's stream header, failing on anything else. A header
    /// declaring a different content namespace fails the stream with
    /// `invalid-namespace`.
    pub async fn read_header(&mut self) -> Result<StreamHeader, Error> {
        match self.read_frame().await? {
            Some(Frame::StreamStart(header)) => {
                if let Some(ns) = header.content_ns.as_deref() {
                    if ns != self.content_ns {
                        let _ = self
                            .error_close(StreamErrorCondition::InvalidNamespace)
                            .await;
                        return Err(anyhow!("peer opened {ns} stream"));
                    }
                }
                self.peer_header = Some(header.clone());
                self.state = match self.state {
                    StreamState::HeaderSent => StreamState::Stream,
                    _ => StreamState::HeaderReceived,
                };
                Ok(header)
            }
            _ => Err(anyhow!("expected stream header")),
        }
    }

    /// Next frame, with parser failures turned into the matching stream
    /// error on the way out.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        match self.reader_mut().next().await.transpose() {
            Ok(frame) => Ok(frame),
            Err(error) => {
                if let Some(condition) = error.condition() {
                    let _ = self.error_close(condition).await;
                }
                Err(error.into())
            }
        }
    }

    pub async fn write_nad(&mut self, nad: &Nad) -> Result<(), Error> {
        self.writer_mut().write_nad(nad).await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, fragment: &str) -> Result<(), Error> {
        self.writer_mut().write_raw(fragment).await?;
        Ok(())
    }

    /// Emits `<stream:error>` plus the footer and marks the stream closed.
    pub async fn error_close(&mut self, condition: StreamErrorCondition) -> Result<(), Error> {
        self.writer_mut().write_stream_error(condition).await?;
        self.state = StreamState::Closed;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.writer_mut().write_stream_close().await?;
        self.state = StreamState::Closed;
        Ok(())
    }

    /// Reinitialises parser and writer on the same socket and returns the
    /// machine to `None` with a fresh stream id. The peer is expected to
    /// resend its header. Callers must await the write of `<proceed/>` or
    /// `<success/>` before resetting, which the async write path guarantees.
    pub fn reset(&mut self) {
        let reader = self
            .reader
            .take()
            .expect("stream parser is present")
            .into_inner();
        let writer = self
            .writer
            .take()
            .expect("stream writer is present")
            .into_inner();
        self.reader = Some(NadStreamParser::new(reader).with_max_stanza_size(self.max_stanza_size));
        self.writer = Some(StreamWriter::new(writer));
        self.state = StreamState::None;
        self.peer_header = None;
        self.id = StreamId::new();
    }

    /// Swaps the transport for its TLS-wrapped self, then resets. Identity
    /// and socket continue; `ssf` reflects the negotiated cipher.
    pub async fn upgrade_tls(&mut self) -> Result<(), Error> {
        let reader = self
            .reader
            .take()
            .expect("stream parser is present")
            .into_inner();
        let writer = self
            .writer
            .take()
            .expect("stream writer is present")
            .into_inner();
        let connection = reader.unsplit(writer);

        let connection = connection.upgrade()?.await?;

        self.ssf = connection.ssf();
        self.starttls_allowed = connection.is_starttls_allowed();
        let (reader, writer) = split(connection);
        self.reader = Some(NadStreamParser::new(reader).with_max_stanza_size(self.max_stanza_size));
        self.writer = Some(StreamWriter::new(writer));
        self.state = StreamState::None;
        self.peer_header = None;
        self.id = StreamId::new();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prattle_core::xml::namespaces;

    #[tokio::test]
    async fn header_exchange_reaches_stream_state() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut stream = XmppStream::new(ours, namespaces::XMPP_CLIENT, None);
        let mut peer = XmppStream::new(theirs, namespaces::XMPP_CLIENT, None);

        let from: Jid = "example.net".parse().unwrap();
        peer.send_header(None, Some(&from), false).await.unwrap();
        stream.read_header().await.unwrap();
        assert_eq!(stream.state(), StreamState::HeaderReceived);
        stream.send_header(Some(&from), None, true).await.unwrap();
        assert_eq!(stream.state(), StreamState::Stream);

        peer.read_header().await.unwrap();
        assert_eq!(peer.state(), StreamState::Stream);
        assert_eq!(
            peer.peer_header().unwrap().id.as_deref(),
            Some(stream.id().as_str())
        );
    }

    #[tokio::test]
    async fn reset_returns_to_none_with_a_new_id() {
        let (ours, _theirs) = tokio::io::duplex(4096);
        let mut stream = XmppStream::new(ours, namespaces::XMPP_CLIENT, None);
        let from: Jid = "example.net".parse().unwrap();
        stream.send_header(Some(&from), None, true).await.unwrap();
        let old_id = stream.id().clone();

        stream.reset();
        assert_eq!(stream.state(), StreamState::None);
        assert!(stream.peer_header().is_none());
        assert_ne!(stream.id(), &old_id);
    }

    #[tokio::test]
    async fn stanzas_flow_after_headers() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let mut stream = XmppStream::new(ours, namespaces::XMPP_CLIENT, None);
        let mut peer = XmppStream::new(theirs, namespaces::XMPP_CLIENT, None);

        let from: Jid = "example.net".parse().unwrap();
        peer.send_header(None, Some(&from), false).await.unwrap();
        stream.read_header().await.unwrap();

        let mut nad = Nad::with_root("presence", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "from", "alice@example.net/home");
        peer.write_nad(&nad).await.unwrap();

        match stream.read_frame().await.unwrap() {
            Some(Frame::Element(nad)) => {
                let root = nad.root().unwrap();
                assert_eq!(nad.name(root), "presence");
            }
            other => panic!("expected element, got {:?}", other),
        }
    }
}
