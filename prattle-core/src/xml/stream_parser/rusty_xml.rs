use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::BytesMut;
use rustyxml::{Event, Parser, StartTag};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_stream::Stream;

use super::{Frame, ParseError};
use crate::xml::{namespaces, Nad};
use crate::xmpp::stream_header::StreamHeader;

const READ_CHUNK: usize = 4096;

/// Incremental stream parser: bytes in, [`Frame`]s out.
///
/// The stream document's root element becomes a [`Frame::StreamStart`]; every
/// complete depth-1 child is assembled into its own [`Nad`] and yielded as
/// [`Frame::Element`]. Character data outside any stanza (whitespace
/// keepalives) is discarded.
pub struct NadStreamParser<R: AsyncRead + Unpin> {
    reader: R,
    undecoded: BytesMut,
    parser: Parser,
    nad: Option<Nad>,
    stack: Vec<usize>,
    started: bool,
    max_stanza_size: Option<usize>,
    pending: VecDeque<Result<Frame, ParseError>>,
    failed: bool,
}

impl<R: AsyncRead + Unpin> NadStreamParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            undecoded: BytesMut::new(),
            parser: Parser::new(),
            nad: None,
            stack: Vec::new(),
            started: false,
            max_stanza_size: None,
            pending: VecDeque::new(),
            failed: false,
        }
    }

    /// Bounds the serialized size of any single stanza. A stanza exactly at
    /// the limit passes; one byte over fails the stream.
    pub fn with_max_stanza_size(mut self, limit: Option<usize>) -> Self {
        self.max_stanza_size = limit;
        self
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn fail(&mut self, error: ParseError) {
        self.pending.push_back(Err(error));
        self.failed = true;
    }

    fn handle_start(&mut self, tag: StartTag) {
        if self.stack.is_empty() && !self.started {
            if tag.ns.as_deref() != Some(namespaces::XMPP_STREAMS) {
                self.fail(ParseError::InvalidNamespace);
                return;
            }
            if tag.name != "stream" {
                self.fail(ParseError::NotWellFormed);
                return;
            }
            let header = StreamHeader {
                to: attr(&tag, "to").and_then(|v| v.parse().ok()),
                from: attr(&tag, "from").and_then(|v| v.parse().ok()),
                id: attr(&tag, "id").map(str::to_string),
                version: attr(&tag, "version").map(str::to_string),
                content_ns: attr(&tag, "xmlns").map(str::to_string),
            };
            self.started = true;
            self.pending.push_back(Ok(Frame::StreamStart(header)));
            return;
        }

        let parent = self.stack.last().copied();
        let nad = self.nad.get_or_insert_with(Nad::new);
        let elem = nad.append_elem(parent, &tag.name, tag.ns.as_deref());
        for ((name, ns), value) in &tag.attributes {
            match ns.as_deref() {
                // namespace declarations are structural, not attributes
                Some(namespaces::XMLNS) => {}
                None if name == "xmlns" => {}
                Some(uri) => nad.append_attr_ns(elem, name, value, uri),
                None => nad.append_attr(elem, name, value),
            }
        }
        self.stack.push(elem);
    }

    fn handle_text(&mut self, text: &str) {
        if let Some(&top) = self.stack.last() {
            if let Some(nad) = self.nad.as_mut() {
                nad.append_text(top, text);
            }
        }
    }

    fn handle_end(&mut self) {
        if self.stack.is_empty() {
            if self.started {
                self.pending.push_back(Ok(Frame::StreamEnd));
            } else {
                self.fail(ParseError::NotWellFormed);
            }
            return;
        }

        self.stack.pop();
        if self.stack.is_empty() {
            if let Some(nad) = self.nad.take() {
                if let Some(limit) = self.max_stanza_size {
                    if nad.serialize().len() > limit {
                        self.fail(ParseError::StanzaTooLarge);
                        return;
                    }
                }
                self.pending.push_back(Ok(Frame::Element(nad)));
            }
        }
    }

    fn drain_parser(&mut self) {
        while !self.failed {
            let event = match self.parser.next() {
                Some(event) => event,
                None => break,
            };
            match event {
                Ok(Event::ElementStart(tag)) => self.handle_start(tag),
                Ok(Event::Characters(text)) => self.handle_text(&text),
                Ok(Event::CDATA(text)) => self.handle_text(&text),
                Ok(Event::ElementEnd(_)) => self.handle_end(),
                Ok(Event::Comment(_)) | Ok(Event::PI(_)) => {}
                Err(_) => self.fail(ParseError::NotWellFormed),
            }
        }
    }

    /// Feeds the longest valid UTF-8 prefix of the undecoded bytes to the
    /// parser, keeping an incomplete trailing sequence for the next read.
    fn feed_decoded(&mut self) {
        let valid_up_to = match std::str::from_utf8(&self.undecoded) {
            Ok(_) => self.undecoded.len(),
            Err(e) if e.error_len().is_some() => {
                self.fail(ParseError::NotWellFormed);
                return;
            }
            Err(e) => e.valid_up_to(),
        };
        if valid_up_to == 0 {
            return;
        }
        let chunk = self.undecoded.split_to(valid_up_to);
        let text = std::str::from_utf8(&chunk).expect("validated above");
        self.parser.feed_str(text);
    }
}

impl<R: AsyncRead + Unpin> Stream for NadStreamParser<R> {
    type Item = Result<Frame, ParseError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(item) = this.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if this.failed {
                return Poll::Ready(None);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut buf = ReadBuf::new(&mut chunk);
            match ready!(Pin::new(&mut this.reader).poll_read(cx, &mut buf)) {
                Ok(()) => {}
                Err(e) => {
                    this.failed = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
            }
            if buf.filled().is_empty() {
                return Poll::Ready(None);
            }
            this.undecoded.extend_from_slice(buf.filled());
            this.feed_decoded();
            this.drain_parser();
        }
    }
}

fn attr<'t>(tag: &'t StartTag, name: &str) -> Option<&'t str> {
    tag.attributes
        .get(&(name.to_string(), None))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt;

    use super::*;

    const HEADER: &str = "<stream:stream xmlns=\"jabber:client\" \
        xmlns:stream=\"http://etherx.jabber.org/streams\" to=\"example.net\" version=\"1.0\">";

    async fn frames(input: &'static str) -> Vec<Result<Frame, ParseError>> {
        let mut parser = NadStreamParser::new(input.as_bytes());
        let mut out = Vec::new();
        while let Some(frame) = parser.next().await {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn stream_header_is_captured() {
        let frames = frames(HEADER).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Ok(Frame::StreamStart(header)) => {
                assert_eq!(header.to.as_ref().unwrap().to_string(), "example.net");
                assert_eq!(header.version.as_deref(), Some("1.0"));
            }
            other => panic!("expected stream start, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stanza_becomes_one_nad() {
        let input: &'static str = Box::leak(
            format!(
                "{}<message to=\"bob@remote\" type=\"chat\"><body>hi</body></message>",
                HEADER
            )
            .into_boxed_str(),
        );
        let frames = frames(input).await;
        assert_eq!(frames.len(), 2);
        match &frames[1] {
            Ok(Frame::Element(nad)) => {
                let root = nad.root().unwrap();
                assert_eq!(nad.name(root), "message");
                assert_eq!(nad.ns_uri(root), Some("jabber:client"));
                assert_eq!(nad.attr_val(root, "to"), Some("bob@remote"));
                let body = nad.find_child(root, "body", Some("jabber:client")).unwrap();
                assert_eq!(nad.text(body), "hi");
                nad.check_invariants().unwrap();
            }
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn serialize_parse_serialize_is_identity() {
        let canonical =
            "<message xmlns=\"jabber:client\" to=\"bob@remote\"><body>a &amp; b</body></message>";
        let input: &'static str =
            Box::leak(format!("{}{}", HEADER, canonical).into_boxed_str());
        let frames = frames(input).await;
        match &frames[1] {
            Ok(Frame::Element(nad)) => assert_eq!(nad.serialize(), canonical),
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_end_is_reported() {
        let input: &'static str =
            Box::leak(format!("{}</stream:stream>", HEADER).into_boxed_str());
        let frames = frames(input).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], Ok(Frame::StreamEnd)));
    }

    #[tokio::test]
    async fn wrong_stream_namespace_is_rejected() {
        let frames = frames("<stream:stream xmlns:stream=\"urn:wrong\">").await;
        assert!(matches!(
            frames.last(),
            Some(Err(ParseError::InvalidNamespace))
        ));
    }

    #[tokio::test]
    async fn malformed_xml_is_rejected() {
        let input: &'static str =
            Box::leak(format!("{}<message><oops</message>", HEADER).into_boxed_str());
        let frames = frames(input).await;
        assert!(matches!(frames.last(), Some(Err(ParseError::NotWellFormed))));
    }

    #[tokio::test]
    async fn stanza_at_size_limit_passes_one_over_fails() {
        let canonical = "<message xmlns=\"jabber:client\"><body>abc</body></message>";
        let limit = canonical.len();

        let input: &'static str =
            Box::leak(format!("{}{}", HEADER, canonical).into_boxed_str());
        let mut parser =
            NadStreamParser::new(input.as_bytes()).with_max_stanza_size(Some(limit));
        parser.next().await; // header
        assert!(matches!(parser.next().await, Some(Ok(Frame::Element(_)))));

        let bigger = "<message xmlns=\"jabber:client\"><body>abcd</body></message>";
        let input: &'static str =
            Box::leak(format!("{}{}", HEADER, bigger).into_boxed_str());
        let mut parser =
            NadStreamParser::new(input.as_bytes()).with_max_stanza_size(Some(limit));
        parser.next().await; // header
        assert!(matches!(
            parser.next().await,
            Some(Err(ParseError::StanzaTooLarge))
        ));
    }

    #[tokio::test]
    async fn split_reads_reassemble() {
        let (client, server) = tokio::io::duplex(64);
        let mut parser = NadStreamParser::new(server);
        let write = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(HEADER.as_bytes()).await.unwrap();
            client.write_all(b"<message><bo").await.unwrap();
            client.write_all(b"dy>split</body></message>").await.unwrap();
        });
        assert!(matches!(
            parser.next().await,
            Some(Ok(Frame::StreamStart(_)))
        ));
        match parser.next().await {
            Some(Ok(Frame::Element(nad))) => {
                let root = nad.root().unwrap();
                let body = nad.find_child(root, "body", Some("jabber:client")).unwrap();
                assert_eq!(nad.text(body), "split");
            }
            other => panic!("expected element, got {:?}", other),
        }
        write.await.unwrap();
    }
}
