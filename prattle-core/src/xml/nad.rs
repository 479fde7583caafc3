use super::namespaces;

/// Byte range into the shared character pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    len: usize,
}

#[derive(Debug, Clone)]
struct ElemRec {
    name: Span,
    ns: Option<usize>,
    depth: usize,
    parent: Option<usize>,
    first_child: Option<usize>,
    last_child: Option<usize>,
    next_sibling: Option<usize>,
    text: Vec<Span>,
}

#[derive(Debug, Clone)]
struct AttrRec {
    elem: usize,
    name: Span,
    ns: Option<usize>,
    value: Span,
}

#[derive(Debug, Clone)]
struct NsRec {
    elem: usize,
    uri: Span,
    prefix: Option<Span>,
}

/// A flat, append-only representation of one XML element and its descendants.
///
/// Elements, attributes and namespace declarations are records holding byte
/// ranges into a single growable UTF-8 pool. Children are linked through
/// integer indices, so a whole stanza is three small arrays plus one string
/// and cloning or dropping it never walks a pointer graph.
#[derive(Debug, Clone, Default)]
pub struct Nad {
    pool: String,
    elems: Vec<ElemRec>,
    attrs: Vec<AttrRec>,
    nss: Vec<NsRec>,
}

impl Nad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for an outgoing element tree.
    pub fn with_root(name: &str, ns_uri: Option<&str>) -> Self {
        let mut nad = Self::new();
        nad.append_elem(None, name, ns_uri);
        nad
    }

    pub fn root(&self) -> Option<usize> {
        if self.elems.is_empty() { None } else { Some(0) }
    }

    pub fn elem_count(&self) -> usize {
        self.elems.len()
    }

    fn intern(&mut self, s: &str) -> Span {
        let start = self.pool.len();
        self.pool.push_str(s);
        Span {
            start,
            len: s.len(),
        }
    }

    fn span_str(&self, span: Span) -> &str {
        &self.pool[span.start..span.start + span.len]
    }

    /// Appends an element under `parent` (or as the root when `parent` is
    /// `None`). The namespace is resolved against declarations in scope and
    /// declared on the new element when it is not.
    pub fn append_elem(&mut self, parent: Option<usize>, name: &str, ns_uri: Option<&str>) -> usize {
        let depth = match parent {
            Some(p) => self.elems[p].depth + 1,
            None => 0,
        };
        let name = self.intern(name);
        let idx = self.elems.len();
        self.elems.push(ElemRec {
            name,
            ns: None,
            depth,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
            text: Vec::new(),
        });

        if let Some(p) = parent {
            match self.elems[p].last_child {
                Some(last) => self.elems[last].next_sibling = Some(idx),
                None => self.elems[p].first_child = Some(idx),
            }
            self.elems[p].last_child = Some(idx);
        }

        if let Some(uri) = ns_uri {
            let ns = match self.scope_ns(parent, uri) {
                Some(ns) => ns,
                None => self.append_ns(idx, uri, None),
            };
            self.elems[idx].ns = Some(ns);
        }

        idx
    }

    /// Declares a namespace on `elem` and returns its index.
    pub fn append_ns(&mut self, elem: usize, uri: &str, prefix: Option<&str>) -> usize {
        let uri = self.intern(uri);
        let prefix = prefix.map(|p| self.intern(p));
        self.nss.push(NsRec { elem, uri, prefix });
        self.nss.len() - 1
    }

    pub fn append_attr(&mut self, elem: usize, name: &str, value: &str) {
        let name = self.intern(name);
        let value = self.intern(value);
        self.attrs.push(AttrRec {
            elem,
            name,
            ns: None,
            value,
        });
    }

    /// Appends a namespaced attribute, declaring the namespace when needed.
    pub fn append_attr_ns(&mut self, elem: usize, name: &str, value: &str, ns_uri: &str) {
        let ns = match self.scope_ns(Some(elem), ns_uri) {
            Some(ns) => ns,
            None if ns_uri == namespaces::XML => self.append_ns(elem, ns_uri, Some("xml")),
            None => self.append_ns(elem, ns_uri, None),
        };
        let name = self.intern(name);
        let value = self.intern(value);
        self.attrs.push(AttrRec {
            elem,
            name,
            ns: Some(ns),
            value,
        });
    }

    /// Replaces the value of an un-namespaced attribute, appending it when
    /// absent. The old value stays in the pool; only the record moves.
    pub fn set_attr(&mut self, elem: usize, name: &str, value: &str) {
        let found = self
            .attrs
            .iter()
            .position(|a| a.elem == elem && a.ns.is_none() && self.span_str(a.name) == name);
        match found {
            Some(i) => {
                let value = self.intern(value);
                self.attrs[i].value = value;
            }
            None => self.append_attr(elem, name, value),
        }
    }

    pub fn append_text(&mut self, elem: usize, text: &str) {
        let span = self.intern(text);
        self.elems[elem].text.push(span);
    }

    /// Deep-copies the subtree rooted at `other_elem` of `other` under
    /// `parent`, preserving namespaces and prefixed declarations.
    pub fn append_nad(&mut self, parent: Option<usize>, other: &Nad, other_elem: usize) -> usize {
        self.append_nad_mapped(parent, other, other_elem, None)
    }

    /// [`Nad::append_nad`] with a namespace substitution applied along the
    /// way, which is how stanzas cross between `jabber:client` and
    /// `jabber:server` streams.
    pub fn append_nad_mapped(
        &mut self,
        parent: Option<usize>,
        other: &Nad,
        other_elem: usize,
        map_ns: Option<(&str, &str)>,
    ) -> usize {
        let rec = &other.elems[other_elem];
        let name = other.span_str(rec.name).to_string();
        let mut ns_uri = rec.ns.map(|ns| other.span_str(other.nss[ns].uri).to_string());
        if let (Some(uri), Some((from, to))) = (ns_uri.as_deref(), map_ns) {
            if uri == from {
                ns_uri = Some(to.to_string());
            }
        }
        let idx = self.append_elem(parent, &name, ns_uri.as_deref());

        for ns in &other.nss {
            if ns.elem == other_elem {
                if let Some(prefix) = ns.prefix {
                    let uri = other.span_str(ns.uri).to_string();
                    let prefix = other.span_str(prefix).to_string();
                    if self.scope_prefix(idx, &uri).is_none() {
                        self.append_ns(idx, &uri, Some(&prefix));
                    }
                }
            }
        }

        for i in 0..other.attrs.len() {
            if other.attrs[i].elem != other_elem {
                continue;
            }
            let name = other.span_str(other.attrs[i].name).to_string();
            let value = other.span_str(other.attrs[i].value).to_string();
            match other.attrs[i].ns {
                Some(ns) => {
                    let uri = other.span_str(other.nss[ns].uri).to_string();
                    self.append_attr_ns(idx, &name, &value, &uri);
                }
                None => self.append_attr(idx, &name, &value),
            }
        }

        for span in &rec.text {
            let text = other.span_str(*span).to_string();
            self.append_text(idx, &text);
        }

        let mut child = rec.first_child;
        while let Some(c) = child {
            self.append_nad_mapped(Some(idx), other, c, map_ns);
            child = other.elems[c].next_sibling;
        }

        idx
    }

    pub fn name(&self, elem: usize) -> &str {
        self.span_str(self.elems[elem].name)
    }

    pub fn ns_uri(&self, elem: usize) -> Option<&str> {
        self.elems[elem]
            .ns
            .map(|ns| self.span_str(self.nss[ns].uri))
    }

    pub fn depth(&self, elem: usize) -> usize {
        self.elems[elem].depth
    }

    pub fn parent(&self, elem: usize) -> Option<usize> {
        self.elems[elem].parent
    }

    pub fn attr_val(&self, elem: usize, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.elem == elem && a.ns.is_none() && self.span_str(a.name) == name)
            .map(|a| self.span_str(a.value))
    }

    pub fn attr_val_ns(&self, elem: usize, name: &str, ns_uri: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| {
                a.elem == elem
                    && a.ns
                        .map(|ns| self.span_str(self.nss[ns].uri) == ns_uri)
                        .unwrap_or(false)
                    && self.span_str(a.name) == name
            })
            .map(|a| self.span_str(a.value))
    }

    pub fn children(&self, elem: usize) -> Children<'_> {
        Children {
            nad: self,
            next: self.elems[elem].first_child,
        }
    }

    pub fn find_child(&self, elem: usize, name: &str, ns_uri: Option<&str>) -> Option<usize> {
        self.children(elem)
            .find(|&c| self.name(c) == name && self.ns_uri(c) == ns_uri)
    }

    /// Concatenated character data of `elem` (not including descendants).
    pub fn text(&self, elem: usize) -> String {
        let mut out = String::new();
        for span in &self.elems[elem].text {
            out.push_str(self.span_str(*span));
        }
        out
    }

    fn is_ancestor_or_self(&self, ancestor: usize, mut elem: usize) -> bool {
        loop {
            if elem == ancestor {
                return true;
            }
            match self.elems[elem].parent {
                Some(p) => elem = p,
                None => return false,
            }
        }
    }

    /// Finds a declaration of `uri` visible from an element whose parent is
    /// `below` (i.e. on `below` or any of its ancestors).
    fn scope_ns(&self, below: Option<usize>, uri: &str) -> Option<usize> {
        let from = below?;
        self.nss
            .iter()
            .enumerate()
            .rev()
            .find(|(_, ns)| {
                self.span_str(ns.uri) == uri && self.is_ancestor_or_self(ns.elem, from)
            })
            .map(|(i, _)| i)
    }

    fn scope_prefix(&self, elem: usize, uri: &str) -> Option<&str> {
        if uri == namespaces::XML {
            return Some("xml");
        }
        self.nss
            .iter()
            .rev()
            .filter(|ns| ns.prefix.is_some() && self.is_ancestor_or_self(ns.elem, elem))
            .find(|ns| self.span_str(ns.uri) == uri)
            .and_then(|ns| ns.prefix.map(|p| self.span_str(p)))
    }

    /// The default (unprefixed) namespace in scope at the parent of `elem`.
    fn default_ns_above(&self, elem: usize) -> Option<&str> {
        let mut at = self.elems[elem].parent;
        while let Some(e) = at {
            if let Some(ns) = self
                .nss
                .iter()
                .rev()
                .find(|ns| ns.prefix.is_none() && ns.elem == e)
            {
                return Some(self.span_str(ns.uri));
            }
            if let Some(ns) = self.elems[e].ns {
                if self.nss[ns].prefix.is_none() {
                    return Some(self.span_str(self.nss[ns].uri));
                }
            }
            at = self.elems[e].parent;
        }
        None
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root() {
            self.serialize_into(root, &mut out);
        }
        out
    }

    pub fn serialize_elem(&self, elem: usize) -> String {
        let mut out = String::new();
        self.serialize_into(elem, &mut out);
        out
    }

    fn serialize_into(&self, elem: usize, out: &mut String) {
        let rec = &self.elems[elem];
        let name = self.span_str(rec.name);

        let mut xmlns = None;
        let tag = match rec.ns {
            Some(ns) => {
                let uri = self.span_str(self.nss[ns].uri);
                match self.scope_prefix(elem, uri) {
                    Some(prefix) if uri != namespaces::XML => format!("{}:{}", prefix, name),
                    _ => {
                        if self.default_ns_above(elem) != Some(uri) {
                            xmlns = Some(uri);
                        }
                        name.to_string()
                    }
                }
            }
            None => name.to_string(),
        };

        out.push('<');
        out.push_str(&tag);
        if let Some(uri) = xmlns {
            out.push_str(" xmlns=\"");
            escape_attr(uri, out);
            out.push('"');
        }
        for ns in &self.nss {
            if ns.elem == elem && self.span_str(ns.uri) != namespaces::XML {
                if let Some(prefix) = ns.prefix {
                    out.push_str(" xmlns:");
                    out.push_str(self.span_str(prefix));
                    out.push_str("=\"");
                    escape_attr(self.span_str(ns.uri), out);
                    out.push('"');
                }
            }
        }
        for attr in &self.attrs {
            if attr.elem != elem {
                continue;
            }
            out.push(' ');
            if let Some(ns) = attr.ns {
                let uri = self.span_str(self.nss[ns].uri);
                if let Some(prefix) = self.scope_prefix(elem, uri) {
                    out.push_str(prefix);
                    out.push(':');
                }
            }
            out.push_str(self.span_str(attr.name));
            out.push_str("=\"");
            escape_attr(self.span_str(attr.value), out);
            out.push('"');
        }

        if rec.text.is_empty() && rec.first_child.is_none() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        for span in &rec.text {
            escape_text(self.span_str(*span), out);
        }
        let mut child = rec.first_child;
        while let Some(c) = child {
            self.serialize_into(c, out);
            child = self.elems[c].next_sibling;
        }
        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
    }

    /// Structural soundness check used by tests: child depths, attribute
    /// owners and namespace scoping.
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        for (i, rec) in self.elems.iter().enumerate() {
            match rec.parent {
                Some(p) => {
                    if p >= self.elems.len() {
                        return Err("parent index out of range");
                    }
                    if rec.depth != self.elems[p].depth + 1 {
                        return Err("depth is not parent depth + 1");
                    }
                }
                None => {
                    if rec.depth != 0 {
                        return Err("orphan element with nonzero depth");
                    }
                }
            }
            if let Some(ns) = rec.ns {
                if ns >= self.nss.len() {
                    return Err("element namespace index out of range");
                }
                if !self.is_ancestor_or_self(self.nss[ns].elem, i) {
                    return Err("element namespace not declared in scope");
                }
            }
        }
        for attr in &self.attrs {
            if attr.elem >= self.elems.len() {
                return Err("attribute element index out of range");
            }
        }
        for ns in &self.nss {
            if ns.elem >= self.elems.len() {
                return Err("namespace element index out of range");
            }
        }
        Ok(())
    }
}

pub struct Children<'a> {
    nad: &'a Nad,
    next: Option<usize>,
}

impl<'a> Iterator for Children<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next?;
        self.next = self.nad.elems[cur].next_sibling;
        Some(cur)
    }
}

fn escape_text(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

fn escape_attr(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_empty_element() {
        let nad = Nad::with_root("presence", Some(namespaces::XMPP_CLIENT));
        assert_eq!(nad.serialize(), "<presence xmlns=\"jabber:client\"/>");
    }

    #[test]
    fn serialize_nested_with_text() {
        let mut nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "to", "bob@remote.example");
        let body = nad.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        nad.append_text(body, "hi there");
        assert_eq!(
            nad.serialize(),
            "<message xmlns=\"jabber:client\" to=\"bob@remote.example\"><body>hi there</body></message>"
        );
    }

    #[test]
    fn child_in_foreign_namespace_declares_it() {
        let mut nad = Nad::with_root("iq", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        let query = nad.append_elem(Some(root), "query", Some("jabber:iq:roster"));
        assert_eq!(nad.ns_uri(query), Some("jabber:iq:roster"));
        assert_eq!(
            nad.serialize(),
            "<iq xmlns=\"jabber:client\"><query xmlns=\"jabber:iq:roster\"/></iq>"
        );
    }

    #[test]
    fn sibling_in_same_namespace_reuses_declaration() {
        let mut nad = Nad::with_root("features", Some(namespaces::XMPP_STREAMS));
        let root = nad.root().unwrap();
        let a = nad.append_elem(Some(root), "one", Some(namespaces::XMPP_STREAMS));
        let b = nad.append_elem(Some(root), "two", Some(namespaces::XMPP_STREAMS));
        assert_eq!(nad.elems[a].ns, nad.elems[b].ns);
    }

    #[test]
    fn text_is_escaped() {
        let mut nad = Nad::with_root("body", None);
        let root = nad.root().unwrap();
        nad.append_text(root, "a < b & c");
        assert_eq!(nad.serialize(), "<body>a &lt; b &amp; c</body>");
    }

    #[test]
    fn attr_is_escaped() {
        let mut nad = Nad::with_root("x", None);
        let root = nad.root().unwrap();
        nad.append_attr(root, "v", "say \"hi\" & go");
        assert_eq!(nad.serialize(), "<x v=\"say &quot;hi&quot; &amp; go\"/>");
    }

    #[test]
    fn set_attr_replaces_value() {
        let mut nad = Nad::with_root("route", None);
        let root = nad.root().unwrap();
        nad.append_attr(root, "to", "a.example");
        nad.set_attr(root, "to", "b.example");
        assert_eq!(nad.attr_val(root, "to"), Some("b.example"));
        assert_eq!(nad.serialize(), "<route to=\"b.example\"/>");
    }

    #[test]
    fn depths_follow_parents() {
        let mut nad = Nad::with_root("a", None);
        let a = nad.root().unwrap();
        let b = nad.append_elem(Some(a), "b", None);
        let c = nad.append_elem(Some(b), "c", None);
        assert_eq!(nad.depth(a), 0);
        assert_eq!(nad.depth(b), 1);
        assert_eq!(nad.depth(c), 2);
        nad.check_invariants().unwrap();
    }

    #[test]
    fn append_nad_copies_subtree() {
        let mut inner = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = inner.root().unwrap();
        inner.append_attr(root, "to", "bob@remote.example");
        let body = inner.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        inner.append_text(body, "hello");

        let mut outer = Nad::with_root("route", Some(namespaces::COMPONENT));
        let outer_root = outer.root().unwrap();
        let copied = outer.append_nad(Some(outer_root), &inner, root);

        assert_eq!(outer.name(copied), "message");
        assert_eq!(outer.attr_val(copied, "to"), Some("bob@remote.example"));
        let copied_body = outer.find_child(copied, "body", Some(namespaces::XMPP_CLIENT));
        assert!(copied_body.is_some());
        assert_eq!(outer.text(copied_body.unwrap()), "hello");
        outer.check_invariants().unwrap();
    }

    #[test]
    fn append_nad_mapped_swaps_content_namespace() {
        let mut inner = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = inner.root().unwrap();
        let body = inner.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        inner.append_text(body, "hello");
        let query = inner.append_elem(Some(root), "x", Some("jabber:x:oob"));
        inner.append_text(query, "u");

        let mut out = Nad::new();
        let copied = out.append_nad_mapped(
            None,
            &inner,
            root,
            Some((namespaces::XMPP_CLIENT, namespaces::XMPP_SERVER)),
        );
        assert_eq!(out.ns_uri(copied), Some(namespaces::XMPP_SERVER));
        assert!(out
            .find_child(copied, "body", Some(namespaces::XMPP_SERVER))
            .is_some());
        // foreign namespaces ride along untouched
        assert!(out.find_child(copied, "x", Some("jabber:x:oob")).is_some());
    }

    #[test]
    fn xml_lang_uses_reserved_prefix() {
        let mut nad = Nad::with_root("body", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr_ns(root, "lang", "en", namespaces::XML);
        assert_eq!(
            nad.serialize(),
            "<body xmlns=\"jabber:client\" xml:lang=\"en\"/>"
        );
        assert_eq!(nad.attr_val_ns(root, "lang", namespaces::XML), Some("en"));
    }
}
