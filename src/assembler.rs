/*!
# Stanza assembly

The [`StanzaAssembler`] sits on top of the [`Tokenizer`] and turns lexical
events into [`StreamEvent`]s: the stream root opening and closing, complete
stanzas (direct children of the root), and fatal parse errors.

[`StreamParser`] bundles a tokenizer, its saved state and an assembler and
is what a connection uses for its inbound bytes.
*/
use std::collections::HashMap;
use std::mem;

use tracing::{trace, warn};

use crate::element::{Element, Name};
use crate::error::{Error, Result, XmlError};
use crate::tokenizer::{TokenHandler, Tokenizer, TokenizerOptions, TokenizerState};

/// Tag of the stream root element.
pub const STREAM_ROOT: &str = "stream:stream";

/// Namespace of the stream root and stream-level elements.
pub const XMLNS_STREAMS: &str = "http://etherx.jabber.org/streams";

const XMLNS_PREFIX: &str = "xmlns:";

/// Output of the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
	/// The stream root was opened, with its attributes in document order.
	StreamOpened(Vec<(String, String)>),
	/// The stream root was closed.
	StreamClosed,
	/// A complete stanza.
	Element(Element),
	/// The inbound data is malformed; the stream is unusable.
	Error(XmlError),
}

struct Frame {
	raw_name: String,
	element: Element,
	// namespace inherited by unprefixed children
	default_ns: Option<String>,
	text: String,
}

impl Frame {
	fn finish(self) -> Element {
		let mut element = self.element;
		if element.children.is_empty() && !self.text.is_empty() {
			element.value = Some(self.text);
		}
		element
	}
}

/**
# Builds stanzas from tokenizer callbacks

Keeps the stream-wide table of `xmlns:prefix` declarations and a stack of
elements under construction. Events are queued until collected with
[`StanzaAssembler::take_events`].
*/
#[derive(Default)]
pub struct StanzaAssembler {
	namespaces: HashMap<String, String>,
	stream_ns: Option<String>,
	stack: Vec<Frame>,
	events: Vec<StreamEvent>,
}

impl StanzaAssembler {
	pub fn new() -> Self {
		Self::default()
	}

	/// Collect the events produced so far.
	pub fn take_events(&mut self) -> Vec<StreamEvent> {
		mem::take(&mut self.events)
	}

	/// Forget all declarations and partial elements, e.g. for a stream
	/// restart.
	pub fn reset(&mut self) {
		self.namespaces.clear();
		self.stream_ns = None;
		self.stack.clear();
		self.events.clear();
	}

	/// Number of currently open elements below the stream root.
	pub fn depth(&self) -> usize {
		self.stack.len()
	}

	fn record_declarations(&mut self, attributes: &[(String, String)]) {
		for (k, v) in attributes.iter() {
			if let Some(prefix) = k.strip_prefix(XMLNS_PREFIX) {
				trace!(prefix, uri = v.as_str(), "namespace prefix declared");
				self.namespaces.insert(prefix.to_string(), v.clone());
			}
		}
	}
}

impl TokenHandler for StanzaAssembler {
	fn start_element(&mut self, name: &str, mut attributes: Vec<(String, String)>) {
		self.record_declarations(&attributes);

		if self.stack.is_empty() && name == STREAM_ROOT {
			trace!("stream opened");
			self.stream_ns = attributes
				.iter()
				.find(|(k, _)| k == "xmlns")
				.map(|(_, v)| v.clone());
			self.events.push(StreamEvent::StreamOpened(attributes));
			return;
		}

		let explicit_ns = attributes
			.iter()
			.position(|(k, _)| k == "xmlns")
			.map(|idx| attributes.remove(idx).1);
		let default_ns = match explicit_ns {
			Some(ns) => Some(ns),
			None => match self.stack.last() {
				Some(parent) => parent.default_ns.clone(),
				None => self.stream_ns.clone(),
			},
		};

		let mut local = name;
		let mut xmlns = default_ns.clone();
		if let Some((prefix, rest)) = name.split_once(':') {
			if let Some(uri) = self.namespaces.get(prefix) {
				local = rest;
				xmlns = Some(uri.clone());
				let decl = format!("{}{}", XMLNS_PREFIX, prefix);
				attributes.retain(|(k, _)| *k != decl);
			}
		}

		let element = Element {
			name: Name::from(local),
			xmlns,
			attributes: attributes
				.into_iter()
				.map(|(k, v)| (Name::from(k), v))
				.collect(),
			children: Vec::new(),
			value: None,
		};
		self.stack.push(Frame {
			raw_name: name.to_string(),
			element,
			default_ns,
			text: String::new(),
		});
	}

	fn end_element(&mut self, name: &str) -> bool {
		let top = match self.stack.last() {
			Some(top) => top,
			None if name == STREAM_ROOT => {
				trace!("stream closed");
				self.events.push(StreamEvent::StreamClosed);
				return true;
			}
			None => return false,
		};
		if top.raw_name != name {
			return false;
		}
		let element = match self.stack.pop() {
			Some(frame) => frame.finish(),
			None => return false,
		};
		match self.stack.last_mut() {
			Some(parent) => parent.element.children.push(element),
			None => {
				trace!(name = element.name(), id = element.id(), "stanza received");
				self.events.push(StreamEvent::Element(element));
			}
		}
		true
	}

	fn character_data(&mut self, text: &str) {
		// text outside of stanzas is whitespace keepalive at best
		if let Some(top) = self.stack.last_mut() {
			top.text.push_str(text);
		}
	}

	fn other_markup(&mut self, text: &str) {
		trace!(markup = text, "ignoring markup");
	}

	fn error(&mut self, error: &XmlError) {
		warn!(%error, "XML content parse error");
		self.stack.clear();
		self.events.push(StreamEvent::Error(error.clone()));
	}
}

/**
# Stateful parser for one inbound stream

```
use rxmpp::{StreamParser, StreamEvent};

let mut parser = StreamParser::new();
let mut events = parser.parse(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><pres");
events.extend(parser.parse(b"ence from='a@b/c'/>"));
assert!(matches!(events[0], StreamEvent::StreamOpened(_)));
match &events[1] {
	StreamEvent::Element(el) => {
		assert_eq!(el.name(), "presence");
		assert_eq!(el.xmlns(), Some("jabber:client"));
	}
	other => panic!("unexpected event: {:?}", other),
}
```
*/
#[derive(Default)]
pub struct StreamParser {
	tokenizer: Tokenizer,
	state: TokenizerState,
	assembler: StanzaAssembler,
}

impl StreamParser {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_options(opts: TokenizerOptions) -> Self {
		Self {
			tokenizer: Tokenizer::with_options(opts),
			..Self::default()
		}
	}

	/// Feed a chunk of bytes and return the events it completed.
	pub fn parse(&mut self, data: &[u8]) -> Vec<StreamEvent> {
		let state = mem::take(&mut self.state);
		self.state = self.tokenizer.parse(state, &mut self.assembler, data);
		self.assembler.take_events()
	}

	/// Feed a chunk of bytes, handing each completed event to `f`.
	pub fn parse_with<F: FnMut(StreamEvent)>(&mut self, data: &[u8], f: F) {
		self.parse(data).into_iter().for_each(f)
	}

	/// True once the stream has been found malformed.
	pub fn is_error(&self) -> bool {
		self.state.is_error()
	}

	/// True if nothing is buffered between two stanzas.
	pub fn is_idle(&self) -> bool {
		self.assembler.depth() == 0
	}

	/// Start over for a new stream on the same connection.
	pub fn reset(&mut self) {
		self.state = TokenizerState::default();
		self.assembler.reset();
	}
}

/// Parse a string holding exactly one element.
///
/// ```
/// let el = rxmpp::parse_element("<iq type='get' id='1'><ping xmlns='urn:xmpp:ping'/></iq>").unwrap();
/// assert_eq!(el.child("ping").and_then(|p| p.xmlns()), Some("urn:xmpp:ping"));
/// ```
pub fn parse_element(s: &str) -> Result<Element> {
	let mut parser = StreamParser::new();
	let mut found = None;
	for ev in parser.parse(s.as_bytes()) {
		match ev {
			StreamEvent::Error(e) => return Err(Error::Xml(e)),
			StreamEvent::Element(el) if found.is_none() => found = Some(el),
			_ => return Err(XmlError::NotSingleElement.into()),
		}
	}
	match found {
		Some(el) if parser.is_idle() => Ok(el),
		_ => Err(XmlError::NotSingleElement.into()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const STREAM_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

	fn elements(events: &[StreamEvent]) -> Vec<&Element> {
		events
			.iter()
			.filter_map(|ev| match ev {
				StreamEvent::Element(el) => Some(el),
				_ => None,
			})
			.collect()
	}

	#[test]
	fn stream_lifecycle() {
		let mut p = StreamParser::new();
		let events = p.parse(STREAM_HEADER.as_bytes());
		match &events[..] {
			[StreamEvent::StreamOpened(attrs)] => {
				assert_eq!(attrs.len(), 4);
				assert!(attrs.contains(&("to".to_string(), "example.com".to_string())));
			}
			other => panic!("unexpected events: {:?}", other),
		}
		let events = p.parse(b"<message to='a@b'><body>hi</body></message></stream:stream>");
		assert_eq!(events.len(), 2);
		assert_eq!(events[1], StreamEvent::StreamClosed);
		let el = elements(&events)[0];
		assert_eq!(el.name(), "message");
		assert_eq!(el.xmlns(), Some("jabber:client"));
		assert_eq!(el.child("body").and_then(|b| b.value()), Some("hi"));
	}

	#[test]
	fn prefixes_are_resolved() {
		let mut p = StreamParser::new();
		p.parse(STREAM_HEADER.as_bytes());
		let events = p.parse(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>");
		let el = elements(&events)[0];
		assert_eq!(el.name(), "features");
		assert_eq!(el.xmlns(), Some(XMLNS_STREAMS));
		let mechs = el.child("mechanisms").unwrap();
		assert_eq!(mechs.xmlns(), Some("urn:ietf:params:xml:ns:xmpp-sasl"));
		assert_eq!(mechs.child("mechanism").unwrap().xmlns(), Some("urn:ietf:params:xml:ns:xmpp-sasl"));
	}

	#[test]
	fn prefix_declared_on_stanza_is_stripped() {
		let el = parse_element("<x:foo xmlns:x='urn:x' a='1'><bar/></x:foo>").unwrap();
		assert_eq!(el.name(), "foo");
		assert_eq!(el.xmlns(), Some("urn:x"));
		assert_eq!(el.attributes().collect::<Vec<_>>(), vec![("a", "1")]);
		// unprefixed children take the default namespace, which is unset here
		assert_eq!(el.child("bar").unwrap().xmlns(), None);
	}

	#[test]
	fn unknown_prefix_keeps_full_name() {
		let el = parse_element("<y:foo/>").unwrap();
		assert_eq!(el.name(), "y:foo");
	}

	#[test]
	fn mixed_content_drops_text() {
		let el = parse_element("<a> <b>x</b> tail </a>").unwrap();
		assert_eq!(el.value(), None);
		assert_eq!(el.children().len(), 1);
		assert_eq!(el.children()[0].value(), Some("x"));
	}

	#[test]
	fn whitespace_between_stanzas_is_ignored() {
		let mut p = StreamParser::new();
		p.parse(STREAM_HEADER.as_bytes());
		let events = p.parse(b" \n <presence/> \t ");
		assert_eq!(elements(&events).len(), 1);
		assert!(p.is_idle());
	}

	#[test]
	fn mismatched_close_is_reported_as_error() {
		let mut p = StreamParser::new();
		p.parse(STREAM_HEADER.as_bytes());
		let events = p.parse(b"<iq><bar></foo>");
		assert_eq!(
			events,
			vec![StreamEvent::Error(XmlError::UnbalancedClose("foo".to_string()))]
		);
		assert!(p.is_error());
		assert!(p.parse(b"<presence/>").is_empty());
	}

	#[test]
	fn stray_close_at_stream_level_is_an_error() {
		let mut p = StreamParser::new();
		p.parse(STREAM_HEADER.as_bytes());
		let events = p.parse(b"</iq>");
		assert!(matches!(events[..], [StreamEvent::Error(XmlError::UnbalancedClose(_))]));
	}

	#[test]
	fn reset_starts_a_new_stream() {
		let mut p = StreamParser::new();
		p.parse(STREAM_HEADER.as_bytes());
		p.parse(b"<iq><partial");
		p.reset();
		let events = p.parse(STREAM_HEADER.as_bytes());
		assert!(matches!(events[..], [StreamEvent::StreamOpened(_)]));
	}

	#[test]
	fn parse_element_rejects_garbage() {
		assert!(parse_element("<a><b></a>").is_err());
		assert!(matches!(parse_element("<a>"), Err(Error::Xml(XmlError::NotSingleElement))));
		assert!(matches!(parse_element("<a/><b/>"), Err(Error::Xml(XmlError::NotSingleElement))));
		assert!(matches!(parse_element(""), Err(Error::Xml(XmlError::NotSingleElement))));
	}
}
