/*!
# Incremental stream tokenizer

The tokenizer turns bytes into lexical callbacks on a [`TokenHandler`]. It
is restartable at any byte: everything it has buffered lives in a
[`TokenizerState`] value which the caller threads from one call of
[`Tokenizer::parse`] into the next.

It knows nothing about namespaces or stanzas; see
[`StanzaAssembler`](crate::StanzaAssembler) for that.
*/
use std::mem;

use rxmpp_validation::{is_name_char, is_name_start_char, is_xml_char};

use crate::error::{XmlError, ERRCTX_ATTNAME, ERRCTX_ATTVAL, ERRCTX_CLOSE, ERRCTX_ELEMENT, ERRCTX_NAME};
use crate::escape::{resolve_entity, MAX_ENTITY_LEN};

mod utf8;

use utf8::Utf8Decoder;

/// Receiver of lexical events.
pub trait TokenHandler {
	/// A start tag has been read completely.
	fn start_element(&mut self, name: &str, attributes: Vec<(String, String)>);

	/// A close tag (or the end of a self-closing tag) has been read.
	///
	/// Return false if `name` does not close the innermost open element. The
	/// tokenizer treats that as a fatal error.
	fn end_element(&mut self, name: &str) -> bool;

	/// A run of text between two tags, entities already decoded.
	fn character_data(&mut self, text: &str);

	/// Markup starting with `<?` or `<!`, without the angle brackets.
	fn other_markup(&mut self, _text: &str) {}

	/// The stream is broken. Called once; no further callbacks follow.
	fn error(&mut self, error: &XmlError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
	Single,
	Double,
}

impl Quote {
	fn char(self) -> char {
		match self {
			Self::Single => '\'',
			Self::Double => '"',
		}
	}
}

/// Position of the automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	/// Skipping everything up to the next `<`.
	Start,
	OpenBracket,
	ElementName,
	/// Inside a start tag, between attributes.
	EndElementName,
	AttribName,
	/// Between an attribute name and the opening quote of its value.
	EndOfAttrName,
	AttribValue(Quote),
	/// Text between tags.
	ElementCData,
	OtherMarkup,
	Entity,
	CloseElement,
	Error,
}

/**
Saved position of a tokenizer.

This is an opaque value. Obtain a fresh one with `Default`, pass it to
[`Tokenizer::parse`] and keep the returned value for the next chunk.
*/
#[derive(Debug, Clone)]
pub struct TokenizerState {
	state: State,
	utf8: Utf8Decoder,
	name: String,
	attr_name: String,
	attr_value: String,
	attributes: Vec<(String, String)>,
	cdata: String,
	entity: String,
	entity_parent: State,
	// `/` seen in a start tag
	slash: bool,
	// `=` seen after an attribute name
	eq: bool,
	// whitespace seen after the name in a close tag
	close_ws: bool,
	error: Option<XmlError>,
}

impl Default for TokenizerState {
	fn default() -> Self {
		Self {
			state: State::Start,
			utf8: Utf8Decoder::default(),
			name: String::new(),
			attr_name: String::new(),
			attr_value: String::new(),
			attributes: Vec::new(),
			cdata: String::new(),
			entity: String::new(),
			entity_parent: State::Start,
			slash: false,
			eq: false,
			close_ws: false,
			error: None,
		}
	}
}

impl TokenizerState {
	pub fn state(&self) -> State {
		self.state
	}

	pub fn is_error(&self) -> bool {
		self.state == State::Error
	}

	/// The error which stopped the tokenizer, if any.
	pub fn error(&self) -> Option<&XmlError> {
		self.error.as_ref()
	}

	fn fail(&mut self, err: XmlError) {
		*self = Self {
			state: State::Error,
			error: Some(err),
			..Self::default()
		};
	}
}

/// Resource limits of a [`Tokenizer`].
///
/// Exceeding any of them is a fatal error for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOptions {
	/// Maximum length of an element name in bytes.
	pub max_element_name: usize,
	/// Maximum length of an attribute name in bytes.
	pub max_attribute_name: usize,
	/// Maximum length of a decoded attribute value in bytes.
	pub max_attribute_value: usize,
	/// Maximum length of a decoded text run (or of other markup) in bytes.
	pub max_cdata: usize,
	/// Maximum number of attributes on one element.
	pub max_attributes: usize,
}

impl TokenizerOptions {
	/// Set [`TokenizerOptions::max_element_name`].
	pub fn max_element_name(mut self, v: usize) -> Self {
		self.max_element_name = v;
		self
	}

	/// Set [`TokenizerOptions::max_attribute_name`].
	pub fn max_attribute_name(mut self, v: usize) -> Self {
		self.max_attribute_name = v;
		self
	}

	/// Set [`TokenizerOptions::max_attribute_value`].
	pub fn max_attribute_value(mut self, v: usize) -> Self {
		self.max_attribute_value = v;
		self
	}

	/// Set [`TokenizerOptions::max_cdata`].
	///
	/// # Example
	///
	/// ```
	/// use rxmpp::{Tokenizer, TokenizerOptions};
	/// let tokenizer = Tokenizer::with_options(TokenizerOptions::default().max_cdata(64 * 1024));
	/// ```
	pub fn max_cdata(mut self, v: usize) -> Self {
		self.max_cdata = v;
		self
	}

	/// Set [`TokenizerOptions::max_attributes`].
	pub fn max_attributes(mut self, v: usize) -> Self {
		self.max_attributes = v;
		self
	}
}

impl Default for TokenizerOptions {
	fn default() -> Self {
		Self {
			max_element_name: 1024,
			max_attribute_name: 1024,
			max_attribute_value: 10 * 1024,
			max_cdata: 1024 * 1024,
			max_attributes: 50,
		}
	}
}

fn is_ws(ch: char) -> bool {
	matches!(ch, ' ' | '\t' | '\n' | '\r')
}

fn push_limited(buf: &mut String, ch: char, limit: usize, err: fn(usize) -> XmlError) -> Result<(), XmlError> {
	buf.push(ch);
	if buf.len() > limit {
		return Err(err(limit));
	}
	Ok(())
}

/**
# Restartable XML tokenizer

The tokenizer itself only holds its [`TokenizerOptions`]; it can be shared
between any number of streams.

```
use rxmpp::{Tokenizer, TokenizerState, TokenHandler, XmlError};

#[derive(Default)]
struct Names(Vec<String>);

impl TokenHandler for Names {
	fn start_element(&mut self, name: &str, _attributes: Vec<(String, String)>) {
		self.0.push(name.to_string());
	}
	fn end_element(&mut self, _name: &str) -> bool { true }
	fn character_data(&mut self, _text: &str) {}
	fn error(&mut self, _error: &XmlError) {}
}

let tokenizer = Tokenizer::new();
let mut names = Names::default();
let state = tokenizer.parse(TokenizerState::default(), &mut names, b"<presence><sho");
let state = tokenizer.parse(state, &mut names, b"w>away</show></presence>");
assert_eq!(names.0, vec!["presence", "show"]);
assert!(!state.is_error());
```
*/
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
	opts: TokenizerOptions,
}

impl Tokenizer {
	/// Create a tokenizer with default limits.
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_options(opts: TokenizerOptions) -> Self {
		Self { opts }
	}

	pub fn options(&self) -> &TokenizerOptions {
		&self.opts
	}

	/// Consume `chunk`, reporting every complete lexical unit to `handler`.
	///
	/// Returns the state to pass to the next call. If the stream turns out
	/// to be malformed, [`TokenHandler::error`] is invoked once and the
	/// returned state is an error state; parsing with an error state is a
	/// no-op.
	pub fn parse<H: TokenHandler + ?Sized>(
		&self,
		mut st: TokenizerState,
		handler: &mut H,
		chunk: &[u8],
	) -> TokenizerState {
		if st.is_error() {
			return st;
		}
		for b in chunk.iter() {
			let result = match st.utf8.push(*b) {
				Ok(None) => continue,
				Ok(Some(ch)) if !is_xml_char(ch) => Err(XmlError::InvalidChar(ch as u32)),
				Ok(Some(ch)) => self.step(&mut st, handler, ch),
				Err(e) => Err(e),
			};
			if let Err(e) = result {
				handler.error(&e);
				st.fail(e);
				break;
			}
		}
		st
	}

	/// Convenience wrapper around [`Tokenizer::parse`] for text input.
	pub fn parse_str<H: TokenHandler + ?Sized>(
		&self,
		st: TokenizerState,
		handler: &mut H,
		chunk: &str,
	) -> TokenizerState {
		self.parse(st, handler, chunk.as_bytes())
	}

	fn step<H: TokenHandler + ?Sized>(
		&self,
		st: &mut TokenizerState,
		handler: &mut H,
		ch: char,
	) -> Result<(), XmlError> {
		match st.state {
			State::Start => {
				if ch == '<' {
					st.state = State::OpenBracket;
					st.slash = false;
				}
			}
			State::OpenBracket => match ch {
				'?' | '!' => {
					st.cdata.clear();
					st.cdata.push(ch);
					st.state = State::OtherMarkup;
				}
				'/' => {
					st.name.clear();
					st.close_ws = false;
					st.state = State::CloseElement;
				}
				c if is_ws(c) => (),
				c if is_name_start_char(c) => {
					st.name.clear();
					st.name.push(c);
					st.state = State::ElementName;
				}
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_NAME,
					})
				}
			},
			State::ElementName => match ch {
				c if is_ws(c) => st.state = State::EndElementName,
				'/' => {
					st.slash = true;
					st.state = State::EndElementName;
				}
				'>' => self.finish_start_tag(st, handler)?,
				c if is_name_char(c) => {
					push_limited(&mut st.name, c, self.opts.max_element_name, XmlError::ElementNameTooLong)?
				}
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_NAME,
					})
				}
			},
			State::EndElementName => match ch {
				'>' => self.finish_start_tag(st, handler)?,
				c if st.slash => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_ELEMENT,
					})
				}
				'/' => st.slash = true,
				c if is_ws(c) => (),
				c if is_name_start_char(c) => {
					if st.attributes.len() >= self.opts.max_attributes {
						return Err(XmlError::TooManyAttributes(self.opts.max_attributes));
					}
					st.attr_name.clear();
					st.attr_name.push(c);
					st.state = State::AttribName;
				}
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_ELEMENT,
					})
				}
			},
			State::AttribName => match ch {
				c if is_ws(c) => {
					st.eq = false;
					st.state = State::EndOfAttrName;
				}
				'=' => {
					st.eq = true;
					st.state = State::EndOfAttrName;
				}
				c if is_name_char(c) => push_limited(
					&mut st.attr_name,
					c,
					self.opts.max_attribute_name,
					XmlError::AttributeNameTooLong,
				)?,
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_ATTNAME,
					})
				}
			},
			State::EndOfAttrName => match ch {
				c if is_ws(c) => (),
				'=' if !st.eq => st.eq = true,
				'\'' if st.eq => self.begin_value(st, Quote::Single),
				'"' if st.eq => self.begin_value(st, Quote::Double),
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_ATTNAME,
					})
				}
			},
			State::AttribValue(q) => match ch {
				c if c == q.char() => {
					let name = mem::take(&mut st.attr_name);
					if st.attributes.iter().any(|(k, _)| *k == name) {
						return Err(XmlError::DuplicateAttribute(name));
					}
					let value = mem::take(&mut st.attr_value);
					st.attributes.push((name, value));
					st.state = State::EndElementName;
				}
				'&' => self.begin_entity(st),
				'<' => {
					return Err(XmlError::UnexpectedChar {
						ch: '<',
						ctx: ERRCTX_ATTVAL,
					})
				}
				c => push_limited(
					&mut st.attr_value,
					c,
					self.opts.max_attribute_value,
					XmlError::AttributeValueTooLong,
				)?,
			},
			State::ElementCData => match ch {
				'<' => {
					if !st.cdata.is_empty() {
						handler.character_data(&st.cdata);
						st.cdata.clear();
					}
					st.slash = false;
					st.state = State::OpenBracket;
				}
				'&' => self.begin_entity(st),
				c => push_limited(&mut st.cdata, c, self.opts.max_cdata, XmlError::CDataTooLong)?,
			},
			State::Entity => match ch {
				';' => {
					let decoded = resolve_entity(&st.entity)?;
					st.entity.clear();
					st.state = st.entity_parent;
					match st.entity_parent {
						State::AttribValue(_) => push_limited(
							&mut st.attr_value,
							decoded,
							self.opts.max_attribute_value,
							XmlError::AttributeValueTooLong,
						)?,
						_ => push_limited(&mut st.cdata, decoded, self.opts.max_cdata, XmlError::CDataTooLong)?,
					}
				}
				c if (c.is_ascii_alphanumeric() || c == '#') && st.entity.len() < MAX_ENTITY_LEN => {
					st.entity.push(c)
				}
				c => {
					let mut body = mem::take(&mut st.entity);
					body.push(c);
					return Err(XmlError::InvalidEntity(body));
				}
			},
			State::OtherMarkup => match ch {
				'>' => {
					handler.other_markup(&st.cdata);
					st.cdata.clear();
					st.state = State::Start;
				}
				c => push_limited(&mut st.cdata, c, self.opts.max_cdata, XmlError::CDataTooLong)?,
			},
			State::CloseElement => match ch {
				c if is_ws(c) => {
					if !st.name.is_empty() {
						st.close_ws = true;
					}
				}
				'>' if !st.name.is_empty() => {
					let name = mem::take(&mut st.name);
					if !handler.end_element(&name) {
						return Err(XmlError::UnbalancedClose(name));
					}
					st.state = State::ElementCData;
				}
				c if !st.close_ws
					&& (is_name_char(c) && !st.name.is_empty() || is_name_start_char(c)) =>
				{
					push_limited(&mut st.name, c, self.opts.max_element_name, XmlError::ElementNameTooLong)?
				}
				c => {
					return Err(XmlError::UnexpectedChar {
						ch: c,
						ctx: ERRCTX_CLOSE,
					})
				}
			},
			// parse() returns early for errored states
			State::Error => (),
		}
		Ok(())
	}

	fn begin_value(&self, st: &mut TokenizerState, q: Quote) {
		st.attr_value.clear();
		st.state = State::AttribValue(q);
	}

	fn begin_entity(&self, st: &mut TokenizerState) {
		st.entity.clear();
		st.entity_parent = st.state;
		st.state = State::Entity;
	}

	fn finish_start_tag<H: TokenHandler + ?Sized>(
		&self,
		st: &mut TokenizerState,
		handler: &mut H,
	) -> Result<(), XmlError> {
		let name = mem::take(&mut st.name);
		handler.start_element(&name, mem::take(&mut st.attributes));
		if st.slash && !handler.end_element(&name) {
			return Err(XmlError::UnbalancedClose(name));
		}
		st.slash = false;
		st.state = State::ElementCData;
		Ok(())
	}
}
