/*!
# Error types

Lexical problems in the inbound byte stream are described by [`XmlError`].
They never escape from the tokenizer as `Err`: the tokenizer hands them to
its [`TokenHandler`](crate::TokenHandler), and the assembler turns them into
[`StreamEvent::Error`](crate::StreamEvent::Error).

Everything the engine can fail with at its public API is an [`Error`].
*/
use thiserror::Error;

use crate::jid::JidError;
use crate::stanza_error::ErrorCondition;

pub const ERRCTX_ATTVAL: &str = "in attribute value";
pub const ERRCTX_ATTNAME: &str = "in attribute name";
pub const ERRCTX_NAME: &str = "in element name";
pub const ERRCTX_CLOSE: &str = "in close element name";
pub const ERRCTX_ELEMENT: &str = "in element header";

/// Fatal lexical error in the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XmlError {
	#[error("Not allowed character U+{0:04X} in XML stream")]
	InvalidChar(u32),

	#[error("Invalid UTF-8 byte 0x{0:02x} in XML stream")]
	InvalidUtf8(u8),

	#[error("Not allowed character '{ch}' {ctx}")]
	UnexpectedChar { ch: char, ctx: &'static str },

	#[error("Invalid XML entity: &{0};")]
	InvalidEntity(String),

	#[error("Max element name size exceeded: {0}")]
	ElementNameTooLong(usize),

	#[error("Max attribute name size exceeded: {0}")]
	AttributeNameTooLong(usize),

	#[error("Max attribute value size exceeded: {0}")]
	AttributeValueTooLong(usize),

	#[error("Max cdata size exceeded: {0}")]
	CDataTooLong(usize),

	#[error("Attributes number limit exceeded: {0}")]
	TooManyAttributes(usize),

	#[error("Duplicate attribute: {0}")]
	DuplicateAttribute(String),

	#[error("Malformed XML: element close found without open for this element: {0}")]
	UnbalancedClose(String),

	#[error("Expected exactly one element")]
	NotSingleElement,
}

/// Error returned by the engine's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Xml(#[from] XmlError),

	#[error("invalid configuration: {0}")]
	Config(String),

	#[error(transparent)]
	Jid(#[from] JidError),

	#[error("no connector attached")]
	NoConnector,

	#[error("connector is not connected")]
	NotConnected,

	#[error("connector failure: {0}")]
	Connector(String),

	#[error("stanza vetoed by filter: {0}")]
	Vetoed(String),

	/// A module refused a stanza with a specific stanza error condition.
	#[error("{condition}")]
	Stanza {
		condition: ErrorCondition,
		text: Option<String>,
	},

	#[error("client has been dropped")]
	ClientGone,
}

impl Error {
	/// Shorthand for a stanza-level refusal without descriptive text.
	pub fn condition(condition: ErrorCondition) -> Self {
		Self::Stanza {
			condition,
			text: None,
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
