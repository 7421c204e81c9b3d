/*!
# Stanza errors

Defined conditions of RFC 6120 § 8.3.3, how to read them out of an error
reply and how to build an error reply for a stanza we cannot handle.
*/
use std::fmt;

use crate::element::{Element, ElementBuilder};

pub const XMLNS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// `type` attribute of an `<error/>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
	Auth,
	Cancel,
	Continue,
	Modify,
	Wait,
}

impl ErrorType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Auth => "auth",
			Self::Cancel => "cancel",
			Self::Continue => "continue",
			Self::Modify => "modify",
			Self::Wait => "wait",
		}
	}
}

macro_rules! conditions {
	($($variant:ident => ($name:literal, $type:ident, $code:expr),)*) => {
		/// Defined stanza error condition.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum ErrorCondition {
			$($variant,)*
		}

		impl ErrorCondition {
			/// Name of the condition element.
			pub fn element_name(self) -> &'static str {
				match self {
					$(Self::$variant => $name,)*
				}
			}

			/// Default error type for the condition.
			pub fn error_type(self) -> ErrorType {
				match self {
					$(Self::$variant => ErrorType::$type,)*
				}
			}

			/// Legacy numeric code, if the condition has one.
			pub fn code(self) -> Option<u16> {
				match self {
					$(Self::$variant => $code,)*
				}
			}

			/// Look a condition up by its element name.
			pub fn from_element_name(name: &str) -> Option<Self> {
				match name {
					$($name => Some(Self::$variant),)*
					_ => None,
				}
			}
		}
	};
}

conditions! {
	BadRequest => ("bad-request", Modify, Some(400)),
	Conflict => ("conflict", Cancel, Some(409)),
	FeatureNotImplemented => ("feature-not-implemented", Cancel, Some(501)),
	Forbidden => ("forbidden", Auth, Some(403)),
	Gone => ("gone", Modify, Some(302)),
	InternalServerError => ("internal-server-error", Wait, Some(500)),
	ItemNotFound => ("item-not-found", Cancel, Some(404)),
	JidMalformed => ("jid-malformed", Modify, Some(400)),
	NotAcceptable => ("not-acceptable", Modify, Some(406)),
	NotAllowed => ("not-allowed", Cancel, Some(405)),
	NotAuthorized => ("not-authorized", Auth, Some(401)),
	PaymentRequired => ("payment-required", Auth, Some(402)),
	PolicyViolation => ("policy-violation", Modify, None),
	RecipientUnavailable => ("recipient-unavailable", Wait, Some(404)),
	Redirect => ("redirect", Modify, Some(302)),
	RegistrationRequired => ("registration-required", Auth, Some(407)),
	RemoteServerNotFound => ("remote-server-not-found", Cancel, Some(404)),
	RemoteServerTimeout => ("remote-server-timeout", Wait, Some(504)),
	ResourceConstraint => ("resource-constraint", Wait, Some(500)),
	ServiceUnavailable => ("service-unavailable", Cancel, Some(503)),
	SubscriptionRequired => ("subscription-required", Auth, Some(407)),
	UndefinedCondition => ("undefined-condition", Cancel, Some(500)),
	UnexpectedRequest => ("unexpected-request", Wait, Some(400)),
}

impl fmt::Display for ErrorCondition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.element_name())
	}
}

/// Read the condition and descriptive text from an error reply.
///
/// Returns `None` if the stanza is not of type `error`. A missing or
/// unknown condition is reported as `undefined-condition`.
pub fn parse_stanza_error(stanza: &Element) -> Option<(ErrorCondition, Option<String>)> {
	if stanza.stanza_type() != Some("error") {
		return None;
	}
	let error = match stanza.child("error") {
		Some(e) => e,
		None => return Some((ErrorCondition::UndefinedCondition, None)),
	};
	let condition = error
		.children()
		.iter()
		.filter(|c| c.xmlns() == Some(XMLNS_STANZAS) && c.name() != "text")
		.find_map(|c| ErrorCondition::from_element_name(c.name()))
		.unwrap_or(ErrorCondition::UndefinedCondition);
	let text = error
		.child_ns("text", XMLNS_STANZAS)
		.and_then(|t| t.value())
		.map(str::to_string);
	Some((condition, text))
}

/// Build the error reply to `stanza`.
///
/// Returns `None` for stanzas which must not be answered with an error,
/// i.e. replies of type `error` or `result`.
pub fn error_reply(stanza: &Element, condition: ErrorCondition, text: Option<&str>) -> Option<Element> {
	if matches!(stanza.stanza_type(), Some("error") | Some("result")) {
		return None;
	}
	let mut error = ElementBuilder::new("error").attr("type", condition.error_type().as_str());
	if let Some(code) = condition.code() {
		error = error.attr("code", code.to_string());
	}
	error = error.child(ElementBuilder::new(condition.element_name()).xmlns(XMLNS_STANZAS).build());
	if let Some(text) = text {
		error = error.child(ElementBuilder::new("text").xmlns(XMLNS_STANZAS).value(text).build());
	}
	let mut reply = ElementBuilder::new(stanza.name()).attr("type", "error");
	if let Some(ns) = stanza.xmlns() {
		reply = reply.xmlns(ns);
	}
	if let Some(id) = stanza.id() {
		reply = reply.attr("id", id);
	}
	if let Some(from) = stanza.from() {
		reply = reply.attr("to", from);
	}
	Some(reply.child(error.build()).build())
}
