/*!
# Element trees

[`Element`] is the frozen form of one stanza (or any part of it). It is built
either by the [`StanzaAssembler`](crate::StanzaAssembler) from inbound data
or by application code through [`ElementBuilder`].
*/
use std::fmt;

use bytes::{BufMut, BytesMut};
use smartstring::alias::String as SmartString;

use crate::escape::{escape_attribute, escape_text};

/// Short string used for element and attribute names.
pub type Name = SmartString;

/**
# Immutable XML element

An element has a local name, an optional namespace URI, attributes in
document order (keys are unique), and either child elements or a text
value, never both.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
	pub(crate) name: Name,
	pub(crate) xmlns: Option<String>,
	pub(crate) attributes: Vec<(Name, String)>,
	pub(crate) children: Vec<Element>,
	pub(crate) value: Option<String>,
}

impl Element {
	/// Local name of the element.
	pub fn name(&self) -> &str {
		&self.name
	}

	/// Namespace URI, if any.
	pub fn xmlns(&self) -> Option<&str> {
		self.xmlns.as_deref()
	}

	/// Value of the attribute `name`.
	pub fn attr(&self, name: &str) -> Option<&str> {
		self.attributes
			.iter()
			.find(|(k, _)| k.as_str() == name)
			.map(|(_, v)| v.as_str())
	}

	/// All attributes in document order.
	pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
		self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	pub fn children(&self) -> &[Element] {
		&self.children
	}

	/// Text content of a leaf element.
	pub fn value(&self) -> Option<&str> {
		self.value.as_deref()
	}

	/// First child named `name`.
	pub fn child(&self, name: &str) -> Option<&Element> {
		self.children.iter().find(|c| c.name.as_str() == name)
	}

	/// First child named `name` in namespace `xmlns`.
	pub fn child_ns(&self, name: &str, xmlns: &str) -> Option<&Element> {
		self.children
			.iter()
			.find(|c| c.name.as_str() == name && c.xmlns() == Some(xmlns))
	}

	/// Follow a path of child names, taking the first match at each level.
	pub fn find_child(&self, path: &[&str]) -> Option<&Element> {
		path.iter().try_fold(self, |el, name| el.child(name))
	}

	pub fn id(&self) -> Option<&str> {
		self.attr("id")
	}

	/// The `type` attribute.
	pub fn stanza_type(&self) -> Option<&str> {
		self.attr("type")
	}

	pub fn from(&self) -> Option<&str> {
		self.attr("from")
	}

	pub fn to(&self) -> Option<&str> {
		self.attr("to")
	}

	/// Turn this element back into a builder, e.g. to derive a modified
	/// copy in a filter.
	pub fn into_builder(self) -> ElementBuilder {
		ElementBuilder { element: self }
	}

	/// Serialize the element into `out`.
	pub fn write_to<B: BufMut>(&self, out: &mut B) {
		self.write_with_parent_ns(out, None)
	}

	fn write_with_parent_ns<B: BufMut>(&self, out: &mut B, parent_ns: Option<&str>) {
		out.put_u8(b'<');
		out.put_slice(self.name.as_bytes());
		let ns = self.xmlns();
		if let Some(uri) = ns {
			if ns != parent_ns {
				out.put_slice(b" xmlns=\"");
				escape_attribute(out, uri);
				out.put_u8(b'"');
			}
		}
		for (k, v) in self.attributes.iter() {
			out.put_u8(b' ');
			out.put_slice(k.as_bytes());
			out.put_slice(b"=\"");
			escape_attribute(out, v);
			out.put_u8(b'"');
		}
		if self.children.is_empty() && self.value.is_none() {
			out.put_slice(b"/>");
			return;
		}
		out.put_u8(b'>');
		if let Some(v) = self.value.as_deref() {
			escape_text(out, v);
		}
		let inherited = ns.or(parent_ns);
		for child in self.children.iter() {
			child.write_with_parent_ns(out, inherited);
		}
		out.put_slice(b"</");
		out.put_slice(self.name.as_bytes());
		out.put_u8(b'>');
	}

	/// Serialize the element into a new String.
	pub fn to_xml(&self) -> String {
		let mut buf = BytesMut::with_capacity(128);
		self.write_to(&mut buf);
		// names, attribute values and text are valid UTF-8 and escaping only
		// inserts ASCII
		String::from_utf8(buf.to_vec()).unwrap_or_default()
	}
}

impl fmt::Display for Element {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_xml())
	}
}

/**
# Fluent construction of elements

```
use rxmpp::ElementBuilder;

let iq = ElementBuilder::new("iq")
	.attr("type", "get")
	.attr("id", "q1")
	.child(ElementBuilder::new("query").xmlns("jabber:iq:version").build())
	.build();
assert_eq!(
	iq.to_xml(),
	"<iq type=\"get\" id=\"q1\"><query xmlns=\"jabber:iq:version\"/></iq>"
);
```
*/
#[derive(Debug, Clone)]
pub struct ElementBuilder {
	element: Element,
}

impl ElementBuilder {
	pub fn new<N: Into<Name>>(name: N) -> Self {
		Self {
			element: Element {
				name: name.into(),
				xmlns: None,
				attributes: Vec::new(),
				children: Vec::new(),
				value: None,
			},
		}
	}

	pub fn xmlns<S: Into<String>>(mut self, xmlns: S) -> Self {
		self.element.xmlns = Some(xmlns.into());
		self
	}

	/// Set an attribute, replacing an existing one of the same name.
	///
	/// `xmlns` sets the namespace, as [`xmlns`](Self::xmlns) does.
	pub fn attr<N: Into<Name>, V: Into<String>>(mut self, name: N, value: V) -> Self {
		let name = name.into();
		let value = value.into();
		if name.as_str() == "xmlns" {
			self.element.xmlns = Some(value);
			return self;
		}
		match self.element.attributes.iter_mut().find(|(k, _)| *k == name) {
			Some((_, v)) => *v = value,
			None => self.element.attributes.push((name, value)),
		}
		self
	}

	/// Remove an attribute if present.
	pub fn remove_attr(mut self, name: &str) -> Self {
		if name == "xmlns" {
			self.element.xmlns = None;
		}
		self.element.attributes.retain(|(k, _)| k.as_str() != name);
		self
	}

	/// Append a child. Drops any text value.
	pub fn child(mut self, child: Element) -> Self {
		self.element.value = None;
		self.element.children.push(child);
		self
	}

	/// Set the text value. Drops any children.
	pub fn value<S: Into<String>>(mut self, value: S) -> Self {
		self.element.children.clear();
		self.element.value = Some(value.into());
		self
	}

	pub fn build(self) -> Element {
		self.element
	}
}
