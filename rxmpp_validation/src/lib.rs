/*!
# Validators for XML names and character data

Supplementary crate for `rxmpp`. The tokenizer consults the classes in
[`selectors`] for every character; the free functions here validate whole
strings, e.g. before they are put on the wire.
*/
use std::fmt;

pub mod selectors;

use selectors::CharSelector;

/**
Reason why a string failed validation.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// A name was empty.
	EmptyName,
	/// A character is not permitted at its position.
	InvalidChar(char),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::EmptyName => f.write_str("names must not be empty"),
			Self::InvalidChar(c) => write!(f, "character U+{:04x} is not allowed", *c as u32),
		}
	}
}

impl std::error::Error for Error {}

/// Return true if `c` may appear anywhere in an XML stream.
#[inline]
pub fn is_xml_char(c: char) -> bool {
	selectors::CLASS_XML_CHAR.select(c)
}

/// Return true if `c` may start an element or attribute name.
#[inline]
pub fn is_name_start_char(c: char) -> bool {
	selectors::CLASS_NAME_START.select(c)
}

/// Return true if `c` may continue an element or attribute name.
#[inline]
pub fn is_name_char(c: char) -> bool {
	selectors::CLASS_NAME.select(c)
}

/**
Check whether a str is a valid element or attribute name.

Prefixed names (`stream:features`) are valid; namespace resolution is not
the concern of this crate.

# Example

```rust
use rxmpp_validation::{validate_name, Error};

assert!(validate_name("iq").is_ok());
assert!(validate_name("stream:stream").is_ok());
assert_eq!(validate_name("a b"), Err(Error::InvalidChar(' ')));
assert_eq!(validate_name(""), Err(Error::EmptyName));
```
*/
pub fn validate_name(s: &str) -> Result<(), Error> {
	let mut chars = s.chars();
	match chars.next() {
		None => return Err(Error::EmptyName),
		Some(c) if !is_name_start_char(c) => return Err(Error::InvalidChar(c)),
		Some(_) => (),
	}
	match chars.find(|c| !is_name_char(*c)) {
		Some(c) => Err(Error::InvalidChar(c)),
		None => Ok(()),
	}
}

/**
Check whether every character of a str may appear in the stream.

# Example

```rust
use rxmpp_validation::{validate_cdata, Error};

assert!(validate_cdata("hello <world> & all").is_ok());
assert_eq!(validate_cdata("\x07"), Err(Error::InvalidChar('\x07')));
```
*/
pub fn validate_cdata(s: &str) -> Result<(), Error> {
	match s.chars().find(|c| !is_xml_char(*c)) {
		Some(c) => Err(Error::InvalidChar(c)),
		None => Ok(()),
	}
}
