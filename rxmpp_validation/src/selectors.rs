/*!
# Character classes used by the rxmpp tokenizer

Everything here is an implementation detail of `rxmpp` and may change
without notice.
*/
use std::fmt;

/**
# Predicate over chars
*/
pub trait CharSelector {
	/// Return true if `c` belongs to the class.
	fn select(&self, c: char) -> bool;
}

impl CharSelector for char {
	fn select(&self, c: char) -> bool {
		*self == c
	}
}

impl CharSelector for &'_ [char] {
	fn select(&self, c: char) -> bool {
		self.iter().any(|x| *x == c)
	}
}

/// Inclusive range of codepoints.
///
/// Both ends are included because some of the boundaries are not
/// representable as exclusive `char` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodepointRange(pub char, pub char);

impl CodepointRange {
	pub const fn contains(&self, c: char) -> bool {
		(self.0 as u32) <= (c as u32) && (c as u32) <= (self.1 as u32)
	}
}

impl CharSelector for CodepointRange {
	fn select(&self, c: char) -> bool {
		self.contains(c)
	}
}

/// Characters permitted anywhere in the stream (XML 1.0 § 2.2).
pub const XML_CHAR_RANGES: &[CodepointRange] = &[
	CodepointRange('\x09', '\x0a'),
	CodepointRange('\x0d', '\x0d'),
	CodepointRange('\u{0020}', '\u{d7ff}'),
	CodepointRange('\u{e000}', '\u{fffd}'),
	CodepointRange('\u{10000}', '\u{10ffff}'),
];

const NAME_START_RANGES: &[CodepointRange] = &[
	CodepointRange(':', ':'),
	CodepointRange('A', 'Z'),
	CodepointRange('_', '_'),
	CodepointRange('a', 'z'),
	CodepointRange('\u{c0}', '\u{d6}'),
	CodepointRange('\u{d8}', '\u{f6}'),
	CodepointRange('\u{f8}', '\u{2ff}'),
	CodepointRange('\u{370}', '\u{37d}'),
	CodepointRange('\u{37f}', '\u{1fff}'),
	CodepointRange('\u{200c}', '\u{200d}'),
	CodepointRange('\u{2070}', '\u{218f}'),
	CodepointRange('\u{2c00}', '\u{2fef}'),
	CodepointRange('\u{3001}', '\u{d7ff}'),
	CodepointRange('\u{f900}', '\u{fdcf}'),
	CodepointRange('\u{fdf0}', '\u{fffd}'),
	CodepointRange('\u{10000}', '\u{effff}'),
];

const NAME_EXTRA_RANGES: &[CodepointRange] = &[
	CodepointRange('-', '.'),
	CodepointRange('0', '9'),
	CodepointRange('\u{b7}', '\u{b7}'),
	CodepointRange('\u{300}', '\u{36f}'),
	CodepointRange('\u{203f}', '\u{2040}'),
];

/// A class made of a static list of ranges.
#[derive(Clone, Copy)]
pub struct CodepointRanges(pub &'static [CodepointRange]);

impl CharSelector for CodepointRanges {
	fn select(&self, c: char) -> bool {
		self.0.iter().any(|r| r.contains(c))
	}
}

impl fmt::Debug for CodepointRanges {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CodepointRanges(<{} ranges>)", self.0.len())
	}
}

/// Valid first character of an element or attribute name.
pub static CLASS_NAME_START: CodepointRanges = CodepointRanges(NAME_START_RANGES);

/// Valid stream character.
pub static CLASS_XML_CHAR: CodepointRanges = CodepointRanges(XML_CHAR_RANGES);

/// Valid non-first character of a name.
#[derive(Debug, Clone, Copy)]
pub struct NameChar;

impl CharSelector for NameChar {
	fn select(&self, c: char) -> bool {
		CLASS_NAME_START.select(c) || NAME_EXTRA_RANGES.iter().any(|r| r.contains(c))
	}
}

pub static CLASS_NAME: NameChar = NameChar;
