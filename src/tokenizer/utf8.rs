use crate::error::XmlError;

/// Incremental UTF-8 decoder.
///
/// Holds at most one incomplete sequence, so a multi-byte character may be
/// split over any number of chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Utf8Decoder {
	acc: u32,
	// continuation bytes still expected
	need: u8,
	// total length of the sequence in progress
	len: u8,
}

impl Utf8Decoder {
	/// True if a multi-byte sequence has been started but not finished.
	pub fn is_pending(&self) -> bool {
		self.need > 0
	}

	/// Push one byte. Returns the completed char, if any.
	pub fn push(&mut self, b: u8) -> Result<Option<char>, XmlError> {
		if self.need == 0 {
			return match b {
				0x00..=0x7f => Ok(Some(b as char)),
				0xc2..=0xdf => self.begin(b & 0x1f, 2),
				0xe0..=0xef => self.begin(b & 0x0f, 3),
				0xf0..=0xf4 => self.begin(b & 0x07, 4),
				_ => Err(XmlError::InvalidUtf8(b)),
			};
		}
		if b & 0xc0 != 0x80 {
			*self = Self::default();
			return Err(XmlError::InvalidUtf8(b));
		}
		self.acc = (self.acc << 6) | (b & 0x3f) as u32;
		self.need -= 1;
		if self.need > 0 {
			return Ok(None);
		}
		let (cp, len) = (self.acc, self.len);
		*self = Self::default();
		let min = match len {
			2 => 0x80,
			3 => 0x800,
			_ => 0x10000,
		};
		if cp < min {
			// overlong form
			return Err(XmlError::InvalidChar(cp));
		}
		match std::char::from_u32(cp) {
			Some(ch) => Ok(Some(ch)),
			// surrogate halves and values above U+10FFFF
			None => Err(XmlError::InvalidChar(cp)),
		}
	}

	fn begin(&mut self, bits: u8, len: u8) -> Result<Option<char>, XmlError> {
		self.acc = bits as u32;
		self.len = len;
		self.need = len - 1;
		Ok(None)
	}
}
