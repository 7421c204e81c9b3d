/*!
# Entity handling

The five predefined entities plus decimal and hexadecimal character
references. The tokenizer resolves entity bodies with [`resolve_entity`];
serialization escapes with [`escape_text`] and [`escape_attribute`].
*/
use bytes::BufMut;

use crate::error::XmlError;

const TEXT_SPECIALS: &[u8] = &[b'<', b'>', b'&'];

const ATTR_SPECIALS: &[u8] = &[b'"', b'\'', b'<', b'>', b'&'];

/// Longest entity body accepted between `&` and `;`.
pub(crate) const MAX_ENTITY_LEN: usize = 10;

fn escape<B: BufMut>(out: &mut B, data: &[u8], specials: &'static [u8]) {
	let mut last = 0;
	for (i, ch) in data.iter().enumerate() {
		let replacement: &[u8] = match *ch {
			c if !specials.contains(&c) => continue,
			b'"' => b"&quot;",
			b'\'' => b"&apos;",
			b'<' => b"&lt;",
			b'>' => b"&gt;",
			_ => b"&amp;",
		};
		out.put_slice(&data[last..i]);
		out.put_slice(replacement);
		last = i + 1;
	}
	out.put_slice(&data[last..]);
}

/// Escape character data for use between tags.
pub fn escape_text<B: BufMut>(out: &mut B, data: &str) {
	escape(out, data.as_bytes(), TEXT_SPECIALS)
}

/// Escape an attribute value. Both quote styles are escaped.
pub fn escape_attribute<B: BufMut>(out: &mut B, data: &str) {
	escape(out, data.as_bytes(), ATTR_SPECIALS)
}

/// Escape character data into a new String.
pub fn escape_str(data: &str) -> String {
	let mut out = Vec::with_capacity(data.len());
	escape_text(&mut out, data);
	// only ASCII sequences were spliced between valid UTF-8 runs
	String::from_utf8(out).unwrap_or_default()
}

/// Resolve the body of an entity (the part between `&` and `;`).
pub fn resolve_entity(body: &str) -> Result<char, XmlError> {
	let invalid = || XmlError::InvalidEntity(body.to_string());
	let cp = match body {
		"amp" => return Ok('&'),
		"lt" => return Ok('<'),
		"gt" => return Ok('>'),
		"quot" => return Ok('"'),
		"apos" => return Ok('\''),
		_ => match body.strip_prefix('#') {
			None => return Err(invalid()),
			Some(num) => match num.strip_prefix('x') {
				Some(hex) if !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit()) => {
					u32::from_str_radix(hex, 16).map_err(|_| invalid())?
				}
				None if !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) => {
					num.parse::<u32>().map_err(|_| invalid())?
				}
				_ => return Err(invalid()),
			},
		},
	};
	match std::char::from_u32(cp) {
		Some(ch) if rxmpp_validation::is_xml_char(ch) => Ok(ch),
		_ => Err(XmlError::InvalidChar(cp)),
	}
}

/// Decode all entities in `data`.
pub fn unescape(data: &str) -> Result<String, XmlError> {
	let mut out = String::with_capacity(data.len());
	let mut rest = data;
	while let Some(amp) = rest.find('&') {
		out.push_str(&rest[..amp]);
		let tail = &rest[amp + 1..];
		let end = match tail.find(';') {
			Some(end) if end <= MAX_ENTITY_LEN => end,
			_ => {
				let body: String = tail.chars().take(MAX_ENTITY_LEN).collect();
				return Err(XmlError::InvalidEntity(body));
			}
		};
		out.push(resolve_entity(&tail[..end])?);
		rest = &tail[end + 1..];
	}
	out.push_str(rest);
	Ok(out)
}
