#[macro_use]
extern crate afl;

use rxmpp::{StreamEvent, StreamParser};

fn parse_chunked(chunks: &[&[u8]]) -> Vec<StreamEvent> {
	let mut parser = StreamParser::new();
	let mut events = Vec::new();
	for chunk in chunks {
		events.extend(parser.parse(chunk));
	}
	events
}

fn main() {
	fuzz!(|data: &[u8]| {
		// NUL separates chunks; it is never valid XML content
		let chunks: Vec<&[u8]> = data.split(|b| *b == b'\0').collect();
		let chunked = parse_chunked(&chunks);
		let buf = chunks.concat();
		let whole = parse_chunked(&[&buf]);
		if chunked != whole {
			panic!("events depend on chunking: {:?} != {:?}", chunked, whole)
		}
		for ev in whole {
			if let StreamEvent::Element(el) = ev {
				let reparsed = rxmpp::parse_element(&el.to_xml()).expect("serialized stanza must parse");
				assert_eq!(reparsed.name(), el.name());
			}
		}
	});
}
