/*!
# Stream management acknowledgements

Bookkeeping for the acknowledgement part of XEP-0198: counting handled
stanzas in both directions, answering `<r/>` with `<a h='..'/>`, and
holding written requests back from being marked as sent until the peer
has acknowledged them. Resumption is not supported.
*/
use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::element::{Element, ElementBuilder};
use crate::request::Request;

pub const XMLNS_SM: &str = "urn:xmpp:sm:3";

/// Acknowledgement state of one session.
#[derive(Debug, Default)]
pub struct AckState {
	enabled: bool,
	id: Option<String>,
	outgoing_h: u32,
	incoming_h: u32,
	incoming_h_sent: u32,
	// one entry per counted outgoing stanza, oldest first
	unacked: VecDeque<Option<Request>>,
}

impl AckState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled
	}

	/// Stream id given by the peer in `<enabled/>`.
	pub fn id(&self) -> Option<&str> {
		self.id.as_deref()
	}

	pub fn incoming_h(&self) -> u32 {
		self.incoming_h
	}

	pub fn outgoing_h(&self) -> u32 {
		self.outgoing_h
	}

	/// Number of written stanzas not yet acknowledged.
	pub fn unacked(&self) -> usize {
		self.unacked.len()
	}

	/// Forget everything, e.g. on a new session. Held requests are returned.
	pub fn reset(&mut self) -> Vec<Request> {
		let held = self.unacked.drain(..).flatten().collect();
		*self = Self::default();
		held
	}

	pub fn enable_element() -> Element {
		ElementBuilder::new("enable")
			.xmlns(XMLNS_SM)
			.attr("resume", "false")
			.build()
	}

	pub fn request_element() -> Element {
		ElementBuilder::new("r").xmlns(XMLNS_SM).build()
	}

	/// `<a h='..'/>` for the current inbound count.
	///
	/// Unless `force` is set, nothing is produced if the count has not
	/// changed since the last acknowledgement.
	pub fn ack_element(&mut self, force: bool) -> Option<Element> {
		if !force && self.incoming_h == self.incoming_h_sent {
			return None;
		}
		self.incoming_h_sent = self.incoming_h;
		Some(
			ElementBuilder::new("a")
				.xmlns(XMLNS_SM)
				.attr("h", self.incoming_h.to_string())
				.build(),
		)
	}

	pub fn process_enabled(&mut self, element: &Element) {
		self.enabled = true;
		self.id = element.attr("id").map(str::to_string);
		self.outgoing_h = 0;
		self.incoming_h = 0;
		self.incoming_h_sent = 0;
		debug!(id = self.id(), "stream management enabled");
	}

	pub fn on_received(&mut self, element: &Element) {
		if !self.enabled || element.xmlns() == Some(XMLNS_SM) {
			return;
		}
		self.incoming_h = self.incoming_h.wrapping_add(1);
	}

	/// Count a written stanza. Returns false if it was not counted, in which
	/// case its request should be marked as sent right away.
	pub fn on_sent(&mut self, element: &Element, request: Option<Request>) -> bool {
		if !self.enabled || element.xmlns() == Some(XMLNS_SM) {
			return false;
		}
		self.outgoing_h = self.outgoing_h.wrapping_add(1);
		self.unacked.push_back(request);
		true
	}

	/// Handle `<a h='..'/>`. Returns the requests which are now known to
	/// have been received by the peer.
	pub fn process_ack(&mut self, element: &Element) -> Vec<Request> {
		let h = match element.attr("h").and_then(|h| h.parse::<u32>().ok()) {
			Some(h) => h,
			None => {
				debug!("acknowledgement without valid h");
				return Vec::new();
			}
		};
		let left = self.outgoing_h.wrapping_sub(h) as usize;
		trace!(expected = self.outgoing_h, received = h, "acknowledgement");
		if left > self.unacked.len() {
			return Vec::new();
		}
		let acked = self.unacked.len() - left;
		self.unacked.drain(..acked).flatten().collect()
	}
}
