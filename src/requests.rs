/*!
# Reply correlation

[`RequestsManager`] keeps the table of live [`Request`]s, keyed by the
outgoing stanza's element name and `id`, and matches incoming stanzas
against it.

A reply correlates with a request if its name and `id` match and its
sender is acceptable:

* if the request had a `to`, the reply's `from` must be exactly that
  address;
* otherwise a reply without `from` is accepted, and so is one whose
  `from` is the bound address in bare or full form, or the bound
  address's domain.
*/
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, trace};

use crate::element::Element;
use crate::executor::Executor;
use crate::jid::Jid;
use crate::request::{lock, Request, RequestError};

type Key = (String, String);

pub struct RequestsManager {
	table: Mutex<HashMap<Key, Request>>,
	bound: Mutex<Option<Jid>>,
	executor: Executor,
}

impl Default for RequestsManager {
	fn default() -> Self {
		Self::new(Executor::default())
	}
}

impl RequestsManager {
	pub fn new(executor: Executor) -> Self {
		Self {
			table: Mutex::new(HashMap::new()),
			bound: Mutex::new(None),
			executor,
		}
	}

	pub fn executor(&self) -> &Executor {
		&self.executor
	}

	/// Address the session is bound to, used for matching replies to
	/// requests without explicit recipient.
	pub fn bound_jid(&self) -> Option<Jid> {
		lock(&self.bound).clone()
	}

	pub fn set_bound_jid(&self, jid: Option<Jid>) {
		*lock(&self.bound) = jid;
	}

	/// Number of live requests.
	pub fn pending(&self) -> usize {
		lock(&self.table).len()
	}

	/// Add `request` to the live table.
	///
	/// Requests which cannot receive a reply are ignored. A live request
	/// under the same key is replaced and timed out.
	pub fn register(&self, request: &Request) {
		if let Some(previous) = self.insert(request) {
			self.complete_all_timeout(vec![previous]);
		}
	}

	/// Like [`register`](Self::register), but hands a replaced request back
	/// instead of timing it out, for callers holding locks of their own.
	pub(crate) fn insert(&self, request: &Request) -> Option<Request> {
		let key = request.key()?;
		trace!(name = key.0.as_str(), id = key.1.as_str(), "registering request");
		let previous = lock(&self.table).insert(key, request.clone());
		if let Some(previous) = previous.as_ref() {
			debug!(name = previous.name(), id = previous.id(), "request replaced by one with the same id");
		}
		previous
	}

	fn verify(&self, request: &Request, from: Option<&str>, bound: Option<&Jid>) -> bool {
		if let Some(target) = request.target() {
			return from == Some(target);
		}
		let from = match from {
			None => return true,
			Some(from) => from,
		};
		let (bound, from) = match (bound, from.parse::<Jid>()) {
			(Some(bound), Ok(from)) => (bound, from),
			_ => return false,
		};
		from.bare() == bound.bare() || (from.is_domain() && from.domain() == bound.domain())
	}

	/// Complete the request `element` replies to, if there is one.
	///
	/// The request is removed from the table and completed through the
	/// executor. Returns whether a request matched.
	pub fn find_and_dispatch(&self, element: &Element) -> bool {
		let id = match element.id() {
			Some(id) => id,
			None => return false,
		};
		if element.name() == "iq" && !matches!(element.stanza_type(), Some("result") | Some("error")) {
			return false;
		}
		let key = (element.name().to_string(), id.to_string());
		let bound = self.bound_jid();
		let request = {
			let mut table = lock(&self.table);
			match table.get(&key) {
				Some(request) if self.verify(request, element.from(), bound.as_ref()) => table.remove(&key),
				Some(_) => {
					debug!(name = key.0.as_str(), id, from = element.from(), "reply from unexpected sender");
					None
				}
				None => None,
			}
		};
		match request {
			Some(request) => {
				let response = element.clone();
				self.executor.execute(move || {
					request.complete_with_response(response);
				});
				true
			}
			None => false,
		}
	}

	/// Time out every request created at or before `cutoff`.
	pub fn timeout_all(&self, cutoff: Instant) {
		let expired: Vec<Request> = {
			let mut table = lock(&self.table);
			let keys: Vec<Key> = table
				.iter()
				.filter(|(_, r)| r.created_at() <= cutoff)
				.map(|(k, _)| k.clone())
				.collect();
			keys.iter().filter_map(|k| table.remove(k)).collect()
		};
		if expired.is_empty() {
			return;
		}
		debug!(count = expired.len(), "timing out requests");
		self.complete_all_timeout(expired);
	}

	/// Drop completed requests and time out expired ones.
	pub fn sweep_outdated(&self) {
		self.sweep_outdated_at(Instant::now())
	}

	pub fn sweep_outdated_at(&self, now: Instant) {
		let expired: Vec<Request> = {
			let mut table = lock(&self.table);
			let mut expired = Vec::new();
			table.retain(|_, r| {
				if r.is_completed() {
					false
				} else if r.is_expired(now) {
					expired.push(r.clone());
					false
				} else {
					true
				}
			});
			expired
		};
		if !expired.is_empty() {
			debug!(count = expired.len(), "requests expired");
			self.complete_all_timeout(expired);
		}
	}

	/// Mark `requests` as sent. Those completing on send are completed
	/// through the executor.
	pub(crate) fn mark_sent(&self, requests: Vec<Request>) {
		let done: Vec<Request> = requests.into_iter().filter(|r| r.set_sent()).collect();
		if done.is_empty() {
			return;
		}
		self.executor.execute(move || {
			for request in done {
				request.complete_sent();
			}
		});
	}

	/// Time out requests which are not (or no longer) in the table.
	pub(crate) fn timeout_requests(&self, requests: Vec<Request>) {
		if !requests.is_empty() {
			self.complete_all_timeout(requests);
		}
	}

	pub(crate) fn fail_requests(&self, requests: Vec<Request>, error: RequestError) {
		if requests.is_empty() {
			return;
		}
		self.executor.execute(move || {
			for request in requests {
				request.complete_error(error.clone());
			}
		});
	}

	fn complete_all_timeout(&self, requests: Vec<Request>) {
		self.executor.execute(move || {
			for request in requests {
				request.complete_timeout();
			}
		});
	}
}
