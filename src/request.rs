/*!
# Outgoing requests

A [`Request`] is one stanza sent with the expectation of a reply (or, for
fire-and-forget stanzas, of being written). It completes exactly once,
either with the reply or with a [`RequestError`].

Requests are built through [`RequestBuilder`]. Each call to
[`RequestBuilder::map`] appends a derived stage whose result is computed
from the previous stage's result; handlers can be attached to every stage
and each of them sees the result of its own stage.

```
use std::sync::{Arc, Mutex};
use rxmpp::{ElementBuilder, RequestBuilder};

let seen = Arc::new(Mutex::new(Vec::new()));
let (a, b) = (seen.clone(), seen.clone());
let ping = ElementBuilder::new("iq").attr("type", "get").attr("id", "p1").build();
let request = RequestBuilder::new(ping)
	.response(move |r| a.lock().unwrap().push(format!("reply ok: {}", r.is_ok())))
	.map(|reply| Ok::<_, String>(reply.attributes().count()))
	.response(move |r| b.lock().unwrap().push(format!("attrs: {:?}", r.ok())))
	.build();
assert_eq!(request.id(), Some("p1"));
assert!(!request.is_completed());
```
*/
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

use crate::element::Element;
use crate::stanza_error::{parse_stanza_error, ErrorCondition};

/// Timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type AnyValue = Box<dyn Any + Send>;

type Transform = Box<dyn FnOnce(AnyValue) -> Result<AnyValue, RequestError> + Send>;

type Handler = Box<dyn FnOnce(Result<&(dyn Any + Send), &RequestError>) + Send>;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failed outcome of a request stage.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
	/// The peer answered with an error stanza.
	#[error("remote error: {condition}")]
	Stanza {
		condition: ErrorCondition,
		text: Option<String>,
		response: Element,
	},

	/// No reply arrived in time, or the connection went away.
	#[error("request timed out")]
	Timeout,

	/// An outgoing filter dropped the stanza, so it was never sent.
	#[error("stanza dropped before sending")]
	Dropped,

	/// A stage's transform rejected its input.
	#[error("transform failed: {0}")]
	Transform(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl RequestError {
	/// Stanza error condition equivalent to this failure.
	pub fn condition(&self) -> ErrorCondition {
		match self {
			Self::Stanza { condition, .. } => *condition,
			Self::Timeout => ErrorCondition::RemoteServerTimeout,
			Self::Dropped => ErrorCondition::NotAcceptable,
			Self::Transform(_) | Self::Internal(_) => ErrorCondition::UndefinedCondition,
		}
	}

	pub fn is_timeout(&self) -> bool {
		matches!(self, Self::Timeout)
	}
}

struct Stage {
	// None for the root stage, whose result is the reply itself
	transform: Option<Transform>,
	handlers: Vec<Handler>,
}

struct Inner {
	name: String,
	id: Option<String>,
	stanza_type: Option<String>,
	target: Option<String>,
	stanza: Element,
	created: Instant,
	timeout: Duration,
	complete_on_sent: bool,
	completed: AtomicBool,
	sent: AtomicBool,
	timed_out: AtomicBool,
	response: Mutex<Option<Element>>,
	stages: Mutex<Vec<Stage>>,
}

/**
# Handle to an in-flight request

Cheap to clone; all clones refer to the same request.
*/
#[derive(Clone)]
pub struct Request {
	inner: Arc<Inner>,
}

impl fmt::Debug for Request {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Request")
			.field("name", &self.inner.name)
			.field("id", &self.inner.id)
			.field("target", &self.inner.target)
			.field("completed", &self.is_completed())
			.field("sent", &self.is_sent())
			.field("timed_out", &self.is_timed_out())
			.finish()
	}
}

impl Request {
	/// Element name of the outgoing stanza.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	pub fn id(&self) -> Option<&str> {
		self.inner.id.as_deref()
	}

	/// Recipient (`to`) of the outgoing stanza, if it had one.
	pub fn target(&self) -> Option<&str> {
		self.inner.target.as_deref()
	}

	pub fn stanza(&self) -> &Element {
		&self.inner.stanza
	}

	pub fn created_at(&self) -> Instant {
		self.inner.created
	}

	pub fn timeout(&self) -> Duration {
		self.inner.timeout
	}

	pub fn is_expired(&self, now: Instant) -> bool {
		now >= self.inner.created + self.inner.timeout
	}

	pub fn is_completed(&self) -> bool {
		self.inner.completed.load(Ordering::Acquire)
	}

	pub fn is_sent(&self) -> bool {
		self.inner.sent.load(Ordering::Acquire)
	}

	pub fn is_timed_out(&self) -> bool {
		self.inner.timed_out.load(Ordering::Acquire)
	}

	/// The reply, once one has been received.
	pub fn response(&self) -> Option<Element> {
		lock(&self.inner.response).clone()
	}

	/// Key under which a reply can be correlated.
	///
	/// `None` for stanzas without `id` and for `iq` replies, which never get
	/// a reply of their own.
	pub(crate) fn key(&self) -> Option<(String, String)> {
		let id = self.inner.id.as_ref()?;
		if self.inner.name == "iq" && matches!(self.inner.stanza_type.as_deref(), Some("result") | Some("error")) {
			return None;
		}
		Some((self.inner.name.clone(), id.clone()))
	}

	/// Set the sent flag. Returns whether the request now wants to be
	/// completed with its own stanza.
	pub(crate) fn set_sent(&self) -> bool {
		self.inner.sent.store(true, Ordering::Release);
		self.inner.complete_on_sent
	}

	/// Complete with the outgoing stanza itself.
	pub(crate) fn complete_sent(&self) -> bool {
		self.complete(Ok(self.inner.stanza.clone()), None)
	}

	/// Record that the stanza has been handed to the transport.
	#[cfg(test)]
	pub(crate) fn mark_sent(&self) {
		if self.set_sent() {
			self.complete_sent();
		}
	}

	pub(crate) fn complete_with_response(&self, response: Element) -> bool {
		let outcome = match parse_stanza_error(&response) {
			Some((condition, text)) => Err(RequestError::Stanza {
				condition,
				text,
				response: response.clone(),
			}),
			None => Ok(response.clone()),
		};
		self.complete(outcome, Some(response))
	}

	pub(crate) fn complete_timeout(&self) -> bool {
		self.complete(Err(RequestError::Timeout), None)
	}

	pub(crate) fn complete_error(&self, error: RequestError) -> bool {
		self.complete(Err(error), None)
	}

	/// Run all stages, root to leaf. Returns false if the request had been
	/// completed before; `response` is only stored otherwise.
	fn complete(&self, outcome: Result<Element, RequestError>, response: Option<Element>) -> bool {
		if self.inner.completed.swap(true, Ordering::AcqRel) {
			return false;
		}
		if response.is_some() {
			*lock(&self.inner.response) = response;
		}
		if matches!(outcome, Err(RequestError::Timeout)) {
			self.inner.timed_out.store(true, Ordering::Release);
		}
		let stages = mem::take(&mut *lock(&self.inner.stages));
		let mut current: Result<AnyValue, RequestError> = outcome.map(|el| Box::new(el) as AnyValue);
		for stage in stages {
			if let Some(transform) = stage.transform {
				current = match current {
					Ok(value) => match catch_unwind(AssertUnwindSafe(move || transform(value))) {
						Ok(result) => result,
						Err(_) => Err(RequestError::Transform("transform panicked".to_string())),
					},
					Err(e) => Err(e),
				};
			}
			for handler in stage.handlers {
				let arg = match &current {
					Ok(value) => Ok(value.as_ref()),
					Err(e) => Err(e),
				};
				if catch_unwind(AssertUnwindSafe(move || handler(arg))).is_err() {
					warn!(name = self.name(), id = self.id(), "request handler panicked");
				}
			}
		}
		true
	}
}

/**
# Builder for [`Request`]s

`T` is the result type of the last stage: [`Element`] for a fresh builder,
whatever the last [`map`](Self::map) produced otherwise.
*/
pub struct RequestBuilder<T> {
	stanza: Element,
	timeout: Duration,
	complete_on_sent: bool,
	stages: Vec<Stage>,
	_result: PhantomData<fn() -> T>,
}

impl RequestBuilder<Element> {
	/// Start a request for `stanza`.
	///
	/// Stanzas other than `iq` complete as soon as they are written, unless
	/// [`complete_on_sent`](Self::complete_on_sent) says otherwise.
	pub fn new(stanza: Element) -> Self {
		let complete_on_sent = stanza.name() != "iq";
		Self {
			stanza,
			timeout: DEFAULT_TIMEOUT,
			complete_on_sent,
			stages: vec![Stage {
				transform: None,
				handlers: Vec::new(),
			}],
			_result: PhantomData,
		}
	}
}

impl<T: Any + Send> RequestBuilder<T> {
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Complete with the outgoing stanza itself once it has been written.
	pub fn complete_on_sent(mut self, v: bool) -> Self {
		self.complete_on_sent = v;
		self
	}

	/// Attach a handler to the current stage. May be called repeatedly.
	pub fn response<F>(mut self, f: F) -> Self
	where
		F: FnOnce(Result<&T, &RequestError>) + Send + 'static,
	{
		let handler: Handler = Box::new(move |r| match r {
			Ok(value) => match value.downcast_ref::<T>() {
				Some(value) => f(Ok(value)),
				None => f(Err(&RequestError::Internal("stage result has unexpected type".to_string()))),
			},
			Err(e) => f(Err(e)),
		});
		if let Some(stage) = self.stages.last_mut() {
			stage.handlers.push(handler);
		}
		self
	}

	/// Derive a new stage whose result is `f` applied to this stage's result.
	///
	/// If `f` fails (or panics), this and all later stages fail with
	/// [`RequestError::Transform`].
	pub fn map<U, E, F>(mut self, f: F) -> RequestBuilder<U>
	where
		U: Any + Send,
		E: fmt::Display,
		F: FnOnce(T) -> Result<U, E> + Send + 'static,
	{
		let transform: Transform = Box::new(move |value| {
			let value = value
				.downcast::<T>()
				.map_err(|_| RequestError::Internal("stage input has unexpected type".to_string()))?;
			match f(*value) {
				Ok(u) => Ok(Box::new(u) as AnyValue),
				Err(e) => Err(RequestError::Transform(e.to_string())),
			}
		});
		self.stages.push(Stage {
			transform: Some(transform),
			handlers: Vec::new(),
		});
		RequestBuilder {
			stanza: self.stanza,
			timeout: self.timeout,
			complete_on_sent: self.complete_on_sent,
			stages: self.stages,
			_result: PhantomData,
		}
	}

	pub fn build(self) -> Request {
		let stanza = self.stanza;
		Request {
			inner: Arc::new(Inner {
				name: stanza.name().to_string(),
				id: stanza.id().map(str::to_string),
				stanza_type: stanza.stanza_type().map(str::to_string),
				target: stanza.to().map(str::to_string),
				created: Instant::now(),
				timeout: self.timeout,
				complete_on_sent: self.complete_on_sent,
				completed: AtomicBool::new(false),
				sent: AtomicBool::new(false),
				timed_out: AtomicBool::new(false),
				response: Mutex::new(None),
				stages: Mutex::new(self.stages),
				stanza,
			}),
		}
	}
}
