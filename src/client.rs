/*!
# Connection controller

[`Client`] ties the pieces together: it owns the connector for the current
connection attempt, parses what the connector receives, correlates replies
with outstanding [`Request`]s, routes everything else to the registered
[`Module`]s and writes outgoing stanzas through the filter chains.

State changes and stream-level happenings are broadcast as [`Event`]s.

Connectors and modules get a [`ClientHandle`], which does not keep the
client alive. The handle passed to a connector factory is tied to that one
connection: once the connection is replaced or torn down, reports made
through it (received data, state changes, session events) are ignored.
*/
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::assembler::{StreamEvent, StreamParser};
use crate::connector::{Connector, ConnectorFactory, ConnectorState, SessionController, SessionEvent};
use crate::element::Element;
use crate::error::{Error, Result, XmlError};
use crate::executor::Executor;
use crate::filter::{FilterChain, StanzaFilter};
use crate::jid::{BareJid, Jid};
use crate::module::{Module, ModulesManager};
use crate::request::{lock, Request, RequestBuilder, RequestError};
use crate::requests::RequestsManager;
use crate::sm::{AckState, XMLNS_SM};
use crate::stanza_error::{error_reply, ErrorCondition};
use crate::tokenizer::TokenizerOptions;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
	Connecting,
	Connected,
	Disconnecting,
	Disconnected,
	Stopped,
}

/// Notification broadcast by a [`Client`].
#[derive(Debug, Clone)]
pub enum Event {
	StateChanged { old: State, new: State },
	/// The peer opened its stream; attributes of the stream header.
	StreamOpened(Vec<(String, String)>),
	StreamClosed,
	ParseError(XmlError),
	/// A stanza arrived, before any filtering.
	Received(Element),
	/// A stanza was handed to the connector.
	Sent(Element),
	SessionEstablished,
}

/**
# Client configuration

```
use std::time::Duration;
use rxmpp::ClientConfig;

let config = ClientConfig::new("example.com")
	.jid("user@example.com".parse().unwrap())
	.reconnect_delay(Duration::from_secs(10));
assert!(config.validate().is_ok());
assert!(ClientConfig::new("").validate().is_err());
```
*/
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Domain of the service to connect to.
	pub domain: String,
	/// Account address, if authenticating as a user.
	pub jid: Option<BareJid>,
	/// Reconnect after recoverable failures.
	pub auto_reconnect: bool,
	pub reconnect_delay: Duration,
	/// Timeout for requests created through [`Client::request`].
	pub request_timeout: Duration,
	/// Period of [`Client::spawn_ticker`].
	pub tick_interval: Duration,
	pub tokenizer: TokenizerOptions,
}

impl ClientConfig {
	pub fn new<S: Into<String>>(domain: S) -> Self {
		Self {
			domain: domain.into(),
			jid: None,
			auto_reconnect: true,
			reconnect_delay: Duration::from_secs(3),
			request_timeout: crate::request::DEFAULT_TIMEOUT,
			tick_interval: Duration::from_secs(2),
			tokenizer: TokenizerOptions::default(),
		}
	}

	pub fn jid(mut self, jid: BareJid) -> Self {
		self.jid = Some(jid);
		self
	}

	pub fn auto_reconnect(mut self, v: bool) -> Self {
		self.auto_reconnect = v;
		self
	}

	pub fn reconnect_delay(mut self, v: Duration) -> Self {
		self.reconnect_delay = v;
		self
	}

	pub fn request_timeout(mut self, v: Duration) -> Self {
		self.request_timeout = v;
		self
	}

	pub fn tick_interval(mut self, v: Duration) -> Self {
		self.tick_interval = v;
		self
	}

	pub fn tokenizer(mut self, v: TokenizerOptions) -> Self {
		self.tokenizer = v;
		self
	}

	pub fn validate(&self) -> Result<()> {
		if self.domain.is_empty() {
			return Err(Error::Config("domain is empty".to_string()));
		}
		if let Some(jid) = self.jid.as_ref() {
			if jid.domain() != self.domain {
				return Err(Error::Config(format!(
					"address {} does not belong to domain {}",
					jid, self.domain
				)));
			}
		}
		if self.request_timeout.is_zero() {
			return Err(Error::Config("request timeout is zero".to_string()));
		}
		if self.tick_interval.is_zero() {
			return Err(Error::Config("tick interval is zero".to_string()));
		}
		Ok(())
	}
}

struct Connection {
	generation: u64,
	connector: Arc<dyn Connector>,
	session: Arc<dyn SessionController>,
}

struct Inner {
	config: ClientConfig,
	factory: ConnectorFactory,
	state: Mutex<State>,
	running: AtomicBool,
	generation: AtomicU64,
	connection: Mutex<Option<Connection>>,
	parser: Mutex<StreamParser>,
	// serializes inbound dispatch
	inbound: Mutex<()>,
	// serializes outbound writes
	outbound: Mutex<()>,
	requests: RequestsManager,
	modules: Mutex<ModulesManager>,
	incoming: Mutex<FilterChain>,
	outgoing: Mutex<FilterChain>,
	sm: Mutex<AckState>,
	events: broadcast::Sender<Event>,
}

/// Protocol client for one account.
#[derive(Clone)]
pub struct Client {
	inner: Arc<Inner>,
}

/// Non-owning reference to a [`Client`].
#[derive(Clone)]
pub struct ClientHandle {
	inner: Weak<Inner>,
	// set for handles given to a connector
	generation: Option<u64>,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("domain", &self.inner.config.domain)
			.field("state", &self.state())
			.field("pending", &self.inner.requests.pending())
			.finish()
	}
}

impl fmt::Debug for ClientHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientHandle")
			.field("alive", &(self.inner.strong_count() > 0))
			.field("generation", &self.generation)
			.finish()
	}
}

impl Client {
	/// Create a client whose request completions run inline, one at a
	/// time.
	pub fn new(config: ClientConfig, factory: ConnectorFactory) -> Self {
		Self::with_executor(config, factory, Executor::default())
	}

	pub fn with_executor(config: ClientConfig, factory: ConnectorFactory, executor: Executor) -> Self {
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		let parser = StreamParser::with_options(config.tokenizer);
		Self {
			inner: Arc::new(Inner {
				config,
				factory,
				state: Mutex::new(State::Stopped),
				running: AtomicBool::new(false),
				generation: AtomicU64::new(0),
				connection: Mutex::new(None),
				parser: Mutex::new(parser),
				inbound: Mutex::new(()),
				outbound: Mutex::new(()),
				requests: RequestsManager::new(executor),
				modules: Mutex::new(ModulesManager::new()),
				incoming: Mutex::new(FilterChain::new()),
				outgoing: Mutex::new(FilterChain::new()),
				sm: Mutex::new(AckState::new()),
				events,
			}),
		}
	}

	pub fn handle(&self) -> ClientHandle {
		ClientHandle {
			inner: Arc::downgrade(&self.inner),
			generation: None,
		}
	}

	fn is_current(&self, generation: Option<u64>) -> bool {
		match generation {
			None => true,
			Some(generation) => lock(&self.inner.connection).as_ref().map(|c| c.generation) == Some(generation),
		}
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	pub fn state(&self) -> State {
		*lock(&self.inner.state)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.inner.events.subscribe()
	}

	pub fn requests(&self) -> &RequestsManager {
		&self.inner.requests
	}

	pub fn bound_jid(&self) -> Option<Jid> {
		self.inner.requests.bound_jid()
	}

	pub fn set_bound_jid(&self, jid: Option<Jid>) {
		self.inner.requests.set_bound_jid(jid)
	}

	pub fn register_module<M: Module + 'static>(&self, module: M) {
		lock(&self.inner.modules).register(module)
	}

	/// Features advertised by the registered modules.
	pub fn available_features(&self) -> Vec<String> {
		lock(&self.inner.modules).available_features()
	}

	pub fn add_incoming_filter<F: StanzaFilter + 'static>(&self, filter: F) {
		lock(&self.inner.incoming).push(filter)
	}

	pub fn add_outgoing_filter<F: StanzaFilter + 'static>(&self, filter: F) {
		lock(&self.inner.outgoing).push(filter)
	}

	/// Start a request builder with the configured request timeout.
	pub fn request(&self, stanza: Element) -> RequestBuilder<Element> {
		RequestBuilder::new(stanza).timeout(self.inner.config.request_timeout)
	}

	fn emit(&self, event: Event) {
		// no subscribers is fine
		let _ = self.inner.events.send(event);
	}

	fn set_state(&self, new: State) {
		let old = std::mem::replace(&mut *lock(&self.inner.state), new);
		if old != new {
			debug!(?old, ?new, "client state changed");
			self.emit(Event::StateChanged { old, new });
		}
	}

	/// Forget per-connection data. Requests still waiting for a stream
	/// management acknowledgement are timed out.
	fn clear_session(&self) {
		self.inner.requests.set_bound_jid(None);
		let held = lock(&self.inner.sm).reset();
		lock(&self.inner.parser).reset();
		if !held.is_empty() {
			debug!(count = held.len(), "unacknowledged requests timed out");
			self.inner.requests.timeout_requests(held);
		}
	}

	fn connected_connector(&self) -> Result<Arc<dyn Connector>> {
		let connector = match lock(&self.inner.connection).as_ref() {
			Some(conn) => conn.connector.clone(),
			None => return Err(Error::NoConnector),
		};
		if connector.state() != ConnectorState::Connected {
			return Err(Error::NotConnected);
		}
		Ok(connector)
	}

	fn start_connector(&self) -> Result<()> {
		if let Err(e) = self.stop_connector() {
			debug!(error = %e, "failed to stop previous connector");
		}
		let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
		let connector = (self.inner.factory)(ClientHandle {
			inner: Arc::downgrade(&self.inner),
			generation: Some(generation),
		});
		let session = connector.create_session_controller();
		*lock(&self.inner.connection) = Some(Connection {
			generation,
			connector: connector.clone(),
			session: session.clone(),
		});
		debug!(generation, "starting connector");
		session.start()?;
		connector.start()
	}

	fn stop_connector(&self) -> Result<()> {
		let conn = lock(&self.inner.connection).take();
		match conn {
			Some(conn) => {
				debug!("stopping connector");
				conn.session.stop();
				conn.connector.stop()
			}
			None => Ok(()),
		}
	}

	/// Open a new connection.
	///
	/// Session data of an earlier connection is discarded. If the connector
	/// cannot be started, outstanding requests are timed out and the client
	/// ends up [`Stopped`](State::Stopped).
	pub fn connect(&self) -> Result<()> {
		self.inner.config.validate()?;
		self.clear_session();
		self.inner.running.store(true, Ordering::SeqCst);
		debug!(domain = self.inner.config.domain.as_str(), "connecting");
		self.set_state(State::Connecting);
		if let Err(e) = self.start_connector() {
			warn!(error = %e, "failed to start connector");
			self.inner.requests.timeout_all(Instant::now());
			self.set_state(State::Stopped);
			return Err(e);
		}
		Ok(())
	}

	/// Close the connection.
	///
	/// Whatever happens, the client ends up [`Stopped`](State::Stopped)
	/// with no outstanding requests.
	pub fn disconnect(&self) -> Result<()> {
		self.inner.running.store(false, Ordering::SeqCst);
		let idle = lock(&self.inner.connection).is_none() && self.state() == State::Stopped;
		if idle {
			self.inner.requests.timeout_all(Instant::now());
			return Ok(());
		}
		debug!("disconnecting");
		let result = self.shutdown();
		self.clear_session();
		self.inner.requests.timeout_all(Instant::now());
		self.set_state(State::Stopped);
		result
	}

	fn shutdown(&self) -> Result<()> {
		let ack = {
			let mut sm = lock(&self.inner.sm);
			if sm.is_enabled() {
				sm.ack_element(true)
			} else {
				None
			}
		};
		if let Some(ack) = ack {
			if self.connected_connector().is_ok() {
				self.write_quietly(ack);
			}
		}
		self.set_state(State::Disconnecting);
		let result = self.stop_connector();
		self.set_state(State::Disconnected);
		result
	}

	fn outgoing_chain(&self) -> FilterChain {
		let mut chain = lock(&self.inner.outgoing).clone();
		chain.extend(&lock(&self.inner.modules).outgoing_filters());
		chain
	}

	fn incoming_chain(&self) -> FilterChain {
		let mut chain = lock(&self.inner.incoming).clone();
		chain.extend(&lock(&self.inner.modules).incoming_filters());
		chain
	}

	/// Send the stanza of `request` and track it for a reply.
	///
	/// The request counts as sent once the connector accepted the data or,
	/// with stream management enabled, once the peer acknowledged it.
	///
	/// A request whose stanza an outgoing filter drops or rejects completes
	/// with [`RequestError::Dropped`] or [`RequestError::Internal`].
	/// Completions never run while the outbound path is locked.
	pub fn write(&self, request: &Request) -> Result<()> {
		let connector = self.connected_connector()?;
		let mut replaced = None;
		let mut registered = false;
		let sent = {
			let _order = lock(&self.inner.outbound);
			match self.outgoing_chain().apply(request.stanza().clone()) {
				Ok(Some(stanza)) => {
					replaced = self.inner.requests.insert(request);
					registered = true;
					connector.send(&stanza.to_xml()).map(|()| {
						let counted = lock(&self.inner.sm).on_sent(&stanza, Some(request.clone()));
						Some((stanza, counted))
					})
				}
				Ok(None) => Ok(None),
				Err(e) => Err(e),
			}
		};
		if let Some(previous) = replaced {
			self.inner.requests.timeout_requests(vec![previous]);
		}
		match sent {
			Ok(Some((stanza, counted))) => {
				if !counted {
					self.inner.requests.mark_sent(vec![request.clone()]);
				}
				self.emit(Event::Sent(stanza));
				Ok(())
			}
			Ok(None) => {
				debug!(name = request.name(), id = request.id(), "outgoing stanza dropped by filter");
				self.inner.requests.fail_requests(vec![request.clone()], RequestError::Dropped);
				Ok(())
			}
			Err(e) => {
				// registered requests are timed out with the table
				if !registered {
					self.inner
						.requests
						.fail_requests(vec![request.clone()], RequestError::Internal(e.to_string()));
				}
				Err(e)
			}
		}
	}

	/// Send `element` without tracking a reply.
	pub fn write_directly(&self, element: Element) -> Result<()> {
		let connector = self.connected_connector()?;
		let stanza = {
			let _order = lock(&self.inner.outbound);
			let stanza = match self.outgoing_chain().apply(element)? {
				Some(stanza) => stanza,
				None => {
					debug!("outgoing element dropped by filter");
					return Ok(());
				}
			};
			connector.send(&stanza.to_xml())?;
			lock(&self.inner.sm).on_sent(&stanza, None);
			stanza
		};
		self.emit(Event::Sent(stanza));
		Ok(())
	}

	fn write_quietly(&self, element: Element) {
		if let Err(e) = self.write_directly(element) {
			debug!(error = %e, "failed to write");
		}
	}

	/// Ask the peer to enable stream management acknowledgements.
	pub fn enable_stream_management(&self) -> Result<()> {
		self.write_directly(AckState::enable_element())
	}

	/// Discard parser state when the stream restarts (after TLS or SASL).
	pub fn restart_stream(&self) {
		lock(&self.inner.parser).reset();
	}

	/// Feed data read from the transport.
	pub fn receive(&self, data: &[u8]) {
		let mut parse_error = None;
		{
			let _inbound = lock(&self.inner.inbound);
			let events = lock(&self.inner.parser).parse(data);
			for event in events {
				match event {
					StreamEvent::StreamOpened(attributes) => {
						trace!("stream opened");
						self.emit(Event::StreamOpened(attributes));
					}
					StreamEvent::StreamClosed => {
						debug!("stream closed by peer");
						self.emit(Event::StreamClosed);
					}
					StreamEvent::Element(element) => self.dispatch(element),
					StreamEvent::Error(e) => {
						warn!(error = %e, "malformed inbound stream");
						self.emit(Event::ParseError(e.clone()));
						parse_error = Some(e);
					}
				}
			}
		}
		if let Some(e) = parse_error {
			self.session_event(SessionEvent::ErrorReconnect {
				message: e.to_string(),
				immediately: false,
				force: false,
			});
		}
	}

	/// Handle a stanza the transport parsed itself.
	pub fn process_received_element(&self, element: Element) {
		let _inbound = lock(&self.inner.inbound);
		self.dispatch(element);
	}

	fn send_error(&self, element: &Element, condition: ErrorCondition, text: Option<&str>) {
		if let Some(reply) = error_reply(element, condition, text) {
			self.write_quietly(reply);
		}
	}

	fn dispatch(&self, element: Element) {
		trace!(name = element.name(), id = element.id(), "received");
		self.emit(Event::Received(element.clone()));
		if element.xmlns() == Some(XMLNS_SM) {
			self.process_sm(&element);
			return;
		}
		lock(&self.inner.sm).on_received(&element);

		let element = match self.incoming_chain().apply(element) {
			Ok(Some(element)) => element,
			Ok(None) => {
				trace!("inbound stanza dropped by filter");
				return;
			}
			Err(e) => {
				debug!(error = %e, "inbound stanza rejected by filter");
				return;
			}
		};

		let handled = self.inner.requests.find_and_dispatch(&element);
		let is_reply = matches!(element.stanza_type(), Some("result") | Some("error"));
		if element.name() == "iq" && (handled || is_reply) {
			return;
		}

		let modules = lock(&self.inner.modules).modules_for(&element);
		if modules.is_empty() {
			if element.name() == "iq" {
				debug!(id = element.id(), from = element.from(), "no module handles request");
				self.send_error(&element, ErrorCondition::FeatureNotImplemented, None);
			} else {
				trace!(name = element.name(), handled, "no module for stanza");
			}
			return;
		}

		let handle = self.handle();
		for module in modules {
			let (condition, text) = match catch_unwind(AssertUnwindSafe(|| module.process(&element, &handle))) {
				Ok(Ok(())) => continue,
				Ok(Err(Error::Stanza { condition, text })) => {
					debug!(module = module.name(), %condition, "module refused stanza");
					(condition, text)
				}
				Ok(Err(e)) => {
					warn!(module = module.name(), error = %e, "module failed");
					(ErrorCondition::InternalServerError, None)
				}
				Err(_) => {
					warn!(module = module.name(), "module panicked");
					(ErrorCondition::InternalServerError, None)
				}
			};
			self.send_error(&element, condition, text.as_deref());
			break;
		}
	}

	fn process_sm(&self, element: &Element) {
		match element.name() {
			"r" => {
				let ack = lock(&self.inner.sm).ack_element(true);
				if let Some(ack) = ack {
					self.write_quietly(ack);
				}
			}
			"a" => {
				let acked = lock(&self.inner.sm).process_ack(element);
				self.inner.requests.mark_sent(acked);
			}
			"enabled" => lock(&self.inner.sm).process_enabled(element),
			"failed" => {
				debug!("stream management could not be enabled");
				let held = lock(&self.inner.sm).reset();
				self.inner.requests.mark_sent(held);
			}
			other => trace!(name = other, "ignoring stream management element"),
		}
	}

	/// Report the outcome of stream negotiation.
	pub fn session_event(&self, event: SessionEvent) {
		match event {
			SessionEvent::Successful => {
				self.set_state(State::Connected);
				self.emit(Event::SessionEstablished);
			}
			SessionEvent::ErrorReconnect {
				message,
				immediately,
				force,
			} if self.inner.config.auto_reconnect || force => {
				warn!(%message, immediately, "session failed, reconnecting");
				self.set_state(State::Disconnected);
				if let Err(e) = self.stop_connector() {
					debug!(error = %e, "failed to stop connector");
				}
				self.reconnect(immediately);
			}
			SessionEvent::ErrorReconnect { message, .. } | SessionEvent::ErrorStop(message) => {
				warn!(%message, "session failed");
				if let Err(e) = self.disconnect() {
					debug!(error = %e, "failed to disconnect");
				}
			}
		}
	}

	/// Report a state change of the connector.
	///
	/// Losing an established transport is a recoverable session failure.
	pub fn connector_state_changed(&self, old: ConnectorState, new: ConnectorState) {
		debug!(%old, %new, "connector state changed");
		let attached = lock(&self.inner.connection).is_some();
		if attached
			&& old == ConnectorState::Connected
			&& new == ConnectorState::Disconnected
			&& matches!(self.state(), State::Connecting | State::Connected)
		{
			self.session_event(SessionEvent::ErrorReconnect {
				message: "connection lost".to_string(),
				immediately: false,
				force: false,
			});
		}
	}

	fn reconnect(&self, immediately: bool) {
		let delay = if immediately {
			Duration::ZERO
		} else {
			self.inner.config.reconnect_delay
		};
		match tokio::runtime::Handle::try_current() {
			Ok(rt) if !delay.is_zero() => {
				let handle = self.handle();
				rt.spawn(async move {
					tokio::time::sleep(delay).await;
					if let Some(client) = handle.upgrade() {
						client.reconnect_now();
					}
				});
			}
			_ => self.reconnect_now(),
		}
	}

	fn reconnect_now(&self) {
		if !self.inner.running.load(Ordering::SeqCst) {
			debug!("reconnect cancelled");
			return;
		}
		if let Err(e) = self.connect() {
			warn!(error = %e, "reconnect failed");
		}
	}

	/// Periodic housekeeping: expire requests and exchange stream
	/// management acknowledgements.
	pub fn tick(&self) {
		self.inner.requests.sweep_outdated();
		let (request, ack) = {
			let mut sm = lock(&self.inner.sm);
			if !sm.is_enabled() {
				return;
			}
			let request = if sm.unacked() > 0 {
				Some(AckState::request_element())
			} else {
				None
			};
			(request, sm.ack_element(false))
		};
		for element in request.into_iter().chain(ack) {
			self.write_quietly(element);
		}
	}

	/// Call [`tick`](Self::tick) every `tick_interval` until the client is
	/// dropped. Requires a tokio runtime.
	pub fn spawn_ticker(&self) -> JoinHandle<()> {
		let handle = self.handle();
		let period = self.inner.config.tick_interval;
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				interval.tick().await;
				match handle.upgrade() {
					Some(client) => client.tick(),
					None => break,
				}
			}
		})
	}
}

impl ClientHandle {
	pub fn upgrade(&self) -> Option<Client> {
		self.inner.upgrade().map(|inner| Client { inner })
	}

	fn client(&self) -> Result<Client> {
		self.upgrade().ok_or(Error::ClientGone)
	}

	/// The client, unless this handle belongs to a connection which has
	/// been replaced or torn down.
	fn current(&self) -> Result<Option<Client>> {
		let client = self.client()?;
		if client.is_current(self.generation) {
			Ok(Some(client))
		} else {
			debug!(generation = ?self.generation, "ignoring report from a stale connection");
			Ok(None)
		}
	}

	pub fn write(&self, request: &Request) -> Result<()> {
		self.client()?.write(request)
	}

	pub fn write_directly(&self, element: Element) -> Result<()> {
		self.client()?.write_directly(element)
	}

	pub fn receive(&self, data: &[u8]) -> Result<()> {
		if let Some(client) = self.current()? {
			client.receive(data);
		}
		Ok(())
	}

	pub fn process_received_element(&self, element: Element) -> Result<()> {
		if let Some(client) = self.current()? {
			client.process_received_element(element);
		}
		Ok(())
	}

	pub fn session_event(&self, event: SessionEvent) -> Result<()> {
		if let Some(client) = self.current()? {
			client.session_event(event);
		}
		Ok(())
	}

	pub fn connector_state_changed(&self, old: ConnectorState, new: ConnectorState) -> Result<()> {
		if let Some(client) = self.current()? {
			client.connector_state_changed(old, new);
		}
		Ok(())
	}

	pub fn restart_stream(&self) -> Result<()> {
		if let Some(client) = self.current()? {
			client.restart_stream();
		}
		Ok(())
	}

	pub fn enable_stream_management(&self) -> Result<()> {
		self.client()?.enable_stream_management()
	}

	pub fn set_bound_jid(&self, jid: Option<Jid>) -> Result<()> {
		self.client()?.set_bound_jid(jid);
		Ok(())
	}

	pub fn bound_jid(&self) -> Option<Jid> {
		self.upgrade().and_then(|c| c.bound_jid())
	}

	pub fn state(&self) -> Option<State> {
		self.upgrade().map(|c| c.state())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::atomic::AtomicUsize;

	use crate::filter::Next;
	use crate::module::Criterion;
	use crate::parse_element;

	const HEADER: &[u8] = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";

	#[derive(Default)]
	struct Wire {
		sent: Mutex<Vec<String>>,
		starts: AtomicUsize,
		stops: AtomicUsize,
		// one per connector created
		handles: Mutex<Vec<ClientHandle>>,
	}

	impl Wire {
		fn sent(&self) -> Vec<String> {
			self.sent.lock().unwrap().clone()
		}

		fn last(&self) -> Option<String> {
			self.sent.lock().unwrap().last().cloned()
		}
	}

	struct MockSession;

	impl SessionController for MockSession {
		fn start(&self) -> Result<()> {
			Ok(())
		}

		fn stop(&self) {}
	}

	struct MockConnector {
		wire: Arc<Wire>,
		handle: ClientHandle,
		state: Mutex<ConnectorState>,
		fail: bool,
	}

	impl Connector for MockConnector {
		fn start(&self) -> Result<()> {
			self.wire.starts.fetch_add(1, Ordering::SeqCst);
			if self.fail {
				return Err(Error::Connector("connection refused".to_string()));
			}
			*self.state.lock().unwrap() = ConnectorState::Connected;
			Ok(())
		}

		fn stop(&self) -> Result<()> {
			self.wire.stops.fetch_add(1, Ordering::SeqCst);
			let old = std::mem::replace(&mut *self.state.lock().unwrap(), ConnectorState::Disconnected);
			// a real connector reports this from its reader task
			let _ = self.handle.connector_state_changed(old, ConnectorState::Disconnected);
			Ok(())
		}

		fn send(&self, data: &str) -> Result<()> {
			self.wire.sent.lock().unwrap().push(data.to_string());
			Ok(())
		}

		fn state(&self) -> ConnectorState {
			*self.state.lock().unwrap()
		}

		fn create_session_controller(&self) -> Arc<dyn SessionController> {
			Arc::new(MockSession)
		}
	}

	fn client_with(config: ClientConfig, fail: bool) -> (Client, Arc<Wire>) {
		let wire = Arc::new(Wire::default());
		let w = wire.clone();
		let client = Client::new(
			config,
			Box::new(move |handle: ClientHandle| {
				w.handles.lock().unwrap().push(handle.clone());
				Arc::new(MockConnector {
					wire: w.clone(),
					handle,
					state: Mutex::new(ConnectorState::Disconnected),
					fail,
				}) as Arc<dyn Connector>
			}),
		);
		(client, wire)
	}

	fn connected_with(config: ClientConfig) -> (Client, Arc<Wire>) {
		let (client, wire) = client_with(config, false);
		client.connect().unwrap();
		client.session_event(SessionEvent::Successful);
		client.set_bound_jid(Some("user@example.com/res".parse().unwrap()));
		client.receive(HEADER);
		(client, wire)
	}

	fn connected() -> (Client, Arc<Wire>) {
		connected_with(ClientConfig::new("example.com"))
	}

	fn el(xml: &str) -> Element {
		parse_element(xml).unwrap()
	}

	type Outcomes = Arc<Mutex<Vec<std::result::Result<String, RequestError>>>>;

	fn tracked(client: &Client, xml: &str) -> (Request, Outcomes) {
		let outcomes: Outcomes = Arc::new(Mutex::new(Vec::new()));
		let o = outcomes.clone();
		let req = client
			.request(el(xml))
			.response(move |r| {
				o.lock()
					.unwrap()
					.push(r.map(|el| el.to_xml()).map_err(|e| e.clone()))
			})
			.build();
		(req, outcomes)
	}

	fn state_changes(rx: &mut broadcast::Receiver<Event>) -> Vec<(State, State)> {
		let mut out = Vec::new();
		while let Ok(ev) = rx.try_recv() {
			if let Event::StateChanged { old, new } = ev {
				out.push((old, new));
			}
		}
		out
	}

	#[test]
	fn lifecycle_fires_state_changes() {
		let (client, wire) = client_with(ClientConfig::new("example.com"), false);
		let mut rx = client.subscribe();
		assert_eq!(client.state(), State::Stopped);
		client.connect().unwrap();
		assert_eq!(client.state(), State::Connecting);
		client.session_event(SessionEvent::Successful);
		assert_eq!(client.state(), State::Connected);
		client.disconnect().unwrap();
		assert_eq!(client.state(), State::Stopped);
		assert_eq!(wire.starts.load(Ordering::SeqCst), 1);
		assert_eq!(wire.stops.load(Ordering::SeqCst), 1);
		assert_eq!(
			state_changes(&mut rx),
			vec![
				(State::Stopped, State::Connecting),
				(State::Connecting, State::Connected),
				(State::Connected, State::Disconnecting),
				(State::Disconnecting, State::Disconnected),
				(State::Disconnected, State::Stopped),
			]
		);
	}

	#[test]
	fn disconnect_without_connector_is_noop() {
		let (client, wire) = client_with(ClientConfig::new("example.com"), false);
		let mut rx = client.subscribe();
		client.disconnect().unwrap();
		assert_eq!(wire.stops.load(Ordering::SeqCst), 0);
		assert!(state_changes(&mut rx).is_empty());
	}

	#[test]
	fn invalid_config_fails_fast() {
		let (client, wire) = client_with(ClientConfig::new(""), false);
		assert!(matches!(client.connect(), Err(Error::Config(_))));
		assert_eq!(client.state(), State::Stopped);
		assert_eq!(wire.starts.load(Ordering::SeqCst), 0);

		let config = ClientConfig::new("example.com").jid("user@example.org".parse().unwrap());
		assert!(config.validate().is_err());
		assert!(ClientConfig::new("example.com").tick_interval(Duration::ZERO).validate().is_err());
	}

	#[test]
	fn failed_start_stops_client() {
		let (client, wire) = client_with(ClientConfig::new("example.com"), true);
		let mut rx = client.subscribe();
		assert!(matches!(client.connect(), Err(Error::Connector(_))));
		assert_eq!(client.state(), State::Stopped);
		assert_eq!(wire.starts.load(Ordering::SeqCst), 1);
		assert_eq!(
			state_changes(&mut rx),
			vec![(State::Stopped, State::Connecting), (State::Connecting, State::Stopped)]
		);
	}

	#[test]
	fn write_needs_connected_transport() {
		let (client, _) = client_with(ClientConfig::new("example.com"), true);
		let req = client.request(el("<iq type='get' id='w1'/>")).build();
		assert!(matches!(client.write(&req), Err(Error::NoConnector)));
		let _ = client.connect();
		assert!(matches!(client.write(&req), Err(Error::NotConnected)));
		assert!(matches!(client.write_directly(el("<presence/>")), Err(Error::NotConnected)));
		assert_eq!(client.requests().pending(), 0);
	}

	#[test]
	fn reply_from_server_domain_completes_request() {
		let (client, wire) = connected();
		let (req, outcomes) = tracked(&client, "<iq type='get' id='r1'><ping xmlns='urn:xmpp:ping'/></iq>");
		client.write(&req).unwrap();
		assert_eq!(wire.last().unwrap(), "<iq type=\"get\" id=\"r1\"><ping xmlns=\"urn:xmpp:ping\"/></iq>");
		assert!(req.is_sent());
		assert_eq!(client.requests().pending(), 1);

		client.receive(b"<iq type='result' id='r1' from='example.com'/>");
		assert_eq!(outcomes.lock().unwrap().len(), 1);
		assert!(outcomes.lock().unwrap()[0].is_ok());
		assert_eq!(client.requests().pending(), 0);
		// the reply is not answered with an error
		assert_eq!(wire.sent().len(), 1);
	}

	#[test]
	fn disconnect_times_out_pending_requests() {
		let (client, _) = connected();
		let reqs: Vec<_> = (0..5)
			.map(|i| tracked(&client, &format!("<iq type='get' id='d{}'/>", i)))
			.collect();
		for (req, _) in reqs.iter() {
			client.write(req).unwrap();
		}
		assert_eq!(client.requests().pending(), 5);
		client.disconnect().unwrap();
		assert_eq!(client.requests().pending(), 0);
		assert_eq!(client.bound_jid(), None);
		for (req, outcomes) in reqs {
			assert!(req.is_timed_out());
			let outcomes = outcomes.lock().unwrap();
			assert_eq!(outcomes.len(), 1);
			assert!(outcomes[0].as_ref().unwrap_err().is_timeout());
		}
	}

	#[test]
	fn unsupported_request_gets_feature_not_implemented() {
		let (client, wire) = connected();
		client.receive(b"<iq type='get' id='v1' from='romeo@example.net/orchard'><query xmlns='jabber:iq:version'/></iq>");
		assert_eq!(
			wire.last().unwrap(),
			"<iq xmlns=\"jabber:client\" type=\"error\" id=\"v1\" to=\"romeo@example.net/orchard\"><error type=\"cancel\" code=\"501\"><feature-not-implemented xmlns=\"urn:ietf:params:xml:ns:xmpp-stanzas\"/></error></iq>"
		);
		// unmatched replies and messages are not bounced
		client.receive(b"<iq type='result' id='zz'/><message from='a@b'><body>hi</body></message>");
		assert_eq!(wire.sent().len(), 1);
	}

	struct Scripted {
		name: &'static str,
		criteria: Criterion,
		seen: Arc<AtomicUsize>,
		behaviour: fn(&Element, &ClientHandle) -> Result<()>,
	}

	impl Module for Scripted {
		fn name(&self) -> &str {
			self.name
		}

		fn criteria(&self) -> Option<&Criterion> {
			Some(&self.criteria)
		}

		fn features(&self) -> &[&str] {
			&["urn:xmpp:ping"]
		}

		fn process(&self, element: &Element, client: &ClientHandle) -> Result<()> {
			self.seen.fetch_add(1, Ordering::SeqCst);
			(self.behaviour)(element, client)
		}
	}

	fn child_of_iq(ns: &str) -> Criterion {
		Criterion::Chain(vec![Criterion::name("iq"), Criterion::xmlns(ns)])
	}

	#[test]
	fn modules_answer_and_fail_with_replies() {
		let (client, wire) = connected();
		let seen = Arc::new(AtomicUsize::new(0));
		client.register_module(Scripted {
			name: "ping",
			criteria: child_of_iq("urn:xmpp:ping"),
			seen: seen.clone(),
			behaviour: |el, client| {
				let mut reply = crate::ElementBuilder::new("iq").attr("type", "result");
				if let Some(id) = el.id() {
					reply = reply.attr("id", id);
				}
				client.write_directly(reply.build())
			},
		});
		client.register_module(Scripted {
			name: "version",
			criteria: child_of_iq("jabber:iq:version"),
			seen: seen.clone(),
			behaviour: |_, _| {
				Err(Error::Stanza {
					condition: ErrorCondition::ItemNotFound,
					text: Some("nope".to_string()),
				})
			},
		});
		client.register_module(Scripted {
			name: "time",
			criteria: child_of_iq("urn:xmpp:time"),
			seen: seen.clone(),
			behaviour: |_, _| panic!("module bug"),
		});
		assert_eq!(client.available_features(), vec!["urn:xmpp:ping"]);

		client.receive(b"<iq type='get' id='p1' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>");
		assert_eq!(wire.last().unwrap(), "<iq type=\"result\" id=\"p1\"/>");

		client.receive(b"<iq type='get' id='v1' from='a@b/c'><query xmlns='jabber:iq:version'/></iq>");
		let reply = el(&wire.last().unwrap());
		assert_eq!(reply.attr("to"), Some("a@b/c"));
		assert_eq!(
			crate::parse_stanza_error(&reply),
			Some((ErrorCondition::ItemNotFound, Some("nope".to_string())))
		);

		client.receive(b"<iq type='get' id='t1' from='a@b/c'><time xmlns='urn:xmpp:time'/></iq>");
		let reply = el(&wire.last().unwrap());
		assert_eq!(
			crate::parse_stanza_error(&reply),
			Some((ErrorCondition::InternalServerError, None))
		);
		assert_eq!(seen.load(Ordering::SeqCst), 3);

		// results never reach modules
		client.receive(b"<iq type='result' id='x' from='example.com'><ping xmlns='urn:xmpp:ping'/></iq>");
		assert_eq!(seen.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn outgoing_filters_can_veto_and_drop() {
		let (client, wire) = connected();
		client.add_outgoing_filter(|el: Element, next: Next<'_>| {
			if el.name() == "message" {
				Err(Error::Vetoed("messages are disabled".to_string()))
			} else if el.name() == "presence" {
				Ok(None)
			} else {
				next.run(el)
			}
		});
		assert!(matches!(client.write_directly(el("<message/>")), Err(Error::Vetoed(_))));
		client.write_directly(el("<presence/>")).unwrap();
		assert!(wire.sent().is_empty());
		let req = client.request(el("<iq type='get' id='f1'/>")).build();
		client.write(&req).unwrap();
		assert_eq!(wire.sent().len(), 1);
	}

	#[test]
	fn dropped_stanza_fails_its_request() {
		let (client, wire) = connected();
		client.add_outgoing_filter(|el: Element, next: Next<'_>| match el.id() {
			Some(id) if id.starts_with("drop") => Ok(None),
			_ => next.run(el),
		});
		let (iq, iq_outcomes) = tracked(&client, "<iq type='get' id='drop1'/>");
		client.write(&iq).unwrap();
		let (msg, msg_outcomes) = tracked(&client, "<message to='a@b' id='drop2'><body>hi</body></message>");
		client.write(&msg).unwrap();
		assert!(wire.sent().is_empty());
		assert_eq!(client.requests().pending(), 0);
		for (req, outcomes) in [(iq, iq_outcomes), (msg, msg_outcomes)] {
			assert!(req.is_completed());
			assert!(!req.is_sent());
			let outcomes = outcomes.lock().unwrap();
			assert_eq!(outcomes.len(), 1);
			assert!(matches!(outcomes[0], Err(RequestError::Dropped)));
		}
	}

	#[test]
	fn vetoed_stanza_fails_its_request() {
		let (client, _) = connected();
		client.add_outgoing_filter(|_: Element, _: Next<'_>| -> Result<Option<Element>> {
			Err(Error::Vetoed("no".to_string()))
		});
		let (req, outcomes) = tracked(&client, "<iq type='get' id='v1'/>");
		assert!(matches!(client.write(&req), Err(Error::Vetoed(_))));
		assert_eq!(client.requests().pending(), 0);
		assert!(matches!(outcomes.lock().unwrap()[..], [Err(RequestError::Internal(_))]));
	}

	#[test]
	fn completion_callback_can_write() {
		let (client, wire) = connected();
		let writer = client.clone();
		let req = client
			.request(el("<iq type='get' id='c1'/>"))
			.response(move |_| {
				writer.write_directly(el("<presence/>")).unwrap();
			})
			.build();
		client.write(&req).unwrap();
		client.receive(b"<iq type='result' id='c1' from='example.com'/>");
		assert_eq!(wire.last().unwrap(), "<presence/>");
	}

	#[test]
	fn incoming_filter_sees_stanzas_first() {
		let (client, wire) = connected();
		client.add_incoming_filter(|_: Element, _: Next<'_>| Ok(None));
		client.receive(b"<iq type='get' id='q' from='a@b/c'><query xmlns='urn:x'/></iq>");
		assert!(wire.sent().is_empty());
	}

	#[test]
	fn stream_management_defers_sent_until_acknowledged() {
		let (client, wire) = connected();
		client.enable_stream_management().unwrap();
		assert_eq!(wire.last().unwrap(), "<enable xmlns=\"urn:xmpp:sm:3\" resume=\"false\"/>");
		client.receive(b"<enabled xmlns='urn:xmpp:sm:3' id='sm-1'/>");

		let (msg, outcomes) = tracked(&client, "<message to='a@b' id='m1'><body>hi</body></message>");
		client.write(&msg).unwrap();
		assert!(!msg.is_sent());
		assert!(!msg.is_completed());

		client.tick();
		assert_eq!(wire.last().unwrap(), "<r xmlns=\"urn:xmpp:sm:3\"/>");

		client.receive(b"<a xmlns='urn:xmpp:sm:3' h='1'/>");
		assert!(msg.is_sent());
		assert_eq!(outcomes.lock().unwrap().len(), 1);

		client.receive(b"<message from='a@b'><body>x</body></message><r xmlns='urn:xmpp:sm:3'/>");
		assert_eq!(wire.last().unwrap(), "<a xmlns=\"urn:xmpp:sm:3\" h=\"1\"/>");

		let before = wire.sent().len();
		client.disconnect().unwrap();
		let sent = wire.sent();
		assert_eq!(sent.len(), before + 1);
		assert_eq!(sent.last().unwrap(), "<a xmlns=\"urn:xmpp:sm:3\" h=\"1\"/>");
	}

	#[test]
	fn unacknowledged_requests_time_out_on_disconnect() {
		let (client, _) = connected();
		client.enable_stream_management().unwrap();
		client.receive(b"<enabled xmlns='urn:xmpp:sm:3' id='sm-1'/>");
		let (msg, outcomes) = tracked(&client, "<message to='a@b'><body>hi</body></message>");
		client.write(&msg).unwrap();
		assert!(!msg.is_completed());
		assert_eq!(client.requests().pending(), 0);

		client.disconnect().unwrap();
		client.tick();
		assert!(msg.is_timed_out());
		let outcomes = outcomes.lock().unwrap();
		assert_eq!(outcomes.len(), 1);
		assert!(outcomes[0].as_ref().unwrap_err().is_timeout());
	}

	#[test]
	fn failed_enable_counts_held_requests_as_sent() {
		let (client, _) = connected();
		client.enable_stream_management().unwrap();
		client.receive(b"<enabled xmlns='urn:xmpp:sm:3' id='sm-1'/>");
		let (msg, outcomes) = tracked(&client, "<message to='a@b' id='f1'><body>hi</body></message>");
		client.write(&msg).unwrap();
		client.receive(b"<failed xmlns='urn:xmpp:sm:3'/>");
		assert!(msg.is_sent());
		assert!(outcomes.lock().unwrap()[0].is_ok());
	}

	#[test]
	fn parse_error_reconnects() {
		let (client, wire) = connected();
		let mut rx = client.subscribe();
		client.receive(b"</wrong>");
		assert_eq!(wire.starts.load(Ordering::SeqCst), 2);
		assert_eq!(client.state(), State::Connecting);
		let mut saw_parse_error = false;
		while let Ok(ev) = rx.try_recv() {
			if let Event::ParseError(XmlError::UnbalancedClose(name)) = ev {
				assert_eq!(name, "wrong");
				saw_parse_error = true;
			}
		}
		assert!(saw_parse_error);
		// the new connection starts with a fresh parser
		client.receive(HEADER);
		client.receive(b"<iq type='get' id='x' from='a@b/c'><q xmlns='urn:x'/></iq>");
		assert!(wire.last().unwrap().contains("feature-not-implemented"));
	}

	#[test]
	fn parse_error_without_auto_reconnect_stops() {
		let (client, wire) = connected_with(ClientConfig::new("example.com").auto_reconnect(false));
		client.receive(b"<a></b>");
		assert_eq!(wire.starts.load(Ordering::SeqCst), 1);
		assert_eq!(client.state(), State::Stopped);
	}

	#[test]
	fn forced_reconnect_ignores_setting() {
		let (client, wire) = connected_with(ClientConfig::new("example.com").auto_reconnect(false));
		client.session_event(SessionEvent::ErrorReconnect {
			message: "see-other-host".to_string(),
			immediately: true,
			force: true,
		});
		assert_eq!(wire.starts.load(Ordering::SeqCst), 2);
		assert_eq!(client.state(), State::Connecting);
	}

	#[test]
	fn reports_from_replaced_connector_are_ignored() {
		let (client, wire) = connected();
		client.session_event(SessionEvent::ErrorReconnect {
			message: "see-other-host".to_string(),
			immediately: true,
			force: true,
		});
		assert_eq!(wire.starts.load(Ordering::SeqCst), 2);
		assert_eq!(wire.stops.load(Ordering::SeqCst), 1);

		let handles = wire.handles.lock().unwrap().clone();
		assert_eq!(handles.len(), 2);
		let stale = &handles[0];
		stale
			.connector_state_changed(ConnectorState::Connected, ConnectorState::Disconnected)
			.unwrap();
		stale.receive(b"</wrong>").unwrap();
		stale
			.session_event(SessionEvent::ErrorStop("late".to_string()))
			.unwrap();
		assert_eq!(wire.starts.load(Ordering::SeqCst), 2);
		assert_eq!(wire.stops.load(Ordering::SeqCst), 1);
		assert_eq!(client.state(), State::Connecting);

		// the current connection's handle is still heard
		handles[1].session_event(SessionEvent::Successful).unwrap();
		assert_eq!(client.state(), State::Connected);
		handles[1]
			.connector_state_changed(ConnectorState::Connected, ConnectorState::Disconnected)
			.unwrap();
		assert_eq!(wire.starts.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn error_stop_disconnects() {
		let (client, wire) = connected();
		client.session_event(SessionEvent::ErrorStop("not-authorized".to_string()));
		assert_eq!(client.state(), State::Stopped);
		assert_eq!(wire.starts.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn lost_transport_reconnects() {
		let (client, wire) = connected();
		client
			.handle()
			.connector_state_changed(ConnectorState::Connected, ConnectorState::Disconnected)
			.unwrap();
		assert_eq!(wire.starts.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn tick_expires_requests() {
		let (client, _) = connected();
		let expired = client
			.request(el("<iq type='get' id='slow'/>"))
			.timeout(Duration::ZERO)
			.build();
		let (live, outcomes) = tracked(&client, "<iq type='get' id='fast'/>");
		client.write(&expired).unwrap();
		client.write(&live).unwrap();
		client.tick();
		assert!(expired.is_timed_out());
		assert_eq!(client.requests().pending(), 1);
		assert!(outcomes.lock().unwrap().is_empty());
	}

	#[test]
	fn handle_does_not_keep_client_alive() {
		let (client, _) = client_with(ClientConfig::new("example.com"), false);
		let handle = client.handle();
		assert_eq!(handle.state(), Some(State::Stopped));
		drop(client);
		assert!(handle.upgrade().is_none());
		assert!(matches!(handle.write_directly(el("<presence/>")), Err(Error::ClientGone)));
	}

	#[tokio::test]
	async fn ticker_sweeps_in_background() {
		let (client, _) = connected_with(ClientConfig::new("example.com").tick_interval(Duration::from_millis(10)));
		let req = client
			.request(el("<iq type='get' id='bg'/>"))
			.timeout(Duration::from_millis(1))
			.build();
		client.write(&req).unwrap();
		let ticker = client.spawn_ticker();
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(req.is_timed_out());
		ticker.abort();
	}
}
