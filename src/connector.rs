/*!
# Transport interfaces

The client does not know how bytes get to the server. A [`Connector`]
owns the transport; it is created by the client's connector factory for
every connection attempt and reports back through the
[`ClientHandle`](crate::ClientHandle) it was given: received data, its
own state changes and, through its [`SessionController`], the outcome of
stream negotiation.
*/
use std::fmt;
use std::sync::Arc;

use crate::client::ClientHandle;
use crate::error::Result;

/// State of the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
	Connecting,
	Connected,
	Disconnecting,
	Disconnected,
}

impl fmt::Display for ConnectorState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Connecting => "connecting",
			Self::Connected => "connected",
			Self::Disconnecting => "disconnecting",
			Self::Disconnected => "disconnected",
		})
	}
}

/// Outcome reported by a [`SessionController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// The session is established and stanzas may flow.
	Successful,
	/// Fatal failure; the client disconnects.
	ErrorStop(String),
	/// Failure after which the client reconnects if automatic reconnection
	/// is enabled, or unconditionally if `force` is set.
	ErrorReconnect {
		message: String,
		immediately: bool,
		force: bool,
	},
}

/// Drives stream negotiation (TLS, authentication, binding) over one
/// connector.
pub trait SessionController: Send + Sync {
	fn start(&self) -> Result<()>;
	fn stop(&self);
}

pub trait Connector: Send + Sync {
	fn start(&self) -> Result<()>;
	fn stop(&self) -> Result<()>;

	/// Queue serialized data for writing.
	fn send(&self, data: &str) -> Result<()>;

	fn state(&self) -> ConnectorState;

	fn create_session_controller(&self) -> Arc<dyn SessionController>;
}

/// Creates a fresh connector for each connection attempt.
pub type ConnectorFactory = Box<dyn Fn(ClientHandle) -> Arc<dyn Connector> + Send + Sync>;
