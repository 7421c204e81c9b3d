/*!
# Client-side XMPP stream engine

This crate implements the protocol core of an XMPP client, independent of
any particular transport:

* an incremental XML [`Tokenizer`] which can be fed arbitrarily split
  chunks of bytes,
* a [`StanzaAssembler`] turning its output into complete stanzas
  ([`Element`]) below the stream root,
* a [`RequestsManager`] correlating replies with the [`Request`]s they
  answer, including timeouts and chained response transforms,
* and the [`Client`], which ties those together with filters, modules,
  stream management acknowledgements and the connection lifecycle.

Bytes are moved by a [`Connector`] supplied by the application.

## Example

```
use rxmpp::{StreamParser, StreamEvent, RequestBuilder, RequestsManager, ElementBuilder};

let requests = RequestsManager::default();
let ping = ElementBuilder::new("iq")
	.attr("type", "get")
	.attr("id", "p1")
	.attr("to", "example.com")
	.child(ElementBuilder::new("ping").xmlns("urn:xmpp:ping").build())
	.build();
let request = RequestBuilder::new(ping).build();
requests.register(&request);

let mut parser = StreamParser::new();
parser.parse(b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>");
for ev in parser.parse(b"<iq type='result' id='p1' from='example.com'/>") {
	if let StreamEvent::Element(el) = ev {
		assert!(requests.find_and_dispatch(&el));
	}
}
assert!(request.is_completed());
```

## Features

* `async` (default): [`StanzaReader`] for parsing from a
  [`tokio::io::AsyncRead`].
* `stream`: implements [`futures_core::Stream`] for [`StanzaReader`].
*/
#![deny(unsafe_code)]

pub mod assembler;
pub mod client;
pub mod connector;
pub mod element;
pub mod error;
pub mod escape;
pub mod executor;
pub mod filter;
pub mod jid;
pub mod module;
#[cfg(feature = "async")]
pub mod reader;
pub mod request;
pub mod requests;
pub mod sm;
pub mod stanza_error;
pub mod tokenizer;


#[doc(inline)]
pub use assembler::{parse_element, StanzaAssembler, StreamEvent, StreamParser, STREAM_ROOT, XMLNS_STREAMS};
#[doc(inline)]
pub use client::{Client, ClientConfig, ClientHandle, Event, State};
#[doc(inline)]
pub use connector::{Connector, ConnectorFactory, ConnectorState, SessionController, SessionEvent};
#[doc(inline)]
pub use element::{Element, ElementBuilder, Name};
#[doc(inline)]
pub use error::{Error, Result, XmlError};
#[doc(inline)]
pub use executor::Executor;
#[doc(inline)]
pub use filter::{FilterChain, Next, StanzaFilter};
#[doc(inline)]
pub use jid::{BareJid, Jid, JidError};
#[doc(inline)]
pub use module::{Criterion, Module, ModulesManager};
#[cfg(feature = "async")]
#[doc(inline)]
pub use reader::StanzaReader;
#[doc(inline)]
pub use request::{Request, RequestBuilder, RequestError, DEFAULT_TIMEOUT};
#[doc(inline)]
pub use requests::RequestsManager;
#[doc(inline)]
pub use sm::{AckState, XMLNS_SM};
#[doc(inline)]
pub use stanza_error::{error_reply, parse_stanza_error, ErrorCondition, ErrorType, XMLNS_STANZAS};
#[doc(inline)]
pub use tokenizer::{TokenHandler, Tokenizer, TokenizerOptions, TokenizerState};
