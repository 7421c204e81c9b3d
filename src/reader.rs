/*!
# Asynchronous stanza reader

[`StanzaReader`] wraps a [`tokio::io::AsyncRead`] and yields the
[`StreamEvent`]s parsed from it. With the `stream` feature it also
implements [`futures_core::Stream`].

```
# tokio_test::block_on(async {
use rxmpp::{StanzaReader, StreamEvent};

let data: &[u8] = b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'><presence/>";
let mut reader = StanzaReader::new(data);
assert!(matches!(reader.next_event().await.unwrap(), Some(StreamEvent::StreamOpened(_))));
match reader.next_event().await.unwrap() {
	Some(StreamEvent::Element(el)) => assert_eq!(el.name(), "presence"),
	other => panic!("unexpected event: {:?}", other),
}
assert!(reader.next_event().await.unwrap().is_none());
# })
```
*/
use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

#[cfg(feature = "stream")]
use futures_core::stream::Stream;

use crate::assembler::{StreamEvent, StreamParser};
use crate::tokenizer::TokenizerOptions;

const READ_BUFFER_SIZE: usize = 8192;

pin_project! {
	/// Parses events out of an async byte source.
	pub struct StanzaReader<T> {
		#[pin]
		inner: T,
		parser: StreamParser,
		pending: VecDeque<StreamEvent>,
		buf: Box<[u8]>,
		eof: bool,
	}
}

impl<T: AsyncRead> StanzaReader<T> {
	pub fn new(inner: T) -> Self {
		Self::with_options(inner, TokenizerOptions::default())
	}

	pub fn with_options(inner: T, options: TokenizerOptions) -> Self {
		Self {
			inner,
			parser: StreamParser::with_options(options),
			pending: VecDeque::new(),
			buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
			eof: false,
		}
	}

	pub fn get_ref(&self) -> &T {
		&self.inner
	}

	pub fn get_mut(&mut self) -> &mut T {
		&mut self.inner
	}

	pub fn into_inner(self) -> T {
		self.inner
	}

	/// Forget parser state, e.g. after the stream was restarted.
	pub fn reset(&mut self) {
		self.parser.reset();
		self.pending.clear();
	}

	/// Poll for the next event.
	///
	/// `None` is returned at the end of the source and after the stream
	/// turned out to be malformed (the [`StreamEvent::Error`] itself is
	/// delivered first).
	pub fn poll_next_event(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<Option<StreamEvent>>> {
		let mut this = self.project();
		loop {
			if let Some(ev) = this.pending.pop_front() {
				return Poll::Ready(Ok(Some(ev)));
			}
			if *this.eof || this.parser.is_error() {
				return Poll::Ready(Ok(None));
			}
			let mut rb = ReadBuf::new(&mut this.buf[..]);
			ready!(this.inner.as_mut().poll_read(cx, &mut rb))?;
			let filled = rb.filled();
			if filled.is_empty() {
				*this.eof = true;
				continue;
			}
			this.pending.extend(this.parser.parse(filled));
		}
	}

	/// Read the next event.
	pub async fn next_event(&mut self) -> io::Result<Option<StreamEvent>>
	where
		T: Unpin,
	{
		poll_fn(|cx| Pin::new(&mut *self).poll_next_event(cx)).await
	}
}

#[cfg(feature = "stream")]
impl<T: AsyncRead> Stream for StanzaReader<T> {
	type Item = io::Result<StreamEvent>;

	fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
		match ready!(self.poll_next_event(cx)) {
			Ok(Some(ev)) => Poll::Ready(Some(Ok(ev))),
			Ok(None) => Poll::Ready(None),
			Err(e) => Poll::Ready(Some(Err(e))),
		}
	}
}
