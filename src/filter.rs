/*!
# Stanza filters

Filters see every stanza on its way in or out and may pass it on
unchanged, pass on a different element, drop it (by returning `Ok(None)`
without calling the continuation) or veto it with an error.

```
use rxmpp::{ElementBuilder, FilterChain, Next};

let mut chain = FilterChain::new();
chain.push(|el: rxmpp::Element, next: Next<'_>| {
	next.run(el.into_builder().attr("seen", "1").build())
});
let out = chain.apply(ElementBuilder::new("message").build()).unwrap().unwrap();
assert_eq!(out.attr("seen"), Some("1"));
```
*/
use std::fmt;
use std::sync::Arc;

use crate::element::Element;
use crate::error::Result;

/// Continuation handed to a [`StanzaFilter`].
pub struct Next<'a> {
	rest: &'a [Arc<dyn StanzaFilter>],
}

impl Next<'_> {
	/// Pass `element` to the remaining filters.
	pub fn run(self, element: Element) -> Result<Option<Element>> {
		match self.rest.split_first() {
			Some((filter, rest)) => filter.filter(element, Next { rest }),
			None => Ok(Some(element)),
		}
	}
}

pub trait StanzaFilter: Send + Sync {
	fn filter(&self, element: Element, next: Next<'_>) -> Result<Option<Element>>;
}

impl<F> StanzaFilter for F
where
	F: Fn(Element, Next<'_>) -> Result<Option<Element>> + Send + Sync,
{
	fn filter(&self, element: Element, next: Next<'_>) -> Result<Option<Element>> {
		self(element, next)
	}
}

/// Filters applied in the order they were added.
#[derive(Clone, Default)]
pub struct FilterChain {
	filters: Vec<Arc<dyn StanzaFilter>>,
}

impl fmt::Debug for FilterChain {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FilterChain").field("len", &self.filters.len()).finish()
	}
}

impl FilterChain {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push<F: StanzaFilter + 'static>(&mut self, filter: F) {
		self.filters.push(Arc::new(filter));
	}

	pub fn push_arc(&mut self, filter: Arc<dyn StanzaFilter>) {
		self.filters.push(filter);
	}

	/// Append all filters of `other`.
	pub fn extend(&mut self, other: &FilterChain) {
		self.filters.extend(other.filters.iter().cloned());
	}

	pub fn len(&self) -> usize {
		self.filters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.filters.is_empty()
	}

	/// Run `element` through all filters.
	pub fn apply(&self, element: Element) -> Result<Option<Element>> {
		Next { rest: &self.filters }.run(element)
	}
}
