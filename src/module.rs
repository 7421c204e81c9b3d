/*!
# Feature modules

A [`Module`] declares which inbound stanzas it wants through a
[`Criterion`], advertises feature names and processes the stanzas it
matched. Modules are kept by [`ModulesManager`] in registration order and
consulted in that order.
*/
use std::fmt;
use std::sync::Arc;

use crate::client::ClientHandle;
use crate::element::Element;
use crate::error::Result;
use crate::filter::{FilterChain, StanzaFilter};

/// Predicate over elements.
#[derive(Clone)]
pub enum Criterion {
	Name(String),
	Xmlns(String),
	NameXmlns(String, String),
	/// First criterion matches the element itself, each following one
	/// matches some child of the element matched before.
	Chain(Vec<Criterion>),
	And(Vec<Criterion>),
	Or(Vec<Criterion>),
	Not(Box<Criterion>),
	Custom(Arc<dyn Fn(&Element) -> bool + Send + Sync>),
}

impl fmt::Debug for Criterion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Name(n) => f.debug_tuple("Name").field(n).finish(),
			Self::Xmlns(ns) => f.debug_tuple("Xmlns").field(ns).finish(),
			Self::NameXmlns(n, ns) => f.debug_tuple("NameXmlns").field(n).field(ns).finish(),
			Self::Chain(c) => f.debug_tuple("Chain").field(c).finish(),
			Self::And(c) => f.debug_tuple("And").field(c).finish(),
			Self::Or(c) => f.debug_tuple("Or").field(c).finish(),
			Self::Not(c) => f.debug_tuple("Not").field(c).finish(),
			Self::Custom(_) => f.write_str("Custom(..)"),
		}
	}
}

impl Criterion {
	pub fn name<S: Into<String>>(name: S) -> Self {
		Self::Name(name.into())
	}

	pub fn xmlns<S: Into<String>>(xmlns: S) -> Self {
		Self::Xmlns(xmlns.into())
	}

	pub fn name_xmlns<N: Into<String>, S: Into<String>>(name: N, xmlns: S) -> Self {
		Self::NameXmlns(name.into(), xmlns.into())
	}

	pub fn custom<F: Fn(&Element) -> bool + Send + Sync + 'static>(f: F) -> Self {
		Self::Custom(Arc::new(f))
	}

	pub fn matches(&self, element: &Element) -> bool {
		match self {
			Self::Name(n) => element.name() == n.as_str(),
			Self::Xmlns(ns) => element.xmlns() == Some(ns.as_str()),
			Self::NameXmlns(n, ns) => element.name() == n.as_str() && element.xmlns() == Some(ns.as_str()),
			Self::Chain(steps) => {
				let (first, rest) = match steps.split_first() {
					Some(v) => v,
					None => return false,
				};
				if !first.matches(element) {
					return false;
				}
				let mut current = element;
				for step in rest {
					match current.children().iter().find(|c| step.matches(c)) {
						Some(child) => current = child,
						None => return false,
					}
				}
				true
			}
			Self::And(all) => all.iter().all(|c| c.matches(element)),
			Self::Or(any) => any.iter().any(|c| c.matches(element)),
			Self::Not(c) => !c.matches(element),
			Self::Custom(f) => f(element),
		}
	}
}

/// Pluggable protocol feature.
pub trait Module: Send + Sync {
	/// Unique name; registering another module with the same name replaces
	/// this one.
	fn name(&self) -> &str;

	/// Stanzas to route to [`process`](Self::process). `None` means none.
	fn criteria(&self) -> Option<&Criterion>;

	/// Feature names to advertise.
	fn features(&self) -> &[&str] {
		&[]
	}

	fn incoming_filter(&self) -> Option<Arc<dyn StanzaFilter>> {
		None
	}

	fn outgoing_filter(&self) -> Option<Arc<dyn StanzaFilter>> {
		None
	}

	/// Handle a matched inbound stanza.
	///
	/// An error is answered with an error reply to the sender. Use
	/// [`Error::Stanza`](crate::Error::Stanza) to pick the condition.
	fn process(&self, element: &Element, client: &ClientHandle) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct ModulesManager {
	modules: Vec<Arc<dyn Module>>,
}

impl fmt::Debug for ModulesManager {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_list().entries(self.modules.iter().map(|m| m.name())).finish()
	}
}

impl ModulesManager {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register<M: Module + 'static>(&mut self, module: M) {
		self.register_arc(Arc::new(module))
	}

	pub fn register_arc(&mut self, module: Arc<dyn Module>) {
		match self.modules.iter_mut().find(|m| m.name() == module.name()) {
			Some(slot) => *slot = module,
			None => self.modules.push(module),
		}
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
		self.modules.iter().find(|m| m.name() == name).cloned()
	}

	pub fn is_registered(&self, name: &str) -> bool {
		self.modules.iter().any(|m| m.name() == name)
	}

	pub fn len(&self) -> usize {
		self.modules.len()
	}

	pub fn is_empty(&self) -> bool {
		self.modules.is_empty()
	}

	/// Union of all modules' features, first occurrence wins.
	pub fn available_features(&self) -> Vec<String> {
		let mut out: Vec<String> = Vec::new();
		for f in self.modules.iter().flat_map(|m| m.features().iter()) {
			if !out.iter().any(|o| o == f) {
				out.push(f.to_string());
			}
		}
		out
	}

	pub fn modules_for(&self, element: &Element) -> Vec<Arc<dyn Module>> {
		self.modules
			.iter()
			.filter(|m| m.criteria().map(|c| c.matches(element)).unwrap_or(false))
			.cloned()
			.collect()
	}

	pub fn incoming_filters(&self) -> FilterChain {
		let mut chain = FilterChain::new();
		for f in self.modules.iter().filter_map(|m| m.incoming_filter()) {
			chain.push_arc(f);
		}
		chain
	}

	pub fn outgoing_filters(&self) -> FilterChain {
		let mut chain = FilterChain::new();
		for f in self.modules.iter().filter_map(|m| m.outgoing_filter()) {
			chain.push_arc(f);
		}
		chain
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::parse_element;

	struct Dummy {
		name: &'static str,
		criteria: Option<Criterion>,
		features: Vec<&'static str>,
	}

	impl Module for Dummy {
		fn name(&self) -> &str {
			self.name
		}

		fn criteria(&self) -> Option<&Criterion> {
			self.criteria.as_ref()
		}

		fn features(&self) -> &[&str] {
			&self.features
		}

		fn process(&self, _: &Element, _: &ClientHandle) -> Result<()> {
			Ok(())
		}
	}

	fn el(xml: &str) -> Element {
		parse_element(xml).unwrap()
	}

	#[test]
	fn criteria_combinators() {
		let ping = el("<iq type='get'><ping xmlns='urn:xmpp:ping'/></iq>");
		let msg = el("<message xmlns='jabber:client'><body>x</body></message>");

		assert!(Criterion::name("iq").matches(&ping));
		assert!(!Criterion::name("iq").matches(&msg));
		assert!(Criterion::xmlns("jabber:client").matches(&msg));
		assert!(Criterion::name_xmlns("message", "jabber:client").matches(&msg));
		assert!(!Criterion::name_xmlns("message", "jabber:server").matches(&msg));

		let chain = Criterion::Chain(vec![Criterion::name("iq"), Criterion::name_xmlns("ping", "urn:xmpp:ping")]);
		assert!(chain.matches(&ping));
		assert!(!chain.matches(&msg));
		assert!(!Criterion::Chain(vec![]).matches(&ping));

		assert!(Criterion::Or(vec![Criterion::name("iq"), Criterion::name("message")]).matches(&msg));
		assert!(!Criterion::And(vec![Criterion::name("iq"), Criterion::name("message")]).matches(&msg));
		assert!(Criterion::Not(Box::new(Criterion::name("iq"))).matches(&msg));
		assert!(Criterion::custom(|e| e.stanza_type() == Some("get")).matches(&ping));
	}

	#[test]
	fn manager_routes_in_registration_order() {
		let mut mgr = ModulesManager::new();
		mgr.register(Dummy {
			name: "b",
			criteria: Some(Criterion::name("iq")),
			features: vec!["urn:b", "urn:shared"],
		});
		mgr.register(Dummy {
			name: "a",
			criteria: Some(Criterion::xmlns("urn:x")),
			features: vec!["urn:shared", "urn:a"],
		});
		mgr.register(Dummy {
			name: "silent",
			criteria: None,
			features: vec![],
		});
		let names: Vec<String> = mgr
			.modules_for(&el("<iq xmlns='urn:x'/>"))
			.iter()
			.map(|m| m.name().to_string())
			.collect();
		assert_eq!(names, vec!["b", "a"]);
		assert_eq!(mgr.available_features(), vec!["urn:b", "urn:shared", "urn:a"]);
		assert!(mgr.is_registered("silent"));
		assert!(mgr.modules_for(&el("<message/>")).is_empty());
	}

	#[test]
	fn registering_same_name_replaces() {
		let mut mgr = ModulesManager::new();
		mgr.register(Dummy {
			name: "a",
			criteria: Some(Criterion::name("iq")),
			features: vec![],
		});
		mgr.register(Dummy {
			name: "a",
			criteria: Some(Criterion::name("message")),
			features: vec![],
		});
		assert_eq!(mgr.len(), 1);
		assert_eq!(mgr.modules_for(&el("<message/>")).len(), 1);
		assert!(mgr.modules_for(&el("<iq/>")).is_empty());
	}
}
