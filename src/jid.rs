/*!
# Addresses

`localpart@domain/resource`, with the local part and resource optional.
No stringprep or case folding is applied: two addresses are equal if their
parts are byte-for-byte equal.
*/
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
	#[error("address has no domain")]
	EmptyDomain,
	#[error("address has an empty local part")]
	EmptyLocal,
	#[error("address has an empty resource")]
	EmptyResource,
}

/// Address without a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BareJid {
	local: Option<String>,
	domain: String,
}

/// Address with an optional resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
	bare: BareJid,
	resource: Option<String>,
}

impl BareJid {
	pub fn new(local: Option<&str>, domain: &str) -> Result<Self, JidError> {
		if domain.is_empty() {
			return Err(JidError::EmptyDomain);
		}
		if local == Some("") {
			return Err(JidError::EmptyLocal);
		}
		Ok(Self {
			local: local.map(str::to_string),
			domain: domain.to_string(),
		})
	}

	pub fn local(&self) -> Option<&str> {
		self.local.as_deref()
	}

	pub fn domain(&self) -> &str {
		&self.domain
	}

	/// True for a plain domain address (`example.com`).
	pub fn is_domain(&self) -> bool {
		self.local.is_none()
	}

	pub fn with_resource(self, resource: &str) -> Result<Jid, JidError> {
		if resource.is_empty() {
			return Err(JidError::EmptyResource);
		}
		Ok(Jid {
			bare: self,
			resource: Some(resource.to_string()),
		})
	}
}

impl Jid {
	pub fn bare(&self) -> &BareJid {
		&self.bare
	}

	pub fn into_bare(self) -> BareJid {
		self.bare
	}

	pub fn local(&self) -> Option<&str> {
		self.bare.local()
	}

	pub fn domain(&self) -> &str {
		self.bare.domain()
	}

	pub fn resource(&self) -> Option<&str> {
		self.resource.as_deref()
	}

	/// True for a plain domain address without resource.
	pub fn is_domain(&self) -> bool {
		self.bare.is_domain() && self.resource.is_none()
	}
}

impl From<BareJid> for Jid {
	fn from(bare: BareJid) -> Self {
		Self {
			bare,
			resource: None,
		}
	}
}

impl FromStr for BareJid {
	type Err = JidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let jid: Jid = s.parse()?;
		Ok(jid.bare)
	}
}

impl FromStr for Jid {
	type Err = JidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (rest, resource) = match s.split_once('/') {
			Some((_, "")) => return Err(JidError::EmptyResource),
			Some((rest, res)) => (rest, Some(res)),
			None => (s, None),
		};
		let (local, domain) = match rest.split_once('@') {
			Some((local, domain)) => (Some(local), domain),
			None => (None, rest),
		};
		let bare = BareJid::new(local, domain)?;
		Ok(match resource {
			Some(res) => bare.with_resource(res)?,
			None => bare.into(),
		})
	}
}

impl fmt::Display for BareJid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if let Some(local) = self.local.as_deref() {
			write!(f, "{}@", local)?;
		}
		f.write_str(&self.domain)
	}
}

impl fmt::Display for Jid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.bare, f)?;
		if let Some(res) = self.resource.as_deref() {
			write!(f, "/{}", res)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_all_forms() {
		let full: Jid = "user@example.com/res/with/slash".parse().unwrap();
		assert_eq!(full.local(), Some("user"));
		assert_eq!(full.domain(), "example.com");
		assert_eq!(full.resource(), Some("res/with/slash"));
		assert_eq!(full.to_string(), "user@example.com/res/with/slash");

		let bare: Jid = "user@example.com".parse().unwrap();
		assert_eq!(bare.resource(), None);
		assert_eq!(full.bare(), bare.bare());

		let domain: Jid = "example.com".parse().unwrap();
		assert!(domain.is_domain());
		assert!(!bare.is_domain());

		let domain_res: Jid = "example.com/x".parse().unwrap();
		assert!(!domain_res.is_domain());
		assert!(domain_res.bare().is_domain());
	}

	#[test]
	fn rejects_empty_parts() {
		assert_eq!("".parse::<Jid>(), Err(JidError::EmptyDomain));
		assert_eq!("user@".parse::<Jid>(), Err(JidError::EmptyDomain));
		assert_eq!("@example.com".parse::<Jid>(), Err(JidError::EmptyLocal));
		assert_eq!("user@example.com/".parse::<Jid>(), Err(JidError::EmptyResource));
	}

	#[test]
	fn bare_from_str_drops_resource() {
		let bare: BareJid = "a@b/c".parse().unwrap();
		assert_eq!(bare.to_string(), "a@b");
	}
}
