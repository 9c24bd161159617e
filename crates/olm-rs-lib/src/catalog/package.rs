//! Package manifests.

use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
	pub name: String,
	/// Name of the bundle at the head of the channel.
	pub current_bundle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
	pub name: String,
	#[serde(default)]
	pub channels: Vec<Channel>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub default_channel: Option<String>,
}

impl PackageManifest {
	pub fn channel(&self, name: &str) -> Option<&Channel> {
		self.channels.iter().find(|c| c.name == name)
	}

	pub fn head_of(&self, channel: &str) -> Option<&str> {
		self.channel(channel).map(|c| c.current_bundle.as_str())
	}

	/// Head of the default channel, a package with a single channel treats it as the default.
	pub fn default_head(&self) -> Option<&str> {
		match &self.default_channel {
			Some(c) => self.head_of(c),
			None if self.channels.len() == 1 => Some(self.channels[0].current_bundle.as_str()),
			None => None,
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn single_channel_is_default() {
		let p = PackageManifest {
			name: "p".into(),
			channels: vec![Channel { name: "alpha".into(), current_bundle: "p-v1".into() }],
			default_channel: None,
		};
		assert_eq!(p.default_head(), Some("p-v1"));
	}
}
