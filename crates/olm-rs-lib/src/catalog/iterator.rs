use std::sync::Arc;

use super::{ApiKey, Bundle};

pub struct Owning<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	api: ApiKey,
	underlying: I,
}

impl<'a, I> Iterator for Owning<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	type Item = I::Item;

	fn next(&mut self) -> Option<Self::Item> {
		self.underlying.by_ref().find(|b| b.owns(&self.api))
	}
}

pub trait OwningExt<'a>: Iterator<Item = &'a Arc<Bundle>>
{
	/// Filters the iterator to bundles providing `api`
	fn owning(self, api: &ApiKey) -> Owning<'a, Self>
	where
		Self: Sized,
	{
		Owning { underlying: self, api: api.clone() }
	}
}

impl<'a, I: Iterator<Item = &'a Arc<Bundle>>> OwningExt<'a> for I {}


pub struct InPackage<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	package: String,
	underlying: I,
}

impl<'a, I> Iterator for InPackage<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	type Item = I::Item;

	fn next(&mut self) -> Option<Self::Item> {
		for bundle in self.underlying.by_ref() {
			if bundle.package == self.package {
				return Some(bundle)
			}
		}
		None
	}
}

pub trait InPackageExt<'a>: Iterator<Item = &'a Arc<Bundle>>
{
	/// Filters the iterator to bundles of `package`
	fn in_package(self, package: &str) -> InPackage<'a, Self>
	where
		Self: Sized,
	{
		InPackage { underlying: self, package: package.to_string() }
	}
}

impl<'a, I: Iterator<Item = &'a Arc<Bundle>>> InPackageExt<'a> for I {}


pub struct InChannel<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	channel: String,
	underlying: I,
}

impl<'a, I> Iterator for InChannel<'a, I>
where
	I: Iterator<Item = &'a Arc<Bundle>>,
{
	type Item = I::Item;

	fn next(&mut self) -> Option<Self::Item> {
		self.underlying.by_ref().find(|b| b.in_channel(&self.channel))
	}
}

pub trait InChannelExt<'a>: Iterator<Item = &'a Arc<Bundle>>
{
	/// Filters the iterator to bundles that are members of `channel`
	fn in_channel(self, channel: &str) -> InChannel<'a, Self>
	where
		Self: Sized,
	{
		InChannel { underlying: self, channel: channel.to_string() }
	}
}

impl<'a, I: Iterator<Item = &'a Arc<Bundle>>> InChannelExt<'a> for I {}

#[cfg(test)]
mod test {
	use super::*;

	fn bundle(name: &str, package: &str, channel: &str, owns: Option<&str>) -> Arc<Bundle> {
		let owned: Vec<serde_json::Value> = owns.into_iter()
			.map(|k| serde_json::json!({ "group": "example.com", "version": "v1", "kind": k }))
			.collect();
		Arc::new(serde_json::from_value(serde_json::json!({
			"name": name,
			"package": package,
			"channels": [channel],
			"version": "1.0.0",
			"ownedAPIs": owned,
		})).unwrap())
	}

	#[test]
	fn filters_compose() {
		let bundles = vec![
			bundle("a", "p", "stable", Some("Widget")),
			bundle("b", "p", "alpha", Some("Widget")),
			bundle("c", "q", "stable", Some("Widget")),
			bundle("d", "p", "stable", None),
		];
		let api = ApiKey::new("example.com", "v1", "Widget");
		let found: Vec<&str> = bundles.iter()
			.owning(&api)
			.in_package("p")
			.in_channel("stable")
			.map(|b| b.name.as_str())
			.collect();
		assert_eq!(found, vec!["a"]);
	}
}
