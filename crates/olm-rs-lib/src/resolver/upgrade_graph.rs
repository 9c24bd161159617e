//! The upgrade graph of a package within one catalog.
//!
//! Edges point from a bundle to each bundle it supersedes, through `replaces`, `skips` or `skipRange`.
//! A channel is every bundle reachable from the channel head.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::prelude::*;

use crate::catalog::*;
use super::ResolutionError;

#[derive(Debug, Clone)]
pub enum NodeData {
	Bundle(Arc<Bundle>),
	/// The installed bundle when the catalog no longer publishes it.
	Installed(String, Option<semver::Version>),
}

impl NodeData {
	pub fn name(&self) -> &str {
		match self {
			NodeData::Bundle(b) => &b.name,
			NodeData::Installed(name, _) => name,
		}
	}

	pub fn version(&self) -> Option<&semver::Version> {
		match self {
			NodeData::Bundle(b) => Some(&b.version),
			NodeData::Installed(_, v) => v.as_ref(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeData {
	Replaces,
	Skips,
	SkipRange,
}

/// Where an upgrade starts from.
#[derive(Debug, Clone, Copy)]
pub struct Position<'a> {
	pub name: &'a str,
	pub version: Option<&'a semver::Version>,
}

/// Result of walking the upgrade graph.
#[derive(Debug, Clone)]
pub struct UpgradePath {
	pub catalog: CatalogKey,
	/// Bundles to install in order, the last is the channel head.
	pub hops: Vec<Arc<Bundle>>,
	/// Every bundle on the replaces chain between the current bundle and the head, oldest first.
	pub intermediates: Vec<String>,
	/// Head of the channel at the time of the walk.
	pub head: Arc<Bundle>,
}

impl UpgradePath {
	pub fn next_hop(&self) -> Option<&Arc<Bundle>> {
		self.hops.first()
	}

	pub fn is_up_to_date(&self) -> bool {
		self.hops.is_empty()
	}
}

#[derive(Debug)]
pub struct UpgradeGraph {
	graph: StableDiGraph<NodeData, EdgeData>,
	index: HashMap<String, NodeIndex>,
}

impl UpgradeGraph {
	/// Builds the graph for `package` from the bundles in `snapshot`.
	///
	/// When `current` isn't published by the catalog it's added as an [`NodeData::Installed`] node
	/// so that `skips` and `skipRange` can still reach it.
	pub fn build(snapshot: &CatalogSnapshot, package: &str, current: Option<Position>) -> Self {
		use crate::catalog::iterator::InPackageExt;

		let mut graph = StableDiGraph::<NodeData, EdgeData>::default();
		let mut index = HashMap::<String, NodeIndex>::new();

		for b in snapshot.bundles().in_package(package) {
			let i = graph.add_node(NodeData::Bundle(b.clone()));
			index.insert(b.name.clone(), i);
		}
		if let Some(c) = current {
			if !index.contains_key(c.name) {
				let i = graph.add_node(NodeData::Installed(c.name.to_string(), c.version.cloned()));
				index.insert(c.name.to_string(), i);
			}
		}

		let nodes: Vec<NodeIndex> = graph.node_indices().collect();
		for &src in &nodes {
			let NodeData::Bundle(bundle) = &graph[src] else { continue };
			let bundle = bundle.clone();

			if let Some(r) = bundle.replaces.as_ref().and_then(|r| index.get(r)) {
				graph.add_edge(src, *r, EdgeData::Replaces);
			}
			for s in bundle.skips.iter().filter_map(|s| index.get(s)) {
				graph.add_edge(src, *s, EdgeData::Skips);
			}
			if let Some(range) = &bundle.skip_range {
				for &dst in &nodes {
					if dst == src {
						continue
					}
					/* Only older bundles can be skipped, otherwise a range could point back up the graph */
					if let Some(v) = graph[dst].version() {
						if v < &bundle.version && range.contains(v) {
							graph.add_edge(src, dst, EdgeData::SkipRange);
						}
					}
				}
			}
		}

		Self { graph, index }
	}

	pub fn node(&self, name: &str) -> Option<&NodeData> {
		self.index.get(name).map(|i| &self.graph[*i])
	}

	/// Checks the `replaces` chain starting at `head` for cycles.
	fn check_replaces_chain(&self, head: NodeIndex) -> Result<(), ResolutionError> {
		let mut seen = HashSet::<NodeIndex>::new();
		let mut at = head;
		loop {
			if !seen.insert(at) {
				return Err(ResolutionError::ConstraintsNotSatisfiable(format!("replaces chain of {} loops back to {}", self.graph[head].name(), self.graph[at].name())))
			}
			let next = self.graph.edges_directed(at, Outgoing)
				.find(|e| *e.weight() == EdgeData::Replaces)
				.map(|e| e.target());
			match next {
				Some(n) => at = n,
				None => return Ok(()),
			}
		}
	}

	/// Names on the replaces chain strictly between `head` and `current`, oldest first.
	fn intermediates(&self, head: NodeIndex, current: NodeIndex) -> Vec<String> {
		let floor = self.graph[current].version().cloned();
		let mut chain = Vec::<String>::new();
		let mut at = head;
		let mut seen = HashSet::<NodeIndex>::new();
		while seen.insert(at) {
			let next = self.graph.edges_directed(at, Outgoing)
				.find(|e| *e.weight() == EdgeData::Replaces)
				.map(|e| e.target());
			let Some(n) = next else { break };
			if n == current {
				break
			}
			/* The chain may bypass current entirely when the hop was a skip */
			match (&floor, self.graph[n].version()) {
				(Some(f), Some(v)) if v <= f => break,
				_ => {},
			}
			chain.push(self.graph[n].name().to_string());
			at = n;
		}
		chain.reverse();
		chain
	}

	/// Walks from `current` to `head`.
	///
	/// At each step the next hop is the bundle superseding the current position that is closest to the head,
	/// ties go to the higher version.
	pub fn walk(&self, head: &str, current: Option<Position>, starting_bundle: Option<&str>) -> Result<(Vec<NodeIndex>, Vec<String>), ResolutionError> {
		let head_i = *self.index.get(head)
			.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("channel head {} is not published by the catalog", head)))?;
		self.check_replaces_chain(head_i)?;

		let Some(current) = current else {
			/* Fresh install, no replaces walk */
			let target = starting_bundle.unwrap_or(head);
			let target_i = *self.index.get(target)
				.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("starting bundle {} is not published by the catalog", target)))?;
			return Ok((vec![target_i], vec![]))
		};

		let current_i = *self.index.get(current.name)
			.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("bundle {} is not part of the upgrade graph", current.name)))?;
		if current_i == head_i {
			return Ok((vec![], vec![]))
		}

		let distance = petgraph::algo::dijkstra(&self.graph, head_i, None, |_| 1usize);
		if !distance.contains_key(&current_i) {
			return Err(ResolutionError::ConstraintsNotSatisfiable(format!("no upgrade path from {} to {}", current.name, head)))
		}

		let mut hops = Vec::<NodeIndex>::new();
		let mut visited = HashSet::<NodeIndex>::from([current_i]);
		let mut at = current_i;
		while at != head_i {
			let next = self.graph.edges_directed(at, Incoming)
				.map(|e| e.source())
				.filter_map(|s| distance.get(&s).map(|d| (s, *d)))
				.min_by(|(a, da), (b, db)| {
					da.cmp(db)
						.then_with(|| self.graph[*b].version().cmp(&self.graph[*a].version()))
						.then_with(|| self.graph[*a].name().cmp(self.graph[*b].name()))
				})
				.map(|(s, _)| s)
				.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("no upgrade path from {} to {}", self.graph[at].name(), head)))?;

			if !visited.insert(next) {
				return Err(ResolutionError::ConstraintsNotSatisfiable(format!("upgrade graph loops at {}", self.graph[next].name())))
			}
			log::trace!("Upgrade hop {} -> {}", self.graph[at].name(), self.graph[next].name());
			hops.push(next);
			at = next;
		}

		Ok((hops, self.intermediates(head_i, current_i)))
	}

	fn bundle_at(&self, i: NodeIndex) -> Result<Arc<Bundle>, ResolutionError> {
		match &self.graph[i] {
			NodeData::Bundle(b) => Ok(b.clone()),
			NodeData::Installed(name, _) => Err(ResolutionError::ConstraintsNotSatisfiable(format!("bundle {} is not published by the catalog", name))),
		}
	}
}

/// Picks the catalog whose channel head the subscription follows.
///
/// The subscription's own catalog wins, otherwise exactly one catalog in scope may publish a head.
pub fn select_head<'s>(scope: &'s ResolutionScope, package: &str, channel: &str, preferred: &CatalogKey) -> Result<(&'s Arc<CatalogSnapshot>, &'s Arc<Bundle>), ResolutionError> {
	let candidates: Vec<(&Arc<CatalogSnapshot>, &Arc<Bundle>)> = scope.catalogs.iter()
		.filter_map(|c| c.channel_head(package, channel).map(|h| (c, h)))
		.collect();

	if let Some(found) = candidates.iter().find(|(c, _)| &c.key == preferred) {
		return Ok(*found)
	}
	match candidates.as_slice() {
		[] => Err(ResolutionError::ConstraintsNotSatisfiable(format!("no catalog in scope publishes package {} channel {}", package, channel))),
		[only] => Ok(*only),
		many => Err(ResolutionError::AmbiguousHead {
			package: package.to_string(),
			channel: channel.to_string(),
			catalogs: many.iter().map(|(c, _)| c.key.clone()).collect(),
		}),
	}
}

/// Walks the channel from `current` to its head in `snapshot`.
pub fn walk_channel(snapshot: &CatalogSnapshot, package: &str, channel: &str, current: Option<Position>, starting_bundle: Option<&str>) -> Result<UpgradePath, ResolutionError> {
	let head = snapshot.channel_head(package, channel)
		.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("catalog {} has no channel {} for package {}", snapshot.key, channel, package)))?;

	let graph = UpgradeGraph::build(snapshot, package, current);
	let (hops, intermediates) = graph.walk(&head.name, current, starting_bundle)?;
	let hops = hops.into_iter()
		.map(|i| graph.bundle_at(i))
		.collect::<Result<Vec<_>, _>>()?;

	Ok(UpgradePath {
		catalog: snapshot.key.clone(),
		hops,
		intermediates,
		head: head.clone(),
	})
}

#[cfg(test)]
mod test {
	use super::*;

	fn bundle(name: &str, version: &str, replaces: Option<&str>, skips: &[&str], skip_range: Option<&str>) -> Bundle {
		serde_json::from_value(serde_json::json!({
			"name": name,
			"package": "p",
			"channels": ["stable"],
			"version": version,
			"replaces": replaces,
			"skips": skips,
			"skipRange": skip_range,
		})).unwrap()
	}

	fn catalog(head: &str, bundles: Vec<Bundle>) -> CatalogSnapshot {
		CatalogSnapshot::from_parts(
			CatalogKey::new("ops", "olm"),
			0,
			[PackageManifest {
				name: "p".into(),
				channels: vec![Channel { name: "stable".into(), current_bundle: head.into() }],
				default_channel: Some("stable".into()),
			}],
			bundles,
		)
	}

	fn names(path: &UpgradePath) -> Vec<&str> {
		path.hops.iter().map(|b| b.name.as_str()).collect()
	}

	fn linear() -> CatalogSnapshot {
		catalog("p-v3", vec![
			bundle("p-v1", "1.0.0", None, &[], None),
			bundle("p-v2", "2.0.0", Some("p-v1"), &[], None),
			bundle("p-v3", "3.0.0", Some("p-v2"), &[], None),
		])
	}

	fn at<'a>(name: &'a str, version: &'a semver::Version) -> Option<Position<'a>> {
		Some(Position { name, version: Some(version) })
	}

	#[test]
	fn fresh_install_targets_head() {
		let path = walk_channel(&linear(), "p", "stable", None, None).unwrap();
		assert_eq!(names(&path), vec!["p-v3"]);
	}

	#[test]
	fn fresh_install_honours_starting_bundle() {
		let path = walk_channel(&linear(), "p", "stable", None, Some("p-v2")).unwrap();
		assert_eq!(names(&path), vec!["p-v2"]);
	}

	#[test]
	fn replaces_chain_is_walked_one_hop_at_a_time() {
		let v = semver::Version::new(1, 0, 0);
		let path = walk_channel(&linear(), "p", "stable", at("p-v1", &v), None).unwrap();
		assert_eq!(names(&path), vec!["p-v2", "p-v3"]);
		assert_eq!(path.intermediates, vec!["p-v2"]);
	}

	#[test]
	fn skips_shortcut_to_head() {
		let s = catalog("p-v3", vec![
			bundle("p-v1", "1.0.0", None, &[], None),
			bundle("p-v2", "2.0.0", Some("p-v1"), &[], None),
			bundle("p-v3", "3.0.0", Some("p-v2"), &["p-v1"], None),
		]);
		let v = semver::Version::new(1, 0, 0);
		let path = walk_channel(&s, "p", "stable", at("p-v1", &v), None).unwrap();
		assert_eq!(names(&path), vec!["p-v3"]);
		assert_eq!(path.intermediates, vec!["p-v2"]);
	}

	#[test]
	fn skip_range_reaches_unpublished_bundle() {
		let s = catalog("p-v3", vec![
			bundle("p-v3", "3.0.0", None, &[], Some(">=1.0.0 <3.0.0")),
		]);
		let v = semver::Version::new(1, 5, 0);
		let path = walk_channel(&s, "p", "stable", at("p-v1.5", &v), None).unwrap();
		assert_eq!(names(&path), vec!["p-v3"]);
	}

	#[test]
	fn up_to_date_has_no_hops() {
		let v = semver::Version::new(3, 0, 0);
		assert!(walk_channel(&linear(), "p", "stable", at("p-v3", &v), None).unwrap().is_up_to_date());
	}

	#[test]
	fn unreachable_current_is_unsatisfiable() {
		let v = semver::Version::new(0, 1, 0);
		let e = walk_channel(&linear(), "p", "stable", at("p-v0", &v), None).unwrap_err();
		assert!(matches!(e, ResolutionError::ConstraintsNotSatisfiable(_)));
	}

	#[test]
	fn replaces_cycle_is_detected() {
		let s = catalog("p-v2", vec![
			bundle("p-v1", "1.0.0", Some("p-v2"), &[], None),
			bundle("p-v2", "2.0.0", Some("p-v1"), &[], None),
		]);
		assert!(walk_channel(&s, "p", "stable", None, None).is_err());
	}

	#[test]
	fn head_tie_break_prefers_subscription_catalog() {
		let mut a = linear();
		a.key = CatalogKey::new("a", "olm");
		let mut b = linear();
		b.key = CatalogKey::new("b", "olm");
		let scope = ResolutionScope::new("ns", [Arc::new(a), Arc::new(b)], vec![]);

		let (c, _) = select_head(&scope, "p", "stable", &CatalogKey::new("b", "olm")).unwrap();
		assert_eq!(c.key.name, "b");
		let e = select_head(&scope, "p", "stable", &CatalogKey::new("c", "olm")).unwrap_err();
		assert!(matches!(e, ResolutionError::AmbiguousHead { .. }));
	}
}
