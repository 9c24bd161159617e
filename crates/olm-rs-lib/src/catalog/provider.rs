//! Sources of catalog content.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use tokio::sync::broadcast;

use super::*;

/// Supplies catalog content and health.
#[async_trait]
pub trait CatalogProvider: Send + Sync {
	/// Every catalog the provider knows about, healthy or not.
	async fn list(&self) -> crate::Result<Vec<CatalogStatus>>;
	/// Current content of a catalog, `None` when it doesn't exist.
	async fn snapshot(&self, key: &CatalogKey) -> crate::Result<Option<Arc<CatalogSnapshot>>>;
	/// Receives the key of every catalog whose content or health changes.
	fn changes(&self) -> broadcast::Receiver<CatalogKey>;
	/// Looks for changes made outside the provider and reports them through [`changes`](Self::changes).
	async fn refresh(&self) -> crate::Result<()> {
		Ok(())
	}
}

/// Changes a slow receiver can fall behind by before it's told it lagged.
const CHANGE_BUFFER: usize = 256;

/// Catalogs held in memory, content is swapped by publishing a new snapshot.
#[derive(Debug)]
pub struct MemoryCatalogProvider {
	catalogs: RwLock<BTreeMap<CatalogKey, (bool, Arc<CatalogSnapshot>)>>,
	changes: broadcast::Sender<CatalogKey>,
}

impl Default for MemoryCatalogProvider {
	fn default() -> Self {
		Self {
			catalogs: Default::default(),
			changes: broadcast::channel(CHANGE_BUFFER).0,
		}
	}
}

impl MemoryCatalogProvider {
	fn changed(&self, key: &CatalogKey) {
		/* Nobody listening is fine */
		let _ = self.changes.send(key.clone());
	}

	/// Adds or replaces a catalog, published catalogs start healthy.
	pub fn publish(&self, snapshot: CatalogSnapshot) {
		let key = snapshot.key.clone();
		{
			let mut catalogs = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
			log::debug!("Publishing catalog {} with {} bundles", snapshot.key, snapshot.bundles.len());
			catalogs.insert(key.clone(), (true, Arc::new(snapshot)));
		}
		self.changed(&key);
	}

	pub fn set_healthy(&self, key: &CatalogKey, healthy: bool) {
		let updated = {
			let mut catalogs = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
			match catalogs.get_mut(key) {
				Some((h, _)) if *h != healthy => {
					*h = healthy;
					true
				},
				_ => false,
			}
		};
		if updated {
			self.changed(key);
		}
	}

	pub fn remove(&self, key: &CatalogKey) {
		let removed = self.catalogs.write().unwrap_or_else(|e| e.into_inner()).remove(key).is_some();
		if removed {
			self.changed(key);
		}
	}
}

#[async_trait]
impl CatalogProvider for MemoryCatalogProvider {
	async fn list(&self) -> crate::Result<Vec<CatalogStatus>> {
		let catalogs = self.catalogs.read().unwrap_or_else(|e| e.into_inner());
		Ok(catalogs.iter()
			.map(|(key, (healthy, s))| CatalogStatus { key: key.clone(), priority: s.priority, healthy: *healthy })
			.collect())
	}

	async fn snapshot(&self, key: &CatalogKey) -> crate::Result<Option<Arc<CatalogSnapshot>>> {
		let catalogs = self.catalogs.read().unwrap_or_else(|e| e.into_inner());
		Ok(catalogs.get(key).map(|(_, s)| s.clone()))
	}

	fn changes(&self) -> broadcast::Receiver<CatalogKey> {
		self.changes.subscribe()
	}
}

/// On disk format of a catalog read by [`DirectoryCatalogProvider`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogIndex {
	#[serde(default)]
	pub priority: i32,
	#[serde(default)]
	pub packages: Vec<PackageManifest>,
	#[serde(default)]
	pub bundles: Vec<Bundle>,
}

/// Modification time and size of a catalog file, compared by [`DirectoryCatalogProvider::refresh`].
type FileStamp = (Option<SystemTime>, u64);

/// Reads catalogs from `<root>/<namespace>/<name>.json`.
///
/// A file that fails to parse is listed as unhealthy. Changes to the files are noticed on
/// [`refresh`](CatalogProvider::refresh).
#[derive(Debug, Clone)]
pub struct DirectoryCatalogProvider {
	root: PathBuf,
	seen: Arc<Mutex<BTreeMap<CatalogKey, FileStamp>>>,
	changes: broadcast::Sender<CatalogKey>,
}

impl DirectoryCatalogProvider {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			seen: Default::default(),
			changes: broadcast::channel(CHANGE_BUFFER).0,
		}
	}

	/// Every `<namespace>/<name>.json` under the root.
	async fn catalog_files(&self) -> crate::Result<Vec<(CatalogKey, PathBuf)>> {
		let mut found = Vec::new();

		let mut namespaces = match tokio::fs::read_dir(&self.root).await {
			Ok(d) => d,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				log::warn!("Catalog directory {} does not exist", self.root.display());
				return Ok(found)
			},
			Err(e) => return Err(e.into()),
		};

		while let Some(ns) = namespaces.next_entry().await? {
			if !ns.file_type().await?.is_dir() {
				continue
			}
			let namespace = ns.file_name().to_string_lossy().to_string();
			let mut files = tokio::fs::read_dir(ns.path()).await?;
			while let Some(file) = files.next_entry().await? {
				let path = file.path();
				if path.extension().and_then(|e| e.to_str()) != Some("json") {
					continue
				}
				let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else { continue };
				found.push((CatalogKey::new(name, namespace.clone()), path));
			}
		}

		found.sort();
		Ok(found)
	}

	fn path_of(&self, key: &CatalogKey) -> PathBuf {
		self.root.join(&key.namespace).join(format!("{}.json", key.name))
	}

	async fn read_index(&self, key: &CatalogKey) -> crate::Result<Option<CatalogIndex>> {
		let path = self.path_of(key);
		let content = match tokio::fs::read_to_string(&path).await {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let index: CatalogIndex = serde_json::from_str(&content)?;
		Ok(Some(index))
	}
}

#[async_trait]
impl CatalogProvider for DirectoryCatalogProvider {
	async fn list(&self) -> crate::Result<Vec<CatalogStatus>> {
		let mut statuses = Vec::<CatalogStatus>::new();
		for (key, path) in self.catalog_files().await? {
			let status = match self.read_index(&key).await {
				Ok(Some(index)) => CatalogStatus { key, priority: index.priority, healthy: true },
				Ok(None) => continue,
				Err(e) => {
					log::warn!("Catalog file {} is unreadable: {}", path.display(), e);
					CatalogStatus { key, priority: 0, healthy: false }
				},
			};
			statuses.push(status);
		}
		Ok(statuses)
	}

	async fn snapshot(&self, key: &CatalogKey) -> crate::Result<Option<Arc<CatalogSnapshot>>> {
		Ok(self.read_index(key).await?
			.map(|index| Arc::new(CatalogSnapshot::from_parts(key.clone(), index.priority, index.packages, index.bundles))))
	}

	fn changes(&self) -> broadcast::Receiver<CatalogKey> {
		self.changes.subscribe()
	}

	/// Compares modification time and size of every catalog file with the previous refresh.
	///
	/// The first refresh reports every catalog.
	async fn refresh(&self) -> crate::Result<()> {
		let mut current = BTreeMap::<CatalogKey, FileStamp>::new();
		for (key, path) in self.catalog_files().await? {
			let metadata = match tokio::fs::metadata(&path).await {
				Ok(m) => m,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
				Err(e) => return Err(e.into()),
			};
			current.insert(key, (metadata.modified().ok(), metadata.len()));
		}

		let changed: Vec<CatalogKey> = {
			let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
			let changed = current.iter()
				.filter(|(k, stamp)| seen.get(*k) != Some(*stamp))
				.map(|(k, _)| k.clone())
				.chain(seen.keys().filter(|k| !current.contains_key(*k)).cloned())
				.collect();
			*seen = current;
			changed
		};
		for key in changed {
			log::debug!("Catalog file of {} changed", key);
			let _ = self.changes.send(key);
		}
		Ok(())
	}
}
