//! Running a [`Controller`] on the calling task instead of under the kube runtime.

use std::collections::VecDeque;
use std::sync::Mutex;

use olm_rs::catalog::CatalogKey;
use olm_rs::cluster::ObjectKey;
use olm_rs::controller::Controller;
use tokio::sync::broadcast::{self, error::TryRecvError};

/// Processes keys one at a time until nothing is left.
///
/// Keys affected by a reconcile and subscriptions seeing a changed catalog are queued the way
/// watches would queue them. Failed keys have their failure counted but aren't retried.
pub struct Driver {
	controller: Controller,
	queue: Mutex<VecDeque<ObjectKey>>,
	changes: Mutex<broadcast::Receiver<CatalogKey>>,
}

impl Driver {
	pub fn new(controller: Controller) -> Self {
		let changes = Mutex::new(controller.catalogs().changes());
		Self {
			controller,
			queue: Default::default(),
			changes,
		}
	}

	pub fn controller(&self) -> &Controller {
		&self.controller
	}

	/// Queues `key` unless it is already waiting.
	pub fn add(&self, key: ObjectKey) {
		let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
		if !queue.contains(&key) {
			queue.push_back(key);
		}
	}

	fn next(&self) -> Option<ObjectKey> {
		self.queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
	}

	/// Queues the subscriptions of every catalog changed since the last call.
	async fn catalog_changes(&self) {
		let changed: Vec<CatalogKey> = {
			let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
			let mut changed = Vec::new();
			loop {
				match changes.try_recv() {
					Ok(key) => changed.push(key),
					Err(TryRecvError::Lagged(missed)) => log::warn!("Missed {} catalog changes", missed),
					Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
				}
			}
			changed.dedup();
			changed
		};
		for key in changed {
			match self.controller.subscriptions_using(&key).await {
				Ok(keys) => keys.into_iter().for_each(|k| self.add(k)),
				Err(e) => log::warn!("Listing subscriptions for catalog {} failed: {}", key, e),
			}
		}
	}

	/// Processes until the queue is empty and no catalog changed, returning how many keys were processed.
	pub async fn run_until_idle(&self) -> usize {
		let mut processed = 0;
		loop {
			self.catalog_changes().await;
			let Some(key) = self.next() else { break };
			match self.controller.process(&key).await {
				Ok(affected) => {
					self.controller.forget_failures(&key);
					affected.into_iter().for_each(|k| self.add(k));
				},
				Err(e) => {
					self.controller.requeue_after(&key, &e);
				},
			}
			processed += 1;
		}
		processed
	}
}
