//! Driving the [`Controller`] from the API server.
//!
//! Subscriptions and install plans each get a `kube` runtime controller. Plans are owned by their
//! subscription, so a plan changing phase wakes the subscription too. Catalog changes reconcile
//! every subscription once some subscription can see the changed catalog.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::runtime::controller::{self, Action};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Resource, ResourceExt};
use tokio::sync::{broadcast, mpsc};

use super::Controller;
use crate::api::{InstallPlan, Subscription};
use crate::cluster::ObjectKey;

/// Has to stay below the client read timeout so idle watches are closed by the server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
where
	K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
	match namespace {
		Some(ns) => Api::namespaced(client, ns),
		None => Api::all(client),
	}
}

fn key_of<K: Resource<DynamicType = ()>>(object: &K) -> ObjectKey {
	ObjectKey::of::<K>(object.meta().namespace.as_deref(), object.name_any())
}

async fn reconcile_subscription(subscription: Arc<Subscription>, ctx: Arc<Controller>) -> crate::Result<Action> {
	let key = key_of(subscription.as_ref());
	ctx.process(&key).await?;
	ctx.forget_failures(&key);
	Ok(Action::requeue(ctx.options().resync_interval()))
}

async fn reconcile_install_plan(plan: Arc<InstallPlan>, ctx: Arc<Controller>) -> crate::Result<Action> {
	if plan.phase().is_terminal() {
		return Ok(Action::await_change())
	}
	let key = key_of(plan.as_ref());
	ctx.process(&key).await?;
	ctx.forget_failures(&key);
	Ok(Action::requeue(ctx.options().resync_interval()))
}

fn error_policy<K: Resource<DynamicType = ()>>(object: Arc<K>, error: &crate::Error, ctx: Arc<Controller>) -> Action {
	match ctx.requeue_after(&key_of(object.as_ref()), error) {
		Some(delay) => Action::requeue(delay),
		None => Action::await_change(),
	}
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(kind: &'static str) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
	move |result| {
		match result {
			Ok(reconciled) => log::trace!("{} reconciled: {:?}", kind, reconciled),
			Err(e) => log::debug!("{} reconcile error: {}", kind, e),
		}
		std::future::ready(())
	}
}

/// Signals the subscription controller for every catalog change some subscription can see.
///
/// Changes are forwarded through a task since the runtime needs a `Sync` stream.
fn catalog_triggers(ctx: Arc<Controller>) -> impl futures::Stream<Item = ()> + Send + Sync + 'static {
	let (tx, mut rx) = mpsc::unbounded_channel();
	let mut changes = ctx.catalogs().changes();
	tokio::spawn(async move {
		loop {
			let key = match changes.recv().await {
				Ok(key) => key,
				Err(broadcast::error::RecvError::Lagged(missed)) => {
					log::warn!("Missed {} catalog changes, reconciling everything", missed);
					if tx.send(()).is_err() {
						break
					}
					continue
				},
				Err(broadcast::error::RecvError::Closed) => break,
			};
			match ctx.subscriptions_using(&key).await {
				Ok(affected) if affected.is_empty() => log::debug!("Nothing uses catalog {}", key),
				Ok(_) => {
					if tx.send(()).is_err() {
						break
					}
				},
				Err(e) => {
					log::warn!("Listing subscriptions for catalog {} failed, reconciling everything: {}", key, e);
					if tx.send(()).is_err() {
						break
					}
				},
			}
		}
	});
	futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

/// Asks the catalog provider to look for changes every `interval`.
async fn poll_catalogs(ctx: Arc<Controller>, interval: Duration) {
	let mut ticks = tokio::time::interval(interval);
	ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
	loop {
		ticks.tick().await;
		if let Err(e) = ctx.catalogs().refresh().await {
			log::warn!("Refreshing catalogs failed: {}", e);
		}
	}
}

/// Runs both controllers until the process is told to stop.
pub fn run(ctx: Arc<Controller>, client: kube::Client) -> impl Future<Output = ()> + Send {
	let options = ctx.options().clone();
	let namespace = options.namespace();
	let concurrency = u16::try_from(options.workers()).unwrap_or(u16::MAX);
	log::info!("Watching subscriptions and install plans in {} with {} workers each", namespace.unwrap_or("all namespaces"), concurrency);

	let subscriptions = controller::Controller::new(api::<Subscription>(client.clone(), namespace), WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
		.owns(api::<InstallPlan>(client.clone(), namespace), WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
		.with_config(controller::Config::default().concurrency(concurrency))
		.reconcile_all_on(catalog_triggers(Arc::clone(&ctx)))
		.shutdown_on_signal()
		.run(reconcile_subscription, error_policy, Arc::clone(&ctx))
		.for_each(log_reconcile_result("Subscription"));

	let plans = controller::Controller::new(api::<InstallPlan>(client, namespace), WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
		.with_config(controller::Config::default().concurrency(concurrency))
		.shutdown_on_signal()
		.run(reconcile_install_plan, error_policy, Arc::clone(&ctx))
		.for_each(log_reconcile_result("InstallPlan"));

	let poll = poll_catalogs(ctx, options.catalog_poll_interval());
	async move {
		tokio::select! {
			_ = futures::future::join(subscriptions, plans) => log::info!("Controllers stopped"),
			_ = poll => {},
		}
	}
}
