//! Kubernetes watches feeding reconcile requests into the loop.

use std::{fmt::Debug, pin::pin};

use futures_util::StreamExt;
use k8s_openapi::api::{
	admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
	apps::v1::Deployment,
};
use kube::{
	runtime::{
		watcher::{self, watcher, Event},
		WatchStreamExt,
	},
	Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	controller::LoopHandle,
	resource::{ResourceKind, ResourceRef},
};

/// Start one name-scoped watch per managed resource.
///
/// Every change or deletion of a watched object, plus the end of each initial list,
/// becomes a reconcile request. Watches stop when `shutdown` fires or the loop is gone.
pub fn spawn_watchers(
	client: &Client,
	managed: &[ResourceRef],
	handle: &LoopHandle,
	shutdown: &CancellationToken,
) -> JoinSet<()> {
	let mut watchers = JoinSet::new();
	for resource in managed {
		let (resource, handle, shutdown) = (resource.clone(), handle.clone(), shutdown.clone());
		match resource.kind {
			ResourceKind::Deployment => {
				let Some(namespace) = resource.namespace.clone() else {
					warn!(resource = %resource, "not watching deployment without namespace");
					continue;
				};
				let api = Api::<Deployment>::namespaced(client.clone(), &namespace);
				watchers.spawn(watch_one(api, resource, handle, shutdown));
			}
			ResourceKind::MutatingWebhookConfiguration => {
				let api = Api::<MutatingWebhookConfiguration>::all(client.clone());
				watchers.spawn(watch_one(api, resource, handle, shutdown));
			}
			ResourceKind::ValidatingWebhookConfiguration => {
				let api = Api::<ValidatingWebhookConfiguration>::all(client.clone());
				watchers.spawn(watch_one(api, resource, handle, shutdown));
			}
		}
	}
	watchers
}

async fn watch_one<K>(
	api: Api<K>,
	resource: ResourceRef,
	handle: LoopHandle,
	shutdown: CancellationToken,
) where
	K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
	let config = watcher::Config::default().fields(&format!("metadata.name={}", resource.name));
	let mut events = pin!(watcher(api, config).default_backoff());

	debug!(resource = %resource, "watch started");
	loop {
		let event = tokio::select! {
			() = shutdown.cancelled() => break,
			event = events.next() => event,
		};
		match event {
			Some(Ok(Event::Apply(_) | Event::Delete(_) | Event::InitDone)) => {
				if !handle.request(resource.clone()) {
					break;
				}
			}
			Some(Ok(Event::Init | Event::InitApply(_))) => {}
			Some(Err(err)) => warn!(resource = %resource, error = %err, "watch error"),
			None => break,
		}
	}
	debug!(resource = %resource, "watch stopped");
}
