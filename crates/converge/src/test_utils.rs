//! Fixtures and an in-memory [`ResourceClient`] for unit tests.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::Mutex,
};

use k8s_openapi::{
	api::{
		admissionregistration::v1::{
			MutatingWebhook, MutatingWebhookConfiguration, ValidatingWebhook,
			ValidatingWebhookConfiguration, WebhookClientConfig,
		},
		apps::v1::{Deployment, DeploymentCondition, DeploymentSpec, DeploymentStatus},
		core::v1::{Container, PodSpec, PodTemplateSpec},
	},
	apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
	ByteString,
};

use crate::{
	client::{ClientError, Operation, ResourceClient},
	resource::{ManagedObject, ResourceRef},
};

pub const NAMESPACE: &str = "machine-api";

pub fn deployment(name: &str, replicas: i32) -> ManagedObject {
	let labels: BTreeMap<String, String> = [("app".to_string(), name.to_string())].into();
	Deployment {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			namespace: Some(NAMESPACE.to_string()),
			..Default::default()
		},
		spec: Some(DeploymentSpec {
			replicas: Some(replicas),
			selector: LabelSelector {
				match_labels: Some(labels.clone()),
				..Default::default()
			},
			template: PodTemplateSpec {
				metadata: Some(ObjectMeta {
					labels: Some(labels),
					..Default::default()
				}),
				spec: Some(PodSpec {
					containers: vec![Container {
						name: "controller".to_string(),
						image: Some("registry.example.io/controller:v1".to_string()),
						..Default::default()
					}],
					..Default::default()
				}),
			},
			..Default::default()
		}),
		status: None,
	}
	.into()
}

/// Copy of a Deployment with a different replica count.
pub fn with_replicas(object: &ManagedObject, replicas: i32) -> ManagedObject {
	let mut object = object.clone();
	if let ManagedObject::Deployment(d) = &mut object {
		d.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
	}
	object
}

pub struct HookFixture {
	name: String,
	ca_bundle: Vec<u8>,
	versions: Vec<String>,
}

pub fn hook(name: &str, ca_bundle: &[u8], versions: &[&str]) -> HookFixture {
	HookFixture {
		name: name.to_string(),
		ca_bundle: ca_bundle.to_vec(),
		versions: versions.iter().map(|v| (*v).to_string()).collect(),
	}
}

impl HookFixture {
	fn client_config(&self) -> WebhookClientConfig {
		WebhookClientConfig {
			ca_bundle: Some(ByteString(self.ca_bundle.clone())),
			url: Some(format!("https://hooks.example.io/{}", self.name)),
			service: None,
		}
	}
}

pub fn validating_webhooks(name: &str, hooks: &[HookFixture]) -> ManagedObject {
	ValidatingWebhookConfiguration {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			..Default::default()
		},
		webhooks: Some(
			hooks
				.iter()
				.map(|h| ValidatingWebhook {
					name: h.name.clone(),
					admission_review_versions: h.versions.clone(),
					side_effects: "None".to_string(),
					client_config: h.client_config(),
					..Default::default()
				})
				.collect(),
		),
	}
	.into()
}

pub fn mutating_webhooks(name: &str, hooks: &[HookFixture]) -> ManagedObject {
	MutatingWebhookConfiguration {
		metadata: ObjectMeta {
			name: Some(name.to_string()),
			..Default::default()
		},
		webhooks: Some(
			hooks
				.iter()
				.map(|h| MutatingWebhook {
					name: h.name.clone(),
					admission_review_versions: h.versions.clone(),
					side_effects: "None".to_string(),
					client_config: h.client_config(),
					..Default::default()
				})
				.collect(),
		),
	}
	.into()
}

/// Bundle bytes of every webhook entry, in order.
pub fn ca_bundles(object: &ManagedObject) -> Vec<Vec<u8>> {
	use crate::webhook::{WebhookConfiguration, WebhookEntry};
	match object {
		ManagedObject::MutatingWebhookConfiguration(c) => {
			c.entries().iter().map(|w| w.ca_bundle().to_vec()).collect()
		}
		ManagedObject::ValidatingWebhookConfiguration(c) => {
			c.entries().iter().map(|w| w.ca_bundle().to_vec()).collect()
		}
		ManagedObject::Deployment(_) => Vec::new(),
	}
}

/// Failure to return from the next call of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
	Conflict,
	Forbidden,
	Unavailable,
	NotFound,
}

#[derive(Default)]
struct MemoryState {
	objects: BTreeMap<ResourceRef, ManagedObject>,
	failures: VecDeque<(Operation, Failure)>,
	last_uid: u64,
	last_resource_version: u64,
	writes: usize,
	calls: Vec<Operation>,
}

impl MemoryState {
	fn next_uid(&mut self) -> String {
		self.last_uid += 1;
		format!("uid-{}", self.last_uid)
	}

	fn next_resource_version(&mut self) -> String {
		self.last_resource_version += 1;
		self.last_resource_version.to_string()
	}

	fn take_failure(&mut self, operation: Operation, resource: &ResourceRef) -> Option<ClientError> {
		self.calls.push(operation);
		let index = self.failures.iter().position(|(op, _)| *op == operation)?;
		let (_, failure) = self.failures.remove(index)?;
		let resource = resource.clone();
		Some(match failure {
			Failure::Conflict => ClientError::Conflict {
				resource,
				message: "injected".to_string(),
			},
			Failure::Forbidden => ClientError::Forbidden {
				resource,
				operation,
				message: "injected".to_string(),
			},
			Failure::Unavailable => ClientError::Transport {
				resource,
				operation,
				source: "injected outage".into(),
			},
			Failure::NotFound => ClientError::NotFound { resource },
		})
	}

	fn stamp(&mut self, object: &mut ManagedObject, uid: String) {
		let resource_version = self.next_resource_version();
		let metadata = object.metadata_mut();
		metadata.uid = Some(uid);
		metadata.resource_version = Some(resource_version);
		if let ManagedObject::Deployment(d) = object {
			roll_out(d);
		}
	}
}

/// Mark every desired replica ready.
fn roll_out(deployment: &mut Deployment) {
	let replicas = deployment
		.spec
		.as_ref()
		.and_then(|s| s.replicas)
		.unwrap_or(1);
	deployment.status = Some(DeploymentStatus {
		replicas: Some(replicas),
		ready_replicas: Some(replicas),
		available_replicas: Some(replicas),
		updated_replicas: Some(replicas),
		conditions: Some(vec![DeploymentCondition {
			type_: "Available".to_string(),
			status: "True".to_string(),
			..Default::default()
		}]),
		..Default::default()
	});
}

/// In-memory object store with resourceVersion checks and injectable failures.
#[derive(Default)]
pub struct MemoryClient {
	state: Mutex<MemoryState>,
}

impl MemoryClient {
	fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
		self.state.lock().expect("memory client lock poisoned")
	}

	/// Store `object` as if created by someone else, returning the stored copy.
	pub fn insert(&self, object: ManagedObject) -> ManagedObject {
		let resource = object.resource_ref().expect("fixture objects are named");
		let mut state = self.lock();
		let mut object = object.for_create();
		let uid = state.next_uid();
		state.stamp(&mut object, uid);
		state.objects.insert(resource, object.clone());
		object
	}

	/// Change a stored object out of band, bumping its resourceVersion.
	pub fn mutate(&self, resource: &ResourceRef, f: impl FnOnce(&mut ManagedObject)) {
		let mut state = self.lock();
		let mut object = state
			.objects
			.get(resource)
			.cloned()
			.expect("mutated object exists");
		f(&mut object);
		let resource_version = state.next_resource_version();
		object.metadata_mut().resource_version = Some(resource_version);
		state.objects.insert(resource.clone(), object);
	}

	pub fn remove(&self, resource: &ResourceRef) -> Option<ManagedObject> {
		self.lock().objects.remove(resource)
	}

	pub fn stored(&self, resource: &ResourceRef) -> Option<ManagedObject> {
		self.lock().objects.get(resource).cloned()
	}

	pub fn fail_next(&self, operation: Operation, failure: Failure) {
		self.lock().failures.push_back((operation, failure));
	}

	/// Successful creates and updates.
	pub fn writes(&self) -> usize {
		self.lock().writes
	}

	pub fn calls(&self, operation: Operation) -> usize {
		self.lock().calls.iter().filter(|op| **op == operation).count()
	}
}

impl ResourceClient for MemoryClient {
	async fn get(&self, resource: &ResourceRef) -> Result<Option<ManagedObject>, ClientError> {
		let mut state = self.lock();
		if let Some(err) = state.take_failure(Operation::Get, resource) {
			return Err(err);
		}
		Ok(state.objects.get(resource).cloned())
	}

	async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
		let resource = object.resource_ref().expect("fixture objects are named");
		let mut state = self.lock();
		if let Some(err) = state.take_failure(Operation::Create, &resource) {
			return Err(err);
		}
		if state.objects.contains_key(&resource) {
			return Err(ClientError::AlreadyExists { resource });
		}
		let mut object = object.for_create();
		let uid = state.next_uid();
		state.stamp(&mut object, uid);
		state.objects.insert(resource, object.clone());
		state.writes += 1;
		Ok(object)
	}

	async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
		let resource = object.resource_ref().expect("fixture objects are named");
		let mut state = self.lock();
		if let Some(err) = state.take_failure(Operation::Update, &resource) {
			return Err(err);
		}
		let Some(existing) = state.objects.get(&resource) else {
			return Err(ClientError::NotFound { resource });
		};
		if existing.resource_version() != object.resource_version() {
			return Err(ClientError::Conflict {
				resource,
				message: "stale resourceVersion".to_string(),
			});
		}
		let uid = existing.uid().unwrap_or_default().to_string();
		let mut object = object.clone();
		state.stamp(&mut object, uid);
		state.objects.insert(resource, object.clone());
		state.writes += 1;
		Ok(object)
	}

	async fn delete(&self, resource: &ResourceRef) -> Result<(), ClientError> {
		let mut state = self.lock();
		if let Some(err) = state.take_failure(Operation::Delete, resource) {
			return Err(err);
		}
		state
			.objects
			.remove(resource)
			.map(|_| ())
			.ok_or_else(|| ClientError::NotFound {
				resource: resource.clone(),
			})
	}
}
