//! Typed access to the object store holding managed resources.

use std::{fmt, future::Future};

use k8s_openapi::api::{
	admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
	apps::v1::Deployment,
};
use kube::{
	api::{DeleteParams, PostParams},
	Api, Client,
};
use thiserror::Error;
use tracing::instrument;

use crate::resource::{ManagedObject, ResourceKind, ResourceRef};

/// The call a [`ClientError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
	Get,
	Create,
	Update,
	Delete,
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Get => "get",
			Self::Create => "create",
			Self::Update => "update",
			Self::Delete => "delete",
		})
	}
}

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("{resource} not found")]
	NotFound { resource: ResourceRef },

	/// The write carried a stale resourceVersion.
	#[error("conflict writing {resource}: {message}")]
	Conflict {
		resource: ResourceRef,
		message: String,
	},

	#[error("{resource} already exists")]
	AlreadyExists { resource: ResourceRef },

	#[error("{resource} rejected as invalid: {message}")]
	Invalid {
		resource: ResourceRef,
		message: String,
	},

	#[error("{operation} on {resource} forbidden: {message}")]
	Forbidden {
		resource: ResourceRef,
		operation: Operation,
		message: String,
	},

	#[error("{operation} on {resource} failed")]
	Transport {
		resource: ResourceRef,
		operation: Operation,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("decoding {resource}")]
	Serialization {
		resource: ResourceRef,
		#[source]
		source: serde_json::Error,
	},

	#[error("{kind} object is missing metadata.{field}")]
	MissingIdentity {
		kind: ResourceKind,
		field: &'static str,
	},
}

impl ClientError {
	/// Map a kube error for `operation` on `resource`.
	///
	/// A 409 on create means the name is taken; on any other call it is a
	/// resourceVersion conflict.
	pub fn from_kube(err: kube::Error, resource: &ResourceRef, operation: Operation) -> Self {
		let resource = resource.clone();
		match err {
			kube::Error::Api(ref status) => {
				let message = status.message.clone();
				match status.code {
					404 => Self::NotFound { resource },
					409 if operation == Operation::Create => Self::AlreadyExists { resource },
					409 => Self::Conflict { resource, message },
					400 | 422 => Self::Invalid { resource, message },
					401 | 403 => Self::Forbidden {
						resource,
						operation,
						message,
					},
					_ => Self::Transport {
						resource,
						operation,
						source: Box::new(err),
					},
				}
			}
			kube::Error::SerdeError(source) => Self::Serialization { resource, source },
			err => Self::Transport {
				resource,
				operation,
				source: Box::new(err),
			},
		}
	}

	/// Errors worth retrying after a backoff.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Transport { .. })
	}

	pub fn resource(&self) -> Option<&ResourceRef> {
		match self {
			Self::NotFound { resource }
			| Self::Conflict { resource, .. }
			| Self::AlreadyExists { resource }
			| Self::Invalid { resource, .. }
			| Self::Forbidden { resource, .. }
			| Self::Transport { resource, .. }
			| Self::Serialization { resource, .. } => Some(resource),
			Self::MissingIdentity { .. } => None,
		}
	}
}

/// Get/create/update/delete keyed by [`ResourceRef`].
///
/// `update` is a full replace carrying the object's resourceVersion, so a concurrent
/// writer makes it fail with [`ClientError::Conflict`] instead of being overwritten.
pub trait ResourceClient: Send + Sync {
	/// `Ok(None)` when the object does not exist.
	fn get(
		&self,
		resource: &ResourceRef,
	) -> impl Future<Output = Result<Option<ManagedObject>, ClientError>> + Send;

	fn create(
		&self,
		object: &ManagedObject,
	) -> impl Future<Output = Result<ManagedObject, ClientError>> + Send;

	fn update(
		&self,
		object: &ManagedObject,
	) -> impl Future<Output = Result<ManagedObject, ClientError>> + Send;

	fn delete(&self, resource: &ResourceRef)
		-> impl Future<Output = Result<(), ClientError>> + Send;
}

/// [`ResourceClient`] over the Kubernetes API.
#[derive(Clone)]
pub struct KubeResourceClient {
	client: Client,
}

impl fmt::Debug for KubeResourceClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("KubeResourceClient").finish_non_exhaustive()
	}
}

impl KubeResourceClient {
	pub fn new(client: Client) -> Self {
		Self { client }
	}

	pub fn kube_client(&self) -> &Client {
		&self.client
	}

	fn deployments(&self, resource: &ResourceRef) -> Result<Api<Deployment>, ClientError> {
		let namespace = resource
			.namespace
			.as_deref()
			.ok_or(ClientError::MissingIdentity {
				kind: resource.kind,
				field: "namespace",
			})?;
		Ok(Api::namespaced(self.client.clone(), namespace))
	}

	fn mutating(&self) -> Api<MutatingWebhookConfiguration> {
		Api::all(self.client.clone())
	}

	fn validating(&self) -> Api<ValidatingWebhookConfiguration> {
		Api::all(self.client.clone())
	}
}

fn identify(object: &ManagedObject) -> Result<ResourceRef, ClientError> {
	let resource = object.resource_ref().ok_or(ClientError::MissingIdentity {
		kind: object.kind(),
		field: "name",
	})?;
	if object.kind() == ResourceKind::Deployment && resource.namespace.is_none() {
		return Err(ClientError::MissingIdentity {
			kind: object.kind(),
			field: "namespace",
		});
	}
	Ok(resource)
}

impl ResourceClient for KubeResourceClient {
	#[instrument(skip(self), fields(resource = %resource))]
	async fn get(&self, resource: &ResourceRef) -> Result<Option<ManagedObject>, ClientError> {
		let name = resource.name.as_str();
		let result = match resource.kind {
			ResourceKind::Deployment => self
				.deployments(resource)?
				.get_opt(name)
				.await
				.map(|o| o.map(ManagedObject::from)),
			ResourceKind::MutatingWebhookConfiguration => self
				.mutating()
				.get_opt(name)
				.await
				.map(|o| o.map(ManagedObject::from)),
			ResourceKind::ValidatingWebhookConfiguration => self
				.validating()
				.get_opt(name)
				.await
				.map(|o| o.map(ManagedObject::from)),
		};
		result.map_err(|e| ClientError::from_kube(e, resource, Operation::Get))
	}

	#[instrument(skip_all, fields(kind = %object.kind(), name = object.name()))]
	async fn create(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
		let resource = identify(object)?;
		let params = PostParams::default();
		let result = match object.for_create() {
			ManagedObject::Deployment(d) => self
				.deployments(&resource)?
				.create(&params, &d)
				.await
				.map(ManagedObject::from),
			ManagedObject::MutatingWebhookConfiguration(c) => self
				.mutating()
				.create(&params, &c)
				.await
				.map(ManagedObject::from),
			ManagedObject::ValidatingWebhookConfiguration(c) => self
				.validating()
				.create(&params, &c)
				.await
				.map(ManagedObject::from),
		};
		let created = result.map_err(|e| ClientError::from_kube(e, &resource, Operation::Create))?;
		tracing::debug!(uid = created.uid(), "created object");
		Ok(created)
	}

	#[instrument(skip_all, fields(
		kind = %object.kind(),
		name = object.name(),
		resource_version = object.resource_version(),
	))]
	async fn update(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
		let resource = identify(object)?;
		if object.resource_version().is_none() {
			return Err(ClientError::MissingIdentity {
				kind: object.kind(),
				field: "resourceVersion",
			});
		}
		let name = resource.name.as_str();
		let params = PostParams::default();
		let result = match object {
			ManagedObject::Deployment(d) => self
				.deployments(&resource)?
				.replace(name, &params, d)
				.await
				.map(ManagedObject::from),
			ManagedObject::MutatingWebhookConfiguration(c) => self
				.mutating()
				.replace(name, &params, c)
				.await
				.map(ManagedObject::from),
			ManagedObject::ValidatingWebhookConfiguration(c) => self
				.validating()
				.replace(name, &params, c)
				.await
				.map(ManagedObject::from),
		};
		result.map_err(|e| ClientError::from_kube(e, &resource, Operation::Update))
	}

	#[instrument(skip(self), fields(resource = %resource))]
	async fn delete(&self, resource: &ResourceRef) -> Result<(), ClientError> {
		let name = resource.name.as_str();
		let params = DeleteParams::default();
		let result = match resource.kind {
			ResourceKind::Deployment => self
				.deployments(resource)?
				.delete(name, &params)
				.await
				.map(|_| ()),
			ResourceKind::MutatingWebhookConfiguration => {
				self.mutating().delete(name, &params).await.map(|_| ())
			}
			ResourceKind::ValidatingWebhookConfiguration => {
				self.validating().delete(name, &params).await.map(|_| ())
			}
		};
		result.map_err(|e| ClientError::from_kube(e, resource, Operation::Delete))
	}
}
