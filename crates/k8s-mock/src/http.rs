//! HTTP-based mock Kubernetes server using wiremock.
//!
//! This provides a real HTTP server that can be used with actual kubeconfig-based
//! connections. Objects live in a shared in-memory store; the server assigns UIDs and
//! resource versions and enforces optimistic concurrency on replace.

use std::{
	collections::{HashMap, VecDeque},
	sync::{Arc, Mutex, MutexGuard},
};

use bon::Builder;
use kube::{
	config::{
		AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
		NamedContext,
	},
	Client, Config,
};
use serde_json::{Map, Value};
use tracing::{debug, trace};
use wiremock::{matchers::path_regex, Mock, MockServer, Request, ResponseTemplate};

use super::{
	discovery::MockDiscovery,
	helpers::{merge_json, simulate_rollout, status_body},
};

/// Key of a stored object: (collection path, object name).
type ObjectKey = (String, String);

/// A one-shot failure returned instead of handling the next matching request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
	/// HTTP method the fault applies to (`GET`, `POST`, `PUT`, `PATCH`, `DELETE`).
	pub method: String,
	pub code: u16,
	pub reason: String,
}

impl Fault {
	pub fn new(method: &str, code: u16, reason: &str) -> Self {
		Self {
			method: method.to_uppercase(),
			code,
			reason: reason.to_string(),
		}
	}

	/// The next replace fails as if another writer got there first.
	pub fn conflict_on_update() -> Self {
		Self::new("PUT", 409, "Conflict")
	}

	/// The next create is rejected by RBAC.
	pub fn forbidden_on_create() -> Self {
		Self::new("POST", 403, "Forbidden")
	}

	/// The next request with this method fails with 503.
	pub fn unavailable(method: &str) -> Self {
		Self::new(method, 503, "ServiceUnavailable")
	}

	fn respond(&self) -> ResponseTemplate {
		ResponseTemplate::new(self.code).set_body_json(status_body(
			self.code,
			&self.reason,
			&format!("injected fault: {}", self.reason),
		))
	}
}

/// A mock Kubernetes server exposed over HTTP.
#[derive(Builder)]
pub struct HttpMockK8sServer {
	/// Resources to serve as raw manifests. The server derives API paths from
	/// apiVersion/kind using the resource table.
	#[builder(default)]
	resources: Vec<Value>,
	/// Mark Deployments as fully rolled out after every write.
	#[builder(default = true)]
	simulate_rollout: bool,
}

/// A running HTTP mock server instance.
pub struct RunningHttpMockK8sServer {
	server: MockServer,
	store: Arc<Store>,
}

impl HttpMockK8sServer {
	/// Start the mock server with all configured resources.
	pub async fn start(self) -> RunningHttpMockK8sServer {
		let server = MockServer::start().await;
		let discovery = MockDiscovery::default();

		debug!(uri = %server.uri(), "Started mock K8s server");

		let store = Arc::new(Store {
			state: Mutex::new(StoreState::default()),
			discovery,
			simulate_rollout: self.simulate_rollout,
		});

		for manifest in self.resources {
			store.seed(manifest);
		}

		let handler_store = Arc::clone(&store);
		Mock::given(path_regex(r"^/api(s)?/.*"))
			.respond_with(move |req: &Request| handler_store.handle(req))
			.mount(&server)
			.await;

		RunningHttpMockK8sServer { server, store }
	}
}

impl RunningHttpMockK8sServer {
	/// Get the server's URI (e.g., "http://127.0.0.1:12345").
	pub fn uri(&self) -> String {
		self.server.uri()
	}

	/// Create a Kubeconfig pointing to this mock server.
	pub fn kubeconfig(&self) -> Kubeconfig {
		self.kubeconfig_with_context("mock-context")
	}

	/// Create a Kubeconfig pointing to this mock server with a custom context name.
	pub fn kubeconfig_with_context(&self, context_name: &str) -> Kubeconfig {
		let cluster_name = "mock-cluster";
		let user_name = "mock-user";

		Kubeconfig {
			clusters: vec![NamedCluster {
				name: cluster_name.to_string(),
				cluster: Some(Cluster {
					server: Some(self.uri()),
					insecure_skip_tls_verify: Some(true),
					..Default::default()
				}),
			}],
			contexts: vec![NamedContext {
				name: context_name.to_string(),
				context: Some(Context {
					cluster: cluster_name.to_string(),
					user: Some(user_name.to_string()),
					namespace: Some("default".to_string()),
					..Default::default()
				}),
			}],
			auth_infos: vec![NamedAuthInfo {
				name: user_name.to_string(),
				auth_info: Some(AuthInfo::default()),
			}],
			current_context: Some(context_name.to_string()),
			..Default::default()
		}
	}

	/// Build a kube client connected to this server.
	pub async fn client(&self) -> Client {
		let config = Config::from_custom_kubeconfig(self.kubeconfig(), &KubeConfigOptions::default())
			.await
			.expect("mock kubeconfig should always be valid");
		Client::try_from(config).expect("building a client for the mock server should not fail")
	}

	/// Queue a one-shot fault. Faults for the same method fire in insertion order.
	pub fn inject_fault(&self, fault: Fault) {
		self.store.lock().faults.push_back(fault);
	}

	/// Number of successful mutating requests (create, replace, patch, delete).
	pub fn write_count(&self) -> usize {
		self.store.lock().writes
	}

	/// Read a stored object directly, bypassing the HTTP layer.
	pub fn object(
		&self,
		api_version: &str,
		kind: &str,
		namespace: Option<&str>,
		name: &str,
	) -> Option<Value> {
		let collection = self
			.store
			.discovery
			.collection_path(api_version, kind, namespace)?;
		self.store
			.lock()
			.objects
			.get(&(collection, name.to_string()))
			.cloned()
	}
}

/// Shared object store behind the mock endpoints.
struct Store {
	state: Mutex<StoreState>,
	discovery: MockDiscovery,
	simulate_rollout: bool,
}

#[derive(Default)]
struct StoreState {
	objects: HashMap<ObjectKey, Value>,
	faults: VecDeque<Fault>,
	last_uid: u64,
	last_resource_version: u64,
	writes: usize,
}

impl Store {
	fn lock(&self) -> MutexGuard<'_, StoreState> {
		self.state.lock().expect("mock store lock poisoned")
	}

	/// Register an initial object, assigning identity metadata it does not already have.
	fn seed(&self, mut manifest: Value) {
		let Some(collection) = collection_for_manifest(&manifest, &self.discovery) else {
			debug!(kind = ?manifest.get("kind"), "Skipping manifest of unknown type");
			return;
		};
		let Some(name) = object_name(&manifest) else {
			return;
		};

		let mut state = self.lock();
		let uid = existing_string(&manifest, "uid").unwrap_or_else(|| state.next_uid());
		state.stamp(&mut manifest, uid);
		if self.simulate_rollout && is_deployment_collection(&collection) {
			simulate_rollout(&mut manifest);
		}

		trace!(collection = %collection, name = %name, "Registered resource");
		state.objects.insert((collection, name), manifest);
	}

	fn handle(&self, req: &Request) -> ResponseTemplate {
		let method = req.method.as_str().to_uppercase();
		let path = req.url.path().trim_end_matches('/');
		let mut state = self.lock();

		if let Some(fault) = state.take_fault(&method) {
			debug!(method = %method, path = %path, code = fault.code, "Injecting fault");
			return fault.respond();
		}

		match method.as_str() {
			"GET" => state.get(path, &self.discovery),
			"POST" => self.create(&mut state, path, &req.body),
			"PUT" => self.replace(&mut state, path, &req.body),
			"PATCH" => self.patch(&mut state, path, &req.body),
			"DELETE" => state.delete(path),
			_ => ResponseTemplate::new(405).set_body_json(status_body(
				405,
				"MethodNotAllowed",
				"method not supported by mock server",
			)),
		}
	}

	fn create(&self, state: &mut StoreState, collection: &str, body: &[u8]) -> ResponseTemplate {
		let Some(mut object) = parse_body(body) else {
			return bad_request();
		};
		let Some(name) = object_name(&object) else {
			return invalid("metadata.name: Required value");
		};

		let key = (collection.to_string(), name);
		if state.objects.contains_key(&key) {
			return ResponseTemplate::new(409).set_body_json(status_body(
				409,
				"AlreadyExists",
				&format!("{} already exists", key.1),
			));
		}

		let uid = state.next_uid();
		state.stamp(&mut object, uid);
		self.after_write(collection, &mut object);
		state.objects.insert(key, object.clone());
		state.writes += 1;

		ResponseTemplate::new(201).set_body_json(object)
	}

	fn replace(&self, state: &mut StoreState, path: &str, body: &[u8]) -> ResponseTemplate {
		let key = split_object_path(path);
		let Some(existing) = state.objects.get(&key) else {
			return not_found(&key.1);
		};
		let Some(mut object) = parse_body(body) else {
			return bad_request();
		};

		let stored_version = existing_string(existing, "resourceVersion");
		if let Some(sent) = existing_string(&object, "resourceVersion") {
			if Some(&sent) != stored_version.as_ref() {
				debug!(name = %key.1, sent = %sent, stored = ?stored_version, "Rejecting stale replace");
				return ResponseTemplate::new(409).set_body_json(status_body(
					409,
					"Conflict",
					&format!(
						"Operation cannot be fulfilled on {}: the object has been modified; \
						 please apply your changes to the latest version and try again",
						key.1
					),
				));
			}
		}

		let uid = existing_string(existing, "uid").unwrap_or_default();
		state.stamp(&mut object, uid);
		self.after_write(&key.0, &mut object);
		state.objects.insert(key, object.clone());
		state.writes += 1;

		ResponseTemplate::new(200).set_body_json(object)
	}

	fn patch(&self, state: &mut StoreState, path: &str, body: &[u8]) -> ResponseTemplate {
		let key = split_object_path(path);
		let Some(existing) = state.objects.get(&key).cloned() else {
			return not_found(&key.1);
		};
		let Some(patch) = parse_body(body) else {
			return bad_request();
		};

		let uid = existing_string(&existing, "uid").unwrap_or_default();
		let mut merged = merge_json(existing, patch);
		state.stamp(&mut merged, uid);
		self.after_write(&key.0, &mut merged);
		state.objects.insert(key, merged.clone());
		state.writes += 1;

		ResponseTemplate::new(200).set_body_json(merged)
	}

	fn after_write(&self, collection: &str, object: &mut Value) {
		if self.simulate_rollout && is_deployment_collection(collection) {
			simulate_rollout(object);
		}
	}
}

impl StoreState {
	fn take_fault(&mut self, method: &str) -> Option<Fault> {
		let index = self.faults.iter().position(|f| f.method == method)?;
		self.faults.remove(index)
	}

	fn next_uid(&mut self) -> String {
		self.last_uid += 1;
		format!("00000000-0000-4000-8000-{:012x}", self.last_uid)
	}

	/// Set uid, a fresh resourceVersion and bump generation.
	fn stamp(&mut self, object: &mut Value, uid: String) {
		self.last_resource_version += 1;
		let resource_version = self.last_resource_version.to_string();

		let metadata = metadata_mut(object);
		let generation = metadata
			.get("generation")
			.and_then(Value::as_i64)
			.unwrap_or(0);
		metadata.insert("uid".to_string(), Value::String(uid));
		metadata.insert(
			"resourceVersion".to_string(),
			Value::String(resource_version),
		);
		metadata.insert("generation".to_string(), Value::from(generation + 1));
	}

	fn get(&self, path: &str, discovery: &MockDiscovery) -> ResponseTemplate {
		let key = split_object_path(path);
		if let Some(object) = self.objects.get(&key) {
			return ResponseTemplate::new(200).set_body_json(object.clone());
		}

		let items: Vec<_> = self
			.objects
			.iter()
			.filter(|((collection, _), _)| collection == path)
			.map(|(_, v)| v.clone())
			.collect();
		if !items.is_empty() || looks_like_collection(path, discovery) {
			return ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"kind": "List",
				"apiVersion": "v1",
				"metadata": {"resourceVersion": self.last_resource_version.to_string()},
				"items": items
			}));
		}

		not_found(&key.1)
	}

	fn delete(&mut self, path: &str) -> ResponseTemplate {
		let key = split_object_path(path);
		match self.objects.remove(&key) {
			Some(object) => {
				self.writes += 1;
				ResponseTemplate::new(200).set_body_json(object)
			}
			None => not_found(&key.1),
		}
	}
}

/// Derive the collection path for a manifest using the resource table.
fn collection_for_manifest(manifest: &Value, discovery: &MockDiscovery) -> Option<String> {
	let api_version = manifest.get("apiVersion")?.as_str()?;
	let kind = manifest.get("kind")?.as_str()?;
	let namespace = manifest
		.pointer("/metadata/namespace")
		.and_then(Value::as_str);
	discovery.collection_path(api_version, kind, namespace)
}

/// Parse a Kubernetes API path into (collection_path, resource_name).
///
/// Examples:
/// - `/apis/apps/v1/namespaces/default/deployments/my-deploy` -> (`/apis/apps/v1/namespaces/default/deployments`, `my-deploy`)
/// - `/apis/admissionregistration.k8s.io/v1/mutatingwebhookconfigurations/hooks` -> (`/apis/admissionregistration.k8s.io/v1/mutatingwebhookconfigurations`, `hooks`)
fn split_object_path(path: &str) -> ObjectKey {
	let path = path.trim_end_matches('/');
	match path.rsplit_once('/') {
		Some((collection, name)) => (collection.to_string(), name.to_string()),
		None => (path.to_string(), String::new()),
	}
}

/// Collection paths end in a served plural resource name rather than an object name.
fn looks_like_collection(path: &str, discovery: &MockDiscovery) -> bool {
	path.rsplit('/')
		.next()
		.is_some_and(|last| discovery.serves(last))
}

fn is_deployment_collection(collection: &str) -> bool {
	collection.ends_with("/deployments")
}

fn object_name(object: &Value) -> Option<String> {
	object
		.pointer("/metadata/name")
		.and_then(Value::as_str)
		.filter(|name| !name.is_empty())
		.map(str::to_string)
}

fn existing_string(object: &Value, field: &str) -> Option<String> {
	object
		.get("metadata")?
		.get(field)?
		.as_str()
		.filter(|s| !s.is_empty())
		.map(str::to_string)
}

fn metadata_mut(object: &mut Value) -> &mut Map<String, Value> {
	if !object.is_object() {
		*object = Value::Object(Map::new());
	}
	let Value::Object(obj) = object else {
		unreachable!("object was just normalised to a map");
	};
	let metadata = obj
		.entry("metadata")
		.or_insert_with(|| Value::Object(Map::new()));
	if !metadata.is_object() {
		*metadata = Value::Object(Map::new());
	}
	metadata
		.as_object_mut()
		.expect("metadata was just normalised to a map")
}

fn parse_body(body: &[u8]) -> Option<Value> {
	serde_json::from_slice(body).ok().filter(Value::is_object)
}

fn not_found(name: &str) -> ResponseTemplate {
	ResponseTemplate::new(404).set_body_json(status_body(
		404,
		"NotFound",
		&format!("\"{}\" not found", name),
	))
}

fn bad_request() -> ResponseTemplate {
	ResponseTemplate::new(400).set_body_json(status_body(
		400,
		"BadRequest",
		"request body is not a JSON object",
	))
}

fn invalid(message: &str) -> ResponseTemplate {
	ResponseTemplate::new(422).set_body_json(status_body(422, "Invalid", message))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_split_object_path() {
		assert_eq!(
			split_object_path("/apis/apps/v1/namespaces/default/deployments/web"),
			(
				"/apis/apps/v1/namespaces/default/deployments".to_string(),
				"web".to_string()
			)
		);
		assert_eq!(
			split_object_path(
				"/apis/admissionregistration.k8s.io/v1/validatingwebhookconfigurations/hooks/"
			),
			(
				"/apis/admissionregistration.k8s.io/v1/validatingwebhookconfigurations".to_string(),
				"hooks".to_string()
			)
		);
	}

	#[test]
	fn test_stamp_assigns_fresh_versions() {
		let mut state = StoreState::default();
		let mut object = serde_json::json!({"metadata": {"name": "a"}});
		let uid = state.next_uid();
		state.stamp(&mut object, uid.clone());
		let first = existing_string(&object, "resourceVersion");
		state.stamp(&mut object, uid.clone());
		let second = existing_string(&object, "resourceVersion");

		assert_ne!(first, second);
		assert_eq!(existing_string(&object, "uid"), Some(uid));
		assert_eq!(object.pointer("/metadata/generation"), Some(&Value::from(2)));
	}

	#[test]
	fn test_faults_fire_once_per_method() {
		let mut state = StoreState::default();
		state.faults.push_back(Fault::conflict_on_update());
		state.faults.push_back(Fault::forbidden_on_create());

		assert!(state.take_fault("GET").is_none());
		assert_eq!(state.take_fault("POST"), Some(Fault::forbidden_on_create()));
		assert_eq!(state.take_fault("PUT"), Some(Fault::conflict_on_update()));
		assert!(state.take_fault("PUT").is_none());
	}

	#[tokio::test]
	async fn test_seeded_objects_get_identity() {
		let server = HttpMockK8sServer::builder()
			.resources(vec![serde_json::json!({
				"apiVersion": "admissionregistration.k8s.io/v1",
				"kind": "ValidatingWebhookConfiguration",
				"metadata": {"name": "hooks"},
				"webhooks": []
			})])
			.build()
			.start()
			.await;

		let stored = server
			.object(
				"admissionregistration.k8s.io/v1",
				"ValidatingWebhookConfiguration",
				None,
				"hooks",
			)
			.expect("seeded object should be stored");
		assert!(existing_string(&stored, "uid").is_some());
		assert!(existing_string(&stored, "resourceVersion").is_some());
		assert_eq!(server.write_count(), 0);
	}
}
