//! The long-running loop against a mock Kubernetes API server.

use std::{sync::Arc, time::Duration};

use converge::{
	status, KubeResourceClient, ReconcileConfig, ReconcileLoop, Reconciler, ResourceClient,
	ResourceRef, StaticDesiredState, Verifier, WaitOptions,
};
use indoc::indoc;
use k8s_mock::HttpMockK8sServer;
use tokio_util::sync::CancellationToken;

const TEMPLATES: &str = indoc! {r#"
	apiVersion: apps/v1
	kind: Deployment
	metadata:
	  name: controllers
	  namespace: machine-api
	spec:
	  replicas: 2
	  selector:
	    matchLabels:
	      app: controllers
	  template:
	    metadata:
	      labels:
	        app: controllers
	    spec:
	      containers:
	        - name: controller
	          image: registry.example.io/controller:v1
	---
	apiVersion: admissionregistration.k8s.io/v1
	kind: MutatingWebhookConfiguration
	metadata:
	  name: machine-api-mutating
	webhooks:
	  - name: default.machine.example.io
	    admissionReviewVersions: ["v1"]
	    sideEffects: None
	    clientConfig:
	      url: https://hooks.example.io/mutate
"#};

#[tokio::test]
async fn test_loop_converges_and_heals_deletion() {
	let server = HttpMockK8sServer::builder().build().start().await;
	let client = KubeResourceClient::new(server.client().await);
	let desired = StaticDesiredState::from_yaml_str(TEMPLATES).expect("templates");
	let managed = converge::DesiredStateProvider::managed(&desired);
	let reconciler = Arc::new(Reconciler::new(
		client,
		desired,
		ReconcileConfig {
			resync_interval: Duration::from_secs(3600),
			..Default::default()
		},
	));

	let control = ReconcileLoop::new(Arc::clone(&reconciler));
	let handle = control.handle();
	let shutdown = CancellationToken::new();
	let task = tokio::spawn(control.run(shutdown.clone()));

	let options = WaitOptions {
		timeout: Duration::from_secs(5),
		poll_interval: Duration::from_millis(20),
	};
	let verifier = Verifier::new(reconciler.client(), options, shutdown.clone());
	let hooks = ResourceRef::mutating_webhook_configuration("machine-api-mutating");
	let deployment = ResourceRef::deployment("machine-api", "controllers");

	let original = verifier
		.wait_until_recreated(&hooks, None)
		.await
		.expect("created by the initial resync");
	verifier
		.wait_until_available(&deployment)
		.await
		.expect("deployment available");

	reconciler.client().delete(&hooks).await.expect("delete");
	assert!(handle.request(hooks.clone()));

	let recreated = verifier
		.wait_until_recreated(&hooks, original.uid().map(str::to_string))
		.await
		.expect("recreated after request");
	assert_ne!(recreated.uid(), original.uid());

	let report = status::collect(reconciler.client(), reconciler.tracker(), &managed).await;
	assert!(report.is_available(), "{report:?}");

	shutdown.cancel();
	task.await.expect("loop exits");
}
