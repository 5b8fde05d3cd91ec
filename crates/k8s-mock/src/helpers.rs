//! Helper functions for mock Kubernetes testing.

use serde_json::{json, Value};

/// Apply a JSON merge patch (RFC 7386) to `base`.
///
/// `null` in the patch removes the key from the base object.
pub fn merge_json(base: Value, patch: Value) -> Value {
	match (base, patch) {
		(Value::Object(mut base_map), Value::Object(patch_map)) => {
			for (key, patch_value) in patch_map {
				if patch_value.is_null() {
					base_map.remove(&key);
					continue;
				}
				let base_value = base_map.remove(&key).unwrap_or(Value::Null);
				base_map.insert(key, merge_json(base_value, patch_value));
			}
			Value::Object(base_map)
		}
		(_, patch) => patch,
	}
}

/// Build a `metav1.Status` failure body.
pub fn status_body(code: u16, reason: &str, message: &str) -> Value {
	json!({
		"kind": "Status",
		"apiVersion": "v1",
		"metadata": {},
		"status": "Failure",
		"message": message,
		"reason": reason,
		"code": code
	})
}

/// Pretend a deployment controller has fully rolled out the Deployment.
///
/// Every desired replica becomes ready and the `Available` condition is set.
pub fn simulate_rollout(deployment: &mut Value) {
	let replicas = deployment
		.pointer("/spec/replicas")
		.and_then(Value::as_i64)
		.unwrap_or(1);
	let generation = deployment
		.pointer("/metadata/generation")
		.and_then(Value::as_i64)
		.unwrap_or(1);

	if let Value::Object(obj) = deployment {
		obj.insert(
			"status".to_string(),
			json!({
				"observedGeneration": generation,
				"replicas": replicas,
				"updatedReplicas": replicas,
				"readyReplicas": replicas,
				"availableReplicas": replicas,
				"conditions": [{
					"type": "Available",
					"status": "True",
					"reason": "MinimumReplicasAvailable",
					"message": "Deployment has minimum availability."
				}]
			}),
		);
	}
}
