//! Deployment mutation primitives.
//!
//! Every operation here is computed from a freshly read definition taken
//! immediately before the mutation is applied, which narrows but does
//! not eliminate the window for conflicting concurrent writes. Errors
//! propagate unmodified except that not-found is distinguished so
//! callers can choose idempotent-skip over hard-fail.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::{FIELD_MANAGER, LABEL_NAME, LABEL_PRIMARY, LABEL_REPLICA};
use crate::controller::error::Result;

fn deployments(client: &Client, namespace: &str) -> Api<Deployment> {
    Api::namespaced(client.clone(), namespace)
}

/// Create a deployment.
pub async fn create_deployment(
    client: &Client,
    deployment: &Deployment,
    namespace: &str,
) -> Result<()> {
    let api = deployments(client, namespace);
    match api.create(&PostParams::default(), deployment).await {
        Ok(created) => {
            info!(deployment = %created.name_any(), namespace = %namespace, "created deployment");
            Ok(())
        }
        Err(e) => {
            error!(
                deployment = %deployment.name_any(),
                namespace = %namespace,
                "error creating deployment: {}",
                e
            );
            Err(e.into())
        }
    }
}

/// Delete a deployment with foreground propagation so dependents are
/// gone before the deployment itself is.
pub async fn delete_deployment(client: &Client, name: &str, namespace: &str) -> Result<()> {
    let api = deployments(client, namespace);
    match api.delete(name, &DeleteParams::foreground()).await {
        Ok(_) => {
            info!(deployment = %name, namespace = %namespace, "deleted deployment");
            Ok(())
        }
        Err(e) => {
            error!(deployment = %name, namespace = %namespace, "error deleting deployment: {}", e);
            Err(e.into())
        }
    }
}

/// Get a deployment. Not-found is `Ok(None)`, every other failure is an
/// error.
pub async fn get_deployment(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<Deployment>> {
    let api = deployments(client, namespace);
    match api.get_opt(name).await {
        Ok(Some(deployment)) => Ok(Some(deployment)),
        Ok(None) => {
            debug!(deployment = %name, namespace = %namespace, "deployment not found");
            Ok(None)
        }
        Err(e) => {
            error!(deployment = %name, namespace = %namespace, "error getting deployment: {}", e);
            Err(e.into())
        }
    }
}

/// List deployments matching a label selector.
pub async fn list_deployments(
    client: &Client,
    selector: &str,
    namespace: &str,
) -> Result<Vec<Deployment>> {
    let api = deployments(client, namespace);
    match api.list(&ListParams::default().labels(selector)).await {
        Ok(list) => Ok(list.items),
        Err(e) => {
            error!(
                selector = %selector,
                namespace = %namespace,
                "error listing deployments: {}",
                e
            );
            Err(e.into())
        }
    }
}

/// Replace a deployment with a full definition.
pub async fn update_deployment(client: &Client, deployment: &Deployment) -> Result<()> {
    let name = deployment.name_any();
    let namespace = deployment.namespace().unwrap_or_default();
    let api = deployments(client, &namespace);

    if let Err(e) = api.replace(&name, &PostParams::default(), deployment).await {
        error!(deployment = %name, namespace = %namespace, "error updating deployment: {}", e);
        return Err(e.into());
    }
    Ok(())
}

/// Scale a deployment to `replicas`, mutating only the replica count
/// before delegating to a full update.
pub async fn scale_deployment(
    client: &Client,
    mut deployment: Deployment,
    replicas: i32,
) -> Result<()> {
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
    update_deployment(client, &deployment).await
}

/// Apply a strategic merge patch.
pub async fn patch_deployment_strategic(
    client: &Client,
    name: &str,
    namespace: &str,
    patch: &Value,
) -> Result<()> {
    let api = deployments(client, namespace);
    debug!(deployment = %name, namespace = %namespace, "strategic merge patch: {}", patch);

    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Strategic(patch),
    )
    .await?;
    Ok(())
}

/// Patch the replica count at `json_pointer` with a JSON patch that
/// touches nothing else, making scaling independent of any concurrent
/// spec edit.
pub async fn patch_replicas(
    client: &Client,
    name: &str,
    namespace: &str,
    json_pointer: &str,
    replicas: i32,
) -> Result<()> {
    let api = deployments(client, namespace);
    let patch = replica_patch(json_pointer, replicas)?;

    match api
        .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
        .await
    {
        Ok(_) => {
            info!(
                deployment = %name,
                namespace = %namespace,
                replicas,
                "patched deployment replica count"
            );
            Ok(())
        }
        Err(e) => {
            error!(deployment = %name, namespace = %namespace, "error patching deployment: {}", e);
            Err(e.into())
        }
    }
}

/// Build the single-operation JSON patch used by [`patch_replicas`].
pub fn replica_patch(json_pointer: &str, replicas: i32) -> Result<json_patch::Patch> {
    let ops = serde_json::json!([
        { "op": "replace", "path": json_pointer, "value": replicas }
    ]);
    Ok(serde_json::from_value(ops)?)
}

/// Apply the delta between two serialized deployment definitions as a
/// merge patch, leaving fields changed concurrently by others untouched.
pub async fn merge_patch_deployment(
    client: &Client,
    original: &Deployment,
    mutated: &Deployment,
) -> Result<()> {
    let name = original.name_any();
    let namespace = original.namespace().unwrap_or_default();
    let api = deployments(client, &namespace);

    let orig_value = serde_json::to_value(original)?;
    let new_value = serde_json::to_value(mutated)?;
    let patch = merge_patch_between(&orig_value, &new_value);

    match api
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => {
            info!(deployment = %name, namespace = %namespace, "merge patched deployment");
            Ok(())
        }
        Err(e) => {
            error!(
                deployment = %name,
                namespace = %namespace,
                "error merge patching deployment: {}",
                e
            );
            Err(e.into())
        }
    }
}

/// Promote a deployment to primary.
///
/// Mutates the three role labels on both the selector and the pod
/// template of the given definition, then applies only that delta. Two
/// concurrent promotions racing on the same cluster are not fenced; a
/// single active controller instance per installation is assumed.
pub async fn promote_deployment(
    client: &Client,
    original: &Deployment,
    new_name: &str,
) -> Result<()> {
    let promoted = build_promotion(original, new_name);
    merge_patch_deployment(client, original, &promoted).await
}

/// Demote a deployment back to replica, the counterpart of promotion
/// applied to any deployment still carrying the primary labels.
pub async fn demote_deployment(client: &Client, original: &Deployment) -> Result<()> {
    let demoted = build_demotion(original);
    merge_patch_deployment(client, original, &demoted).await
}

/// Add or replace a single metadata label through a merge patch.
pub async fn add_label_to_deployment(
    client: &Client,
    original: &Deployment,
    key: &str,
    value: &str,
) -> Result<()> {
    let mut labeled = original.clone();
    labeled
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());

    debug!(deployment = %original.name_any(), "adding label {}={}", key, value);
    merge_patch_deployment(client, original, &labeled).await
}

/// The in-memory promotion transformation: role labels flip to
/// `primary=true, replica=false` under the new name, on selector and
/// template alike.
pub fn build_promotion(original: &Deployment, new_name: &str) -> Deployment {
    set_role_labels(original, new_name, true)
}

fn build_demotion(original: &Deployment) -> Deployment {
    set_role_labels(original, &original.name_any(), false)
}

fn set_role_labels(original: &Deployment, name: &str, primary: bool) -> Deployment {
    let mut updated = original.clone();
    let (primary_value, replica_value) = if primary {
        ("true", "false")
    } else {
        ("false", "true")
    };

    if let Some(spec) = updated.spec.as_mut() {
        let selector = spec.selector.match_labels.get_or_insert_with(Default::default);
        selector.insert(LABEL_NAME.to_string(), name.to_string());
        selector.insert(LABEL_PRIMARY.to_string(), primary_value.to_string());
        selector.insert(LABEL_REPLICA.to_string(), replica_value.to_string());

        let labels = spec
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(Default::default);
        labels.insert(LABEL_NAME.to_string(), name.to_string());
        labels.insert(LABEL_PRIMARY.to_string(), primary_value.to_string());
        labels.insert(LABEL_REPLICA.to_string(), replica_value.to_string());
    }

    updated
}

/// Compute an RFC 7386 merge patch turning `original` into `mutated`.
///
/// Unchanged fields are absent from the patch; fields removed in
/// `mutated` become explicit nulls. Arrays are replaced wholesale, per
/// the merge patch rules.
pub fn merge_patch_between(original: &Value, mutated: &Value) -> Value {
    match (original, mutated) {
        (Value::Object(orig), Value::Object(new)) => {
            let mut patch = serde_json::Map::new();

            for (key, new_value) in new {
                match orig.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) if old_value.is_object() && new_value.is_object() => {
                        patch.insert(key.clone(), merge_patch_between(old_value, new_value));
                    }
                    _ => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }

            for key in orig.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            Value::Object(patch)
        }
        _ => mutated.clone(),
    }
}
