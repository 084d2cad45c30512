//! Policy validation.
//!
//! Policies are validated when they appear; applying their SQL inside
//! database pods is a collaborator concern.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::PgPolicy;
use crate::watch::EventHandler;

/// Handles PgPolicy add/update/delete events.
pub struct PolicyHandler {
    client: Client,
}

impl PolicyHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn validate(&self, policy: &PgPolicy) {
        let name = policy.name_any();
        let namespace = policy.namespace().unwrap_or_default();

        let (state, message) = match policy.spec.validate() {
            Ok(()) => {
                info!(policy = %name, namespace = %namespace, "policy accepted");
                ("valid".to_string(), "policy accepted".to_string())
            }
            Err(reason) => {
                warn!(policy = %name, namespace = %namespace, "policy rejected: {}", reason);
                ("invalid".to_string(), format!("policy rejected: {}", reason))
            }
        };

        if let Err(e) = self.set_status(policy, &state, &message).await {
            error!(policy = %name, namespace = %namespace, "error updating policy status: {}", e);
        }
    }

    async fn set_status(&self, policy: &PgPolicy, state: &str, message: &str) -> Result<()> {
        let namespace = policy.namespace().unwrap_or_default();
        let api: Api<PgPolicy> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "status": {
                "state": state,
                "message": message,
            }
        });

        api.patch_status(
            &policy.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PgPolicy> for PolicyHandler {
    async fn on_add(&self, obj: &PgPolicy) {
        self.validate(obj).await;
    }

    async fn on_update(&self, _old: &PgPolicy, new: &PgPolicy) {
        self.validate(new).await;
    }

    async fn on_delete(&self, obj: &PgPolicy) {
        debug!(policy = %obj.name_any(), "policy removed");
    }
}
