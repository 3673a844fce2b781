//! Kubernetes scale client
//!
//! Reads and merge-patches `spec.replicas` of Deployments and StatefulSets.

use super::ScaleClient;
use crate::error::SourceError;
use crate::models::WorkloadRef;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

/// Kubernetes default when `spec.replicas` is unset
const DEFAULT_REPLICAS: i32 = 1;

const FIELD_MANAGER: &str = "forecast-autoscaler";

#[derive(Clone)]
pub struct KubeScaleClient {
    client: Client,
}

impl KubeScaleClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the in-cluster or kubeconfig credentials
    pub async fn try_default() -> Result<Self, SourceError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SourceError::Request(format!("kubernetes client: {}", e)))?;
        Ok(Self::new(client))
    }
}

fn map_kube_error(workload: &WorkloadRef, e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => SourceError::NotFound(workload.to_string()),
        other => SourceError::Request(other.to_string()),
    }
}

fn unsupported(workload: &WorkloadRef) -> SourceError {
    SourceError::Request(format!(
        "unsupported workload kind '{}' for {}",
        workload.kind, workload
    ))
}

#[async_trait]
impl ScaleClient for KubeScaleClient {
    async fn get_replica_count(&self, workload: &WorkloadRef) -> Result<i32, SourceError> {
        let replicas = match workload.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &workload.namespace);
                let deploy = api
                    .get(&workload.name)
                    .await
                    .map_err(|e| map_kube_error(workload, e))?;
                deploy.spec.and_then(|s| s.replicas)
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                let sts = api
                    .get(&workload.name)
                    .await
                    .map_err(|e| map_kube_error(workload, e))?;
                sts.spec.and_then(|s| s.replicas)
            }
            _ => return Err(unsupported(workload)),
        };
        Ok(replicas.unwrap_or(DEFAULT_REPLICAS))
    }

    async fn set_replica_count(&self, workload: &WorkloadRef, replicas: i32) -> Result<(), SourceError> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };

        match workload.kind.as_str() {
            "Deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| map_kube_error(workload, e))?;
            }
            "StatefulSet" => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch(&workload.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| map_kube_error(workload, e))?;
            }
            _ => return Err(unsupported(workload)),
        }

        debug!(workload = %workload, replicas, "Patched replica count");
        Ok(())
    }
}
