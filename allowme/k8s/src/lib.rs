#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use allowme_core::{AllowList, AllowListStore, ResourceVersion, Snapshot, StoreError};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use tokio::time;
use tracing::debug;

pub use kube::Client;

pub const FIELD_MANAGER: &str = "allowme";

/// Stores an allow-list in a LoadBalancer Service's
/// `spec.loadBalancerSourceRanges`.
///
/// Writes are merge patches that carry the `resourceVersion` of the snapshot
/// they were derived from, so the API server rejects them with a conflict if
/// the Service changed in the meantime.
#[derive(Clone)]
pub struct ServiceStore {
    api: Api<Service>,
    name: String,
    timeout: time::Duration,
}

// === impl ServiceStore ===

impl ServiceStore {
    pub fn new(
        client: Client,
        namespace: &str,
        name: impl ToString,
        timeout: time::Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ServiceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceStore")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait::async_trait]
impl AllowListStore for ServiceStore {
    async fn fetch(&self) -> Result<Snapshot, StoreError> {
        let svc = time::timeout(self.timeout, self.api.get(&self.name))
            .await
            .map_err(|_| timed_out(self.timeout))?
            .map_err(api_error)?;
        snapshot(svc)
    }

    async fn conditional_replace(
        &self,
        list: AllowList,
        expected: &ResourceVersion,
    ) -> Result<(), StoreError> {
        let patch = source_ranges_patch(&list, expected);
        debug!(service = %self.name, %patch, "Patching Service");
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        time::timeout(
            self.timeout,
            self.api.patch(&self.name, &params, &Patch::Merge(&patch)),
        )
        .await
        .map_err(|_| timed_out(self.timeout))?
        .map_err(api_error)?;
        Ok(())
    }
}

fn snapshot(svc: Service) -> Result<Snapshot, StoreError> {
    let version = svc
        .metadata
        .resource_version
        .ok_or_else(|| StoreError::unavailable("Service has no resourceVersion"))?;
    let list = svc
        .spec
        .and_then(|spec| spec.load_balancer_source_ranges)
        .unwrap_or_default();
    Ok(Snapshot {
        list: list.into(),
        version: version.into(),
    })
}

fn source_ranges_patch(list: &AllowList, version: &ResourceVersion) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": version.as_str(),
        },
        "spec": {
            "loadBalancerSourceRanges": list.iter().collect::<Vec<_>>(),
        },
    })
}

fn api_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(ref rsp) if rsp.code == 409 => StoreError::VersionConflict,
        error => StoreError::unavailable(error),
    }
}

fn timed_out(timeout: time::Duration) -> StoreError {
    StoreError::unavailable(format!("request timed out after {timeout:?}"))
}
