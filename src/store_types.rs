use k8s_openapi::api::core::v1 as corev1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store is a highly available replicated deployment of an in-memory
/// key-value store. The controller materializes the child resources and
/// keeps the replication topology converged on a single primary.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "store.dev", version = "v1alpha1", kind = "Store")]
#[kube(shortname = "st", namespaced, status = "StoreStatus")]
#[kube(scale = r#"{"specReplicasPath":".spec.replicas", "statusReplicasPath":".status.replicas"}"#)]
#[kube(
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.primary", "description":"Current primary's Pod name"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".status.replicas", "description":"Observed number of instances"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas", "description":"Desired number of instances"}"#
)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Replicas is the number of instances in the replicated deployment.
    #[schemars(range(min = 3))]
    pub replicas: i32,

    /// Config allows to pass custom configuration directives.
    /// Directives controlled by the controller are silently dropped.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,

    /// Password protects the store instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Password>,

    /// Extra annotations added to the member pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Pod securityContext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<corev1::PodSecurityContext>,
    /// Pod affinity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<corev1::Affinity>,
    /// NodeSelector constrains member pods to nodes carrying these labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Pod tolerations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<corev1::Toleration>>,
    /// ServiceAccount the member pods run under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Pod imagePullSecrets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<corev1::LocalObjectReference>>,
    /// Pod priorityClassName.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// DataVolumeClaimTemplate gives every member a persistent data volume.
    /// Without it the data directory is an emptyDir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_claim_template: Option<corev1::PersistentVolumeClaim>,
    /// Additional volumes for the member pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<corev1::Volume>>,

    /// Store container specification.
    pub store: ContainerSpec,

    /// Metrics exporter sidecar specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter: Option<ContainerSpec>,

    /// Pod initContainers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<corev1::Container>>,
}

/// Password refers to a Secret containing the password for the store.
///
/// The password is read from the Secret on every reconcile and is never
/// stored by the controller. A key-derivation hash of it is annotated onto
/// the member pods, so rotating the password rolls the pods; with
/// persistence turned off all data is lost during rotation.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Password {
    /// SecretKeyRef points at the Secret key in the same namespace holding
    /// the password.
    pub secret_key_ref: corev1::SecretKeySelector,
}

/// ContainerSpec carries the container-specific attributes.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Image is a standard path for a container image.
    pub image: String,
    /// Resources describes the compute resource requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<corev1::ResourceRequirements>,
    /// SecurityContext applied to the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<corev1::SecurityContext>,
    /// Seconds after container start before liveness/readiness probes run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
}

/// StoreStatus contains the observed state of the replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct StoreStatus {
    /// Replicas is the number of live instances in the replication.
    pub replicas: i32,
    /// Primary is the current primary's Pod name.
    pub primary: String,
}
