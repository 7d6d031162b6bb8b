use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::policy::v1 as policyv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use kube::api::{ObjectMeta, Resource};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::common::*;
use crate::contains::deep_contains;
use crate::replication::{Address, MINIMUM_FAILOVER_SIZE, PORT};
use crate::store_types::{ContainerSpec, Store};

/// Configuration directives dropped from the user-supplied config. They are
/// either controlled by the controller or would break the managed instances
/// if changed. Sorted in order of appearance in the stock configuration
/// file.
const EXCLUDED_CONFIG_DIRECTIVES: [&str; 12] = [
    "include",
    "bind",
    "protected-mode",
    "port",
    "daemonize",
    "dir",
    "replica-announce-ip",
    "replica-announce-port",
    "replicaof",
    "masterauth",
    "requirepass",
    "rename-command",
];

// argon2id parameters. Recommended parameters are time = 1, memory = 65536;
// time is raised to 64 to compensate for the low memory = 4096.
const ARGON_TIME: u32 = 1 << 6;
const ARGON_MEMORY: u32 = 1 << 12;
const HASH_LEN: usize = 1 << 6;

/// The three service flavors generated for every deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVariant {
    /// Cluster-IP service selecting every member pod.
    All,
    /// Headless service backing the stable pod domain names.
    Headless,
    /// Cluster-IP service selecting only the current primary.
    Primary,
}

fn object_meta(store: &Store, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: store.meta().namespace.clone(),
        labels: store.meta().labels.clone(),
        owner_references: Some(vec![store.controller_owner_ref(&()).unwrap()]),
        ..ObjectMeta::default()
    }
}

pub fn make_secret(store: &Store, password: &str) -> corev1::Secret {
    let auth = format!("requirepass {password}\nmasterauth {password}\n");
    corev1::Secret {
        metadata: object_meta(store, object_name(store)),
        data: Some(BTreeMap::from([(
            SECRET_FILE_NAME.to_string(),
            ByteString(auth.into_bytes()),
        )])),
        ..corev1::Secret::default()
    }
}

pub fn make_config_map(store: &Store, primary: Option<&Address>) -> corev1::ConfigMap {
    let mut conf = format!(
        "# Generated by store-controller for store.dev/{}\ndir {WORKING_DIR}\n",
        store.meta().name.as_ref().unwrap()
    );

    if store.spec.password.is_some() {
        conf.push_str(&format!("include {SECRET_MOUNT_PATH}\n"));
    }

    for (key, value) in &store.spec.config {
        if !EXCLUDED_CONFIG_DIRECTIVES.contains(&key.as_str()) {
            conf.push_str(&format!("{key} {value}\n"));
        }
    }

    if let Some(primary) = primary {
        conf.push_str(&format!("replicaof {} {}\n", primary.host, PORT));
    }

    corev1::ConfigMap {
        metadata: object_meta(store, object_name(store)),
        data: Some(BTreeMap::from([(CONFIG_FILE_NAME.to_string(), conf)])),
        ..corev1::ConfigMap::default()
    }
}

pub fn make_service(store: &Store, variant: ServiceVariant) -> corev1::Service {
    let base_labels = store.meta().labels.clone().unwrap_or_default();
    let mut labels = base_labels.clone();

    let (name, selector, cluster_ip) = match variant {
        ServiceVariant::All => (object_name(store), base_labels, None),
        ServiceVariant::Headless => {
            labels.insert(
                HEADLESS_TYPE_LABEL_KEY.to_string(),
                HEADLESS_TYPE_LABEL.to_string(),
            );
            (
                headless_service_name(store),
                base_labels,
                Some("None".to_string()),
            )
        }
        ServiceVariant::Primary => {
            labels.insert(ROLE_LABEL_KEY.to_string(), PRIMARY_LABEL.to_string());
            (primary_service_name(store), labels.clone(), None)
        }
    };

    let mut ports = vec![corev1::ServicePort {
        name: Some(STORE_CONTAINER_NAME.to_string()),
        protocol: Some("TCP".to_string()),
        port: i32::from(PORT),
        target_port: Some(IntOrString::Int(i32::from(PORT))),
        ..corev1::ServicePort::default()
    }];
    if store.spec.exporter.is_some() {
        ports.push(corev1::ServicePort {
            name: Some(EXPORTER_CONTAINER_NAME.to_string()),
            protocol: Some("TCP".to_string()),
            port: EXPORTER_PORT,
            target_port: Some(IntOrString::Int(EXPORTER_PORT)),
            ..corev1::ServicePort::default()
        });
    }

    let mut metadata = object_meta(store, name);
    metadata.labels = Some(labels);

    corev1::Service {
        metadata,
        spec: Some(corev1::ServiceSpec {
            ports: Some(ports),
            selector: Some(selector),
            cluster_ip,
            type_: Some("ClusterIP".to_string()),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

pub fn make_pod_disruption_budget(store: &Store) -> policyv1::PodDisruptionBudget {
    policyv1::PodDisruptionBudget {
        metadata: object_meta(store, object_name(store)),
        spec: Some(policyv1::PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(MINIMUM_FAILOVER_SIZE as i32)),
            selector: Some(metav1::LabelSelector {
                match_labels: store.meta().labels.clone(),
                ..metav1::LabelSelector::default()
            }),
            ..policyv1::PodDisruptionBudgetSpec::default()
        }),
        ..policyv1::PodDisruptionBudget::default()
    }
}

pub fn make_stateful_set(store: &Store, password: Option<&str>) -> appsv1::StatefulSet {
    let name = object_name(store);
    let config_volume_name = format!("{name}-config");
    let secret_volume_name = format!("{name}-secret");
    let data_volume_name = format!("{name}-data");

    let mut volumes = vec![corev1::Volume {
        name: config_volume_name.clone(),
        config_map: Some(corev1::ConfigMapVolumeSource {
            name: Some(name.clone()),
            ..corev1::ConfigMapVolumeSource::default()
        }),
        ..corev1::Volume::default()
    }];
    if let Some(extra) = &store.spec.volumes {
        volumes.extend(extra.iter().cloned());
    }

    let mut volume_mounts = vec![corev1::VolumeMount {
        name: config_volume_name,
        read_only: Some(true),
        mount_path: CONFIG_MOUNT_PATH.to_string(),
        sub_path: Some(CONFIG_FILE_NAME.to_string()),
        ..corev1::VolumeMount::default()
    }];
    let mut store_env = Vec::new();
    let mut annotations = store.spec.annotations.clone();

    // A password adds the hash annotation to the pod template, the auth.conf
    // volume and the CLI auth environment. Rotating the password changes the
    // hash, which rolls the member pods.
    if let (Some(password), Some(reference)) = (password, &store.spec.password) {
        annotations.insert(
            PASSWORD_HASH_ANNOTATION_KEY.to_string(),
            password_hash(password, store),
        );

        volumes.push(corev1::Volume {
            name: secret_volume_name.clone(),
            secret: Some(corev1::SecretVolumeSource {
                secret_name: Some(name.clone()),
                ..corev1::SecretVolumeSource::default()
            }),
            ..corev1::Volume::default()
        });
        volume_mounts.push(corev1::VolumeMount {
            name: secret_volume_name,
            read_only: Some(true),
            mount_path: SECRET_MOUNT_PATH.to_string(),
            sub_path: Some(SECRET_FILE_NAME.to_string()),
            ..corev1::VolumeMount::default()
        });
        store_env.push(corev1::EnvVar {
            name: "REDISCLI_AUTH".to_string(),
            value_from: Some(corev1::EnvVarSource {
                secret_key_ref: Some(reference.secret_key_ref.clone()),
                ..corev1::EnvVarSource::default()
            }),
            ..corev1::EnvVar::default()
        });
    }

    let mut volume_claim_templates = None;
    if let Some(claim) = &store.spec.data_volume_claim_template {
        volume_claim_templates = Some(vec![claim.clone()]);
        volume_mounts.push(corev1::VolumeMount {
            name: claim.metadata.name.clone().unwrap_or_default(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..corev1::VolumeMount::default()
        });
    } else {
        volumes.push(corev1::Volume {
            name: data_volume_name.clone(),
            empty_dir: Some(corev1::EmptyDirVolumeSource::default()),
            ..corev1::Volume::default()
        });
        volume_mounts.push(corev1::VolumeMount {
            name: data_volume_name,
            mount_path: DATA_MOUNT_PATH.to_string(),
            ..corev1::VolumeMount::default()
        });
    }

    let mut containers = vec![corev1::Container {
        name: STORE_CONTAINER_NAME.to_string(),
        image: Some(store.spec.store.image.clone()),
        args: Some(vec![CONFIG_MOUNT_PATH.to_string()]),
        working_dir: Some(WORKING_DIR.to_string()),
        resources: store.spec.store.resources.clone(),
        env: (!store_env.is_empty()).then_some(store_env),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(ping_probe(&store.spec.store)),
        readiness_probe: Some(ping_probe(&store.spec.store)),
        security_context: store.spec.store.security_context.clone(),
        ..corev1::Container::default()
    }];

    if let Some(exporter) = &store.spec.exporter {
        let mut env = vec![corev1::EnvVar {
            name: "REDIS_ALIAS".to_string(),
            value_from: Some(corev1::EnvVarSource {
                field_ref: Some(corev1::ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..corev1::ObjectFieldSelector::default()
                }),
                ..corev1::EnvVarSource::default()
            }),
            ..corev1::EnvVar::default()
        }];
        if let Some(reference) = &store.spec.password {
            env.push(corev1::EnvVar {
                name: "REDIS_PASSWORD".to_string(),
                value_from: Some(corev1::EnvVarSource {
                    secret_key_ref: Some(reference.secret_key_ref.clone()),
                    ..corev1::EnvVarSource::default()
                }),
                ..corev1::EnvVar::default()
            });
        }

        containers.push(corev1::Container {
            name: EXPORTER_CONTAINER_NAME.to_string(),
            image: Some(exporter.image.clone()),
            args: Some(vec![format!("--web.listen-address=:{EXPORTER_PORT}")]),
            env: Some(env),
            resources: exporter.resources.clone(),
            liveness_probe: Some(exporter_probe()),
            readiness_probe: Some(exporter_probe()),
            security_context: exporter.security_context.clone(),
            ..corev1::Container::default()
        });
    }

    let mut metadata = object_meta(store, name);
    metadata.annotations = Some(BTreeMap::new());

    let mut stateful_set = appsv1::StatefulSet {
        metadata,
        spec: Some(appsv1::StatefulSetSpec {
            replicas: Some(store.spec.replicas),
            selector: metav1::LabelSelector {
                match_labels: store.meta().labels.clone(),
                ..metav1::LabelSelector::default()
            },
            service_name: headless_service_name(store),
            template: corev1::PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: store.meta().labels.clone(),
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                }),
                spec: Some(corev1::PodSpec {
                    volumes: Some(volumes),
                    containers,
                    init_containers: store.spec.init_containers.clone(),
                    service_account_name: store.spec.service_account_name.clone(),
                    security_context: store.spec.security_context.clone(),
                    image_pull_secrets: store.spec.image_pull_secrets.clone(),
                    affinity: store.spec.affinity.clone(),
                    node_selector: (!store.spec.node_selector.is_empty())
                        .then(|| store.spec.node_selector.clone()),
                    tolerations: store.spec.tolerations.clone(),
                    priority_class_name: store.spec.priority_class_name.clone(),
                    ..corev1::PodSpec::default()
                }),
            },
            volume_claim_templates,
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    };

    // content hash of the generated object; anything template-affecting
    // changes it and rolls the pods
    let hash = match hash_object(&stateful_set) {
        Ok(hash) => hash,
        // failing to calculate the hash should not prevent normal operation
        Err(err) => format!("failed to calculate revision hash: {err}"),
    };
    if let Some(annotations) = stateful_set.metadata.annotations.as_mut() {
        annotations.insert(HASH_ANNOTATION_KEY.to_string(), hash);
    }

    stateful_set
}

fn ping_probe(container: &ContainerSpec) -> corev1::Probe {
    corev1::Probe {
        exec: Some(corev1::ExecAction {
            command: Some(vec!["redis-cli".to_string(), "ping".to_string()]),
        }),
        initial_delay_seconds: container.initial_delay_seconds,
        ..corev1::Probe::default()
    }
}

fn exporter_probe() -> corev1::Probe {
    corev1::Probe {
        http_get: Some(corev1::HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(EXPORTER_PORT),
            ..corev1::HTTPGetAction::default()
        }),
        ..corev1::Probe::default()
    }
}

/// Argon2id hash of the password, salted with the stable UID of the Store
/// object. The hash goes into a pod-template annotation, so it must never
/// reverse to the password.
fn password_hash(password: &str, store: &Store) -> String {
    let salt = store.meta().uid.clone().unwrap_or_default();
    match derive_password_hash(password.as_bytes(), salt.as_bytes()) {
        Ok(hash) => hash,
        Err(err) => format!("failed to calculate password hash: {err}"),
    }
}

fn derive_password_hash(password: &[u8], salt: &[u8]) -> Result<String, argon2::Error> {
    let params = argon2::Params::new(ARGON_MEMORY, ARGON_TIME, argon_lanes(), Some(HASH_LEN))?;
    let argon = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; HASH_LEN];
    argon.hash_password_into(password, salt, &mut out)?;
    Ok(hex::encode(out))
}

fn argon_lanes() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// sha256 over the serialized object, hex-encoded.
fn hash_object<T: Serialize>(object: &T) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(object)?);
    Ok(hex::encode(hasher.finalize()))
}

// State checkers. Each one mutates `got` towards the generated object and
// reports whether an update needs to be submitted.

pub fn secret_update_needed(got: &mut corev1::Secret, want: &corev1::Secret) -> bool {
    let mut needed = false;
    if !maps_equal(&got.metadata.labels, &want.metadata.labels) {
        got.metadata.labels = want.metadata.labels.clone();
        needed = true;
    }
    if got.data != want.data {
        got.data = want.data.clone();
        needed = true;
    }
    needed
}

pub fn config_map_update_needed(got: &mut corev1::ConfigMap, want: &corev1::ConfigMap) -> bool {
    let mut needed = false;
    if !maps_equal(&got.metadata.labels, &want.metadata.labels) {
        got.metadata.labels = want.metadata.labels.clone();
        needed = true;
    }
    // operators may append directives manually, so the generated body only
    // needs to be a substring of the current one
    let current = data_entry(&got.data);
    let generated = data_entry(&want.data);
    if !current.contains(generated) {
        got.data = want.data.clone();
        needed = true;
    }
    needed
}

fn data_entry(data: &Option<BTreeMap<String, String>>) -> &str {
    data.as_ref()
        .and_then(|d| d.get(CONFIG_FILE_NAME))
        .map(String::as_str)
        .unwrap_or_default()
}

pub fn service_update_needed(got: &mut corev1::Service, want: &corev1::Service) -> bool {
    let mut needed = false;
    if !maps_equal(&got.metadata.labels, &want.metadata.labels) {
        got.metadata.labels = want.metadata.labels.clone();
        needed = true;
    }
    let want_spec = want.spec.clone().unwrap_or_default();
    let got_spec = got.spec.get_or_insert_with(corev1::ServiceSpec::default);
    if !maps_equal(&got_spec.selector, &want_spec.selector) {
        got_spec.selector = want_spec.selector.clone();
        needed = true;
    }
    if !deep_contains(&got_spec.ports, &want_spec.ports) {
        got_spec.ports = want_spec.ports.clone();
        needed = true;
    }
    needed
}

pub fn pod_disruption_budget_update_needed(
    got: &mut policyv1::PodDisruptionBudget,
    want: &policyv1::PodDisruptionBudget,
) -> bool {
    // the spec of a disruption budget cannot be updated in place on the
    // orchestrator versions targeted, so only the labels are kept in sync
    if !maps_equal(&got.metadata.labels, &want.metadata.labels) {
        got.metadata.labels = want.metadata.labels.clone();
        return true;
    }
    false
}

pub fn stateful_set_update_needed(
    got: &mut appsv1::StatefulSet,
    want: &appsv1::StatefulSet,
) -> bool {
    let mut needed = false;
    let want_spec = want.spec.clone().unwrap_or_default();
    let got_spec = got.spec.get_or_insert_with(appsv1::StatefulSetSpec::default);

    if got_spec.replicas != want_spec.replicas {
        got_spec.replicas = want_spec.replicas;
        needed = true;
    }

    // resource quantities are normalized by the API server, so they get a
    // dedicated equality check instead of the containment one
    if !deep_contains(&got_spec.template, &want_spec.template)
        || annotation(&got.metadata, HASH_ANNOTATION_KEY)
            != annotation(&want.metadata, HASH_ANNOTATION_KEY)
        || !resource_requirements_equal(&got_spec.template, &want_spec.template)
    {
        got_spec.template = want_spec.template.clone();
        needed = true;
    }

    if !maps_equal(&got.metadata.labels, &want.metadata.labels) {
        got.metadata.labels = want.metadata.labels.clone();
        needed = true;
    }

    if !maps_equal(&got.metadata.annotations, &want.metadata.annotations) {
        got.metadata.annotations = want.metadata.annotations.clone();
        needed = true;
    }

    needed
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a String> {
    meta.annotations.as_ref().and_then(|a| a.get(key))
}

fn resource_requirements_equal(
    got: &corev1::PodTemplateSpec,
    want: &corev1::PodTemplateSpec,
) -> bool {
    let got = got
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    let want = want
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();
    if got.len() < want.len() {
        return false;
    }
    want.iter().zip(got).all(|(w, g)| w.resources == g.resources)
}

/// Compares two optional string maps, treating a missing map as empty.
fn maps_equal(a: &Option<BTreeMap<String, String>>, b: &Option<BTreeMap<String, String>>) -> bool {
    let empty = BTreeMap::new();
    a.as_ref().unwrap_or(&empty) == b.as_ref().unwrap_or(&empty)
}
