pub mod common;
pub mod contains;
pub mod replication;
pub mod resources;
pub mod store_types;

use anyhow::Result;
use futures::future::join_all;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::policy::v1 as policyv1;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client, CustomResourceExt, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::{env, fmt::Debug, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::common::*;
use crate::replication::{
    Address, Replication, ReplicationError, DEFAULT_FAILOVER_TIMEOUT, PORT,
};
use crate::resources::*;
use crate::store_types::{Store, StoreStatus};

#[derive(Debug, Error)]
enum Error {
    #[error("failed to get Store: {0}")]
    StoreGetFailed(#[source] kube::Error),
    #[error("failed to fetch password: {0}")]
    PasswordFetchFailed(#[source] kube::Error),
    #[error("password secret {secret} has no key {key}")]
    PasswordKeyMissing { secret: String, key: String },
    #[error("failed to fetch {kind}: {source}")]
    ChildGetFailed {
        kind: &'static str,
        source: kube::Error,
    },
    #[error("failed to create {kind}: {source}")]
    ChildCreateFailed {
        kind: &'static str,
        source: kube::Error,
    },
    #[error("failed to update {kind}: {source}")]
    ChildUpdateFailed {
        kind: &'static str,
        source: kube::Error,
    },
    #[error("failed to list pods: {0}")]
    PodListFailed(#[source] kube::Error),
    #[error("error reconfiguring replication: {0}")]
    ReconfigureFailed(#[source] ReplicationError),
    #[error("conflict updating pod {0}")]
    PodUpdateConflict(String),
    #[error("failed to patch pod {pod}: {source}")]
    PodPatchFailed { pod: String, source: kube::Error },
    #[error("failed to update pods: {0}")]
    PodUpdateFailed(String),
    #[error("IP address conflict for pod {pod}: {ip}")]
    IpConflict { pod: String, ip: String },
    #[error("failed to serialize Store status: {0}")]
    StatusEncodeFailed(#[source] serde_json::Error),
    #[error("failed to update Store status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.reason == "AlreadyExists")
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

enum Outcome {
    Unchanged,
    Applied,
}

/// Keeps one child object in sync with its generated form. A missing child
/// is created; an existing one is compared by the kind-specific predicate,
/// which mutates it towards the generated form, and updated. Update
/// conflicts are part of normal operation and report the same way as an
/// applied change, so the caller requeues.
async fn create_or_update<K>(
    client: &Client,
    store: &Store,
    kind: &'static str,
    desired: K,
    update_needed: fn(&mut K, &K) -> bool,
) -> Result<Outcome, Error>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned,
{
    let namespace = store
        .meta()
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let api = Api::<K>::namespaced(client.clone(), namespace);

    let current = api
        .get_opt(&name)
        .await
        .map_err(|source| Error::ChildGetFailed { kind, source })?;

    match current {
        None => {
            match api.create(&PostParams::default(), &desired).await {
                Ok(_) => {}
                Err(err) if is_already_exists(&err) => {}
                Err(source) => return Err(Error::ChildCreateFailed { kind, source }),
            }
            Ok(Outcome::Applied)
        }
        Some(mut current) => {
            if !update_needed(&mut current, &desired) {
                return Ok(Outcome::Unchanged);
            }
            match api.replace(&name, &PostParams::default(), &current).await {
                Ok(_) => Ok(Outcome::Applied),
                Err(err) if is_conflict(&err) => {
                    debug!(kind, "conflict updating child, requeue");
                    Ok(Outcome::Applied)
                }
                Err(source) => Err(Error::ChildUpdateFailed { kind, source }),
            }
        }
    }
}

/// Walks the managed child kinds in a fixed order. The first applied change
/// short-circuits so that the reconcile requeues and starts over from a
/// fresh view of the world.
async fn apply_children(
    client: &Client,
    store: &Store,
    password: Option<&str>,
) -> Result<Outcome, Error> {
    for variant in [
        ServiceVariant::All,
        ServiceVariant::Headless,
        ServiceVariant::Primary,
    ] {
        if let Outcome::Applied = create_or_update(
            client,
            store,
            "Service",
            make_service(store, variant),
            service_update_needed,
        )
        .await?
        {
            info!(?variant, "Applied Service");
            return Ok(Outcome::Applied);
        }
    }

    if let Some(password) = password {
        if let Outcome::Applied = create_or_update(
            client,
            store,
            "Secret",
            make_secret(store, password),
            secret_update_needed,
        )
        .await?
        {
            info!("Applied Secret");
            return Ok(Outcome::Applied);
        }
    }

    if let Outcome::Applied = create_or_update(
        client,
        store,
        "ConfigMap",
        make_config_map(store, None),
        config_map_update_needed,
    )
    .await?
    {
        info!("Applied ConfigMap");
        return Ok(Outcome::Applied);
    }

    if let Outcome::Applied = create_or_update(
        client,
        store,
        "PodDisruptionBudget",
        make_pod_disruption_budget(store),
        pod_disruption_budget_update_needed,
    )
    .await?
    {
        info!("Applied PodDisruptionBudget");
        return Ok(Outcome::Applied);
    }

    if let Outcome::Applied = create_or_update(
        client,
        store,
        "StatefulSet",
        make_stateful_set(store, password),
        stateful_set_update_needed,
    )
    .await?
    {
        info!("Applied StatefulSet");
        return Ok(Outcome::Applied);
    }

    Ok(Outcome::Unchanged)
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Reconciles one Store object: syncs the children, then observes the live
/// replication and repairs it. Stateless by design; every call re-derives
/// the truth from the live instances.
async fn reconcile(store_from_cache: Arc<Store>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = store_from_cache
        .meta()
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = store_from_cache
        .meta()
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let store_api = Api::<Store>::namespaced(client.clone(), namespace);

    // Fetch before acting. A missing object means the owned children are
    // being garbage-collected and there is nothing left to do.
    let fetched = match store_api.get(name).await {
        Ok(fetched) => fetched,
        Err(err) if is_not_found(&err) => {
            info!("{name} not found, end reconcile");
            return Ok(Action::await_change());
        }
        Err(source) => return Err(Error::StoreGetFailed(source)),
    };

    // work with a copy; the fetched object is kept for the status update
    let mut store = fetched.clone();
    store
        .meta_mut()
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(STORE_LABEL_KEY.to_string(), name.clone());

    // The password is read from the Secret on every cycle and never cached.
    let mut password = None;
    if let Some(reference) = &store.spec.password {
        let secret_name = reference
            .secret_key_ref
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".spec.password.secretKeyRef.name"))?;
        let secret_api = Api::<corev1::Secret>::namespaced(client.clone(), namespace);
        let secret = secret_api
            .get(&secret_name)
            .await
            .map_err(Error::PasswordFetchFailed)?;
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&reference.secret_key_ref.key))
            .ok_or_else(|| Error::PasswordKeyMissing {
                secret: secret_name.clone(),
                key: reference.secret_key_ref.key.clone(),
            })?;
        let value = String::from_utf8_lossy(&value.0).to_string();
        // an outside user can try ~150k passwords per second against an
        // in-memory store, so a short alphanumeric one is as good as none
        if value.len() < 8 && value.chars().all(|c| c.is_ascii_alphanumeric()) {
            warn!("the password looks weak, please change it");
        }
        password = Some(value);
    }

    if let Outcome::Applied = apply_children(client, &store, password.as_deref()).await? {
        return Ok(Action::requeue(Duration::ZERO));
    }

    // All the child resources are in place. The replication state should be
    // checked and reconfigured if needed.
    let pod_api = Api::<corev1::Pod>::namespaced(client.clone(), namespace);
    let selector = store
        .meta()
        .labels
        .as_ref()
        .map(label_selector)
        .unwrap_or_default();
    let pods = pod_api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::PodListFailed)?;

    // only running pods with an assigned IP and all containers ready count
    let mut addresses = Vec::new();
    for pod in &pods.items {
        let Some(status) = &pod.status else { continue };
        if status.phase.as_deref() != Some("Running") {
            continue;
        }
        let Some(ip) = status.pod_ip.clone().filter(|ip| !ip.is_empty()) else {
            continue;
        };
        let all_ready = status
            .container_statuses
            .as_ref()
            .map(|statuses| statuses.iter().all(|s| s.ready))
            .unwrap_or(true);
        if !all_ready {
            continue;
        }
        addresses.push(Address {
            host: ip,
            port: PORT.to_string(),
        });
    }

    let mut replication = match Replication::new(password.as_deref(), &addresses).await {
        Ok(replication) => replication,
        Err(err) => {
            // this is part of normal operation under partial failure
            info!(%err, "error creating replication, requeue");
            return Ok(Action::requeue(Duration::ZERO));
        }
    };

    replication
        .reconfigure()
        .await
        .map_err(Error::ReconfigureFailed)?;

    // wait for the reconfigured replication to settle on a primary
    let mut primary = None;
    let started = Instant::now();
    let mut delay = Duration::from_millis(100);
    loop {
        match replication.refresh().await {
            Ok(()) => {
                if let Some(address) = replication.primary_address() {
                    primary = Some(address);
                    break;
                }
            }
            Err(err) => debug!(%err, "refresh failed while waiting for a primary"),
        }
        if started.elapsed() + delay >= DEFAULT_FAILOVER_TIMEOUT {
            break;
        }
        sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(1));
    }
    let size = replication.size();
    replication.disconnect();

    let Some(primary) = primary else {
        info!("no primary discovered, requeue");
        return Ok(Action::requeue(Duration::ZERO));
    };

    // Assign the role labels to the pods in parallel and capture the primary
    // pod's name. The single-slot channel catches the degenerate case of two
    // pods claiming the primary IP.
    let (primary_pod_tx, mut primary_pod_rx) = mpsc::channel::<String>(1);
    let patches = pods.items.iter().map(|pod| {
        let api = pod_api.clone();
        let primary_host = primary.host.clone();
        let tx = primary_pod_tx.clone();
        async move {
            let pod_name = pod.name_any();
            let pod_ip = pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.clone())
                .unwrap_or_default();
            let current_role = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(ROLE_LABEL_KEY))
                .map(String::as_str);

            let role = if pod_ip == primary_host {
                if tx.try_send(pod_name.clone()).is_err() {
                    // very unlikely to happen but still...
                    return Err(Error::IpConflict {
                        pod: pod_name,
                        ip: pod_ip,
                    });
                }
                PRIMARY_LABEL
            } else {
                SECONDARY_LABEL
            };

            if current_role == Some(role) {
                return Ok(());
            }

            let patch = serde_json::json!({"metadata": {"labels": {ROLE_LABEL_KEY: role}}});
            match api
                .patch(&pod_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => Ok(()),
                Err(err) if is_conflict(&err) => Err(Error::PodUpdateConflict(pod_name)),
                Err(source) => Err(Error::PodPatchFailed {
                    pod: pod_name,
                    source,
                }),
            }
        }
    });
    let results = join_all(patches).await;
    drop(primary_pod_tx);

    let mut conflicts = 0;
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(()) => {}
            Err(Error::PodUpdateConflict(pod)) => {
                debug!(%pod, "conflict updating pod");
                conflicts += 1;
            }
            Err(err) => failures.push(err.to_string()),
        }
    }
    if !failures.is_empty() {
        return Err(Error::PodUpdateFailed(failures.join("; ")));
    }
    if conflicts > 0 {
        debug!("conflict updating pods, requeue");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let Ok(primary_pod) = primary_pod_rx.try_recv() else {
        info!("the primary address matches none of the pods, requeue");
        return Ok(Action::requeue(Duration::ZERO));
    };

    // update the configuration with the current primary's address
    if let Outcome::Applied = create_or_update(
        client,
        &store,
        "ConfigMap",
        make_config_map(&store, Some(&primary)),
        config_map_update_needed,
    )
    .await?
    {
        info!("Updated ConfigMap");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let status = StoreStatus {
        replicas: size as i32,
        primary: primary_pod,
    };
    if fetched.status.as_ref() == Some(&status) {
        // everything is in sync, nothing to write
        return Ok(Action::await_change());
    }

    let mut updated = fetched;
    updated.status = Some(status);
    let data = serde_json::to_vec(&updated).map_err(Error::StatusEncodeFailed)?;
    match store_api
        .replace_status(name, &PostParams::default(), data)
        .await
    {
        Ok(_) => {
            info!("updated Store status");
            Ok(Action::await_change())
        }
        Err(err) if is_conflict(&err) => {
            debug!("conflict updating Store status, requeue");
            Ok(Action::requeue(Duration::ZERO))
        }
        Err(source) => Err(Error::StatusUpdateFailed(source)),
    }
}

/// The controller triggers this on reconcile errors.
fn error_policy(_store: Arc<Store>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("reconcile failed: {error}");
    Action::requeue(Duration::from_secs(10))
}

// Data we want access to in error/reconcile calls
struct Data {
    client: Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    match env::args().nth(1).as_deref() {
        Some("export") => {
            info!("exporting custom resource definition");
            println!("{}", serde_yaml::to_string(&Store::crd())?);
        }
        Some("run") => {
            info!("running store-controller");
            let client = Client::try_default().await?;
            let stores = Api::<Store>::all(client.clone());

            Controller::new(stores, watcher::Config::default())
                .owns(
                    Api::<corev1::Service>::all(client.clone()),
                    watcher::Config::default(),
                )
                .owns(
                    Api::<corev1::Secret>::all(client.clone()),
                    watcher::Config::default(),
                )
                .owns(
                    Api::<corev1::ConfigMap>::all(client.clone()),
                    watcher::Config::default(),
                )
                .owns(
                    Api::<policyv1::PodDisruptionBudget>::all(client.clone()),
                    watcher::Config::default(),
                )
                .owns(
                    Api::<appsv1::StatefulSet>::all(client.clone()),
                    watcher::Config::default(),
                )
                .shutdown_on_signal()
                .run(reconcile, error_policy, Arc::new(Data { client }))
                .for_each(|res| async move {
                    match res {
                        Ok(o) => info!("reconciled {:?}", o),
                        Err(e) => warn!("reconcile failed: {}", e),
                    }
                })
                .await;
            info!("controller terminated");
        }
        _ => warn!("wrong command; please use \"export\" or \"run\""),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_joins_pairs() {
        let labels = BTreeMap::from([
            ("store".to_string(), "example".to_string()),
            ("team".to_string(), "data".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "store=example,team=data");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
