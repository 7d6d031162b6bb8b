use kube::Resource;

use crate::store_types::Store;

// Label carried by every owned object and member pod.
pub const STORE_LABEL_KEY: &str = "store";

// Per-pod replication role label.
pub const ROLE_LABEL_KEY: &str = "role";
pub const PRIMARY_LABEL: &str = "primary";
pub const SECONDARY_LABEL: &str = "secondary";

pub const HEADLESS_TYPE_LABEL_KEY: &str = "service-type";
pub const HEADLESS_TYPE_LABEL: &str = "headless";

// Revision hash of the generated workload, annotated onto the StatefulSet.
pub const HASH_ANNOTATION_KEY: &str = "revision-hash";
// Key-derivation hash of the password, annotated onto the pod template.
pub const PASSWORD_HASH_ANNOTATION_KEY: &str = "revision-hash-of-credential";

pub const STORE_CONTAINER_NAME: &str = "store";
pub const EXPORTER_CONTAINER_NAME: &str = "exporter";
pub const EXPORTER_PORT: i32 = 9121;

pub const CONFIG_FILE_NAME: &str = "conf";
pub const CONFIG_MOUNT_PATH: &str = "/config/conf";
pub const SECRET_FILE_NAME: &str = "auth.conf";
pub const SECRET_MOUNT_PATH: &str = "/secret/auth.conf";
pub const DATA_MOUNT_PATH: &str = "/data";
pub const WORKING_DIR: &str = DATA_MOUNT_PATH;

/// Generic name for all owned resources. Serves as the prefix for the
/// children that need a more specific name.
pub fn object_name(store: &Store) -> String {
    format!("store-{}", store.meta().name.as_ref().unwrap())
}

pub fn headless_service_name(store: &Store) -> String {
    format!("{}-{}", object_name(store), HEADLESS_TYPE_LABEL)
}

pub fn primary_service_name(store: &Store) -> String {
    format!("{}-{}", object_name(store), PRIMARY_LABEL)
}
