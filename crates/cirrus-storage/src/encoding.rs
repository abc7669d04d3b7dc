use cirrus_core::{GroupVersionKind, ResourceKey};
use std::fmt;

/// Separator inside index keys. Label keys and values may contain '/', so a
/// byte that cannot appear in names, labels or uids is used instead.
const SEP: char = '\0';

/// Key of the monotonically increasing revision counter in the index keyspace
pub const REVISION_KEY: &[u8] = b"meta\0revision";

/// Key encoder for storage keys
pub struct KeyEncoder;

impl KeyEncoder {
    /// Encode a resource key: {group}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {group}/{kind}/{name}
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Encode a prefix for scanning objects of a kind, optionally in one namespace
    pub fn encode_prefix(gvk: &GroupVersionKind, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.is_empty() => {
                format!("{}/{}/{}/", gvk.storage_group(), gvk.kind, ns)
            }
            _ => format!("{}/{}/", gvk.storage_group(), gvk.kind),
        }
    }

    /// Parse a storage key back to (group, kind, namespace, name)
    pub fn parse_key(key: &str) -> Option<(String, String, Option<String>, String)> {
        let parts: Vec<&str> = key.split('/').collect();

        match parts.len() {
            3 => Some((
                parts[0].to_string(),
                parts[1].to_string(),
                None,
                parts[2].to_string(),
            )),
            4 => Some((
                parts[0].to_string(),
                parts[1].to_string(),
                Some(parts[2].to_string()),
                parts[3].to_string(),
            )),
            _ => None,
        }
    }
}

/// Index key types for secondary indices. The stored value of every index
/// entry is the storage key of the indexed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexKey {
    /// label\0{key}\0{value}\0{storage_key}
    Label {
        key: String,
        value: String,
        storage_key: String,
    },
    /// owner\0{owner_uid}\0{storage_key}
    Owner {
        owner_uid: String,
        storage_key: String,
    },
}

impl IndexKey {
    /// Encode the index key to a string
    pub fn encode(&self) -> String {
        match self {
            IndexKey::Label {
                key,
                value,
                storage_key,
            } => format!("label{SEP}{key}{SEP}{value}{SEP}{storage_key}"),
            IndexKey::Owner {
                owner_uid,
                storage_key,
            } => format!("owner{SEP}{owner_uid}{SEP}{storage_key}"),
        }
    }

    /// Encode a prefix for scanning objects carrying a label
    pub fn encode_prefix_for_label(key: &str, value: &str) -> String {
        format!("label{SEP}{key}{SEP}{value}{SEP}")
    }

    /// Encode a prefix for scanning the dependents of an owner
    pub fn encode_prefix_for_owner(owner_uid: &str) -> String {
        format!("owner{SEP}{owner_uid}{SEP}")
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode().replace(SEP, "|"))
    }
}
