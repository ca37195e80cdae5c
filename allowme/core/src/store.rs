use crate::Address;
use parking_lot::Mutex;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A versioned, remotely-owned list of permitted CIDRs.
///
/// Implementations must apply `conditional_replace` atomically: a write whose
/// expected version is no longer current fails with
/// [`StoreError::VersionConflict`] and leaves the stored list untouched.
#[async_trait::async_trait]
pub trait AllowListStore: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, StoreError>;

    async fn conditional_replace(
        &self,
        list: AllowList,
        expected: &ResourceVersion,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource version conflict")]
    VersionConflict,

    #[error("store unavailable: {0}")]
    Unavailable(#[source] BoxError),
}

/// An allow-list along with the version it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub list: AllowList,
    pub version: ResourceVersion,
}

/// An ordered list of CIDR strings with set semantics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowList(Vec<String>);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

/// An in-process store with compare-and-swap semantics.
#[derive(Debug, Default)]
pub struct MemoryStore(Mutex<Versioned>);

#[derive(Debug, Default)]
struct Versioned {
    list: Vec<String>,
    version: u64,
}

// === impl StoreError ===

impl StoreError {
    pub fn unavailable(error: impl Into<BoxError>) -> Self {
        Self::Unavailable(error.into())
    }
}

// === impl AllowList ===

impl AllowList {
    pub fn contains(&self, addr: &Address) -> bool {
        let addr = addr.to_string();
        self.0.iter().any(|cidr| *cidr == addr)
    }

    /// Returns a copy of this list with `addr` appended.
    pub fn with_member(&self, addr: &Address) -> Self {
        let mut list = self.0.clone();
        list.push(addr.to_string());
        Self(list)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<Vec<String>> for AllowList {
    fn from(list: Vec<String>) -> Self {
        Self(list)
    }
}

impl<const N: usize> From<[&str; N]> for AllowList {
    fn from(list: [&str; N]) -> Self {
        Self(list.into_iter().map(Into::into).collect())
    }
}

// === impl ResourceVersion ===

impl ResourceVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ResourceVersion {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl From<&str> for ResourceVersion {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new(list: impl Into<AllowList>) -> Self {
        Self(Mutex::new(Versioned {
            list: list.into().into_vec(),
            version: 0,
        }))
    }

    /// Returns the current list without a version.
    pub fn list(&self) -> AllowList {
        AllowList(self.0.lock().list.clone())
    }

    /// Replaces the list unconditionally, as an out-of-band writer would.
    pub fn overwrite(&self, list: impl Into<AllowList>) {
        let mut state = self.0.lock();
        state.list = list.into().into_vec();
        state.version += 1;
    }
}

#[async_trait::async_trait]
impl AllowListStore for MemoryStore {
    async fn fetch(&self) -> Result<Snapshot, StoreError> {
        let state = self.0.lock();
        Ok(Snapshot {
            list: AllowList(state.list.clone()),
            version: ResourceVersion(state.version.to_string()),
        })
    }

    async fn conditional_replace(
        &self,
        list: AllowList,
        expected: &ResourceVersion,
    ) -> Result<(), StoreError> {
        let mut state = self.0.lock();
        if state.version.to_string() != expected.0 {
            return Err(StoreError::VersionConflict);
        }
        state.list = list.into_vec();
        state.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify;
    use pretty_assertions::assert_eq;

    #[test]
    fn allow_list_membership() {
        let addr = classify("203.0.113.5").unwrap();
        let list = AllowList::from(["198.51.100.7/32"]);
        assert!(!list.contains(&addr));

        let list = list.with_member(&addr);
        assert!(list.contains(&addr));
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec!["198.51.100.7/32", "203.0.113.5/32"]
        );
    }

    #[test]
    fn membership_is_exact_after_normalization() {
        let addr = classify("203.0.113.5").unwrap();
        assert!(!AllowList::from(["203.0.113.5"]).contains(&addr));
        assert!(!AllowList::from(["203.0.113.0/24"]).contains(&addr));
    }

    #[tokio::test]
    async fn memory_store_rejects_stale_versions() {
        let store = MemoryStore::new(["198.51.100.7/32"]);
        let Snapshot { list, version } = store.fetch().await.unwrap();
        assert_eq!(list, AllowList::from(["198.51.100.7/32"]));

        let addr = classify("203.0.113.5").unwrap();
        store
            .conditional_replace(list.with_member(&addr), &version)
            .await
            .expect("current version must be accepted");

        let err = store
            .conditional_replace(AllowList::default(), &version)
            .await
            .expect_err("stale version must be rejected");
        assert!(matches!(err, StoreError::VersionConflict));
        assert_eq!(
            store.list(),
            AllowList::from(["198.51.100.7/32", "203.0.113.5/32"])
        );
    }

    #[tokio::test]
    async fn overwrite_invalidates_snapshots() {
        let store = MemoryStore::default();
        let Snapshot { version, .. } = store.fetch().await.unwrap();
        store.overwrite(["192.0.2.1/32"]);

        let err = store
            .conditional_replace(AllowList::default(), &version)
            .await
            .expect_err("stale version must be rejected");
        assert!(matches!(err, StoreError::VersionConflict));
        assert_eq!(store.list(), AllowList::from(["192.0.2.1/32"]));
    }
}
