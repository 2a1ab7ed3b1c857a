//! File-backed fleet spec store.
//!
//! Writes are serialized in-process by a single-writer lock. Writers outside
//! this process are detected through the revision (hash of the file bytes):
//! a conditional write whose revision no longer matches fails with
//! [`SpecStoreError::Conflict`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vmfleet_reconcile::SpecHash;

use super::{FleetSpec, ServerSpec, SpecDefaults};

/// Attempts made by [`FleetSpecStore::modify`] before giving up on conflicts.
const MAX_MODIFY_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum SpecStoreError {
    #[error("spec file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spec file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("spec file changed concurrently (expected {expected}, found {actual})")]
    Conflict { expected: SpecHash, actual: SpecHash },

    #[error("server '{0}' already exists in the fleet spec")]
    Duplicate(String),
}

impl SpecStoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// A loaded document together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub doc: T,
    pub revision: SpecHash,
}

pub struct FleetSpecStore {
    path: PathBuf,
    defaults: SpecDefaults,
    write_lock: Mutex<()>,
}

impl FleetSpecStore {
    pub fn new(path: impl Into<PathBuf>, defaults: SpecDefaults) -> Self {
        Self {
            path: path.into(),
            defaults,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the spec file; the provisioning tool runs here.
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Read the document. A missing file is an empty fleet.
    pub async fn load(&self) -> Result<Versioned<FleetSpec>, SpecStoreError> {
        let bytes = self.read_bytes().await?;
        let revision = SpecHash::from_bytes(&bytes);
        let doc = if bytes.iter().all(u8::is_ascii_whitespace) {
            FleetSpec::default()
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(Versioned { doc, revision })
    }

    /// Unconditional overwrite.
    pub async fn save(&self, doc: &FleetSpec) -> Result<SpecHash, SpecStoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(doc).await
    }

    /// Overwrite only if the file is still at `expected`.
    pub async fn save_if(
        &self,
        expected: &SpecHash,
        doc: &FleetSpec,
    ) -> Result<SpecHash, SpecStoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_if_unchanged(expected, doc).await
    }

    /// Read-modify-write with conflict retry.
    ///
    /// `f` may run more than once; it must derive its changes from the
    /// document it is handed.
    pub async fn modify<R, F>(&self, mut f: F) -> Result<R, SpecStoreError>
    where
        F: FnMut(&mut FleetSpec) -> R,
    {
        self.try_modify(|doc| Ok(f(doc))).await
    }

    /// Like [`Self::modify`], but an error from `f` aborts without writing.
    pub async fn try_modify<R, F>(&self, mut f: F) -> Result<R, SpecStoreError>
    where
        F: FnMut(&mut FleetSpec) -> Result<R, SpecStoreError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut attempt = 1;
        loop {
            let Versioned { mut doc, revision } = self.load().await?;
            let result = f(&mut doc)?;
            match self.write_if_unchanged(&revision, &doc).await {
                Ok(_) => return Ok(result),
                Err(e) if e.is_conflict() && attempt < MAX_MODIFY_ATTEMPTS => {
                    warn!(attempt, error = %e, "spec write conflict, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<ServerSpec>, SpecStoreError> {
        Ok(self.load().await?.doc.servers.get(name).cloned())
    }

    pub async fn contains(&self, name: &str) -> Result<bool, SpecStoreError> {
        Ok(self.load().await?.doc.contains(name))
    }

    /// Insert or replace one server, normalized. Returns the stored spec.
    pub async fn upsert(
        &self,
        name: &str,
        spec: ServerSpec,
    ) -> Result<ServerSpec, SpecStoreError> {
        let mut stored = self.upsert_many(vec![(name.to_string(), spec)]).await?;
        Ok(stored.pop().map(|(_, spec)| spec).unwrap_or_default())
    }

    /// Insert or replace several servers in one write.
    pub async fn upsert_many(
        &self,
        items: Vec<(String, ServerSpec)>,
    ) -> Result<Vec<(String, ServerSpec)>, SpecStoreError> {
        let stored = self
            .modify(|doc| {
                let defaults = self.defaults.for_document(doc);
                items
                    .iter()
                    .cloned()
                    .map(|(name, mut spec)| {
                        defaults.normalize(&mut spec);
                        doc.servers.insert(name.clone(), spec.clone());
                        (name, spec)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
        debug!(count = stored.len(), "upserted server specs");
        Ok(stored)
    }

    /// Insert one server under a name that must be free. The check and the
    /// write happen under the writer lock.
    pub async fn insert_new(
        &self,
        name: &str,
        spec: ServerSpec,
    ) -> Result<ServerSpec, SpecStoreError> {
        let stored = self
            .try_modify(|doc| {
                if doc.contains(name) {
                    return Err(SpecStoreError::Duplicate(name.to_string()));
                }
                let mut spec = spec.clone();
                self.defaults.for_document(doc).normalize(&mut spec);
                doc.servers.insert(name.to_string(), spec.clone());
                Ok(spec)
            })
            .await?;
        debug!(server = name, "inserted server spec");
        Ok(stored)
    }

    /// Insert every server whose name is free, in one write. Returns the
    /// stored specs in input order and the names that were already taken.
    pub async fn insert_absent(
        &self,
        items: Vec<(String, ServerSpec)>,
    ) -> Result<(Vec<(String, ServerSpec)>, Vec<String>), SpecStoreError> {
        let (stored, taken) = self
            .modify(|doc| {
                let defaults = self.defaults.for_document(doc);
                let mut stored = Vec::new();
                let mut taken = Vec::new();
                for (name, spec) in &items {
                    if doc.contains(name) {
                        taken.push(name.clone());
                        continue;
                    }
                    let mut spec = spec.clone();
                    defaults.normalize(&mut spec);
                    doc.servers.insert(name.clone(), spec.clone());
                    stored.push((name.clone(), spec));
                }
                (stored, taken)
            })
            .await?;
        debug!(inserted = stored.len(), taken = taken.len(), "inserted server specs");
        Ok((stored, taken))
    }

    /// Remove one server. Returns the removed spec, if it was present.
    pub async fn remove(&self, name: &str) -> Result<Option<ServerSpec>, SpecStoreError> {
        let mut removed = self.remove_many(&[name.to_string()]).await?;
        Ok(removed.pop().map(|(_, spec)| spec))
    }

    /// Remove several servers in one write. Only names that were present
    /// appear in the result.
    pub async fn remove_many(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, ServerSpec)>, SpecStoreError> {
        self.modify(|doc| {
            names
                .iter()
                .filter_map(|name| doc.servers.remove(name).map(|spec| (name.clone(), spec)))
                .collect()
        })
        .await
    }

    /// Put previously removed specs back verbatim (no normalization).
    pub async fn restore(&self, items: Vec<(String, ServerSpec)>) -> Result<(), SpecStoreError> {
        self.modify(|doc| {
            for (name, spec) in &items {
                doc.servers.insert(name.clone(), spec.clone());
            }
        })
        .await
    }

    /// Set or clear the role of a server. Returns false if it is not in the spec.
    pub async fn set_role(&self, name: &str, role: Option<&str>) -> Result<bool, SpecStoreError> {
        self.modify(|doc| match doc.servers.get_mut(name) {
            Some(spec) => {
                spec.role = role.map(str::to_string);
                true
            }
            None => false,
        })
        .await
    }

    async fn read_bytes(&self) -> Result<Vec<u8>, SpecStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_if_unchanged(
        &self,
        expected: &SpecHash,
        doc: &FleetSpec,
    ) -> Result<SpecHash, SpecStoreError> {
        let actual = SpecHash::from_bytes(&self.read_bytes().await?);
        if &actual != expected {
            return Err(SpecStoreError::Conflict {
                expected: expected.clone(),
                actual,
            });
        }
        self.write(doc).await
    }

    async fn write(&self, doc: &FleetSpec) -> Result<SpecHash, SpecStoreError> {
        let mut bytes = serde_json::to_vec_pretty(doc)?;
        bytes.push(b'\n');

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(SpecHash::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet_spec::{DiskSpec, NetworkDevice};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FleetSpecStore {
        FleetSpecStore::new(dir.path().join("servers.json"), SpecDefaults::default())
    }

    fn spec(cpu: u32) -> ServerSpec {
        ServerSpec {
            cpu,
            memory: 2048,
            disks: vec![DiskSpec {
                size: 20,
                ..Default::default()
            }],
            network_devices: vec![NetworkDevice::default()],
            os_type: Some("debian".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_fleet() {
        let dir = TempDir::new().unwrap();
        let loaded = store(&dir).load().await.unwrap();
        assert!(loaded.doc.servers.is_empty());
    }

    #[tokio::test]
    async fn test_save_of_load_leaves_bytes_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("web-1", spec(2)).await.unwrap();
        store.upsert("db-1", spec(4)).await.unwrap();

        let before = std::fs::read(store.path()).unwrap();
        let loaded = store.load().await.unwrap();
        store.save(&loaded.doc).await.unwrap();
        let after = std::fs::read(store.path()).unwrap();

        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_extra_fields_survive_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        std::fs::write(
            store.path(),
            r#"{"proxmox_api_url":"https://pve:8006/api2/json","pm_tls_insecure":true,"servers":{}}"#,
        )
        .unwrap();

        store.upsert("web-1", spec(2)).await.unwrap();
        let doc = store.load().await.unwrap().doc;

        assert_eq!(doc.proxmox_api_url.as_deref(), Some("https://pve:8006/api2/json"));
        assert_eq!(doc.extra.get("pm_tls_insecure"), Some(&serde_json::json!(true)));
        assert!(doc.contains("web-1"));
    }

    #[tokio::test]
    async fn test_upsert_normalizes() {
        let dir = TempDir::new().unwrap();
        let stored = store(&dir).upsert("web-1", spec(2)).await.unwrap();

        assert_eq!(stored.disks[0].datastore_id.as_deref(), Some("local-lvm"));
        assert_eq!(stored.vm_username.as_deref(), Some("debian"));
    }

    #[tokio::test]
    async fn test_remove_returns_removed_spec() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("web-1", spec(2)).await.unwrap();

        let removed = store.remove("web-1").await.unwrap();
        assert_eq!(removed.map(|s| s.cpu), Some(2));
        assert!(!store.contains("web-1").await.unwrap());
        assert!(store.remove("web-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_many_only_reports_present_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("a", spec(1)).await.unwrap();
        store.upsert("b", spec(1)).await.unwrap();

        let removed = store
            .remove_many(&["a".to_string(), "zzz".to_string()])
            .await
            .unwrap();
        let names: Vec<_> = removed.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a".to_string()]);
        assert!(store.contains("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_save_if_detects_external_writer() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("web-1", spec(2)).await.unwrap();

        let loaded = store.load().await.unwrap();
        std::fs::write(store.path(), b"{\"servers\":{}}\n").unwrap();

        let err = store.save_if(&loaded.revision, &loaded.doc).await.unwrap_err();
        assert!(err.is_conflict());
        // the external write is left in place
        assert!(!store.contains("web-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.upsert(&format!("vm-{i}"), spec(1)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.load().await.unwrap().doc.servers.len(), 8);
    }

    #[tokio::test]
    async fn test_insert_new_refuses_taken_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.insert_new("web-1", spec(2)).await.unwrap();
        let before = std::fs::read(store.path()).unwrap();

        let err = store.insert_new("web-1", spec(8)).await.unwrap_err();
        assert!(matches!(err, SpecStoreError::Duplicate(ref name) if name == "web-1"));
        assert!(!err.is_conflict());
        assert_eq!(store.get("web-1").await.unwrap().map(|s| s.cpu), Some(2));
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_concurrent_insert_new_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store(&dir));

        let handles: Vec<_> = [2, 8]
            .into_iter()
            .map(|cpu| {
                let store = store.clone();
                tokio::spawn(async move { store.insert_new("dup", spec(cpu)).await })
            })
            .collect();
        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(stored) = handle.await.unwrap() {
                winners.push(stored.cpu);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(store.get("dup").await.unwrap().map(|s| s.cpu), Some(winners[0]));
    }

    #[tokio::test]
    async fn test_insert_absent_skips_taken_names() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("b", spec(1)).await.unwrap();

        let (stored, taken) = store
            .insert_absent(vec![
                ("a".to_string(), spec(2)),
                ("b".to_string(), spec(9)),
                ("c".to_string(), spec(3)),
            ])
            .await
            .unwrap();

        let names: Vec<_> = stored.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(taken, vec!["b".to_string()]);
        assert_eq!(store.get("b").await.unwrap().map(|s| s.cpu), Some(1));
    }

    #[tokio::test]
    async fn test_set_role() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("web-1", spec(2)).await.unwrap();

        assert!(store.set_role("web-1", Some("nginx")).await.unwrap());
        assert_eq!(
            store.get("web-1").await.unwrap().unwrap().role.as_deref(),
            Some("nginx")
        );
        assert!(store.set_role("web-1", None).await.unwrap());
        assert_eq!(store.get("web-1").await.unwrap().unwrap().role, None);
        assert!(!store.set_role("nope", Some("x")).await.unwrap());
    }
}
