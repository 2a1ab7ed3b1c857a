//! In-memory stores for development mode and tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{DbError, MetadataStore, NewServerRecord, ServerRecord, ServerStatus};
use crate::notifications::{Notification, NotificationStore};

#[derive(Default)]
struct Servers {
    next_id: i64,
    by_name: BTreeMap<String, ServerRecord>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Servers>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(&self, record: NewServerRecord) -> Result<ServerRecord, DbError> {
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(&record.name) {
            return Err(DbError::Duplicate(record.name));
        }

        inner.next_id += 1;
        let now = Utc::now();
        let stored = ServerRecord {
            id: inner.next_id,
            name: record.name,
            vmid: record.vmid,
            status: record.status,
            ip_address: record.ip_address,
            role: record.role,
            firewall_group: record.firewall_group,
            os_type: record.os_type,
            cpu: record.cpu,
            memory: record.memory,
            created_at: now,
            updated_at: now,
        };
        inner.by_name.insert(stored.name.clone(), stored.clone());
        Ok(stored)
    }

    async fn get(&self, name: &str) -> Result<Option<ServerRecord>, DbError> {
        Ok(self.inner.read().await.by_name.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, DbError> {
        Ok(self.inner.read().await.by_name.values().cloned().collect())
    }

    async fn set_status(&self, name: &str, status: ServerStatus) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        Ok(match inner.by_name.get_mut(name) {
            Some(record) => {
                record.status = status;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn set_role(&self, name: &str, role: Option<&str>) -> Result<bool, DbError> {
        let mut inner = self.inner.write().await;
        Ok(match inner.by_name.get_mut(name) {
            Some(record) => {
                record.role = role.map(str::to_string);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn delete(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.inner.write().await.by_name.remove(name).is_some())
    }

    async fn health_check(&self) -> Result<(), DbError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotificationStore {
    items: RwLock<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn push(&self, notification: Notification) -> Result<(), DbError> {
        self.items.write().await.push(notification);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Notification>, DbError> {
        let items = self.items.read().await;
        Ok(items.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::Severity;

    fn record(name: &str) -> NewServerRecord {
        NewServerRecord {
            name: name.to_string(),
            vmid: Some(101),
            status: ServerStatus::Running,
            ip_address: None,
            role: None,
            firewall_group: None,
            os_type: Some("ubuntu".to_string()),
            cpu: 2,
            memory: 2048,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_name() {
        let store = MemoryMetadataStore::new();
        store.insert(record("web-1")).await.unwrap();

        let err = store.insert(record("web-1")).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate(name) if name == "web-1"));
    }

    #[tokio::test]
    async fn test_updates_and_delete() {
        let store = MemoryMetadataStore::new();
        store.insert(record("web-1")).await.unwrap();

        assert!(store.set_status("web-1", ServerStatus::Stopped).await.unwrap());
        assert!(store.set_role("web-1", Some("nginx")).await.unwrap());
        let fetched = store.get("web-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ServerStatus::Stopped);
        assert_eq!(fetched.role.as_deref(), Some("nginx"));

        assert!(store.delete("web-1").await.unwrap());
        assert!(!store.exists("web-1").await.unwrap());
        assert!(!store.set_status("web-1", ServerStatus::Running).await.unwrap());
    }

    #[tokio::test]
    async fn test_notifications_newest_first() {
        let store = MemoryNotificationStore::new();
        store.push(Notification::new(Severity::Info, "a", "")).await.unwrap();
        store.push(Notification::new(Severity::Info, "b", "")).await.unwrap();
        store.push(Notification::new(Severity::Info, "c", "")).await.unwrap();

        let titles: Vec<_> = store
            .recent(2)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.title)
            .collect();
        assert_eq!(titles, vec!["c", "b"]);
    }
}
