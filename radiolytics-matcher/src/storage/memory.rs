//! In-memory collaborators for tests and embedding
//!
//! Both types count operations so tests can assert "exactly one write" style
//! properties, and both can be switched to fail every call to simulate an
//! unreachable backend.

use super::{ObjectHandle, ResultRecord, ResultSink, WorkQueue};
use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Operation counts for a [`MemoryWorkQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub lists: usize,
    pub gets: usize,
    pub puts: usize,
    pub deletes: usize,
    pub publishes: usize,
}

/// Work queue held in a sorted map
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    counters: Mutex<QueueCounters>,
    unavailable: AtomicBool,
    /// Object names whose `put` fails, to simulate partial outages
    failing_puts: Mutex<Vec<String>>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StorageError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `put` fail for names starting with `prefix`
    pub fn fail_puts_under(&self, prefix: &str) {
        self.failing_puts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prefix.to_string());
    }

    pub fn clear_put_failures(&self) {
        self.failing_puts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Insert an object directly, bypassing counters
    pub fn seed(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// All object names under `prefix`, bypassing counters
    pub fn names(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn counters(&self) -> QueueCounters {
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self, op: &str) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{} refused: queue offline", op)));
        }
        Ok(())
    }

    fn count(&self, update: impl FnOnce(&mut QueueCounters)) {
        update(&mut self.counters.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHandle>, StorageError> {
        self.check_available("list")?;
        self.count(|c| c.lists += 1);
        Ok(self.names(prefix).into_iter().map(ObjectHandle::new).collect())
    }

    async fn get(&self, handle: &ObjectHandle) -> Result<Vec<u8>, StorageError> {
        self.check_available("get")?;
        self.count(|c| c.gets += 1);
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(handle.to_string()))
    }

    async fn put(&self, handle: &ObjectHandle, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_available("put")?;
        let blocked = self
            .failing_puts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| handle.as_str().starts_with(p.as_str()));
        if blocked {
            return Err(StorageError::Unavailable(format!("put refused for {}", handle)));
        }
        self.count(|c| c.puts += 1);
        self.seed(handle.as_str(), bytes);
        Ok(())
    }

    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StorageError> {
        self.check_available("delete")?;
        self.count(|c| c.deletes += 1);
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle.as_str());
        Ok(())
    }

    async fn mark_public(&self, handle: &ObjectHandle) -> Result<Option<String>, StorageError> {
        self.check_available("mark_public")?;
        self.count(|c| c.publishes += 1);
        Ok(Some(format!("memory://{}", handle)))
    }
}

/// Result sink held in a map, remembering every write
#[derive(Debug, Default)]
pub struct MemoryResultSink {
    records: Mutex<HashMap<String, ResultRecord>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<ResultRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Successful `set` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn set(&self, key: &str, record: &ResultRecord) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("result sink offline".to_string()));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_counts_and_lists_in_order() {
        let queue = MemoryWorkQueue::new();
        queue.seed("in/b.json", "2");
        queue.seed("in/a.json", "1");
        queue.seed("ref/a.json", "3");

        let listed = queue.list("in/").await.unwrap();
        assert_eq!(listed, vec![ObjectHandle::new("in/a.json"), ObjectHandle::new("in/b.json")]);

        queue.put(&ObjectHandle::new("out/a.json"), b"1").await.unwrap();
        queue.delete(&ObjectHandle::new("in/a.json")).await.unwrap();
        assert!(!queue.contains("in/a.json"));
        assert!(queue.contains("out/a.json"));

        let counters = queue.counters();
        assert_eq!(counters.lists, 1);
        assert_eq!(counters.puts, 1);
        assert_eq!(counters.deletes, 1);
    }

    #[tokio::test]
    async fn test_queue_unavailable_and_put_failures() {
        let queue = MemoryWorkQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(queue.list("").await, Err(StorageError::Unavailable(_))));
        queue.set_unavailable(false);

        queue.fail_puts_under("out/");
        assert!(queue.put(&ObjectHandle::new("out/x.json"), b"x").await.is_err());
        assert!(queue.put(&ObjectHandle::new("in/x.json"), b"x").await.is_ok());
        queue.clear_put_failures();
        assert!(queue.put(&ObjectHandle::new("out/x.json"), b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_sink_counts_successful_writes() {
        let sink = MemoryResultSink::new();
        let record = ResultRecord {
            matched_at: 1,
            station: "Unknown".to_string(),
            confidence: 0.0,
            match_timestamp: None,
            offset: None,
            trace: None,
        };

        sink.set("k", &record).await.unwrap();
        sink.set_unavailable(true);
        assert!(sink.set("k2", &record).await.is_err());

        assert_eq!(sink.write_count(), 1);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("k"), Some(record));
    }
}
