//! Hot cache over session rows.
//!
//! The cache is a plain LRU: map for lookup, deque for recency order.
//! Eviction only drops the cache entry; rows stay in the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use crate::store::{SessionKind, SessionRow, SqliteStore};

pub struct SessionManager {
    store: Arc<SqliteStore>,
    capacity: usize,
    inner: Mutex<LruInner>,
}

#[derive(Default)]
struct LruInner {
    map: HashMap<String, SessionRow>,
    /// Front = least recently used.
    order: VecDeque<String>,
}

impl LruInner {
    fn promote(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        self.order.push_back(id.to_string());
    }

    fn insert(&mut self, session: SessionRow, capacity: usize) {
        let id = session.id.clone();
        self.map.insert(id.clone(), session);
        self.promote(&id);
        while self.map.len() > capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            } else {
                break;
            }
        }
    }
}

impl SessionManager {
    pub fn new(store: Arc<SqliteStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner::default()),
        }
    }

    /// Fetch a session, creating the row on first sight. Hits promote the
    /// entry to most-recently-used.
    pub async fn get_or_create(
        &self,
        id: &str,
        kind: SessionKind,
        target_id: i64,
    ) -> anyhow::Result<SessionRow> {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(session) = inner.map.get(id).cloned() {
                inner.promote(id);
                return Ok(session);
            }
        }

        let session = match self.store.get_session(id).await? {
            Some(session) => session,
            None => self.store.create_session(id, kind, target_id).await?,
        };

        let mut inner = self.inner.lock().unwrap();
        inner.insert(session.clone(), self.capacity);
        Ok(session)
    }

    /// Refresh `updated_at` and move the entry to MRU.
    pub async fn touch(&self, id: &str) -> anyhow::Result<()> {
        self.store.touch_session(id).await?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.map.get_mut(id) {
            session.updated_at = chrono::Utc::now();
        }
        if inner.map.contains_key(id) {
            inner.promote(id);
        }
        Ok(())
    }

    /// Delete all messages and the compressed context; identity persists.
    pub async fn reset(&self, id: &str) -> anyhow::Result<()> {
        self.store.reset_session(id).await?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = inner.map.get_mut(id) {
            session.compressed_context = None;
        }
        Ok(())
    }

    #[cfg(test)]
    fn cached_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.order.iter().cloned().collect()
    }
}
