//! Key-value store abstraction for the `CONTEXT_RESPONSES` bucket.
//!
//! Mirrors the NATS KV watch semantics described in §4.2: `get` for a
//! point-in-time read, `watch` for a stream of subsequent updates where the
//! first item is a readiness marker (`None`) to be ignored, and a
//! `Deleted` item is a protocol violation the caller maps to
//! [`crate::error::ContextError::ResponseGone`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum KvEvent {
    /// Watcher has subscribed; no data yet. Must be ignored by callers.
    Ready,
    Value(Vec<u8>),
    Deleted,
}

#[async_trait]
pub trait ContextKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String>;

    /// Returns a channel that yields a [`KvEvent::Ready`] first, then any
    /// subsequent value or deletion for `key`.
    async fn watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>, String>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), String>;
}

/// In-memory KV used by tests and by `MockContextBuilder` to simulate the
/// downstream context-build service answering a request.
#[derive(Default)]
pub struct MemoryKv {
    store: Mutex<HashMap<String, Vec<u8>>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::Sender<KvEvent>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    async fn watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>, String> {
        let (tx, rx) = mpsc::channel(8);
        let _ = tx.send(KvEvent::Ready).await;
        self.watchers
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), String> {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        if let Some(subs) = self.watchers.lock().unwrap().get(key) {
            for tx in subs {
                let _ = tx.try_send(KvEvent::Value(value.clone()));
            }
        }
        Ok(())
    }
}

/// A KV that never answers, for exercising the timeout path.
#[derive(Default)]
pub struct SilentKv;

#[async_trait]
impl ContextKv for SilentKv {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, String> {
        Ok(None)
    }

    async fn watch(&self, _key: &str) -> Result<mpsc::Receiver<KvEvent>, String> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(KvEvent::Ready).await;
        std::mem::forget(tx);
        Ok(rx)
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<(), String> {
        Ok(())
    }
}
