//! Bus abstraction.
//!
//! The core crate never talks to a concrete broker — it depends on this
//! trait so the scheduler and consumer are testable without a JetStream
//! connection. `dispatch-service` supplies the real `async-nats`-backed
//! implementation.

use async_trait::async_trait;

#[async_trait]
pub trait Bus: Send + Sync {
    /// Durable publish: a successful return implies the broker has
    /// committed the message (§4.3, §5 "ordering guarantees").
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), String>;
}

/// In-memory bus used by unit and scenario tests. Records every publish so
/// tests can assert ordering.
#[derive(Default)]
pub struct RecordingBus {
    pub published: tokio::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), String> {
        self.published
            .lock()
            .await
            .push((subject.to_string(), payload));
        Ok(())
    }
}

/// A bus that always fails, for exercising the retryable-error paths.
pub struct FailingBus;

#[async_trait]
impl Bus for FailingBus {
    async fn publish(&self, _subject: &str, _payload: Vec<u8>) -> Result<(), String> {
        Err("bus unavailable".to_string())
    }
}
