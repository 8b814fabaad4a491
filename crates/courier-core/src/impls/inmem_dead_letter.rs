//! In-memory dead-letter sink for tests and the demo.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::dead_letter::DeadLetterEntry;
use crate::domain::errors::SinkError;
use crate::ports::DeadLetterSink;

#[derive(Default)]
pub struct InMemoryDeadLetterSink {
    entries: Mutex<Vec<DeadLetterEntry>>,
    /// Remaining writes that fail with `SinkError::Unavailable`.
    failures: Mutex<u32>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes fail.
    pub async fn fail_next(&self, n: u32) {
        *self.failures.lock().await = n;
    }

    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn write(&self, entry: &DeadLetterEntry) -> Result<(), SinkError> {
        {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Unavailable("injected failure".into()));
            }
        }
        self.entries.lock().await.push(entry.clone());
        Ok(())
    }
}
