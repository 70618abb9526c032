//! In-memory transport for unit tests: scripted replies, recorded writes,
//! and an optional gate that holds writes until the test releases them.

use super::api::{PreferenceTransport, SaveResponse, SyncApiError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub enum FakeReply {
    Saved(Option<Value>),
    Unchanged,
    Status(u16),
    RateLimited(Option<u64>),
    Forbidden,
}

#[derive(Debug, Clone)]
pub enum FakeLoad {
    Document(Option<Value>),
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct RecordedSave {
    pub payload: Value,
    pub idempotency_key: String,
}

pub struct FakeTransport {
    script: Mutex<VecDeque<FakeReply>>,
    default_reply: Mutex<FakeReply>,
    load_reply: Mutex<FakeLoad>,
    saves: Mutex<Vec<RecordedSave>>,
    loads: AtomicU32,
    gate: Option<Arc<Semaphore>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: Mutex::new(FakeReply::Saved(None)),
            load_reply: Mutex::new(FakeLoad::Document(None)),
            saves: Mutex::new(Vec::new()),
            loads: AtomicU32::new(0),
            gate: None,
        }
    }

    pub fn with_default_reply(self, reply: FakeReply) -> Self {
        *self.default_reply.lock().unwrap() = reply;
        self
    }

    /// Replies used in order before falling back to the default reply
    pub fn with_script(self, replies: Vec<FakeReply>) -> Self {
        *self.script.lock().unwrap() = replies.into();
        self
    }

    pub fn with_load(self, load: FakeLoad) -> Self {
        self.set_load(load);
        self
    }

    /// Every write waits for a permit from [`gate`](Self::gate)
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn gate(&self) -> Arc<Semaphore> {
        self.gate.clone().expect("transport is not gated")
    }

    pub fn set_load(&self, load: FakeLoad) {
        *self.load_reply.lock().unwrap() = load;
    }

    pub fn saves(&self) -> Vec<RecordedSave> {
        self.saves.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn load_count(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> FakeReply {
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_reply.lock().unwrap().clone())
    }
}

fn status_error(status: u16) -> SyncApiError {
    SyncApiError::Server {
        status,
        message: "scripted failure".to_string(),
    }
}

#[async_trait]
impl PreferenceTransport for FakeTransport {
    async fn load(&self) -> Result<Option<Value>, SyncApiError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let reply = self.load_reply.lock().unwrap().clone();
        match reply {
            FakeLoad::Document(doc) => Ok(doc),
            FakeLoad::Status(status) => Err(status_error(status)),
        }
    }

    async fn save(&self, payload: &Value, idempotency_key: &str) -> Result<SaveResponse, SyncApiError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        self.saves.lock().unwrap().push(RecordedSave {
            payload: payload.clone(),
            idempotency_key: idempotency_key.to_string(),
        });

        match self.next_reply() {
            FakeReply::Saved(document) => Ok(SaveResponse::Saved { document }),
            FakeReply::Unchanged => Ok(SaveResponse::Unchanged),
            FakeReply::Status(status) => Err(status_error(status)),
            FakeReply::RateLimited(secs) => Err(SyncApiError::RateLimited {
                retry_after: secs.map(Duration::from_secs),
            }),
            FakeReply::Forbidden => Err(SyncApiError::Forbidden),
        }
    }
}
