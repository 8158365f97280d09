use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{CreateKeyRequest, IssuedKey, KeyProvisioner, KeyServiceError, KeySnapshot};

/// Keys held in memory; `network_calls` counts every trait call.
#[derive(Clone, Default)]
pub struct InMemoryKeyProvisioner {
    pub keys: Arc<Mutex<HashMap<String, KeySnapshot>>>,
    pub created: Arc<Mutex<Vec<CreateKeyRequest>>>,
    pub limit_updates: Arc<Mutex<Vec<(String, f64)>>>,
    pub get_calls: Arc<Mutex<usize>>,
}

impl InMemoryKeyProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, hash: &str, usage: f64, limit: f64) -> Self {
        self.keys
            .lock()
            .unwrap()
            .insert(hash.to_string(), KeySnapshot { usage, limit });
        self
    }

    pub fn set_usage(&self, hash: &str, usage: f64) {
        if let Some(snap) = self.keys.lock().unwrap().get_mut(hash) {
            snap.usage = usage;
        }
    }

    pub fn snapshot(&self, hash: &str) -> Option<KeySnapshot> {
        self.keys.lock().unwrap().get(hash).copied()
    }

    pub fn network_calls(&self) -> usize {
        *self.get_calls.lock().unwrap()
            + self.created.lock().unwrap().len()
            + self.limit_updates.lock().unwrap().len()
    }
}

fn not_found(hash: &str) -> KeyServiceError {
    KeyServiceError::Api {
        status: StatusCode::NOT_FOUND,
        message: format!("key {hash} not found"),
    }
}

#[async_trait]
impl KeyProvisioner for InMemoryKeyProvisioner {
    async fn get_key(&self, hash: &str) -> Result<KeySnapshot, KeyServiceError> {
        *self.get_calls.lock().unwrap() += 1;
        self.snapshot(hash).ok_or_else(|| not_found(hash))
    }

    async fn create_key(&self, req: CreateKeyRequest) -> Result<IssuedKey, KeyServiceError> {
        let mut created = self.created.lock().unwrap();
        let n = created.len() + 1;
        let hash = format!("hash_{n}");
        self.keys.lock().unwrap().insert(
            hash.clone(),
            KeySnapshot {
                usage: 0.0,
                limit: req.limit,
            },
        );
        created.push(req);
        Ok(IssuedKey {
            hash,
            key: format!("sk-or-v1-test-{n}"),
        })
    }

    async fn update_key_limit(&self, hash: &str, limit: f64) -> Result<(), KeyServiceError> {
        self.limit_updates
            .lock()
            .unwrap()
            .push((hash.to_string(), limit));
        let mut keys = self.keys.lock().unwrap();
        let snap = keys.get_mut(hash).ok_or_else(|| not_found(hash))?;
        snap.limit = limit;
        Ok(())
    }
}
