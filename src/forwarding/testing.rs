//! Shared helpers for forwarding tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use super::registry::RuleStore;
use super::rule::RuleSpec;
use crate::config::{ForwardSettings, StorageError};

/// Loopback-only settings with a fast publish tick
pub(crate) fn test_settings() -> ForwardSettings {
    ForwardSettings {
        bind_address: "127.0.0.1".into(),
        publish_interval_ms: 20,
        ..Default::default()
    }
}

/// A port that was free a moment ago
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Echo server on an ephemeral loopback port
pub(crate) async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

/// Poll `cond` until it holds, failing the test after 3 seconds
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// In-memory rule store with switchable save failures
#[derive(Default)]
pub(crate) struct MemoryStore {
    pub rules: Mutex<Vec<RuleSpec>>,
    pub saves: Mutex<usize>,
    pub fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn with_rules(rules: Vec<RuleSpec>) -> Self {
        Self {
            rules: Mutex::new(rules),
            ..Default::default()
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<RuleSpec> {
        self.rules.lock().clone()
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn load_rules(&self) -> Result<Vec<RuleSpec>, StorageError> {
        Ok(self.rules.lock().clone())
    }

    async fn save_rules(&self, rules: &[RuleSpec]) -> Result<(), StorageError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        *self.rules.lock() = rules.to_vec();
        *self.saves.lock() += 1;
        Ok(())
    }
}
