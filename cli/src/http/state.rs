//! HTTP服务器状态管理

use chrono::{DateTime, Local};
use moegen_core::api::{AppConfig, BackendService};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// 应用状态（在所有handlers间共享）
#[derive(Clone)]
pub struct AppState {
    pub service: BackendService,
    pub tokens: AccessTokens,
    pub config: Arc<AppConfig>,
    pub stats: Arc<RwLock<ServerStats>>,
    pub sse_clients: Arc<AtomicUsize>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        service: BackendService,
        tokens: AccessTokens,
        config: AppConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            service,
            tokens,
            config: Arc::new(config),
            stats: Arc::new(RwLock::new(ServerStats::new())),
            sse_clients: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn sse_client_count(&self) -> usize {
        self.sse_clients.load(Ordering::Relaxed)
    }
}

/// 访问令牌集合：令牌由外部签发，服务端只负责校验
#[derive(Clone, Default)]
pub struct AccessTokens {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl AccessTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
        Self {
            inner: Arc::new(RwLock::new(set)),
        }
    }

    pub fn insert(&self, token: impl Into<String>) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.into())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        !token.is_empty()
            && self
                .inner
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(token)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decrements the SSE client count when the stream is dropped.
pub struct SseClientGuard {
    counter: Arc<AtomicUsize>,
}

impl SseClientGuard {
    pub fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self {
            counter: counter.clone(),
        }
    }
}

impl Drop for SseClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// 服务器统计信息
pub struct ServerStats {
    pub requests_total: u64,
    pub requests_by_endpoint: HashMap<String, u64>,
    pub errors_total: u64,
    pub start_time: DateTime<Local>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            requests_total: 0,
            requests_by_endpoint: HashMap::new(),
            errors_total: 0,
            start_time: Local::now(),
        }
    }

    pub fn increment_request(&mut self, endpoint: &str) {
        self.requests_total += 1;
        *self
            .requests_by_endpoint
            .entry(endpoint.to_string())
            .or_insert(0) += 1;
    }

    pub fn increment_error(&mut self) {
        self.errors_total += 1;
    }

    pub fn uptime_seconds(&self) -> f64 {
        let now = Local::now();
        (now - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_tokens() {
        let tokens = AccessTokens::new(["a", "", "b"]);
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains("a"));
        assert!(!tokens.contains(""));
        assert!(tokens.insert("c"));
        assert!(!tokens.insert("c"));
        assert!(tokens.revoke("a"));
        assert!(!tokens.contains("a"));

        let shared = tokens.clone();
        shared.insert("d");
        assert!(tokens.contains("d"));
    }

    #[test]
    fn test_sse_guard_counts_clients() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = SseClientGuard::register(&counter);
        let second = SseClientGuard::register(&counter);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
        drop(first);
        drop(second);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_server_stats() {
        let mut stats = ServerStats::new();
        stats.increment_request("/api/backend/state");
        stats.increment_request("/api/backend/state");
        stats.increment_request("/health");
        stats.increment_error();

        assert_eq!(stats.requests_total, 3);
        assert_eq!(stats.requests_by_endpoint["/api/backend/state"], 2);
        assert_eq!(stats.errors_total, 1);
        assert!(stats.uptime_seconds() < 1.0);
    }
}
