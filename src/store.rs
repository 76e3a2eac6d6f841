use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RedisSettings;
use crate::error::Result;

/* ============================= RECORDS ============================= */

/// Per-pod lifecycle state as reported by the workers themselves.
///
/// There is no `completed` state: a finished pod removes its record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PodState {
    Starting,
    Idle,
    Busy,
    Error,
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodState::Starting => "starting",
            PodState::Idle => "idle",
            PodState::Busy => "busy",
            PodState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One field value in the shared hash: UTF-8 JSON
/// `{"status": "<state>", "updated_at": <unix seconds>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodStateRecord {
    pub status: PodState,
    pub updated_at: i64,
}

impl PodStateRecord {
    pub fn now(status: PodState) -> Self {
        Self {
            status,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("record serializes")
    }
}

/// Parse a raw hash field value; `None` when the payload is not a valid
/// record (such entries are reaped by `cleanup_stale`).
pub fn parse_record(raw: &str) -> Option<PodStateRecord> {
    serde_json::from_str(raw).ok()
}

/* ============================= SUMMARY ============================= */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateSummary {
    pub total: usize,
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
}

pub fn summarize(records: &HashMap<String, PodStateRecord>) -> StateSummary {
    let mut summary = StateSummary {
        total: records.len(),
        ..Default::default()
    };
    for record in records.values() {
        match record.status {
            PodState::Starting => summary.starting += 1,
            PodState::Idle => summary.idle += 1,
            PodState::Busy => summary.busy += 1,
            PodState::Error => summary.error += 1,
        }
    }
    summary
}

/// Fields to reap: records older than `timeout_seconds` and records that do
/// not parse at all.
pub fn select_stale(raw: &HashMap<String, String>, now: i64, timeout_seconds: i64) -> Vec<String> {
    let mut stale: Vec<String> = raw
        .iter()
        .filter(|(_, value)| match parse_record(value) {
            Some(record) => now - record.updated_at > timeout_seconds,
            None => true,
        })
        .map(|(name, _)| name.clone())
        .collect();
    stale.sort();
    stale
}

/* ============================= MONITOR ============================= */

/// Controller-side view of the store: one batched read of the whole hash
/// plus admin operations. Shared process-wide; the multiplexed connection is
/// cheap to clone and safe for concurrent use.
#[derive(Clone)]
pub struct StateMonitor {
    conn: MultiplexedConnection,
    key: String,
}

impl StateMonitor {
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let client = redis::Client::open(settings.url())?;
        let conn = client.get_multiplexed_tokio_connection().await?;

        let mut probe = conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut probe).await?;

        Ok(Self {
            conn,
            key: settings.key_prefix.clone(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// All pod records in a single `HGETALL`. Unparseable entries are
    /// skipped here and removed by the next `cleanup_stale`.
    pub async fn get_all(&self) -> Result<HashMap<String, PodStateRecord>> {
        let raw: HashMap<String, String> = self.conn.clone().hgetall(&self.key).await?;

        let mut records = HashMap::with_capacity(raw.len());
        for (pod_name, value) in raw {
            match parse_record(&value) {
                Some(record) => {
                    records.insert(pod_name, record);
                }
                None => warn!(pod = %pod_name, "pod_state_record_unparseable"),
            }
        }
        Ok(records)
    }

    pub async fn summary(&self) -> Result<StateSummary> {
        Ok(summarize(&self.get_all().await?))
    }

    pub async fn list_by_status(&self, status: PodState) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .get_all()
            .await?
            .into_iter()
            .filter(|(_, record)| record.status == status)
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete records not updated within `timeout_seconds`, plus records
    /// that cannot be parsed. Returns the number removed.
    pub async fn cleanup_stale(&self, timeout_seconds: i64) -> Result<usize> {
        let raw: HashMap<String, String> = self.conn.clone().hgetall(&self.key).await?;
        let stale = select_stale(&raw, chrono::Utc::now().timestamp(), timeout_seconds);
        if stale.is_empty() {
            return Ok(0);
        }

        let removed: i64 = self.conn.clone().hdel(&self.key, &stale).await?;
        info!(removed, "pod_state_stale_cleaned");
        Ok(removed as usize)
    }

    pub async fn remove(&self, pod_name: &str) -> Result<bool> {
        let removed: i64 = self.conn.clone().hdel(&self.key, pod_name).await?;
        Ok(removed > 0)
    }

    /// Drop the whole hash. Admin/maintenance only.
    pub async fn clear_all(&self) -> Result<()> {
        let _: i64 = self.conn.clone().del(&self.key).await?;
        warn!(key = %self.key, "pod_state_cleared");
        Ok(())
    }
}

/* ============================= BACKEND ============================= */

/// The hash verbs the manipulator needs, seamed so its contract can be
/// driven against an in-memory hash in tests.
#[allow(async_fn_in_trait)]
pub trait StoreBackend {
    async fn hash_set(&self, key: &str, field: &str, value: String) -> redis::RedisResult<()>;
    async fn hash_get(&self, key: &str, field: &str) -> redis::RedisResult<Option<String>>;
    async fn hash_del(&self, key: &str, field: &str) -> redis::RedisResult<i64>;
}

impl StoreBackend for MultiplexedConnection {
    async fn hash_set(&self, key: &str, field: &str, value: String) -> redis::RedisResult<()> {
        let mut conn = self.clone();
        conn.hset(key, field, value).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.clone();
        conn.hget(key, field).await
    }

    async fn hash_del(&self, key: &str, field: &str) -> redis::RedisResult<i64> {
        let mut conn = self.clone();
        conn.hdel(key, field).await
    }
}

/* ============================= MANIPULATOR ============================= */

/// Worker-pod side of the store: a single pod maintaining its own record.
///
/// All writes are best-effort: a failure is logged and reported as `false`,
/// and the worker carries on. The controller never depends on these writes
/// landing; a missing record simply counts as `starting`.
#[derive(Clone)]
pub struct StateManipulator<B = MultiplexedConnection> {
    backend: B,
    key: String,
    pod_name: String,
}

impl StateManipulator<MultiplexedConnection> {
    pub async fn connect(settings: &RedisSettings, pod_name: &str) -> Result<Self> {
        let client = redis::Client::open(settings.url())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::new(conn, &settings.key_prefix, pod_name))
    }
}

impl<B: StoreBackend> StateManipulator<B> {
    pub fn new(backend: B, key_prefix: &str, pod_name: &str) -> Self {
        Self {
            backend,
            key: key_prefix.to_string(),
            pod_name: pod_name.to_string(),
        }
    }

    async fn write(&self, record: &PodStateRecord) -> bool {
        match self
            .backend
            .hash_set(&self.key, &self.pod_name, record.encode())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(pod = %self.pod_name, error = %e, "pod_state_write_failed");
                false
            }
        }
    }

    pub async fn register(&self, initial: PodState) -> bool {
        let ok = self.write(&PodStateRecord::now(initial)).await;
        if ok {
            info!(pod = %self.pod_name, status = %initial, "pod_registered");
        }
        ok
    }

    pub async fn unregister(&self) -> bool {
        match self.backend.hash_del(&self.key, &self.pod_name).await {
            Ok(_) => {
                info!(pod = %self.pod_name, "pod_unregistered");
                true
            }
            Err(e) => {
                warn!(pod = %self.pod_name, error = %e, "pod_state_write_failed");
                false
            }
        }
    }

    pub async fn set_status(&self, status: PodState) -> bool {
        self.write(&PodStateRecord::now(status)).await
    }

    pub async fn get_status(&self) -> Option<PodStateRecord> {
        match self.backend.hash_get(&self.key, &self.pod_name).await {
            Ok(Some(value)) => parse_record(&value),
            Ok(None) => None,
            Err(e) => {
                warn!(pod = %self.pod_name, error = %e, "pod_state_read_failed");
                None
            }
        }
    }

    /// Refresh the record's timestamp, keeping its state. A pod whose record
    /// has vanished (e.g. reaped while stalled) re-registers as idle.
    pub async fn heartbeat(&self) -> bool {
        match self.get_status().await {
            Some(mut record) => {
                record.updated_at = chrono::Utc::now().timestamp();
                self.write(&record).await
            }
            None => {
                warn!(pod = %self.pod_name, "pod_state_missing_on_heartbeat");
                self.register(PodState::Idle).await
            }
        }
    }

    /// Run `task` inside a registration scope: the record is created before
    /// the task starts and removed after it settles, whether it returned a
    /// success or an error value.
    pub async fn run_registered<T, Fut>(&self, task: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        self.register(PodState::Starting).await;
        let outcome = task.await;
        self.unregister().await;
        outcome
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: PodState, updated_at: i64) -> PodStateRecord {
        PodStateRecord { status, updated_at }
    }

    #[test]
    fn test_record_encode_shape() {
        let encoded = record(PodState::Busy, 1_234_567_890).encode();
        assert_eq!(encoded, r#"{"status":"busy","updated_at":1234567890}"#);
    }

    #[test]
    fn test_record_parse_round_trip() {
        for status in [
            PodState::Starting,
            PodState::Idle,
            PodState::Busy,
            PodState::Error,
        ] {
            let original = record(status, 42);
            let parsed = parse_record(&original.encode()).expect("should parse");
            assert_eq!(parsed, original);
        }
    }

    #[test]
    fn test_parse_record_rejects_garbage() {
        assert_eq!(parse_record("not-json"), None);
        assert_eq!(parse_record(r#"{"status":"done","updated_at":1}"#), None);
        assert_eq!(parse_record(r#"{"updated_at":1}"#), None);
    }

    #[test]
    fn test_summarize_counts_by_state() {
        let records = HashMap::from([
            ("a".to_string(), record(PodState::Idle, 0)),
            ("b".to_string(), record(PodState::Idle, 0)),
            ("c".to_string(), record(PodState::Busy, 0)),
            ("d".to_string(), record(PodState::Starting, 0)),
            ("e".to_string(), record(PodState::Error, 0)),
        ]);
        let summary = summarize(&records);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.idle, 2);
        assert_eq!(summary.busy, 1);
        assert_eq!(summary.starting, 1);
        assert_eq!(summary.error, 1);
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&HashMap::new()), StateSummary::default());
    }

    #[test]
    fn test_select_stale_by_age() {
        let now = 1_000;
        let raw = HashMap::from([
            ("fresh".to_string(), record(PodState::Idle, 950).encode()),
            ("old".to_string(), record(PodState::Busy, 100).encode()),
        ]);
        assert_eq!(select_stale(&raw, now, 600), vec!["old".to_string()]);
    }

    #[test]
    fn test_select_stale_includes_unparseable() {
        let now = 1_000;
        let raw = HashMap::from([
            ("fresh".to_string(), record(PodState::Idle, 999).encode()),
            ("broken".to_string(), "{{{".to_string()),
        ]);
        assert_eq!(select_stale(&raw, now, 600), vec!["broken".to_string()]);
    }

    #[test]
    fn test_select_stale_boundary_is_exclusive() {
        // exactly `timeout` old is still considered fresh
        let raw = HashMap::from([("edge".to_string(), record(PodState::Idle, 400).encode())]);
        assert!(select_stale(&raw, 1_000, 600).is_empty());
        assert_eq!(select_stale(&raw, 1_001, 600), vec!["edge".to_string()]);
    }

    #[test]
    fn test_pod_state_display_matches_wire_form() {
        for (state, wire) in [
            (PodState::Starting, "starting"),
            (PodState::Idle, "idle"),
            (PodState::Busy, "busy"),
            (PodState::Error, "error"),
        ] {
            assert_eq!(state.to_string(), wire);
            let json = serde_json::to_string(&state).expect("should serialize");
            assert_eq!(json, format!("\"{wire}\""));
        }
    }

    // ── manipulator contract, driven against an in-memory hash ──

    #[derive(Default)]
    struct MemoryBackend {
        hash: std::sync::Mutex<HashMap<String, String>>,
        fail_writes: bool,
    }

    impl MemoryBackend {
        fn slot(key: &str, field: &str) -> String {
            format!("{key}/{field}")
        }

        fn raw(&self, key: &str, field: &str) -> Option<String> {
            self.hash.lock().unwrap().get(&Self::slot(key, field)).cloned()
        }

        fn seed(&self, key: &str, field: &str, value: String) {
            self.hash.lock().unwrap().insert(Self::slot(key, field), value);
        }
    }

    impl StoreBackend for &MemoryBackend {
        async fn hash_set(&self, key: &str, field: &str, value: String) -> redis::RedisResult<()> {
            if self.fail_writes {
                return Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "store down",
                )));
            }
            self.hash
                .lock()
                .unwrap()
                .insert(MemoryBackend::slot(key, field), value);
            Ok(())
        }

        async fn hash_get(&self, key: &str, field: &str) -> redis::RedisResult<Option<String>> {
            Ok(self.raw(key, field))
        }

        async fn hash_del(&self, key: &str, field: &str) -> redis::RedisResult<i64> {
            let removed = self
                .hash
                .lock()
                .unwrap()
                .remove(&MemoryBackend::slot(key, field));
            Ok(if removed.is_some() { 1 } else { 0 })
        }
    }

    fn manipulator(backend: &MemoryBackend) -> StateManipulator<&MemoryBackend> {
        StateManipulator::new(backend, "pod-status", "game-1")
    }

    #[tokio::test]
    async fn test_register_writes_record_with_initial_state() {
        let backend = MemoryBackend::default();
        let pod = manipulator(&backend);

        assert!(pod.register(PodState::Starting).await);

        let stored = parse_record(&backend.raw("pod-status", "game-1").expect("record written"))
            .expect("record parses");
        assert_eq!(stored.status, PodState::Starting);
        assert!(stored.updated_at > 0);
    }

    #[tokio::test]
    async fn test_set_status_overwrites_record() {
        let backend = MemoryBackend::default();
        let pod = manipulator(&backend);

        pod.register(PodState::Starting).await;
        assert!(pod.set_status(PodState::Busy).await);

        let stored = pod.get_status().await.expect("record present");
        assert_eq!(stored.status, PodState::Busy);
    }

    #[tokio::test]
    async fn test_unregister_removes_record() {
        let backend = MemoryBackend::default();
        let pod = manipulator(&backend);

        pod.register(PodState::Idle).await;
        assert!(pod.unregister().await);
        assert_eq!(backend.raw("pod-status", "game-1"), None);
    }

    #[tokio::test]
    async fn test_heartbeat_bumps_timestamp_and_keeps_state() {
        let backend = MemoryBackend::default();
        backend.seed(
            "pod-status",
            "game-1",
            record(PodState::Busy, 5).encode(),
        );
        let pod = manipulator(&backend);

        assert!(pod.heartbeat().await);

        let stored = pod.get_status().await.expect("record present");
        assert_eq!(stored.status, PodState::Busy);
        assert!(stored.updated_at > 5);
    }

    #[tokio::test]
    async fn test_heartbeat_reregisters_idle_when_record_is_gone() {
        let backend = MemoryBackend::default();
        let pod = manipulator(&backend);

        assert!(pod.heartbeat().await);

        let stored = pod.get_status().await.expect("record present");
        assert_eq!(stored.status, PodState::Idle);
    }

    #[tokio::test]
    async fn test_run_registered_unregisters_on_error_path() {
        let backend = MemoryBackend::default();
        let pod = manipulator(&backend);

        let outcome: Result<(), &str> = pod
            .run_registered(async {
                // registered while the task runs
                assert!(backend.raw("pod-status", "game-1").is_some());
                Err("boom")
            })
            .await;

        assert_eq!(outcome, Err("boom"));
        assert_eq!(backend.raw("pod-status", "game-1"), None);
    }

    #[tokio::test]
    async fn test_writes_are_best_effort_on_backend_failure() {
        let backend = MemoryBackend {
            fail_writes: true,
            ..Default::default()
        };
        let pod = manipulator(&backend);

        assert!(!pod.register(PodState::Starting).await);
        assert!(!pod.set_status(PodState::Busy).await);
        assert_eq!(backend.raw("pod-status", "game-1"), None);
    }
}
