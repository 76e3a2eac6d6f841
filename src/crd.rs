use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= CONSTANTS ============================= */

/// Label stamped on every child Job (metadata and pod template) pointing back
/// at the owning HotStandbyJob by name.
pub const OWNER_LABEL: &str = "hsj.paia.tech/name";

/// Annotation consulted by the default busy probe.
pub const DEFAULT_BUSY_ANNOTATION: &str = "paia.tech/busy";

/// Seconds a child Job must exist before it becomes a scale-down candidate.
pub const DEFAULT_SCALE_DOWN_DELAY_SECS: i64 = 30;

/* ============================= PROBE TYPES ============================= */

/// How the controller decides whether a selected pod is busy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Read a pod annotation; busy iff its lowercased value is `"true"`.
    #[default]
    Annotation,
    /// `GET http://<podIP>:<port><path>`; 2xx is probe success.
    Http,
    /// Run a command in the pod; exit 0 is probe success.
    Exec,
    /// Read the shared pod-state hash in one batch call.
    Redis,
}

/// HTTP probe overrides. Omitted fields fall back to
/// `{port: 8080, path: "/busy", timeoutSeconds: 1, periodSeconds: 10,
/// successIsBusy: true}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u64>,

    /// When true (default), a successful probe marks the pod busy; when
    /// false, a successful probe marks it idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_is_busy: Option<bool>,
}

/// Exec probe overrides. Omitted fields fall back to
/// `{command: ["cat", "/tmp/healthy"], container: default, timeoutSeconds: 1,
/// successIsBusy: true}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Target container; the pod's default container when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_is_busy: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BusyProbe {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProbeMode>,

    /// Annotation key for `annotation` mode; default `paia.tech/busy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecProbe>,
}

/* ============================= SELECTOR ============================= */

/// Pod selector for the warm pool. An empty or omitted selector matches no
/// pods: busy and idle both tally to zero.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_labels: Option<BTreeMap<String, String>>,
}

/* ============================= SPEC ============================= */

fn preserve_arbitrary(_gen: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject::default();
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::json!(true),
    );
    schemars::schema::Schema::Object(obj)
}

/// HotStandbyJob keeps a warm pool of worker pods: `idleTarget` idle pods are
/// maintained beyond those currently busy, by growing or shrinking a pool of
/// one-shot child Jobs stamped from `jobTemplate`.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "apps.paia.tech",
    version = "v1alpha1",
    kind = "HotStandbyJob",
    plural = "hotstandbyjobs",
    status = "HotStandbyJobStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HotStandbyJobSpec {
    /// Number of idle pods to keep ready beyond the busy ones. Defaults to 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_target: Option<i32>,

    /// Lower bound on the desired active count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound on the desired active count. Wins over `minReplicas`
    /// when the two conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Minimum age (seconds) a child Job must reach before scale-down may
    /// delete it. Defaults to 30.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_delay_seconds: Option<i64>,

    /// Selects the pods under management.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,

    /// Job spec stamped onto each child Job. Opaque to the controller except
    /// for `completions`/`parallelism` (forced to 1), `restartPolicy`
    /// (forced to `Never`) and pod-template labels (merged with the
    /// selector and the owner label).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_arbitrary")]
    pub job_template: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_probe: Option<BusyProbe>,
}

/* ============================= STATUS ============================= */

/// Observed state, written after each successful reconcile tick.
///
/// `lastSyncTime` only advances on success, so a stuck controller is visible
/// as a stale timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotStandbyJobStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_count: Option<i32>,

    /// Running pods matched by the selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_active: Option<i32>,

    /// All child Jobs carrying the owner label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_jobs: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_jobs: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_jobs: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_jobs: Option<i32>,

    /// ISO 8601 UTC timestamp of the last successful tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= TESTS ============================= */
