use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use crate::crd::{BusyProbe, ExecProbe, HttpProbe, ProbeMode, DEFAULT_BUSY_ANNOTATION};
use crate::error::{Error, Result};
use crate::gateway::{ClusterGateway, ExecOutput};
use crate::store::{PodState, PodStateRecord, StateMonitor};

/// Upper bound on pods probed concurrently within one tick, so a large pool
/// with a slow probe target cannot hold a tick open for pods × timeout.
const PROBE_CONCURRENCY: usize = 8;

/* ============================= DECISIONS ============================= */

/// Ternary probe verdict. `Unknown` covers transport failures and unmet
/// preconditions; callers collapse it into idle so a flaky probe can never
/// inflate the busy count or block scale-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyDecision {
    Busy,
    Idle,
    Unknown,
}

/// Map a completed probe's outcome through `successIsBusy`.
pub fn success_to_decision(succeeded: bool, success_is_busy: bool) -> BusyDecision {
    if succeeded == success_is_busy {
        BusyDecision::Busy
    } else {
        BusyDecision::Idle
    }
}

/* ============================= RESOLVED CONFIG ============================= */

#[derive(Debug, Clone, PartialEq)]
pub struct HttpProbeSettings {
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
    pub period: Duration,
    pub success_is_busy: bool,
}

impl Default for HttpProbeSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            path: "/busy".to_string(),
            timeout: Duration::from_secs(1),
            period: Duration::from_secs(10),
            success_is_busy: true,
        }
    }
}

impl HttpProbeSettings {
    fn merged(overrides: Option<&HttpProbe>) -> Self {
        let base = Self::default();
        let Some(o) = overrides else { return base };
        Self {
            port: o.port.unwrap_or(base.port),
            path: o.path.clone().unwrap_or(base.path),
            timeout: o.timeout_seconds.map(Duration::from_secs).unwrap_or(base.timeout),
            period: o.period_seconds.map(Duration::from_secs).unwrap_or(base.period),
            success_is_busy: o.success_is_busy.unwrap_or(base.success_is_busy),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecProbeSettings {
    pub command: Vec<String>,
    pub container: Option<String>,
    pub timeout: Duration,
    pub success_is_busy: bool,
}

impl Default for ExecProbeSettings {
    fn default() -> Self {
        Self {
            command: vec!["cat".to_string(), "/tmp/healthy".to_string()],
            container: None,
            timeout: Duration::from_secs(1),
            success_is_busy: true,
        }
    }
}

impl ExecProbeSettings {
    fn merged(overrides: Option<&ExecProbe>) -> Self {
        let base = Self::default();
        let Some(o) = overrides else { return base };
        Self {
            command: o
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or(base.command),
            container: o.container.clone(),
            timeout: o.timeout_seconds.map(Duration::from_secs).unwrap_or(base.timeout),
            success_is_busy: o.success_is_busy.unwrap_or(base.success_is_busy),
        }
    }
}

/// Probe configuration with all defaults applied, one variant per mode.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedProbe {
    Annotation { key: String },
    Http(HttpProbeSettings),
    Exec(ExecProbeSettings),
    Store,
}

impl ResolvedProbe {
    pub fn from_spec(probe: Option<&BusyProbe>) -> Self {
        let probe = probe.cloned().unwrap_or_default();
        match probe.mode.unwrap_or_default() {
            ProbeMode::Annotation => ResolvedProbe::Annotation {
                key: probe
                    .annotation_key
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| DEFAULT_BUSY_ANNOTATION.to_string()),
            },
            ProbeMode::Http => ResolvedProbe::Http(HttpProbeSettings::merged(probe.http.as_ref())),
            ProbeMode::Exec => ResolvedProbe::Exec(ExecProbeSettings::merged(probe.exec.as_ref())),
            ProbeMode::Redis => ResolvedProbe::Store,
        }
    }
}

/* ============================= POD PREDICATES ============================= */

pub fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|p| p == "Running")
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/* ============================= CLASSIFIERS ============================= */

/// Busy iff the annotation's lowercased value equals `"true"`. A missing
/// annotation is an explicit idle signal, not an unknown.
pub fn annotation_decision(pod: &Pod, key: &str) -> BusyDecision {
    let value = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v.to_lowercase());
    match value.as_deref() {
        Some("true") => BusyDecision::Busy,
        _ => BusyDecision::Idle,
    }
}

/// `GET http://<podIP>:<port><path>`; 2xx is probe success. Pods without an
/// IP or not yet Running cannot be probed and stay unknown, as does any
/// transport error.
pub async fn http_decision(
    http: &reqwest::Client,
    pod: &Pod,
    cfg: &HttpProbeSettings,
) -> BusyDecision {
    if !is_running(pod) {
        return BusyDecision::Unknown;
    }
    let Some(ip) = pod_ip(pod) else {
        return BusyDecision::Unknown;
    };

    let url = format!("http://{}:{}{}", ip, cfg.port, cfg.path);
    match http.get(&url).timeout(cfg.timeout).send().await {
        Ok(response) => success_to_decision(response.status().is_success(), cfg.success_is_busy),
        Err(_) => BusyDecision::Unknown,
    }
}

/// Map an exec probe's outcome. A completed exec maps its exit code through
/// `successIsBusy`. When the channel itself failed, a re-read of the pod
/// reporting `phase=Succeeded` counts as probe success (the workload
/// finished between listing and probing, taking the probe command with it);
/// anything else stays unknown.
pub fn exec_outcome_decision(
    output: Option<&ExecOutput>,
    observed_after_failure: Option<&Pod>,
    success_is_busy: bool,
) -> BusyDecision {
    match output {
        Some(output) => success_to_decision(output.return_code == 0, success_is_busy),
        None => match observed_after_failure.and_then(pod_phase) {
            Some("Succeeded") => success_to_decision(true, success_is_busy),
            _ => BusyDecision::Unknown,
        },
    }
}

/* ============================= ENGINE ============================= */

/// Classifies pods as busy or idle for the reconciler. One engine is built
/// at startup; the HTTP client and store connection are shared across all
/// HSJs and ticks.
pub struct ProbeEngine {
    gateway: Arc<ClusterGateway>,
    http: reqwest::Client,
    monitor: Option<StateMonitor>,
}

/// Busy/idle tally over the running pods matched by an HSJ's selector.
///
/// For annotation/http/exec probes `idle = running - busy`; for the store
/// probe, pods reported `starting` or `error` (or absent from the hash)
/// count in neither bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub busy: i32,
    pub idle: i32,
    pub running: i32,
}

impl ProbeEngine {
    pub fn new(gateway: Arc<ClusterGateway>, monitor: Option<StateMonitor>) -> Self {
        Self {
            gateway,
            http: reqwest::Client::new(),
            monitor,
        }
    }

    /// Classify one pod under the given probe. Store mode is not a per-pod
    /// probe; it is handled wholesale in [`ProbeEngine::count_busy_idle`].
    pub async fn classify(&self, namespace: &str, pod: &Pod, probe: &ResolvedProbe) -> BusyDecision {
        match probe {
            ResolvedProbe::Annotation { key } => annotation_decision(pod, key),
            ResolvedProbe::Http(cfg) => http_decision(&self.http, pod, cfg).await,
            ResolvedProbe::Exec(cfg) => self.exec_decision(namespace, pod, cfg).await,
            ResolvedProbe::Store => BusyDecision::Unknown,
        }
    }

    async fn exec_decision(
        &self,
        namespace: &str,
        pod: &Pod,
        cfg: &ExecProbeSettings,
    ) -> BusyDecision {
        if !is_running(pod) {
            return BusyDecision::Unknown;
        }
        let Some(name) = pod.metadata.name.as_deref() else {
            return BusyDecision::Unknown;
        };

        match self
            .gateway
            .exec_in_pod(
                namespace,
                name,
                cfg.container.as_deref(),
                &cfg.command,
                cfg.timeout,
            )
            .await
        {
            Ok(output) => exec_outcome_decision(Some(&output), None, cfg.success_is_busy),
            Err(_) => {
                let current = self.gateway.read_pod(namespace, name).await.ok().flatten();
                exec_outcome_decision(None, current.as_ref(), cfg.success_is_busy)
            }
        }
    }

    /// The per-tick count procedure: list the selected pods, keep running
    /// non-deleting ones, classify each, and tally.
    ///
    /// An empty selector matches no pods. For the store probe a single
    /// batched read covers every pod; if that read fails, every running pod
    /// counts as busy for this tick so the pool cannot scale down while the
    /// controller is blind.
    pub async fn count_busy_idle(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
        probe: &ResolvedProbe,
    ) -> Result<Tally> {
        if selector.is_empty() {
            return Ok(Tally::default());
        }

        let pods = self.gateway.list_pods(namespace, selector).await?;
        let running: Vec<Pod> = pods.into_iter().filter(is_running).collect();
        let running_total = running.len() as i32;

        if let ResolvedProbe::Store = probe {
            let monitor = self.monitor.as_ref().ok_or_else(|| {
                Error::Config(
                    "busyProbe.mode=redis but no pod-state store is configured (set REDIS_HOST)"
                        .to_string(),
                )
            })?;
            return Ok(match monitor.get_all().await {
                Ok(records) => tally_from_records(&running, &records),
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "pod_state_read_failed_assuming_busy");
                    Tally {
                        busy: running_total,
                        idle: 0,
                        running: running_total,
                    }
                }
            });
        }

        let mut pending: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = BusyDecision> + Send + '_>>> =
            Vec::with_capacity(running.len());
        for pod in running.iter() {
            pending.push(Box::pin(self.classify(namespace, pod, probe)));
        }
        let decisions: Vec<BusyDecision> = futures::stream::iter(pending)
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let busy = decisions
            .iter()
            .filter(|d| **d == BusyDecision::Busy)
            .count() as i32;
        Ok(Tally {
            busy,
            idle: (running_total - busy).max(0),
            running: running_total,
        })
    }
}

/// Store-mode tally: a pod is busy or idle only if its record says so;
/// `starting`, `error` and absent records count in neither bucket.
pub fn tally_from_records(pods: &[Pod], records: &HashMap<String, PodStateRecord>) -> Tally {
    let mut tally = Tally {
        running: pods.len() as i32,
        ..Default::default()
    };
    for pod in pods {
        let Some(name) = pod.metadata.name.as_deref() else {
            continue;
        };
        match records.get(name).map(|r| r.status) {
            Some(PodState::Busy) => tally.busy += 1,
            Some(PodState::Idle) => tally.idle += 1,
            Some(PodState::Starting) | Some(PodState::Error) | None => {}
        }
    }
    tally
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_annotations(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("w".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn named_pod(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ── successIsBusy mapping ──

    #[test]
    fn test_success_to_decision_matrix() {
        assert_eq!(success_to_decision(true, true), BusyDecision::Busy);
        assert_eq!(success_to_decision(false, true), BusyDecision::Idle);
        assert_eq!(success_to_decision(true, false), BusyDecision::Idle);
        assert_eq!(success_to_decision(false, false), BusyDecision::Busy);
    }

    // ── annotation probe ──

    #[test]
    fn test_annotation_true_is_busy() {
        let pod = pod_with_annotations(&[("paia.tech/busy", "true")]);
        assert_eq!(
            annotation_decision(&pod, "paia.tech/busy"),
            BusyDecision::Busy
        );
    }

    #[test]
    fn test_annotation_is_case_insensitive() {
        let pod = pod_with_annotations(&[("paia.tech/busy", "True")]);
        assert_eq!(
            annotation_decision(&pod, "paia.tech/busy"),
            BusyDecision::Busy
        );
    }

    #[test]
    fn test_annotation_other_values_are_idle() {
        for value in ["false", "yes", "1", ""] {
            let pod = pod_with_annotations(&[("paia.tech/busy", value)]);
            assert_eq!(
                annotation_decision(&pod, "paia.tech/busy"),
                BusyDecision::Idle,
                "value {value:?} should be idle"
            );
        }
    }

    #[test]
    fn test_annotation_missing_is_idle() {
        let pod = pod_with_annotations(&[]);
        assert_eq!(
            annotation_decision(&pod, "paia.tech/busy"),
            BusyDecision::Idle
        );
    }

    #[test]
    fn test_annotation_custom_key() {
        let pod = pod_with_annotations(&[("acme.io/working", "true")]);
        assert_eq!(
            annotation_decision(&pod, "acme.io/working"),
            BusyDecision::Busy
        );
        assert_eq!(
            annotation_decision(&pod, "paia.tech/busy"),
            BusyDecision::Idle
        );
    }

    // ── probe resolution ──

    #[test]
    fn test_resolve_default_is_annotation() {
        let probe = ResolvedProbe::from_spec(None);
        assert_eq!(
            probe,
            ResolvedProbe::Annotation {
                key: "paia.tech/busy".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_http_defaults() {
        let spec = BusyProbe {
            mode: Some(ProbeMode::Http),
            ..Default::default()
        };
        let ResolvedProbe::Http(cfg) = ResolvedProbe::from_spec(Some(&spec)) else {
            panic!("expected http probe");
        };
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.path, "/busy");
        assert_eq!(cfg.timeout, Duration::from_secs(1));
        assert_eq!(cfg.period, Duration::from_secs(10));
        assert!(cfg.success_is_busy);
    }

    #[test]
    fn test_resolve_http_overrides_merge_with_defaults() {
        let spec = BusyProbe {
            mode: Some(ProbeMode::Http),
            http: Some(HttpProbe {
                port: Some(9000),
                success_is_busy: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ResolvedProbe::Http(cfg) = ResolvedProbe::from_spec(Some(&spec)) else {
            panic!("expected http probe");
        };
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.path, "/busy");
        assert!(!cfg.success_is_busy);
    }

    #[test]
    fn test_resolve_exec_defaults() {
        let spec = BusyProbe {
            mode: Some(ProbeMode::Exec),
            ..Default::default()
        };
        let ResolvedProbe::Exec(cfg) = ResolvedProbe::from_spec(Some(&spec)) else {
            panic!("expected exec probe");
        };
        assert_eq!(cfg.command, vec!["cat", "/tmp/healthy"]);
        assert_eq!(cfg.container, None);
        assert_eq!(cfg.timeout, Duration::from_secs(1));
        assert!(cfg.success_is_busy);
    }

    #[test]
    fn test_resolve_exec_empty_command_falls_back() {
        let spec = BusyProbe {
            mode: Some(ProbeMode::Exec),
            exec: Some(ExecProbe {
                command: Some(vec![]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ResolvedProbe::Exec(cfg) = ResolvedProbe::from_spec(Some(&spec)) else {
            panic!("expected exec probe");
        };
        assert_eq!(cfg.command, vec!["cat", "/tmp/healthy"]);
    }

    #[test]
    fn test_resolve_redis_mode_is_store() {
        let spec = BusyProbe {
            mode: Some(ProbeMode::Redis),
            ..Default::default()
        };
        assert_eq!(ResolvedProbe::from_spec(Some(&spec)), ResolvedProbe::Store);
    }

    #[test]
    fn test_resolve_empty_annotation_key_falls_back() {
        let spec = BusyProbe {
            annotation_key: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            ResolvedProbe::from_spec(Some(&spec)),
            ResolvedProbe::Annotation {
                key: "paia.tech/busy".to_string()
            }
        );
    }

    // ── exec outcome mapping ──

    fn exec_output(return_code: i32) -> ExecOutput {
        ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            return_code,
        }
    }

    #[test]
    fn test_exec_exit_zero_maps_through_success_is_busy() {
        assert_eq!(
            exec_outcome_decision(Some(&exec_output(0)), None, true),
            BusyDecision::Busy
        );
        assert_eq!(
            exec_outcome_decision(Some(&exec_output(0)), None, false),
            BusyDecision::Idle
        );
    }

    #[test]
    fn test_exec_nonzero_exit_is_probe_failure() {
        assert_eq!(
            exec_outcome_decision(Some(&exec_output(2)), None, true),
            BusyDecision::Idle
        );
        assert_eq!(
            exec_outcome_decision(Some(&exec_output(2)), None, false),
            BusyDecision::Busy
        );
    }

    #[test]
    fn test_exec_channel_failure_with_succeeded_pod_is_probe_success() {
        let finished = named_pod("w", "Succeeded");
        assert_eq!(
            exec_outcome_decision(None, Some(&finished), true),
            BusyDecision::Busy
        );
        assert_eq!(
            exec_outcome_decision(None, Some(&finished), false),
            BusyDecision::Idle
        );
    }

    #[test]
    fn test_exec_channel_failure_otherwise_unknown() {
        let running = named_pod("w", "Running");
        assert_eq!(
            exec_outcome_decision(None, Some(&running), true),
            BusyDecision::Unknown
        );
        assert_eq!(exec_outcome_decision(None, None, true), BusyDecision::Unknown);
    }

    // ── pod predicates ──

    #[test]
    fn test_is_running() {
        assert!(is_running(&named_pod("a", "Running")));
        assert!(!is_running(&named_pod("a", "Pending")));
        assert!(!is_running(&named_pod("a", "Succeeded")));
        assert!(!is_running(&Pod::default()));
    }

    #[test]
    fn test_pod_ip_empty_is_none() {
        let mut pod = named_pod("a", "Running");
        assert_eq!(pod_ip(&pod), None);
        pod.status.as_mut().unwrap().pod_ip = Some(String::new());
        assert_eq!(pod_ip(&pod), None);
        pod.status.as_mut().unwrap().pod_ip = Some("10.0.0.9".to_string());
        assert_eq!(pod_ip(&pod), Some("10.0.0.9"));
    }

    // ── store-mode tally ──

    #[test]
    fn test_tally_from_records_buckets() {
        let pods = vec![
            named_pod("a", "Running"),
            named_pod("b", "Running"),
            named_pod("c", "Running"),
            named_pod("d", "Running"),
            named_pod("e", "Running"),
        ];
        let records = HashMap::from([
            ("a".to_string(), PodStateRecord { status: PodState::Busy, updated_at: 0 }),
            ("b".to_string(), PodStateRecord { status: PodState::Idle, updated_at: 0 }),
            ("c".to_string(), PodStateRecord { status: PodState::Starting, updated_at: 0 }),
            ("d".to_string(), PodStateRecord { status: PodState::Error, updated_at: 0 }),
            // "e" absent: counts as starting
        ]);

        let tally = tally_from_records(&pods, &records);
        assert_eq!(tally.busy, 1);
        assert_eq!(tally.idle, 1);
        assert_eq!(tally.running, 5);
    }

    #[test]
    fn test_tally_from_records_ignores_records_without_pods() {
        // a record for a pod the selector no longer matches is not counted
        let pods = vec![named_pod("a", "Running")];
        let records = HashMap::from([
            ("a".to_string(), PodStateRecord { status: PodState::Idle, updated_at: 0 }),
            ("ghost".to_string(), PodStateRecord { status: PodState::Busy, updated_at: 0 }),
        ]);

        let tally = tally_from_records(&pods, &records);
        assert_eq!(tally.busy, 0);
        assert_eq!(tally.idle, 1);
        assert_eq!(tally.running, 1);
    }
}
