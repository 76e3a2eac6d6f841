use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde_json::{json, Value};
use tracing::info;

use crate::crd::{
    HotStandbyJob, HotStandbyJobStatus, DEFAULT_SCALE_DOWN_DELAY_SECS, OWNER_LABEL,
};
use crate::error::{Error, Result};
use crate::gateway::ClusterGateway;
use crate::probe::{ProbeEngine, ResolvedProbe};

/* ============================= DEPENDENCIES ============================= */

/// Process-wide collaborators handed to every reconcile tick.
pub struct ReconcileDeps {
    pub gateway: Arc<ClusterGateway>,
    pub probes: ProbeEngine,
    /// When false the pool only grows; surplus Jobs drain by completing.
    pub scale_down_enabled: bool,
}

/// What one tick did, for status patching and metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub status: HotStandbyJobStatus,
    pub jobs_created: u32,
    pub jobs_deleted: u32,
}

/* ============================= TICK ============================= */

/// One level-triggered reconcile pass for a single HotStandbyJob: observe
/// pods, tally busy/idle, compute the bounded desired count, and converge
/// the child-Job pool toward it. Returns the status snapshot to persist.
pub async fn reconcile_once(hsj: &HotStandbyJob, deps: &ReconcileDeps) -> Result<TickOutcome> {
    let namespace = hsj
        .namespace()
        .ok_or_else(|| Error::Config("HotStandbyJob has no namespace".to_string()))?;
    let name = hsj.name_any();
    let generation = hsj.metadata.generation.unwrap_or(0);

    let spec = &hsj.spec;
    let idle_target = spec.idle_target.unwrap_or(0).max(0);
    let scale_down_delay = spec
        .scale_down_delay_seconds
        .unwrap_or(DEFAULT_SCALE_DOWN_DELAY_SECS);
    let selector = spec
        .selector
        .as_ref()
        .and_then(|s| s.match_labels.clone())
        .unwrap_or_default();
    let template = spec.job_template.clone().unwrap_or_else(|| json!({}));
    let probe = ResolvedProbe::from_spec(spec.busy_probe.as_ref());

    let tally = deps
        .probes
        .count_busy_idle(&namespace, &selector, &probe)
        .await?;
    let desired = desired_active(tally.busy, idle_target, spec.min_replicas, spec.max_replicas);

    let jobs = deps
        .gateway
        .list_jobs_by_owner_label(&namespace, &name)
        .await?;
    let active: Vec<&Job> = jobs
        .iter()
        .filter(|j| job_phase(j) == JobPhase::Active)
        .collect();
    let current_active = active.len() as i32;

    let mut jobs_created = 0u32;
    let mut jobs_deleted = 0u32;

    if current_active < desired {
        let need = desired - current_active;
        for _ in 0..need {
            let job_name = child_job_name(&name);
            let job = render_child_job(hsj, &namespace, &job_name, &template, &selector)?;
            deps.gateway.create_job(&namespace, &job).await?;
            jobs_created += 1;
        }
        info!(
            hsj = %name,
            namespace = %namespace,
            created = jobs_created,
            desired,
            "pool_scaled_up"
        );
    } else if current_active > desired {
        let surplus = (current_active - desired) as usize;
        if deps.scale_down_enabled {
            let victims = select_scale_down_victims(&active, surplus, scale_down_delay, Utc::now());
            for victim in &victims {
                deps.gateway.delete_job(&namespace, victim).await?;
                jobs_deleted += 1;
            }
            info!(
                hsj = %name,
                namespace = %namespace,
                deleted = jobs_deleted,
                surplus,
                desired,
                "pool_scaled_down"
            );
        } else {
            info!(
                hsj = %name,
                namespace = %namespace,
                surplus,
                "scale_down_disabled_keeping_surplus"
            );
        }
    }

    // Fresh listing for the status counters; the tick's own mutations are
    // reflected where the API server has already observed them.
    let jobs = deps
        .gateway
        .list_jobs_by_owner_label(&namespace, &name)
        .await?;
    let mut active_jobs = 0;
    let mut completed_jobs = 0;
    let mut failed_jobs = 0;
    for job in &jobs {
        match job_phase(job) {
            JobPhase::Active => active_jobs += 1,
            JobPhase::Completed => completed_jobs += 1,
            JobPhase::Failed => failed_jobs += 1,
            JobPhase::Pending => {}
        }
    }

    let status = HotStandbyJobStatus {
        busy_count: Some(tally.busy),
        idle_count: Some(tally.idle),
        active_count: Some(tally.running),
        desired_active: Some(desired),
        child_jobs: Some(jobs.len() as i32),
        active_jobs: Some(active_jobs),
        completed_jobs: Some(completed_jobs),
        failed_jobs: Some(failed_jobs),
        last_sync_time: Some(Utc::now().to_rfc3339()),
        observed_generation: Some(generation),
    };

    Ok(TickOutcome {
        status,
        jobs_created,
        jobs_deleted,
    })
}

/* ============================= SIZING ============================= */

/// `busy + idleTarget`, raised to `minReplicas`, capped at `maxReplicas`
/// (the cap is applied last, so it wins over a conflicting minimum), and
/// never negative.
pub fn desired_active(
    busy: i32,
    idle_target: i32,
    min_replicas: Option<i32>,
    max_replicas: Option<i32>,
) -> i32 {
    let mut desired = busy + idle_target;
    if let Some(min) = min_replicas {
        desired = desired.max(min);
    }
    if let Some(max) = max_replicas {
        desired = desired.min(max);
    }
    desired.max(0)
}

/* ============================= JOB PHASES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// `status.active > 0`.
    Active,
    /// `status.succeeded > 0` and no active pods.
    Completed,
    /// `status.failed > 0` and no active pods.
    Failed,
    /// Created but not yet running (or status not reported yet).
    Pending,
}

pub fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Pending;
    };
    if status.active.unwrap_or(0) > 0 {
        JobPhase::Active
    } else if status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Completed
    } else if status.failed.unwrap_or(0) > 0 {
        JobPhase::Failed
    } else {
        JobPhase::Pending
    }
}

fn creation_time(job: &Job) -> DateTime<Utc> {
    job.metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Pick up to `surplus` active Jobs to delete, newest first, skipping any
/// younger than `delay_seconds`. Returns Job names.
pub fn select_scale_down_victims(
    active: &[&Job],
    surplus: usize,
    delay_seconds: i64,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut by_age: Vec<&Job> = active.to_vec();
    by_age.sort_by_key(|j| creation_time(j));

    by_age
        .iter()
        .rev()
        .filter(|job| {
            now.signed_duration_since(creation_time(job)).num_seconds() >= delay_seconds
        })
        .filter_map(|job| job.metadata.name.clone())
        .take(surplus)
        .collect()
}

/* ============================= CHILD JOBS ============================= */

const NAME_SUFFIX_LEN: usize = 5;
const NAME_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `<hsj-name>-w-<5-char base36>`. A suffix collision is resolved by the
/// API server's 409; the next tick rolls a fresh one.
pub fn child_job_name(owner_name: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| NAME_SUFFIX_CHARSET[rng.gen_range(0..NAME_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("{owner_name}-w-{suffix}")
}

/// Later maps win on key conflicts.
pub fn merge_labels(layers: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Stamp one child Job from the HSJ's `jobTemplate`: one completion, one
/// parallel pod, `restartPolicy=Never`, pod-template labels merged with the
/// selector and the owner label, and an owner reference that makes the
/// cluster cascade-delete the Job with its HSJ.
pub fn render_child_job(
    hsj: &HotStandbyJob,
    namespace: &str,
    job_name: &str,
    template: &Value,
    selector: &BTreeMap<String, String>,
) -> Result<Job> {
    let mut spec = match template {
        Value::Object(_) => template.clone(),
        Value::Null => json!({}),
        _ => return Err(Error::Config("jobTemplate must be an object".to_string())),
    };
    let spec_obj = spec.as_object_mut().expect("template is an object");

    spec_obj.insert("completions".to_string(), json!(1));
    spec_obj.insert("parallelism".to_string(), json!(1));

    let tmpl = spec_obj
        .entry("template".to_string())
        .or_insert_with(|| json!({}));
    if !tmpl.is_object() {
        *tmpl = json!({});
    }
    let tmpl_obj = tmpl.as_object_mut().expect("template.template is an object");

    let owner_name = hsj.name_any();
    let owner_labels = BTreeMap::from([(OWNER_LABEL.to_string(), owner_name.clone())]);

    let meta = tmpl_obj
        .entry("metadata".to_string())
        .or_insert_with(|| json!({}));
    if !meta.is_object() {
        *meta = json!({});
    }
    let meta_obj = meta.as_object_mut().expect("pod metadata is an object");
    let existing: BTreeMap<String, String> = meta_obj
        .get("labels")
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default();
    meta_obj.insert(
        "labels".to_string(),
        json!(merge_labels(&[&existing, selector, &owner_labels])),
    );

    let pod_spec = tmpl_obj
        .entry("spec".to_string())
        .or_insert_with(|| json!({}));
    if !pod_spec.is_object() {
        *pod_spec = json!({});
    }
    pod_spec
        .as_object_mut()
        .expect("pod spec is an object")
        .insert("restartPolicy".to_string(), json!("Never"));

    let body = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name,
            "namespace": namespace,
            "labels": { OWNER_LABEL: owner_name },
            "ownerReferences": [{
                "apiVersion": HotStandbyJob::api_version(&()),
                "kind": HotStandbyJob::kind(&()),
                "name": owner_name,
                "uid": hsj.meta().uid.clone().unwrap_or_default(),
                "controller": true,
                "blockOwnerDeletion": true,
            }],
        },
        "spec": spec,
    });

    Ok(serde_json::from_value(body)?)
}

/* ============================= TESTS ============================= */
