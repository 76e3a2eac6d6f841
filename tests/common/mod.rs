use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;

/// Build a pod as the probe layer sees it: phase, optional busy annotation
/// (under `paia.tech/busy`), optional pod IP, optionally marked for deletion.
pub fn make_pod(
    name: &str,
    phase: &str,
    busy_annotation: Option<&str>,
    pod_ip: Option<&str>,
    deleting: bool,
) -> Pod {
    let annotations = busy_annotation.map(|value| {
        BTreeMap::from([("paia.tech/busy".to_string(), value.to_string())])
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            annotations,
            deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: pod_ip.map(String::from),
            ..Default::default()
        }),
        ..Default::default()
    }
}
