use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::crd::OWNER_LABEL;
use crate::error::{Error, Result};

/* ============================= GATEWAY ============================= */

/// Thin façade over the cluster API exposing only the verbs the reconciler
/// needs. One gateway is created at startup and shared by all per-HSJ
/// reconciles; `kube::Client` is cheap to clone and safe for concurrent use.
#[derive(Clone)]
pub struct ClusterGateway {
    client: Client,
}

impl ClusterGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// List pods matching `match_labels`, dropping pods already marked for
    /// deletion. Callers filter further by phase.
    pub async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let selector = selector_string(match_labels);
        let params = ListParams::default().labels(&selector);
        let list = self.pods(namespace).list(&params).await?;
        Ok(list.items.into_iter().filter(not_deleting).collect())
    }

    pub async fn read_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    /// List child Jobs labelled `hsj.paia.tech/name=<owner_name>`.
    pub async fn list_jobs_by_owner_label(
        &self,
        namespace: &str,
        owner_name: &str,
    ) -> Result<Vec<Job>> {
        let selector = format!("{OWNER_LABEL}={owner_name}");
        let params = ListParams::default().labels(&selector);
        let list = self.jobs(namespace).list(&params).await?;
        Ok(list.items)
    }

    pub async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        Ok(self.jobs(namespace).create(&PostParams::default(), job).await?)
    }

    /// Delete a Job with background propagation. A 404 is treated as success
    /// so repeated scale-down decisions stay idempotent.
    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        match self.jobs(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(job = %name, namespace = %namespace, "delete_job_already_gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run `command` in a pod container over the cluster's exec channel and
    /// collect stdout, stderr and the exit code.
    ///
    /// The whole exchange is bounded by `timeout`. The websocket closes on
    /// every exit path: `join` flushes it on success, dropping the attached
    /// process tears it down on timeout.
    pub async fn exec_in_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container: Option<&str>,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let pods = self.pods(namespace);

        let mut params = AttachParams::default()
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        if let Some(container) = container {
            params = params.container(container);
        }

        let exchange = async {
            let mut attached = pods.exec(pod_name, command.to_vec(), &params).await?;

            let stdout = read_to_string(attached.stdout()).await;
            let stderr = read_to_string(attached.stderr()).await;
            let status = match attached.take_status() {
                Some(status) => status.await,
                None => None,
            };
            let _ = attached.join().await;

            Ok::<ExecOutput, Error>(ExecOutput {
                stdout,
                stderr,
                return_code: exit_code_from_status(status.as_ref()),
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(output) => output,
            Err(_) => Err(Error::ExecTimeout(timeout)),
        }
    }
}

/* ============================= EXEC OUTPUT ============================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

async fn read_to_string(reader: Option<impl AsyncRead + Unpin>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Map the exec channel's terminal `Status` to a process exit code.
///
/// `Success` means exit 0; otherwise the code is carried in an `ExitCode`
/// cause. A missing status (channel torn down early) reports -1.
pub fn exit_code_from_status(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse::<i32>().ok())
        .unwrap_or(1)
}

/* ============================= HELPERS ============================= */

/// Render `matchLabels` as the `k1=v1,k2=v2` selector string the list API
/// expects. BTreeMap keeps the rendering stable.
pub fn selector_string(match_labels: &BTreeMap<String, String>) -> String {
    match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn not_deleting(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
        ObjectMeta, StatusCause, StatusDetails, Time,
    };

    #[test]
    fn test_selector_string_orders_keys() {
        let labels = BTreeMap::from([
            ("tier".to_string(), "worker".to_string()),
            ("app".to_string(), "game".to_string()),
        ]);
        assert_eq!(selector_string(&labels), "app=game,tier=worker");
    }

    #[test]
    fn test_selector_string_empty() {
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }

    #[test]
    fn test_not_deleting() {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("w".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(not_deleting(&pod));

        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!not_deleting(&pod));
    }

    #[test]
    fn test_exit_code_success() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 0);
    }

    #[test]
    fn test_exit_code_from_cause() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_string()),
                    message: Some("3".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 3);
    }

    #[test]
    fn test_exit_code_failure_without_cause() {
        let status = Status {
            status: Some("Failure".to_string()),
            ..Default::default()
        };
        assert_eq!(exit_code_from_status(Some(&status)), 1);
    }

    #[test]
    fn test_exit_code_missing_status() {
        assert_eq!(exit_code_from_status(None), -1);
    }
}
