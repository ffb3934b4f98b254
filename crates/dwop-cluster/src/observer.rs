//! Observer: the single-writer control loop that reconciles Kubernetes
//! Job outcomes back into DAG state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dwop_store::WorkflowStore;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PropagationPolicy};
use kube::runtime::watcher;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{APP_LABEL, APP_LABEL_VALUE, LOG_TAIL_LINES, RESYNC_PERIOD, RUN_ID_LABEL, WORKFLOW_ID_LABEL};

#[derive(Clone)]
pub struct ObserverConfig {
    pub namespace: String,
    pub resync_period: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            resync_period: RESYNC_PERIOD,
        }
    }
}

/// Watches `Job`s labeled `app=dwop`, reconciles completions/failures into
/// DAG state, and force-stops a workflow's Jobs on cancellation. One
/// instance per namespace; a second instance would race on Job deletion
/// (see the design notes on single-writer reconciliation).
pub struct Observer<S: WorkflowStore> {
    client: Client,
    config: ObserverConfig,
    store: Arc<S>,
}

impl<S: WorkflowStore> Observer<S> {
    pub fn new(client: Client, config: ObserverConfig, store: Arc<S>) -> Self {
        Self {
            client,
            config,
            store,
        }
    }

    fn jobs_api(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Full list + reconcile of every `app=dwop` Job.
    pub async fn reconcile_all(&self) {
        let lp = ListParams::default().labels(&format!("{APP_LABEL}={APP_LABEL_VALUE}"));
        match self.jobs_api().list(&lp).await {
            Ok(jobs) => {
                for job in jobs.items {
                    self.handle_job_status(&job).await;
                }
            }
            Err(e) => error!(error = %e, "failed to list jobs during reconcile"),
        }
    }

    /// Startup reconcile, then multiplex the watch stream, the resync
    /// ticker, and the shutdown signal until canceled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("observer starting; running initial reconcile");
        self.reconcile_all().await;

        let lp = watcher::Config::default().labels(&format!("{APP_LABEL}={APP_LABEL_VALUE}"));
        let mut watch = watcher(self.jobs_api(), lp).boxed();
        let mut resync = tokio::time::interval(self.config.resync_period);
        resync.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("observer shutting down");
                    return;
                }
                _ = resync.tick() => {
                    debug!("observer resync tick");
                    self.reconcile_all().await;
                }
                event = watch.try_next() => {
                    match event {
                        Ok(Some(watcher::Event::Delete(_))) => {
                            // Deletions are our own doing; nothing to reconcile.
                        }
                        Ok(Some(watcher::Event::Apply(job))) => {
                            self.handle_job_status(&job).await;
                        }
                        Ok(Some(watcher::Event::Init)) | Ok(Some(watcher::Event::InitApply(_))) | Ok(Some(watcher::Event::InitDone)) => {}
                        Ok(None) => {
                            warn!("job watch stream ended; resync will recover");
                            return;
                        }
                        Err(e) => {
                            error!(error = %e, "job watch error; continuing");
                        }
                    }
                }
            }
        }
    }

    async fn handle_job_status(&self, job: &Job) {
        let Some(labels) = job.metadata.labels.as_ref() else {
            warn!("job has no labels; dropping");
            return;
        };
        let Some(run_id) = labels.get(RUN_ID_LABEL) else {
            warn!("job missing runID label; dropping");
            return;
        };
        let run_id = match uuid::Uuid::parse_str(run_id) {
            Ok(id) => id,
            Err(_) => {
                warn!(run_id, "runID label is not a valid uuid; dropping");
                return;
            }
        };

        let Some(status) = job.status.as_ref() else {
            return;
        };
        let Some(conditions) = status.conditions.as_ref() else {
            return;
        };

        let is_completed = conditions
            .iter()
            .any(|c| c.type_ == "Complete" && c.status == "True");
        let is_failed = conditions
            .iter()
            .any(|c| c.type_ == "Failed" && c.status == "True");

        let job_name = job.metadata.name.clone().unwrap_or_default();

        if is_failed {
            let message = self.gather_failure_diagnostics(&job_name).await;
            match self.store.increase_attempt(run_id, &message).await {
                Ok(outcome) => {
                    info!(run_id = %run_id, ?outcome, "recorded task failure");
                    self.delete_job(&job_name).await;
                }
                Err(e) => error!(error = %e, "increase_attempt failed; will retry next reconcile"),
            }
        } else if is_completed {
            match self.store.complete_run_and_enqueue_successors(run_id).await {
                Ok(outcome) => {
                    info!(run_id = %run_id, ?outcome, "recorded task success");
                    self.delete_job(&job_name).await;
                }
                Err(e) => error!(error = %e, "complete_run_and_enqueue_successors failed; will retry next reconcile"),
            }
        }
    }

    /// List pods for `job-name=<job_name>`, inspect the first container's
    /// status, and append a tail of its logs.
    async fn gather_failure_diagnostics(&self, job_name: &str) -> String {
        let lp = ListParams::default().labels(&format!("job-name={job_name}"));
        let pods = match self.pods_api().list(&lp).await {
            Ok(pods) => pods.items,
            Err(e) => return format!("failed to list pods for job {job_name}: {e}"),
        };

        let Some(pod) = pods.into_iter().next() else {
            return format!("no pods found for job {job_name}");
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        let container_message = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.first())
            .and_then(|cs| cs.state.as_ref())
            .map(|state| {
                if let Some(terminated) = &state.terminated {
                    format!(
                        "terminated: exit_code={} reason={:?} message={:?}",
                        terminated.exit_code, terminated.reason, terminated.message
                    )
                } else if let Some(waiting) = &state.waiting {
                    format!("waiting: reason={:?} message={:?}", waiting.reason, waiting.message)
                } else {
                    "running".to_string()
                }
            })
            .or_else(|| pod.status.as_ref().and_then(|s| s.phase.clone()))
            .unwrap_or_else(|| "unknown pod state".to_string());

        let logs = self
            .pods_api()
            .logs(
                &pod_name,
                &LogParams {
                    container: Some("worker".to_string()),
                    tail_lines: Some(LOG_TAIL_LINES),
                    ..Default::default()
                },
            )
            .await
            .unwrap_or_else(|e| format!("(failed to fetch logs: {e})"));

        format!("{container_message}\n--- last {LOG_TAIL_LINES} log lines ---\n{logs}")
    }

    async fn delete_job(&self, job_name: &str) {
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs_api().delete(job_name, &dp).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => warn!(error = %e, job_name, "failed to delete job"),
        }
    }

    /// Delete every Job labeled with this `workflow_id`, background
    /// propagation, grace period zero. Idempotent.
    pub async fn force_stop(&self, workflow_id: uuid::Uuid) {
        let lp = ListParams::default()
            .labels(&format!("{APP_LABEL}={APP_LABEL_VALUE},{WORKFLOW_ID_LABEL}={workflow_id}"));
        let dp = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match self.jobs_api().delete_collection(&dp, &lp).await {
            Ok(_) => info!(%workflow_id, "force-stopped workflow jobs"),
            Err(e) => warn!(error = %e, %workflow_id, "failed to force-stop workflow jobs"),
        }
    }
}

#[async_trait]
impl<S: WorkflowStore> dwop_queue::WorkflowCanceler for Observer<S> {
    async fn force_stop(&self, workflow_id: uuid::Uuid) {
        Observer::force_stop(self, workflow_id).await
    }
}
