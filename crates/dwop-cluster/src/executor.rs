//! Job Executor: builds and submits the Kubernetes `Job` for a ready
//! TaskRun, wiring signed storage URLs into the container's environment.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dwop_core::{Task, Workflow};
use dwop_storage::BlobStore;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{APP_LABEL, APP_LABEL_VALUE, RUN_ID_LABEL, TASK_ID_LABEL, TASK_NAME_LABEL, WORKFLOW_ID_LABEL};

#[derive(Debug, thiserror::Error)]
pub enum JobExecutorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("storage error: {0}")]
    Storage(#[from] dwop_storage::StorageError),
}

/// Submits cluster Jobs for ready TaskRuns. Implements
/// [`dwop_queue::JobSubmitter`] so the dispatcher never links `kube`
/// directly.
pub struct KubeJobExecutor {
    client: Client,
    namespace: String,
    image: String,
    storage: Arc<dyn BlobStore>,
}

impl KubeJobExecutor {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        image: impl Into<String>,
        storage: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            image: image.into(),
            storage,
        }
    }

    fn jobs_api(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Build the env-var list for the container: identifiers plus every
    /// signed URL the in-container worker needs.
    async fn build_env(
        &self,
        workflow: &Workflow,
        task: &Task,
        run_id: Uuid,
    ) -> Result<Vec<EnvVar>, JobExecutorError> {
        let code_url = self
            .storage
            .signed_download_url("Task_Code", &format!("{}/code", task.task_id))
            .await?;
        let req_url = self
            .storage
            .signed_download_url("Workflow_Env", &format!("{}/env", workflow.workflow_id))
            .await?;

        let mut pred_urls = BTreeMap::new();
        for pred_name in &task.predecessors {
            let url = self
                .storage
                .signed_download_url(
                    "Task_Output",
                    &format!("{}/{}/output.txt", workflow.workflow_id, pred_name),
                )
                .await?;
            pred_urls.insert(pred_name.clone(), url);
        }

        let output_url = self
            .storage
            .signed_upload_url(
                "Task_Output",
                &format!("{}/{}/output.txt", workflow.workflow_id, task.name),
            )
            .await?;

        let env = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        };

        Ok(vec![
            env("RUN_ID", run_id.to_string()),
            env("WORKFLOW_ID", workflow.workflow_id.to_string()),
            env("TASK_ID", task.task_id.to_string()),
            env("TASK_NAME", task.name.clone()),
            env("CODE_URL", code_url),
            env("REQ_URL", req_url),
            env("PRED_URLS_JSON", serde_json::to_string(&pred_urls).unwrap_or_default()),
            env(
                "FUNC_ARG_MAP_JSON",
                serde_json::to_string(&task.func_arg_map).unwrap_or_default(),
            ),
            env("OUTPUT_SIGNED_URL", output_url),
        ])
    }

    fn build_job(&self, workflow: &Workflow, task: &Task, run_id: Uuid, env: Vec<EnvVar>) -> Job {
        let job_name = run_id.to_string().to_lowercase();

        let mut labels = BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());
        labels.insert(RUN_ID_LABEL.to_string(), job_name.clone());
        labels.insert(WORKFLOW_ID_LABEL.to_string(), workflow.workflow_id.to_string());
        labels.insert(TASK_ID_LABEL.to_string(), task.task_id.to_string());
        labels.insert(TASK_NAME_LABEL.to_string(), task.name.clone());

        Job {
            metadata: ObjectMeta {
                name: Some(job_name),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "worker".to_string(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some("Never".to_string()),
                            env: Some(env),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Build and submit the Job for `(workflow, task, run_id)`. A name
    /// collision (the Job already exists for this `run_id`) is treated as
    /// success.
    #[instrument(skip(self), fields(run_id = %run_id, task_name = %task.name))]
    pub async fn submit(
        &self,
        workflow: &Workflow,
        task: &Task,
        run_id: Uuid,
    ) -> Result<(), JobExecutorError> {
        let env = self.build_env(workflow, task, run_id).await?;
        let job = self.build_job(workflow, task, run_id, env);

        match self.jobs_api().create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!("submitted cluster job");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                warn!("job already exists for this run_id; treating as success");
                Ok(())
            }
            Err(e) => Err(JobExecutorError::Kube(e)),
        }
    }
}

#[async_trait]
impl dwop_queue::JobSubmitter for KubeJobExecutor {
    async fn submit_job(
        &self,
        workflow: &Workflow,
        task: &Task,
        run_id: Uuid,
    ) -> Result<(), String> {
        self.submit(workflow, task, run_id)
            .await
            .map_err(|e| e.to_string())
    }
}
