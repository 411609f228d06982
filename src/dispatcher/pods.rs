use super::{MiniInterval, WorkerDispatcher};
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use log::info;
use serde_json::json;
use std::time::Duration;

/// Launches one verifier-worker Job per mini-batch interval on the
/// cluster scheduler and blocks until every Job reports completion,
/// success or failure.
pub struct PodDispatcher {
    client: Client,
    namespace: String,
}

impl PodDispatcher {
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| CoordinatorError::Dispatch(e.to_string()))?;
        Ok(PodDispatcher { client, namespace: namespace.into() })
    }

    fn job_manifest(name: &str, image: &str, tag: &str, interval: &MiniInterval) -> Job {
        let spec = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": name },
            "spec": {
                "backoffLimit": 0,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "verifier",
                            "image": format!("{image}:{tag}"),
                            "args": [
                                interval.start.to_rfc3339(),
                                interval.end.to_rfc3339(),
                            ],
                        }],
                    }
                }
            }
        });
        serde_json::from_value(spec).expect("static job manifest is always valid")
    }

    async fn run_one(&self, name: String, image: &str, tag: &str, interval: MiniInterval) -> Result<()> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        let manifest = Self::job_manifest(&name, image, tag, &interval);
        jobs.create(&PostParams::default(), &manifest)
            .await
            .map_err(|e| CoordinatorError::Dispatch(e.to_string()))?;

        info!("dispatched worker job {name} for [{}, {})", interval.start, interval.end);

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            await_condition(jobs.clone(), &name, conditions::is_job_completed()),
        )
        .await;

        // Individual worker failures never surface to the coordinator:
        // missing data just means fewer submissions.
        if result.is_err() {
            log::warn!("worker job {name} did not complete within the wait budget");
        }

        let _ = jobs.delete(&name, &DeleteParams::background()).await;
        Ok(())
    }
}

#[async_trait]
impl WorkerDispatcher for PodDispatcher {
    async fn dispatch(&self, intervals: &[MiniInterval], image: &str, tag: &str) -> Result<()> {
        let tasks = intervals.iter().enumerate().map(|(i, interval)| {
            let name = format!("uptime-verifier-{}-{}", interval.start.timestamp(), i);
            self.run_one(name, image, tag, *interval)
        });
        try_join_all(tasks).await?;
        Ok(())
    }
}
