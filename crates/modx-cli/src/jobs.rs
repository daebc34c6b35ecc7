//! Background model analysis jobs.
//!
//! `submit` records a Pending job and returns at once; a tokio task then
//! moves it to Analyzing and runs the analysis on a blocking thread, ending
//! in Completed or Failed.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use modx_core::{AnalysisJob, JobStatus, ModxError, Orchestrator, parse_model_reference};
use modx_store::{JobStore, StoreError};

#[derive(Debug)]
pub enum JobError {
    /// The model reference could not be parsed.
    Reference(ModxError),
    Store(StoreError),
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Reference(e) => write!(f, "{e}"),
            JobError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Reference(e) => Some(e),
            JobError::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        JobError::Store(e)
    }
}

#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<Mutex<JobStore>>,
    orchestrator: Arc<Orchestrator>,
}

impl JobRegistry {
    pub fn new(store: JobStore, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            orchestrator,
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&JobStore) -> T) -> T {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        f(&store)
    }

    /// Record a job and start it in the background. Must be called from
    /// within a tokio runtime.
    pub fn submit(&self, model_url: &str) -> Result<AnalysisJob, JobError> {
        let reference = parse_model_reference(model_url).map_err(JobError::Reference)?;
        let job = AnalysisJob::new(&reference);
        self.with_store(|s| s.insert(&job))?;
        tracing::info!("job {} submitted for {}", job.id, reference.model_id);

        let registry = self.clone();
        let (id, model_id) = (job.id, reference.model_id);
        tokio::spawn(async move { registry.run(id, model_id).await });
        Ok(job)
    }

    async fn run(&self, id: Uuid, model_id: String) {
        if let Err(e) = self.with_store(|s| s.transition(id, JobStatus::Analyzing, None, None)) {
            tracing::error!("job {id}: {e}");
            return;
        }

        let orchestrator = Arc::clone(&self.orchestrator);
        let outcome = tokio::task::spawn_blocking(move || orchestrator.analyze(&model_id)).await;

        let finished = match outcome {
            Ok(Ok(report)) => match serde_json::to_value(&report) {
                Ok(value) => self.with_store(|s| {
                    s.transition(id, JobStatus::Completed, Some(&value), None)
                }),
                Err(e) => self.fail(id, &format!("cannot encode report: {e}")),
            },
            Ok(Err(e)) => self.fail(id, &e.to_string()),
            Err(e) => self.fail(id, &format!("analysis task aborted: {e}")),
        };
        match finished {
            Ok(job) => tracing::info!("job {id} finished: {}", job.status),
            Err(e) => tracing::error!("job {id}: {e}"),
        }
    }

    fn fail(&self, id: Uuid, reason: &str) -> Result<AnalysisJob, StoreError> {
        tracing::warn!("job {id} failed: {reason}");
        self.with_store(|s| s.transition(id, JobStatus::Failed, None, Some(reason)))
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AnalysisJob>, JobError> {
        Ok(self.with_store(|s| s.get(id))?)
    }

    pub fn list(&self, limit: Option<usize>) -> Result<Vec<AnalysisJob>, JobError> {
        Ok(self.with_store(|s| s.list(limit))?)
    }

    pub fn count(&self) -> Result<usize, JobError> {
        Ok(self.with_store(|s| s.count())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modx_core::mock::{InMemoryLoader, ScriptedRuntime};
    use modx_core::{
        DetectorConfig, FeatureDetector, PipelineSettings, QuarantineRegistry, SaeManager,
    };
    use std::time::Duration;

    fn registry(loader: InMemoryLoader) -> JobRegistry {
        let detector = FeatureDetector::new(
            Arc::new(QuarantineRegistry::default()),
            DetectorConfig::default(),
        )
        .unwrap();
        let orchestrator = Orchestrator::new(
            ScriptedRuntime::unloaded(32, 4),
            Arc::new(SaeManager::new(loader)),
            detector,
            PipelineSettings::default(),
        );
        JobRegistry::new(JobStore::open_in_memory().unwrap(), Arc::new(orchestrator))
    }

    async fn wait_terminal(jobs: &JobRegistry, id: Uuid) -> AnalysisJob {
        for _ in 0..200 {
            let job = jobs.get(id).unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never finished");
    }

    #[tokio::test]
    async fn test_job_completes() {
        let jobs = registry(InMemoryLoader::new().with_identity(21, 4, 8));
        let job = jobs.submit("https://huggingface.co/org/model").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.model_id.as_deref(), Some("org/model"));

        let done = wait_terminal(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let result = done.result.unwrap();
        assert_eq!(result["model_id"], "org/model");
        assert_eq!(result["sae_features"], 8);
        assert_eq!(result["status"], "analyzed");
    }

    #[tokio::test]
    async fn test_job_fails_on_load_error() {
        let jobs = registry(InMemoryLoader::new().with_identity(21, 4, 8));
        let job = jobs.submit(ScriptedRuntime::UNLOADABLE).unwrap();
        let done = wait_terminal(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("model load failed"));
        assert!(done.result.is_none());
    }

    #[tokio::test]
    async fn test_job_fails_without_sae() {
        let jobs = registry(InMemoryLoader::new());
        let job = jobs.submit("org/model").unwrap();
        let done = wait_terminal(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("layer 21"));
    }

    #[tokio::test]
    async fn test_bad_reference_is_rejected() {
        let jobs = registry(InMemoryLoader::new());
        let err = jobs.submit("ftp://example.com/x").unwrap_err();
        assert!(matches!(err, JobError::Reference(ModxError::Validation(_))));
        assert_eq!(jobs.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resubmission_creates_new_job() {
        let jobs = registry(InMemoryLoader::new().with_identity(21, 4, 8));
        let a = jobs.submit("org/model").unwrap();
        let b = jobs.submit("org/model").unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(jobs.count().unwrap(), 2);
        wait_terminal(&jobs, a.id).await;
        wait_terminal(&jobs, b.id).await;
        assert_eq!(jobs.list(Some(1)).unwrap().len(), 1);
    }
}
