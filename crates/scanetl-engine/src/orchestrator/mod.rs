//! Pipeline orchestrator
//!
//! Runs the stages of a pipeline document in order. A document is validated
//! completely before the run record is created: unknown routines, arity
//! mismatches and unresolvable provider or sink configs never reach an
//! external system.
//!
//! Stage failures are isolated. Without `abort_on_error` every stage runs and
//! the outcome lists each one; with it, the first failure marks the remaining
//! stages as skipped.

pub mod outcome;
pub mod registry;
mod stage;
pub mod store;

pub use outcome::{RunOutcome, RunRecord, RunStatus, StageError, StageOutcome, StageStatus};
pub use registry::{
    message_all, save_all, Arity, Count, StageContext, Transform, TransformError,
    TransformRegistry,
};
pub use store::{MemoryRunStore, PgRunStore, RunStore, StoreError};

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{ConfigError, EngineSettings, Params, PipelineDocument};
use crate::{provider, sink};
use stage::{PreparedStage, StageRunner};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Orchestrator {
    registry: TransformRegistry,
    store: Arc<dyn RunStore>,
    settings: EngineSettings,
}

impl Orchestrator {
    pub fn new(
        registry: TransformRegistry,
        store: Arc<dyn RunStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Check a document without touching any external system
    pub fn validate(&self, doc: &PipelineDocument, overrides: &Params) -> Result<(), ConfigError> {
        self.prepare(doc, overrides).map(|_| ())
    }

    fn prepare<'a>(
        &self,
        doc: &'a PipelineDocument,
        overrides: &Params,
    ) -> Result<Vec<PreparedStage<'a>>, ConfigError> {
        let mut names = HashSet::new();
        let mut prepared = Vec::with_capacity(doc.stages.len());

        for (index, config) in doc.stages.iter().enumerate() {
            let name = config.label(index);
            if !names.insert(name.clone()) {
                return Err(ConfigError::Invalid {
                    key: format!("stages[{}].name", index),
                    message: format!("duplicate stage name `{}`", name),
                });
            }

            let transform = self.registry.get(&config.transform)?;
            transform.arity().check(
                &name,
                &config.transform,
                config.providers.len(),
                config.sinks.len(),
            )?;

            for provider_config in &config.providers {
                provider::validate(provider_config, &doc.endpoints)?;
            }
            for sink_config in &config.sinks {
                sink::validate(sink_config, &doc.endpoints)?;
            }

            let params = Params::layered(&[&doc.params, &config.params, overrides]);
            transform.validate_params(&params)?;

            prepared.push(PreparedStage {
                index,
                name,
                config,
                transform,
                params,
            });
        }

        Ok(prepared)
    }

    /// Validate, then execute every stage in order
    pub async fn run(
        &self,
        doc: &PipelineDocument,
        overrides: &Params,
    ) -> Result<RunOutcome, OrchestratorError> {
        let stages = self.prepare(doc, overrides)?;

        let run_id = self.store.begin_run(&doc.name).await?;
        let run_dir = self.settings.work_dir.join(format!("run-{}", run_id));
        info!(
            run_id,
            pipeline = %doc.name,
            stages = stages.len(),
            abort_on_error = doc.abort_on_error,
            "Starting pipeline run"
        );

        let mut outcomes = Vec::with_capacity(stages.len());
        let mut aborted = false;

        for stage in &stages {
            let outcome = if aborted {
                info!(stage = %stage.name, "Skipping stage after earlier failure");
                StageOutcome::skipped(
                    stage.index,
                    stage.name.clone(),
                    stage.config.transform.clone(),
                )
            } else {
                let stage_dir = run_dir.join(crate::file_safe(&stage.name));
                let runner = StageRunner {
                    run_id,
                    endpoints: &doc.endpoints,
                    settings: &self.settings,
                    stage_dir: &stage_dir,
                };
                let span = info_span!(
                    "stage",
                    run_id,
                    name = %stage.name,
                    transform = %stage.config.transform
                );
                runner.execute(stage).instrument(span).await
            };

            if outcome.failed() && doc.abort_on_error {
                warn!(stage = %stage.name, "Stage failed, aborting remaining stages");
                aborted = true;
            }

            self.store.record_stage(run_id, &outcome).await?;
            outcomes.push(outcome);
        }

        let any_failed = outcomes.iter().any(|s| s.failed());
        let status = match (any_failed, doc.abort_on_error) {
            (false, _) => RunStatus::Succeeded,
            (true, false) => RunStatus::CompletedWithErrors,
            (true, true) => RunStatus::Aborted,
        };
        let artifacts: Vec<PathBuf> = outcomes
            .iter()
            .flat_map(|s| s.artifacts.iter().cloned())
            .collect();

        self.store.finish_run(run_id, status, &artifacts).await?;
        info!(
            run_id,
            status = status.as_str(),
            failed = outcomes.iter().filter(|s| s.failed()).count(),
            "Pipeline run finished"
        );

        Ok(RunOutcome {
            run_id,
            pipeline: doc.name.clone(),
            status,
            abort_on_error: doc.abort_on_error,
            stages: outcomes,
            artifacts,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, ProviderConfig, SinkConfig, StageConfig};
    use crate::provider::archive::ArchiveConfig;
    use crate::provider::remote_fs::RemoteFsConfig;
    use crate::sink::remote_file::RemoteFileSinkConfig;
    use crate::sink::Record;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::path::Path;

    /// Saves one record per entry: `{"name": <entry name>}`
    struct Names;

    #[async_trait]
    impl Transform for Names {
        fn name(&self) -> &'static str {
            "names"
        }

        fn arity(&self) -> Arity {
            Arity::new(Count::Exactly(1), Count::Exactly(1))
        }

        async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError> {
            let StageContext {
                providers, sinks, ..
            } = ctx;
            while let Some(entry) = providers[0].next().await {
                let record = Record::from_value(
                    "entry_name",
                    serde_json::json!({ "name": entry.name() }),
                )?;
                save_all(sinks, vec![record]).await?;
            }
            Ok(())
        }
    }

    /// Records the merged `tag` parameter into the artifact dir
    struct Tagger;

    #[async_trait]
    impl Transform for Tagger {
        fn name(&self) -> &'static str {
            "tagger"
        }

        fn arity(&self) -> Arity {
            Arity::new(Count::AtLeast(0), Count::AtLeast(0))
        }

        fn validate_params(&self, params: &Params) -> Result<(), ConfigError> {
            params.require_str("tag").map(|_| ())
        }

        async fn run(&self, ctx: StageContext<'_>) -> Result<(), TransformError> {
            let tag = ctx.params.require_str("tag")?;
            std::fs::write(ctx.artifact_dir.join("tag.txt"), tag)
                .map_err(|e| TransformError::Other(e.to_string()))?;
            Ok(())
        }
    }

    fn orchestrator(work_dir: &Path) -> (Orchestrator, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        let registry = TransformRegistry::new().with(Names).with(Tagger);
        let settings = EngineSettings::default().with_work_dir(work_dir);
        (Orchestrator::new(registry, store.clone(), settings), store)
    }

    fn names_stage(name: &str, provider: ProviderConfig) -> StageConfig {
        StageConfig {
            name: Some(name.to_string()),
            transform: "names".to_string(),
            providers: vec![provider],
            sinks: vec![SinkConfig::RemoteFile(RemoteFileSinkConfig {
                endpoint: "out".to_string(),
                path: format!("/{}", name),
                columns: BTreeMap::new(),
                batch_size: None,
                flush_interval_secs: None,
                force_flush: false,
            })],
            params: Params::new(),
        }
    }

    fn document(input: &Path, output: &Path, stages: Vec<StageConfig>) -> PipelineDocument {
        PipelineDocument {
            name: "test".to_string(),
            abort_on_error: false,
            params: Params::new(),
            endpoints: crate::config::EndpointRegistry::new()
                .with("in", Endpoint::Local { root: input.to_path_buf() })
                .with("out", Endpoint::Local { root: output.to_path_buf() }),
            stages,
        }
    }

    fn local_files(dir: &Path) -> ProviderConfig {
        std::fs::write(dir.join("a.csv"), "1").unwrap();
        std::fs::write(dir.join("b.csv"), "2").unwrap();
        ProviderConfig::RemoteFs(RemoteFsConfig {
            endpoint: "in".to_string(),
            root: "/".to_string(),
            pattern: Some("*.csv".to_string()),
            recursive: true,
        })
    }

    fn missing_archive(dir: &Path) -> ProviderConfig {
        ProviderConfig::Archive(ArchiveConfig {
            path: dir.join("does-not-exist.tar"),
            pattern: None,
            recursive: true,
        })
    }

    #[tokio::test]
    async fn test_failed_stage_does_not_stop_the_next_one() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(work.path());

        let doc = document(
            input.path(),
            output.path(),
            vec![
                names_stage("broken", missing_archive(input.path())),
                names_stage("files", local_files(input.path())),
            ],
        );

        let outcome = orchestrator.run(&doc, &Params::new()).await.unwrap();
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.status, RunStatus::CompletedWithErrors);
        assert_eq!(outcome.exit_code(), 0);

        let broken = &outcome.stages[0];
        assert!(broken.failed());
        assert_eq!(broken.failed_in, Some(StageStatus::SourcesInitializing));
        assert!(broken.error.as_deref().unwrap().contains("failed to initialize"));

        let files = &outcome.stages[1];
        assert!(files.succeeded(), "{:?}", files.error);
        let written = std::fs::read_to_string(output.path().join("files/entry_name.csv")).unwrap();
        assert_eq!(written, "name\na.csv\nb.csv\n");

        let record = store.get(outcome.run_id).unwrap();
        assert_eq!(record.stages.len(), 2);
        assert_eq!(record.status, RunStatus::CompletedWithErrors);
        assert!(record.finished_at.is_some());
        assert_eq!(record.artifacts, outcome.artifacts);
    }

    #[tokio::test]
    async fn test_abort_on_error_skips_remaining_stages() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(work.path());

        let mut doc = document(
            input.path(),
            output.path(),
            vec![
                names_stage("broken", missing_archive(input.path())),
                names_stage("files", local_files(input.path())),
            ],
        );
        doc.abort_on_error = true;

        let outcome = orchestrator.run(&doc, &Params::new()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Aborted);
        assert_eq!(outcome.stages[1].status, StageStatus::Skipped);
        assert_eq!(outcome.exit_code(), 1);
        assert!(!output.path().join("files").exists());
    }

    #[tokio::test]
    async fn test_arity_mismatch_fails_before_any_run() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(work.path());

        let mut stage = names_stage("files", local_files(input.path()));
        stage.sinks.clear();
        let doc = document(input.path(), output.path(), vec![stage]);

        let err = orchestrator.run(&doc, &Params::new()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Config(ConfigError::Arity { sinks: 0, .. })
        ));
        assert!(store.get(1).is_none());
        assert!(!work.path().join("run-1").exists());
    }

    #[tokio::test]
    async fn test_unknown_transform_and_endpoint() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(work.path());

        let mut stage = names_stage("files", local_files(input.path()));
        stage.transform = "nope".to_string();
        let doc = document(input.path(), output.path(), vec![stage]);
        assert!(matches!(
            orchestrator.validate(&doc, &Params::new()),
            Err(ConfigError::UnknownTransform(_))
        ));

        let mut stage = names_stage("files", local_files(input.path()));
        if let SinkConfig::RemoteFile(c) = &mut stage.sinks[0] {
            c.endpoint = "elsewhere".to_string();
        }
        let doc = document(input.path(), output.path(), vec![stage]);
        assert!(matches!(
            orchestrator.validate(&doc, &Params::new()),
            Err(ConfigError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_params_precedence() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(work.path());

        let stage = |name: &str, params: Params| StageConfig {
            name: Some(name.to_string()),
            transform: "tagger".to_string(),
            providers: Vec::new(),
            sinks: Vec::new(),
            params,
        };
        let mut doc = document(
            input.path(),
            input.path(),
            vec![
                stage("global", Params::new()),
                stage("local", Params::new().with("tag", "stage")),
            ],
        );
        doc.params = Params::new().with("tag", "global");

        let outcome = orchestrator.run(&doc, &Params::new()).await.unwrap();
        let run_dir = work.path().join(format!("run-{}", outcome.run_id));
        let tag = |stage: &str| std::fs::read_to_string(run_dir.join(stage).join("tag.txt")).unwrap();
        assert_eq!(tag("global"), "global");
        assert_eq!(tag("local"), "stage");

        let overrides = Params::from_overrides(&["tag:cli"]).unwrap();
        let outcome = orchestrator.run(&doc, &overrides).await.unwrap();
        let run_dir = work.path().join(format!("run-{}", outcome.run_id));
        assert_eq!(
            std::fs::read_to_string(run_dir.join("local/tag.txt")).unwrap(),
            "cli"
        );
    }

    #[tokio::test]
    async fn test_missing_param_is_a_config_error() {
        let work = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(work.path());
        let doc = document(
            work.path(),
            work.path(),
            vec![StageConfig {
                name: None,
                transform: "tagger".to_string(),
                providers: Vec::new(),
                sinks: Vec::new(),
                params: Params::new(),
            }],
        );
        assert!(matches!(
            orchestrator.validate(&doc, &Params::new()),
            Err(ConfigError::MissingField { field: "tag", .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_stage_names_rejected() {
        let work = tempfile::tempdir().unwrap();
        let input = tempfile::tempdir().unwrap();
        let (orchestrator, _) = orchestrator(work.path());
        let doc = document(
            input.path(),
            input.path(),
            vec![
                names_stage("same", local_files(input.path())),
                names_stage("same", local_files(input.path())),
            ],
        );
        assert!(matches!(
            orchestrator.validate(&doc, &Params::new()),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
