//! Execution of one stage
//!
//! Every path through [`execute`] finishes the sinks it built and closes the
//! providers it built before the outcome is returned. The first fatal error
//! wins; later ones are only logged.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::outcome::{StageError, StageOutcome, StageStatus};
use super::registry::{StageContext, Transform};
use crate::config::{EndpointRegistry, EngineSettings, Params, StageConfig};
use crate::provider::{self, EntryProvider, ProviderContext};
use crate::sink::{self, RecordSink, SinkContext};

/// A stage that passed validation
pub(crate) struct PreparedStage<'a> {
    pub index: usize,
    pub name: String,
    pub config: &'a StageConfig,
    pub transform: Arc<dyn Transform>,
    pub params: Params,
}

pub(crate) struct StageRunner<'a> {
    pub run_id: i64,
    pub endpoints: &'a EndpointRegistry,
    pub settings: &'a EngineSettings,
    pub stage_dir: &'a Path,
}

/// Tracks the current state and the first fatal error
struct Progress {
    status: StageStatus,
    failure: Option<(StageStatus, StageError)>,
}

impl Progress {
    fn enter(&mut self, status: StageStatus) {
        debug!(from = self.status.as_str(), to = status.as_str(), "Stage transition");
        self.status = status;
    }

    fn fail(&mut self, err: StageError) {
        match &self.failure {
            None => {
                error!(state = self.status.as_str(), error = %err, "Stage failed");
                self.failure = Some((self.status, err));
            },
            Some(_) => warn!(state = self.status.as_str(), error = %err, "Further stage error"),
        }
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl StageRunner<'_> {
    fn build_providers(
        &self,
        stage: &PreparedStage<'_>,
    ) -> Result<Vec<Box<dyn EntryProvider>>, StageError> {
        stage
            .config
            .providers
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let ctx = ProviderContext {
                    endpoints: self.endpoints.clone(),
                    settings: self.settings.clone(),
                    artifact_dir: self.stage_dir.to_path_buf(),
                    instance_name: format!("{}/{}-{}", stage.name, i, config.kind_name()),
                };
                provider::build(config, &ctx).map_err(|e| StageError::Setup(e.to_string()))
            })
            .collect()
    }

    fn build_sinks(
        &self,
        stage: &PreparedStage<'_>,
    ) -> Result<Vec<Box<dyn RecordSink>>, StageError> {
        stage
            .config
            .sinks
            .iter()
            .enumerate()
            .map(|(i, config)| {
                let ctx = SinkContext {
                    endpoints: self.endpoints.clone(),
                    settings: self.settings.clone(),
                    artifact_dir: self.stage_dir.to_path_buf(),
                    instance_name: format!("{}/{}-{}", stage.name, i, config.kind_name()),
                };
                sink::build(config, &ctx).map_err(|e| StageError::Setup(e.to_string()))
            })
            .collect()
    }

    pub(crate) async fn execute(&self, stage: &PreparedStage<'_>) -> StageOutcome {
        let mut outcome =
            StageOutcome::pending(stage.index, stage.name.clone(), stage.config.transform.clone());
        outcome.started_at = Some(Utc::now());
        let mut progress = Progress {
            status: StageStatus::Pending,
            failure: None,
        };

        if let Err(e) = tokio::fs::create_dir_all(self.stage_dir).await {
            progress.fail(StageError::Setup(format!(
                "cannot create {}: {}",
                self.stage_dir.display(),
                e
            )));
        }

        let built = if progress.failed() {
            None
        } else {
            match (self.build_providers(stage), self.build_sinks(stage)) {
                (Ok(providers), Ok(sinks)) => Some((providers, sinks)),
                (Err(e), _) | (_, Err(e)) => {
                    progress.fail(e);
                    None
                },
            }
        };

        if let Some((mut providers, sinks)) = built {
            self.drive(stage, &mut providers, &sinks, &mut progress).await;

            for sink in &sinks {
                outcome.sink_errors.extend(sink.errors());
                outcome.artifacts.extend(sink.output_paths());
            }
            for provider in &providers {
                outcome.provider_errors.extend(provider.errors());
                outcome.artifacts.extend(provider.output_paths());
            }
        }

        match progress.failure.take() {
            Some((state, err)) => {
                outcome.status = StageStatus::Failed;
                outcome.failed_in = Some(state);
                outcome.error = Some(err.to_string());
            },
            None => outcome.status = StageStatus::Succeeded,
        }
        outcome.finished_at = Some(Utc::now());

        info!(
            status = outcome.status.as_str(),
            sink_errors = outcome.sink_errors.len(),
            provider_errors = outcome.provider_errors.len(),
            "Stage complete"
        );
        outcome
    }

    /// Walk the state machine. Sinks are always finished and providers
    /// always closed, whatever failed before.
    async fn drive(
        &self,
        stage: &PreparedStage<'_>,
        providers: &mut [Box<dyn EntryProvider>],
        sinks: &[Box<dyn RecordSink>],
        progress: &mut Progress,
    ) {
        progress.enter(StageStatus::SourcesInitializing);
        for provider in providers.iter_mut() {
            if let Err(source) = provider.init().await {
                progress.fail(StageError::ProviderInit {
                    provider: provider.name().to_string(),
                    source,
                });
                break;
            }
        }

        if !progress.failed() {
            progress.enter(StageStatus::SinksStarting);
            for sink in sinks {
                if let Err(source) = sink.start().await {
                    progress.fail(StageError::SinkStart {
                        sink: sink.name().to_string(),
                        source,
                    });
                    break;
                }
            }
        }

        if !progress.failed() {
            progress.enter(StageStatus::Executing);
            let ctx = StageContext {
                run_id: self.run_id,
                stage: &stage.name,
                providers: &mut *providers,
                sinks,
                params: &stage.params,
                artifact_dir: self.stage_dir,
            };
            if let Err(e) = stage.transform.run(ctx).await {
                progress.fail(StageError::Transform(e));
            }
        }

        if !progress.failed() {
            progress.enter(StageStatus::SinksFinishing);
        }
        for sink in sinks {
            if let Err(source) = sink.finish().await {
                progress.fail(StageError::SinkFinish {
                    sink: sink.name().to_string(),
                    source,
                });
            }
        }

        for provider in providers.iter_mut() {
            provider.close().await;
        }
    }
}
