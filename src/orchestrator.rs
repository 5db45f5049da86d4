use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::commands::CommandTable;
use crate::hub::{BroadcastHub, RunEvent};
use crate::runner::{run_command, ChunkSink, SPAWN_FAILURE_EXIT_CODE};
use crate::store::{ReportStore, StoreError};
use crate::types::{
    new_run_id, now_rfc3339, validate_run_id, InvalidRunId, Report, RunPhase, RunRequest,
    ScanKind, StepResult, StepStatus,
};

/// Process-wide settings every step of a run is launched with.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workdir: PathBuf,
    /// Extra environment handed to every step.
    pub env: Vec<(String, String)>,
}

impl RunSettings {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    InvalidRunId(#[from] InvalidRunId),
    #[error("run {0} is already in flight or has a stored report")]
    Duplicate(String),
    #[error("could not check for an existing report: {0}")]
    Store(#[from] StoreError),
}

/// Drives runs: expands the request into steps, runs each through the process runner,
/// streams everything through the hub and stores the final report.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    hub: BroadcastHub,
    store: Arc<dyn ReportStore>,
    commands: CommandTable,
    settings: RunSettings,
    phases: RwLock<HashMap<String, RunPhase>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workdir", &self.inner.settings.workdir)
            .field("hub", &self.inner.hub)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        hub: BroadcastHub,
        store: Arc<dyn ReportStore>,
        commands: CommandTable,
        settings: RunSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                hub,
                store,
                commands,
                settings,
                phases: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    pub fn store(&self) -> Arc<dyn ReportStore> {
        Arc::clone(&self.inner.store)
    }

    /// Accept `request` and run it in the background. Returns the run id right away.
    pub async fn start(&self, mut request: RunRequest) -> Result<String, StartError> {
        let run_id = match request.run_id.take() {
            Some(id) => {
                validate_run_id(&id)?;
                id
            }
            None => new_run_id(),
        };

        if self.inner.store.exists(&run_id).await? {
            return Err(StartError::Duplicate(run_id));
        }
        {
            let mut phases = self.inner.phases.write().await;
            if phases.contains_key(&run_id) {
                return Err(StartError::Duplicate(run_id));
            }
            phases.insert(run_id.clone(), RunPhase::Pending);
        }
        // A run with this id may have stored its report and left `phases` since the first check.
        match self.inner.store.exists(&run_id).await {
            Ok(false) => {}
            Ok(true) => {
                self.inner.phases.write().await.remove(&run_id);
                return Err(StartError::Duplicate(run_id));
            }
            Err(e) => {
                self.inner.phases.write().await.remove(&run_id);
                return Err(e.into());
            }
        }

        request.run_id = Some(run_id.clone());
        info!(run_id = %run_id, kind = %request.run_kind, "run accepted");

        let this = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            this.execute(&id, request).await;
        });
        Ok(run_id)
    }

    /// Where `run_id` is: in flight, finished (from the stored report), or unknown.
    pub async fn status(&self, run_id: &str) -> RunPhase {
        if let Some(phase) = self.inner.phases.read().await.get(run_id) {
            return phase.clone();
        }
        match self.inner.store.read(run_id).await {
            Ok(Some(report)) => report.status().into(),
            Ok(None) => RunPhase::Unknown,
            Err(e) => {
                warn!(run_id, error = %e, "could not read stored report");
                RunPhase::Unknown
            }
        }
    }

    /// Run every step of `request` in order, persist the report, and close the stream.
    ///
    /// A failing step does not stop the ones after it. The returned report is the in-memory
    /// copy, whether or not persisting it succeeded.
    pub async fn execute(&self, run_id: &str, request: RunRequest) -> Report {
        let hub = &self.inner.hub;
        let steps = request.run_kind.expand();
        let total = steps.len();
        let env = self.step_env(run_id, &request);

        let mut results = Vec::with_capacity(total);
        for (i, kind) in steps.into_iter().enumerate() {
            let index = i + 1;
            let result = self.run_step(run_id, kind, index, total, &env).await;
            results.push(result);
        }

        let report = Report {
            id: run_id.to_string(),
            request,
            timestamp: now_rfc3339(),
            results,
        };
        let status = report.status();

        match self.inner.store.write(&report).await {
            Ok(location) => {
                info!(run_id, %status, location = %location, "report saved");
                hub.broadcast(run_id, RunEvent::ReportSaved { location }).await;
            }
            Err(e) => {
                error!(run_id, error = %e, "failed to save report");
                hub.broadcast(
                    run_id,
                    RunEvent::RunError {
                        message: format!("failed to save report: {e}"),
                    },
                )
                .await;
            }
        }

        self.inner.phases.write().await.remove(run_id);
        hub.broadcast(run_id, RunEvent::RunComplete { status }).await;
        report
    }

    async fn run_step(
        &self,
        run_id: &str,
        kind: ScanKind,
        index: usize,
        total: usize,
        env: &[(String, String)],
    ) -> StepResult {
        let hub = &self.inner.hub;
        hub.broadcast(run_id, RunEvent::StepStarted { kind, index, total })
            .await;
        info!(run_id, %kind, step = index, total, "step started");

        let started_at = now_rfc3339();
        let mut sink = StepSink {
            hub,
            run_id,
            phases: &self.inner.phases,
            running: RunPhase::Running {
                step: index,
                total,
                kind,
            },
            output: String::new(),
        };
        let exit_code = match self.inner.commands.resolve(kind, &self.inner.settings.workdir) {
            Some(mut cmd) => {
                cmd.env.extend(env.iter().cloned());
                run_command(&cmd, &mut sink).await
            }
            None => {
                sink.on_chunk(format!("Error: no command configured for {kind}\n"))
                    .await;
                SPAWN_FAILURE_EXIT_CODE
            }
        };
        let status = StepStatus::from_exit_code(exit_code);

        hub.broadcast(
            run_id,
            RunEvent::StepFinished {
                kind,
                status,
                exit_code,
            },
        )
        .await;
        info!(run_id, %kind, %status, exit_code, "step finished");

        StepResult {
            kind,
            status,
            exit_code,
            output: sink.output,
            started_at,
            finished_at: now_rfc3339(),
        }
    }

    fn step_env(&self, run_id: &str, request: &RunRequest) -> Vec<(String, String)> {
        let mut env = self.inner.settings.env.clone();
        env.push(("SCAN_RUN_ID".into(), run_id.to_string()));
        if let Some(target) = &request.target {
            env.push(("SCAN_TARGET".into(), target.clone()));
        }
        env
    }

}

/// Broadcasts each chunk and keeps the step's full output. Moves the run to `running` once
/// the step's process is up.
struct StepSink<'a> {
    hub: &'a BroadcastHub,
    run_id: &'a str,
    phases: &'a RwLock<HashMap<String, RunPhase>>,
    running: RunPhase,
    output: String,
}

#[async_trait]
impl ChunkSink for StepSink<'_> {
    async fn on_spawn(&mut self) {
        self.phases
            .write()
            .await
            .insert(self.run_id.to_string(), self.running.clone());
    }

    async fn on_chunk(&mut self, text: String) {
        self.output.push_str(&text);
        self.hub.broadcast(self.run_id, RunEvent::Output { text }).await;
    }
}
