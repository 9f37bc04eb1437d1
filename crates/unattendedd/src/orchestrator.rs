//! Update orchestrator - runs check, stage, switch and restart cycles.
//!
//! One `tokio::sync::Mutex<()>` serializes everything that may switch the
//! version or touch the process lifecycle: timer-driven cycles, restarts
//! triggered by a `can_update` reply and liveness relaunches. A cycle that
//! finds the lock taken is skipped, never queued.

use crate::config::UpdateStrategy;
use crate::coordinator::{CoordinatorEvent, ProcessCoordinator};
use crate::stager::{StagedVersion, Stager};
use crate::target::{ActiveVersion, Target};
use crate::update_client::{CheckOutcome, UpdateClient};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use unattended_common::{Command, UpdateManifest, Version};

/// Where the orchestrator is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Checking,
    Staging,
    Switching,
    Restarting,
    AwaitingPrompt,
}

/// Result of relaunching the managed application after a switch
#[derive(Debug, Clone, PartialEq)]
pub enum RestartOutcome {
    Restarted(Version),
    /// The new version failed to launch; the previous one runs again
    RolledBack { failed: Version, restored: Version },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle held the lock
    Skipped,
    NoUpdates,
    StagingFailed(String),
    /// Updates were advertised but no package survived download and verification
    NothingStaged,
    SwitchFailed(String),
    /// Strategy `off`: the version was switched, the process left alone
    Staged(Version),
    PromptSent(Version),
    PromptFailed(Version),
    Restart(RestartOutcome),
}

pub struct Orchestrator {
    target: Arc<Target>,
    manifests: Vec<UpdateManifest>,
    client: UpdateClient,
    stager: Stager,
    coordinator: Arc<dyn ProcessCoordinator>,
    strategy: UpdateStrategy,
    guard: Mutex<()>,
    phase: watch::Sender<CyclePhase>,
    prompt_pending: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        target: Arc<Target>,
        manifests: Vec<UpdateManifest>,
        client: UpdateClient,
        stager: Stager,
        coordinator: Arc<dyn ProcessCoordinator>,
        strategy: UpdateStrategy,
    ) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            target,
            manifests,
            client,
            stager,
            coordinator,
            strategy,
            guard: Mutex::new(()),
            phase,
            prompt_pending: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    /// Whether a `can_update` query is waiting for its answer
    pub fn prompt_pending(&self) -> bool {
        self.prompt_pending.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.phase.send_replace(phase);
    }

    /// Launch the active version
    pub async fn launch(&self) -> Result<()> {
        let active = self.target.current();
        self.coordinator
            .launch(&active.application_path, self.target.parameters())
            .await
            .with_context(|| format!("Failed to launch version {}", active.version))
    }

    /// Run one full update cycle with the configured strategy. A no-op when
    /// another cycle is in progress.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_with(self.strategy).await
    }

    /// Run one cycle, deciding with `strategy` instead of the configured one
    pub async fn run_cycle_with(&self, strategy: UpdateStrategy) -> CycleOutcome {
        let Ok(_guard) = self.guard.try_lock() else {
            info!("Update cycle already in progress, skipping this trigger");
            return CycleOutcome::Skipped;
        };

        let outcome = self.cycle_locked(strategy).await;
        self.set_phase(CyclePhase::Idle);
        debug!("Update cycle finished: {:?}", outcome);
        outcome
    }

    async fn cycle_locked(&self, strategy: UpdateStrategy) -> CycleOutcome {
        self.set_phase(CyclePhase::Checking);
        let current = self.target.current();
        info!(
            "Checking {} application(s) for updates (running {})",
            self.manifests.len(),
            current.version
        );

        let mut available = Vec::new();
        for manifest in &self.manifests {
            if let CheckOutcome::Available(update) = self.client.check(manifest, &current.directory).await {
                available.push(update);
            }
        }
        if available.is_empty() {
            return CycleOutcome::NoUpdates;
        }

        self.set_phase(CyclePhase::Staging);
        let staged = match self.stager.stage(&available).await {
            Ok(Some(staged)) => staged,
            Ok(None) => return CycleOutcome::NothingStaged,
            Err(e) => {
                error!("Staging failed, staying on {}: {:#}", current.version, e);
                return CycleOutcome::StagingFailed(format!("{:#}", e));
            }
        };

        self.set_phase(CyclePhase::Switching);
        let active = match self.switch_to(&staged) {
            Ok(active) => active,
            Err(outcome) => return outcome,
        };

        match strategy {
            UpdateStrategy::Restart => {
                self.set_phase(CyclePhase::Restarting);
                CycleOutcome::Restart(self.restart_locked(&active).await)
            }
            UpdateStrategy::Prompt => {
                self.set_phase(CyclePhase::AwaitingPrompt);
                self.prompt_pending.store(true, Ordering::SeqCst);
                match self.coordinator.send(Command::CanUpdate).await {
                    Ok(()) => {
                        info!("Version {} ready, asked the application whether it can restart", active.version);
                        CycleOutcome::PromptSent(active.version)
                    }
                    Err(e) => {
                        self.prompt_pending.store(false, Ordering::SeqCst);
                        warn!(
                            "Could not ask the application about {}: {:#}. It will start on the next launch",
                            active.version, e
                        );
                        CycleOutcome::PromptFailed(active.version)
                    }
                }
            }
            UpdateStrategy::Off => {
                info!(
                    "Version {} staged and active for the next launch, automatic restart is off",
                    active.version
                );
                CycleOutcome::Staged(active.version)
            }
        }
    }

    /// Point the target at the freshly staged version. A staged directory the
    /// resolver rejects is deleted so it cannot shadow the good versions on
    /// the next scan or startup.
    fn switch_to(&self, staged: &StagedVersion) -> std::result::Result<Arc<ActiveVersion>, CycleOutcome> {
        let current = self.target.current();
        match self.target.update() {
            Ok(active) => {
                if active.version != staged.version {
                    warn!(
                        "Staged {} but the latest version on disk is {}",
                        staged.version, active.version
                    );
                }
                Ok(active)
            }
            Err(e) if e.is_version_resolution() => {
                error!(
                    "Staged version {} is not runnable, removing it and staying on {}: {}",
                    staged.version, current.version, e
                );
                if let Err(remove) = std::fs::remove_dir_all(&staged.directory) {
                    warn!("Failed to remove {}: {}", staged.directory.display(), remove);
                }
                Err(CycleOutcome::SwitchFailed(e.to_string()))
            }
            Err(e) => {
                error!(
                    "Could not switch to {}, staying on {}: {}",
                    staged.version, current.version, e
                );
                Err(CycleOutcome::SwitchFailed(e.to_string()))
            }
        }
    }

    /// Stop the running process and start `active`. Must hold the guard.
    async fn restart_locked(&self, active: &ActiveVersion) -> RestartOutcome {
        if let Err(e) = self.coordinator.stop().await {
            warn!("Failed to stop managed application cleanly: {:#}", e);
            if self.coordinator.is_running().await {
                error!(
                    "Managed application is still running, not starting {}",
                    active.version
                );
                return RestartOutcome::Failed(format!("stop failed: {:#}", e));
            }
        }

        let launch_error = match self
            .coordinator
            .launch(&active.application_path, self.target.parameters())
            .await
        {
            Ok(()) => {
                info!("Managed application restarted on version {}", active.version);
                return RestartOutcome::Restarted(active.version);
            }
            Err(e) => e,
        };

        error!(
            "Version {} failed to launch: {:#}. Rolling back",
            active.version, launch_error
        );
        let previous = match self.target.rollback() {
            Ok(previous) => previous,
            Err(e) => {
                error!("Rollback from {} failed: {}", active.version, e);
                return RestartOutcome::Failed(format!("{:#}; rollback: {}", launch_error, e));
            }
        };

        match self
            .coordinator
            .launch(&previous.application_path, self.target.parameters())
            .await
        {
            Ok(()) => {
                warn!("Rolled back from {} to {}", active.version, previous.version);
                RestartOutcome::RolledBack {
                    failed: active.version,
                    restored: previous.version,
                }
            }
            Err(e) => {
                error!("Previous version {} also failed to launch: {:#}", previous.version, e);
                RestartOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    /// React to one message from the managed process. Returns the restart
    /// outcome when the message triggered one.
    pub async fn handle_event(&self, event: CoordinatorEvent) -> Option<RestartOutcome> {
        match event {
            CoordinatorEvent::Reply {
                command: Command::CanUpdate,
                result,
            } => {
                if !self.prompt_pending.swap(false, Ordering::SeqCst) {
                    debug!("Ignoring unsolicited can_update reply");
                    return None;
                }
                if result.as_bool() != Some(true) {
                    info!("Managed application declined the restart ({}), not restarting", result);
                    return None;
                }

                let _guard = self.guard.lock().await;
                self.set_phase(CyclePhase::Restarting);
                let active = self.target.current();
                let outcome = self.restart_locked(&active).await;
                self.set_phase(CyclePhase::Idle);
                Some(outcome)
            }
            CoordinatorEvent::Reply { command, result } => {
                debug!("{} -> {}", command, result);
                None
            }
            CoordinatorEvent::Exception { command, message } => {
                if command == Command::CanUpdate {
                    self.prompt_pending.store(false, Ordering::SeqCst);
                }
                warn!("Managed application failed to handle {}: {}", command, message);
                None
            }
            CoordinatorEvent::Exited => {
                info!("Managed application exited");
                self.prompt_pending.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    /// Consume coordinator events until cancelled or the channel closes
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CoordinatorEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Event loop stopped");
    }

    /// Relaunch the active version if the process is gone. Returns whether a
    /// relaunch happened. Does nothing while a cycle or restart holds the lock.
    pub async fn ensure_running(&self) -> bool {
        let Ok(_guard) = self.guard.try_lock() else {
            return false;
        };
        if self.coordinator.is_running().await {
            return false;
        }

        let active = self.target.current();
        warn!(
            "Managed application is not running, launching version {}",
            active.version
        );
        match self
            .coordinator
            .launch(&active.application_path, self.target.parameters())
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Relaunch of {} failed: {:#}", active.version, e);
                false
            }
        }
    }

    pub async fn run_liveness(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.ensure_running().await;
                }
            }
        }
        debug!("Liveness loop stopped");
    }

    /// Stop the managed application, waiting for any cycle in progress
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        self.coordinator.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update_client::SidecarVersionProbe;
    use async_trait::async_trait;
    use serde_json::json;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use unattended_common::VersionFormat;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        running: AtomicBool,
        fail_launch_of: StdMutex<Option<PathBuf>>,
        /// Stop reports an error and leaves the process running
        fail_stop: AtomicBool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ProcessCoordinator for Recorder {
        async fn launch(&self, application: &Path, _parameters: &str) -> Result<()> {
            let dir = application.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
            self.record(format!("launch {}", dir));
            if self.fail_launch_of.lock().unwrap().as_deref() == Some(application) {
                anyhow::bail!("exec format error");
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.record("stop".to_string());
            if self.fail_stop.load(Ordering::SeqCst) {
                anyhow::bail!("process did not exit");
            }
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn send(&self, command: Command) -> Result<()> {
            self.record(format!("send {}", command));
            Ok(())
        }
    }

    fn install(base: &Path, name: &str) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("app"), name).unwrap();
    }

    fn orchestrator(base: &Path, strategy: UpdateStrategy) -> (Arc<Orchestrator>, Arc<Recorder>) {
        let target = Arc::new(Target::with_format(base, "app", "", VersionFormat::default()).unwrap());
        let client = UpdateClient::new("test", "stable", Duration::from_secs(1), Arc::new(SidecarVersionProbe)).unwrap();
        let stager = Stager::new(target.clone(), Duration::from_secs(1)).unwrap();
        let recorder = Arc::new(Recorder::default());
        let orchestrator = Orchestrator::new(target, Vec::new(), client, stager, recorder.clone(), strategy);
        (Arc::new(orchestrator), recorder)
    }

    #[tokio::test]
    async fn test_cycle_without_manifests_is_no_update() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Restart);
        let phases = orchestrator.subscribe();

        assert_eq!(orchestrator.run_cycle().await, CycleOutcome::NoUpdates);
        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        assert!(phases.has_changed().unwrap());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_skipped_while_locked() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, _) = orchestrator(temp.path(), UpdateStrategy::Restart);

        let _held = orchestrator.guard.lock().await;
        assert_eq!(orchestrator.run_cycle().await, CycleOutcome::Skipped);
        assert!(!orchestrator.ensure_running().await);
    }

    #[tokio::test]
    async fn test_unsolicited_reply_is_ignored() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Prompt);

        let reply = CoordinatorEvent::Reply {
            command: Command::CanUpdate,
            result: json!(true),
        };
        assert_eq!(orchestrator.handle_event(reply).await, None);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_affirmative_reply_restarts_on_current_version() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Prompt);

        orchestrator.prompt_pending.store(true, Ordering::SeqCst);
        let outcome = orchestrator
            .handle_event(CoordinatorEvent::Reply {
                command: Command::CanUpdate,
                result: json!(true),
            })
            .await;

        assert!(matches!(outcome, Some(RestartOutcome::Restarted(_))));
        assert_eq!(recorder.calls(), vec!["stop", "launch 20160201.0"]);
        assert!(!orchestrator.prompt_pending());
    }

    #[tokio::test]
    async fn test_negative_reply_and_exception_clear_prompt() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Prompt);

        orchestrator.prompt_pending.store(true, Ordering::SeqCst);
        let outcome = orchestrator
            .handle_event(CoordinatorEvent::Reply {
                command: Command::CanUpdate,
                result: json!(false),
            })
            .await;
        assert_eq!(outcome, None);
        assert!(!orchestrator.prompt_pending());

        orchestrator.prompt_pending.store(true, Ordering::SeqCst);
        orchestrator
            .handle_event(CoordinatorEvent::Exception {
                command: Command::CanUpdate,
                message: "busy".to_string(),
            })
            .await;
        assert!(!orchestrator.prompt_pending());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_rolls_back() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Restart);

        install(temp.path(), "20160201.1");
        let active = orchestrator.target().update().unwrap();
        *recorder.fail_launch_of.lock().unwrap() = Some(active.application_path.clone());

        let _guard = orchestrator.guard.lock().await;
        let outcome = orchestrator.restart_locked(&active).await;

        match outcome {
            RestartOutcome::RolledBack { failed, restored } => {
                assert_eq!(failed.counter, 1);
                assert_eq!(restored.counter, 0);
            }
            other => panic!("expected rollback, got {:?}", other),
        }
        assert_eq!(
            recorder.calls(),
            vec!["stop", "launch 20160201.1", "launch 20160201.0"]
        );
        assert!(orchestrator.target().current_version_directory().ends_with("20160201.0"));
    }

    #[tokio::test]
    async fn test_stuck_process_is_not_replaced_or_rolled_back() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Restart);
        recorder.running.store(true, Ordering::SeqCst);
        recorder.fail_stop.store(true, Ordering::SeqCst);

        install(temp.path(), "20160201.1");
        let active = orchestrator.target().update().unwrap();

        let _guard = orchestrator.guard.lock().await;
        let outcome = orchestrator.restart_locked(&active).await;

        assert!(matches!(outcome, RestartOutcome::Failed(_)));
        assert_eq!(recorder.calls(), vec!["stop"]);
        assert!(orchestrator.target().current_version_directory().ends_with("20160201.1"));
        assert!(temp.path().join("20160201.1").is_dir());
    }

    #[tokio::test]
    async fn test_unrunnable_staged_version_is_removed() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Restart);

        let broken = temp.path().join("20160201.1");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("readme.txt"), "no app here").unwrap();
        let staged = StagedVersion {
            version: VersionFormat::default().parse_directory("20160201.1").unwrap(),
            directory: broken.clone(),
            extracted: vec!["p.zip".to_string()],
            failed: Vec::new(),
        };

        let outcome = orchestrator.switch_to(&staged);

        assert!(matches!(outcome, Err(CycleOutcome::SwitchFailed(_))));
        assert!(!broken.exists());
        assert!(orchestrator.target().current_version_directory().ends_with("20160201.0"));
        assert_eq!(orchestrator.target().update().unwrap().version.counter, 0);
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_running_relaunches() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, recorder) = orchestrator(temp.path(), UpdateStrategy::Restart);

        assert!(orchestrator.ensure_running().await);
        assert!(!orchestrator.ensure_running().await);
        assert_eq!(recorder.calls(), vec!["launch 20160201.0"]);
    }

    #[tokio::test]
    async fn test_event_loop_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        install(temp.path(), "20160201.0");
        let (orchestrator, _) = orchestrator(temp.path(), UpdateStrategy::Prompt);

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(orchestrator.clone().run_events(rx, cancel.clone()));

        tx.send(CoordinatorEvent::Exited).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
