//! Redeem-all supervisor: keeps one workflow type continuously fed.
//!
//! While enabled, every tick checks whether anything is still eligible, whether a
//! task of the type is already running, and otherwise makes sure the agent's
//! execution surface is open at the entry point that starts the next task.
//! Once a task finishes the surface is pointed back at the entry point, since
//! the page it ends on carries no way to the next task.
//! The toggle lives in memory only; a restart comes back disabled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anycards::model::Anycard;
use crate::config::SupervisorConfig;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::tasks::model::TaskType;

/// Re-point an armed surface at least this many ticks apart while no task runs.
const REARM_TICKS: u32 = 6;

/// Opens the agent's execution surface at `url`, or points the open one back at it.
#[async_trait]
pub trait SurfaceLauncher: Send + Sync {
    async fn arm(&self, url: &str) -> Result<(), String>;
}

/// Launches the surface by running a command with the entry URL appended.
///
/// The first spawned process is the surface. While it is alive, arming runs the
/// command again with the URL, which a browser hands to its running instance.
/// Once the surface exits the next `arm` starts a new one.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    launched: AtomicUsize,
}

impl CommandLauncher {
    /// Parse a whitespace-separated command line, e.g. `chromium --new-window`.
    pub fn from_command_line(cmd: &str) -> Option<Self> {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            child: Mutex::new(None),
            launched: AtomicUsize::new(0),
        })
    }

    fn spawn(&self, url: &str) -> Result<Child, String> {
        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| format!("Failed to launch {}: {e}", self.program))?;
        self.launched.fetch_add(1, Ordering::Relaxed);
        Ok(spawned)
    }
}

#[async_trait]
impl SurfaceLauncher for CommandLauncher {
    async fn arm(&self, url: &str) -> Result<(), String> {
        let mut child = self.child.lock().await;
        if let Some(running) = child.as_mut() {
            match running.try_wait() {
                Ok(None) => {
                    self.spawn(url)?;
                    info!(program = %self.program, url = url, "Surface pointed at entry");
                    return Ok(());
                }
                Ok(Some(status)) => debug!(%status, "Surface process exited"),
                Err(e) => warn!(error = %e, "Failed to poll surface process"),
            }
        }

        *child = Some(self.spawn(url)?);
        info!(
            program = %self.program,
            url = url,
            launches = self.launched.load(Ordering::Relaxed),
            "Surface launched"
        );
        Ok(())
    }
}

/// Launcher used when no command is configured. Arming always fails, so an
/// enabled supervisor reports why it stopped.
pub struct NoLauncher;

#[async_trait]
impl SurfaceLauncher for NoLauncher {
    async fn arm(&self, _url: &str) -> Result<(), String> {
        Err("No surface launcher configured (set REDEEM_ALL_BROWSER_CMD)".to_string())
    }
}

/// What a single tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    /// Supervisor is off; nothing was checked.
    Disabled,
    /// Nothing eligible remains; the supervisor turned itself off.
    Finished,
    /// A task of the type is running; left alone.
    Busy,
    /// The surface is open at the entry point.
    Armed,
    /// Armed recently and no task has run since; left alone.
    Waiting,
    /// The surface could not be opened; the supervisor turned itself off.
    LaunchFailed,
    /// Eligibility could not be read; retried next tick.
    Error,
}

/// Snapshot served at `GET /api/redeem-all`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemAllStatus {
    pub enabled: bool,
    pub task_type: TaskType,
    pub entry_url: String,
    pub last_outcome: Option<TickOutcome>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct TickRecord {
    outcome: Option<TickOutcome>,
    at: Option<DateTime<Utc>>,
    error: Option<String>,
    armed_at: Option<Instant>,
}

pub struct RedeemAllSupervisor {
    db: Arc<dyn Database>,
    launcher: Arc<dyn SurfaceLauncher>,
    config: SupervisorConfig,
    enabled: AtomicBool,
    record: RwLock<TickRecord>,
}

impl RedeemAllSupervisor {
    pub fn new(
        db: Arc<dyn Database>,
        launcher: Arc<dyn SurfaceLauncher>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            launcher,
            config,
            enabled: AtomicBool::new(false),
            record: RwLock::new(TickRecord::default()),
        })
    }

    /// Build with the launcher named by the config.
    pub fn from_config(db: Arc<dyn Database>, config: SupervisorConfig) -> Arc<Self> {
        let launcher: Arc<dyn SurfaceLauncher> = match config
            .browser_cmd
            .as_deref()
            .and_then(CommandLauncher::from_command_line)
        {
            Some(cmd) => Arc::new(cmd),
            None => Arc::new(NoLauncher),
        };
        Self::new(db, launcher, config)
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> RedeemAllStatus {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!(task_type = %self.config.task_type, "Redeem-all started");
        }
        self.record.write().await.error = None;
        self.status().await
    }

    /// Stop feeding new work. A task already IN_PROGRESS is left to finish.
    pub async fn stop(&self) -> RedeemAllStatus {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!(task_type = %self.config.task_type, "Redeem-all stopped");
        }
        self.status().await
    }

    pub async fn status(&self) -> RedeemAllStatus {
        let record = self.record.read().await;
        RedeemAllStatus {
            enabled: self.is_enabled(),
            task_type: self.config.task_type,
            entry_url: self.entry_url().unwrap_or_else(|_| self.config.entry_url.clone()),
            last_outcome: record.outcome,
            last_tick_at: record.at,
            last_error: record.error.clone(),
        }
    }

    /// `<entry_url>?task_type=<code>`, keeping any query the base already has.
    pub fn entry_url(&self) -> Result<String, String> {
        let mut url = url::Url::parse(&self.config.entry_url)
            .map_err(|e| format!("Invalid entry URL {}: {e}", self.config.entry_url))?;
        url.query_pairs_mut()
            .append_pair("task_type", self.config.task_type.code());
        Ok(url.to_string())
    }

    async fn eligible_count(&self) -> Result<usize, DatabaseError> {
        let cards = self.db.list_anycards().await?;
        let eligible: fn(&Anycard) -> bool = match self.config.task_type {
            TaskType::GetmybonusAnycard => Anycard::is_redeemable,
            TaskType::AnycardLoad => Anycard::is_loadable,
        };
        Ok(cards.iter().filter(|c| eligible(c)).count())
    }

    async fn finish_tick(&self, outcome: TickOutcome, error: Option<String>) -> TickOutcome {
        let mut record = self.record.write().await;
        record.outcome = Some(outcome);
        record.at = Some(Utc::now());
        if error.is_some() {
            record.error = error;
        }
        match outcome {
            TickOutcome::Armed => record.armed_at = Some(Instant::now()),
            TickOutcome::Waiting => {}
            _ => record.armed_at = None,
        }
        outcome
    }

    /// Run one supervision step.
    pub async fn tick(&self) -> TickOutcome {
        if !self.is_enabled() {
            return TickOutcome::Disabled;
        }
        let task_type = self.config.task_type;

        let eligible = match self.eligible_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Redeem-all could not read eligible anycards");
                return self.finish_tick(TickOutcome::Error, Some(e.to_string())).await;
            }
        };
        if eligible == 0 {
            self.enabled.store(false, Ordering::SeqCst);
            info!(task_type = %task_type, "Redeem-all finished, nothing eligible");
            return self.finish_tick(TickOutcome::Finished, None).await;
        }

        match self.db.has_in_progress(task_type).await {
            Ok(true) => {
                debug!(task_type = %task_type, "Redeem-all waiting on in-progress task");
                return self.finish_tick(TickOutcome::Busy, None).await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Redeem-all could not read in-progress tasks");
                return self.finish_tick(TickOutcome::Error, Some(e.to_string())).await;
            }
        }

        // Re-point unless armed recently with no task run since.
        let rearm_after = self.config.interval * REARM_TICKS;
        let armed_at = self.record.read().await.armed_at;
        if armed_at.is_some_and(|at| at.elapsed() < rearm_after) {
            return self.finish_tick(TickOutcome::Waiting, None).await;
        }

        let armed = match self.entry_url() {
            Ok(url) => self.launcher.arm(&url).await,
            Err(e) => Err(e),
        };
        match armed {
            Ok(()) => {
                debug!(task_type = %task_type, eligible, "Redeem-all surface armed");
                self.finish_tick(TickOutcome::Armed, None).await
            }
            Err(e) => {
                self.enabled.store(false, Ordering::SeqCst);
                warn!(error = %e, "Redeem-all stopped, surface could not be opened");
                self.finish_tick(TickOutcome::LaunchFailed, Some(e)).await
            }
        }
    }
}

/// Spawn the supervisor loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop the loop.
pub fn spawn_redeem_all_loop(
    supervisor: Arc<RedeemAllSupervisor>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = supervisor.interval().as_secs(),
            "Redeem-all loop started"
        );
        let mut tick = tokio::time::interval(supervisor.interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Redeem-all loop shutting down");
                break;
            }
            supervisor.tick().await;
        }
    });

    (handle, shutdown_flag)
}

async fn get_status(State(supervisor): State<Arc<RedeemAllSupervisor>>) -> Response {
    Json(supervisor.status().await).into_response()
}

async fn start(State(supervisor): State<Arc<RedeemAllSupervisor>>) -> Response {
    Json(supervisor.start().await).into_response()
}

async fn stop(State(supervisor): State<Arc<RedeemAllSupervisor>>) -> Response {
    Json(supervisor.stop().await).into_response()
}

/// Build the redeem-all toggle routes.
pub fn redeem_all_routes(supervisor: Arc<RedeemAllSupervisor>) -> Router {
    Router::new()
        .route("/api/redeem-all", get(get_status))
        .route("/api/redeem-all/start", post(start))
        .route("/api/redeem-all/stop", post(stop))
        .with_state(supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anycards::model::AnycardType;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::{TaskStatus, TaskType};
    use crate::tasks::queue::DispatchQueue;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingLauncher {
        urls: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SurfaceLauncher for RecordingLauncher {
        async fn arm(&self, url: &str) -> Result<(), String> {
            self.urls.lock().unwrap().push(url.to_string());
            if self.fail {
                Err("tab blocked".into())
            } else {
                Ok(())
            }
        }
    }

    async fn setup(fail: bool) -> (Arc<dyn Database>, Arc<RecordingLauncher>, Arc<RedeemAllSupervisor>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let launcher = Arc::new(RecordingLauncher {
            fail,
            ..Default::default()
        });
        let supervisor =
            RedeemAllSupervisor::new(db.clone(), launcher.clone(), SupervisorConfig::default());
        (db, launcher, supervisor)
    }

    #[tokio::test]
    async fn disabled_supervisor_does_nothing() {
        let (_db, launcher, supervisor) = setup(false).await;
        assert_eq!(supervisor.tick().await, TickOutcome::Disabled);
        assert!(launcher.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_eligible_disables_without_tasks() {
        let (db, launcher, supervisor) = setup(false).await;
        supervisor.start().await;

        assert_eq!(supervisor.tick().await, TickOutcome::Finished);
        assert!(!supervisor.is_enabled());
        assert!(db.list_tasks().await.unwrap().is_empty());
        assert!(launcher.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn arms_entry_point_when_idle() {
        let (db, launcher, supervisor) = setup(false).await;
        db.insert_anycard(&Anycard::new("6001", AnycardType::Celebrate).with_needs_redeem(true))
            .await
            .unwrap();
        supervisor.start().await;

        assert_eq!(supervisor.tick().await, TickOutcome::Armed);
        assert_eq!(
            launcher.urls.lock().unwrap().as_slice(),
            ["https://getmybonus.ca/?task_type=getmybonus_anycard"]
        );
        assert!(supervisor.is_enabled());
    }

    #[tokio::test]
    async fn finished_task_points_surface_back_at_entry() {
        let (db, launcher, supervisor) = setup(false).await;
        for number in ["6001", "6002"] {
            db.insert_anycard(&Anycard::new(number, AnycardType::Celebrate).with_needs_redeem(true))
                .await
                .unwrap();
        }
        let queue = DispatchQueue::new(db.clone());
        supervisor.start().await;

        assert_eq!(supervisor.tick().await, TickOutcome::Armed);
        // Just armed, nothing ran yet.
        assert_eq!(supervisor.tick().await, TickOutcome::Waiting);
        assert_eq!(launcher.urls.lock().unwrap().len(), 1);

        let task = queue
            .enqueue(TaskType::GetmybonusAnycard, json!({"cardNumber": "6001"}))
            .await
            .unwrap();
        queue.next(TaskType::GetmybonusAnycard).await.unwrap().unwrap();
        assert_eq!(supervisor.tick().await, TickOutcome::Busy);

        queue.complete(task.id, json!({})).await.unwrap();
        assert_eq!(supervisor.tick().await, TickOutcome::Armed);
        assert_eq!(
            launcher.urls.lock().unwrap().as_slice(),
            [
                "https://getmybonus.ca/?task_type=getmybonus_anycard",
                "https://getmybonus.ca/?task_type=getmybonus_anycard"
            ]
        );
    }

    #[tokio::test]
    async fn command_launcher_repoints_a_running_surface() {
        let launcher = CommandLauncher::from_command_line("sleep").unwrap();
        launcher.arm("5").await.unwrap();
        let first = launcher.child.lock().await.as_ref().and_then(|c| c.id());
        assert!(first.is_some());

        launcher.arm("5").await.unwrap();
        assert_eq!(launcher.launched.load(Ordering::Relaxed), 2);
        let mut child = launcher.child.lock().await;
        assert_eq!(child.as_ref().and_then(|c| c.id()), first);
        child.as_mut().unwrap().kill().await.unwrap();
    }

    #[tokio::test]
    async fn in_progress_task_means_busy() {
        let (db, launcher, supervisor) = setup(false).await;
        db.insert_anycard(&Anycard::new("6001", AnycardType::Celebrate).with_needs_redeem(true))
            .await
            .unwrap();
        let queue = DispatchQueue::new(db.clone());
        queue
            .enqueue(TaskType::GetmybonusAnycard, json!({}))
            .await
            .unwrap();
        let leased = queue.next(TaskType::GetmybonusAnycard).await.unwrap().unwrap();
        assert_eq!(leased.status, TaskStatus::InProgress);

        supervisor.start().await;
        assert_eq!(supervisor.tick().await, TickOutcome::Busy);
        assert!(launcher.urls.lock().unwrap().is_empty());

        // Stopping leaves the running task alone.
        supervisor.stop().await;
        assert_eq!(
            queue.get(leased.id).await.unwrap().status,
            TaskStatus::InProgress
        );
    }

    #[tokio::test]
    async fn launch_failure_disables_and_records_error() {
        let (db, _launcher, supervisor) = setup(true).await;
        db.insert_anycard(&Anycard::new("6001", AnycardType::Celebrate).with_needs_redeem(true))
            .await
            .unwrap();
        supervisor.start().await;

        assert_eq!(supervisor.tick().await, TickOutcome::LaunchFailed);
        let status = supervisor.status().await;
        assert!(!status.enabled);
        assert_eq!(status.last_error.as_deref(), Some("tab blocked"));

        // Restarting clears the error.
        assert!(supervisor.start().await.last_error.is_none());
    }

    #[tokio::test]
    async fn load_supervisor_counts_funded_cards() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let launcher = Arc::new(RecordingLauncher::default());
        let config = SupervisorConfig {
            task_type: TaskType::AnycardLoad,
            ..SupervisorConfig::default()
        };
        let supervisor = RedeemAllSupervisor::new(db.clone(), launcher, config);
        db.insert_anycard(&Anycard::new("7001", AnycardType::Celebrate).with_balance("10"))
            .await
            .unwrap();
        supervisor.start().await;
        // No PIN, so not loadable.
        assert_eq!(supervisor.tick().await, TickOutcome::Finished);
    }

    #[tokio::test]
    async fn no_launcher_reports_why() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_anycard(&Anycard::new("6001", AnycardType::Celebrate).with_needs_redeem(true))
            .await
            .unwrap();
        let supervisor = RedeemAllSupervisor::from_config(db, SupervisorConfig::default());
        supervisor.start().await;
        assert_eq!(supervisor.tick().await, TickOutcome::LaunchFailed);
        assert!(supervisor.status().await.last_error.unwrap().contains("REDEEM_ALL_BROWSER_CMD"));
    }

    #[test]
    fn command_line_parsing() {
        let launcher = CommandLauncher::from_command_line("chromium --new-window").unwrap();
        assert_eq!(launcher.program, "chromium");
        assert_eq!(launcher.args, vec!["--new-window".to_string()]);
        assert!(CommandLauncher::from_command_line("   ").is_none());
    }
}
