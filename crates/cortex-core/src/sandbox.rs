//! Sandbox executor.
//!
//! Runs a candidate plan step by step under one wall-clock deadline and
//! records the attempt as a [`SandboxExperiment`]. This is a
//! resource-bounded executor, not an isolation boundary: steps run with
//! the caller's privileges and filesystem.
//!
//! Every child is started in its own process group. When the deadline
//! passes the whole group is killed and the child reaped before `run`
//! returns, so nothing the plan started outlives the experiment.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;
use crate::db::experiments::finalize_experiment;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::reinforcement::apply_skill_outcome;
use crate::types::{ExperimentStatus, SandboxExperiment};

/// How long to wait for output pipes to drain after a kill.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Captured result of one finished step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Completed(StepOutput),
    /// The deadline passed; the process is already gone.
    TimedOut { stdout: String, stderr: String },
}

/// Launches one step. Implementations must not return `TimedOut` while
/// anything they started is still running.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_step(&self, command: &str, deadline: Instant) -> Result<StepResult>;
}

/// Runs steps as real child processes.
pub struct ProcessRunner {
    use_shell: bool,
    working_dir: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            use_shell: config.use_shell,
            working_dir: config.working_dir.clone(),
        }
    }

    fn command(&self, step: &str) -> Result<Command> {
        let mut cmd = if self.use_shell {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(step);
            cmd
        } else {
            let mut parts = step.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| Error::Sandbox("empty command".into()))?;
            let mut cmd = Command::new(program);
            cmd.args(parts);
            cmd
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    let Some(handle) = reader else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(Ok(text)) => text,
        _ => {
            abort.abort();
            String::new()
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group id is our own child's.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, "process group already gone");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run_step(&self, command: &str, deadline: Instant) -> Result<StepResult> {
        let mut child = self
            .command(command)?
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to start '{command}': {e}")))?;
        let pid = child.id();
        let stdout = spawn_reader(child.stdout.take());
        let stderr = spawn_reader(child.stderr.take());

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(status) => {
                let status = status?;
                // Anything the step left running in the background dies with it.
                kill_group(pid);
                Ok(StepResult::Completed(StepOutput {
                    exit_code: status.code(),
                    stdout: collect(stdout).await,
                    stderr: collect(stderr).await,
                }))
            }
            Err(_) => {
                kill_group(pid);
                // kill() also waits, which reaps the child.
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "failed to reap timed out step");
                }
                Ok(StepResult::TimedOut {
                    stdout: collect(stdout).await,
                    stderr: collect(stderr).await,
                })
            }
        }
    }
}

/// A plan to validate.
#[derive(Debug, Clone, Default)]
pub struct SandboxPlan {
    pub steps: Vec<String>,
    pub linked_skill_id: Option<i64>,
    pub trigger_record_id: Option<i64>,
}

impl SandboxPlan {
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    pub fn for_skill(mut self, skill_id: i64) -> Self {
        self.linked_skill_id = Some(skill_id);
        self
    }

    pub fn triggered_by(mut self, record_id: i64) -> Self {
        self.trigger_record_id = Some(record_id);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::validation("sandbox plan has no steps"));
        }
        if self.steps.iter().any(|s| s.trim().is_empty()) {
            return Err(Error::validation("sandbox plan contains a blank step"));
        }
        Ok(())
    }
}

pub struct SandboxExecutor {
    db: Arc<Database>,
    runner: Arc<dyn CommandRunner>,
    max_log_bytes: usize,
}

impl SandboxExecutor {
    pub fn new(db: Arc<Database>, config: &SandboxConfig) -> Self {
        Self::with_runner(db, Arc::new(ProcessRunner::new(config)), config.max_log_bytes)
    }

    pub fn with_runner(db: Arc<Database>, runner: Arc<dyn CommandRunner>, max_log_bytes: usize) -> Self {
        Self {
            db,
            runner,
            max_log_bytes,
        }
    }

    /// Execute `plan` within `timeout_ms` and return the finalized experiment.
    ///
    /// The experiment row exists (pending, then running) before the first
    /// step starts and is finalized exactly once. A linked skill receives a
    /// success for `passed` and a failure for every other terminal status,
    /// in the same transaction as the finalization.
    pub async fn run(&self, plan: &SandboxPlan, timeout_ms: u64) -> Result<SandboxExperiment> {
        plan.validate()?;
        if timeout_ms == 0 {
            return Err(Error::validation("timeout_ms must be greater than 0"));
        }

        let id = self
            .db
            .create_experiment(&plan.steps, plan.linked_skill_id, plan.trigger_record_id)?;
        self.db.mark_experiment_running(id)?;
        info!(experiment_id = id, steps = plan.steps.len(), timeout_ms, "sandbox run started");

        let started = Instant::now();
        let deadline = started + Duration::from_millis(timeout_ms);
        let (status, summary, mut logs) = self.execute(&plan.steps, deadline, timeout_ms).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        truncate_log(&mut logs, self.max_log_bytes);

        self.db.transaction(|tx| {
            finalize_experiment(tx, id, status, duration_ms, &summary, &logs)?;
            if let (Some(skill_id), Some(outcome)) = (plan.linked_skill_id, status.outcome()) {
                apply_skill_outcome(tx, skill_id, outcome, Some(duration_ms), Some("sandbox"))?;
            }
            Ok(())
        })?;
        info!(experiment_id = id, status = %status, duration_ms, "sandbox run finished");

        self.db
            .get_experiment(id)?
            .ok_or_else(|| Error::not_found("experiment", id))
    }

    async fn execute(
        &self,
        steps: &[String],
        deadline: Instant,
        timeout_ms: u64,
    ) -> (ExperimentStatus, String, String) {
        let mut logs = String::new();
        for (index, step) in steps.iter().enumerate() {
            let number = index + 1;
            if Instant::now() >= deadline {
                return (
                    ExperimentStatus::TimedOut,
                    format!("deadline of {timeout_ms}ms exceeded before step {number}"),
                    logs,
                );
            }
            logs.push_str(&format!("$ {step}\n"));
            match self.runner.run_step(step, deadline).await {
                Ok(StepResult::Completed(output)) => {
                    append_output(&mut logs, &output.stdout, &output.stderr);
                    match output.exit_code {
                        Some(0) => logs.push_str("[exit 0]\n"),
                        Some(code) => {
                            logs.push_str(&format!("[exit {code}]\n"));
                            return (
                                ExperimentStatus::Failed,
                                format!("step {number} exited with code {code}: {step}"),
                                logs,
                            );
                        }
                        None => {
                            logs.push_str("[killed by signal]\n");
                            return (
                                ExperimentStatus::Failed,
                                format!("step {number} was killed by a signal: {step}"),
                                logs,
                            );
                        }
                    }
                }
                Ok(StepResult::TimedOut { stdout, stderr }) => {
                    append_output(&mut logs, &stdout, &stderr);
                    logs.push_str("[timed out]\n");
                    return (
                        ExperimentStatus::TimedOut,
                        format!("deadline of {timeout_ms}ms exceeded during step {number}: {step}"),
                        logs,
                    );
                }
                Err(e) => {
                    logs.push_str(&format!("[error] {e}\n"));
                    return (ExperimentStatus::Error, e.to_string(), logs);
                }
            }
        }
        (
            ExperimentStatus::Passed,
            format!("{} step(s) passed", steps.len()),
            logs,
        )
    }
}

fn append_output(logs: &mut String, stdout: &str, stderr: &str) {
    for (label, text) in [("stdout", stdout), ("stderr", stderr)] {
        if !text.is_empty() {
            logs.push_str(&format!("[{label}]\n{text}"));
            if !text.ends_with('\n') {
                logs.push('\n');
            }
        }
    }
}

/// Cut `logs` to at most `max` bytes on a char boundary.
fn truncate_log(logs: &mut String, max: usize) {
    const MARKER: &str = "\n[truncated]";
    if logs.len() <= max {
        return;
    }
    let mut cut = max.saturating_sub(MARKER.len());
    while cut > 0 && !logs.is_char_boundary(cut) {
        cut -= 1;
    }
    logs.truncate(cut);
    logs.push_str(MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewSkill, Outcome};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replays canned results and records which steps ran.
    struct ScriptedRunner {
        results: HashMap<String, StepResult>,
        ran: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(results: &[(&str, StepResult)]) -> Self {
            Self {
                results: results
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
                ran: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run_step(&self, command: &str, _deadline: Instant) -> Result<StepResult> {
            self.ran.lock().unwrap().push(command.to_string());
            self.results
                .get(command)
                .cloned()
                .ok_or_else(|| Error::Sandbox(format!("unknown step {command}")))
        }
    }

    fn exit(code: i32) -> StepResult {
        StepResult::Completed(StepOutput {
            exit_code: Some(code),
            stdout: "out".into(),
            stderr: String::new(),
        })
    }

    fn steps(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn shell_config() -> SandboxConfig {
        SandboxConfig {
            use_shell: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stops_on_first_failure() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runner = Arc::new(ScriptedRunner::new(&[
            ("build", exit(0)),
            ("test", exit(2)),
            ("deploy", exit(0)),
        ]));
        let executor = SandboxExecutor::with_runner(db.clone(), runner.clone(), 4096);

        let experiment = executor
            .run(&SandboxPlan::new(steps(&["build", "test", "deploy"])), 1_000)
            .await
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Failed);
        assert_eq!(*runner.ran.lock().unwrap(), steps(&["build", "test"]));
        assert!(experiment.exit_summary.unwrap().contains("code 2"));
        assert!(experiment.logs.unwrap().contains("[exit 2]"));
    }

    #[tokio::test]
    async fn test_linked_skill_reinforced_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let skill_id = db
            .insert_skill(&NewSkill::new("ok", steps(&["build"])))
            .unwrap();
        let runner = Arc::new(ScriptedRunner::new(&[("build", exit(0))]));
        let executor = SandboxExecutor::with_runner(db.clone(), runner, 4096);

        let experiment = executor
            .run(&SandboxPlan::new(steps(&["build"])).for_skill(skill_id), 1_000)
            .await
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Passed);
        assert_eq!(experiment.linked_skill_id, Some(skill_id));

        let skill = db.get_skill(skill_id).unwrap().unwrap();
        assert_eq!((skill.success_count, skill.failure_count), (1, 0));
        assert_eq!(skill.confidence, 2.0 / 3.0);
    }

    #[tokio::test]
    async fn test_runner_error_counts_as_failure() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let skill_id = db
            .insert_skill(&NewSkill::new("broken", steps(&["missing"])))
            .unwrap();
        let executor = SandboxExecutor::with_runner(db.clone(), Arc::new(ScriptedRunner::new(&[])), 4096);

        let experiment = executor
            .run(&SandboxPlan::new(steps(&["missing"])).for_skill(skill_id), 1_000)
            .await
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Error);
        assert_eq!(experiment.status.outcome(), Some(Outcome::Failure));
        assert_eq!(db.get_skill(skill_id).unwrap().unwrap().failure_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_plans_write_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = SandboxExecutor::new(db.clone(), &SandboxConfig::default());
        assert!(executor.run(&SandboxPlan::new(vec![]), 100).await.unwrap_err().is_validation());
        assert!(executor
            .run(&SandboxPlan::new(steps(&["  "])), 100)
            .await
            .unwrap_err()
            .is_validation());
        assert!(executor
            .run(&SandboxPlan::new(steps(&["true"])), 0)
            .await
            .unwrap_err()
            .is_validation());
        assert!(db.list_experiments(10).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_real_process_pass_and_fail() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = SandboxExecutor::new(db.clone(), &SandboxConfig::default());

        let passed = executor
            .run(&SandboxPlan::new(steps(&["echo hello"])), 5_000)
            .await
            .unwrap();
        assert_eq!(passed.status, ExperimentStatus::Passed);
        assert!(passed.logs.unwrap().contains("hello"));

        let failed = executor
            .run(&SandboxPlan::new(steps(&["true", "false", "echo unreachable"])), 5_000)
            .await
            .unwrap();
        assert_eq!(failed.status, ExperimentStatus::Failed);
        assert!(!failed.logs.unwrap().contains("unreachable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unknown_program_is_error() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = SandboxExecutor::new(db, &SandboxConfig::default());
        let experiment = executor
            .run(&SandboxPlan::new(steps(&["cortex-no-such-binary --flag"])), 5_000)
            .await
            .unwrap();
        assert_eq!(experiment.status, ExperimentStatus::Error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = SandboxExecutor::new(db.clone(), &shell_config());

        let plan = SandboxPlan::new(vec![format!("sleep 1 && touch {}", marker.display())]);
        let started = std::time::Instant::now();
        let experiment = executor.run(&plan, 100).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(experiment.status, ExperimentStatus::TimedOut);
        assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");

        // The shell and its sleep were killed: the marker never appears.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_children_killed_after_step_exits() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let db = Arc::new(Database::open_in_memory().unwrap());
        let executor = SandboxExecutor::new(db, &shell_config());

        let plan = SandboxPlan::new(vec![format!("(sleep 1; touch {}) &", marker.display())]);
        let started = std::time::Instant::now();
        let experiment = executor.run(&plan, 5_000).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(experiment.status, ExperimentStatus::Passed);
        assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_truncate_log_on_char_boundary() {
        let mut logs = "é".repeat(100);
        truncate_log(&mut logs, 51);
        assert!(logs.len() <= 51);
        assert!(logs.ends_with("[truncated]"));

        let mut short = "ok".to_string();
        truncate_log(&mut short, 51);
        assert_eq!(short, "ok");
    }
}
