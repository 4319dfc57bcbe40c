//! Tracked background operations.
//!
//! Every long-running action (create, start, stop, rebuild, ...) is an
//! [`Operation`] with a typed status and a [`CancellationToken`]. A project
//! runs at most one operation at a time; a second request is rejected with
//! [`DashboardError::Conflict`]. The push channel only observes transitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::{CommandExecutor, CommandOutput, CommandSpec, OutputLine};
use super::models::{Operation, OperationKind, OperationStatus, OperationStep};
use super::ws::{WsEvent, broadcast_event};
use crate::errors::{DashboardError, DashboardResult, ExecError};

/// Finished operations kept for `GET /api/operations`.
const FINISHED_RETENTION: usize = 100;

struct Entry {
    op: Operation,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    /// project name → id of its in-flight operation
    busy: HashMap<String, String>,
}

pub struct OperationRegistry {
    inner: Mutex<Inner>,
    events: broadcast::Sender<String>,
}

impl OperationRegistry {
    pub fn new(events: broadcast::Sender<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the map is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pending operation and take the project's lock.
    pub fn begin(self: &Arc<Self>, project: &str, kind: OperationKind) -> DashboardResult<OperationHandle> {
        let mut inner = self.lock();
        if let Some(existing) = inner.busy.get(project) {
            let running = inner
                .entries
                .get(existing)
                .map(|e| e.op.kind.as_str())
                .unwrap_or("another");
            return Err(DashboardError::Conflict(format!(
                "Project '{}' already has a {} operation in progress",
                project, running
            )));
        }

        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let op = Operation {
            id: id.clone(),
            project: project.to_string(),
            kind,
            status: OperationStatus::Pending,
            steps: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        inner.busy.insert(project.to_string(), id.clone());
        inner.entries.insert(
            id.clone(),
            Entry {
                op,
                cancel: cancel.clone(),
            },
        );
        prune_finished(&mut inner);
        drop(inner);

        tracing::info!(operation_id = %id, project, kind = kind.as_str(), "operation started");
        Ok(OperationHandle {
            id,
            project: project.to_string(),
            registry: Arc::clone(self),
            cancel,
            finished: false,
        })
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.lock().entries.get(id).map(|e| e.op.clone())
    }

    /// All known operations, newest first.
    pub fn list(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self.lock().entries.values().map(|e| e.op.clone()).collect();
        ops.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        ops
    }

    pub fn is_busy(&self, project: &str) -> bool {
        self.lock().busy.contains_key(project)
    }

    /// Request cancellation. The task observes the token and finishes as `cancelled`.
    pub fn cancel(&self, id: &str) -> DashboardResult<Operation> {
        let inner = self.lock();
        let entry = inner
            .entries
            .get(id)
            .ok_or_else(|| DashboardError::NotFound(format!("Operation '{}'", id)))?;
        if entry.op.status.is_finished() {
            return Err(DashboardError::Conflict(format!(
                "Operation '{}' has already finished",
                id
            )));
        }
        entry.cancel.cancel();
        tracing::info!(operation_id = %id, "operation cancellation requested");
        Ok(entry.op.clone())
    }

    pub fn events(&self) -> &broadcast::Sender<String> {
        &self.events
    }

    fn with_op<R>(&self, id: &str, f: impl FnOnce(&mut Operation) -> R) -> Option<R> {
        self.lock().entries.get_mut(id).map(|e| f(&mut e.op))
    }

    fn finish(&self, id: &str, project: &str, status: OperationStatus, error: Option<String>) {
        let op = {
            let mut inner = self.lock();
            if inner.busy.get(project).is_some_and(|owner| owner == id) {
                inner.busy.remove(project);
            }
            inner.entries.get_mut(id).map(|e| {
                e.op.status = status;
                e.op.error = error;
                e.op.finished_at = Some(Utc::now());
                e.op.clone()
            })
        };
        if let Some(operation) = op {
            match status {
                OperationStatus::Failed => tracing::warn!(
                    operation_id = %id,
                    project,
                    error = operation.error.as_deref().unwrap_or(""),
                    "operation failed"
                ),
                _ => tracing::info!(operation_id = %id, project, status = ?status, "operation finished"),
            }
            broadcast_event(&self.events, &WsEvent::OperationComplete { operation });
        }
    }
}

fn prune_finished(inner: &mut Inner) {
    let mut finished: Vec<(String, chrono::DateTime<Utc>)> = inner
        .entries
        .values()
        .filter(|e| e.op.status.is_finished())
        .map(|e| (e.op.id.clone(), e.op.started_at))
        .collect();
    if finished.len() <= FINISHED_RETENTION {
        return;
    }
    finished.sort_by(|a, b| a.1.cmp(&b.1));
    let excess = finished.len() - FINISHED_RETENTION;
    for (id, _) in finished.into_iter().take(excess) {
        inner.entries.remove(&id);
    }
}

/// Owned by the task running an operation. Dropping an unfinished handle
/// marks the operation failed and releases the project lock.
pub struct OperationHandle {
    id: String,
    project: String,
    registry: Arc<OperationRegistry>,
    cancel: CancellationToken,
    finished: bool,
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("finished", &self.finished)
            .finish()
    }
}

impl OperationHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a new step and announce it.
    pub fn step(&self, name: &str) {
        let step = OperationStep {
            name: name.to_string(),
            started_at: Utc::now(),
        };
        self.registry.with_op(&self.id, |op| {
            op.status = OperationStatus::Running;
            op.steps.push(step.clone());
        });
        tracing::debug!(operation_id = %self.id, step = name, "operation step");
        broadcast_event(
            &self.registry.events,
            &WsEvent::OperationStep {
                operation_id: self.id.clone(),
                project: self.project.clone(),
                step,
            },
        );
    }

    pub fn log(&self, message: impl Into<String>) {
        broadcast_event(
            &self.registry.events,
            &WsEvent::OperationLog {
                operation_id: self.id.clone(),
                project: self.project.clone(),
                message: message.into(),
            },
        );
    }

    /// Run a command, streaming its output as `command_output` events.
    /// Non-zero exits are returned as [`ExecError::NonZeroExit`].
    pub async fn exec(
        &self,
        executor: &dyn CommandExecutor,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, ExecError> {
        self.log(format!("$ {}", spec.display()));
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_output(
            rx,
            self.registry.events.clone(),
            self.project.clone(),
            Some(self.id.clone()),
        ));
        let result = executor.run_streaming(spec, tx, self.token()).await;
        let _ = forwarder.await;
        result.and_then(CommandOutput::into_result)
    }

    pub fn succeed(mut self) {
        self.finished = true;
        self.registry
            .finish(&self.id, &self.project, OperationStatus::Succeeded, None);
    }

    pub fn fail(mut self, error: impl Into<String>) {
        self.finished = true;
        self.registry
            .finish(&self.id, &self.project, OperationStatus::Failed, Some(error.into()));
    }

    pub fn cancelled(mut self) {
        self.finished = true;
        self.registry.finish(
            &self.id,
            &self.project,
            OperationStatus::Cancelled,
            Some("Cancelled by user".to_string()),
        );
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.finish(
                &self.id,
                &self.project,
                OperationStatus::Failed,
                Some("Operation ended unexpectedly".to_string()),
            );
        }
    }
}

/// Publish each output line as a `command_output` event.
pub async fn forward_output(
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    events: broadcast::Sender<String>,
    project: String,
    operation_id: Option<String>,
) {
    while let Some(line) = rx.recv().await {
        broadcast_event(
            &events,
            &WsEvent::CommandOutput {
                project: project.clone(),
                operation_id: operation_id.clone(),
                stream: line.stream().to_string(),
                line: line.text().to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::executor::testing::{Scripted, ScriptedExecutor};
    use std::time::Duration;

    fn registry() -> (Arc<OperationRegistry>, broadcast::Receiver<String>) {
        let (tx, rx) = broadcast::channel(256);
        (OperationRegistry::new(tx), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    #[test]
    fn test_second_operation_on_same_project_conflicts() {
        let (ops, _rx) = registry();
        let first = ops.begin("demo", OperationKind::Start).unwrap();
        let err = ops.begin("demo", OperationKind::Stop).unwrap_err();
        assert!(matches!(err, DashboardError::Conflict(msg) if msg.contains("start")));
        assert!(format!("{:?}", first).contains("\"demo\""));

        // Other projects are unaffected.
        let other = ops.begin("other", OperationKind::Start).unwrap();
        other.succeed();

        first.succeed();
        assert!(!ops.is_busy("demo"));
        ops.begin("demo", OperationKind::Stop).unwrap().succeed();
    }

    #[test]
    fn test_lifecycle_and_events() {
        let (ops, mut rx) = registry();
        let handle = ops.begin("demo", OperationKind::Rebuild).unwrap();
        let id = handle.id().to_string();
        assert_eq!(ops.get(&id).unwrap().status, OperationStatus::Pending);

        handle.step("Building images");
        assert_eq!(ops.get(&id).unwrap().status, OperationStatus::Running);
        handle.log("hello");
        handle.fail("build failed");

        let op = ops.get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("build failed"));
        assert_eq!(op.steps.len(), 1);
        assert!(op.finished_at.is_some());

        let events = drain(&mut rx);
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["operation_step", "operation_log", "operation_complete"]);
        assert_eq!(events[2]["data"]["operation"]["status"], "failed");
    }

    #[test]
    fn test_dropped_handle_releases_lock() {
        let (ops, _rx) = registry();
        let handle = ops.begin("demo", OperationKind::Start).unwrap();
        let id = handle.id().to_string();
        drop(handle);
        assert!(!ops.is_busy("demo"));
        assert_eq!(ops.get(&id).unwrap().status, OperationStatus::Failed);
    }

    #[test]
    fn test_cancel_unknown_and_finished() {
        let (ops, _rx) = registry();
        assert!(matches!(ops.cancel("nope"), Err(DashboardError::NotFound(_))));

        let handle = ops.begin("demo", OperationKind::Start).unwrap();
        let id = handle.id().to_string();
        handle.succeed();
        assert!(matches!(ops.cancel(&id), Err(DashboardError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_exec_streams_command_output() {
        let (ops, mut rx) = registry();
        let executor = ScriptedExecutor::new();
        executor.on("up -d", Scripted::ok("Container demo-app-1 Started"));
        let handle = ops.begin("demo", OperationKind::Start).unwrap();

        let spec = CommandSpec::new("docker").args(["compose", "up", "-d"]);
        handle.exec(&executor, &spec).await.unwrap();
        handle.succeed();

        let events = drain(&mut rx);
        let output = events
            .iter()
            .find(|e| e["type"] == "command_output")
            .expect("command_output event");
        assert_eq!(output["data"]["line"], "Container demo-app-1 Started");
        assert_eq!(output["data"]["project"], "demo");
    }

    #[tokio::test]
    async fn test_exec_non_zero_exit_is_error() {
        let (ops, _rx) = registry();
        let executor = ScriptedExecutor::new();
        executor.on("build", Scripted::fail(1, "no space left"));
        let handle = ops.begin("demo", OperationKind::Rebuild).unwrap();
        let err = handle
            .exec(&executor, &CommandSpec::new("docker").arg("build"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { stderr, .. } if stderr == "no space left"));
        handle.fail("x");
    }

    #[tokio::test]
    async fn test_cancel_stops_running_command() {
        let (ops, _rx) = registry();
        let executor = ScriptedExecutor::with_delay(Duration::from_secs(10));
        let handle = ops.begin("demo", OperationKind::Start).unwrap();
        let id = handle.id().to_string();

        let ops_for_cancel = Arc::clone(&ops);
        let cancel_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ops_for_cancel.cancel(&cancel_id).unwrap();
        });

        let err = handle
            .exec(&executor, &CommandSpec::new("docker").arg("up"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Cancelled));
        handle.cancelled();
        assert_eq!(ops.get(&id).unwrap().status, OperationStatus::Cancelled);
    }

    #[test]
    fn test_list_is_newest_first() {
        let (ops, _rx) = registry();
        let a = ops.begin("a", OperationKind::Start).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let b = ops.begin("b", OperationKind::Stop).unwrap();
        let list = ops.list();
        assert_eq!(list[0].id, b.id());
        assert_eq!(list[1].id, a.id());
        a.succeed();
        b.succeed();
    }
}
