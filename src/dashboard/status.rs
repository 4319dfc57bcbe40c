//! Live project state: container probing, the background poller and
//! Laravel queue/schedule inspection.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::compose::{ComposeClient, ContainerInfo, derive_status};
use super::executor::CommandOutput;
use super::models::{ProjectRecord, ProjectStatus, Template};
use super::operations::OperationRegistry;
use super::store::ProjectStore;
use super::ws::{WsEvent, broadcast_event};
use crate::errors::{DashboardError, DashboardResult, StatusError};

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: ProjectStatus,
    pub containers: Vec<ContainerInfo>,
}

#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, record: &ProjectRecord) -> Result<ProbeResult, StatusError>;
}

/// Probes with `docker compose ps`.
pub struct ComposeStatusProbe {
    compose: ComposeClient,
}

impl ComposeStatusProbe {
    pub fn new(compose: ComposeClient) -> Self {
        Self { compose }
    }
}

#[async_trait]
impl StatusProbe for ComposeStatusProbe {
    async fn probe(&self, record: &ProjectRecord) -> Result<ProbeResult, StatusError> {
        let containers = self.compose.ps(&record.path).await?;
        Ok(ProbeResult {
            status: derive_status(&containers),
            containers,
        })
    }
}

// ── Poller ───────────────────────────────────────────────────────────

pub struct Poller {
    pub store: Arc<ProjectStore>,
    pub probe: Arc<dyn StatusProbe>,
    pub operations: Arc<OperationRegistry>,
    pub events: broadcast::Sender<String>,
    pub interval: Duration,
}

impl Poller {
    /// Probe every idle project once. Returns how many records changed.
    pub async fn poll_once(&self) -> usize {
        let mut changed = 0;
        for record in self.store.list().await {
            if record.status.is_transitional() || self.operations.is_busy(&record.name) {
                continue;
            }
            let (status, error) = match self.probe.probe(&record).await {
                Ok(result) => (result.status, None),
                Err(StatusError::ComposeFileMissing(dir)) => (
                    ProjectStatus::Error,
                    Some(format!("docker-compose.yml missing in {}", dir.display())),
                ),
                Err(StatusError::DockerUnavailable(reason)) => {
                    tracing::debug!(project = %record.name, reason, "docker unavailable; skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(project = %record.name, error = %e, "status probe failed");
                    continue;
                }
            };
            // `ready` means scaffolded but never started; an empty ps keeps it.
            if record.status == ProjectStatus::Ready && status == ProjectStatus::Stopped {
                continue;
            }
            if status == record.status && error == record.error {
                continue;
            }
            // Re-check under the lock window: an operation may have started meanwhile.
            if self.operations.is_busy(&record.name) {
                continue;
            }
            match self.store.update_status_if(&record, status, error).await {
                Ok(None) => {
                    tracing::debug!(project = %record.name, "status changed during probe; keeping it");
                }
                Ok(Some(updated)) => {
                    tracing::info!(
                        project = %updated.name,
                        from = %record.status,
                        to = %updated.status,
                        "status changed"
                    );
                    broadcast_event(&self.events, &WsEvent::ProjectUpdate { project: updated });
                    changed += 1;
                }
                Err(DashboardError::ProjectNotFound(_)) => {}
                Err(e) => tracing::warn!(project = %record.name, error = %e, "failed to save status"),
            }
        }
        changed
    }

    /// Poll until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "status poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        tracing::info!("status poller stopped");
    }
}

// ── Queue / schedule inspection ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueDepth {
    pub queue: String,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledTask {
    pub expression: String,
    pub command: String,
    pub next_due: Option<String>,
}

#[async_trait]
pub trait QueueInspector: Send + Sync {
    async fn queues(&self, record: &ProjectRecord) -> DashboardResult<Vec<QueueDepth>>;
    async fn schedule(&self, record: &ProjectRecord) -> DashboardResult<Vec<ScheduledTask>>;
}

/// Runs `php artisan` inside the app container and scrapes its text output.
pub struct ArtisanInspector {
    compose: ComposeClient,
    queues: Vec<String>,
}

impl ArtisanInspector {
    pub fn new(compose: ComposeClient) -> Self {
        Self {
            compose,
            queues: vec!["default".to_string()],
        }
    }

    async fn artisan(&self, record: &ProjectRecord, args: &[&str]) -> DashboardResult<CommandOutput> {
        if record.template != Template::Laravel {
            return Err(DashboardError::Validation(format!(
                "Project '{}' is not a Laravel project",
                record.name
            )));
        }
        let mut command = vec!["php".to_string(), "artisan".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        let spec = self.compose.exec(&record.path, "app", command);
        let output = self.compose.run(&spec).await?.into_result()?;
        Ok(output)
    }
}

#[async_trait]
impl QueueInspector for ArtisanInspector {
    async fn queues(&self, record: &ProjectRecord) -> DashboardResult<Vec<QueueDepth>> {
        let names = self.queues.join(",");
        let output = self.artisan(record, &["queue:monitor", names.as_str()]).await?;
        Ok(parse_queue_monitor(&output.stdout))
    }

    async fn schedule(&self, record: &ProjectRecord) -> DashboardResult<Vec<ScheduledTask>> {
        let output = self.artisan(record, &["schedule:list"]).await?;
        Ok(parse_schedule_list(&output.stdout))
    }
}

static PENDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s+pending").expect("valid regex")
});

// Newer artisan prints `[connection] queue ..... [count] OK`.
static MONITOR_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\[[^\]]+\]\s+)?(?P<queue>[\w:.-]+)\s+\.*\s*\[(?P<count>\d+)\]").expect("valid regex")
});

static SCHEDULE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<expr>(?:\S+\s+){4}\S+)\s+(?P<command>.+?)(?:\s*\.{2,}\s*(?:Next Due:\s*)?(?P<next>.+?))?\s*$",
    )
    .expect("valid regex")
});

/// Extract per-queue pending counts from `queue:monitor` output.
pub fn parse_queue_monitor(text: &str) -> Vec<QueueDepth> {
    let mut depths = Vec::new();
    for line in text.lines() {
        if let Some(caps) = PENDING_RE.captures(line) {
            let pending = caps[1].parse().unwrap_or(0);
            let queue = line
                .split_whitespace()
                .map(|w| w.trim_matches(|c| c == '[' || c == ']' || c == ':'))
                .find(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or("default")
                .to_string();
            depths.push(QueueDepth { queue, pending });
        } else if let Some(caps) = MONITOR_ROW_RE.captures(line) {
            depths.push(QueueDepth {
                queue: caps["queue"].to_string(),
                pending: caps["count"].parse().unwrap_or(0),
            });
        }
    }
    depths
}

fn looks_like_cron_field(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-' | '?'))
}

/// Extract rows from `schedule:list` output. Lines that don't start with a
/// five-field cron expression are ignored.
pub fn parse_schedule_list(text: &str) -> Vec<ScheduledTask> {
    text.lines()
        .filter_map(|line| {
            let caps = SCHEDULE_ROW_RE.captures(line)?;
            let expression = caps["expr"].split_whitespace().collect::<Vec<_>>();
            if !expression.iter().all(|f| looks_like_cron_field(f)) {
                return None;
            }
            Some(ScheduledTask {
                expression: expression.join(" "),
                command: caps["command"].trim().to_string(),
                next_due: caps.name("next").map(|m| m.as_str().trim().to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::models::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct FixedProbe(Mutex<HashMap<String, Result<ProjectStatus, &'static str>>>);

    #[async_trait]
    impl StatusProbe for FixedProbe {
        async fn probe(&self, record: &ProjectRecord) -> Result<ProbeResult, StatusError> {
            match self.0.lock().unwrap().get(&record.name).cloned() {
                Some(Ok(status)) => Ok(ProbeResult {
                    status,
                    containers: vec![],
                }),
                Some(Err("missing")) => Err(StatusError::ComposeFileMissing(record.path.clone())),
                _ => Err(StatusError::DockerUnavailable("down".into())),
            }
        }
    }

    fn record(name: &str, status: ProjectStatus) -> ProjectRecord {
        let now = Utc::now();
        ProjectRecord {
            id: name.to_string(),
            name: name.to_string(),
            template: Template::Laravel,
            path: PathBuf::from("/tmp").join(name),
            ports: PortMap::new(),
            status,
            config: ProjectConfig {
                services: vec![],
                php_version: default_php_version(),
                node_version: default_node_version(),
                database: DatabaseConfig::for_project(name),
            },
            created_at: now,
            last_activity: now,
            error: None,
        }
    }

    async fn poller(
        dir: &tempfile::TempDir,
        records: Vec<ProjectRecord>,
        probes: Vec<(&str, Result<ProjectStatus, &'static str>)>,
    ) -> (Poller, broadcast::Receiver<String>) {
        let store = Arc::new(ProjectStore::open(dir.path().join("projects.json")));
        for r in records {
            store.insert(r).await.unwrap();
        }
        let (tx, rx) = broadcast::channel(64);
        let map = probes.into_iter().map(|(n, s)| (n.to_string(), s)).collect();
        let poller = Poller {
            store,
            probe: Arc::new(FixedProbe(Mutex::new(map))),
            operations: OperationRegistry::new(tx.clone()),
            events: tx,
            interval: Duration::from_millis(10),
        };
        (poller, rx)
    }

    #[tokio::test]
    async fn test_poll_updates_changed_status_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let (poller, mut rx) = poller(
            &dir,
            vec![record("web", ProjectStatus::Stopped)],
            vec![("web", Ok(ProjectStatus::Running))],
        )
        .await;

        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(poller.store.get("web").await.unwrap().status, ProjectStatus::Running);
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("project_update"));

        // Unchanged on the second pass.
        assert_eq!(poller.poll_once().await, 0);
    }

    #[tokio::test]
    async fn test_poll_skips_transitional_and_busy_projects() {
        let dir = tempfile::tempdir().unwrap();
        let (poller, _rx) = poller(
            &dir,
            vec![
                record("creating", ProjectStatus::Creating),
                record("busy", ProjectStatus::Stopped),
            ],
            vec![
                ("creating", Ok(ProjectStatus::Running)),
                ("busy", Ok(ProjectStatus::Running)),
            ],
        )
        .await;
        let _op = poller.operations.begin("busy", OperationKind::Start).unwrap();

        assert_eq!(poller.poll_once().await, 0);
        assert_eq!(poller.store.get("creating").await.unwrap().status, ProjectStatus::Creating);
        assert_eq!(poller.store.get("busy").await.unwrap().status, ProjectStatus::Stopped);
    }

    #[tokio::test]
    async fn test_poll_keeps_ready_when_nothing_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (poller, _rx) = poller(
            &dir,
            vec![record("fresh", ProjectStatus::Ready)],
            vec![("fresh", Ok(ProjectStatus::Stopped))],
        )
        .await;
        assert_eq!(poller.poll_once().await, 0);
        assert_eq!(poller.store.get("fresh").await.unwrap().status, ProjectStatus::Ready);
    }

    #[tokio::test]
    async fn test_poll_docker_down_leaves_status_and_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let (poller, _rx) = poller(
            &dir,
            vec![
                record("nodocker", ProjectStatus::Running),
                record("nofile", ProjectStatus::Running),
            ],
            vec![("nofile", Err("missing"))],
        )
        .await;
        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(poller.store.get("nodocker").await.unwrap().status, ProjectStatus::Running);
        let nofile = poller.store.get("nofile").await.unwrap();
        assert_eq!(nofile.status, ProjectStatus::Error);
        assert!(nofile.error.unwrap().contains("docker-compose.yml"));
    }

    /// Finishes a failed operation on the record while the probe is in flight.
    struct RacingProbe {
        store: Arc<ProjectStore>,
    }

    #[async_trait]
    impl StatusProbe for RacingProbe {
        async fn probe(&self, record: &ProjectRecord) -> Result<ProbeResult, StatusError> {
            self.store
                .update_status(&record.name, ProjectStatus::Error, Some("build failed".into()))
                .await
                .unwrap();
            Ok(ProbeResult {
                status: ProjectStatus::Running,
                containers: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_poll_does_not_overwrite_status_set_during_probe() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProjectStore::open(dir.path().join("projects.json")));
        store.insert(record("web", ProjectStatus::Stopped)).await.unwrap();
        let (tx, _rx) = broadcast::channel(64);
        let poller = Poller {
            store: Arc::clone(&store),
            probe: Arc::new(RacingProbe {
                store: Arc::clone(&store),
            }),
            operations: OperationRegistry::new(tx.clone()),
            events: tx,
            interval: Duration::from_millis(10),
        };

        assert_eq!(poller.poll_once().await, 0);
        let web = store.get("web").await.unwrap();
        assert_eq!(web.status, ProjectStatus::Error);
        assert_eq!(web.error.as_deref(), Some("build failed"));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (poller, _rx) = poller(&dir, vec![], vec![]).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller should stop")
            .unwrap();
    }

    #[test]
    fn test_parse_pending_counts() {
        let text = "default ........ 12 pending\nemails: 3 pending\nnoise line\n";
        let depths = parse_queue_monitor(text);
        assert_eq!(
            depths,
            vec![
                QueueDepth { queue: "default".into(), pending: 12 },
                QueueDepth { queue: "emails".into(), pending: 3 },
            ]
        );
    }

    #[test]
    fn test_parse_bracketed_monitor_rows() {
        let text = "  Queue name ............ Size / Status\n  [redis] default ........ [4] OK\n";
        let depths = parse_queue_monitor(text);
        assert_eq!(depths, vec![QueueDepth { queue: "default".into(), pending: 4 }]);
    }

    #[test]
    fn test_parse_schedule_list() {
        let text = "\n  0 * * * *  php artisan inspire ......... Next Due: 39 minutes from now\n  \
                    */5 * * * * php artisan queue:prune-batches ... Next Due: 2 minutes from now\n\
                    Total: 2\n";
        let tasks = parse_schedule_list(text);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].expression, "0 * * * *");
        assert_eq!(tasks[0].command, "php artisan inspire");
        assert_eq!(tasks[0].next_due.as_deref(), Some("39 minutes from now"));
        assert_eq!(tasks[1].expression, "*/5 * * * *");
    }

    #[test]
    fn test_parse_schedule_without_rows() {
        assert!(parse_schedule_list("No scheduled tasks have been defined.").is_empty());
    }
}
