use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How finished workers are sent back to whoever recruited them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Workers are never finished automatically; the callback is a static
    /// "done" page.
    #[default]
    Standalone,
    /// Mechanical Turk style external submission. Workers finish once they
    /// reach the task quota.
    Amt,
}

impl Mode {
    /// Whether reaching the quota finishes a worker without `force`.
    pub fn auto_finishes(&self) -> bool {
        matches!(self, Mode::Amt)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Standalone => write!(f, "standalone"),
            Mode::Amt => write!(f, "amt"),
        }
    }
}

/// Timing of the data lock lease.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Lifetime of the lock key. A crashed holder leaks the lock this long.
    pub ttl: Duration,
    /// Sleep between failed acquisition attempts.
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of one annotation job.
///
/// Every key the job touches in the store is prefixed with `task_key`, so
/// several jobs can share one store.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub task_key: String,
    pub mode: Mode,
    /// Tasks a worker must finish, and the cap on the selection window.
    pub num_tasks: usize,
    /// Initialise `tasks_correct` on new sessions so verdicts report it.
    pub track_correct: bool,
    /// Admin secret. A random one is generated when absent.
    pub admin_secret: Option<String>,
    pub lease: LeaseConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            task_key: "image_label".to_string(),
            mode: Mode::default(),
            num_tasks: 100,
            track_correct: false,
            admin_secret: None,
            lease: LeaseConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn new(task_key: impl Into<String>, mode: Mode, num_tasks: usize) -> Self {
        Self {
            task_key: task_key.into(),
            mode,
            num_tasks,
            ..Default::default()
        }
    }

    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.admin_secret = Some(secret.into());
        self
    }

    pub fn with_track_correct(mut self, track_correct: bool) -> Self {
        self.track_correct = track_correct;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}

/// Configuration of the HTTP server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// JSON file the rows are loaded from.
    pub data_path: Option<PathBuf>,
    /// Redis server holding the shared store; in-process store when unset.
    pub redis_url: Option<String>,
    /// Rebuild the work pool from the data source before serving.
    pub setup: bool,
    pub job: JobConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_path: None,
            redis_url: None,
            setup: false,
            job: JobConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_config_default() {
        let cfg = LeaseConfig::default();
        assert_eq!(cfg.ttl, Duration::from_secs(10));
        assert_eq!(cfg.retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn job_config_default() {
        let cfg = JobConfig::default();
        assert_eq!(cfg.task_key, "image_label");
        assert_eq!(cfg.mode, Mode::Standalone);
        assert_eq!(cfg.num_tasks, 100);
        assert!(!cfg.track_correct);
        assert!(cfg.admin_secret.is_none());
    }

    #[test]
    fn job_config_builders() {
        let cfg = JobConfig::new("video", Mode::Amt, 3)
            .with_admin_secret("s3cret")
            .with_track_correct(true);
        assert_eq!(cfg.task_key, "video");
        assert_eq!(cfg.mode, Mode::Amt);
        assert_eq!(cfg.num_tasks, 3);
        assert_eq!(cfg.admin_secret.as_deref(), Some("s3cret"));
        assert!(cfg.track_correct);
    }

    #[test]
    fn only_amt_auto_finishes() {
        assert!(Mode::Amt.auto_finishes());
        assert!(!Mode::Standalone.auto_finishes());
        assert_eq!(Mode::Amt.to_string(), "amt");
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8080");
        assert!(cfg.data_path.is_none());
        assert!(cfg.redis_url.is_none());
        assert!(!cfg.setup);
    }
}
