/// Lifecycle event logging for sessionbox
/// Every admission, reap and GC decision is emitted as a structured event: mirrored to the
/// `log` facade by severity and, when an audit file is configured, appended as one JSON
/// line by a background writer. Emission never blocks the caller.
use crate::config::types::{Result, SandboxError};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use uuid::Uuid;

/// Pending events held before the writer starts dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    AdmissionGranted,
    AdmissionRefused,
    IdleStop,
    MemoryWarn,
    MemoryKill,
    GcRemove,
    GcVolumeRemove,
    SessionLaunched,
    LaunchFailed,
    VerificationWarning,
    SessionStopped,
    SessionDestroyed,
    InspectFailed,
    InspectTimeout,
}

impl EventKind {
    pub fn default_severity(&self) -> Severity {
        match self {
            EventKind::MemoryKill
            | EventKind::LaunchFailed
            | EventKind::VerificationWarning => Severity::High,

            EventKind::AdmissionRefused
            | EventKind::IdleStop
            | EventKind::MemoryWarn
            | EventKind::InspectFailed
            | EventKind::InspectTimeout => Severity::Medium,

            EventKind::AdmissionGranted
            | EventKind::GcRemove
            | EventKind::GcVolumeRemove
            | EventKind::SessionLaunched
            | EventKind::SessionStopped
            | EventKind::SessionDestroyed => Severity::Low,
        }
    }
}

/// One lifecycle decision or action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub severity: Severity,
    pub session: Option<String>,
    /// Sampled value behind the decision (cpu %, memory %, running count)
    pub metric: Option<f64>,
    pub threshold: Option<f64>,
    pub uptime_secs: Option<u64>,
    pub detail: Option<String>,
    /// Correlates all events from one command or sweep
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            session: None,
            metric: None,
            threshold: None,
            uptime_secs: None,
            detail: None,
            run_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session: &str) -> Self {
        self.session = Some(session.to_string());
        self
    }

    pub fn with_metric(mut self, metric: f64, threshold: f64) -> Self {
        self.metric = Some(metric);
        self.threshold = Some(threshold);
        self
    }

    pub fn with_uptime(mut self, uptime: std::time::Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }
}

/// New correlation id for a command or sweep
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Fire-and-forget event consumer
pub trait EventSink: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Mirror an event to the `log` facade by severity
pub fn log_event(event: &LifecycleEvent) {
    let session = event.session.as_deref().unwrap_or("-");
    let mut message = format!("{:?} session={}", event.kind, session);
    if let (Some(metric), Some(threshold)) = (event.metric, event.threshold) {
        message.push_str(&format!(" metric={:.2} threshold={:.2}", metric, threshold));
    }
    if let Some(uptime) = event.uptime_secs {
        message.push_str(&format!(" uptime={}s", uptime));
    }
    if let Some(detail) = &event.detail {
        message.push_str(&format!(" - {}", detail));
    }

    match event.severity {
        Severity::High => error!("LIFECYCLE HIGH: {}", message),
        Severity::Medium => warn!("LIFECYCLE MEDIUM: {}", message),
        Severity::Low => info!("LIFECYCLE LOW: {}", message),
    }
}

/// Sink that only mirrors to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: LifecycleEvent) {
        log_event(&event);
    }
}

/// JSON-lines audit file fed through a bounded channel to a writer thread
pub struct AuditLog {
    sender: Option<Sender<LifecycleEvent>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl AuditLog {
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SandboxError::Config(format!("Failed to open audit log: {}", e)))?;

        let (sender, receiver) = bounded::<LifecycleEvent>(capacity.max(1));
        let writer = std::thread::Builder::new()
            .name("sessionbox-audit".to_string())
            .spawn(move || {
                for event in receiver.iter() {
                    match serde_json::to_string(&event) {
                        Ok(line) => {
                            if let Err(e) = writeln!(file, "{}", line) {
                                error!("Failed to write to audit log: {}", e);
                            }
                        }
                        Err(e) => error!("Failed to serialize audit event: {}", e),
                    }
                }
                if let Err(e) = file.flush() {
                    error!("Failed to flush audit log: {}", e);
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            writer: Mutex::new(Some(writer)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for AuditLog {
    fn emit(&self, event: LifecycleEvent) {
        log_event(&event);
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Audit queue full, dropping {:?} event", event.kind);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Audit writer stopped, event not recorded");
            }
        }
    }
}

impl Drop for AuditLog {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit
        self.sender.take();
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(handle) = writer.take() {
                let _ = handle.join();
            }
        }
    }
}
