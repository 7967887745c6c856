//! Audit trail for commands that change device state.
//!
//! One [`AuditRecord`] is produced per successful mutating command. Every
//! record goes to the tracing target [`AUDIT_TARGET`]; a [`FileAudit`] sink
//! additionally appends one line per record to a file.

use parking_lot::Mutex;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::Result;
use crate::tracing::{prelude::*, AUDIT_TARGET};

/// Recorded when the prior value could not be read.
pub const UNKNOWN_VALUE: &str = "unknown";

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub timestamp: OffsetDateTime,
    pub client_ip: String,
    pub device: String,
    pub command: String,
    /// Value before the command, best effort.
    pub old_value: String,
    /// Result returned to the client.
    pub new_value: String,
}

impl AuditRecord {
    pub fn new(
        client_ip: &str,
        device: &str,
        command: &str,
        old_value: Option<String>,
        new_value: String,
    ) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            client_ip: client_ip.to_string(),
            device: device.to_string(),
            command: command.to_string(),
            old_value: old_value.unwrap_or_else(|| UNKNOWN_VALUE.to_string()),
            new_value,
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        write!(
            f,
            "{} {} {} {} {} (was {})",
            ts, self.client_ip, self.device, self.command, self.new_value, self.old_value
        )
    }
}

/// Destination for audit records.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

/// Emits records as `tracing` events.
#[derive(Debug, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, record: &AuditRecord) {
        info!(
            target: AUDIT_TARGET,
            client = %record.client_ip,
            device = %record.device,
            command = %record.command,
            old = %record.old_value,
            new = %record.new_value,
            "audit"
        );
    }
}

/// Appends one line per record to a file.
pub struct FileAudit {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileAudit {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAudit {
    fn record(&self, record: &AuditRecord) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{record}").and_then(|_| file.flush()) {
            error!(path = %self.path.display(), error = %e, "Failed to write audit record");
        }
    }
}

/// Fans one record out to several sinks.
#[derive(Default)]
pub struct AuditLog {
    sinks: Vec<Box<dyn AuditSink>>,
}

impl AuditLog {
    /// A log that only emits tracing events.
    pub fn new() -> Self {
        Self {
            sinks: vec![Box::new(TracingAudit)],
        }
    }

    pub fn with_sink(mut self, sink: impl AuditSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl AuditSink for AuditLog {
    fn record(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::datetime;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<AuditRecord>>>);

    impl AuditSink for Collect {
        fn record(&self, record: &AuditRecord) {
            self.0.lock().push(record.clone());
        }
    }

    fn record() -> AuditRecord {
        AuditRecord {
            timestamp: datetime!(2024-03-01 12:30:00 UTC),
            client_ip: "10.0.0.7".into(),
            device: "default".into(),
            command: "set_setpoint".into(),
            old_value: "20".into(),
            new_value: "30".into(),
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            record().to_string(),
            "2024-03-01T12:30:00Z 10.0.0.7 default set_setpoint 30 (was 20)"
        );
    }

    #[test]
    fn test_missing_old_value_is_unknown() {
        let r = AuditRecord::new("1.2.3.4", "default", "start", None, "true".into());
        assert_eq!(r.old_value, UNKNOWN_VALUE);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileAudit::open(&path).unwrap();
        sink.record(&record());
        sink.record(&record());
        drop(sink);

        // Reopening appends rather than truncating.
        FileAudit::open(&path).unwrap().record(&record());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.lines().all(|l| l.ends_with("set_setpoint 30 (was 20)")));
    }

    #[test]
    fn test_fan_out() {
        let collect = Collect::default();
        let log = AuditLog::new().with_sink(collect.clone());
        log.record(&record());
        assert_eq!(collect.0.lock().len(), 1);
    }
}
