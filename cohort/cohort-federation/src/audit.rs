//! Audit log: the administrative notification sink.
//!
//! Every report is
//! - logged through `tracing` at a level matching its severity
//! - kept in a bounded in-memory ring for inspection
//! - broadcast to live subscribers

use chrono::{DateTime, Utc};
use cohort_core::audit::{AuditReport, AuditSeverity};
use cohort_core::traits::AuditSink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Default number of records retained
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// A recorded report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    /// Server that raised the report
    pub server: String,
    pub severity: AuditSeverity,
    pub message_id: String,
    pub report: AuditReport,
}

pub struct AuditLog {
    server: String,
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
    sequence: AtomicU64,
    sender: broadcast::Sender<AuditRecord>,
}

impl AuditLog {
    pub fn new(server: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            server: server.into(),
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            sequence: AtomicU64::new(0),
            sender,
        }
    }

    /// Receive every report recorded from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Retained reports matching `predicate`
    pub fn reports_matching<F>(&self, predicate: F) -> Vec<AuditReport>
    where
        F: Fn(&AuditReport) -> bool,
    {
        self.records
            .lock()
            .iter()
            .filter(|record| predicate(&record.report))
            .map(|record| record.report.clone())
            .collect()
    }

    /// Total number of reports ever recorded
    pub fn total_reported(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl AuditSink for AuditLog {
    fn report(&self, report: AuditReport) {
        let severity = report.severity();
        let message_id = report.error_kind().message_id();
        let summary = report.summary();

        match severity {
            AuditSeverity::Error => error!(server = %self.server, message_id, "{}", summary),
            AuditSeverity::Warning => warn!(server = %self.server, message_id, "{}", summary),
            AuditSeverity::Info => info!(server = %self.server, message_id, "{}", summary),
        }

        let record = AuditRecord {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            recorded_at: Utc::now(),
            server: self.server.clone(),
            severity,
            message_id: message_id.to_string(),
            report,
        };

        {
            let mut records = self.records.lock();
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record.clone());
        }

        // No subscribers is fine
        let _ = self.sender.send(record);
    }
}
