//! Per-link session accounting.
//! A session exists exactly while the state machine is in `Connected`;
//! it is owned by the connection task and exposed only as snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One physical-link lifetime.
#[derive(Debug)]
pub struct ConnectionSession {
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    bytes_in: u64,
    bytes_out: u64,
    messages_in: u64,
    messages_out: u64,
    /// Connect attempts it took to establish this link.
    retry_count: u32,
}

impl ConnectionSession {
    pub fn new(retry_count: u32) -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            bytes_in: 0,
            bytes_out: 0,
            messages_in: 0,
            messages_out: 0,
            retry_count,
        }
    }

    pub fn record_inbound(&mut self, len: usize) {
        self.bytes_in += len as u64;
        self.messages_in += 1;
    }

    pub fn record_outbound(&mut self, len: usize) {
        self.bytes_out += len as u64;
        self.messages_out += 1;
    }

    pub fn end(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            started_at: self.started_at,
            ended_at: self.ended_at,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            messages_in: self.messages_in,
            messages_out: self.messages_out,
            retry_count: self.retry_count,
        }
    }
}

/// Read-only copy of a session's counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub retry_count: u32,
}
