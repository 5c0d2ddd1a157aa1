//! Append-only structured trace of scheduling events.
//!
//! `TraceLog` is a clonable handle; every component that needs to emit
//! events holds its own copy. Records accumulate in memory (a simulator run
//! is bounded) and serialize to the `trace.json` array on demand.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{NodeId, WorkflowId};

/// Event kinds, serialized by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceEvent {
    NodeRunnable,
    NodeQueued,
    AttemptStart,
    AttemptFinish,
    AttemptFail,
    AttemptCancel,
    HedgeLaunched,
    WorkflowDone,
}

/// One trace record: `{ev, t_ms, wf, node, extra?}`.
#[derive(Debug, Clone, Serialize)]
pub struct TraceRecord {
    pub ev: TraceEvent,
    pub t_ms: f64,
    pub wf: WorkflowId,
    pub node: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Thread-safe append-only trace log.
#[derive(Clone, Default)]
pub struct TraceLog {
    records: Arc<RwLock<Vec<TraceRecord>>>,
}

impl TraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &self,
        ev: TraceEvent,
        t_ms: f64,
        wf: WorkflowId,
        node: NodeId,
        extra: Option<String>,
    ) {
        self.records.write().push(TraceRecord {
            ev,
            t_ms,
            wf,
            node,
            extra,
        });
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copy of the current records, for assertions and post-processing.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.records.read().clone()
    }

    /// Writes the full JSON array to `path`.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        let records = self.records.read();
        serde_json::to_writer_pretty(&mut out, &*records)?;
        out.flush()
    }
}
