//! Append-only NDJSON event logs.
//!
//! Each log file holds one JSON object per line. Appends open the file in
//! append mode, write the line, and flush before returning, so a reader that
//! opens the file afterwards sees the event. Reads tolerate a torn final
//! line: a crash mid-append leaves a partial line that the reader silently
//! discards.
//!
//! Agent events are persisted twice, agent log first and item log second.
//! A failure of the second append surfaces as an error but the first append
//! is never rolled back; replay treats the agent log as a subset view.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use convoy_types::{AgentId, ConvoyError, DataLayout, EventRecord, ItemId, Result};

use crate::bus::EventBus;

/// Stateless NDJSON log primitives.
pub struct EventLog;

impl EventLog {
    /// Append one event as a JSON line, creating parent directories and the
    /// file as needed. Flushes before returning.
    pub fn append(path: &Path, event: &EventRecord) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Read all events in file-append order.
    ///
    /// A final line that fails to parse is a torn append and is discarded
    /// silently. A malformed line in the interior of the file is skipped
    /// with a warning; the surrounding events remain usable.
    pub fn read(path: &Path) -> Result<Vec<EventRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(path)?);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;

        let mut events = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventRecord>(line) {
                Ok(event) => events.push(event),
                Err(e) if idx == last => {
                    // Torn tail from a crash mid-append.
                    tracing::debug!(path = %path.display(), error = %e, "discarding torn final line");
                }
                Err(e) => {
                    warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed event line");
                }
            }
        }
        Ok(events)
    }

    /// Return the last `max_bytes` of the file as text via a memory map.
    ///
    /// Used for output-buffer style reads where only the recent tail
    /// matters. The returned slice starts at a line boundary when one exists
    /// inside the window.
    pub fn tail_bytes(path: &Path, max_bytes: usize) -> Result<String> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(String::new());
        }
        // SAFETY: the log is append-only; bytes already written are never
        // modified in-place, so the mapping is stable for its lifetime.
        let mmap = unsafe { Mmap::map(&file)? };
        let data = mmap.as_ref();
        let start = data.len().saturating_sub(max_bytes);
        let window = &data[start..];
        // Trim the leading partial line when we cut into the middle of one.
        let window = match (start > 0, window.iter().position(|&b| b == b'\n')) {
            (true, Some(nl)) => &window[nl + 1..],
            _ => window,
        };
        Ok(String::from_utf8_lossy(window).into_owned())
    }
}

/// The ledger for one data root: dual append plus bus fan-out.
#[derive(Clone)]
pub struct ItemLedger {
    layout: DataLayout,
    bus: EventBus,
}

impl ItemLedger {
    pub fn new(layout: DataLayout, bus: EventBus) -> Self {
        Self { layout, bus }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Persist an event, then publish it to live subscribers.
    ///
    /// Agent-scoped events are appended to the agent log first and the item
    /// log second. Publication happens only after persistence so observers
    /// never see an event that replay would not.
    pub fn record(&self, event: &EventRecord) -> Result<()> {
        if let Some(agent_id) = &event.agent_id {
            let agent_log = self.layout.agent_events(&event.item_id, agent_id);
            EventLog::append(&agent_log, event)?;
            let item_log = self.layout.item_events(&event.item_id);
            EventLog::append(&item_log, event).map_err(|e| {
                ConvoyError::Ledger(format!(
                    "agent event {} persisted but item append failed: {e}",
                    event.id
                ))
            })?;
        } else {
            EventLog::append(&self.layout.item_events(&event.item_id), event)?;
        }
        self.bus.publish(event);
        Ok(())
    }

    /// All events of an item, in the authoritative append order.
    pub fn read_item(&self, item_id: &ItemId) -> Result<Vec<EventRecord>> {
        EventLog::read(&self.layout.item_events(item_id))
    }

    /// The agent-scoped subset view of one agent's history.
    pub fn read_agent(&self, item_id: &ItemId, agent_id: &AgentId) -> Result<Vec<EventRecord>> {
        EventLog::read(&self.layout.agent_events(item_id, agent_id))
    }
}
