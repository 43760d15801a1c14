//! Worker queue entry codec.
//!
//! Current entries are `v3␞runId␞queueKey␞timestampMs␞attempt␞envType␞workerQueue`
//! joined with U+001E. Tenant ids are not encoded; they are recovered from the
//! queue key. Older entries hold only a message key and are resolved by reading
//! the stored JSON message.

use conveyor_run_core::{EnvironmentType, QueueDescriptor, RunId};

use super::keys::{KeyError, RunQueueKeyProducer};

pub const SEPARATOR: char = '\u{1e}';
pub const V3_TAG: &str = "v3";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("{field} contains the entry separator")]
    SeparatorInField { field: &'static str },

    #[error("v3 entry has {found} fields, expected 7")]
    FieldCount { found: usize },

    #[error("v3 entry has invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerQueueEntry {
    pub run_id: RunId,
    pub queue_key: String,
    pub timestamp_ms: i64,
    pub attempt: u32,
    pub environment_type: EnvironmentType,
    pub worker_queue: String,
}

impl WorkerQueueEntry {
    pub fn descriptor(&self, keys: &RunQueueKeyProducer) -> Result<QueueDescriptor, KeyError> {
        keys.descriptor_from_queue(&self.queue_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedEntry {
    V3(WorkerQueueEntry),
    /// Anything without the v3 tag, returned untouched for the legacy lookup.
    NotV3(String),
}

fn check_field(field: &'static str, value: &str) -> Result<(), CodecError> {
    if value.contains(SEPARATOR) {
        return Err(CodecError::SeparatorInField { field });
    }
    Ok(())
}

pub fn encode(entry: &WorkerQueueEntry) -> Result<String, CodecError> {
    check_field("queue key", &entry.queue_key)?;
    check_field("worker queue", &entry.worker_queue)?;

    let sep = SEPARATOR;
    Ok(format!(
        "{V3_TAG}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
        entry.run_id,
        entry.queue_key,
        entry.timestamp_ms,
        entry.attempt,
        entry.environment_type.code(),
        entry.worker_queue,
    ))
}

pub fn decode(raw: &str) -> Result<DecodedEntry, CodecError> {
    let Some(body) = raw
        .strip_prefix(V3_TAG)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
    else {
        return Ok(DecodedEntry::NotV3(raw.to_string()));
    };

    let fields: Vec<&str> = body.split(SEPARATOR).collect();
    let &[run_id, queue_key, timestamp_ms, attempt, env_code, worker_queue] = fields.as_slice()
    else {
        return Err(CodecError::FieldCount {
            found: fields.len() + 1,
        });
    };

    let invalid = |field: &'static str, value: &str| CodecError::InvalidField {
        field,
        value: value.to_string(),
    };

    let run_id = RunId::parse(run_id).ok_or_else(|| invalid("run id", run_id))?;
    if queue_key.is_empty() {
        return Err(invalid("queue key", queue_key));
    }
    let timestamp_ms = timestamp_ms
        .parse::<i64>()
        .map_err(|_| invalid("timestamp", timestamp_ms))?;
    let attempt = attempt
        .parse::<u32>()
        .map_err(|_| invalid("attempt", attempt))?;
    let mut chars = env_code.chars();
    let environment_type = match (chars.next(), chars.next()) {
        (Some(code), None) => EnvironmentType::from_code(code),
        _ => None,
    }
    .ok_or_else(|| invalid("environment type", env_code))?;

    Ok(DecodedEntry::V3(WorkerQueueEntry {
        run_id,
        queue_key: queue_key.to_string(),
        timestamp_ms,
        attempt,
        environment_type,
        worker_queue: worker_queue.to_string(),
    }))
}
