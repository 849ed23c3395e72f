use std::{collections::BTreeSet, io::Write};

use chrono::SecondsFormat;
use serde_json::Value;

use crate::{
    cancel::CancelToken,
    error::{Result, SepiaError},
    event::Event,
};

/// Output format for exported events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// A JSON array of event objects.
    Json,
    /// CSV with tags and payload fields flattened into columns.
    Csv,
}

pub(crate) fn write_events<W: Write>(
    writer: W,
    events: &[Event],
    format: ExportFormat,
    cancel: &CancelToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(SepiaError::Cancelled);
    }
    match format {
        ExportFormat::Json => write_json(writer, events),
        ExportFormat::Csv => write_csv(writer, events, cancel),
    }
}

fn write_json<W: Write>(mut writer: W, events: &[Event]) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, events)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Column order: `id, timestamp, type, tag_*, data_*`; the tag and data
/// columns are the sorted union of keys across the whole result. An empty
/// result writes nothing, not even a header.
fn write_csv<W: Write>(writer: W, events: &[Event], cancel: &CancelToken) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }

    let tag_keys: BTreeSet<&str> = events
        .iter()
        .flat_map(|event| event.tags.keys().map(String::as_str))
        .collect();
    let data_keys: BTreeSet<&str> = events
        .iter()
        .filter_map(|event| event.data.as_object())
        .flat_map(|object| object.keys().map(String::as_str))
        .collect();

    let mut header = vec!["id".to_string(), "timestamp".to_string(), "type".to_string()];
    header.extend(tag_keys.iter().map(|key| format!("tag_{key}")));
    header.extend(data_keys.iter().map(|key| format!("data_{key}")));

    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(&header)?;

    for (row, event) in events.iter().enumerate() {
        if row % 1_000 == 0 && cancel.is_cancelled() {
            return Err(SepiaError::Cancelled);
        }

        let mut record = Vec::with_capacity(header.len());
        record.push(event.id.to_string());
        record.push(event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        record.push(event.event_type.clone());
        for key in &tag_keys {
            record.push(event.tags.get(*key).cloned().unwrap_or_default());
        }
        for key in &data_keys {
            let value = event.data.get(*key).unwrap_or(&Value::Null);
            record.push(format_data_value(value));
        }
        csv_writer.write_record(&record)?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// Renders a payload value as a CSV cell: strings verbatim, booleans as
/// `true`/`false`, numbers in their JSON text form, compound values as
/// compact JSON, null as an empty cell.
fn format_data_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        compound => compound.to_string(),
    }
}
