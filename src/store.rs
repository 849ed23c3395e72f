use std::{io::Write, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, SnapshotWithThreadMode,
    WriteBatch,
};
use tracing::debug;

use crate::{
    aggregate::{self, AggregateResult, Aggregation, Aggregator},
    cancel::CancelToken,
    error::{Result, SepiaError},
    event::{Event, NewEvent},
    export::{self, ExportFormat},
    keys,
    query::{self, Query},
    retention::{RetentionPolicy, RetentionTask},
    ulid::{Ulid, UlidSource},
};

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;
pub(crate) type DbSnapshot<'a> = SnapshotWithThreadMode<'a, Db>;

/// Substrate connection and identifier source, shared between the handle and
/// the retention worker.
pub(crate) struct StoreInner {
    db: Db,
    ids: UlidSource,
}

impl StoreInner {
    /// Deletes every event whose identifier encodes a time before `cutoff`,
    /// together with its type- and tag-index entries, in one atomic batch.
    /// Returns the number of events deleted.
    pub(crate) fn delete_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let snapshot = self.db.snapshot();
        let iter = snapshot.iterator(IteratorMode::From(keys::EVENT_PREFIX, Direction::Forward));

        let mut batch = WriteBatch::default();
        let mut deleted = 0u64;
        for item in iter {
            let (key, value) = item.map_err(|err| SepiaError::Storage(err.to_string()))?;
            if !key.starts_with(keys::EVENT_PREFIX) {
                break;
            }
            let Some(id) = keys::decode_event_key(&key) else {
                continue;
            };
            // Primary keys are time-ordered; the first survivor ends the scan.
            if id.datetime() >= cutoff {
                break;
            }
            let Ok(event) = serde_json::from_slice::<Event>(&value) else {
                continue;
            };
            batch.delete(key);
            batch.delete(keys::type_index_key(&event.event_type, id));
            for (tag_key, tag_value) in &event.tags {
                batch.delete(keys::tag_index_key(tag_key, tag_value, id));
            }
            deleted += 1;
        }

        if deleted > 0 {
            self.db
                .write(batch)
                .map_err(|err| SepiaError::Storage(err.to_string()))?;
        }
        Ok(deleted)
    }
}

struct HandleState {
    closed: bool,
    retention: Option<RetentionTask>,
}

/// The database handle.
///
/// One handle is safe for concurrent use from multiple threads. All
/// operations fail with [`SepiaError::Closed`] after [`EventLog::close`].
pub struct EventLog {
    inner: Arc<StoreInner>,
    read_only: bool,
    state: RwLock<HandleState>,
}

impl EventLog {
    /// Creates or opens an event log at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        Self::open_with(path.as_ref(), &options, false)
    }

    /// Opens an existing event log without write access. Write-path
    /// operations fail with a storage error.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let options = Options::default();
        Self::open_with(path.as_ref(), &options, true)
    }

    fn open_with(path: &Path, options: &Options, read_only: bool) -> Result<Self> {
        let db = if read_only {
            Db::open_for_read_only(options, path, false)
        } else {
            Db::open(options, path)
        }
        .map_err(|err| SepiaError::Storage(err.to_string()))?;
        debug!(path = %path.display(), read_only, "opened event log");

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                ids: UlidSource::new(),
            }),
            read_only,
            state: RwLock::new(HandleState {
                closed: false,
                retention: None,
            }),
        })
    }

    /// Stops the retention task, flushes the substrate and marks the handle
    /// closed. A second close reports [`SepiaError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(SepiaError::Closed);
        }
        if let Some(task) = state.retention.take() {
            task.stop();
        }
        state.closed = true;
        if self.read_only {
            return Ok(());
        }
        self.inner
            .db
            .flush()
            .map_err(|err| SepiaError::Storage(err.to_string()))
    }

    /// Validates, stamps and persists one event together with its index
    /// entries in a single atomic batch. Returns the stamped event.
    pub fn append(&self, input: NewEvent) -> Result<Event> {
        self.check_open()?;
        self.ensure_writable()?;
        input.validate()?;

        let timestamp = input.timestamp.unwrap_or_else(Utc::now);
        let event = input.into_event(self.inner.ids.next(timestamp), timestamp);

        let mut batch = WriteBatch::default();
        stage_event(&mut batch, &event)?;
        self.inner
            .db
            .write(batch)
            .map_err(|err| SepiaError::Storage(err.to_string()))?;

        Ok(event)
    }

    /// Appends many events in one atomic batch: either every event commits
    /// (with its index entries) or none do. Validation failures reject the
    /// whole batch before anything is written.
    pub fn append_batch(&self, inputs: Vec<NewEvent>) -> Result<Vec<Event>> {
        self.check_open()?;
        self.ensure_writable()?;
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        for input in &inputs {
            input.validate()?;
        }

        let now = Utc::now();
        let mut batch = WriteBatch::default();
        let mut events = Vec::with_capacity(inputs.len());
        for input in inputs {
            let timestamp = input.timestamp.unwrap_or(now);
            let event = input.into_event(self.inner.ids.next(timestamp), timestamp);
            stage_event(&mut batch, &event)?;
            events.push(event);
        }
        self.inner
            .db
            .write(batch)
            .map_err(|err| SepiaError::Storage(err.to_string()))?;

        Ok(events)
    }

    /// Loads a single event by its identifier.
    pub fn get(&self, id: Ulid) -> Result<Event> {
        self.check_open()?;
        let value = self
            .inner
            .db
            .get(keys::event_key(id))
            .map_err(|err| SepiaError::Storage(err.to_string()))?
            .ok_or(SepiaError::NotFound)?;
        Ok(serde_json::from_slice(&value)?)
    }

    /// Finds events matching the query, in identifier order (oldest first,
    /// newest first with `descending`).
    pub fn query(&self, query: &Query) -> Result<Vec<Event>> {
        self.query_with_cancel(query, &CancelToken::new())
    }

    pub fn query_with_cancel(&self, query: &Query, cancel: &CancelToken) -> Result<Vec<Event>> {
        self.check_open()?;
        let snapshot = self.inner.db.snapshot();
        query::collect(&snapshot, query, cancel)
    }

    /// The total number of primary records.
    pub fn count(&self) -> Result<u64> {
        self.check_open()?;
        let snapshot = self.inner.db.snapshot();
        let iter = snapshot.iterator(IteratorMode::From(keys::EVENT_PREFIX, Direction::Forward));
        let mut count = 0u64;
        for item in iter {
            let (key, _) = item.map_err(|err| SepiaError::Storage(err.to_string()))?;
            if !key.starts_with(keys::EVENT_PREFIX) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Folds the matching events into scalar statistics in a single pass.
    /// `field` names the payload field to aggregate; an empty field counts
    /// every matching event.
    pub fn aggregate(
        &self,
        query: &Query,
        field: &str,
        aggregations: &[Aggregation],
    ) -> Result<AggregateResult> {
        self.aggregate_with_cancel(query, field, aggregations, &CancelToken::new())
    }

    pub fn aggregate_with_cancel(
        &self,
        query: &Query,
        field: &str,
        aggregations: &[Aggregation],
        cancel: &CancelToken,
    ) -> Result<AggregateResult> {
        self.check_open()?;
        if cancel.is_cancelled() {
            return Err(SepiaError::Cancelled);
        }
        let mut aggregator = Aggregator::new(field, aggregate::needs_percentiles(aggregations));
        let snapshot = self.inner.db.snapshot();
        query::run(&snapshot, query, cancel, &mut |event| aggregator.add(&event))?;
        Ok(aggregator.finish())
    }

    /// Drains the query into `writer` in the requested format.
    pub fn export<W: Write>(&self, writer: W, query: &Query, format: ExportFormat) -> Result<()> {
        self.export_with_cancel(writer, query, format, &CancelToken::new())
    }

    pub fn export_with_cancel<W: Write>(
        &self,
        writer: W,
        query: &Query,
        format: ExportFormat,
        cancel: &CancelToken,
    ) -> Result<()> {
        let events = self.query_with_cancel(query, cancel)?;
        export::write_events(writer, &events, format, cancel)
    }

    /// Deletes all events older than `cutoff` along with their index
    /// entries. Returns the number of events deleted.
    pub fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_open()?;
        self.ensure_writable()?;
        self.inner.delete_expired(cutoff)
    }

    /// Replaces the retention policy. Any running cleanup task is stopped
    /// and joined first; a non-zero `max_age` starts a new one.
    pub fn set_retention(&self, policy: RetentionPolicy) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Err(SepiaError::Closed);
        }
        self.ensure_writable()?;

        if let Some(task) = state.retention.take() {
            task.stop();
        }
        if policy.max_age.is_zero() {
            return Ok(());
        }
        state.retention = Some(RetentionTask::spawn(Arc::clone(&self.inner), policy));
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.state.read().closed {
            return Err(SepiaError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(SepiaError::Storage(
                "event log opened in read-only mode".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        // The retention worker holds the substrate through StoreInner; join
        // it before the handle goes away even if close() was never called.
        if let Some(task) = self.state.write().retention.take() {
            task.stop();
        }
    }
}

/// Stages the primary record plus its 1 + |tags| index entries onto a batch.
fn stage_event(batch: &mut WriteBatch, event: &Event) -> Result<()> {
    let bytes = serde_json::to_vec(event)?;
    batch.put(keys::event_key(event.id), &bytes);
    batch.put(keys::type_index_key(&event.event_type, event.id), b"");
    for (tag_key, tag_value) in &event.tags {
        batch.put(keys::tag_index_key(tag_key, tag_value, event.id), b"");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::open(dir.path().join("events")).unwrap();
        (dir, log)
    }

    fn metric(value: i64, at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            event_type: "metric".into(),
            timestamp: Some(at),
            data: json!({ "value": value }),
            ..Default::default()
        }
    }

    #[test]
    fn append_and_retrieve() {
        let (_dir, log) = open_temp();
        let stamped = log
            .append(NewEvent {
                event_type: "request".into(),
                tags: [("service".to_string(), "api".to_string())].into(),
                data: json!({ "value": 123, "message": "hello" }),
                ..Default::default()
            })
            .unwrap();

        let loaded = log.get(stamped.id).unwrap();
        assert_eq!(loaded, stamped);
        assert_eq!(loaded.tags["service"], "api");
    }

    // Millisecond-aligned "now", matching identifier precision.
    fn now_ms() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    #[test]
    fn ascending_full_scan_stops_past_the_end_bound() {
        let (_dir, log) = open_temp();
        let base = now_ms();
        for i in 0..1_000 {
            log.append(metric(i, base + chrono::TimeDelta::milliseconds(i)))
                .unwrap();
        }

        // A window over the first ten events must not walk the other 990.
        let narrow = Query {
            end: Some(base + chrono::TimeDelta::milliseconds(9)),
            ..Default::default()
        };
        let snapshot = log.inner.db.snapshot();
        let mut seen = 0usize;
        let visited = query::full_scan(&snapshot, &narrow, &CancelToken::new(), &mut |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 10);
        assert!(visited <= 11, "visited {visited} keys for a 10-event window");
    }

    #[test]
    fn descending_full_scan_stops_below_the_start_bound() {
        let (_dir, log) = open_temp();
        let base = now_ms();
        for i in 0..1_000 {
            log.append(metric(i, base + chrono::TimeDelta::milliseconds(i)))
                .unwrap();
        }

        let narrow = Query {
            start: Some(base + chrono::TimeDelta::milliseconds(990)),
            descending: true,
            ..Default::default()
        };
        let snapshot = log.inner.db.snapshot();
        let mut seen = 0usize;
        let visited = query::full_scan(&snapshot, &narrow, &CancelToken::new(), &mut |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 10);
        assert!(visited <= 11, "visited {visited} keys for a 10-event window");
    }

    #[test]
    fn delete_expired_on_empty_log_is_a_no_op() {
        let (_dir, log) = open_temp();
        assert_eq!(log.inner.delete_expired(Utc::now()).unwrap(), 0);
    }
}
