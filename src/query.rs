use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rocksdb::{Direction, IteratorMode};

use crate::{
    cancel::CancelToken,
    error::{Result, SepiaError},
    event::Event,
    keys,
    store::DbSnapshot,
    ulid::Ulid,
};

/// Search criteria for events.
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Inclusive start time (`None` means no lower bound).
    pub start: Option<DateTime<Utc>>,
    /// Inclusive end time (`None` means no upper bound).
    pub end: Option<DateTime<Utc>>,
    /// Acceptable event types (empty means all types).
    pub types: Vec<String>,
    /// Required tag equalities; all must match.
    pub tags: BTreeMap<String, String>,
    /// Maximum number of events to return (0 means no limit).
    pub limit: usize,
    /// Return events in reverse chronological order.
    pub descending: bool,
}

/// Runs the query against a snapshot, feeding each matching event to `visit`
/// in identifier order. Shared by query, aggregation and export.
pub(crate) fn run<F>(
    snapshot: &DbSnapshot<'_>,
    query: &Query,
    cancel: &CancelToken,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(Event) -> Result<()>,
{
    match plan(query) {
        Some(prefix) => {
            let ids = scan_index(snapshot, &prefix, query, cancel)?;
            fetch_by_ids(snapshot, &ids, query, cancel, visit)
        }
        None => full_scan(snapshot, query, cancel, visit).map(|_| ()),
    }
}

pub(crate) fn collect(
    snapshot: &DbSnapshot<'_>,
    query: &Query,
    cancel: &CancelToken,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    run(snapshot, query, cancel, &mut |event| {
        events.push(event);
        Ok(())
    })?;
    Ok(events)
}

/// Picks the index prefix that drives the scan, or `None` for a full scan.
///
/// A single type filter wins over tag filters. Otherwise the first tag drives
/// the scan; tags live in a `BTreeMap`, so "first" is the lexicographically
/// smallest tag name and planning is deterministic. Multiple type filters
/// fall back to a full scan.
fn plan(query: &Query) -> Option<Vec<u8>> {
    if query.types.len() == 1 {
        return Some(keys::type_index_prefix(&query.types[0]));
    }
    if let Some((key, value)) = query.tags.iter().next() {
        return Some(keys::tag_index_prefix(key, value));
    }
    None
}

fn iterator_mode<'a>(
    prefix: &'a [u8],
    seek_end: &'a Option<Vec<u8>>,
    descending: bool,
) -> IteratorMode<'a> {
    if descending {
        match seek_end {
            Some(end) => IteratorMode::From(end, Direction::Reverse),
            None => IteratorMode::End,
        }
    } else {
        IteratorMode::From(prefix, Direction::Forward)
    }
}

/// Scans an index prefix and returns candidate identifiers in scan order,
/// pruned by the time range and capped at the query limit.
fn scan_index(
    snapshot: &DbSnapshot<'_>,
    prefix: &[u8],
    query: &Query,
    cancel: &CancelToken,
) -> Result<Vec<Ulid>> {
    let seek_end = if query.descending {
        keys::prefix_end(prefix)
    } else {
        None
    };
    let iter = snapshot.iterator(iterator_mode(prefix, &seek_end, query.descending));

    let mut ids = Vec::new();
    for item in iter {
        if cancel.is_cancelled() {
            return Err(SepiaError::Cancelled);
        }
        let (key, _) = item.map_err(|err| SepiaError::Storage(err.to_string()))?;
        if !key.starts_with(prefix) {
            break;
        }
        let Some(id) = keys::decode_index_key(&key) else {
            continue;
        };
        if !matches_time_range(id, query) {
            continue;
        }
        ids.push(id);
        if query.limit > 0 && ids.len() >= query.limit {
            break;
        }
    }
    Ok(ids)
}

/// Loads candidate events and applies the residual predicates the driving
/// index could not answer.
fn fetch_by_ids<F>(
    snapshot: &DbSnapshot<'_>,
    ids: &[Ulid],
    query: &Query,
    cancel: &CancelToken,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(Event) -> Result<()>,
{
    let mut matched = 0usize;
    for &id in ids {
        if cancel.is_cancelled() {
            return Err(SepiaError::Cancelled);
        }
        let value = snapshot
            .get(keys::event_key(id))
            .map_err(|err| SepiaError::Storage(err.to_string()))?;
        let Some(value) = value else {
            continue;
        };
        let Ok(event) = serde_json::from_slice::<Event>(&value) else {
            continue;
        };
        if !matches_filters(&event, query) {
            continue;
        }
        visit(event)?;
        matched += 1;
        if query.limit > 0 && matched >= query.limit {
            break;
        }
    }
    Ok(())
}

/// Scans the primary keyspace, filtering on the identifier's timestamp before
/// deserializing the record. Returns the number of keys visited so tests can
/// observe the early-termination bound.
pub(crate) fn full_scan<F>(
    snapshot: &DbSnapshot<'_>,
    query: &Query,
    cancel: &CancelToken,
    visit: &mut F,
) -> Result<usize>
where
    F: FnMut(Event) -> Result<()>,
{
    let prefix = keys::EVENT_PREFIX;
    let seek_end = if query.descending {
        keys::prefix_end(prefix)
    } else {
        None
    };
    let iter = snapshot.iterator(iterator_mode(prefix, &seek_end, query.descending));

    let mut matched = 0usize;
    let mut visited = 0usize;
    for item in iter {
        if cancel.is_cancelled() {
            return Err(SepiaError::Cancelled);
        }
        let (key, value) = item.map_err(|err| SepiaError::Storage(err.to_string()))?;
        if !key.starts_with(prefix) {
            break;
        }
        visited += 1;
        let Some(id) = keys::decode_event_key(&key) else {
            continue;
        };
        if !matches_time_range(id, query) {
            // Primary keys are time-ordered, so once past the bound no later
            // key can match.
            let t = id.datetime();
            if !query.descending && query.end.is_some_and(|end| t > end) {
                break;
            }
            if query.descending && query.start.is_some_and(|start| t < start) {
                break;
            }
            continue;
        }
        let Ok(event) = serde_json::from_slice::<Event>(&value) else {
            continue;
        };
        if !matches_filters(&event, query) {
            continue;
        }
        visit(event)?;
        matched += 1;
        if query.limit > 0 && matched >= query.limit {
            break;
        }
    }
    Ok(visited)
}

fn matches_time_range(id: Ulid, query: &Query) -> bool {
    let t = id.datetime();
    if query.start.is_some_and(|start| t < start) {
        return false;
    }
    if query.end.is_some_and(|end| t > end) {
        return false;
    }
    true
}

/// Checks the predicates not answered by the driving index.
fn matches_filters(event: &Event, query: &Query) -> bool {
    if !query.types.is_empty() && !query.types.iter().any(|t| *t == event.event_type) {
        return false;
    }
    query
        .tags
        .iter()
        .all(|(key, value)| event.tags.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_prefers_single_type_filter() {
        let query = Query {
            types: vec!["request".into()],
            tags: BTreeMap::from([("service".into(), "api".into())]),
            ..Default::default()
        };
        assert_eq!(plan(&query), Some(keys::type_index_prefix("request")));
    }

    #[test]
    fn plan_uses_smallest_tag_name() {
        let query = Query {
            tags: BTreeMap::from([
                ("zone".into(), "us".into()),
                ("env".into(), "prod".into()),
            ]),
            ..Default::default()
        };
        assert_eq!(plan(&query), Some(keys::tag_index_prefix("env", "prod")));
    }

    #[test]
    fn plan_falls_back_to_full_scan() {
        assert_eq!(plan(&Query::default()), None);
        let multi_type = Query {
            types: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(plan(&multi_type), None);
    }

    #[test]
    fn filters_require_all_tags_and_any_type() {
        let event = Event {
            id: Ulid::from_parts(1, 1),
            timestamp: Utc::now(),
            event_type: "request".into(),
            tags: BTreeMap::from([("service".into(), "api".into())]),
            data: serde_json::Value::Null,
        };

        let mut query = Query {
            types: vec!["error".into(), "request".into()],
            ..Default::default()
        };
        assert!(matches_filters(&event, &query));

        query.tags.insert("service".into(), "api".into());
        assert!(matches_filters(&event, &query));

        query.tags.insert("env".into(), "prod".into());
        assert!(!matches_filters(&event, &query));

        let wrong_type = Query {
            types: vec!["error".into()],
            ..Default::default()
        };
        assert!(!matches_filters(&event, &wrong_type));
    }

    #[test]
    fn time_range_bounds_are_inclusive() {
        let at = Utc::now();
        let id = Ulid::from_parts(at.timestamp_millis() as u64, 1);
        let t = id.datetime();
        let query = Query {
            start: Some(t),
            end: Some(t),
            ..Default::default()
        };
        assert!(matches_time_range(id, &query));
    }
}
