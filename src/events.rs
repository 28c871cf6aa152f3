use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::json;

use crate::attributes::{
    AttributeError, AttributeValue, Attributes, Destinations, validate_attribute_key,
};
use crate::limits::{
    ATTRIBUTE_USER_LIMIT, CUSTOM_EVENT_TYPE_LENGTH_LIMIT, FAILED_EVENTS_ATTEMPTS_LIMIT,
};
use crate::metrics::ApdexZone;
use crate::sampler::Priority;

#[derive(Debug)]
struct PoolEntry<T> {
    priority: Priority,
    order: u64,
    event: T,
}

impl<T> PartialEq for PoolEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}
impl<T> Eq for PoolEntry<T> {}
impl<T> PartialOrd for PoolEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for PoolEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.order.cmp(&other.order))
    }
}

/// Fixed-capacity priority-weighted reservoir. The backing store is a binary
/// min-heap keyed by priority (insertion order breaks ties), so the eviction
/// candidate is always O(1) away.
#[derive(Debug)]
pub(crate) struct EventPool<T> {
    heap: BinaryHeap<Reverse<PoolEntry<T>>>,
    capacity: usize,
    seen: u64,
    failed_harvests: u32,
    next_order: u64,
}

impl<T> EventPool<T> {
    pub(crate) fn new(capacity: usize) -> EventPool<T> {
        EventPool {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            seen: 0,
            failed_harvests: 0,
            next_order: 0,
        }
    }

    pub(crate) fn seen(&self) -> u64 {
        self.seen
    }

    pub(crate) fn saved(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn add_event(&mut self, priority: Priority, event: T) {
        self.seen += 1;
        let entry = PoolEntry {
            priority,
            order: self.next_order,
            event,
        };
        self.next_order += 1;
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
            return;
        }
        match self.heap.peek() {
            Some(Reverse(min)) if priority > min.priority => {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
            _ => {}
        }
    }

    fn merge(&mut self, other: EventPool<T>) {
        let all_seen = self.seen + other.seen;
        for Reverse(entry) in other.heap {
            self.add_event(entry.priority, entry.event);
        }
        self.seen = all_seen;
    }

    /// Merge back a pool whose harvest send failed, preserving each event's
    /// original sampling priority. Gives up after the retry limit.
    pub(crate) fn merge_failed(&mut self, other: EventPool<T>) {
        let fails = other.failed_harvests + 1;
        if fails >= FAILED_EVENTS_ATTEMPTS_LIMIT {
            tracing::warn!("dropping events after {fails} failed harvest attempts");
            return;
        }
        self.failed_harvests = fails;
        self.merge(other);
    }

    /// Halve the pool for a payload-too-large retry. Both halves keep the
    /// capacity and failure count; `seen` is split evenly.
    pub(crate) fn split(self) -> (EventPool<T>, EventPool<T>) {
        let entries = self.heap.into_vec();
        let mid = entries.len() / 2;
        let mut first = EventPool::new(self.capacity);
        let mut second = EventPool::new(self.capacity);
        first.failed_harvests = self.failed_harvests;
        second.failed_harvests = self.failed_harvests;
        for (i, Reverse(entry)) in entries.into_iter().enumerate() {
            let target = if i < mid { &mut first } else { &mut second };
            target.add_event(entry.priority, entry.event);
        }
        first.seen = self.seen / 2;
        second.seen = self.seen - self.seen / 2;
        (first, second)
    }
}

impl<T: Serialize> EventPool<T> {
    pub(crate) fn collector_json(
        &self,
        run_id: &str,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        if self.saved() == 0 {
            return Ok(None);
        }
        let events: Vec<&T> = self.heap.iter().map(|Reverse(e)| &e.event).collect();
        let payload = json!([
            run_id,
            {
                "reservoir_size": self.capacity,
                "events_seen": self.seen,
            },
            events,
        ]);
        serde_json::to_vec(&payload).map(Some)
    }
}

fn timestamp_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1_000.0
}

#[derive(Debug, thiserror::Error)]
pub enum CustomEventError {
    #[error("custom events are disabled")]
    Disabled,
    #[error("custom event type '{0}' does not match ^[a-zA-Z0-9:_ ]+$")]
    InvalidType(String),
    #[error("custom event has more than {0} attributes")]
    TooManyAttributes(usize),
    #[error(transparent)]
    Attribute(#[from] AttributeError),
}

static EVENT_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9:_ ]+$").expect("static event type regex"));

/// A user-recorded event. Wire form:
/// `[{"type":T,"timestamp":ts}, {params}, {}]`.
#[derive(Debug)]
pub(crate) struct CustomEvent {
    event_type: String,
    timestamp: DateTime<Utc>,
    params: Vec<(String, AttributeValue)>,
}

impl CustomEvent {
    pub(crate) fn new(
        event_type: String,
        params: Vec<(String, AttributeValue)>,
        now: DateTime<Utc>,
    ) -> Result<CustomEvent, CustomEventError> {
        if event_type.len() > CUSTOM_EVENT_TYPE_LENGTH_LIMIT || !EVENT_TYPE_RE.is_match(&event_type)
        {
            return Err(CustomEventError::InvalidType(event_type));
        }
        if params.len() > ATTRIBUTE_USER_LIMIT {
            return Err(CustomEventError::TooManyAttributes(ATTRIBUTE_USER_LIMIT));
        }
        let mut validated = Vec::with_capacity(params.len());
        for (key, value) in params {
            validate_attribute_key(&key)?;
            validated.push((key, value.truncated()));
        }
        Ok(CustomEvent {
            event_type,
            timestamp: now,
            params: validated,
        })
    }
}

impl Serialize for CustomEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&json!({
            "type": self.event_type,
            "timestamp": timestamp_secs(self.timestamp),
        }))?;
        let params: serde_json::Map<String, serde_json::Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        seq.serialize_element(&params)?;
        seq.serialize_element(&json!({}))?;
        seq.end()
    }
}

/// Per-transaction analytics event. Wire form:
/// `[{intrinsics}, {userAttrs}, {agentAttrs}]`.
#[derive(Debug)]
pub(crate) struct TxnEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub zone: ApdexZone,
    pub queue_duration: Option<Duration>,
    pub external_call_count: u64,
    pub external_duration: Duration,
    pub datastore_call_count: u64,
    pub datastore_duration: Duration,
    pub attrs: Arc<Attributes>,
}

impl Serialize for TxnEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut intrinsics = serde_json::Map::new();
        intrinsics.insert("type".into(), "Transaction".into());
        intrinsics.insert("name".into(), self.name.clone().into());
        intrinsics.insert("timestamp".into(), timestamp_secs(self.timestamp).into());
        intrinsics.insert("duration".into(), self.duration.as_secs_f64().into());
        if let Some(zone) = self.zone.label() {
            intrinsics.insert("nr.apdexPerfZone".into(), zone.into());
        }
        if let Some(q) = self.queue_duration {
            intrinsics.insert("queueDuration".into(), q.as_secs_f64().into());
        }
        if self.external_call_count > 0 {
            intrinsics.insert("externalCallCount".into(), self.external_call_count.into());
            intrinsics.insert(
                "externalDuration".into(),
                self.external_duration.as_secs_f64().into(),
            );
        }
        if self.datastore_call_count > 0 {
            intrinsics.insert("databaseCallCount".into(), self.datastore_call_count.into());
            intrinsics.insert(
                "databaseDuration".into(),
                self.datastore_duration.as_secs_f64().into(),
            );
        }
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&intrinsics)?;
        seq.serialize_element(&self.attrs.user_json(Destinations::TXN_EVENTS))?;
        seq.serialize_element(&self.attrs.agent_json(Destinations::TXN_EVENTS))?;
        seq.end()
    }
}

/// Event emitted for each captured transaction error.
#[derive(Debug)]
pub(crate) struct ErrorEvent {
    pub klass: String,
    pub msg: String,
    pub when: DateTime<Utc>,
    pub txn_name: String,
    pub duration: Duration,
    pub queue_duration: Option<Duration>,
    pub attrs: Arc<Attributes>,
}

impl Serialize for ErrorEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut intrinsics = serde_json::Map::new();
        intrinsics.insert("type".into(), "TransactionError".into());
        intrinsics.insert("error.class".into(), self.klass.clone().into());
        intrinsics.insert("error.message".into(), self.msg.clone().into());
        intrinsics.insert("timestamp".into(), timestamp_secs(self.when).into());
        intrinsics.insert("transactionName".into(), self.txn_name.clone().into());
        intrinsics.insert("duration".into(), self.duration.as_secs_f64().into());
        if let Some(q) = self.queue_duration {
            intrinsics.insert("queueDuration".into(), q.as_secs_f64().into());
        }
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&intrinsics)?;
        seq.serialize_element(&self.attrs.user_json(Destinations::ERROR_TRACES))?;
        seq.serialize_element(&self.attrs.agent_json(Destinations::ERROR_TRACES))?;
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> EventPool<i32> {
        EventPool::new(capacity)
    }

    #[test]
    fn reservoir_keeps_highest_priorities() {
        let mut p = pool(3);
        for (i, pr) in [0.1, 0.9, 0.2, 0.8, 0.3].into_iter().enumerate() {
            p.add_event(Priority::fixed(pr), i as i32);
        }
        assert_eq!(p.seen(), 5);
        assert_eq!(p.saved(), 3);
        let mut kept: Vec<f32> = p
            .heap
            .iter()
            .map(|Reverse(e)| e.priority.value())
            .collect();
        kept.sort_by(f32::total_cmp);
        assert_eq!(kept, vec![0.3, 0.8, 0.9]);
    }

    #[test]
    fn under_capacity_keeps_everything() {
        let mut p = pool(10);
        for i in 0..4 {
            p.add_event(Priority::fixed(i as f32 / 10.0), i);
        }
        assert_eq!(p.saved(), 4);
        assert_eq!(p.seen(), 4);
    }

    #[test]
    fn equal_priority_does_not_evict() {
        let mut p = pool(1);
        p.add_event(Priority::fixed(0.5), 1);
        p.add_event(Priority::fixed(0.5), 2);
        assert_eq!(p.saved(), 1);
        assert_eq!(p.seen(), 2);
        let Reverse(kept) = p.heap.peek().unwrap();
        assert_eq!(kept.event, 1);
    }

    #[test]
    fn merge_failed_is_monotonic() {
        let mut a = pool(10);
        a.add_event(Priority::fixed(0.1), 1);
        let mut b = pool(10);
        b.add_event(Priority::fixed(0.2), 2);
        b.add_event(Priority::fixed(0.3), 3);

        let (seen_before, saved_before) = (a.seen(), a.saved());
        a.merge_failed(b);
        assert!(a.seen() >= seen_before + 2);
        assert!(a.saved() >= saved_before);
        assert_eq!(a.failed_harvests, 1);
    }

    #[test]
    fn merge_failed_drops_after_attempt_limit() {
        let mut a = pool(10);
        let mut b = pool(10);
        b.add_event(Priority::fixed(0.9), 7);
        b.failed_harvests = FAILED_EVENTS_ATTEMPTS_LIMIT - 1;
        a.merge_failed(b);
        assert_eq!(a.saved(), 0);
    }

    #[test]
    fn split_conserves_seen_and_events() {
        let mut p = pool(10);
        for i in 0..7 {
            p.add_event(Priority::fixed(i as f32 / 10.0), i);
        }
        let (a, b) = p.split();
        assert_eq!(a.seen() + b.seen(), 7);
        assert_eq!(a.saved() + b.saved(), 7);
    }

    #[test]
    fn collector_json_shape_and_empty() {
        let mut p = pool(3);
        assert!(p.collector_json("1").unwrap().is_none());
        p.add_event(Priority::fixed(0.5), 42);
        let bytes = p.collector_json("1").unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v[0], "1");
        assert_eq!(v[1]["reservoir_size"], 3);
        assert_eq!(v[1]["events_seen"], 1);
        assert_eq!(v[2][0], 42);
    }

    #[test]
    fn custom_event_validation() {
        let now = Utc::now();
        assert!(CustomEvent::new("myEvent".into(), vec![], now).is_ok());
        assert!(matches!(
            CustomEvent::new("bad/type".into(), vec![], now),
            Err(CustomEventError::InvalidType(_))
        ));
        let too_many: Vec<_> = (0..65)
            .map(|i| (format!("k{i}"), AttributeValue::from(i as i64)))
            .collect();
        assert!(matches!(
            CustomEvent::new("ok".into(), too_many, now),
            Err(CustomEventError::TooManyAttributes(_))
        ));
    }

    #[test]
    fn custom_event_wire_form() {
        let now = Utc::now();
        let e = CustomEvent::new(
            "Purchase".into(),
            vec![("amount".to_string(), AttributeValue::from(9.99f64))],
            now,
        )
        .unwrap();
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v[0]["type"], "Purchase");
        assert!(v[0]["timestamp"].is_f64());
        assert_eq!(v[1]["amount"], 9.99);
        assert_eq!(v[2], json!({}));
    }
}
