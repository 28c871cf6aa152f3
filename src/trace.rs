use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::attributes::{Attributes, Destinations};
use crate::errors::StackTrace;

/// Optional detail attached to a trace node depending on segment kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct TraceNodeParams {
    pub backtrace: Option<StackTrace>,
    pub clean_url: Option<String>,
    pub database_name: Option<String>,
    pub host: Option<String>,
    pub port_path_or_id: Option<String>,
    pub query: Option<String>,
    pub query_parameters: Option<serde_json::Map<String, Value>>,
}

impl TraceNodeParams {
    fn to_json(&self) -> Value {
        let mut m = serde_json::Map::new();
        if let Some(bt) = &self.backtrace {
            if let Ok(v) = serde_json::to_value(bt) {
                m.insert("backtrace".into(), v);
            }
        }
        if let Some(u) = &self.clean_url {
            m.insert("uri".into(), u.clone().into());
        }
        if let Some(db) = &self.database_name {
            m.insert("database_name".into(), db.clone().into());
        }
        if let Some(h) = &self.host {
            m.insert("host".into(), h.clone().into());
        }
        if let Some(p) = &self.port_path_or_id {
            m.insert("port_path_or_id".into(), p.clone().into());
        }
        if let Some(q) = &self.query {
            m.insert("query".into(), q.clone().into());
        }
        if let Some(qp) = &self.query_parameters {
            if !qp.is_empty() {
                m.insert("query_parameters".into(), Value::Object(qp.clone()));
            }
        }
        Value::Object(m)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TraceNode {
    pub start: Duration,
    pub stop: Duration,
    pub duration: Duration,
    pub name: String,
    pub params: TraceNodeParams,
    seq: u64,
}

impl PartialEq for TraceNode {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration && self.seq == other.seq
    }
}
impl Eq for TraceNode {}
impl PartialOrd for TraceNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TraceNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration
            .cmp(&other.duration)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Online selection of the slowest segments in one transaction: a min-heap
/// of at most `max_nodes` nodes keyed by duration. An over-budget node only
/// displaces the shortest retained one.
#[derive(Debug)]
pub(crate) struct TraceBuilder {
    heap: BinaryHeap<Reverse<TraceNode>>,
    max_nodes: usize,
    segment_threshold: Duration,
    stack_trace_threshold: Duration,
    next_seq: u64,
}

impl TraceBuilder {
    pub(crate) fn new(
        max_nodes: usize,
        segment_threshold: Duration,
        stack_trace_threshold: Duration,
    ) -> TraceBuilder {
        TraceBuilder {
            heap: BinaryHeap::new(),
            max_nodes,
            segment_threshold,
            stack_trace_threshold,
            next_seq: 0,
        }
    }

    pub(crate) fn witness(
        &mut self,
        start: Duration,
        stop: Duration,
        name: String,
        mut params: TraceNodeParams,
    ) {
        let duration = stop.saturating_sub(start);
        if duration < self.segment_threshold {
            return;
        }
        if duration >= self.stack_trace_threshold && params.backtrace.is_none() {
            params.backtrace = Some(StackTrace::capture());
        }
        let node = TraceNode {
            start,
            stop,
            duration,
            name,
            params,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        if self.heap.len() < self.max_nodes {
            self.heap.push(Reverse(node));
            return;
        }
        match self.heap.peek() {
            Some(Reverse(min)) if node.duration > min.duration => {
                self.heap.pop();
                self.heap.push(Reverse(node));
            }
            _ => {}
        }
    }

    pub(crate) fn into_nodes(self) -> Vec<TraceNode> {
        self.heap.into_vec().into_iter().map(|Reverse(n)| n).collect()
    }
}

/// A completed transaction trace candidate.
#[derive(Debug)]
pub(crate) struct TxnTrace {
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub final_name: String,
    pub request_uri: Option<String>,
    pub nodes: Vec<TraceNode>,
    pub attrs: Arc<Attributes>,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

impl TxnTrace {
    // Sort retained nodes by start time (longest-enclosing first on ties)
    // and re-link by containment. Indices avoid parent pointers entirely.
    fn tree_json(&self) -> Value {
        let mut order: Vec<usize> = (0..self.nodes.len()).collect();
        order.sort_by(|&a, &b| {
            let (na, nb) = (&self.nodes[a], &self.nodes[b]);
            na.start
                .cmp(&nb.start)
                .then(nb.stop.cmp(&na.stop))
                .then(na.seq.cmp(&nb.seq))
        });

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        let mut roots: Vec<usize> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        for &i in &order {
            let node = &self.nodes[i];
            while let Some(&top) = stack.last() {
                if node.start >= self.nodes[top].stop {
                    stack.pop();
                } else {
                    break;
                }
            }
            match stack.last() {
                Some(&parent) => children[parent].push(i),
                None => roots.push(i),
            }
            stack.push(i);
        }

        let root_children: Vec<Value> = roots
            .iter()
            .map(|&i| self.node_json(i, &children))
            .collect();
        json!([0.0, millis(self.duration), "ROOT", {}, root_children])
    }

    fn node_json(&self, i: usize, children: &[Vec<usize>]) -> Value {
        let node = &self.nodes[i];
        let kids: Vec<Value> = children[i]
            .iter()
            .map(|&c| self.node_json(c, children))
            .collect();
        json!([
            millis(node.start),
            millis(node.stop),
            node.name,
            node.params.to_json(),
            kids,
        ])
    }

    fn collector_entry(&self) -> Value {
        let trace_data = json!([
            0.0,
            {},
            {},
            self.tree_json(),
            {
                "agentAttributes": self.attrs.agent_json(Destinations::TXN_TRACES),
                "userAttributes": self.attrs.user_json(Destinations::TXN_TRACES),
                "intrinsics": {},
            },
        ]);
        json!([
            self.start.timestamp_millis(),
            millis(self.duration),
            self.final_name,
            self.request_uri,
            trace_data,
            "",
            Value::Null,
            false,
            Value::Null,
            Value::Null,
        ])
    }
}

/// Per-harvest trace selection: keeps only the single longest completed
/// transaction trace.
#[derive(Debug, Default)]
pub(crate) struct HarvestTraces {
    longest: Option<TxnTrace>,
}

impl HarvestTraces {
    pub(crate) fn new() -> HarvestTraces {
        HarvestTraces { longest: None }
    }

    pub(crate) fn witness(&mut self, trace: TxnTrace) {
        let replace = match &self.longest {
            Some(current) => trace.duration > current.duration,
            None => true,
        };
        if replace {
            self.longest = Some(trace);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.longest.is_none()
    }

    pub(crate) fn collector_json(
        &self,
        run_id: &str,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        let Some(trace) = &self.longest else {
            return Ok(None);
        };
        serde_json::to_vec(&json!([run_id, [trace.collector_entry()]])).map(Some)
    }

    #[cfg(test)]
    pub(crate) fn longest_duration(&self) -> Option<Duration> {
        self.longest.as_ref().map(|t| t.duration)
    }
}
