use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use quire_common::protocol::ws::CLIENT_MESSAGE_TYPES;

/// Frame labels recorded as-is besides the client message types. Anything
/// else is counted under [`UNKNOWN_FRAME_LABEL`].
const RELAY_FRAME_LABELS: &[&str] = &["malformed", "binary"];
const UNKNOWN_FRAME_LABEL: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

/// Counters and gauges for one relay node. Owned by the node and shared by
/// reference; there is no process-wide instance.
#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_frames_total: Mutex<HashMap<String, u64>>,
    ws_frame_errors_total: Mutex<HashMap<String, u64>>,
    ws_connections: AtomicU64,
    peer_sessions_open: AtomicU64,
    presence_store_failures_total: AtomicU64,
    peer_adapter_failures_total: AtomicU64,
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    /// Counts an inbound websocket frame by its `type`.
    pub fn record_ws_frame(&self, message_type: &str) {
        increment_label_counter(&self.ws_frames_total, normalize_frame_label(message_type), 1);
    }

    /// Counts a frame that was dropped. `message_type` is `"malformed"` when
    /// the envelope itself could not be read; types the protocol does not
    /// define all land in `"unknown"`.
    pub fn record_ws_frame_error(&self, message_type: &str) {
        increment_label_counter(
            &self.ws_frame_errors_total,
            normalize_frame_label(message_type),
            1,
        );
    }

    pub fn connection_opened(&self) {
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connection_closed(&self) {
        saturating_decrement(&self.ws_connections);
    }

    pub fn peer_session_opened(&self) {
        self.peer_sessions_open.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peer_session_closed(&self) {
        saturating_decrement(&self.peer_sessions_open);
    }

    pub fn increment_presence_store_failures(&self) {
        self.presence_store_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_peer_adapter_failures(&self) {
        self.peer_adapter_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn ws_connections(&self) -> u64 {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn peer_sessions_open(&self) -> u64 {
        self.peer_sessions_open.load(Ordering::SeqCst)
    }

    pub fn ws_frame_errors(&self, message_type: &str) -> u64 {
        let guard = self.ws_frame_errors_total.lock().expect("metrics map lock poisoned");
        guard.get(message_type).copied().unwrap_or(0)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_frames_total Inbound websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_frames_total counter\n");
        append_type_counter_lines(&mut output, "relay_ws_frames_total", &self.ws_frames_total);

        output.push_str("# HELP relay_ws_frame_errors_total Dropped websocket frames by type.\n");
        output.push_str("# TYPE relay_ws_frame_errors_total counter\n");
        append_type_counter_lines(
            &mut output,
            "relay_ws_frame_errors_total",
            &self.ws_frame_errors_total,
        );

        append_scalar(
            &mut output,
            "relay_ws_connections",
            "Live websocket connections on this node.",
            "gauge",
            self.ws_connections.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_peer_sessions_open",
            "Open CRDT peer sessions on this node.",
            "gauge",
            self.peer_sessions_open.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_presence_store_failures_total",
            "Presence store or bus operations that failed.",
            "counter",
            self.presence_store_failures_total.load(Ordering::SeqCst),
        );
        append_scalar(
            &mut output,
            "relay_peer_adapter_failures_total",
            "Peer sessions torn down after an adapter error.",
            "counter",
            self.peer_adapter_failures_total.load(Ordering::SeqCst),
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut segments = Vec::new();
    let mut previous = "";
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        // Document ids are client-chosen strings; collapse them so label
        // cardinality stays bounded.
        if previous == "doc" {
            segments.push("{docId}".to_string());
        } else if segment.chars().all(|character| character.is_ascii_digit()) {
            segments.push("{number}".to_string());
        } else {
            segments.push(segment.to_string());
        }
        previous = segment;
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

// Frame types come straight from clients; keep the label set closed.
fn normalize_frame_label(label: &str) -> &'static str {
    CLIENT_MESSAGE_TYPES
        .iter()
        .chain(RELAY_FRAME_LABELS)
        .find(|known| **known == label)
        .copied()
        .unwrap_or(UNKNOWN_FRAME_LABEL)
}

fn saturating_decrement(value: &AtomicU64) {
    let _ = value.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_sub(1))
    });
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_type_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{type=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_scalar(output: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
