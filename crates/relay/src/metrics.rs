use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_events_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    active_connections: AtomicU64,
    messages_appended_total: AtomicU64,
    mention_notifications_total: AtomicU64,
    operations_applied_total: AtomicU64,
    operations_rejected_total: AtomicU64,
    lock_conflicts_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_rate_total: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_duration_count: Mutex::new(HashMap::new()),
            ws_events_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            active_connections: AtomicU64::new(0),
            messages_appended_total: AtomicU64::new(0),
            mention_notifications_total: AtomicU64::new(0),
            operations_applied_total: AtomicU64::new(0),
            operations_rejected_total: AtomicU64::new(0),
            lock_conflicts_total: AtomicU64::new(0),
        }
    }
}

/// The process-wide registry, installed on first use.
pub fn global_metrics() -> &'static Arc<RelayMetrics> {
    GLOBAL_METRICS.get_or_init(|| Arc::new(RelayMetrics::default()))
}

pub fn record_ws_event(event: &str, is_error: bool) {
    global_metrics().record_ws_event(event, is_error);
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    global_metrics().record_http_request(method, path, status_code, latency_ms);
}

pub fn set_active_connections(count: usize) {
    global_metrics().active_connections.store(count as u64, Ordering::SeqCst);
}

pub fn increment_messages_appended() {
    global_metrics().messages_appended_total.fetch_add(1, Ordering::SeqCst);
}

pub fn add_mention_notifications(count: usize) {
    global_metrics().mention_notifications_total.fetch_add(count as u64, Ordering::SeqCst);
}

pub fn increment_operations_applied() {
    global_metrics().operations_applied_total.fetch_add(1, Ordering::SeqCst);
}

pub fn increment_operations_rejected() {
    global_metrics().operations_rejected_total.fetch_add(1, Ordering::SeqCst);
}

pub fn increment_lock_conflicts() {
    global_metrics().lock_conflicts_total.fetch_add(1, Ordering::SeqCst);
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

    pub fn record_ws_event(&self, event: &str, is_error: bool) {
        let label = normalize_event_label(event);
        increment_label_counter(&self.ws_events_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
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

        output.push_str("# HELP relay_ws_events_total Total inbound websocket events by name.\n");
        output.push_str("# TYPE relay_ws_events_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_events_total", &self.ws_events_total);

        output.push_str(
            "# HELP relay_ws_errors_total Inbound websocket events answered with an error.\n",
        );
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        append_scalar(
            &mut output,
            "relay_active_connections",
            "gauge",
            "Currently registered websocket connections.",
            &self.active_connections,
        );
        append_scalar(
            &mut output,
            "relay_messages_appended_total",
            "counter",
            "Chat messages appended across all channels.",
            &self.messages_appended_total,
        );
        append_scalar(
            &mut output,
            "relay_mention_notifications_total",
            "counter",
            "Targeted mention notifications delivered.",
            &self.mention_notifications_total,
        );
        append_scalar(
            &mut output,
            "relay_operations_applied_total",
            "counter",
            "Collaborative operations sequenced and applied.",
            &self.operations_applied_total,
        );
        append_scalar(
            &mut output,
            "relay_operations_rejected_total",
            "counter",
            "Collaborative operations rejected without side effects.",
            &self.operations_rejected_total,
        );
        append_scalar(
            &mut output,
            "relay_lock_conflicts_total",
            "counter",
            "Edit lock requests refused because another identity holds the field.",
            &self.lock_conflicts_total,
        );

        output
    }
}

fn append_scalar(output: &mut String, name: &str, kind: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {}\n", value.load(Ordering::SeqCst)));
}

fn normalize_endpoint(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|segment| !segment.is_empty()).collect();
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn normalize_event_label(event: &str) -> String {
    let normalized = event.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
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

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{event=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::RelayMetrics;

    #[test]
    fn render_prometheus_includes_http_ws_and_collab_counters() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("get", "/messages/", 200, 15);
        metrics.record_http_request("GET", "/messages", 404, 5);
        metrics.record_ws_event("send_message", false);
        metrics.record_ws_event("send_message", true);
        metrics.record_ws_event("  ", false);
        metrics.operations_applied_total.fetch_add(3, Ordering::SeqCst);
        metrics.lock_conflicts_total.fetch_add(1, Ordering::SeqCst);

        let rendered = metrics.render_prometheus();

        assert!(rendered
            .contains("relay_request_rate_total{method=\"GET\",endpoint=\"/messages\"} 2"));
        assert!(rendered
            .contains("relay_request_errors_total{method=\"GET\",endpoint=\"/messages\"} 1"));
        assert!(rendered.contains("relay_request_duration_ms_sum{method=\"GET\",endpoint=\"/messages\"} 20"));
        assert!(rendered.contains("relay_ws_events_total{event=\"send_message\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{event=\"send_message\"} 1"));
        assert!(rendered.contains("relay_ws_events_total{event=\"unknown\"} 1"));
        assert!(rendered.contains("relay_operations_applied_total 3"));
        assert!(rendered.contains("relay_lock_conflicts_total 1"));
        assert!(rendered.contains("# TYPE relay_active_connections gauge"));
    }

    #[test]
    fn label_values_are_escaped() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_event("bad\"name", false);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_ws_events_total{event=\"bad\\\"name\"} 1"));
    }
}
