//! Request counters rendered in the Prometheus text format. The scrape
//! surface is small enough that no client library is pulled in; the counters
//! are plain integers behind one mutex.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    requests_total: u64,
    requests_by_endpoint: HashMap<String, u64>,
    responses_by_status: HashMap<u16, u64>,
    upstream_retries_total: u64,
    upstream_exhausted_total: u64,
    moderation_flagged_total: u64,
}

impl Metrics {
    pub fn record_request(&self, path: &str) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.requests_total += 1;
        *inner
            .requests_by_endpoint
            .entry(path.trim_end_matches('/').to_string())
            .or_default() += 1;
    }

    pub fn record_response(&self, status: u16) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        *inner.responses_by_status.entry(status).or_default() += 1;
    }

    pub fn record_retry(&self) {
        self.inner.lock().expect("metrics mutex poisoned").upstream_retries_total += 1;
    }

    pub fn record_exhausted(&self) {
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .upstream_exhausted_total += 1;
    }

    pub fn record_flagged(&self) {
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .moderation_flagged_total += 1;
    }

    pub fn render(&self) -> String {
        let inner = self.inner.lock().expect("metrics mutex poisoned");
        let mut out = String::new();

        write_counter(
            &mut out,
            "llm_dispatcher_requests_total",
            "Total dispatched requests.",
            inner.requests_total,
        );

        write_counter_map(
            &mut out,
            "llm_dispatcher_requests_by_endpoint_total",
            "Dispatched requests grouped by endpoint path.",
            "path",
            inner
                .requests_by_endpoint
                .iter()
                .map(|(k, v)| (k.clone(), *v)),
        );

        write_counter_map(
            &mut out,
            "llm_dispatcher_responses_by_status_total",
            "Responses grouped by downstream status code.",
            "status",
            inner
                .responses_by_status
                .iter()
                .map(|(k, v)| (k.to_string(), *v)),
        );

        write_counter(
            &mut out,
            "llm_dispatcher_upstream_retries_total",
            "Upstream attempts retried on another candidate.",
            inner.upstream_retries_total,
        );
        write_counter(
            &mut out,
            "llm_dispatcher_upstream_exhausted_total",
            "Requests that ran out of upstream candidates.",
            inner.upstream_exhausted_total,
        );
        write_counter(
            &mut out,
            "llm_dispatcher_moderation_flagged_total",
            "Requests vetoed by the moderation gate.",
            inner.moderation_flagged_total,
        );

        out
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn write_counter_map(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    entries: impl Iterator<Item = (String, u64)>,
) {
    let mut entries: Vec<(String, u64)> = entries.collect();
    if entries.is_empty() {
        return;
    }
    entries.sort();

    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (key, value) in entries {
        out.push_str(&format!(
            "{name}{{{label}=\"{}\"}} {value}\n",
            escape_label(&key)
        ));
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_recorded_series() {
        let metrics = Metrics::default();
        metrics.record_request("/v1/chat/completions");
        metrics.record_request("/v1/chat/completions/");
        metrics.record_request("/v1/embeddings");
        metrics.record_response(200);
        metrics.record_retry();
        metrics.record_exhausted();
        metrics.record_flagged();

        let text = metrics.render();
        assert!(text.contains("llm_dispatcher_requests_total 3"));
        assert!(text.contains(
            "llm_dispatcher_requests_by_endpoint_total{path=\"/v1/chat/completions\"} 2"
        ));
        assert!(text.contains("llm_dispatcher_responses_by_status_total{status=\"200\"} 1"));
        assert!(text.contains("llm_dispatcher_upstream_retries_total 1"));
        assert!(text.contains("llm_dispatcher_upstream_exhausted_total 1"));
        assert!(text.contains("llm_dispatcher_moderation_flagged_total 1"));
        assert!(text.contains("# TYPE llm_dispatcher_requests_total counter"));
    }

    #[test]
    fn labels_are_escaped() {
        assert_eq!(escape_label("a\"b\\c"), "a\\\"b\\\\c");
    }
}
