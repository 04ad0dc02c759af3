//! Prometheus text exposition format.

use crate::collector::JobMetricsSnapshot;

type Field = fn(&JobMetricsSnapshot) -> u64;

const SERIES: [(&str, &str, &str, Field); 9] = [
    ("relaygrid_messages_delivered_total", "counter", "Messages delivered to the destination.", |s| s.delivered),
    ("relaygrid_messages_skipped_total", "counter", "Messages skipped after permanent or exhausted failures.", |s| s.skipped),
    ("relaygrid_placeholders_sent_total", "counter", "Placeholder posts sent for missing messages.", |s| s.placeholders),
    ("relaygrid_delivery_retries_total", "counter", "Delivery attempts retried after transient failures.", |s| s.retried),
    ("relaygrid_rate_limited_total", "counter", "Responses with HTTP 429.", |s| s.rate_limited),
    ("relaygrid_source_errors_total", "counter", "Failed source polls.", |s| s.source_errors),
    ("relaygrid_worker_restarts_total", "counter", "Worker restarts after crash or stall.", |s| s.restarts),
    ("relaygrid_workers_running", "gauge", "Workers currently running.", |s| s.running_workers),
    ("relaygrid_workers_desired", "gauge", "Workers the job should have.", |s| s.desired_workers),
];

/// Render job snapshots into Prometheus text format with `job` labels.
pub fn render_prometheus(snapshots: &[JobMetricsSnapshot]) -> String {
    let mut out = String::new();
    for (name, kind, help, field) in SERIES {
        out.push_str(&format!("# HELP {name} {help}\n"));
        out.push_str(&format!("# TYPE {name} {kind}\n"));
        for s in snapshots {
            out.push_str(&format!(
                "{name}{{job=\"{}\"}} {}\n",
                escape_label(&s.job),
                field(s)
            ));
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
