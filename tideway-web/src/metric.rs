//! Metric ingest from the collector.
//!
//! The collector POSTs a JSON array of counter samples. Only
//! `ost_jobstats_samples` entries tagged `optype=sum_write_bytes` are
//! consumed; everything malformed or unmatched is skipped silently and the
//! collector always gets a 200 so it never buffers against us.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::AppState;

const JOBSTATS_SERIES: &str = "ost_jobstats_samples";
const WRITE_OPTYPE: &str = "sum_write_bytes";

#[derive(Debug, Deserialize)]
struct MetricEntry {
    meta: MetricMeta,
    values: Vec<f64>,
    time: f64,
}

#[derive(Debug, Deserialize)]
struct MetricMeta {
    tsdb_name: String,
    tsdb_tags: String,
}

/// Parse a whitespace-separated `key=value` tag string. Any pair that is
/// not exactly `key=value` invalidates the whole string.
fn parse_tags(tsdb_tags: &str) -> Option<HashMap<&str, &str>> {
    let mut tags = HashMap::new();
    for pair in tsdb_tags.split_whitespace() {
        let mut parts = pair.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                tags.insert(key, value);
            }
            _ => {
                debug!(tsdb_tags, "invalid tsdb tag string");
                return None;
            }
        }
    }
    Some(tags)
}

pub async fn metric_post(
    State(state): State<AppState>,
    Json(entries): Json<Vec<Value>>,
) -> &'static str {
    let mut session = state.session.lock().await;
    for raw in entries {
        let Ok(entry) = serde_json::from_value::<MetricEntry>(raw) else {
            continue;
        };
        if entry.meta.tsdb_name != JOBSTATS_SERIES {
            continue;
        }
        let Some(tags) = parse_tags(&entry.meta.tsdb_tags) else {
            continue;
        };
        if tags.get("optype").copied() != Some(WRITE_OPTYPE) {
            continue;
        }
        let (Some(service_id), Some(job_id)) = (tags.get("ost_index"), tags.get("job_id")) else {
            continue;
        };
        let Some(value) = entry.values.first().copied() else {
            continue;
        };
        if !session.on_metric(service_id, job_id, entry.time, value) {
            debug!(job_id, "sample for unwatched job dropped");
        }
    }
    "Succeeded"
}
