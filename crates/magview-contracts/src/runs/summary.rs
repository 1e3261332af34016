use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

/// Terminal record of one pipeline run, written into the run directory at
/// every terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub channel: String,
    pub message_ts: String,
    pub file_id: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<String>,
    pub outcome: String,
    pub delivered: bool,
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(summary.run_id.clone()));
    payload.insert(
        "channel".to_string(),
        Value::String(summary.channel.clone()),
    );
    payload.insert(
        "message_ts".to_string(),
        Value::String(summary.message_ts.clone()),
    );
    payload.insert(
        "file_id".to_string(),
        summary
            .file_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "stages".to_string(),
        Value::Array(
            summary
                .stages
                .iter()
                .cloned()
                .map(Value::String)
                .collect(),
        ),
    );
    payload.insert(
        "outcome".to_string(),
        Value::String(summary.outcome.clone()),
    );
    payload.insert("delivered".to_string(), Value::Bool(summary.delivered));
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, RunSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = RunSummary {
            run_id: "run-123".to_string(),
            channel: "C42".to_string(),
            message_ts: "1700000000.000100".to_string(),
            file_id: Some("F9".to_string()),
            started_at: "2026-08-07T00:00:00+00:00".to_string(),
            finished_at: "2026-08-07T00:00:04+00:00".to_string(),
            stages: vec![
                "received".to_string(),
                "validating".to_string(),
                "fetching".to_string(),
            ],
            outcome: "fetch_error".to_string(),
            delivered: false,
        };
        let mut extra = Map::new();
        extra.insert("cause".to_string(), Value::String("timeout".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["run_id"], json!("run-123"));
        assert_eq!(parsed["channel"], json!("C42"));
        assert_eq!(parsed["file_id"], json!("F9"));
        assert_eq!(parsed["stages"], json!(["received", "validating", "fetching"]));
        assert_eq!(parsed["outcome"], json!("fetch_error"));
        assert_eq!(parsed["delivered"], json!(false));
        assert_eq!(parsed["cause"], json!("timeout"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }

    #[test]
    fn missing_file_id_serializes_as_null() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");
        let summary = RunSummary {
            run_id: "run-1".to_string(),
            channel: "C1".to_string(),
            message_ts: "1.2".to_string(),
            file_id: None,
            started_at: "2026-08-07T00:00:00+00:00".to_string(),
            finished_at: "2026-08-07T00:00:01+00:00".to_string(),
            stages: vec!["received".to_string(), "validating".to_string()],
            outcome: "missing_attachment".to_string(),
            delivered: false,
        };
        write_summary(&path, &summary, None)?;
        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["file_id"], Value::Null);
        Ok(())
    }
}
