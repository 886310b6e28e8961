//! NDJSON records emitted by the agent in `--output-format json` mode.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

/// One decoded line of agent output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    /// A JSON object emitted by the agent.
    Json(Value),
    /// Anything that did not decode as a JSON object.
    Text(String),
}

impl OutputRecord {
    /// Decode a line, falling back to a text record on any parse failure.
    pub fn from_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value @ Value::Object(_)) => OutputRecord::Json(value),
            _ => OutputRecord::Text(line.to_string()),
        }
    }

    /// JSON view of the record; text lines become `{"type":"text","content":..}`.
    pub fn to_value(&self) -> Value {
        match self {
            OutputRecord::Json(value) => value.clone(),
            OutputRecord::Text(content) => json!({ "type": "text", "content": content }),
        }
    }

    /// Human-readable text carried by the record.
    pub fn text(&self) -> String {
        match self {
            OutputRecord::Text(content) => content.clone(),
            OutputRecord::Json(value) => value
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
        }
    }
}

/// Records we look for in the agent's stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum AgentRecord {
    #[serde(rename = "result")]
    Result(ResultRecord),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultRecord {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    duration_ms: u64,
}

/// What the agent reported as its final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalOutput {
    pub text: String,
    pub is_error: bool,
    /// Agent-reported duration, when it sent one.
    pub duration: Option<Duration>,
}

/// Extract the final answer from captured stdout.
///
/// Prefers the first `{"type":"result"}` record. Without one, the text of
/// every record is joined; if that is empty too, the raw output is returned.
pub fn final_output(stdout: &str) -> FinalOutput {
    let records: Vec<OutputRecord> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(OutputRecord::from_line)
        .collect();

    let result = records.iter().find_map(|record| match record {
        OutputRecord::Json(value) => match serde_json::from_value::<AgentRecord>(value.clone()) {
            Ok(AgentRecord::Result(result)) => Some(result),
            _ => None,
        },
        OutputRecord::Text(_) => None,
    });

    if let Some(result) = result {
        return FinalOutput {
            text: result.result.unwrap_or_default(),
            is_error: result.is_error,
            duration: (result.duration_ms > 0).then(|| Duration::from_millis(result.duration_ms)),
        };
    }

    let joined = records
        .iter()
        .map(OutputRecord::text)
        .collect::<Vec<_>>()
        .join("\n");

    FinalOutput {
        text: if joined.is_empty() {
            stdout.to_string()
        } else {
            joined
        },
        is_error: false,
        duration: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_decoding_falls_back_to_text() {
        assert_eq!(
            OutputRecord::from_line(r#"{"type":"assistant"}"#),
            OutputRecord::Json(json!({"type": "assistant"}))
        );
        assert_eq!(
            OutputRecord::from_line("{not json"),
            OutputRecord::Text("{not json".to_string())
        );
        // Bare JSON scalars are not records.
        assert_eq!(OutputRecord::from_line("42"), OutputRecord::Text("42".to_string()));
    }

    #[test]
    fn text_record_value_shape() {
        let record = OutputRecord::Text("hello".to_string());
        assert_eq!(record.to_value(), json!({"type": "text", "content": "hello"}));
    }

    #[test]
    fn final_output_prefers_result_record() {
        let stdout = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\"}\n",
            "{\"type\":\"result\",\"result\":\"All done\",\"is_error\":false,\"duration_ms\":1500}\n",
        );
        let output = final_output(stdout);
        assert_eq!(output.text, "All done");
        assert!(!output.is_error);
        assert_eq!(output.duration, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn final_output_reports_agent_error() {
        let output = final_output(r#"{"type":"result","result":"quota","is_error":true}"#);
        assert!(output.is_error);
        assert_eq!(output.duration, None);
    }

    #[test]
    fn final_output_joins_text_without_result() {
        let stdout = "plain line\n{\"type\":\"text\",\"content\":\"from json\"}\n";
        let output = final_output(stdout);
        assert_eq!(output.text, "plain line\nfrom json");
        assert!(!output.is_error);
    }

    #[test]
    fn final_output_of_empty_stdout() {
        assert_eq!(final_output("").text, "");
    }
}
