//! Verifier verdicts as stored on chain
//!
//! A verifier submits free-form text. Well-behaved verifiers submit a JSON
//! object, sometimes wrapped in a `response_json` envelope (either as a
//! nested object or as a JSON-encoded string). Anything that does not parse
//! is kept verbatim as raw text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Structured {
        confirming: Vec<String>,
        refuting: Vec<String>,
        correctness_score: i64,
        response: String,
    },
    RawText {
        text: String,
    },
}

impl Verdict {
    /// Normalize a raw submission. Never fails.
    pub fn parse(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => Self::from_value(&value).unwrap_or_else(|| Self::RawText {
                text: raw.to_string(),
            }),
            Err(_) => Self::RawText {
                text: raw.to_string(),
            },
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;

        if let Some(inner) = object.get("response_json") {
            let unwrapped = match inner {
                Value::String(encoded) => serde_json::from_str::<Value>(encoded).ok()?,
                other => other.clone(),
            };
            return Self::from_value(&unwrapped);
        }

        let confirming = string_list(object.get("confirming"));
        let refuting = string_list(object.get("refuting"));
        let correctness_score = object.get("correctness_score").and_then(score_value);
        let response = object
            .get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string);

        // An object with none of the expected fields is not a verdict
        if confirming.is_none()
            && refuting.is_none()
            && correctness_score.is_none()
            && response.is_none()
        {
            return None;
        }

        Some(Self::Structured {
            confirming: confirming.unwrap_or_default(),
            refuting: refuting.unwrap_or_default(),
            correctness_score: correctness_score.unwrap_or(0),
            response: response.unwrap_or_default(),
        })
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

fn score_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
