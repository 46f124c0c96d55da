//! Structured output validation.

use serde_json::Value;

use crate::manifest::OutputSpec;
use crate::types::Message;

/// Parses `text` as a JSON object carrying every required key.
///
/// A surrounding Markdown code fence is tolerated.
pub fn validate_output(spec: &OutputSpec, text: &str) -> Result<Value, String> {
    let body = strip_fence(text.trim());
    let value: Value =
        serde_json::from_str(body).map_err(|e| format!("final answer is not valid JSON: {}", e))?;

    let Some(object) = value.as_object() else {
        return Err("final answer must be a JSON object".to_string());
    };

    let missing: Vec<&str> = spec
        .required
        .iter()
        .filter(|key| !object.contains_key(key.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required keys: {}", missing.join(", ")));
    }
    Ok(value)
}

fn strip_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub(crate) fn correction_message(spec: &OutputSpec, problem: &str) -> Message {
    let mut text = format!(
        "Your previous answer was rejected: {}. Reply with only a JSON object",
        problem
    );
    if !spec.required.is_empty() {
        text.push_str(&format!(" containing the keys: {}", spec.required.join(", ")));
    }
    text.push('.');
    Message::user(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_output() {
        let spec = OutputSpec::json(["answer"]);
        let value = validate_output(&spec, r#"{"answer": 42}"#).unwrap();
        assert_eq!(value["answer"], 42);

        let fenced = "```json\n{\"answer\": 1}\n```";
        assert!(validate_output(&spec, fenced).is_ok());
    }

    #[test]
    fn test_invalid_output() {
        let spec = OutputSpec::json(["answer", "sources"]);
        assert!(validate_output(&spec, "plain text").unwrap_err().contains("not valid JSON"));
        assert!(validate_output(&spec, "[1, 2]").unwrap_err().contains("JSON object"));
        assert_eq!(
            validate_output(&spec, r#"{"answer": 1}"#).unwrap_err(),
            "missing required keys: sources"
        );
    }

    #[test]
    fn test_correction_lists_keys() {
        let msg = correction_message(&OutputSpec::json(["a", "b"]), "bad");
        assert!(msg.text().contains("a, b"));
    }
}
