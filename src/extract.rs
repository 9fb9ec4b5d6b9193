//! Classification of directory search payloads
//!
//! Expected shape: `{"list": {"exact": [{"telephone": [..], "emails": [..], "identifiant": ".."}]}}`.
//! Fuzzy matches elsewhere in `list` are ignored.

use crate::schema::{LookupResult, LookupStatus};
use serde_json::Value;

pub const NOTE_INVALID_RESPONSE: &str = "Invalid API response";
pub const NOTE_NO_EXACT_MATCH: &str = "No exact matches found";
pub const NOTE_EXACT_MATCH: &str = "Exact match found";

/// Classify a decoded search payload. Never fails: shape problems inside a
/// match become an ERROR result carrying the description.
pub fn classify(payload: &Value) -> LookupResult {
    let exact = match payload
        .get("list")
        .and_then(|list| list.get("exact"))
        .and_then(Value::as_array)
    {
        Some(exact) => exact,
        None => return LookupResult::not_found(NOTE_INVALID_RESPONSE),
    };

    let (status, notes) = match exact.len() {
        0 => return LookupResult::not_found(NOTE_NO_EXACT_MATCH),
        1 => (LookupStatus::Found, NOTE_EXACT_MATCH.to_string()),
        n => (
            LookupStatus::MultipleMatches,
            format!("Found {} exact matches - took first", n),
        ),
    };

    match contact_from_match(&exact[0]) {
        Ok((phone_numbers, emails, remote_identifier)) => LookupResult {
            status,
            phone_numbers,
            emails,
            remote_identifier,
            notes,
        },
        Err(reason) => LookupResult::error(format!("Extraction error: {}", reason)),
    }
}

/// Classify a raw response body; undecodable JSON counts as an invalid response.
pub fn classify_body(body: &str) -> LookupResult {
    match serde_json::from_str::<Value>(body) {
        Ok(payload) => classify(&payload),
        Err(_) => LookupResult::not_found(NOTE_INVALID_RESPONSE),
    }
}

type Contact = (Vec<String>, Vec<String>, String);

fn contact_from_match(entry: &Value) -> Result<Contact, String> {
    let obj = entry
        .as_object()
        .ok_or_else(|| format!("match is not an object: {}", kind(entry)))?;

    let phones = string_list(obj.get("telephone"), "telephone")?;
    let emails = string_list(obj.get("emails"), "emails")?;
    let identifier = match obj.get("identifiant") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => return Err(format!("identifiant is {}", kind(other))),
    };

    Ok((phones, emails, identifier))
}

fn string_list(value: Option<&Value>, field: &str) -> Result<Vec<String>, String> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(format!("{} contains {}", field, kind(other))),
            })
            .collect(),
        Some(other) => Err(format!("{} is {}", field, kind(other))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
