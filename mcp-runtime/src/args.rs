use serde_json::{Map, Value, json};

use crate::crm::CrmError;

/// Failure inside a single tool handler: bad arguments or a failed
/// upstream call. Converted to a JSON-RPC error by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub docs_hint: Option<String>,
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
            docs_hint: None,
            details: None,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::new("validation_failed", message).with_field(field)
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_docs_hint(mut self, docs_hint: impl Into<String>) -> Self {
        self.docs_hint = Some(docs_hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({
            "error": self.code,
            "message": self.message
        });
        if let Some(field) = &self.field {
            payload["field"] = Value::String(field.clone());
        }
        if let Some(docs_hint) = &self.docs_hint {
            payload["docs_hint"] = Value::String(docs_hint.clone());
        }
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        payload
    }
}

impl From<CrmError> for ToolError {
    fn from(err: CrmError) -> Self {
        let mut tool_error = ToolError::new(err.code(), err.to_string());
        if let CrmError::Status { status, body, .. } = &err {
            tool_error = tool_error.with_details(json!({
                "status": status,
                "upstream": body
            }));
        }
        tool_error
    }
}

/// First present, non-null value among `keys`. The first key is the
/// canonical name and is the one reported in validation errors.
fn lookup<'a>(args: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| args.get(*key))
        .find(|value| !value.is_null())
}

fn canonical<'a>(keys: &[&'a str]) -> &'a str {
    keys.first().copied().unwrap_or("argument")
}

pub fn required_string(args: &Map<String, Value>, keys: &[&str]) -> Result<String, ToolError> {
    let field = canonical(keys);
    match lookup(args, keys) {
        None => Err(ToolError::validation(
            field,
            format!("Missing required field '{field}'"),
        )),
        Some(Value::String(v)) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        Some(Value::String(_)) => Err(ToolError::validation(
            field,
            format!("'{field}' must not be empty"),
        )),
        Some(_) => Err(ToolError::validation(
            field,
            format!("'{field}' must be a string"),
        )),
    }
}

pub fn optional_string(
    args: &Map<String, Value>,
    keys: &[&str],
) -> Result<Option<String>, ToolError> {
    let field = canonical(keys);
    match lookup(args, keys) {
        None => Ok(None),
        Some(Value::String(v)) if v.trim().is_empty() => Ok(None),
        Some(Value::String(v)) => Ok(Some(v.trim().to_string())),
        Some(_) => Err(ToolError::validation(
            field,
            format!("'{field}' must be a string"),
        )),
    }
}

pub fn arg_optional_u64(args: &Map<String, Value>, keys: &[&str]) -> Result<Option<u64>, ToolError> {
    let field = canonical(keys);
    match lookup(args, keys) {
        None => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            ToolError::validation(field, format!("'{field}' must be an unsigned integer"))
        }),
        Some(_) => Err(ToolError::validation(
            field,
            format!("'{field}' must be an unsigned integer"),
        )),
    }
}

pub fn bounded_u64(
    args: &Map<String, Value>,
    keys: &[&str],
    default: u64,
    min: u64,
    max: u64,
) -> Result<u64, ToolError> {
    let field = canonical(keys);
    let value = arg_optional_u64(args, keys)?.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(ToolError::validation(
            field,
            format!("'{field}' must be between {min} and {max}"),
        ));
    }
    Ok(value)
}

/// Parses an enumerated string argument, falling back to `default` when absent.
pub fn arg_choice<T>(
    args: &Map<String, Value>,
    keys: &[&str],
    default: T,
    allowed: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ToolError> {
    let field = canonical(keys);
    match optional_string(args, keys)? {
        None => Ok(default),
        Some(raw) => parse(&raw).ok_or_else(|| {
            ToolError::validation(field, format!("'{field}' must be one of: {allowed}"))
        }),
    }
}
