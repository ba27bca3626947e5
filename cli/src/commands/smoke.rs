//! End-to-end check of a deployed gateway: health, catalog, the
//! unauthenticated refusal, authentication, and an authenticated search.
//!
//! Runs under a fresh session id so a previously authenticated session
//! cannot mask a broken auth gate.

use crm_gateway_mcp_runtime::protocol::codes;
use serde::Serialize;
use serde_json::{Map, Value, json};

use super::rpc::credentials;
use crate::util::{EXIT_OK, EXIT_RPC, EXIT_TRANSPORT, GatewayClient, rpc_outcome, to_pretty_json};

#[derive(Debug, Serialize)]
pub struct StepReport {
    pub step: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl StepReport {
    fn from_check(step: &'static str, outcome: Result<String, String>) -> Self {
        match outcome {
            Ok(detail) => Self {
                step,
                ok: true,
                detail,
            },
            Err(detail) => Self {
                step,
                ok: false,
                detail,
            },
        }
    }
}

pub struct SmokeArgs<'a> {
    pub gateway_url: &'a str,
    pub api_key: &'a str,
    pub account_id: &'a str,
    pub query: &'a str,
}

pub async fn run(args: SmokeArgs<'_>) -> i32 {
    let session_id = format!("smoke-{}", uuid::Uuid::now_v7());
    let gateway = match GatewayClient::new(args.gateway_url, Some(session_id.clone())) {
        Ok(gateway) => gateway,
        Err(message) => {
            crate::util::print_error("usage_error", &message, None);
            return EXIT_TRANSPORT;
        }
    };

    let mut search_args = Map::new();
    search_args.insert("query".to_string(), json!(args.query));
    search_args.insert("limit".to_string(), json!(5));

    let mut steps = Vec::with_capacity(5);
    steps.push(StepReport::from_check(
        "health",
        gateway
            .get_json("/health")
            .await
            .and_then(|(status, body)| check_health(status, &body)),
    ));
    steps.push(StepReport::from_check(
        "tools_list",
        gateway
            .rpc("tools/list", json!({}))
            .await
            .and_then(|envelope| check_tools_list(&envelope)),
    ));
    steps.push(StepReport::from_check(
        "search_without_auth",
        gateway
            .call_tool("search_contacts", search_args.clone())
            .await
            .and_then(|envelope| check_requires_auth(&envelope)),
    ));
    steps.push(StepReport::from_check(
        "authenticate",
        gateway
            .call_tool("authenticate", credentials(args.api_key, args.account_id))
            .await
            .and_then(|envelope| check_tool_success(&envelope)),
    ));
    steps.push(StepReport::from_check(
        "search_with_auth",
        gateway
            .call_tool("search_contacts", search_args)
            .await
            .and_then(|envelope| check_tool_success(&envelope)),
    ));

    let passed = steps.iter().all(|step| step.ok);
    let report = json!({
        "session_id": session_id,
        "passed": passed,
        "steps": steps,
    });
    if passed {
        println!("{}", to_pretty_json(&report));
        EXIT_OK
    } else {
        eprintln!("{}", to_pretty_json(&report));
        EXIT_RPC
    }
}

pub fn check_health(status: u16, body: &Value) -> Result<String, String> {
    if !(200..300).contains(&status) {
        return Err(format!("GET /health answered {status}"));
    }
    match body.get("status").and_then(Value::as_str) {
        Some("healthy") => Ok(format!(
            "healthy, {} tools, {} active sessions",
            body["availableTools"], body["activeSessions"]
        )),
        other => Err(format!("unexpected health status {other:?}")),
    }
}

pub fn check_tools_list(envelope: &Value) -> Result<String, String> {
    let result = rpc_outcome(envelope).map_err(describe_error)?;
    let names: Vec<&str> = result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| tool.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !names.contains(&"authenticate") {
        return Err(format!("catalog lacks 'authenticate': {names:?}"));
    }
    Ok(names.join(", "))
}

/// The refusal must be `AuthenticationRequired` pointing at `authenticate`.
pub fn check_requires_auth(envelope: &Value) -> Result<String, String> {
    let error = match rpc_outcome(envelope) {
        Ok(_) => return Err("search succeeded without authentication".to_string()),
        Err(error) => error,
    };
    let code = error.get("code").and_then(Value::as_i64);
    let requires_auth = error["data"]["requiresAuth"].as_bool().unwrap_or(false);
    if code == Some(codes::AUTHENTICATION_REQUIRED) && requires_auth {
        Ok(format!(
            "refused with requiresAuth, nextTool {}",
            error["data"]["nextTool"]
        ))
    } else {
        Err(format!("expected an authentication-required error, got {error}"))
    }
}

pub fn check_tool_success(envelope: &Value) -> Result<String, String> {
    let result = rpc_outcome(envelope).map_err(describe_error)?;
    let structured = &result["structuredContent"];
    if structured["success"] == true {
        Ok(summarize(structured))
    } else {
        Err(format!("tool did not report success: {result}"))
    }
}

fn describe_error(error: &Value) -> String {
    format!(
        "{} ({})",
        error["message"].as_str().unwrap_or("unknown error"),
        error["code"]
    )
}

fn summarize(structured: &Value) -> String {
    if let Some(message) = structured["message"].as_str() {
        return message.to_string();
    }
    if let Some(total) = structured.get("total") {
        return format!("total {total}");
    }
    "ok".to_string()
}
