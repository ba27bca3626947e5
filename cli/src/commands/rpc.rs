use serde_json::{Map, Value, json};

use crate::util::{
    EXIT_TRANSPORT, GatewayClient, parse_arguments, print_error, report_envelope,
    report_transport_error,
};

/// `tools/list`
pub async fn tools(gateway: &GatewayClient) -> i32 {
    match gateway.rpc("tools/list", json!({})).await {
        Ok(envelope) => report_envelope(&envelope),
        Err(message) => report_transport_error(&message),
    }
}

/// `tools/call` with raw JSON arguments.
pub async fn call(gateway: &GatewayClient, tool: &str, raw_args: Option<&str>) -> i32 {
    let arguments = match parse_arguments(raw_args) {
        Ok(arguments) => arguments,
        Err(message) => {
            print_error(
                "usage_error",
                &message,
                Some(r#"Pass arguments as a JSON object, e.g. --args '{"query": "jane"}'"#),
            );
            return EXIT_TRANSPORT;
        }
    };
    call_tool(gateway, tool, arguments).await
}

pub async fn authenticate(gateway: &GatewayClient, api_key: &str, account_id: &str) -> i32 {
    call_tool(gateway, "authenticate", credentials(api_key, account_id)).await
}

pub fn credentials(api_key: &str, account_id: &str) -> Map<String, Value> {
    let mut arguments = Map::new();
    arguments.insert("api_key".to_string(), json!(api_key));
    arguments.insert("account_id".to_string(), json!(account_id));
    arguments
}

async fn call_tool(gateway: &GatewayClient, tool: &str, arguments: Map<String, Value>) -> i32 {
    match gateway.call_tool(tool, arguments).await {
        Ok(envelope) => report_envelope(&envelope),
        Err(message) => report_transport_error(&message),
    }
}
