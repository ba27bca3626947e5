use crate::util::{
    EXIT_OK, EXIT_TRANSPORT, GatewayClient, report_transport_error, to_pretty_json,
};

pub async fn run(gateway: &GatewayClient) -> i32 {
    match gateway.get_json("/health").await {
        Ok((status, body)) if (200..300).contains(&status) => {
            println!("{}", to_pretty_json(&body));
            EXIT_OK
        }
        Ok((_, body)) => {
            eprintln!("{}", to_pretty_json(&body));
            EXIT_TRANSPORT
        }
        Err(message) => report_transport_error(&message),
    }
}
