use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::smoke::SmokeArgs;
use util::{GatewayClient, exit_error};

#[derive(Parser)]
#[command(
    name = "crm-gateway-cli",
    version,
    about = "Operator CLI for the CRM MCP gateway"
)]
struct Cli {
    /// Gateway base URL
    #[arg(long, env = "CRM_GATEWAY_URL", default_value = "http://localhost:3000")]
    gateway_url: String,

    /// Session id sent as x-session-id on RPC calls
    #[arg(long, env = "CRM_GATEWAY_SESSION_ID")]
    session_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway health
    Health,
    /// List the tool catalog (tools/list)
    Tools,
    /// Call a tool with raw JSON arguments
    Call {
        /// Tool name, e.g. "search_contacts"
        tool: String,
        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Authenticate the session with CRM credentials
    Authenticate {
        #[arg(long, env = "CRM_API_KEY", hide_env_values = true)]
        api_key: String,
        /// Location / sub-account id
        #[arg(long, env = "CRM_ACCOUNT_ID")]
        account_id: String,
    },
    /// Run health, catalog, auth gate, authenticate and search against a gateway
    Smoke {
        #[arg(long, env = "CRM_API_KEY", hide_env_values = true)]
        api_key: String,
        #[arg(long, env = "CRM_ACCOUNT_ID")]
        account_id: String,
        /// Contact search query for the authenticated step
        #[arg(long, default_value = "test")]
        query: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let code = match &cli.command {
        Commands::Health => commands::health::run(&gateway(&cli)).await,
        Commands::Tools => commands::rpc::tools(&gateway(&cli)).await,
        Commands::Call { tool, args } => {
            commands::rpc::call(&gateway(&cli), tool, args.as_deref()).await
        }
        Commands::Authenticate {
            api_key,
            account_id,
        } => commands::rpc::authenticate(&gateway(&cli), api_key, account_id).await,
        Commands::Smoke {
            api_key,
            account_id,
            query,
        } => {
            commands::smoke::run(SmokeArgs {
                gateway_url: &cli.gateway_url,
                api_key,
                account_id,
                query,
            })
            .await
        }
    };

    std::process::exit(code);
}

fn gateway(cli: &Cli) -> GatewayClient {
    GatewayClient::new(&cli.gateway_url, cli.session_id.clone())
        .unwrap_or_else(|message| exit_error(&message, Some("Set --gateway-url or CRM_GATEWAY_URL")))
}
