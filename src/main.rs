#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use hssh::bridge::{Executor, HostKeyPolicy, Settings, routes};
use poem::{EndpointExt, Server, listener::TcpListener, middleware::Tracing};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hssh")]
#[command(about = "HTTP to SSH command bridge", long_about = None)]
#[command(version)]
struct Args {
    /// Listen address, overrides HSSH_ADDR (default 0.0.0.0:8080)
    #[arg(long, value_name = "IP:PORT")]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let settings = Settings::resolve(args.addr);
    info!(
        "Host key policy: {}, resolve policy: {}, output mode: {}",
        settings.host_key_policy, settings.resolve_policy, settings.output_mode
    );
    if matches!(settings.host_key_policy, HostKeyPolicy::AcceptAny) {
        warn!("Host key verification is disabled; remote hosts are not authenticated");
    }

    let executor = Arc::new(Executor::from_settings(&settings));
    let app = routes(executor, settings.output_mode).with(Tracing);

    info!("Starting SSH bridge on {}", settings.listen_addr);
    info!("POST /ssh with {{\"server_ip\": ..., \"command_string\": ...}} to run a command");

    Server::new(TcpListener::bind(settings.listen_addr))
        .name("hssh")
        .run(app)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_flag() {
        let args = Args::try_parse_from(["hssh", "--addr", "127.0.0.1:9000"])
            .expect("valid arguments");
        assert_eq!(args.addr.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_addr_flag_overrides_settings() {
        let args = Args::try_parse_from(["hssh", "--addr=127.0.0.1:9001"])
            .expect("valid arguments");
        let settings = Settings::resolve(args.addr);
        assert_eq!(settings.listen_addr, "127.0.0.1:9001");
    }

    #[test]
    fn test_addr_is_optional() {
        let args = Args::try_parse_from(["hssh"]).expect("valid arguments");
        assert_eq!(args.addr, None);
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["hssh", "--port", "80"]).is_err());
    }
}
