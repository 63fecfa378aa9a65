#![deny(warnings)]
#![deny(clippy::unwrap_used)]

//! Run one command through the bridge and stream its output to stdout.
//!
//! ```text
//! hssh-exec <host> <command...>
//! ```

use std::process::ExitCode;

use clap::Parser;
use dotenv::dotenv;
use hssh::bridge::relay;
use hssh::bridge::{Executor, HostKeyPolicy, Settings};
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "hssh-exec")]
#[command(about = "Run a command on an ssh_config host and stream its output", long_about = None)]
#[command(version)]
struct Args {
    /// Host alias or HostName from ssh_config
    host: String,

    /// Command to run; the words are joined with single spaces
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with status 2
    let args = Args::parse();

    dotenv().ok();

    // Logs go to stderr so stdout carries only command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warn".parse().expect("valid directive")),
        )
        .init();

    let command = args.command.join(" ");

    let settings = Settings::resolve(None);
    if matches!(settings.host_key_policy, HostKeyPolicy::AcceptAny) {
        warn!("Host key verification is disabled; remote hosts are not authenticated");
    }
    let executor = Executor::from_settings(&settings);

    let (mut writer, reader) = relay::pipe();
    let relay_task = relay::spawn_relay(reader, tokio::io::stdout());

    let result = executor.execute(&args.host, &command, &mut writer).await;
    // EOF for the relay
    let _ = writer.shutdown().await;
    let _ = relay_task.await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hssh-exec: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_host_and_command_words() {
        let args = Args::try_parse_from(["hssh-exec", "web", "uname", "-a"])
            .expect("valid arguments");
        assert_eq!(args.host, "web");
        assert_eq!(args.command.join(" "), "uname -a");
    }

    #[test]
    fn test_command_flags_are_not_parsed() {
        let args =
            Args::try_parse_from(["hssh-exec", "web", "ls", "--color=never", "-la", "/tmp"])
                .expect("valid arguments");
        assert_eq!(args.command, vec!["ls", "--color=never", "-la", "/tmp"]);
    }

    #[test]
    fn test_missing_command_is_usage_error() {
        let err = Args::try_parse_from(["hssh-exec", "web"]).expect_err("command is required");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_missing_host_is_usage_error() {
        let err = Args::try_parse_from(["hssh-exec"]).expect_err("host is required");
        assert_eq!(err.exit_code(), 2);
    }
}
