use clap::Parser;
use kiln_server::Store;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "kiln-server", version, about = "kiln remote protocol v1 server")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9300)]
    port: u16,

    /// Directory holding uploaded recipes and packages.
    #[arg(long, default_value = "./kiln-remote-data")]
    data_dir: PathBuf,

    /// Require `Authorization: Bearer <TOKEN>` on protocol routes.
    #[arg(long)]
    token: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = fs::create_dir_all(&cli.data_dir) {
        error!("failed to create {}: {e}", cli.data_dir.display());
        return ExitCode::FAILURE;
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("starting kiln-server on {addr}");
    info!("data directory: {}", cli.data_dir.display());
    if cli.token.is_some() {
        info!("bearer token required");
    }

    let store = Arc::new(Store::new(cli.data_dir).with_token(cli.token));
    match kiln_server::run_server(&store, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
