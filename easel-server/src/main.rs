use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use easel_core::DevicePreference;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod error;
mod routes;
mod state;

use state::AppState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel local generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Directory scanned for model weight files
    #[arg(long, default_value = "models")]
    models_dir: PathBuf,

    /// Directory generated video clips are written to
    #[arg(long, default_value = "outputs")]
    outputs_dir: PathBuf,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    fs::create_dir_all(&args.models_dir)?;
    fs::create_dir_all(&args.outputs_dir)?;

    let device = if args.cpu {
        DevicePreference::ForceCpu
    } else {
        DevicePreference::Auto
    };
    let state = AppState::new(args.models_dir, args.outputs_dir, device);
    let app = routes::build_router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
