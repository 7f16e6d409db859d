use clap::Parser;
use tracing::info;

use magi_server::{configuration, logging, routes, state};

#[derive(Parser)]
#[command(author, version, about = "MAGI consensus observer backend")]
struct Cli {
    /// Bind port (overrides MAGI_SERVER__PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::setup_logging("info,magi=debug")?;
    let cli = Cli::parse();

    let mut settings = configuration::Settings::new()?;
    if let Some(port) = cli.port {
        settings.port = port;
    }

    let config = magi::Config::from_env()?;
    let state = state::AppState::new(config);
    let app = routes::configure(state);

    let listener = tokio::net::TcpListener::bind(settings.socket_addr()).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
