use direct_messaging::config::Config;
use direct_messaging::server::Server;
use log::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    env_logger::init();

    let server = Server::new(&config)?;
    let server_addr = config.server_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run(&server_addr).await {
            error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down server...");

    Ok(())
}
