use agentflow_server::{start_server, ServerConfig};

#[tokio::main]
async fn main() {
    let config = ServerConfig::from_env();
    match start_server(config).await {
        Ok(addr) => {
            tracing::info!("Ready on {}", addr);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down");
        }
        Err(e) => {
            eprintln!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    }
}
