use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = kiro_relay::run().await {
        error!("Startup failed: {}", e);
        std::process::exit(1);
    }
}
