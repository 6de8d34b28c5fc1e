use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = lib_statehub::init().await {
        error!("❌ Application error: {:?}", e);
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}
