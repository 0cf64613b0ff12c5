// src/main.rs

#[cfg(feature = "cli")]
use knowledge_gateway::{config::Config, server};
#[cfg(feature = "cli")]
use dotenvy::dotenv;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cfg = Config::from_env()?;

    server::run(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}