mod agent;
mod config;
mod cycle;
mod decision;
mod error;
mod exchange;
mod indicators;
mod llm;
mod market_data;
mod order;
mod orchestrator;
mod position;
mod prompt;
mod risk;
mod scheduler;
mod service;
mod signing;
mod store;
mod trading;

use config::Config;
use service::Service;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    log::info!("hl-agent-engine starting…");

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = Service::new(config).start().await {
        log::error!("service exited with error: {e}");
        std::process::exit(1);
    }
}
