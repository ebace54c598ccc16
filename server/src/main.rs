use rhizome_core::config::AppConfig;
use server::Server;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    rhizome_core::init_tracing();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            warn!(%err, "no usable configuration found, starting with defaults");
            AppConfig::default()
        }
    };

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "failed to initialize server");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.run().await {
        error!(%err, "server exited with error");
        std::process::exit(1);
    }
}
