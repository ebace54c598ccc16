pub mod client;
pub mod config;
mod conn;
pub mod error;
mod pool;
mod tls;

pub use client::Client;
pub use config::{ClientConfig, ClientTlsConfig};
pub use error::ClientError;
