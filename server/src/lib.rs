pub mod engine;
pub mod handler;
pub mod listener;
pub mod tls;

pub use engine::{Engine, EngineError};
pub use listener::{Server, ServerError};
