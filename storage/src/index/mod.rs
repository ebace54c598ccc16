pub mod adjacency;
pub mod ann;

pub use adjacency::AdjacencyIndex;
pub use ann::{Metric, VectorIndex};
