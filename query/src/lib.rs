pub mod pipeline;
pub mod query_log;

pub use pipeline::{run_query, QueryOutcome};
pub use query_log::{QueryLogLru, MAX_QUERY_LOG_ENTRIES};
