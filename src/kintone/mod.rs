pub mod client;
pub mod query;
pub mod retry;
pub mod types;
