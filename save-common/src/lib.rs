pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod retry;
pub mod store;
pub mod types;
