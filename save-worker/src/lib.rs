pub mod config;
pub mod error;
pub mod extract;
pub mod finalizer;
pub mod resolver;
pub mod worker;
