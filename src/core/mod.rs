pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod store;
