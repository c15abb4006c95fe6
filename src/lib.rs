pub mod config;
pub mod context;
pub mod database;
pub mod feed;
pub mod id;
pub mod llm;
pub mod server;
pub mod summary;
pub mod turn;
