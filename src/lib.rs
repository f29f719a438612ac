pub mod chat;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fim;
pub mod message;
pub mod provider;
pub mod response;
pub mod server;
pub mod telemetry;
pub mod template;
pub mod tools;
