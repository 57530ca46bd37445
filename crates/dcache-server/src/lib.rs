pub mod api;
pub mod config;
pub mod metrics;
pub mod node;

pub use api::create_api;
pub use config::ServerConfig;
pub use node::CacheNode;
