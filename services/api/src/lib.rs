pub mod config;
pub mod handlers;
pub mod state;

pub use config::Config;
pub use state::AppState;
