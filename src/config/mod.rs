//! Configuration types and loading

mod loader;
mod types;

pub use loader::{load_config, parse_config};
pub use types::{Config, MailCommandRunnerConfig};
