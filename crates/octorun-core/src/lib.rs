pub mod config;
pub mod duration;

pub use config::OctorunConfig;
pub use duration::parse_duration;
