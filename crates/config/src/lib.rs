//! Configuration for the sandjob engine: schema, discovery and loading.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{cache_dir, config_dir, discover_and_load, discover_in, expand_home, load_config},
    schema::SandjobConfig,
};
