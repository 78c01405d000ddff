#![allow(dead_code)]

mod config;
mod logging;

pub use config::{RepoConfig, PUSH_ID_ALPHABET};
pub use logging::init as init_logging;
