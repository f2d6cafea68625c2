//! Error types for marga-nav

use thiserror::Error;

use crate::lattice::search::SearchFailure;

/// marga-nav error type
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Planner error: {0}")]
    Planner(String),
}

impl From<toml::de::Error> for NavError {
    fn from(e: toml::de::Error) -> Self {
        NavError::Config(e.to_string())
    }
}

impl From<std::io::Error> for NavError {
    fn from(e: std::io::Error) -> Self {
        NavError::Config(e.to_string())
    }
}

impl From<SearchFailure> for NavError {
    fn from(e: SearchFailure) -> Self {
        NavError::Planner(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NavError>;
