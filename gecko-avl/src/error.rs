use crate::{config, server};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] config::Error),
    #[error("Server error: {0}")]
    Server(#[from] server::Error),
}
