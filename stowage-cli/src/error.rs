use thiserror::Error;

#[derive(Error, Debug)]
pub enum StowageCliError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Packager(#[from] stowage::packager::PackagerError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StowageCliError>;
