use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened or cannot hold the requested format.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The function could not be captured into a single graph.
    #[error("graph capture failed: {0}")]
    GraphCapture(String),

    #[error("compute failed: {0}")]
    RuntimeCompute(String),

    #[error("shape error: {0}")]
    Shape(String),

    #[error("kernel codegen failed: {0}")]
    Codegen(#[from] tera::Error),

    #[error("unknown backend `{0}`")]
    UnknownBackend(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
