use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type RouterResult<T> = Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("routes backend lookup failed: {0}")]
    BackendLookup(#[source] BoxError),

    #[error("all backends are dead")]
    AllBackendsDead,

    #[error("no such route")]
    InvalidRoute,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("websocket dial failed: {0}")]
    HijackDial(#[source] std::io::Error),

    #[error("connection error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
