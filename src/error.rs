use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid layer id: {0}")]
    InvalidLayerId(String),

    #[error("missing config file geoharvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("portal request failed: {0}")]
    PortalHttp(String),

    #[error("portal returned status {status}: {message}")]
    PortalStatus { status: u16, message: String },

    #[error("error page served with success status from {url}")]
    ErrorPage { url: String },

    #[error("unexpected content type {content_type:?} from {url}")]
    UnexpectedContentType { content_type: String, url: String },

    #[error("malformed JSON from {url}: {message}")]
    MalformedJson { url: String, message: String },

    #[error("page cap of {cap} exceeded for layer {layer}")]
    PageCapExceeded { layer: String, cap: u32 },

    #[error("could not fetch layer via any method: {0}")]
    LayerExhausted(String),

    #[error("query service request failed: {0}")]
    QueryHttp(String),

    #[error("query service returned status {status}: {message}")]
    QueryStatus { status: u16, message: String },

    #[error("no table layer configured")]
    NoTableLayer,

    #[error("input CSV not found: {0}")]
    MissingInput(String),

    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
