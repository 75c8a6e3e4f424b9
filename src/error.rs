use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{NodeId, ResourceCategory, ResourceKind, SiteId};

#[derive(Debug, Error, Diagnostic)]
pub enum WindsolError {
    #[error("invalid resource category: {0}")]
    InvalidCategory(String),

    #[error("invalid resource kind: {0}")]
    InvalidKind(String),

    #[error("invalid site id: {0}")]
    InvalidSiteId(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(String),

    #[error("{kind} data is not available for {category} sites")]
    KindMismatch {
        category: ResourceCategory,
        kind: ResourceKind,
    },

    #[error("generation node {0} has no required capacity")]
    MissingCapacity(NodeId),

    #[error("catalog holds {catalog} sites but the request asked for {requested}")]
    CategoryMismatch {
        catalog: ResourceCategory,
        requested: ResourceCategory,
    },

    #[error("invalid node list line {line}: {message}")]
    InvalidNodeLine { line: usize, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("no repository configured: set repository.url or repository.path in windsol.json")]
    MissingRepository,

    #[error("repository.url and repository.path are mutually exclusive")]
    RepositoryConflict,

    #[error("failed to read {category} site manifest: {message}")]
    ManifestRead {
        category: ResourceCategory,
        message: String,
    },

    #[error("failed to parse {category} site manifest: {message}")]
    ManifestParse {
        category: ResourceCategory,
        message: String,
    },

    #[error("no {0} sites in manifest")]
    EmptyCatalog(ResourceCategory),

    #[error("duplicate site id {id} in {category} manifest")]
    DuplicateSite {
        category: ResourceCategory,
        id: SiteId,
    },

    #[error("unknown {category} site id: {id}")]
    UnknownSite {
        category: ResourceCategory,
        id: SiteId,
    },

    #[error(
        "not enough space available in local cache: \
         download size = {download_gb:.2} GB, \
         local cache = {used_gb:.2} GB of {max_gb:.2} GB in use \
         (wind {wind_gb:.2} GB, solar {solar_gb:.2} GB)"
    )]
    CacheBudgetExceeded {
        download_gb: f64,
        used_gb: f64,
        max_gb: f64,
        wind_gb: f64,
        solar_gb: f64,
    },

    #[error("repository request failed: {0}")]
    FetchHttp(String),

    #[error("repository returned status {status}: {message}")]
    FetchStatus { status: u16, message: String },

    #[error("repository file not found: {0}")]
    FetchMissing(String),

    #[error("{category} cache index rebuild failed: {message}")]
    CacheScan {
        category: ResourceCategory,
        message: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
