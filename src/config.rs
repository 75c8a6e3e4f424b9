use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::WindsolError;

/// Decimal gigabyte, the unit used for cache sizing and reporting.
pub const GB_BYTES: f64 = 1e9;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: Option<CacheSection>,
    #[serde(default)]
    pub repository: Option<RepositorySection>,
    #[serde(default)]
    pub fetch: Option<FetchSection>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub max_size_gb: Option<f64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RepositorySection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FetchSection {
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Where resource files are fetched from. `Http` talks to a hosted
/// repository; `Filesystem` copies from a local or mounted mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositorySource {
    Http { url: String, timeout_secs: u64 },
    Filesystem { root: Utf8PathBuf },
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub cache_root: Utf8PathBuf,
    pub max_cache_bytes: Option<u64>,
    pub repository: Option<RepositorySource>,
    pub workers: Option<usize>,
}

impl ResolvedConfig {
    pub fn repository(&self) -> Result<&RepositorySource, WindsolError> {
        self.repository.as_ref().ok_or(WindsolError::MissingRepository)
    }
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, WindsolError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("windsol.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| WindsolError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| WindsolError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, WindsolError> {
        let cache = config.cache.unwrap_or_default();

        let cache_root = match cache.root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_cache_root()?,
        };

        let max_cache_bytes = cache.max_size_gb.map(|gb| (gb * GB_BYTES) as u64);

        let repository = match config.repository {
            None => None,
            Some(section) => Some(resolve_repository(section)?),
        };

        let workers = config.fetch.and_then(|fetch| fetch.workers);

        Ok(ResolvedConfig {
            cache_root,
            max_cache_bytes,
            repository,
            workers,
        })
    }
}

fn resolve_repository(section: RepositorySection) -> Result<RepositorySource, WindsolError> {
    let timeout_secs = section.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
    match (section.url, section.path) {
        (Some(_), Some(_)) => Err(WindsolError::RepositoryConflict),
        (Some(url), None) => Ok(RepositorySource::Http { url, timeout_secs }),
        (None, Some(path)) => Ok(RepositorySource::Filesystem {
            root: Utf8PathBuf::from(path),
        }),
        (None, None) => Err(WindsolError::MissingRepository),
    }
}

fn default_cache_root() -> Result<Utf8PathBuf, WindsolError> {
    let base = BaseDirs::new()
        .ok_or_else(|| WindsolError::Filesystem("cannot determine home directory".to_string()))?;
    let root = base.cache_dir().join("windsol");
    Utf8PathBuf::from_path_buf(root)
        .map_err(|path| WindsolError::Filesystem(format!("non-utf8 cache path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_config_resolves_with_defaults() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert!(resolved.max_cache_bytes.is_none());
        assert!(resolved.repository.is_none());
        assert!(resolved.workers.is_none());
        assert_matches!(
            resolved.repository(),
            Err(WindsolError::MissingRepository)
        );
    }

    #[test]
    fn full_config_resolves() {
        let config: Config = serde_json::from_str(
            r#"{
                "cache": { "root": "/tmp/windsol-cache", "max_size_gb": 2.5 },
                "repository": { "url": "https://repo.example/files", "timeout_secs": 10 },
                "fetch": { "workers": 4 }
            }"#,
        )
        .unwrap();

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.cache_root, Utf8PathBuf::from("/tmp/windsol-cache"));
        assert_eq!(resolved.max_cache_bytes, Some((2.5 * GB_BYTES) as u64));
        assert_eq!(resolved.workers, Some(4));
        assert_eq!(
            resolved.repository,
            Some(RepositorySource::Http {
                url: "https://repo.example/files".to_string(),
                timeout_secs: 10,
            })
        );
    }

    #[test]
    fn url_and_path_conflict() {
        let config: Config = serde_json::from_str(
            r#"{ "repository": { "url": "https://repo.example", "path": "/mnt/repo" } }"#,
        )
        .unwrap();
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, WindsolError::RepositoryConflict);
    }

    #[test]
    fn filesystem_repository() {
        let config: Config = serde_json::from_str(r#"{ "repository": { "path": "/mnt/repo" } }"#)
            .unwrap();
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(
            resolved.repository,
            Some(RepositorySource::Filesystem {
                root: Utf8PathBuf::from("/mnt/repo"),
            })
        );
    }
}
