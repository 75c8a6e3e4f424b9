use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::LocalCache;
use crate::domain::{ResourceCategory, SiteId};
use crate::error::WindsolError;
use crate::remote::Fetcher;

/// One resource site from the repository manifest. `rated_capacity` is
/// absent for weather-only catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: SiteId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rated_capacity: Option<f64>,
}

impl Site {
    pub fn is_generation(&self) -> bool {
        self.rated_capacity.map(|mw| mw > 0.0).unwrap_or(false)
    }
}

/// Immutable per-category site catalog, loaded once from the manifest.
#[derive(Debug, Clone)]
pub struct SiteCatalog {
    category: ResourceCategory,
    sites: BTreeMap<SiteId, Site>,
}

impl SiteCatalog {
    pub fn from_sites(
        category: ResourceCategory,
        sites: Vec<Site>,
    ) -> Result<Self, WindsolError> {
        let mut map = BTreeMap::new();
        for site in sites {
            let id = site.site_id;
            if map.insert(id, site).is_some() {
                return Err(WindsolError::DuplicateSite { category, id });
            }
        }
        if map.is_empty() {
            return Err(WindsolError::EmptyCatalog(category));
        }
        Ok(Self {
            category,
            sites: map,
        })
    }

    pub fn from_manifest_bytes(
        category: ResourceCategory,
        bytes: &[u8],
    ) -> Result<Self, WindsolError> {
        let sites: Vec<Site> = serde_json::from_slice(bytes)
            .map_err(|err| WindsolError::ManifestParse {
                category,
                message: err.to_string(),
            })?;
        Self::from_sites(category, sites)
    }

    /// Load the manifest from `manifest_path`, fetching and storing it
    /// first when no local copy exists yet.
    pub fn load_or_fetch(
        category: ResourceCategory,
        manifest_path: &Utf8Path,
        fetcher: &dyn Fetcher,
    ) -> Result<Self, WindsolError> {
        let bytes = if manifest_path.as_std_path().exists() {
            fs::read(manifest_path.as_std_path()).map_err(|err| WindsolError::ManifestRead {
                category,
                message: err.to_string(),
            })?
        } else {
            debug!("fetching {} site manifest", category);
            let bytes = fetcher.fetch_manifest(category)?;
            LocalCache::write_bytes_atomic(manifest_path, &bytes)?;
            bytes
        };
        Self::from_manifest_bytes(category, &bytes)
    }

    pub fn category(&self) -> ResourceCategory {
        self.category
    }

    pub fn get(&self, id: SiteId) -> Result<&Site, WindsolError> {
        self.sites.get(&id).ok_or(WindsolError::UnknownSite {
            category: self.category,
            id,
        })
    }

    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    pub fn generation_sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values().filter(|site| site.is_generation())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
