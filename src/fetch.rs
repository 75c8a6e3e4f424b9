use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{bytes_to_gb, LocalCache};
use crate::domain::{resource_file_name, ResourceCategory, ResourceKind, SiteId};
use crate::error::WindsolError;
use crate::remote::Fetcher;

/// Average file sizes in megabytes, keyed by kind, used only for the
/// pre-flight budget estimate. Coarse by design; the budget check never
/// needs per-file accuracy.
fn average_file_mb(category: ResourceCategory, kind: ResourceKind) -> u64 {
    match category {
        ResourceCategory::Wind => match kind {
            ResourceKind::Met => 14,
            ResourceKind::Power => 5,
            ResourceKind::Forecast | ResourceKind::ForecastProb => 2,
            // No wind irradiance files exist; requests are rejected
            // before estimation.
            ResourceKind::Irradiance => 0,
        },
        ResourceCategory::Solar => match kind {
            ResourceKind::Met => 10,
            ResourceKind::Irradiance => 20,
            ResourceKind::Power => 1,
            ResourceKind::Forecast | ResourceKind::ForecastProb => 1,
        },
    }
}

const MB_BYTES: u64 = 1_000_000;

/// What resource files a resolution needs per referenced site.
/// Generation requests pull power curves (plus forecasts on demand);
/// weather requests pull met data (plus irradiance for solar sites).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindProfile {
    Generation { forecasts: bool },
    Weather,
}

impl KindProfile {
    pub fn kinds(&self, category: ResourceCategory) -> Vec<ResourceKind> {
        match self {
            KindProfile::Generation { forecasts: false } => vec![ResourceKind::Power],
            KindProfile::Generation { forecasts: true } => {
                vec![ResourceKind::Power, ResourceKind::Forecast]
            }
            KindProfile::Weather => match category {
                ResourceCategory::Wind => vec![ResourceKind::Met],
                ResourceCategory::Solar => vec![ResourceKind::Met, ResourceKind::Irradiance],
            },
        }
    }
}

/// One file to bring into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRequest {
    pub site_id: SiteId,
    pub kind: ResourceKind,
}

/// One file that could not be fetched. The allocation that referenced it
/// is still returned; the caller decides whether partial data is usable.
#[derive(Debug, Serialize)]
pub struct FetchFailure {
    pub site_id: SiteId,
    pub kind: ResourceKind,
    pub error: String,
}

/// Brings the resource files referenced by an allocation into the local
/// cache: expands sites into file requests, drops what is already
/// present, checks the remaining download against the cache budget, and
/// only then dispatches fetch tasks. Individual fetch failures are
/// collected per file and never abort sibling fetches.
pub struct FetchOrchestrator<'a> {
    cache: &'a LocalCache,
    workers: Option<usize>,
}

impl<'a> FetchOrchestrator<'a> {
    pub fn new(cache: &'a LocalCache, workers: Option<usize>) -> Self {
        Self { cache, workers }
    }

    pub fn ensure_present(
        &self,
        site_ids: &[SiteId],
        category: ResourceCategory,
        profile: KindProfile,
        fetcher: &dyn Fetcher,
    ) -> Result<Vec<FetchFailure>, WindsolError> {
        self.ensure_kinds_present(site_ids, category, &profile.kinds(category), fetcher)
    }

    /// Explicit-kind entry point for callers pulling files outside the
    /// standard profiles (forecast probabilities and the like). Kinds
    /// the category does not publish are rejected before estimation.
    pub fn ensure_kinds_present(
        &self,
        site_ids: &[SiteId],
        category: ResourceCategory,
        kinds: &[ResourceKind],
        fetcher: &dyn Fetcher,
    ) -> Result<Vec<FetchFailure>, WindsolError> {
        if let Some(&kind) = kinds.iter().find(|kind| !kind.valid_for(category)) {
            return Err(WindsolError::KindMismatch { category, kind });
        }

        let missing = self.missing_files(site_ids, category, kinds);
        if missing.is_empty() {
            debug!("all {} requested files already cached", category);
            return Ok(Vec::new());
        }

        self.check_budget(&missing, category)?;

        debug!(
            "fetching {} {} files ({} workers)",
            missing.len(),
            category,
            self.workers.unwrap_or(1)
        );

        let failures = match self.workers {
            Some(workers) if workers > 1 => {
                self.fetch_parallel(&missing, category, fetcher, workers)?
            }
            _ => missing
                .iter()
                .filter_map(|request| self.fetch_one(*request, category, fetcher).err())
                .map(|(request, error)| failure(request, error))
                .collect(),
        };

        Ok(failures)
    }

    /// Expand sites into file requests and drop what the cache already
    /// holds.
    fn missing_files(
        &self,
        site_ids: &[SiteId],
        category: ResourceCategory,
        kinds: &[ResourceKind],
    ) -> Vec<FileRequest> {
        let mut missing = Vec::new();
        for &site_id in site_ids {
            for &kind in kinds {
                if !self.cache.present(category, kind, site_id) {
                    missing.push(FileRequest { site_id, kind });
                }
            }
        }
        missing
    }

    /// Pre-flight budget check. Runs once, before any task launches; on
    /// failure no fetch is attempted and the cache is untouched.
    fn check_budget(
        &self,
        missing: &[FileRequest],
        category: ResourceCategory,
    ) -> Result<(), WindsolError> {
        let Some(max_bytes) = self.cache.max_bytes() else {
            return Ok(());
        };

        let estimate: u64 = missing
            .iter()
            .map(|request| average_file_mb(category, request.kind) * MB_BYTES)
            .sum();

        let wind = self.cache.category_bytes(ResourceCategory::Wind)?;
        let solar = self.cache.category_bytes(ResourceCategory::Solar)?;
        let used = wind + solar;

        if used + estimate > max_bytes {
            return Err(WindsolError::CacheBudgetExceeded {
                download_gb: bytes_to_gb(estimate),
                used_gb: bytes_to_gb(used),
                max_gb: bytes_to_gb(max_bytes),
                wind_gb: bytes_to_gb(wind),
                solar_gb: bytes_to_gb(solar),
            });
        }
        Ok(())
    }

    fn fetch_parallel(
        &self,
        missing: &[FileRequest],
        category: ResourceCategory,
        fetcher: &dyn Fetcher,
        workers: usize,
    ) -> Result<Vec<FetchFailure>, WindsolError> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|err| WindsolError::Filesystem(err.to_string()))?;

        let failures = Mutex::new(Vec::new());
        pool.install(|| {
            missing.par_iter().for_each(|request| {
                if let Err((request, error)) = self.fetch_one(*request, category, fetcher) {
                    failures
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(failure(request, error));
                }
            });
        });

        Ok(failures.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Fetch one file, write it into the cache layout, register it.
    fn fetch_one(
        &self,
        request: FileRequest,
        category: ResourceCategory,
        fetcher: &dyn Fetcher,
    ) -> Result<(), (FileRequest, WindsolError)> {
        let run = || -> Result<(), WindsolError> {
            let bytes = fetcher.fetch(category, request.kind, request.site_id)?;
            let path = self.cache.file_path(category, request.kind, request.site_id);
            LocalCache::write_payload_atomic(&path, &bytes)?;
            self.cache.register(category, request.kind, request.site_id)
        };
        run().map_err(|error| {
            warn!(
                "failed to fetch {}: {}",
                resource_file_name(category, request.kind, request.site_id),
                error
            );
            (request, error)
        })
    }
}

fn failure(request: FileRequest, error: WindsolError) -> FetchFailure {
    FetchFailure {
        site_id: request.site_id,
        kind: request.kind,
        error: error.to_string(),
    }
}
