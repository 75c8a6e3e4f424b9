use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::debug;

use crate::allocator::{resolve_generation, resolve_weather, NodeAllocation};
use crate::cache::LocalCache;
use crate::catalog::SiteCatalog;
use crate::domain::{DemandNode, NodeId, ResourceCategory, ResourceKind};
use crate::error::WindsolError;
use crate::fetch::{FetchFailure, FetchOrchestrator, KindProfile};
use crate::remote::Fetcher;

/// One resolution request: the demand nodes, the resource category, and
/// whether this is a generation (power) or weather (met) resolution.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub nodes: Vec<DemandNode>,
    pub category: ResourceCategory,
    pub profile: KindProfile,
}

/// Resolution result. Allocations are always usable when this struct is
/// returned at all; under-allocated nodes and per-file fetch failures
/// are carried alongside so the caller can judge partial results.
#[derive(Debug, Serialize)]
pub struct Resolution {
    pub category: ResourceCategory,
    pub allocations: Vec<NodeAllocation>,
    pub under_allocated: Vec<NodeId>,
    pub fetch_failures: Vec<FetchFailure>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.under_allocated.is_empty() && self.fetch_failures.is_empty()
    }
}

/// Public entry point: allocates demand nodes against the site catalog,
/// then guarantees every referenced site's files are in the local cache
/// before the allocation is handed back.
pub struct Resolver<'a> {
    catalog: &'a SiteCatalog,
    cache: &'a LocalCache,
    workers: Option<usize>,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a SiteCatalog, cache: &'a LocalCache, workers: Option<usize>) -> Self {
        Self {
            catalog,
            cache,
            workers,
        }
    }

    pub fn resolve(
        &self,
        request: &ResolveRequest,
        fetcher: &dyn Fetcher,
    ) -> Result<Resolution, WindsolError> {
        if request.category != self.catalog.category() {
            return Err(WindsolError::CategoryMismatch {
                catalog: self.catalog.category(),
                requested: request.category,
            });
        }

        let outcome = match request.profile {
            KindProfile::Generation { .. } => resolve_generation(&request.nodes, self.catalog),
            KindProfile::Weather => resolve_weather(&request.nodes, self.catalog),
        };

        let site_ids = outcome.site_ids();
        debug!(
            "{} allocation references {} sites",
            request.category,
            site_ids.len()
        );

        let orchestrator = FetchOrchestrator::new(self.cache, self.workers);
        let fetch_failures =
            orchestrator.ensure_present(&site_ids, request.category, request.profile, fetcher)?;

        Ok(Resolution {
            category: request.category,
            under_allocated: outcome.under_allocated(),
            allocations: outcome.allocations,
            fetch_failures,
        })
    }

    /// Cache paths of one node's files for `kind`, in allocation order
    /// (nearest site first), for callers reading the resolved data.
    pub fn site_files(&self, allocation: &NodeAllocation, kind: ResourceKind) -> Vec<Utf8PathBuf> {
        allocation
            .site_ids()
            .map(|site_id| self.cache.file_path(self.catalog.category(), kind, site_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use camino::Utf8PathBuf;

    use crate::catalog::Site;
    use crate::domain::SiteId;

    use super::*;

    struct MockFetcher {
        calls: Mutex<Vec<(ResourceKind, SiteId)>>,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Fetcher for MockFetcher {
        fn fetch(
            &self,
            _category: ResourceCategory,
            kind: ResourceKind,
            site_id: SiteId,
        ) -> Result<Vec<u8>, WindsolError> {
            self.calls.lock().unwrap().push((kind, site_id));
            Ok(vec![1u8; 32])
        }

        fn fetch_manifest(&self, _category: ResourceCategory) -> Result<Vec<u8>, WindsolError> {
            Ok(b"[]".to_vec())
        }
    }

    fn site(id: u64, latitude: f64, longitude: f64, capacity: f64) -> Site {
        Site {
            site_id: SiteId(id),
            latitude,
            longitude,
            rated_capacity: Some(capacity),
        }
    }

    fn fixture() -> (tempfile::TempDir, SiteCatalog, LocalCache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache = LocalCache::new(root, None).unwrap();
        let catalog = SiteCatalog::from_sites(
            ResourceCategory::Wind,
            vec![site(1, 0.0, 0.0, 10.0), site(2, 1.0, 1.0, 10.0)],
        )
        .unwrap();
        (dir, catalog, cache)
    }

    #[test]
    fn resolve_allocates_and_caches() {
        let (_dir, catalog, cache) = fixture();
        let resolver = Resolver::new(&catalog, &cache, None);
        let fetcher = MockFetcher::new();

        let resolution = resolver
            .resolve(
                &ResolveRequest {
                    nodes: vec![DemandNode::generation(NodeId(1), 0.0, 0.0, 15.0)],
                    category: ResourceCategory::Wind,
                    profile: KindProfile::Generation { forecasts: false },
                },
                &fetcher,
            )
            .unwrap();

        assert!(resolution.is_complete());
        assert_eq!(resolution.allocations[0].shares.len(), 2);
        assert!(cache.present(ResourceCategory::Wind, ResourceKind::Power, SiteId(1)));
        assert!(cache.present(ResourceCategory::Wind, ResourceKind::Power, SiteId(2)));
    }

    #[test]
    fn site_files_follow_allocation_order() {
        let (_dir, catalog, cache) = fixture();
        let resolver = Resolver::new(&catalog, &cache, None);
        let fetcher = MockFetcher::new();

        let resolution = resolver
            .resolve(
                &ResolveRequest {
                    nodes: vec![DemandNode::generation(NodeId(1), 1.0, 1.0, 15.0)],
                    category: ResourceCategory::Wind,
                    profile: KindProfile::Generation { forecasts: false },
                },
                &fetcher,
            )
            .unwrap();

        // Node sits on site 2, so site 2 leads the preference order.
        let files = resolver.site_files(&resolution.allocations[0], ResourceKind::Power);
        assert_eq!(files.len(), 2);
        assert!(files[0].as_str().ends_with("wind_power_2.hdf5"));
        assert!(files[1].as_str().ends_with("wind_power_1.hdf5"));
    }

    #[test]
    fn category_mismatch_is_rejected() {
        let (_dir, catalog, cache) = fixture();
        let resolver = Resolver::new(&catalog, &cache, None);
        let fetcher = MockFetcher::new();

        let err = resolver
            .resolve(
                &ResolveRequest {
                    nodes: Vec::new(),
                    category: ResourceCategory::Solar,
                    profile: KindProfile::Weather,
                },
                &fetcher,
            )
            .unwrap_err();

        assert!(matches!(err, WindsolError::CategoryMismatch { .. }));
    }
}
