use std::collections::BTreeMap;

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::catalog::SiteCatalog;
use crate::domain::SiteId;

#[derive(Debug, Clone, PartialEq)]
struct SitePoint {
    id: SiteId,
    position: [f64; 2],
}

impl RTreeObject for SitePoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for SitePoint {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dlat = self.position[0] - point[0];
        let dlon = self.position[1] - point[1];
        dlat * dlat + dlon * dlon
    }
}

/// R-tree over site coordinates. Distance is planar Euclidean on
/// (latitude, longitude) degrees, matching the catalog's reference
/// metric. Supports exact removal so the allocator can retire drained
/// sites without rebuilding.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    tree: RTree<SitePoint>,
    positions: BTreeMap<SiteId, [f64; 2]>,
}

impl SpatialIndex {
    /// Index every site in the catalog (weather allocation).
    pub fn from_catalog(catalog: &SiteCatalog) -> Self {
        Self::from_points(
            catalog
                .sites()
                .map(|site| (site.site_id, site.latitude, site.longitude)),
        )
    }

    /// Index only sites with positive rated capacity (generation
    /// allocation); zero-capacity sites never enter the live set.
    pub fn from_generation_sites(catalog: &SiteCatalog) -> Self {
        Self::from_points(
            catalog
                .generation_sites()
                .map(|site| (site.site_id, site.latitude, site.longitude)),
        )
    }

    fn from_points(points: impl Iterator<Item = (SiteId, f64, f64)>) -> Self {
        let mut positions = BTreeMap::new();
        let mut objects = Vec::new();
        for (id, latitude, longitude) in points {
            let position = [latitude, longitude];
            positions.insert(id, position);
            objects.push(SitePoint { id, position });
        }
        Self {
            tree: RTree::bulk_load(objects),
            positions,
        }
    }

    pub fn nearest(&self, latitude: f64, longitude: f64) -> Option<SiteId> {
        self.nearest_with_distance2(latitude, longitude)
            .map(|(id, _)| id)
    }

    /// Nearest site and its squared distance. Ties at equal distance
    /// (coincident coordinates) go to the lowest site id.
    pub fn nearest_with_distance2(&self, latitude: f64, longitude: f64) -> Option<(SiteId, f64)> {
        let query = [latitude, longitude];
        let mut candidates = self.tree.nearest_neighbor_iter_with_distance_2(&query);
        let (first, best_d2) = candidates.next()?;
        let mut best_id = first.id;
        for (point, d2) in candidates {
            if d2 > best_d2 {
                break;
            }
            if point.id < best_id {
                best_id = point.id;
            }
        }
        Some((best_id, best_d2))
    }

    /// Remove a site from the live set. Returns false when the id was
    /// not indexed (already removed).
    pub fn remove(&mut self, id: SiteId) -> bool {
        match self.positions.remove(&id) {
            Some(position) => self.tree.remove(&SitePoint { id, position }).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::Site;
    use crate::domain::ResourceCategory;

    use super::*;

    fn site(id: u64, latitude: f64, longitude: f64, capacity: Option<f64>) -> Site {
        Site {
            site_id: SiteId(id),
            latitude,
            longitude,
            rated_capacity: capacity,
        }
    }

    fn catalog(sites: Vec<Site>) -> SiteCatalog {
        SiteCatalog::from_sites(ResourceCategory::Wind, sites).unwrap()
    }

    #[test]
    fn nearest_site() {
        let index = SpatialIndex::from_catalog(&catalog(vec![
            site(1, 0.0, 0.0, None),
            site(2, 5.0, 5.0, None),
        ]));
        assert_eq!(index.nearest(1.0, 1.0), Some(SiteId(1)));
        assert_eq!(index.nearest(4.0, 4.0), Some(SiteId(2)));
    }

    #[test]
    fn coincident_tie_goes_to_lowest_id() {
        let index = SpatialIndex::from_catalog(&catalog(vec![
            site(7, 2.0, 2.0, None),
            site(3, 2.0, 2.0, None),
            site(5, 2.0, 2.0, None),
        ]));
        assert_eq!(index.nearest(2.0, 2.0), Some(SiteId(3)));
    }

    #[test]
    fn removal_shrinks_live_set() {
        let mut index = SpatialIndex::from_catalog(&catalog(vec![
            site(1, 0.0, 0.0, None),
            site(2, 5.0, 5.0, None),
        ]));
        assert!(index.remove(SiteId(1)));
        assert!(!index.remove(SiteId(1)));
        assert_eq!(index.len(), 1);
        assert_eq!(index.nearest(0.0, 0.0), Some(SiteId(2)));
    }

    #[test]
    fn generation_index_skips_weather_sites() {
        let index = SpatialIndex::from_generation_sites(&catalog(vec![
            site(1, 0.0, 0.0, Some(10.0)),
            site(2, 1.0, 1.0, None),
            site(3, 2.0, 2.0, Some(0.0)),
        ]));
        assert_eq!(index.len(), 1);
        assert_eq!(index.nearest(2.0, 2.0), Some(SiteId(1)));
    }

    #[test]
    fn empty_index() {
        let index = SpatialIndex::from_generation_sites(&catalog(vec![site(1, 0.0, 0.0, None)]));
        assert!(index.is_empty());
        assert_eq!(index.nearest(0.0, 0.0), None);
    }
}
