use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::WindsolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Wind,
    Solar,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 2] = [ResourceCategory::Wind, ResourceCategory::Solar];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::Wind => "wind",
            ResourceCategory::Solar => "solar",
        }
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceCategory {
    type Err = WindsolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "wind" => Ok(ResourceCategory::Wind),
            "solar" => Ok(ResourceCategory::Solar),
            _ => Err(WindsolError::InvalidCategory(value.to_string())),
        }
    }
}

/// Kinds of per-site resource files held by the repository. Wire tokens
/// match the repository file names (`wind_fcst_102.hdf5` and so on).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
pub enum ResourceKind {
    #[serde(rename = "met")]
    Met,
    #[serde(rename = "irradiance")]
    Irradiance,
    #[serde(rename = "power")]
    Power,
    #[serde(rename = "fcst")]
    Forecast,
    #[serde(rename = "fcst-prob")]
    ForecastProb,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Met,
        ResourceKind::Irradiance,
        ResourceKind::Power,
        ResourceKind::Forecast,
        ResourceKind::ForecastProb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Met => "met",
            ResourceKind::Irradiance => "irradiance",
            ResourceKind::Power => "power",
            ResourceKind::Forecast => "fcst",
            ResourceKind::ForecastProb => "fcst-prob",
        }
    }

    /// Irradiance files only exist for solar sites; everything else is
    /// published for both categories.
    pub fn valid_for(&self, category: ResourceCategory) -> bool {
        match self {
            ResourceKind::Irradiance => category == ResourceCategory::Solar,
            _ => true,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = WindsolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "met" => Ok(ResourceKind::Met),
            "irradiance" => Ok(ResourceKind::Irradiance),
            "power" => Ok(ResourceKind::Power),
            "fcst" => Ok(ResourceKind::Forecast),
            "fcst-prob" => Ok(ResourceKind::ForecastProb),
            _ => Err(WindsolError::InvalidKind(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub u64);

impl SiteId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SiteId {
    type Err = WindsolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(SiteId)
            .map_err(|_| WindsolError::InvalidSiteId(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = WindsolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<u64>()
            .map(NodeId)
            .map_err(|_| WindsolError::InvalidNodeId(value.to_string()))
    }
}

/// Deterministic repository/cache file name for one site's data file.
pub fn resource_file_name(category: ResourceCategory, kind: ResourceKind, site: SiteId) -> String {
    format!("{category}_{kind}_{site}.hdf5")
}

/// Per-category site manifest file name.
pub fn manifest_file_name(category: ResourceCategory) -> String {
    format!("{category}_site_meta.json")
}

/// A caller-supplied grid location requesting resource data. Generation
/// nodes carry the capacity to be filled; weather nodes carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandNode {
    pub id: NodeId,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_mw: Option<f64>,
}

impl DemandNode {
    pub fn weather(id: NodeId, latitude: f64, longitude: f64) -> Self {
        Self {
            id,
            latitude,
            longitude,
            capacity_mw: None,
        }
    }

    pub fn generation(id: NodeId, latitude: f64, longitude: f64, capacity_mw: f64) -> Self {
        Self {
            id,
            latitude,
            longitude,
            capacity_mw: Some(capacity_mw),
        }
    }

    pub fn is_generation(&self) -> bool {
        self.capacity_mw.is_some()
    }
}

/// Parse a node list in the CLI exchange format: one node per line,
/// `node_id,latitude,longitude[,capacity]`. A leading header line is
/// skipped when its first field is not numeric.
pub fn parse_node_list(text: &str) -> Result<Vec<DemandNode>, WindsolError> {
    let mut nodes = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if index == 0 && fields[0].parse::<u64>().is_err() {
            continue;
        }
        if fields.len() != 3 && fields.len() != 4 {
            return Err(WindsolError::InvalidNodeLine {
                line: index + 1,
                message: format!("expected 3 or 4 fields, found {}", fields.len()),
            });
        }
        let id: NodeId = fields[0].parse()?;
        let latitude = parse_float(fields[1], index + 1, "latitude")?;
        let longitude = parse_float(fields[2], index + 1, "longitude")?;
        let capacity_mw = match fields.get(3) {
            Some(value) if !value.is_empty() => Some(parse_float(value, index + 1, "capacity")?),
            _ => None,
        };
        nodes.push(DemandNode {
            id,
            latitude,
            longitude,
            capacity_mw,
        });
    }
    Ok(nodes)
}

/// Parse a generator list (`node_id,capacity`) and attach the capacities
/// to the matching nodes. Nodes without a row keep their prior capacity.
pub fn parse_generator_list(text: &str) -> Result<Vec<(NodeId, f64)>, WindsolError> {
    let mut entries = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if index == 0 && fields[0].parse::<u64>().is_err() {
            continue;
        }
        if fields.len() != 2 {
            return Err(WindsolError::InvalidNodeLine {
                line: index + 1,
                message: format!("expected 2 fields, found {}", fields.len()),
            });
        }
        let id: NodeId = fields[0].parse()?;
        let capacity = parse_float(fields[1], index + 1, "capacity")?;
        entries.push((id, capacity));
    }
    Ok(entries)
}

/// Generation requests need a capacity on every node; a weather-style
/// node in a power request is a caller mistake, not a zero-demand node.
pub fn require_capacities(nodes: &[DemandNode]) -> Result<(), WindsolError> {
    match nodes.iter().find(|node| !node.is_generation()) {
        Some(node) => Err(WindsolError::MissingCapacity(node.id)),
        None => Ok(()),
    }
}

pub fn assign_capacities(nodes: &mut [DemandNode], generators: &[(NodeId, f64)]) {
    for node in nodes.iter_mut() {
        if let Some((_, capacity)) = generators.iter().find(|(id, _)| *id == node.id) {
            node.capacity_mw = Some(*capacity);
        }
    }
}

fn parse_float(value: &str, line: usize, field: &str) -> Result<f64, WindsolError> {
    value.parse::<f64>().map_err(|_| WindsolError::InvalidNodeLine {
        line,
        message: format!("{field} is not a number: {value}"),
    })
}
