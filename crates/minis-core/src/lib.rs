//! # Minis Validation Core
//!
//! Shared types for calibrating spontaneous synaptic release ("minis")
//! frequencies of a biophysical circuit model.
//!
//! A calibration run sweeps a set of candidate input frequencies over a
//! sample of cells per experimental condition, measures the resulting
//! spontaneous event rates and fits a saturating curve whose inverse at the
//! experimentally observed rate yields the calibration frequency.
//!
//! This crate holds the data model shared by the simulation and analysis
//! crates:
//!
//! - experiment conditions (`JobConfig`, `ConditionId`)
//! - cell populations and selection queries (`CellPopulation`, `CellQuery`)
//! - per-trial traces and events (`TrialRecord`, `TrialData`)
//! - consolidated per-frequency archives (`FrequencyArchive`)

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum MinisError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Simulation failure: {0}")]
    Simulation(String),

    #[error("Consolidation failure: {0}")]
    Consolidation(String),

    #[error("Curve fit failed: {0}")]
    Fit(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MinisError>;

/// Trace matrix columns: (time, voltage, current) per sample
pub const TIME: usize = 0;
pub const VOLTAGE: usize = 1;
pub const CURRENT: usize = 2;

/// Event matrix columns: (time, synapse id) per release event
pub const EVENT_TIME: usize = 0;
pub const EVENT_SYNAPSE: usize = 1;

// ============================================================================
// EXPERIMENT CONDITIONS
// ============================================================================

/// Synapse polarity of the minis under calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynapseKind {
    #[serde(rename = "Exc")]
    Excitatory,
    #[serde(rename = "Inh")]
    Inhibitory,
}

impl SynapseKind {
    /// Short tag used in config filenames and pathway labels
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Excitatory => "Exc",
            Self::Inhibitory => "Inh",
        }
    }
}

impl FromStr for SynapseKind {
    type Err = MinisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Exc" => Ok(Self::Excitatory),
            "Inh" => Ok(Self::Inhibitory),
            other => Err(MinisError::Configuration(format!(
                "unknown synapse kind: {other}"
            ))),
        }
    }
}

impl fmt::Display for SynapseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identity of one experimental condition, parsed from a job config filename
/// following the pattern `config_<CELL_TYPE>_<Exc|Inh>.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionId {
    pub cell_type: String,
    pub synapse: SynapseKind,
}

impl ConditionId {
    /// Parses a condition from a config filename.
    ///
    /// Returns `None` when the name does not follow the expected pattern,
    /// so callers can decide between skipping with a warning (analysis) and
    /// failing the condition (simulation).
    pub fn from_config_filename(filename: &str) -> Option<Self> {
        let stem = filename
            .strip_prefix("config_")?
            .strip_suffix(".yaml")
            .or_else(|| filename.strip_prefix("config_")?.strip_suffix(".yml"))?;
        let (cell_type, syn) = stem.rsplit_once('_')?;
        if cell_type.is_empty() {
            return None;
        }
        let synapse = SynapseKind::from_str(syn).ok()?;
        Some(Self {
            cell_type: cell_type.to_string(),
            synapse,
        })
    }

    /// Pathway label, e.g. `PC_Exc`. Also the name of the condition's
    /// output directory under the run output folder.
    pub fn pathway(&self) -> String {
        format!("{}_{}", self.cell_type, self.synapse.tag())
    }
}

/// Simulation protocol parameters of a condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    /// Simulated time (ms)
    pub t_stop: f64,
    /// Recording interval (ms)
    pub record_dt: f64,
    /// Integration step (ms)
    #[serde(default = "default_dt")]
    pub dt: f64,
    /// Voltage-clamp holding level (mV), when clamped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_v: Option<f64>,
    /// Whether to block sodium channels (TTX)
    #[serde(default)]
    pub enable_ttx: bool,
    /// Extracellular calcium level (mM)
    pub calcium: f64,
    /// Initial simulated time to fast-forward over (ms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_skip: Option<f64>,
}

fn default_dt() -> f64 {
    0.025
}

/// Peak-detection settings of a condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Minimum peak height (pA)
    pub peak_min_height: f64,
}

/// Experimentally observed event rate the calibration targets
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReferenceRate {
    pub mean: f64,
    pub std: f64,
}

/// Reference results section of a job config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSection {
    pub frequency: ReferenceRate,
}

/// One experimental condition, parsed from a per-condition YAML file.
///
/// Read-only after parsing, except that `minis_frequency` is appended once
/// the calibration fit has been inverted and the config is persisted back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub cells: CellQuery,
    pub protocol: Protocol,
    pub analysis: AnalysisParams,
    pub results: ResultsSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minis_frequency: Option<f64>,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

// ============================================================================
// CELL POPULATION
// ============================================================================

/// Identifier of one cell within a named population
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct CellId {
    pub population: String,
    pub id: u64,
}

impl CellId {
    /// Label used as the key of this cell inside a consolidated archive
    pub fn label(&self) -> String {
        format!("{}_{}", self.population, self.id)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.population, self.id)
    }
}

/// Static attributes of one cell in the population file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellInfo {
    pub population: String,
    pub id: u64,
    pub mtype: String,
    pub etype: String,
    /// Named targets (cell groups) this cell belongs to
    #[serde(default)]
    pub targets: Vec<String>,
}

impl CellInfo {
    pub fn cell_id(&self) -> CellId {
        CellId {
            population: self.population.clone(),
            id: self.id,
        }
    }
}

/// Predicate over cell attributes, the `cells` section of a job config.
///
/// Empty query matches every cell. All present fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellQuery {
    #[serde(rename = "$target", default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etype: Option<String>,
}

impl CellQuery {
    pub fn matches(&self, cell: &CellInfo) -> bool {
        if let Some(target) = &self.target {
            if !cell.targets.iter().any(|t| t == target) {
                return false;
            }
        }
        if let Some(mtype) = &self.mtype {
            if &cell.mtype != mtype {
                return false;
            }
        }
        if let Some(etype) = &self.etype {
            if &cell.etype != etype {
                return false;
            }
        }
        true
    }
}

/// Concrete cell population, loaded once per run from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellPopulation {
    pub cells: Vec<CellInfo>,
}

impl CellPopulation {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Resolves a query to cell ids, preserving population file order
    pub fn ids(&self, query: &CellQuery) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|c| query.matches(c))
            .map(CellInfo::cell_id)
            .collect()
    }
}

// ============================================================================
// TRIALS AND TRACES
// ============================================================================

/// Structured key of one trial: which cell was simulated at which input
/// frequency. Carried inside every intermediate artifact so no identifier
/// is ever recovered by parsing filenames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialKey {
    pub cell: CellId,
    pub frequency: f64,
}

impl fmt::Display for TrialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:.3} Hz", self.cell, self.frequency)
    }
}

/// Trace and events of one completed trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialData {
    pub cell: CellId,
    /// Samples, one row of (time ms, voltage mV, current nA) each.
    /// Time is strictly increasing and spans the full simulated duration.
    pub trace: Array2<f64>,
    /// Ground-truth release events, one row of (time ms, synapse id) each
    pub events: Array2<f64>,
}

impl TrialData {
    /// Simulated duration covered by the trace (ms)
    pub fn duration_ms(&self) -> f64 {
        let n = self.trace.nrows();
        if n < 2 {
            return 0.0;
        }
        self.trace[[n - 1, TIME]] - self.trace[[0, TIME]]
    }

    /// Drops samples and events at or before `t_start` (warm-up window)
    pub fn after(&self, t_start: f64) -> TrialData {
        if t_start == 0.0 {
            return self.clone();
        }
        let rows: Vec<usize> = (0..self.trace.nrows())
            .filter(|&i| self.trace[[i, TIME]] > t_start)
            .collect();
        let events: Vec<usize> = (0..self.events.nrows())
            .filter(|&i| self.events[[i, EVENT_TIME]] > t_start)
            .collect();
        TrialData {
            cell: self.cell.clone(),
            trace: self.trace.select(Axis(0), &rows),
            events: self.events.select(Axis(0), &events),
        }
    }
}

/// Content of one intermediate per-trial file, written by a trial worker
/// and deleted after consolidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub key: TrialKey,
    pub trace: Array2<f64>,
    pub events: Array2<f64>,
}

impl TrialRecord {
    /// Filename of this trial's intermediate artifact. Human-readable only;
    /// the authoritative identity is the embedded `key`.
    pub fn file_name(&self) -> String {
        trial_file_name(&self.key)
    }

    pub fn into_data(self) -> TrialData {
        TrialData {
            cell: self.key.cell,
            trace: self.trace,
            events: self.events,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let text = serde_json::to_string(self)?;
        fs::write(dir.join(self.file_name()), text)?;
        Ok(())
    }
}

/// Filename of the intermediate artifact for a trial key
pub fn trial_file_name(key: &TrialKey) -> String {
    format!(
        "trial_{}_{}_{:.3}.json",
        key.cell.population, key.cell.id, key.frequency
    )
}

/// True for filenames produced by `trial_file_name`
pub fn is_trial_file_name(name: &str) -> bool {
    name.starts_with("trial_") && name.ends_with(".json")
}

// ============================================================================
// CONSOLIDATED ARCHIVES
// ============================================================================

/// All surviving trials of one (condition, frequency) pair, keyed by cell
/// label. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyArchive {
    pub frequency: f64,
    pub trials: BTreeMap<String, TrialData>,
}

impl FrequencyArchive {
    pub fn new(frequency: f64) -> Self {
        Self {
            frequency,
            trials: BTreeMap::new(),
        }
    }

    /// Filename of the archive for a given frequency
    pub fn file_name(frequency: f64) -> String {
        format!("traces_freq{frequency:.3}.json")
    }

    /// True for filenames produced by `file_name`
    pub fn is_archive_file_name(name: &str) -> bool {
        name.starts_with("traces_freq") && name.ends_with(".json")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ============================================================================
// TESTS
// ============================================================================
