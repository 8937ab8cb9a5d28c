//! # Minis Validation Simulation
//!
//! Batch orchestration of minis calibration simulations.
//!
//! A run sweeps every experimental condition over a set of candidate input
//! frequencies in two phases:
//!
//! 1. **Simulate**: the cross-product of selected cells and frequencies is
//!    partitioned into batches and dispatched to an [`Executor`]. Each trial
//!    writes one intermediate file with its trace and release events.
//! 2. **Consolidate**: once *every* simulate batch across *every* condition
//!    has completed, per-(condition, frequency) archives are built from the
//!    intermediates, which are deleted only after an archive is fully
//!    written.
//!
//! The biophysical simulation itself is behind the [`TrialSimulator`] trait;
//! this crate only knows how to schedule it and collect its outputs. A
//! deterministic [`SyntheticSimulator`] is provided for tests and dry runs.

use log::{error, info, warn};
use minis_core::{
    is_trial_file_name, trial_file_name, CellId, CellPopulation, CellQuery, FrequencyArchive,
    JobConfig, MinisError, Protocol, Result, SynapseKind, TrialKey, TrialRecord,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Warm-up window excluded from analysis (ms). Trial workers still record
/// it; the cutoff is applied at analysis time, not at capture time.
pub const WARMUP_MS: f64 = 1000.0;

/// Tolerance when matching a trial's frequency against a target frequency
const FREQ_EPS: f64 = 1e-9;

// ============================================================================
// CELL SELECTOR
// ============================================================================

/// Resolves a cell query and bounds the result to `max_cells`.
///
/// When the query matches more cells than requested, a uniform sample
/// without replacement is drawn from the explicitly passed RNG, keeping the
/// population order of the survivors. An empty resolution is a fatal
/// condition-level error: a silent empty run would produce no data at all.
pub fn select_cells(
    population: &CellPopulation,
    query: &CellQuery,
    max_cells: usize,
    rng: &mut impl Rng,
) -> Result<Vec<CellId>> {
    let ids = population.ids(query);
    if ids.is_empty() {
        return Err(MinisError::Configuration(format!(
            "cell query matched no cells: {query:?}"
        )));
    }
    if ids.len() <= max_cells {
        return Ok(ids);
    }
    let mut picked = rand::seq::index::sample(rng, ids.len(), max_cells).into_vec();
    picked.sort_unstable();
    Ok(picked.into_iter().map(|i| ids[i].clone()).collect())
}

// ============================================================================
// BATCH PLANNER
// ============================================================================

/// Lazy partition of the (cell, frequency) cross-product into batches.
///
/// Trials are ordered cell-major, frequency-minor. The ordering is not
/// semantically required but is stable for a given input, so batch indices
/// in logs map to the same trials across retries. The planner holds no
/// mutable state besides its cursor and can always be re-derived from the
/// same inputs.
pub struct BatchPlan<'a> {
    cells: &'a [CellId],
    frequencies: &'a [f64],
    batch_size: usize,
    cursor: usize,
}

impl<'a> BatchPlan<'a> {
    pub fn new(cells: &'a [CellId], frequencies: &'a [f64], batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(MinisError::Configuration(
                "batch size must be positive".into(),
            ));
        }
        Ok(Self {
            cells,
            frequencies,
            batch_size,
            cursor: 0,
        })
    }

    pub fn total_trials(&self) -> usize {
        self.cells.len() * self.frequencies.len()
    }

    pub fn num_batches(&self) -> usize {
        let total = self.total_trials();
        (total + self.batch_size - 1) / self.batch_size
    }

    fn trial(&self, index: usize) -> TrialKey {
        let n_freq = self.frequencies.len();
        TrialKey {
            cell: self.cells[index / n_freq].clone(),
            frequency: self.frequencies[index % n_freq],
        }
    }
}

impl Iterator for BatchPlan<'_> {
    type Item = Vec<TrialKey>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.total_trials();
        if self.cursor >= total {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(total);
        let batch = (self.cursor..end).map(|i| self.trial(i)).collect();
        self.cursor = end;
        Some(batch)
    }
}

// ============================================================================
// JOB EXECUTOR FACADE
// ============================================================================

/// A unit of work dispatched to an executor
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Handle of one submitted job. Waiting consumes the handle and blocks
/// until the worker reports back, surfacing its failure without retry.
pub struct JobHandle {
    label: String,
    rx: mpsc::Receiver<Result<()>>,
    timeout: Option<Duration>,
}

impl JobHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Blocks until the job completes. A worker that dies without reporting
    /// (panic, killed process) or exceeds its time-to-live is a simulation
    /// failure like any other.
    pub fn wait(self) -> Result<()> {
        let received = match self.timeout {
            Some(ttl) => match self.rx.recv_timeout(ttl) {
                Ok(res) => res,
                Err(RecvTimeoutError::Timeout) => Err(MinisError::Simulation(format!(
                    "job '{}' exceeded its time-to-live of {:?}",
                    self.label, ttl
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(MinisError::Simulation(format!(
                    "job '{}' worker died without reporting a result",
                    self.label
                ))),
            },
            None => match self.rx.recv() {
                Ok(res) => res,
                Err(_) => Err(MinisError::Simulation(format!(
                    "job '{}' worker died without reporting a result",
                    self.label
                ))),
            },
        };
        received
    }
}

/// Facade over an external job-submission service. Implementations may run
/// work in-process, as local threads, or on a cluster scheduler.
pub trait Executor: Send + Sync {
    fn submit(&self, label: &str, job: Job) -> JobHandle;
}

/// Runs each job on its own local thread
pub struct LocalExecutor {
    timeout: Option<Duration>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self { timeout: None }
    }

    /// Worker time-to-live; jobs still running after it are reported failed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalExecutor {
    fn submit(&self, label: &str, job: Job) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // a send error means the handle was dropped; nothing to report to
            let _ = tx.send(job());
        });
        JobHandle {
            label: label.to_string(),
            rx,
            timeout: self.timeout,
        }
    }
}

/// Runs each job eagerly on the submitting thread. Deterministic ordering
/// makes this the executor of choice for tests and small local runs.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&self, label: &str, job: Job) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(job());
        JobHandle {
            label: label.to_string(),
            rx,
            timeout: None,
        }
    }
}

/// Awaits every handle of a phase, then returns the first failure.
///
/// All handles are waited on even after a failure is seen, so no failed
/// batch is silently swallowed and the phase boundary stays a full barrier.
pub fn join_all(handles: Vec<JobHandle>) -> Result<()> {
    let mut first_failure = None;
    for handle in handles {
        let label = handle.label().to_string();
        if let Err(err) = handle.wait() {
            error!("Job '{label}' failed: {err}");
            first_failure.get_or_insert(err);
        }
    }
    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ============================================================================
// TRIAL SIMULATOR
// ============================================================================

/// External collaborator executing one (cell, frequency) trial.
///
/// Implementations wrap the actual biophysical simulator; this crate only
/// requires that a trial yields a (time, voltage, current) trace and the
/// ground-truth list of spontaneous release events.
pub trait TrialSimulator: Send + Sync {
    fn run_trial(
        &self,
        key: &TrialKey,
        protocol: &Protocol,
        kind: SynapseKind,
        seed: u64,
    ) -> Result<TrialRecord>;
}

/// Deterministic stand-in for the biophysical simulator.
///
/// Produces a saturating minis response: the expected event rate at input
/// frequency `x` is `rate_scale * ln(1 + rate_gain * x)` events per second
/// over the post-warm-up window, with a per-(seed, cell, frequency) count
/// jitter of at most one event. Each event leaves a single well-separated
/// current peak, inward for excitatory minis.
pub struct SyntheticSimulator {
    /// Saturation level of the rate response
    pub rate_scale: f64,
    /// Gain of the rate response
    pub rate_gain: f64,
    /// Peak amplitude of one event (nA)
    pub peak_amplitude: f64,
}

impl Default for SyntheticSimulator {
    fn default() -> Self {
        Self {
            rate_scale: 10.0,
            rate_gain: 2.0,
            peak_amplitude: 0.05,
        }
    }
}

impl SyntheticSimulator {
    fn jitter(&self, key: &TrialKey, seed: u64) -> i64 {
        let mut hasher = DefaultHasher::new();
        (seed, &key.cell.population, key.cell.id, key.frequency.to_bits()).hash(&mut hasher);
        (hasher.finish() % 3) as i64 - 1
    }
}

impl TrialSimulator for SyntheticSimulator {
    fn run_trial(
        &self,
        key: &TrialKey,
        protocol: &Protocol,
        kind: SynapseKind,
        seed: u64,
    ) -> Result<TrialRecord> {
        let dt = protocol.record_dt;
        if dt <= 0.0 || protocol.t_stop <= 0.0 {
            return Err(MinisError::Simulation(format!(
                "invalid protocol for trial {key}: t_stop={}, record_dt={}",
                protocol.t_stop, protocol.record_dt
            )));
        }
        let n_samples = (protocol.t_stop / dt).floor() as usize + 1;
        let window_ms = protocol.t_stop - WARMUP_MS;

        // expected event count over the analysis window
        let rate = self.rate_scale * (1.0 + self.rate_gain * key.frequency).ln();
        let count = if rate > 0.0 && window_ms > 0.0 {
            let expected = rate * window_ms / 1000.0;
            (expected.round() as i64 + self.jitter(key, seed)).max(0) as usize
        } else {
            0
        };

        // events snapped to sample times, evenly spread over the window
        let spacing = if count > 0 {
            window_ms / count as f64
        } else {
            0.0
        };
        let mut events = Vec::with_capacity(count * 2);
        let mut event_samples = Vec::with_capacity(count);
        for k in 0..count {
            let t = WARMUP_MS + (k as f64 + 0.5) * spacing;
            let sample = ((t / dt).round() as usize).min(n_samples - 1);
            event_samples.push(sample);
            events.push(sample as f64 * dt);
            events.push(k as f64);
        }

        let hold = protocol.hold_v.unwrap_or(-70.0);
        let amplitude = match kind {
            // excitatory minis are inward currents; the analyzer flips them
            SynapseKind::Excitatory => -self.peak_amplitude,
            SynapseKind::Inhibitory => self.peak_amplitude,
        };
        let sigma = 4.0 * dt;
        let mut trace = Vec::with_capacity(n_samples * 3);
        for i in 0..n_samples {
            let t = i as f64 * dt;
            let mut current = 0.0;
            for &sample in &event_samples {
                let dist = t - sample as f64 * dt;
                if dist.abs() < 6.0 * sigma {
                    current += amplitude * (-0.5 * (dist / sigma).powi(2)).exp();
                }
            }
            trace.push(t);
            trace.push(hold);
            trace.push(current);
        }

        let trace = Array2::from_shape_vec((n_samples, 3), trace)
            .map_err(|e| MinisError::Simulation(e.to_string()))?;
        let events = Array2::from_shape_vec((count, 2), events)
            .map_err(|e| MinisError::Simulation(e.to_string()))?;
        Ok(TrialRecord {
            key: key.clone(),
            trace,
            events,
        })
    }
}

/// Runs the trials of one batch sequentially and writes one intermediate
/// file per trial into `output_dir`.
///
/// Sequential on purpose: one biophysical simulation's memory footprint at
/// a time per worker. Filenames embed the trial key, so concurrent batches
/// writing into the same directory never collide.
pub fn run_batch(
    simulator: &dyn TrialSimulator,
    batch: &[TrialKey],
    protocol: &Protocol,
    kind: SynapseKind,
    seed: u64,
    output_dir: &Path,
) -> Result<()> {
    for key in batch {
        info!("Running trial {key}, {kind} minis");
        let record = simulator.run_trial(key, protocol, kind, seed)?;
        record.save(output_dir)?;
    }
    Ok(())
}

// ============================================================================
// TRACE CONSOLIDATOR
// ============================================================================

/// Merges all intermediate trials of `frequency` in `output_dir` into one
/// archive, then deletes the intermediates.
///
/// Only this frequency's intermediates are touched: candidates are
/// pre-selected by the frequency encoded in their filename, so a corrupt
/// trial file of another frequency cannot fail this archive. The embedded
/// key stays authoritative for every file actually copied; a file whose key
/// disagrees with its name is left in place with a warning.
///
/// All-or-nothing relative to its inputs: the archive is written to a
/// temporary file and renamed into place only after every intermediate has
/// been copied, and sources are removed only after the rename succeeds. Any
/// failure before that point leaves every intermediate untouched, so an
/// absent archive always implies the trial files are still safe to retry.
///
/// Zero matching trials is not an error (a frequency may have lost all its
/// trials); it is logged and no archive is produced.
pub fn consolidate_frequency(output_dir: &Path, frequency: f64) -> Result<Option<PathBuf>> {
    let mut archive = FrequencyArchive::new(frequency);
    let mut sources = Vec::new();
    let suffix = format!("_{frequency:.3}.json");
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_trial_file_name(&name) || !name.ends_with(&suffix) {
            continue;
        }
        let path = entry.path();
        let record = TrialRecord::load(&path).map_err(|e| {
            MinisError::Consolidation(format!("cannot read trial file {}: {e}", path.display()))
        })?;
        if (record.key.frequency - frequency).abs() > FREQ_EPS {
            warn!(
                "Trial file {} embeds frequency {:.3} Hz, not {frequency:.3} Hz; leaving it in place",
                path.display(),
                record.key.frequency
            );
            continue;
        }
        archive
            .trials
            .insert(record.key.cell.label(), record.into_data());
        sources.push(path);
    }

    if sources.is_empty() {
        warn!(
            "No trials of frequency {frequency:.3} Hz in {}; skipping archive",
            output_dir.display()
        );
        return Ok(None);
    }
    info!(
        "Consolidating {} traces of {} at frequency {frequency:.3} Hz",
        sources.len(),
        output_dir.display()
    );

    let archive_path = output_dir.join(FrequencyArchive::file_name(frequency));
    let tmp_path = output_dir.join(format!(".{}.tmp", FrequencyArchive::file_name(frequency)));
    let write = || -> Result<()> {
        let text = serde_json::to_string(&archive)?;
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &archive_path)?;
        Ok(())
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(&tmp_path);
        return Err(MinisError::Consolidation(format!(
            "cannot write archive {}: {err}",
            archive_path.display()
        )));
    }

    // remove intermediates in a separate step, after the archive is in place
    for path in &sources {
        fs::remove_file(path).map_err(|e| {
            MinisError::Consolidation(format!("cannot remove trial file {}: {e}", path.display()))
        })?;
    }
    Ok(Some(archive_path))
}

// ============================================================================
// RUN ORCHESTRATION
// ============================================================================

/// Tunables of a full simulation run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of cells simulated per condition
    pub num_cells: usize,
    /// Override the `$target` of every condition's cell query
    pub target: Option<String>,
    /// Seed of the cell-sampling RNG, also passed to trial workers
    pub seed: u64,
    /// Override `t_stop` of every condition's protocol (ms)
    pub duration: Option<f64>,
    /// Override `forward_skip` of every condition's protocol (ms)
    pub forward_skip: Option<f64>,
    /// Number of trials per submitted batch
    pub batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            num_cells: 1000,
            target: None,
            seed: 0,
            duration: None,
            forward_skip: None,
            batch_size: 100,
        }
    }
}

/// Reads the candidate frequency table: tab-delimited, one `MINIS_FREQ`
/// column
pub fn read_frequencies(path: &Path) -> Result<Vec<f64>> {
    let text = fs::read_to_string(path)?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| {
        MinisError::Configuration(format!("empty frequencies file: {}", path.display()))
    })?;
    let column = header
        .split('\t')
        .position(|c| c.trim() == "MINIS_FREQ")
        .ok_or_else(|| {
            MinisError::Configuration(format!(
                "frequencies file {} must have a MINIS_FREQ column",
                path.display()
            ))
        })?;
    let mut frequencies = Vec::new();
    for line in lines {
        let field = line.split('\t').nth(column).ok_or_else(|| {
            MinisError::Configuration(format!("short row in frequencies file: {line:?}"))
        })?;
        let value = field.trim().parse::<f64>().map_err(|_| {
            MinisError::Configuration(format!("invalid frequency value: {field:?}"))
        })?;
        frequencies.push(value);
    }
    if frequencies.is_empty() {
        return Err(MinisError::Configuration(format!(
            "no frequencies in {}",
            path.display()
        )));
    }
    Ok(frequencies)
}

/// Lists job config files (`config_*.yaml`) in a directory, sorted by name
pub fn list_config_files(configs_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(configs_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("config_") && (name.ends_with(".yaml") || name.ends_with(".yml")) {
            files.push(entry.path());
        }
    }
    if files.is_empty() {
        return Err(MinisError::Configuration(format!(
            "no job configs at {}; config files must follow the pattern \
             config_<CELL_TYPE>_<Exc|Inh>.yaml",
            configs_dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

struct PlannedCondition {
    pathway: String,
    output_dir: PathBuf,
    trials: Vec<TrialKey>,
}

/// Runs minis simulations for every condition and consolidates the results.
///
/// Phase 1 submits every simulate batch of every condition and awaits them
/// all; any batch failure fails the run, because phase 2 assumes the
/// on-disk completeness of phase 1. That completeness is additionally
/// verified against the planned trials before any consolidation starts.
/// Phase 2 submits one consolidation job per (condition, frequency); those
/// log their own failures and never fail the run, leaving their
/// intermediates in place for a retry.
///
/// Condition-level configuration problems (malformed filename, unreadable
/// config, empty cell selection) skip that condition with an error log and
/// do not disturb the others.
pub fn run(
    population_file: &Path,
    frequencies_file: &Path,
    configs_dir: &Path,
    output: &Path,
    simulator: Arc<dyn TrialSimulator>,
    executor: &dyn Executor,
    options: &RunOptions,
) -> Result<()> {
    let population = CellPopulation::load(population_file)?;
    let frequencies = read_frequencies(frequencies_file)?;
    let config_files = list_config_files(configs_dir)?;
    let mut rng = StdRng::seed_from_u64(options.seed);

    let mut planned: Vec<PlannedCondition> = Vec::new();
    let mut handles = Vec::new();
    for config_file in &config_files {
        let filename = config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let condition = match minis_core::ConditionId::from_config_filename(&filename) {
            Some(condition) => condition,
            None => {
                error!(
                    "{filename} must be named config_<CELL_TYPE>_<Exc|Inh>.yaml; \
                     skipping condition"
                );
                continue;
            }
        };
        let mut config = match JobConfig::load(config_file) {
            Ok(config) => config,
            Err(err) => {
                error!("Cannot load {filename}: {err}; skipping condition");
                continue;
            }
        };
        if let Some(duration) = options.duration {
            config.protocol.t_stop = duration;
        }
        if let Some(forward_skip) = options.forward_skip {
            config.protocol.forward_skip = Some(forward_skip);
        }
        if let Some(target) = &options.target {
            config.cells.target = Some(target.clone());
        }

        let cells = match select_cells(&population, &config.cells, options.num_cells, &mut rng) {
            Ok(cells) => cells,
            Err(err) => {
                error!("Condition {}: {err}; skipping", condition.pathway());
                continue;
            }
        };
        let output_dir = output.join(condition.pathway());
        fs::create_dir_all(&output_dir)?;
        info!(
            "Condition {}: {} cells x {} frequencies",
            condition.pathway(),
            cells.len(),
            frequencies.len()
        );

        let plan = BatchPlan::new(&cells, &frequencies, options.batch_size)?;
        let mut trials = Vec::with_capacity(plan.total_trials());
        for (index, batch) in plan.enumerate() {
            trials.extend(batch.iter().cloned());
            let label = format!("{}-batch{}", condition.pathway(), index);
            let simulator = Arc::clone(&simulator);
            let protocol = config.protocol.clone();
            let kind = condition.synapse;
            let seed = options.seed;
            let dir = output_dir.clone();
            let job: Job = Box::new(move || {
                run_batch(simulator.as_ref(), &batch, &protocol, kind, seed, &dir)
            });
            handles.push(executor.submit(&label, job));
        }
        planned.push(PlannedCondition {
            pathway: condition.pathway(),
            output_dir,
            trials,
        });
    }

    info!("Submitted {} simulate batches; waiting", handles.len());
    join_all(handles)?;
    verify_phase_outputs(&planned)?;
    info!("Simulations have finished. Consolidating trace archives.");

    let mut handles = Vec::new();
    for condition in &planned {
        for &frequency in &frequencies {
            let dir = condition.output_dir.clone();
            let label = format!("consolidate-{}-{frequency:.3}", condition.pathway);
            let job: Job = Box::new(move || {
                if let Err(err) = consolidate_frequency(&dir, frequency) {
                    // one frequency's failure must not block the others;
                    // its intermediates stay on disk for a retry
                    error!(
                        "Consolidation of {} at {frequency:.3} Hz failed: {err}",
                        dir.display()
                    );
                }
                Ok(())
            });
            handles.push(executor.submit(&label, job));
        }
    }
    join_all(handles)?;
    info!("Minis validation run finished; trace archives saved.");
    Ok(())
}

/// Checks that every planned trial left its intermediate file on disk
/// before the consolidation phase is allowed to start.
fn verify_phase_outputs(planned: &[PlannedCondition]) -> Result<()> {
    let mut missing = 0usize;
    for condition in planned {
        for key in &condition.trials {
            if !condition.output_dir.join(trial_file_name(key)).is_file() {
                warn!(
                    "Missing intermediate for trial {key} in {}",
                    condition.output_dir.display()
                );
                missing += 1;
            }
        }
    }
    if missing > 0 {
        return Err(MinisError::Simulation(format!(
            "simulate phase incomplete: {missing} planned trials left no intermediate file"
        )));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use minis_core::CellInfo;
    use std::collections::HashSet;
    use std::io::Write;

    fn population(n: u64) -> CellPopulation {
        CellPopulation {
            cells: (1..=n)
                .map(|id| CellInfo {
                    population: "default".into(),
                    id,
                    mtype: "L5_TPC".into(),
                    etype: "cADpyr".into(),
                    targets: vec!["Mosaic".into()],
                })
                .collect(),
        }
    }

    fn cell(id: u64) -> CellId {
        CellId {
            population: "default".into(),
            id,
        }
    }

    #[test]
    fn test_select_all_when_under_max() {
        let pop = population(5);
        let mut rng = StdRng::seed_from_u64(0);
        let cells = select_cells(&pop, &CellQuery::default(), 10, &mut rng).unwrap();
        assert_eq!(cells.len(), 5);
        assert_eq!(cells, pop.ids(&CellQuery::default()));
    }

    #[test]
    fn test_select_sample_deterministic() {
        let pop = population(100);
        let mut rng = StdRng::seed_from_u64(42);
        let first = select_cells(&pop, &CellQuery::default(), 10, &mut rng).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let second = select_cells(&pop, &CellQuery::default(), 10, &mut rng).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 10);

        let unique: HashSet<_> = first.iter().collect();
        assert_eq!(unique.len(), 10);
        let all: HashSet<_> = pop.ids(&CellQuery::default()).into_iter().collect();
        assert!(first.iter().all(|c| all.contains(c)));
    }

    #[test]
    fn test_select_empty_query_fails() {
        let pop = population(5);
        let query = CellQuery {
            mtype: Some("NO_SUCH".into()),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        let err = select_cells(&pop, &query, 10, &mut rng).unwrap_err();
        assert!(matches!(err, MinisError::Configuration(_)));
    }

    #[test]
    fn test_batch_plan_partition() {
        let cells: Vec<_> = (1..=3).map(cell).collect();
        let frequencies = [0.0, 0.1, 1.0, 5.0];
        let plan = BatchPlan::new(&cells, &frequencies, 5).unwrap();
        assert_eq!(plan.total_trials(), 12);
        assert_eq!(plan.num_batches(), 3);

        let batches: Vec<_> = BatchPlan::new(&cells, &frequencies, 5).unwrap().collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[1].len(), 5);
        assert_eq!(batches[2].len(), 2);

        // cell-major, frequency-minor
        assert_eq!(batches[0][0].cell.id, 1);
        assert_eq!(batches[0][0].frequency, 0.0);
        assert_eq!(batches[0][3].frequency, 5.0);
        assert_eq!(batches[0][4].cell.id, 2);

        // union is the exact cross-product, each trial exactly once
        let mut seen = Vec::new();
        for batch in &batches {
            assert!(!batch.is_empty());
            seen.extend(batch.iter().map(|t| (t.cell.id, t.frequency.to_bits())));
        }
        let unique: HashSet<_> = seen.iter().collect();
        assert_eq!(seen.len(), 12);
        assert_eq!(unique.len(), 12);
    }

    #[test]
    fn test_batch_plan_rejects_zero_batch_size() {
        let cells = [cell(1)];
        assert!(BatchPlan::new(&cells, &[1.0], 0).is_err());
    }

    #[test]
    fn test_join_all_surfaces_first_failure_after_awaiting_all() {
        let executor = LocalExecutor::new();
        let ok = executor.submit("ok", Box::new(|| Ok(())));
        let bad = executor.submit(
            "bad",
            Box::new(|| Err(MinisError::Simulation("worker crashed".into()))),
        );
        let also_ok = executor.submit("ok2", Box::new(|| Ok(())));
        let err = join_all(vec![ok, bad, also_ok]).unwrap_err();
        assert!(matches!(err, MinisError::Simulation(_)));
    }

    #[test]
    fn test_worker_panic_is_a_simulation_failure() {
        let executor = LocalExecutor::new();
        let handle = executor.submit("panics", Box::new(|| panic!("boom")));
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, MinisError::Simulation(_)));
    }

    #[test]
    fn test_job_timeout() {
        let executor = LocalExecutor::with_timeout(Duration::from_millis(50));
        let handle = executor.submit(
            "slow",
            Box::new(|| {
                thread::sleep(Duration::from_secs(5));
                Ok(())
            }),
        );
        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("time-to-live"));
    }

    fn protocol() -> Protocol {
        Protocol {
            t_stop: 3000.0,
            record_dt: 0.5,
            dt: 0.025,
            hold_v: Some(-70.0),
            enable_ttx: false,
            calcium: 2.0,
            forward_skip: None,
        }
    }

    #[test]
    fn test_synthetic_simulator_events_match_rate() {
        let sim = SyntheticSimulator::default();
        let key = TrialKey {
            cell: cell(1),
            frequency: 1.0,
        };
        let record = sim.run_trial(&key, &protocol(), SynapseKind::Excitatory, 0).unwrap();
        // 10*ln(3) ~ 10.99 events/s over a 2 s window, +-1 jitter
        let expected = 10.0 * (3.0f64).ln() * 2.0;
        let count = record.events.nrows() as f64;
        assert!((count - expected).abs() <= 1.5, "count={count}");
        // excitatory currents are inward
        let min = record
            .trace
            .column(minis_core::CURRENT)
            .iter()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        assert!(min < -0.04);

        // deterministic for the same inputs
        let again = sim.run_trial(&key, &protocol(), SynapseKind::Excitatory, 0).unwrap();
        assert_eq!(record.events, again.events);
    }

    #[test]
    fn test_synthetic_simulator_zero_frequency() {
        let sim = SyntheticSimulator::default();
        let key = TrialKey {
            cell: cell(1),
            frequency: 0.0,
        };
        let record = sim.run_trial(&key, &protocol(), SynapseKind::Inhibitory, 0).unwrap();
        assert_eq!(record.events.nrows(), 0);
        assert!(record
            .trace
            .column(minis_core::CURRENT)
            .iter()
            .all(|&c| c == 0.0));
    }

    #[test]
    fn test_consolidation_merges_and_removes_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SyntheticSimulator::default();
        for id in 1..=2 {
            for freq in [0.1, 1.0] {
                let key = TrialKey {
                    cell: cell(id),
                    frequency: freq,
                };
                let record = sim
                    .run_trial(&key, &protocol(), SynapseKind::Inhibitory, 0)
                    .unwrap();
                record.save(dir.path()).unwrap();
            }
        }

        let path = consolidate_frequency(dir.path(), 0.1).unwrap().unwrap();
        let archive = FrequencyArchive::load(&path).unwrap();
        assert_eq!(archive.frequency, 0.1);
        assert_eq!(archive.trials.len(), 2);
        assert!(archive.trials.contains_key("default_1"));

        // only the 0.1 Hz intermediates are gone
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| is_trial_file_name(n))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|n| n.contains("1.000")));
    }

    #[test]
    fn test_consolidation_of_absent_frequency_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(consolidate_frequency(dir.path(), 0.5).unwrap().is_none());
    }

    #[test]
    fn test_consolidation_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SyntheticSimulator::default();
        for id in 1..=2 {
            let key = TrialKey {
                cell: cell(id),
                frequency: 0.1,
            };
            let record = sim
                .run_trial(&key, &protocol(), SynapseKind::Inhibitory, 0)
                .unwrap();
            record.save(dir.path()).unwrap();
        }
        // corrupt intermediate forces a failure partway through the copy
        let corrupt = dir.path().join("trial_default_9_0.100.json");
        let mut f = fs::File::create(&corrupt).unwrap();
        f.write_all(b"{ not json").unwrap();

        let err = consolidate_frequency(dir.path(), 0.1).unwrap_err();
        assert!(matches!(err, MinisError::Consolidation(_)));

        // no archive, every intermediate still on disk
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.iter().filter(|n| is_trial_file_name(n)).count(), 3);
        assert!(!names
            .iter()
            .any(|n| FrequencyArchive::is_archive_file_name(n)));
    }

    #[test]
    fn test_corrupt_intermediate_of_other_frequency_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SyntheticSimulator::default();
        for id in 1..=2 {
            let key = TrialKey {
                cell: cell(id),
                frequency: 0.1,
            };
            let record = sim
                .run_trial(&key, &protocol(), SynapseKind::Inhibitory, 0)
                .unwrap();
            record.save(dir.path()).unwrap();
        }
        let corrupt = dir.path().join("trial_default_9_1.000.json");
        let mut f = fs::File::create(&corrupt).unwrap();
        f.write_all(b"{ not json").unwrap();

        // the 1.0 Hz damage stays a 1.0 Hz problem
        let path = consolidate_frequency(dir.path(), 0.1).unwrap().unwrap();
        let archive = FrequencyArchive::load(&path).unwrap();
        assert_eq!(archive.trials.len(), 2);
        assert!(corrupt.is_file());

        let err = consolidate_frequency(dir.path(), 1.0).unwrap_err();
        assert!(matches!(err, MinisError::Consolidation(_)));
    }

    #[test]
    fn test_read_frequencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frequencies.tsv");
        fs::write(&path, "MINIS_FREQ\n0.0\n0.01\n0.1\n1.0\n").unwrap();
        let freqs = read_frequencies(&path).unwrap();
        assert_eq!(freqs, vec![0.0, 0.01, 0.1, 1.0]);

        fs::write(&path, "OTHER\n1.0\n").unwrap();
        assert!(read_frequencies(&path).is_err());
    }
}
