//! # Minis Validation Analysis
//!
//! Statistical analysis of consolidated minis simulation archives.
//!
//! Per (condition, frequency) archive, every trace is detrended, scanned
//! for spontaneous-event current peaks and sanity-checked against the
//! trial's ground-truth release events. Accepted trials are aggregated into
//! a per-frequency event rate (mean and standard deviation) and a pooled
//! amplitude distribution.
//!
//! Across frequencies, a saturating curve `f(x) = a * ln(1 + b*x)` is
//! fitted to the (input frequency, observed rate) pairs by weighted
//! nonlinear least squares and inverted at the experimentally observed
//! reference rate, yielding the calibration frequency of the condition.

use indicatif::ProgressBar;
use log::{error, info, warn};
use minis_core::{
    ConditionId, FrequencyArchive, JobConfig, MinisError, Result, SynapseKind, TrialData, CURRENT,
};
use nalgebra::{Matrix2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Warm-up window discarded from every trace before analysis (ms)
pub const T_START_MS: f64 = 1000.0;

// ============================================================================
// PEAK DETECTION
// ============================================================================

/// Indices and heights of local maxima of `signal` at or above `min_height`.
///
/// A maximum may be a flat run of equal samples; it counts once and is
/// reported at its midpoint (rounding left), the way clipped voltage-clamp
/// traces are conventionally scanned. Endpoints never qualify.
pub fn find_peaks(signal: &[f64], min_height: f64) -> (Vec<usize>, Vec<f64>) {
    let mut indices = Vec::new();
    let mut heights = Vec::new();
    if signal.len() < 3 {
        return (indices, heights);
    }
    let last = signal.len() - 1;
    let mut i = 1;
    while i < last {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead < last && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                if signal[i] >= min_height {
                    let mid = (i + ahead - 1) / 2;
                    indices.push(mid);
                    heights.push(signal[mid]);
                }
                i = ahead;
            }
        }
        i += 1;
    }
    (indices, heights)
}

/// Per-trial peak statistics
#[derive(Debug, Clone)]
pub struct TraceStats {
    /// Detected peak rate (events/s)
    pub rate: f64,
    /// Detected peak heights (nA)
    pub amplitudes: Vec<f64>,
    /// Sample indices of the detected peaks (diagnostics)
    pub peaks: Vec<usize>,
}

/// Detects spontaneous-event peaks on one post-warm-up trace.
///
/// The current is detrended by subtracting its mean, and inverted for
/// excitatory conditions so the positive-going peak finder sees inward
/// currents uniformly. `peak_min_height` is in pA and converted to the
/// trace's nA before thresholding.
pub fn process_trace(data: &TrialData, kind: SynapseKind, peak_min_height: f64) -> TraceStats {
    let current = data.trace.column(CURRENT);
    let n = current.len();
    let mean = if n > 0 {
        current.iter().sum::<f64>() / n as f64
    } else {
        0.0
    };
    let sign = match kind {
        SynapseKind::Excitatory => -1.0,
        SynapseKind::Inhibitory => 1.0,
    };
    let detrended: Vec<f64> = current.iter().map(|&c| sign * (c - mean)).collect();

    let (peaks, amplitudes) = find_peaks(&detrended, peak_min_height / 1000.0);
    let duration_s = data.duration_ms() / 1000.0;
    let rate = if duration_s > 0.0 {
        peaks.len() as f64 / duration_s
    } else {
        0.0
    };
    TraceStats {
        rate,
        amplitudes,
        peaks,
    }
}

// ============================================================================
// PER-FREQUENCY AGGREGATION
// ============================================================================

/// Aggregated statistics of one (condition, frequency) archive
#[derive(Debug, Clone)]
pub struct FrequencyStats {
    /// Input minis frequency of the archive (Hz)
    pub frequency: f64,
    /// Mean detected event rate across accepted trials (Hz); NaN when no
    /// trial was accepted
    pub mean_rate: f64,
    /// Population standard deviation of the rate across accepted trials
    pub std_rate: f64,
    /// Pooled peak amplitudes of accepted trials (pA)
    pub amplitudes: Vec<f64>,
    pub accepted: usize,
    pub rejected: usize,
}

/// Analyzes every trace of a consolidated archive.
///
/// A trial is accepted only when its detected peak count does not exceed
/// its ground-truth event count; more peaks than events is symptomatic of
/// detection artifacts (e.g. voltage-clamp ringing). Rejections are
/// expected in some fraction of trials and only logged in aggregate.
pub fn analyze_frequency(
    archive: &FrequencyArchive,
    kind: SynapseKind,
    peak_min_height: f64,
) -> FrequencyStats {
    let results: Vec<(TraceStats, usize)> = archive
        .trials
        .par_iter()
        .map(|(_, data)| {
            let cut = data.after(T_START_MS);
            let stats = process_trace(&cut, kind, peak_min_height);
            let n_events = cut.events.nrows();
            (stats, n_events)
        })
        .collect();

    let total = results.len();
    let mut rates = Vec::with_capacity(total);
    let mut amplitudes = Vec::new();
    let mut rejected = 0usize;
    for (stats, n_events) in results {
        if stats.peaks.len() <= n_events {
            rates.push(stats.rate);
            // nA to pA
            amplitudes.extend(stats.amplitudes.iter().map(|a| a * 1000.0));
        } else {
            rejected += 1;
        }
    }
    if rejected > 0 {
        warn!(
            "{rejected}/{total} traces didn't pass sanity check at {:.3} Hz",
            archive.frequency
        );
    }

    FrequencyStats {
        frequency: archive.frequency,
        mean_rate: mean(&rates),
        std_rate: std(&rates),
        amplitudes,
        accepted: rates.len(),
        rejected,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
fn std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|&v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

// ============================================================================
// CALIBRATION FITTER
// ============================================================================

/// Saturating curve used to fit observed rates against input frequencies
pub fn scaled_log1p(x: f64, a: f64, b: f64) -> f64 {
    a * (b * x).ln_1p()
}

/// Inverse of `scaled_log1p`: the input frequency expected to produce rate
/// `y` under the fitted relationship
pub fn scaled_log1p_inv(y: f64, a: f64, b: f64) -> f64 {
    (y / a).exp_m1() / b
}

const FIT_INITIAL_GUESS: (f64, f64) = (10.0, 1.0);
const FIT_MAX_ITER: usize = 200;
const FIT_STEP_TOL: f64 = 1e-10;
const FIT_LAMBDA_MAX: f64 = 1e12;

/// Fits `(a, b)` of `a * ln(1 + b*x)` by weighted least squares
/// (Levenberg-Marquardt with analytic Jacobian), weighting each point by
/// the inverse of its standard deviation.
///
/// Points with a zero or non-finite standard deviation are weighted like
/// the best-measured point (the largest finite weight, unit weight when
/// every sigma is degenerate) instead of an infinite one. Non-convergence
/// is a condition-fatal fit error; no fallback value is substituted.
pub fn fit_scaled_log1p(x: &[f64], y: &[f64], sigma: &[f64]) -> Result<(f64, f64)> {
    if x.len() != y.len() || x.len() != sigma.len() {
        return Err(MinisError::Fit(format!(
            "mismatched fit input lengths: {} x, {} y, {} sigma",
            x.len(),
            y.len(),
            sigma.len()
        )));
    }
    if x.len() < 2 {
        return Err(MinisError::Fit(format!(
            "need at least 2 points to fit, got {}",
            x.len()
        )));
    }
    let mut best_weight = 0.0f64;
    for &s in sigma {
        if s.is_finite() && s > 0.0 {
            best_weight = best_weight.max(1.0 / s);
        }
    }
    let fallback = if best_weight > 0.0 { best_weight } else { 1.0 };
    let weights: Vec<f64> = sigma
        .iter()
        .map(|&s| if s.is_finite() && s > 0.0 { 1.0 / s } else { fallback })
        .collect();

    let cost_of = |a: f64, b: f64| -> Option<f64> {
        let mut cost = 0.0;
        for i in 0..x.len() {
            if 1.0 + b * x[i] <= 0.0 {
                return None; // curve undefined at this point
            }
            let r = weights[i] * (y[i] - scaled_log1p(x[i], a, b));
            cost += r * r;
        }
        cost.is_finite().then_some(cost)
    };

    let (mut a, mut b) = FIT_INITIAL_GUESS;
    let mut cost = cost_of(a, b).ok_or_else(|| {
        MinisError::Fit("objective not finite at the initial guess".into())
    })?;
    let mut lambda = 1e-3;

    for _ in 0..FIT_MAX_ITER {
        // normal equations of the weighted residuals
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for i in 0..x.len() {
            let w = weights[i];
            let r = w * (y[i] - scaled_log1p(x[i], a, b));
            let da = -w * (b * x[i]).ln_1p();
            let db = -w * a * x[i] / (1.0 + b * x[i]);
            jtj[(0, 0)] += da * da;
            jtj[(0, 1)] += da * db;
            jtj[(1, 0)] += db * da;
            jtj[(1, 1)] += db * db;
            jtr[0] += da * r;
            jtr[1] += db * r;
        }

        let damped = jtj
            + Matrix2::new(
                lambda * jtj[(0, 0)].max(1e-12),
                0.0,
                0.0,
                lambda * jtj[(1, 1)].max(1e-12),
            );
        let step = match damped.try_inverse() {
            Some(inv) => inv * (-jtr),
            None => {
                lambda *= 10.0;
                if lambda > FIT_LAMBDA_MAX {
                    return Err(MinisError::Fit("singular normal equations".into()));
                }
                continue;
            }
        };

        let (na, nb) = (a + step[0], b + step[1]);
        match cost_of(na, nb) {
            Some(new_cost) if new_cost <= cost => {
                let converged = step.norm() < FIT_STEP_TOL * (1.0 + Vector2::new(a, b).norm())
                    || (cost - new_cost) < FIT_STEP_TOL * (1.0 + cost);
                a = na;
                b = nb;
                cost = new_cost;
                lambda = (lambda / 10.0).max(1e-12);
                if converged {
                    return Ok((a, b));
                }
            }
            _ => {
                lambda *= 10.0;
                if lambda > FIT_LAMBDA_MAX {
                    return Err(MinisError::Fit(format!(
                        "no converging step found (last cost {cost:.3e})"
                    )));
                }
            }
        }
    }
    Err(MinisError::Fit(format!(
        "did not converge in {FIT_MAX_ITER} iterations"
    )))
}

// ============================================================================
// PER-CONDITION ANALYSIS
// ============================================================================

/// One row of the final calibration report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResultRow {
    pub pathway: String,
    pub ref_freq: f64,
    pub ref_std: f64,
    #[serde(rename = "Ca")]
    pub calcium: f64,
    pub minis_freq: f64,
}

/// Numeric bundle persisted next to the per-condition table for reuse
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyBundle {
    pub input_freqs: Vec<f64>,
    pub mean_freqs: Vec<f64>,
    pub std_freqs: Vec<f64>,
    /// Pooled peak amplitudes per input frequency (pA)
    pub amplitudes: Vec<Vec<f64>>,
}

fn save_results(save_dir: &Path, stats: &[FrequencyStats], calcium: f64) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let mut table = String::from("calcium\tinput_freq\tmean_freq\tstd_freq\n");
    for s in stats {
        table.push_str(&format!(
            "{calcium:.3}\t{:.3}\t{:.3}\t{:.3}\n",
            s.frequency, s.mean_rate, s.std_rate
        ));
    }
    fs::write(save_dir.join("frequencies.tsv"), table)?;

    let bundle = FrequencyBundle {
        input_freqs: stats.iter().map(|s| s.frequency).collect(),
        mean_freqs: stats.iter().map(|s| s.mean_rate).collect(),
        std_freqs: stats.iter().map(|s| s.std_rate).collect(),
        amplitudes: stats.iter().map(|s| s.amplitudes.clone()).collect(),
    };
    fs::write(
        save_dir.join("frequencies.json"),
        serde_json::to_string(&bundle)?,
    )?;
    Ok(())
}

fn list_archives(job_traces_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(job_traces_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if FrequencyArchive::is_archive_file_name(&name) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Analyzes the consolidated archives of a single condition.
///
/// Per-frequency statistics are stored in an `analysis` folder within
/// `job_traces_dir`; the fitted calibration frequency is appended to the
/// job config, which is persisted into the traces folder. Returns `None`
/// when the condition has no archives at all (every trial failed).
pub fn analyze_job(job_config_file: &Path, job_traces_dir: &Path) -> Result<Option<JobResultRow>> {
    let filename = job_config_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let condition = ConditionId::from_config_filename(&filename).ok_or_else(|| {
        MinisError::Configuration(format!(
            "{filename} must be named config_<CELL_TYPE>_<Exc|Inh>.yaml"
        ))
    })?;
    let mut config = JobConfig::load(job_config_file)?;

    let archives = list_archives(job_traces_dir)?;
    info!("Analyzing {} ({} archives)", condition.pathway(), archives.len());
    let bar = ProgressBar::new(archives.len() as u64);
    let mut stats: Vec<FrequencyStats> = Vec::with_capacity(archives.len());
    for path in &archives {
        let archive = FrequencyArchive::load(path)?;
        stats.push(analyze_frequency(
            &archive,
            condition.synapse,
            config.analysis.peak_min_height,
        ));
        bar.inc(1);
    }
    bar.finish_and_clear();
    if stats.is_empty() {
        return Ok(None);
    }
    stats.sort_by(|lhs, rhs| lhs.frequency.total_cmp(&rhs.frequency));

    let analysis_dir = job_traces_dir.join("analysis");
    save_results(&analysis_dir, &stats, config.protocol.calcium)?;

    // a zero input frequency is degenerate for the fit; report it, skip it
    let skip = usize::from(stats[0].frequency == 0.0);
    let x: Vec<f64> = stats[skip..].iter().map(|s| s.frequency).collect();
    let y: Vec<f64> = stats[skip..].iter().map(|s| s.mean_rate).collect();
    let sigma: Vec<f64> = stats[skip..].iter().map(|s| s.std_rate).collect();
    let (a, b) = fit_scaled_log1p(&x, &y, &sigma)?;

    let ref_freq = config.results.frequency.mean;
    let minis_freq = scaled_log1p_inv(ref_freq, a, b);
    info!(
        "{}: fitted a={a:.3}, b={b:.3}; calibration frequency {minis_freq:.3} Hz",
        condition.pathway()
    );

    config.minis_frequency = Some(minis_freq);
    config.save(&job_traces_dir.join(&filename))?;

    Ok(Some(JobResultRow {
        pathway: condition.pathway(),
        ref_freq,
        ref_std: config.results.frequency.std,
        calcium: config.protocol.calcium,
        minis_freq,
    }))
}

// ============================================================================
// RESULTS AGGREGATOR
// ============================================================================

/// Analyzes every condition and writes the final `job_results.csv` report
/// into `jobs_traces_dir`.
///
/// Condition-level failures are isolated: a malformed config filename, a
/// missing traces folder or a failed fit skips that condition with a log
/// message and the remaining rows are still produced.
pub fn analyze_jobs(jobs_configs_dir: &Path, jobs_traces_dir: &Path) -> Result<Vec<JobResultRow>> {
    let mut config_files = Vec::new();
    for entry in fs::read_dir(jobs_configs_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".yaml") || name.ends_with(".yml") {
            config_files.push((name, entry.path()));
        }
    }
    config_files.sort();

    let mut rows = Vec::new();
    for (name, path) in &config_files {
        let condition = match ConditionId::from_config_filename(name) {
            Some(condition) => condition,
            None => {
                warn!(
                    "{name} must be named config_<CELL_TYPE>_<Exc|Inh>.yaml; skipping"
                );
                continue;
            }
        };
        let traces_dir = jobs_traces_dir.join(condition.pathway());
        if !traces_dir.is_dir() {
            warn!(
                "Condition {} has no traces folder under {}; skipping",
                condition.pathway(),
                jobs_traces_dir.display()
            );
            continue;
        }
        match analyze_job(path, &traces_dir) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => warn!("Condition {} produced no archives", condition.pathway()),
            Err(err) => error!("Condition {} failed: {err}", condition.pathway()),
        }
    }

    write_report(&rows, &jobs_traces_dir.join("job_results.csv"))?;
    info!("Minis validation analysis finished: {} result rows", rows.len());
    Ok(rows)
}

/// Writes the final report: one comma-delimited row per condition
pub fn write_report(rows: &[JobResultRow], path: &Path) -> Result<()> {
    let mut text = String::from("pathway,ref_freq,ref_std,Ca,minis_freq\n");
    for row in rows {
        text.push_str(&format!(
            "{},{},{},{},{}\n",
            row.pathway, row.ref_freq, row.ref_std, row.calcium, row.minis_freq
        ));
    }
    fs::write(path, text)?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use minis_core::CellId;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    #[test]
    fn test_find_peaks() {
        let signal = [0.0, 1.0, 0.0, 0.5, 0.0, 2.0, 1.9, 0.0];
        let (idx, heights) = find_peaks(&signal, 0.9);
        assert_eq!(idx, vec![1, 5]);
        assert_eq!(heights, vec![1.0, 2.0]);

        // endpoints never qualify
        let rising = [0.0, 1.0, 2.0];
        assert!(find_peaks(&rising, 0.0).0.is_empty());
    }

    #[test]
    fn test_plateau_peak_reported_at_midpoint() {
        let (idx, heights) = find_peaks(&[0.0, 1.0, 1.0, 0.0], 0.5);
        assert_eq!(idx, vec![1]);
        assert_eq!(heights, vec![1.0]);

        let (idx, _) = find_peaks(&[0.0, 2.0, 2.0, 2.0, 0.0, 0.0], 0.5);
        assert_eq!(idx, vec![2]);

        // a flat run reaching the end of the signal is not a peak
        assert!(find_peaks(&[0.0, 1.0, 1.0], 0.5).0.is_empty());
    }

    /// Builds a trial with `n` current peaks at 100 ms spacing after the
    /// warm-up window and `n_events` ground-truth events.
    fn synthetic_trial(n: usize, n_events: usize, sign: f64) -> TrialData {
        let dt = 1.0;
        let t_stop = 3000.0;
        let n_samples = (t_stop / dt) as usize + 1;
        let mut trace = Vec::with_capacity(n_samples * 3);
        let peak_times: Vec<f64> = (0..n).map(|k| 1200.0 + 100.0 * k as f64).collect();
        for i in 0..n_samples {
            let t = i as f64 * dt;
            let mut current = 0.0;
            for &tp in &peak_times {
                if (t - tp).abs() < 3.0 {
                    current += sign * 0.05 * (1.0 - (t - tp).abs() / 3.0);
                }
            }
            trace.push(t);
            trace.push(-70.0);
            trace.push(current);
        }
        let mut events = Vec::with_capacity(n_events * 2);
        for k in 0..n_events {
            events.push(1200.0 + 100.0 * k as f64);
            events.push(k as f64);
        }
        TrialData {
            cell: CellId {
                population: "default".into(),
                id: 1,
            },
            trace: Array2::from_shape_vec((n_samples, 3), trace).unwrap(),
            events: Array2::from_shape_vec((n_events, 2), events).unwrap(),
        }
    }

    #[test]
    fn test_peak_count_round_trip() {
        let mut archive = FrequencyArchive::new(0.1);
        archive
            .trials
            .insert("default_1".into(), synthetic_trial(5, 5, -1.0));
        let stats = analyze_frequency(&archive, SynapseKind::Excitatory, 10.0);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.amplitudes.len(), 5);
        // 5 peaks over the ~2 s post-warm-up window
        assert!((stats.mean_rate - 2.5).abs() < 0.1);
        // amplitudes reported in pA
        assert!(stats.amplitudes.iter().all(|&a| a > 30.0 && a < 60.0));
    }

    #[test]
    fn test_sanity_rejection_excludes_but_does_not_raise() {
        let mut archive = FrequencyArchive::new(0.1);
        // 5 detected peaks but only 2 ground-truth events: rejected
        archive
            .trials
            .insert("default_1".into(), synthetic_trial(5, 2, 1.0));
        // well-formed trial: accepted
        archive
            .trials
            .insert("default_2".into(), synthetic_trial(4, 4, 1.0));
        let stats = analyze_frequency(&archive, SynapseKind::Inhibitory, 10.0);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.amplitudes.len(), 4);
        assert!((stats.mean_rate - 2.0).abs() < 0.1);
        assert_eq!(stats.std_rate, 0.0);
    }

    #[test]
    fn test_all_rejected_yields_nan_mean() {
        let mut archive = FrequencyArchive::new(0.1);
        archive
            .trials
            .insert("default_1".into(), synthetic_trial(5, 0, 1.0));
        let stats = analyze_frequency(&archive, SynapseKind::Inhibitory, 10.0);
        assert_eq!(stats.accepted, 0);
        assert!(stats.mean_rate.is_nan());
    }

    #[test]
    fn test_fit_round_trip() {
        let x = [1.0, 2.0, 5.0, 10.0];
        let y: Vec<f64> = x.iter().map(|&v| scaled_log1p(v, 10.0, 2.0)).collect();
        let sigma = [1.0; 4];
        let (a, b) = fit_scaled_log1p(&x, &y, &sigma).unwrap();
        assert!((a - 10.0).abs() < 1e-6, "a={a}");
        assert!((b - 2.0).abs() < 1e-6, "b={b}");

        // inverting any point on the curve returns its input frequency
        for &v in &x {
            let inv = scaled_log1p_inv(scaled_log1p(v, a, b), a, b);
            assert!((inv - v).abs() < 1e-9);
        }
    }

    #[test]
    fn test_fit_weights_respect_sigma() {
        // identical data, one point heavily corrupted but almost unweighted
        let x = [1.0, 2.0, 5.0, 10.0];
        let mut y: Vec<f64> = x.iter().map(|&v| scaled_log1p(v, 10.0, 2.0)).collect();
        y[3] += 50.0;
        let sigma = [0.01, 0.01, 0.01, 1e6];
        let (a, b) = fit_scaled_log1p(&x, &y, &sigma).unwrap();
        assert!((a - 10.0).abs() < 0.1, "a={a}");
        assert!((b - 2.0).abs() < 0.1, "b={b}");
    }

    #[test]
    fn test_zero_sigma_weighted_like_best_point() {
        let x = [1.0, 2.0, 5.0, 10.0];
        let noise = [0.0, 0.3, -0.3, 0.3];
        let y: Vec<f64> = x
            .iter()
            .zip(noise)
            .map(|(&v, n)| scaled_log1p(v, 10.0, 2.0) + n)
            .collect();
        // a zero sigma means "exactly measured"; the point must count like
        // the best finite one, not like an average one
        let anchored = fit_scaled_log1p(&x, &y, &[0.0, 0.05, 0.05, 0.05]).unwrap();
        let uniform = fit_scaled_log1p(&x, &y, &[0.05, 0.05, 0.05, 0.05]).unwrap();
        assert!((anchored.0 - uniform.0).abs() < 1e-6);
        assert!((anchored.1 - uniform.1).abs() < 1e-6);
    }

    #[test]
    fn test_fit_rejects_nan_observations() {
        let x = [1.0, 2.0, 5.0];
        let y = [f64::NAN, 3.0, 5.0];
        let sigma = [1.0; 3];
        let err = fit_scaled_log1p(&x, &y, &sigma).unwrap_err();
        assert!(matches!(err, MinisError::Fit(_)));
    }

    #[test]
    fn test_fit_requires_enough_points() {
        assert!(fit_scaled_log1p(&[1.0], &[2.0], &[1.0]).is_err());
    }

    #[test]
    fn test_frequency_stats_empty_archive() {
        let archive = FrequencyArchive {
            frequency: 0.5,
            trials: BTreeMap::new(),
        };
        let stats = analyze_frequency(&archive, SynapseKind::Inhibitory, 10.0);
        assert_eq!(stats.accepted, 0);
        assert_eq!(stats.rejected, 0);
        assert!(stats.mean_rate.is_nan());
    }

    fn write_archive(dir: &Path, frequency: f64, trial: TrialData) {
        let mut archive = FrequencyArchive::new(frequency);
        archive.trials.insert(trial.cell.label(), trial);
        fs::write(
            dir.join(FrequencyArchive::file_name(frequency)),
            serde_json::to_string(&archive).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_zero_frequency_reported_but_not_fitted() {
        let dir = tempfile::tempdir().unwrap();
        let config = "
cells:
  $target: Mosaic
protocol:
  t_stop: 3000.0
  record_dt: 0.5
  hold_v: -70.0
  calcium: 2.0
analysis:
  peak_min_height: 10.0
results:
  frequency:
    mean: 1.4
    std: 0.2
";
        let config_path = dir.path().join("config_MC_Inh.yaml");
        fs::write(&config_path, config).unwrap();
        let traces = dir.path().join("MC_Inh");
        fs::create_dir(&traces).unwrap();

        // the 0 Hz archive's only trial fails the sanity check, so its mean
        // rate is NaN; a fit that included the 0 Hz point could not converge
        write_archive(&traces, 0.0, synthetic_trial(5, 0, 1.0));
        write_archive(&traces, 0.1, synthetic_trial(2, 2, 1.0));
        write_archive(&traces, 1.0, synthetic_trial(12, 12, 1.0));

        let row = analyze_job(&config_path, &traces).unwrap().unwrap();
        assert!(row.minis_freq.is_finite(), "minis_freq={}", row.minis_freq);
        assert!(row.minis_freq > 0.0);

        // the 0 Hz row is still part of the per-frequency table
        let tsv = fs::read_to_string(traces.join("analysis").join("frequencies.tsv")).unwrap();
        assert_eq!(tsv.lines().count(), 4);
        assert!(tsv.contains("2.000\t0.000\tNaN"), "tsv:\n{tsv}");
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![JobResultRow {
            pathway: "PC_Exc".into(),
            ref_freq: 1.4,
            ref_std: 0.2,
            calcium: 2.0,
            minis_freq: 0.075,
        }];
        let path = dir.path().join("job_results.csv");
        write_report(&rows, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("pathway,ref_freq,ref_std,Ca,minis_freq\n"));
        assert!(text.contains("PC_Exc,1.4,0.2,2,0.075"));
    }
}
