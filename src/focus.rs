//! Focusing
//!
//! Two cooperating behaviors over one focuser: a bounded startup sweep
//! that brackets best focus and fits a parabola to (position, FWHM)
//! samples, and a background loop that trims focus as the ambient
//! temperature drifts during the night.

use crate::analysis;
use crate::config::FocusConfig;
use crate::drivers::{ExposureKind, ExposureRequest};
use crate::error::DeviceError;
use crate::workers::{Camera, OpResult, Rig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum FocusError {
    #[error("no usable focus metric after {attempts} attempts")]
    NoMetric { attempts: u32 },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Why a parabola fit was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitRejection {
    /// The fit has no minimum (flat or inverted curvature).
    NoMinimum,
    /// The fitted minimum lands at the edge of the sampled range; the
    /// sweep never bracketed the true minimum.
    AtBoundary,
    /// The fitted minimum is implausibly far from the start position.
    TooFar,
}

#[derive(Debug)]
pub struct FocusOutcome {
    pub final_position: i32,
    pub reverted: bool,
    pub samples: Vec<(i32, f64)>,
}

/// Least-squares parabola through (x, y) samples; returns the vertex x
/// and the curvature. Positions are re-centered before solving so large
/// focuser counts do not wreck the conditioning.
pub fn parabola_vertex(samples: &[(f64, f64)]) -> Option<(f64, f64)> {
    if samples.len() < 3 {
        return None;
    }
    let n = samples.len() as f64;
    let x_mean = samples.iter().map(|(x, _)| x).sum::<f64>() / n;

    let (mut sx, mut sx2, mut sx3, mut sx4) = (0.0, 0.0, 0.0, 0.0);
    let (mut sy, mut sxy, mut sx2y) = (0.0, 0.0, 0.0);
    for &(x, y) in samples {
        let x = x - x_mean;
        let x2 = x * x;
        sx += x;
        sx2 += x2;
        sx3 += x2 * x;
        sx4 += x2 * x2;
        sy += y;
        sxy += x * y;
        sx2y += x2 * y;
    }

    // Normal equations for y = a x² + b x + c, solved by Cramer's rule
    let det = sx4 * (sx2 * n - sx * sx) - sx3 * (sx3 * n - sx * sx2)
        + sx2 * (sx3 * sx - sx2 * sx2);
    if det.abs() < 1e-12 {
        return None;
    }
    let det_a = sx2y * (sx2 * n - sx * sx) - sx3 * (sxy * n - sx * sy)
        + sx2 * (sxy * sx - sx2 * sy);
    let det_b = sx4 * (sxy * n - sx * sy) - sx2y * (sx3 * n - sx * sx2)
        + sx2 * (sx3 * sy - sx2 * sxy);

    let a = det_a / det;
    let b = det_b / det;
    if a.abs() < 1e-12 {
        return None;
    }
    Some((x_mean - b / (2.0 * a), a))
}

/// Judge a completed sweep: where to move, or why not to trust the fit.
pub fn decide_focus(
    samples: &[(i32, f64)],
    initial: i32,
    max_travel: i32,
) -> Result<i32, FitRejection> {
    let points: Vec<(f64, f64)> = samples.iter().map(|&(p, m)| (p as f64, m)).collect();
    let (vertex, curvature) = parabola_vertex(&points).ok_or(FitRejection::NoMinimum)?;
    if curvature <= 0.0 {
        return Err(FitRejection::NoMinimum);
    }

    let min_pos = samples.iter().map(|&(p, _)| p).min().unwrap_or(initial) as f64;
    let max_pos = samples.iter().map(|&(p, _)| p).max().unwrap_or(initial) as f64;
    let spacing = (max_pos - min_pos) / (samples.len().max(2) - 1) as f64;
    // A vertex at (or past) the first or last sampled position means the
    // sweep never bracketed the minimum
    if vertex <= min_pos + 0.25 * spacing || vertex >= max_pos - 0.25 * spacing {
        return Err(FitRejection::AtBoundary);
    }
    if (vertex - initial as f64).abs() > max_travel as f64 {
        return Err(FitRejection::TooFar);
    }
    Ok(vertex.round() as i32)
}

/// Startup coarse focus: sample inward from the start position, jump out
/// past it, sample outward, fit, then move to the fitted minimum or
/// revert to where we started.
pub async fn coarse_focus(
    rig: &Rig,
    config: &FocusConfig,
    exposure_secs: f64,
    saturation: u16,
) -> Result<FocusOutcome, FocusError> {
    let camera = rig.camera().await;
    let focuser = rig.focuser().await;

    let initial = focuser
        .position()
        .await?
        .result(Duration::from_secs(10))
        .await?;
    tracing::info!(
        "coarse focus: {} samples, step {}, from position {}",
        config.iterations,
        config.step,
        initial
    );

    let half = (config.iterations / 2).max(1);
    let mut samples: Vec<(i32, f64)> = Vec::with_capacity(config.iterations as usize);
    let mut position = initial;

    for i in 0..config.iterations {
        if i > 0 {
            let target = if i < half {
                position - config.step
            } else if i == half {
                // One larger jump from the innermost sample to past the
                // start position
                initial + config.step
            } else {
                position + config.step
            };
            focuser
                .move_to(target)
                .await?
                .result(Duration::from_secs(60))
                .await?;
            position = target;
        }

        let metric = match measure_metric(&camera, exposure_secs, saturation, config.metric_retries)
            .await
        {
            Ok(metric) => metric,
            Err(e) => {
                tracing::error!("focus sweep aborted at position {position}: {e}");
                revert(&focuser, initial).await;
                return Err(e);
            }
        };
        tracing::debug!("focus sample: position {position}, metric {metric:.2}");
        samples.push((position, metric));
    }

    match decide_focus(&samples, initial, config.max_travel) {
        Ok(best) => {
            focuser
                .move_to(best)
                .await?
                .result(Duration::from_secs(60))
                .await?;
            tracing::info!("focus set to {best} (started at {initial})");
            Ok(FocusOutcome {
                final_position: best,
                reverted: false,
                samples,
            })
        }
        Err(reason) => {
            tracing::warn!("focus fit rejected ({reason:?}), reverting to {initial}");
            revert(&focuser, initial).await;
            Ok(FocusOutcome {
                final_position: initial,
                reverted: true,
                samples,
            })
        }
    }
}

async fn revert(focuser: &crate::workers::Focuser, initial: i32) {
    if let Ok(pending) = focuser.move_to(initial).await {
        let _ = pending.wait(Duration::from_secs(60)).await;
    }
}

/// Take a test exposure and measure the focus metric, retrying a small
/// fixed number of times when a frame yields nothing usable.
async fn measure_metric(
    camera: &Camera,
    exposure_secs: f64,
    saturation: u16,
    retries: u32,
) -> Result<f64, FocusError> {
    let attempts = retries.max(1);
    let timeout = Duration::from_secs_f64(exposure_secs + 30.0);
    for attempt in 1..=attempts {
        let pending = camera
            .expose(ExposureRequest {
                seconds: exposure_secs,
                kind: ExposureKind::Light,
            })
            .await?;
        match pending.wait(timeout).await {
            OpResult::Done(frame) => {
                if let Some(metric) = analysis::focus_metric(&frame, saturation) {
                    return Ok(metric);
                }
                tracing::debug!("focus exposure {attempt}/{attempts} had no measurable stars");
            }
            OpResult::Failed(e) => tracing::warn!("focus exposure failed: {e}"),
            OpResult::TimedOut => tracing::warn!("focus exposure timed out"),
        }
    }
    Err(FocusError::NoMetric { attempts })
}

/// Decide a drift-compensation move from a temperature delta. None means
/// skip: either the jump looks like a sensor glitch or the implied move
/// rounds to nothing.
pub fn drift_steps(delta_c: f64, coefficient: f64, glitch_limit_c: f64) -> Option<i32> {
    if delta_c.abs() > glitch_limit_c {
        return None;
    }
    let steps = (delta_c * coefficient).round() as i32;
    if steps == 0 {
        None
    } else {
        Some(steps)
    }
}

/// Background focus drift compensation, proportional to ambient
/// temperature change.
pub struct DriftCompensator {
    enabled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl DriftCompensator {
    pub fn start(rig: Arc<Rig>, config: FocusConfig) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(drift_loop(rig, config, enabled.clone()));
        Self {
            enabled,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }
}

async fn drift_loop(rig: Arc<Rig>, config: FocusConfig, enabled: Arc<AtomicBool>) {
    tracing::info!("focus drift compensation started");
    let period = Duration::from_secs(config.adjust_frequency_minutes.max(1) * 60);
    // Temperature at the last applied adjustment; deltas accumulate
    // against this, not against every sample
    let mut reference: Option<f64> = None;

    'outer: loop {
        let deadline = tokio::time::Instant::now() + period;
        while tokio::time::Instant::now() < deadline {
            if !enabled.load(Ordering::SeqCst) {
                break 'outer;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let focuser = rig.focuser().await;
        if !focuser.is_live() {
            continue;
        }
        let temperature = match focuser.temperature().await {
            Ok(pending) => match pending.wait(Duration::from_secs(10)).await {
                OpResult::Done(t) => t,
                _ => None,
            },
            Err(_) => None,
        };
        let Some(current) = temperature else {
            tracing::debug!("no focuser temperature available, skipping adjustment");
            continue;
        };

        let Some(baseline) = reference else {
            reference = Some(current);
            continue;
        };

        let delta = current - baseline;
        if delta.abs() > config.glitch_temp_jump_c {
            tracing::warn!(
                "temperature jumped {delta:+.1}°C since last adjustment, ignoring as a sensor glitch"
            );
            continue;
        }
        let Some(steps) = drift_steps(delta, config.temperature_coefficient, config.glitch_temp_jump_c)
        else {
            continue;
        };

        match focuser.move_by(steps).await {
            Ok(pending) => match pending.wait(Duration::from_secs(60)).await {
                OpResult::Done(new_position) => {
                    tracing::info!(
                        "drift compensation: {delta:+.2}°C, moved {steps:+} steps to {new_position}"
                    );
                    reference = Some(current);
                }
                OpResult::Failed(e) => tracing::warn!("drift adjustment failed: {e}"),
                OpResult::TimedOut => tracing::warn!("drift adjustment timed out"),
            },
            Err(e) => tracing::warn!("drift adjustment not accepted: {e}"),
        }
    }
    tracing::info!("focus drift compensation stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_of_clean_parabola() {
        // y = (x - 5)² + 2
        let samples: Vec<(f64, f64)> = (0..9)
            .map(|i| {
                let x = i as f64;
                (x, (x - 5.0).powi(2) + 2.0)
            })
            .collect();
        let (vertex, curvature) = parabola_vertex(&samples).unwrap();
        assert!((vertex - 5.0).abs() < 1e-6);
        assert!(curvature > 0.0);
    }

    #[test]
    fn linear_data_has_no_minimum() {
        let samples: Vec<(i32, f64)> = (0..5).map(|i| (i * 100, 2.0 + i as f64)).collect();
        assert_eq!(
            decide_focus(&samples, 200, 1000),
            Err(FitRejection::NoMinimum)
        );
    }

    #[test]
    fn minimum_at_first_sample_rejected() {
        // True minimum sits at (or before) the first sampled position
        let samples: Vec<(i32, f64)> = (0..5)
            .map(|i| {
                let x = i as f64;
                (i * 100, (x + 1.0).powi(2))
            })
            .collect();
        assert_eq!(
            decide_focus(&samples, 200, 10_000),
            Err(FitRejection::AtBoundary)
        );
    }

    #[test]
    fn minimum_at_last_sample_rejected() {
        let samples: Vec<(i32, f64)> = (0..5)
            .map(|i| {
                let x = i as f64;
                (i * 100, (x - 5.0).powi(2))
            })
            .collect();
        assert_eq!(
            decide_focus(&samples, 200, 10_000),
            Err(FitRejection::AtBoundary)
        );
    }

    #[test]
    fn interior_minimum_accepted() {
        let samples: Vec<(i32, f64)> = (0..9)
            .map(|i| {
                let position = 24_600 + i * 100;
                let x = (position - 25_000) as f64 / 100.0;
                (position, 3.0 + 0.5 * x * x)
            })
            .collect();
        assert_eq!(decide_focus(&samples, 25_000, 1000), Ok(25_000));
    }

    #[test]
    fn distant_minimum_rejected() {
        let samples: Vec<(i32, f64)> = (0..9)
            .map(|i| {
                let position = 24_600 + i * 100;
                let x = (position - 25_000) as f64 / 100.0;
                (position, 3.0 + 0.5 * x * x)
            })
            .collect();
        // Same fit, but a tiny travel allowance
        assert_eq!(
            decide_focus(&samples, 26_000, 500),
            Err(FitRejection::TooFar)
        );
    }

    #[test]
    fn drift_steps_proportional_to_delta() {
        assert_eq!(drift_steps(-2.0, -20.0, 5.0), Some(40));
        assert_eq!(drift_steps(1.0, -20.0, 5.0), Some(-20));
    }

    #[test]
    fn drift_skips_glitches_and_noise() {
        // Implausible jump: sensor glitch
        assert_eq!(drift_steps(8.0, -20.0, 5.0), None);
        // Sub-step change rounds to nothing
        assert_eq!(drift_steps(0.01, -20.0, 5.0), None);
    }

    #[tokio::test]
    async fn sweep_aborts_and_reverts_without_stars() {
        use crate::sim::SimObservatory;

        let sim = SimObservatory::instant();
        let rig = Rig::from_factory(&sim);
        crate::workers::await_live(&rig.focuser().await.flags(), Duration::from_secs(2)).await;
        crate::workers::await_live(&rig.camera().await.flags(), Duration::from_secs(2)).await;

        let config = FocusConfig {
            iterations: 5,
            step: 100,
            metric_retries: 2,
            ..FocusConfig::default()
        };
        // Simulated frames are starless, so every sample fails its metric
        let result = coarse_focus(&rig, &config, 0.05, 60_000).await;
        assert!(matches!(result, Err(FocusError::NoMetric { .. })));
        // Focuser reverted to where it started
        assert_eq!(*sim.state.focuser_position.lock().unwrap(), 25_000);
    }
}
