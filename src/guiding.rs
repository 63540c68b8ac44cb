//! Self-guiding
//!
//! A flag-gated background loop that watches science frames as they
//! arrive, tracks a reference star, and nudges the mount to cancel
//! drift. Corrections are damped and capped: a displacement implying a
//! move over the cap means the lock is wrong, and triggers reacquisition
//! instead of a runaway correction.

use crate::analysis;
use crate::config::GuidingConfig;
use crate::drivers::Frame;
use crate::workers::{OpResult, Rig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What to do about one measured displacement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuideAction {
    /// Below the correction threshold.
    Hold,
    /// Implied move exceeds the cap; the star lock is not trustworthy.
    Lost,
    /// Issue these pulse corrections, arcseconds per axis.
    Correct { ra_arcsec: f64, dec_arcsec: f64 },
}

/// Rotate a pixel displacement into sky-frame axes and plan the
/// corrective move. The clocking angle and axis flips come from
/// calibration; neither sign convention is assumed.
pub fn plan_correction(
    dx_px: f64,
    dy_px: f64,
    config: &GuidingConfig,
    plate_scale: f64,
) -> GuideAction {
    let separation = (dx_px * dx_px + dy_px * dy_px).sqrt();
    if separation < config.threshold_px {
        return GuideAction::Hold;
    }

    let angle = config.clocking_angle_deg.to_radians();
    let mut ra_px = dx_px * angle.cos() + dy_px * angle.sin();
    let mut dec_px = -dx_px * angle.sin() + dy_px * angle.cos();
    if config.flip_ra {
        ra_px = -ra_px;
    }
    if config.flip_dec {
        dec_px = -dec_px;
    }

    // Move opposite the apparent drift, scaled down by the damping
    let ra_arcsec = -ra_px * plate_scale * config.ra_damping;
    let dec_arcsec = -dec_px * plate_scale * config.dec_damping;

    if ra_arcsec.abs() > config.max_move_arcsec || dec_arcsec.abs() > config.max_move_arcsec {
        return GuideAction::Lost;
    }
    GuideAction::Correct {
        ra_arcsec,
        dec_arcsec,
    }
}

/// Handle to a running guide loop. Stopping is cooperative and must be
/// requested from outside the loop (the orchestrator task), never from a
/// command queued on a worker the loop itself waits on.
pub struct Guider {
    enabled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Guider {
    pub fn start(
        rig: Arc<Rig>,
        frames: watch::Receiver<Option<Arc<Frame>>>,
        config: GuidingConfig,
        plate_scale: f64,
        saturation: u16,
    ) -> Self {
        let enabled = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(guide_loop(
            rig,
            frames,
            config,
            plate_scale,
            saturation,
            enabled.clone(),
        ));
        Self {
            enabled,
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(10), &mut task)
                .await
                .is_err()
            {
                tracing::warn!("guide loop did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

async fn guide_loop(
    rig: Arc<Rig>,
    mut frames: watch::Receiver<Option<Arc<Frame>>>,
    config: GuidingConfig,
    plate_scale: f64,
    saturation: u16,
    enabled: Arc<AtomicBool>,
) {
    tracing::info!("guiding started");
    // Pixel position of the locked guide star; None until acquired
    let mut lock: Option<(f64, f64)> = None;
    let mut misses = 0u32;

    while enabled.load(Ordering::SeqCst) {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                continue;
            }
        }
        let frame = frames.borrow_and_update().clone();
        let Some(frame) = frame else { continue };

        match lock {
            None => match analysis::brightest_guide_star(&frame, saturation) {
                Some(star) => {
                    tracing::info!(
                        "guide star locked at ({:.1}, {:.1}), peak {}",
                        star.x,
                        star.y,
                        star.peak
                    );
                    lock = Some((star.x, star.y));
                    misses = 0;
                }
                None => tracing::debug!("no usable guide star in frame"),
            },
            Some((x, y)) => {
                match analysis::centroid_near(&frame, x, y, config.search_radius_px) {
                    None => {
                        misses += 1;
                        tracing::warn!("guide star missing ({misses}/3)");
                        if misses >= 3 {
                            tracing::info!("falling back to full-frame reacquisition");
                            lock = None;
                        }
                    }
                    Some(star) => {
                        misses = 0;
                        let dx = star.x - x;
                        let dy = star.y - y;
                        match plan_correction(dx, dy, &config, plate_scale) {
                            GuideAction::Hold => {}
                            GuideAction::Lost => {
                                tracing::warn!(
                                    "displacement ({dx:.1}, {dy:.1}) px implies a move over the cap, reacquiring"
                                );
                                lock = None;
                            }
                            GuideAction::Correct {
                                ra_arcsec,
                                dec_arcsec,
                            } => {
                                tracing::debug!(
                                    "guide correction: RA {ra_arcsec:+.2}\", Dec {dec_arcsec:+.2}\""
                                );
                                apply_correction(&rig, ra_arcsec, dec_arcsec).await;
                            }
                        }
                    }
                }
            }
        }
    }
    tracing::info!("guiding stopped");
}

/// Dispatch each axis as its own pulse and wait out the move before the
/// next, so corrections never overlap a slew.
async fn apply_correction(rig: &Rig, ra_arcsec: f64, dec_arcsec: f64) {
    let telescope = rig.telescope().await;
    for (ra, dec) in [(ra_arcsec, 0.0), (0.0, dec_arcsec)] {
        if ra.abs() < 0.01 && dec.abs() < 0.01 {
            continue;
        }
        match telescope.jog(ra, dec).await {
            Ok(pending) => match pending.wait(Duration::from_secs(30)).await {
                OpResult::Done(()) => {}
                OpResult::Failed(e) => tracing::warn!("guide pulse failed: {e}"),
                OpResult::TimedOut => tracing::warn!("guide pulse timed out"),
            },
            Err(e) => tracing::warn!("guide pulse not accepted: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimObservatory;
    use chrono::Utc;

    fn config() -> GuidingConfig {
        GuidingConfig {
            threshold_px: 0.7,
            ra_damping: 0.5,
            dec_damping: 0.5,
            max_move_arcsec: 10.0,
            clocking_angle_deg: 0.0,
            flip_ra: false,
            flip_dec: false,
            search_radius_px: 20,
        }
    }

    #[test]
    fn small_displacement_holds() {
        assert_eq!(
            plan_correction(0.2, 0.3, &config(), 1.0),
            GuideAction::Hold
        );
    }

    #[test]
    fn correction_is_damped_and_opposed() {
        match plan_correction(4.0, 0.0, &config(), 1.0) {
            GuideAction::Correct {
                ra_arcsec,
                dec_arcsec,
            } => {
                assert!((ra_arcsec + 2.0).abs() < 1e-9);
                assert!(dec_arcsec.abs() < 1e-9);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn over_cap_displacement_means_lost_star() {
        assert_eq!(
            plan_correction(50.0, 0.0, &config(), 1.0),
            GuideAction::Lost
        );
    }

    #[test]
    fn corrections_never_exceed_cap() {
        let cfg = config();
        for dx in [-60.0, -25.0, 5.0, 19.9, 40.0] {
            match plan_correction(dx, 0.0, &cfg, 1.0) {
                GuideAction::Correct { ra_arcsec, .. } => {
                    assert!(ra_arcsec.abs() <= cfg.max_move_arcsec)
                }
                GuideAction::Hold | GuideAction::Lost => {}
            }
        }
    }

    #[test]
    fn axis_flip_reverses_sign() {
        let mut cfg = config();
        cfg.flip_ra = true;
        match plan_correction(4.0, 0.0, &cfg, 1.0) {
            GuideAction::Correct { ra_arcsec, .. } => assert!((ra_arcsec - 2.0).abs() < 1e-9),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn clocking_angle_rotates_axes() {
        let mut cfg = config();
        cfg.clocking_angle_deg = 90.0;
        // A pure-x detector displacement maps onto the Dec axis
        match plan_correction(4.0, 0.0, &cfg, 1.0) {
            GuideAction::Correct {
                ra_arcsec,
                dec_arcsec,
            } => {
                assert!(ra_arcsec.abs() < 1e-9);
                assert!((dec_arcsec - 2.0).abs() < 1e-9);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    fn star_frame(x0: f64, y0: f64) -> Arc<Frame> {
        let mut frame = Frame {
            width: 256,
            height: 256,
            data: vec![1000u16; 256 * 256],
            exposure_secs: 30.0,
            filter: None,
            captured_at: Utc::now(),
        };
        for y in 0..256u32 {
            for x in 0..256u32 {
                let dx = x as f64 - x0;
                let dy = y as f64 - y0;
                let value = 20_000.0 * (-(dx * dx + dy * dy) / 8.0).exp();
                frame.data[(y * 256 + x) as usize] =
                    (frame.data[(y * 256 + x) as usize] as f64 + value) as u16;
            }
        }
        Arc::new(frame)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn drifting_star_pulls_a_correction() {
        let sim = SimObservatory::instant();
        let rig = Arc::new(Rig::from_factory(&sim));
        let telescope = rig.telescope().await;
        crate::workers::await_live(&telescope.flags(), Duration::from_secs(2)).await;

        let before = *sim.state.coordinates.lock().unwrap();
        let (tx, rx) = watch::channel(None);
        let guider = Guider::start(rig.clone(), rx, config(), 1.0, 60_000);

        // First frame locks the star, the second shows a 3-pixel drift
        tx.send(Some(star_frame(128.0, 128.0))).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(Some(star_frame(131.0, 128.0))).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        guider.stop().await;
        let after = *sim.state.coordinates.lock().unwrap();
        assert!(
            (after.0 - before.0).abs() > 1e-9 || (after.1 - before.1).abs() > 1e-9,
            "telescope never moved"
        );
    }
}
