//! Calibration frames
//!
//! Flats per ticket filter with the exposure time adapted frame-by-frame
//! into the target median band, then darks matching every exposure time
//! used. Runs at most once per ticket via the ticket's calibrated marker.

use crate::config::{CalibrationConfig, FilterWheelMap};
use crate::drivers::{ExposureKind, ExposureRequest};
use crate::error::DeviceError;
use crate::ticket::{ObservationTicket, ScheduledTicket};
use crate::workers::{Camera, Rig};
use crate::{analysis, fits, storage};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("filter {0:?} has no slot in the filter wheel map")]
    UnknownFilter(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CalibrationOutcome {
    pub flats: u32,
    pub darks: u32,
}

pub struct CalibrationSequencer {
    config: CalibrationConfig,
    saturation: u16,
    /// Adapted flat exposure per filter, remembered across tickets.
    flat_exposures: HashMap<String, f64>,
}

impl CalibrationSequencer {
    pub fn new(config: CalibrationConfig, saturation: u16) -> Self {
        Self {
            config,
            saturation,
            flat_exposures: HashMap::new(),
        }
    }

    /// Take flats and darks for one ticket. A ticket already marked
    /// calibrated is skipped.
    pub async fn calibrate(
        &mut self,
        rig: &Rig,
        wheel: &FilterWheelMap,
        scheduled: &ScheduledTicket,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        if !scheduled.mark_calibrated() {
            tracing::debug!("{} already calibrated", scheduled.ticket.name);
            return Ok(CalibrationOutcome::default());
        }

        let directory = scheduled.directory.join("calibration");
        std::fs::create_dir_all(&directory)?;
        tracing::info!("calibrating {} into {:?}", scheduled.ticket.name, directory);

        let flats = self
            .take_flats(rig, wheel, &scheduled.ticket, &directory)
            .await?;
        let darks = self.take_darks(rig, &scheduled.ticket, &directory).await?;

        tracing::info!(
            "calibration done for {}: {flats} flats, {darks} darks",
            scheduled.ticket.name
        );
        Ok(CalibrationOutcome { flats, darks })
    }

    async fn take_flats(
        &mut self,
        rig: &Rig,
        wheel: &FilterWheelMap,
        ticket: &ObservationTicket,
        directory: &Path,
    ) -> Result<u32, CalibrationError> {
        let lamp = rig.lamp().await;
        let camera = rig.camera().await;
        let lamp_timeout = Duration::from_secs(self.config.lamp_timeout_secs);

        // Bounded waits both ways; a lamp that never reports ready is a
        // failure, not something to expose through
        lamp.turn_on().await?.result(lamp_timeout).await?;

        let result = self
            .flats_with_lamp(&camera, wheel, ticket, directory)
            .await;

        let off = match lamp.turn_off().await {
            Ok(pending) => pending.result(lamp_timeout).await,
            Err(e) => Err(e),
        };

        let taken = result?;
        off?;
        Ok(taken)
    }

    async fn flats_with_lamp(
        &mut self,
        camera: &Camera,
        wheel: &FilterWheelMap,
        ticket: &ObservationTicket,
        directory: &Path,
    ) -> Result<u32, CalibrationError> {
        let saturation = self.saturation as f64;
        let band_low = 0.75 * saturation;
        let band_mid = 0.875 * saturation;
        let mut taken = 0u32;

        for filter in &ticket.filters {
            let slot = wheel
                .slot_for(filter)
                .ok_or_else(|| CalibrationError::UnknownFilter(filter.clone()))?;
            camera
                .set_filter(slot)
                .await?
                .result(Duration::from_secs(60))
                .await?;

            let key = filter.to_lowercase();
            let mut exposure = self
                .flat_exposures
                .get(&key)
                .copied()
                .unwrap_or(self.config.initial_flat_exposure_secs);

            for _ in 0..self.config.frame_count {
                let mut frame = camera
                    .expose(ExposureRequest {
                        seconds: exposure,
                        kind: ExposureKind::Flat,
                    })
                    .await?
                    .result(Duration::from_secs_f64(exposure + 60.0))
                    .await?;
                frame.filter = Some(filter.to_uppercase());

                let prefix = storage::flat_prefix(exposure, filter);
                let sequence = storage::next_sequence(directory, &prefix)?;
                let name = storage::numbered_filename(&prefix, sequence);
                fits::write_frame(&directory.join(&name), &frame, None, "Flat")?;
                taken += 1;

                let median = analysis::frame_median(&frame) as f64;
                if median < band_low || median >= saturation {
                    // Aim for the middle of the band; faint filters are
                    // allowed far coarser jumps per step
                    let scale = band_mid / median.max(1.0);
                    let clamped = if self.config.is_faint(filter) {
                        scale.clamp(0.1, 10.0)
                    } else {
                        scale.clamp(1.0 / 3.0, 3.0)
                    };
                    let adjusted = (exposure * clamped)
                        .clamp(0.001, self.config.max_flat_exposure_secs);
                    tracing::debug!(
                        "flat median {median:.0} ADU outside band, exposure {exposure:.3}s -> {adjusted:.3}s"
                    );
                    exposure = adjusted;
                }
            }

            tracing::info!("flat exposure for {filter} settled at {exposure:.3}s");
            self.flat_exposures.insert(key, exposure);
        }
        Ok(taken)
    }

    async fn take_darks(
        &mut self,
        rig: &Rig,
        ticket: &ObservationTicket,
        directory: &Path,
    ) -> Result<u32, CalibrationError> {
        let camera = rig.camera().await;

        // Every flat exposure used tonight, plus the ticket's own science
        // exposure times when no flat already matches
        let mut exposure_set: Vec<f64> = ticket
            .filters
            .iter()
            .filter_map(|f| self.flat_exposures.get(&f.to_lowercase()).copied())
            .collect();
        for &science in &ticket.exposure_times {
            if !exposure_set.iter().any(|&e| (e - science).abs() < 1e-3) {
                exposure_set.push(science);
            }
        }
        exposure_set.dedup_by(|a, b| (*a - *b).abs() < 1e-3);

        let mut taken = 0u32;
        for exposure in exposure_set {
            let prefix = storage::dark_prefix(exposure);
            for _ in 0..self.config.frame_count {
                let frame = camera
                    .expose(ExposureRequest {
                        seconds: exposure,
                        kind: ExposureKind::Dark,
                    })
                    .await?
                    .result(Duration::from_secs_f64(exposure + 60.0))
                    .await?;

                let sequence = storage::next_sequence(directory, &prefix)?;
                let name = storage::numbered_filename(&prefix, sequence);
                fits::write_frame(&directory.join(&name), &frame, None, "Dark")?;
                taken += 1;
            }
        }
        Ok(taken)
    }
}
