//! Observation run orchestration
//!
//! The night's state machine: startup, per-ticket slew/focus/expose,
//! weather holds with reopen, worker crash recovery, and a final
//! shutdown reachable from every exit path. The one invariant the whole
//! module serves: the observatory is never left open or unparked when
//! the run stops, however it stops.

use crate::astro;
use crate::calibration::CalibrationSequencer;
use crate::conditions::SkyStatus;
use crate::config::{CalibrationTime, FilterWheelMap, ObservatoryConfig};
use crate::drivers::{DriverFactory, ExposureKind, ExposureRequest, Frame};
use crate::error::{FailureKind, RunError};
use crate::fits;
use crate::focus::{self, DriftCompensator};
use crate::guiding::Guider;
use crate::monitor::TaskMonitor;
use crate::storage;
use crate::ticket::{RunQueue, ScheduledTicket};
use crate::workers::{await_live, Camera, Dome, Focuser, Lamp, OpResult, Rig, Telescope};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-ticket result: exposures completed vs. requested.
#[derive(Debug, Clone)]
pub struct TicketSummary {
    pub name: String,
    pub completed: u32,
    pub requested: u32,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub tickets: Vec<TicketSummary>,
}

impl RunSummary {
    pub fn total_exposures(&self) -> u32 {
        self.tickets.iter().map(|t| t.completed).sum()
    }
}

/// How one pass through the exposure loop ended.
enum ExposureExit {
    Complete,
    Alert,
    WindowClosed,
}

enum SlewOutcome {
    Done,
    Skip,
    WindowClosed,
    Alert,
}

enum HoldOutcome {
    Resumed,
    NightOver,
}

/// Bounded retries of one frame before the run gives up on the camera.
const MAX_FRAME_ATTEMPTS: u32 = 5;

pub struct Orchestrator {
    config: Arc<ObservatoryConfig>,
    wheel: Arc<FilterWheelMap>,
    factory: Arc<dyn DriverFactory>,
    rig: Arc<Rig>,
    monitor: TaskMonitor,
    monitor_task: Option<JoinHandle<()>>,
    sky: watch::Receiver<SkyStatus>,
    frames: watch::Sender<Option<Arc<Frame>>>,
    guider: Option<Guider>,
    drift: Option<DriftCompensator>,
    calibration: CalibrationSequencer,
    queue: RunQueue,
    /// Cleared when the focuser never comes online; focusing degrades
    /// instead of aborting the run.
    focus_available: bool,
    started_up: bool,
    /// Tickets that reached the exposure stage, for end-of-night
    /// calibration.
    observed: Vec<Arc<ScheduledTicket>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ObservatoryConfig>,
        wheel: Arc<FilterWheelMap>,
        queue: RunQueue,
        factory: Arc<dyn DriverFactory>,
        sky: watch::Receiver<SkyStatus>,
    ) -> Self {
        let rig = Arc::new(Rig::from_factory(factory.as_ref()));
        let (frames, _) = watch::channel(None);
        let calibration = CalibrationSequencer::new(config.calibration.clone(), config.saturation);
        Self {
            config,
            wheel,
            factory,
            rig,
            monitor: TaskMonitor::new(),
            monitor_task: None,
            sky,
            frames,
            guider: None,
            drift: None,
            calibration,
            queue,
            focus_available: false,
            started_up: false,
            observed: Vec::new(),
        }
    }

    /// Run the whole night. Whatever happens inside, the final shutdown
    /// runs before this returns.
    pub async fn execute(mut self) -> Result<RunSummary, RunError> {
        self.register_workers().await;
        self.monitor_task = Some(
            self.monitor
                .spawn_watch(self.rig.clone(), self.config.clone()),
        );

        let result = self.observe_night().await;

        self.final_shutdown().await;
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
        self.rig.shutdown_all().await;
        result
    }

    async fn register_workers(&self) {
        self.monitor.track("camera", self.rig.camera().await.flags());
        self.monitor
            .track("telescope", self.rig.telescope().await.flags());
        self.monitor.track("dome", self.rig.dome().await.flags());
        self.monitor
            .track("focuser", self.rig.focuser().await.flags());
        self.monitor.track("lamp", self.rig.lamp().await.flags());
    }

    async fn observe_night(&mut self) -> Result<RunSummary, RunError> {
        self.startup().await?;

        let mut summary = RunSummary::default();
        for index in 0..self.queue.len() {
            let Some(scheduled) = self.queue.get(index) else {
                break;
            };
            let requested = scheduled.ticket.schedule().len() as u32;
            if scheduled.ticket.window_closed(Utc::now()) {
                tracing::warn!(
                    "skipping {}: observation window already closed",
                    scheduled.ticket.name
                );
                summary.tickets.push(TicketSummary {
                    name: scheduled.ticket.name.clone(),
                    completed: 0,
                    requested,
                });
                continue;
            }

            self.await_ticket_start(index, &scheduled).await?;
            self.restart_crashed().await;

            let (completed, requested) = self.run_ticket(&scheduled).await?;
            tracing::info!(
                "{}: {completed}/{requested} exposures completed",
                scheduled.ticket.name
            );
            summary.tickets.push(TicketSummary {
                name: scheduled.ticket.name.clone(),
                completed,
                requested,
            });
        }
        Ok(summary)
    }

    /// Sleep until the ticket's start time. A long gap (and not the very
    /// first ticket) shuts the observatory fully rather than idling open.
    async fn await_ticket_start(
        &mut self,
        index: usize,
        scheduled: &Arc<ScheduledTicket>,
    ) -> Result<(), RunError> {
        let start: DateTime<Utc> = scheduled.ticket.start_time.with_timezone(&Utc);
        let wait = start - Utc::now();
        if index > 0
            && self.started_up
            && wait > chrono::Duration::minutes(self.config.long_wait_shutdown_minutes)
        {
            tracing::info!(
                "{} min until {}, shutting down for the gap",
                wait.num_minutes(),
                scheduled.ticket.name
            );
            self.safe_shutdown(false).await;
        }

        loop {
            let now = Utc::now();
            if now >= start {
                break;
            }
            if self.started_up && self.sky.borrow().is_alert() {
                if let HoldOutcome::NightOver = self.weather_hold(scheduled).await? {
                    return Ok(());
                }
                continue;
            }
            let remaining = (start - now).to_std().unwrap_or_default();
            tokio::time::sleep(remaining.min(Duration::from_secs(10))).await;
        }

        if self.sky.borrow().is_alert() {
            // Stay shut until the sky clears; the hold re-runs startup
            let _ = self.weather_hold(scheduled).await?;
        } else if !self.started_up {
            self.startup().await?;
        }
        Ok(())
    }

    /// One ticket, start to finish: slew, optional focus, background
    /// procedures, the exposure loop, and alert recovery in between.
    async fn run_ticket(
        &mut self,
        scheduled: &Arc<ScheduledTicket>,
    ) -> Result<(u32, u32), RunError> {
        let ticket = scheduled.ticket.clone();
        let mut plan: Vec<(String, u8, f64)> = Vec::new();
        for (filter, exposure) in ticket.schedule() {
            match self.wheel.slot_for(&filter) {
                Some(slot) => plan.push((filter, slot, exposure)),
                None => {
                    tracing::error!(
                        "{}: filter {filter:?} has no wheel slot, skipping ticket",
                        ticket.name
                    );
                    return Ok((0, ticket.schedule().len() as u32));
                }
            }
        }
        let requested = plan.len() as u32;

        std::fs::create_dir_all(&scheduled.directory)?;
        self.observed.push(scheduled.clone());
        tracing::info!(
            "starting {}: {} frames at RA {:.3}h Dec {:+.2}°",
            ticket.name,
            requested,
            ticket.ra_hours,
            ticket.dec_degrees
        );

        let mut completed = 0u32;
        loop {
            if ticket.window_closed(Utc::now()) {
                break;
            }
            if !self.started_up {
                self.startup().await?;
            }
            self.restart_crashed().await;

            if self.config.calibration.time == CalibrationTime::Start && !scheduled.is_calibrated()
            {
                self.run_calibration(scheduled).await;
            }

            match self.slew_to_target(scheduled).await? {
                SlewOutcome::Done => {}
                SlewOutcome::Skip => break,
                SlewOutcome::WindowClosed => break,
                SlewOutcome::Alert => {
                    if let HoldOutcome::NightOver = self.weather_hold(scheduled).await? {
                        break;
                    }
                    continue;
                }
            }

            if completed == 0 && self.focus_available && self.config.focus.coarse_at_start {
                self.coarse_focus(&ticket).await;
            }

            if ticket.self_guide {
                self.start_guiding();
            }
            if self.focus_available {
                self.start_drift_compensation();
            }

            let exit = self.exposure_loop(scheduled, &plan, &mut completed).await?;
            self.stop_procedures().await;

            match exit {
                ExposureExit::Complete | ExposureExit::WindowClosed => break,
                ExposureExit::Alert => {
                    if let HoldOutcome::NightOver = self.weather_hold(scheduled).await? {
                        break;
                    }
                }
            }
        }
        Ok((completed, requested))
    }

    /// The per-frame loop. Filenames resume from whatever is already on
    /// disk, so a crashed or interrupted run continues its numbering.
    async fn exposure_loop(
        &mut self,
        scheduled: &ScheduledTicket,
        plan: &[(String, u8, f64)],
        completed: &mut u32,
    ) -> Result<ExposureExit, RunError> {
        let ticket = &scheduled.ticket;
        let mut frame_attempts = 0u32;
        let mut current_filter: Option<String> = None;

        while (*completed as usize) < plan.len() {
            // Safety first, before every frame
            if self.sky.borrow().is_alert() {
                tracing::info!(
                    "sky alert during {} after {} frames, breaking out",
                    ticket.name,
                    completed
                );
                return Ok(ExposureExit::Alert);
            }
            if ticket.window_closed(Utc::now()) {
                return Ok(ExposureExit::WindowClosed);
            }
            self.restart_crashed().await;

            let (filter, slot, exposure) = &plan[*completed as usize];
            let camera = self.rig.camera().await;

            if current_filter.as_deref() != Some(filter.as_str()) {
                let changed = match camera.set_filter(*slot).await {
                    Ok(pending) => pending.wait(Duration::from_secs(60)).await,
                    Err(e) => OpResult::Failed(e),
                };
                match changed {
                    OpResult::Done(()) => current_filter = Some(filter.clone()),
                    OpResult::Failed(e) => {
                        frame_attempts += 1;
                        tracing::warn!("filter change failed: {e}");
                        if frame_attempts > MAX_FRAME_ATTEMPTS {
                            return Err(e.into());
                        }
                        continue;
                    }
                    OpResult::TimedOut => {
                        frame_attempts += 1;
                        tracing::warn!("filter change timed out");
                        camera.mark_crashed();
                        if frame_attempts > MAX_FRAME_ATTEMPTS {
                            return Err(crate::error::DeviceError::Timeout {
                                device: "camera".into(),
                                operation: "set_filter".into(),
                                timeout: Duration::from_secs(60),
                            }
                            .into());
                        }
                        continue;
                    }
                }
            }

            let prefix = storage::science_prefix(&ticket.name, *exposure, filter);
            let sequence = storage::next_sequence(&scheduled.directory, &prefix)?;
            let timeout =
                Duration::from_secs_f64(exposure + self.config.exposure_wait_margin_secs);

            let outcome = match camera
                .expose(ExposureRequest {
                    seconds: *exposure,
                    kind: ExposureKind::Light,
                })
                .await
            {
                Ok(pending) => pending.wait(timeout).await,
                Err(e) => OpResult::Failed(e),
            };

            match outcome {
                OpResult::Done(mut frame) => {
                    frame.filter = Some(filter.to_uppercase());
                    let name = storage::numbered_filename(&prefix, sequence);
                    fits::write_frame(
                        &scheduled.directory.join(&name),
                        &frame,
                        Some(&ticket.name),
                        "Light",
                    )?;
                    *completed += 1;
                    frame_attempts = 0;
                    tracing::info!("saved {name} ({}/{})", completed, plan.len());
                    // Image-ready signal for the guide loop
                    let _ = self.frames.send(Some(Arc::new(frame)));
                }
                OpResult::TimedOut => {
                    // The frame was never written, so the retry reuses
                    // the same sequence number with no duplicate
                    frame_attempts += 1;
                    tracing::warn!(
                        "exposure timed out after {timeout:?}, treating camera as unresponsive"
                    );
                    camera.mark_crashed();
                    if frame_attempts > MAX_FRAME_ATTEMPTS {
                        return Err(crate::error::DeviceError::Timeout {
                            device: "camera".into(),
                            operation: "expose".into(),
                            timeout,
                        }
                        .into());
                    }
                }
                OpResult::Failed(e) => {
                    frame_attempts += 1;
                    match e.kind() {
                        FailureKind::Transient => {
                            tracing::warn!("exposure failed ({e}), retrying")
                        }
                        _ => tracing::warn!("exposure failed ({e}), worker will be replaced"),
                    }
                    if frame_attempts > MAX_FRAME_ATTEMPTS {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(ExposureExit::Complete)
    }

    /// Validated slew with park-and-retry. Declinations the mount can
    /// never reach skip the ticket; a target that is merely low waits
    /// for it to rise.
    async fn slew_to_target(
        &mut self,
        scheduled: &ScheduledTicket,
    ) -> Result<SlewOutcome, RunError> {
        let ticket = &scheduled.ticket;
        if ticket.dec_degrees < self.config.slew.min_dec_deg
            || ticket.dec_degrees > self.config.slew.max_dec_deg
        {
            tracing::error!(
                "{}: declination {:+.1}° outside mount limits",
                ticket.name,
                ticket.dec_degrees
            );
            return Ok(SlewOutcome::Skip);
        }

        let mut attempts = 0u32;
        loop {
            if ticket.window_closed(Utc::now()) {
                return Ok(SlewOutcome::WindowClosed);
            }
            if self.sky.borrow().is_alert() {
                return Ok(SlewOutcome::Alert);
            }

            if !self.pointing_allowed(ticket) {
                tracing::warn!(
                    "{} outside pointing limits right now, waiting for it to rise",
                    ticket.name
                );
                if let Some(exit) = self.wait_checked(self.config.slew.retry_minutes).await {
                    return Ok(exit);
                }
                continue;
            }

            let telescope = self.rig.telescope().await;
            let outcome = match telescope.slew(ticket.ra_hours, ticket.dec_degrees).await {
                Ok(pending) => pending.wait(Duration::from_secs(180)).await,
                Err(e) => OpResult::Failed(e),
            };
            match outcome {
                OpResult::Done(()) => {
                    tracing::info!("on target {}", ticket.name);
                    return Ok(SlewOutcome::Done);
                }
                OpResult::Failed(e) => {
                    attempts += 1;
                    tracing::warn!("slew failed ({e}), attempt {attempts}");
                    if e.kind() == FailureKind::Fault {
                        self.restart_crashed().await;
                    }
                }
                OpResult::TimedOut => {
                    attempts += 1;
                    tracing::warn!("slew timed out, attempt {attempts}");
                    telescope.mark_crashed();
                    self.restart_crashed().await;
                }
            }

            if attempts >= self.config.slew.max_attempts {
                // Park, wait out the retry period re-checking safety,
                // then try again rather than failing the ticket outright
                tracing::warn!("repeated slew failures, parking before the next round");
                self.park_telescope().await;
                attempts = 0;
                if let Some(exit) = self.wait_checked(self.config.slew.retry_minutes).await {
                    return Ok(exit);
                }
                let telescope = self.rig.telescope().await;
                if let Ok(pending) = telescope.unpark().await {
                    let _ = pending.wait(Duration::from_secs(120)).await;
                }
            }
        }
    }

    /// Sleep up to `minutes`, waking early on alert or window close.
    async fn wait_checked(&self, minutes: u64) -> Option<SlewOutcome> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(minutes * 60);
        loop {
            if self.sky.borrow().is_alert() {
                return Some(SlewOutcome::Alert);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    fn pointing_allowed(&self, ticket: &crate::ticket::ObservationTicket) -> bool {
        let jd = astro::julian_day(&Utc::now());
        let lst = astro::local_sidereal_time(jd, self.config.site.longitude);
        let altitude = astro::altitude_deg(
            ticket.ra_hours,
            ticket.dec_degrees,
            self.config.site.latitude,
            lst,
        );
        let hour_angle = astro::hour_angle_hours(ticket.ra_hours, lst);
        altitude >= self.config.slew.min_altitude_deg
            && hour_angle.abs() <= self.config.slew.max_hour_angle_hours
    }

    async fn coarse_focus(&mut self, ticket: &crate::ticket::ObservationTicket) {
        let exposure =
            (ticket.exposure_times[0] * self.config.focus.exposure_multiplier).clamp(1.0, 30.0);
        match focus::coarse_focus(
            &self.rig,
            &self.config.focus,
            exposure,
            self.config.saturation,
        )
        .await
        {
            Ok(outcome) if outcome.reverted => {
                tracing::warn!("focus sweep fit rejected, staying at the starting position")
            }
            Ok(outcome) => tracing::info!("focus set to {}", outcome.final_position),
            Err(e) => tracing::error!("coarse focus failed, continuing unfocused: {e}"),
        }
    }

    fn start_guiding(&mut self) {
        if self.guider.is_none() {
            self.guider = Some(Guider::start(
                self.rig.clone(),
                self.frames.subscribe(),
                self.config.guiding.clone(),
                self.config.plate_scale,
                self.config.saturation,
            ));
        }
    }

    fn start_drift_compensation(&mut self) {
        if self.drift.is_none() {
            self.drift = Some(DriftCompensator::start(
                self.rig.clone(),
                self.config.focus.clone(),
            ));
        }
    }

    /// Stop background procedures cooperatively, from this task.
    async fn stop_procedures(&mut self) {
        if let Some(guider) = self.guider.take() {
            guider.stop().await;
        }
        if let Some(drift) = self.drift.take() {
            drift.stop().await;
        }
    }

    async fn run_calibration(&mut self, scheduled: &ScheduledTicket) {
        let rig = self.rig.clone();
        let wheel = self.wheel.clone();
        if let Err(e) = self
            .calibration
            .calibrate(rig.as_ref(), wheel.as_ref(), scheduled)
            .await
        {
            tracing::error!("calibration failed for {}: {e}", scheduled.ticket.name);
        }
    }

    /// Verify connections, open up, and start cooling. A focuser that
    /// never connects only disables focusing; any other missing device
    /// is fatal for this attempt.
    async fn startup(&mut self) -> Result<(), RunError> {
        if self.started_up {
            return Ok(());
        }
        tracing::info!("startup: verifying hardware connections");
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);

        let camera = self.rig.camera().await;
        let telescope = self.rig.telescope().await;
        let dome = self.rig.dome().await;
        let lamp = self.rig.lamp().await;
        let focuser = self.rig.focuser().await;
        let flags = [
            camera.flags(),
            telescope.flags(),
            dome.flags(),
            lamp.flags(),
            focuser.flags(),
        ];
        let live = futures::future::join_all(flags.iter().map(|f| await_live(f, timeout))).await;

        for (ok, name) in live
            .iter()
            .copied()
            .zip(["camera", "telescope", "dome", "lamp"])
        {
            if !ok {
                return Err(RunError::Startup(format!("{name} never came online")));
            }
        }
        self.focus_available = live[4];
        if !self.focus_available {
            tracing::warn!("focuser unavailable; focusing disabled for this run");
        }

        let opened = match dome.open_shutter().await {
            Ok(pending) => pending.wait(Duration::from_secs(300)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(opened, OpResult::Done(())) {
            return Err(RunError::Startup("dome shutter did not open".into()));
        }
        if let Ok(pending) = dome.home().await {
            if !matches!(pending.wait(Duration::from_secs(120)).await, OpResult::Done(())) {
                tracing::warn!("dome did not confirm home position");
            }
        }

        let unparked = match telescope.unpark().await {
            Ok(pending) => pending.wait(Duration::from_secs(120)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(unparked, OpResult::Done(())) {
            return Err(RunError::Startup("telescope did not unpark".into()));
        }

        self.start_cooling(&camera).await;

        self.started_up = true;
        tracing::info!("startup complete");
        Ok(())
    }

    async fn start_cooling(&self, camera: &Camera) {
        let setpoint = self.config.cooler.setpoint_c;
        let started = match camera.set_cooler(true, setpoint).await {
            Ok(pending) => pending.wait(Duration::from_secs(30)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(started, OpResult::Done(())) {
            tracing::warn!("cooler did not accept setpoint {setpoint}°C, continuing warm");
            return;
        }

        // Bounded settle wait; an unsettled cooler degrades data but
        // never blocks the night
        let checks = (self.config.cooler.settle_minutes * 6).max(1);
        for attempt in 0..checks {
            let reading = match camera.sensor_temperature().await {
                Ok(pending) => pending.wait(Duration::from_secs(10)).await,
                Err(e) => OpResult::Failed(e),
            };
            if let OpResult::Done(temperature) = reading {
                if (temperature - setpoint).abs() <= self.config.cooler.settle_tolerance_c {
                    tracing::info!("cooler settled at {temperature:.1}°C");
                    return;
                }
            }
            if attempt + 1 < checks {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
        tracing::warn!("cooler never settled at {setpoint}°C, continuing anyway");
    }

    /// Close the shutter, park the mount, relax the cooler. Used for
    /// weather holds and long inter-ticket gaps.
    async fn safe_shutdown(&mut self, daytime: bool) {
        tracing::info!("safe shutdown (daytime: {daytime})");
        self.stop_procedures().await;

        let dome = self.rig.dome().await;
        let closed = match dome.close_shutter().await {
            Ok(pending) => pending.wait(Duration::from_secs(300)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(closed, OpResult::Done(())) {
            tracing::error!("dome shutter did not confirm closed; site needs attention");
        }

        self.park_telescope().await;

        let camera = self.rig.camera().await;
        // Warm up fully in daylight; hold an idle setpoint at night so
        // reopening is quick
        let (on, setpoint) = if daytime {
            (false, 0.0)
        } else {
            (true, self.config.cooler.idle_setpoint_c)
        };
        if let Ok(pending) = camera.set_cooler(on, setpoint).await {
            if !matches!(pending.wait(Duration::from_secs(30)).await, OpResult::Done(())) {
                tracing::warn!("cooler did not acknowledge shutdown setpoint");
            }
        }

        self.started_up = false;
    }

    async fn park_telescope(&self) {
        let telescope = self.rig.telescope().await;
        let parked = match telescope.park().await {
            Ok(pending) => pending.wait(Duration::from_secs(180)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(parked, OpResult::Done(())) {
            tracing::error!("telescope did not confirm park; site needs attention");
        }
    }

    /// Ride out a sky alert: secure the observatory, wait for the
    /// minimum cooldown plus a clear sky, then start back up. Daytime
    /// alerts sleep until shortly before the next sunset.
    async fn weather_hold(
        &mut self,
        scheduled: &ScheduledTicket,
    ) -> Result<HoldOutcome, RunError> {
        let status = self.sky.borrow().clone();
        let reasons: Vec<String> = status.reasons.iter().map(|r| r.to_string()).collect();
        tracing::warn!("weather hold: {}", reasons.join(", "));

        self.stop_procedures().await;
        self.safe_shutdown(status.sun_up).await;

        if status.sun_up
            && self.config.calibration.time == CalibrationTime::End
            && !scheduled.is_calibrated()
        {
            self.run_calibration(scheduled).await;
        }

        let cooldown =
            Duration::from_secs(self.config.weather.reopen_cooldown_minutes * 60);
        if !cooldown.is_zero() {
            tracing::info!("cooldown: {} min before reopening", cooldown.as_secs() / 60);
            tokio::time::sleep(cooldown).await;
        }

        loop {
            if self.night_over() {
                tracing::info!("no observing time left behind this alert");
                return Ok(HoldOutcome::NightOver);
            }
            let status = self.sky.borrow().clone();
            if !status.is_alert() {
                break;
            }
            if status.sun_up {
                let sunset = astro::next_sunset(
                    Utc::now(),
                    self.config.site.latitude,
                    self.config.site.longitude,
                );
                if let Some(end) = self.queue.last_end_time() {
                    if end.with_timezone(&Utc) <= sunset {
                        return Ok(HoldOutcome::NightOver);
                    }
                }
                let wake = sunset - chrono::Duration::minutes(10);
                tracing::info!("daylight hold, sleeping until {wake}");
                let wait = (wake - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
            } else {
                let mut sky = self.sky.clone();
                let _ = tokio::time::timeout(Duration::from_secs(60), sky.changed()).await;
            }
        }

        tracing::info!("sky clear, reopening");
        self.startup().await?;
        Ok(HoldOutcome::Resumed)
    }

    fn night_over(&self) -> bool {
        match self.queue.last_end_time() {
            Some(end) => end.with_timezone(&Utc) <= Utc::now(),
            None => true,
        }
    }

    /// Replace every worker the monitor has flagged, rebind it in the
    /// rig (dependents fetch handles through the rig, so they pick the
    /// replacement up automatically), and clear the record.
    async fn restart_crashed(&mut self) {
        // Fold in anything the background loop has not seen yet
        self.monitor.sweep();
        for name in self.monitor.crashed_workers() {
            tracing::warn!("reconstructing {name} worker");
            let timeout = Duration::from_secs(self.config.startup_timeout_secs);
            match name.as_str() {
                "camera" => {
                    self.rig.camera().await.stop().await;
                    let fresh = Camera::spawn(self.factory.camera());
                    if !await_live(&fresh.flags(), timeout).await {
                        tracing::error!("replacement camera did not come online");
                    }
                    self.monitor.track("camera", fresh.flags());
                    self.rig.replace_camera(fresh).await;
                }
                "telescope" => {
                    self.rig.telescope().await.stop().await;
                    let fresh = Telescope::spawn(self.factory.telescope());
                    if !await_live(&fresh.flags(), timeout).await {
                        tracing::error!("replacement telescope did not come online");
                    }
                    self.monitor.track("telescope", fresh.flags());
                    self.rig.replace_telescope(fresh).await;
                }
                "dome" => {
                    self.rig.dome().await.stop().await;
                    let fresh = Dome::spawn(self.factory.dome());
                    if !await_live(&fresh.flags(), timeout).await {
                        tracing::error!("replacement dome did not come online");
                    }
                    self.monitor.track("dome", fresh.flags());
                    self.rig.replace_dome(fresh).await;
                }
                "focuser" => {
                    self.rig.focuser().await.stop().await;
                    let fresh = Focuser::spawn(self.factory.focuser());
                    self.focus_available = await_live(&fresh.flags(), timeout).await;
                    self.monitor.track("focuser", fresh.flags());
                    self.rig.replace_focuser(fresh).await;
                }
                "lamp" => {
                    self.rig.lamp().await.stop().await;
                    let fresh = Lamp::spawn(self.factory.lamp());
                    if !await_live(&fresh.flags(), timeout).await {
                        tracing::error!("replacement lamp did not come online");
                    }
                    self.monitor.track("lamp", fresh.flags());
                    self.rig.replace_lamp(fresh).await;
                }
                other => tracing::error!("unknown worker '{other}' in crash list"),
            }
            self.monitor.clear(&name);
        }
    }

    /// The terminal safety sequence: always park, close and power down,
    /// whatever state the run ended in. Calibration waits until the site
    /// is secured; flats and darks need no sky.
    async fn final_shutdown(&mut self) {
        tracing::info!("final shutdown");
        self.stop_procedures().await;

        self.park_telescope().await;

        let dome = self.rig.dome().await;
        let closed = match dome.close_shutter().await {
            Ok(pending) => pending.wait(Duration::from_secs(300)).await,
            Err(e) => OpResult::Failed(e),
        };
        if !matches!(closed, OpResult::Done(())) {
            tracing::error!("dome shutter did not confirm closed; site needs attention");
        } else if let Ok(pending) = dome.shutter_state().await {
            // Cross-check the reported position against the completed command
            match pending.wait(Duration::from_secs(10)).await {
                OpResult::Done(crate::drivers::ShutterState::Closed) => {}
                OpResult::Done(state) => {
                    tracing::error!("shutter reports {state:?} after close; site needs attention")
                }
                _ => tracing::warn!("could not read back shutter position"),
            }
        }

        let camera = self.rig.camera().await;
        if let Ok(pending) = camera.set_cooler(false, 0.0).await {
            let _ = pending.wait(Duration::from_secs(30)).await;
        }

        if self.config.calibration.time == CalibrationTime::End {
            for scheduled in self.observed.clone() {
                if !scheduled.is_calibrated() {
                    self.run_calibration(&scheduled).await;
                }
            }
        }

        self.started_up = false;
        tracing::info!("observatory secured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObservatoryConfig;
    use crate::conditions::{AlertReason, SkyCondition};
    use crate::drivers::ShutterState;
    use crate::sim::SimObservatory;
    use crate::ticket::ObservationTicket;
    use chrono::FixedOffset;
    use std::collections::HashMap;
    use std::path::Path;

    fn test_config(data_dir: &Path) -> ObservatoryConfig {
        let mut config = ObservatoryConfig::default();
        config.data_directory = data_dir.to_path_buf();
        config.site.latitude = 0.0;
        config.site.longitude = 0.0;
        config.focus.coarse_at_start = false;
        config.weather.reopen_cooldown_minutes = 0;
        config.cooler.settle_minutes = 0;
        config.startup_timeout_secs = 2;
        config.exposure_wait_margin_secs = 5.0;
        config.slew.retry_minutes = 0;
        // A target straight overhead is always inside the limits
        config.slew.min_altitude_deg = -90.0;
        config.slew.max_hour_angle_hours = 12.0;
        config
    }

    fn wheel() -> Arc<FilterWheelMap> {
        let mut slots = HashMap::new();
        slots.insert("r".to_string(), 2u8);
        slots.insert("g".to_string(), 3u8);
        Arc::new(FilterWheelMap::new(slots))
    }

    fn m41_ticket(minutes_ago: i64, minutes_left: i64) -> ObservationTicket {
        let offset = FixedOffset::east_opt(0).unwrap();
        let now = Utc::now().with_timezone(&offset);
        ObservationTicket {
            name: "M41".into(),
            ra_hours: 5.5,
            dec_degrees: -10.0,
            start_time: now - chrono::Duration::minutes(minutes_ago),
            end_time: now + chrono::Duration::minutes(minutes_left),
            filters: vec!["r".into()],
            exposure_times: vec![30.0],
            num: 4,
            self_guide: false,
            guide: false,
            cycle_filter: true,
        }
    }

    fn nominal_night() -> SkyStatus {
        SkyStatus {
            condition: SkyCondition::Nominal,
            sun_up: false,
            reasons: Vec::new(),
            changed_at: Utc::now(),
            sample: None,
        }
    }

    fn alert_night() -> SkyStatus {
        SkyStatus {
            condition: SkyCondition::Alert,
            sun_up: false,
            reasons: vec![AlertReason::Wind],
            changed_at: Utc::now(),
            sample: None,
        }
    }

    fn orchestrator(
        config: ObservatoryConfig,
        tickets: Vec<ObservationTicket>,
        sim: &SimObservatory,
        sky: watch::Receiver<SkyStatus>,
    ) -> Orchestrator {
        let data_dir = config.data_directory.clone();
        Orchestrator::new(
            Arc::new(config),
            wheel(),
            RunQueue::from_tickets(tickets, &data_dir),
            Arc::new(sim.clone()),
            sky,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_ticket_produces_numbered_frames() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let orch = orchestrator(config, vec![m41_ticket(1, 30)], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();

        assert_eq!(summary.tickets.len(), 1);
        assert_eq!(summary.tickets[0].completed, 4);
        assert_eq!(summary.tickets[0].requested, 4);

        let target_dir = data_dir.path().join("M41");
        for seq in 1..=4 {
            let name = format!("M41_30.000s_R-{seq:04}.fits");
            assert!(target_dir.join(&name).exists(), "missing {name}");
        }
        assert!(!target_dir.join("M41_30.000s_R-0005.fits").exists());

        // End-of-night calibration ran for the observed ticket
        assert!(target_dir.join("calibration").exists());

        // The safety invariant: parked and closed after every exit
        assert!(sim.state.parked.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*sim.state.shutter.lock().unwrap(), ShutterState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn alert_breaks_loop_then_resumes_numbering() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        let (sky_tx, sky_rx) = watch::channel(nominal_night());
        let sky_tx = Arc::new(sky_tx);

        // Raise the alert as the second frame completes
        let alert_fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let sky_tx = sky_tx.clone();
            let alert_fired = alert_fired.clone();
            sim.state.set_on_light_frame(Arc::new(move |count| {
                if count == 2 {
                    let _ = sky_tx.send(alert_night());
                    alert_fired.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            }));
        }
        // Clear it again shortly after it fires
        {
            let sky_tx = sky_tx.clone();
            let alert_fired = alert_fired.clone();
            tokio::spawn(async move {
                while !alert_fired.load(std::sync::atomic::Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = sky_tx.send(nominal_night());
            });
        }

        let orch = orchestrator(config, vec![m41_ticket(1, 30)], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();

        assert_eq!(summary.tickets[0].completed, 4);

        // Numbering continued at 3 after the hold; nothing was overwritten
        let target_dir = data_dir.path().join("M41");
        for seq in 1..=4 {
            assert!(target_dir
                .join(format!("M41_30.000s_R-{seq:04}.fits"))
                .exists());
        }
        assert!(!target_dir.join("M41_30.000s_R-0005.fits").exists());
        assert_eq!(*sim.state.shutter.lock().unwrap(), ShutterState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn camera_fault_mid_run_retries_without_duplicates() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        // The third light-exposure attempt dies; the replacement worker
        // retries the same frame
        sim.state.fail_light_attempt(3);
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let orch = orchestrator(config, vec![m41_ticket(1, 30)], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();

        assert_eq!(summary.tickets[0].completed, 4);
        let target_dir = data_dir.path().join("M41");
        let science: Vec<String> = std::fs::read_dir(&target_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(science.len(), 4, "unexpected files: {science:?}");
        // Exactly four light frames came off the camera
        assert_eq!(
            sim.state
                .light_frames
                .load(std::sync::atomic::Ordering::SeqCst),
            4
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_focuser_degrades_instead_of_aborting() {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = test_config(data_dir.path());
        config.focus.coarse_at_start = true;
        let sim = SimObservatory::instant();
        sim.state
            .fail_focuser_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let orch = orchestrator(config, vec![m41_ticket(1, 30)], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();
        assert_eq!(summary.tickets[0].completed, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dead_camera_is_fatal_but_still_secures_site() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        sim.state
            .fail_camera_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let orch = orchestrator(config, vec![m41_ticket(1, 30)], &sim, sky_rx);
        let result = orch.execute().await;
        assert!(matches!(result, Err(RunError::Startup(_))));

        // Even the failed run leaves the site secured
        assert!(sim.state.parked.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(*sim.state.shutter.lock().unwrap(), ShutterState::Closed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_ticket_is_skipped() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let offset = FixedOffset::east_opt(0).unwrap();
        let now = Utc::now().with_timezone(&offset);
        let mut expired = m41_ticket(1, 30);
        expired.name = "M42".into();
        expired.start_time = now - chrono::Duration::hours(3);
        expired.end_time = now - chrono::Duration::hours(1);

        let orch = orchestrator(config, vec![expired, m41_ticket(1, 30)], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();

        assert_eq!(summary.tickets.len(), 2);
        let m42 = summary.tickets.iter().find(|t| t.name == "M42").unwrap();
        assert_eq!(m42.completed, 0);
        let m41 = summary.tickets.iter().find(|t| t.name == "M41").unwrap();
        assert_eq!(m41.completed, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn guided_ticket_starts_and_stops_cleanly() {
        let data_dir = tempfile::tempdir().unwrap();
        let config = test_config(data_dir.path());
        let sim = SimObservatory::instant();
        let (_sky_tx, sky_rx) = watch::channel(nominal_night());

        let mut ticket = m41_ticket(1, 30);
        ticket.self_guide = true;
        let orch = orchestrator(config, vec![ticket], &sim, sky_rx);
        let summary = orch.execute().await.unwrap();
        assert_eq!(summary.tickets[0].completed, 4);
    }
}
