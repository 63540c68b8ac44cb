//! Simulated observatory hardware
//!
//! In-process stand-ins for every driver, sharing one hardware state so a
//! reconstructed worker talks to the same "physical" devices. Used by the
//! test suite and by `nightwatch run --simulate` dry runs.

use crate::conditions::{WeatherFetchError, WeatherSample, WeatherSource};
use crate::drivers::{
    CameraDriver, DomeDriver, DriverError, DriverFactory, DriverResult, ExposureKind,
    ExposureRequest, FocuserDriver, Frame, LampDriver, ShutterState, TelescopeDriver,
};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SIM_WIDTH: u32 = 64;
const SIM_HEIGHT: u32 = 64;

/// Shared state of the simulated hardware.
pub struct SimState {
    pub focuser_position: Mutex<i32>,
    pub focuser_temperature: Mutex<Option<f64>>,
    pub lamp_on: AtomicBool,
    pub parked: AtomicBool,
    pub shutter: Mutex<ShutterState>,
    pub coordinates: Mutex<(f64, f64)>,
    pub cooler: Mutex<(bool, f64)>,
    pub sensor_temperature: Mutex<f64>,
    /// Light frames completed so far.
    pub light_frames: AtomicU32,
    /// 1-based light-exposure attempts that fault once each.
    fail_light_attempts: Mutex<HashSet<u32>>,
    light_attempts: AtomicU32,
    pub fail_camera_connect: AtomicBool,
    pub fail_focuser_connect: AtomicBool,
    /// Called after each completed light frame with the running count.
    on_light_frame: Mutex<Option<Arc<dyn Fn(u32) + Send + Sync>>>,
    /// Median ADU per second of flat exposure with the lamp on.
    pub flat_rate_adu_per_s: f64,
    pub sky_level: u16,
    /// Multiplier on simulated operation durations; 0 runs instantly.
    pub time_scale: f64,
}

impl SimState {
    fn new(time_scale: f64) -> Self {
        Self {
            focuser_position: Mutex::new(25_000),
            focuser_temperature: Mutex::new(Some(10.0)),
            lamp_on: AtomicBool::new(false),
            parked: AtomicBool::new(true),
            shutter: Mutex::new(ShutterState::Closed),
            coordinates: Mutex::new((0.0, 89.0)),
            cooler: Mutex::new((false, 0.0)),
            sensor_temperature: Mutex::new(15.0),
            light_frames: AtomicU32::new(0),
            fail_light_attempts: Mutex::new(HashSet::new()),
            light_attempts: AtomicU32::new(0),
            fail_camera_connect: AtomicBool::new(false),
            fail_focuser_connect: AtomicBool::new(false),
            on_light_frame: Mutex::new(None),
            flat_rate_adu_per_s: 15_000.0,
            sky_level: 1200,
            time_scale,
        }
    }

    async fn pause(&self, secs: f64) {
        if self.time_scale > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(secs * self.time_scale)).await;
        }
    }

    /// Arrange for the given 1-based light-exposure attempt to fault.
    pub fn fail_light_attempt(&self, attempt: u32) {
        self.fail_light_attempts.lock().unwrap().insert(attempt);
    }

    pub fn set_on_light_frame(&self, hook: Arc<dyn Fn(u32) + Send + Sync>) {
        *self.on_light_frame.lock().unwrap() = Some(hook);
    }
}

/// Simulated driver factory. Clones hand out drivers over the same state.
#[derive(Clone)]
pub struct SimObservatory {
    pub state: Arc<SimState>,
}

impl SimObservatory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState::new(0.01)),
        }
    }

    /// Instant-completing variant for tests.
    pub fn instant() -> Self {
        Self {
            state: Arc::new(SimState::new(0.0)),
        }
    }
}

impl Default for SimObservatory {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverFactory for SimObservatory {
    fn camera(&self) -> Box<dyn CameraDriver> {
        Box::new(SimCamera {
            state: self.state.clone(),
        })
    }

    fn telescope(&self) -> Box<dyn TelescopeDriver> {
        Box::new(SimTelescope {
            state: self.state.clone(),
        })
    }

    fn dome(&self) -> Box<dyn DomeDriver> {
        Box::new(SimDome {
            state: self.state.clone(),
        })
    }

    fn focuser(&self) -> Box<dyn FocuserDriver> {
        Box::new(SimFocuser {
            state: self.state.clone(),
        })
    }

    fn lamp(&self) -> Box<dyn LampDriver> {
        Box::new(SimLamp {
            state: self.state.clone(),
        })
    }
}

struct SimCamera {
    state: Arc<SimState>,
}

impl SimCamera {
    fn frame_level(&self, request: &ExposureRequest) -> u16 {
        match request.kind {
            ExposureKind::Flat => {
                if self.state.lamp_on.load(Ordering::SeqCst) {
                    (self.state.flat_rate_adu_per_s * request.seconds).min(65_535.0) as u16
                } else {
                    300
                }
            }
            ExposureKind::Dark => 300,
            ExposureKind::Light => self.state.sky_level,
        }
    }
}

#[async_trait]
impl CameraDriver for SimCamera {
    async fn connect(&self) -> DriverResult<()> {
        if self.state.fail_camera_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("simulated handshake failure".into()));
        }
        self.state.pause(0.2).await;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn expose(&self, request: &ExposureRequest) -> DriverResult<Frame> {
        if request.kind == ExposureKind::Light {
            let attempt = self.state.light_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.state.fail_light_attempts.lock().unwrap().remove(&attempt) {
                return Err(DriverError::Fault("simulated driver hang".into()));
            }
        }

        self.state.pause(request.seconds).await;

        let level = self.frame_level(request);
        let mut rng = rand::thread_rng();
        let data: Vec<u16> = (0..(SIM_WIDTH * SIM_HEIGHT))
            .map(|_| {
                let jitter: i32 = rng.gen_range(-4..=4);
                (level as i32 + jitter).clamp(0, 65_535) as u16
            })
            .collect();

        let frame = Frame {
            width: SIM_WIDTH,
            height: SIM_HEIGHT,
            data,
            exposure_secs: request.seconds,
            filter: None,
            captured_at: Utc::now(),
        };

        if request.kind == ExposureKind::Light {
            let count = self.state.light_frames.fetch_add(1, Ordering::SeqCst) + 1;
            let hook = self.state.on_light_frame.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(count);
            }
        }

        Ok(frame)
    }

    async fn set_filter_slot(&self, _slot: u8) -> DriverResult<()> {
        self.state.pause(1.0).await;
        Ok(())
    }

    async fn set_cooler(&self, on: bool, setpoint_c: f64) -> DriverResult<()> {
        *self.state.cooler.lock().unwrap() = (on, setpoint_c);
        // The simulated sensor settles immediately
        if on {
            *self.state.sensor_temperature.lock().unwrap() = setpoint_c;
        }
        Ok(())
    }

    async fn sensor_temperature(&self) -> DriverResult<f64> {
        Ok(*self.state.sensor_temperature.lock().unwrap())
    }
}

struct SimTelescope {
    state: Arc<SimState>,
}

#[async_trait]
impl TelescopeDriver for SimTelescope {
    async fn connect(&self) -> DriverResult<()> {
        self.state.pause(0.2).await;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn slew(&self, ra_hours: f64, dec_degrees: f64) -> DriverResult<()> {
        if self.state.parked.load(Ordering::SeqCst) {
            return Err(DriverError::Command("slew refused: mount parked".into()));
        }
        self.state.pause(3.0).await;
        *self.state.coordinates.lock().unwrap() = (ra_hours, dec_degrees);
        Ok(())
    }

    async fn jog(&self, ra_arcsec: f64, dec_arcsec: f64) -> DriverResult<()> {
        self.state.pause(0.5).await;
        let mut coords = self.state.coordinates.lock().unwrap();
        coords.0 += ra_arcsec / 3600.0 / 15.0;
        coords.1 += dec_arcsec / 3600.0;
        Ok(())
    }

    async fn park(&self) -> DriverResult<()> {
        self.state.pause(3.0).await;
        self.state.parked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unpark(&self) -> DriverResult<()> {
        self.state.pause(1.0).await;
        self.state.parked.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn coordinates(&self) -> DriverResult<(f64, f64)> {
        Ok(*self.state.coordinates.lock().unwrap())
    }
}

struct SimDome {
    state: Arc<SimState>,
}

#[async_trait]
impl DomeDriver for SimDome {
    async fn connect(&self) -> DriverResult<()> {
        self.state.pause(0.2).await;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn open_shutter(&self) -> DriverResult<()> {
        *self.state.shutter.lock().unwrap() = ShutterState::Opening;
        self.state.pause(5.0).await;
        *self.state.shutter.lock().unwrap() = ShutterState::Open;
        Ok(())
    }

    async fn close_shutter(&self) -> DriverResult<()> {
        *self.state.shutter.lock().unwrap() = ShutterState::Closing;
        self.state.pause(5.0).await;
        *self.state.shutter.lock().unwrap() = ShutterState::Closed;
        Ok(())
    }

    async fn shutter_state(&self) -> DriverResult<ShutterState> {
        Ok(*self.state.shutter.lock().unwrap())
    }

    async fn home(&self) -> DriverResult<()> {
        self.state.pause(2.0).await;
        Ok(())
    }
}

struct SimFocuser {
    state: Arc<SimState>,
}

#[async_trait]
impl FocuserDriver for SimFocuser {
    async fn connect(&self) -> DriverResult<()> {
        if self.state.fail_focuser_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Connection("simulated handshake failure".into()));
        }
        self.state.pause(0.2).await;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn move_to(&self, position: i32) -> DriverResult<()> {
        self.state.pause(1.0).await;
        *self.state.focuser_position.lock().unwrap() = position;
        Ok(())
    }

    async fn position(&self) -> DriverResult<i32> {
        Ok(*self.state.focuser_position.lock().unwrap())
    }

    async fn temperature(&self) -> DriverResult<Option<f64>> {
        Ok(*self.state.focuser_temperature.lock().unwrap())
    }
}

struct SimLamp {
    state: Arc<SimState>,
}

#[async_trait]
impl LampDriver for SimLamp {
    async fn connect(&self) -> DriverResult<()> {
        self.state.pause(0.1).await;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn turn_on(&self) -> DriverResult<()> {
        self.state.pause(0.5).await;
        self.state.lamp_on.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn turn_off(&self) -> DriverResult<()> {
        self.state.pause(0.5).await;
        self.state.lamp_on.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A weather source that always reports clear skies; dry-run companion to
/// the simulated hardware.
pub struct ClearSkies;

#[async_trait]
impl WeatherSource for ClearSkies {
    fn name(&self) -> &str {
        "clear-skies"
    }

    async fn sample(&self) -> Result<WeatherSample, WeatherFetchError> {
        Ok(WeatherSample {
            humidity_pct: Some(40.0),
            wind_kph: Some(8.0),
            rain_index: Some(0.0),
            radar_rain_nearby: false,
            temperature_c: Some(12.0),
            cloud_cover_pct: Some(5.0),
            captured_at: Utc::now(),
        })
    }
}
