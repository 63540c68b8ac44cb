//! Device driver interfaces
//!
//! Each physical device is driven through an async trait object; the
//! workers in `crate::workers` own these and serialize all access. Real
//! device protocols (ASCOM, INDI, vendor SDKs) live behind these traits
//! and are out of scope here; `crate::sim` provides simulated drivers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Driver-level failures. Workers translate these into
/// [`crate::error::DeviceError`] with device context attached.
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Handshake with the device failed or the link dropped.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A single command failed; the driver itself is still healthy.
    #[error("{0}")]
    Command(String),

    /// The driver process is wedged; the worker must be replaced.
    #[error("driver fault: {0}")]
    Fault(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Raw frame as delivered by the camera driver.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    pub exposure_secs: f64,
    pub filter: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.data[(y * self.width + x) as usize]
    }
}

/// What kind of frame an exposure produces. Darks keep the shutter closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
    Light,
    Dark,
    Flat,
}

#[derive(Debug, Clone)]
pub struct ExposureRequest {
    pub seconds: f64,
    pub kind: ExposureKind,
}

/// Dome shutter position as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutterState {
    Open,
    Closed,
    Opening,
    Closing,
    Error,
}

#[async_trait]
pub trait CameraDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    /// Blocks for the duration of the exposure and returns the frame.
    async fn expose(&self, request: &ExposureRequest) -> DriverResult<Frame>;
    async fn set_filter_slot(&self, slot: u8) -> DriverResult<()>;
    async fn set_cooler(&self, on: bool, setpoint_c: f64) -> DriverResult<()>;
    async fn sensor_temperature(&self) -> DriverResult<f64>;
}

#[async_trait]
pub trait TelescopeDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    /// Blocks until the slew settles.
    async fn slew(&self, ra_hours: f64, dec_degrees: f64) -> DriverResult<()>;
    /// Small relative move, arcseconds on each axis.
    async fn jog(&self, ra_arcsec: f64, dec_arcsec: f64) -> DriverResult<()>;
    async fn park(&self) -> DriverResult<()>;
    async fn unpark(&self) -> DriverResult<()>;
    /// Current pointing (RA hours, Dec degrees).
    async fn coordinates(&self) -> DriverResult<(f64, f64)>;
}

#[async_trait]
pub trait DomeDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    /// Blocks until the shutter reaches the open position.
    async fn open_shutter(&self) -> DriverResult<()>;
    /// Blocks until the shutter reaches the closed position.
    async fn close_shutter(&self) -> DriverResult<()>;
    async fn shutter_state(&self) -> DriverResult<ShutterState>;
    /// Rotate the dome to its home azimuth.
    async fn home(&self) -> DriverResult<()>;
}

#[async_trait]
pub trait FocuserDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    /// Blocks until the focuser stops at the absolute position.
    async fn move_to(&self, position: i32) -> DriverResult<()>;
    async fn position(&self) -> DriverResult<i32>;
    /// Ambient temperature at the focuser, if the hardware reports one.
    async fn temperature(&self) -> DriverResult<Option<f64>>;
}

#[async_trait]
pub trait LampDriver: Send + Sync {
    async fn connect(&self) -> DriverResult<()>;
    async fn disconnect(&self) -> DriverResult<()>;
    /// Blocks until the lamp reports ready.
    async fn turn_on(&self) -> DriverResult<()>;
    async fn turn_off(&self) -> DriverResult<()>;
}

/// Constructs fresh driver instances. Crash recovery discards a worker
/// wholesale and builds its replacement from here.
pub trait DriverFactory: Send + Sync {
    fn camera(&self) -> Box<dyn CameraDriver>;
    fn telescope(&self) -> Box<dyn TelescopeDriver>;
    fn dome(&self) -> Box<dyn DomeDriver>;
    fn focuser(&self) -> Box<dyn FocuserDriver>;
    fn lamp(&self) -> Box<dyn LampDriver>;
}
