//! Sky condition monitoring
//!
//! A periodic background task samples weather from a primary source with
//! a fallback, evaluates the safety rules, and publishes Nominal/Alert
//! over a watch channel. The rules fail safe: a reading the monitor
//! cannot obtain counts against observing, never for it.

use crate::astro;
use crate::config::{ObservatoryConfig, SiteConfig, WeatherConfig};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One reading from a weather source. Missing fields are legitimate
/// (sensor offline) but are treated as unsafe by the evaluator.
#[derive(Debug, Clone)]
pub struct WeatherSample {
    pub humidity_pct: Option<f64>,
    pub wind_kph: Option<f64>,
    /// Cumulative rain gauge value; any change against the last nominal
    /// reading means rain.
    pub rain_index: Option<f64>,
    /// Radar shows precipitation near the site.
    pub radar_rain_nearby: bool,
    pub temperature_c: Option<f64>,
    pub cloud_cover_pct: Option<f64>,
    /// When the source last updated; stale samples are discarded.
    pub captured_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone)]
pub enum WeatherFetchError {
    #[error("{0} unreachable: {1}")]
    Unreachable(String, String),
    #[error("{0} stale: last update {1}")]
    Stale(String, DateTime<Utc>),
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    fn name(&self) -> &str;
    async fn sample(&self) -> Result<WeatherSample, WeatherFetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyCondition {
    Nominal,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertReason {
    Humidity,
    Wind,
    Rain,
    RainRadar,
    CloudCover,
    Daylight,
    /// Humidity or wind could not be read.
    NoData,
    /// Neither source could be reached repeatedly; safety is unverifiable.
    NetworkDown,
}

impl fmt::Display for AlertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AlertReason::Humidity => "humidity over limit",
            AlertReason::Wind => "wind over limit",
            AlertReason::Rain => "rain gauge changed",
            AlertReason::RainRadar => "rain on radar nearby",
            AlertReason::CloudCover => "cloud cover over limit",
            AlertReason::Daylight => "sun above horizon",
            AlertReason::NoData => "weather reading unavailable",
            AlertReason::NetworkDown => "weather sources unreachable",
        };
        f.write_str(text)
    }
}

/// Published sky state. The orchestrator reads this at every decision
/// point and awaits changes while holding for weather.
#[derive(Debug, Clone)]
pub struct SkyStatus {
    pub condition: SkyCondition,
    pub sun_up: bool,
    pub reasons: Vec<AlertReason>,
    pub changed_at: DateTime<Utc>,
    pub sample: Option<WeatherSample>,
}

impl SkyStatus {
    pub fn is_alert(&self) -> bool {
        self.condition == SkyCondition::Alert
    }

    /// Initial state before the first poll: not safe to open yet.
    pub fn startup() -> Self {
        Self {
            condition: SkyCondition::Alert,
            sun_up: false,
            reasons: vec![AlertReason::NoData],
            changed_at: Utc::now(),
            sample: None,
        }
    }
}

pub struct ConditionMonitor {
    weather: WeatherConfig,
    site: SiteConfig,
    primary: Box<dyn WeatherSource>,
    fallback: Option<Box<dyn WeatherSource>>,
    tx: watch::Sender<SkyStatus>,
    last_nominal_rain: Option<f64>,
    consecutive_failures: u32,
}

impl ConditionMonitor {
    pub fn new(
        config: &ObservatoryConfig,
        primary: Box<dyn WeatherSource>,
        fallback: Option<Box<dyn WeatherSource>>,
    ) -> (Self, watch::Receiver<SkyStatus>) {
        let (tx, rx) = watch::channel(SkyStatus::startup());
        (
            Self {
                weather: config.weather.clone(),
                site: config.site.clone(),
                primary,
                fallback,
                tx,
                last_nominal_rain: None,
                consecutive_failures: 0,
            },
            rx,
        )
    }

    /// Run the poll loop until every receiver is gone.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.weather.poll_minutes.max(1) * 60);
            loop {
                self.poll_once(Utc::now()).await;
                if self.tx.receiver_count() == 0 {
                    break;
                }
                tokio::time::sleep(period).await;
            }
            tracing::debug!("condition monitor stopped");
        })
    }

    /// Fetch, evaluate and publish one reading.
    pub async fn poll_once(&mut self, now: DateTime<Utc>) {
        let fetched = self.fetch(now).await;
        let status = self.evaluate(fetched, now);
        let previous = self.tx.borrow().condition;
        if previous != status.condition {
            match status.condition {
                SkyCondition::Alert => {
                    let reasons: Vec<String> =
                        status.reasons.iter().map(|r| r.to_string()).collect();
                    tracing::warn!("sky alert raised: {}", reasons.join(", "));
                }
                SkyCondition::Nominal => tracing::info!("sky alert cleared"),
            }
        }
        let _ = self.tx.send(status);
    }

    /// Primary source first; on failure or staleness, the documented
    /// fallback. Staleness is judged by the sample's own last-update time.
    async fn fetch(&self, now: DateTime<Utc>) -> Result<WeatherSample, WeatherFetchError> {
        let staleness = ChronoDuration::minutes(self.weather.staleness_minutes);
        let primary = match self.primary.sample().await {
            Ok(sample) if now - sample.captured_at <= staleness => return Ok(sample),
            Ok(sample) => {
                tracing::warn!(
                    "{} stale (last update {}), trying fallback",
                    self.primary.name(),
                    sample.captured_at
                );
                Err(WeatherFetchError::Stale(
                    self.primary.name().to_string(),
                    sample.captured_at,
                ))
            }
            Err(e) => {
                tracing::warn!("{} failed: {e}, trying fallback", self.primary.name());
                Err(e)
            }
        };

        let Some(fallback) = &self.fallback else {
            return primary;
        };
        match fallback.sample().await {
            Ok(sample) if now - sample.captured_at <= staleness => Ok(sample),
            Ok(sample) => Err(WeatherFetchError::Stale(
                fallback.name().to_string(),
                sample.captured_at,
            )),
            Err(e) => Err(e),
        }
    }

    /// Apply the alert rules to one fetch result.
    pub fn evaluate(
        &mut self,
        fetched: Result<WeatherSample, WeatherFetchError>,
        now: DateTime<Utc>,
    ) -> SkyStatus {
        let sun_up = astro::sun_elevation_deg(now, self.site.latitude, self.site.longitude) >= 0.0;
        let mut reasons = Vec::new();
        if sun_up {
            reasons.push(AlertReason::Daylight);
        }

        let sample = match fetched {
            Ok(sample) => {
                self.consecutive_failures = 0;
                Some(sample)
            }
            Err(_) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= 2 {
                    reasons.push(AlertReason::NetworkDown);
                } else {
                    // One blip is a missing reading, not yet a network
                    // outage; still unsafe to trust
                    reasons.push(AlertReason::NoData);
                }
                None
            }
        };

        if let Some(sample) = &sample {
            match sample.humidity_pct {
                Some(h) if h >= self.weather.humidity_limit_pct => {
                    reasons.push(AlertReason::Humidity)
                }
                Some(_) => {}
                None => reasons.push(AlertReason::NoData),
            }
            match sample.wind_kph {
                Some(w) if w >= self.weather.wind_limit_kph => reasons.push(AlertReason::Wind),
                Some(_) => {}
                None => {
                    if !reasons.contains(&AlertReason::NoData) {
                        reasons.push(AlertReason::NoData);
                    }
                }
            }
            if let (Some(rain), Some(baseline)) = (sample.rain_index, self.last_nominal_rain) {
                if (rain - baseline).abs() > f64::EPSILON {
                    reasons.push(AlertReason::Rain);
                }
            }
            if sample.radar_rain_nearby {
                reasons.push(AlertReason::RainRadar);
            }
            if let Some(clouds) = sample.cloud_cover_pct {
                if clouds >= self.weather.cloud_cover_limit_pct {
                    reasons.push(AlertReason::CloudCover);
                }
            }
        }

        let condition = if reasons.is_empty() {
            SkyCondition::Nominal
        } else {
            SkyCondition::Alert
        };

        if condition == SkyCondition::Nominal {
            if let Some(sample) = &sample {
                self.last_nominal_rain = sample.rain_index;
            }
        }

        SkyStatus {
            condition,
            sun_up,
            reasons,
            changed_at: now,
            sample,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Scripted {
        name: &'static str,
        result: std::sync::Mutex<Vec<Result<WeatherSample, WeatherFetchError>>>,
    }

    #[async_trait]
    impl WeatherSource for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn sample(&self) -> Result<WeatherSample, WeatherFetchError> {
            self.result
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(WeatherFetchError::Unreachable(
                    self.name.to_string(),
                    "script exhausted".into(),
                )))
        }
    }

    /// Midnight over the prime meridian: the sun is well below the horizon.
    fn night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap()
    }

    fn clear_sample(at: DateTime<Utc>) -> WeatherSample {
        WeatherSample {
            humidity_pct: Some(40.0),
            wind_kph: Some(10.0),
            rain_index: Some(0.0),
            radar_rain_nearby: false,
            temperature_c: Some(10.0),
            cloud_cover_pct: Some(5.0),
            captured_at: at,
        }
    }

    fn monitor() -> (ConditionMonitor, watch::Receiver<SkyStatus>) {
        let mut config = ObservatoryConfig::default();
        config.site.latitude = 0.0;
        config.site.longitude = 0.0;
        let primary = Box::new(Scripted {
            name: "primary",
            result: std::sync::Mutex::new(Vec::new()),
        });
        ConditionMonitor::new(&config, primary, None)
    }

    #[test]
    fn clear_night_is_nominal() {
        let (mut m, _rx) = monitor();
        let status = m.evaluate(Ok(clear_sample(night())), night());
        assert_eq!(status.condition, SkyCondition::Nominal);
        assert!(!status.sun_up);
    }

    #[test]
    fn humidity_over_limit_raises_alert() {
        let (mut m, _rx) = monitor();
        let mut sample = clear_sample(night());
        sample.humidity_pct = Some(95.0);
        let status = m.evaluate(Ok(sample), night());
        assert_eq!(status.condition, SkyCondition::Alert);
        assert!(status.reasons.contains(&AlertReason::Humidity));
    }

    #[test]
    fn missing_humidity_fails_safe() {
        let (mut m, _rx) = monitor();
        let mut sample = clear_sample(night());
        sample.humidity_pct = None;
        let status = m.evaluate(Ok(sample), night());
        assert_eq!(status.condition, SkyCondition::Alert);
        assert!(status.reasons.contains(&AlertReason::NoData));
    }

    #[test]
    fn rain_change_since_nominal_raises_alert() {
        let (mut m, _rx) = monitor();
        let first = m.evaluate(Ok(clear_sample(night())), night());
        assert_eq!(first.condition, SkyCondition::Nominal);

        let mut wet = clear_sample(night());
        wet.rain_index = Some(0.4);
        let status = m.evaluate(Ok(wet), night());
        assert_eq!(status.condition, SkyCondition::Alert);
        assert!(status.reasons.contains(&AlertReason::Rain));
    }

    #[test]
    fn daylight_raises_alert() {
        let (mut m, _rx) = monitor();
        let noon = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let status = m.evaluate(Ok(clear_sample(noon)), noon);
        assert_eq!(status.condition, SkyCondition::Alert);
        assert!(status.sun_up);
        assert!(status.reasons.contains(&AlertReason::Daylight));
    }

    #[test]
    fn persistent_fetch_failure_raises_network_alert() {
        let (mut m, _rx) = monitor();
        let err = || {
            Err(WeatherFetchError::Unreachable(
                "primary".into(),
                "timeout".into(),
            ))
        };
        let first = m.evaluate(err(), night());
        assert!(first.reasons.contains(&AlertReason::NoData));
        let second = m.evaluate(err(), night());
        assert!(second.reasons.contains(&AlertReason::NetworkDown));
    }

    #[test]
    fn alert_clears_when_conditions_recover() {
        let (mut m, _rx) = monitor();
        let mut windy = clear_sample(night());
        windy.wind_kph = Some(60.0);
        assert_eq!(m.evaluate(Ok(windy), night()).condition, SkyCondition::Alert);
        let status = m.evaluate(Ok(clear_sample(night())), night());
        assert_eq!(status.condition, SkyCondition::Nominal);
    }

    #[tokio::test]
    async fn stale_primary_falls_back() {
        let mut config = ObservatoryConfig::default();
        config.site.latitude = 0.0;
        config.site.longitude = 0.0;
        let now = night();
        let stale = clear_sample(now - ChronoDuration::hours(3));
        let primary = Box::new(Scripted {
            name: "primary",
            result: std::sync::Mutex::new(vec![Ok(stale)]),
        });
        let fallback = Box::new(Scripted {
            name: "fallback",
            result: std::sync::Mutex::new(vec![Ok(clear_sample(now))]),
        });
        let (m, _rx) = ConditionMonitor::new(&config, primary, Some(fallback));
        let sample = m.fetch(now).await.unwrap();
        assert_eq!(sample.captured_at, now);
    }
}
