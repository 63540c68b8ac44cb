//! Observation tickets and the nightly run queue
//!
//! One JSON record per target. Malformed or out-of-range records are
//! rejected before scheduling begins, never coerced.

use crate::config::FilterWheelMap;
use crate::error::{ConfigError, TicketError};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A coordinate given either as a decimal number or a sexagesimal string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum FlexCoord {
    Decimal(f64),
    Sexagesimal(String),
}

impl FlexCoord {
    fn resolve(&self, name: &str) -> Result<f64, TicketError> {
        match self {
            FlexCoord::Decimal(v) => Ok(*v),
            FlexCoord::Sexagesimal(s) => {
                parse_sexagesimal(s).ok_or_else(|| TicketError::BadCoordinate {
                    name: name.to_string(),
                    value: s.clone(),
                })
            }
        }
    }
}

/// A field that may be a scalar or a list; scalars normalize to
/// single-element lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Raw on-disk ticket record, before validation.
#[derive(Debug, Deserialize)]
struct TicketRecord {
    name: String,
    ra: FlexCoord,
    dec: FlexCoord,
    start_time: DateTime<FixedOffset>,
    end_time: DateTime<FixedOffset>,
    #[serde(alias = "filters")]
    filter: OneOrMany<String>,
    #[serde(alias = "exp_times")]
    exp_time: OneOrMany<f64>,
    num: u32,
    #[serde(default)]
    self_guide: bool,
    #[serde(default)]
    guide: bool,
    #[serde(default)]
    cycle_filter: bool,
}

/// One requested target session. Immutable once validated.
#[derive(Debug, Clone)]
pub struct ObservationTicket {
    pub name: String,
    /// Right ascension, hours, [0, 24).
    pub ra_hours: f64,
    /// Declination, degrees, [-90, 90].
    pub dec_degrees: f64,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    pub filters: Vec<String>,
    pub exposure_times: Vec<f64>,
    /// Exposure count; per filter unless `cycle_filter` spreads it.
    pub num: u32,
    pub self_guide: bool,
    pub guide: bool,
    pub cycle_filter: bool,
}

impl ObservationTicket {
    fn from_record(record: TicketRecord, min_exposure: f64) -> Result<Self, TicketError> {
        let name = record.name.clone();
        let ra_hours = record.ra.resolve(&name)?;
        let dec_degrees = record.dec.resolve(&name)?;

        if !(0.0..24.0).contains(&ra_hours) {
            return Err(TicketError::RaOutOfRange { name, ra: ra_hours });
        }
        if !(-90.0..=90.0).contains(&dec_degrees) {
            return Err(TicketError::DecOutOfRange {
                name,
                dec: dec_degrees,
            });
        }
        if record.end_time <= record.start_time {
            return Err(TicketError::EmptyWindow { name });
        }

        let filters = record.filter.into_vec();
        if filters.is_empty() {
            return Err(TicketError::NoFilters { name });
        }
        let exposure_times = record.exp_time.into_vec();
        if exposure_times.is_empty() {
            return Err(TicketError::ExposureTooShort {
                name,
                seconds: 0.0,
                minimum: min_exposure,
            });
        }
        for &seconds in &exposure_times {
            if seconds < min_exposure {
                return Err(TicketError::ExposureTooShort {
                    name,
                    seconds,
                    minimum: min_exposure,
                });
            }
        }

        Ok(Self {
            name: record.name,
            ra_hours,
            dec_degrees,
            start_time: record.start_time,
            end_time: record.end_time,
            filters,
            exposure_times,
            num: record.num,
            self_guide: record.self_guide,
            guide: record.guide,
            cycle_filter: record.cycle_filter,
        })
    }

    /// The ticket's (filter, exposure-time) pairs. A shorter exposure
    /// list cycles to cover every filter.
    pub fn pairs(&self) -> Vec<(String, f64)> {
        self.filters
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), self.exposure_times[i % self.exposure_times.len()]))
            .collect()
    }

    /// The full frame plan for the night, honoring the cycle-filter policy:
    /// cycling changes the filter every frame and spreads `num` over the
    /// whole plan; otherwise each filter gets its full count in turn.
    pub fn schedule(&self) -> Vec<(String, f64)> {
        let pairs = self.pairs();
        if self.cycle_filter {
            (0..self.num as usize)
                .map(|i| pairs[i % pairs.len()].clone())
                .collect()
        } else {
            pairs
                .iter()
                .flat_map(|p| std::iter::repeat(p.clone()).take(self.num as usize))
                .collect()
        }
    }

    pub fn window_closed(&self, now: DateTime<Utc>) -> bool {
        self.end_time <= now
    }
}

/// Parse `HH:MM:SS.s` / `±DD:MM:SS` (colon- or space-separated).
fn parse_sexagesimal(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let (sign, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let parts: Vec<&str> = rest
        .split(|c| c == ':' || c == ' ')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut value = 0.0;
    let mut scale = 1.0;
    for part in &parts {
        value += part.parse::<f64>().ok()? / scale;
        scale *= 60.0;
    }
    Some(sign * value)
}

/// A validated ticket bound to its output directory, with a set-once
/// calibration marker.
#[derive(Debug)]
pub struct ScheduledTicket {
    pub ticket: ObservationTicket,
    pub directory: PathBuf,
    calibrated: AtomicBool,
}

impl ScheduledTicket {
    pub fn new(ticket: ObservationTicket, data_dir: &Path) -> Self {
        let directory = data_dir.join(&ticket.name);
        Self {
            ticket,
            directory,
            calibrated: AtomicBool::new(false),
        }
    }

    /// Set the calibrated marker. Returns true the first time only, so
    /// calibration runs at most once per ticket.
    pub fn mark_calibrated(&self) -> bool {
        !self.calibrated.swap(true, Ordering::SeqCst)
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::SeqCst)
    }
}

/// The ordered list of tickets for a night, sorted by start time.
#[derive(Debug, Default)]
pub struct RunQueue {
    entries: Vec<Arc<ScheduledTicket>>,
}

impl RunQueue {
    pub fn from_tickets(tickets: Vec<ObservationTicket>, data_dir: &Path) -> Self {
        let mut entries: Vec<Arc<ScheduledTicket>> = tickets
            .into_iter()
            .map(|t| Arc::new(ScheduledTicket::new(t, data_dir)))
            .collect();
        entries.sort_by_key(|e| e.ticket.start_time);
        Self { entries }
    }

    /// Load tickets from a single record file or a directory of them.
    /// Any invalid ticket rejects the whole load.
    pub fn load(
        path: &Path,
        data_dir: &Path,
        min_exposure: f64,
        wheel: &FilterWheelMap,
    ) -> Result<Self, ConfigError> {
        let mut tickets = Vec::new();
        if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)
                .map_err(|source| ConfigError::Unreadable {
                    path: path.to_path_buf(),
                    source,
                })?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
                .collect();
            paths.sort();
            for file in paths {
                tickets.push(load_one(&file, min_exposure, wheel)?);
            }
        } else {
            tickets.push(load_one(path, min_exposure, wheel)?);
        }
        Ok(Self::from_tickets(tickets, data_dir))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<ScheduledTicket>> {
        self.entries.get(index).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ScheduledTicket>> {
        self.entries.iter()
    }

    /// End of the last ticket's window; the hard deadline for the night.
    pub fn last_end_time(&self) -> Option<DateTime<FixedOffset>> {
        self.entries.iter().map(|e| e.ticket.end_time).max()
    }
}

fn load_one(
    path: &Path,
    min_exposure: f64,
    wheel: &FilterWheelMap,
) -> Result<ObservationTicket, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let record: TicketRecord =
        serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    let ticket = ObservationTicket::from_record(record, min_exposure)
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    for filter in &ticket.filters {
        if !wheel.contains(filter) {
            return Err(ConfigError::Invalid(
                TicketError::UnknownFilter {
                    name: ticket.name.clone(),
                    filter: filter.clone(),
                }
                .to_string(),
            ));
        }
    }
    Ok(ticket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record_json(extra: &str) -> String {
        format!(
            r#"{{
                "name": "M41",
                "ra": 5.5,
                "dec": -10.0,
                "start_time": "2026-02-10T22:00:00-05:00",
                "end_time": "2026-02-11T02:00:00-05:00",
                "filter": "r",
                "exp_time": 30.0,
                "num": 4
                {extra}
            }}"#
        )
    }

    fn parse(json: &str) -> Result<ObservationTicket, TicketError> {
        let record: TicketRecord = serde_json::from_str(json).unwrap();
        ObservationTicket::from_record(record, 0.001)
    }

    #[test]
    fn scalar_fields_normalize_to_lists() {
        let ticket = parse(&record_json("")).unwrap();
        assert_eq!(ticket.filters, vec!["r".to_string()]);
        assert_eq!(ticket.exposure_times, vec![30.0]);
        assert_eq!(ticket.num, 4);
    }

    #[test]
    fn sexagesimal_coordinates_parse() {
        let json = record_json("").replace("5.5", r#""05:30:00""#).replace(
            r#""dec": -10.0"#,
            r#""dec": "-10:30:00""#,
        );
        let ticket = parse(&json).unwrap();
        assert!((ticket.ra_hours - 5.5).abs() < 1e-9);
        assert!((ticket.dec_degrees + 10.5).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_ra_rejected() {
        let json = record_json("").replace("5.5", "24.0");
        assert!(matches!(
            parse(&json),
            Err(TicketError::RaOutOfRange { .. })
        ));
    }

    #[test]
    fn out_of_range_dec_rejected() {
        let json = record_json("").replace(r#""dec": -10.0"#, r#""dec": -91.0"#);
        assert!(matches!(
            parse(&json),
            Err(TicketError::DecOutOfRange { .. })
        ));
    }

    #[test]
    fn inverted_window_rejected() {
        let json = record_json("").replace("2026-02-11T02:00:00-05:00", "2026-02-10T21:00:00-05:00");
        assert!(matches!(parse(&json), Err(TicketError::EmptyWindow { .. })));
    }

    #[test]
    fn short_exposure_rejected() {
        let record: TicketRecord =
            serde_json::from_str(&record_json("").replace("30.0", "0.0001")).unwrap();
        assert!(matches!(
            ObservationTicket::from_record(record, 0.001),
            Err(TicketError::ExposureTooShort { .. })
        ));
    }

    #[test]
    fn cycle_filter_spreads_count_over_plan() {
        let json = record_json(r#", "cycle_filter": true"#)
            .replace(r#""filter": "r""#, r#""filter": ["r", "g"]"#)
            .replace(r#""exp_time": 30.0"#, r#""exp_time": [30.0, 60.0]"#);
        let ticket = parse(&json).unwrap();
        let plan = ticket.schedule();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0], ("r".to_string(), 30.0));
        assert_eq!(plan[1], ("g".to_string(), 60.0));
        assert_eq!(plan[2], ("r".to_string(), 30.0));
    }

    #[test]
    fn non_cycling_completes_each_filter_first() {
        let json = record_json("").replace(r#""filter": "r""#, r#""filter": ["r", "g"]"#);
        let ticket = parse(&json).unwrap();
        let plan = ticket.schedule();
        assert_eq!(plan.len(), 8);
        assert!(plan[..4].iter().all(|(f, _)| f == "r"));
        assert!(plan[4..].iter().all(|(f, _)| f == "g"));
    }

    #[test]
    fn calibrated_marker_sets_once() {
        let ticket = parse(&record_json("")).unwrap();
        let scheduled = ScheduledTicket::new(ticket, Path::new("/tmp/images"));
        assert!(scheduled.mark_calibrated());
        assert!(!scheduled.mark_calibrated());
        assert!(scheduled.is_calibrated());
    }

    #[test]
    fn queue_sorted_by_start_time() {
        let early = parse(&record_json("")).unwrap();
        let mut late = early.clone();
        late.name = "M42".into();
        late.start_time = late.start_time + chrono::Duration::hours(1);
        late.end_time = late.end_time + chrono::Duration::hours(1);
        let queue = RunQueue::from_tickets(vec![late, early], Path::new("/tmp/images"));
        assert_eq!(queue.get(0).unwrap().ticket.name, "M41");
        assert_eq!(queue.get(1).unwrap().ticket.name, "M42");
    }

    #[test]
    fn unknown_filter_rejected_at_load() {
        let mut slots = HashMap::new();
        slots.insert("g".to_string(), 3u8);
        let wheel = FilterWheelMap::new(slots);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m41.json");
        std::fs::write(&path, record_json("")).unwrap();
        let result = RunQueue::load(&path, dir.path(), 0.001, &wheel);
        assert!(result.is_err());
    }
}
