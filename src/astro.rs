//! Positional astronomy helpers
//!
//! Low-precision algorithms, good to a few arcminutes: enough for slew
//! validation, daytime detection and sunset scheduling, nowhere near
//! pointing-model territory.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

/// Julian day for a UTC instant.
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let day_fraction =
        (dt.hour() as f64 + dt.minute() as f64 / 60.0 + dt.second() as f64 / 3600.0) / 24.0;

    jd + day_fraction
}

/// Local sidereal time in hours for a Julian day and east longitude.
pub fn local_sidereal_time(jd: f64, longitude_deg: f64) -> f64 {
    let t = (jd - 2451545.0) / 36525.0;

    let gmst = 280.46061837
        + 360.98564736629 * (jd - 2451545.0)
        + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    let lst = (gmst + longitude_deg).rem_euclid(360.0);
    lst / 15.0
}

/// Hour angle in hours, normalized to [-12, 12).
pub fn hour_angle_hours(ra_hours: f64, lst_hours: f64) -> f64 {
    let mut ha = (lst_hours - ra_hours).rem_euclid(24.0);
    if ha >= 12.0 {
        ha -= 24.0;
    }
    ha
}

/// Altitude of a target above the horizon, degrees.
pub fn altitude_deg(ra_hours: f64, dec_degrees: f64, latitude_deg: f64, lst_hours: f64) -> f64 {
    let ha_rad = (hour_angle_hours(ra_hours, lst_hours) * 15.0).to_radians();
    let dec_rad = dec_degrees.to_radians();
    let lat_rad = latitude_deg.to_radians();

    let sin_alt = lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos();
    sin_alt.asin().to_degrees()
}

/// Apparent solar RA (hours) and declination (degrees).
fn sun_position(jd: f64) -> (f64, f64) {
    let n = jd - 2451545.0;
    // Mean longitude and mean anomaly of the Sun, degrees
    let l = (280.460 + 0.9856474 * n).rem_euclid(360.0);
    let g = ((357.528 + 0.9856003 * n).rem_euclid(360.0)).to_radians();
    // Ecliptic longitude
    let lambda = (l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();
    // Obliquity of the ecliptic
    let epsilon = (23.439 - 0.0000004 * n).to_radians();

    let ra = (epsilon.cos() * lambda.sin()).atan2(lambda.cos());
    let dec = (epsilon.sin() * lambda.sin()).asin();

    (ra.to_degrees().rem_euclid(360.0) / 15.0, dec.to_degrees())
}

/// Elevation of the Sun above the horizon, degrees. Non-negative means
/// daytime for safety purposes.
pub fn sun_elevation_deg(at: DateTime<Utc>, latitude_deg: f64, longitude_deg: f64) -> f64 {
    let jd = julian_day(&at);
    let (sun_ra, sun_dec) = sun_position(jd);
    let lst = local_sidereal_time(jd, longitude_deg);
    altitude_deg(sun_ra, sun_dec, latitude_deg, lst)
}

/// The next instant after `after` at which the Sun drops below the
/// horizon. Coarse 5-minute scan refined to the minute; searches up to
/// 48 hours out.
pub fn next_sunset(after: DateTime<Utc>, latitude_deg: f64, longitude_deg: f64) -> DateTime<Utc> {
    let mut t = after;
    let end = after + Duration::hours(48);
    let mut prev_up = sun_elevation_deg(t, latitude_deg, longitude_deg) >= 0.0;

    while t < end {
        let next = t + Duration::minutes(5);
        let up = sun_elevation_deg(next, latitude_deg, longitude_deg) >= 0.0;
        if prev_up && !up {
            // Refine within the 5-minute bracket
            let mut fine = t;
            while fine < next {
                if sun_elevation_deg(fine, latitude_deg, longitude_deg) < 0.0 {
                    return fine;
                }
                fine = fine + Duration::minutes(1);
            }
            return next;
        }
        prev_up = up;
        t = next;
    }
    // Polar day fallback: caller sleeps the full search window
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn julian_day_j2000_epoch() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap();
        assert!((julian_day(&epoch) - 2451545.0).abs() < 1e-6);
    }

    #[test]
    fn altitude_at_zenith() {
        // A target on the meridian at the observer's latitude sits at the
        // zenith: HA = 0, dec = lat.
        let alt = altitude_deg(6.0, 45.0, 45.0, 6.0);
        assert!((alt - 90.0).abs() < 1e-6);
    }

    #[test]
    fn hour_angle_wraps() {
        assert!((hour_angle_hours(23.0, 1.0) - 2.0).abs() < 1e-9);
        assert!((hour_angle_hours(1.0, 23.0) + 2.0).abs() < 1e-9);
    }

    #[test]
    fn sun_high_at_equinox_noon() {
        // Around the March equinox the Sun is nearly overhead at local noon
        // on the equator/prime meridian.
        let noon = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let elevation = sun_elevation_deg(noon, 0.0, 0.0);
        assert!(elevation > 80.0, "elevation was {elevation}");
    }

    #[test]
    fn sun_down_at_midnight() {
        let midnight = Utc.with_ymd_and_hms(2026, 3, 20, 0, 0, 0).unwrap();
        let elevation = sun_elevation_deg(midnight, 0.0, 0.0);
        assert!(elevation < -60.0, "elevation was {elevation}");
    }

    #[test]
    fn next_sunset_lands_near_dusk() {
        let noon = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        let sunset = next_sunset(noon, 0.0, 0.0);
        let hours_until = (sunset - noon).num_minutes() as f64 / 60.0;
        assert!(
            (3.0..9.0).contains(&hours_until),
            "sunset {hours_until} h after noon"
        );
        assert!(sun_elevation_deg(sunset, 0.0, 0.0) < 1.0);
    }
}
