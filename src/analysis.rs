//! Frame statistics and star measurement
//!
//! Pure functions over raw frames: enough star finding and profile
//! measurement to feed the guider and the focus metric. Anything heavier
//! belongs in a dedicated pipeline, not the control loop.

use crate::drivers::Frame;

/// A detected point source.
#[derive(Debug, Clone, Copy)]
pub struct Star {
    pub x: f64,
    pub y: f64,
    pub peak: u16,
    pub flux: f64,
}

/// Median pixel value of the whole frame.
pub fn frame_median(frame: &Frame) -> u16 {
    if frame.data.is_empty() {
        return 0;
    }
    let mut pixels = frame.data.clone();
    let mid = pixels.len() / 2;
    *pixels.select_nth_unstable(mid).1
}

/// Background level and noise estimate (median and scaled MAD).
fn background_and_noise(frame: &Frame) -> (f64, f64) {
    let median = frame_median(frame) as f64;
    let mut deviations: Vec<u16> = frame
        .data
        .iter()
        .map(|&v| (v as f64 - median).abs().min(u16::MAX as f64) as u16)
        .collect();
    let mid = deviations.len() / 2;
    let mad = *deviations.select_nth_unstable(mid).1 as f64;
    (median, (mad * 1.4826).max(1.0))
}

const EDGE_MARGIN: u32 = 12;
const CENTROID_RADIUS: i64 = 3;

/// Detect stars: local maxima above the noise floor, flux-weighted
/// centroids, brighter-neighbor suppression. Sorted by flux, descending.
pub fn find_stars(frame: &Frame, saturation: u16) -> Vec<Star> {
    if frame.width <= 2 * EDGE_MARGIN || frame.height <= 2 * EDGE_MARGIN {
        return Vec::new();
    }
    let (background, noise) = background_and_noise(frame);
    let threshold = background + (5.0 * noise).max(15.0);

    let mut candidates: Vec<Star> = Vec::new();
    for y in EDGE_MARGIN..frame.height - EDGE_MARGIN {
        for x in EDGE_MARGIN..frame.width - EDGE_MARGIN {
            let value = frame.pixel(x, y);
            if (value as f64) < threshold {
                continue;
            }
            if !is_local_maximum(frame, x, y, value) {
                continue;
            }
            if let Some(star) = centroid_at(frame, x as i64, y as i64, background, saturation) {
                candidates.push(star);
            }
        }
    }

    candidates.sort_by(|a, b| b.flux.partial_cmp(&a.flux).unwrap_or(std::cmp::Ordering::Equal));

    // Suppress duplicate detections of the same source
    let mut stars: Vec<Star> = Vec::new();
    for candidate in candidates {
        let distinct = stars.iter().all(|s| {
            let dx = s.x - candidate.x;
            let dy = s.y - candidate.y;
            (dx * dx + dy * dy).sqrt() > 10.0
        });
        if distinct {
            stars.push(candidate);
        }
    }
    stars
}

fn is_local_maximum(frame: &Frame, x: u32, y: u32, value: u16) -> bool {
    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = (x as i64 + dx) as u32;
            let ny = (y as i64 + dy) as u32;
            if frame.pixel(nx, ny) > value {
                return false;
            }
        }
    }
    true
}

fn centroid_at(frame: &Frame, cx: i64, cy: i64, background: f64, _saturation: u16) -> Option<Star> {
    let mut weight = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut peak = 0u16;
    for dy in -CENTROID_RADIUS..=CENTROID_RADIUS {
        for dx in -CENTROID_RADIUS..=CENTROID_RADIUS {
            let x = cx + dx;
            let y = cy + dy;
            if x < 0 || y < 0 || x >= frame.width as i64 || y >= frame.height as i64 {
                continue;
            }
            let value = frame.pixel(x as u32, y as u32);
            peak = peak.max(value);
            let above = (value as f64 - background).max(0.0);
            weight += above;
            sum_x += above * x as f64;
            sum_y += above * y as f64;
        }
    }
    if weight <= 0.0 {
        return None;
    }
    Some(Star {
        x: sum_x / weight,
        y: sum_y / weight,
        peak,
        flux: weight,
    })
}

/// Pick a guide star: the brightest unsaturated detection that is well
/// away from the frame edge and not crowded by a comparably bright
/// neighbor.
pub fn brightest_guide_star(frame: &Frame, saturation: u16) -> Option<Star> {
    let margin = (frame.width.min(frame.height) / 8).max(EDGE_MARGIN) as f64;
    let stars = find_stars(frame, saturation);
    stars
        .iter()
        .find(|star| {
            if star.peak >= saturation {
                return false;
            }
            if star.x < margin
                || star.y < margin
                || star.x > frame.width as f64 - margin
                || star.y > frame.height as f64 - margin
            {
                return false;
            }
            let crowded = stars.iter().any(|other| {
                let dx = other.x - star.x;
                let dy = other.y - star.y;
                let distance = (dx * dx + dy * dy).sqrt();
                distance > 1.0 && distance < 50.0 && other.flux > 0.5 * star.flux
            });
            !crowded
        })
        .copied()
}

/// Re-locate a star inside a search window centered on (x, y). Returns
/// None when nothing stands above the local noise.
pub fn centroid_near(frame: &Frame, x: f64, y: f64, radius: u32) -> Option<Star> {
    let (background, noise) = background_and_noise(frame);
    let x0 = ((x - radius as f64).floor().max(0.0)) as u32;
    let y0 = ((y - radius as f64).floor().max(0.0)) as u32;
    let x1 = ((x + radius as f64).ceil() as u32).min(frame.width - 1);
    let y1 = ((y + radius as f64).ceil() as u32).min(frame.height - 1);

    let mut peak = 0u16;
    let mut peak_pos = (0i64, 0i64);
    for py in y0..=y1 {
        for px in x0..=x1 {
            let value = frame.pixel(px, py);
            if value > peak {
                peak = value;
                peak_pos = (px as i64, py as i64);
            }
        }
    }
    if (peak as f64) < background + (5.0 * noise).max(15.0) {
        return None;
    }
    centroid_at(frame, peak_pos.0, peak_pos.1, background, u16::MAX)
}

/// Full width at half maximum of a star's radial profile, in pixels.
pub fn fwhm_at(frame: &Frame, star: &Star) -> Option<f64> {
    let (background, _) = background_and_noise(frame);
    let amplitude = star.peak as f64 - background;
    if amplitude <= 0.0 {
        return None;
    }
    let half = amplitude / 2.0;

    const MAX_RADIUS: usize = 15;
    let mut sums = [0.0f64; MAX_RADIUS + 1];
    let mut counts = [0u32; MAX_RADIUS + 1];
    let cx = star.x;
    let cy = star.y;
    for dy in -(MAX_RADIUS as i64)..=MAX_RADIUS as i64 {
        for dx in -(MAX_RADIUS as i64)..=MAX_RADIUS as i64 {
            let x = cx.round() as i64 + dx;
            let y = cy.round() as i64 + dy;
            if x < 0 || y < 0 || x >= frame.width as i64 || y >= frame.height as i64 {
                continue;
            }
            let r = ((dx * dx + dy * dy) as f64).sqrt().round() as usize;
            if r > MAX_RADIUS {
                continue;
            }
            sums[r] += frame.pixel(x as u32, y as u32) as f64 - background;
            counts[r] += 1;
        }
    }

    let mut previous = amplitude;
    for r in 1..=MAX_RADIUS {
        if counts[r] == 0 {
            continue;
        }
        let level = sums[r] / counts[r] as f64;
        if level <= half {
            // Interpolate the half-max crossing between r-1 and r
            let span = previous - level;
            let fraction = if span > 0.0 {
                (previous - half) / span
            } else {
                0.5
            };
            return Some(2.0 * ((r - 1) as f64 + fraction));
        }
        previous = level;
    }
    None
}

/// Focus quality metric: median FWHM over the brightest unsaturated
/// stars. Lower is sharper. None when no usable star is measurable.
pub fn focus_metric(frame: &Frame, saturation: u16) -> Option<f64> {
    let stars = find_stars(frame, saturation);
    let mut widths: Vec<f64> = stars
        .iter()
        .filter(|s| s.peak < saturation)
        .take(10)
        .filter_map(|s| fwhm_at(frame, s))
        .collect();
    if widths.is_empty() {
        return None;
    }
    widths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Some(widths[widths.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn blank_frame(width: u32, height: u32, level: u16) -> Frame {
        Frame {
            width,
            height,
            data: vec![level; (width * height) as usize],
            exposure_secs: 1.0,
            filter: None,
            captured_at: Utc::now(),
        }
    }

    fn add_gaussian(frame: &mut Frame, x0: f64, y0: f64, sigma: f64, amplitude: f64) {
        for y in 0..frame.height {
            for x in 0..frame.width {
                let dx = x as f64 - x0;
                let dy = y as f64 - y0;
                let value = amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                let index = (y * frame.width + x) as usize;
                frame.data[index] = (frame.data[index] as f64 + value).min(65_535.0) as u16;
            }
        }
    }

    #[test]
    fn finds_single_star() {
        let mut frame = blank_frame(256, 256, 1000);
        add_gaussian(&mut frame, 100.3, 80.7, 2.0, 20_000.0);

        let stars = find_stars(&frame, 60_000);
        assert_eq!(stars.len(), 1);
        assert!((stars[0].x - 100.3).abs() < 0.5);
        assert!((stars[0].y - 80.7).abs() < 0.5);
    }

    #[test]
    fn fwhm_matches_gaussian_width() {
        let mut frame = blank_frame(256, 256, 1000);
        let sigma = 2.0;
        add_gaussian(&mut frame, 128.0, 128.0, sigma, 20_000.0);

        let stars = find_stars(&frame, 60_000);
        let fwhm = fwhm_at(&frame, &stars[0]).unwrap();
        let expected = 2.3548 * sigma;
        assert!(
            (fwhm - expected).abs() < 1.2,
            "fwhm {fwhm}, expected {expected}"
        );
    }

    #[test]
    fn saturated_star_not_chosen_for_guiding() {
        let mut frame = blank_frame(256, 256, 1000);
        add_gaussian(&mut frame, 64.0, 64.0, 2.0, 70_000.0); // clipped at 65535
        add_gaussian(&mut frame, 180.0, 180.0, 2.0, 15_000.0);

        let star = brightest_guide_star(&frame, 60_000).unwrap();
        assert!((star.x - 180.0).abs() < 1.0);
    }

    #[test]
    fn windowed_search_finds_moved_star() {
        let mut frame = blank_frame(256, 256, 1000);
        add_gaussian(&mut frame, 120.0, 115.0, 2.0, 20_000.0);

        let found = centroid_near(&frame, 117.0, 118.0, 15).unwrap();
        assert!((found.x - 120.0).abs() < 0.5);
        assert!((found.y - 115.0).abs() < 0.5);
    }

    #[test]
    fn windowed_search_misses_empty_region() {
        let frame = blank_frame(256, 256, 1000);
        assert!(centroid_near(&frame, 128.0, 128.0, 15).is_none());
    }

    #[test]
    fn metric_absent_on_blank_frame() {
        let frame = blank_frame(128, 128, 1000);
        assert!(focus_metric(&frame, 60_000).is_none());
    }

    #[test]
    fn metric_present_with_stars() {
        let mut frame = blank_frame(256, 256, 1000);
        add_gaussian(&mut frame, 90.0, 90.0, 2.5, 18_000.0);
        add_gaussian(&mut frame, 170.0, 150.0, 2.5, 16_000.0);

        let metric = focus_metric(&frame, 60_000).unwrap();
        assert!(metric > 3.0 && metric < 9.0, "metric {metric}");
    }
}
