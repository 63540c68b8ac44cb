//! On-disk frame naming and sequence recovery
//!
//! Every image is uniquely named by target, exposure time, filter and a
//! monotonically increasing sequence number per (target, filter) pair.
//! Sequence numbers are recovered from existing files at startup so a
//! restarted run continues numbering instead of overwriting.

use std::path::Path;

fn format_exposure(seconds: f64) -> String {
    format!("{:.3}", seconds)
}

/// Filename stem shared by every frame of one (target, exposure, filter)
/// series, e.g. `M41_30.000s_R`.
pub fn science_prefix(target: &str, exposure_secs: f64, filter: &str) -> String {
    format!(
        "{}_{}s_{}",
        target,
        format_exposure(exposure_secs),
        filter.to_uppercase()
    )
}

pub fn flat_prefix(exposure_secs: f64, filter: &str) -> String {
    format!(
        "Flat_{}s_{}",
        format_exposure(exposure_secs),
        filter.to_uppercase()
    )
}

pub fn dark_prefix(exposure_secs: f64) -> String {
    format!("Dark_{}s", format_exposure(exposure_secs))
}

/// `{prefix}-{seq:04}.fits`
pub fn numbered_filename(prefix: &str, sequence: u32) -> String {
    format!("{}-{:04}.fits", prefix, sequence)
}

/// The next free sequence number for a series: strictly one past the
/// highest number already on disk, or 1 in a fresh directory.
pub fn next_sequence(directory: &Path, prefix: &str) -> std::io::Result<u32> {
    if !directory.exists() {
        return Ok(1);
    }
    let lead = format!("{}-", prefix);
    let mut highest = 0u32;
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&lead) else {
            continue;
        };
        let Some(digits) = rest.strip_suffix(".fits") else {
            continue;
        };
        if let Ok(seq) = digits.parse::<u32>() {
            highest = highest.max(seq);
        }
    }
    Ok(highest + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn science_names_match_convention() {
        let prefix = science_prefix("M41", 30.0, "r");
        assert_eq!(numbered_filename(&prefix, 1), "M41_30.000s_R-0001.fits");
        assert_eq!(numbered_filename(&prefix, 123), "M41_30.000s_R-0123.fits");
    }

    #[test]
    fn fresh_directory_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let seq = next_sequence(dir.path(), &science_prefix("M41", 30.0, "r")).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn numbering_continues_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = science_prefix("M41", 30.0, "r");
        for seq in [1u32, 2, 3] {
            std::fs::write(dir.path().join(numbered_filename(&prefix, seq)), b"").unwrap();
        }
        assert_eq!(next_sequence(dir.path(), &prefix).unwrap(), 4);
    }

    #[test]
    fn series_are_independent_per_filter() {
        let dir = tempfile::tempdir().unwrap();
        let red = science_prefix("M41", 30.0, "r");
        let green = science_prefix("M41", 30.0, "g");
        std::fs::write(dir.path().join(numbered_filename(&red, 7)), b"").unwrap();
        assert_eq!(next_sequence(dir.path(), &red).unwrap(), 8);
        assert_eq!(next_sequence(dir.path(), &green).unwrap(), 1);
    }

    #[test]
    fn gaps_do_not_cause_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dark_prefix(30.0);
        std::fs::write(dir.path().join(numbered_filename(&prefix, 2)), b"").unwrap();
        std::fs::write(dir.path().join(numbered_filename(&prefix, 9)), b"").unwrap();
        assert_eq!(next_sequence(dir.path(), &prefix).unwrap(), 10);
    }
}
