//! Minimal FITS output
//!
//! Writes 16-bit images in the standard layout: 2880-byte blocks,
//! 80-character header cards, big-endian data with the BZERO = 32768
//! unsigned convention. Reading and the rest of the standard are not
//! needed here.

use crate::drivers::Frame;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const BLOCK: usize = 2880;
const CARD: usize = 80;

fn card(key: &str, value: &str, comment: Option<&str>) -> [u8; CARD] {
    let mut text = format!("{:<8}= {:>20}", key, value);
    if let Some(comment) = comment {
        text.push_str(" / ");
        text.push_str(comment);
    }
    let mut out = [b' '; CARD];
    for (i, b) in text.bytes().take(CARD).enumerate() {
        out[i] = b;
    }
    out
}

fn string_card(key: &str, value: &str) -> [u8; CARD] {
    // Strings are quoted, left-justified, minimum 8 characters
    let quoted = format!("'{:<8}'", value.replace('\'', ""));
    let text = format!("{:<8}= {}", key, quoted);
    let mut out = [b' '; CARD];
    for (i, b) in text.bytes().take(CARD).enumerate() {
        out[i] = b;
    }
    out
}

/// Write a frame to disk as a single-HDU 16-bit FITS file.
pub fn write_frame(
    path: &Path,
    frame: &Frame,
    object: Option<&str>,
    image_type: &str,
) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let mut header: Vec<[u8; CARD]> = Vec::new();
    header.push(card("SIMPLE", "T", Some("conforms to FITS standard")));
    header.push(card("BITPIX", "16", None));
    header.push(card("NAXIS", "2", None));
    header.push(card("NAXIS1", &frame.width.to_string(), None));
    header.push(card("NAXIS2", &frame.height.to_string(), None));
    header.push(card("BZERO", "32768", Some("unsigned 16-bit offset")));
    header.push(card("BSCALE", "1", None));
    header.push(card(
        "EXPTIME",
        &format!("{:.3}", frame.exposure_secs),
        Some("seconds"),
    ));
    header.push(string_card(
        "DATE-OBS",
        &frame.captured_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
    ));
    header.push(string_card("IMAGETYP", image_type));
    if let Some(object) = object {
        header.push(string_card("OBJECT", object));
    }
    if let Some(filter) = &frame.filter {
        header.push(string_card("FILTER", filter));
    }
    let mut end = [b' '; CARD];
    end[..3].copy_from_slice(b"END");
    header.push(end);

    let mut written = 0usize;
    for card in &header {
        writer.write_all(card)?;
        written += CARD;
    }
    while written % BLOCK != 0 {
        writer.write_all(&[b' '; CARD])?;
        written += CARD;
    }

    let mut data_written = 0usize;
    for &value in &frame.data {
        let signed = (value as i32 - 32768) as i16;
        writer.write_all(&signed.to_be_bytes())?;
        data_written += 2;
    }
    let pad = (BLOCK - data_written % BLOCK) % BLOCK;
    writer.write_all(&vec![0u8; pad])?;

    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_frame() -> Frame {
        Frame {
            width: 16,
            height: 16,
            data: vec![1000u16; 256],
            exposure_secs: 30.0,
            filter: Some("R".into()),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn output_is_block_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        write_frame(&path, &test_frame(), Some("M41"), "Light").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() % BLOCK, 0);
        assert!(bytes.starts_with(b"SIMPLE  ="));
    }

    #[test]
    fn data_uses_unsigned_convention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        write_frame(&path, &test_frame(), None, "Light").unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // First data value: 1000 - 32768 = -31768 big-endian
        let first = i16::from_be_bytes([bytes[BLOCK], bytes[BLOCK + 1]]);
        assert_eq!(first, (1000i32 - 32768i32) as i16);
    }
}
