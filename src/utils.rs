/// Utility functions
use crate::domain::SatellitePattern;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::path::Path;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Check whether a path looks like a rendered satellite image
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Parse a UTC timestamp from `s` by trying multiple formats
pub fn t_pick(s: &str, formats: &[&str]) -> Option<DateTime<Utc>> {
    for fmt in formats {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&ndt));
        }
    }
    None
}

/// Extract the observation time from a local image filename.
///
/// GOES names are `goes16_YYYYMMDD_HHMMSS_*.png`; CDN downloads kept verbatim
/// (`YYYYjjjHHMM_GOES16-ABI-*.jpg`) are accepted too. Generic names may embed
/// `YYYYMMDDTHHMMSS` or `YYYYMMDD_HHMMSS` anywhere.
pub fn timestamp_from_filename(name: &str, satellite: SatellitePattern) -> Option<DateTime<Utc>> {
    let lower = name.to_ascii_lowercase();
    match satellite {
        SatellitePattern::Goes16 | SatellitePattern::Goes18 => {
            let prefix = format!("{}_", satellite.short_name());
            if let Some(rest) = lower.strip_prefix(&prefix) {
                return rest.get(..15).and_then(|s| t_pick(s, &["%Y%m%d_%H%M%S"]));
            }
            let cdn_tag = satellite.cdn_code()?.to_ascii_lowercase();
            if lower.contains(&cdn_tag) {
                return lower
                    .get(..11)
                    .and_then(|s| t_pick(&format!("{}00", s), &["%Y%j%H%M%S"]));
            }
            None
        }
        SatellitePattern::Generic => (0..lower.len()).find_map(|i| {
            lower
                .get(i..i + 15)
                .and_then(|s| t_pick(s, &["%Y%m%dt%H%M%S", "%Y%m%d_%H%M%S"]))
        }),
    }
}
