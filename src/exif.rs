// EXIF extraction for bulk-uploaded media.
//
// When a bulk-uploaded image carries EXIF GPS or DateTime, those override the
// operator-supplied values: the camera was there, the operator was not.

use std::io::{Read, Seek};

use chrono::NaiveDateTime;
use exif::{In, Tag, Value};
use serde_json::Map;

#[derive(Debug, Clone, Default)]
pub struct ExtractedExif {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub datetime: Option<NaiveDateTime>,
    /// All readable tags as strings, stored alongside the record for forensics.
    pub raw: Option<serde_json::Value>,
}

impl ExtractedExif {
    pub fn has_location(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }
}

/// Extract EXIF metadata from an image stream. Missing or unreadable EXIF is
/// not an error — bulk upload proceeds without it.
pub fn extract<R: Read + Seek>(reader: &mut R) -> ExtractedExif {
    let mut buf_reader = std::io::BufReader::new(reader);
    let exif = match exif::Reader::new().read_from_container(&mut buf_reader) {
        Ok(exif) => exif,
        Err(_) => return ExtractedExif::default(),
    };

    let mut result = ExtractedExif::default();

    // Raw dump of everything readable (binary values skipped by display form)
    let mut raw = Map::new();
    for field in exif.fields() {
        if field.ifd_num != In::PRIMARY {
            continue;
        }
        let value = field.display_value().to_string();
        raw.insert(field.tag.to_string(), serde_json::Value::String(value));
    }
    if !raw.is_empty() {
        result.raw = Some(serde_json::Value::Object(raw));
    }

    // DateTimeOriginal is the capture moment; DateTime is a fallback
    let dt_field = exif
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| exif.get_field(Tag::DateTime, In::PRIMARY));
    if let Some(field) = dt_field {
        if let Value::Ascii(ref vecs) = field.value {
            if let Some(bytes) = vecs.first() {
                let text = String::from_utf8_lossy(bytes);
                result.datetime = parse_exif_datetime(&text);
            }
        }
    }

    // GPS coordinates arrive as (degrees, minutes, seconds) rationals plus a
    // hemisphere reference
    result.lat = gps_coord(&exif, Tag::GPSLatitude, Tag::GPSLatitudeRef);
    result.lon = gps_coord(&exif, Tag::GPSLongitude, Tag::GPSLongitudeRef);

    result
}

fn gps_coord(exif: &exif::Exif, coord_tag: Tag, ref_tag: Tag) -> Option<f64> {
    let coord = exif.get_field(coord_tag, In::PRIMARY)?;
    let dms: Vec<f64> = match coord.value {
        Value::Rational(ref rationals) => rationals.iter().map(|r| r.to_f64()).collect(),
        _ => return None,
    };

    let hemisphere = exif.get_field(ref_tag, In::PRIMARY).and_then(|f| {
        if let Value::Ascii(ref vecs) = f.value {
            vecs.first()
                .and_then(|b| b.first())
                .map(|c| *c as char)
        } else {
            None
        }
    })?;

    dms_to_decimal(&dms, hemisphere)
}

/// Convert (degrees, minutes, seconds) plus hemisphere ref to decimal degrees.
pub fn dms_to_decimal(dms: &[f64], hemisphere: char) -> Option<f64> {
    let degrees = *dms.first()?;
    let minutes = dms.get(1).copied().unwrap_or(0.0);
    let seconds = dms.get(2).copied().unwrap_or(0.0);
    let mut dd = degrees + minutes / 60.0 + seconds / 3600.0;
    if hemisphere == 'S' || hemisphere == 'W' {
        dd = -dd;
    }
    Some(dd)
}

/// EXIF datetime format: "YYYY:MM:DD HH:MM:SS"
pub fn parse_exif_datetime(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim().trim_end_matches('\0'), "%Y:%m:%d %H:%M:%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dms_to_decimal_paris() {
        // 48° 51' 23.76" N  ->  48.8566
        let dd = dms_to_decimal(&[48.0, 51.0, 23.76], 'N').unwrap();
        assert!((dd - 48.8566).abs() < 0.0001);
    }

    #[test]
    fn test_dms_southern_hemisphere_negative() {
        let dd = dms_to_decimal(&[33.0, 52.0, 0.0], 'S').unwrap();
        assert!(dd < 0.0);
        assert!((dd + 33.8667).abs() < 0.001);
    }

    #[test]
    fn test_parse_exif_datetime() {
        let dt = parse_exif_datetime("2025:06:15 10:30:00").unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2025-06-15 10:30:00");
        assert!(parse_exif_datetime("garbage").is_none());
    }

    #[test]
    fn test_extract_on_non_image_is_empty() {
        let mut cursor = std::io::Cursor::new(b"definitely not a jpeg".to_vec());
        let exif = extract(&mut cursor);
        assert!(exif.lat.is_none());
        assert!(exif.datetime.is_none());
        assert!(exif.raw.is_none());
    }
}
