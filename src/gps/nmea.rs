// src/gps/nmea.rs
//! NMEA sentence parsing

use super::data::FixAccumulator;
use chrono::{NaiveDate, NaiveTime};

/// Sentence body between `$` and `*hh`, if the XOR checksum matches.
///
/// Sentences without a checksum are rejected along with corrupted ones.
pub fn checked_body(line: &str) -> Option<&str> {
    let (body, checksum) = line.trim().strip_prefix('$')?.rsplit_once('*')?;
    if checksum.len() != 2 {
        return None;
    }
    let expected = u8::from_str_radix(checksum, 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected).then_some(body)
}

/// Parse a single NMEA sentence into the accumulator.
///
/// Returns `true` when the sentence carried a position.
pub fn parse_nmea_sentence(acc: &mut FixAccumulator, line: &str) -> bool {
    let Some(body) = checked_body(line) else {
        return false;
    };
    let parts: Vec<&str> = body.split(',').collect();

    match parts.first().map(|tag| tag.get(2..).unwrap_or("")) {
        Some("GGA") => parse_gga(acc, &parts),
        Some("RMC") => parse_rmc(acc, &parts),
        _ => false,
    }
}

/// ddmm.mmmm + hemisphere to signed decimal degrees
fn parse_angle(value: &str, hemisphere: &str, negative: &str) -> Option<f64> {
    if value.is_empty() || hemisphere.is_empty() {
        return None;
    }
    let raw = value.parse::<f64>().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    Some(if hemisphere == negative { -decimal } else { decimal })
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    if value.len() < 6 {
        return None;
    }
    let hour = value.get(0..2)?.parse().ok()?;
    let minute = value.get(2..4)?.parse().ok()?;
    let second: f64 = value.get(4..)?.parse().ok()?;
    let millis = ((second.fract()) * 1000.0).round() as u32;
    NaiveTime::from_hms_milli_opt(hour, minute, second.trunc() as u32, millis)
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 6 {
        return None;
    }
    let day = value.get(0..2)?.parse().ok()?;
    let month = value.get(2..4)?.parse().ok()?;
    let year: i32 = value.get(4..6)?.parse().ok()?;
    let century = if year < 80 { 2000 } else { 1900 };
    NaiveDate::from_ymd_opt(century + year, month, day)
}

/// GGA (Global Positioning System Fix Data)
fn parse_gga(acc: &mut FixAccumulator, parts: &[&str]) -> bool {
    if parts.len() < 10 {
        return false;
    }

    if let Some(time) = parse_time(parts[1]) {
        acc.time = Some(time);
    }

    if let Ok(quality) = parts[6].parse::<u8>() {
        acc.fix_quality = Some(quality);
        acc.valid = quality > 0;
    }

    if let Ok(hdop) = parts[8].parse::<f64>() {
        acc.hdop = Some(hdop);
    }

    match (parse_angle(parts[2], parts[3], "S"), parse_angle(parts[4], parts[5], "W")) {
        (Some(lat), Some(lon)) => {
            acc.latitude = Some(lat);
            acc.longitude = Some(lon);
            true
        }
        _ => false,
    }
}

/// RMC (Recommended Minimum Specific GNSS Data)
fn parse_rmc(acc: &mut FixAccumulator, parts: &[&str]) -> bool {
    if parts.len() < 10 {
        return false;
    }

    if let Some(time) = parse_time(parts[1]) {
        acc.time = Some(time);
    }
    if let Some(date) = parse_date(parts[9]) {
        acc.date = Some(date);
    }

    acc.valid = parts[2] == "A";

    if let Ok(knots) = parts[7].parse::<f64>() {
        acc.speed_kmh = Some(knots * 1.852);
    }

    match (parse_angle(parts[3], parts[4], "S"), parse_angle(parts[5], parts[6], "W")) {
        (Some(lat), Some(lon)) => {
            acc.latitude = Some(lat);
            acc.longitude = Some(lon);
            true
        }
        _ => false,
    }
}
