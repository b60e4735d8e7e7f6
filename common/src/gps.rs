//! Minimal NMEA 0183 decoding for position, satellites and UTC time.

use chrono::{NaiveDate, NaiveTime};

const MAX_SENTENCE_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Latest valid value of each field. A field stays `None` until a sentence
/// carrying a valid value for it has been decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsFix {
    pub location: Option<Location>,
    pub satellites: Option<u32>,
    pub time: Option<NaiveTime>,
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Default)]
pub struct NmeaParser {
    line: Vec<u8>,
    in_sentence: bool,
    fix: GpsFix,
    sentences: u64,
    checksum_errors: u64,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(&self) -> &GpsFix {
        &self.fix
    }

    pub fn sentences(&self) -> u64 {
        self.sentences
    }

    pub fn checksum_errors(&self) -> u64 {
        self.checksum_errors
    }

    /// Feeds one byte. Returns `true` when it completed a sentence that
    /// updated the fix.
    pub fn feed(&mut self, byte: u8) -> bool {
        match byte {
            b'$' => {
                self.line.clear();
                self.in_sentence = true;
                false
            }
            b'\r' | b'\n' => {
                if !self.in_sentence {
                    return false;
                }
                self.in_sentence = false;
                let line = std::mem::take(&mut self.line);
                let applied = self.apply_sentence(&line);
                self.line = line;
                self.line.clear();
                applied
            }
            _ if self.in_sentence => {
                if self.line.len() >= MAX_SENTENCE_LEN {
                    self.in_sentence = false;
                    self.line.clear();
                } else {
                    self.line.push(byte);
                }
                false
            }
            _ => false,
        }
    }

    pub fn feed_all(&mut self, bytes: &[u8]) -> usize {
        bytes.iter().filter(|byte| self.feed(**byte)).count()
    }

    fn apply_sentence(&mut self, line: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(line) else {
            return false;
        };
        let Some(body) = verify_checksum(text) else {
            self.checksum_errors += 1;
            return false;
        };

        let fields: Vec<&str> = body.split(',').collect();
        let kind = fields[0].get(2..).unwrap_or_default();
        let applied = match kind {
            "GGA" => self.apply_gga(&fields),
            "RMC" => self.apply_rmc(&fields),
            _ => false,
        };
        if applied {
            self.sentences += 1;
        }
        applied
    }

    // $xxGGA,time,lat,N,lon,E,quality,sats,hdop,alt,M,...
    fn apply_gga(&mut self, fields: &[&str]) -> bool {
        if fields.len() < 8 {
            return false;
        }

        if let Some(time) = parse_time(fields[1]) {
            self.fix.time = Some(time);
        }
        if let Ok(satellites) = fields[7].parse::<u32>() {
            self.fix.satellites = Some(satellites);
        }
        let has_fix = fields[6].parse::<u8>().is_ok_and(|quality| quality > 0);
        if has_fix {
            if let Some(location) = parse_location(&fields[2..6]) {
                self.fix.location = Some(location);
            }
        }
        true
    }

    // $xxRMC,time,status,lat,N,lon,E,speed,course,date,...
    fn apply_rmc(&mut self, fields: &[&str]) -> bool {
        if fields.len() < 10 {
            return false;
        }

        if let Some(time) = parse_time(fields[1]) {
            self.fix.time = Some(time);
        }
        if let Some(date) = parse_date(fields[9]) {
            self.fix.date = Some(date);
        }
        if fields[2] == "A" {
            if let Some(location) = parse_location(&fields[3..7]) {
                self.fix.location = Some(location);
            }
        }
        true
    }
}

/// Strips the `*hh` suffix and returns the body if the XOR checksum matches.
/// A sentence without a checksum is rejected.
fn verify_checksum(text: &str) -> Option<&str> {
    let (body, checksum) = text.split_once('*')?;
    let expected = u8::from_str_radix(checksum.trim(), 16).ok()?;
    let actual = body.bytes().fold(0_u8, |acc, byte| acc ^ byte);
    (actual == expected).then_some(body)
}

fn parse_time(field: &str) -> Option<NaiveTime> {
    if field.len() < 6 {
        return None;
    }
    let hour = field.get(0..2)?.parse().ok()?;
    let minute = field.get(2..4)?.parse().ok()?;
    let second = field.get(4..6)?.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn parse_date(field: &str) -> Option<NaiveDate> {
    if field.len() != 6 {
        return None;
    }
    let day = field.get(0..2)?.parse().ok()?;
    let month = field.get(2..4)?.parse().ok()?;
    let year: i32 = field.get(4..6)?.parse().ok()?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
}

/// `[lat, N|S, lon, E|W]` in `(d)ddmm.mmmm` notation.
fn parse_location(fields: &[&str]) -> Option<Location> {
    let latitude = parse_coordinate(fields[0], fields[1], 'N', 'S')?;
    let longitude = parse_coordinate(fields[2], fields[3], 'E', 'W')?;
    Some(Location {
        latitude,
        longitude,
    })
}

fn parse_coordinate(value: &str, hemisphere: &str, positive: char, negative: char) -> Option<f64> {
    if !value.bytes().all(|byte| byte.is_ascii_digit() || byte == b'.') {
        return None;
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return None;
    }
    let degrees: f64 = value[..dot - 2].parse().ok()?;
    let minutes: f64 = value[dot - 2..].parse().ok()?;
    let decimal = degrees + minutes / 60.0;

    match hemisphere.chars().next()? {
        c if c == positive => Some(decimal),
        c if c == negative => Some(-decimal),
        _ => None,
    }
}
