//! Core race finish-time estimation library for running telemetry streams.
//!
//! The pipeline is consumed one sample at a time: the anomaly detector in
//! [`detector`] decides whether a prediction may be shown for the current
//! `(elapsed_time, distance)` pair, and the projector in [`projector`] turns a
//! sane pair into a remaining-distance time estimate. Decoding FIT/GPX files
//! into [`TelemetrySample`] sequences lives here as a thin adapter.

pub mod detector;
pub mod projector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstError {
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
}

/// Fastest plausible pace in seconds per meter (~33 m/s sprint ceiling).
pub const MIN_REASONABLE_PACE: f64 = 0.05;
/// Slowest plausible pace in seconds per meter (near stationary).
pub const MAX_REASONABLE_PACE: f64 = 20.0;
/// Minimum cumulative distance before a projection is meaningful.
pub const MIN_PREDICTION_DISTANCE_M: f64 = 100.0;
/// Default projection target (5K).
pub const DEFAULT_TARGET_DISTANCE_M: f64 = 5000.0;

/// Whether a pace value lies within physiological bounds.
///
/// This is the sample validator: it runs before any stateful anomaly logic,
/// and an out-of-bounds pace must not mutate detector state.
pub fn pace_is_sane(pace_s_per_m: f64) -> bool {
    (MIN_REASONABLE_PACE..=MAX_REASONABLE_PACE).contains(&pace_s_per_m)
}

/// One decoded observation from the sensor stream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Milliseconds since activity start.
    pub elapsed_ms: u64,
    /// Cumulative distance in meters.
    pub distance_m: f64,
}

impl TelemetrySample {
    pub fn new(elapsed_ms: u64, distance_m: f64) -> Self {
        Self {
            elapsed_ms,
            distance_m,
        }
    }

    pub fn elapsed_s(&self) -> f64 {
        self.elapsed_ms as f64 / 1000.0
    }

    /// Cumulative average pace in seconds per meter, `None` before any
    /// distance has accumulated.
    pub fn average_pace(&self) -> Option<f64> {
        if self.distance_m > 0.0 {
            Some(self.elapsed_s() / self.distance_m)
        } else {
            None
        }
    }
}

/// Decode FIT or GPX telemetry from bytes using the provided format hint
/// (file extension or bare format name).
pub fn parse_samples(input: &[u8], format: &str) -> Result<Vec<TelemetrySample>, EstError> {
    let format_lc = format.to_ascii_lowercase();
    if format_lc.ends_with(".fit") || format_lc == "fit" {
        parse_fit_samples(input)
    } else if format_lc.ends_with(".gpx") || format_lc == "gpx" {
        parse_gpx_samples(input)
    } else {
        Err(EstError::UnsupportedFormat(format.to_string()))
    }
}

fn parse_fit_samples(input: &[u8]) -> Result<Vec<TelemetrySample>, EstError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;

    let records = from_bytes(input).map_err(|e| EstError::FitParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut t0: Option<DateTime<Utc>> = None;

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut elapsed_ms: Option<u64> = None;
        let mut timestamp_ms: Option<u64> = None;
        let mut distance: Option<f64> = None;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        let utc = ts.with_timezone(&Utc);
                        if t0.is_none() {
                            t0 = Some(utc);
                        }
                        if let Some(base) = t0 {
                            let ms = (utc - base).num_milliseconds().max(0);
                            timestamp_ms = Some(ms as u64);
                        }
                    }
                }
                // Some devices record the activity timer directly (in ms);
                // prefer it over wall-clock deltas when present.
                "timer_time" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        if val >= 0.0 {
                            elapsed_ms = Some(val as u64);
                        }
                    }
                }
                "distance" | "enhanced_distance" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        distance = Some(val);
                    }
                }
                _ => {}
            }
        }
        if let (Some(ms), Some(dist)) = (elapsed_ms.or(timestamp_ms), distance) {
            out.push(TelemetrySample::new(ms, dist));
        }
    }

    Ok(out)
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::UInt8z(v) => Some(*v as f64),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64z(v) => Some(*v as f64),
        fitparser::Value::Byte(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx_samples(input: &[u8]) -> Result<Vec<TelemetrySample>, EstError> {
    use gpx::read;
    use std::io::Cursor;

    let mut cursor = Cursor::new(input);
    let gpx = read(&mut cursor).map_err(|e| EstError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    let mut base: Option<DateTime<Utc>> = None;
    let mut cumulative_m = 0.0;
    let mut last_lat_lon: Option<(f64, f64)> = None;

    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else { continue };
                let iso = time.format().map_err(|e| EstError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| EstError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                if base.is_none() {
                    base = Some(utc);
                }
                let elapsed_ms = base
                    .map(|b| (utc - b).num_milliseconds().max(0) as u64)
                    .unwrap_or(0);

                // GPX rarely records cumulative distance; accumulate it from
                // successive fixes.
                let point_geo = point.point();
                let lat = point_geo.y();
                let lon = point_geo.x();
                if let Some((last_lat, last_lon)) = last_lat_lon {
                    cumulative_m += haversine_distance(last_lat, last_lon, lat, lon);
                }
                last_lat_lon = Some((lat, lon));

                out.push(TelemetrySample::new(elapsed_ms, cumulative_m));
            }
        }
    }
    Ok(out)
}

/// Great-circle distance in meters between two lat/lon fixes.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let r = 6_371_000.0_f64;
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlon = to_rad(lon2 - lon1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    r * c
}
