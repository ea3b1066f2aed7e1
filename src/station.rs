//! HF time-standard station tables.
//!
//! Frequencies, tone schedules, and transmitter locations for WWV
//! (Fort Collins), WWVH (Kauai) and CHU (Ottawa), plus the geographic
//! time-of-arrival model used when a BCD correlation yields only one peak.

use serde::{Deserialize, Serialize};

/// Speed of light in km/ms
const C_KM_PER_MS: f64 = 299.792458;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Station {
    Wwv,
    Wwvh,
    Chu,
}

impl Station {
    /// Minute-mark tone frequency in Hz
    pub fn minute_tone_hz(&self) -> f64 {
        match self {
            Station::Wwv => 1000.0,
            Station::Wwvh => 1200.0,
            Station::Chu => 1000.0,
        }
    }

    /// Minute-mark tone duration in seconds
    pub fn minute_tone_secs(&self) -> f64 {
        match self {
            Station::Wwv => 0.8,
            Station::Wwvh => 0.8,
            Station::Chu => 0.5,
        }
    }

    /// Per-second marker tick frequency in Hz
    pub fn tick_hz(&self) -> f64 {
        match self {
            Station::Wwv => 1000.0,
            Station::Wwvh => 1200.0,
            Station::Chu => 1000.0,
        }
    }

    /// Transmitter location (latitude, longitude) in degrees
    pub fn location(&self) -> (f64, f64) {
        match self {
            Station::Wwv => (40.6776, -105.0461),
            Station::Wwvh => (21.9872, -159.7631),
            Station::Chu => (45.2945, -75.7569),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Station::Wwv => "WWV",
            Station::Wwvh => "WWVH",
            Station::Chu => "CHU",
        }
    }
}

/// Minute of the hour during which WWVH transmits its 440 Hz station ID
pub const WWVH_440_MINUTE: u32 = 1;
/// Minute of the hour during which WWV transmits its 440 Hz station ID
pub const WWV_440_MINUTE: u32 = 2;

/// Seconds of the minute on which the station is silent (no tick)
pub const SILENT_SECONDS: [u32; 2] = [29, 59];

/// Marker tick duration in seconds (both WWV and WWVH)
pub const TICK_SECS: f64 = 0.005;

/// Great-circle distance between two (lat, lon) points in km
pub fn great_circle_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Geographic time-of-arrival model for one receiver.
///
/// Propagation over an ionospheric hop is longer than the great-circle
/// ground distance; the model widens its uncertainty rather than trying
/// to reproduce hop geometry.
#[derive(Debug, Clone, Copy)]
pub struct ToaModel {
    /// Receiver location (lat, lon) in degrees
    pub receiver: (f64, f64),
    /// One-sided model uncertainty in ms
    pub sigma_ms: f64,
}

impl ToaModel {
    pub fn new(receiver: (f64, f64)) -> Self {
        Self {
            receiver,
            sigma_ms: 1.5,
        }
    }

    /// Build from a Maidenhead grid square, if one is configured
    pub fn from_grid_square(grid: &str) -> Option<Self> {
        grid_square_to_latlon(grid).map(Self::new)
    }

    /// Modeled propagation delay from a station to the receiver in ms
    pub fn delay_ms(&self, station: Station) -> f64 {
        great_circle_km(station.location(), self.receiver) / C_KM_PER_MS
    }

    /// Modeled differential delay WWVH − WWV in ms
    pub fn differential_delay_ms(&self) -> f64 {
        self.delay_ms(Station::Wwvh) - self.delay_ms(Station::Wwv)
    }

    /// Classify a single observed arrival offset (ms, relative to the
    /// emission-aligned template) as WWV or WWVH.
    ///
    /// Returns `None` when both station ranges contain the observation;
    /// guessing there is worse than abstaining.
    pub fn classify_single_peak(&self, observed_ms: f64) -> Option<Station> {
        let wwv = self.delay_ms(Station::Wwv);
        let wwvh = self.delay_ms(Station::Wwvh);
        let in_wwv = (observed_ms - wwv).abs() <= self.sigma_ms;
        let in_wwvh = (observed_ms - wwvh).abs() <= self.sigma_ms;
        match (in_wwv, in_wwvh) {
            (true, false) => Some(Station::Wwv),
            (false, true) => Some(Station::Wwvh),
            _ => None,
        }
    }
}

/// Decode a Maidenhead grid square (4 or 6 characters) to (lat, lon)
/// at the center of the square.
pub fn grid_square_to_latlon(grid: &str) -> Option<(f64, f64)> {
    let g: Vec<char> = grid.trim().to_uppercase().chars().collect();
    if g.len() < 4 {
        return None;
    }
    let field_lon = (g[0] as i32).checked_sub('A' as i32)?;
    let field_lat = (g[1] as i32).checked_sub('A' as i32)?;
    if !(0..18).contains(&field_lon) || !(0..18).contains(&field_lat) {
        return None;
    }
    let sq_lon = g[2].to_digit(10)? as f64;
    let sq_lat = g[3].to_digit(10)? as f64;

    let mut lon = -180.0 + field_lon as f64 * 20.0 + sq_lon * 2.0;
    let mut lat = -90.0 + field_lat as f64 * 10.0 + sq_lat * 1.0;

    if g.len() >= 6 && g[4].is_ascii_alphabetic() && g[5].is_ascii_alphabetic() {
        let sub_lon = (g[4] as i32 - 'A' as i32) as f64;
        let sub_lat = (g[5] as i32 - 'A' as i32) as f64;
        lon += sub_lon * 2.0 / 24.0 + 1.0 / 24.0;
        lat += sub_lat * 1.0 / 24.0 + 0.5 / 24.0;
    } else {
        lon += 1.0;
        lat += 0.5;
    }
    Some((lat, lon))
}
