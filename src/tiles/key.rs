//! # Tile Keys
//!
//! Web-Mercator slippy-map addressing: `(lat, lon, zoom)` to `{zoom}/{x}/{y}`.
//!
//! The projection is the standard one:
//!
//! - `x = floor((lon + 180) / 360 * 2^zoom)`
//! - `y = floor((1 - ln(tan(lat) + sec(lat)) / π) / 2 * 2^zoom)`
//!
//! ```
//! use recon_relay::tiles::TileKey;
//!
//! let key = TileKey::from_lat_lon(0.0, 0.0, 1)?;
//! assert_eq!((key.x, key.y), (1, 1));
//! assert_eq!(key.index_key(), "1/1/1");
//! # Ok::<(), recon_relay::error::AgentError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

use crate::error::{AgentError, Result};

/// Highest zoom level accepted.
pub const MAX_ZOOM: u8 = 22;

/// Latitude limit of the Web-Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_78;

/// Address of one map tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    /// Creates a key, checking that `x`/`y` exist at `zoom`.
    pub fn new(zoom: u8, x: u32, y: u32) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(AgentError::InvalidCoordinate(format!(
                "zoom {} exceeds maximum {}",
                zoom, MAX_ZOOM
            )));
        }
        let n = tiles_per_axis(zoom);
        if u64::from(x) >= n || u64::from(y) >= n {
            return Err(AgentError::InvalidCoordinate(format!(
                "tile {}/{}/{} out of range",
                zoom, x, y
            )));
        }
        Ok(Self { zoom, x, y })
    }

    /// Projects a geographic position onto the tile grid at `zoom`.
    ///
    /// Latitude is clamped to the projection limit (±85.0511°), so positions
    /// near the poles land on the outermost row instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::InvalidCoordinate`] for non-finite input,
    /// latitude outside ±90°, longitude outside ±180°, or zoom above [`MAX_ZOOM`].
    pub fn from_lat_lon(lat: f64, lon: f64, zoom: u8) -> Result<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(AgentError::InvalidCoordinate(format!("latitude {}", lat)));
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            return Err(AgentError::InvalidCoordinate(format!("longitude {}", lon)));
        }
        if zoom > MAX_ZOOM {
            return Err(AgentError::InvalidCoordinate(format!(
                "zoom {} exceeds maximum {}",
                zoom, MAX_ZOOM
            )));
        }

        let n = tiles_per_axis(zoom) as f64;
        let max_index = n - 1.0;

        let x = ((lon + 180.0) / 360.0 * n).floor().clamp(0.0, max_index);

        let lat_rad = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
        let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n)
            .floor()
            .clamp(0.0, max_index);

        Ok(Self {
            zoom,
            x: x as u32,
            y: y as u32,
        })
    }

    /// Index key, `"{zoom}/{x}/{y}"`.
    pub fn index_key(&self) -> String {
        format!("{}/{}/{}", self.zoom, self.x, self.y)
    }

    /// Parses an index key produced by [`index_key`](Self::index_key).
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 3 {
            return Err(AgentError::InvalidCoordinate(format!(
                "expected zoom/x/y, got '{}'",
                key
            )));
        }

        let parse_err = |_| AgentError::InvalidCoordinate(format!("malformed tile key '{}'", key));
        Self::new(
            parts[0].parse().map_err(parse_err)?,
            parts[1].parse().map_err(parse_err)?,
            parts[2].parse().map_err(parse_err)?,
        )
    }

    /// Latitude/longitude of the tile's north-west corner.
    pub fn north_west(&self) -> (f64, f64) {
        let n = tiles_per_axis(self.zoom) as f64;
        let lon = f64::from(self.x) / n * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * f64::from(self.y) / n)).sinh().atan().to_degrees();
        (lat, lon)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub x_min: u32,
    pub x_max: u32,
    pub y_min: u32,
    pub y_max: u32,
}

impl TileRange {
    /// Tiles intersecting the box `[min_lat, max_lat] × [min_lon, max_lon]`.
    ///
    /// Box edges are clamped to the valid coordinate range first.
    pub fn covering(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64, zoom: u8) -> Result<Self> {
        let clamp_lat = |v: f64| v.clamp(-90.0, 90.0);
        let clamp_lon = |v: f64| v.clamp(-180.0, 180.0);

        // North-west corner has the smallest y, south-east the largest.
        let nw = TileKey::from_lat_lon(clamp_lat(max_lat), clamp_lon(min_lon), zoom)?;
        let se = TileKey::from_lat_lon(clamp_lat(min_lat), clamp_lon(max_lon), zoom)?;

        Ok(Self {
            zoom,
            x_min: nw.x.min(se.x),
            x_max: nw.x.max(se.x),
            y_min: nw.y.min(se.y),
            y_max: nw.y.max(se.y),
        })
    }

    pub fn tile_count(&self) -> u64 {
        u64::from(self.x_max - self.x_min + 1) * u64::from(self.y_max - self.y_min + 1)
    }

    /// Every tile in the range, row-major.
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        (self.x_min..=self.x_max).flat_map(move |x| {
            (self.y_min..=self.y_max).map(move |y| TileKey {
                zoom: self.zoom,
                x,
                y,
            })
        })
    }
}

fn tiles_per_axis(zoom: u8) -> u64 {
    1u64 << zoom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_at_zoom_one() {
        let key = TileKey::from_lat_lon(0.0, 0.0, 1).unwrap();
        assert_eq!((key.x, key.y), (1, 1));
    }

    #[test]
    fn test_zoom_zero_is_single_tile() {
        for (lat, lon) in [(0.0, 0.0), (80.0, -179.0), (-80.0, 179.9)] {
            let key = TileKey::from_lat_lon(lat, lon, 0).unwrap();
            assert_eq!((key.x, key.y), (0, 0));
        }
    }

    #[test]
    fn test_known_city_tile() {
        // New York City at zoom 16
        let key = TileKey::from_lat_lon(40.7128, -74.0060, 16).unwrap();
        assert_eq!(key.x, 19295);
        assert_eq!(key.y, 24640);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = TileKey::from_lat_lon(51.5074, -0.1278, 15).unwrap();
        let b = TileKey::from_lat_lon(51.5074, -0.1278, 15).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_edges_are_clamped_into_grid() {
        let east = TileKey::from_lat_lon(0.0, 180.0, 3).unwrap();
        assert_eq!(east.x, 7);

        let north = TileKey::from_lat_lon(90.0, 0.0, 3).unwrap();
        assert_eq!(north.y, 0);

        let south = TileKey::from_lat_lon(-90.0, 0.0, 3).unwrap();
        assert_eq!(south.y, 7);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(TileKey::from_lat_lon(f64::NAN, 0.0, 5).is_err());
        assert!(TileKey::from_lat_lon(91.0, 0.0, 5).is_err());
        assert!(TileKey::from_lat_lon(0.0, -181.0, 5).is_err());
        assert!(TileKey::from_lat_lon(0.0, 0.0, MAX_ZOOM + 1).is_err());
    }

    #[test]
    fn test_index_key_parse() {
        let key = TileKey::new(16, 19295, 24640).unwrap();
        assert_eq!(key.index_key(), "16/19295/24640");
        assert_eq!(TileKey::parse("16/19295/24640").unwrap(), key);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(TileKey::parse("16/abc/1").is_err());
        assert!(TileKey::parse("16/1").is_err());
        assert!(TileKey::parse("1/1/1/1").is_err());
        assert!(TileKey::parse("1/2/0").is_err(), "x out of range at zoom 1");
    }

    #[test]
    fn test_north_west_corner_maps_back_to_tile() {
        let key = TileKey::new(10, 301, 384).unwrap();
        let (lat, lon) = key.north_west();
        // Nudge inside the tile to avoid landing on the boundary
        let back = TileKey::from_lat_lon(lat - 1e-6, lon + 1e-6, 10).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_range_covering_small_box() {
        let range = TileRange::covering(51.50, -0.13, 51.51, -0.12, 16).unwrap();
        assert!(range.x_min <= range.x_max);
        assert!(range.y_min <= range.y_max);
        assert_eq!(range.keys().count() as u64, range.tile_count());

        let centre = TileKey::from_lat_lon(51.505, -0.125, 16).unwrap();
        assert!(range.keys().any(|k| k == centre));
    }

    #[test]
    fn test_range_degenerate_box_is_one_tile() {
        let range = TileRange::covering(10.0, 10.0, 10.0, 10.0, 12).unwrap();
        assert_eq!(range.tile_count(), 1);
    }
}
