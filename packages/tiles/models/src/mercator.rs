//! Web Mercator helpers in normalized `[0, 1]` world units.
//!
//! `x` grows eastward from the antimeridian, `y` grows southward from the
//! top of the projection. A tile `(z, x, y)` covers
//! `[x / 2^z, (x + 1) / 2^z)` on each axis.

use std::f64::consts::PI;

/// Latitude limit of the Web Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Projects a longitude to normalized mercator `x`.
#[must_use]
pub fn lon_to_x(lon: f64) -> f64 {
    lon / 360.0 + 0.5
}

/// Projects a latitude to normalized mercator `y`, clamped to `[0, 1]`.
#[must_use]
pub fn lat_to_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - 0.25 * ((1.0 + sin) / (1.0 - sin)).ln() / PI;
    y.clamp(0.0, 1.0)
}

/// Inverse of [`lon_to_x`].
#[must_use]
pub fn x_to_lon(x: f64) -> f64 {
    (x - 0.5) * 360.0
}

/// Inverse of [`lat_to_y`].
#[must_use]
pub fn y_to_lat(y: f64) -> f64 {
    let y2 = (180.0 - y * 360.0) * PI / 180.0;
    360.0 * y2.exp().atan() / PI - 90.0
}

/// Number of tiles along one axis at `zoom`.
#[must_use]
pub fn tiles_per_axis(zoom: u8) -> f64 {
    f64::from(1u32 << zoom.min(31))
}

/// Tile column containing longitude `lon` at `zoom`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> u32 {
    let n = tiles_per_axis(zoom);
    (lon_to_x(lon) * n).floor().clamp(0.0, n - 1.0) as u32
}

/// Tile row containing latitude `lat` at `zoom`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> u32 {
    let n = tiles_per_axis(zoom);
    (lat_to_y(lat) * n).floor().clamp(0.0, n - 1.0) as u32
}
