//! Coordinate translation between the uniform pose and native degrees.
//!
//! All functions are pure. Pan maps linearly onto bearing (-1 -> 0 deg,
//! 1 -> 360 deg) and tilt onto elevation (-1 -> -90 deg, 1 -> 90 deg).

use super::types::{NormalizedPose, Position};

pub const MAX_BEARING: f64 = 360.0;
pub const MAX_ELEVATION: f64 = 90.0;
pub const MIN_ZOOM: f64 = 1.0;
pub const DEFAULT_MAX_ZOOM: f64 = 10.0;

/// Degrees moved per unit of relative pan/tilt
pub const DEGREES_PER_UNIT: f64 = 10.0;

pub fn clamp_zoom(zoom: f64, max_zoom: f64) -> f64 {
    zoom.clamp(MIN_ZOOM, max_zoom.max(MIN_ZOOM))
}

/// Clamp a native pose into the device's ranges
pub fn clamp_position(position: Position, max_zoom: f64) -> Position {
    Position {
        bearing: position.bearing.clamp(0.0, MAX_BEARING),
        elevation: position.elevation.clamp(-MAX_ELEVATION, MAX_ELEVATION),
        zoom: clamp_zoom(position.zoom, max_zoom),
    }
}

/// Fold a pose reported by the device into native ranges. Bearing is a
/// heading, so it wraps; elevation and zoom clamp.
pub fn normalize_reported(position: Position, max_zoom: f64) -> Position {
    Position {
        bearing: position.bearing.rem_euclid(MAX_BEARING),
        ..clamp_position(position, max_zoom)
    }
}

/// Uniform pose to native pose. Out-of-range input clamps, never wraps.
pub fn to_native(pose: NormalizedPose, max_zoom: f64) -> Position {
    clamp_position(
        Position {
            bearing: ((pose.pan + 1.0) / 2.0) * MAX_BEARING,
            elevation: pose.tilt * MAX_ELEVATION,
            zoom: pose.zoom,
        },
        max_zoom,
    )
}

/// Native pose back to the uniform pose
pub fn to_normalized(position: Position) -> NormalizedPose {
    NormalizedPose {
        pan: position.bearing / MAX_BEARING * 2.0 - 1.0,
        tilt: position.elevation / MAX_ELEVATION,
        zoom: position.zoom,
    }
}

/// Offset the current native pose by a relative move.
///
/// Bearing wraps around the circle; elevation and zoom clamp.
pub fn offset(current: Position, delta: NormalizedPose, max_zoom: f64) -> Position {
    Position {
        bearing: (current.bearing + delta.pan * DEGREES_PER_UNIT).rem_euclid(MAX_BEARING),
        elevation: (current.elevation + delta.tilt * DEGREES_PER_UNIT)
            .clamp(-MAX_ELEVATION, MAX_ELEVATION),
        zoom: clamp_zoom(current.zoom + delta.zoom, max_zoom),
    }
}

pub fn is_finite(pose: &NormalizedPose) -> bool {
    pose.pan.is_finite() && pose.tilt.is_finite() && pose.zoom.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_round_trip_within_range() {
        let steps = [-1.0, -0.75, -0.5, -0.1, 0.0, 0.1, 0.33, 0.5, 0.999, 1.0];
        for &pan in &steps {
            for &tilt in &steps {
                let native = to_native(NormalizedPose::new(pan, tilt, 3.0), DEFAULT_MAX_ZOOM);
                let back = to_normalized(native);
                assert!(close(back.pan, pan), "pan {pan} came back as {}", back.pan);
                assert!(close(back.tilt, tilt), "tilt {tilt} came back as {}", back.tilt);
                assert!(close(back.zoom, 3.0));
            }
        }
    }

    #[test]
    fn test_out_of_range_clamps() {
        let native = to_native(NormalizedPose::new(0.0, 1.2, 1.0), DEFAULT_MAX_ZOOM);
        assert!(close(native.elevation, 90.0));

        let native = to_native(NormalizedPose::new(1.5, 0.0, 1.0), DEFAULT_MAX_ZOOM);
        assert!(close(native.bearing, 360.0));

        let native = to_native(NormalizedPose::new(-3.0, -2.0, 0.2), DEFAULT_MAX_ZOOM);
        assert!(close(native.bearing, 0.0));
        assert!(close(native.elevation, -90.0));
        assert!(close(native.zoom, 1.0));

        let native = to_native(NormalizedPose::new(0.0, 0.0, 40.0), 20.0);
        assert!(close(native.zoom, 20.0));
    }

    #[test]
    fn test_known_points() {
        let native = to_native(NormalizedPose::new(0.5, 0.0, 2.0), DEFAULT_MAX_ZOOM);
        assert!(close(native.bearing, 270.0));
        assert!(close(native.elevation, 0.0));
        assert!(close(native.zoom, 2.0));

        let native = to_native(NormalizedPose::new(-0.25, 0.1, 1.0), DEFAULT_MAX_ZOOM);
        assert!(close(native.bearing, 135.0));
        assert!(close(native.elevation, 9.0));
    }

    #[test]
    fn test_offset_wraps_bearing_and_clamps_elevation() {
        let current = Position {
            bearing: 5.0,
            elevation: 85.0,
            zoom: 9.5,
        };

        let next = offset(current, NormalizedPose::new(-1.0, 1.0, 2.0), DEFAULT_MAX_ZOOM);
        assert!(close(next.bearing, 355.0));
        assert!(close(next.elevation, 90.0));
        assert!(close(next.zoom, 10.0));

        let next = offset(
            Position {
                bearing: 355.0,
                ..current
            },
            NormalizedPose::new(1.5, -0.5, -20.0),
            DEFAULT_MAX_ZOOM,
        );
        assert!(close(next.bearing, 10.0));
        assert!(close(next.elevation, 80.0));
        assert!(close(next.zoom, 1.0));
    }

    #[test]
    fn test_reported_bearing_wraps() {
        let reported = |bearing: f64| {
            normalize_reported(
                Position {
                    bearing,
                    elevation: -120.0,
                    zoom: 50.0,
                },
                DEFAULT_MAX_ZOOM,
            )
        };

        let west = reported(-10.0);
        assert!(close(west.bearing, 350.0));
        assert!(close(west.elevation, -90.0));
        assert!(close(west.zoom, DEFAULT_MAX_ZOOM));

        assert!(close(reported(370.0).bearing, 10.0));
        assert!(close(reported(360.0).bearing, 0.0));
        assert!(close(reported(123.5).bearing, 123.5));
    }

    #[test]
    fn test_finite_check() {
        assert!(is_finite(&NormalizedPose::new(0.0, 0.0, 1.0)));
        assert!(!is_finite(&NormalizedPose::new(f64::NAN, 0.0, 1.0)));
        assert!(!is_finite(&NormalizedPose::new(0.0, f64::INFINITY, 1.0)));
    }
}
