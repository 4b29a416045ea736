use crate::geo::haversine_km;
use crate::models::position::Coordinate;
use crate::models::route::RouteProgress;

pub const DEFAULT_REROUTE_THRESHOLD_KM: f64 = 0.1;

/// Locates `position` along `path`: nearest vertex, fraction of the
/// path passed, remaining path distance, and how far off the path the
/// position sits. Linear in the path length. Empty paths yield None; a
/// one-point path counts as complete.
pub fn route_progress(position: &Coordinate, path: &[Coordinate]) -> Option<RouteProgress> {
    if path.is_empty() {
        return None;
    }

    let mut nearest_index = 0;
    let mut deviation_km = f64::INFINITY;
    for (index, vertex) in path.iter().enumerate() {
        let distance = haversine_km(position, vertex);
        if distance < deviation_km {
            deviation_km = distance;
            nearest_index = index;
        }
    }

    let fraction_complete = if path.len() == 1 {
        1.0
    } else {
        nearest_index as f64 / (path.len() - 1) as f64
    };

    let remaining_km = path
        .windows(2)
        .skip(nearest_index)
        .map(|pair| haversine_km(&pair[0], &pair[1]))
        .sum();

    Some(RouteProgress {
        nearest_index,
        fraction_complete,
        remaining_km,
        deviation_km,
    })
}

pub fn is_off_route(progress: &RouteProgress, threshold_km: f64) -> bool {
    progress.deviation_km > threshold_km
}

#[cfg(test)]
mod tests {
    use super::*;

    // Points every ~200 m along an east-west street in Maputo.
    fn street() -> Vec<Coordinate> {
        (0..6)
            .map(|k| Coordinate::new(-25.9655, 32.5732 + k as f64 * 0.002))
            .collect()
    }

    #[test]
    fn empty_path_has_no_progress() {
        let position = Coordinate::new(-25.9655, 32.5832);
        assert_eq!(route_progress(&position, &[]), None);
    }

    #[test]
    fn single_point_path_counts_as_complete() {
        let point = Coordinate::new(-25.9655, 32.5832);
        let progress = route_progress(&point, &[point]).unwrap();
        assert_eq!(progress.nearest_index, 0);
        assert_eq!(progress.fraction_complete, 1.0);
        assert_eq!(progress.remaining_km, 0.0);
        assert!(progress.deviation_km < 1e-9);
    }

    #[test]
    fn exact_vertex_hit_pins_the_index() {
        let path = street();
        for (k, vertex) in path.iter().enumerate() {
            let progress = route_progress(vertex, &path).unwrap();
            assert_eq!(progress.nearest_index, k);
            assert!(progress.deviation_km < 1e-9);
        }
    }

    #[test]
    fn fraction_is_monotonic_along_an_advancing_track() {
        let path = street();
        let mut fractions = Vec::new();
        let mut remaining = Vec::new();

        // Drive the street with a slight sideways wobble.
        for k in 0..path.len() {
            let position = Coordinate::new(path[k].latitude + 0.0001, path[k].longitude + 0.0003);
            let progress = route_progress(&position, &path).unwrap();
            fractions.push(progress.fraction_complete);
            remaining.push(progress.remaining_km);
        }

        for pair in fractions.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        for pair in remaining.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert_eq!(fractions[fractions.len() - 1], 1.0);
    }

    #[test]
    fn deviation_flags_an_off_route_position() {
        let path = street();
        let on_street = Coordinate::new(-25.9655, 32.5736);
        let two_blocks_off = Coordinate::new(-25.9635, 32.5736);

        let on = route_progress(&on_street, &path).unwrap();
        let off = route_progress(&two_blocks_off, &path).unwrap();

        assert!(!is_off_route(&on, DEFAULT_REROUTE_THRESHOLD_KM));
        assert!(is_off_route(&off, DEFAULT_REROUTE_THRESHOLD_KM));
    }
}
