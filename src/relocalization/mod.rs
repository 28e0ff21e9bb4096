//! Loop-closure detection over local maps.
//!
//! The newest local map is matched against historical ones, skipping the
//! most recent to avoid trivial matches. Appearance descriptors vote for
//! landmark correspondences; surviving pairs are geometrically verified
//! with the same iterative alignment the tracker uses, on 3D-3D landmark
//! positions in local-map coordinates.

use std::collections::HashMap;

use nalgebra::Vector3;
use opencv::prelude::*;
use tracing::{debug, info};

use crate::config::RelocalizationParameters;
use crate::error::Result;
use crate::framepoint_generation::descriptor_distance;
use crate::geometry::SE3;
use crate::map::{LandmarkCorrespondence, LandmarkId, LocalMap, LocalMapId, WorldMap};
use crate::tracking::aligner;

/// A verified loop closure, ready for [`WorldMap::add_loop_closure`].
pub struct Closure {
    pub query: LocalMapId,
    pub reference: LocalMapId,
    pub query_to_reference: SE3,
    pub correspondences: Vec<LandmarkCorrespondence>,
    pub information: f64,
}

pub struct Relocalizer {
    parameters: RelocalizationParameters,
    /// Local maps with fewer landmarks are not worth querying.
    minimum_landmarks: usize,
}

impl Relocalizer {
    pub fn new(parameters: RelocalizationParameters, minimum_landmarks: usize) -> Self {
        Self {
            parameters,
            minimum_landmarks,
        }
    }

    /// Search historical local maps for a loop closure with the current one.
    ///
    /// A miss is silent: no state is mutated and `None` is returned.
    pub fn detect(&self, world_map: &WorldMap) -> Result<Option<Closure>> {
        let Some(query_id) = world_map.current_local_map_id() else {
            return Ok(None);
        };
        let Some(query) = world_map.local_map(query_id) else {
            return Ok(None);
        };
        if query.landmarks.len() < self.minimum_landmarks {
            return Ok(None);
        }

        // Skip the query itself plus the most recent local maps.
        let order = world_map.local_maps_in_order();
        let Some(query_position) = order.iter().position(|id| *id == query_id) else {
            return Ok(None);
        };
        let horizon = query_position
            .saturating_sub(self.parameters.preliminary_minimum_interspace_queries);

        let mut best: Option<Closure> = None;
        for reference_id in &order[..horizon] {
            let Some(reference) = world_map.local_map(*reference_id) else {
                continue;
            };
            if reference.landmarks.len() < self.minimum_landmarks {
                continue;
            }
            let Some(closure) = self.match_and_verify(query, reference)? else {
                continue;
            };
            let stronger = best
                .as_ref()
                .map_or(true, |current| closure.information > current.information);
            if stronger {
                best = Some(closure);
            }
        }

        if let Some(closure) = &best {
            info!(
                query = %closure.query,
                reference = %closure.reference,
                correspondences = closure.correspondences.len(),
                "loop closure detected"
            );
        }
        Ok(best)
    }

    /// Appearance matching followed by geometric verification against one
    /// reference local map.
    fn match_and_verify(&self, query: &LocalMap, reference: &LocalMap) -> Result<Option<Closure>> {
        let mut total_appearances = 0usize;
        let mut matched_appearances = 0usize;
        let mut votes: HashMap<(LandmarkId, LandmarkId), usize> = HashMap::new();

        for query_entry in &query.landmarks {
            for query_appearance in &query_entry.appearances {
                if query_appearance.cols() == 0 {
                    continue;
                }
                total_appearances += 1;

                let mut best: Option<(LandmarkId, u32)> = None;
                for reference_entry in &reference.landmarks {
                    for reference_appearance in &reference_entry.appearances {
                        if reference_appearance.cols() == 0 {
                            continue;
                        }
                        let distance =
                            descriptor_distance(query_appearance, 0, reference_appearance, 0)?;
                        if distance > self.parameters.maximum_descriptor_distance {
                            continue;
                        }
                        if best.map_or(true, |(_, best_distance)| distance < best_distance) {
                            best = Some((reference_entry.landmark, distance));
                        }
                    }
                }
                if let Some((reference_landmark, _)) = best {
                    matched_appearances += 1;
                    *votes
                        .entry((query_entry.landmark, reference_landmark))
                        .or_insert(0) += 1;
                }
            }
        }

        // Preliminary appearance-level gate.
        if total_appearances == 0 {
            return Ok(None);
        }
        let matching_ratio = matched_appearances as f64 / total_appearances as f64;
        if matching_ratio < self.parameters.preliminary_minimum_matching_ratio {
            return Ok(None);
        }

        // Landmark-level gate.
        let mut correspondences: Vec<LandmarkCorrespondence> = votes
            .into_iter()
            .filter(|(_, count)| *count >= self.parameters.minimum_number_of_matches_per_landmark)
            .map(|((query_landmark, reference_landmark), count)| LandmarkCorrespondence {
                query: query_landmark,
                reference: reference_landmark,
                matching_count: count,
                is_inlier: false,
            })
            .collect();
        if correspondences.len() < self.parameters.aligner.minimum_number_of_inliers {
            return Ok(None);
        }
        // Deterministic order for the verification mask.
        correspondences.sort_by_key(|c| (c.query, c.reference));

        // Geometric verification in local-map coordinates.
        let pairs: Vec<(Vector3<f64>, Vector3<f64>)> = correspondences
            .iter()
            .filter_map(|correspondence| {
                let query_position = query
                    .landmarks
                    .iter()
                    .find(|entry| entry.landmark == correspondence.query)?
                    .coordinates_in_local_map;
                let reference_position = reference
                    .landmarks
                    .iter()
                    .find(|entry| entry.landmark == correspondence.reference)?
                    .coordinates_in_local_map;
                Some((query_position, reference_position))
            })
            .collect();

        let alignment = aligner::align_points(&self.parameters.aligner, &SE3::identity(), &pairs);
        if !alignment.has_succeeded(&self.parameters.aligner) {
            debug!(
                query = %query.id(),
                reference = %reference.id(),
                "geometric verification rejected closure candidate"
            );
            return Ok(None);
        }

        for (correspondence, inlier) in correspondences
            .iter_mut()
            .zip(alignment.inlier_mask.iter())
        {
            correspondence.is_inlier = *inlier;
        }

        Ok(Some(Closure {
            query: query.id(),
            reference: reference.id(),
            query_to_reference: alignment.world_to_camera,
            correspondences,
            information: alignment.number_of_inliers as f64 * alignment.inlier_ratio,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlignerParameters, WorldMapParameters};
    use crate::geometry::Camera;
    use crate::map::{FramePoint, FramePointRef};
    use nalgebra::Vector3;
    use opencv::core::{KeyPoint, Mat};

    fn test_camera() -> Camera {
        Camera {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            baseline_meters: 0.1,
        }
    }

    fn test_relocalizer() -> Relocalizer {
        Relocalizer::new(
            RelocalizationParameters {
                preliminary_minimum_interspace_queries: 2,
                preliminary_minimum_matching_ratio: 0.2,
                minimum_number_of_matches_per_landmark: 2,
                maximum_descriptor_distance: 10,
                aligner: AlignerParameters {
                    maximum_error_kernel: 1.0,
                    minimum_number_of_inliers: 5,
                    minimum_inlier_ratio: 0.5,
                    error_delta_for_convergence: 1e-6,
                    ..AlignerParameters::default()
                },
            },
            5,
        )
    }

    fn point_descriptor(seed: usize) -> Mat {
        let bytes: Vec<u8> = (0..32).map(|i| (seed * 37 + i * 3) as u8).collect();
        Mat::new_rows_cols_with_data(1, 32, &bytes)
            .unwrap()
            .try_clone()
            .unwrap()
    }

    fn landmark_positions() -> Vec<Vector3<f64>> {
        (0..8)
            .map(|i| Vector3::new((i % 4) as f64 * 0.5 - 0.75, (i / 4) as f64 * 0.4, 3.0 + (i % 3) as f64))
            .collect()
    }

    /// Build a world map in which the same eight landmarks are re-observed
    /// in every frame, producing a sequence of overlapping local maps.
    fn world_map_with_local_maps() -> WorldMap {
        let parameters = WorldMapParameters {
            minimum_number_of_frames_for_local_map: 1,
            ..Default::default()
        };
        let mut map = WorldMap::new(parameters);
        let positions = landmark_positions();

        let mut landmark_ids = Vec::new();
        for frame_index in 0..10usize {
            let frame_id = map.create_frame(SE3::identity(), frame_index as f64, test_camera());
            let points: Vec<FramePoint> = positions
                .iter()
                .enumerate()
                .map(|(seed, position)| {
                    FramePoint::new(
                        KeyPoint::default().unwrap(),
                        None,
                        point_descriptor(seed),
                        None,
                        *position,
                        true,
                    )
                })
                .collect();
            map.frame_mut(frame_id).unwrap().set_points(points);

            if frame_index == 0 {
                for index in 0..positions.len() {
                    landmark_ids.push(
                        map.create_landmark(FramePointRef {
                            frame: frame_id,
                            index,
                        })
                        .unwrap(),
                    );
                }
            } else {
                let frame = map.frame_mut(frame_id).unwrap();
                for (index, landmark_id) in landmark_ids.iter().enumerate() {
                    frame.points_mut()[index].landmark = Some(*landmark_id);
                }
            }
            map.try_create_local_map(false);
        }
        map
    }

    #[test]
    fn test_detects_closure_against_old_local_map() {
        let map = world_map_with_local_maps();
        assert!(map.num_local_maps() >= 4);
        let relocalizer = test_relocalizer();

        let closure = relocalizer.detect(&map).unwrap().expect("closure found");

        assert_eq!(closure.query, map.current_local_map_id().unwrap());
        // The reference must be outside the interspace horizon.
        let order = map.local_maps_in_order();
        let query_position = order.iter().position(|id| *id == closure.query).unwrap();
        let reference_position = order.iter().position(|id| *id == closure.reference).unwrap();
        assert!(query_position - reference_position > 2);
        // Same viewpoint, same landmarks: the relative transform is identity.
        assert!(closure.query_to_reference.translation.norm() < 1e-6);
        assert!(closure.query_to_reference.rotation.angle() < 1e-6);
        assert!(!closure.correspondences.is_empty());
        assert!(closure
            .correspondences
            .iter()
            .all(|correspondence| correspondence.is_inlier));
    }

    #[test]
    fn test_no_closure_without_local_maps() {
        let map = WorldMap::new(WorldMapParameters::default());
        let relocalizer = test_relocalizer();
        assert!(relocalizer.detect(&map).unwrap().is_none());
    }

    #[test]
    fn test_interspace_excludes_recent_local_maps() {
        let map = world_map_with_local_maps();
        let relocalizer = Relocalizer::new(
            RelocalizationParameters {
                // Horizon larger than the number of local maps: nothing to
                // query.
                preliminary_minimum_interspace_queries: 100,
                ..test_relocalizer().parameters
            },
            5,
        );

        assert!(relocalizer.detect(&map).unwrap().is_none());
    }
}
