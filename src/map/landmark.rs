//! Landmark - a persistent 3D point aggregated across observations.

use std::collections::HashSet;

use nalgebra::Vector3;
use opencv::core::Mat;

use crate::config::LandmarkParameters;

use super::types::{FramePointRef, LandmarkId, LocalMapId};

/// A 3D world point observed by many frames through linked FramePoints.
///
/// The position is a running average over all observations, weighted by
/// inverse depth variance so that close-range measurements dominate. A
/// measurement that disagrees with the average by more than
/// `maximum_translation_error_to_depth_ratio` of its depth either forces the
/// position (inside the initial grace period) or invalidates the landmark.
pub struct Landmark {
    id: LandmarkId,

    pub world_coordinates: Vector3<f64>,

    /// Representative descriptor, refreshed with the latest observation.
    pub descriptor: Mat,

    /// Every FramePoint that observes this landmark.
    pub observations: Vec<FramePointRef>,

    /// Local maps this landmark appears in.
    pub local_maps: HashSet<LocalMapId>,

    pub number_of_updates: usize,
    pub number_of_forced_updates: usize,
    pub number_of_recoveries: usize,

    /// Cleared when the position guard trips after the grace period.
    is_valid: bool,

    /// Accumulated inverse-depth-variance weight of the running average.
    total_weight: f64,
}

impl Landmark {
    pub fn new(
        id: LandmarkId,
        world_coordinates: Vector3<f64>,
        descriptor: Mat,
        origin: FramePointRef,
    ) -> Self {
        Self {
            id,
            world_coordinates,
            descriptor,
            observations: vec![origin],
            local_maps: HashSet::new(),
            number_of_updates: 0,
            number_of_forced_updates: 0,
            number_of_recoveries: 0,
            is_valid: true,
            total_weight: 0.0,
        }
    }

    pub fn id(&self) -> LandmarkId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn set_invalid(&mut self) {
        self.is_valid = false;
    }

    pub fn add_observation(&mut self, observation: FramePointRef) {
        self.observations.push(observation);
    }

    /// Integrate a new world-coordinate measurement.
    ///
    /// Returns false when the measurement tripped the translation guard and
    /// the landmark was invalidated.
    pub fn update(
        &mut self,
        world_measurement: Vector3<f64>,
        depth_meters: f64,
        parameters: &LandmarkParameters,
    ) -> bool {
        let depth = depth_meters.max(1e-3);
        let weight = 1.0 / (depth * depth);
        let translation_error = (world_measurement - self.world_coordinates).norm();

        if translation_error / depth > parameters.maximum_translation_error_to_depth_ratio {
            if self.number_of_forced_updates < parameters.minimum_number_of_forced_updates {
                // Initial jitter: take the measurement as the new position.
                self.world_coordinates = world_measurement;
                self.total_weight = weight;
                self.number_of_forced_updates += 1;
                self.number_of_updates += 1;
                return true;
            }
            self.is_valid = false;
            return false;
        }

        self.world_coordinates = (self.total_weight * self.world_coordinates
            + weight * world_measurement)
            / (self.total_weight + weight);
        self.total_weight += weight;
        self.number_of_updates += 1;
        self.is_valid = true;
        true
    }

    /// Absorb another landmark: its observations, local maps and update
    /// history are transferred here. The absorbed landmark's position is
    /// discarded; the older, longer-established average wins.
    pub fn merge(&mut self, absorbed: Landmark) {
        self.observations.extend(absorbed.observations);
        self.local_maps.extend(absorbed.local_maps);
        self.number_of_updates += absorbed.number_of_updates;
        self.number_of_recoveries += absorbed.number_of_recoveries;
        self.total_weight += absorbed.total_weight;
    }
}

impl std::fmt::Debug for Landmark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landmark")
            .field("id", &self.id)
            .field("world_coordinates", &self.world_coordinates)
            .field("observations", &self.observations.len())
            .field("local_maps", &self.local_maps.len())
            .field("number_of_updates", &self.number_of_updates)
            .field("is_valid", &self.is_valid)
            .finish()
    }
}
