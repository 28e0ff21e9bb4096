//! Pipeline orchestration: tracker, world map, relocalizer and graph
//! optimizer wired together.
//!
//! One `process_frame` call is an atomic unit of work. The world map sits
//! behind a single write lock held by the foreground pipeline; the graph
//! optimizer solves on its worker thread from a snapshot and its results
//! are applied at the next frame boundary.

use opencv::core::Mat;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::config::{ParameterCollection, TrackerMode};
use crate::error::Result;
use crate::framepoint_generation::make_generator;
use crate::geometry::{Camera, SE3};
use crate::map::WorldMap;
use crate::optimization::{self, GraphOptimizer};
use crate::relocalization::Relocalizer;
use crate::tracking::{Tracker, TrackerOutput, TrackerStatus};

/// Outcome of one frame-processing step.
pub struct FrameReport {
    pub tracker: TrackerOutput,
    pub local_map_created: bool,
    pub closed_loop: bool,
    pub optimization_applied: bool,
}

pub struct SlamSystem {
    parameters: ParameterCollection,
    world_map: RwLock<WorldMap>,
    tracker: Tracker,
    relocalizer: Option<Relocalizer>,
    optimizer: GraphOptimizer,
    frames_since_optimization: usize,
}

impl SlamSystem {
    /// Assemble the pipeline for the configured tracker mode.
    pub fn new(parameters: ParameterCollection, camera: Camera, depth_scale: f64) -> Self {
        let generator = make_generator(
            parameters.command_line.tracker_mode,
            parameters.base_framepoint_generation,
            parameters.stereo_framepoint_generation,
            parameters.depth_framepoint_generation,
            &camera,
            depth_scale,
        );
        let tracker = Tracker::new(
            parameters.tracking,
            camera,
            generator,
            parameters.command_line.option_use_odometry,
        );
        let relocalizer = parameters.command_line.option_use_relocalization.then(|| {
            Relocalizer::new(
                parameters.relocalization,
                parameters.world_map.local_map.minimum_number_of_landmarks,
            )
        });
        let optimizer = GraphOptimizer::new(parameters.graph_optimization);
        let world_map = RwLock::new(WorldMap::new(parameters.world_map));

        Self {
            parameters,
            world_map,
            tracker,
            relocalizer,
            optimizer,
            frames_since_optimization: 0,
        }
    }

    pub fn tracker_mode(&self) -> TrackerMode {
        self.parameters.command_line.tracker_mode
    }

    /// Read access to the world map (trajectory output, inspection).
    pub fn world_map(&self) -> RwLockReadGuard<'_, WorldMap> {
        self.world_map.read()
    }

    /// Process one acquisition through the full pipeline.
    ///
    /// `right_or_depth` is the right intensity image in stereo mode and the
    /// registered depth image in depth mode. `odometry_delta` feeds the
    /// external prediction model when enabled; `ground_truth` is stored on
    /// the frame for evaluation only.
    pub fn process_frame(
        &mut self,
        left: &Mat,
        right_or_depth: &Mat,
        timestamp_seconds: f64,
        odometry_delta: Option<&SE3>,
        ground_truth: Option<SE3>,
    ) -> Result<FrameReport> {
        let mut world_map = self.world_map.write();

        // Corrections from the worker are integrated at frame boundaries.
        let optimization_applied = match self.optimizer.try_collect_result() {
            Some(result) => {
                optimization::apply(&mut world_map, &result);
                true
            }
            None => false,
        };

        let tracker_output = self.tracker.process(
            &mut world_map,
            left,
            right_or_depth,
            timestamp_seconds,
            odometry_delta,
        )?;
        if let Some(frame) = world_map.frame_mut(tracker_output.frame) {
            frame.robot_to_world_ground_truth = ground_truth;
        }

        let mut local_map_created = false;
        let mut closed_loop = false;
        if tracker_output.status != TrackerStatus::BrokenTrack {
            local_map_created = world_map
                .try_create_local_map(self.parameters.command_line.option_drop_framepoints);

            if local_map_created {
                if let Some(relocalizer) = &self.relocalizer {
                    if let Some(closure) = relocalizer.detect(&world_map)? {
                        world_map.add_loop_closure(
                            closure.query,
                            closure.reference,
                            closure.query_to_reference.clone(),
                            closure.correspondences.clone(),
                            closure.information,
                        );
                        world_map.merge_landmarks(&[closure.correspondences]);
                        closed_loop = true;
                    }
                }
            }
        }

        // Optimize on closure or on the frame cadence.
        self.frames_since_optimization += 1;
        let cadence_due = self.frames_since_optimization
            >= self
                .parameters
                .graph_optimization
                .number_of_frames_per_bundle_adjustment;
        if closed_loop || cadence_due {
            if let Some(problem) = optimization::collect(&world_map, self.optimizer.parameters()) {
                if self.optimizer.request(problem) {
                    self.frames_since_optimization = 0;
                }
            }
        }

        Ok(FrameReport {
            tracker: tracker_output,
            local_map_created,
            closed_loop,
            optimization_applied,
        })
    }

    /// Finish the in-flight optimization (if any) and stop the worker.
    pub fn shutdown(&mut self) {
        if let Some(result) = self.optimizer.wait_for_result() {
            let mut world_map = self.world_map.write();
            optimization::apply(&mut world_map, &result);
        }
        self.optimizer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterCollection;

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

    #[test]
    fn test_system_survives_empty_frames() {
        // Blank images produce no keypoints; the pipeline must keep running
        // in localizing state rather than fail.
        let mut system = SlamSystem::new(ParameterCollection::default(), test_camera(), 1.0e-3);
        let blank = Mat::new_rows_cols_with_default(
            480,
            640,
            opencv::core::CV_8UC1,
            opencv::core::Scalar::all(0.0),
        )
        .unwrap();

        for i in 0..3 {
            let report = system
                .process_frame(&blank, &blank, i as f64 * 0.1, None, None)
                .unwrap();
            assert_ne!(report.tracker.status, TrackerStatus::Tracking);
        }
        assert_eq!(system.world_map().num_frames(), 3);
        system.shutdown();
    }
}
