//! Incremental pose-graph optimization.
//!
//! Three-phase: COLLECT extracts frame poses, landmark positions and edges
//! from the world map; SOLVE runs Levenberg-Marquardt without holding any
//! lock; APPLY writes the optimized values back and re-establishes the
//! local-map transforms. The solve phase can run on a worker thread; the
//! pipeline applies its results at the next frame boundary.

use std::collections::HashMap;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use nalgebra::{DMatrix, DVector, Vector3};
use tracing::{debug, info, warn};

use crate::config::GraphOptimizationParameters;
use crate::geometry::SE3;
use crate::map::{FrameId, LandmarkId, WorldMap};

/// Type of a pose-pose constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// Consecutive frames of a track.
    Temporal,
    /// Loop closure between two keyframes.
    Closure,
}

/// Relative pose constraint between two frame vertices.
#[derive(Debug, Clone)]
pub struct PoseGraphEdge {
    pub from: FrameId,
    pub to: FrameId,
    /// Measured `from⁻¹ ∘ to`.
    pub measurement: SE3,
    pub information: f64,
    pub edge_type: EdgeType,
}

/// A landmark observation from one frame, in camera coordinates.
#[derive(Debug, Clone)]
pub struct LandmarkMeasurement {
    pub frame: FrameId,
    pub landmark: LandmarkId,
    pub camera_coordinates: Vector3<f64>,
    pub information: f64,
}

/// Snapshot of the optimization problem, detached from the world map.
pub struct PoseGraphProblem {
    /// Frame vertices in ascending identifier order; the first is fixed.
    pub frame_vertices: Vec<(FrameId, SE3)>,
    pub landmark_vertices: Vec<(LandmarkId, Vector3<f64>)>,
    pub edges: Vec<PoseGraphEdge>,
    pub measurements: Vec<LandmarkMeasurement>,
}

pub struct PoseGraphResult {
    pub optimized_frames: HashMap<FrameId, SE3>,
    pub optimized_landmarks: HashMap<LandmarkId, Vector3<f64>>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Graph vertex identifier: landmark identifiers are shifted into their own
/// space so frame and landmark vertices never collide.
pub fn landmark_vertex_id(parameters: &GraphOptimizationParameters, landmark: LandmarkId) -> u64 {
    parameters.identifier_space + landmark.0
}

/// PHASE 1: extract the problem from the world map.
pub fn collect(
    world_map: &WorldMap,
    parameters: &GraphOptimizationParameters,
) -> Option<PoseGraphProblem> {
    let frame_ids = world_map.frame_ids_ordered();
    if frame_ids.len() < 2 {
        return None;
    }

    let mut frame_vertices = Vec::with_capacity(frame_ids.len());
    let mut edges = Vec::new();
    for frame_id in &frame_ids {
        let frame = world_map.frame(*frame_id)?;
        frame_vertices.push((*frame_id, frame.robot_to_world().clone()));

        // Temporal edge to the predecessor, when the track links one.
        if let Some(previous_id) = frame.previous {
            if let Some(previous) = world_map.frame(previous_id) {
                edges.push(PoseGraphEdge {
                    from: previous_id,
                    to: *frame_id,
                    measurement: previous.world_to_robot().compose(frame.robot_to_world()),
                    information: parameters.base_information_frame,
                    edge_type: EdgeType::Temporal,
                });
            }
        }
    }

    // Closure edges between the keyframes of the constrained local maps.
    // A local map's coordinate frame is its keyframe's frame, so the
    // closure transform maps directly between keyframe vertices.
    for local_map_id in world_map.local_maps_in_order() {
        let Some(local_map) = world_map.local_map(*local_map_id) else {
            continue;
        };
        for closure in &local_map.closures {
            let Some(reference) = world_map.local_map(closure.reference) else {
                continue;
            };
            edges.push(PoseGraphEdge {
                from: local_map.keyframe,
                to: reference.keyframe,
                measurement: closure.query_to_reference.inverse(),
                information: parameters.base_information_frame * closure.information.max(1.0),
                edge_type: EdgeType::Closure,
            });
        }
    }

    // Landmark vertices and their per-frame measurements. Observations in
    // frames whose points were dropped are skipped.
    let mut landmark_vertices = Vec::new();
    let mut measurements = Vec::new();
    for landmark in world_map.landmarks() {
        if !landmark.is_valid() {
            continue;
        }
        let mut observed = false;
        for observation in &landmark.observations {
            let Some(frame) = world_map.frame(observation.frame) else {
                continue;
            };
            let Some(point) = frame.points().get(observation.index) else {
                continue;
            };
            if point.landmark != Some(landmark.id()) {
                continue;
            }
            observed = true;
            measurements.push(LandmarkMeasurement {
                frame: observation.frame,
                landmark: landmark.id(),
                camera_coordinates: point.camera_coordinates,
                information: 1.0,
            });
        }
        if observed {
            landmark_vertices.push((landmark.id(), landmark.world_coordinates));
        }
    }

    debug!(
        frames = frame_vertices.len(),
        landmarks = landmark_vertices.len(),
        edges = edges.len(),
        measurements = measurements.len(),
        "collected pose graph"
    );
    Some(PoseGraphProblem {
        frame_vertices,
        landmark_vertices,
        edges,
        measurements,
    })
}

/// PHASE 2: Levenberg-Marquardt over poses and landmark positions.
///
/// Poses are parameterized by their 6-vector logarithms, landmarks by their
/// positions; the oldest frame is held fixed. Jacobians are evaluated
/// numerically per edge.
pub fn solve(
    problem: &PoseGraphProblem,
    parameters: &GraphOptimizationParameters,
) -> Option<PoseGraphResult> {
    const MAX_ITERATIONS: usize = 20;
    const PARAM_TOLERANCE: f64 = 1e-8;
    const GRADIENT_TOLERANCE: f64 = 1e-10;

    let n_frames = problem.frame_vertices.len();
    if n_frames < 2 {
        return None;
    }
    let n_landmarks = problem.landmark_vertices.len();
    let n_params = (n_frames - 1) * 6 + n_landmarks * 3;
    if n_params == 0 {
        return None;
    }

    let frame_index: HashMap<FrameId, usize> = problem
        .frame_vertices
        .iter()
        .enumerate()
        .map(|(index, (id, _))| (*id, index))
        .collect();
    let landmark_index: HashMap<LandmarkId, usize> = problem
        .landmark_vertices
        .iter()
        .enumerate()
        .map(|(index, (id, _))| (*id, index))
        .collect();

    // Initial parameter vector.
    let mut params = DVector::<f64>::zeros(n_params);
    for (index, (_, pose)) in problem.frame_vertices.iter().enumerate().skip(1) {
        let tangent = pose.log();
        let offset = (index - 1) * 6;
        for i in 0..6 {
            params[offset + i] = tangent[i];
        }
    }
    let landmark_base = (n_frames - 1) * 6;
    for (index, (_, position)) in problem.landmark_vertices.iter().enumerate() {
        let offset = landmark_base + index * 3;
        params[offset] = position.x;
        params[offset + 1] = position.y;
        params[offset + 2] = position.z;
    }

    let fixed_pose = problem.frame_vertices[0].1.clone();
    let context = SolveContext {
        problem,
        parameters,
        frame_index: &frame_index,
        landmark_index: &landmark_index,
        fixed_pose: &fixed_pose,
        landmark_base,
    };

    let initial_error = context.residuals(&params).norm_squared();
    let mut current_params = params;
    let mut lambda = 1e-3;
    let mut iterations = 0;

    for iteration in 0..MAX_ITERATIONS {
        iterations = iteration + 1;

        let residuals = context.residuals(&current_params);
        let jacobian = context.jacobian(&current_params);
        let current_error = residuals.norm_squared();

        let gradient = jacobian.transpose() * &residuals;
        if gradient.norm() < GRADIENT_TOLERANCE {
            break;
        }
        let mut damped = jacobian.transpose() * &jacobian;
        for i in 0..n_params {
            damped[(i, i)] += lambda * damped[(i, i)].max(1e-6);
        }

        let Some(delta) = damped.lu().solve(&(-&gradient)) else {
            break;
        };
        if delta.norm() < PARAM_TOLERANCE * (current_params.norm() + PARAM_TOLERANCE) {
            break;
        }

        let trial = &current_params + &delta;
        let trial_error = context.residuals(&trial).norm_squared();
        if trial_error < current_error {
            current_params = trial;
            lambda = (lambda * 0.1).max(1e-10);
        } else {
            lambda = (lambda * 10.0).min(1e10);
        }
    }

    let final_error = context.residuals(&current_params).norm_squared();

    let mut optimized_frames = HashMap::new();
    optimized_frames.insert(problem.frame_vertices[0].0, fixed_pose.clone());
    for (index, (frame_id, _)) in problem.frame_vertices.iter().enumerate().skip(1) {
        optimized_frames.insert(*frame_id, context.pose_at(&current_params, index));
    }
    let mut optimized_landmarks = HashMap::new();
    for (index, (landmark_id, _)) in problem.landmark_vertices.iter().enumerate() {
        let offset = landmark_base + index * 3;
        optimized_landmarks.insert(
            *landmark_id,
            Vector3::new(
                current_params[offset],
                current_params[offset + 1],
                current_params[offset + 2],
            ),
        );
    }

    info!(
        iterations,
        initial_error = initial_error.sqrt(),
        final_error = final_error.sqrt(),
        "pose graph optimized"
    );
    Some(PoseGraphResult {
        optimized_frames,
        optimized_landmarks,
        iterations,
        initial_error: initial_error.sqrt(),
        final_error: final_error.sqrt(),
    })
}

/// PHASE 3: write optimized values back into the world map.
///
/// Local-map transforms follow their keyframes so that
/// `frame_to_local_map ∘ local_map_to_world = robot_to_world` keeps holding
/// for every member frame.
pub fn apply(world_map: &mut WorldMap, result: &PoseGraphResult) -> usize {
    let mut updated = 0;
    for (frame_id, pose) in &result.optimized_frames {
        if let Some(frame) = world_map.frame_mut(*frame_id) {
            frame.set_robot_to_world(pose.clone());
            updated += 1;
        }
    }
    for (landmark_id, position) in &result.optimized_landmarks {
        if let Some(landmark) = world_map.landmark_mut(*landmark_id) {
            landmark.world_coordinates = *position;
        }
    }

    // Re-anchor local maps on their keyframes.
    let local_map_ids: Vec<_> = world_map.local_maps_in_order().to_vec();
    for local_map_id in local_map_ids {
        let Some(anchor_id) = world_map.local_map(local_map_id).map(|l| l.keyframe) else {
            continue;
        };
        let Some(anchor_pose) = world_map
            .frame(anchor_id)
            .map(|frame| frame.robot_to_world().clone())
        else {
            continue;
        };
        let world_to_local = anchor_pose.inverse();
        if let Some(local_map) = world_map.local_map_mut(local_map_id) {
            local_map.set_local_map_to_world(anchor_pose);
        }
        let member_frames: Vec<_> = world_map
            .local_map(local_map_id)
            .map(|l| l.frames.clone())
            .unwrap_or_default();
        for frame_id in member_frames {
            if let Some(frame) = world_map.frame_mut(frame_id) {
                let frame_to_local_map = world_to_local.compose(frame.robot_to_world());
                frame.set_frame_to_local_map(frame_to_local_map);
            }
        }
    }
    updated
}

/// Internal solve state shared by the residual and Jacobian evaluations.
struct SolveContext<'a> {
    problem: &'a PoseGraphProblem,
    parameters: &'a GraphOptimizationParameters,
    frame_index: &'a HashMap<FrameId, usize>,
    landmark_index: &'a HashMap<LandmarkId, usize>,
    fixed_pose: &'a SE3,
    landmark_base: usize,
}

impl SolveContext<'_> {
    fn pose_at(&self, params: &DVector<f64>, index: usize) -> SE3 {
        if index == 0 {
            return self.fixed_pose.clone();
        }
        let offset = (index - 1) * 6;
        let tangent = nalgebra::Vector6::new(
            params[offset],
            params[offset + 1],
            params[offset + 2],
            params[offset + 3],
            params[offset + 4],
            params[offset + 5],
        );
        SE3::exp(&tangent)
    }

    fn landmark_at(&self, params: &DVector<f64>, index: usize) -> Vector3<f64> {
        let offset = self.landmark_base + index * 3;
        Vector3::new(params[offset], params[offset + 1], params[offset + 2])
    }

    fn residual_count(&self) -> usize {
        self.problem.edges.len() * 6 + self.problem.measurements.len() * 3
    }

    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let mut residuals = DVector::zeros(self.residual_count());
        let mut row = 0;

        for edge in &self.problem.edges {
            let (Some(&from), Some(&to)) = (
                self.frame_index.get(&edge.from),
                self.frame_index.get(&edge.to),
            ) else {
                row += 6;
                continue;
            };
            let pose_from = self.pose_at(params, from);
            let pose_to = self.pose_at(params, to);
            let predicted = pose_from.inverse().compose(&pose_to);
            let error = edge.measurement.inverse().compose(&predicted).log();
            let weight = edge.information.sqrt();
            for i in 0..6 {
                residuals[row + i] = error[i] * weight;
            }
            row += 6;
        }

        for measurement in &self.problem.measurements {
            let (Some(&frame), Some(&landmark)) = (
                self.frame_index.get(&measurement.frame),
                self.landmark_index.get(&measurement.landmark),
            ) else {
                row += 3;
                continue;
            };
            let pose = self.pose_at(params, frame);
            let position = self.landmark_at(params, landmark);
            let error =
                pose.inverse().transform_point(&position) - measurement.camera_coordinates;

            let mut weight = measurement.information.sqrt();
            if self.parameters.enable_robust_kernel_for_landmark_measurements {
                // Huber kernel with a one-meter transition.
                let magnitude = error.norm();
                if magnitude > 1.0 {
                    weight *= (1.0 / magnitude).sqrt();
                }
            }
            for i in 0..3 {
                residuals[row + i] = error[i] * weight;
            }
            row += 3;
        }

        residuals
    }

    /// Central-difference Jacobian, restricted to the parameters each
    /// residual block actually touches.
    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        const EPSILON: f64 = 1e-6;
        let mut jacobian = DMatrix::zeros(self.residual_count(), params.len());

        let mut touched: Vec<Vec<usize>> = Vec::new();
        let mut row_ranges: Vec<(usize, usize)> = Vec::new();
        let mut row = 0;
        for edge in &self.problem.edges {
            let mut columns = Vec::new();
            if let Some(&from) = self.frame_index.get(&edge.from) {
                if from > 0 {
                    columns.extend((from - 1) * 6..(from - 1) * 6 + 6);
                }
            }
            if let Some(&to) = self.frame_index.get(&edge.to) {
                if to > 0 {
                    columns.extend((to - 1) * 6..(to - 1) * 6 + 6);
                }
            }
            touched.push(columns);
            row_ranges.push((row, 6));
            row += 6;
        }
        for measurement in &self.problem.measurements {
            let mut columns = Vec::new();
            if let Some(&frame) = self.frame_index.get(&measurement.frame) {
                if frame > 0 {
                    columns.extend((frame - 1) * 6..(frame - 1) * 6 + 6);
                }
            }
            if let Some(&landmark) = self.landmark_index.get(&measurement.landmark) {
                let offset = self.landmark_base + landmark * 3;
                columns.extend(offset..offset + 3);
            }
            touched.push(columns);
            row_ranges.push((row, 3));
            row += 3;
        }

        let mut perturbed = params.clone();
        for (block, columns) in touched.iter().enumerate() {
            let (row_start, rows) = row_ranges[block];
            for &column in columns {
                perturbed[column] += EPSILON;
                let plus = self.residuals(&perturbed);
                perturbed[column] = params[column] - EPSILON;
                let minus = self.residuals(&perturbed);
                perturbed[column] = params[column];

                for r in 0..rows {
                    jacobian[(row_start + r, column)] =
                        (plus[row_start + r] - minus[row_start + r]) / (2.0 * EPSILON);
                }
            }
        }
        jacobian
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Worker thread
// ─────────────────────────────────────────────────────────────────────────

/// Runs the solve phase on a worker thread. The pipeline submits snapshots
/// and applies finished results at the next frame boundary.
pub struct GraphOptimizer {
    parameters: GraphOptimizationParameters,
    request_sender: Option<Sender<PoseGraphProblem>>,
    result_receiver: Receiver<PoseGraphResult>,
    worker: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl GraphOptimizer {
    pub fn new(parameters: GraphOptimizationParameters) -> Self {
        let (request_sender, request_receiver) = unbounded::<PoseGraphProblem>();
        let (result_sender, result_receiver) = unbounded::<PoseGraphResult>();
        let worker_parameters = parameters;
        let worker = std::thread::spawn(move || {
            while let Ok(problem) = request_receiver.recv() {
                if let Some(result) = solve(&problem, &worker_parameters) {
                    if result_sender.send(result).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            parameters,
            request_sender: Some(request_sender),
            result_receiver,
            worker: Some(worker),
            in_flight: false,
        }
    }

    pub fn parameters(&self) -> &GraphOptimizationParameters {
        &self.parameters
    }

    /// Submit a snapshot for optimization. Refused while a previous request
    /// is still being solved.
    pub fn request(&mut self, problem: PoseGraphProblem) -> bool {
        if self.in_flight {
            return false;
        }
        match &self.request_sender {
            Some(sender) if sender.send(problem).is_ok() => {
                self.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Fetch a finished result without blocking.
    pub fn try_collect_result(&mut self) -> Option<PoseGraphResult> {
        match self.result_receiver.try_recv() {
            Ok(result) => {
                self.in_flight = false;
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                warn!("graph optimizer worker terminated");
                self.in_flight = false;
                None
            }
        }
    }

    /// Block until the in-flight request (if any) finishes.
    pub fn wait_for_result(&mut self) -> Option<PoseGraphResult> {
        if !self.in_flight {
            return None;
        }
        match self.result_receiver.recv() {
            Ok(result) => {
                self.in_flight = false;
                Some(result)
            }
            Err(_) => None,
        }
    }

    pub fn shutdown(&mut self) {
        self.request_sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for GraphOptimizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldMapParameters;
    use crate::geometry::Camera;

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

    fn test_parameters() -> GraphOptimizationParameters {
        GraphOptimizationParameters {
            identifier_space: 1_000_000,
            number_of_frames_per_bundle_adjustment: 100,
            base_information_frame: 1.0,
            enable_robust_kernel_for_landmark_measurements: false,
        }
    }

    fn pose_at(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    fn chain_problem() -> PoseGraphProblem {
        // Three frames; temporal measurements say 1 m apart, but the last
        // pose drifted to 2.4 m and a strong closure pins it near 2.0 m.
        let frame_vertices = vec![
            (FrameId::new(0), pose_at(0.0)),
            (FrameId::new(1), pose_at(1.0)),
            (FrameId::new(2), pose_at(2.4)),
        ];
        let edges = vec![
            PoseGraphEdge {
                from: FrameId::new(0),
                to: FrameId::new(1),
                measurement: pose_at(1.0),
                information: 1.0,
                edge_type: EdgeType::Temporal,
            },
            PoseGraphEdge {
                from: FrameId::new(1),
                to: FrameId::new(2),
                measurement: pose_at(1.0),
                information: 1.0,
                edge_type: EdgeType::Temporal,
            },
            PoseGraphEdge {
                from: FrameId::new(0),
                to: FrameId::new(2),
                measurement: pose_at(2.0),
                information: 100.0,
                edge_type: EdgeType::Closure,
            },
        ];
        PoseGraphProblem {
            frame_vertices,
            landmark_vertices: Vec::new(),
            edges,
            measurements: Vec::new(),
        }
    }

    #[test]
    fn test_solve_reduces_error_and_respects_closure() {
        let result = solve(&chain_problem(), &test_parameters()).unwrap();

        assert!(result.final_error < result.initial_error);
        let optimized = &result.optimized_frames[&FrameId::new(2)];
        // The strong closure dominates: the last pose lands near 2.0 m.
        assert!((optimized.translation.x - 2.0).abs() < 0.05);
        // The fixed vertex did not move.
        let fixed = &result.optimized_frames[&FrameId::new(0)];
        assert!(fixed.translation.norm() < 1e-12);
    }

    #[test]
    fn test_landmark_vertex_id_is_offset() {
        let parameters = test_parameters();
        assert_eq!(
            landmark_vertex_id(&parameters, LandmarkId::new(7)),
            1_000_007
        );
    }

    #[test]
    fn test_collect_builds_temporal_edges() {
        let mut map = WorldMap::new(WorldMapParameters::default());
        for i in 0..4usize {
            map.create_frame(pose_at(i as f64), i as f64, test_camera());
        }

        let problem = collect(&map, &test_parameters()).unwrap();

        assert_eq!(problem.frame_vertices.len(), 4);
        assert_eq!(problem.edges.len(), 3);
        assert!(problem
            .edges
            .iter()
            .all(|edge| edge.edge_type == EdgeType::Temporal));
        let edge = &problem.edges[0];
        assert!((edge.measurement.translation.x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_collect_needs_two_frames() {
        let mut map = WorldMap::new(WorldMapParameters::default());
        map.create_frame(SE3::identity(), 0.0, test_camera());
        assert!(collect(&map, &test_parameters()).is_none());
    }

    #[test]
    fn test_apply_writes_back_and_reanchors_local_maps() {
        let parameters = WorldMapParameters {
            minimum_number_of_frames_for_local_map: 1,
            ..Default::default()
        };
        let mut map = WorldMap::new(parameters);
        for i in 0..3usize {
            map.create_frame(pose_at(i as f64), i as f64, test_camera());
            map.try_create_local_map(false);
        }
        let local_map_id = map.current_local_map_id().unwrap();

        let problem = collect(&map, &test_parameters()).unwrap();
        let mut result = solve(&problem, &test_parameters()).unwrap();
        // Shift every pose to simulate a correction.
        for pose in result.optimized_frames.values_mut() {
            pose.translation.y += 0.5;
        }

        apply(&mut map, &result);

        // Poses were written back.
        for frame in map.frames() {
            assert!((frame.robot_to_world().translation.y - 0.5).abs() < 1e-9);
        }
        // Invariant: local-map transforms recompose member poses.
        let local_map = map.local_map(local_map_id).unwrap();
        for frame_id in &local_map.frames {
            let frame = map.frame(*frame_id).unwrap();
            let recomposed = local_map
                .local_map_to_world()
                .compose(frame.frame_to_local_map());
            assert!(
                (recomposed.translation - frame.robot_to_world().translation).norm() < 1e-6
            );
        }
    }

    #[test]
    fn test_worker_thread_roundtrip() {
        let mut optimizer = GraphOptimizer::new(test_parameters());

        assert!(optimizer.request(chain_problem()));
        // A second request while one is in flight is refused.
        assert!(!optimizer.request(chain_problem()));

        let result = optimizer.wait_for_result().expect("worker result");
        assert!(result.final_error < result.initial_error);

        optimizer.shutdown();
    }
}
