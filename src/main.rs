use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{info, warn};

use sparse_vslam::config::{ParameterCollection, TrackerMode, BANNER};
use sparse_vslam::error::SlamError;
use sparse_vslam::geometry::SE3;
use sparse_vslam::io::ImageSequenceDataset;
use sparse_vslam::system::SlamSystem;
use sparse_vslam::tracking::TrackerStatus;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let arguments: Vec<String> = std::env::args().skip(1).collect();
    let parameters = match ParameterCollection::from_command_line(&arguments) {
        Ok(parameters) => parameters,
        Err(SlamError::HelpRequested) => {
            eprintln!("{BANNER}");
            return Ok(());
        }
        Err(error) => {
            eprintln!("{BANNER}");
            return Err(error).context("invalid command line");
        }
    };

    let command_line = &parameters.command_line;
    info!(
        topic_image_left = %command_line.topic_image_left,
        topic_image_right = %command_line.topic_image_right,
        tracker_mode = ?command_line.tracker_mode,
        use_odometry = command_line.option_use_odometry,
        use_relocalization = command_line.option_use_relocalization,
        drop_framepoints = command_line.option_drop_framepoints,
        recover_landmarks = command_line.option_recover_landmarks,
        dataset = %command_line.dataset_file_name,
        "starting"
    );
    if command_line.option_use_gui || command_line.option_show_top_viewer {
        warn!("built without viewers, ignoring GUI options");
    }
    if command_line.option_undistort_and_rectify {
        warn!("undistortion is not applied, input is expected pre-rectified");
    }

    let depth_mode = command_line.tracker_mode == TrackerMode::RgbDepth;
    let dataset = ImageSequenceDataset::open(
        Path::new(&command_line.dataset_file_name),
        &command_line.topic_image_left,
        &command_line.topic_image_right,
        depth_mode,
        command_line.option_equalize_histogram,
    )
    .context("opening dataset")?;
    info!(frames = dataset.len(), "dataset loaded");

    let use_odometry = command_line.option_use_odometry;
    let mut system = SlamSystem::new(parameters, dataset.camera(), dataset.depth_scale());

    let mut previous_ground_truth: Option<SE3> = None;
    let mut broken_tracks = 0usize;
    for index in 0..dataset.len() {
        let pair = dataset.image_pair(index)?;
        let ground_truth = dataset.ground_truth_pose(pair.timestamp_seconds);

        // External odometry is taken from the dataset's reference poses.
        let odometry_delta = match (&previous_ground_truth, &ground_truth) {
            (Some(previous), Some(current)) if use_odometry => {
                Some(previous.inverse().compose(current))
            }
            _ => None,
        };
        previous_ground_truth = ground_truth.clone();

        let report = system.process_frame(
            &pair.left,
            &pair.right,
            pair.timestamp_seconds,
            odometry_delta.as_ref(),
            ground_truth,
        )?;
        if report.tracker.status == TrackerStatus::BrokenTrack {
            broken_tracks += 1;
        }

        if index % 100 == 0 {
            let world_map = system.world_map();
            info!(
                frame = index,
                landmarks = world_map.num_landmarks(),
                local_maps = world_map.num_local_maps(),
                closures = world_map.number_of_closures(),
                tracked = report.tracker.number_of_tracked_landmarks,
                "progress"
            );
        }
    }

    system.shutdown();

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0);
    let world_map = system.world_map();
    world_map.write_trajectory_kitti(&PathBuf::from(format!("trajectory_kitti-{stamp}.txt")))?;
    world_map.write_trajectory_tum(&PathBuf::from(format!("trajectory_tum-{stamp}.txt")))?;

    info!(
        frames = world_map.num_frames(),
        landmarks = world_map.num_landmarks(),
        local_maps = world_map.num_local_maps(),
        closures = world_map.number_of_closures(),
        merged_landmarks = world_map.number_of_merged_landmarks(),
        broken_tracks,
        "finished"
    );
    Ok(())
}
