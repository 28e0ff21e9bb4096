//! Image-sequence dataset reader.
//!
//! A dataset is a directory with one subdirectory per topic, each holding a
//! `data.csv` index (`timestamp_seconds,filename`) and a `data/` directory
//! with the images. A `calibration.yaml` at the root provides the camera
//! intrinsics; an optional `groundtruth.txt` (TUM format) provides
//! ground-truth poses for evaluation.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use opencv::core::Mat;
use opencv::imgcodecs::{self, IMREAD_ANYDEPTH, IMREAD_GRAYSCALE};
use opencv::imgproc;
use opencv::prelude::*;
use serde::Deserialize;
use tracing::warn;

use crate::geometry::{Camera, SE3};
use crate::io::trajectory;

#[derive(Debug, Clone, Deserialize)]
struct ImageEntry {
    timestamp_seconds: f64,
    filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationFile {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub baseline_meters: f64,
    /// Scale converting raw depth image values to meters (depth mode).
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f64,
}

fn default_depth_scale() -> f64 {
    1.0e-3
}

pub struct ImagePair {
    pub left: Mat,
    pub right: Mat,
    pub timestamp_seconds: f64,
}

pub struct ImageSequenceDataset {
    root: PathBuf,
    left_directory: PathBuf,
    right_directory: PathBuf,
    left_entries: Vec<ImageEntry>,
    right_entries: Vec<ImageEntry>,
    calibration: CalibrationFile,
    ground_truth: Vec<(f64, SE3)>,
    depth_mode: bool,
    equalize_histogram: bool,
}

impl ImageSequenceDataset {
    pub fn open(
        root: &Path,
        topic_left: &str,
        topic_right: &str,
        depth_mode: bool,
        equalize_histogram: bool,
    ) -> Result<Self> {
        let left_directory = root.join(topic_directory(topic_left));
        let right_directory = root.join(topic_directory(topic_right));

        let left_entries = load_image_index(&left_directory.join("data.csv"))?;
        let right_entries = load_image_index(&right_directory.join("data.csv"))?;
        if left_entries.len() != right_entries.len() {
            bail!(
                "topic image counts differ: {} vs {}",
                left_entries.len(),
                right_entries.len()
            );
        }

        let calibration_path = root.join("calibration.yaml");
        let calibration: CalibrationFile = serde_yaml::from_str(
            &std::fs::read_to_string(&calibration_path)
                .with_context(|| format!("reading {}", calibration_path.display()))?,
        )
        .with_context(|| format!("parsing {}", calibration_path.display()))?;

        // Ground truth is optional.
        let ground_truth_path = root.join("groundtruth.txt");
        let ground_truth = if ground_truth_path.exists() {
            trajectory::parse_tum(&ground_truth_path).unwrap_or_else(|error| {
                warn!(%error, "could not load ground truth, continuing without it");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            left_directory,
            right_directory,
            left_entries,
            right_entries,
            calibration,
            ground_truth,
            depth_mode,
            equalize_histogram,
        })
    }

    pub fn len(&self) -> usize {
        self.left_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left_entries.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn camera(&self) -> Camera {
        Camera {
            width: self.calibration.width,
            height: self.calibration.height,
            fx: self.calibration.fx,
            fy: self.calibration.fy,
            cx: self.calibration.cx,
            cy: self.calibration.cy,
            baseline_meters: self.calibration.baseline_meters,
        }
    }

    pub fn depth_scale(&self) -> f64 {
        self.calibration.depth_scale
    }

    /// Load the image pair at the given index. In depth mode the right image
    /// is the registered depth image, loaded with its native bit depth.
    pub fn image_pair(&self, index: usize) -> Result<ImagePair> {
        let left_entry = self
            .left_entries
            .get(index)
            .with_context(|| format!("no left image at index {index}"))?;
        let right_entry = self
            .right_entries
            .get(index)
            .with_context(|| format!("no right image at index {index}"))?;

        let left_path = self.left_directory.join("data").join(&left_entry.filename);
        let right_path = self.right_directory.join("data").join(&right_entry.filename);

        let mut left = imgcodecs::imread(
            left_path.to_str().context("non-utf8 image path")?,
            IMREAD_GRAYSCALE,
        )?;
        let right_flags = if self.depth_mode {
            IMREAD_ANYDEPTH
        } else {
            IMREAD_GRAYSCALE
        };
        let mut right = imgcodecs::imread(
            right_path.to_str().context("non-utf8 image path")?,
            right_flags,
        )?;
        if left.empty() {
            bail!("unreadable image: {}", left_path.display());
        }
        if right.empty() {
            bail!("unreadable image: {}", right_path.display());
        }

        if self.equalize_histogram {
            left = equalized(&left)?;
            if !self.depth_mode {
                right = equalized(&right)?;
            }
        }

        Ok(ImagePair {
            left,
            right,
            timestamp_seconds: left_entry.timestamp_seconds,
        })
    }

    /// Ground-truth pose closest to the given timestamp, if any was loaded.
    pub fn ground_truth_pose(&self, timestamp_seconds: f64) -> Option<SE3> {
        self.ground_truth
            .iter()
            .min_by(|(a, _), (b, _)| {
                (a - timestamp_seconds)
                    .abs()
                    .total_cmp(&(b - timestamp_seconds).abs())
            })
            .map(|(_, pose)| pose.clone())
    }
}

fn topic_directory(topic: &str) -> String {
    topic.trim_start_matches('/').replace('/', "_")
}

fn load_image_index(path: &Path) -> Result<Vec<ImageEntry>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut entries = Vec::new();
    for record in reader.deserialize() {
        let entry: ImageEntry = record.with_context(|| format!("parsing {}", path.display()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn equalized(image: &Mat) -> Result<Mat> {
    let mut output = Mat::default();
    imgproc::equalize_hist(image, &mut output)?;
    Ok(output)
}
