//! Trajectory writers and parsers (KITTI and TUM formats).
//!
//! KITTI: one line per frame, the row-major upper 3×4 of `robot_to_world`,
//! twelve space-separated numbers. TUM: `timestamp tx ty tz qx qy qz qw`.
//! Both use fixed precision 9.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::error::{Result, SlamError};
use crate::geometry::SE3;

pub fn write_kitti(path: &Path, poses: &[SE3]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for pose in poses {
        let matrix = pose.to_matrix();
        let mut fields = Vec::with_capacity(12);
        for row in 0..3 {
            for column in 0..4 {
                fields.push(format!("{:.9}", matrix[(row, column)]));
            }
        }
        writeln!(writer, "{}", fields.join(" "))?;
    }
    Ok(())
}

pub fn write_tum(path: &Path, stamped_poses: &[(f64, SE3)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for (timestamp, pose) in stamped_poses {
        let translation = &pose.translation;
        let orientation = pose.rotation.quaternion();
        writeln!(
            writer,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            timestamp,
            translation.x,
            translation.y,
            translation.z,
            orientation.i,
            orientation.j,
            orientation.k,
            orientation.w,
        )?;
    }
    Ok(())
}

pub fn parse_kitti(path: &Path) -> Result<Vec<SE3>> {
    let reader = BufReader::new(File::open(path)?);
    let mut poses = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let values = parse_fields(&line, 12)?;
        let mut matrix = nalgebra::Matrix4::identity();
        for row in 0..3 {
            for column in 0..4 {
                matrix[(row, column)] = values[row * 4 + column];
            }
        }
        poses.push(SE3::from_matrix(&matrix));
    }
    Ok(poses)
}

pub fn parse_tum(path: &Path) -> Result<Vec<(f64, SE3)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut stamped = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let values = parse_fields(&line, 8)?;
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(
            values[7], values[4], values[5], values[6],
        ));
        stamped.push((
            values[0],
            SE3::new(rotation, Vector3::new(values[1], values[2], values[3])),
        ));
    }
    Ok(stamped)
}

fn parse_fields(line: &str, expected: usize) -> Result<Vec<f64>> {
    let values: std::result::Result<Vec<f64>, _> = line
        .split_whitespace()
        .map(|field| field.parse::<f64>())
        .collect();
    let values =
        values.map_err(|error| SlamError::DegenerateInput(format!("bad trajectory line: {error}")))?;
    if values.len() != expected {
        return Err(SlamError::DegenerateInput(format!(
            "expected {expected} fields per trajectory line, found {}",
            values.len()
        )));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn sample_trajectory() -> Vec<(f64, SE3)> {
        (0..5)
            .map(|i| {
                let pose = SE3::new(
                    UnitQuaternion::from_euler_angles(0.01 * i as f64, -0.02, 0.1 * i as f64),
                    Vector3::new(0.3 * i as f64, -0.1, 0.05 * i as f64),
                );
                (i as f64 * 0.1, pose)
            })
            .collect()
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sparse_vslam_test_{name}_{}", std::process::id()))
    }

    #[test]
    fn test_kitti_roundtrip() {
        let trajectory = sample_trajectory();
        let poses: Vec<SE3> = trajectory.iter().map(|(_, pose)| pose.clone()).collect();
        let path = temp_path("kitti");

        write_kitti(&path, &poses).unwrap();
        let parsed = parse_kitti(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(parsed.len(), poses.len());
        for (recovered, original) in parsed.iter().zip(&poses) {
            assert!((recovered.translation - original.translation).norm() < 1e-8);
            assert!((recovered.rotation.inverse() * original.rotation).angle() < 1e-7);
        }
    }

    #[test]
    fn test_tum_roundtrip() {
        let trajectory = sample_trajectory();
        let path = temp_path("tum");

        write_tum(&path, &trajectory).unwrap();
        let parsed = parse_tum(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(parsed.len(), trajectory.len());
        for ((recovered_ts, recovered), (original_ts, original)) in
            parsed.iter().zip(&trajectory)
        {
            assert!((recovered_ts - original_ts).abs() < 1e-9);
            assert!((recovered.translation - original.translation).norm() < 1e-8);
            assert!((recovered.rotation.inverse() * original.rotation).angle() < 1e-7);
        }
    }

    #[test]
    fn test_kitti_line_has_twelve_fixed_precision_fields() {
        let path = temp_path("kitti_fields");
        write_kitti(&path, &[SE3::identity()]).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let line = contents.lines().next().unwrap();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 12);
        assert_eq!(fields[0], "1.000000000");
        assert_eq!(fields[3], "0.000000000");
    }

    #[test]
    fn test_malformed_line_is_rejected() {
        let path = temp_path("kitti_bad");
        std::fs::write(&path, "1.0 2.0 3.0\n").unwrap();
        let result = parse_kitti(&path);
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
