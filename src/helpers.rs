use std::ops::{Add, Mul};

use anyhow::Result;
use opencv::core::{self, Mat, Point2f, Rect, Size, Vec3b};
use opencv::prelude::*;

/// Builds a chessboard pattern image with one pixel per square, starting
/// with `colour_1` in the top-left corner. The pattern is meant to be
/// stretched to fullscreen by the display surface. Both dimensions must
/// be even so the 2x2 sub-pattern tiles exactly.
pub fn make_chessboard(size: Size, colour_1: Vec3b, colour_2: Vec3b) -> Result<Mat> {
    debug_assert!(size.width % 2 == 0 && size.height % 2 == 0);
    debug_assert!(size.width > 1 && size.height > 1);

    let mut sub_pattern = Mat::new_rows_cols_with_default(2, 2, core::CV_8UC3, core::Scalar::default())?;
    *sub_pattern.at_2d_mut::<Vec3b>(0, 0)? = colour_1;
    *sub_pattern.at_2d_mut::<Vec3b>(0, 1)? = colour_2;
    *sub_pattern.at_2d_mut::<Vec3b>(1, 1)? = colour_1;
    *sub_pattern.at_2d_mut::<Vec3b>(1, 0)? = colour_2;

    let mut full_pattern = Mat::default();
    core::repeat(&sub_pattern, size.height / 2, size.width / 2, &mut full_pattern)?;

    Ok(full_pattern)
}

pub fn lerp<T>(v0: T, v1: T, x: f32) -> T
where
    T: Copy + Add<Output = T> + Mul<f32, Output = T>,
{
    v0 * (1.0 - x) + v1 * x
}

pub fn blerp<T>(v00: T, v01: T, v11: T, v10: T, x: f32, y: f32) -> T
where
    T: Copy + Add<Output = T> + Mul<f32, Output = T>,
{
    lerp(lerp(v00, v10, x), lerp(v01, v11, x), y)
}

#[allow(clippy::too_many_arguments)]
pub fn tlerp<T>(
    v000: T, v010: T, v110: T, v100: T,
    v001: T, v011: T, v111: T, v101: T,
    x: f32, y: f32, z: f32,
) -> T
where
    T: Copy + Add<Output = T> + Mul<f32, Output = T>,
{
    lerp(
        blerp(v000, v010, v110, v100, x, y),
        blerp(v001, v011, v111, v101, x, y),
        z,
    )
}

/// Signed angle from `u` to `v` in degrees, positive counter-clockwise.
pub fn signed_angle_between(v: Point2f, u: Point2f) -> f32 {
    (u.x * v.y - u.y * v.x).atan2(u.x * v.x + u.y * v.y) * (180.0 / std::f32::consts::PI)
}

/// Flattens a 3D grid coordinate into a linear index, x fastest.
pub fn xyz_to_3d_index(x: usize, y: usize, z: usize, size: usize) -> usize {
    (z * size + y) * size + x
}

/// Composites two same-typed images side by side for diagnostic output.
pub fn hconcat2(left: &Mat, right: &Mat) -> Result<Mat> {
    debug_assert_eq!(left.typ(), right.typ());

    let mut container = Mat::new_size_with_default(
        Size::new(left.cols() + right.cols(), left.rows().max(right.rows())),
        left.typ(),
        core::Scalar::default(),
    )?;

    left.copy_to(&mut Mat::roi_mut(&mut container, Rect::new(0, 0, left.cols(), left.rows()))?)?;
    right.copy_to(&mut Mat::roi_mut(
        &mut container,
        Rect::new(left.cols(), 0, right.cols(), right.rows()),
    )?)?;

    Ok(container)
}

pub fn hconcat3(left: &Mat, middle: &Mat, right: &Mat) -> Result<Mat> {
    hconcat2(&hconcat2(left, middle)?, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn chessboard_alternates_from_top_left() {
        let black = Vec3b::all(0);
        let white = Vec3b::all(255);
        let pattern = make_chessboard(Size::new(22, 18), black, white).unwrap();

        assert_eq!(pattern.size().unwrap(), Size::new(22, 18));
        assert_eq!(*pattern.at_2d::<Vec3b>(0, 0).unwrap(), black);
        assert_eq!(*pattern.at_2d::<Vec3b>(0, 1).unwrap(), white);
        assert_eq!(*pattern.at_2d::<Vec3b>(1, 0).unwrap(), white);
        assert_eq!(*pattern.at_2d::<Vec3b>(17, 21).unwrap(), white);
    }

    #[test]
    fn lerp_hits_endpoints_and_midpoint() {
        assert_eq!(lerp(0.0f32, 10.0, 0.0), 0.0);
        assert_eq!(lerp(0.0f32, 10.0, 1.0), 10.0);
        assert_eq!(lerp(0.0f32, 10.0, 0.5), 5.0);
    }

    #[test]
    fn tlerp_selects_cube_corners() {
        let corners: Vec<Vector3<f32>> = (0..8).map(|i| Vector3::repeat(i as f32)).collect();
        let pick = |x: f32, y: f32, z: f32| {
            tlerp(
                corners[0], corners[1], corners[2], corners[3],
                corners[4], corners[5], corners[6], corners[7],
                x, y, z,
            )
        };

        assert_eq!(pick(0.0, 0.0, 0.0), corners[0]);
        assert_eq!(pick(0.0, 1.0, 0.0), corners[1]);
        assert_eq!(pick(1.0, 1.0, 0.0), corners[2]);
        assert_eq!(pick(1.0, 0.0, 0.0), corners[3]);
        assert_eq!(pick(0.0, 0.0, 1.0), corners[4]);
        assert_eq!(pick(1.0, 1.0, 1.0), corners[6]);
    }

    #[test]
    fn angle_sign_follows_winding() {
        let right = Point2f::new(1.0, 0.0);
        let up = Point2f::new(0.0, 1.0);

        assert!((signed_angle_between(up, right) - 90.0).abs() < 1e-4);
        assert!((signed_angle_between(right, up) + 90.0).abs() < 1e-4);
    }

    #[test]
    fn grid_index_is_x_fastest() {
        assert_eq!(xyz_to_3d_index(0, 0, 0, 8), 0);
        assert_eq!(xyz_to_3d_index(1, 0, 0, 8), 1);
        assert_eq!(xyz_to_3d_index(0, 1, 0, 8), 8);
        assert_eq!(xyz_to_3d_index(0, 0, 1, 8), 64);
        assert_eq!(xyz_to_3d_index(7, 7, 7, 8), 511);
    }

    #[test]
    fn hconcat2_tiles_left_to_right() {
        let left = Mat::new_rows_cols_with_default(4, 3, core::CV_8UC1, core::Scalar::all(10.0)).unwrap();
        let right = Mat::new_rows_cols_with_default(4, 5, core::CV_8UC1, core::Scalar::all(20.0)).unwrap();

        let combined = hconcat2(&left, &right).unwrap();
        assert_eq!(combined.size().unwrap(), Size::new(8, 4));
        assert_eq!(*combined.at_2d::<u8>(0, 0).unwrap(), 10);
        assert_eq!(*combined.at_2d::<u8>(0, 3).unwrap(), 20);
    }
}
