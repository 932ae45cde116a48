//! # 3D Camera
//!
//! View and projection matrices for draw operations. Cameras are registered with
//! the [`SceneGraph`](super::SceneGraph) and referenced by [`CameraId`](crate::foundation::collections::CameraId).
//!
//! ## Coordinate System
//! Right-handed, Y-up view space. Projection maps depth to `[-1, 1]`.

use serde::{Serialize, Deserialize};
use crate::foundation::math::{Vec3, Mat4, Mat4Ext, utils};

/// Projection model of a camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// Perspective projection
    Perspective {
        /// Vertical field of view in radians
        fov: f32,
    },
    /// Orthographic projection
    Orthographic {
        /// Half of the visible height in world units
        half_height: f32,
    },
}

/// 3D camera
///
/// Matrices are computed on demand. Draw operations ask for them once per execution,
/// so nothing is cached here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Camera position in world space
    pub position: Vec3,

    /// Point the camera is looking at in world space
    pub target: Vec3,

    /// Up vector for camera orientation (typically [0, 1, 0])
    pub up: Vec3,

    /// Projection model
    pub projection: Projection,

    /// Aspect ratio (width / height)
    pub aspect: f32,

    /// Distance to near clipping plane
    pub near: f32,

    /// Distance to far clipping plane
    pub far: f32,
}

impl Camera {
    /// Create a perspective camera looking at the origin
    ///
    /// # Arguments
    /// * `position` - Camera position in world space
    /// * `fov_degrees` - Vertical field of view in degrees
    /// * `aspect` - Aspect ratio (width / height) of the viewport
    /// * `near` - Distance to near clipping plane (must be > 0)
    /// * `far` - Distance to far clipping plane (must be > near)
    pub fn perspective(position: Vec3, fov_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            projection: Projection::Perspective { fov: utils::deg_to_rad(fov_degrees) },
            aspect,
            near,
            far,
        }
    }

    /// Create an orthographic camera looking at the origin
    pub fn orthographic(position: Vec3, half_height: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            position,
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            projection: Projection::Orthographic { half_height },
            aspect,
            near,
            far,
        }
    }

    /// Update camera position in world space
    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
        log::trace!("Camera position updated to: {:?}", position);
    }

    /// Point the camera at `target` with a custom up vector
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        self.target = target;
        self.up = up;
        log::trace!("Camera look_at updated - target: {:?}, up: {:?}", target, up);
    }

    /// Update the aspect ratio after a viewport change
    pub fn set_aspect_ratio(&mut self, aspect: f32) {
        if (self.aspect - aspect).abs() > 0.01 {
            log::debug!("Camera aspect ratio changed: {:.3} -> {:.3}", self.aspect, aspect);
        }
        self.aspect = aspect;
    }

    /// World-to-camera transform
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at(self.position, self.target, self.up)
    }

    /// Camera-to-clip transform
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective { fov } => Mat4::perspective(fov, self.aspect, self.near, self.far),
            Projection::Orthographic { half_height } => {
                Mat4::orthographic(half_height, self.aspect, self.near, self.far)
            }
        }
    }

    /// Combined world-to-clip transform (`P × V`)
    ///
    /// Multiply by a model matrix to get the per-object MVP:
    /// `Final = ViewProjection × Model × Vertex`
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Distance from the camera to a world-space point
    pub fn distance_to(&self, point: Vec3) -> f32 {
        (point - self.position).norm()
    }
}

impl Default for Camera {
    /// Perspective camera above and behind the origin: 45 degrees, 16:9, near 0.1, far 1000
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 3.0, 3.0),
            target: Vec3::zeros(),
            up: Vec3::new(0.0, 1.0, 0.0),
            projection: Projection::Perspective { fov: std::f32::consts::FRAC_PI_4 },
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Point3;
    use approx::assert_relative_eq;

    #[test]
    fn test_target_lands_on_view_axis() {
        let camera = Camera::perspective(Vec3::new(0.0, 0.0, 10.0), 60.0, 1.0, 0.1, 100.0);
        let clip = camera.view_projection_matrix().transform_point(&Point3::origin());
        assert_relative_eq!(clip.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y, 0.0, epsilon = 1e-5);
        assert!(clip.z > -1.0 && clip.z < 1.0);
    }

    #[test]
    fn test_orthographic_keeps_scale_with_distance() {
        let camera = Camera::orthographic(Vec3::new(0.0, 0.0, 10.0), 5.0, 1.0, 0.1, 100.0);
        let vp = camera.view_projection_matrix();
        let near = vp.transform_point(&Point3::new(5.0, 0.0, 5.0));
        let far = vp.transform_point(&Point3::new(5.0, 0.0, -50.0));
        assert_relative_eq!(near.x, 1.0, epsilon = 1e-5);
        assert_relative_eq!(far.x, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_distance_to() {
        let camera = Camera::perspective(Vec3::new(3.0, 4.0, 0.0), 45.0, 1.0, 0.1, 10.0);
        assert_relative_eq!(camera.distance_to(Vec3::zeros()), 5.0);
    }
}
