use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

use crate::config::MappingConfig;
use crate::pose::Device;

/// カメラ座標のマーカー位置をデバイス座標へ写す
///
/// `scale ⊙ (R·p)` の後、マーカーごとのオフセットをデバイスの姿勢で
/// 回して加える。
#[derive(Debug, Clone)]
pub struct CameraMapping {
    rotation: Matrix3<f64>,
    axis_scale: Vector3<f64>,
    offsets: Vec<Vector3<f64>>,
}

impl Default for CameraMapping {
    fn default() -> Self {
        Self::from_config(&MappingConfig::default())
    }
}

impl CameraMapping {
    pub fn from_config(config: &MappingConfig) -> Self {
        let [ax, ay, az] = config.rotation;
        let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), ax)
            * Rotation3::from_axis_angle(&Vector3::y_axis(), ay)
            * Rotation3::from_axis_angle(&Vector3::z_axis(), az);
        Self {
            rotation: rotation.into_inner(),
            axis_scale: Vector3::from(config.axis_scale),
            offsets: config.offsets.iter().copied().map(Vector3::from).collect(),
        }
    }

    pub fn map_position(&self, position: [f64; 3]) -> [f64; 3] {
        let p = (self.rotation * Vector3::from(position)).component_mul(&self.axis_scale);
        [p.x, p.y, p.z]
    }

    /// `index` 番目のマーカー位置をデバイスに書き込む
    pub fn apply(&self, index: usize, device: &mut Device, position: [f64; 3]) {
        let mut p = Vector3::from(self.map_position(position));
        if let Some(offset) = self.offsets.get(index) {
            let pose = device.pose();
            let q = UnitQuaternion::from_quaternion(Quaternion::new(pose.r_w, pose.r_x, pose.r_y, pose.r_z));
            p += q * offset;
        }
        device.pose_mut().set_position([p.x, p.y, p.z]);
    }
}
