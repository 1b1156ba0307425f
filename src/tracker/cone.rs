use nalgebra::{Matrix3, Vector3};

/// 係数行列の条件がこれより悪い場合は退化とみなす
const MIN_EIGEN_RATIO: f64 = 1e-12;

/// 球の輪郭点から3D位置を推定（焦点を頂点とする円錐の最小二乗フィット）
///
/// - points: 画像中心原点・y上向きのピクセル座標
/// - sphere_radius: 球の半径（出力はこの単位になる）
/// - focal_length_px: 焦点距離（ピクセル）
///
/// 各輪郭点 p について `[px, py, -|(px, py, f)|] · (Bx, By, c) = -f²` を並べ、
/// A^T A で解く。退化入力ではNaNを返す（呼び出し側で `has_nan_in_pose` を確認すること）。
pub fn fit_focal_cone_to_sphere(
    points: &[[f64; 2]],
    sphere_radius: f64,
    focal_length_px: f64,
) -> [f64; 3] {
    let f = focal_length_px;
    let ff = f * f;

    let mut ata = Matrix3::<f64>::zeros();
    let mut atb = Vector3::<f64>::zeros();
    for p in points {
        let row = Vector3::new(p[0], p[1], -(p[0] * p[0] + p[1] * p[1] + ff).sqrt());
        ata += row * row.transpose();
        atb += row * -ff;
    }

    let solution = match solve_normal_equations(&ata, &atb) {
        Some(s) => s,
        None => return [f64::NAN; 3],
    };
    let (bx, by, c) = (solution[0], solution[1], solution[2]);

    let norm_axis = (bx * bx + by * by + ff).sqrt();
    let cos_theta = c / norm_axis;
    let norm_b = sphere_radius / (1.0 - cos_theta * cos_theta).sqrt();

    let scale = norm_b / norm_axis;
    [bx * scale, by * scale, f * scale]
}

/// 対称な3x3正規方程式を解く。ランク落ちならNone。
fn solve_normal_equations(ata: &Matrix3<f64>, atb: &Vector3<f64>) -> Option<Vector3<f64>> {
    let eigen = ata.symmetric_eigen();
    let max = eigen.eigenvalues.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let min = eigen.eigenvalues.iter().fold(f64::MAX, |m, v| m.min(v.abs()));
    if !(max > 0.0) || min <= max * MIN_EIGEN_RATIO {
        return None;
    }
    ata.try_inverse().map(|inv| inv * atb)
}

/// 位置にNaN/Infが含まれるか
pub fn has_nan_in_pose(pose: &[f64]) -> bool {
    pose.iter().any(|v| !v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: f64 = 554.2563;
    const R: f64 = 0.02;

    /// 球 (中心 center, 半径 R) の輪郭を透視投影で生成
    fn silhouette(center: Vector3<f64>, n: usize) -> Vec<[f64; 2]> {
        let d = center.norm();
        let axis = center / d;
        let sin_t = R / d;
        let cos_t = (1.0 - sin_t * sin_t).sqrt();

        // 軸に直交する基底
        let helper = if axis.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let u = axis.cross(&helper).normalize();
        let v = axis.cross(&u);

        (0..n)
            .map(|i| {
                let phi = i as f64 / n as f64 * std::f64::consts::TAU;
                let dir = axis * cos_t + (u * phi.cos() + v * phi.sin()) * sin_t;
                [F * dir.x / dir.z, F * dir.y / dir.z]
            })
            .collect()
    }

    #[test]
    fn test_on_axis_distance() {
        let dist = 0.5;
        let r_px = F * R / (dist * dist - R * R).sqrt();
        let points: Vec<[f64; 2]> = (0..64)
            .map(|i| {
                let phi = i as f64 / 64.0 * std::f64::consts::TAU;
                [r_px * phi.cos(), r_px * phi.sin()]
            })
            .collect();

        let p = fit_focal_cone_to_sphere(&points, R, F);
        let norm = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        assert!((norm - dist).abs() < 1e-6, "norm = {}", norm);
        assert!(p[0].abs() < 1e-9 && p[1].abs() < 1e-9);
    }

    #[test]
    fn test_off_axis_position() {
        let center = Vector3::new(0.1, -0.05, 0.6);
        let p = fit_focal_cone_to_sphere(&silhouette(center, 90), R, F);
        for i in 0..3 {
            assert!(
                (p[i] - center[i]).abs() < 1e-6,
                "axis {}: expected {}, got {}",
                i,
                center[i],
                p[i]
            );
        }
    }

    #[test]
    fn test_smaller_silhouette_is_farther() {
        let near = fit_focal_cone_to_sphere(&silhouette(Vector3::new(0.0, 0.0, 0.4), 48), R, F);
        let far = fit_focal_cone_to_sphere(&silhouette(Vector3::new(0.0, 0.0, 0.9), 48), R, F);
        assert!(far[2] > near[2]);
    }

    #[test]
    fn test_degenerate_inputs_give_nan() {
        assert!(has_nan_in_pose(&fit_focal_cone_to_sphere(&[], R, F)));
        assert!(has_nan_in_pose(&fit_focal_cone_to_sphere(&[[10.0, 5.0]], R, F)));
        // 一直線上の点（面積ゼロ）
        let line = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0], [4.0, 0.0]];
        assert!(has_nan_in_pose(&fit_focal_cone_to_sphere(&line, R, F)));
    }

    #[test]
    fn test_has_nan_in_pose() {
        assert!(!has_nan_in_pose(&[0.0, 1.0, 2.0]));
        assert!(has_nan_in_pose(&[0.0, f64::NAN, 2.0]));
        assert!(has_nan_in_pose(&[f64::INFINITY, 0.0, 0.0]));
    }
}
