pub mod blob_tracker;
pub mod buffer;
pub mod cone;
pub mod kalman;
pub mod mapping;

pub use blob_tracker::{BlobTracker, TrackerHandle, TrackerSettings};
pub use buffer::PoseBuffer;
pub use cone::{fit_focal_cone_to_sphere, has_nan_in_pose};
pub use kalman::PositionSmoother;
pub use mapping::CameraMapping;
