pub mod hsv;
pub mod locate;
pub mod mask;

pub use hsv::{rgb_to_hsv, threshold};
pub use locate::{polygon_area, Blob, BlobLocator, LocatorConfig};
pub use mask::{ColorMask, HsvWindow};
