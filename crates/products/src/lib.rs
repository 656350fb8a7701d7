//! `coffeeshop-products`: the product record, its field rules and the
//! image-upload preparation that precedes any storage side effect.

pub mod images;
pub mod product;

pub use images::{ImageFormat, PreparedImage, prepare_gallery_image, prepare_thumbnail};
pub use product::{Product, ProductFields, ProductPatch};
