//! Image blob checks and object-key naming.
//!
//! Blobs are sniffed from their leading bytes; the declared file name or
//! content type of an upload is never trusted. Keys follow
//! `images/products/thumbnails/<token>.<ext>` for thumbnails and
//! `images/products/<category>/<token>.<ext>` for gallery images.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coffeeshop_core::{DomainError, DomainResult};

/// Largest accepted upload.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

pub const THUMBNAIL_PREFIX: &str = "images/products/thumbnails";
pub const GALLERY_PREFIX: &str = "images/products";

/// Image formats recognised by content sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    XIcon,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 6] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::Webp,
        ImageFormat::Bmp,
        ImageFormat::XIcon,
    ];

    /// Detect the format from magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else if bytes.len() >= 14 && &bytes[..4] == b"RIFF" && &bytes[8..14] == b"WEBPVP" {
            Some(Self::Webp)
        } else if bytes.starts_with(b"BM") {
            Some(Self::Bmp)
        } else if bytes.starts_with(&[0, 0, 1, 0]) || bytes.starts_with(&[0, 0, 2, 0]) {
            Some(Self::XIcon)
        } else {
            None
        }
    }

    /// File extension, identical to the MIME subtype.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::XIcon => "x-icon",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }

    pub fn content_type(&self) -> String {
        format!("image/{}", self.extension())
    }
}

/// A validated blob together with the key it will be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub object_key: String,
    pub format: ImageFormat,
}

pub fn prepare_thumbnail(bytes: Vec<u8>) -> DomainResult<PreparedImage> {
    let format = check_blob(&bytes)?;
    let object_key = format!("{THUMBNAIL_PREFIX}/{}.{}", object_token(), format.extension());
    Ok(PreparedImage {
        bytes,
        object_key,
        format,
    })
}

pub fn prepare_gallery_image(category: &str, bytes: Vec<u8>) -> DomainResult<PreparedImage> {
    let format = check_blob(&bytes)?;
    let object_key = format!(
        "{GALLERY_PREFIX}/{}/{}.{}",
        category_slug(category),
        object_token(),
        format.extension()
    );
    Ok(PreparedImage {
        bytes,
        object_key,
        format,
    })
}

fn check_blob(bytes: &[u8]) -> DomainResult<ImageFormat> {
    if bytes.is_empty() {
        return Err(DomainError::validation("image is empty"));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(DomainError::validation(format!(
            "image exceeds {MAX_IMAGE_BYTES} bytes"
        )));
    }
    ImageFormat::sniff(bytes).ok_or_else(|| DomainError::validation("file is not an image"))
}

/// 16 random bytes, hex encoded.
pub fn object_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Lowercase path segment for a category; runs of other characters become `-`.
pub fn category_slug(category: &str) -> String {
    let mut slug = String::with_capacity(category.len());
    for c in category.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "uncategorized".to_string()
    } else {
        slug.to_string()
    }
}
