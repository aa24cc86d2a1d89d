//! Inline image extraction
//!
//! Multi-modal requests embed images as `data:image/...;base64,` URLs. Those
//! payloads are replaced by an [`ImageDescriptor`] so that traces stay small
//! and identical images can be deduplicated by hash.

use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::models::ImageDescriptor;

/// Content block type carrying an image
const IMAGE_BLOCK_TYPE: &str = "image_url";

/// Describe the image inside a base64 data URL.
///
/// Returns `None` for anything that is not a decodable base64 image URL.
pub fn describe_data_url(data_url: &str) -> Option<ImageDescriptor> {
    let body = data_url.strip_prefix("data:")?;
    let (header, data) = body.split_once(',')?;

    let mut header_parts = header.split(';');
    let mime_type = header_parts.next()?.to_ascii_lowercase();
    let subtype = mime_type.strip_prefix("image/")?;
    if !header_parts.any(|part| part == "base64") {
        return None;
    }

    let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = general_purpose::STANDARD.decode(cleaned).ok()?;
    let dimensions = sniff_dimensions(&bytes);

    Some(ImageDescriptor {
        image_hash: hex::encode(Sha256::digest(&bytes)),
        format: subtype.to_ascii_uppercase(),
        size_bytes: bytes.len() as i64,
        width: dimensions.map(|(w, _)| w),
        height: dimensions.map(|(_, h)| h),
    })
}

/// Replace inline image payloads in a list of content blocks.
///
/// Returns the rewritten blocks and whether any image block was present.
/// Descriptors of the inline images are appended to `images` in order.
pub fn redact_image_blocks(
    parts: Vec<Value>,
    images: &mut Vec<ImageDescriptor>,
) -> (Vec<Value>, bool) {
    let mut has_images = false;

    let parts = parts
        .into_iter()
        .map(|mut part| {
            if part.get("type").and_then(Value::as_str) != Some(IMAGE_BLOCK_TYPE) {
                return part;
            }
            has_images = true;

            let url = match part.get(IMAGE_BLOCK_TYPE) {
                Some(Value::String(url)) => Some(url.clone()),
                Some(Value::Object(obj)) => obj.get("url").and_then(Value::as_str).map(String::from),
                _ => None,
            };
            let Some(url) = url.filter(|u| u.starts_with("data:")) else {
                return part;
            };

            let replacement = match describe_data_url(&url) {
                Some(image) => {
                    let descriptor = json!({
                        "image_hash": image.image_hash,
                        "format": image.format,
                        "size_bytes": image.size_bytes,
                        "width": image.width,
                        "height": image.height,
                    });
                    images.push(image);
                    descriptor
                }
                None => json!({ "invalid_data_url": true, "length": url.len() }),
            };
            if let Some(obj) = part.as_object_mut() {
                obj.insert(IMAGE_BLOCK_TYPE.to_string(), replacement);
            }
            part
        })
        .collect();

    (parts, has_images)
}

/// Read pixel dimensions from PNG, GIF, JPEG or WebP headers
pub fn sniff_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some((be_u32(bytes, 16)?, be_u32(bytes, 20)?));
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some((u32::from(le_u16(bytes, 6)?), u32::from(le_u16(bytes, 8)?)));
    }
    if bytes.starts_with(&[0xFF, 0xD8]) {
        return jpeg_dimensions(bytes);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return webp_dimensions(bytes);
    }
    None
}

fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 3 < bytes.len() {
        if bytes[i] != 0xFF {
            return None;
        }
        let marker = bytes[i + 1];
        match marker {
            // fill byte
            0xFF => i += 1,
            // standalone markers carry no length
            0x01 | 0xD0..=0xD8 => i += 2,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(bytes, i + 5)?;
                let width = be_u16(bytes, i + 7)?;
                return Some((u32::from(width), u32::from(height)));
            }
            _ => {
                let length = usize::from(be_u16(bytes, i + 2)?);
                i += 2 + length;
            }
        }
    }
    None
}

fn webp_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    match bytes.get(12..16)? {
        b"VP8 " => {
            let width = le_u16(bytes, 26)? & 0x3FFF;
            let height = le_u16(bytes, 28)? & 0x3FFF;
            Some((u32::from(width), u32::from(height)))
        }
        b"VP8L" => {
            let b = bytes.get(21..25)?;
            let width = 1 + ((u32::from(b[1] & 0x3F) << 8) | u32::from(b[0]));
            let height = 1
                + ((u32::from(b[3] & 0x0F) << 10)
                    | (u32::from(b[2]) << 2)
                    | (u32::from(b[1] & 0xC0) >> 6));
            Some((width, height))
        }
        b"VP8X" => {
            let b = bytes.get(24..30)?;
            let width = 1 + (u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16));
            let height = 1 + (u32::from(b[3]) | (u32::from(b[4]) << 8) | (u32::from(b[5]) << 16));
            Some((width, height))
        }
        _ => None,
    }
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn be_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn le_u16(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    fn data_url(mime: &str, bytes: &[u8]) -> String {
        format!("data:{mime};base64,{}", general_purpose::STANDARD.encode(bytes))
    }

    #[test]
    fn test_describe_png_data_url() {
        let bytes = png_header(640, 480);
        let image = describe_data_url(&data_url("image/png", &bytes)).unwrap();

        assert_eq!(image.format, "PNG");
        assert_eq!(image.size_bytes, bytes.len() as i64);
        assert_eq!(image.width, Some(640));
        assert_eq!(image.height, Some(480));
        assert_eq!(image.image_hash.len(), 64);
    }

    #[test]
    fn test_gif_and_jpeg_dimensions() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[0x20, 0x00, 0x10, 0x00]);
        assert_eq!(sniff_dimensions(&gif), Some((32, 16)));

        // SOI, APP0 (length 4), SOF0 with height 100 and width 200
        let jpeg = [
            0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00, 0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00,
            0x64, 0x00, 0xC8, 0x03,
        ];
        assert_eq!(sniff_dimensions(&jpeg), Some((200, 100)));
    }

    #[test]
    fn test_unknown_bytes_have_no_dimensions() {
        assert_eq!(sniff_dimensions(b"not an image"), None);
        let image = describe_data_url(&data_url("image/bmp", b"BM....")).unwrap();
        assert_eq!(image.format, "BMP");
        assert_eq!(image.width, None);
    }

    #[test]
    fn test_rejects_non_image_urls() {
        assert!(describe_data_url("https://example.com/cat.png").is_none());
        assert!(describe_data_url("data:text/plain;base64,aGk=").is_none());
        assert!(describe_data_url("data:image/png,rawdata").is_none());
        assert!(describe_data_url("data:image/png;base64,@@@").is_none());
    }

    #[test]
    fn test_identical_images_share_a_hash() {
        let url = data_url("image/png", &png_header(1, 1));
        let a = describe_data_url(&url).unwrap();
        let b = describe_data_url(&url).unwrap();
        assert_eq!(a.image_hash, b.image_hash);
    }

    #[test]
    fn test_redact_replaces_inline_payload() {
        let url = data_url("image/png", &png_header(2, 3));
        let parts = vec![
            json!({"type": "text", "text": "what is this?"}),
            json!({"type": "image_url", "image_url": {"url": url, "detail": "low"}}),
            json!({"type": "image_url", "image_url": {"url": "https://example.com/a.jpg"}}),
        ];

        let mut images = Vec::new();
        let (parts, has_images) = redact_image_blocks(parts, &mut images);

        assert!(has_images);
        assert_eq!(images.len(), 1);
        assert_eq!(parts[0]["text"], "what is this?");
        assert_eq!(parts[1]["image_url"]["image_hash"], images[0].image_hash.as_str());
        assert_eq!(parts[1]["image_url"]["width"], 2);
        assert!(parts[1]["image_url"].get("url").is_none());
        assert_eq!(parts[2]["image_url"]["url"], "https://example.com/a.jpg");
    }

    #[test]
    fn test_text_only_blocks_have_no_images() {
        let mut images = Vec::new();
        let (parts, has_images) =
            redact_image_blocks(vec![json!({"type": "text", "text": "hi"})], &mut images);
        assert!(!has_images);
        assert!(images.is_empty());
        assert_eq!(parts.len(), 1);
    }
}
