use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Webp,
}

impl ImageKind {
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(Self::Png)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }
}

/// Decodes a base64 image, with or without a `data:...;base64,` prefix.
pub fn decode_base64_image(raw: &str) -> Result<(Vec<u8>, ImageKind)> {
    let payload = match raw.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => raw,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(Error::BadRequest("Image payload is empty".to_string()));
    }
    let bytes = BASE64.decode(compact)?;
    let kind = ImageKind::sniff(&bytes)
        .ok_or_else(|| Error::BadRequest("Unsupported image format; expected JPEG, PNG or WebP".to_string()))?;
    Ok((bytes, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn accepts_data_url_prefix() {
        let encoded = format!("data:image/png;base64,{}", BASE64.encode(PNG_HEADER));
        let (bytes, kind) = decode_base64_image(&encoded).unwrap();
        assert_eq!(kind, ImageKind::Png);
        assert_eq!(bytes, PNG_HEADER);
    }

    #[test]
    fn rejects_non_images() {
        let encoded = BASE64.encode(b"%PDF-1.7 not an image");
        assert!(matches!(decode_base64_image(&encoded), Err(Error::BadRequest(_))));
        assert!(matches!(decode_base64_image("!!!"), Err(Error::Base64(_))));
        assert!(matches!(decode_base64_image("  "), Err(Error::BadRequest(_))));
    }
}
