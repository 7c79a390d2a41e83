//! # Payload Decoding
//!
//! Turns the raw bytes stored in the disk tier into the value held by the
//! memory tier. Decoders are pure: the same bytes always decode to the same
//! payload.

use bytes::Bytes;

use crate::error::DecodeError;

/// Converts cached bytes into an in-memory payload
pub trait PayloadDecoder: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    fn decode(&self, bytes: Bytes) -> Result<Self::Payload, DecodeError>;

    /// Size accounted against the memory budget
    fn size_of(&self, payload: &Self::Payload) -> u64;
}

/// Keeps the bytes as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl PayloadDecoder for RawDecoder {
    type Payload = Bytes;

    fn decode(&self, bytes: Bytes) -> Result<Bytes, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(bytes)
    }

    fn size_of(&self, payload: &Bytes) -> u64 {
        payload.len() as u64
    }
}

/// Container formats recognized by [`ImageDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::WebP => "webp",
        }
    }

    /// Sniff the format from the leading magic bytes
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormat::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormat::Jpeg)
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            Some(ImageFormat::Gif)
        } else if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            Some(ImageFormat::WebP)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated image with its header dimensions; pixel data stays encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Parses the container header of common image formats.
///
/// Only the header is inspected; the memory budget is charged with the
/// encoded size.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl PayloadDecoder for ImageDecoder {
    type Payload = DecodedImage;

    fn decode(&self, bytes: Bytes) -> Result<DecodedImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let format = ImageFormat::detect(&bytes).ok_or(DecodeError::UnknownFormat)?;
        let (width, height) = match format {
            ImageFormat::Png => png_dimensions(&bytes)?,
            ImageFormat::Jpeg => jpeg_dimensions(&bytes)?,
            ImageFormat::Gif => gif_dimensions(&bytes)?,
            ImageFormat::WebP => webp_dimensions(&bytes)?,
        };
        if width == 0 || height == 0 {
            return Err(DecodeError::Malformed {
                format: format.as_str(),
                reason: format!("zero dimension {width}x{height}"),
            });
        }
        Ok(DecodedImage {
            format,
            width,
            height,
            data: bytes,
        })
    }

    fn size_of(&self, payload: &DecodedImage) -> u64 {
        payload.data.len() as u64
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_u24(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 3)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

fn png_dimensions(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    let truncated = DecodeError::Truncated { format: "png" };
    // Signature, chunk length, then the IHDR tag
    if data.get(12..16).ok_or(truncated.clone())? != b"IHDR" {
        return Err(DecodeError::Malformed {
            format: "png",
            reason: "first chunk is not IHDR".to_string(),
        });
    }
    let width = be_u32(data, 16).ok_or(truncated.clone())?;
    let height = be_u32(data, 20).ok_or(truncated)?;
    Ok((width, height))
}

fn gif_dimensions(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    let truncated = DecodeError::Truncated { format: "gif" };
    let width = le_u16(data, 6).ok_or(truncated.clone())?;
    let height = le_u16(data, 8).ok_or(truncated)?;
    Ok((width as u32, height as u32))
}

fn jpeg_dimensions(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    let truncated = DecodeError::Truncated { format: "jpeg" };
    let mut pos = 2;
    loop {
        // Skip fill bytes before the marker code
        while data.get(pos) == Some(&0xFF) && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if *data.get(pos).ok_or(truncated.clone())? != 0xFF {
            return Err(DecodeError::Malformed {
                format: "jpeg",
                reason: format!("expected marker at offset {pos}"),
            });
        }
        let marker = *data.get(pos + 1).ok_or(truncated.clone())?;
        pos += 2;

        match marker {
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            0xD9 | 0xDA => {
                return Err(DecodeError::Malformed {
                    format: "jpeg",
                    reason: "no frame header before scan data".to_string(),
                });
            }
            // SOF0..SOF15, excluding DHT, JPG and DAC
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(data, pos + 3).ok_or(truncated.clone())?;
                let width = be_u16(data, pos + 5).ok_or(truncated)?;
                return Ok((width as u32, height as u32));
            }
            _ => {
                let len = be_u16(data, pos).ok_or(truncated.clone())? as usize;
                if len < 2 {
                    return Err(DecodeError::Malformed {
                        format: "jpeg",
                        reason: format!("segment length {len} at offset {pos}"),
                    });
                }
                pos += len;
            }
        }
    }
}

fn webp_dimensions(data: &[u8]) -> Result<(u32, u32), DecodeError> {
    let truncated = DecodeError::Truncated { format: "webp" };
    let chunk = data.get(12..16).ok_or(truncated.clone())?;
    let payload = 20;
    match chunk {
        b"VP8 " => {
            // Frame tag (3 bytes) and start code precede the 14-bit sizes
            if data.get(payload + 3..payload + 6).ok_or(truncated.clone())? != [0x9D, 0x01, 0x2A] {
                return Err(DecodeError::Malformed {
                    format: "webp",
                    reason: "missing VP8 start code".to_string(),
                });
            }
            let width = le_u16(data, payload + 6).ok_or(truncated.clone())? & 0x3FFF;
            let height = le_u16(data, payload + 8).ok_or(truncated)? & 0x3FFF;
            Ok((width as u32, height as u32))
        }
        b"VP8L" => {
            if *data.get(payload).ok_or(truncated.clone())? != 0x2F {
                return Err(DecodeError::Malformed {
                    format: "webp",
                    reason: "missing VP8L signature".to_string(),
                });
            }
            let bits = data
                .get(payload + 1..payload + 5)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or(truncated)?;
            let width = (bits & 0x3FFF) + 1;
            let height = ((bits >> 14) & 0x3FFF) + 1;
            Ok((width, height))
        }
        b"VP8X" => {
            let width = le_u24(data, payload + 4).ok_or(truncated.clone())? + 1;
            let height = le_u24(data, payload + 7).ok_or(truncated)? + 1;
            Ok((width, height))
        }
        other => Err(DecodeError::Malformed {
            format: "webp",
            reason: format!("unsupported chunk {:?}", String::from_utf8_lossy(other)),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data
    }

    fn jpeg(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 segment to skip over
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x06, b'J', b'F', b'I', b'F']);
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0x03; 10]);
        data
    }

    #[test]
    fn test_raw_decoder_rejects_empty() {
        assert_eq!(RawDecoder.decode(Bytes::new()), Err(DecodeError::Empty));
        let payload = RawDecoder.decode(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(RawDecoder.size_of(&payload), 3);
    }

    #[test]
    fn test_png_header() {
        let image = ImageDecoder.decode(Bytes::from(png(640, 480))).unwrap();
        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width, image.height), (640, 480));
        assert_eq!(ImageDecoder.size_of(&image), image.data.len() as u64);
    }

    #[test]
    fn test_jpeg_skips_segments_until_frame_header() {
        let image = ImageDecoder.decode(Bytes::from(jpeg(1920, 1080))).unwrap();
        assert_eq!(image.format, ImageFormat::Jpeg);
        assert_eq!((image.width, image.height), (1920, 1080));
    }

    #[test]
    fn test_gif_header() {
        let mut data = b"GIF89a".to_vec();
        data.extend_from_slice(&32u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        let image = ImageDecoder.decode(Bytes::from(data)).unwrap();
        assert_eq!((image.format, image.width, image.height), (ImageFormat::Gif, 32, 16));
    }

    #[test]
    fn test_webp_lossless_header() {
        let (width, height) = (100u32, 50u32);
        let bits = (width - 1) | ((height - 1) << 14);
        let mut data = b"RIFF".to_vec();
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(b"WEBPVP8L");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(0x2F);
        data.extend_from_slice(&bits.to_le_bytes());

        let image = ImageDecoder.decode(Bytes::from(data)).unwrap();
        assert_eq!((image.format, image.width, image.height), (ImageFormat::WebP, 100, 50));
    }

    #[test]
    fn test_truncated_and_unknown() {
        let mut data = png(1, 1);
        data.truncate(18);
        assert_eq!(
            ImageDecoder.decode(Bytes::from(data)),
            Err(DecodeError::Truncated { format: "png" })
        );
        assert_eq!(
            ImageDecoder.decode(Bytes::from_static(b"plain text")),
            Err(DecodeError::UnknownFormat)
        );
    }

    #[test]
    fn test_zero_dimension_is_malformed() {
        assert!(matches!(
            ImageDecoder.decode(Bytes::from(png(0, 10))),
            Err(DecodeError::Malformed { format: "png", .. })
        ));
    }
}
