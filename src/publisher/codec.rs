use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::{ImageBuffer, ImageEncoder, Rgb};

use crate::error::EncodeError;
use crate::frame::FrameBuffer;

/// Resizes a raw buffer to `(target_height, target_width)` using
/// area-weighted averaging (`image`'s `Triangle` filter is the closest stock
/// equivalent to OpenCV's `INTER_AREA`).
pub fn resize(buffer: &FrameBuffer, target_height: u32, target_width: u32) -> Result<FrameBuffer, EncodeError> {
    let Some((height, width, channel)) = buffer.shape else {
        return Err(EncodeError::Backend("cannot resize an already-encoded buffer".to_string()));
    };
    if channel != 3 {
        return Err(EncodeError::Backend(format!(
            "resize only supports 3-channel buffers, got {}",
            channel
        )));
    }

    let image: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, buffer.data.clone())
        .ok_or_else(|| EncodeError::Backend("buffer length does not match declared shape".to_string()))?;

    let resized = image::imageops::resize(
        &image,
        target_width,
        target_height,
        image::imageops::FilterType::Triangle,
    );

    Ok(FrameBuffer::raw(resized.into_raw(), target_height, target_width, 3))
}

/// Encodes a raw buffer per the `(kind, level)` descriptor. `jpg` levels are
/// 0-100 quality; `png` levels are 0-9, bucketed into the `image` crate's
/// three-tier `CompressionType`. An out-of-range level or an unsupported
/// `kind` is logged and the buffer is handed back unchanged — encoding
/// failures never drop the record, matching the original's "log and leave
/// unchanged" policy. Already-encoded buffers (no shape) pass through as-is.
pub fn encode(buffer: FrameBuffer, kind: &str, level: i64) -> FrameBuffer {
    let Some((height, width, channel)) = buffer.shape else {
        return buffer;
    };
    if channel != 3 {
        log::warn!("encode only supports 3-channel buffers, got {}, leaving unchanged", channel);
        return buffer;
    }

    match kind {
        "jpg" | "jpeg" => {
            if !(0..=100).contains(&level) {
                log::warn!("JPG encoding value must be between 0-100, got {}", level);
                return buffer;
            }
            match encode_jpeg(&buffer.data, height, width, level) {
                Ok(encoded) => encoded,
                Err(e) => {
                    log::error!("jpeg encode failed, leaving buffer unchanged: {}", e);
                    buffer
                }
            }
        }
        "png" => {
            if !(0..=9).contains(&level) {
                log::warn!("PNG encoding value must be between 0-9, got {}", level);
                return buffer;
            }
            match encode_png(&buffer.data, height, width, level) {
                Ok(encoded) => encoded,
                Err(e) => {
                    log::error!("png encode failed, leaving buffer unchanged: {}", e);
                    buffer
                }
            }
        }
        other => {
            log::warn!("{} is not supported, leaving buffer unchanged", other);
            buffer
        }
    }
}

fn encode_jpeg(data: &[u8], height: u32, width: u32, level: i64) -> Result<FrameBuffer, EncodeError> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, level as u8);
        encoder
            .encode(data, width, height, image::ExtendedColorType::Rgb8)
            .map_err(|e| EncodeError::Backend(e.to_string()))?;
    }
    Ok(FrameBuffer::encoded(out))
}

fn encode_png(data: &[u8], height: u32, width: u32, level: i64) -> Result<FrameBuffer, EncodeError> {
    let compression = match level {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    };
    let mut out = Vec::new();
    {
        let encoder = PngEncoder::new_with_quality(Cursor::new(&mut out), compression, PngFilterType::Adaptive);
        encoder
            .write_image(data, width, height, image::ExtendedColorType::Rgb8)
            .map_err(|e| EncodeError::Backend(e.to_string()))?;
    }
    Ok(FrameBuffer::encoded(out))
}
