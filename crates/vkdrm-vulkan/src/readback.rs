use ash::vk;
use tracing::info;

use crate::error::VkError;
use crate::memory::OffscreenImage;

const BYTES_PER_PIXEL: usize = 4;

/// Round-to-nearest UNORM conversion of one channel.
fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Bytes a clear to `color` leaves in memory for one pixel of `format`.
pub fn expected_pixel(color: [f32; 4], format: vk::Format) -> Result<[u8; 4], VkError> {
    let [r, g, b, a] = color.map(unorm8);
    match format {
        vk::Format::B8G8R8A8_UNORM => Ok([b, g, r, a]),
        vk::Format::R8G8B8A8_UNORM => Ok([r, g, b, a]),
        other => Err(VkError::UnsupportedFormat(other)),
    }
}

/// Check that every pixel of a `width` x `height` 32bpp subresource equals
/// `expected`, within `tolerance` per channel. Rows are located through the
/// subresource offset and row pitch, never assumed tightly packed.
pub fn verify_solid(
    bytes: &[u8],
    layout: &vk::SubresourceLayout,
    width: u32,
    height: u32,
    expected: [u8; 4],
    tolerance: u8,
) -> Result<(), VkError> {
    let offset = layout.offset as usize;
    let pitch = layout.row_pitch as usize;
    let row_bytes = width as usize * BYTES_PER_PIXEL;

    if height > 0 {
        let needed = offset + pitch * (height as usize - 1) + row_bytes;
        if bytes.len() < needed {
            return Err(VkError::ShortImageData {
                needed,
                available: bytes.len(),
            });
        }
    }

    for y in 0..height {
        let start = offset + pitch * y as usize;
        let row: &[[u8; 4]] = bytemuck::cast_slice(&bytes[start..start + row_bytes]);
        if let Some(x) = row
            .iter()
            .position(|px| !channels_match(*px, expected, tolerance))
        {
            return Err(VkError::PixelMismatch {
                x: x as u32,
                y,
                found: row[x],
                expected,
            });
        }
    }
    Ok(())
}

fn channels_match(found: [u8; 4], expected: [u8; 4], tolerance: u8) -> bool {
    found
        .iter()
        .zip(expected.iter())
        .all(|(f, e)| f.abs_diff(*e) <= tolerance)
}

/// Map the image and check it holds a solid clear to `color`.
pub fn verify_clear(image: &OffscreenImage<'_>, color: [f32; 4], tolerance: u8) -> Result<(), VkError> {
    let expected = expected_pixel(color, image.format())?;
    let layout = image.subresource_layout();
    let extent = image.extent();
    image.with_mapped(|bytes| {
        verify_solid(bytes, &layout, extent.width, extent.height, expected, tolerance)
    })??;
    info!(
        "readback ok: {}x{} pixels equal {:?} (row pitch {})",
        extent.width, extent.height, expected, layout.row_pitch
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAR: [f32; 4] = [0.898_437_5, 0.898_437_5, 0.976_562_5, 1.0];

    fn layout(offset: u64, row_pitch: u64, height: u64) -> vk::SubresourceLayout {
        vk::SubresourceLayout {
            offset,
            size: row_pitch * height,
            row_pitch,
            array_pitch: 0,
            depth_pitch: 0,
        }
    }

    fn fill(width: u32, height: u32, pitch: usize, offset: usize, px: [u8; 4]) -> Vec<u8> {
        let mut bytes = vec![0u8; offset + pitch * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let at = offset + y * pitch + x * 4;
                bytes[at..at + 4].copy_from_slice(&px);
            }
        }
        bytes
    }

    #[test]
    fn clear_colour_in_bgra_storage() {
        assert_eq!(
            expected_pixel(CLEAR, vk::Format::B8G8R8A8_UNORM).unwrap(),
            [249, 229, 229, 255]
        );
        assert_eq!(
            expected_pixel(CLEAR, vk::Format::R8G8B8A8_UNORM).unwrap(),
            [229, 229, 249, 255]
        );
    }

    #[test]
    fn unsupported_format_is_rejected() {
        assert!(matches!(
            expected_pixel(CLEAR, vk::Format::R16G16B16A16_SFLOAT),
            Err(VkError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn padded_rows_are_skipped() {
        let px = [249, 229, 229, 255];
        // 5 pixels wide, pitch padded to 32 bytes, garbage in the padding.
        let mut bytes = fill(5, 3, 32, 0, px);
        for y in 0..3 {
            bytes[y * 32 + 20..y * 32 + 32].fill(0xAB);
        }
        verify_solid(&bytes, &layout(0, 32, 3), 5, 3, px, 0).unwrap();
    }

    #[test]
    fn honours_subresource_offset() {
        let px = [1, 2, 3, 4];
        let bytes = fill(4, 2, 16, 64, px);
        verify_solid(&bytes, &layout(64, 16, 2), 4, 2, px, 0).unwrap();
    }

    #[test]
    fn reports_first_mismatch() {
        let px = [249, 229, 229, 255];
        let mut bytes = fill(4, 4, 16, 0, px);
        bytes[2 * 16 + 3 * 4] = 0;
        match verify_solid(&bytes, &layout(0, 16, 4), 4, 4, px, 0) {
            Err(VkError::PixelMismatch { x, y, found, .. }) => {
                assert_eq!((x, y), (3, 2));
                assert_eq!(found, [0, 229, 229, 255]);
            }
            other => panic!("expected PixelMismatch, got {:?}", other),
        }
    }

    #[test]
    fn tolerance_allows_rounding_differences() {
        let expected = [249, 229, 229, 255];
        let bytes = fill(2, 2, 8, 0, [248, 230, 229, 255]);
        assert!(verify_solid(&bytes, &layout(0, 8, 2), 2, 2, expected, 0).is_err());
        verify_solid(&bytes, &layout(0, 8, 2), 2, 2, expected, 1).unwrap();
    }

    #[test]
    fn short_buffer_is_an_error() {
        let bytes = vec![0u8; 10];
        assert!(matches!(
            verify_solid(&bytes, &layout(0, 16, 2), 4, 2, [0; 4], 0),
            Err(VkError::ShortImageData { needed: 32, available: 10 })
        ));
    }
}
