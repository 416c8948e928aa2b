use super::{ImageError, MemoryImage};

/// Places a raw binary at address 0
pub fn from_bytes(bytes: &[u8], capacity: usize) -> Result<MemoryImage, ImageError> {
    let mut image = MemoryImage::new(capacity);

    image.write(0, bytes)?;

    Ok(image)
}
