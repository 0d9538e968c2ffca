use crate::image::ImageArray;
use crate::source::MemorySource;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

/// A (2, 1, 4, 4, 2) uint16 image holding 0..64 in C order.
///
/// Channel 0 holds the even values and channel 1 the odd ones.
pub(crate) fn ramp_image() -> ImageArray {
    let source = MemorySource::from_vec((0..64).collect::<Vec<u16>>(), vec![2, 1, 4, 4, 2]).unwrap();
    ImageArray::from_memory(source).unwrap()
}

/// A unique path in the temporary directory. Nothing is created.
pub(crate) fn temp_path(extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("tilestack-{}.{}", uuid::Uuid::new_v4(), extension))
}

/// Write a multi-page 16-bit grayscale TIFF file.
///
/// `description` is written as the image description of the first page, as ImageJ does.
pub(crate) fn write_gray16_tiff(
    path: &Path,
    width: u32,
    height: u32,
    pages: &[Vec<u16>],
    description: Option<&str>,
) {
    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path).unwrap())).unwrap();
    for (index, page) in pages.iter().enumerate() {
        let mut image = encoder
            .new_image::<colortype::Gray16>(width, height)
            .unwrap();
        if let (0, Some(description)) = (index, description) {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description)
                .unwrap();
        }
        image.write_data(page).unwrap();
    }
}
