//! Multi-page TIFF tile source.
//!
//! Pages are decoded lazily, one at a time, so that reading a tile only touches the pages it
//! intersects. Recently decoded pages are kept for two (time, depth) planes, so tiles visiting
//! every channel of a planar stack decode each page once. ImageJ hyperstack descriptions (`channels=`, `slices=`, `frames=`) are used to map
//! pages onto the time, depth and channel axes. Without one, every page is a depth slice.

use crate::array;
use crate::error::EngineError;
use crate::models::DType;
use crate::source::{check_region, MemorySource, TileSource};
use crate::tiles::Region;

use bytes::{Bytes, BytesMut};
use ndarray::Array5;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::{event, Level};
// Bring trait into scope to use as_bytes method.
use zerocopy::AsBytes;

type FileDecoder = Decoder<BufReader<File>>;

/// How channels are stored across pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Layout {
    /// One page per (time, depth) with channels as samples per pixel.
    Interleaved,
    /// One page per (time, depth, channel) with a single sample per pixel.
    Planar,
}

/// Axis sizes read from an ImageJ image description.
#[derive(Debug, Default, PartialEq)]
struct HyperstackAxes {
    channels: Option<usize>,
    slices: Option<usize>,
    frames: Option<usize>,
}

impl HyperstackAxes {
    fn parse(description: &str) -> Self {
        let mut axes = HyperstackAxes::default();
        for line in description.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().parse::<usize>().ok();
            match key.trim() {
                "channels" => axes.channels = value,
                "slices" => axes.slices = value,
                "frames" => axes.frames = value,
                _ => (),
            }
        }
        axes
    }
}

/// Decoder state shared between reads.
struct PageReader {
    decoder: FileDecoder,
    /// Index of the page the decoder is positioned at
    position: usize,
    /// Decoded pages, least recently used first
    cache: VecDeque<(usize, Arc<MemorySource>)>,
    /// Number of pages decoded so far
    decoded: usize,
}

/// Number of (time, depth) planes whose pages are kept decoded.
const CACHED_PLANES: usize = 2;

/// An image backed by a multi-page TIFF file.
pub struct TiffSource {
    path: PathBuf,
    shape: Vec<usize>,
    dtype: DType,
    layout: Layout,
    pages: usize,
    cache_pages: usize,
    reader: Mutex<PageReader>,
}

impl std::fmt::Debug for TiffSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiffSource")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("layout", &self.layout)
            .field("pages", &self.pages)
            .finish()
    }
}

fn open_decoder(path: &Path) -> Result<FileDecoder, EngineError> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

fn samples_per_pixel(color_type: ColorType) -> Result<usize, EngineError> {
    match color_type {
        ColorType::Gray(_) => Ok(1),
        ColorType::GrayA(_) => Ok(2),
        ColorType::RGB(_) => Ok(3),
        ColorType::RGBA(_) | ColorType::CMYK(_) => Ok(4),
        #[allow(unreachable_patterns)]
        other => Err(EngineError::UnsupportedTiff {
            reason: format!("colour type {:?}", other),
        }),
    }
}

/// Convert a decoded page into native-endian bytes and its element type.
fn page_data(result: DecodingResult) -> Result<(DType, Bytes), EngineError> {
    let (dtype, data) = match result {
        DecodingResult::U8(buf) => (DType::Uint8, array::aligned_copy(buf.as_bytes())),
        DecodingResult::U16(buf) => (DType::Uint16, array::aligned_copy(buf.as_bytes())),
        DecodingResult::U32(buf) => (DType::Uint32, array::aligned_copy(buf.as_bytes())),
        DecodingResult::U64(buf) => (DType::Uint64, array::aligned_copy(buf.as_bytes())),
        DecodingResult::I8(buf) => (DType::Int8, array::aligned_copy(buf.as_bytes())),
        DecodingResult::I16(buf) => (DType::Int16, array::aligned_copy(buf.as_bytes())),
        DecodingResult::I32(buf) => (DType::Int32, array::aligned_copy(buf.as_bytes())),
        DecodingResult::I64(buf) => (DType::Int64, array::aligned_copy(buf.as_bytes())),
        DecodingResult::F32(buf) => (DType::Float32, array::aligned_copy(buf.as_bytes())),
        DecodingResult::F64(buf) => (DType::Float64, array::aligned_copy(buf.as_bytes())),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(EngineError::UnsupportedTiff {
                reason: "sample format".to_string(),
            })
        }
    };
    Ok((dtype, data))
}

impl TiffSource {
    /// Open a TIFF file and work out its 5D shape.
    ///
    /// Only the first page is decoded; the remaining pages are counted but not read.
    ///
    /// # Arguments
    ///
    /// * `path`: Path to the TIFF file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;
        let (width, height) = decoder.dimensions()?;
        let samples = samples_per_pixel(decoder.colortype()?)?;
        let axes = decoder
            .get_tag_ascii_string(Tag::ImageDescription)
            .map(|description| HyperstackAxes::parse(&description))
            .unwrap_or_default();
        let (dtype, first) = page_data(decoder.read_image()?)?;

        let mut pages = 1;
        while decoder.more_images() {
            decoder.next_image()?;
            pages += 1;
        }

        let channels = axes.channels.unwrap_or(1);
        let layout = match (samples, channels) {
            (_, 1) => Layout::Interleaved,
            (samples, channels) if samples == channels => Layout::Interleaved,
            (1, _) => Layout::Planar,
            (samples, channels) => {
                return Err(EngineError::UnsupportedTiff {
                    reason: format!(
                        "{} samples per pixel with {} ImageJ channels",
                        samples, channels
                    ),
                })
            }
        };
        let planes = if layout == Layout::Planar {
            pages / channels
        } else {
            pages
        };
        let frames = axes.frames.unwrap_or(1);
        let slices = axes.slices.unwrap_or(planes / frames.max(1));
        let channels = if layout == Layout::Planar {
            channels
        } else {
            samples
        };
        let expected = match layout {
            Layout::Interleaved => frames * slices,
            Layout::Planar => frames * slices * channels,
        };
        if expected != pages {
            return Err(EngineError::UnsupportedTiff {
                reason: format!(
                    "{} pages do not match {} frames, {} slices and {} channels",
                    pages, frames, slices, channels
                ),
            });
        }

        let (height, width) = (height as usize, width as usize);
        let shape = vec![frames, slices, height, width, channels];
        let page_shape = vec![1, 1, height, width, samples];
        let first = Arc::new(MemorySource::new(first, page_shape, dtype)?);
        let pages_per_plane = match layout {
            Layout::Interleaved => 1,
            Layout::Planar => channels,
        };
        event!(
            Level::DEBUG,
            "Opened {} with shape {:?}, {} and {} pages",
            path.display(),
            shape,
            dtype,
            pages
        );
        Ok(TiffSource {
            path,
            shape,
            dtype,
            layout,
            pages,
            cache_pages: pages_per_plane * CACHED_PLANES,
            reader: Mutex::new(PageReader {
                decoder,
                position: pages - 1,
                cache: VecDeque::from([(0, first)]),
                decoded: 1,
            }),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn channels(&self) -> usize {
        self.shape[4]
    }

    /// Number of pages decoded since the file was opened.
    pub fn decoded_pages(&self) -> usize {
        self.reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .decoded
    }

    /// Index of the page holding (time, depth, channel).
    fn page_index(&self, time: usize, depth: usize, channel: usize) -> usize {
        let plane = time * self.shape[1] + depth;
        match self.layout {
            Layout::Interleaved => plane,
            Layout::Planar => plane * self.channels() + channel,
        }
    }

    /// Decode page `index`, or return it from the cache.
    fn page(&self, index: usize) -> Result<Arc<MemorySource>, EngineError> {
        let mut reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = reader.cache.iter().position(|(cached, _)| *cached == index) {
            if let Some(entry) = reader.cache.remove(slot) {
                let page = entry.1.clone();
                reader.cache.push_back(entry);
                return Ok(page);
            }
        }
        if index < reader.position {
            reader.decoder = open_decoder(&self.path)?;
            reader.position = 0;
        }
        while reader.position < index {
            reader.decoder.next_image()?;
            reader.position += 1;
        }
        let (width, height) = reader.decoder.dimensions()?;
        let samples = samples_per_pixel(reader.decoder.colortype()?)?;
        let page_shape = vec![1, 1, height as usize, width as usize, samples];
        let expected_samples = match self.layout {
            Layout::Interleaved => self.channels(),
            Layout::Planar => 1,
        };
        if page_shape[2..4] != self.shape[2..4] || samples != expected_samples {
            return Err(EngineError::UnsupportedTiff {
                reason: format!("page {} has shape {:?}", index, page_shape),
            });
        }
        let (dtype, data) = page_data(reader.decoder.read_image()?)?;
        if dtype != self.dtype {
            return Err(EngineError::UnsupportedTiff {
                reason: format!("page {} has data type {}", index, dtype),
            });
        }
        let page = Arc::new(MemorySource::new(data, page_shape, dtype)?);
        if reader.cache.len() >= self.cache_pages {
            reader.cache.pop_front();
        }
        reader.cache.push_back((index, page.clone()));
        reader.decoded += 1;
        event!(Level::TRACE, "Decoded page {} of {}", index, self.path.display());
        Ok(page)
    }
}

impl TileSource for TiffSource {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn read_region(&self, region: &Region) -> Result<Array5<f64>, EngineError> {
        check_region(region, &self.shape)?;
        let mut result = Array5::<f64>::zeros(region.extent);
        let (rows, cols) = (region.range(2), region.range(3));
        for t in region.range(0) {
            for z in region.range(1) {
                let planes: Vec<(usize, usize, Region)> = match self.layout {
                    Layout::Interleaved => vec![(
                        self.page_index(t, z, 0),
                        0,
                        Region::new(
                            [0, 0, rows.start, cols.start, region.start[4]],
                            [1, 1, rows.len(), cols.len(), region.extent[4]],
                        ),
                    )],
                    Layout::Planar => region
                        .range(4)
                        .map(|c| {
                            (
                                self.page_index(t, z, c),
                                c - region.start[4],
                                Region::new(
                                    [0, 0, rows.start, cols.start, 0],
                                    [1, 1, rows.len(), cols.len(), 1],
                                ),
                            )
                        })
                        .collect(),
                };
                for (index, channel_offset, page_region) in planes {
                    let values = self.page(index)?.read_region(&page_region)?;
                    let target = Region::new(
                        [t - region.start[0], z - region.start[1], 0, 0, channel_offset],
                        [1, 1, rows.len(), cols.len(), page_region.extent[4]],
                    );
                    target.slice_mut(result.view_mut()).assign(&values);
                }
            }
        }
        Ok(result)
    }

    fn read_bytes(&self) -> Result<Bytes, EngineError> {
        let element_size = self.dtype.size_of();
        let mut data = BytesMut::with_capacity(self.pages * self.page(0)?.data().len());
        for t in 0..self.shape[0] {
            for z in 0..self.shape[1] {
                match self.layout {
                    Layout::Interleaved => {
                        data.extend_from_slice(self.page(self.page_index(t, z, 0))?.data())
                    }
                    Layout::Planar => {
                        let planes = (0..self.channels())
                            .map(|c| self.page(self.page_index(t, z, c)))
                            .collect::<Result<Vec<_>, _>>()?;
                        let pixels = self.shape[2] * self.shape[3];
                        for pixel in 0..pixels {
                            let element = pixel * element_size..(pixel + 1) * element_size;
                            for plane in &planes {
                                data.extend_from_slice(&plane.data()[element.clone()]);
                            }
                        }
                    }
                }
            }
        }
        Ok(array::ensure_aligned(data.freeze()))
    }
}
