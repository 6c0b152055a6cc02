// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel formats, buffer directions and the memory layout of decoded pictures.

use std::fmt;
use std::fmt::Display;

use enumn::N;
use v4l2_sys::*;

/// Side of the memory-to-memory device a buffer belongs to.
///
/// `Input` carries coded bitstream (the V4L2 OUTPUT queue) and `Output` carries decoded pictures
/// (the V4L2 CAPTURE queue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn buf_type(self, mplane: bool) -> u32 {
        match (self, mplane) {
            (Direction::Input, false) => V4L2_BUF_TYPE_VIDEO_OUTPUT,
            (Direction::Input, true) => V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE,
            (Direction::Output, false) => V4L2_BUF_TYPE_VIDEO_CAPTURE,
            (Direction::Output, true) => V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A V4L2 four character code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn from_bytes(b: &[u8; 4]) -> Self {
        Fourcc(v4l2_fourcc(b[0], b[1], b[2], b[3]))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Fourcc({})", self)
    }
}

impl From<u32> for Fourcc {
    fn from(v: u32) -> Self {
        Fourcc(v)
    }
}

/// Coded formats accepted by stateless decoders.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum CodedFormat {
    H264 = V4L2_PIX_FMT_H264_SLICE,
    Hevc = V4L2_PIX_FMT_HEVC_SLICE,
    VP8 = V4L2_PIX_FMT_VP8_FRAME,
    VP9 = V4L2_PIX_FMT_VP9_FRAME,
    AV1 = V4L2_PIX_FMT_AV1_FRAME,
    Mpeg2 = V4L2_PIX_FMT_MPEG2_SLICE,
}

impl CodedFormat {
    pub fn from_fourcc(fourcc: Fourcc) -> Option<Self> {
        Self::n(fourcc.0)
    }

    pub fn fourcc(self) -> Fourcc {
        Fourcc(self as u32)
    }

    /// Whether frames of this format are usually split over several requests.
    pub fn is_slice_based(self) -> bool {
        matches!(self, CodedFormat::H264 | CodedFormat::Hevc | CodedFormat::Mpeg2)
    }
}

impl Display for CodedFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use CodedFormat::*;
        match self {
            H264 => write!(f, "H264"),
            Hevc => write!(f, "HEVC"),
            VP8 => write!(f, "VP8"),
            VP9 => write!(f, "VP9"),
            AV1 => write!(f, "AV1"),
            Mpeg2 => write!(f, "MPEG2"),
        }
    }
}

/// Decoded formats whose memory layout is understood.
#[derive(PartialEq, Eq, PartialOrd, Ord, N, Clone, Copy, Debug)]
#[repr(u32)]
pub enum DecodedFormat {
    NV12 = V4L2_PIX_FMT_NV12,
    NV21 = V4L2_PIX_FMT_NV21,
    NV16 = V4L2_PIX_FMT_NV16,
    NV61 = V4L2_PIX_FMT_NV61,
    NV12M = V4L2_PIX_FMT_NV12M,
    YUV420 = V4L2_PIX_FMT_YUV420,
    YVU420 = V4L2_PIX_FMT_YVU420,
    YUYV = V4L2_PIX_FMT_YUYV,
    P010 = V4L2_PIX_FMT_P010,
}

/// Shape of one plane relative to the first one: stride as a fraction of the first plane's
/// stride, and a vertical subsampling divisor.
#[derive(Debug, Clone, Copy)]
struct PlaneShape {
    stride_num: u32,
    stride_den: u32,
    vsub: u32,
}

const fn shape(stride_num: u32, stride_den: u32, vsub: u32) -> PlaneShape {
    PlaneShape {
        stride_num,
        stride_den,
        vsub,
    }
}

const SEMI_PLANAR_420: [PlaneShape; 2] = [shape(1, 1, 1), shape(1, 1, 2)];
const SEMI_PLANAR_422: [PlaneShape; 2] = [shape(1, 1, 1), shape(1, 1, 1)];
const PLANAR_420: [PlaneShape; 3] = [shape(1, 1, 1), shape(1, 2, 2), shape(1, 2, 2)];
const PACKED: [PlaneShape; 1] = [shape(1, 1, 1)];

impl DecodedFormat {
    pub fn from_fourcc(fourcc: Fourcc) -> Option<Self> {
        Self::n(fourcc.0)
    }

    pub fn fourcc(self) -> Fourcc {
        Fourcc(self as u32)
    }

    /// Number of separate memory buffers a picture of this format occupies.
    pub fn memory_planes(self) -> usize {
        match self {
            DecodedFormat::NV12M => 2,
            _ => 1,
        }
    }

    fn planes(self) -> &'static [PlaneShape] {
        use DecodedFormat::*;
        match self {
            NV12 | NV21 | NV12M | P010 => &SEMI_PLANAR_420,
            NV16 | NV61 => &SEMI_PLANAR_422,
            YUV420 | YVU420 => &PLANAR_420,
            YUYV => &PACKED,
        }
    }
}

impl Display for DecodedFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.fourcc())
    }
}

/// Per memory plane sizing reported by the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaneFormat {
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// A format as set on or read back from one queue of the device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Format {
    pub fourcc: Fourcc,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneFormat>,
}

/// Bitstream buffer size hint for a coded stream of the given dimensions: one uncompressed 4:2:0
/// frame at `bit_depth`, with macroblock aligned dimensions.
pub fn sink_size_image(width: u32, height: u32, bit_depth: u32) -> u32 {
    let w = width.next_multiple_of(16) as u64;
    let h = height.next_multiple_of(16) as u64;
    let bits = w * h * 3 / 2 * bit_depth.max(8) as u64;
    u32::try_from(bits / 8).unwrap_or(u32::MAX)
}

/// Placement of one image plane inside the picture's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub memory_plane: usize,
    pub offset: usize,
    pub stride: u32,
    pub size: usize,
}

/// Memory layout of a decoded picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: DecodedFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<PlaneLayout>,
}

impl VideoInfo {
    /// Derives plane offsets and strides from what the driver reported for the capture queue.
    ///
    /// Formats using a single memory buffer are laid out contiguously, with the padded height
    /// inferred from the image size so that driver alignment is honoured.
    pub fn from_format(format: &Format) -> Option<VideoInfo> {
        let decoded = DecodedFormat::from_fourcc(format.fourcc)?;
        let shapes = decoded.planes();
        let first = format.planes.first()?;
        let stride0 = first.bytes_per_line;

        let mut planes = Vec::with_capacity(shapes.len());
        if decoded.memory_planes() > 1 {
            if format.planes.len() < shapes.len() {
                return None;
            }
            for (i, pf) in format.planes.iter().take(shapes.len()).enumerate() {
                planes.push(PlaneLayout {
                    memory_plane: i,
                    offset: 0,
                    stride: pf.bytes_per_line,
                    size: pf.size_image as usize,
                });
            }
        } else {
            if stride0 == 0 {
                return None;
            }
            // Sum of the per-row bytes over all planes, doubled to keep 2x subsampling integral.
            let row_bytes2: u64 = shapes
                .iter()
                .map(|s| {
                    let stride = stride0 as u64 * s.stride_num as u64 / s.stride_den as u64;
                    2 * stride / s.vsub as u64
                })
                .sum();
            let padded_height = (2 * first.size_image as u64 / row_bytes2).max(format.height as u64);

            let mut offset = 0usize;
            for s in shapes {
                let stride = stride0 * s.stride_num / s.stride_den;
                let rows = padded_height.div_ceil(s.vsub as u64);
                let size = (stride as u64 * rows) as usize;
                planes.push(PlaneLayout {
                    memory_plane: 0,
                    offset,
                    stride,
                    size,
                });
                offset += size;
            }
        }

        Some(VideoInfo {
            format: decoded,
            width: format.width,
            height: format.height,
            planes,
        })
    }

    /// Total bytes of every plane stored in `memory_plane`.
    pub fn memory_plane_size(&self, memory_plane: usize) -> usize {
        self.planes
            .iter()
            .filter(|p| p.memory_plane == memory_plane)
            .map(|p| p.offset + p.size)
            .max()
            .unwrap_or(0)
    }
}

/// Frame sizes supported for one coded format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSizeRange {
    Discrete {
        width: u32,
        height: u32,
    },
    /// Continuous ranges are reported with a step of 1.
    Stepwise {
        min_width: u32,
        max_width: u32,
        step_width: u32,
        min_height: u32,
        max_height: u32,
        step_height: u32,
    },
}

impl FrameSizeRange {
    pub fn max_size(&self) -> (u32, u32) {
        match *self {
            FrameSizeRange::Discrete { width, height } => (width, height),
            FrameSizeRange::Stepwise {
                max_width,
                max_height,
                ..
            } => (max_width, max_height),
        }
    }
}

impl Display for FrameSizeRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FrameSizeRange::Discrete { width, height } => write!(f, "{}x{}", width, height),
            FrameSizeRange::Stepwise {
                min_width,
                max_width,
                step_width,
                min_height,
                max_height,
                step_height,
            } => write!(
                f,
                "{}-{}/{} x {}-{}/{}",
                min_width, max_width, step_width, min_height, max_height, step_height
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(CodedFormat::Hevc.fourcc().to_string(), "S265");
        assert_eq!(Fourcc::from_bytes(b"NV12"), DecodedFormat::NV12.fourcc());
        assert_eq!(Fourcc(0x0100_4142).to_string(), "BA..");
        assert_eq!(
            CodedFormat::from_fourcc(Fourcc::from_bytes(b"AV1F")),
            Some(CodedFormat::AV1)
        );
        assert_eq!(CodedFormat::from_fourcc(Fourcc::from_bytes(b"NV12")), None);
    }

    #[test]
    fn nv12_layout_uses_padded_height() {
        // 1920x1080 aligned to 1088 lines by the driver.
        let format = Format {
            fourcc: DecodedFormat::NV12.fourcc(),
            width: 1920,
            height: 1080,
            planes: vec![PlaneFormat {
                bytes_per_line: 1920,
                size_image: 1920 * 1088 * 3 / 2,
            }],
        };
        let info = VideoInfo::from_format(&format).unwrap();
        assert_eq!(info.planes.len(), 2);
        assert_eq!(info.planes[0].offset, 0);
        assert_eq!(info.planes[1].offset, 1920 * 1088);
        assert_eq!(info.planes[1].stride, 1920);
        assert_eq!(info.planes[1].size, 1920 * 544);
        assert_eq!(info.memory_plane_size(0), 1920 * 1088 * 3 / 2);
    }

    #[test]
    fn yuv420_chroma_is_half_stride() {
        let format = Format {
            fourcc: DecodedFormat::YUV420.fourcc(),
            width: 320,
            height: 240,
            planes: vec![PlaneFormat {
                bytes_per_line: 320,
                size_image: 320 * 240 * 3 / 2,
            }],
        };
        let info = VideoInfo::from_format(&format).unwrap();
        assert_eq!(info.planes[1].stride, 160);
        assert_eq!(info.planes[1].offset, 320 * 240);
        assert_eq!(info.planes[2].offset, 320 * 240 + 160 * 120);
    }

    #[test]
    fn multi_memory_plane_layout() {
        let format = Format {
            fourcc: DecodedFormat::NV12M.fourcc(),
            width: 64,
            height: 64,
            planes: vec![
                PlaneFormat {
                    bytes_per_line: 64,
                    size_image: 4096,
                },
                PlaneFormat {
                    bytes_per_line: 64,
                    size_image: 2048,
                },
            ],
        };
        let info = VideoInfo::from_format(&format).unwrap();
        assert_eq!(info.planes[1].memory_plane, 1);
        assert_eq!(info.planes[1].offset, 0);
        assert_eq!(info.memory_plane_size(1), 2048);
    }

    #[test]
    fn unknown_formats_have_no_layout() {
        let format = Format {
            fourcc: Fourcc::from_bytes(b"MM21"),
            width: 64,
            height: 64,
            planes: vec![PlaneFormat::default()],
        };
        assert!(VideoInfo::from_format(&format).is_none());
    }

    #[test]
    fn plane_counts() {
        use DecodedFormat::*;
        for (format, planes) in [
            (NV12, 2),
            (NV21, 2),
            (NV12M, 2),
            (P010, 2),
            (NV16, 2),
            (NV61, 2),
            (YUV420, 3),
            (YVU420, 3),
            (YUYV, 1),
        ] {
            assert_eq!(format.planes().len(), planes, "{}", format);
        }
        assert_eq!(NV16.planes()[1].vsub, 1);
        assert_eq!(YVU420.planes()[2].stride_den, 2);
    }

    #[test]
    fn bitstream_size_hint() {
        assert_eq!(sink_size_image(1920, 1080, 8), 1920 * 1088 * 3 / 2);
        assert_eq!(sink_size_image(1920, 1080, 10), 1920 * 1088 * 3 / 2 * 10 / 8);
    }
}
