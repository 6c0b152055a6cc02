// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linux V4L2 and media controller request bindings.

// Translated from include/uapi/linux/videodev2.h, include/uapi/linux/v4l2-controls.h and
// include/uapi/linux/media.h. Only the subset used by stateless memory-to-memory decoders is
// present.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

#[macro_use]
pub mod ioctl;

use std::os::raw::c_int;
use std::os::raw::c_ulong;
use std::os::raw::c_void;

use static_assertions::const_assert_eq;

/// Implements `Default` as the all-zero bit pattern, which is how the kernel expects every one of
/// these structs to be initialized before filling the fields it reads.
macro_rules! zeroed_default {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    // SAFETY: plain C struct made of integers, arrays, unions of those and raw
                    // pointers, for which all-zero is a valid value.
                    unsafe { ::std::mem::zeroed() }
                }
            }
        )+
    };
}

/// Builds a V4L2 fourcc code from its four characters.
pub const fn v4l2_fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

pub const VIDEO_MAX_PLANES: usize = 8;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
pub const V4L2_BUF_TYPE_VIDEO_OUTPUT_MPLANE: u32 = 10;

pub const V4L2_MEMORY_MMAP: u32 = 1;

pub const V4L2_FIELD_NONE: u32 = 1;

pub const V4L2_CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
pub const V4L2_CAP_VIDEO_M2M: u32 = 0x0000_8000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_DEVICE_CAPS: u32 = 0x8000_0000;

pub const V4L2_BUF_CAP_SUPPORTS_MMAP: u32 = 1 << 0;
pub const V4L2_BUF_CAP_SUPPORTS_REQUESTS: u32 = 1 << 3;
pub const V4L2_BUF_CAP_SUPPORTS_ORPHANED_BUFS: u32 = 1 << 4;
pub const V4L2_BUF_CAP_SUPPORTS_M2M_HOLD_CAPTURE_BUF: u32 = 1 << 5;

pub const V4L2_BUF_FLAG_MAPPED: u32 = 0x0000_0001;
pub const V4L2_BUF_FLAG_QUEUED: u32 = 0x0000_0002;
pub const V4L2_BUF_FLAG_DONE: u32 = 0x0000_0004;
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;
pub const V4L2_BUF_FLAG_M2M_HOLD_CAPTURE_BUF: u32 = 0x0000_0200;
pub const V4L2_BUF_FLAG_TIMESTAMP_COPY: u32 = 0x0000_4000;
pub const V4L2_BUF_FLAG_REQUEST_FD: u32 = 0x0080_0000;

pub const V4L2_FRMSIZE_TYPE_DISCRETE: u32 = 1;
pub const V4L2_FRMSIZE_TYPE_CONTINUOUS: u32 = 2;
pub const V4L2_FRMSIZE_TYPE_STEPWISE: u32 = 3;

pub const V4L2_CTRL_WHICH_CUR_VAL: u32 = 0;
pub const V4L2_CTRL_WHICH_REQUEST_VAL: u32 = 0x0f01_0000;

pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;

// Stateless codec controls.
pub const V4L2_CTRL_CLASS_CODEC_STATELESS: u32 = 0x00a4_0000;
pub const V4L2_CID_CODEC_STATELESS_BASE: u32 = V4L2_CTRL_CLASS_CODEC_STATELESS | 0x900;

pub const V4L2_CID_STATELESS_H264_DECODE_MODE: u32 = V4L2_CID_CODEC_STATELESS_BASE;
pub const V4L2_CID_STATELESS_H264_START_CODE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 1;
pub const V4L2_CID_STATELESS_H264_SPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 2;
pub const V4L2_CID_STATELESS_H264_PPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 3;
pub const V4L2_CID_STATELESS_H264_SCALING_MATRIX: u32 = V4L2_CID_CODEC_STATELESS_BASE + 4;
pub const V4L2_CID_STATELESS_H264_PRED_WEIGHTS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 5;
pub const V4L2_CID_STATELESS_H264_SLICE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 6;
pub const V4L2_CID_STATELESS_H264_DECODE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 7;
pub const V4L2_CID_STATELESS_VP8_FRAME: u32 = V4L2_CID_CODEC_STATELESS_BASE + 200;
pub const V4L2_CID_STATELESS_MPEG2_SEQUENCE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 220;
pub const V4L2_CID_STATELESS_MPEG2_PICTURE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 221;
pub const V4L2_CID_STATELESS_MPEG2_QUANTISATION: u32 = V4L2_CID_CODEC_STATELESS_BASE + 222;
pub const V4L2_CID_STATELESS_VP9_FRAME: u32 = V4L2_CID_CODEC_STATELESS_BASE + 300;
pub const V4L2_CID_STATELESS_VP9_COMPRESSED_HDR: u32 = V4L2_CID_CODEC_STATELESS_BASE + 301;
pub const V4L2_CID_STATELESS_HEVC_SPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 400;
pub const V4L2_CID_STATELESS_HEVC_PPS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 401;
pub const V4L2_CID_STATELESS_HEVC_SLICE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 402;
pub const V4L2_CID_STATELESS_HEVC_SCALING_MATRIX: u32 = V4L2_CID_CODEC_STATELESS_BASE + 403;
pub const V4L2_CID_STATELESS_HEVC_DECODE_PARAMS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 404;
pub const V4L2_CID_STATELESS_HEVC_DECODE_MODE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 405;
pub const V4L2_CID_STATELESS_HEVC_START_CODE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 406;
pub const V4L2_CID_STATELESS_HEVC_ENTRY_POINT_OFFSETS: u32 = V4L2_CID_CODEC_STATELESS_BASE + 407;
pub const V4L2_CID_STATELESS_AV1_SEQUENCE: u32 = V4L2_CID_CODEC_STATELESS_BASE + 500;
pub const V4L2_CID_STATELESS_AV1_TILE_GROUP_ENTRY: u32 = V4L2_CID_CODEC_STATELESS_BASE + 501;
pub const V4L2_CID_STATELESS_AV1_FRAME: u32 = V4L2_CID_CODEC_STATELESS_BASE + 502;
pub const V4L2_CID_STATELESS_AV1_FILM_GRAIN: u32 = V4L2_CID_CODEC_STATELESS_BASE + 505;

// Compressed formats accepted by stateless decoders.
pub const V4L2_PIX_FMT_H264_SLICE: u32 = v4l2_fourcc(b'S', b'2', b'6', b'4');
pub const V4L2_PIX_FMT_HEVC_SLICE: u32 = v4l2_fourcc(b'S', b'2', b'6', b'5');
pub const V4L2_PIX_FMT_VP8_FRAME: u32 = v4l2_fourcc(b'V', b'P', b'8', b'F');
pub const V4L2_PIX_FMT_VP9_FRAME: u32 = v4l2_fourcc(b'V', b'P', b'9', b'F');
pub const V4L2_PIX_FMT_AV1_FRAME: u32 = v4l2_fourcc(b'A', b'V', b'1', b'F');
pub const V4L2_PIX_FMT_MPEG2_SLICE: u32 = v4l2_fourcc(b'M', b'G', b'2', b'S');

// Raw formats produced by stateless decoders.
pub const V4L2_PIX_FMT_NV12: u32 = v4l2_fourcc(b'N', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_NV21: u32 = v4l2_fourcc(b'N', b'V', b'2', b'1');
pub const V4L2_PIX_FMT_NV16: u32 = v4l2_fourcc(b'N', b'V', b'1', b'6');
pub const V4L2_PIX_FMT_NV61: u32 = v4l2_fourcc(b'N', b'V', b'6', b'1');
pub const V4L2_PIX_FMT_NV12M: u32 = v4l2_fourcc(b'N', b'M', b'1', b'2');
pub const V4L2_PIX_FMT_YUV420: u32 = v4l2_fourcc(b'Y', b'U', b'1', b'2');
pub const V4L2_PIX_FMT_YVU420: u32 = v4l2_fourcc(b'Y', b'V', b'1', b'2');
pub const V4L2_PIX_FMT_YUYV: u32 = v4l2_fourcc(b'Y', b'U', b'Y', b'V');
pub const V4L2_PIX_FMT_P010: u32 = v4l2_fourcc(b'P', b'0', b'1', b'0');

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_fmtdesc {
    pub index: u32,
    pub type_: u32,
    pub flags: u32,
    pub description: [u8; 32],
    pub pixelformat: u32,
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_format__bindgen_ty_1 {
    pub pix: v4l2_pix_format,
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u8; 200],
    // Other members hold pointers, which give the union 8 byte alignment.
    pub _align: [u64; 25],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format__bindgen_ty_1,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_frmsize_discrete {
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_frmsize_stepwise {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_frmsizeenum__bindgen_ty_1 {
    pub discrete: v4l2_frmsize_discrete,
    pub stepwise: v4l2_frmsize_stepwise,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_frmsizeenum {
    pub index: u32,
    pub pixel_format: u32,
    pub type_: u32,
    pub u: v4l2_frmsizeenum__bindgen_ty_1,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_plane__bindgen_ty_1 {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane__bindgen_ty_1,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer__bindgen_ty_1 {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_buffer__bindgen_ty_2 {
    pub request_fd: i32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer__bindgen_ty_1,
    pub length: u32,
    pub reserved2: u32,
    pub __bindgen_anon_1: v4l2_buffer__bindgen_ty_2,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union v4l2_ext_control__bindgen_ty_1 {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct v4l2_ext_control {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub __bindgen_anon_1: v4l2_ext_control__bindgen_ty_1,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct v4l2_ext_controls {
    pub which: u32,
    pub count: u32,
    pub error_idx: u32,
    pub request_fd: i32,
    pub reserved: [u32; 1],
    pub controls: *mut v4l2_ext_control,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct v4l2_query_ext_ctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; 4],
    pub reserved: [u32; 32],
}

zeroed_default!(
    v4l2_capability,
    v4l2_fmtdesc,
    v4l2_format,
    v4l2_frmsizeenum,
    v4l2_requestbuffers,
    v4l2_plane,
    v4l2_buffer,
    v4l2_exportbuffer,
    v4l2_ext_control,
    v4l2_ext_controls,
    v4l2_query_ext_ctrl,
);

#[cfg(target_pointer_width = "64")]
mod layout {
    use super::*;

    const_assert_eq!(std::mem::size_of::<v4l2_capability>(), 104);
    const_assert_eq!(std::mem::size_of::<v4l2_fmtdesc>(), 64);
    const_assert_eq!(std::mem::size_of::<v4l2_pix_format>(), 48);
    const_assert_eq!(std::mem::size_of::<v4l2_plane_pix_format>(), 20);
    const_assert_eq!(std::mem::size_of::<v4l2_pix_format_mplane>(), 192);
    const_assert_eq!(std::mem::size_of::<v4l2_format>(), 208);
    const_assert_eq!(std::mem::size_of::<v4l2_frmsizeenum>(), 44);
    const_assert_eq!(std::mem::size_of::<v4l2_requestbuffers>(), 20);
    const_assert_eq!(std::mem::size_of::<v4l2_plane>(), 64);
    const_assert_eq!(std::mem::size_of::<v4l2_buffer>(), 88);
    const_assert_eq!(std::mem::size_of::<v4l2_exportbuffer>(), 64);
    const_assert_eq!(std::mem::size_of::<v4l2_ext_control>(), 20);
    const_assert_eq!(std::mem::size_of::<v4l2_ext_controls>(), 32);
    const_assert_eq!(std::mem::size_of::<v4l2_query_ext_ctrl>(), 232);
}

const VIDEO: u32 = b'V' as u32;
const MEDIA: u32 = b'|' as u32;

ioctl_ior_nr!(VIDIOC_QUERYCAP, VIDEO, 0, v4l2_capability);
ioctl_iowr_nr!(VIDIOC_ENUM_FMT, VIDEO, 2, v4l2_fmtdesc);
ioctl_iowr_nr!(VIDIOC_G_FMT, VIDEO, 4, v4l2_format);
ioctl_iowr_nr!(VIDIOC_S_FMT, VIDEO, 5, v4l2_format);
ioctl_iowr_nr!(VIDIOC_REQBUFS, VIDEO, 8, v4l2_requestbuffers);
ioctl_iowr_nr!(VIDIOC_QUERYBUF, VIDEO, 9, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_QBUF, VIDEO, 15, v4l2_buffer);
ioctl_iowr_nr!(VIDIOC_EXPBUF, VIDEO, 16, v4l2_exportbuffer);
ioctl_iowr_nr!(VIDIOC_DQBUF, VIDEO, 17, v4l2_buffer);
ioctl_iow_nr!(VIDIOC_STREAMON, VIDEO, 18, c_int);
ioctl_iow_nr!(VIDIOC_STREAMOFF, VIDEO, 19, c_int);
ioctl_iowr_nr!(VIDIOC_G_EXT_CTRLS, VIDEO, 71, v4l2_ext_controls);
ioctl_iowr_nr!(VIDIOC_S_EXT_CTRLS, VIDEO, 72, v4l2_ext_controls);
ioctl_iowr_nr!(VIDIOC_ENUM_FRAMESIZES, VIDEO, 74, v4l2_frmsizeenum);
ioctl_iowr_nr!(VIDIOC_QUERY_EXT_CTRL, VIDEO, 103, v4l2_query_ext_ctrl);

ioctl_ior_nr!(MEDIA_IOC_REQUEST_ALLOC, MEDIA, 0x05, c_int);
ioctl_io_nr!(MEDIA_REQUEST_IOC_QUEUE, MEDIA, 0x80);
ioctl_io_nr!(MEDIA_REQUEST_IOC_REINIT, MEDIA, 0x81);
