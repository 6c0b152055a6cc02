// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder device backed by a V4L2 memory-to-memory node and its media controller.

use std::ffi::CStr;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::FromRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::os::raw::c_void;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use log::debug;
use v4l2_sys::ioctl::ioctl;
use v4l2_sys::ioctl::ioctl_with_mut_ref;
use v4l2_sys::ioctl::ioctl_with_ref;
use v4l2_sys::ioctl::IoctlNr;
use v4l2_sys::*;

use crate::config::DecoderConfig;
use crate::device::Capabilities;
use crate::device::Control;
use crate::device::ControlInfo;
use crate::device::ControlKind;
use crate::device::ControlReading;
use crate::device::ControlValue;
use crate::device::DecoderDevice;
use crate::device::DequeuedBuffer;
use crate::device::ExportedPlane;
use crate::device::KernelVersion;
use crate::device::MediaRequest;
use crate::device::QueuedBuffer;
use crate::device::ReservedBuffers;
use crate::error::Error;
use crate::error::Result;
use crate::format::Direction;
use crate::format::Format;
use crate::format::Fourcc;
use crate::format::FrameSizeRange;
use crate::format::PlaneFormat;

pub(crate) fn timeval_from_us(us: u64) -> libc::timeval {
    libc::timeval {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_usec: (us % 1_000_000) as libc::suseconds_t,
    }
}

pub(crate) fn us_from_timeval(tv: &libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1_000_000 + tv.tv_usec as u64
}

fn cstr_field(bytes: &[u8]) -> String {
    CStr::from_bytes_until_nul(bytes)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(bytes).into_owned())
}

fn check(ret: c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Maps the end-of-enumeration error to `None`.
fn end_on_einval<T>(r: io::Result<T>) -> io::Result<Option<T>> {
    match r {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(None),
        Err(e) => Err(e),
    }
}

fn open_node(path: &Path, nonblock: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    options.custom_flags(if nonblock {
        libc::O_NONBLOCK | libc::O_CLOEXEC
    } else {
        libc::O_CLOEXEC
    });
    options.open(path).map_err(|source| Error::DeviceOpen {
        path: path.to_owned(),
        source,
    })
}

/// A media request file descriptor.
#[derive(Debug)]
pub struct V4l2Request {
    fd: OwnedFd,
}

impl MediaRequest for V4l2Request {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn queue(&self) -> io::Result<()> {
        // SAFETY: the request ioctls take no argument and `fd` is a valid request descriptor.
        check(unsafe { ioctl(&self.fd, MEDIA_REQUEST_IOC_QUEUE()) })
    }

    fn reinit(&self) -> io::Result<()> {
        // SAFETY: see `queue`.
        check(unsafe { ioctl(&self.fd, MEDIA_REQUEST_IOC_REINIT()) })
    }

    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLPRI,
            revents: 0,
        };
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        loop {
            // SAFETY: `pfd` is a valid pollfd and the count passed is 1.
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            return Ok(ret > 0);
        }
    }
}

pub struct V4l2Device {
    media: File,
    video: File,
    caps: Capabilities,
}

impl V4l2Device {
    fn video_ioctl<T>(&self, nr: IoctlNr, arg: &mut T) -> io::Result<()> {
        // SAFETY: every caller passes the struct type matching `nr`, which the kernel only
        // accesses within its size.
        check(unsafe { ioctl_with_mut_ref(&self.video, nr, arg) })
    }

    fn buf_type(&self, direction: Direction) -> u32 {
        direction.buf_type(self.caps.mplane)
    }

    fn query_capabilities(video: &File) -> Result<Capabilities> {
        let mut cap = v4l2_capability::default();
        // SAFETY: `cap` is a v4l2_capability, as VIDIOC_QUERYCAP expects.
        check(unsafe { ioctl_with_mut_ref(video, VIDIOC_QUERYCAP(), &mut cap) })
            .map_err(Error::QueryCapabilities)?;

        let device_caps = if cap.capabilities & V4L2_CAP_DEVICE_CAPS != 0 {
            cap.device_caps
        } else {
            cap.capabilities
        };
        let mplane = if device_caps & V4L2_CAP_VIDEO_M2M_MPLANE != 0 {
            true
        } else if device_caps & V4L2_CAP_VIDEO_M2M != 0 {
            false
        } else {
            return Err(Error::UnsupportedDevice);
        };
        if device_caps & V4L2_CAP_STREAMING == 0 {
            return Err(Error::UnsupportedDevice);
        }

        Ok(Capabilities {
            driver: cstr_field(&cap.driver),
            card: cstr_field(&cap.card),
            bus_info: cstr_field(&cap.bus_info),
            version: KernelVersion::from(cap.version),
            device_caps,
            mplane,
        })
    }

    fn format_from_raw(&self, raw: &v4l2_format) -> Format {
        if self.caps.mplane {
            // SAFETY: the driver filled the multi-planar member for a multi-planar buffer type.
            let pix_mp = unsafe { raw.fmt.pix_mp };
            let num_planes = (pix_mp.num_planes as usize).min(VIDEO_MAX_PLANES);
            Format {
                fourcc: Fourcc(pix_mp.pixelformat),
                width: pix_mp.width,
                height: pix_mp.height,
                planes: pix_mp.plane_fmt[..num_planes]
                    .iter()
                    .map(|p| PlaneFormat {
                        bytes_per_line: p.bytesperline,
                        size_image: p.sizeimage,
                    })
                    .collect(),
            }
        } else {
            // SAFETY: the driver filled the single-planar member for a single-planar buffer type.
            let pix = unsafe { raw.fmt.pix };
            Format {
                fourcc: Fourcc(pix.pixelformat),
                width: pix.width,
                height: pix.height,
                planes: vec![PlaneFormat {
                    bytes_per_line: pix.bytesperline,
                    size_image: pix.sizeimage,
                }],
            }
        }
    }
}

impl DecoderDevice for V4l2Device {
    type Request = V4l2Request;

    fn open(config: &DecoderConfig) -> Result<Self> {
        let media = open_node(&config.media_device, false)?;
        let video = open_node(&config.video_device, true)?;
        let caps = Self::query_capabilities(&video)?;
        debug!(
            "opened {} ({}) on {}, {} API",
            caps.card,
            caps.driver,
            config.video_device.display(),
            if caps.mplane { "multi-planar" } else { "single-planar" }
        );
        Ok(V4l2Device { media, video, caps })
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn enum_format(&self, direction: Direction, index: u32) -> io::Result<Option<Fourcc>> {
        let mut fmtdesc = v4l2_fmtdesc {
            index,
            type_: self.buf_type(direction),
            ..Default::default()
        };
        end_on_einval(self.video_ioctl(VIDIOC_ENUM_FMT(), &mut fmtdesc))
            .map(|r| r.map(|()| Fourcc(fmtdesc.pixelformat)))
    }

    fn enum_frame_sizes(&self, fourcc: Fourcc, index: u32) -> io::Result<Option<FrameSizeRange>> {
        let mut size = v4l2_frmsizeenum {
            index,
            pixel_format: fourcc.0,
            ..Default::default()
        };
        let found = end_on_einval(self.video_ioctl(VIDIOC_ENUM_FRAMESIZES(), &mut size))?;
        if found.is_none() {
            return Ok(None);
        }
        // SAFETY: the member read matches the type reported by the driver.
        let range = unsafe {
            match size.type_ {
                V4L2_FRMSIZE_TYPE_DISCRETE => FrameSizeRange::Discrete {
                    width: size.u.discrete.width,
                    height: size.u.discrete.height,
                },
                V4L2_FRMSIZE_TYPE_CONTINUOUS => FrameSizeRange::Stepwise {
                    min_width: size.u.stepwise.min_width,
                    max_width: size.u.stepwise.max_width,
                    step_width: 1,
                    min_height: size.u.stepwise.min_height,
                    max_height: size.u.stepwise.max_height,
                    step_height: 1,
                },
                _ => FrameSizeRange::Stepwise {
                    min_width: size.u.stepwise.min_width,
                    max_width: size.u.stepwise.max_width,
                    step_width: size.u.stepwise.step_width,
                    min_height: size.u.stepwise.min_height,
                    max_height: size.u.stepwise.max_height,
                    step_height: size.u.stepwise.step_height,
                },
            }
        };
        Ok(Some(range))
    }

    fn get_format(&self, direction: Direction) -> io::Result<Format> {
        let mut raw = v4l2_format {
            type_: self.buf_type(direction),
            ..Default::default()
        };
        self.video_ioctl(VIDIOC_G_FMT(), &mut raw)?;
        Ok(self.format_from_raw(&raw))
    }

    fn set_format(&self, direction: Direction, format: &Format) -> io::Result<Format> {
        let mut raw = v4l2_format {
            type_: self.buf_type(direction),
            ..Default::default()
        };
        if self.caps.mplane {
            // SAFETY: writes to plain integer members of the multi-planar format.
            unsafe {
                let pix_mp = &mut raw.fmt.pix_mp;
                pix_mp.width = format.width;
                pix_mp.height = format.height;
                pix_mp.pixelformat = format.fourcc.0;
                pix_mp.field = V4L2_FIELD_NONE;
                pix_mp.num_planes = format.planes.len().clamp(1, VIDEO_MAX_PLANES) as u8;
                for (dst, src) in pix_mp.plane_fmt.iter_mut().zip(&format.planes) {
                    dst.sizeimage = src.size_image;
                    dst.bytesperline = src.bytes_per_line;
                }
            }
        } else {
            // SAFETY: writes to plain integer members of the single-planar format.
            unsafe {
                let pix = &mut raw.fmt.pix;
                pix.width = format.width;
                pix.height = format.height;
                pix.pixelformat = format.fourcc.0;
                pix.field = V4L2_FIELD_NONE;
                if let Some(plane) = format.planes.first() {
                    pix.sizeimage = plane.size_image;
                    pix.bytesperline = plane.bytes_per_line;
                }
            }
        }
        self.video_ioctl(VIDIOC_S_FMT(), &mut raw)?;
        Ok(self.format_from_raw(&raw))
    }

    fn request_buffers(&self, direction: Direction, count: u32) -> io::Result<ReservedBuffers> {
        let mut reqbufs = v4l2_requestbuffers {
            count,
            type_: self.buf_type(direction),
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        self.video_ioctl(VIDIOC_REQBUFS(), &mut reqbufs)?;
        Ok(ReservedBuffers {
            count: reqbufs.count,
            capabilities: reqbufs.capabilities,
        })
    }

    fn export_buffer(&self, direction: Direction, index: u32) -> io::Result<Vec<ExportedPlane>> {
        let type_ = self.buf_type(direction);
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer {
            index,
            type_,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        if self.caps.mplane {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = VIDEO_MAX_PLANES as u32;
        }
        self.video_ioctl(VIDIOC_QUERYBUF(), &mut buf)?;

        let layout: Vec<(usize, usize)> = if self.caps.mplane {
            planes[..(buf.length as usize).min(VIDEO_MAX_PLANES)]
                .iter()
                .map(|p| (p.length as usize, p.data_offset as usize))
                .collect()
        } else {
            vec![(buf.length as usize, 0)]
        };

        let mut exported = Vec::with_capacity(layout.len());
        for (plane, (length, offset)) in layout.into_iter().enumerate() {
            let mut expbuf = v4l2_exportbuffer {
                type_,
                index,
                plane: plane as u32,
                flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
                ..Default::default()
            };
            self.video_ioctl(VIDIOC_EXPBUF(), &mut expbuf)?;
            exported.push(ExportedPlane {
                // SAFETY: the kernel just handed us this descriptor and nothing else owns it.
                fd: unsafe { OwnedFd::from_raw_fd(expbuf.fd) },
                length,
                offset,
            });
        }
        Ok(exported)
    }

    fn queue_buffer(&self, buffer: QueuedBuffer<'_, Self::Request>) -> io::Result<()> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer {
            index: buffer.index,
            type_: self.buf_type(buffer.direction),
            memory: V4L2_MEMORY_MMAP,
            flags: buffer.flags,
            field: V4L2_FIELD_NONE,
            timestamp: timeval_from_us(buffer.timestamp_us),
            ..Default::default()
        };
        if let Some(request) = buffer.request {
            buf.flags |= V4L2_BUF_FLAG_REQUEST_FD;
            buf.__bindgen_anon_1.request_fd = request.raw_fd();
        }
        if self.caps.mplane {
            let count = buffer.bytes_used.len().clamp(1, VIDEO_MAX_PLANES);
            for (plane, used) in planes.iter_mut().zip(buffer.bytes_used) {
                plane.bytesused = *used;
            }
            buf.m.planes = planes.as_mut_ptr();
            buf.length = count as u32;
        } else {
            buf.bytesused = buffer.bytes_used.first().copied().unwrap_or(0);
        }
        self.video_ioctl(VIDIOC_QBUF(), &mut buf)
    }

    fn dequeue_buffer(&self, direction: Direction) -> io::Result<DequeuedBuffer> {
        let mut planes = [v4l2_plane::default(); VIDEO_MAX_PLANES];
        let mut buf = v4l2_buffer {
            type_: self.buf_type(direction),
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        if self.caps.mplane {
            buf.m.planes = planes.as_mut_ptr();
            buf.length = VIDEO_MAX_PLANES as u32;
        }
        self.video_ioctl(VIDIOC_DQBUF(), &mut buf)?;
        let bytes_used = if self.caps.mplane {
            planes[0].bytesused
        } else {
            buf.bytesused
        };
        Ok(DequeuedBuffer {
            index: buf.index,
            timestamp_us: us_from_timeval(&buf.timestamp),
            flags: buf.flags,
            bytes_used,
        })
    }

    fn stream_on(&self, direction: Direction) -> io::Result<()> {
        let type_ = self.buf_type(direction) as c_int;
        // SAFETY: VIDIOC_STREAMON reads one int.
        check(unsafe { ioctl_with_ref(&self.video, VIDIOC_STREAMON(), &type_) })
    }

    fn stream_off(&self, direction: Direction) -> io::Result<()> {
        let type_ = self.buf_type(direction) as c_int;
        // SAFETY: VIDIOC_STREAMOFF reads one int.
        check(unsafe { ioctl_with_ref(&self.video, VIDIOC_STREAMOFF(), &type_) })
    }

    fn set_controls(
        &self,
        request: Option<&Self::Request>,
        controls: &[Control<'_>],
    ) -> io::Result<()> {
        let mut raw: Vec<v4l2_ext_control> = controls
            .iter()
            .map(|c| {
                let mut ctrl = v4l2_ext_control {
                    id: c.id,
                    ..Default::default()
                };
                match c.value {
                    ControlValue::Int(v) => ctrl.__bindgen_anon_1.value = v,
                    ControlValue::Int64(v) => ctrl.__bindgen_anon_1.value64 = v,
                    ControlValue::Compound(bytes) => {
                        ctrl.size = bytes.len() as u32;
                        // The kernel only reads through this pointer for S_EXT_CTRLS.
                        ctrl.__bindgen_anon_1.ptr = bytes.as_ptr() as *mut c_void;
                    }
                }
                ctrl
            })
            .collect();
        let mut ext = v4l2_ext_controls {
            which: if request.is_some() {
                V4L2_CTRL_WHICH_REQUEST_VAL
            } else {
                V4L2_CTRL_WHICH_CUR_VAL
            },
            count: raw.len() as u32,
            request_fd: request.map(|r| r.raw_fd()).unwrap_or(0),
            controls: raw.as_mut_ptr(),
            ..Default::default()
        };
        self.video_ioctl(VIDIOC_S_EXT_CTRLS(), &mut ext)
    }

    fn get_controls(&self, queries: &[(u32, ControlKind)]) -> io::Result<Vec<ControlReading>> {
        let mut storage: Vec<Vec<u8>> = queries
            .iter()
            .map(|(_, kind)| match kind {
                ControlKind::Compound(size) => vec![0u8; *size],
                _ => Vec::new(),
            })
            .collect();
        let mut raw: Vec<v4l2_ext_control> = queries
            .iter()
            .zip(storage.iter_mut())
            .map(|((id, kind), data)| {
                let mut ctrl = v4l2_ext_control {
                    id: *id,
                    ..Default::default()
                };
                if let ControlKind::Compound(size) = kind {
                    ctrl.size = *size as u32;
                    ctrl.__bindgen_anon_1.ptr = data.as_mut_ptr() as *mut c_void;
                }
                ctrl
            })
            .collect();
        let mut ext = v4l2_ext_controls {
            which: V4L2_CTRL_WHICH_CUR_VAL,
            count: raw.len() as u32,
            controls: raw.as_mut_ptr(),
            ..Default::default()
        };
        self.video_ioctl(VIDIOC_G_EXT_CTRLS(), &mut ext)?;

        Ok(queries
            .iter()
            .zip(raw.iter())
            .zip(storage)
            .map(|(((_, kind), ctrl), data)| {
                let value = ctrl.__bindgen_anon_1;
                match kind {
                    // SAFETY: the kernel wrote the member matching the control type.
                    ControlKind::Int => ControlReading::Int(unsafe { value.value }),
                    // SAFETY: as above.
                    ControlKind::Int64 => ControlReading::Int64(unsafe { value.value64 }),
                    ControlKind::Compound(_) => ControlReading::Compound(data),
                }
            })
            .collect())
    }

    fn query_control(&self, id: u32) -> io::Result<Option<ControlInfo>> {
        let mut query = v4l2_query_ext_ctrl {
            id,
            ..Default::default()
        };
        let found = end_on_einval(self.video_ioctl(VIDIOC_QUERY_EXT_CTRL(), &mut query))?;
        Ok(found.map(|()| ControlInfo {
            id: query.id,
            minimum: query.minimum,
            maximum: query.maximum,
            default_value: query.default_value,
            elem_size: query.elem_size,
            elems: query.elems,
        }))
    }

    fn alloc_request(&self) -> io::Result<Self::Request> {
        let mut fd: c_int = -1;
        // SAFETY: MEDIA_IOC_REQUEST_ALLOC writes one int.
        check(unsafe { ioctl_with_mut_ref(&self.media, MEDIA_IOC_REQUEST_ALLOC(), &mut fd) })?;
        Ok(V4l2Request {
            // SAFETY: the kernel just created this descriptor for us.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_tag_survives_timeval() {
        for frame in [0u64, 1, 999, 1000, 1001, 123_456] {
            let us = frame * 1000;
            let tv = timeval_from_us(us);
            assert!((tv.tv_usec as u64) < 1_000_000);
            assert_eq!(us_from_timeval(&tv), us);
        }
        let tv = timeval_from_us(2_500_000);
        assert_eq!(tv.tv_sec, 2);
        assert_eq!(tv.tv_usec, 500_000);
    }

    #[test]
    fn c_strings() {
        let mut field = [0u8; 16];
        field[..6].copy_from_slice(b"hantro");
        assert_eq!(cstr_field(&field), "hantro");
        assert_eq!(cstr_field(b"no-nul"), "no-nul");
    }

    #[test]
    fn missing_node_reports_path() {
        let config = DecoderConfig {
            media_device: "/nonexistent/media9".into(),
            ..Default::default()
        };
        match V4l2Device::open(&config) {
            Err(Error::DeviceOpen { path, .. }) => {
                assert_eq!(path, std::path::PathBuf::from("/nonexistent/media9"))
            }
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("opened a missing device"),
        }
    }

    #[test]
    fn regular_file_is_not_a_request() {
        let file = tempfile::tempfile().unwrap();
        let request = V4l2Request { fd: file.into() };
        assert!(request.queue().is_err());
    }
}
