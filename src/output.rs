// Virtual camera output using v4l2loopback
//
// The corrected canvas is converted to a packed format and pushed with
// write(). The device is opened O_NONBLOCK; when the downstream reader
// falls behind the frame is dropped instead of stalling the apply loop.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::bench::FrameSink;
use crate::canvas::Canvas;
use crate::config::Resolution;

/// Supported pixel formats for output
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelFormat {
    Yuyv,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    /// V4L2 fourcc code
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Rgb24 => fourcc(b"RGB3"),
            PixelFormat::Bgr24 => fourcc(b"BGR3"),
        }
    }

    /// Bytes per pixel (average for packed 4:2:2)
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
        }
    }
}

fn fourcc(s: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*s)
}

// V4L2 ioctl definitions
const VIDIOC_S_FMT: libc::c_ulong = 0xc0d05605;
const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
const V4L2_FIELD_NONE: u32 = 1;

/// Matches the kernel's `struct v4l2_pix_format`
#[repr(C)]
struct v4l2_pix_format {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc_or_hsv_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
struct v4l2_format {
    type_: u32,
    // the union is 8-byte aligned in the kernel struct
    _pad_before_fmt: u32,
    fmt: v4l2_pix_format,
    _pad: [u8; 200 - std::mem::size_of::<v4l2_pix_format>()],
}

/// Virtual camera output device
pub struct VirtualCamera {
    device_path: String,
    file: File,
    resolution: Resolution,
    format: PixelFormat,
    frame_count: u64,
    dropped_count: u64,
    last_drop_warn: Option<Instant>,
}

impl VirtualCamera {
    /// Open the device, negotiating the first format it accepts
    pub fn open(device_path: &str, resolution: Resolution) -> Result<Self> {
        if !Path::new(device_path).exists() {
            anyhow::bail!(
                "Virtual camera device {} not found. Is v4l2loopback loaded? \
                 sudo modprobe v4l2loopback video_nr=10 card_label=Keystone exclusive_caps=0",
                device_path
            );
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(device_path)
            .with_context(|| format!("Failed to open output device {}", device_path))?;

        let candidates = candidate_formats(resolution);
        let mut chosen = None;
        for &format in candidates {
            match set_format(&file, resolution, format) {
                Ok(()) => {
                    chosen = Some(format);
                    break;
                }
                Err(e) => warn!("Format {} rejected by {}: {}", format.name(), device_path, e),
            }
        }

        // Some v4l2loopback setups are preconfigured and reject S_FMT
        let format = chosen.unwrap_or_else(|| {
            let fallback = candidates[0];
            warn!("All formats rejected, writing {} without setting the format", fallback.name());
            fallback
        });

        info!(
            "Virtual camera {} {} {}",
            device_path,
            resolution,
            format.name()
        );

        Ok(Self {
            device_path: device_path.to_string(),
            file,
            resolution,
            format,
            frame_count: 0,
            dropped_count: 0,
            last_drop_warn: None,
        })
    }

    /// Write one RGB24 frame, converting to the negotiated format
    pub fn write_frame_rgb(&mut self, rgb_data: &[u8]) -> io::Result<()> {
        let expected = self.resolution.pixel_count() * 3;
        if rgb_data.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("RGB data size mismatch: expected {} bytes, got {}", expected, rgb_data.len()),
            ));
        }

        let frame = match self.format {
            PixelFormat::Rgb24 => rgb_data.to_vec(),
            PixelFormat::Bgr24 => rgb_to_bgr(rgb_data),
            PixelFormat::Yuyv => rgb_to_yuyv(
                rgb_data,
                self.resolution.width as usize,
                self.resolution.height as usize,
            ),
        };

        match self.file.write_all(&frame) {
            Ok(()) => {
                self.frame_count += 1;
                if self.frame_count % 100 == 0 {
                    debug!("Written {} frames to {}", self.frame_count, self.device_path);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.record_dropped_frame();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn record_dropped_frame(&mut self) {
        self.dropped_count += 1;

        let should_warn = self
            .last_drop_warn
            .map_or(true, |last| last.elapsed() >= Duration::from_secs(5));

        if should_warn {
            warn!(
                "Dropped frame (total dropped: {}, written: {}) - downstream consumer may be slow",
                self.dropped_count, self.frame_count
            );
            self.last_drop_warn = Some(Instant::now());
        }
    }
}

impl FrameSink for VirtualCamera {
    fn name(&self) -> &str {
        &self.device_path
    }

    fn present(&mut self, canvas: &Canvas) -> Result<()> {
        self.write_frame_rgb(&canvas.to_rgb())
            .with_context(|| format!("Failed to write to {}", self.device_path))
    }
}

impl Drop for VirtualCamera {
    fn drop(&mut self) {
        info!(
            "Virtual camera {} closed after {} frames ({} dropped)",
            self.device_path, self.frame_count, self.dropped_count
        );
    }
}

/// Formats to offer, in order of preference
///
/// YUYV packs pixel pairs, so an odd width cannot fill a row exactly.
fn candidate_formats(resolution: Resolution) -> &'static [PixelFormat] {
    if resolution.width % 2 == 0 {
        &[PixelFormat::Yuyv, PixelFormat::Rgb24, PixelFormat::Bgr24]
    } else {
        &[PixelFormat::Rgb24, PixelFormat::Bgr24]
    }
}

fn set_format(file: &File, resolution: Resolution, format: PixelFormat) -> io::Result<()> {
    let bytesperline = resolution.width * format.bytes_per_pixel() as u32;

    let mut v4l2_fmt = v4l2_format {
        type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
        _pad_before_fmt: 0,
        fmt: v4l2_pix_format {
            width: resolution.width,
            height: resolution.height,
            pixelformat: format.fourcc(),
            field: V4L2_FIELD_NONE,
            bytesperline,
            sizeimage: bytesperline * resolution.height,
            colorspace: 0,
            priv_: 0,
            flags: 0,
            ycbcr_enc_or_hsv_enc: 0,
            quantization: 0,
            xfer_func: 0,
        },
        _pad: [0u8; 200 - std::mem::size_of::<v4l2_pix_format>()],
    };

    // SAFETY: `v4l2_fmt` matches the kernel layout and outlives the call
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), VIDIOC_S_FMT, &mut v4l2_fmt as *mut v4l2_format) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if v4l2_fmt.fmt.width != resolution.width || v4l2_fmt.fmt.height != resolution.height {
        warn!(
            "Format accepted but size changed: requested {}, got {}x{}",
            resolution, v4l2_fmt.fmt.width, v4l2_fmt.fmt.height
        );
    }
    Ok(())
}

/// Convert RGB24 to BGR24
fn rgb_to_bgr(rgb: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(rgb.len());
    for chunk in rgb.chunks_exact(3) {
        bgr.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    bgr
}

/// Convert RGB24 to YUYV (BT.601, chroma from the first pixel of each pair)
///
/// Rows are `width / 2 * 4` bytes; the last pixel of an odd-width row is dropped.
fn rgb_to_yuyv(rgb: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut yuyv = Vec::with_capacity(width / 2 * 4 * height);

    for row in rgb.chunks_exact(width * 3).take(height) {
        for pair in row.chunks_exact(6) {
            let (r1, g1, b1) = (pair[0] as i32, pair[1] as i32, pair[2] as i32);
            let (r2, g2, b2) = (pair[3] as i32, pair[4] as i32, pair[5] as i32);

            let y1 = ((66 * r1 + 129 * g1 + 25 * b1 + 128) >> 8) + 16;
            let y2 = ((66 * r2 + 129 * g2 + 25 * b2 + 128) >> 8) + 16;
            let u = ((-38 * r1 - 74 * g1 + 112 * b1 + 128) >> 8) + 128;
            let v = ((112 * r1 - 94 * g1 - 18 * b1 + 128) >> 8) + 128;

            yuyv.extend_from_slice(&[
                y1.clamp(0, 255) as u8,
                u.clamp(0, 255) as u8,
                y2.clamp(0, 255) as u8,
                v.clamp(0, 255) as u8,
            ]);
        }
    }

    yuyv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc() {
        assert_eq!(fourcc(b"YUYV"), 0x56595559);
        assert_eq!(PixelFormat::Rgb24.fourcc(), 0x33424752);
    }

    #[test]
    fn test_rgb_to_yuyv() {
        // White and black pixels
        let rgb = vec![255, 255, 255, 0, 0, 0];
        let yuyv = rgb_to_yuyv(&rgb, 2, 1);
        assert_eq!(yuyv.len(), 4);
        assert_eq!(yuyv[0], 235);
        assert_eq!(yuyv[1], 128);
        assert_eq!(yuyv[2], 16);
        assert_eq!(yuyv[3], 128);
    }

    #[test]
    fn test_rgb_to_yuyv_odd_width() {
        // 3x2: one full pair per row, the third pixel is not emitted
        let rgb = vec![0u8; 3 * 3 * 2];
        assert_eq!(rgb_to_yuyv(&rgb, 3, 2).len(), 2 * 4);
    }

    #[test]
    fn test_odd_width_skips_yuyv() {
        assert_eq!(candidate_formats(Resolution::new(640, 480))[0], PixelFormat::Yuyv);

        let odd = candidate_formats(Resolution::new(641, 480));
        assert!(!odd.contains(&PixelFormat::Yuyv));
        assert_eq!(odd[0], PixelFormat::Rgb24);
    }

    #[test]
    fn test_rgb_to_bgr() {
        let rgb = vec![1, 2, 3, 4, 5, 6];
        assert_eq!(rgb_to_bgr(&rgb), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_missing_device() {
        assert!(VirtualCamera::open("/dev/keystone-missing", Resolution::new(4, 4)).is_err());
    }
}
