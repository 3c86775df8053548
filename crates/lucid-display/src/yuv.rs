//! FFI bindings for libyuv's RGB → I420 conversions.
//!
//! Only the two packed-RGB entry points the display plane needs are bound;
//! both take explicit source and destination strides and convert top-down
//! (negative heights flip, which this crate never uses).

use libc::c_int;

use crate::surface::{I420Buffer, Surface};

extern "C" {
    /// 32-bit BGRA (libyuv "ARGB" little-endian order) to I420.
    fn ARGBToI420(
        src_argb: *const u8,
        src_stride_argb: c_int,
        dst_y: *mut u8,
        dst_stride_y: c_int,
        dst_u: *mut u8,
        dst_stride_u: c_int,
        dst_v: *mut u8,
        dst_stride_v: c_int,
        width: c_int,
        height: c_int,
    ) -> c_int;

    /// 24-bit RGB to I420.
    fn RGB24ToI420(
        src_rgb24: *const u8,
        src_stride_rgb24: c_int,
        dst_y: *mut u8,
        dst_stride_y: c_int,
        dst_u: *mut u8,
        dst_stride_u: c_int,
        dst_v: *mut u8,
        dst_stride_v: c_int,
        width: c_int,
        height: c_int,
    ) -> c_int;
}

/// Converts the `rect`-sized region of `surface` starting at the given
/// pixel into `dst`. `dst` must be exactly the region's size.
///
/// # Panics
///
/// Panics if libyuv rejects the conversion; the geometry was validated at
/// slice creation, so a failure here is a defect.
pub fn convert_region(surface: &Surface, x: u32, y: u32, dst: &mut I420Buffer) {
    debug_assert_eq!(dst.width() % 2, 0);
    debug_assert_eq!(dst.height() % 2, 0);

    let src = &surface.bytes()[surface.pixel_offset(x, y)..];
    let width = dst.width() as c_int;
    let height = dst.height() as c_int;
    let y_stride = dst.y_stride() as c_int;
    let uv_stride = dst.uv_stride() as c_int;

    let ret = match surface.bpp() {
        32 => unsafe {
            ARGBToI420(
                src.as_ptr(),
                surface.stride() as c_int,
                dst.y.as_mut_ptr(),
                y_stride,
                dst.u.as_mut_ptr(),
                uv_stride,
                dst.v.as_mut_ptr(),
                uv_stride,
                width,
                height,
            )
        },
        24 => unsafe {
            RGB24ToI420(
                src.as_ptr(),
                surface.stride() as c_int,
                dst.y.as_mut_ptr(),
                y_stride,
                dst.u.as_mut_ptr(),
                uv_stride,
                dst.v.as_mut_ptr(),
                uv_stride,
                width,
                height,
            )
        },
        other => panic!("unsupported bpp {other}"),
    };
    assert_eq!(
        ret, 0,
        "libyuv conversion failed for {width}x{height} at ({x}, {y})"
    );
}
