//! FFI bindings for libx264.
//!
//! Declarations follow `x264.h` at API build 164 (the stable ABI shipped by
//! current distributions; `x264_encoder_open` is a versioned symbol, bound
//! explicitly below). Only the parameters this crate actually programs are
//! wrapped safely; the raw structs are laid out in full so the library
//! reads them correctly.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]

use std::ffi::CString;
use std::marker::PhantomData;
use std::mem::MaybeUninit;

use libc::{c_char, c_int, c_uint, c_void};

// ============================================================================
// Constants (x264.h)
// ============================================================================

/// Planar YUV 4:2:0 colorspace.
pub const X264_CSP_I420: c_int = 0x0002;

/// Rate control: constant rate factor.
pub const X264_RC_CRF: c_int = 1;

/// Frame type: let the encoder decide.
pub const X264_TYPE_AUTO: c_int = 0x0000;
/// Frame type: force an IDR frame.
pub const X264_TYPE_IDR: c_int = 0x0001;
/// Frame type: force a keyframe (IDR, or I under open GOP).
pub const X264_TYPE_KEYFRAME: c_int = 0x0006;

/// Log level: errors only.
pub const X264_LOG_ERROR: c_int = 0;

/// NAL unit type: IDR slice.
pub const NAL_SLICE_IDR: c_int = 5;
/// NAL unit type: sequence parameter set.
pub const NAL_SPS: c_int = 7;
/// NAL unit type: picture parameter set.
pub const NAL_PPS: c_int = 8;

// ============================================================================
// Raw structures
// ============================================================================

/// Opaque encoder handle.
#[repr(C)]
pub struct x264_t {
    _private: [u8; 0],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_param_vui_t {
    pub i_sar_height: c_int,
    pub i_sar_width: c_int,
    pub i_overscan: c_int,
    pub i_vidformat: c_int,
    pub b_fullrange: c_int,
    pub i_colorprim: c_int,
    pub i_transfer: c_int,
    pub i_colmatrix: c_int,
    pub i_chroma_loc: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_param_analyse_t {
    pub intra: c_uint,
    pub inter: c_uint,
    pub b_transform_8x8: c_int,
    pub i_weighted_pred: c_int,
    pub b_weighted_bipred: c_int,
    pub i_direct_mv_pred: c_int,
    pub i_chroma_qp_offset: c_int,
    pub i_me_method: c_int,
    pub i_me_range: c_int,
    pub i_mv_range: c_int,
    pub i_mv_range_thread: c_int,
    pub i_subpel_refine: c_int,
    pub b_chroma_me: c_int,
    pub b_mixed_references: c_int,
    pub i_trellis: c_int,
    pub b_fast_pskip: c_int,
    pub b_dct_decimate: c_int,
    pub i_noise_reduction: c_int,
    pub f_psy_rd: f32,
    pub f_psy_trellis: f32,
    pub b_psy: c_int,
    pub b_mb_info: c_int,
    pub b_mb_info_update: c_int,
    pub i_luma_deadzone: [c_int; 2],
    pub b_psnr: c_int,
    pub b_ssim: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_param_rc_t {
    pub i_rc_method: c_int,
    pub i_qp_constant: c_int,
    pub i_qp_min: c_int,
    pub i_qp_max: c_int,
    pub i_qp_step: c_int,
    pub i_bitrate: c_int,
    pub f_rf_constant: f32,
    pub f_rf_constant_max: f32,
    pub f_rate_tolerance: f32,
    pub i_vbv_max_bitrate: c_int,
    pub i_vbv_buffer_size: c_int,
    pub f_vbv_buffer_init: f32,
    pub f_ip_factor: f32,
    pub f_pb_factor: f32,
    pub i_aq_mode: c_int,
    pub f_aq_strength: f32,
    pub b_mb_tree: c_int,
    pub i_lookahead: c_int,
    pub b_stat_write: c_int,
    pub psz_stat_out: *mut c_char,
    pub b_stat_read: c_int,
    pub psz_stat_in: *mut c_char,
    pub f_qcompress: f32,
    pub f_qblur: f32,
    pub f_complexity_blur: f32,
    pub zones: *mut c_void,
    pub i_zones: c_int,
    pub psz_zones: *mut c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_param_crop_t {
    pub i_left: c_uint,
    pub i_top: c_uint,
    pub i_right: c_uint,
    pub i_bottom: c_uint,
}

/// Encoder parameters, `x264_param_t`.
#[repr(C)]
pub struct x264_param_t {
    pub cpu: c_uint,
    pub i_threads: c_int,
    pub i_lookahead_threads: c_int,
    pub b_sliced_threads: c_int,
    pub b_deterministic: c_int,
    pub b_cpu_independent: c_int,
    pub i_sync_lookahead: c_int,

    pub i_width: c_int,
    pub i_height: c_int,
    pub i_csp: c_int,
    pub i_bitdepth: c_int,
    pub i_level_idc: c_int,
    pub i_frame_total: c_int,

    pub i_nal_hrd: c_int,

    pub vui: x264_param_vui_t,

    pub i_frame_reference: c_int,
    pub i_dpb_size: c_int,
    pub i_keyint_max: c_int,
    pub i_keyint_min: c_int,
    pub i_scenecut_threshold: c_int,
    pub b_intra_refresh: c_int,

    pub i_bframe: c_int,
    pub i_bframe_adaptive: c_int,
    pub i_bframe_bias: c_int,
    pub i_bframe_pyramid: c_int,
    pub b_open_gop: c_int,
    pub b_bluray_compat: c_int,
    pub i_avcintra_class: c_int,
    pub i_avcintra_flavor: c_int,

    pub b_deblocking_filter: c_int,
    pub i_deblocking_filter_alphac0: c_int,
    pub i_deblocking_filter_beta: c_int,

    pub b_cabac: c_int,
    pub i_cabac_init_idc: c_int,

    pub b_interlaced: c_int,
    pub b_constrained_intra: c_int,

    pub i_cqm_preset: c_int,
    pub psz_cqm_file: *mut c_char,
    pub cqm_4iy: [u8; 16],
    pub cqm_4py: [u8; 16],
    pub cqm_4ic: [u8; 16],
    pub cqm_4pc: [u8; 16],
    pub cqm_8iy: [u8; 64],
    pub cqm_8py: [u8; 64],
    pub cqm_8ic: [u8; 64],
    pub cqm_8pc: [u8; 64],

    pub pf_log: Option<unsafe extern "C" fn(*mut c_void, c_int, *const c_char, *mut c_void)>,
    pub p_log_private: *mut c_void,
    pub i_log_level: c_int,
    pub b_full_recon: c_int,
    pub psz_dump_yuv: *mut c_char,

    pub analyse: x264_param_analyse_t,
    pub rc: x264_param_rc_t,
    pub crop_rect: x264_param_crop_t,

    pub i_frame_packing: c_int,
    pub i_alternative_transfer: c_int,

    pub b_aud: c_int,
    pub b_repeat_headers: c_int,
    pub b_annexb: c_int,
    pub i_sps_id: c_int,
    pub b_vfr_input: c_int,
    pub b_pulldown: c_int,
    pub i_fps_num: u32,
    pub i_fps_den: u32,
    pub i_timebase_num: u32,
    pub i_timebase_den: u32,

    pub b_tff: c_int,
    pub b_pic_struct: c_int,
    pub b_fake_interlaced: c_int,
    pub b_stitchable: c_int,
    pub b_opencl: c_int,
    pub i_opencl_device: c_int,
    pub opencl_device_id: *mut c_void,
    pub psz_clbin_file: *mut c_char,

    pub i_slice_max_size: c_int,
    pub i_slice_max_mbs: c_int,
    pub i_slice_min_mbs: c_int,
    pub i_slice_count: c_int,
    pub i_slice_count_max: c_int,

    pub param_free: Option<unsafe extern "C" fn(*mut c_void)>,
    pub nalu_process:
        Option<unsafe extern "C" fn(*mut x264_t, *mut x264_nal_t, *mut c_void)>,
    pub opaque: *mut c_void,
}

/// One NAL unit produced by the encoder.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_nal_t {
    pub i_ref_idc: c_int,
    pub i_type: c_int,
    pub b_long_startcode: c_int,
    pub i_first_mb: c_int,
    pub i_last_mb: c_int,
    pub i_payload: c_int,
    pub p_payload: *mut u8,
    pub i_padding: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_image_t {
    pub i_csp: c_int,
    pub i_plane: c_int,
    pub i_stride: [c_int; 4],
    pub plane: [*mut u8; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_image_properties_t {
    pub quant_offsets: *mut f32,
    pub quant_offsets_free: Option<unsafe extern "C" fn(*mut c_void)>,
    pub mb_info: *mut u8,
    pub mb_info_free: Option<unsafe extern "C" fn(*mut c_void)>,
    pub f_ssim: f64,
    pub f_psnr_avg: f64,
    pub f_psnr: [f64; 3],
    pub f_crf_avg: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_hrd_t {
    pub cpb_initial_arrival_time: f64,
    pub cpb_final_arrival_time: f64,
    pub cpb_removal_time: f64,
    pub dpb_output_time: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct x264_sei_t {
    pub num_payloads: c_int,
    pub payloads: *mut c_void,
    pub sei_free: Option<unsafe extern "C" fn(*mut c_void)>,
}

/// A frame handed to or returned by the encoder, `x264_picture_t`.
#[repr(C)]
pub struct x264_picture_t {
    pub i_type: c_int,
    pub i_qpplus1: c_int,
    pub i_pic_struct: c_int,
    pub b_keyframe: c_int,
    pub i_pts: i64,
    pub i_dts: i64,
    pub param: *mut x264_param_t,
    pub img: x264_image_t,
    pub prop: x264_image_properties_t,
    pub hrd_timing: x264_hrd_t,
    pub extra_sei: x264_sei_t,
    pub opaque: *mut c_void,
}

extern "C" {
    fn x264_param_default_preset(
        param: *mut x264_param_t,
        preset: *const c_char,
        tune: *const c_char,
    ) -> c_int;

    fn x264_param_apply_profile(param: *mut x264_param_t, profile: *const c_char) -> c_int;

    fn x264_picture_alloc(
        pic: *mut x264_picture_t,
        i_csp: c_int,
        i_width: c_int,
        i_height: c_int,
    ) -> c_int;

    fn x264_picture_clean(pic: *mut x264_picture_t);

    // `x264_encoder_open` is versioned per API build in x264.h.
    #[link_name = "x264_encoder_open_164"]
    fn x264_encoder_open(param: *mut x264_param_t) -> *mut x264_t;

    fn x264_encoder_encode(
        handle: *mut x264_t,
        pp_nal: *mut *mut x264_nal_t,
        pi_nal: *mut c_int,
        pic_in: *mut x264_picture_t,
        pic_out: *mut x264_picture_t,
    ) -> c_int;

    fn x264_encoder_close(handle: *mut x264_t);
}

// ============================================================================
// Safe wrappers
// ============================================================================

/// Encoder parameters under construction.
pub struct Param {
    raw: x264_param_t,
}

impl Param {
    /// Loads preset defaults with the given tune string.
    ///
    /// Returns `None` for an unknown preset or tune, which callers treat as
    /// a configuration defect.
    #[must_use]
    pub fn from_preset(preset: &str, tune: &str) -> Option<Self> {
        let preset = CString::new(preset).ok()?;
        let tune = CString::new(tune).ok()?;
        let mut raw = MaybeUninit::<x264_param_t>::zeroed();
        let ret =
            unsafe { x264_param_default_preset(raw.as_mut_ptr(), preset.as_ptr(), tune.as_ptr()) };
        if ret < 0 {
            return None;
        }
        Some(Self {
            raw: unsafe { raw.assume_init() },
        })
    }

    /// Direct access to the raw parameter block.
    pub fn raw_mut(&mut self) -> &mut x264_param_t {
        &mut self.raw
    }

    /// Constrains the parameters to a named H.264 profile.
    #[must_use]
    pub fn apply_profile(&mut self, profile: &str) -> bool {
        let Ok(profile) = CString::new(profile) else {
            return false;
        };
        unsafe { x264_param_apply_profile(&mut self.raw, profile.as_ptr()) >= 0 }
    }
}

/// An allocated `x264_picture_t`.
pub struct Picture {
    raw: x264_picture_t,
    // The picture owns planes allocated by libx264.
    _not_sync: PhantomData<*mut u8>,
}

// Moved into the worker thread; the planes are heap allocations with no
// thread affinity.
unsafe impl Send for Picture {}

impl Picture {
    /// Allocates an I420 picture of `width × height`.
    #[must_use]
    pub fn alloc_i420(width: u32, height: u32) -> Option<Self> {
        let mut raw = MaybeUninit::<x264_picture_t>::zeroed();
        let ret = unsafe {
            x264_picture_alloc(
                raw.as_mut_ptr(),
                X264_CSP_I420,
                width as c_int,
                height as c_int,
            )
        };
        if ret < 0 {
            return None;
        }
        Some(Self {
            raw: unsafe { raw.assume_init() },
            _not_sync: PhantomData,
        })
    }

    /// Stride in bytes of plane `index` (0 = Y, 1 = U, 2 = V).
    #[must_use]
    pub fn stride(&self, index: usize) -> usize {
        self.raw.img.i_stride[index] as usize
    }

    /// Mutable bytes of plane `index`; `len` rows are addressable.
    pub fn plane_mut(&mut self, index: usize, len: usize) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.raw.img.plane[index], len) }
    }

    /// Advances the presentation timestamp by one frame.
    pub fn bump_pts(&mut self) {
        self.raw.i_pts += 1;
    }

    /// Sets the frame type for the next encode.
    pub fn set_type(&mut self, frame_type: c_int) {
        self.raw.i_type = frame_type;
    }

    fn raw_mut(&mut self) -> *mut x264_picture_t {
        &mut self.raw
    }
}

impl Drop for Picture {
    fn drop(&mut self) {
        unsafe { x264_picture_clean(&mut self.raw) };
    }
}

/// An open x264 encoder.
pub struct Encoder {
    handle: *mut x264_t,
}

// The handle is owned exclusively by the worker thread after construction.
unsafe impl Send for Encoder {}

impl Encoder {
    /// Opens an encoder with the given parameters.
    #[must_use]
    pub fn open(param: &mut Param) -> Option<Self> {
        let handle = unsafe { x264_encoder_open(&mut param.raw) };
        if handle.is_null() {
            return None;
        }
        Some(Self { handle })
    }

    /// Encodes one frame and returns the Annex-B payload of the produced
    /// NAL sequence, or `None` when the encoder produced nothing this call.
    ///
    /// The returned slice borrows encoder-owned memory and is only valid
    /// until the next call.
    pub fn encode(&mut self, picture: &mut Picture) -> Option<&[u8]> {
        let mut nals: *mut x264_nal_t = std::ptr::null_mut();
        let mut nal_count: c_int = 0;
        let mut pic_out = MaybeUninit::<x264_picture_t>::zeroed();
        let size = unsafe {
            x264_encoder_encode(
                self.handle,
                &mut nals,
                &mut nal_count,
                picture.raw_mut(),
                pic_out.as_mut_ptr(),
            )
        };
        if size < 0 {
            tracing::warn!(size, "x264_encoder_encode failed");
            return None;
        }
        if size == 0 || nal_count == 0 {
            return None;
        }
        // NAL payloads are contiguous; the first payload pointer covers the
        // whole sequence.
        let payload = unsafe { (*nals).p_payload };
        Some(unsafe { std::slice::from_raw_parts(payload, size as usize) })
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        unsafe { x264_encoder_close(self.handle) };
    }
}
