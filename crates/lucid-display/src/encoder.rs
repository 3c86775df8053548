//! Worker-threaded display encoder.
//!
//! [`DisplayEncoder`] accepts dirty-rectangle updates from the guest
//! display, keeps the authoritative screen bitmap, and, while streaming is
//! started, feeds aligned slices of it through libyuv into x264 on its own
//! worker thread. Compressed Annex-B sequences are handed to the client
//! callback.
//!
//! Locking: one mutex protects the bitmap, the slice queue and the
//! callback; `destroyed` and `force_keyframe` are atomics. The x264 handle
//! and the whole-screen input picture live on the worker thread and never
//! cross the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DisplayStreamConfig;
use crate::surface::{DisplayPartialBitmap, EncodeSlice, Rect, Surface};
use crate::x264::{Encoder, Param, Picture, X264_CSP_I420, X264_RC_CRF, X264_TYPE_AUTO, X264_TYPE_KEYFRAME, X264_LOG_ERROR};
use crate::yuv;

/// Receives each encoded Annex-B NAL sequence.
///
/// The payload borrows encoder-owned memory and must be copied out before
/// returning. The callback runs under the encoder lock: it must not call
/// back into [`DisplayEncoder`] (`render`, `stop`, `force_keyframe`), or it
/// will deadlock.
pub type OutputCallback = Box<dyn FnMut(&[u8]) + Send>;

/// How long the worker sleeps between ticks when nothing wakes it.
const IDLE_INTERVAL: Duration = Duration::from_millis(500);

struct EncoderShared {
    surface: Surface,
    slices: Vec<EncodeSlice>,
    started: bool,
    callback: Option<OutputCallback>,
}

struct EncoderState {
    shared: Mutex<EncoderShared>,
    wakeup: Condvar,
    destroyed: AtomicBool,
    force_keyframe: AtomicBool,
    width: u32,
    height: u32,
}

impl EncoderState {
    fn lock_shared(&self) -> MutexGuard<'_, EncoderShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Streaming H.264 encoder for one guest display.
pub struct DisplayEncoder {
    state: Arc<EncoderState>,
    worker: Option<JoinHandle<()>>,
}

impl DisplayEncoder {
    /// Creates the encoder and spawns its worker thread.
    ///
    /// # Panics
    ///
    /// Panics when the screen geometry is unsupported or any x264
    /// configuration step fails; both are configuration defects.
    #[must_use]
    pub fn new(
        width: u32,
        height: u32,
        bpp: u32,
        stride: usize,
        config: &DisplayStreamConfig,
    ) -> Self {
        let surface = Surface::new(width, height, bpp, stride);

        // zerolatency is non-negotiable for an interactive display.
        let tune = if config.fastdecode() {
            "zerolatency,fastdecode"
        } else {
            "zerolatency"
        };
        let mut param = Param::from_preset(&config.preset, tune).unwrap_or_else(|| {
            panic!("failed to set default preset {:?}", config.preset)
        });
        {
            let raw = param.raw_mut();
            raw.i_csp = X264_CSP_I420;
            raw.i_width = width as libc::c_int;
            raw.i_height = height as libc::c_int;

            raw.rc.i_rc_method = X264_RC_CRF;
            raw.rc.f_rf_constant = config.qmin as f32;
            raw.rc.i_vbv_max_bitrate = (config.bitrate / 1000) as libc::c_int;
            raw.rc.i_vbv_buffer_size = (config.bitrate * 2 / 1000) as libc::c_int;

            raw.i_fps_num = config.fps;
            raw.i_fps_den = 1;
            raw.b_vfr_input = 0;
            raw.b_repeat_headers = 1;
            raw.b_annexb = 1;
            raw.i_log_level = X264_LOG_ERROR;
            raw.i_threads = config.threads as libc::c_int;
            // Keyframes come from force_keyframe, not the GOP clock.
            raw.i_keyint_min = 7200;
            raw.i_keyint_max = 7200;
            raw.i_scenecut_threshold = 0;

            if config.cabac() {
                raw.b_cabac = 1;
            }
            if config.reference_frames() {
                raw.i_frame_reference = 3;
            }
        }
        assert!(
            param.apply_profile(&config.profile),
            "failed to set profile {:?}",
            config.profile
        );

        let input = Picture::alloc_i420(width, height)
            .unwrap_or_else(|| panic!("failed to allocate yuv picture {width}x{height}"));
        let encoder = Encoder::open(&mut param)
            .unwrap_or_else(|| panic!("failed to open x264 encoder {width}x{height}"));

        let state = Arc::new(EncoderState {
            shared: Mutex::new(EncoderShared {
                surface,
                slices: Vec::new(),
                started: false,
                callback: None,
            }),
            wakeup: Condvar::new(),
            destroyed: AtomicBool::new(false),
            force_keyframe: AtomicBool::new(false),
            width,
            height,
        });

        let worker_state = state.clone();
        let worker = thread::Builder::new()
            .name("lucid-encoder".into())
            .spawn(move || encode_loop(&worker_state, encoder, input))
            .expect("failed to spawn encoder worker");

        Self {
            state,
            worker: Some(worker),
        }
    }

    /// Screen width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.state.width
    }

    /// Screen height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.state.height
    }

    /// Begins streaming into `callback`.
    ///
    /// The first frame after `start` is a keyframe covering the whole
    /// viewport, regardless of dirty history.
    pub fn start(&self, callback: OutputCallback) {
        let mut shared = self.state.lock_shared();
        shared.started = true;
        self.state.force_keyframe.store(true, Ordering::Release);
        shared.callback = Some(callback);
        let full = Rect::new(0, 0, self.state.width, self.state.height);
        shared
            .slices
            .push(EncodeSlice::new(full, self.state.width, self.state.height));
        tracing::debug!("display stream started");
    }

    /// Stops streaming and drops the callback.
    ///
    /// No callback is invoked after this returns. Already-queued slices
    /// stay queued; their pixels are re-read from the live bitmap if a
    /// later `start` drains them.
    pub fn stop(&self) {
        let mut shared = self.state.lock_shared();
        shared.started = false;
        shared.callback = None;
        tracing::debug!("display stream stopped");
    }

    /// Copies partial updates into the screen bitmap and, while started,
    /// queues the matching encode slices.
    pub fn render(&self, partials: &[DisplayPartialBitmap<'_>]) {
        let mut shared = self.state.lock_shared();
        let mut queued = false;
        for partial in partials {
            shared.surface.render_partial(partial);
            if shared.started {
                let rect = Rect::new(partial.x, partial.y, partial.width, partial.height);
                shared
                    .slices
                    .push(EncodeSlice::new(rect, self.state.width, self.state.height));
                queued = true;
            }
        }
        if queued {
            self.state.wakeup.notify_all();
        }
    }

    /// Makes the worker's next frame a keyframe.
    pub fn force_keyframe(&self) {
        self.state.force_keyframe.store(true, Ordering::Release);
        self.state.wakeup.notify_all();
    }
}

impl Drop for DisplayEncoder {
    fn drop(&mut self) {
        self.state.destroyed.store(true, Ordering::Release);
        self.state.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            // The worker owns the x264 handle; it must be gone before the
            // encoder state can be considered dead.
            let _ = worker.join();
        }
    }
}

/// Worker thread: drain slices, composite, encode, deliver.
fn encode_loop(state: &EncoderState, mut encoder: Encoder, mut input: Picture) {
    loop {
        let mut shared = state.lock_shared();
        let (guard, _) = state
            .wakeup
            .wait_timeout(shared, IDLE_INTERVAL)
            .unwrap_or_else(PoisonError::into_inner);
        shared = guard;

        if state.destroyed.load(Ordering::Acquire) {
            break;
        }
        if !shared.started {
            continue;
        }

        let slices = if shared.slices.is_empty() {
            Vec::new()
        } else {
            // Convert under the lock: the bitmap must not move under the
            // conversion, and render() serializes against this.
            let EncoderShared {
                surface, slices, ..
            } = &mut *shared;
            for slice in slices.iter_mut() {
                yuv::convert_region(surface, slice.rect.x, slice.rect.y, &mut slice.yuv);
            }
            std::mem::take(slices)
        };
        drop(shared);

        for slice in &slices {
            blit_slice(&mut input, slice, state.height);
        }
        drop(slices);

        input.bump_pts();
        let force = state.force_keyframe.swap(false, Ordering::AcqRel);
        input.set_type(if force {
            X264_TYPE_KEYFRAME
        } else {
            X264_TYPE_AUTO
        });
        let payload = encoder.encode(&mut input);

        let mut shared = state.lock_shared();
        if let Some(payload) = payload {
            if let Some(callback) = shared.callback.as_mut() {
                callback(payload);
            }
        }
    }
}

/// Copies a slice's planes into the whole-screen input picture at the
/// slice's offset (`x, y` for luma; halved for chroma).
fn blit_slice(input: &mut Picture, slice: &EncodeSlice, screen_height: u32) {
    let rect = slice.rect;

    let stride = input.stride(0);
    let plane = input.plane_mut(0, stride * screen_height as usize);
    let width = rect.width as usize;
    for row in 0..rect.height as usize {
        let dst = stride * (rect.y as usize + row) + rect.x as usize;
        let src = slice.yuv.y_stride() * row;
        plane[dst..dst + width].copy_from_slice(&slice.yuv.y[src..src + width]);
    }

    for (index, chroma) in [(1, &slice.yuv.u), (2, &slice.yuv.v)] {
        let stride = input.stride(index);
        let plane = input.plane_mut(index, stride * (screen_height as usize / 2));
        let width = rect.width as usize / 2;
        for row in 0..rect.height as usize / 2 {
            let dst = stride * (rect.y as usize / 2 + row) + rect.x as usize / 2;
            let src = slice.yuv.uv_stride() * row;
            plane[dst..dst + width].copy_from_slice(&chroma[src..src + width]);
        }
    }
}
