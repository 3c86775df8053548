//! # lucid-display
//!
//! Streaming H.264 display encoder for the Lucid VMM.
//!
//! Guest display updates arrive as dirty rectangles; the encoder keeps the
//! authoritative screen bitmap, converts dirty slices to I420 with libyuv
//! and compresses whole frames with x264 on a dedicated worker thread.
//!
//! - [`config`]: Stream tuning ([`DisplayStreamConfig`])
//! - [`surface`]: Screen bitmap, partial updates, slice alignment
//! - [`encoder`]: The worker-threaded [`DisplayEncoder`]
//! - [`x264`], [`yuv`]: Native library bindings
//!
//! The native libraries are external collaborators: their bitstream and
//! pixel output is consumed verbatim.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::significant_drop_tightening)]

pub mod config;
pub mod encoder;
pub mod surface;
pub mod x264;
pub mod yuv;

pub use config::DisplayStreamConfig;
pub use encoder::{DisplayEncoder, OutputCallback};
pub use surface::{DisplayPartialBitmap, EncodeSlice, I420Buffer, Rect, Surface};
