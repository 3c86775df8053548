//! Authoritative screen bitmap and dirty-rectangle bookkeeping.
//!
//! The surface holds the packed-RGB image of the guest display. Partial
//! updates are copied in exactly as the guest produced them (including
//! bottom-up framebuffers and scatter-gather sources); the encoder then
//! works from this bitmap alone, so a slice always encodes the pixels
//! present at the moment it is drained.

/// A pixel rectangle in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Creates a rectangle.
    #[must_use]
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Horizontal slice alignment: x264 macroblock columns.
const SLICE_ALIGN_X: u32 = 16;
/// Vertical slice alignment: chroma subsampling rows.
const SLICE_ALIGN_Y: u32 = 2;

/// Grows `rect` outward to 16-pixel column and 2-line row boundaries, then
/// clamps it to the screen. Idempotent, so repeated render calls over the
/// same area produce identical slices.
#[must_use]
pub fn align_slice_rect(rect: Rect, screen_width: u32, screen_height: u32) -> Rect {
    let mut left = rect.x;
    let mut right = rect.x + rect.width;
    let mut top = rect.y;
    let mut bottom = rect.y + rect.height;

    left -= left % SLICE_ALIGN_X;
    if right % SLICE_ALIGN_X != 0 {
        right += SLICE_ALIGN_X - right % SLICE_ALIGN_X;
    }
    top -= top % SLICE_ALIGN_Y;
    if bottom % SLICE_ALIGN_Y != 0 {
        bottom += SLICE_ALIGN_Y - bottom % SLICE_ALIGN_Y;
    }

    right = right.min(screen_width);
    bottom = bottom.min(screen_height);

    Rect::new(left, top, right - left, bottom - top)
}

/// One dirty-region update from the guest display.
///
/// `segments` is the scatter-gather source: consecutive byte runs whose
/// total length covers `height` rows of `stride` bytes each. `flip` marks
/// bottom-up framebuffers, where the first source row is the bottom of the
/// rectangle.
pub struct DisplayPartialBitmap<'a> {
    /// Destination rectangle, in pixels.
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per source row.
    pub stride: usize,
    /// Bottom-up source rows.
    pub flip: bool,
    /// Source byte runs, walked in order.
    pub segments: Vec<&'a [u8]>,
}

/// The guest screen as packed 24- or 32-bit RGB.
pub struct Surface {
    width: u32,
    height: u32,
    bpp: u32,
    stride: usize,
    bitmap: Vec<u8>,
}

impl Surface {
    /// Allocates a zeroed `stride × height` surface.
    ///
    /// # Panics
    ///
    /// Panics unless both dimensions are even, `bpp` is 24 or 32, and the
    /// stride holds a full row; odd geometry cannot be subsampled to 4:2:0.
    #[must_use]
    pub fn new(width: u32, height: u32, bpp: u32, stride: usize) -> Self {
        assert!(width % 2 == 0, "screen width {width} is odd");
        assert!(height % 2 == 0, "screen height {height} is odd");
        assert!(bpp == 24 || bpp == 32, "unsupported bpp {bpp}");
        assert!(
            stride >= width as usize * (bpp as usize >> 3),
            "stride {stride} too small for width {width} at {bpp} bpp"
        );
        Self {
            width,
            height,
            bpp,
            stride,
            bitmap: vec![0; stride * height as usize],
        }
    }

    /// Screen width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Screen height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bits per pixel (24 or 32).
    #[must_use]
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Bytes per bitmap row.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The raw bitmap bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bitmap
    }

    /// Byte offset of pixel `(x, y)` in the bitmap.
    #[must_use]
    pub fn pixel_offset(&self, x: u32, y: u32) -> usize {
        y as usize * self.stride + x as usize * (self.bpp as usize >> 3)
    }

    /// Copies one partial update into the bitmap.
    ///
    /// Rows are consumed from the source segments in order; each segment
    /// carries `len / stride` whole rows. Last writer wins where partials
    /// overlap.
    ///
    /// # Panics
    ///
    /// Panics if the destination rectangle leaves the bitmap; a partial
    /// outside the screen is a display-model defect.
    pub fn render_partial(&mut self, partial: &DisplayPartialBitmap<'_>) {
        let pixel_bytes = self.bpp as usize >> 3;
        let linesize = partial.width as usize * pixel_bytes;
        let left = partial.x as usize * pixel_bytes;

        assert!(
            partial.x + partial.width <= self.width
                && partial.y + partial.height <= self.height,
            "partial {}x{}+{}+{} leaves the {}x{} screen",
            partial.width,
            partial.height,
            partial.x,
            partial.y,
            self.width,
            self.height
        );

        let mut lines_left = partial.height as usize;
        let mut dst_row = if partial.flip {
            (partial.y + partial.height - 1) as usize
        } else {
            partial.y as usize
        };

        'copy: for segment in &partial.segments {
            let mut copy_lines = segment.len() / partial.stride;
            let mut src_offset = 0;
            while copy_lines > 0 && lines_left > 0 {
                let dst_offset = dst_row * self.stride + left;
                self.bitmap[dst_offset..dst_offset + linesize]
                    .copy_from_slice(&segment[src_offset..src_offset + linesize]);
                src_offset += partial.stride;
                if partial.flip {
                    dst_row = dst_row.wrapping_sub(1);
                } else {
                    dst_row += 1;
                }
                copy_lines -= 1;
                lines_left -= 1;
            }
            if lines_left == 0 {
                break 'copy;
            }
        }
    }
}

/// Planar I420 pixels owned by an [`EncodeSlice`].
pub struct I420Buffer {
    width: u32,
    height: u32,
    /// Luma plane, `width × height`.
    pub y: Vec<u8>,
    /// Chroma U plane, `(width/2) × (height/2)`.
    pub u: Vec<u8>,
    /// Chroma V plane, `(width/2) × (height/2)`.
    pub v: Vec<u8>,
}

impl I420Buffer {
    /// Allocates a zeroed buffer; both dimensions must be even.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        debug_assert!(width % 2 == 0 && height % 2 == 0);
        let luma = width as usize * height as usize;
        Self {
            width,
            height,
            y: vec![0; luma],
            u: vec![0; luma / 4],
            v: vec![0; luma / 4],
        }
    }

    /// Plane width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Plane height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Luma stride in bytes.
    #[must_use]
    pub fn y_stride(&self) -> usize {
        self.width as usize
    }

    /// Chroma stride in bytes.
    #[must_use]
    pub fn uv_stride(&self) -> usize {
        self.width as usize / 2
    }
}

/// A queued unit of encode work: an aligned screen rectangle plus the I420
/// pixels converted from the bitmap when the slice is drained.
pub struct EncodeSlice {
    /// Aligned, clamped rectangle. `x` and `width` are multiples of 16,
    /// `y` and `height` multiples of 2.
    pub rect: Rect,
    /// Slice-local picture of exactly the rectangle's size.
    pub yuv: I420Buffer,
}

impl EncodeSlice {
    /// Creates the slice covering `rect` after alignment.
    #[must_use]
    pub fn new(rect: Rect, screen_width: u32, screen_height: u32) -> Self {
        let rect = align_slice_rect(rect, screen_width, screen_height);
        let yuv = I420Buffer::new(rect.width, rect.height);
        Self { rect, yuv }
    }
}
