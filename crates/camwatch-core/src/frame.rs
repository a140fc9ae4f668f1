//! Frame buffers, detection regions and in-place annotation.
//!
//! Frames are packed 8-bit BGR, row-major, no padding: the layout produced
//! by the capture adapter and consumed by the encoder subprocess.
//!
//! Annotation (boxes and text) is drawn straight into the pixel buffer, so
//! every consumer of a frame sees the same image.

use font8x8::{UnicodeFonts, BASIC_FONTS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

/// Bytes per BGR pixel.
const BGR_CHANNELS: usize = 3;

/// Edge of one glyph cell in font pixels.
pub const GLYPH_SIZE: u32 = 8;

/// A BGR color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bgr(pub u8, pub u8, pub u8);

impl Bgr {
    pub const BLACK: Bgr = Bgr(0, 0, 0);
    pub const GREEN: Bgr = Bgr(0, 255, 0);
    pub const WHITE: Bgr = Bgr(255, 255, 255);
}

/// Axis-aligned bounding region returned by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

// ============================================================================
// Color Frame
// ============================================================================

/// One decoded video frame.
///
/// An empty frame (no pixels) is what a capture returns when the read
/// succeeded but the source had nothing to deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Frame {
    /// Wraps a packed BGR buffer.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidFieldValue` if the buffer length does
    /// not match `width * height * 3`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> DomainResult<Self> {
        let expected = pixel_count(width, height)
            .and_then(|n| n.checked_mul(BGR_CHANNELS))
            .ok_or_else(|| DomainError::invalid("frame size", format!("{width}x{height}"), "addressable"))?;

        if data.len() != expected {
            return Err(DomainError::invalid(
                "frame buffer length",
                data.len(),
                format!("{expected} bytes for {width}x{height} bgr24"),
            ));
        }

        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A frame without pixels.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if the frame carries no pixels.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw packed BGR bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }


    /// Converts to single-channel luma (ITU-R BT.601 weights).
    pub fn to_gray(&self) -> GrayFrame {
        let data = self
            .data
            .chunks_exact(BGR_CHANNELS)
            .map(|px| match px {
                [b, g, r] => {
                    let luma = 114 * u32::from(*b) + 587 * u32::from(*g) + 299 * u32::from(*r);
                    (luma / 1000) as u8
                }
                _ => 0,
            })
            .collect();

        GrayFrame {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Draws the outline of `region`, clipped to the frame.
    ///
    /// # Errors
    ///
    /// - `DomainError::EmptyFrame` if the frame has no pixels
    /// - `DomainError::InvalidFieldValue` if the region is degenerate or
    ///   starts outside the frame
    pub fn draw_rect(&mut self, region: &Region, color: Bgr, thickness: u32) -> DomainResult<()> {
        if self.is_empty() {
            return Err(DomainError::EmptyFrame);
        }
        if region.width == 0
            || region.height == 0
            || region.x >= self.width
            || region.y >= self.height
        {
            return Err(DomainError::invalid(
                "region",
                region,
                format!("non-empty and inside {}x{}", self.width, self.height),
            ));
        }

        let t = thickness.max(1);
        let (x0, y0) = (region.x, region.y);
        let x1 = region.x.saturating_add(region.width).min(self.width) - 1;
        let y1 = region.y.saturating_add(region.height).min(self.height) - 1;

        for y in y0..=y1 {
            let horizontal_edge = y < y0 + t || y + t > y1;
            for x in x0..=x1 {
                if horizontal_edge || x < x0 + t || x + t > x1 {
                    self.put_pixel(x, y, color);
                }
            }
        }

        Ok(())
    }

    /// Renders one line of text with its top-left corner at `(x, y)`.
    ///
    /// Glyphs come from an 8x8 bitmap font, each font pixel drawn as a
    /// `scale` x `scale` block. With a `background`, the text's cell row is
    /// filled first. Characters outside ASCII render as `?`. Anything past
    /// the frame edge is clipped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EmptyFrame` if the frame has no pixels.
    pub fn draw_text(
        &mut self,
        x: u32,
        y: u32,
        text: &str,
        color: Bgr,
        background: Option<Bgr>,
        scale: u32,
    ) -> DomainResult<()> {
        if self.is_empty() {
            return Err(DomainError::EmptyFrame);
        }

        let scale = scale.max(1);
        let cell = GLYPH_SIZE.saturating_mul(scale);

        if let Some(background) = background {
            let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
            self.fill(x, y, chars.saturating_mul(cell), cell, background);
        }

        let mut gx = x;
        for c in text.chars() {
            if gx >= self.width {
                break;
            }
            for (row, bits) in (0u32..).zip(glyph(c)) {
                for col in 0..GLYPH_SIZE {
                    if bits & (1 << col) != 0 {
                        self.fill(
                            gx.saturating_add(col.saturating_mul(scale)),
                            y.saturating_add(row.saturating_mul(scale)),
                            scale,
                            scale,
                            color,
                        );
                    }
                }
            }
            gx = gx.saturating_add(cell);
        }

        Ok(())
    }

    /// Fills a rectangle, clipped to the frame.
    fn fill(&mut self, x: u32, y: u32, width: u32, height: u32, color: Bgr) {
        let x1 = x.saturating_add(width).min(self.width);
        let y1 = y.saturating_add(height).min(self.height);
        for py in y..y1 {
            for px in x..x1 {
                self.put_pixel(px, py, color);
            }
        }
    }

    fn put_pixel(&mut self, x: u32, y: u32, color: Bgr) {
        let offset = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
        if let Some(px) = self.data.get_mut(offset..offset + BGR_CHANNELS) {
            px.copy_from_slice(&[color.0, color.1, color.2]);
        }
    }

    /// Reads one pixel, `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Bgr> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
        match self.data.get(offset..offset + BGR_CHANNELS) {
            Some([b, g, r]) => Some(Bgr(*b, *g, *r)),
            _ => None,
        }
    }
}

/// Row bitmaps for `c`, least significant bit leftmost.
fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

fn pixel_count(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)
}

// ============================================================================
// Grayscale Frame
// ============================================================================

/// Single-channel frame handed to the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl GrayFrame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
