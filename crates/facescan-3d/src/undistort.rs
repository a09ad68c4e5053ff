//! Radial lens distortion correction driven by a magnification lookup table.
//!
//! For every pixel `p` of the corrected image the map stores the location in the
//! distorted input it should be sampled from:
//!
//! ```text
//! r     = |p − c| / r_max
//! scale = 1 + lerp(lookup, r · len(lookup))
//! src   = (p − c) · scale + c
//! ```
//!
//! where `c` is the distortion center and `r_max` the largest pixel distance to `c`.

use rayon::prelude::*;

use crate::frame::{ColorFrame, DepthFrame, FrameError, ImageSize};

/// Error types for the undistortion map.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UndistortError {
    /// The lookup table is empty
    #[error("The distortion lookup table is empty")]
    EmptyLookup,

    /// The lookup table holds non-finite values
    #[error("The distortion lookup table contains non-finite values")]
    NonFiniteLookup,

    /// The map and the frame have different sizes
    #[error("Frame size {0} does not match the undistortion map size {1}")]
    SizeMismatch(ImageSize, ImageSize),

    /// The frame could not be rebuilt
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Per-pixel source coordinates to resample a distorted frame into an undistorted one.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortionMap {
    size: ImageSize,
    map: Vec<[f64; 2]>,
}

fn interpolate_lookup(lookup: &[f64], x: f64) -> f64 {
    if x <= 0.0 {
        return lookup[0];
    }
    let i = x.floor() as usize;
    if i + 1 >= lookup.len() {
        return lookup[lookup.len() - 1];
    }
    let alpha = x - i as f64;
    lookup[i] * (1.0 - alpha) + lookup[i + 1] * alpha
}

impl UndistortionMap {
    /// Build the map from an inverse lens distortion lookup table.
    ///
    /// # Arguments
    ///
    /// * `lookup` - Radial magnification table, indexed by normalized radius.
    /// * `center` - Distortion center in pixels of an image of size `size`.
    /// * `size` - Size of the frames the map is applied to.
    pub fn from_inverse_lookup(
        lookup: &[f64],
        center: [f64; 2],
        size: ImageSize,
    ) -> Result<Self, UndistortError> {
        if lookup.is_empty() {
            return Err(UndistortError::EmptyLookup);
        }
        if lookup.iter().any(|v| !v.is_finite()) {
            return Err(UndistortError::NonFiniteLookup);
        }
        if size.num_pixels() == 0 {
            return Err(FrameError::EmptyFrame(size).into());
        }

        let [cx, cy] = center;
        let (w, h) = ((size.width - 1) as f64, (size.height - 1) as f64);
        let max_r = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .iter()
            .map(|(x, y)| (x - cx).hypot(y - cy))
            .fold(0.0, f64::max);

        let len = lookup.len() as f64;
        let mut map = Vec::with_capacity(size.num_pixels());
        for y in 0..size.height {
            for x in 0..size.width {
                let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                let r = if max_r > 0.0 { dx.hypot(dy) / max_r } else { 0.0 };
                let scale = 1.0 + interpolate_lookup(lookup, r * len);
                map.push([dx * scale + cx, dy * scale + cy]);
            }
        }

        Ok(Self { size, map })
    }

    /// The size of the frames this map applies to.
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// The source coordinate sampled for the pixel `(x, y)`.
    pub fn source(&self, x: usize, y: usize) -> [f64; 2] {
        self.map[y * self.size.width + x]
    }

    /// Resample a depth frame.
    ///
    /// Samples are interpolated bilinearly when all four neighbours hold a valid depth and
    /// taken from the nearest neighbour otherwise, so depth is never blended across an
    /// invalid hole. Pixels that map outside the frame become `NaN`.
    pub fn remap_depth(&self, depth: &DepthFrame) -> Result<DepthFrame, UndistortError> {
        self.check_size(depth.size())?;
        let data = self
            .map
            .par_iter()
            .map(|&[u, v]| sample_depth(depth, u, v))
            .collect::<Vec<_>>();
        Ok(DepthFrame::new(self.size, data)?)
    }

    /// Resample a color frame bilinearly. Pixels that map outside the frame become zero.
    pub fn remap_color(&self, color: &ColorFrame) -> Result<ColorFrame, UndistortError> {
        self.check_size(color.size())?;
        let data = self
            .map
            .par_iter()
            .map(|&[u, v]| sample_color(color, u, v))
            .collect::<Vec<_>>();
        Ok(ColorFrame::new(self.size, data, color.channel_order())?)
    }

    fn check_size(&self, size: ImageSize) -> Result<(), UndistortError> {
        if size != self.size {
            return Err(UndistortError::SizeMismatch(size, self.size));
        }
        Ok(())
    }
}

// the four integer neighbours of (u, v) and the fractional offsets, None when outside
fn neighbours(size: ImageSize, u: f64, v: f64) -> Option<([usize; 4], f64, f64)> {
    let (w, h) = ((size.width - 1) as f64, (size.height - 1) as f64);
    if !(u >= 0.0 && v >= 0.0 && u <= w && v <= h) {
        return None;
    }
    let (u0, v0) = (u.floor() as usize, v.floor() as usize);
    let u1 = (u0 + 1).min(size.width - 1);
    let v1 = (v0 + 1).min(size.height - 1);
    Some(([u0, u1, v0, v1], u - u0 as f64, v - v0 as f64))
}

fn sample_depth(depth: &DepthFrame, u: f64, v: f64) -> f32 {
    let Some(([u0, u1, v0, v1], fu, fv)) = neighbours(depth.size(), u, v) else {
        return f32::NAN;
    };
    let samples = [
        depth.get(u0, v0),
        depth.get(u1, v0),
        depth.get(u0, v1),
        depth.get(u1, v1),
    ];
    if samples.iter().all(|d| d.is_finite() && *d > 0.0) {
        let top = samples[0] as f64 * (1.0 - fu) + samples[1] as f64 * fu;
        let bottom = samples[2] as f64 * (1.0 - fu) + samples[3] as f64 * fu;
        (top * (1.0 - fv) + bottom * fv) as f32
    } else {
        let x = if fu < 0.5 { u0 } else { u1 };
        let y = if fv < 0.5 { v0 } else { v1 };
        depth.get(x, y)
    }
}

fn sample_color(color: &ColorFrame, u: f64, v: f64) -> [u8; 4] {
    let Some(([u0, u1, v0, v1], fu, fv)) = neighbours(color.size(), u, v) else {
        return [0; 4];
    };
    let (p00, p01) = (color.get(u0, v0), color.get(u1, v0));
    let (p10, p11) = (color.get(u0, v1), color.get(u1, v1));
    let mut pixel = [0u8; 4];
    for (k, value) in pixel.iter_mut().enumerate() {
        let top = p00[k] as f64 * (1.0 - fu) + p01[k] as f64 * fu;
        let bottom = p10[k] as f64 * (1.0 - fu) + p11[k] as f64 * fu;
        *value = (top * (1.0 - fv) + bottom * fv).round().clamp(0.0, 255.0) as u8;
    }
    pixel
}
