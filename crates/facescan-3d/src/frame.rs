use serde::{Deserialize, Serialize};

/// Error types for depth and color frames.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    /// The number of samples does not match the frame size.
    #[error("Data length ({0}) does not match the frame size ({1})")]
    InvalidDataLength(usize, usize),

    /// The frame has zero width or height.
    #[error("Frame size must be non-zero, got {0}")]
    EmptyFrame(ImageSize),
}

/// Image size in pixels
///
/// # Examples
///
/// ```
/// use facescan_3d::frame::ImageSize;
///
/// let size = ImageSize { width: 640, height: 480 };
/// assert_eq!(size.num_pixels(), 307200);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Width of the image in pixels
    pub width: usize,
    /// Height of the image in pixels
    pub height: usize,
}

impl ImageSize {
    /// Total number of pixels.
    #[inline]
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// Whether the pixel `(x, y)` lies inside the image.
    #[inline]
    pub fn contains(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "ImageSize {{ width: {}, height: {} }}",
            self.width, self.height
        )
    }
}

impl From<[usize; 2]> for ImageSize {
    fn from(size: [usize; 2]) -> Self {
        ImageSize {
            width: size[0],
            height: size[1],
        }
    }
}

/// Byte order of the four color channels of a pixel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// red, green, blue, alpha
    #[default]
    Rgba,
    /// blue, green, red, alpha
    Bgra,
}

impl ChannelOrder {
    /// Reorder a pixel stored in `self` order into `target` order.
    ///
    /// ```
    /// use facescan_3d::frame::ChannelOrder;
    ///
    /// let rgba = ChannelOrder::Bgra.convert([10, 20, 30, 255], ChannelOrder::Rgba);
    /// assert_eq!(rgba, [30, 20, 10, 255]);
    /// ```
    #[inline]
    pub fn convert(self, pixel: [u8; 4], target: ChannelOrder) -> [u8; 4] {
        if self == target {
            pixel
        } else {
            // both orders share green and alpha, so the swap is its own inverse
            [pixel[2], pixel[1], pixel[0], pixel[3]]
        }
    }

    /// Reorder a pixel stored in `self` order into RGBA.
    #[inline]
    pub fn to_rgba(self, pixel: [u8; 4]) -> [u8; 4] {
        self.convert(pixel, ChannelOrder::Rgba)
    }
}

/// A depth map in millimeters, stored row-major.
///
/// Invalid samples are encoded by the sensor as `NaN` or `0.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthFrame {
    size: ImageSize,
    data: Vec<f32>,
}

impl DepthFrame {
    /// Create a depth frame from row-major samples.
    ///
    /// # Errors
    ///
    /// Fails when the frame is empty or `data.len() != width * height`.
    pub fn new(size: ImageSize, data: Vec<f32>) -> Result<Self, FrameError> {
        if size.num_pixels() == 0 {
            return Err(FrameError::EmptyFrame(size));
        }
        if data.len() != size.num_pixels() {
            return Err(FrameError::InvalidDataLength(data.len(), size.num_pixels()));
        }
        Ok(Self { size, data })
    }

    /// Create a depth frame from raw little-endian `f32` bytes.
    pub fn from_le_bytes(size: ImageSize, bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != size.num_pixels() * 4 {
            return Err(FrameError::InvalidDataLength(
                bytes.len() / 4,
                size.num_pixels(),
            ));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::new(size, data)
    }

    /// Create a depth frame filled with a constant value.
    pub fn from_value(size: ImageSize, value: f32) -> Result<Self, FrameError> {
        Self::new(size, vec![value; size.num_pixels()])
    }

    /// The size of the frame.
    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// The width of the frame in pixels.
    #[inline]
    pub fn width(&self) -> usize {
        self.size.width
    }

    /// The height of the frame in pixels.
    #[inline]
    pub fn height(&self) -> usize {
        self.size.height
    }

    /// The row-major depth samples.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The depth sample at `(x, y)`.
    ///
    /// PRECONDITION: `x < width` and `y < height`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.size.width + x]
    }

    /// The depth sample at `(x, y)`, or `None` outside the frame.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<f32> {
        self.size
            .contains(x, y)
            .then(|| self.get(x as usize, y as usize))
    }
}

/// A four channel 8-bit color image, stored row-major with an explicit channel order.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorFrame {
    size: ImageSize,
    data: Vec<[u8; 4]>,
    order: ChannelOrder,
}

impl ColorFrame {
    /// Create a color frame from row-major pixels.
    ///
    /// # Errors
    ///
    /// Fails when the frame is empty or `data.len() != width * height`.
    pub fn new(size: ImageSize, data: Vec<[u8; 4]>, order: ChannelOrder) -> Result<Self, FrameError> {
        if size.num_pixels() == 0 {
            return Err(FrameError::EmptyFrame(size));
        }
        if data.len() != size.num_pixels() {
            return Err(FrameError::InvalidDataLength(data.len(), size.num_pixels()));
        }
        Ok(Self { size, data, order })
    }

    /// Create a color frame from interleaved bytes, four per pixel.
    pub fn from_bytes(size: ImageSize, bytes: &[u8], order: ChannelOrder) -> Result<Self, FrameError> {
        if bytes.len() != size.num_pixels() * 4 {
            return Err(FrameError::InvalidDataLength(
                bytes.len() / 4,
                size.num_pixels(),
            ));
        }
        let data = bytes
            .chunks_exact(4)
            .map(|b| [b[0], b[1], b[2], b[3]])
            .collect();
        Self::new(size, data, order)
    }

    /// Create a color frame where every pixel has the same value.
    pub fn from_pixel(size: ImageSize, pixel: [u8; 4], order: ChannelOrder) -> Result<Self, FrameError> {
        Self::new(size, vec![pixel; size.num_pixels()], order)
    }

    /// The size of the frame.
    #[inline]
    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// The channel order of the stored pixels.
    #[inline]
    pub fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    /// The row-major pixels.
    #[inline]
    pub fn as_slice(&self) -> &[[u8; 4]] {
        &self.data
    }

    /// The pixel at `(x, y)` in the frame's channel order.
    ///
    /// PRECONDITION: `x < width` and `y < height`.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> [u8; 4] {
        self.data[y * self.size.width + x]
    }

    /// Resample the frame onto a grid of `new_size` with nearest neighbour lookup.
    ///
    /// Pixel centers are aligned, so downscaling by an integer factor picks the sample
    /// closest to the center of each destination pixel.
    pub fn resize_nearest(&self, new_size: ImageSize) -> Result<ColorFrame, FrameError> {
        if new_size == self.size {
            return Ok(self.clone());
        }
        if new_size.num_pixels() == 0 {
            return Err(FrameError::EmptyFrame(new_size));
        }

        let scale_x = self.size.width as f64 / new_size.width as f64;
        let scale_y = self.size.height as f64 / new_size.height as f64;

        let src_cols = (0..new_size.width)
            .map(|x| nearest_source_index(x, scale_x, self.size.width))
            .collect::<Vec<_>>();

        let mut data = Vec::with_capacity(new_size.num_pixels());
        for y in 0..new_size.height {
            let sy = nearest_source_index(y, scale_y, self.size.height);
            let row = &self.data[sy * self.size.width..(sy + 1) * self.size.width];
            data.extend(src_cols.iter().map(|&sx| row[sx]));
        }

        ColorFrame::new(new_size, data, self.order)
    }
}

fn nearest_source_index(dst: usize, scale: f64, src_len: usize) -> usize {
    let src = ((dst as f64 + 0.5) * scale).floor() as usize;
    src.min(src_len - 1)
}
