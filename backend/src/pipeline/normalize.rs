//! Pixel buffer to model input tensor.
//!
//! Bilinear resize to a fixed square resolution, ignoring aspect ratio,
//! followed by a plain division by 255. The sampling grid matches
//! TensorFlow's `resize_bilinear` (corners not aligned); switching on
//! `half_pixel_centers` selects the TF2 sampling grid instead.

use ndarray::{Array4, ArrayView4};

use super::decode::PixelBuffer;

pub const DEFAULT_INPUT_SIZE: usize = 224;
pub const CHANNELS: usize = 3;
pub const DEFAULT_SCALE: f32 = 255.0;

/// An NHWC `[1, size, size, 3]` tensor with every element in `[0, 1]`.
///
/// Owned by the request that produced it and consumed by the forward pass.
#[derive(Debug, Clone)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn into_array(self) -> Array4<f32> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    pub size: usize,
    pub scale: f32,
    pub half_pixel_centers: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            size: DEFAULT_INPUT_SIZE,
            scale: DEFAULT_SCALE,
            half_pixel_centers: false,
        }
    }
}

/// Source coordinate, lower/upper neighbour and interpolation weight.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f32,
}

impl Normalizer {
    pub fn input_shape(&self) -> [usize; 4] {
        [1, self.size, self.size, CHANNELS]
    }

    pub fn normalize(&self, pixels: &PixelBuffer) -> InputTensor {
        let xs = self.taps(pixels.width() as usize);
        let ys = self.taps(pixels.height() as usize);

        let mut tensor = Array4::<f32>::zeros(self.input_shape());
        for (oy, ty) in ys.iter().enumerate() {
            for (ox, tx) in xs.iter().enumerate() {
                for c in 0..CHANNELS {
                    let top_left = pixels.sample(tx.lo, ty.lo, c) as f32;
                    let top_right = pixels.sample(tx.hi, ty.lo, c) as f32;
                    let bottom_left = pixels.sample(tx.lo, ty.hi, c) as f32;
                    let bottom_right = pixels.sample(tx.hi, ty.hi, c) as f32;

                    let top = top_left + (top_right - top_left) * tx.frac;
                    let bottom = bottom_left + (bottom_right - bottom_left) * tx.frac;
                    let value = top + (bottom - top) * ty.frac;

                    tensor[[0, oy, ox, c]] = (value / self.scale).clamp(0.0, 1.0);
                }
            }
        }
        InputTensor(tensor)
    }

    fn taps(&self, in_len: usize) -> Vec<Tap> {
        let ratio = in_len as f32 / self.size as f32;
        (0..self.size)
            .map(|out| {
                let src = if self.half_pixel_centers {
                    ((out as f32 + 0.5) * ratio - 0.5).max(0.0)
                } else {
                    out as f32 * ratio
                };
                let lo = (src.floor() as usize).min(in_len - 1);
                let hi = (lo + 1).min(in_len - 1);
                Tap {
                    lo,
                    hi,
                    frac: src - src.floor(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(width: u32, height: u32, f: impl Fn(u32, u32, usize) -> u8) -> PixelBuffer {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    data.push(f(x, y, c));
                }
            }
        }
        PixelBuffer::new(width, height, data).unwrap()
    }

    #[test]
    fn test_shape_for_arbitrary_sizes() {
        let normalizer = Normalizer::default();
        for (w, h) in [(1, 1), (3, 500), (640, 480), (224, 224), (1000, 7)] {
            let tensor = normalizer.normalize(&buffer(w, h, |x, y, c| ((x + y) as usize + c) as u8));
            assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
        }
    }

    #[test]
    fn test_range_invariant() {
        let normalizer = Normalizer::default();
        let extremes = buffer(31, 17, |x, y, _| if (x + y) % 2 == 0 { 255 } else { 0 });
        let tensor = normalizer.normalize(&extremes);
        assert!(tensor.view().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_constant_image_and_scale() {
        let normalizer = Normalizer::default();
        let tensor = normalizer.normalize(&buffer(50, 80, |_, _, c| [255, 51, 0][c]));
        let view = tensor.view();
        assert!((view[[0, 10, 200, 0]] - 1.0).abs() < 1e-6);
        assert!((view[[0, 100, 3, 1]] - 0.2).abs() < 1e-6);
        assert_eq!(view[[0, 223, 223, 2]], 0.0);
    }

    #[test]
    fn test_identity_when_sizes_match() {
        let normalizer = Normalizer {
            size: 4,
            ..Normalizer::default()
        };
        let pixels = buffer(4, 4, |x, y, c| (x * 40 + y * 10 + c as u32) as u8);
        let tensor = normalizer.normalize(&pixels);
        let view = tensor.view();
        for y in 0..4 {
            for x in 0..4 {
                for c in 0..3 {
                    let expected = pixels.sample(x, y, c) as f32 / 255.0;
                    assert!((view[[0, y, x, c]] - expected).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_upscale_interpolates_between_neighbours() {
        let normalizer = Normalizer {
            size: 4,
            ..Normalizer::default()
        };
        // 2 columns, 0 and 200: the legacy grid samples x = 0, 0.5, 1, 1.5.
        let pixels = buffer(2, 1, |x, _, _| if x == 0 { 0 } else { 200 });
        let view_tensor = normalizer.normalize(&pixels);
        let row: Vec<f32> = (0..4)
            .map(|x| view_tensor.view()[[0, 0, x, 0]] * 255.0)
            .collect();
        let expected = [0.0, 100.0, 200.0, 200.0];
        for (got, want) in row.iter().zip(expected) {
            assert!((got - want).abs() < 1e-3, "{row:?}");
        }
    }

    #[test]
    fn test_half_pixel_centers_grid() {
        let normalizer = Normalizer {
            size: 4,
            half_pixel_centers: true,
            ..Normalizer::default()
        };
        // Same 2 columns on the TF2 grid: x = max(0, (o + 0.5) / 2 - 0.5).
        let pixels = buffer(2, 1, |x, _, _| if x == 0 { 0 } else { 200 });
        let tensor = normalizer.normalize(&pixels);
        let expected = [0.0, 50.0, 150.0, 200.0];
        for (x, want) in expected.iter().enumerate() {
            let got = tensor.view()[[0, 0, x, 0]] * 255.0;
            assert!((got - want).abs() < 1e-3, "column {}: {}", x, got);
        }
    }
}
