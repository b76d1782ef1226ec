//! Image preprocessing pipeline.
//!
//! Turns a raw RGB camera frame into a contrast-enhanced greyscale image in
//! which target outlines are reinforced.  Six stages run in order:
//!
//! 1. **Colour denoise** – non-local means on a luma/chroma split; luma is
//!    filtered with `denoise_h`, chroma with `denoise_h_color`.
//! 2. **Greyscale** – BT.601 luma of the denoised image.
//! 3. **CLAHE** – contrast-limited adaptive histogram equalisation.
//! 4. **Gaussian blur + Canny** – 5×5 blur (σ = 1.1), Sobel gradients,
//!    non-maximum suppression and hysteresis thresholding.
//! 5. **Morphological close** – 3×3 dilate then erode, bridging one-pixel
//!    gaps in the edge map.
//! 6. **Blend** – `0.8 · equalised + 0.2 · closed edges`.
//!
//! # Example
//!
//! ```rust
//! use relume_hal::camera::CameraFrame;
//! use relume_perception::preprocess::{PreprocessConfig, Preprocessor};
//!
//! let frame = CameraFrame::black(16, 12);
//! let pre = Preprocessor::new(PreprocessConfig::default());
//! let out = pre.run(&frame).unwrap();
//! assert_eq!((out.width(), out.height()), (16, 12));
//! ```

use std::borrow::Cow;

use relume_hal::camera::CameraFrame;
use relume_types::RelumeError;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::image::{GrayImage, reflect101};

/// Tunable parameters of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Frames wider than this are block-averaged down by an integer factor
    /// before any other stage; `0` keeps the input resolution.
    pub working_width: u32,
    /// Luma filter strength; `0` disables luma denoising.
    pub denoise_h: f32,
    /// Chroma filter strength; `0` disables chroma denoising.
    pub denoise_h_color: f32,
    /// Side of the patch compared between pixels (odd).
    pub template_window: usize,
    /// Side of the neighbourhood searched for similar patches (odd).
    pub search_window: usize,
    pub clahe_clip_limit: f32,
    /// CLAHE grid as `(columns, rows)`.
    pub clahe_tiles: (u32, u32),
    pub canny_low: f32,
    pub canny_high: f32,
    /// Weight of the equalised image in the final blend; the edge map gets
    /// `1 - equalized_weight`.
    pub equalized_weight: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            working_width: 160,
            denoise_h: 10.0,
            denoise_h_color: 10.0,
            template_window: 3,
            search_window: 7,
            clahe_clip_limit: 2.0,
            clahe_tiles: (8, 8),
            canny_low: 50.0,
            canny_high: 150.0,
            equalized_weight: 0.8,
        }
    }
}

impl PreprocessConfig {
    /// Copy with window sizes forced odd and positive, thresholds ordered and
    /// weights in range.
    fn normalized(&self) -> Self {
        let odd = |n: usize| if n == 0 { 1 } else { n | 1 };
        let (low, high) = if self.canny_low <= self.canny_high {
            (self.canny_low, self.canny_high)
        } else {
            (self.canny_high, self.canny_low)
        };
        Self {
            working_width: self.working_width,
            denoise_h: self.denoise_h.max(0.0),
            denoise_h_color: self.denoise_h_color.max(0.0),
            template_window: odd(self.template_window),
            search_window: odd(self.search_window),
            clahe_clip_limit: self.clahe_clip_limit,
            clahe_tiles: (self.clahe_tiles.0.max(1), self.clahe_tiles.1.max(1)),
            canny_low: low,
            canny_high: high,
            equalized_weight: self.equalized_weight.clamp(0.0, 1.0),
        }
    }
}

/// Every intermediate image produced by [`Preprocessor::run_with_stages`].
#[derive(Debug, Clone)]
pub struct PreprocessStages {
    pub denoised: CameraFrame,
    pub gray: GrayImage,
    pub equalized: GrayImage,
    pub blurred: GrayImage,
    pub edges: GrayImage,
    pub closed: GrayImage,
    pub output: GrayImage,
}

impl PreprocessStages {
    /// `(name, image)` pairs for the greyscale stages, in pipeline order.
    pub fn named_gray_stages(&self) -> [(&'static str, &GrayImage); 6] {
        [
            ("2_gray", &self.gray),
            ("3_equalized", &self.equalized),
            ("4a_blurred", &self.blurred),
            ("4b_edges", &self.edges),
            ("5_closed", &self.closed),
            ("6_output", &self.output),
        ]
    }
}

/// Stateless preprocessing pipeline.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Downscale factor applied to a frame `width` × `height`.
    pub fn scale_factor(&self, width: u32, height: u32) -> u32 {
        if self.config.working_width == 0 {
            return 1;
        }
        (width / self.config.working_width).clamp(1, height.max(1))
    }

    /// Run the full pipeline and return the final image.
    ///
    /// Only luma is denoised here since chroma never reaches the output.
    /// The result is at working resolution.
    ///
    /// # Errors
    ///
    /// Returns [`RelumeError::Image`] for empty frames or frames whose buffer
    /// does not match their dimensions.
    pub fn run(&self, frame: &CameraFrame) -> Result<GrayImage, RelumeError> {
        validate(frame)?;
        let frame = downscale(frame, self.scale_factor(frame.width, frame.height));
        let c = &self.config;
        let (w, h) = (frame.width as usize, frame.height as usize);
        let (y, _, _) = split_ycbcr(&frame);
        let y = nl_means(&y, w, h, c.denoise_h, c.template_window, c.search_window);
        let gray = luma_image(frame.width, frame.height, &y);
        debug!(width = frame.width, height = frame.height, "denoise complete");
        let equalized = clahe(&gray, c.clahe_clip_limit, c.clahe_tiles);
        let edges = canny(&gaussian_blur_5x5(&equalized), c.canny_low, c.canny_high);
        let closed = erode_3x3(&dilate_3x3(&edges));
        Ok(blend(&equalized, &closed, c.equalized_weight))
    }

    /// Run the full pipeline keeping every intermediate image, including the
    /// colour-denoised frame.
    pub fn run_with_stages(&self, frame: &CameraFrame) -> Result<PreprocessStages, RelumeError> {
        validate(frame)?;
        let frame = downscale(frame, self.scale_factor(frame.width, frame.height));
        let c = &self.config;

        let (denoised, gray) = denoise_color(&frame, c);
        debug!("denoise complete");
        let equalized = clahe(&gray, c.clahe_clip_limit, c.clahe_tiles);
        debug!("contrast equalisation complete");
        let blurred = gaussian_blur_5x5(&equalized);
        let edges = canny(&blurred, c.canny_low, c.canny_high);
        debug!("edge detection complete");
        let closed = erode_3x3(&dilate_3x3(&edges));
        let output = blend(&equalized, &closed, c.equalized_weight);
        debug!("preprocessing complete");

        Ok(PreprocessStages {
            denoised,
            gray,
            equalized,
            blurred,
            edges,
            closed,
            output,
        })
    }
}

fn validate(frame: &CameraFrame) -> Result<(), RelumeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(RelumeError::Image("input frame is empty".to_string()));
    }
    if !frame.is_consistent() {
        return Err(RelumeError::Image(format!(
            "frame buffer of {} bytes does not match {}x{} RGB",
            frame.data.len(),
            frame.width,
            frame.height
        )));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Stage 0: working resolution
// ────────────────────────────────────────────────────────────────────────────

/// Average `factor` × `factor` blocks.  Trailing rows and columns that do not
/// fill a whole block are dropped.
pub(crate) fn downscale(frame: &CameraFrame, factor: u32) -> Cow<'_, CameraFrame> {
    if factor <= 1 {
        return Cow::Borrowed(frame);
    }
    let (w, h) = (frame.width / factor, frame.height / factor);
    let stride = frame.width as usize * 3;
    let area = factor * factor;
    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for by in 0..h as usize {
        for bx in 0..w as usize {
            let mut sum = [0u32; 3];
            for y in by * factor as usize..(by + 1) * factor as usize {
                let row = y * stride;
                for x in bx * factor as usize..(bx + 1) * factor as usize {
                    let i = row + x * 3;
                    for (s, &v) in sum.iter_mut().zip(&frame.data[i..i + 3]) {
                        *s += u32::from(v);
                    }
                }
            }
            data.extend(sum.map(|s| ((s + area / 2) / area) as u8));
        }
    }
    Cow::Owned(CameraFrame { width: w, height: h, data })
}

// ────────────────────────────────────────────────────────────────────────────
// Stage 1 + 2: colour denoise and greyscale
// ────────────────────────────────────────────────────────────────────────────

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Denoise in YCbCr space and return the denoised RGB frame together with
/// its luma channel.
fn split_ycbcr(frame: &CameraFrame) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let n = frame.width as usize * frame.height as usize;
    let mut y = Vec::with_capacity(n);
    let mut cb = Vec::with_capacity(n);
    let mut cr = Vec::with_capacity(n);
    for px in frame.data.chunks_exact(3) {
        let (r, g, b) = (f32::from(px[0]), f32::from(px[1]), f32::from(px[2]));
        y.push(0.299 * r + 0.587 * g + 0.114 * b);
        cb.push(128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b);
        cr.push(128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b);
    }
    (y, cb, cr)
}

fn luma_image(width: u32, height: u32, y: &[f32]) -> GrayImage {
    let gray = y.iter().map(|&v| to_u8(v)).collect();
    GrayImage::from_raw(width, height, gray).unwrap_or_else(|_| GrayImage::filled(width, height, 0))
}

fn denoise_color(frame: &CameraFrame, c: &PreprocessConfig) -> (CameraFrame, GrayImage) {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let n = w * h;
    let (y, cb, cr) = split_ycbcr(frame);

    let y = nl_means(&y, w, h, c.denoise_h, c.template_window, c.search_window);
    let cb = nl_means(&cb, w, h, c.denoise_h_color, c.template_window, c.search_window);
    let cr = nl_means(&cr, w, h, c.denoise_h_color, c.template_window, c.search_window);

    let mut rgb = Vec::with_capacity(n * 3);
    for i in 0..n {
        let (yy, u, v) = (y[i], cb[i] - 128.0, cr[i] - 128.0);
        rgb.push(to_u8(yy + 1.402 * v));
        rgb.push(to_u8(yy - 0.344_136 * u - 0.714_136 * v));
        rgb.push(to_u8(yy + 1.772 * u));
    }
    (
        CameraFrame {
            width: frame.width,
            height: frame.height,
            data: rgb,
        },
        luma_image(frame.width, frame.height, &y),
    )
}

/// Non-local means on one channel.
///
/// For every offset in the search window the squared-difference image is
/// summed with an integral image, so each patch distance costs O(1).  Patch
/// weights are `exp(-mean_sq_diff / h²)`; patches are clipped at the border.
pub(crate) fn nl_means(
    plane: &[f32],
    w: usize,
    h: usize,
    strength: f32,
    template: usize,
    search: usize,
) -> Vec<f32> {
    if strength <= 0.0 || w == 0 || h == 0 {
        return plane.to_vec();
    }
    let tr = (template / 2) as i64;
    let sr = (search / 2) as i64;
    let h2 = strength * strength;
    let n = w * h;

    let mut acc = vec![0f32; n];
    let mut wsum = vec![0f32; n];
    let mut diff = vec![0f64; n];
    let mut integral = vec![0f64; (w + 1) * (h + 1)];
    let stride = w + 1;

    let neighbour = |x: usize, y: usize, dx: i64, dy: i64| -> usize {
        let qx = reflect101(x as i64 + dx, w);
        let qy = reflect101(y as i64 + dy, h);
        qy * w + qx
    };

    for dy in -sr..=sr {
        for dx in -sr..=sr {
            for y in 0..h {
                for x in 0..w {
                    let i = y * w + x;
                    let d = f64::from(plane[i] - plane[neighbour(x, y, dx, dy)]);
                    diff[i] = d * d;
                }
            }
            for y in 0..h {
                let mut row = 0f64;
                for x in 0..w {
                    row += diff[y * w + x];
                    integral[(y + 1) * stride + x + 1] = integral[y * stride + x + 1] + row;
                }
            }
            for y in 0..h {
                let y0 = (y as i64 - tr).max(0) as usize;
                let y1 = ((y as i64 + tr) as usize).min(h - 1) + 1;
                for x in 0..w {
                    let x0 = (x as i64 - tr).max(0) as usize;
                    let x1 = ((x as i64 + tr) as usize).min(w - 1) + 1;
                    let sum = integral[y1 * stride + x1] - integral[y0 * stride + x1]
                        - integral[y1 * stride + x0]
                        + integral[y0 * stride + x0];
                    let count = ((y1 - y0) * (x1 - x0)) as f64;
                    let weight = (-(sum / count) as f32 / h2).exp();
                    let i = y * w + x;
                    acc[i] += weight * plane[neighbour(x, y, dx, dy)];
                    wsum[i] += weight;
                }
            }
        }
    }

    acc.iter()
        .zip(&wsum)
        .zip(plane)
        .map(|((&a, &s), &orig)| if s > 0.0 { a / s } else { orig })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Stage 3: CLAHE
// ────────────────────────────────────────────────────────────────────────────

/// Contrast-limited adaptive histogram equalisation.
pub(crate) fn clahe(img: &GrayImage, clip_limit: f32, tiles: (u32, u32)) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let tx = (tiles.0 as usize).clamp(1, w);
    let ty = (tiles.1 as usize).clamp(1, h);

    let bounds = |i: usize, count: usize, len: usize| (i * len / count, (i + 1) * len / count);

    // One 256-entry lookup table per tile.
    let mut luts = vec![[0u8; 256]; tx * ty];
    for j in 0..ty {
        let (y0, y1) = bounds(j, ty, h);
        for i in 0..tx {
            let (x0, x1) = bounds(i, tx, w);
            let mut hist = [0usize; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get(x as u32, y as u32) as usize] += 1;
                }
            }
            let area = (y1 - y0) * (x1 - x0);
            clip_histogram(&mut hist, clip_limit, area);

            let lut = &mut luts[j * tx + i];
            let scale = 255.0 / area.max(1) as f32;
            let mut cdf = 0usize;
            for (v, &count) in hist.iter().enumerate() {
                cdf += count;
                lut[v] = to_u8(cdf as f32 * scale);
            }
        }
    }

    // Bilinear blend of the four nearest tile mappings.
    let tile_w = w as f32 / tx as f32;
    let tile_h = h as f32 / ty as f32;
    let locate = |pos: usize, size: f32, count: usize| -> (usize, usize, f32) {
        let g = (pos as f32 + 0.5) / size - 0.5;
        if g <= 0.0 {
            return (0, 0, 0.0);
        }
        let lo = g.floor() as usize;
        if lo >= count - 1 {
            return (count - 1, count - 1, 0.0);
        }
        (lo, lo + 1, g - lo as f32)
    };

    let mut out = GrayImage::filled(img.width(), img.height(), 0);
    for y in 0..h {
        let (j0, j1, ay) = locate(y, tile_h, ty);
        for x in 0..w {
            let (i0, i1, ax) = locate(x, tile_w, tx);
            let v = img.get(x as u32, y as u32) as usize;
            let tl = f32::from(luts[j0 * tx + i0][v]);
            let tr = f32::from(luts[j0 * tx + i1][v]);
            let bl = f32::from(luts[j1 * tx + i0][v]);
            let br = f32::from(luts[j1 * tx + i1][v]);
            let top = tl + (tr - tl) * ax;
            let bottom = bl + (br - bl) * ax;
            out.set(x as u32, y as u32, to_u8(top + (bottom - top) * ay));
        }
    }
    out
}

/// Clip every bin at `clip_limit * area / 256` and spread the excess evenly.
fn clip_histogram(hist: &mut [usize; 256], clip_limit: f32, area: usize) {
    if clip_limit <= 0.0 {
        return;
    }
    let limit = ((clip_limit * area as f32 / 256.0) as usize).max(1);
    let mut excess = 0usize;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let per_bin = excess / 256;
    let remainder = excess % 256;
    for bin in hist.iter_mut() {
        *bin += per_bin;
    }
    if remainder > 0 {
        let step = (256 / remainder).max(1);
        for k in 0..remainder {
            hist[(k * step) % 256] += 1;
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stage 4: Gaussian blur and Canny
// ────────────────────────────────────────────────────────────────────────────

/// Normalised 5-tap Gaussian with σ = 1.1.
pub(crate) fn gaussian_kernel_5() -> [f32; 5] {
    let sigma = 1.1f32;
    let mut k = [0f32; 5];
    for (i, v) in k.iter_mut().enumerate() {
        let x = i as f32 - 2.0;
        *v = (-(x * x) / (2.0 * sigma * sigma)).exp();
    }
    let sum: f32 = k.iter().sum();
    k.iter_mut().for_each(|v| *v /= sum);
    k
}

pub(crate) fn gaussian_blur_5x5(img: &GrayImage) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let k = gaussian_kernel_5();

    let mut tmp = vec![0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            tmp[y * w + x] = (0..5)
                .map(|t| {
                    let sx = reflect101(x as i64 + t as i64 - 2, w);
                    k[t] * f32::from(img.get(sx as u32, y as u32))
                })
                .sum();
        }
    }
    let mut out = GrayImage::filled(img.width(), img.height(), 0);
    for y in 0..h {
        for x in 0..w {
            let v: f32 = (0..5)
                .map(|t| k[t] * tmp[reflect101(y as i64 + t as i64 - 2, h) * w + x])
                .sum();
            out.set(x as u32, y as u32, to_u8(v));
        }
    }
    out
}

/// Canny edge detector producing a binary (0 / 255) map.
pub(crate) fn canny(img: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut gx = vec![0i32; w * h];
    let mut gy = vec![0i32; w * h];
    let mut mag = vec![0i32; w * h];

    for y in 0..h {
        for x in 0..w {
            let p = |dx: i64, dy: i64| i32::from(img.get_replicate(x as i64 + dx, y as i64 + dy));
            let sx = (p(1, -1) + 2 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2 * p(-1, 0) + p(-1, 1));
            let sy = (p(-1, 1) + 2 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2 * p(0, -1) + p(1, -1));
            let i = y * w + x;
            gx[i] = sx;
            gy[i] = sy;
            mag[i] = sx.abs() + sy.abs();
        }
    }

    let mag_at = |x: i64, y: i64| -> i32 {
        if x < 0 || y < 0 || x >= w as i64 || y >= h as i64 {
            0
        } else {
            mag[y as usize * w + x as usize]
        }
    };

    // Non-maximum suppression.  tan(22.5°) ≈ 0.4142, tan(67.5°) ≈ 2.4142.
    let mut candidate = vec![false; w * h];
    let mut strong = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let m = mag[i];
            if (m as f32) <= low {
                continue;
            }
            let (ax, ay) = (i64::from(gx[i].abs()), i64::from(gy[i].abs()));
            let (xi, yi) = (x as i64, y as i64);
            let (a, b) = if ay * 10_000 <= ax * 4_142 {
                (mag_at(xi - 1, yi), mag_at(xi + 1, yi))
            } else if ay * 10_000 >= ax * 24_142 {
                (mag_at(xi, yi - 1), mag_at(xi, yi + 1))
            } else if (gx[i] > 0) == (gy[i] > 0) {
                (mag_at(xi - 1, yi - 1), mag_at(xi + 1, yi + 1))
            } else {
                (mag_at(xi + 1, yi - 1), mag_at(xi - 1, yi + 1))
            };
            if m > a && m >= b {
                candidate[i] = true;
                if (m as f32) > high {
                    strong.push(i);
                }
            }
        }
    }

    // Hysteresis: grow strong edges through 8-connected candidates.
    let mut out = GrayImage::filled(img.width(), img.height(), 0);
    let mut visited = vec![false; w * h];
    for &i in &strong {
        visited[i] = true;
    }
    let mut stack = strong;
    while let Some(i) = stack.pop() {
        let (x, y) = ((i % w) as i64, (i / w) as i64);
        out.set(x as u32, y as u32, 255);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if candidate[j] && !visited[j] {
                    visited[j] = true;
                    stack.push(j);
                }
            }
        }
    }
    out
}

// ────────────────────────────────────────────────────────────────────────────
// Stage 5 + 6: morphology and blend
// ────────────────────────────────────────────────────────────────────────────

fn morph_3x3(img: &GrayImage, pick: fn(u8, u8) -> u8) -> GrayImage {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let mut out = img.clone();
    for y in 0..h {
        for x in 0..w {
            let mut acc = img.get(x as u32, y as u32);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (x + dx, y + dy);
                    // Out-of-image samples never influence the result.
                    if nx >= 0 && ny >= 0 && nx < w && ny < h {
                        acc = pick(acc, img.get(nx as u32, ny as u32));
                    }
                }
            }
            out.set(x as u32, y as u32, acc);
        }
    }
    out
}

pub(crate) fn dilate_3x3(img: &GrayImage) -> GrayImage {
    morph_3x3(img, u8::max)
}

pub(crate) fn erode_3x3(img: &GrayImage) -> GrayImage {
    morph_3x3(img, u8::min)
}

pub(crate) fn blend(a: &GrayImage, b: &GrayImage, weight_a: f32) -> GrayImage {
    let data = a
        .pixels()
        .iter()
        .zip(b.pixels())
        .map(|(&pa, &pb)| to_u8(weight_a * f32::from(pa) + (1.0 - weight_a) * f32::from(pb)))
        .collect();
    GrayImage::from_raw(a.width(), a.height(), data).unwrap_or_else(|_| a.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> GrayImage {
        let mut img = GrayImage::filled(w, h, 0);
        for y in 0..h {
            for x in 0..w {
                img.set(x, y, f(x, y));
            }
        }
        img
    }

    fn frame_from_gray(img: &GrayImage) -> CameraFrame {
        CameraFrame {
            width: img.width(),
            height: img.height(),
            data: img.pixels().iter().flat_map(|&v| [v, v, v]).collect(),
        }
    }

    fn variance(v: &[f32]) -> f32 {
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        v.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / v.len() as f32
    }

    #[test]
    fn rejects_empty_and_inconsistent_frames() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        assert!(matches!(pre.run(&CameraFrame::black(0, 4)), Err(RelumeError::Image(_))));
        let broken = CameraFrame {
            width: 4,
            height: 4,
            data: vec![0; 10],
        };
        assert!(matches!(pre.run(&broken), Err(RelumeError::Image(_))));
    }

    #[test]
    fn config_is_normalised() {
        let pre = Preprocessor::new(PreprocessConfig {
            template_window: 6,
            search_window: 0,
            canny_low: 200.0,
            canny_high: 100.0,
            clahe_tiles: (0, 3),
            ..Default::default()
        });
        let c = pre.config();
        assert_eq!(c.template_window, 7);
        assert_eq!(c.search_window, 1);
        assert_eq!((c.canny_low, c.canny_high), (100.0, 200.0));
        assert_eq!(c.clahe_tiles, (1, 3));
    }

    #[test]
    fn nl_means_smooths_noise_and_keeps_edges() {
        let (w, h) = (24usize, 12usize);
        let mut plane = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                let base = if x < w / 2 { 40.0 } else { 200.0 };
                let noise = if (x * 7 + y * 13) % 3 == 0 { 6.0 } else { -3.0 };
                plane.push(base + noise);
            }
        }
        let out = nl_means(&plane, w, h, 10.0, 3, 7);

        let left: Vec<f32> = (0..h).flat_map(|y| (0..w / 2 - 2).map(move |x| (x, y))).map(|(x, y)| out[y * w + x]).collect();
        let left_in: Vec<f32> = (0..h).flat_map(|y| (0..w / 2 - 2).map(move |x| (x, y))).map(|(x, y)| plane[y * w + x]).collect();
        assert!(variance(&left) < variance(&left_in));

        // The step between the halves survives.
        let a = out[5 * w + w / 2 - 1];
        let b = out[5 * w + w / 2];
        assert!(b - a > 120.0, "edge preserved: {a} → {b}");
    }

    #[test]
    fn nl_means_with_zero_strength_is_identity() {
        let plane = vec![1.0, 5.0, 9.0, 2.0];
        assert_eq!(nl_means(&plane, 2, 2, 0.0, 7, 21), plane);
    }

    #[test]
    fn clahe_stretches_low_contrast_image() {
        let img = gray(32, 32, |x, _| 100 + (x / 3) as u8);
        let out = clahe(&img, 2.0, (2, 2));
        let (min_in, max_in) = (100u8, 110u8);
        let min_out = *out.pixels().iter().min().unwrap();
        let max_out = *out.pixels().iter().max().unwrap();
        assert!(max_out - min_out > max_in - min_in);
    }

    #[test]
    fn clahe_preserves_ordering_within_a_tile() {
        let img = gray(16, 16, |x, y| (x * 16 + y) as u8);
        let out = clahe(&img, 40.0, (1, 1));
        // With a single tile the mapping is one monotonic LUT.
        assert!(out.get(15, 15) >= out.get(0, 0));
        assert!(out.get(8, 0) >= out.get(7, 15));
    }

    #[test]
    fn clip_histogram_conserves_mass() {
        let mut hist = [0usize; 256];
        hist[10] = 1000;
        hist[20] = 24;
        clip_histogram(&mut hist, 2.0, 1024);
        assert_eq!(hist.iter().sum::<usize>(), 1024);
        assert!(hist[10] < 1000);
    }

    #[test]
    fn gaussian_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel_5();
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[4]).abs() < 1e-7);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn blur_keeps_flat_images_flat() {
        let img = GrayImage::filled(9, 7, 77);
        assert_eq!(gaussian_blur_5x5(&img), img);
    }

    #[test]
    fn canny_finds_vertical_step() {
        let img = gray(20, 10, |x, _| if x < 10 { 0 } else { 255 });
        let edges = canny(&gaussian_blur_5x5(&img), 50.0, 150.0);
        for y in 0..10 {
            let row: Vec<u32> = (0..20).filter(|&x| edges.get(x, y) == 255).collect();
            assert!(!row.is_empty(), "row {y} has an edge");
            assert!(row.iter().all(|&x| (8..=11).contains(&x)), "row {y}: {row:?}");
        }
    }

    #[test]
    fn canny_ignores_flat_regions() {
        let img = GrayImage::filled(12, 12, 128);
        let edges = canny(&img, 50.0, 150.0);
        assert!(edges.pixels().iter().all(|&v| v == 0));
    }

    #[test]
    fn closing_bridges_single_pixel_gap() {
        let img = gray(9, 5, |x, y| if y == 2 && x != 4 { 255 } else { 0 });
        let closed = erode_3x3(&dilate_3x3(&img));
        assert_eq!(closed.get(4, 2), 255);
        assert_eq!(closed.get(4, 0), 0);
    }

    #[test]
    fn blend_weights_inputs() {
        let a = GrayImage::filled(2, 2, 100);
        let b = GrayImage::filled(2, 2, 255);
        assert!(blend(&a, &b, 0.8).pixels().iter().all(|&v| v == 131));
    }

    #[test]
    fn uniform_frame_yields_uniform_output() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        let img = GrayImage::filled(16, 16, 90);
        let out = pre.run(&frame_from_gray(&img)).unwrap();
        let first = out.pixels()[0];
        assert!(out.pixels().iter().all(|&v| v == first));
    }

    #[test]
    fn wide_frames_are_block_averaged_to_working_width() {
        let pre = Preprocessor::new(PreprocessConfig::default());
        assert_eq!(pre.scale_factor(640, 480), 4);
        assert_eq!(pre.scale_factor(160, 120), 1);
        assert_eq!(pre.scale_factor(100, 80), 1);
        // A single-row strip never collapses to zero rows.
        assert_eq!(pre.scale_factor(640, 1), 1);

        let out = pre.run(&CameraFrame::black(643, 480)).unwrap();
        assert_eq!((out.width(), out.height()), (160, 120));

        let full = Preprocessor::new(PreprocessConfig {
            working_width: 0,
            ..Default::default()
        });
        assert_eq!(full.scale_factor(640, 480), 1);
    }

    #[test]
    fn downscale_averages_blocks() {
        let frame = CameraFrame {
            width: 4,
            height: 2,
            data: [0u8, 0, 0, 10, 10, 10, 200, 0, 0, 200, 0, 0]
                .iter()
                .chain(&[20u8, 20, 20, 30, 30, 30, 100, 0, 0, 100, 0, 0])
                .copied()
                .collect(),
        };
        let small = downscale(&frame, 2);
        assert_eq!((small.width, small.height), (2, 1));
        assert_eq!(small.data, vec![15, 15, 15, 150, 0, 0]);
    }

    #[test]
    fn stages_are_consistent_with_run() {
        let pre = Preprocessor::new(PreprocessConfig {
            search_window: 5,
            template_window: 3,
            ..Default::default()
        });
        let img = gray(20, 16, |x, y| if (6..14).contains(&x) && (4..12).contains(&y) { 240 } else { 20 });
        let frame = frame_from_gray(&img);
        let stages = pre.run_with_stages(&frame).unwrap();
        assert_eq!(stages.output, pre.run(&frame).unwrap());
        assert!(stages.edges.pixels().contains(&255), "square outline detected");
        assert_eq!(stages.denoised.data.len(), frame.data.len());
        assert_eq!(stages.named_gray_stages().len(), 6);
        // The bright square stays the brightest region.
        assert!(stages.output.get(10, 8) > stages.output.get(1, 1));
    }
}
