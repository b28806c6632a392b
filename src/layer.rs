use nalgebra::{DMatrix, DMatrixSlice};
use rand::Rng;

use crate::{try_zeros, Error, Result};

/// Cubic convolution kernel parameter
const CUBIC_A: f64 = -0.5;

/// Keys cubic convolution kernel
fn cubic_convolution(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1f64 {
        (CUBIC_A + 2f64) * x.powi(3) - (CUBIC_A + 3f64) * x.powi(2) + 1f64
    } else if x < 2f64 {
        CUBIC_A * (x.powi(3) - 5f64 * x.powi(2) + 8f64 * x - 4f64)
    } else {
        0f64
    }
}

/// Offset of the first kernel tap and the 4 kernel weights for a fractional shift `f`
fn cubic_weights(f: f64) -> (isize, [f64; 4]) {
    let x0 = (-f).floor();
    let t = -f - x0;
    let mut w = [0f64; 4];
    w.iter_mut()
        .enumerate()
        .for_each(|(k, w)| *w = cubic_convolution(t - (k as f64 - 1f64)));
    (x0 as isize - 1, w)
}

/// Smallest border reaching the 4 taps of the cubic kernel
pub const MIN_BORDER: usize = 2;

/// Physical properties of a turbulent layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerProperties {
    /// Screen size in pixels
    pub screen_size: usize,
    /// Fried parameter [m]
    pub r0: f64,
    /// Outer scale [m]
    pub outer_scale: f64,
    /// Inner scale [m]
    pub inner_scale: f64,
    /// Cn² weight
    pub cn2: f64,
    /// Fresnel propagation distance [m]
    pub altitude: f64,
    /// Wind speed [m/s]
    pub wind_speed: f64,
    /// Wind direction [rd]
    pub wind_direction: f64,
}

/// Frozen-flow turbulent layer
///
/// The static screen is translated by a whole-pixel circular shift into a bordered
/// buffer, followed by a cubic convolution sub-pixel shift.
/// The whole-pixel shift is skipped when its value is unchanged since the previous call.
#[derive(Debug, Clone)]
pub struct Layer {
    properties: LayerProperties,
    wf_size: usize,
    border: usize,
    rate: (f64, f64),
    last_shift: Option<(i64, i64)>,
    pub(crate) screen: DMatrix<f64>,
    whole_pixel: DMatrix<f64>,
    shifted: DMatrix<f64>,
    n_whole_pixel: usize,
}
impl Layer {
    /// Creates a layer for a `wf_size` pixels wavefront sampling a pupil of diameter `pupil_diameter`
    ///
    /// The translated screen is `wf_size + 2 border` pixels wide, with `border` at least [MIN_BORDER].
    pub fn new(
        properties: LayerProperties,
        wf_size: usize,
        border: usize,
        pupil_diameter: f64,
    ) -> Result<Self> {
        if border < MIN_BORDER {
            return Err(Error::Config(format!(
                "layer border of {border} pixels, expected at least {MIN_BORDER}"
            )));
        }
        let pixel_scale = pupil_diameter / wf_size as f64;
        let rate = (
            properties.wind_speed * properties.wind_direction.cos() / pixel_scale,
            properties.wind_speed * properties.wind_direction.sin() / pixel_scale,
        );
        let n = properties.screen_size;
        let m = wf_size + 2 * border;
        Ok(Self {
            screen: try_zeros(n, n)?,
            whole_pixel: try_zeros(m, m)?,
            shifted: try_zeros(m, m)?,
            properties,
            wf_size,
            border,
            rate,
            last_shift: None,
            n_whole_pixel: 0,
        })
    }
    pub fn properties(&self) -> &LayerProperties {
        &self.properties
    }
    pub fn cn2(&self) -> f64 {
        self.properties.cn2
    }
    pub fn screen_size(&self) -> usize {
        self.properties.screen_size
    }
    /// Translation rate in pixel/s along the rows and the columns
    pub fn rate(&self) -> (f64, f64) {
        self.rate
    }
    /// Static screen
    pub fn screen(&self) -> &DMatrix<f64> {
        &self.screen
    }
    /// Replaces the static screen
    pub fn set_screen(&mut self, screen: DMatrix<f64>) {
        self.screen = screen;
        self.last_shift = None;
    }
    /// Translated screen including the border
    pub fn shifted(&self) -> &DMatrix<f64> {
        &self.shifted
    }
    /// Translated screen without the border
    pub fn crop(&self) -> DMatrixSlice<f64> {
        self.shifted
            .slice((self.border, self.border), (self.wf_size, self.wf_size))
    }
    /// Number of whole-pixel extractions since the layer creation
    pub fn whole_pixel_extractions(&self) -> usize {
        self.n_whole_pixel
    }
    /// Translates the screen to time `dt`
    pub fn shift(&mut self, dt: f64) {
        let n = self.screen_size() as i64;
        let (ddx, ddy) = (self.rate.0 * dt, self.rate.1 * dt);
        let (wdx, wdy) = (ddx.trunc(), ddy.trunc());
        let whole = (wdx as i64 % n, wdy as i64 % n);
        if self.last_shift != Some(whole) {
            self.extract_whole_pixel(whole);
            self.last_shift = Some(whole);
        }
        self.sub_pixel(ddx - wdx, ddy - wdy);
    }
    /// Translates the screen by a uniformly distributed random amount
    ///
    /// The sub-pixel part is skipped if `no_fract` is true.
    pub fn shift_random<R: Rng>(&mut self, rng: &mut R, no_fract: bool) {
        let n = self.screen_size() as f64;
        let (ddx, ddy) = (rng.gen::<f64>() * n, rng.gen::<f64>() * n);
        let (wdx, wdy) = (ddx.trunc(), ddy.trunc());
        let whole = (wdx as i64, wdy as i64);
        self.extract_whole_pixel(whole);
        self.last_shift = Some(whole);
        if no_fract {
            self.sub_pixel(0f64, 0f64);
        } else {
            self.sub_pixel(ddx - wdx, ddy - wdy);
        }
    }
    fn extract_whole_pixel(&mut self, (wdx, wdy): (i64, i64)) {
        let n = self.screen_size() as i64;
        let m = self.whole_pixel.nrows();
        let screen = &self.screen;
        for c in 0..m {
            let sc = (c as i64 - wdy).rem_euclid(n) as usize;
            for r in 0..m {
                let sr = (r as i64 - wdx).rem_euclid(n) as usize;
                self.whole_pixel[(r, c)] = screen[(sr, sc)];
            }
        }
        self.n_whole_pixel += 1;
    }
    fn sub_pixel(&mut self, ddx: f64, ddy: f64) {
        if ddx == 0f64 && ddy == 0f64 {
            self.shifted.copy_from(&self.whole_pixel);
            return;
        }
        let m = self.whole_pixel.nrows() as isize;
        let (ox, wx) = cubic_weights(ddx);
        let (oy, wy) = cubic_weights(ddy);
        let clamp = |k: isize| k.clamp(0, m - 1) as usize;
        let src = &self.whole_pixel;
        for c in 0..m {
            for r in 0..m {
                let mut v = 0f64;
                for (q, wy) in wy.iter().enumerate() {
                    let sc = clamp(c + oy + q as isize);
                    for (p, wx) in wx.iter().enumerate() {
                        v += wx * wy * src[(clamp(r + ox + p as isize), sc)];
                    }
                }
                self.shifted[(r as usize, c as usize)] = v;
            }
        }
    }
}
