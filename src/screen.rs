//! # Von Kármán phase screens
//!
//! A screen is white Gaussian noise filtered in the Fourier domain by the square root of
//! the von Kármán phase power spectral density
//! `P(f) = β / (f² + 1/L0²)^(11/6)`, with `β = 0.0218 r0^(-5/3) (λ0/λ)²`.
//! The spectrum is optionally attenuated by the inner scale and notched around the
//! piston and tip-tilt frequencies of a pupil of diameter `D`.

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use rustfft::num_complex::Complex64;
use std::f64::consts::PI;

use crate::{
    fft::{frequency_index, Fft2},
    Error, Result,
};

/// Exponent of the von Kármán spectrum
const ALPHA_HALF: f64 = 11f64 / 6f64;
/// Amplitude of the phase spectrum for r0=1m
const BETA_R0: f64 = 0.0218;

/// `J1(x)/x`
pub fn jinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        0.5
    } else {
        libm::j1(x) / x
    }
}
/// `J2(x)/x`
pub fn jinc2(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        0.
    } else {
        libm::jn(2, x) / x
    }
}

/// Low-order modes removed from the spectrum
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LowOrderNotch {
    pub piston: bool,
    pub tip_tilt: bool,
}

/// Phase screen generator
#[derive(Debug, Clone)]
pub struct ScreenSynthesizer {
    size: usize,
    pixel_scale: f64,
    r0: f64,
    outer_scale: f64,
    inner_scale: f64,
    wavelength_ratio: f64,
    pupil_diameter: f64,
    notch: LowOrderNotch,
}
impl ScreenSynthesizer {
    /// Creates a `size x size` screen generator with pixels of `pixel_scale` meters
    ///
    /// The outer scale is infinite, the inner scale is 0 and the screen is computed at
    /// the wavelength r0 is given at.
    pub fn new(size: usize, pixel_scale: f64, r0: f64) -> Self {
        Self {
            size,
            pixel_scale,
            r0,
            outer_scale: 0f64,
            inner_scale: 0f64,
            wavelength_ratio: 1f64,
            pupil_diameter: 0f64,
            notch: LowOrderNotch::default(),
        }
    }
    /// Sets the outer scale L0, L0≤0 for an infinite outer scale
    pub fn outer_scale(self, outer_scale: f64) -> Self {
        Self {
            outer_scale,
            ..self
        }
    }
    /// Sets the inner scale l0, l0≤0 for no inner scale
    pub fn inner_scale(self, inner_scale: f64) -> Self {
        Self {
            inner_scale,
            ..self
        }
    }
    /// Scales the spectrum from the r0 wavelength `lambda0` to the wavelength `lambda`
    pub fn wavelengths(self, lambda0: f64, lambda: f64) -> Self {
        Self {
            wavelength_ratio: lambda0 / lambda,
            ..self
        }
    }
    /// Notches piston and/or tip-tilt of a pupil of diameter `pupil_diameter`
    pub fn notch(self, pupil_diameter: f64, notch: LowOrderNotch) -> Self {
        Self {
            pupil_diameter,
            notch,
            ..self
        }
    }
    pub fn size(&self) -> usize {
        self.size
    }
    /// Spatial frequency sampling `1/(N dx)`
    pub fn frequency_step(&self) -> f64 {
        1f64 / (self.size as f64 * self.pixel_scale)
    }
    /// Phase power spectral density in rad²m² at spatial frequency `f`
    pub fn psd(&self, f: f64) -> f64 {
        let l02 = if self.outer_scale > 0f64 {
            self.outer_scale.powi(-2)
        } else {
            0f64
        };
        if f == 0f64 && l02 == 0f64 {
            return 0f64;
        }
        let beta = BETA_R0 / self.r0.powf(5f64 / 3f64) * self.wavelength_ratio.powi(2);
        let mut p = beta / (f * f + l02).powf(ALPHA_HALF);
        if self.inner_scale > 0f64 {
            p *= (-(f * self.inner_scale).powi(2)).exp();
        }
        let x = PI * f * self.pupil_diameter;
        let piston = if self.notch.piston {
            (2f64 * jinc(x)).powi(2)
        } else {
            0f64
        };
        let tip_tilt = if self.notch.tip_tilt {
            (4f64 * jinc2(x)).powi(2)
        } else {
            0f64
        };
        p * (1f64 - piston - tip_tilt)
    }
    /// Generates a screen in radians from the random generator `rng`
    pub fn generate<R: Rng>(&self, rng: &mut R) -> Result<DMatrix<f64>> {
        let n = self.size;
        let n2 = n * n;
        let mut field: Vec<Complex64> = Vec::new();
        field
            .try_reserve_exact(n2)
            .map_err(|e| Error::Allocation(n2, e))?;
        field.extend((0..n2).map(|_| Complex64::new(rng.sample(StandardNormal), 0f64)));

        let mut fft = Fft2::new(n);
        fft.forward(&mut field);
        let df = self.frequency_step();
        for j in 0..n {
            let fj = frequency_index(j, n) * df;
            for i in 0..n {
                let fi = frequency_index(i, n) * df;
                field[i + j * n] *= self.psd(fi.hypot(fj)).sqrt() * df;
            }
        }
        fft.inverse(&mut field);

        let norm = 1f64 / n as f64;
        Ok(DMatrix::from_iterator(
            n,
            n,
            field.into_iter().map(|c| c.re * norm),
        ))
    }
}

/// Random generator of layer #`layer` for a run seeded with `seed`
///
/// Each layer draws from its own ChaCha stream so that screens do not depend on the
/// order, or the thread, they are generated in.
pub fn layer_rng(seed: u64, layer: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(layer as u64);
    rng
}
