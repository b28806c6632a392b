//! # Imaging
//!
//! Fraunhofer propagation of the corrected wavefront to the focal plane, with or
//! without a [Coronagraph], and the [PhaseFilter]s applied to the corrected phase.

use nalgebra::DMatrix;
use rustfft::num_complex::Complex64;

use crate::{
    fft::{fftshift, frequency_index, Fft2},
    Pupil, Wavefront,
};

/// Pupil to focal plane propagation
pub trait Coronagraph {
    /// Focal plane image size in pixels
    fn image_size(&self) -> usize;
    /// Size in pixels of the wavefronts it propagates
    fn pupil_size(&self) -> usize;
    /// Coronagraphic image
    fn propagate(&mut self, wf: &Wavefront) -> DMatrix<f64>;
    /// Non-coronagraphic image
    fn propagate_nc(&mut self, wf: &Wavefront) -> DMatrix<f64>;
}

/// Perfect coronagraph
///
/// The projection of the pupil field onto the pupil mask, `(ΣE·P/ΣP²)·P`, is removed
/// before the propagation.
pub struct IdealCoronagraph {
    mask: DMatrix<f64>,
    fft: Fft2,
    image_size: usize,
}
impl IdealCoronagraph {
    /// Creates a coronagraph propagating the wavefront zero-padded to `padded_size`
    /// pixels and returning the central `image_size` pixels of the focal plane
    pub fn new(pupil: &Pupil, padded_size: usize, image_size: usize) -> Self {
        Self {
            mask: pupil.mask().clone(),
            fft: Fft2::new(padded_size.max(pupil.size())),
            image_size: image_size.min(padded_size.max(pupil.size())),
        }
    }
    /// Intensity of the focal plane field, normalized for flux conservation
    fn focal_plane(&mut self, mut field: Vec<Complex64>) -> DMatrix<f64> {
        let n = self.fft.size();
        self.fft.forward(&mut field);
        let norm = 1f64 / (n * n) as f64;
        let intensity: Vec<f64> = field.iter().map(|c| c.norm_sqr() * norm).collect();
        let shifted = fftshift(&intensity, n);
        let m = self.image_size;
        let o = n / 2 - m / 2;
        DMatrix::from_fn(m, m, |i, j| shifted[(i + o) + (j + o) * n])
    }
}
impl Coronagraph for IdealCoronagraph {
    fn image_size(&self) -> usize {
        self.image_size
    }
    fn pupil_size(&self) -> usize {
        self.mask.nrows()
    }
    fn propagate(&mut self, wf: &Wavefront) -> DMatrix<f64> {
        let n = self.fft.size();
        let s = wf.size();
        let mut field = wf.complex_field(n);
        let (mut proj, mut norm) = (Complex64::default(), 0f64);
        for j in 0..s {
            for i in 0..s {
                let p = self.mask[(i, j)];
                proj += field[i + j * n] * p;
                norm += p * p;
            }
        }
        if norm > 0f64 {
            proj /= norm;
            for j in 0..s {
                for i in 0..s {
                    field[i + j * n] -= proj * self.mask[(i, j)];
                }
            }
        }
        self.focal_plane(field)
    }
    fn propagate_nc(&mut self, wf: &Wavefront) -> DMatrix<f64> {
        let field = wf.complex_field(self.fft.size());
        self.focal_plane(field)
    }
}

/// Spatial filter of the corrected phase
pub trait PhaseFilter {
    /// Size in pixels of the filtered phase maps
    fn size(&self) -> usize;
    fn filter(&mut self, phase: &mut DMatrix<f64>);
}

/// Low-pass Fourier filter
///
/// Keeps the spatial frequencies within `cutoff` cycles across the phase map.
pub struct FourierFilter {
    fft: Fft2,
    cutoff: f64,
}
impl FourierFilter {
    pub fn low_pass(size: usize, cutoff: f64) -> Self {
        Self {
            fft: Fft2::new(size),
            cutoff,
        }
    }
}
impl PhaseFilter for FourierFilter {
    fn size(&self) -> usize {
        self.fft.size()
    }
    fn filter(&mut self, phase: &mut DMatrix<f64>) {
        let n = self.fft.size();
        let mut field: Vec<_> = phase
            .iter()
            .map(|p| Complex64::new(*p, 0f64))
            .collect();
        self.fft.forward(&mut field);
        for j in 0..n {
            let fj = frequency_index(j, n);
            for i in 0..n {
                if frequency_index(i, n).hypot(fj) > self.cutoff {
                    field[i + j * n] = Complex64::default();
                }
            }
        }
        self.fft.inverse(&mut field);
        let norm = 1f64 / (n * n) as f64;
        phase
            .iter_mut()
            .zip(field)
            .for_each(|(p, c)| *p = c.re * norm);
    }
}
