use nalgebra::DMatrix;
use rustfft::num_complex::Complex64;

use crate::{io::Image, Error, Result};

/// Atmosphere and optics state at one iteration
///
/// The phase is in radians and the amplitude in photometric units (sqrt of photons per pixel)
#[derive(Debug, Clone, PartialEq)]
pub struct Wavefront {
    pub phase: DMatrix<f64>,
    pub amplitude: DMatrix<f64>,
    pub iteration: usize,
}
impl Wavefront {
    /// Creates a flat `n x n` wavefront with zero amplitude
    pub fn new(n: usize) -> Self {
        Self {
            phase: DMatrix::zeros(n, n),
            amplitude: DMatrix::zeros(n, n),
            iteration: 0,
        }
    }
    /// Wavefront size in pixels
    pub fn size(&self) -> usize {
        self.phase.nrows()
    }
    pub fn set_phase(&mut self, phase: DMatrix<f64>) {
        self.phase = phase;
    }
    pub fn set_amplitude(&mut self, amplitude: DMatrix<f64>) {
        self.amplitude = amplitude;
    }
    /// Returns the complex field `A·exp(iφ)` zero-padded to `size x size`, column-major
    pub fn complex_field(&self, size: usize) -> Vec<Complex64> {
        let n = self.size().min(size);
        let mut field = vec![Complex64::new(0f64, 0f64); size * size];
        for j in 0..n {
            for i in 0..n {
                field[i + j * size] =
                    Complex64::from_polar(self.amplitude[(i, j)], self.phase[(i, j)]);
            }
        }
        field
    }
}

/// Sensor detector frame, stamped with the iteration it derives from
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorImage {
    pub image: DMatrix<f64>,
    pub iteration: usize,
}
impl DetectorImage {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            image: DMatrix::zeros(rows, cols),
            iteration: 0,
        }
    }
}

/// Modal amplitude vector and the iteration it derives from
///
/// Used both for just-measured records and for the delayed commands sent to the mirror
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModalCommand {
    pub amplitudes: Vec<f64>,
    pub iteration: usize,
}
impl ModalCommand {
    pub fn zeros(n_mode: usize) -> Self {
        Self {
            amplitudes: vec![0f64; n_mode],
            iteration: 0,
        }
    }
    pub fn len(&self) -> usize {
        self.amplitudes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.amplitudes.is_empty()
    }
}

/// System pupil
///
/// A mask, its physical diameter and the column-major offsets of the illuminated pixels
#[derive(Debug, Clone)]
pub struct Pupil {
    mask: DMatrix<f64>,
    diameter: f64,
    n_pix: f64,
    idx: Vec<usize>,
}
impl Pupil {
    /// Creates a pupil from a mask and its diameter in meters
    pub fn new(mask: DMatrix<f64>, diameter: f64) -> Result<Self> {
        let n_pix = mask.sum();
        if n_pix <= 0f64 {
            return Err(Error::EmptyPupil);
        }
        let idx = mask
            .as_slice()
            .iter()
            .enumerate()
            .filter_map(|(k, m)| if *m != 0f64 { Some(k) } else { None })
            .collect();
        Ok(Self {
            mask,
            diameter,
            n_pix,
            idx,
        })
    }
    /// Creates a circular `n x n` pupil with a central obscuration given as a fraction of the diameter
    pub fn circular(n: usize, diameter: f64, obscuration: f64) -> Result<Self> {
        let c = 0.5 * (n as f64 - 1f64);
        let r = 0.5 * n as f64;
        let mask = DMatrix::from_fn(n, n, |i, j| {
            let rho = ((i as f64 - c).powi(2) + (j as f64 - c).powi(2)).sqrt() / r;
            if rho <= 1f64 && rho >= obscuration {
                1f64
            } else {
                0f64
            }
        });
        Self::new(mask, diameter)
    }
    /// Loads a pupil mask with its `PUPILD` header
    pub fn from_image(image: &Image) -> Result<Self> {
        let diameter = image.header_value("PUPILD")?;
        Self::new(image.plane(0)?, diameter)
    }
    pub fn mask(&self) -> &DMatrix<f64> {
        &self.mask
    }
    pub fn size(&self) -> usize {
        self.mask.nrows()
    }
    pub fn diameter(&self) -> f64 {
        self.diameter
    }
    /// Pixel scale in meters
    pub fn pixel_scale(&self) -> f64 {
        self.diameter / self.size() as f64
    }
    /// Sum of the mask
    pub fn n_pix(&self) -> f64 {
        self.n_pix
    }
    /// Column-major offsets of the illuminated pixels
    pub fn idx(&self) -> &[usize] {
        &self.idx
    }
    /// Mean of `phase` under the mask
    pub fn mean(&self, phase: &DMatrix<f64>) -> f64 {
        phase.component_mul(&self.mask).sum() / self.n_pix
    }
    /// Subtracts the mean under the mask and applies the mask
    pub fn remove_mean(&self, phase: &mut DMatrix<f64>) {
        let mean = self.mean(phase);
        phase
            .iter_mut()
            .zip(self.mask.iter())
            .for_each(|(p, m)| *p = (*p - mean) * m);
    }
    /// RMS of a masked phase, normalized by the illuminated area
    pub fn rms(&self, phase: &DMatrix<f64>) -> f64 {
        (phase.iter().map(|p| p * p).sum::<f64>() / self.n_pix).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_pupil() {
        assert!(matches!(
            Pupil::new(DMatrix::zeros(8, 8), 1f64),
            Err(Error::EmptyPupil)
        ));
    }

    #[test]
    fn pupil_offsets_are_column_major() {
        let mut mask = DMatrix::zeros(4, 4);
        mask[(1, 2)] = 1f64;
        mask[(3, 0)] = 1f64;
        let pupil = Pupil::new(mask, 1f64).unwrap();
        assert_eq!(pupil.idx(), &[3, 9]);
        assert_eq!(pupil.n_pix(), 2f64);
    }

    #[test]
    fn mean_removal() {
        let pupil = Pupil::circular(32, 8f64, 0.1).unwrap();
        let mut phase = DMatrix::from_fn(32, 32, |i, j| 1.5 + (i * j) as f64 * 1e-2);
        pupil.remove_mean(&mut phase);
        assert_abs_diff_eq!(pupil.mean(&phase), 0f64, epsilon = 1e-12);
        assert_eq!(phase[(0, 0)], 0f64);
    }

    #[test]
    fn complex_field_padding() {
        let mut wf = Wavefront::new(4);
        wf.amplitude.fill(2f64);
        let field = wf.complex_field(8);
        assert_eq!(field.len(), 64);
        assert_abs_diff_eq!(field[0].re, 2f64);
        assert_abs_diff_eq!(field[7].norm(), 0f64);
    }
}
