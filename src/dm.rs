//! # Deformable mirrors

use std::f64::consts::PI;

use nalgebra::DMatrix;

use crate::{io::Image, Error, ModalCommand, Pupil, Result, Wavefront};

pub trait DeformableMirror {
    /// Number of mirror modes
    fn n_modes(&self) -> usize;
    /// Subtracts the mirror shape from the wavefront phase at wavelength `lambda`
    fn apply_shape(&self, wf: &mut Wavefront, lambda: f64);
    /// Sets the mirror shape from the modal command
    fn set_shape(&mut self, command: &ModalCommand);
    /// Adds mode #`mode` with amplitude `amplitude` [m] to the wavefront phase at wavelength `lambda`
    fn apply_mode(&self, wf: &mut Wavefront, mode: usize, amplitude: f64, lambda: f64)
        -> Result<()>;
}

/// `y += a x`
fn add_scaled(y: &mut DMatrix<f64>, a: f64, x: &DMatrix<f64>) {
    y.iter_mut().zip(x.iter()).for_each(|(y, x)| *y += a * x);
}

/// Mirror defined by a set of modal influence functions
///
/// The modes are masked by the pupil and normalized to a unit RMS over the pupil.
/// The mirror shape is an optical path difference in meters.
#[derive(Debug, Clone)]
pub struct ModalDm {
    modes: Vec<DMatrix<f64>>,
    shape: DMatrix<f64>,
}
impl ModalDm {
    pub fn new(pupil: &Pupil, modes: Vec<DMatrix<f64>>) -> Result<Self> {
        let n = pupil.size();
        let modes = modes
            .into_iter()
            .enumerate()
            .map(|(i, mode)| {
                if mode.shape() != (n, n) {
                    return Err(Error::Shape {
                        what: "mirror mode",
                        expected: (n, n),
                        found: mode.shape(),
                    });
                }
                let mut mode = mode.component_mul(pupil.mask());
                let rms = pupil.rms(&mode);
                if rms == 0f64 {
                    return Err(Error::Config(format!("mirror mode #{i} is null over the pupil")));
                }
                mode /= rms;
                Ok(mode)
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!("modal DM: {} modes", modes.len());
        Ok(Self {
            modes,
            shape: DMatrix::zeros(n, n),
        })
    }
    /// Fourier modes up to `max_frequency` cycles across the pupil
    ///
    /// Cosine and sine modes of each spatial frequency `(p,q)` in the half plane `p>0 || (p=0 && q>0)`,
    /// orthogonal over a fully illuminated square pupil.
    pub fn fourier(pupil: &Pupil, max_frequency: usize) -> Result<Self> {
        let n = pupil.size();
        let m = max_frequency as i64;
        let mut modes = vec![];
        for p in 0..=m {
            for q in -m..=m {
                if p == 0 && q <= 0 {
                    continue;
                }
                let arg = |i: usize, j: usize| {
                    2f64 * PI * (p as f64 * i as f64 + q as f64 * j as f64) / n as f64
                };
                modes.push(DMatrix::from_fn(n, n, |i, j| arg(i, j).cos()));
                modes.push(DMatrix::from_fn(n, n, |i, j| arg(i, j).sin()));
            }
        }
        Self::new(pupil, modes)
    }
    /// Loads the modes from an image cube
    pub fn from_image(pupil: &Pupil, image: Image) -> Result<Self> {
        Self::new(pupil, image.into_planes()?)
    }
    pub fn modes(&self) -> &[DMatrix<f64>] {
        &self.modes
    }
    /// Mirror shape [m]
    pub fn shape(&self) -> &DMatrix<f64> {
        &self.shape
    }
}
impl DeformableMirror for ModalDm {
    fn n_modes(&self) -> usize {
        self.modes.len()
    }
    fn apply_shape(&self, wf: &mut Wavefront, lambda: f64) {
        add_scaled(&mut wf.phase, -2f64 * PI / lambda, &self.shape);
    }
    fn set_shape(&mut self, command: &ModalCommand) {
        self.shape.fill(0f64);
        for (a, mode) in command.amplitudes.iter().zip(&self.modes) {
            add_scaled(&mut self.shape, *a, mode);
        }
    }
    fn apply_mode(
        &self,
        wf: &mut Wavefront,
        mode: usize,
        amplitude: f64,
        lambda: f64,
    ) -> Result<()> {
        let m = self
            .modes
            .get(mode)
            .ok_or(Error::ModeIndex(mode, self.modes.len()))?;
        add_scaled(&mut wf.phase, 2f64 * PI / lambda * amplitude, m);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square_pupil() -> Pupil {
        Pupil::new(DMatrix::from_element(16, 16, 1f64), 1.6).unwrap()
    }

    #[test]
    fn unit_rms_modes() {
        let pupil = Pupil::circular(16, 1.6, 0f64).unwrap();
        let dm = ModalDm::fourier(&pupil, 2).unwrap();
        assert_eq!(dm.n_modes(), 2 * (2 + 2 * 5));
        dm.modes()
            .iter()
            .for_each(|m| assert_abs_diff_eq!(pupil.rms(m), 1f64, epsilon = 1e-12));
    }

    #[test]
    fn orthogonal_fourier_modes() {
        let pupil = square_pupil();
        let dm = ModalDm::fourier(&pupil, 2).unwrap();
        let modes = dm.modes();
        for i in 0..modes.len() {
            for j in 0..modes.len() {
                let dot = modes[i].dot(&modes[j]) / pupil.n_pix();
                let expected = if i == j { 1f64 } else { 0f64 };
                assert_abs_diff_eq!(dot, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn shape_cancels_mode() {
        let pupil = square_pupil();
        let mut dm = ModalDm::fourier(&pupil, 1).unwrap();
        let lambda = 1e-6;
        let mut wf = Wavefront::new(16);
        dm.apply_mode(&mut wf, 2, 1e-8, lambda).unwrap();
        let mut command = ModalCommand::zeros(dm.n_modes());
        command.amplitudes[2] = 1e-8;
        dm.set_shape(&command);
        dm.apply_shape(&mut wf, lambda);
        assert!(wf.phase.iter().all(|x| x.abs() < 1e-15));
    }

    #[test]
    fn wrong_mode() {
        let pupil = square_pupil();
        let dm = ModalDm::fourier(&pupil, 1).unwrap();
        let mut wf = Wavefront::new(16);
        assert!(matches!(
            dm.apply_mode(&mut wf, dm.n_modes(), 1f64, 1e-6),
            Err(Error::ModeIndex(..))
        ));
        assert!(matches!(
            ModalDm::new(&pupil, vec![DMatrix::zeros(16, 16)]),
            Err(Error::Config(_))
        ));
    }
}
