//! # Modal reconstruction
//!
//! A [Reconstructor] maps a wavefront sensor frame to modal amplitudes and records the
//! response matrix during calibration.
//! The [DirectPhaseReconstructor] projects a phase-like sensor frame onto the mirror modes.

use std::path::Path;

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::{
    io::{Image, ImageStore},
    try_zeros, DetectorImage, Error, ModalCommand, Pupil, Result,
};

/// Default calibration amplitude [m]
pub const CAL_AMP: f64 = 0.5 * 800e-9 / (2f64 * std::f64::consts::PI);

/// Sensor frame to modal amplitudes mapping
pub trait Reconstructor {
    /// Number of reconstructed modes
    fn n_modes(&self) -> usize;
    /// Number of samples in a measurement
    fn measurement_size(&self) -> usize;
    /// Rows and columns of the sensor frames the measurements are extracted from
    fn frame_shape(&self) -> (usize, usize);
    /// Calibration amplitude
    fn cal_amp(&self) -> f64;
    fn set_cal_amp(&mut self, cal_amp: f64);
    /// Extracts the measurement from a sensor frame
    fn calc_measurement(&self, frame: &DetectorImage) -> Vec<f64>;
    /// Writes the modal amplitudes of `frame` into `command`, with the frame iteration
    fn reconstruct(&self, command: &mut ModalCommand, frame: &DetectorImage);
    /// Resets the response matrix for `n_modes` modes and `det_rows x det_cols` sensor frames
    fn initialize_rmat(
        &mut self,
        n_modes: usize,
        cal_amp: f64,
        det_rows: usize,
        det_cols: usize,
    ) -> Result<()>;
    /// Sets column #`i` of the response matrix, and the sensor frame #`i` if any
    fn accumulate_rmat(
        &mut self,
        i: usize,
        measurement: &[f64],
        frame: Option<&DetectorImage>,
    ) -> Result<()>;
    /// Writes the response matrix
    fn save_rmat(&self, store: &dyn ImageStore, path: &Path) -> Result<()>;
    /// Writes the sensor frames recorded with the response matrix
    fn save_rimages(&self, store: &dyn ImageStore, path: &Path) -> Result<()>;
}

/// Direct projection of the sensor frame onto the mirror modes
///
/// `recon[(k,j)] = mode_j[idx_k] / n_pix`, where `idx` are the column-major offsets of
/// the pupil illuminated pixels.
/// With modes of unit RMS over the pupil, a frame equal to `a·mode_j` is reconstructed
/// as `a` for mode `j`.
#[derive(Debug, Clone)]
pub struct DirectPhaseReconstructor {
    idx: Vec<usize>,
    recon: DMatrix<f64>,
    det_rows: usize,
    det_cols: usize,
    cal_amp: f64,
    n_rmat_modes: usize,
    rmat: DMatrix<f64>,
    rimages: Vec<DMatrix<f64>>,
}
impl DirectPhaseReconstructor {
    /// Creates the reconstructor from the pupil and the mirror modes
    pub fn new(pupil: &Pupil, modes: &[DMatrix<f64>]) -> Result<Self> {
        let (det_rows, det_cols) = pupil.mask().shape();
        if let Some(mode) = modes.iter().find(|m| m.shape() != (det_rows, det_cols)) {
            return Err(Error::Shape {
                what: "mirror mode",
                expected: (det_rows, det_cols),
                found: mode.shape(),
            });
        }
        let idx = pupil.idx().to_vec();
        let n_pix = pupil.n_pix();
        let mut recon = try_zeros(idx.len(), modes.len())?;
        recon
            .as_mut_slice()
            .par_chunks_mut(idx.len())
            .zip(modes.par_iter())
            .for_each(|(column, mode)| {
                let mode = mode.as_slice();
                column
                    .iter_mut()
                    .zip(&idx)
                    .for_each(|(r, &k)| *r = mode[k] / n_pix);
            });
        log::info!(
            "direct phase reconstructor: {} modes, {} samples",
            modes.len(),
            idx.len()
        );
        Ok(Self {
            idx,
            recon,
            det_rows,
            det_cols,
            cal_amp: CAL_AMP,
            n_rmat_modes: 0,
            rmat: DMatrix::zeros(0, 0),
            rimages: Vec::new(),
        })
    }
    /// Replaces the reconstructor matrix with the one in `path`
    pub fn load_recon(&mut self, store: &dyn ImageStore, path: &Path) -> Result<()> {
        let recon = store.read(path)?.plane(0)?;
        if recon.nrows() != self.idx.len() {
            return Err(Error::Shape {
                what: "reconstructor matrix",
                expected: (self.idx.len(), recon.ncols()),
                found: recon.shape(),
            });
        }
        self.recon = recon;
        Ok(())
    }
    pub fn recon(&self) -> &DMatrix<f64> {
        &self.recon
    }
    pub fn rmat(&self) -> &DMatrix<f64> {
        &self.rmat
    }
    pub fn rimages(&self) -> &[DMatrix<f64>] {
        &self.rimages
    }
    pub fn det_rows(&self) -> usize {
        self.det_rows
    }
    pub fn det_cols(&self) -> usize {
        self.det_cols
    }
    fn with_header(&self, image: Image) -> Image {
        image
            .header("DETROWS", self.det_rows)
            .header("DETCOLS", self.det_cols)
            .header("CALAMP", self.cal_amp)
            .header("NMODES", self.n_rmat_modes)
    }
}
impl Reconstructor for DirectPhaseReconstructor {
    fn n_modes(&self) -> usize {
        self.recon.ncols()
    }
    fn measurement_size(&self) -> usize {
        self.idx.len()
    }
    fn frame_shape(&self) -> (usize, usize) {
        (self.det_rows, self.det_cols)
    }
    fn cal_amp(&self) -> f64 {
        self.cal_amp
    }
    fn set_cal_amp(&mut self, cal_amp: f64) {
        self.cal_amp = cal_amp;
    }
    fn calc_measurement(&self, frame: &DetectorImage) -> Vec<f64> {
        let image = frame.image.as_slice();
        self.idx.iter().map(|&k| image[k]).collect()
    }
    fn reconstruct(&self, command: &mut ModalCommand, frame: &DetectorImage) {
        let image = frame.image.as_slice();
        let idx = &self.idx;
        command.amplitudes = self
            .recon
            .as_slice()
            .par_chunks(idx.len())
            .map(|column| {
                column
                    .iter()
                    .zip(idx)
                    .map(|(r, &k)| image[k] * r)
                    .sum::<f64>()
            })
            .collect();
        command.iteration = frame.iteration;
    }
    fn initialize_rmat(
        &mut self,
        n_modes: usize,
        cal_amp: f64,
        det_rows: usize,
        det_cols: usize,
    ) -> Result<()> {
        self.rmat = try_zeros(self.measurement_size(), n_modes)?;
        self.rimages = (0..n_modes)
            .map(|_| try_zeros(det_rows, det_cols))
            .collect::<Result<Vec<_>>>()?;
        self.n_rmat_modes = n_modes;
        self.cal_amp = cal_amp;
        self.det_rows = det_rows;
        self.det_cols = det_cols;
        Ok(())
    }
    fn accumulate_rmat(
        &mut self,
        i: usize,
        measurement: &[f64],
        frame: Option<&DetectorImage>,
    ) -> Result<()> {
        if i >= self.rmat.ncols() {
            return Err(Error::ModeIndex(i, self.rmat.ncols()));
        }
        if measurement.len() != self.rmat.nrows() {
            return Err(Error::Shape {
                what: "measurement",
                expected: (self.rmat.nrows(), 1),
                found: (measurement.len(), 1),
            });
        }
        self.rmat.column_mut(i).copy_from_slice(measurement);
        if let Some(frame) = frame {
            if frame.image.shape() != (self.det_rows, self.det_cols) {
                return Err(Error::Shape {
                    what: "sensor frame",
                    expected: (self.det_rows, self.det_cols),
                    found: frame.image.shape(),
                });
            }
            self.rimages[i].copy_from(&frame.image);
        }
        Ok(())
    }
    fn save_rmat(&self, store: &dyn ImageStore, path: &Path) -> Result<()> {
        store.write(path, &self.with_header(Image::from_matrix(&self.rmat)))
    }
    fn save_rimages(&self, store: &dyn ImageStore, path: &Path) -> Result<()> {
        store.write(path, &self.with_header(Image::from_planes(&self.rimages)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dm::ModalDm, io::BincodeStore};
    use approx::assert_abs_diff_eq;

    fn setup() -> (Pupil, ModalDm) {
        let pupil = Pupil::new(DMatrix::from_element(16, 16, 1f64), 1.6).unwrap();
        let dm = ModalDm::fourier(&pupil, 3).unwrap();
        (pupil, dm)
    }

    #[test]
    fn recon_matrix() {
        let (pupil, dm) = setup();
        let rec = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        assert_eq!(rec.measurement_size(), 256);
        assert_eq!(rec.n_modes(), dm.modes().len());
        assert_abs_diff_eq!(
            rec.recon()[(5, 2)],
            dm.modes()[2][(5, 0)] / 256f64,
            epsilon = 1e-15
        );
    }

    #[test]
    fn orthogonal_modes() {
        let (pupil, dm) = setup();
        let rec = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let j = 4;
        let a = 3.5e-8;
        let frame = DetectorImage {
            image: dm.modes()[j].component_mul(pupil.mask()) * a,
            iteration: 17,
        };
        let mut command = ModalCommand::default();
        rec.reconstruct(&mut command, &frame);
        assert_eq!(command.iteration, 17);
        assert_eq!(command.len(), rec.n_modes());
        command.amplitudes.iter().enumerate().for_each(|(i, x)| {
            let expected = if i == j { a } else { 0f64 };
            assert_abs_diff_eq!(*x, expected, epsilon = 1e-18);
        });
    }

    #[test]
    fn wrong_mode_shape() {
        let (pupil, _) = setup();
        assert!(matches!(
            DirectPhaseReconstructor::new(&pupil, &[DMatrix::zeros(8, 8)]),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn response_matrix() {
        let (pupil, dm) = setup();
        let mut rec = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        assert_eq!(rec.cal_amp(), CAL_AMP);
        rec.initialize_rmat(3, 1e-8, 16, 16).unwrap();
        let frame = DetectorImage {
            image: dm.modes()[1].clone(),
            iteration: 0,
        };
        let measurement = rec.calc_measurement(&frame);
        rec.accumulate_rmat(1, &measurement, Some(&frame)).unwrap();
        assert_eq!(
            rec.rmat().column(1).iter().cloned().collect::<Vec<_>>(),
            frame.image.as_slice().to_vec()
        );
        assert!(rec.rmat().column(0).iter().all(|x| *x == 0f64));
        assert_eq!(rec.rimages()[1], frame.image);
        assert!(matches!(
            rec.accumulate_rmat(3, &measurement, None),
            Err(Error::ModeIndex(3, 3))
        ));
        assert!(matches!(
            rec.accumulate_rmat(0, &measurement[1..], None),
            Err(Error::Shape { .. })
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rmat.bin");
        rec.save_rmat(&BincodeStore, &path).unwrap();
        let image = BincodeStore.read(&path).unwrap();
        assert_eq!(image.header_value::<usize>("NMODES").unwrap(), 3);
        assert_eq!(image.header_value::<usize>("DETROWS").unwrap(), 16);
        assert_eq!(image.header_value::<f64>("CALAMP").unwrap(), 1e-8);
        assert_eq!(image.plane(0).unwrap(), *rec.rmat());
        let path = dir.path().join("rimages.bin");
        rec.save_rimages(&BincodeStore, &path).unwrap();
        assert_eq!(BincodeStore.read(&path).unwrap().planes, 3);
    }

    #[test]
    fn loaded_recon() {
        let (pupil, dm) = setup();
        let mut rec = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.bin");
        let recon = DMatrix::from_element(256, 2, 1f64);
        BincodeStore.write(&path, &Image::from_matrix(&recon)).unwrap();
        rec.load_recon(&BincodeStore, &path).unwrap();
        assert_eq!(rec.n_modes(), 2);
    }
}
