//! # Wavefront sensors
//!
//! A [WavefrontSensor] integrates wavefronts into detector frames that are read out
//! some iterations later.
//! The [IdealPhaseSensor] frame is the wavefront optical path difference.

use std::collections::VecDeque;

use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::{
    control::{Average, Control},
    DetectorImage, Wavefront,
};

pub trait WavefrontSensor {
    /// Sensing wavelength [m]
    fn lambda(&self) -> f64;
    fn det_rows(&self) -> usize;
    fn det_cols(&self) -> usize;
    /// Number of iterations integrated into one frame
    fn integration(&self) -> usize;
    fn set_integration(&mut self, integration: usize);
    /// Number of iterations between the end of the integration and the frame delivery
    fn readout(&self) -> usize;
    fn set_readout(&mut self, readout: usize);
    fn no_noise(&self) -> bool;
    fn set_no_noise(&mut self, no_noise: bool);
    /// Senses `wf` and returns true if a new frame is ready
    fn sense_wavefront(&mut self, wf: &Wavefront) -> bool;
    /// Senses `wf` into a new frame, ignoring the integration and the readout
    fn sense_wavefront_cal(&mut self, wf: &Wavefront);
    /// Last frame
    fn detector_image(&self) -> &DetectorImage;
    fn detector_image_mut(&mut self) -> &mut DetectorImage;
}

/// Optical path difference sensor
///
/// The frame is the wavefront phase converted to meters at the sensing wavelength,
/// optionally with Gaussian read noise.
pub struct IdealPhaseSensor {
    lambda: f64,
    size: usize,
    integrator: Average,
    readout: usize,
    pipeline: VecDeque<(usize, DetectorImage)>,
    read_noise: f64,
    no_noise: bool,
    rng: ChaCha8Rng,
    image: DetectorImage,
}
impl IdealPhaseSensor {
    /// Creates a sensor of `size x size` pixels at wavelength `lambda`
    pub fn new(size: usize, lambda: f64) -> Self {
        Self {
            lambda,
            size,
            integrator: Average::new(1, size * size),
            readout: 0,
            pipeline: VecDeque::new(),
            read_noise: 0f64,
            no_noise: false,
            rng: ChaCha8Rng::from_entropy(),
            image: DetectorImage::new(size, size),
        }
    }
    /// Sets the read noise RMS [m]
    pub fn read_noise(self, read_noise: f64) -> Self {
        Self { read_noise, ..self }
    }
    /// Seeds the read noise generator
    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            ..self
        }
    }
    fn opd(&self, wf: &Wavefront) -> DMatrix<f64> {
        &wf.phase * (self.lambda / (2f64 * std::f64::consts::PI))
    }
    fn add_noise(&mut self, image: &mut DMatrix<f64>) {
        if self.no_noise || self.read_noise == 0f64 {
            return;
        }
        let rms = self.read_noise;
        let rng = &mut self.rng;
        image
            .iter_mut()
            .for_each(|x| *x += rms * rng.sample::<f64, _>(StandardNormal));
    }
}
impl WavefrontSensor for IdealPhaseSensor {
    fn lambda(&self) -> f64 {
        self.lambda
    }
    fn det_rows(&self) -> usize {
        self.size
    }
    fn det_cols(&self) -> usize {
        self.size
    }
    fn integration(&self) -> usize {
        self.integrator.n_sample()
    }
    fn set_integration(&mut self, integration: usize) {
        self.integrator = Average::new(integration, self.size * self.size);
        self.pipeline.clear();
    }
    fn readout(&self) -> usize {
        self.readout
    }
    fn set_readout(&mut self, readout: usize) {
        self.readout = readout;
        self.pipeline.clear();
    }
    fn no_noise(&self) -> bool {
        self.no_noise
    }
    fn set_no_noise(&mut self, no_noise: bool) {
        self.no_noise = no_noise;
    }
    fn sense_wavefront(&mut self, wf: &Wavefront) -> bool {
        let opd = self.opd(wf);
        if let Some(mean) = self.integrator.step(opd.as_slice()) {
            let mut image = DMatrix::from_vec(self.size, self.size, mean);
            self.add_noise(&mut image);
            self.pipeline.push_back((
                wf.iteration + self.readout,
                DetectorImage {
                    image,
                    iteration: wf.iteration,
                },
            ));
        }
        match self.pipeline.front() {
            Some((ready, _)) if *ready <= wf.iteration => {
                if let Some((_, frame)) = self.pipeline.pop_front() {
                    self.image = frame;
                }
                true
            }
            _ => false,
        }
    }
    fn sense_wavefront_cal(&mut self, wf: &Wavefront) {
        let mut image = self.opd(wf);
        self.add_noise(&mut image);
        self.image = DetectorImage {
            image,
            iteration: wf.iteration,
        };
    }
    fn detector_image(&self) -> &DetectorImage {
        &self.image
    }
    fn detector_image_mut(&mut self) -> &mut DetectorImage {
        &mut self.image
    }
}
