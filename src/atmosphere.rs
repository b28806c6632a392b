//! # Multi-layer frozen-flow atmosphere
//!
//! The [Atmosphere] owns the turbulent [Layer]s, generates (or loads) their phase screens
//! and sums their Cn²-weighted translated screens into one wavefront per time step.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Instant,
};

use nalgebra::DMatrix;
use rand::Rng;
use rayon::prelude::*;

use crate::{
    io::{BincodeStore, Image, ImageStore, ScaleTable},
    layer::LayerProperties,
    screen::{layer_rng, LowOrderNotch, ScreenSynthesizer},
    Error, Layer, Pupil, Result, Wavefront,
};

/// Source of a sequence of turbulent wavefronts
pub trait TurbulenceSequence {
    /// Number of wavefronts in the sequence
    fn frames(&self) -> usize;
    /// Writes the next wavefront of the sequence into `wf`
    fn next_wf(&mut self, wf: &mut Wavefront, pupil: &Pupil) -> Result<()>;
}

/// Per-layer parameters
///
/// All the vectors must have the same length, the number of layers.
/// The wind direction is in radians.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerParameters {
    pub screen_size: Vec<usize>,
    pub r0: Vec<f64>,
    pub outer_scale: Vec<f64>,
    pub inner_scale: Vec<f64>,
    pub cn2: Vec<f64>,
    pub altitude: Vec<f64>,
    pub wind_speed: Vec<f64>,
    pub wind_direction: Vec<f64>,
}
impl LayerParameters {
    /// Layers sharing the same screen size, r0 and outer and inner scales
    pub fn uniform(
        screen_size: usize,
        r0: f64,
        outer_scale: f64,
        inner_scale: f64,
        cn2: Vec<f64>,
        altitude: Vec<f64>,
        wind_speed: Vec<f64>,
        wind_direction: Vec<f64>,
    ) -> Self {
        let n = cn2.len();
        Self {
            screen_size: vec![screen_size; n],
            r0: vec![r0; n],
            outer_scale: vec![outer_scale; n],
            inner_scale: vec![inner_scale; n],
            cn2,
            altitude,
            wind_speed,
            wind_direction,
        }
    }
    pub fn len(&self) -> usize {
        self.screen_size.len()
    }
    pub fn is_empty(&self) -> bool {
        self.screen_size.is_empty()
    }
    /// Checks the vector lengths and returns the properties of each layer
    pub fn properties(&self) -> Result<Vec<LayerProperties>> {
        let expected = self.len();
        for (name, found) in [
            ("r0", self.r0.len()),
            ("L0", self.outer_scale.len()),
            ("l0", self.inner_scale.len()),
            ("Cn2", self.cn2.len()),
            ("z", self.altitude.len()),
            ("wind speed", self.wind_speed.len()),
            ("wind direction", self.wind_direction.len()),
        ] {
            if found != expected {
                return Err(Error::LayerParameter {
                    name,
                    expected,
                    found,
                });
            }
        }
        if let Some(i) = self.screen_size.iter().position(|&n| n == 0) {
            return Err(Error::Config(format!("layer #{i} has an empty screen")));
        }
        Ok((0..expected)
            .map(|i| LayerProperties {
                screen_size: self.screen_size[i],
                r0: self.r0[i],
                outer_scale: self.outer_scale[i],
                inner_scale: self.inner_scale[i],
                cn2: self.cn2[i],
                altitude: self.altitude[i],
                wind_speed: self.wind_speed[i],
                wind_direction: self.wind_direction[i],
            })
            .collect())
    }
}

/// [Atmosphere] builder
pub struct AtmosphereBuilder {
    pupil_diameter: f64,
    wf_size: usize,
    border: usize,
    lambda0: f64,
    lambda: f64,
    notch: LowOrderNotch,
    layers: LayerParameters,
    time_step: f64,
    frames: usize,
    f0_photons: f64,
    star_mag: f64,
    maybe_data_dir: Option<PathBuf>,
    force_generation: bool,
    maybe_scales: Option<PathBuf>,
    maybe_seed: Option<u64>,
    store: Box<dyn ImageStore>,
}
impl AtmosphereBuilder {
    /// Sets the wavelength r0 is given at and the wavefront wavelength
    pub fn wavelengths(mut self, lambda0: f64, lambda: f64) -> Self {
        self.lambda0 = lambda0;
        self.lambda = lambda;
        self
    }
    /// Removes piston and/or tip-tilt from the screens spectrum
    pub fn notch(mut self, notch: LowOrderNotch) -> Self {
        self.notch = notch;
        self
    }
    /// Sets the turbulent layers
    pub fn layers(mut self, layers: LayerParameters) -> Self {
        self.layers = layers;
        self
    }
    /// Sets the time step in seconds
    pub fn time_step(mut self, time_step: f64) -> Self {
        self.time_step = time_step;
        self
    }
    /// Sets the length of the wavefront sequence
    pub fn frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }
    /// Sets the zero-magnitude photon flux
    pub fn f0_photons(mut self, f0_photons: f64) -> Self {
        self.f0_photons = f0_photons;
        self
    }
    pub fn star_mag(mut self, star_mag: f64) -> Self {
        self.star_mag = star_mag;
        self
    }
    /// Sets the directory the screens are loaded from, or saved to if they are generated
    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.maybe_data_dir = Some(path.as_ref().to_path_buf());
        self
    }
    /// Generates the screens even if they are available in the data directory
    pub fn force_generation(mut self) -> Self {
        self.force_generation = true;
        self
    }
    /// Rescales the screens loaded from the data directory with the scales in `path`
    pub fn scale_table<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.maybe_scales = Some(path.as_ref().to_path_buf());
        self
    }
    /// Seeds the screens random generators
    pub fn seed(mut self, seed: u64) -> Self {
        self.maybe_seed = Some(seed);
        self
    }
    /// Sets the screens file format
    pub fn store(mut self, store: Box<dyn ImageStore>) -> Self {
        self.store = store;
        self
    }
    /// Builds the layers and generates or loads the screens
    pub fn build(self) -> Result<Atmosphere> {
        let mut atmosphere = Atmosphere {
            pupil_diameter: self.pupil_diameter,
            wf_size: self.wf_size,
            border: self.border,
            lambda0: self.lambda0,
            lambda: self.lambda,
            notch: self.notch,
            layers: Vec::new(),
            time_step: self.time_step,
            frames: self.frames,
            n_wf: 0,
            f0_photons: self.f0_photons,
            star_mag: self.star_mag,
            maybe_data_dir: self.maybe_data_dir,
            force_generation: self.force_generation,
            maybe_scales: self
                .maybe_scales
                .map(ScaleTable::load)
                .transpose()?,
            maybe_seed: self.maybe_seed,
            store: self.store,
        };
        atmosphere.set_layers(&self.layers)?;
        atmosphere.gen_layers()?;
        Ok(atmosphere)
    }
}

/// Frozen-flow turbulence
pub struct Atmosphere {
    pupil_diameter: f64,
    wf_size: usize,
    border: usize,
    lambda0: f64,
    lambda: f64,
    notch: LowOrderNotch,
    layers: Vec<Layer>,
    time_step: f64,
    frames: usize,
    n_wf: usize,
    f0_photons: f64,
    star_mag: f64,
    maybe_data_dir: Option<PathBuf>,
    force_generation: bool,
    maybe_scales: Option<ScaleTable>,
    maybe_seed: Option<u64>,
    store: Box<dyn ImageStore>,
}
impl Atmosphere {
    /// Creates an [Atmosphere] builder
    ///
    /// The wavefront is `wf_size` pixels across the pupil diameter `pupil_diameter` and
    /// the layers are translated with a `border` pixels margin.
    pub fn builder(pupil_diameter: f64, wf_size: usize, border: usize) -> AtmosphereBuilder {
        AtmosphereBuilder {
            pupil_diameter,
            wf_size,
            border,
            lambda0: 0.5e-6,
            lambda: 0.5e-6,
            notch: LowOrderNotch::default(),
            layers: LayerParameters::default(),
            time_step: 1e-3,
            frames: 0,
            f0_photons: 0f64,
            star_mag: 0f64,
            maybe_data_dir: None,
            force_generation: false,
            maybe_scales: None,
            maybe_seed: None,
            store: Box::new(BincodeStore),
        }
    }
    /// Replaces the layers
    ///
    /// The atmosphere is left unchanged if the parameters are inconsistent.
    /// The new layers have flat screens until [Atmosphere::gen_layers] is called.
    pub fn set_layers(&mut self, parameters: &LayerParameters) -> Result<()> {
        let layers = parameters
            .properties()?
            .into_iter()
            .map(|p| Layer::new(p, self.wf_size, self.border, self.pupil_diameter))
            .collect::<Result<Vec<_>>>()?;
        self.layers = layers;
        Ok(())
    }
    fn layer_path(&self, dir: &Path, i: usize) -> PathBuf {
        dir.join(self.store.file_name(&format!("layer_{i}")))
    }
    /// Loads or generates the layer screens
    pub fn gen_layers(&mut self) -> Result<()> {
        if let (Some(dir), false) = (&self.maybe_data_dir, self.force_generation) {
            let dir = dir.clone();
            if (0..self.layers.len()).all(|i| self.layer_path(&dir, i).exists()) {
                return self.load_layers(&dir);
            }
            log::info!("no cached screens in {dir:?}");
        }

        let seed = self.maybe_seed.unwrap_or_else(|| rand::thread_rng().gen());
        log::info!("generating {} layers (seed: {seed})", self.layers.len());
        let now = Instant::now();
        let pixel_scale = self.pupil_diameter / self.wf_size as f64;
        let (lambda0, lambda, notch, pupil_diameter) =
            (self.lambda0, self.lambda, self.notch, self.pupil_diameter);
        self.layers
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(i, layer)| {
                let p = layer.properties().clone();
                log::info!(
                    "layer #{i}: {} {:.3} {:.1} {:.3}",
                    p.screen_size,
                    p.r0,
                    p.outer_scale,
                    p.inner_scale
                );
                let screen = ScreenSynthesizer::new(p.screen_size, pixel_scale, p.r0)
                    .outer_scale(p.outer_scale)
                    .inner_scale(p.inner_scale)
                    .wavelengths(lambda0, lambda)
                    .notch(pupil_diameter, notch)
                    .generate(&mut layer_rng(seed, i))?;
                layer.set_screen(screen);
                Ok::<(), Error>(())
            })?;
        log::info!("layers generated in {}ms", now.elapsed().as_millis());

        if let Some(dir) = &self.maybe_data_dir {
            fs::create_dir_all(dir)?;
            for (i, layer) in self.layers.iter().enumerate() {
                let path = self.layer_path(dir, i);
                self.store.write(&path, &Image::from_matrix(layer.screen()))?;
            }
            log::info!("layers saved to {dir:?}");
        }
        Ok(())
    }
    fn load_layers(&mut self, dir: &Path) -> Result<()> {
        for i in 0..self.layers.len() {
            let path = self.layer_path(dir, i);
            let mut screen = self.store.read(&path)?.plane(0)?;
            let n = self.layers[i].screen_size();
            if screen.shape() != (n, n) {
                return Err(Error::Shape {
                    what: "layer screen",
                    expected: (n, n),
                    found: screen.shape(),
                });
            }
            if let Some(scales) = &self.maybe_scales {
                screen *= scales.scale_for(&path)?;
            }
            self.layers[i].set_screen(screen);
        }
        log::info!("{} layers loaded from {dir:?}", self.layers.len());
        Ok(())
    }
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    pub fn n_layer(&self) -> usize {
        self.layers.len()
    }
    pub fn wf_size(&self) -> usize {
        self.wf_size
    }
    pub fn time_step(&self) -> f64 {
        self.time_step
    }
    pub fn set_time_step(&mut self, time_step: f64) {
        self.time_step = time_step;
    }
    pub fn set_frames(&mut self, frames: usize) {
        self.frames = frames;
    }
    /// Number of wavefronts delivered so far
    pub fn n_wf(&self) -> usize {
        self.n_wf
    }
    pub fn set_f0_photons(&mut self, f0_photons: f64) {
        self.f0_photons = f0_photons;
    }
    pub fn set_star_mag(&mut self, star_mag: f64) {
        self.star_mag = star_mag;
    }
    /// Wavefront amplitude within the pupil
    pub fn pix_val(&self) -> f64 {
        self.f0_photons.sqrt()
            * 10f64.powf(-0.2 * self.star_mag)
            * (self.pupil_diameter / self.wf_size as f64)
    }
    /// Sum of the Cn²-weighted layers translated to time `dt`, without the border
    pub fn shift(&mut self, dt: f64) -> DMatrix<f64> {
        let n = self.wf_size;
        self.layers
            .par_iter_mut()
            .map(|layer| {
                layer.shift(dt);
                layer.crop() * layer.cn2().sqrt()
            })
            .reduce(|| DMatrix::zeros(n, n), |a, b| a + b)
    }
    /// Sum of the Cn²-weighted layers translated by random amounts, without the border
    pub fn shift_random<R: Rng>(&mut self, rng: &mut R, no_fract: bool) -> DMatrix<f64> {
        let n = self.wf_size;
        self.layers
            .iter_mut()
            .fold(DMatrix::zeros(n, n), |phase, layer| {
                layer.shift_random(rng, no_fract);
                phase + layer.crop() * layer.cn2().sqrt()
            })
    }
}

impl TurbulenceSequence for Atmosphere {
    fn frames(&self) -> usize {
        self.frames
    }
    fn next_wf(&mut self, wf: &mut Wavefront, pupil: &Pupil) -> Result<()> {
        if pupil.size() != self.wf_size {
            return Err(Error::Shape {
                what: "pupil",
                expected: (self.wf_size, self.wf_size),
                found: pupil.mask().shape(),
            });
        }
        let mut phase = self.shift(self.n_wf as f64 * self.time_step);
        self.n_wf += 1;
        pupil.remove_mean(&mut phase);
        wf.set_phase(phase);
        wf.set_amplitude(pupil.mask() * self.pix_val());
        Ok(())
    }
}
