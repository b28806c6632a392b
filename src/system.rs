//! # Adaptive optics system
//!
//! The [AoSystem] runs the closed loop one wavefront at a time:
//! turbulence, mirror correction, wavefront sensing, reconstruction, command latency
//! and command filtering, and records the run products.
//! It also takes the response matrix of the sensor to the mirror modes.
//!
//! ```no_run
//! use aosim::{
//!     control::Integrate,
//!     dm::{DeformableMirror, ModalDm},
//!     wfs::IdealPhaseSensor,
//!     AoSystem, Atmosphere, DirectPhaseReconstructor, LayerParameters, Pupil,
//! };
//!
//! # fn main() -> aosim::Result<()> {
//! let pupil = Pupil::circular(64, 6.5, 0.1)?;
//! let atmosphere = Atmosphere::builder(6.5, 64, 4)
//!     .layers(LayerParameters::uniform(256, 0.15, 25., 0., vec![1.], vec![0.], vec![10.], vec![0.]))
//!     .frames(100)
//!     .build()?;
//! let dm = ModalDm::fourier(&pupil, 4)?;
//! let recon = DirectPhaseReconstructor::new(&pupil, dm.modes())?;
//! let n_modes = dm.n_modes();
//! let mut system = AoSystem::builder(pupil).command_delay(1).build(
//!     atmosphere,
//!     IdealPhaseSensor::new(64, 0.8e-6),
//!     recon,
//!     Integrate::new(0.5, n_modes),
//!     dm,
//! )?;
//! system.run_turbulence()?;
//! # Ok(())
//! # }
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use linya::{Bar, Progress};
use nalgebra::DMatrix;

use crate::{
    control::CommandFilter,
    dm::DeformableMirror,
    imaging::{Coronagraph, PhaseFilter},
    io::{BincodeStore, ImageStore},
    output::{DiagnosticStreams, PsfRecorder, WavefrontRecorder},
    reconstructor::Reconstructor,
    wfs::WavefrontSensor,
    DelayLine, Error, ModalCommand, Pupil, Result, TurbulenceSequence, Wavefront,
};

/// Outcome of one loop iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    /// Open-loop phase RMS over the pupil [rad]
    pub rms_open: f64,
    /// Closed-loop phase RMS over the scoring mask [rad]
    pub rms_closed: f64,
    /// True if the sensor delivered a new frame
    pub new_frame: bool,
    /// Iteration of the measurement behind the command applied at this iteration
    pub applied: Option<usize>,
}

/// [AoSystem] builder
pub struct AoSystemBuilder {
    pupil: Pupil,
    command_delay: usize,
    loop_closed_delay: usize,
    scoring_mask: Option<DMatrix<f64>>,
    scoring_mask_file: Option<PathBuf>,
    store: Arc<dyn ImageStore>,
    coronagraph: Option<Box<dyn Coronagraph>>,
    phase_filter: Option<Box<dyn PhaseFilter>>,
    rms_file: Option<PathBuf>,
    amp_file: Option<PathBuf>,
    wavefronts: Option<(PathBuf, usize)>,
    psf_recorder: Option<PsfRecorder>,
}
impl AoSystemBuilder {
    /// Latency in iterations between a measurement and its command
    pub fn command_delay(mut self, command_delay: usize) -> Self {
        self.command_delay = command_delay;
        self
    }
    /// Iteration at which the loop is closed
    pub fn loop_closed_delay(mut self, loop_closed_delay: usize) -> Self {
        self.loop_closed_delay = loop_closed_delay;
        self
    }
    /// Closed-loop RMS mask, the pupil by default
    pub fn scoring_mask(mut self, mask: DMatrix<f64>) -> Self {
        self.scoring_mask = Some(mask);
        self
    }
    /// Reads the closed-loop RMS mask from the image store
    ///
    /// The pupil is used instead if the file cannot be read.
    pub fn scoring_mask_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.scoring_mask_file = Some(path.as_ref().to_path_buf());
        self
    }
    /// Output image store, [BincodeStore] by default
    pub fn store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.store = store;
        self
    }
    pub fn coronagraph<C: Coronagraph + 'static>(mut self, coronagraph: C) -> Self {
        self.coronagraph = Some(Box::new(coronagraph));
        self
    }
    /// Spatial filter applied to the corrected phase
    pub fn phase_filter<F: PhaseFilter + 'static>(mut self, filter: F) -> Self {
        self.phase_filter = Some(Box::new(filter));
        self
    }
    /// Writes the open and closed loop RMS of each iteration to `path`
    pub fn rms_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.rms_file = Some(path.as_ref().to_path_buf());
        self
    }
    /// Writes the reconstructed amplitudes of each new frame to `path`
    pub fn amp_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.amp_file = Some(path.as_ref().to_path_buf());
        self
    }
    /// Writes the corrected wavefronts, `n_per_file` per file, to `<base>_phase_#` and `<base>_amp_#`
    pub fn write_wavefronts<P: AsRef<Path>>(mut self, base: P, n_per_file: usize) -> Self {
        self.wavefronts = Some((base.as_ref().to_path_buf(), n_per_file));
        self
    }
    /// Records the focal plane images through the coronagraph
    pub fn psf_recorder(mut self, recorder: PsfRecorder) -> Self {
        self.psf_recorder = Some(recorder);
        self
    }
    fn load_scoring_mask(&self) -> Result<DMatrix<f64>> {
        let n = self.pupil.size();
        let mask = match (&self.scoring_mask, &self.scoring_mask_file) {
            (Some(mask), _) => mask.clone(),
            (None, Some(path)) => match self.store.read(path).and_then(|image| image.plane(0)) {
                Ok(mask) => {
                    log::info!("scoring mask loaded from {:?}", path);
                    mask
                }
                Err(e) => {
                    log::warn!("scoring mask {:?} not loaded ({e}), using the pupil", path);
                    self.pupil.mask().clone()
                }
            },
            (None, None) => self.pupil.mask().clone(),
        };
        if mask.shape() != (n, n) {
            return Err(Error::Shape {
                what: "scoring mask",
                expected: (n, n),
                found: mask.shape(),
            });
        }
        Ok(mask)
    }
    /// Assembles the system with the given components
    pub fn build<T, W, R, F, M>(
        self,
        turbulence: T,
        wfs: W,
        recon: R,
        mut filter: F,
        dm: M,
    ) -> Result<AoSystem<T, W, R, F, M>>
    where
        T: TurbulenceSequence,
        W: WavefrontSensor,
        R: Reconstructor,
        F: CommandFilter,
        M: DeformableMirror,
    {
        if self.psf_recorder.is_some() && self.coronagraph.is_none() {
            return Err(Error::Config(
                "PSF recording requires a coronagraph".to_string(),
            ));
        }
        if recon.n_modes() != dm.n_modes() {
            return Err(Error::Config(format!(
                "the reconstructor has {} modes and the mirror {}",
                recon.n_modes(),
                dm.n_modes()
            )));
        }
        let n = self.pupil.size();
        let frames = [
            ("wavefront sensor frame", (wfs.det_rows(), wfs.det_cols())),
            ("reconstructor frame", recon.frame_shape()),
        ];
        for (what, found) in frames {
            if found != (n, n) {
                return Err(Error::Shape {
                    what,
                    expected: (n, n),
                    found,
                });
            }
        }
        let maps = [
            ("coronagraph pupil", self.coronagraph.as_ref().map(|c| c.pupil_size())),
            ("phase filter", self.phase_filter.as_ref().map(|f| f.size())),
        ];
        for (what, size) in maps {
            match size {
                Some(size) if size != n => {
                    return Err(Error::Shape {
                        what,
                        expected: (n, n),
                        found: (size, size),
                    })
                }
                _ => (),
            }
        }
        let scoring_mask = self.load_scoring_mask()?;
        let mut diagnostics = DiagnosticStreams::new();
        if let Some(path) = &self.rms_file {
            diagnostics = diagnostics.rms(path)?;
        }
        if let Some(path) = &self.amp_file {
            diagnostics = diagnostics.amplitudes(path)?;
        }
        let wf_recorder = self
            .wavefronts
            .as_ref()
            .map(|(base, n)| WavefrontRecorder::new(self.store.clone(), base, *n));
        let n_modes = recon.n_modes();
        filter.initialize(n_modes);
        let wfs_lambda = wfs.lambda();
        log::info!(
            "AO system: {} modes, command delay: {}, loop closed at iteration {}",
            n_modes,
            self.command_delay,
            self.loop_closed_delay
        );
        Ok(AoSystem {
            turbulence,
            wfs,
            recon,
            filter,
            dm,
            pupil: self.pupil,
            scoring_mask,
            command_delay: self.command_delay,
            loop_closed_delay: self.loop_closed_delay,
            loop_closed: false,
            delay_line: DelayLine::new(self.command_delay, n_modes),
            frame_counter: 0,
            wfs_lambda,
            store: self.store,
            coronagraph: self.coronagraph,
            phase_filter: self.phase_filter,
            diagnostics,
            wf_recorder,
            psf_recorder: self.psf_recorder,
            measured: ModalCommand::zeros(n_modes),
            command: ModalCommand::zeros(n_modes),
        })
    }
}

/// Closed-loop adaptive optics system
pub struct AoSystem<T, W, R, F, M> {
    pub turbulence: T,
    pub wfs: W,
    pub recon: R,
    pub filter: F,
    pub dm: M,
    pupil: Pupil,
    scoring_mask: DMatrix<f64>,
    command_delay: usize,
    loop_closed_delay: usize,
    loop_closed: bool,
    delay_line: DelayLine,
    frame_counter: usize,
    wfs_lambda: f64,
    store: Arc<dyn ImageStore>,
    coronagraph: Option<Box<dyn Coronagraph>>,
    phase_filter: Option<Box<dyn PhaseFilter>>,
    diagnostics: DiagnosticStreams,
    wf_recorder: Option<WavefrontRecorder>,
    psf_recorder: Option<PsfRecorder>,
    measured: ModalCommand,
    command: ModalCommand,
}
impl AoSystem<(), (), (), (), ()> {
    /// Starts the system builder
    pub fn builder(pupil: Pupil) -> AoSystemBuilder {
        AoSystemBuilder {
            pupil,
            command_delay: 0,
            loop_closed_delay: 0,
            scoring_mask: None,
            scoring_mask_file: None,
            store: Arc::new(BincodeStore),
            coronagraph: None,
            phase_filter: None,
            rms_file: None,
            amp_file: None,
            wavefronts: None,
            psf_recorder: None,
        }
    }
}
impl<T, W, R, F, M> AoSystem<T, W, R, F, M>
where
    T: TurbulenceSequence,
    W: WavefrontSensor,
    R: Reconstructor,
    F: CommandFilter,
    M: DeformableMirror,
{
    pub fn pupil(&self) -> &Pupil {
        &self.pupil
    }
    pub fn scoring_mask(&self) -> &DMatrix<f64> {
        &self.scoring_mask
    }
    pub fn command_delay(&self) -> usize {
        self.command_delay
    }
    pub fn delay_line(&self) -> &DelayLine {
        &self.delay_line
    }
    /// Number of iterations run so far
    pub fn frame_counter(&self) -> usize {
        self.frame_counter
    }
    pub fn is_loop_closed(&self) -> bool {
        self.loop_closed
    }
    /// Closes the loop
    pub fn close_loop(&mut self) {
        self.loop_closed = true;
    }
    /// Last command sent to the mirror
    pub fn command(&self) -> &ModalCommand {
        &self.command
    }
    /// Closed-loop RMS over the scoring mask
    fn score(&self, phase: &DMatrix<f64>) -> f64 {
        let norm = self.scoring_mask.sum();
        if norm == 0f64 {
            return 0f64;
        }
        (phase.component_mul(&self.scoring_mask).norm_squared() / norm).sqrt()
    }
    /// Runs one loop iteration on the next turbulence wavefront, written into `wf`
    pub fn next_wf(&mut self, wf: &mut Wavefront) -> Result<IterationReport> {
        let n = self.frame_counter;
        self.turbulence.next_wf(wf, &self.pupil)?;
        wf.iteration = n;

        self.pupil.remove_mean(&mut wf.phase);
        let rms_open = self.pupil.rms(&wf.phase);

        if n == 0 {
            self.delay_line.invalidate_all();
        }

        let mut new_frame = false;
        if self.loop_closed {
            self.dm.apply_shape(wf, self.wfs_lambda);
            new_frame = self.wfs.sense_wavefront(wf);
        }
        if new_frame {
            self.recon
                .reconstruct(&mut self.measured, self.wfs.detector_image());
            self.diagnostics.write_amplitudes(&self.measured)?;
            self.delay_line.store(n, self.measured.clone());
        } else {
            self.delay_line.invalidate(n);
        }

        let mut applied = None;
        if let Some(record) = self.delay_line.active(n) {
            self.filter.filter_commands(&mut self.command, record, n);
            self.dm.set_shape(&self.command);
            applied = Some(record.iteration);
        }

        self.pupil.remove_mean(&mut wf.phase);
        let rms_closed = self.score(&wf.phase);

        if let Some(filter) = self.phase_filter.as_mut() {
            filter.filter(&mut wf.phase);
        }

        self.diagnostics.write_rms(n, rms_open, rms_closed)?;
        log::debug!("#{n:>6}: {rms_open:.3e} -> {rms_closed:.3e} rad");

        if let Some(recorder) = self.wf_recorder.as_mut() {
            recorder.record(wf)?;
        }
        if let (Some(recorder), Some(coronagraph)) =
            (self.psf_recorder.as_mut(), self.coronagraph.as_mut())
        {
            if recorder.is_recording(n) {
                let psf = coronagraph.propagate_nc(wf);
                let coron = coronagraph.propagate(wf);
                recorder.record(n, psf, Some(coron))?;
            }
        }

        self.frame_counter += 1;
        Ok(IterationReport {
            iteration: n,
            rms_open,
            rms_closed,
            new_frame,
            applied,
        })
    }
    /// Runs the loop over the whole turbulence sequence
    ///
    /// The loop is closed at iteration `loop_closed_delay`.
    /// The PSF sums are written and the diagnostic streams flushed at the end of the run.
    pub fn run_turbulence(&mut self) -> Result<Vec<IterationReport>> {
        let n_frame = self.turbulence.frames();
        let mut wf = Wavefront::new(self.pupil.size());
        let mut reports = Vec::with_capacity(n_frame);
        let mut progress = Progress::new();
        let bar: Bar = progress.bar(n_frame, "Closed-loop");
        let now = Instant::now();
        for i in 0..n_frame {
            if i == self.loop_closed_delay {
                log::info!("loop closed at iteration {}", self.frame_counter);
                self.loop_closed = true;
            }
            reports.push(self.next_wf(&mut wf)?);
            progress.set_and_draw(&bar, i + 1);
        }
        if let Some(recorder) = self.psf_recorder.as_mut() {
            recorder.finish()?;
        }
        if let Some(recorder) = self.wf_recorder.as_mut() {
            recorder.flush()?;
        }
        self.diagnostics.flush()?;
        if !reports.is_empty() {
            let n = reports.len() as f64;
            let (open, closed) = reports.iter().fold((0f64, 0f64), |(o, c), r| {
                (o + r.rms_open, c + r.rms_closed)
            });
            log::info!(
                "{} iterations in {:.3}s, mean RMS: {:.3e} -> {:.3e} rad",
                reports.len(),
                now.elapsed().as_secs_f64(),
                open / n,
                closed / n
            );
        }
        Ok(reports)
    }
    /// Takes the response matrix of the sensor to the mirror modes
    ///
    /// Each mode is applied with amplitude `cal_amp` [m] to a flat wavefront, sensed
    /// in a single noiseless frame and accumulated into the reconstructor response matrix.
    /// The modes from `n_modes_cutoff` on are recorded as null frames.
    /// The response matrix and the sensor frames are written to `rmat_path` and `rimages_path`
    /// if given.
    pub fn take_response_matrix(
        &mut self,
        cal_amp: f64,
        n_modes_cutoff: Option<usize>,
        rmat_path: Option<&Path>,
        rimages_path: Option<&Path>,
    ) -> Result<()> {
        let n_modes = self.dm.n_modes();
        let (rows, cols) = (self.wfs.det_rows(), self.wfs.det_cols());
        self.recon.initialize_rmat(n_modes, cal_amp, rows, cols)?;
        self.recon.set_cal_amp(cal_amp);

        let settings = (
            self.wfs.integration(),
            self.wfs.readout(),
            self.wfs.no_noise(),
        );
        self.wfs.set_integration(1);
        self.wfs.set_readout(0);
        self.wfs.set_no_noise(true);

        let lambda = self.wfs.lambda();
        let cutoff = n_modes_cutoff.unwrap_or(n_modes);
        log::info!(
            "response matrix: {} modes ({} poked), amplitude: {:.3e}m",
            n_modes,
            cutoff.min(n_modes),
            cal_amp
        );
        let mut wf = Wavefront::new(self.pupil.size());
        let (mut poke, mut sense, mut record) =
            (Duration::ZERO, Duration::ZERO, Duration::ZERO);
        let now = Instant::now();
        let result = (0..n_modes).try_for_each(|i| -> Result<()> {
            wf.phase.fill(0f64);
            wf.set_amplitude(self.pupil.mask().clone());
            wf.iteration = i;
            if i < cutoff {
                let t = Instant::now();
                self.dm.apply_mode(&mut wf, i, cal_amp, lambda)?;
                poke += t.elapsed();
                let t = Instant::now();
                self.wfs.sense_wavefront_cal(&wf);
                sense += t.elapsed();
            } else {
                let frame = self.wfs.detector_image_mut();
                frame.image.fill(0f64);
                frame.iteration = i;
            }
            let t = Instant::now();
            let measurement = self.recon.calc_measurement(self.wfs.detector_image());
            self.recon
                .accumulate_rmat(i, &measurement, Some(self.wfs.detector_image()))?;
            record += t.elapsed();
            Ok(())
        });

        self.wfs.set_integration(settings.0);
        self.wfs.set_readout(settings.1);
        self.wfs.set_no_noise(settings.2);
        result?;

        let elapsed = now.elapsed().as_secs_f64();
        if n_modes > 0 {
            let k = 1e3 / n_modes as f64;
            log::info!(
                "response matrix taken in {:.3}s ({:.1}Hz)",
                elapsed,
                n_modes as f64 / elapsed
            );
            log::info!(
                "average timings: poke {:.3}ms, sense {:.3}ms, record {:.3}ms",
                poke.as_secs_f64() * k,
                sense.as_secs_f64() * k,
                record.as_secs_f64() * k
            );
        }
        if let Some(path) = rmat_path {
            self.recon.save_rmat(self.store.as_ref(), path)?;
            log::info!("response matrix written to {:?}", path);
        }
        if let Some(path) = rimages_path {
            self.recon.save_rimages(self.store.as_ref(), path)?;
            log::info!("response images written to {:?}", path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        control::{Identity, Integrate},
        dm::ModalDm,
        imaging::{FourierFilter, IdealCoronagraph},
        wfs::IdealPhaseSensor,
        DirectPhaseReconstructor,
    };
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    const N: usize = 16;
    const LAMBDA: f64 = 1e-6;

    /// Static wavefront made of one mirror mode
    struct Static {
        phase: DMatrix<f64>,
        frames: usize,
    }
    impl TurbulenceSequence for Static {
        fn frames(&self) -> usize {
            self.frames
        }
        fn next_wf(&mut self, wf: &mut Wavefront, pupil: &Pupil) -> Result<()> {
            wf.set_phase(self.phase.clone());
            wf.set_amplitude(pupil.mask().clone());
            Ok(())
        }
    }

    fn setup(frames: usize) -> (Pupil, ModalDm, Static) {
        let pupil = Pupil::new(DMatrix::from_element(N, N, 1f64), 1.6).unwrap();
        let dm = ModalDm::fourier(&pupil, 1).unwrap();
        let phase = &dm.modes()[2] * (2f64 * PI / LAMBDA * 1e-8);
        (pupil, dm, Static { phase, frames })
    }

    #[test]
    fn open_loop() {
        let (pupil, dm, turbulence) = setup(5);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let mut system = AoSystem::builder(pupil)
            .loop_closed_delay(10)
            .build(
                turbulence,
                IdealPhaseSensor::new(N, LAMBDA),
                recon,
                Identity,
                dm,
            )
            .unwrap();
        let reports = system.run_turbulence().unwrap();
        assert_eq!(reports.len(), 5);
        assert!(!system.is_loop_closed());
        reports.iter().for_each(|r| {
            assert!(!r.new_frame);
            assert_eq!(r.applied, None);
            assert_abs_diff_eq!(r.rms_open, r.rms_closed, epsilon = 1e-12);
        });
    }

    #[test]
    fn integrator_converges() {
        let (pupil, dm, turbulence) = setup(30);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let n_modes = dm.n_modes();
        let mut system = AoSystem::builder(pupil)
            .command_delay(1)
            .build(
                turbulence,
                IdealPhaseSensor::new(N, LAMBDA),
                recon,
                Integrate::new(0.5, n_modes),
                dm,
            )
            .unwrap();
        let reports = system.run_turbulence().unwrap();
        let first = reports.first().unwrap();
        let last = reports.last().unwrap();
        assert!(last.rms_closed < 1e-3 * first.rms_open);
        assert_abs_diff_eq!(system.command().amplitudes[2], 1e-8, epsilon = 1e-11);
    }

    #[test]
    fn psf_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (pupil, dm, turbulence) = setup(4);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let store: Arc<dyn ImageStore> = Arc::new(BincodeStore);
        let coronagraph = IdealCoronagraph::new(&pupil, 2 * N, N);
        let recorder = PsfRecorder::new(store.clone(), dir.path().join("run"), 10)
            .individual_frames(false)
            .save_frame_start(1);
        let mut system = AoSystem::builder(pupil)
            .store(store.clone())
            .coronagraph(coronagraph)
            .psf_recorder(recorder)
            .rms_file(dir.path().join("rms.txt"))
            .write_wavefronts(dir.path().join("wf"), 3)
            .build(
                turbulence,
                IdealPhaseSensor::new(N, LAMBDA),
                recon,
                Identity,
                dm,
            )
            .unwrap();
        system.run_turbulence().unwrap();
        let psf = store.read(&dir.path().join("run_psf.bin")).unwrap();
        assert_eq!(psf.header_value::<usize>("NFRAMES").unwrap(), 2);
        assert!(dir.path().join("run_coron.bin").exists());
        assert!(dir.path().join("wf_phase_00001.bin").exists());
        let rms = std::fs::read_to_string(dir.path().join("rms.txt")).unwrap();
        assert_eq!(rms.lines().count(), 5);
    }

    #[test]
    fn psf_recording_needs_a_coronagraph() {
        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let recorder = PsfRecorder::new(Arc::new(BincodeStore), "psf", 1);
        assert!(matches!(
            AoSystem::builder(pupil).psf_recorder(recorder).build(
                turbulence,
                IdealPhaseSensor::new(N, LAMBDA),
                recon,
                Identity,
                dm,
            ),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn mismatched_sizes() {
        let shape_error = |result: Result<_>, expected: &str| match result {
            Err(Error::Shape { what, .. }) => assert_eq!(what, expected),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("{expected} mismatch accepted"),
        };

        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        shape_error(
            AoSystem::builder(pupil)
                .build(
                    turbulence,
                    IdealPhaseSensor::new(N / 2, LAMBDA),
                    recon,
                    Identity,
                    dm,
                )
                .map(|_| ()),
            "wavefront sensor frame",
        );

        let (pupil, dm, turbulence) = setup(1);
        let small = Pupil::new(DMatrix::from_element(N / 2, N / 2, 1f64), 0.8).unwrap();
        let small_dm = ModalDm::fourier(&small, 1).unwrap();
        let recon = DirectPhaseReconstructor::new(&small, small_dm.modes()).unwrap();
        shape_error(
            AoSystem::builder(pupil)
                .build(
                    turbulence,
                    IdealPhaseSensor::new(N, LAMBDA),
                    recon,
                    Identity,
                    dm,
                )
                .map(|_| ()),
            "reconstructor frame",
        );

        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        shape_error(
            AoSystem::builder(pupil)
                .phase_filter(FourierFilter::low_pass(N / 2, 2f64))
                .build(
                    turbulence,
                    IdealPhaseSensor::new(N, LAMBDA),
                    recon,
                    Identity,
                    dm,
                )
                .map(|_| ()),
            "phase filter",
        );

        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let coronagraph = IdealCoronagraph::new(&small, 2 * N, N);
        shape_error(
            AoSystem::builder(pupil)
                .coronagraph(coronagraph)
                .build(
                    turbulence,
                    IdealPhaseSensor::new(N, LAMBDA),
                    recon,
                    Identity,
                    dm,
                )
                .map(|_| ()),
            "coronagraph pupil",
        );
    }

    #[test]
    fn scoring_mask_fallback() {
        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let mask = pupil.mask().clone();
        let system = AoSystem::builder(pupil)
            .scoring_mask_file("no/such/mask.bin")
            .build(
                turbulence,
                IdealPhaseSensor::new(N, LAMBDA),
                recon,
                Identity,
                dm,
            )
            .unwrap();
        assert_eq!(system.scoring_mask(), &mask);
    }

    #[test]
    fn response_matrix_restores_the_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let (pupil, dm, turbulence) = setup(1);
        let recon = DirectPhaseReconstructor::new(&pupil, dm.modes()).unwrap();
        let mut wfs = IdealPhaseSensor::new(N, LAMBDA);
        wfs.set_integration(3);
        wfs.set_readout(2);
        let n_modes = dm.n_modes();
        let mut system = AoSystem::builder(pupil)
            .build(turbulence, wfs, recon, Identity, dm)
            .unwrap();
        let rmat = dir.path().join("rmat.bin");
        system
            .take_response_matrix(1e-8, None, Some(&rmat), None)
            .unwrap();
        assert_eq!(system.wfs.integration(), 3);
        assert_eq!(system.wfs.readout(), 2);
        assert!(!system.wfs.no_noise());
        let image = BincodeStore.read(&rmat).unwrap();
        assert_eq!(image.header_value::<usize>("NMODES").unwrap(), n_modes);
        // the sensor frame of a poke is the poke OPD
        let rmat = system.recon.rmat();
        for (k, m) in rmat.column(2).iter().zip(system.dm.modes()[2].iter()) {
            assert_abs_diff_eq!(*k, 1e-8 * m, epsilon = 1e-20);
        }
    }
}
