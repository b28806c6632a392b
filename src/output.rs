//! # Run products
//!
//! Diagnostic text streams and the rolling wavefront and PSF cubes written during a run.
//! All the outputs are opened when they are created and flushed when they are dropped.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use nalgebra::DMatrix;

use crate::{
    io::{Image, ImageStore},
    Error, ModalCommand, Result, Wavefront,
};

/// Per-iteration text diagnostics
///
///  * RMS stream: `<iteration> <open-loop RMS> <closed-loop RMS>`
///  * amplitude stream: `<iteration>> <a0> <a1> ...`
#[derive(Default)]
pub struct DiagnosticStreams {
    rms: Option<BufWriter<File>>,
    amplitudes: Option<BufWriter<File>>,
}
impl DiagnosticStreams {
    pub fn new() -> Self {
        Default::default()
    }
    /// Opens the wavefront error stream
    pub fn rms<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(file, "#iteration open-loop-wfe closed-loop-wfe [rad rms phase]")?;
        self.rms = Some(file);
        Ok(self)
    }
    /// Opens the reconstructed amplitudes stream
    pub fn amplitudes<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.amplitudes = Some(BufWriter::new(File::create(path)?));
        Ok(self)
    }
    pub fn write_rms(&mut self, iteration: usize, rms_open: f64, rms_closed: f64) -> Result<()> {
        if let Some(file) = self.rms.as_mut() {
            writeln!(file, "{iteration} {rms_open:e} {rms_closed:e}")?;
        }
        Ok(())
    }
    pub fn write_amplitudes(&mut self, command: &ModalCommand) -> Result<()> {
        if let Some(file) = self.amplitudes.as_mut() {
            write!(file, "{}>", command.iteration)?;
            for a in &command.amplitudes {
                write!(file, " {a:e}")?;
            }
            writeln!(file)?;
        }
        Ok(())
    }
    pub fn flush(&mut self) -> Result<()> {
        for file in self.rms.iter_mut().chain(self.amplitudes.iter_mut()) {
            file.flush()?;
        }
        Ok(())
    }
}
impl Drop for DiagnosticStreams {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to flush the diagnostic streams: {e}");
        }
    }
}

/// Rolling phase and amplitude cubes
///
/// Every `n_per_file` wavefronts are written to `<base>_phase_<#####>` and `<base>_amp_<#####>`.
pub struct WavefrontRecorder {
    store: Arc<dyn ImageStore>,
    base: PathBuf,
    n_per_file: usize,
    phase: Vec<DMatrix<f64>>,
    amplitude: Vec<DMatrix<f64>>,
    n_file: usize,
}
impl WavefrontRecorder {
    pub fn new<P: AsRef<Path>>(store: Arc<dyn ImageStore>, base: P, n_per_file: usize) -> Self {
        Self {
            store,
            base: base.as_ref().to_path_buf(),
            n_per_file: n_per_file.max(1),
            phase: vec![],
            amplitude: vec![],
            n_file: 0,
        }
    }
    fn path(&self, kind: &str) -> PathBuf {
        let stem = format!("{}_{kind}_{:05}", self.base.display(), self.n_file);
        PathBuf::from(self.store.file_name(&stem))
    }
    pub fn record(&mut self, wf: &Wavefront) -> Result<()> {
        self.phase.push(wf.phase.clone());
        self.amplitude.push(wf.amplitude.clone());
        if self.phase.len() >= self.n_per_file {
            self.flush()?;
        }
        Ok(())
    }
    /// Writes the wavefronts recorded since the last file
    pub fn flush(&mut self) -> Result<()> {
        if self.phase.is_empty() {
            return Ok(());
        }
        self.store
            .write(&self.path("phase"), &Image::from_planes(&self.phase))?;
        self.store
            .write(&self.path("amp"), &Image::from_planes(&self.amplitude))?;
        log::debug!("wavefront file #{} written", self.n_file);
        self.phase.clear();
        self.amplitude.clear();
        self.n_file += 1;
        Ok(())
    }
}
impl Drop for WavefrontRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("failed to write the last wavefront file: {e}");
        }
    }
}

/// Focal plane images
///
/// Images are summed into `<base>_psf` and `<base>_coron` and, optionally, written
/// `n_per_file` at a time to `<base>_psf_<#>` and `<base>_coron_<#>`.
/// Only the iterations after `save_frame_start` are recorded.
pub struct PsfRecorder {
    store: Arc<dyn ImageStore>,
    base: PathBuf,
    n_per_file: usize,
    save_frame_start: usize,
    individual_frames: bool,
    psfs: Vec<DMatrix<f64>>,
    corons: Vec<DMatrix<f64>>,
    psf_sum: Option<DMatrix<f64>>,
    coron_sum: Option<DMatrix<f64>>,
    n_sum: usize,
    n_file: usize,
    finished: bool,
}
impl PsfRecorder {
    pub fn new<P: AsRef<Path>>(store: Arc<dyn ImageStore>, base: P, n_per_file: usize) -> Self {
        Self {
            store,
            base: base.as_ref().to_path_buf(),
            n_per_file: n_per_file.max(1),
            save_frame_start: 0,
            individual_frames: true,
            psfs: vec![],
            corons: vec![],
            psf_sum: None,
            coron_sum: None,
            n_sum: 0,
            n_file: 0,
            finished: false,
        }
    }
    pub fn save_frame_start(mut self, save_frame_start: usize) -> Self {
        self.save_frame_start = save_frame_start;
        self
    }
    /// Writes the individual frames or only the sums
    pub fn individual_frames(mut self, individual_frames: bool) -> Self {
        self.individual_frames = individual_frames;
        self
    }
    fn path(&self, stem: String) -> PathBuf {
        PathBuf::from(self.store.file_name(&stem))
    }
    /// Returns true if iteration #`iteration` is to be recorded
    pub fn is_recording(&self, iteration: usize) -> bool {
        iteration > self.save_frame_start
    }
    /// Number of frames summed so far
    pub fn n_sum(&self) -> usize {
        self.n_sum
    }
    pub fn psf_sum(&self) -> Option<&DMatrix<f64>> {
        self.psf_sum.as_ref()
    }
    pub fn coron_sum(&self) -> Option<&DMatrix<f64>> {
        self.coron_sum.as_ref()
    }
    /// Adds the PSF and, if any, the coronagraphic image of iteration #`iteration`
    pub fn record(
        &mut self,
        iteration: usize,
        psf: DMatrix<f64>,
        coron: Option<DMatrix<f64>>,
    ) -> Result<()> {
        if !self.is_recording(iteration) {
            return Ok(());
        }
        check_shape(&self.psf_sum, &psf)?;
        if let Some(coron) = &coron {
            check_shape(&self.coron_sum, coron)?;
        }
        self.finished = false;
        accumulate(&mut self.psf_sum, &psf);
        if let Some(coron) = &coron {
            accumulate(&mut self.coron_sum, coron);
        }
        self.n_sum += 1;
        if self.individual_frames {
            self.psfs.push(psf);
            self.corons.extend(coron);
            if self.psfs.len() >= self.n_per_file {
                self.flush()?;
            }
        }
        Ok(())
    }
    /// Writes the individual frames recorded since the last file
    pub fn flush(&mut self) -> Result<()> {
        if self.psfs.is_empty() {
            return Ok(());
        }
        let base = self.base.display().to_string();
        self.store.write(
            &self.path(format!("{base}_psf_{}", self.n_file)),
            &Image::from_planes(&self.psfs),
        )?;
        if !self.corons.is_empty() {
            self.store.write(
                &self.path(format!("{base}_coron_{}", self.n_file)),
                &Image::from_planes(&self.corons),
            )?;
        }
        self.psfs.clear();
        self.corons.clear();
        self.n_file += 1;
        Ok(())
    }
    /// Writes the remaining individual frames and the summed images
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.flush()?;
        let base = self.base.display().to_string();
        if let Some(psf) = &self.psf_sum {
            self.store.write(
                &self.path(format!("{base}_psf")),
                &Image::from_matrix(psf).header("NFRAMES", self.n_sum),
            )?;
        }
        if let Some(coron) = &self.coron_sum {
            self.store.write(
                &self.path(format!("{base}_coron")),
                &Image::from_matrix(coron).header("NFRAMES", self.n_sum),
            )?;
        }
        log::info!("{} PSFs summed into {base}_psf", self.n_sum);
        Ok(())
    }
}
impl Drop for PsfRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("failed to write the PSF files: {e}");
        }
    }
}

/// Images summed together must all have the same shape
fn check_shape(sum: &Option<DMatrix<f64>>, image: &DMatrix<f64>) -> Result<()> {
    match sum {
        Some(sum) if sum.shape() != image.shape() => Err(Error::Shape {
            what: "focal plane image",
            expected: sum.shape(),
            found: image.shape(),
        }),
        _ => Ok(()),
    }
}

fn accumulate(sum: &mut Option<DMatrix<f64>>, image: &DMatrix<f64>) {
    match sum {
        Some(sum) => *sum += image,
        None => *sum = Some(image.clone()),
    }
}
