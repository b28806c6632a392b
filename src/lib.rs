//! # Adaptive optics closed-loop simulation
//!
//! Frozen-flow turbulence, a direct modal reconstructor and the
//! sensor/reconstructor/filter/mirror control loop with command latency.

use std::{collections::TryReserveError, path::PathBuf};

mod wavefront;
pub use wavefront::{DetectorImage, ModalCommand, Pupil, Wavefront};

pub mod fft;
pub mod screen;

mod layer;
pub use layer::{Layer, LayerProperties};

pub mod atmosphere;
#[doc(no_inline)]
pub use atmosphere::{Atmosphere, LayerParameters, TurbulenceSequence};

pub mod reconstructor;
#[doc(no_inline)]
pub use reconstructor::{DirectPhaseReconstructor, Reconstructor};

mod delay_line;
pub use delay_line::DelayLine;

pub mod control;
pub mod dm;
pub mod imaging;
pub mod io;
pub mod output;
pub mod wfs;

pub mod system;
#[doc(no_inline)]
pub use system::{AoSystem, IterationReport};

pub mod config;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("size of {name} ({found}) does not match the number of layers ({expected})")]
    LayerParameter {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the pupil mask has no illuminated pixel")]
    EmptyPupil,
    #[error("{what} is {found:?}, expected {expected:?}")]
    Shape {
        what: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("mode #{0} is out of range ({1} modes)")]
    ModeIndex(usize, usize),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to allocate {0} samples")]
    Allocation(usize, #[source] TryReserveError),
    #[error("no calibration scale for {file:?} in {table:?}")]
    MissingScale { file: String, table: PathBuf },
    #[error("missing or invalid header key {0:?}")]
    Header(String),
    #[error("failed to (de)serialize {1:?}")]
    Bincode(#[source] bincode::Error, PathBuf),
    #[error("failed to (de)serialize {1:?}")]
    Pickle(#[source] serde_pickle::Error, PathBuf),
    #[error("failed to parse CSV parameters")]
    Csv(#[from] csv::Error),
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Allocates a zero-filled `rows x cols` matrix, reporting allocation failures
pub(crate) fn try_zeros(rows: usize, cols: usize) -> Result<nalgebra::DMatrix<f64>> {
    let n = rows * cols;
    let mut data: Vec<f64> = Vec::new();
    data.try_reserve_exact(n)
        .map_err(|e| Error::Allocation(n, e))?;
    data.resize(n, 0f64);
    Ok(nalgebra::DMatrix::from_vec(rows, cols, data))
}
