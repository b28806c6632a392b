//! # Image files
//!
//! Phase screens, pupils, response matrices and output cubes are exchanged as [Image]s
//! through an [ImageStore]; [BincodeStore] and [PickleStore] are the two file formats
//! provided here.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufRead, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A cube of `planes` column-major `rows x cols` images with a key/value header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub rows: usize,
    pub cols: usize,
    pub planes: usize,
    pub data: Vec<f64>,
    pub header: BTreeMap<String, String>,
}
impl Image {
    /// Single plane image
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Self {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
            planes: 1,
            data: matrix.as_slice().to_vec(),
            header: BTreeMap::new(),
        }
    }
    /// Cube from a stack of equally sized planes
    pub fn from_planes(planes: &[DMatrix<f64>]) -> Self {
        let (rows, cols) = planes.first().map_or((0, 0), |p| p.shape());
        Self {
            rows,
            cols,
            planes: planes.len(),
            data: planes
                .iter()
                .flat_map(|p| p.as_slice().iter().cloned())
                .collect(),
            header: BTreeMap::new(),
        }
    }
    /// Adds a header entry
    pub fn header(mut self, key: &str, value: impl ToString) -> Self {
        self.header.insert(key.to_string(), value.to_string());
        self
    }
    /// Parses a header entry
    pub fn header_value<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        self.header
            .get(key)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::Header(key.to_string()))
    }
    /// Returns plane #`i`
    pub fn plane(&self, i: usize) -> Result<DMatrix<f64>> {
        if i >= self.planes {
            return Err(Error::Config(format!(
                "plane #{i} requested from a {} planes image",
                self.planes
            )));
        }
        let n = self.rows * self.cols;
        let expected = n.checked_mul(self.planes).unwrap_or(usize::MAX);
        if self.data.len() != expected {
            return Err(Error::Shape {
                what: "image data",
                expected: (expected, 1),
                found: (self.data.len(), 1),
            });
        }
        Ok(DMatrix::from_column_slice(
            self.rows,
            self.cols,
            &self.data[i * n..(i + 1) * n],
        ))
    }
    pub fn into_planes(self) -> Result<Vec<DMatrix<f64>>> {
        (0..self.planes).map(|i| self.plane(i)).collect()
    }
}

/// External image-file format
pub trait ImageStore: Send + Sync {
    /// File extension, without the dot
    fn extension(&self) -> &str;
    fn read(&self, path: &Path) -> Result<Image>;
    fn write(&self, path: &Path, image: &Image) -> Result<()>;
    /// Appends the store extension to a file stem
    fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.extension())
    }
}

/// Images serialized with [bincode]
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeStore;
impl ImageStore for BincodeStore {
    fn extension(&self) -> &str {
        "bin"
    }
    fn read(&self, path: &Path) -> Result<Image> {
        let file = File::open(path)?;
        bincode::deserialize_from(BufReader::new(file))
            .map_err(|e| Error::Bincode(e, path.to_path_buf()))
    }
    fn write(&self, path: &Path, image: &Image) -> Result<()> {
        let file = File::create(path)?;
        bincode::serialize_into(BufWriter::new(file), image)
            .map_err(|e| Error::Bincode(e, path.to_path_buf()))
    }
}

/// Images serialized with [serde_pickle]
#[derive(Debug, Default, Clone, Copy)]
pub struct PickleStore;
impl ImageStore for PickleStore {
    fn extension(&self) -> &str {
        "pkl"
    }
    fn read(&self, path: &Path) -> Result<Image> {
        let file = File::open(path)?;
        serde_pickle::from_reader(BufReader::new(file), Default::default())
            .map_err(|e| Error::Pickle(e, path.to_path_buf()))
    }
    fn write(&self, path: &Path, image: &Image) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        serde_pickle::to_writer(&mut file, image, Default::default())
            .map_err(|e| Error::Pickle(e, path.to_path_buf()))
    }
}

/// Per-file calibration scales
///
/// Read from a two-column text file: `<file name> <scale>`, `#` starts a comment
#[derive(Debug, Clone, Default)]
pub struct ScaleTable {
    path: PathBuf,
    scales: BTreeMap<String, f64>,
}
impl ScaleTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut scales = BTreeMap::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut columns = line.split_whitespace();
            match (columns.next(), columns.next().map(str::parse::<f64>)) {
                (Some(name), Some(Ok(scale))) => {
                    scales.insert(name.to_string(), scale);
                }
                _ => {
                    return Err(Error::Config(format!(
                        "invalid scale entry {line:?} in {path:?}"
                    )))
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            scales,
        })
    }
    pub fn len(&self) -> usize {
        self.scales.len()
    }
    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
    /// Returns the scale of the file with the same base name as `file`
    ///
    /// A missing entry is a data-consistency error: no default scale is ever substituted
    pub fn scale_for(&self, file: impl AsRef<Path>) -> Result<f64> {
        let name = file
            .as_ref()
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.scales
            .get(&name)
            .copied()
            .ok_or_else(|| Error::MissingScale {
                file: name,
                table: self.path.clone(),
            })
    }
}
