//! # Run configuration
//!
//! Runs are described by one row of a simulation parameters CSV file, selected with
//! the `AOSIM_JOB_INDEX` environment variable, and by a layer profile CSV file with one
//! row per turbulent layer.
//! Both files are read from the `DATA_REPO` directory.

use std::{
    env,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{atmosphere::LayerParameters, Error, Result};

/// Data directory environment variable
pub const DATA_REPO: &str = "DATA_REPO";
/// Job index environment variable
pub const JOB_INDEX: &str = "AOSIM_JOB_INDEX";

/// Returns the data directory, the current directory if `DATA_REPO` is not set
pub fn data_repo() -> PathBuf {
    env::var(DATA_REPO).map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

/// Returns the job index, 0 if `AOSIM_JOB_INDEX` is not set
pub fn job_index() -> Result<usize> {
    match env::var(JOB_INDEX) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::Config(format!("invalid {JOB_INDEX}: {value:?}"))),
        Err(_) => Ok(0),
    }
}

/// Simulation parameters
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SimulationParameters {
    pub index: usize,
    #[serde(rename = "D[m]")]
    pub diameter: f64,
    #[serde(rename = "obscuration")]
    pub obscuration: f64,
    #[serde(rename = "wf size[px]")]
    pub wf_size: usize,
    #[serde(rename = "border[px]")]
    pub border: usize,
    #[serde(rename = "lambda0[m]")]
    pub lambda0: f64,
    #[serde(rename = "lambda[m]")]
    pub lambda: f64,
    #[serde(rename = "time step[s]")]
    pub time_step: f64,
    pub frames: usize,
    #[serde(rename = "command delay")]
    pub command_delay: usize,
    #[serde(rename = "loop closed delay")]
    pub loop_closed_delay: usize,
    pub integration: usize,
    pub readout: usize,
    pub gain: f64,
    #[serde(rename = "max frequency")]
    pub max_frequency: usize,
    #[serde(rename = "F0[photons]")]
    pub f0_photons: f64,
    #[serde(rename = "magnitude")]
    pub star_mag: f64,
    #[serde(rename = "sub piston")]
    pub sub_piston: bool,
    #[serde(rename = "sub tip-tilt")]
    pub sub_tip_tilt: bool,
    pub seed: Option<u64>,
}
impl SimulationParameters {
    /// Loads row #`job_index` from the CSV file `path`
    pub fn from_csv<P: AsRef<Path>>(path: P, job_index: usize) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path.as_ref())?;
        rdr.deserialize()
            .nth(job_index)
            .ok_or_else(|| {
                Error::Config(format!(
                    "no simulation parameters #{job_index} in {:?}",
                    path.as_ref()
                ))
            })?
            .map_err(Error::from)
    }
}

/// Turbulent layer description
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LayerProfile {
    #[serde(rename = "screen size[px]")]
    pub screen_size: usize,
    #[serde(rename = "r0[m]")]
    pub r0: f64,
    #[serde(rename = "L0[m]")]
    pub outer_scale: f64,
    #[serde(rename = "l0[m]")]
    pub inner_scale: f64,
    #[serde(rename = "Cn2")]
    pub cn2: f64,
    #[serde(rename = "z[m]")]
    pub altitude: f64,
    #[serde(rename = "wind[m/s]")]
    pub wind_speed: f64,
    #[serde(rename = "direction[deg]")]
    pub wind_direction: f64,
}
impl LayerProfile {
    /// Loads the layers from the CSV file `path`, converting the wind directions to radians
    pub fn load<P: AsRef<Path>>(path: P) -> Result<LayerParameters> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut layers = LayerParameters::default();
        for row in rdr.deserialize() {
            let layer: LayerProfile = row?;
            layers.screen_size.push(layer.screen_size);
            layers.r0.push(layer.r0);
            layers.outer_scale.push(layer.outer_scale);
            layers.inner_scale.push(layer.inner_scale);
            layers.cn2.push(layer.cn2);
            layers.altitude.push(layer.altitude);
            layers.wind_speed.push(layer.wind_speed);
            layers.wind_direction.push(layer.wind_direction.to_radians());
        }
        Ok(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn simulation_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aosim.csv");
        fs::write(
            &path,
            "index,D[m],obscuration,wf size[px],border[px],lambda0[m],lambda[m],time step[s],frames,command delay,loop closed delay,integration,readout,gain,max frequency,F0[photons],magnitude,sub piston,sub tip-tilt,seed
0,6.5,0.1,64,4,5e-7,8e-7,0.001,100,1,0,1,0,0.5,8,1e10,5,true,false,
1,8,0.14,128,4,5e-7,1.6e-6,0.0005,2000,2,10,1,1,0.3,12,1e10,8,true,true,42
",
        )
        .unwrap();
        let p = SimulationParameters::from_csv(&path, 1).unwrap();
        assert_eq!(p.index, 1);
        assert_eq!(p.wf_size, 128);
        assert_eq!(p.seed, Some(42));
        assert!(p.sub_tip_tilt);
        assert_eq!(SimulationParameters::from_csv(&path, 0).unwrap().seed, None);
        assert!(matches!(
            SimulationParameters::from_csv(&path, 2),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn layer_profile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layers.csv");
        fs::write(
            &path,
            "screen size[px],r0[m],L0[m],l0[m],Cn2,z[m],wind[m/s],direction[deg]
512,0.15,25,0,0.6,0,10,90
512,0.15,25,0,0.4,5000,20,180
",
        )
        .unwrap();
        let layers = LayerProfile::load(&path).unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers.cn2, vec![0.6, 0.4]);
        assert!((layers.wind_direction[1] - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(layers.properties().unwrap().len(), 2);
    }
}
