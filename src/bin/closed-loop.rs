use aosim::{
    config::{data_repo, job_index, LayerProfile, SimulationParameters},
    control::Integrate,
    dm::{DeformableMirror, ModalDm},
    imaging::IdealCoronagraph,
    io::{BincodeStore, ImageStore},
    output::PsfRecorder,
    screen::LowOrderNotch,
    wfs::{IdealPhaseSensor, WavefrontSensor},
    AoSystem, Atmosphere, DirectPhaseReconstructor, Pupil,
};
use chrono::prelude::*;
use serde::Serialize;
use skyangle::Conversion;
use std::{
    fs::{create_dir_all, File},
    sync::Arc,
};

/// Wavefront errors of the run
#[derive(Serialize, Debug, Default)]
struct Wfe {
    iteration: Vec<usize>,
    #[serde(rename = "open-loop[rad]")]
    open_loop: Vec<f64>,
    #[serde(rename = "closed-loop[rad]")]
    closed_loop: Vec<f64>,
}

const PSF_PER_FILE: usize = 100;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let data_repo = data_repo();
    let job_idx = job_index()?;
    let params = SimulationParameters::from_csv(data_repo.join("aosim.csv"), job_idx)?;
    println!("Simulation parameters:");
    println!("{:#?}", params);
    let layers = LayerProfile::load(data_repo.join("layers.csv"))?;

    let local: DateTime<Local> = Local::now();
    let data_path = data_repo
        .join(format!("closed-loop_{:04}", params.index))
        .join(local.format("%Y%m%dT%H%M%S").to_string());
    create_dir_all(&data_path)?;
    println!("Data repository: {:?}", &data_path);

    log::info!(
        "λ/D: {:.1}mas, frames: {}, sampling: {:.0}Hz",
        (params.lambda / params.diameter).to_mas(),
        params.frames,
        params.time_step.recip()
    );

    let pupil = Pupil::circular(params.wf_size, params.diameter, params.obscuration)?;

    let mut atmosphere = Atmosphere::builder(params.diameter, params.wf_size, params.border)
        .wavelengths(params.lambda0, params.lambda)
        .notch(LowOrderNotch {
            piston: params.sub_piston,
            tip_tilt: params.sub_tip_tilt,
        })
        .layers(layers)
        .time_step(params.time_step)
        .frames(params.frames)
        .f0_photons(params.f0_photons)
        .star_mag(params.star_mag)
        .data_dir(data_repo.join("screens"));
    if let Some(seed) = params.seed {
        atmosphere = atmosphere.seed(seed);
    }
    let atmosphere = atmosphere.build()?;

    let mut wfs = IdealPhaseSensor::new(params.wf_size, params.lambda);
    if let Some(seed) = params.seed {
        wfs = wfs.seed(seed);
    }
    wfs.set_integration(params.integration);
    wfs.set_readout(params.readout);

    let dm = ModalDm::fourier(&pupil, params.max_frequency)?;
    let recon = DirectPhaseReconstructor::new(&pupil, dm.modes())?;
    let filter = Integrate::new(params.gain, dm.n_modes());

    let store: Arc<dyn ImageStore> = Arc::new(BincodeStore);
    let coronagraph = IdealCoronagraph::new(&pupil, 2 * params.wf_size, params.wf_size);
    let psf_recorder = PsfRecorder::new(store.clone(), data_path.join("aosim"), PSF_PER_FILE)
        .save_frame_start(params.loop_closed_delay)
        .individual_frames(false);

    let mut system = AoSystem::builder(pupil)
        .command_delay(params.command_delay)
        .loop_closed_delay(params.loop_closed_delay)
        .store(store.clone())
        .scoring_mask_file(data_repo.join(store.file_name("scoring_mask")))
        .coronagraph(coronagraph)
        .psf_recorder(psf_recorder)
        .rms_file(data_path.join("rms.txt"))
        .amp_file(data_path.join("amp.txt"))
        .build(atmosphere, wfs, recon, filter, dm)?;

    let reports = system.run_turbulence()?;

    let wfe = reports.iter().fold(Wfe::default(), |mut wfe, report| {
        wfe.iteration.push(report.iteration);
        wfe.open_loop.push(report.rms_open);
        wfe.closed_loop.push(report.rms_closed);
        wfe
    });
    serde_pickle::to_writer(
        &mut File::create(data_path.join("wfe.pkl"))?,
        &wfe,
        Default::default(),
    )?;

    Ok(())
}
