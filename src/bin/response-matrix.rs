use aosim::{
    config::{data_repo, job_index, SimulationParameters},
    control::Identity,
    dm::ModalDm,
    io::{BincodeStore, ImageStore},
    reconstructor::CAL_AMP,
    wfs::IdealPhaseSensor,
    AoSystem, Atmosphere, DirectPhaseReconstructor, Pupil,
};
use std::{env, fs::create_dir_all, sync::Arc};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let data_repo = data_repo();
    let job_idx = job_index()?;
    let params = SimulationParameters::from_csv(data_repo.join("aosim.csv"), job_idx)?;
    println!("Simulation parameters:");
    println!("{:#?}", params);

    let cal_amp = env::var("CAL_AMP").map_or(Ok(CAL_AMP), |amp| amp.parse::<f64>())?;
    let n_modes_cutoff = env::var("N_MODES_CUTOFF")
        .ok()
        .map(|n| n.parse::<usize>())
        .transpose()?;

    let data_path = data_repo.join(format!("response-matrix_{:04}", params.index));
    create_dir_all(&data_path)?;
    println!("Data repository: {:?}", &data_path);

    let pupil = Pupil::circular(params.wf_size, params.diameter, params.obscuration)?;
    // no turbulence during the calibration
    let atmosphere = Atmosphere::builder(params.diameter, params.wf_size, params.border).build()?;
    let wfs = IdealPhaseSensor::new(params.wf_size, params.lambda);
    let dm = ModalDm::fourier(&pupil, params.max_frequency)?;
    let recon = DirectPhaseReconstructor::new(&pupil, dm.modes())?;

    let store: Arc<dyn ImageStore> = Arc::new(BincodeStore);
    let mut system = AoSystem::builder(pupil)
        .store(store.clone())
        .build(atmosphere, wfs, recon, Identity, dm)?;

    let rmat_path = data_path.join(store.file_name("rmat"));
    let rimages_path = data_path.join(store.file_name("rimages"));
    system.take_response_matrix(
        cal_amp,
        n_modes_cutoff,
        Some(&rmat_path),
        Some(&rimages_path),
    )?;

    Ok(())
}
