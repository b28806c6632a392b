use aosim::{
    control::{CommandFilter, Identity},
    dm::ModalDm,
    wfs::{IdealPhaseSensor, WavefrontSensor},
    AoSystem, Atmosphere, DetectorImage, DirectPhaseReconstructor, LayerParameters, ModalCommand,
    Pupil, Reconstructor, Wavefront,
};

const N: usize = 16;
const D: f64 = 1.6;
const LAMBDA: f64 = 0.8e-6;

fn atmosphere(cn2: f64, frames: usize) -> Atmosphere {
    Atmosphere::builder(D, N, 2)
        .layers(LayerParameters::uniform(
            64,
            0.15,
            25.,
            0.,
            vec![cn2],
            vec![0.],
            vec![10.],
            vec![0.],
        ))
        .frames(frames)
        .seed(7)
        .build()
        .unwrap()
}

/// Sensor dropping every 3rd frame
struct DroppingSensor(IdealPhaseSensor);
impl WavefrontSensor for DroppingSensor {
    fn lambda(&self) -> f64 {
        self.0.lambda()
    }
    fn det_rows(&self) -> usize {
        self.0.det_rows()
    }
    fn det_cols(&self) -> usize {
        self.0.det_cols()
    }
    fn integration(&self) -> usize {
        self.0.integration()
    }
    fn set_integration(&mut self, integration: usize) {
        self.0.set_integration(integration)
    }
    fn readout(&self) -> usize {
        self.0.readout()
    }
    fn set_readout(&mut self, readout: usize) {
        self.0.set_readout(readout)
    }
    fn no_noise(&self) -> bool {
        self.0.no_noise()
    }
    fn set_no_noise(&mut self, no_noise: bool) {
        self.0.set_no_noise(no_noise)
    }
    fn sense_wavefront(&mut self, wf: &Wavefront) -> bool {
        self.0.sense_wavefront(wf) && wf.iteration % 3 != 2
    }
    fn sense_wavefront_cal(&mut self, wf: &Wavefront) {
        self.0.sense_wavefront_cal(wf)
    }
    fn detector_image(&self) -> &DetectorImage {
        self.0.detector_image()
    }
    fn detector_image_mut(&mut self) -> &mut DetectorImage {
        self.0.detector_image_mut()
    }
}

fn parts(pupil: &Pupil) -> (ModalDm, DirectPhaseReconstructor) {
    let dm = ModalDm::fourier(pupil, 1).unwrap();
    let recon = DirectPhaseReconstructor::new(pupil, dm.modes()).unwrap();
    (dm, recon)
}

#[test]
fn flat_layer_does_not_diverge() {
    let pupil = Pupil::circular(N, D, 0.).unwrap();
    let (dm, recon) = parts(&pupil);
    let mut system = AoSystem::builder(pupil)
        .build(
            atmosphere(0., 20),
            IdealPhaseSensor::new(N, LAMBDA),
            recon,
            Identity,
            dm,
        )
        .unwrap();
    let reports = system.run_turbulence().unwrap();
    assert_eq!(reports.len(), 20);
    for (n, report) in reports.iter().enumerate() {
        assert_eq!(report.iteration, n);
        assert!(report.new_frame);
        assert_eq!(report.applied, Some(n));
        assert!(report.rms_closed <= report.rms_open);
    }
    assert!(system.command().amplitudes.iter().all(|a| *a == 0.));
}

#[test]
fn zero_mean_phase() {
    let pupil = Pupil::circular(N, D, 0.1).unwrap();
    let (dm, recon) = parts(&pupil);
    let mut system = AoSystem::builder(pupil.clone())
        .loop_closed_delay(100)
        .build(
            atmosphere(1., 10),
            IdealPhaseSensor::new(N, LAMBDA),
            recon,
            Identity,
            dm,
        )
        .unwrap();
    let mut wf = Wavefront::new(N);
    for _ in 0..10 {
        let report = system.next_wf(&mut wf).unwrap();
        assert!(report.rms_open > 0.);
        assert!(pupil.mean(&wf.phase).abs() < 1e-12 * report.rms_open.max(1.));
    }
}

#[test]
fn command_latency() {
    let delay = 2;
    let frames = 40;
    let pupil = Pupil::circular(N, D, 0.).unwrap();
    let (dm, recon) = parts(&pupil);
    let mut system = AoSystem::builder(pupil)
        .command_delay(delay)
        .build(
            atmosphere(0., frames),
            DroppingSensor(IdealPhaseSensor::new(N, LAMBDA)),
            recon,
            Identity,
            dm,
        )
        .unwrap();
    assert_eq!(system.delay_line().len(), 15);
    let reports = system.run_turbulence().unwrap();
    for (n, report) in reports.iter().enumerate() {
        assert_eq!(report.new_frame, n % 3 != 2);
        let expected = if n >= delay && (n - delay) % 3 != 2 {
            Some(n - delay)
        } else {
            None
        };
        assert_eq!(report.applied, expected, "iteration #{n}");
    }
    // last command applied at iteration 39, from the measurement of iteration 37
    assert_eq!(system.command().iteration, 39);
}

/// Filter recording the iterations it is called at
#[derive(Default)]
struct Spy {
    n_modes: usize,
    calls: Vec<(usize, usize)>,
}
impl CommandFilter for Spy {
    fn initialize(&mut self, n_modes: usize) {
        self.n_modes = n_modes;
    }
    fn filter_commands(
        &mut self,
        output: &mut ModalCommand,
        input: &ModalCommand,
        iteration: usize,
    ) {
        self.calls.push((iteration, input.iteration));
        output.amplitudes = vec![0.; self.n_modes];
        output.iteration = iteration;
    }
}

#[test]
fn loop_closure() {
    let pupil = Pupil::circular(N, D, 0.).unwrap();
    let (dm, recon) = parts(&pupil);
    let n_modes = recon.n_modes();
    let mut system = AoSystem::builder(pupil)
        .loop_closed_delay(5)
        .command_delay(1)
        .build(
            atmosphere(1., 10),
            IdealPhaseSensor::new(N, LAMBDA),
            recon,
            Spy::default(),
            dm,
        )
        .unwrap();
    assert_eq!(system.filter.n_modes, n_modes);
    let reports = system.run_turbulence().unwrap();
    assert!(reports[..5].iter().all(|r| !r.new_frame));
    assert!(reports[5..].iter().all(|r| r.new_frame));
    assert!(system.is_loop_closed());
    let expected: Vec<_> = (6..10).map(|n| (n, n - 1)).collect();
    assert_eq!(system.filter.calls, expected);
}
