use isa_model::isa::{AnalyticParams, LbfgsParams, OfParams, SamplingMethod, SgdParams, TrainMethod};
use isa_model::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn model(nv: usize, nh: usize, noise: bool) -> anyhow::Result<Isa> {
    let config = IsaConfig {
        noise,
        ..IsaConfig::new(nv, nh)
    };
    Isa::from_config(&config, IsaOptions::default())
}

fn training_data(nv: usize, nn: usize) -> anyhow::Result<Mat> {
    let mut source = Isa::new(nv, nv)?;
    source.initialize(None, GsmInit::Laplace)?;
    let mut rng = SmallRng::seed_from_u64(99);
    Ok(source.sample(nn, &mut rng))
}

fn single_step_methods(weight_decay: f64) -> Vec<TrainMethod> {
    vec![
        TrainMethod::Sgd(SgdParams {
            max_iter: 1,
            weight_decay,
            ..Default::default()
        }),
        TrainMethod::Sgd(SgdParams {
            max_iter: 1,
            weight_decay,
            sampling_method: SamplingMethod::Map,
            ..Default::default()
        }),
        TrainMethod::Lbfgs(LbfgsParams {
            max_iter: 1,
            max_fun: 1,
            weight_decay,
            ..Default::default()
        }),
        TrainMethod::Of(OfParams {
            max_iter: 1,
            max_fun: 5,
            ..Default::default()
        }),
    ]
}

fn check_one_update(isa: &mut Isa, data: &Mat, method: &TrainMethod) -> anyhow::Result<()> {
    let report = isa.train(data, method, None)?;
    assert_eq!(report.method, method.kind());
    assert_eq!(report.iterations, 1);
    assert!(report.trace.iter().all(|v| v.is_finite()));
    assert_eq!(isa.phase(), Phase::Trained);
    isa.check_invariants()?;
    assert!(isa.basis().iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn every_method_runs_on_a_complete_model() -> anyhow::Result<()> {
    init_logger();
    let data = training_data(2, 300)?;
    for method in single_step_methods(0.0) {
        let mut isa = model(2, 2, false)?;
        isa.initialize(Some(&data), GsmInit::Laplace)?;
        check_one_update(&mut isa, &data, &method)?;
    }
    Ok(())
}

#[test]
fn every_method_runs_on_a_noisy_overcomplete_model() -> anyhow::Result<()> {
    init_logger();
    let data = training_data(2, 300)?;
    let mut methods = single_step_methods(0.01);
    methods.push(TrainMethod::Analytic(AnalyticParams {
        max_iter: 1,
        weight_decay: 0.01,
        ..Default::default()
    }));

    for method in methods {
        let mut isa = model(2, 3, true)?;
        isa.initialize(Some(&data), GsmInit::Laplace)?;
        check_one_update(&mut isa, &data, &method)?;
        let std = isa.noise_std().ok_or(anyhow::anyhow!("noise lost"))?;
        assert!(std > 0.0 && std.is_finite());
    }
    Ok(())
}

#[test]
fn analytic_training_without_noise_only_fits_the_priors() -> anyhow::Result<()> {
    init_logger();
    let data = training_data(2, 100)?;
    let mut isa = model(2, 2, false)?;
    isa.initialize(Some(&data), GsmInit::Laplace)?;
    let basis = isa.basis().clone();

    let method = TrainMethod::Analytic(AnalyticParams {
        max_iter: 1,
        ..Default::default()
    });
    check_one_update(&mut isa, &data, &method)?;
    assert_eq!(isa.basis(), &basis);
    Ok(())
}

#[test]
fn stacked_model_trains_through_the_distribution_interface() -> anyhow::Result<()> {
    init_logger();
    let data = training_data(3, 200)?;
    let white = transforms::WhiteningTransform::from_data(&data, transforms::WhiteningKind::Symmetric)?;

    let mut isa = Isa::new(3, 3)?;
    isa.train_method = TrainMethod::Sgd(SgdParams {
        max_iter: 2,
        batch_size: 50,
        ..Default::default()
    });
    let mut stacked = StackedModel::new(vec![white.into()], isa);
    stacked.initialize(&data)?;
    stacked.train(&data)?;

    assert_eq!(stacked.model.phase(), Phase::Trained);
    let mut rng = SmallRng::seed_from_u64(4);
    let bits = stacked.evaluate(&data, &mut rng)?;
    assert!(bits.is_finite());
    Ok(())
}
