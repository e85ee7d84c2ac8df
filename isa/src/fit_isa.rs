use crate::isa_common::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde_json::json;

const DC_MIXTURE_COMPONENTS: usize = 20;
const DC_EM_ITER: usize = 100;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Data file, one patch per column (`.tsv` or `.tsv.gz`)
    #[arg(required = true)]
    data_file: Box<str>,

    /// Output template of the final experiment record; `{0}` becomes a
    /// time stamp, `{1}` a save counter
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// Checkpoint template saved after every update; `{phase}` and
    /// `{iter}` are filled in
    #[arg(long)]
    checkpoint: Option<Box<str>>,

    /// Hidden units per visible unit
    #[arg(long, default_value_t = 2)]
    overcompleteness: usize,

    /// Size of every subspace
    #[arg(long, short = 's', default_value_t = 1)]
    subspace_size: usize,

    /// Scales per Gaussian scale mixture
    #[arg(long, default_value_t = 10)]
    num_scales: usize,

    /// Model Gaussian observation noise
    #[arg(long, default_value_t = false)]
    noise: bool,

    /// Training iterations on the subset
    #[arg(long, default_value_t = 100)]
    max_iter: usize,

    /// Fine-tuning iterations on all the data
    #[arg(long, default_value_t = 50)]
    max_iter_ft: usize,

    /// L-BFGS iterations per M-step
    #[arg(long, default_value_t = 50)]
    max_fun: usize,

    /// Data points used before fine-tuning
    #[arg(long, default_value_t = 20000)]
    num_train: usize,

    /// Keep the source marginals fixed
    #[arg(long, default_value_t = false)]
    fix_prior: bool,

    /// Initialize the basis by sparse coding
    #[arg(long, default_value_t = false)]
    sparse_coding: bool,

    /// Merge dependent subspaces after training, at most this many pairs
    #[arg(long, default_value_t = 0)]
    max_merge: usize,

    /// Data are already log-transformed, centred and white
    #[arg(long, default_value_t = false)]
    skip_preprocess: bool,

    /// Standard deviation of noise added during preprocessing
    #[arg(long)]
    noise_level: Option<f64>,

    /// Model all pixels with the ISA, even for square patches
    #[arg(long, default_value_t = false)]
    no_dct: bool,

    /// Maximum number of threads (0 = all)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Random seed
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

/// Everything around the ISA: an optional DCT with a mixture of
/// Gaussians on the DC component, and the whitening of the rest
struct Pipeline {
    dct: Option<(LinearTransform, MoGaussian)>,
    whitening: WhiteningTransform,
}

impl Pipeline {
    /// Fit the fixed parts and return the data as the ISA sees it
    fn fit(data: &Mat, use_dct: bool) -> anyhow::Result<(Self, Mat)> {
        let patch_size = if use_dct {
            square_patch_size(data.nrows())
        } else {
            None
        };

        let (dct, rest) = match patch_size {
            Some(patch_size) => {
                let dct = LinearTransform::dct(patch_size);
                let coeffs = dct.apply(data)?;

                let mut mog = MoGaussian::new(DC_MIXTURE_COMPONENTS);
                let dc = coeffs.rows(0, 1).into_owned();
                mog.initialize(&dc)?;
                let iters = mog.train_em(&dc, DC_EM_ITER)?;
                info!("DC mixture of Gaussians: {} EM iterations", iters);

                let ac = coeffs.rows(1, coeffs.nrows() - 1).into_owned();
                (Some((dct, mog)), ac)
            }
            None => (None, data.clone()),
        };

        let whitening = WhiteningTransform::from_data(&rest, WhiteningKind::Symmetric)?;
        let white = whitening.apply(&rest)?;
        Ok((Self { dct, whitening }, white))
    }

    /// The full density model around a snapshot of `isa`
    fn assemble(&self, isa: &Isa) -> anyhow::Result<StackedModel<AnyModel>> {
        let whitened = StackedModel::new(
            vec![self.whitening.clone().into()],
            AnyModel::from(isa.clone()),
        );
        Ok(match &self.dct {
            Some((dct, mog)) => {
                let concat = ConcatModel::new(vec![mog.clone().into(), whitened.into()])?;
                StackedModel::new(vec![dct.clone().into()], concat.into())
            }
            None => whitened,
        })
    }
}

pub fn fit_isa(args: &TrainArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);
    init_thread_pool(args.threads)?;

    // 1. data
    let raw = Mat::from_tsv(&args.data_file, None)?;
    info!("read {} x {} data", raw.nrows(), raw.ncols());

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let data = if args.skip_preprocess {
        raw
    } else {
        preprocess::preprocess(&raw, args.noise_level, true, &mut rng)?
    };

    // 2. DCT and whitening
    let (pipeline, white) = Pipeline::fit(&data, !args.no_dct)?;
    let nv = white.nrows();
    let nh = (data.nrows() * args.overcompleteness).saturating_sub(data.nrows() - nv);

    // 3. model
    let config = IsaConfig {
        subspace_size: args.subspace_size,
        num_scales: args.num_scales,
        noise: args.noise,
        ..IsaConfig::new(nv, nh)
    };
    let options = IsaOptions {
        max_threads: args.threads,
        seed: args.seed,
        verbose: args.verbose,
    };
    let mut isa = Isa::from_config(&config, options)?;
    let nf = isa.num_feature_subspaces();
    for gsm in isa.subspaces_mut()[..nf].iter_mut() {
        gsm.gamma = 1e-2;
        gsm.alpha = 2.0;
        gsm.beta = 1.0;
    }
    isa.initialize(Some(&white), GsmInit::Laplace)?;
    info!(
        "{} x {} ISA with {} subspaces",
        isa.num_visibles(),
        isa.num_hiddens(),
        isa.subspaces().len()
    );

    let mut record = ExperimentRecord::new();
    record.set(
        "parameters",
        &json!({
            "data_file": args.data_file.to_string(),
            "overcompleteness": args.overcompleteness,
            "subspace_size": args.subspace_size,
            "num_scales": args.num_scales,
            "noise": args.noise,
            "max_iter": args.max_iter,
            "max_iter_ft": args.max_iter_ft,
            "train_prior": !args.fix_prior,
            "sparse_coding": args.sparse_coding,
            "seed": args.seed,
        }),
    )?;
    record.set("model", &pipeline.assemble(&isa)?)?;

    let checkpoint = args.checkpoint.clone();
    let mut save_checkpoint =
        |kind: TrainMethodKind, model: &Isa, iteration: usize| -> anyhow::Result<()> {
            let Some(template) = checkpoint.as_deref() else {
                return Ok(());
            };
            record.set("model", &pipeline.assemble(model)?)?;
            let path = template
                .replace("{phase}", &format!("{:?}", kind).to_lowercase())
                .replace("{iter}", &iteration.to_string());
            record.save(&path)?;
            Ok(())
        };

    // 4. training on a subset
    let subset = column_range(&white, 0, args.num_train)?;
    if args.sparse_coding {
        let method = TrainMethod::Of(OfParams {
            max_iter: args.max_iter,
            noise_var: 0.1,
            sigma: 1.0,
            ..Default::default()
        });
        isa.train(&subset, &method, Some(&mut save_checkpoint))?;
        isa.orthogonalize()?;
    } else {
        let method = TrainMethod::Lbfgs(LbfgsParams {
            max_iter: args.max_iter,
            max_fun: args.max_fun,
            train_prior: !args.fix_prior,
            gibbs: GibbsOptions { num_steps: 2 },
            ..Default::default()
        });
        let mut session = warm_session(&isa, &subset, 10, &mut rng)?;
        isa.train_with_session(&subset, &method, &mut session, Some(&mut save_checkpoint))?;
    }

    // 5. fine-tuning on all the data without regularization
    let nf = isa.num_feature_subspaces();
    for gsm in isa.subspaces_mut()[..nf].iter_mut() {
        gsm.gamma = 0.0;
    }
    let method = TrainMethod::Lbfgs(LbfgsParams {
        max_iter: args.max_iter_ft,
        max_fun: args.max_fun,
        train_prior: !args.fix_prior,
        gibbs: GibbsOptions { num_steps: 5 },
        ..Default::default()
    });
    let init_steps = if args.sparse_coding || args.fix_prior {
        10
    } else {
        50
    };
    let mut session = warm_session(&isa, &white, init_steps, &mut rng)?;
    let report =
        isa.train_with_session(&white, &method, &mut session, Some(&mut save_checkpoint))?;

    // 6. optional subspace merging
    if args.max_merge > 0 {
        let hidden = session
            .chains
            .take()
            .ok_or(anyhow::anyhow!("no hidden states to merge subspaces with"))?;
        let merged = isa.train_subspaces(&hidden, args.max_merge)?;
        info!(
            "{} merges, {} subspaces left",
            merged.num_merges,
            isa.subspaces().len()
        );
    }

    record.set("trace", &report.trace)?;
    record.set("model", &pipeline.assemble(&isa)?)?;
    record.save(&args.out)?;

    Ok(())
}

/// A session whose persistent chains already ran `num_steps` Gibbs sweeps
fn warm_session(
    isa: &Isa,
    data: &Mat,
    num_steps: usize,
    rng: &mut SmallRng,
) -> anyhow::Result<TrainingSession> {
    let mut session = TrainingSession::new();
    session.chains = Some(isa.sample_posterior(data, None, &GibbsOptions { num_steps }, rng)?);
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use matrix_util::traits::SampleOps;

    #[test]
    fn square_patches_get_a_dc_mixture() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(3);
        let data = Mat::rnorm_with(4, 300, &mut rng);

        let (pipeline, white) = Pipeline::fit(&data, true)?;
        assert_eq!(white.nrows(), 3);
        assert!(pipeline.dct.is_some());

        let mut isa = Isa::new(3, 3)?;
        isa.initialize(Some(&white), GsmInit::Laplace)?;
        let model = pipeline.assemble(&isa)?;
        assert_eq!(model.dim(), 4);

        let (_, mog) = pipeline.dct.as_ref().ok_or(anyhow::anyhow!("no DCT"))?;
        let coeffs = LinearTransform::dct(2).apply(&data)?;
        let expected = mog.logdensity(&coeffs.rows(0, 1).into_owned())?
            + pipeline.whitening.logjacobian(&coeffs.rows(1, 3).into_owned())?
            + isa.loglikelihood(&white, &isa.eval_options)?;
        assert_abs_diff_eq!(model.loglikelihood(&data, &mut rng)?, expected, epsilon = 1e-8);
        Ok(())
    }

    #[test]
    fn other_dimensions_are_only_whitened() -> anyhow::Result<()> {
        let mut rng = SmallRng::seed_from_u64(4);
        let data = Mat::rnorm_with(3, 100, &mut rng);
        let (pipeline, white) = Pipeline::fit(&data, true)?;
        assert!(pipeline.dct.is_none());
        assert_eq!(white.nrows(), 3);
        Ok(())
    }
}
