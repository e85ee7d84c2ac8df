use crate::isa_common::*;
use isa_model::isa::loglik_summary;
use matrix_util::dmatrix_util::logmeanexp_columns;
use rand::rngs::SmallRng;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Experiment record holding a trained `model`
    #[arg(required = true)]
    experiment: Box<str>,

    /// Test data file, one patch per column (`.tsv` or `.tsv.gz`)
    #[arg(required = true)]
    data_file: Box<str>,

    /// First data point evaluated
    #[arg(long, default_value_t = 0)]
    from: usize,

    /// One past the last data point evaluated
    #[arg(long, default_value_t = 1000)]
    to: usize,

    /// Annealing runs per data point
    #[arg(long, default_value_t = 300)]
    num_samples: usize,

    /// Intermediate distributions per annealing run
    #[arg(long, default_value_t = 300)]
    num_steps: usize,

    /// Data are already log-transformed, centred and white
    #[arg(long, default_value_t = false)]
    skip_preprocess: bool,

    /// Output template of the evaluation record; `{0}` becomes a time
    /// stamp, `{1}` a save counter
    #[arg(long, short)]
    out: Option<Box<str>>,

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

pub fn evaluate_isa(args: &EvalArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);
    init_thread_pool(args.threads)?;

    let results = ExperimentRecord::load(&args.experiment)?;
    let mut model: StackedModel<AnyModel> = results.get("model")?;

    let likelihood_options = LikelihoodOptions {
        num_samples: args.num_samples,
        num_steps: args.num_steps,
        ..Default::default()
    };
    model.model.for_each_isa_mut(&mut |isa| {
        isa.eval_options = likelihood_options.clone();
        isa.options.max_threads = args.threads;
        isa.options.seed = args.seed;
        isa.options.verbose = args.verbose;
    });

    // preprocessing is deterministic without shuffling
    let raw = Mat::from_tsv(&args.data_file, None)?;
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let data = if args.skip_preprocess {
        raw
    } else {
        preprocess::preprocess(&raw, None, false, &mut rng)?
    };
    let data = column_range(&data, args.from, args.to)?;
    let to = args.from + data.ncols();
    info!(
        "evaluating data points [{}, {}) of dimension {}",
        args.from,
        to,
        data.nrows()
    );

    let model = AnyModel::from(model);
    let weights = model.log_weights(&data, &mut rng)?;
    let loglik = logmeanexp_columns(&weights);
    let summary = loglik_summary(&loglik, data.nrows());
    println!(
        "{:.4} [bit/pixel] +/- {:.4} (SEM)",
        -summary.bits_per_dim, summary.sem
    );

    if let Some(out) = args.out.as_deref() {
        let mut record = ExperimentRecord::new();
        record.set("experiment", &args.experiment.to_string())?;
        record.set("indices", &(args.from..to).collect::<Vec<_>>())?;
        record.set("loglik_per_point", &loglik.as_slice())?;
        let runs: Vec<Vec<f64>> = weights
            .row_iter()
            .map(|row| row.iter().cloned().collect())
            .collect();
        record.set("ais_weights", &runs)?;
        record.set("loglik", &-summary.bits_per_dim)?;
        record.set("sem", &summary.sem)?;
        record.save(out)?;
    }

    Ok(())
}
