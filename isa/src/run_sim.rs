use crate::isa_common::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

#[derive(Args, Debug)]
pub struct SimArgs {
    /// Output file for the `V x N` data (`.tsv` or `.tsv.gz`)
    #[arg(long, short, required = true)]
    out: Box<str>,

    /// Number of visible units `V`
    #[arg(long, default_value_t = 16)]
    visibles: usize,

    /// Number of hidden units `H`
    #[arg(long, default_value_t = 32)]
    hiddens: usize,

    /// Size of every subspace
    #[arg(long, short = 's', default_value_t = 1)]
    subspace_size: usize,

    /// Scales per Gaussian scale mixture
    #[arg(long, default_value_t = 10)]
    num_scales: usize,

    /// Number of data points `N`
    #[arg(long, short = 'n', default_value_t = 10000)]
    samples: usize,

    /// Shape of the source marginals
    #[arg(long, value_enum, default_value = "laplace")]
    prior: PriorInit,

    /// Add Gaussian observation noise
    #[arg(long, default_value_t = false)]
    noise: bool,

    /// Write positive intensities `exp(x)`, the input format of `train`
    #[arg(long, default_value_t = false)]
    intensities: bool,

    /// Save the generating model as an experiment record
    #[arg(long)]
    model_out: Option<Box<str>>,

    /// Random seed
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// verbosity
    #[arg(long, short)]
    verbose: bool,
}

pub fn run_simulate(args: &SimArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let config = IsaConfig {
        subspace_size: args.subspace_size,
        num_scales: args.num_scales,
        noise: args.noise,
        ..IsaConfig::new(args.visibles, args.hiddens)
    };
    let options = IsaOptions {
        seed: args.seed,
        verbose: args.verbose,
        ..Default::default()
    };
    let mut isa = Isa::from_config(&config, options)?;
    isa.initialize(None, args.prior.into())?;

    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(1));
    let mut data = isa.sample(args.samples, &mut rng);
    if args.intensities {
        data.apply(|x| *x = x.exp());
    }

    info!(
        "sampled {} x {} data from {} subspaces",
        data.nrows(),
        data.ncols(),
        isa.subspaces().len()
    );
    data.to_tsv(&args.out)?;
    info!("wrote data to {}", args.out);

    if let Some(model_out) = args.model_out.as_deref() {
        let mut record = ExperimentRecord::new();
        record.set("model", &isa)?;
        record.set("num_samples", &args.samples)?;
        record.set("seed", &args.seed)?;
        record.save(model_out)?;
    }

    Ok(())
}
