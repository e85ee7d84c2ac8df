mod eval_isa;
mod fit_isa;
mod isa_common;
mod run_sim;

use eval_isa::*;
use fit_isa::*;
use isa_common::*;
use run_sim::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "ISA",
    long_about = "Overcomplete Independent Subspace Analysis of image patches\n\
		  Data files are tab-separated matrices with one patch per column,\n\
		  optionally gzipped (`.tsv.gz`)."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Sample data from a random ISA model",
        long_about = "Draw a random basis and heavy-tailed sources,\n\
		      then write the mixed data as a TSV matrix.\n"
    )]
    Simulate(SimArgs),

    #[command(
        about = "Train an ISA model on image patches",
        long_about = "Train an overcomplete ISA model in the stages: \n\
		      (1) Log-transform, centre and whiten the data\n\
		      (2) Model the DC component by a mixture of Gaussians\n\
		      (3) Train the basis on a subset with persistent Gibbs chains\n\
		      (4) Fine-tune on all the data and save the experiment.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Estimate the log-likelihood of a trained model",
        long_about = "Estimate the log-likelihood of test data points under\n\
		      a trained model by annealed importance sampling and report\n\
		      the average in bits per pixel with its standard error.\n"
    )]
    Evaluate(EvalArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
        Commands::Train(args) => {
            fit_isa(args)?;
        }
        Commands::Evaluate(args) => {
            evaluate_isa(args)?;
        }
    }

    info!("Done");
    Ok(())
}
