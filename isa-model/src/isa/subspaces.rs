//! Greedy merging of subspaces.
//!
//! Two subspaces are merged when one GSM over their joint units
//! explains the hidden samples better than two independent GSMs, after
//! a BIC penalty for the difference in parameters. Candidate GSMs are
//! always fit from the same fresh starting point, so running the
//! procedure again after it stopped makes no further merges.

use super::Isa;
use crate::gsm::Gsm;
use crate::Mat;
use log::{debug, info};
use matrix_util::check_finite;

const MERGE_EM_ITER: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub num_merges: usize,
    /// `permutation[new] = old`: hidden unit `new` of the merged model
    /// was hidden unit `old` before
    pub permutation: Vec<usize>,
}

/// Average log-density of `data` under a GSM fit from a fresh start
fn fit_gsm(data: &Mat, num_scales: usize) -> anyhow::Result<(Gsm, f64)> {
    let mut gsm = Gsm::new(data.nrows(), num_scales);
    gsm.train_em(data, MERGE_EM_ITER)?;
    let ll = gsm.logdensity(data)?.mean();
    Ok((gsm, ll))
}

fn gather_rows(samples: &Mat, units: &[usize]) -> Mat {
    Mat::from_fn(units.len(), samples.ncols(), |i, j| samples[(units[i], j)])
}

impl Isa {
    /// Merge up to `max_merge` pairs of feature subspaces, best pair
    /// first, using hidden `samples` (`H x N`). Noise subspaces are
    /// never merged. Hidden units are reordered so that each merged
    /// subspace is contiguous; the basis columns follow the units.
    ///
    /// `samples` must be in the model's current unit order. To reuse
    /// them afterwards, reorder their rows by the returned permutation.
    pub fn train_subspaces(
        &mut self,
        samples: &Mat,
        max_merge: usize,
    ) -> anyhow::Result<MergeReport> {
        self.check_invariants()?;
        let nh = self.num_hiddens();
        anyhow::ensure!(
            samples.nrows() == nh,
            "expected {} hidden units, got {} rows",
            nh,
            samples.nrows()
        );
        anyhow::ensure!(samples.ncols() > 1, "merging needs at least two samples");
        check_finite(samples, "subspace merging samples")?;

        let nn = samples.ncols() as f64;
        let mut permutation: Vec<usize> = (0..nh).collect();
        let mut num_merges = 0;

        while num_merges < max_merge {
            let ranges = self.subspace_ranges();
            let nf = self.num_feature_subspaces();
            let current = gather_rows(samples, &permutation);

            let singles = (0..nf)
                .map(|k| {
                    let (lb, ub) = ranges[k];
                    let rows = current.rows(lb, ub - lb).into_owned();
                    let (gsm, ll) = fit_gsm(&rows, self.subspaces()[k].num_scales())?;
                    Ok((gsm.num_parameters(), ll))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let mut best: Option<(f64, usize, usize, Gsm)> = None;
            for i in 0..nf {
                for j in (i + 1)..nf {
                    let (lb_i, ub_i) = ranges[i];
                    let (lb_j, ub_j) = ranges[j];
                    let units: Vec<usize> = (lb_i..ub_i).chain(lb_j..ub_j).collect();
                    let rows = gather_rows(&current, &units);

                    let num_scales = self.subspaces()[i]
                        .num_scales()
                        .max(self.subspaces()[j].num_scales());
                    let (merged, ll_merged) = fit_gsm(&rows, num_scales)?;

                    let (p_i, ll_i) = singles[i];
                    let (p_j, ll_j) = singles[j];
                    let p_merged = merged.num_parameters();
                    let gain = nn * (ll_merged - ll_i - ll_j)
                        + (p_i + p_j) as f64 * nn.ln() / 2.0
                        - p_merged as f64 * nn.ln() / 2.0;
                    debug!("merge gain of subspaces {} and {}: {:.4}", i, j, gain);

                    if gain > 0.0 && best.as_ref().is_none_or(|(g, ..)| gain > *g) {
                        best = Some((gain, i, j, merged));
                    }
                }
            }

            let Some((gain, i, j, merged)) = best else {
                break;
            };

            // new order: everything up to i's end, then j, then the rest
            let (_, ub_i) = ranges[i];
            let (lb_j, ub_j) = ranges[j];
            let order: Vec<usize> = (0..ub_i)
                .chain(lb_j..ub_j)
                .chain(ub_i..lb_j)
                .chain(ub_j..nh)
                .collect();

            let mut subspaces = self.subspaces().to_vec();
            subspaces[i] = merged;
            subspaces.remove(j);

            let old_basis = self.basis().clone();
            let basis = Mat::from_fn(old_basis.nrows(), nh, |r, c| old_basis[(r, order[c])]);
            self.set_basis(basis)?;
            if let Err(e) = self.set_subspaces(subspaces) {
                self.set_basis(old_basis)?;
                return Err(e);
            }

            permutation = order.iter().map(|&k| permutation[k]).collect();
            num_merges += 1;

            if self.options.verbose {
                info!(
                    "merged subspaces {} and {} (gain {:.3}), {} subspaces left",
                    i,
                    j,
                    gain,
                    self.subspaces().len()
                );
            }
        }

        Ok(MergeReport {
            num_merges,
            permutation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::GsmInit;
    use crate::isa::{IsaConfig, IsaOptions};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn basis_columns_follow_the_units() -> anyhow::Result<()> {
        let mut source = Isa::with_subspace_size(3, 3, 1)?;
        source.set_subspaces(vec![Gsm::new(1, 6), Gsm::new(2, 6)])?;
        source.initialize(None, GsmInit::Laplace)?;
        let mut rng = SmallRng::seed_from_u64(12);
        let samples = source.sample_prior(5_000, &mut rng);

        // units 0 and 2 are dependent here
        let samples = gather_rows(&samples, &[1, 0, 2]);

        let mut isa = Isa::new(3, 3)?;
        isa.initialize(None, GsmInit::Laplace)?;
        let before = isa.basis().clone();
        let report = isa.train_subspaces(&samples, 1)?;

        assert_eq!(report.num_merges, 1);
        assert_eq!(report.permutation, vec![0, 2, 1]);
        assert_eq!(isa.subspace_ranges(), vec![(0, 2), (2, 3)]);
        for (new, &old) in report.permutation.iter().enumerate() {
            assert_eq!(isa.basis().column(new), before.column(old));
        }
        Ok(())
    }

    #[test]
    fn noise_units_are_never_merged() -> anyhow::Result<()> {
        let config = IsaConfig {
            noise: true,
            ..IsaConfig::new(2, 2)
        };
        let mut isa = Isa::from_config(&config, IsaOptions::default())?;
        let mut rng = SmallRng::seed_from_u64(3);
        let samples = isa.sample_prior(2_000, &mut rng);

        isa.train_subspaces(&samples, 5)?;
        assert!(isa.subspaces().len() >= 3);
        assert!(isa.subspaces()[isa.num_feature_subspaces()..]
            .iter()
            .all(|g| g.dim() == 1));
        Ok(())
    }
}
