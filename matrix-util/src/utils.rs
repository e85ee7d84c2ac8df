/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = batch_size.max(1);
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Split `ntot` items into at most `num_blocks` contiguous, nearly
/// equal intervals
pub fn generate_block_intervals(ntot: usize, num_blocks: usize) -> Vec<(usize, usize)> {
    let num_blocks = num_blocks.clamp(1, ntot.max(1));
    generate_minibatch_intervals(ntot, ntot.div_ceil(num_blocks))
}
