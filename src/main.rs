use std::{env, sync::Arc};

use anyhow::{Context, bail};
use ddp_hooks::{DdpConfig, GradBucket, LocalGroup, ProcessGroup, Reducer, Tensor, tensor};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::task::{self, JoinSet};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => {
            DdpConfig::from_path(&path).with_context(|| format!("loading config from {path}"))?
        }
        None => DdpConfig::default(),
    };

    info!(
        "training with {} worker(s), {} bucket(s), {} step(s)",
        config.world_size,
        config.bucket_sizes.len(),
        config.steps
    );

    let mut tasks = JoinSet::new();
    for pg in LocalGroup::new_group(config.world_size.get()) {
        tasks.spawn(run_rank(pg, config.clone()));
    }

    let mut checksums = Vec::with_capacity(config.world_size.get());
    while let Some(res) = tasks.join_next().await {
        let (rank, checksum) = res??;
        info!(rank = rank; "finished with parameter checksum {checksum}");
        checksums.push(checksum);
    }

    if checksums.windows(2).any(|w| w[0] != w[1]) {
        bail!("workers diverged: {checksums:?}");
    }

    info!("all workers hold identical parameters");
    Ok(())
}

/// Trains one rank: broadcasts initial parameters, then averages a random gradient per
/// bucket every step and applies it.
async fn run_rank(pg: LocalGroup, config: DdpConfig) -> anyhow::Result<(usize, f32)> {
    let rank = pg.rank();
    let mut rng = StdRng::seed_from_u64(config.rank_seed(rank));
    let mut reducer = Reducer::new(Arc::new(pg));

    let mut params: Vec<Tensor> = config
        .bucket_sizes
        .iter()
        .map(|&n| tensor::from_vec((0..n).map(|_| rng.random()).collect()))
        .collect();

    let buffer_size = config.broadcast_buffer_bytes.get();
    task::block_in_place(|| reducer.sync_params(&mut params, buffer_size))?;

    let mut grads: Vec<Vec<Tensor>> = config
        .bucket_sizes
        .iter()
        .map(|&n| vec![tensor::full(&[n], 0.0)])
        .collect();

    for step in 0..config.steps {
        // Backward produces the last buckets first.
        for (index, &n) in config.bucket_sizes.iter().enumerate().rev() {
            let grad = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
            let bucket = GradBucket::new(vec![tensor::from_vec(grad)])?;
            reducer.mark_bucket_ready(index, bucket)?;
        }

        reducer.finalize(&mut grads).await?;

        for (param, grad) in params.iter_mut().zip(&grads) {
            param.zip_mut_with(&grad[0], |w, &g| *w -= config.learning_rate * g);
        }

        debug!(rank = rank, step = step; "step applied");
    }

    let checksum = params.iter().map(|t| t.sum()).sum();
    Ok((rank, checksum))
}
