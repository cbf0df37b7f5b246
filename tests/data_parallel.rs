use std::{sync::Arc, thread};

use ddp_hooks::{GradBucket, HookErr, LocalGroup, ProcessGroup, Reducer, Tensor, tensor};
use tokio::task::JoinSet;

const WORLD_SIZE: usize = 4;

fn zeroed(sizes: &[usize]) -> Vec<Vec<Tensor>> {
    sizes.iter().map(|&n| vec![tensor::full(&[n], 0.0)]).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_rank_ends_up_with_the_average() {
    let sizes = [3, 5];
    let mut tasks = JoinSet::new();

    for pg in LocalGroup::new_group(WORLD_SIZE) {
        tasks.spawn(async move {
            let rank = pg.rank() as f32;
            let mut reducer = Reducer::new(Arc::new(pg));

            for (index, &n) in sizes.iter().enumerate().rev() {
                let bucket = GradBucket::new(vec![tensor::full(&[n], rank)]).unwrap();
                reducer.mark_bucket_ready(index, bucket).unwrap();
            }

            let mut grads = zeroed(&sizes);
            reducer.finalize(&mut grads).await.unwrap();
            grads
        });
    }

    // The mean of ranks 0, 1, 2 and 3.
    let expected: Vec<_> = sizes.iter().map(|&n| vec![tensor::full(&[n], 1.5)]).collect();

    while let Some(grads) = tasks.join_next().await {
        assert_eq!(grads.unwrap(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn several_steps_keep_ranks_in_lockstep() {
    let sizes = [4];
    let steps = 3;
    let mut tasks = JoinSet::new();

    for pg in LocalGroup::new_group(WORLD_SIZE) {
        tasks.spawn(async move {
            let rank = pg.rank();
            let mut reducer = Reducer::new(Arc::new(pg));
            let mut param = tensor::full(&[4], 0.0);
            let mut grads = zeroed(&sizes);

            for step in 0..steps {
                let grad = tensor::full(&[4], (rank * step) as f32);
                reducer
                    .mark_bucket_ready(0, GradBucket::new(vec![grad]).unwrap())
                    .unwrap();
                reducer.finalize(&mut grads).await.unwrap();
                param.zip_mut_with(&grads[0][0], |p, g| *p -= g);
            }

            param
        });
    }

    // Averages are 0, 1.5 and 3, applied with a unit learning rate.
    let expected = tensor::full(&[4], -4.5);

    while let Some(param) = tasks.join_next().await {
        assert_eq!(param.unwrap(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_departed_peer_fails_every_other_rank() {
    let mut group = LocalGroup::new_group(2);
    let gone = group.pop().unwrap();
    let pg = group.pop().unwrap();

    let mut reducer = Reducer::new(Arc::new(pg));
    reducer
        .mark_bucket_ready(0, GradBucket::new(vec![tensor::full(&[2], 1.0)]).unwrap())
        .unwrap();

    gone.leave();

    let mut grads = zeroed(&[2]);
    let err = reducer.finalize(&mut grads).await.unwrap_err();

    assert!(matches!(err, HookErr::Communication(_)));
    assert_eq!(grads, zeroed(&[2]));
}

#[test]
fn initial_parameters_come_from_rank_zero() {
    let group = LocalGroup::new_group(WORLD_SIZE);

    let synced: Vec<Vec<Tensor>> = thread::scope(|s| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|pg| {
                s.spawn(move || {
                    let rank = pg.rank() as f32;
                    let reducer = Reducer::new(Arc::new(pg));
                    let mut params = vec![
                        tensor::full(&[2, 3], rank),
                        tensor::full(&[7], rank + 10.0),
                        tensor::full(&[1], rank - 1.0),
                    ];

                    // Small enough to force several chunks.
                    reducer.sync_params(&mut params, 32).unwrap();
                    params
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected = vec![
        tensor::full(&[2, 3], 0.0),
        tensor::full(&[7], 10.0),
        tensor::full(&[1], -1.0),
    ];

    for params in synced {
        assert_eq!(params, expected);
    }
}
