use std::ops::Range;

use log::debug;

use super::ProcessGroup;
use crate::{
    error::CommErr,
    tensor::{self, Tensor},
};

/// The rank whose values every other rank receives.
const SOURCE_RANK: usize = 0;

/// Broadcasts many tensors from rank 0 to every rank of the group.
///
/// Consecutive tensors are packed into flat chunks of at most `buffer_size` bytes, a
/// tensor larger than the buffer travels alone. Blocks until every chunk arrived, then
/// overwrites `tensors` in place.
///
/// # Arguments
/// * `pg` - The group to broadcast within.
/// * `tensors` - The tensors to synchronize, laid out identically on every rank.
/// * `buffer_size` - The maximum size in bytes of a coalesced chunk.
///
/// # Returns
/// A `CommErr` if a chunk couldn't be launched or failed to arrive.
pub fn broadcast_coalesced(
    pg: &dyn ProcessGroup,
    tensors: &mut [Tensor],
    buffer_size: usize,
) -> Result<(), CommErr> {
    if buffer_size == 0 {
        return Err(CommErr::InvalidInput(
            "broadcast buffer size must be positive".into(),
        ));
    }

    for range in chunk_ranges(tensors, buffer_size) {
        let chunk = &mut tensors[range.clone()];
        let flat: Vec<f32> = chunk.iter().flat_map(|t| t.iter().copied()).collect();
        let expected = flat.len();

        debug!(rank = pg.rank(), tensors = chunk.len(), elems = expected; "broadcasting chunk");

        let received = pg
            .broadcast(vec![tensor::from_vec(flat)], SOURCE_RANK)?
            .wait()?;

        let values = match received.as_slice() {
            [flat] if flat.len() == expected => flat.iter().copied().collect::<Vec<_>>(),
            _ => {
                return Err(CommErr::CollectiveMismatch {
                    op: "broadcast",
                    detail: format!("chunk {range:?} came back with an unexpected layout"),
                });
            }
        };

        let mut offset = 0;
        for t in chunk.iter_mut() {
            let len = t.len();
            t.iter_mut()
                .zip(&values[offset..offset + len])
                .for_each(|(dst, src)| *dst = *src);
            offset += len;
        }
    }

    Ok(())
}

/// Splits `tensors` into consecutive runs of at most `buffer_size` bytes.
fn chunk_ranges(tensors: &[Tensor], buffer_size: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (i, t) in tensors.iter().enumerate() {
        let size = tensor::nbytes(t);
        if i > start && bytes + size > buffer_size {
            ranges.push(start..i);
            start = i;
            bytes = 0;
        }

        bytes += size;
    }

    if start < tensors.len() {
        ranges.push(start..tensors.len());
    }

    ranges
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::group::LocalGroup;

    fn sized(lens: &[usize]) -> Vec<Tensor> {
        lens.iter().map(|&n| tensor::full(&[n], 0.0)).collect()
    }

    #[test]
    fn chunks_respect_the_buffer_size() {
        // 4 bytes per element, a 16 byte buffer fits 4 elements.
        let ts = sized(&[2, 2, 3, 1, 1]);
        assert_eq!(chunk_ranges(&ts, 16), vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn oversized_tensors_travel_alone() {
        let ts = sized(&[1, 10, 1]);
        assert_eq!(chunk_ranges(&ts, 8), vec![0..1, 1..2, 2..3]);
        assert!(chunk_ranges(&[], 8).is_empty());
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let group = LocalGroup::new_group(1);
        let mut ts = sized(&[1]);
        let err = broadcast_coalesced(&group[0], &mut ts, 0).unwrap_err();
        assert!(matches!(err, CommErr::InvalidInput(_)));
    }

    #[test]
    fn every_rank_ends_with_rank_zero_values() {
        const WORLD: usize = 3;
        let group = LocalGroup::new_group(WORLD);

        let results: Vec<Vec<Tensor>> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|pg| {
                    s.spawn(move || {
                        let value = pg.rank() as f32 + 1.0;
                        let mut ts = vec![
                            tensor::full(&[2, 2], value),
                            tensor::full(&[3], value * 10.0),
                            tensor::full(&[1], value * 100.0),
                        ];
                        broadcast_coalesced(pg, &mut ts, 20).unwrap();
                        ts
                    })
                })
                .collect();

            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for ts in results {
            assert_eq!(ts[0], tensor::full(&[2, 2], 1.0));
            assert_eq!(ts[1], tensor::full(&[3], 10.0));
            assert_eq!(ts[2], tensor::full(&[1], 100.0));
        }
    }

    #[test]
    fn unreachable_peer_fails_the_broadcast() {
        let group = LocalGroup::new_group(2);
        group[1].leave();

        let mut ts = sized(&[4]);
        let err = broadcast_coalesced(&group[0], &mut ts, 1024).unwrap_err();
        assert_eq!(err, CommErr::PeerUnreachable { rank: 1 });
    }
}
