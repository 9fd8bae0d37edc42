use crate::models::Chunk;

/// Splits `[0, size)` into consecutive `chunk_size`-byte ranges; the last
/// chunk may be shorter. Deterministic and allocation-only, so resumed
/// uploads re-derive identical boundaries from persisted chunk indices.
///
/// A zero-length file yields a single zero-length chunk, which the
/// scheduler treats as complete without a network call.
pub fn plan(size: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be positive");

    if size == 0 {
        return vec![Chunk {
            index: 0,
            start: 0,
            end: 0,
            digest: None,
        }];
    }

    let count = size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            Chunk {
                index: i as u32,
                start,
                end: (start + chunk_size).min(size),
                digest: None,
            }
        })
        .collect()
}
