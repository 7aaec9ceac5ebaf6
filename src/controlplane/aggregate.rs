//! Aggregate selection and the volume headroom rule

use crate::domain::ports::{bytes_to_gib, gib_to_bytes, AggregateInfo, StorageBackend};
use crate::error::{Error, Result};
use tracing::debug;

/// A volume is sized at this multiple of the LUN sizes it holds
pub const HEADROOM_FACTOR: u64 = 2;

/// Volume size in GiB for LUNs totalling `luns_gib`
pub fn volume_size_gib(luns_gib: u64) -> u64 {
    luns_gib.saturating_mul(HEADROOM_FACTOR)
}

/// Aggregate with the most available space, ties going to the first reported
pub async fn largest_aggregate(backend: &dyn StorageBackend) -> Result<AggregateInfo> {
    let aggregates = backend.aggregate_list().await?;
    aggregates
        .into_iter()
        .reduce(|best, aggr| {
            if aggr.available_bytes > best.available_bytes {
                aggr
            } else {
                best
            }
        })
        .ok_or_else(|| Error::NoAggregates {
            svm: backend.svm_name().to_string(),
        })
}

/// Pick the aggregate with the most available space for LUNs totalling
/// `required_gib`.
///
/// Ties go to the first aggregate reported. Fails when no aggregate is
/// visible or the headroom-adjusted size does not fit the chosen one.
pub async fn select_aggregate(backend: &dyn StorageBackend, required_gib: u64) -> Result<String> {
    let aggregate = largest_aggregate(backend).await?;

    let needed_gib = volume_size_gib(required_gib);
    if gib_to_bytes(needed_gib) > aggregate.available_bytes {
        return Err(Error::InsufficientCapacity {
            aggregate: aggregate.name.clone(),
            requested_gib: needed_gib,
            available_gib: bytes_to_gib(aggregate.available_bytes),
        });
    }

    debug!(
        "Selected aggregate {} ({} bytes available) for {}GiB",
        aggregate.name, aggregate.available_bytes, needed_gib
    );
    Ok(aggregate.name.clone())
}
