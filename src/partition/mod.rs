pub mod error;
pub mod key;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PartitionError, StreamError};
pub use key::{Granularity, PartitionId, Tier, key_for_pv_name, pv_name_from_key};
pub use stream::PartitionedEventStream;
