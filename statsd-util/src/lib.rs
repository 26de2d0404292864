//! Helper types used by the statsd domain agent.
//!
//! This crate holds the pieces of the agent that are independent of the wire protocol: metric keys
//! and their pre-computed hashes, metric kinds, a sharded registry with an optional capacity,
//! recency tracking for idle metrics, and quantile summaries.
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod common;
pub use common::{Hashable, KeyHasher};

mod key;
pub use key::{MetricKey, Tag};

mod kind;
pub use kind::{MetricKind, MetricKindMask};

mod quantile;
pub use quantile::{parse_quantiles, Quantile};

mod recency;
pub use recency::Recency;

pub mod registry;
pub use registry::{CapacityExceeded, Registry};

mod summary;
pub use summary::Summary;
