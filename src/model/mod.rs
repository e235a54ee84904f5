pub mod classify;
pub mod event;
pub mod feature;
pub mod graph;
pub mod types;

pub use classify::VariantType;
pub use types::{Compatibility, EventId, FeatureId, FeatureType, GeneId, NodeId, VariantId};
