//! Static analysis of maps: the profiles a map's output conforms to and a
//! source/target summary of its rules.

pub mod engine;
pub mod profile;
pub mod summary;

pub use engine::{MapAnalysis, MapAnalyzer};
pub use profile::{
    CollectionStatus, ElementDefinition, ElementType, ProfileSkeleton, ProfiledType, TypeDetails,
};
pub use summary::{RowKind, SummaryRow, summary_table};
