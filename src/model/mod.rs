//! Value model, element trees and structure definitions

pub mod mock_provider;
pub mod node;
pub mod provider;
pub mod value;

pub use mock_provider::MockStructureProvider;
pub use node::Node;
pub use provider::{ElementInfo, FHIR_STRUCTURE_BASE, StructureProvider, TypeInfo, TypeKind};
pub use value::{Collection, FhirPathValue, Quantity};
