//! Map execution: variables, group resolution, built-in transforms, concept
//! translation and the host service contracts.

pub mod builtins;
pub mod engine;
pub mod registry;
pub mod resolver;
pub mod services;
pub mod translate;
pub mod variables;

pub use engine::StructureMapEngine;
pub use registry::{InMemoryMapRegistry, MapRegistry, url_matches};
pub use resolver::{GroupResolver, ResolvedGroup};
pub use services::{Coding, DefaultServices, ExpansionEntry, TerminologyService, TransformerServices};
pub use translate::{OID_TO_URI_MAP, oid_to_uri};
pub use variables::{VariableMode, Variables};
