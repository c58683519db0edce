//! FHIRPath evaluation

pub mod context;
mod conversions;
pub mod engine;
mod functions;
mod operators;

pub use context::{EvaluationContext, HostFunctionResolver, VariableResolver, default_environment};
pub use engine::{FhirPathEngine, convert_to_boolean};
pub use functions::values_equal;
pub(crate) use conversions::parse_quantity;
pub(crate) use functions::{escape_html, escape_json};
