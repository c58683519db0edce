//! The FHIR Mapping Language: rule tree, text parser and renderer.

pub mod cache;
pub mod model;
pub mod parser;
pub mod render;

pub use cache::ExpressionCache;
pub use model::*;
pub use parser::{MapParser, parse_map};
pub use render::render;
