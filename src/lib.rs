//! FHIR Mapping Language for Rust
//!
//! Parses, renders, executes and analyses FHIR StructureMaps written in the
//! mapping language, with a FHIRPath engine for the expressions embedded in
//! rules.
//!
//! ```no_run
//! use octofhir_fhirmap::StructureMapEngine;
//! use serde_json::json;
//!
//! let engine = StructureMapEngine::new();
//! let map = engine.parse_map(
//!     r#"map "http://example.org/map" = "Copy"
//!        group Main(source src : Patient, target tgt : Patient) {
//!          src.gender as g -> tgt.gender = g "gender";
//!        }"#,
//!     "copy.map",
//! )?;
//! let out = engine.transform_json(&json!({"resourceType": "Patient", "gender": "male"}), None, &map, None)?;
//! assert_eq!(out["gender"], "male");
//! # Ok::<(), octofhir_fhirmap::FhirMapError>(())
//! ```

pub mod analyzer;
pub mod ast;
pub mod config;
pub mod core;
pub mod evaluator;
pub mod mapping;
pub mod model;
pub mod parser;
pub mod transform;

pub use analyzer::{MapAnalysis, MapAnalyzer};
pub use config::EngineConfig;
pub use core::{ErrorKind, FhirMapError, Result, SourceLocation};
pub use evaluator::{FhirPathEngine, HostFunctionResolver};
pub use mapping::{ConceptMap, MapParser, StructureMap, parse_map, render};
pub use model::{FhirPathValue, MockStructureProvider, Node, StructureProvider};
pub use parser::parse_expression;
pub use transform::{MapRegistry, StructureMapEngine, TerminologyService, TransformerServices};
