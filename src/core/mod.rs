//! Core types shared by every layer of the crate

pub mod error;

pub use error::{
    ErrorKind, FhirMapError, ResolutionFailure, Result, SourceLocation, TranslationFailure,
};
