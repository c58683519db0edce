// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Evaluation context and host extension points
//!
//! A FHIRPath expression embedded in a mapping rule sees three kinds of
//! names: path elements of the focus, rule variables (resolved through a
//! [`VariableResolver`]), and `%` environment constants. Functions the
//! built-in table does not know are delegated to a [`HostFunctionResolver`].

use indexmap::IndexMap;

use crate::core::Result;
use crate::model::{Collection, FhirPathValue};

/// Resolves bare names at the start of an expression to bound values
pub trait VariableResolver {
    /// Value bound to `name`, if any
    fn resolve_variable(&self, name: &str) -> Option<FhirPathValue>;
}

impl VariableResolver for IndexMap<String, FhirPathValue> {
    fn resolve_variable(&self, name: &str) -> Option<FhirPathValue> {
        self.get(name).cloned()
    }
}

/// Host-supplied functions and services used by the evaluator
pub trait HostFunctionResolver: Send + Sync {
    /// Parameter count bounds of a custom function, or `None` if unknown
    fn arity(&self, name: &str) -> Option<(usize, Option<usize>)>;

    /// Execute a custom function
    fn execute(&self, name: &str, focus: &Collection, parameters: &[Collection]) -> Result<Collection>;

    /// Resolve a reference string for `resolve()`
    fn resolve_reference(&self, _reference: &str) -> Option<FhirPathValue> {
        None
    }

    /// Value set membership for `memberOf`; `None` when undecidable
    fn member_of(&self, _code: &FhirPathValue, _value_set: &str) -> Option<bool> {
        None
    }
}

/// `%` constants every evaluation starts with
pub fn default_environment() -> IndexMap<String, FhirPathValue> {
    let mut env = IndexMap::new();
    env.insert("sct".to_string(), FhirPathValue::string("http://snomed.info/sct"));
    env.insert("loinc".to_string(), FhirPathValue::string("http://loinc.org"));
    env.insert("ucum".to_string(), FhirPathValue::string("http://unitsofmeasure.org"));
    env
}

/// Expand the `%vs-` and `%ext-` shorthands
pub(crate) fn expand_shorthand(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix("vs-") {
        return Some(format!("http://hl7.org/fhir/ValueSet/{rest}"));
    }
    if let Some(rest) = name.strip_prefix("ext-") {
        return Some(format!("http://hl7.org/fhir/StructureDefinition/{rest}"));
    }
    None
}

/// State threaded through one evaluation
#[derive(Clone)]
pub struct EvaluationContext<'a> {
    /// `%resource`
    pub resource: Option<FhirPathValue>,
    /// `%context` and `%rootResource`
    pub root: Option<FhirPathValue>,
    /// `$this` inside iterating functions
    pub this: Option<FhirPathValue>,
    /// `$index` inside iterating functions
    pub index: Option<usize>,
    /// `$total` inside `aggregate`
    pub total: Option<Collection>,
    /// Rule variables
    pub variables: Option<&'a dyn VariableResolver>,
    /// Caller-supplied `%` constants
    pub environment: &'a IndexMap<String, FhirPathValue>,
}

impl<'a> EvaluationContext<'a> {
    /// Root context for evaluating against `focus`
    pub fn new(
        focus: Option<&FhirPathValue>,
        variables: Option<&'a dyn VariableResolver>,
        environment: &'a IndexMap<String, FhirPathValue>,
    ) -> Self {
        Self {
            resource: focus.cloned(),
            root: focus.cloned(),
            this: None,
            index: None,
            total: None,
            variables,
            environment,
        }
    }

    /// Child context for one item of an iterating function
    pub fn for_item(&self, item: &FhirPathValue, index: usize) -> Self {
        Self {
            this: Some(item.clone()),
            index: Some(index),
            ..self.clone()
        }
    }

    /// Child context carrying the running `$total`
    pub fn with_total(&self, total: Collection) -> Self {
        Self {
            total: Some(total),
            ..self.clone()
        }
    }

    /// Value of a `%` constant; the name excludes the `%`
    pub fn environment_value(&self, name: &str) -> Option<Collection> {
        match name {
            "resource" => return Some(self.resource.iter().cloned().collect()),
            "context" | "rootResource" => return Some(self.root.iter().cloned().collect()),
            _ => {}
        }
        if let Some(value) = self.environment.get(name) {
            return Some(vec![value.clone()]);
        }
        if let Some(value) = self.variables.and_then(|v| v.resolve_variable(name)) {
            return Some(vec![value]);
        }
        expand_shorthand(name).map(|url| vec![FhirPathValue::String(url)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_lookup_order() {
        let env = default_environment();
        let mut vars = IndexMap::new();
        vars.insert("sct".to_string(), FhirPathValue::string("shadowed"));
        vars.insert("x".to_string(), FhirPathValue::from(3));
        let ctx = EvaluationContext::new(None, Some(&vars), &env);

        assert_eq!(
            ctx.environment_value("sct"),
            Some(vec![FhirPathValue::string("http://snomed.info/sct")])
        );
        assert_eq!(ctx.environment_value("x"), Some(vec![FhirPathValue::from(3)]));
        assert_eq!(
            ctx.environment_value("vs-administrative-gender"),
            Some(vec![FhirPathValue::string(
                "http://hl7.org/fhir/ValueSet/administrative-gender"
            )])
        );
        assert_eq!(ctx.environment_value("missing"), None);
    }
}
