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

//! Execution of maps against a source tree.
//!
//! Execution is a recursive walk over (group, variables) pairs. Each source
//! item forks the variable environment, every target of the rule is applied
//! to the fork, then nested rules, dependent groups or a type-dispatched
//! group run against that fork.

use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use serde_json::Value;

use crate::ast::{ExpressionNode, Literal};
use crate::config::EngineConfig;
use crate::core::{FhirMapError, ResolutionFailure, Result};
use crate::evaluator::{FhirPathEngine, HostFunctionResolver};
use crate::mapping::{
    Dependent, ExpressionCache, InputMode, MapParser, ModelMode, Rule, RuleSource, RuleTarget,
    SourceListMode, StructureMap, TargetListMode, Transform, TransformParameter,
};
use crate::model::{ElementInfo, FhirPathValue, MockStructureProvider, Node, StructureProvider};

use super::builtins;
use super::registry::{InMemoryMapRegistry, MapRegistry};
use super::resolver::{GroupResolver, ResolvedGroup};
use super::services::{DefaultServices, TerminologyService, TransformerServices};
use super::translate;
use super::variables::{VariableMode, Variables};

/// Per-call state: group lookups and the nesting depth
struct TransformContext {
    resolver: GroupResolver,
    depth: usize,
}

/// Runs maps.
///
/// The engine holds no per-transform state and can be shared between
/// threads; group resolution is memoised per [`transform`](Self::transform)
/// call.
#[derive(Clone)]
pub struct StructureMapEngine {
    fhirpath: FhirPathEngine,
    provider: Arc<dyn StructureProvider>,
    services: Arc<dyn TransformerServices>,
    terminology: Option<Arc<dyn TerminologyService>>,
    registry: Arc<dyn MapRegistry>,
    config: EngineConfig,
    cache: ExpressionCache,
}

impl Default for StructureMapEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StructureMapEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructureMapEngine")
            .field("provider", &self.provider)
            .field("terminology", &self.terminology.is_some())
            .field("config", &self.config)
            .field("cached_expressions", &self.cache.len())
            .finish()
    }
}

impl StructureMapEngine {
    /// Engine over the built-in FHIR type subset with default services and
    /// an empty registry
    pub fn new() -> Self {
        let provider: Arc<dyn StructureProvider> = Arc::new(MockStructureProvider::new());
        Self {
            fhirpath: FhirPathEngine::new().with_provider(provider.clone()),
            provider,
            services: Arc::new(DefaultServices),
            terminology: None,
            registry: Arc::new(InMemoryMapRegistry::new()),
            config: EngineConfig::default(),
            cache: ExpressionCache::new(),
        }
    }

    /// Use `provider` for type information
    pub fn with_provider(mut self, provider: Arc<dyn StructureProvider>) -> Self {
        self.fhirpath = self.fhirpath.with_provider(provider.clone());
        self.provider = provider;
        self
    }

    /// Accept host functions in embedded expressions
    pub fn with_host(mut self, host: Arc<dyn HostFunctionResolver>) -> Self {
        self.fhirpath = self.fhirpath.with_host(host);
        self
    }

    /// Use `services` for logging, instance creation and fallbacks
    pub fn with_services(mut self, services: Arc<dyn TransformerServices>) -> Self {
        self.services = services;
        self
    }

    /// Use `terminology` when building codings
    pub fn with_terminology(mut self, terminology: Arc<dyn TerminologyService>) -> Self {
        self.terminology = Some(terminology);
        self
    }

    /// Search `registry` for imported maps and concept maps
    pub fn with_registry(mut self, registry: Arc<dyn MapRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share parsed expressions with other parsers or engines
    pub fn with_cache(mut self, cache: ExpressionCache) -> Self {
        self.cache = cache;
        self
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Structure provider
    pub fn provider(&self) -> &Arc<dyn StructureProvider> {
        &self.provider
    }

    /// Map registry
    pub fn registry(&self) -> &Arc<dyn MapRegistry> {
        &self.registry
    }

    /// Embedded expression interpreter
    pub fn fhirpath(&self) -> &FhirPathEngine {
        &self.fhirpath
    }

    /// Parsed expressions
    pub fn cache(&self) -> &ExpressionCache {
        &self.cache
    }

    /// Parse a map with the engine's host functions, filling the engine's
    /// expression cache
    pub fn parse_map(&self, text: &str, source_name: &str) -> Result<StructureMap> {
        let parser = match self.fhirpath.host() {
            Some(host) => MapParser::with_host(host),
            None => MapParser::new(),
        };
        parser.with_cache(self.cache.clone()).parse(text, source_name)
    }

    /// Run `map` over `source`.
    ///
    /// The first group is the entry point. Its source input is bound to
    /// `source` and its target input to `target`, or to a fresh instance of
    /// the declared target type when `target` is `None`. Returns the target.
    pub fn transform(&self, source: &Node, map: &StructureMap, target: Option<Node>) -> Result<Node> {
        let map = Arc::new(map.clone());
        let group = map
            .groups
            .first()
            .ok_or_else(|| FhirMapError::semantic(format!("Map {} has no groups", map.url)))?;
        let mut context = TransformContext {
            resolver: GroupResolver::new(self.registry.clone(), Some(self.provider.clone())),
            depth: 0,
        };

        let sources: Vec<_> = group.inputs_with_mode(InputMode::Source).collect();
        if sources.len() > 1 {
            return Err(FhirMapError::semantic(
                "This engine does not support multiple source inputs",
            ));
        }
        let source_name = sources.first().map_or("source", |input| input.name.as_str());
        let target_input = group.inputs_with_mode(InputMode::Target).next();
        let target_name = target_input.map_or("target", |input| input.name.as_str());

        let target = match target {
            Some(target) => target,
            None => {
                let type_name = match target_input.and_then(|input| input.type_name.as_deref()) {
                    Some(stated) => context.resolver.actual_type(&map, stated),
                    None => {
                        warn!(
                            "Map {} declares no target type, defaulting to {}",
                            map.url, self.config.default_output_type
                        );
                        self.config.default_output_type.clone()
                    }
                };
                self.services.create_type(&type_name)?
            }
        };

        let mut vars = Variables::new();
        vars.add(VariableMode::Input, source_name, FhirPathValue::Node(source.clone()));
        vars.add(VariableMode::Output, target_name, FhirPathValue::Node(target.clone()));
        debug!("Start transform {} ({})", map.url, vars.summary());

        let entry = ResolvedGroup {
            map: map.clone(),
            index: 0,
        };
        self.execute_group(&mut context, "", &entry, &mut vars, true)?;
        Ok(target)
    }

    /// Run `map` over a JSON document and return the target as JSON
    pub fn transform_json(
        &self,
        source: &Value,
        source_type: Option<&str>,
        map: &StructureMap,
        target_type: Option<&str>,
    ) -> Result<Value> {
        let source = Node::from_json(source, source_type, Some(self.provider.as_ref()))?;
        let target = target_type
            .map(|type_name| self.services.create_type(type_name))
            .transpose()?;
        let output = self.transform(&source, map, target)?;
        Ok(output.to_json(Some(self.provider.as_ref())))
    }

    fn execute_group(
        &self,
        context: &mut TransformContext,
        indent: &str,
        group: &ResolvedGroup,
        vars: &mut Variables,
        at_root: bool,
    ) -> Result<()> {
        context.depth += 1;
        if context.depth > self.config.max_recursion_depth {
            return Err(FhirMapError::semantic(format!(
                "recursion depth exceeded ({}) entering group {}",
                self.config.max_recursion_depth,
                group.group().name
            )));
        }
        debug!("{indent}Group : {}; vars = {}", group.group().name, vars.summary());

        if let Some(base) = &group.group().extends {
            let resolved = context
                .resolver
                .resolve_reference(&group.map, &group.group().name, base)?;
            self.execute_group(context, &format!("{indent}  "), &resolved, vars, at_root)?;
        }
        for rule in &group.group().rules {
            self.execute_rule(context, &format!("{indent}  "), group, rule, vars, at_root)?;
        }
        context.depth -= 1;
        Ok(())
    }

    fn execute_rule(
        &self,
        context: &mut TransformContext,
        indent: &str,
        group: &ResolvedGroup,
        rule: &Rule,
        vars: &mut Variables,
        at_root: bool,
    ) -> Result<()> {
        debug!("{indent}rule : {}; vars = {}", rule.name, vars.summary());
        let [source] = rule.sources.as_slice() else {
            return Err(FhirMapError::semantic(format!(
                "rules with {} sources are not supported",
                rule.sources.len()
            ))
            .in_rule(&rule.name));
        };

        let forks = self
            .process_source(group, rule, source, vars)
            .map_err(|e| e.in_rule(&rule.name))?;
        for mut fork in forks {
            for target in &rule.targets {
                self.process_target(
                    context,
                    group,
                    target,
                    &mut fork,
                    vars,
                    source.variable.as_deref(),
                    at_root,
                )
                .map_err(|e| e.in_rule(&rule.name))?;
            }
            if !rule.rules.is_empty() {
                for child in &rule.rules {
                    self.execute_rule(context, &format!("{indent}  "), group, child, &mut fork, false)?;
                }
            } else if !rule.dependents.is_empty() {
                for dependent in &rule.dependents {
                    self.execute_dependent(context, &format!("{indent}  "), group, dependent, &fork)?;
                }
            } else if let Some((source_var, target_var)) = implicit_dispatch(rule) {
                self.execute_by_types(context, indent, group, rule, &fork, source_var, target_var)?;
            }
        }
        Ok(())
    }

    fn execute_dependent(
        &self,
        context: &mut TransformContext,
        indent: &str,
        group: &ResolvedGroup,
        dependent: &Dependent,
        vars: &Variables,
    ) -> Result<()> {
        let resolved = context
            .resolver
            .resolve_reference(&group.map, &group.group().name, &dependent.name)?;
        let inputs = &resolved.group().inputs;
        if inputs.len() != dependent.parameters.len() {
            return Err(FhirMapError::semantic(format!(
                "Rule '{}' has {} inputs but the invocation has {} variables",
                dependent.name,
                inputs.len(),
                dependent.parameters.len()
            )));
        }

        let mut bound = Variables::new();
        for (input, parameter) in inputs.iter().zip(&dependent.parameters) {
            let mode = match input.mode {
                InputMode::Source => VariableMode::Input,
                InputMode::Target => VariableMode::Output,
            };
            let value = match parameter {
                TransformParameter::Variable(name) => {
                    let found = vars.get(mode, name).or_else(|| {
                        (mode == VariableMode::Input)
                            .then(|| vars.get(VariableMode::Output, name))
                            .flatten()
                    });
                    found.cloned().ok_or_else(|| {
                        FhirMapError::not_found(format!(
                            "Rule '{}' {mode} variable '{}' named as '{name}' has no value (vars = {})",
                            dependent.name,
                            input.name,
                            vars.summary()
                        ))
                    })?
                }
                TransformParameter::Literal(literal) if mode == VariableMode::Input => self
                    .literal_value(literal)?
                    .ok_or_else(|| {
                        FhirMapError::semantic(format!(
                            "Rule '{}' cannot pass an empty literal as '{}'",
                            dependent.name, input.name
                        ))
                    })?,
                TransformParameter::Literal(literal) => {
                    return Err(FhirMapError::semantic(format!(
                        "Rule '{}' target '{}' cannot be the literal {literal}",
                        dependent.name, input.name
                    )));
                }
            };
            bound.add(mode, input.name.clone(), value);
        }
        self.execute_group(context, indent, &resolved, &mut bound, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_by_types(
        &self,
        context: &mut TransformContext,
        indent: &str,
        group: &ResolvedGroup,
        rule: &Rule,
        vars: &Variables,
        source_var: &str,
        target_var: &str,
    ) -> Result<()> {
        let (Some(source), Some(target)) = (
            vars.get(VariableMode::Input, source_var),
            vars.get(VariableMode::Output, target_var),
        ) else {
            trace!("{indent}no values bound for {source_var} -> {target_var}, nothing to dispatch");
            return Ok(());
        };
        let (source_type, target_type) = (source.type_name(), target.type_name());
        let resolved = match context.resolver.resolve_by_types(
            &group.map,
            &group.group().name,
            &rule.name,
            &source_type,
            &target_type,
        ) {
            Ok(resolved) => resolved,
            Err(FhirMapError::Resolution {
                reason: ResolutionFailure::NotFound,
                ..
            }) if self.is_primitive_value(source) && self.is_primitive_value(target) => {
                trace!("{indent}copying {source_type} value into {target_type}");
                if let (Some(value), Some(node)) = (source.primitive(), target.as_node()) {
                    node.set_value(value);
                }
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let inputs = &resolved.group().inputs;
        let mut bound = Variables::new();
        bound.add(VariableMode::Input, inputs[0].name.clone(), source.clone());
        bound.add(VariableMode::Output, inputs[1].name.clone(), target.clone());
        self.execute_group(context, &format!("{indent}  "), &resolved, &mut bound, false)
    }

    fn process_source(
        &self,
        group: &ResolvedGroup,
        rule: &Rule,
        source: &RuleSource,
        vars: &Variables,
    ) -> Result<Vec<Variables>> {
        let mut items: Vec<FhirPathValue> = Vec::new();
        if source.is_search() {
            let query_text = source.element.as_deref().unwrap_or_default();
            let expression = self.expression(query_text)?;
            let query = self
                .fhirpath
                .evaluate_to_string(None, &expression, Some(vars))?;
            items.extend(
                self.services
                    .perform_search(&query)?
                    .into_iter()
                    .map(FhirPathValue::Node),
            );
        } else {
            let context = vars.get(VariableMode::Input, &source.context).ok_or_else(|| {
                FhirMapError::not_found(format!(
                    "Unknown input variable {} in {} rule {} (vars = {})",
                    source.context,
                    group.map.url,
                    rule.name,
                    vars.summary()
                ))
            })?;
            match &source.element {
                None => items.push(context.clone()),
                Some(element) => {
                    if element == "value" && context.has_primitive() {
                        items.extend(context.primitive());
                    } else {
                        if let Some(node) = context.as_node() {
                            self.known_element(&node.type_name(), element)?;
                        }
                        self.fhirpath.navigate(context, element, &mut items);
                    }
                    if items.is_empty() {
                        if let Some(default) = &source.default_value {
                            items.push(FhirPathValue::String(default.clone()));
                        }
                    }
                }
            }
        }

        if let Some(type_name) = &source.type_name {
            items.retain(|item| self.is_type(item, type_name));
        }

        if let Some(condition) = &source.condition {
            let expression = self.expression(condition)?;
            let mut kept = Vec::with_capacity(items.len());
            for item in items {
                let scoped = bind_source(vars, source, &item);
                if self
                    .fhirpath
                    .evaluate_to_boolean(Some(&item), &expression, Some(&scoped))?
                {
                    kept.push(item);
                }
            }
            items = kept;
        }

        if let Some(check) = &source.check {
            let expression = self.expression(check)?;
            for item in &items {
                let scoped = bind_source(vars, source, item);
                if !self
                    .fhirpath
                    .evaluate_to_boolean(Some(item), &expression, Some(&scoped))?
                {
                    return Err(FhirMapError::evaluation("Check condition failed"));
                }
            }
        }

        if let Some(message) = &source.log_message {
            let expression = self.expression(message)?;
            let mut lines = Vec::with_capacity(items.len());
            for item in &items {
                let scoped = bind_source(vars, source, item);
                lines.push(
                    self.fhirpath
                        .evaluate_to_string(Some(item), &expression, Some(&scoped))?,
                );
            }
            if !lines.is_empty() {
                self.services.log(&format!("[{}]", lines.join(", ")));
            }
        }

        if let Some(mode) = source.list_mode {
            apply_list_mode(mode, &mut items)?;
        }

        trace!("rule {} forks over {} item(s)", rule.name, items.len());
        Ok(items
            .iter()
            .map(|item| bind_source(vars, source, item))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_target(
        &self,
        context: &mut TransformContext,
        group: &ResolvedGroup,
        target: &RuleTarget,
        vars: &mut Variables,
        shared: &mut Variables,
        source_var: Option<&str>,
        at_root: bool,
    ) -> Result<()> {
        let destination = match &target.context {
            Some(name) => {
                let found = vars.get(VariableMode::Output, name).ok_or_else(|| {
                    FhirMapError::not_found(format!("target context not known: {name}"))
                })?;
                let node = found.as_node().cloned().ok_or_else(|| {
                    FhirMapError::semantic(format!(
                        "target context {name} is a {} value and cannot hold elements",
                        found.type_name()
                    ))
                })?;
                if target.element.is_none() {
                    return Err(FhirMapError::semantic(format!(
                        "target {name} names no element"
                    )));
                }
                Some(node)
            }
            None => None,
        };
        let element = target.element.as_deref().unwrap_or_default();

        let mut value = None;
        if let Some(transform) = target.transform {
            let produced = self.run_transform(
                context,
                group,
                target,
                transform,
                vars,
                destination.as_ref(),
                element,
                source_var,
                at_root,
            )?;
            // the stored node may differ from the produced value
            value = match (produced, &destination) {
                (Some(produced), Some(destination)) => {
                    Some(self.set_property(destination, element, produced)?)
                }
                (produced, _) => produced,
            };
        } else if let Some(destination) = &destination {
            if target.list_modes.contains(&TargetListMode::Share) {
                let id = target.list_rule_id.as_deref().unwrap_or(element);
                value = match shared.get(VariableMode::Shared, id) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        let created = self.make_property(destination, element)?;
                        shared.add(VariableMode::Shared, id, created.clone());
                        Some(created)
                    }
                };
            } else {
                value = Some(self.make_property(destination, element)?);
            }
        }

        if let (Some(variable), Some(value)) = (&target.variable, value) {
            trace!("bind {variable} = {}", value.type_name());
            vars.add(VariableMode::Output, variable.clone(), value);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_transform(
        &self,
        context: &mut TransformContext,
        group: &ResolvedGroup,
        target: &RuleTarget,
        transform: Transform,
        vars: &Variables,
        destination: Option<&Node>,
        element: &str,
        source_var: Option<&str>,
        at_root: bool,
    ) -> Result<Option<FhirPathValue>> {
        let params = &target.parameters;
        let value = match transform {
            Transform::Create => {
                let type_name =
                    self.create_type_name(context, group, params, vars, destination, element, source_var)?;
                let mut created = self.services.create_type(&type_name)?;
                if self.provider.is_resource(&type_name) && type_name != "Parameters" {
                    created = self.services.create_resource(created, at_root)?;
                }
                FhirPathValue::Node(created)
            }
            Transform::Copy => {
                let [param] = params.as_slice() else {
                    return Err(arity_error(transform, 1, params.len()));
                };
                match self.param_value(vars, param)? {
                    Some(FhirPathValue::Node(node)) => FhirPathValue::Node(node.deep_copy()),
                    Some(other) => other,
                    None => return Ok(None),
                }
            }
            Transform::Evaluate => {
                let (focus, text) = match params.as_slice() {
                    [expression] => (
                        source_var.and_then(|name| vars.get(VariableMode::Input, name)).cloned(),
                        expression,
                    ),
                    [focus, expression] => (Some(self.required_param(vars, focus)?), expression),
                    _ => return Err(arity_error(transform, 2, params.len())),
                };
                let text = self.param_string(vars, text)?;
                let expression = self.expression(&text)?;
                let mut results = self
                    .fhirpath
                    .evaluate(focus.as_ref(), &expression, Some(vars))?;
                match results.len() {
                    0 => return Ok(None),
                    1 => match results.remove(0) {
                        FhirPathValue::Node(node) => FhirPathValue::Node(node.deep_copy()),
                        other => other,
                    },
                    n => {
                        return Err(FhirMapError::evaluation(format!(
                            "Evaluation of {expression} returned {n} objects"
                        )));
                    }
                }
            }
            Transform::Truncate => builtins::truncate(&self.param_values(vars, params)?)?,
            Transform::Append => builtins::append(&self.param_values(vars, params)?)?,
            Transform::Cast => builtins::cast(&self.param_values(vars, params)?)?,
            Transform::Escape => builtins::escape(&self.param_values(vars, params)?)?,
            Transform::Translate => {
                let (source, map_url, field) = match params.as_slice() {
                    [source, map_url] => (source, map_url, None),
                    [source, map_url, field] => (source, map_url, Some(field)),
                    _ => return Err(arity_error(transform, 3, params.len())),
                };
                let source = self.required_param(vars, source)?;
                let map_url = self.param_string(vars, map_url)?;
                let field = field.map(|f| self.param_string(vars, f)).transpose()?;
                return translate::translate(
                    &group.map,
                    self.registry.as_ref(),
                    self.services.as_ref(),
                    &source,
                    &map_url,
                    field.as_deref(),
                );
            }
            Transform::Reference => {
                let resource = self.resource_param(vars, transform, params)?;
                let id = self.resource_id(&resource)?;
                FhirPathValue::String(format!("{}/{id}", resource.type_name()))
            }
            Transform::Pointer => {
                let resource = self.resource_param(vars, transform, params)?;
                let id = self.resource_id(&resource)?;
                FhirPathValue::String(format!("urn:uuid:{id}"))
            }
            Transform::Uuid => FhirPathValue::String(builtins::uuid()),
            Transform::DateOp => {
                return Err(FhirMapError::semantic("Transform dateOp is not supported"));
            }
            Transform::Cc => FhirPathValue::Node(builtins::codeable_concept(
                self.terminology.as_deref(),
                &self.param_values(vars, params)?,
            )?),
            Transform::C => FhirPathValue::Node(builtins::coding(
                self.terminology.as_deref(),
                &self.param_values(vars, params)?,
            )?),
            Transform::Qty => FhirPathValue::Node(builtins::quantity(&self.param_values(vars, params)?)?),
            Transform::Id => FhirPathValue::Node(builtins::identifier(&self.param_values(vars, params)?)?),
            Transform::Cp => FhirPathValue::Node(builtins::contact_point(&self.param_values(vars, params)?)?),
        };
        Ok(Some(value))
    }

    #[allow(clippy::too_many_arguments)]
    fn create_type_name(
        &self,
        context: &mut TransformContext,
        group: &ResolvedGroup,
        params: &[TransformParameter],
        vars: &Variables,
        destination: Option<&Node>,
        element: &str,
        source_var: Option<&str>,
    ) -> Result<String> {
        if let Some(param) = params.first() {
            let stated = self.param_string(vars, param)?;
            let url = group
                .map
                .structures
                .iter()
                .find(|s| s.mode == ModelMode::Target && s.alias.as_deref() == Some(stated.as_str()))
                .map_or(stated.as_str(), |s| s.url.as_str());
            return Ok(context.resolver.actual_type(&group.map, url));
        }

        let declared = destination
            .and_then(|d| self.provider.element(&d.type_name(), element))
            .and_then(|info| info.single_type().map(str::to_string));
        if let Some(declared) = declared.filter(|t| t != "Resource") {
            return Ok(declared);
        }
        let Some(source) = source_var.and_then(|name| vars.get(VariableMode::Input, name)) else {
            return Err(FhirMapError::semantic(
                "Cannot determine type implicitly because there is no single input variable",
            ));
        };
        let source_type = source.type_name();
        match context
            .resolver
            .default_target_type(&group.map, &group.group().name, &source_type)
        {
            Err(FhirMapError::Resolution {
                reason: ResolutionFailure::NotFound,
                ..
            }) if self.is_primitive_value(source) => Ok(source_type),
            other => other,
        }
    }

    fn set_property(&self, destination: &Node, element: &str, value: FhirPathValue) -> Result<FhirPathValue> {
        let destination_type = destination.type_name();
        if element == "value" && self.provider.is_primitive(&destination_type) {
            let primitive = value.primitive().ok_or_else(|| {
                FhirMapError::semantic(format!(
                    "Cannot set the value of a {destination_type} from a {}",
                    value.type_name()
                ))
            })?;
            destination.set_value(primitive);
            return Ok(FhirPathValue::Node(destination.clone()));
        }

        let info = self.known_element(&destination_type, element)?;
        let node = match value {
            FhirPathValue::Node(node) => node,
            other => {
                let type_name = self
                    .provider
                    .element_type(&destination_type, element)
                    .unwrap_or_else(|| other.type_name());
                Node::primitive(type_name, other)
            }
        };
        let name = match &info {
            Some(info) if info.is_choice() && info.choice_type_for(element).is_none() => {
                format!("{}{}", info.base_name(), capitalise(&node.type_name()))
            }
            _ => element.to_string(),
        };
        if info.as_ref().is_none_or(ElementInfo::is_repeating) {
            destination.add_child(&name, node.clone());
        } else {
            destination.set_child(&name, node.clone());
        }
        trace!("{destination_type}.{name} := {}", node.type_name());
        Ok(FhirPathValue::Node(node))
    }

    /// Element definition, failing when the provider knows the type but not
    /// the element
    fn known_element(&self, type_name: &str, element: &str) -> Result<Option<ElementInfo>> {
        if self.provider.type_info(type_name).is_none() {
            return Ok(None);
        }
        self.provider
            .element(type_name, element)
            .map(Some)
            .ok_or_else(|| FhirMapError::not_found(format!("Unknown element name {type_name}.{element}")))
    }

    fn make_property(&self, destination: &Node, element: &str) -> Result<FhirPathValue> {
        let destination_type = destination.type_name();
        let info = self.known_element(&destination_type, element)?;
        let type_name = self
            .provider
            .element_type(&destination_type, element)
            .unwrap_or_else(|| "Element".to_string());
        let node = Node::new(type_name);
        if info.as_ref().is_none_or(ElementInfo::is_repeating) {
            destination.add_child(element, node.clone());
        } else {
            destination.set_child(element, node.clone());
        }
        Ok(FhirPathValue::Node(node))
    }

    fn resource_param(
        &self,
        vars: &Variables,
        transform: Transform,
        params: &[TransformParameter],
    ) -> Result<Node> {
        let [param] = params else {
            return Err(arity_error(transform, 1, params.len()));
        };
        let value = self.param_value(vars, param)?.ok_or_else(|| {
            FhirMapError::not_found(format!("Unable to find parameter {}", param.as_text()))
        })?;
        match value.as_node() {
            Some(node) if self.provider.is_resource(&node.type_name()) => Ok(node.clone()),
            _ => Err(FhirMapError::semantic(format!(
                "Transform engine cannot point at an element of type {}",
                value.type_name()
            ))),
        }
    }

    fn resource_id(&self, resource: &Node) -> Result<String> {
        if let Some(id) = resource.id() {
            return Ok(id);
        }
        if !self.config.generate_identifiers {
            return Err(FhirMapError::semantic(format!(
                "{} has no id and identifier generation is disabled",
                resource.type_name()
            )));
        }
        let id = builtins::uuid();
        resource.set_id(&id);
        Ok(id)
    }

    /// Value of a parameter; `None` only for an empty literal
    fn param_value(&self, vars: &Variables, param: &TransformParameter) -> Result<Option<FhirPathValue>> {
        match param {
            TransformParameter::Literal(literal) => self.literal_value(literal),
            TransformParameter::Variable(name) => {
                let missing = || {
                    FhirMapError::not_found(format!("Variable {name} not found ({})", vars.summary()))
                };
                let mut segments = name.split('.');
                let head = segments.next().unwrap_or_default();
                let mut current = vars.lookup(head).cloned().ok_or_else(missing)?;
                for segment in segments {
                    let mut found = Vec::new();
                    self.fhirpath.navigate(&current, segment, &mut found);
                    current = found.into_iter().next().ok_or_else(missing)?;
                }
                Ok(Some(current))
            }
        }
    }

    fn required_param(&self, vars: &Variables, param: &TransformParameter) -> Result<FhirPathValue> {
        self.param_value(vars, param)?.ok_or_else(|| {
            FhirMapError::semantic(format!("Parameter {} has no value", param.as_text()))
        })
    }

    fn param_values(&self, vars: &Variables, params: &[TransformParameter]) -> Result<Vec<FhirPathValue>> {
        params.iter().map(|p| self.required_param(vars, p)).collect()
    }

    fn param_string(&self, vars: &Variables, param: &TransformParameter) -> Result<String> {
        let value = self.required_param(vars, param)?;
        value.as_string().ok_or_else(|| {
            FhirMapError::semantic(format!(
                "Parameter {} must be a primitive value but is a {}",
                param.as_text(),
                value.type_name()
            ))
        })
    }

    fn literal_value(&self, literal: &Literal) -> Result<Option<FhirPathValue>> {
        Ok(match literal {
            Literal::String(s) => Some(FhirPathValue::String(s.clone())),
            Literal::Integer(i) => Some(FhirPathValue::Integer(*i)),
            Literal::Decimal(d) => Some(FhirPathValue::Decimal(*d)),
            Literal::Boolean(b) => Some(FhirPathValue::Boolean(*b)),
            Literal::Quantity { .. } | Literal::Special(_) => {
                let expression = self.expression(&literal.to_string())?;
                self.fhirpath.evaluate(None, &expression, None)?.into_iter().next()
            }
            Literal::Null => None,
        })
    }

    fn expression(&self, text: &str) -> Result<Arc<ExpressionNode>> {
        self.cache.get_or_parse(text, |t| self.fhirpath.parse(t))
    }

    fn is_type(&self, item: &FhirPathValue, type_name: &str) -> bool {
        let actual = item.type_name();
        actual == type_name || (!self.config.strict_types && self.provider.is_subtype_of(&actual, type_name))
    }

    fn is_primitive_value(&self, value: &FhirPathValue) -> bool {
        match value {
            FhirPathValue::Node(node) => node.has_value() || self.provider.is_primitive(&node.type_name()),
            _ => true,
        }
    }
}

/// Source and target variables when `rule` should be dispatched by type:
/// a single source and a single target with variables, a bare `create` and
/// nothing else to run
pub(crate) fn implicit_dispatch(rule: &Rule) -> Option<(&str, &str)> {
    let ([source], [target]) = (rule.sources.as_slice(), rule.targets.as_slice()) else {
        return None;
    };
    if target.transform != Some(Transform::Create) || !target.parameters.is_empty() {
        return None;
    }
    Some((source.variable.as_deref()?, target.variable.as_deref()?))
}

fn bind_source(vars: &Variables, source: &RuleSource, item: &FhirPathValue) -> Variables {
    let mut fork = vars.clone();
    if let Some(variable) = &source.variable {
        fork.add(VariableMode::Input, variable.clone(), item.clone());
    }
    fork
}

fn apply_list_mode(mode: SourceListMode, items: &mut Vec<FhirPathValue>) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    match mode {
        SourceListMode::First => items.truncate(1),
        SourceListMode::NotFirst => {
            items.remove(0);
        }
        SourceListMode::Last => {
            let last = items.split_off(items.len() - 1);
            *items = last;
        }
        SourceListMode::NotLast => {
            items.pop();
        }
        SourceListMode::OnlyOne if items.len() > 1 => {
            return Err(FhirMapError::evaluation(
                "Check condition failed: the collection has more than one item",
            ));
        }
        SourceListMode::OnlyOne => {}
    }
    Ok(())
}

fn arity_error(transform: Transform, expected: usize, found: usize) -> FhirMapError {
    FhirMapError::semantic(format!(
        "Transform {transform} expects up to {expected} parameters but was given {found}"
    ))
}

fn capitalise(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run(map: &str, source: Value, source_type: &str, target_type: Option<&str>) -> Result<Value> {
        let engine = StructureMapEngine::new();
        let map = engine.parse_map(map, "test")?;
        engine.transform_json(&source, Some(source_type), &map, target_type)
    }

    #[test]
    fn list_modes_narrow_items() {
        let items = || vec![FhirPathValue::string("a"), FhirPathValue::string("b"), FhirPathValue::string("c")];
        let narrowed = |mode| {
            let mut list = items();
            apply_list_mode(mode, &mut list).map(|_| list)
        };
        assert_eq!(narrowed(SourceListMode::First).unwrap(), vec![FhirPathValue::string("a")]);
        assert_eq!(narrowed(SourceListMode::Last).unwrap(), vec![FhirPathValue::string("c")]);
        assert_eq!(narrowed(SourceListMode::NotFirst).unwrap().len(), 2);
        assert_eq!(narrowed(SourceListMode::NotLast).unwrap()[1], FhirPathValue::string("b"));
        assert!(narrowed(SourceListMode::OnlyOne).is_err());
    }

    #[test]
    fn copies_primitive_elements_by_shorthand() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : A, target tgt : B) {\n  src.name -> tgt.name;\n}",
            json!({"name": "Alice", "other": 1}),
            "A",
            Some("B"),
        )
        .unwrap();
        assert_eq!(out, json!({"resourceType": "B", "name": "Alice"}));
    }

    #[test]
    fn assigns_literals_and_evaluations() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src -> tgt.active = true \"fixed\";\n\
               src.gender as g -> tgt.gender = (g.upper()) \"upper\";\n\
             }",
            json!({"resourceType": "Patient", "gender": "male"}),
            "Patient",
            None,
        )
        .unwrap();
        assert_eq!(out["active"], json!(true));
        assert_eq!(out["gender"], json!("MALE"));
    }

    #[test]
    fn nested_rules_build_complex_targets() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.name as n -> tgt.name as tn then {\n\
                 n.family as f -> tn.family = f;\n\
                 n.given as g -> tn.given = g;\n\
               };\n\
             }",
            json!({"resourceType": "Patient", "name": [{"family": "Doe", "given": ["J", "K"]}]}),
            "Patient",
            None,
        )
        .unwrap();
        assert_eq!(out["name"], json!([{"family": "Doe", "given": ["J", "K"]}]));
    }

    #[test]
    fn dependent_groups_receive_variables() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.name as n -> tgt.name as tn then Name(n, tn);\n\
             }\n\
             group Name(source n : HumanName, target tn : HumanName) {\n\
               n.family as f -> tn.text = f;\n\
             }",
            json!({"resourceType": "Patient", "name": [{"family": "Doe"}]}),
            "Patient",
            None,
        )
        .unwrap();
        assert_eq!(out["name"], json!([{"text": "Doe"}]));
    }

    #[test]
    fn where_check_and_unknown_variables() {
        let map = "map \"http://x/y\" = \"Y\"\n\
                   group Main(source src : Patient, target tgt : Patient) {\n\
                     src.name as n where (family = 'Doe') -> tgt.name = n \"keep\";\n\
                   }";
        let out = run(
            map,
            json!({"resourceType": "Patient", "name": [{"family": "Doe"}, {"family": "Roe"}]}),
            "Patient",
            None,
        )
        .unwrap();
        assert_eq!(out["name"], json!([{"family": "Doe"}]));

        let checked = "map \"http://x/y\" = \"Y\"\n\
                       group Main(source src : Patient, target tgt : Patient) {\n\
                         src.name as n check (family.exists()) -> tgt.name = n \"keep\";\n\
                       }";
        let err = run(checked, json!({"resourceType": "Patient", "name": [{"text": "x"}]}), "Patient", None)
            .unwrap_err();
        assert!(err.to_string().contains("Check condition failed"));

        let unknown = "map \"http://x/y\" = \"Y\"\n\
                       group Main(source src : Patient, target tgt : Patient) {\n\
                         other.name as n -> tgt.name = n \"copy\";\n\
                       }";
        let err = run(unknown, json!({"resourceType": "Patient"}), "Patient", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resolution);
        assert!(err.to_string().contains("Unknown input variable other"));
    }

    #[test]
    fn choice_elements_take_the_value_type() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : Patient, target tgt : Observation) {\n\
               src.active as a -> tgt.value = a \"active\";\n\
             }",
            json!({"resourceType": "Patient", "active": true}),
            "Patient",
            Some("Observation"),
        )
        .unwrap();
        assert_eq!(out["valueBoolean"], json!(true));
    }

    #[test]
    fn reference_assigns_ids() {
        let out = run(
            "map \"http://x/y\" = \"Y\"\n\
             group Main(source src : Patient, target tgt : Observation) {\n\
               src -> tgt.subject as s then {\n\
                 src -> s.reference = reference(src) \"ref\";\n\
               } \"subject\";\n\
             }",
            json!({"resourceType": "Patient", "id": "p1"}),
            "Patient",
            Some("Observation"),
        )
        .unwrap();
        assert_eq!(out["subject"]["reference"], json!("Patient/p1"));
    }

    #[test]
    fn recursion_is_bounded() {
        let engine = StructureMapEngine::new().with_config(EngineConfig {
            max_recursion_depth: 4,
            ..Default::default()
        });
        let map = engine
            .parse_map(
                "map \"http://x/y\" = \"Y\"\n\
                 group Main(source src : Patient, target tgt : Patient) {\n\
                   src -> tgt then Main(src, tgt) \"again\";\n\
                 }",
                "loop",
            )
            .unwrap();
        let err = engine
            .transform(&Node::new("Patient"), &map, Some(Node::new("Patient")))
            .unwrap_err();
        assert!(err.to_string().contains("recursion depth exceeded"));
    }
}
