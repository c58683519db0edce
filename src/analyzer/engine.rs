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

//! Static analysis of maps.
//!
//! The analyzer walks the same (group, rule, source, target) structure the
//! transform engine executes, but its variables hold type descriptions
//! instead of values. Every target input of the entry group, and every
//! resource created without a context, gets a constraint profile; targets
//! written through a profiled variable add differential elements to it.

use std::fmt;
use std::sync::Arc;

use comfy_table::Table;
use log::{debug, trace};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::ast::Literal;
use crate::config::EngineConfig;
use crate::core::{FhirMapError, ResolutionFailure, Result};
use crate::mapping::{
    Dependent, Group, InputMode, ModelMode, Rule, RuleSource, RuleTarget, StructureMap, Transform,
    TransformParameter,
};
use crate::model::{ElementInfo, MockStructureProvider, StructureProvider};
use crate::transform::builtins::{self, UCUM};
use crate::transform::engine::implicit_dispatch;
use crate::transform::{
    Coding, GroupResolver, InMemoryMapRegistry, MapRegistry, TerminologyService, VariableMode,
};

use super::profile::{CollectionStatus, ElementDefinition, ProfileSkeleton, ProfiledType, TypeDetails};
use super::summary::{RowKind, SummaryRow, TargetWriter, summary_table};

/// Result of analysing a map
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapAnalysis {
    /// Profiles describing the produced instances, in creation order
    pub profiles: Vec<ProfileSkeleton>,
    /// One row per group and per rule
    pub summary: Vec<SummaryRow>,
}

impl MapAnalysis {
    /// Summary rendered as a two column table
    pub fn summary_table(&self) -> Table {
        summary_table(&self.summary)
    }

    /// First profile constraining `type_name`
    pub fn profile_for(&self, type_name: &str) -> Option<&ProfileSkeleton> {
        self.profiles.iter().find(|p| p.type_name == type_name)
    }
}

/// Where in a generated profile a variable's elements are recorded
#[derive(Debug, Clone)]
struct ProfileSlot {
    index: usize,
    path: String,
}

/// What a variable is known to hold
#[derive(Debug, Clone)]
struct ProfiledProperty {
    path: String,
    types: TypeDetails,
    profile: Option<ProfileSlot>,
}

impl ProfiledProperty {
    fn root(type_name: &str) -> Self {
        Self {
            path: type_name.to_string(),
            types: TypeDetails::singleton(type_name),
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ProfileVariables {
    entries: Vec<(VariableMode, String, ProfiledProperty)>,
}

impl ProfileVariables {
    fn add(&mut self, mode: VariableMode, name: &str, property: ProfiledProperty) {
        self.entries.retain(|(m, n, _)| !(*m == mode && n == name));
        self.entries.push((mode, name.to_string(), property));
    }

    fn get(&self, mode: VariableMode, name: &str) -> Option<&ProfiledProperty> {
        self.entries
            .iter()
            .find(|(m, n, _)| *m == mode && n == name)
            .map(|(_, _, p)| p)
    }

    fn lookup(&self, name: &str) -> Option<&ProfiledProperty> {
        self.get(VariableMode::Input, name)
            .or_else(|| self.get(VariableMode::Output, name))
    }

    fn summary(&self) -> String {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(mode, name, p)| format!("{mode} {name}: {}", p.path))
            .collect();
        parts.join(", ")
    }
}

/// Names a rule's work is reported under
struct RuleScope<'a> {
    group: &'a str,
    rule: &'a str,
    source_var: Option<&'a str>,
}

struct AnalysisContext {
    resolver: GroupResolver,
    ids: FxHashMap<String, usize>,
    profiles: Vec<ProfileSkeleton>,
    rows: Vec<SummaryRow>,
    active: Vec<String>,
}

/// Derives profiles and a summary from a map without running it
#[derive(Clone)]
pub struct MapAnalyzer {
    provider: Arc<dyn StructureProvider>,
    registry: Arc<dyn MapRegistry>,
    terminology: Option<Arc<dyn TerminologyService>>,
    config: EngineConfig,
}

impl Default for MapAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MapAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapAnalyzer")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .finish()
    }
}

impl MapAnalyzer {
    /// Analyzer over the built-in FHIR type subset
    pub fn new() -> Self {
        Self {
            provider: Arc::new(MockStructureProvider::new()),
            registry: Arc::new(InMemoryMapRegistry::new()),
            terminology: None,
            config: EngineConfig::default(),
        }
    }

    /// Resolve types and elements through `provider`
    pub fn with_provider(mut self, provider: Arc<dyn StructureProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Find imported maps and dependent groups in `registry`
    pub fn with_registry(mut self, registry: Arc<dyn MapRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Use `terminology` to complete fixed codings
    pub fn with_terminology(mut self, terminology: Arc<dyn TerminologyService>) -> Self {
        self.terminology = Some(terminology);
        self
    }

    /// Replace the configuration; profile URLs and the depth cap come from it
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Analyse `map` starting from its first group
    pub fn analyze(&self, map: &StructureMap) -> Result<MapAnalysis> {
        let map = Arc::new(map.clone());
        let start = map
            .groups
            .first()
            .ok_or_else(|| FhirMapError::semantic(format!("Map {} has no groups", map.url)))?;

        let mut context = AnalysisContext {
            resolver: GroupResolver::new(self.registry.clone(), Some(self.provider.clone())),
            ids: FxHashMap::default(),
            profiles: Vec::new(),
            rows: Vec::new(),
            active: Vec::new(),
        };

        let mut vars = ProfileVariables::default();
        for input in &start.inputs {
            let type_name = self.input_type(&context, &map, start, &input.name, input.type_name.as_deref())?;
            let property = ProfiledProperty::root(&type_name);
            match input.mode {
                InputMode::Source => vars.add(VariableMode::Input, &input.name, property),
                InputMode::Target => {
                    let property = self.create_profile(&mut context, &map, property, &start.name)?;
                    vars.add(VariableMode::Output, &input.name, property);
                }
            }
        }

        self.analyse_group(&mut context, &map, 0, &vars, 0)?;
        debug!(
            "Analysed {}: {} profiles, {} summary rows",
            map.url,
            context.profiles.len(),
            context.rows.len()
        );
        Ok(MapAnalysis {
            profiles: context.profiles,
            summary: context.rows,
        })
    }

    fn input_type(
        &self,
        context: &AnalysisContext,
        map: &StructureMap,
        group: &Group,
        input: &str,
        stated: Option<&str>,
    ) -> Result<String> {
        let stated = stated.ok_or_else(|| {
            FhirMapError::semantic(format!(
                "Input {input} of group {} has no type, which analysis requires",
                group.name
            ))
        })?;
        let actual = context.resolver.actual_type(map, stated);
        if self.provider.type_info(&actual).is_none() {
            return Err(FhirMapError::not_found(format!(
                "Unable to find structure definition for {stated}"
            )));
        }
        Ok(actual)
    }

    fn analyse_group(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        index: usize,
        vars: &ProfileVariables,
        level: usize,
    ) -> Result<()> {
        let group = &map.groups[index];
        let key = format!("{}#{}", map.url, group.name);
        if context.active.contains(&key) {
            trace!("group {} is already being analysed", group.name);
            return Ok(());
        }
        if context.active.len() >= self.config.max_recursion_depth {
            return Err(FhirMapError::semantic(format!(
                "recursion depth exceeded ({}) entering group {}",
                self.config.max_recursion_depth, group.name
            )));
        }
        debug!("{}Analyse group : {}", "  ".repeat(level), group.name);
        context.active.push(key);

        let describe = |mode: InputMode, var_mode: VariableMode| {
            let parts: Vec<String> = group
                .inputs_with_mode(mode)
                .filter_map(|input| vars.get(var_mode, &input.name))
                .map(|p| format!("Input: {}", p.path))
                .collect();
            parts.join(", ")
        };
        context.rows.push(SummaryRow {
            kind: RowKind::Group,
            depth: level,
            source: describe(InputMode::Source, VariableMode::Input),
            target: describe(InputMode::Target, VariableMode::Output),
        });

        if let Some(base) = &group.extends {
            let resolved = context.resolver.resolve_reference(map, &group.name, base)?;
            self.analyse_group(context, &resolved.map, resolved.index, vars, level + 1)?;
        }
        for rule in &group.rules {
            self.analyse_rule(context, map, group, rule, vars, level + 1)?;
        }

        context.active.pop();
        Ok(())
    }

    fn analyse_rule(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        group: &Group,
        rule: &Rule,
        vars: &ProfileVariables,
        level: usize,
    ) -> Result<()> {
        trace!("{}Analyse rule : {}", "  ".repeat(level), rule.name);
        let [source] = rule.sources.as_slice() else {
            return Err(FhirMapError::semantic(format!(
                "rules with {} sources are not supported",
                rule.sources.len()
            ))
            .in_rule(&rule.name));
        };

        let row = context.rows.len();
        context.rows.push(SummaryRow {
            kind: RowKind::Rule,
            depth: level,
            source: String::new(),
            target: String::new(),
        });

        let (mut rule_vars, source_text) = self
            .analyse_source(vars, source)
            .map_err(|e| e.in_rule(&rule.name))?;
        let scope = RuleScope {
            group: &group.name,
            rule: &rule.name,
            source_var: source.variable.as_deref(),
        };
        let mut writer = TargetWriter::default();
        for target in &rule.targets {
            self.analyse_target(context, map, &scope, &mut rule_vars, target, &mut writer)
                .map_err(|e| e.in_rule(&rule.name))?;
        }
        context.rows[row].source = source_text;
        context.rows[row].target = writer.commit();

        if !rule.rules.is_empty() {
            for child in &rule.rules {
                self.analyse_rule(context, map, group, child, &rule_vars, level + 1)?;
            }
        } else if !rule.dependents.is_empty() {
            for dependent in &rule.dependents {
                self.analyse_dependent(context, map, group, dependent, &rule_vars, level + 1)?;
            }
        } else if let Some((source_var, target_var)) = implicit_dispatch(rule) {
            self.analyse_by_types(context, map, &scope, &rule_vars, source_var, target_var, level + 1)?;
        }
        Ok(())
    }

    fn analyse_dependent(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        group: &Group,
        dependent: &Dependent,
        vars: &ProfileVariables,
        level: usize,
    ) -> Result<()> {
        let resolved = context.resolver.resolve_reference(map, &group.name, &dependent.name)?;
        let inputs = &resolved.group().inputs;
        if inputs.len() != dependent.parameters.len() {
            return Err(FhirMapError::semantic(format!(
                "Rule '{}' has {} inputs but the invocation has {} variables",
                dependent.name,
                inputs.len(),
                dependent.parameters.len()
            )));
        }

        let mut bound = ProfileVariables::default();
        for (input, parameter) in inputs.iter().zip(&dependent.parameters) {
            let mode = match input.mode {
                InputMode::Source => VariableMode::Input,
                InputMode::Target => VariableMode::Output,
            };
            let property = match parameter {
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
                TransformParameter::Literal(literal) if mode == VariableMode::Input => {
                    ProfiledProperty::root(literal.type_name())
                }
                TransformParameter::Literal(literal) => {
                    return Err(FhirMapError::semantic(format!(
                        "Rule '{}' target '{}' cannot be the literal {literal}",
                        dependent.name, input.name
                    )));
                }
            };
            bound.add(mode, &input.name, property);
        }
        self.analyse_group(context, &resolved.map, resolved.index, &bound, level)
    }

    #[allow(clippy::too_many_arguments)]
    fn analyse_by_types(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        scope: &RuleScope<'_>,
        vars: &ProfileVariables,
        source_var: &str,
        target_var: &str,
        level: usize,
    ) -> Result<()> {
        let (Some(source), Some(target)) = (
            vars.get(VariableMode::Input, source_var),
            vars.get(VariableMode::Output, target_var),
        ) else {
            return Ok(());
        };
        let source_type = source.types.single_type(&source.path)?;
        let target_type = target.types.single_type(&target.path)?;
        let resolved =
            match context
                .resolver
                .resolve_by_types(map, scope.group, scope.rule, source_type, target_type)
            {
                Ok(resolved) => resolved,
                Err(FhirMapError::Resolution {
                    reason: ResolutionFailure::NotFound,
                    ..
                }) if self.provider.is_primitive(source_type) && self.provider.is_primitive(target_type) => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

        let inputs = &resolved.group().inputs;
        let mut bound = ProfileVariables::default();
        bound.add(VariableMode::Input, &inputs[0].name, source.clone());
        bound.add(VariableMode::Output, &inputs[1].name, target.clone());
        self.analyse_group(context, &resolved.map, resolved.index, &bound, level)
    }

    fn analyse_source(
        &self,
        vars: &ProfileVariables,
        source: &RuleSource,
    ) -> Result<(ProfileVariables, String)> {
        let mut fork = vars.clone();
        if source.is_search() {
            let text = format!("search({})", source.element.as_deref().unwrap_or_default());
            if let Some(variable) = &source.variable {
                let property = ProfiledProperty {
                    path: text.clone(),
                    types: TypeDetails::singleton("Resource"),
                    profile: None,
                };
                fork.add(VariableMode::Input, variable, property);
            }
            return Ok((fork, text));
        }

        let owner = vars.get(VariableMode::Input, &source.context).ok_or_else(|| {
            FhirMapError::not_found(format!(
                "Unknown input variable {} (vars = {})",
                source.context,
                vars.summary()
            ))
        })?;

        let Some(element) = &source.element else {
            let mut property = owner.clone();
            if let Some(declared) = &source.type_name {
                let allowed = owner.types.types.is_empty()
                    || owner
                        .types
                        .types
                        .iter()
                        .any(|t| self.compatible(declared, &t.name));
                if !allowed {
                    return Err(FhirMapError::semantic(format!(
                        "Type {declared} is not allowed for {} ({})",
                        owner.path,
                        owner.types.type_names().join(", ")
                    )));
                }
                property.types = TypeDetails::singleton(declared.as_str());
            }
            if let Some(variable) = &source.variable {
                fork.add(VariableMode::Input, variable, property);
            }
            return Ok((fork, owner.path.clone()));
        };

        let owner_type = owner.types.single_type(&owner.path)?;
        let path = format!("{}.{element}", owner.path);
        let info = self
            .provider
            .element(owner_type, element)
            .ok_or_else(|| FhirMapError::not_found(format!("Unknown element name {path}")))?;
        let types = self.element_types(&info, element, source.type_name.as_deref(), &path)?;
        if let Some(variable) = &source.variable {
            let property = ProfiledProperty {
                path: path.clone(),
                types,
                profile: None,
            };
            fork.add(VariableMode::Input, variable, property);
        }
        Ok((fork, path))
    }

    fn analyse_target(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        scope: &RuleScope<'_>,
        vars: &mut ProfileVariables,
        target: &RuleTarget,
        writer: &mut TargetWriter,
    ) -> Result<()> {
        let owner = match &target.context {
            Some(name) => {
                let owner = vars
                    .get(VariableMode::Output, name)
                    .cloned()
                    .ok_or_else(|| FhirMapError::not_found(format!("target context not known: {name}")))?;
                if target.element.is_none() {
                    return Err(FhirMapError::semantic(format!(
                        "Target context {name} is used without an element"
                    )));
                }
                Some(owner)
            }
            None => None,
        };
        let element = target.element.as_deref().unwrap_or_default();
        let info = match &owner {
            Some(owner) => {
                let owner_type = owner.types.single_type(&owner.path)?;
                Some(self.provider.element(owner_type, element).ok_or_else(|| {
                    FhirMapError::not_found(format!("Unknown property {element} on {}", owner.path))
                })?)
            }
            None => None,
        };

        let types = match target.transform {
            Some(transform) => {
                self.analyse_transform(context, map, scope, vars, target, transform, info.as_ref(), element)?
            }
            None => match &info {
                Some(info) => self.element_types(info, element, None, element)?,
                None => {
                    return Err(FhirMapError::semantic(
                        "Target has neither a context nor a transform",
                    ));
                }
            },
        };

        if let (Some(owner), Some(context_name)) = (&owner, &target.context) {
            let maps_source = scope
                .source_var
                .is_some_and(|sv| target.parameters.iter().any(|p| p.as_variable() == Some(sv)));
            let implicit = target.transform == Some(Transform::Create) && target.parameters.is_empty();
            if maps_source || implicit {
                writer.value_assignment(
                    context_name,
                    format!("{}.{element}{}", owner.path, transform_suffix(target.transform)),
                );
            } else if is_significant_element(&owner.path, element) {
                if let Some(description) = self.describe_transform(target)? {
                    writer.key_assignment(context_name, format!("{}.{element} = {description}", owner.path));
                }
            }
        }
        if target.transform == Some(Transform::Create) {
            if let (Some(variable), [only]) = (&target.variable, types.types.as_slice()) {
                if self.provider.is_resource(&only.name) {
                    writer.new_resource(variable, &only.name);
                }
            }
        }

        let fixed = self.fixed_value(target)?;
        let property = match (&owner, &info) {
            (Some(owner), Some(info)) => {
                self.update_profile(context, owner, info, element, types, fixed, scope.rule)?
            }
            _ => {
                let type_name = types.single_type(scope.rule)?.to_string();
                let property = ProfiledProperty {
                    path: type_name.clone(),
                    types,
                    profile: None,
                };
                if target.transform == Some(Transform::Create) && self.provider.type_info(&type_name).is_some() {
                    self.create_profile(context, map, property, scope.rule)?
                } else {
                    property
                }
            }
        };
        if let Some(variable) = &target.variable {
            vars.add(VariableMode::Output, variable, property);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn analyse_transform(
        &self,
        context: &mut AnalysisContext,
        map: &Arc<StructureMap>,
        scope: &RuleScope<'_>,
        vars: &ProfileVariables,
        target: &RuleTarget,
        transform: Transform,
        info: Option<&ElementInfo>,
        element: &str,
    ) -> Result<TypeDetails> {
        let params = &target.parameters;
        let declared = || match info {
            Some(info) => self.element_types(info, element, None, element),
            None => Ok(TypeDetails::singleton("Base")),
        };
        Ok(match transform {
            Transform::Create => match params.first() {
                Some(param) => {
                    let stated = param_literal(param)?;
                    let url = map
                        .structures
                        .iter()
                        .find(|s| s.mode == ModelMode::Target && s.alias.as_deref() == Some(stated.as_str()))
                        .map_or(stated.as_str(), |s| s.url.as_str());
                    TypeDetails::singleton(context.resolver.actual_type(map, url))
                }
                None => {
                    if let Some(info) = info {
                        let details = self.element_types(info, element, None, element)?;
                        if !(details.types.len() == 1 && details.has_type("Resource")) {
                            return Ok(details);
                        }
                    }
                    let source = scope
                        .source_var
                        .and_then(|name| vars.get(VariableMode::Input, name))
                        .ok_or_else(|| {
                            FhirMapError::semantic(
                                "Cannot determine type implicitly because there is no single input variable",
                            )
                        })?;
                    let source_type = source.types.single_type(&source.path)?;
                    match context.resolver.default_target_type(map, scope.group, source_type) {
                        Ok(found) => TypeDetails::singleton(found),
                        Err(FhirMapError::Resolution {
                            reason: ResolutionFailure::NotFound,
                            ..
                        }) if self.provider.is_primitive(source_type) => TypeDetails::singleton(source_type),
                        Err(err) => return Err(err),
                    }
                }
            },
            Transform::Copy => match params.first() {
                Some(TransformParameter::Variable(name)) => self.variable_types(vars, name)?,
                Some(TransformParameter::Literal(Literal::Null)) | None => declared()?,
                Some(TransformParameter::Literal(literal)) => TypeDetails::singleton(literal.type_name()),
            },
            Transform::Evaluate => declared()?,
            Transform::Truncate | Transform::Escape | Transform::Append | Transform::Uuid => {
                TypeDetails::singleton("string")
            }
            Transform::Cast => match params.get(1) {
                Some(param) => TypeDetails::singleton(param_literal(param)?),
                None => declared()?,
            },
            Transform::Translate => {
                let field = params.get(2).map(TransformParameter::as_text);
                TypeDetails::singleton(match field.as_deref() {
                    Some("code") => "code",
                    Some("system") => "uri",
                    Some("display") => "string",
                    Some("CodeableConcept") => "CodeableConcept",
                    _ => "Coding",
                })
            }
            Transform::Reference => {
                let name = params.first().and_then(TransformParameter::as_variable).ok_or_else(|| {
                    FhirMapError::semantic("reference needs a variable naming the referenced resource")
                })?;
                let referenced = vars.get(VariableMode::Output, name).ok_or_else(|| {
                    FhirMapError::not_found(format!("Unable to resolve variable \"{name}\""))
                })?;
                let mut reference = ProfiledType::new("Reference");
                if let Some(slot) = &referenced.profile {
                    reference.profiles.push(context.profiles[slot.index].url.clone());
                }
                TypeDetails::of(reference)
            }
            Transform::Pointer => TypeDetails::singleton("uri"),
            Transform::DateOp => {
                return Err(FhirMapError::semantic("Transform dateOp is not supported"));
            }
            Transform::Cc => {
                let mut concept = ProfiledType::new("CodeableConcept");
                if let Some(name) = params.get(1).and_then(TransformParameter::as_variable) {
                    concept.binding = self
                        .variable_types(vars, name)
                        .ok()
                        .and_then(|t| t.binding().map(str::to_string));
                }
                TypeDetails::of(concept)
            }
            Transform::C => TypeDetails::singleton("Coding"),
            Transform::Qty => TypeDetails::singleton("Quantity"),
            Transform::Id => TypeDetails::singleton("Identifier"),
            Transform::Cp => TypeDetails::singleton("ContactPoint"),
        })
    }

    /// Types of an element, narrowed by a typed element name or a declared
    /// type
    fn element_types(
        &self,
        info: &ElementInfo,
        element: &str,
        declared: Option<&str>,
        path: &str,
    ) -> Result<TypeDetails> {
        let candidates: Vec<&str> = match info.choice_type_for(element) {
            Some(typed) => vec![typed],
            None => info.types.iter().map(String::as_str).collect(),
        };
        let chosen = match declared {
            Some(declared) if candidates.iter().any(|t| self.compatible(declared, t)) => vec![declared],
            Some(declared) => {
                return Err(FhirMapError::semantic(format!(
                    "Type {declared} is not allowed for {path} ({})",
                    candidates.join(", ")
                )));
            }
            None => candidates,
        };

        let mut details = TypeDetails::empty(CollectionStatus::Singleton);
        for name in chosen {
            details.add_type(ProfiledType {
                name: name.to_string(),
                profiles: Vec::new(),
                binding: info.binding.clone(),
            });
        }
        Ok(details)
    }

    fn variable_types(&self, vars: &ProfileVariables, name: &str) -> Result<TypeDetails> {
        let mut segments = name.split('.');
        let head = segments.next().unwrap_or_default();
        let mut property = vars
            .lookup(head)
            .cloned()
            .ok_or_else(|| FhirMapError::not_found(format!("Variable {name} not found ({})", vars.summary())))?;
        for segment in segments {
            let owner_type = property.types.single_type(&property.path)?;
            let path = format!("{}.{segment}", property.path);
            let info = self
                .provider
                .element(owner_type, segment)
                .ok_or_else(|| FhirMapError::not_found(format!("Unknown element name {path}")))?;
            property.types = self.element_types(&info, segment, None, &path)?;
            property.path = path;
        }
        Ok(property.types)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_profile(
        &self,
        context: &mut AnalysisContext,
        owner: &ProfiledProperty,
        info: &ElementInfo,
        element: &str,
        types: TypeDetails,
        fixed: Option<Value>,
        rule: &str,
    ) -> Result<ProfiledProperty> {
        let path = format!("{}.{element}", owner.path);
        let Some(slot) = &owner.profile else {
            return Ok(ProfiledProperty {
                path,
                types,
                profile: None,
            });
        };

        let element_path = format!("{}.{}", slot.path, info.name);
        let mut constraints = Vec::new();
        for profiled in &types.types {
            if let Some(code) = self.check_type(profiled, info, &element_path)? {
                constraints.push((code, profiled));
            }
        }

        let definition = context.profiles[slot.index].element_mut(&element_path);
        definition.slice_name = Some(rule.to_string());
        if fixed.is_some() {
            definition.fixed = fixed;
        }
        if definition.binding.is_none() {
            definition.binding = types.binding().map(str::to_string);
        }
        for (code, profiled) in constraints {
            let entry = definition.type_mut(&code);
            for profile in &profiled.profiles {
                let list = if code == "Reference" {
                    &mut entry.target_profile
                } else {
                    &mut entry.profile
                };
                if !list.contains(profile) {
                    list.push(profile.clone());
                }
            }
        }

        Ok(ProfiledProperty {
            path,
            types,
            profile: Some(ProfileSlot {
                index: slot.index,
                path: element_path,
            }),
        })
    }

    /// Declared type of `info` that `profiled` satisfies, or `None` when the
    /// element needs no type constraint
    fn check_type(&self, profiled: &ProfiledType, info: &ElementInfo, path: &str) -> Result<Option<String>> {
        if let [only] = info.types.as_slice() {
            if self.compatible(&profiled.name, only) && profiled.profiles.is_empty() {
                return Ok(None);
            }
        }
        info.types
            .iter()
            .find(|declared| self.compatible(&profiled.name, declared))
            .map(|declared| Some(declared.clone()))
            .ok_or_else(|| {
                FhirMapError::semantic(format!(
                    "Unable to work out what kind of type to use for {} ({path})",
                    profiled.name
                ))
            })
    }

    fn compatible(&self, actual: &str, declared: &str) -> bool {
        actual == declared
            || self.provider.is_subtype_of(actual, declared)
            || (actual == "string" && self.provider.is_subtype_of(declared, "string"))
    }

    fn create_profile(
        &self,
        context: &mut AnalysisContext,
        map: &StructureMap,
        property: ProfiledProperty,
        slice_name: &str,
    ) -> Result<ProfiledProperty> {
        let type_name = property.types.single_type(&property.path)?.to_string();
        if type_name.contains('.') {
            return Err(FhirMapError::semantic(format!(
                "Unable to process entry point {type_name}"
            )));
        }
        let suffix = match context.ids.get_mut(&type_name) {
            Some(counter) => {
                *counter += 1;
                format!("-{counter}")
            }
            None => {
                context.ids.insert(type_name.clone(), 0);
                String::new()
            }
        };

        let id = format!("{}-{type_name}{suffix}", map.name);
        let profile = ProfileSkeleton {
            url: format!("{}{id}", self.config.profile_base_url),
            id,
            name: format!("Profile for {type_name} for {slice_name}"),
            base_definition: self.provider.type_url(&type_name),
            derivation: "constraint".to_string(),
            status: map.status.clone(),
            description: format!("Generated automatically from the mapping {}", map.url),
            differential: vec![ElementDefinition::new(type_name.as_str())],
            type_name: type_name.clone(),
        };
        trace!("new profile {} for {type_name}", profile.url);
        context.profiles.push(profile);

        Ok(ProfiledProperty {
            profile: Some(ProfileSlot {
                index: context.profiles.len() - 1,
                path: type_name,
            }),
            ..property
        })
    }

    /// Value every instance gets when the target's parameters are all
    /// literals
    fn fixed_value(&self, target: &RuleTarget) -> Result<Option<Value>> {
        let literals: Option<Vec<&Literal>> = target
            .parameters
            .iter()
            .map(|p| match p {
                TransformParameter::Literal(literal) => Some(literal),
                TransformParameter::Variable(_) => None,
            })
            .collect();
        let Some(literals) = literals else {
            return Ok(None);
        };
        match (target.transform, literals.as_slice()) {
            (Some(Transform::Copy), [literal]) => Ok(literal_json(literal)),
            (Some(Transform::C), [system, code, rest @ ..]) => {
                let coding = self.fixed_coding(system, code, rest.first().copied())?;
                Ok(Some(serde_json::to_value(coding)?))
            }
            (Some(Transform::Cc), [text]) => {
                let mut concept = Map::new();
                concept.insert("text".into(), Value::String(text.as_text()));
                Ok(Some(Value::Object(concept)))
            }
            (Some(Transform::Cc), [system, code, rest @ ..]) => {
                let coding = self.fixed_coding(system, code, rest.first().copied())?;
                let mut concept = Map::new();
                concept.insert("coding".into(), Value::Array(vec![serde_json::to_value(coding)?]));
                Ok(Some(Value::Object(concept)))
            }
            _ => Ok(None),
        }
    }

    fn fixed_coding(&self, system: &Literal, code: &Literal, display: Option<&Literal>) -> Result<Coding> {
        let mut coding =
            builtins::build_coding(self.terminology.as_deref(), &system.as_text(), &code.as_text())?;
        if let Some(display) = display {
            coding.display = Some(display.as_text());
        }
        Ok(coding)
    }

    /// Short text for a key assignment, e.g. `LOINC#1234-5`
    fn describe_transform(&self, target: &RuleTarget) -> Result<Option<String>> {
        match (target.transform, target.parameters.as_slice()) {
            (Some(Transform::Copy), [TransformParameter::Literal(literal)]) => Ok(Some(literal.as_text())),
            (
                Some(Transform::C | Transform::Cc),
                [TransformParameter::Literal(system), TransformParameter::Literal(code), ..],
            ) => {
                let (system, code) = (system.as_text(), code.as_text());
                if system.is_empty() {
                    return Err(FhirMapError::semantic("Describe Transform, but the uri is blank"));
                }
                if code.is_empty() {
                    return Err(FhirMapError::semantic("Describe Transform, but the code is blank"));
                }
                let coding = builtins::build_coding(self.terminology.as_deref(), &system, &code)?;
                let display = coding.display.map(|d| format!(" ({d})")).unwrap_or_default();
                Ok(Some(format!(
                    "{}#{}{display}",
                    describe_system(coding.system.as_deref().unwrap_or(&system)),
                    coding.code.unwrap_or(code)
                )))
            }
            _ => Ok(None),
        }
    }
}

fn param_literal(param: &TransformParameter) -> Result<String> {
    match param {
        TransformParameter::Literal(literal) => Ok(literal.as_text()),
        TransformParameter::Variable(name) => Err(FhirMapError::semantic(format!(
            "Parameter {name} must be a literal when analysing"
        ))),
    }
}

fn literal_json(literal: &Literal) -> Option<Value> {
    let number = |text: String| text.parse::<Number>().map(Value::Number).unwrap_or(Value::String(text));
    match literal {
        Literal::String(s) | Literal::Special(s) => Some(Value::String(s.clone())),
        Literal::Integer(i) => Some(Value::from(*i)),
        Literal::Decimal(d) => Some(number(d.to_string())),
        Literal::Boolean(b) => Some(Value::Bool(*b)),
        Literal::Quantity { value, unit } => {
            let mut quantity = Map::new();
            quantity.insert("value".into(), number(value.to_string()));
            quantity.insert("unit".into(), Value::String(unit.clone()));
            quantity.insert("system".into(), Value::String(UCUM.to_string()));
            quantity.insert("code".into(), Value::String(unit.clone()));
            Some(Value::Object(quantity))
        }
        Literal::Null => None,
    }
}

/// Elements whose value tells what kind of instance was produced
fn is_significant_element(path: &str, element: &str) -> bool {
    match path {
        "Observation" => element == "code",
        "Bundle" => element == "type",
        _ => false,
    }
}

fn transform_suffix(transform: Option<Transform>) -> &'static str {
    match transform {
        None | Some(Transform::Copy | Transform::Create) => "",
        Some(Transform::Truncate) => " (truncated)",
        Some(Transform::Translate) => " (translated)",
        Some(Transform::Evaluate) => " (evaluated)",
        Some(Transform::Cc) => " (--> CodeableConcept)",
        Some(Transform::C) => " (--> Coding)",
        Some(Transform::Qty) => " (--> Quantity)",
        Some(Transform::Id) => " (--> Identifier)",
        Some(Transform::Cp) => " (--> ContactPoint)",
        Some(Transform::Reference) => " (--> Reference)",
        Some(_) => " (transformed)",
    }
}

fn describe_system(system: &str) -> &str {
    match system {
        "http://snomed.info/sct" => "SNOMED CT",
        "http://loinc.org" => "LOINC",
        "http://unitsofmeasure.org" => "UCUM",
        "http://www.nlm.nih.gov/research/umls/rxnorm" => "RxNorm",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::mapping::parse_map;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn analyse(text: &str) -> Result<MapAnalysis> {
        MapAnalyzer::new().analyze(&parse_map(text)?)
    }

    #[test]
    fn profiles_follow_targets() {
        let analysis = analyse(
            "map \"http://x/map\" = \"Demo\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.name as n -> tgt.name as tn then {\n\
                 n.family as f -> tn.family = f \"family\";\n\
               } \"names\";\n\
               src.gender as g -> tgt.gender = g \"gender\";\n\
             }",
        )
        .unwrap();

        assert_eq!(analysis.profiles.len(), 1);
        let profile = &analysis.profiles[0];
        assert_eq!(profile.id, "Demo-Patient");
        assert_eq!(profile.url, "http://hl7.org/fhir/StructureDefinition/Demo-Patient");
        assert_eq!(profile.base_definition, "http://hl7.org/fhir/StructureDefinition/Patient");
        let paths: Vec<&str> = profile.differential.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["Patient", "Patient.name", "Patient.name.family", "Patient.gender"]);
        assert_eq!(profile.element("Patient.gender").unwrap().slice_name.as_deref(), Some("gender"));

        let sources: Vec<&str> = analysis.summary.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(sources, vec!["Input: Patient", "Patient.name", "Patient.name.family", "Patient.gender"]);
        assert_eq!(analysis.summary[2].depth, 2);
        assert_eq!(analysis.summary[3].target, "Patient.gender");
    }

    #[test]
    fn repeated_types_get_numbered_profiles() {
        let analysis = analyse(
            "map \"http://x/map\" = \"Two\"\n\
             group Main(source src : Patient, target a : Patient, target b : Patient) {\n\
               src.active as v -> a.active = v, b.active = v \"active\";\n\
             }",
        )
        .unwrap();
        let ids: Vec<&str> = analysis.profiles.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["Two-Patient", "Two-Patient-1"]);
        assert_eq!(analysis.summary[1].target, "Patient.active, Patient.active");
    }

    #[test]
    fn fixed_codings_are_recorded() {
        let analysis = analyse(
            "map \"http://x/map\" = \"Obs\"\n\
             group Main(source src : Patient, target bundle : Bundle) {\n\
               src -> bundle.type = 'batch' \"type\";\n\
               src -> create('Observation') as obs then {\n\
                 src -> obs.code = cc('http://loinc.org', '1234-5') \"code\";\n\
               } \"obs\";\n\
             }",
        )
        .unwrap();

        let bundle = analysis.profile_for("Bundle").unwrap();
        assert_eq!(bundle.element("Bundle.type").unwrap().fixed, Some(json!("batch")));
        assert_eq!(analysis.summary[1].target, "Bundle.type = batch");

        let observation = analysis.profile_for("Observation").unwrap();
        assert_eq!(observation.name, "Profile for Observation for obs");
        assert_eq!(
            observation.element("Observation.code").unwrap().fixed,
            Some(json!({"coding": [{"system": "http://loinc.org", "code": "1234-5"}]}))
        );
        assert_eq!(analysis.summary[2].target, "new Observation");
        assert_eq!(analysis.summary[3].target, "Observation.code = LOINC#1234-5");
    }

    #[test]
    fn choice_elements_need_a_type() {
        let typed = analyse(
            "map \"http://x/map\" = \"C\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.deceased : boolean as d -> tgt.deceased = d \"typed\";\n\
               src.deceasedDateTime as d -> tgt.deceased = d \"suffix\";\n\
             }",
        )
        .unwrap();
        let deceased = typed.profiles[0].element("Patient.deceased[x]").unwrap();
        let codes: Vec<&str> = deceased.types.iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["boolean", "dateTime"]);

        let err = analyse(
            "map \"http://x/map\" = \"C\"\n\
             group Main(source src : Observation, target tgt : Observation) {\n\
               src.value as v then {\n\
                 v.unit as u -> tgt.status = u;\n\
               } \"value\";\n\
             }",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FhirMapError::Resolution { reason: ResolutionFailure::Ambiguous, .. }
        ));
    }

    #[test]
    fn incompatible_types_are_rejected() {
        let err = analyse(
            "map \"http://x/map\" = \"C\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.birthDate as d -> tgt.active = d \"wrong\";\n\
             }",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Semantic);
        assert!(err.to_string().contains("Unable to work out what kind of type to use for date"));
    }

    #[test]
    fn recursive_groups_terminate() {
        let analysis = analyse(
            "map \"http://x/map\" = \"R\"\n\
             group Main(source src : Extension, target tgt : Extension) {\n\
               src.extension as e -> tgt.extension as te then Main(e, te) \"nested\";\n\
             }",
        )
        .unwrap();
        assert_eq!(analysis.summary.len(), 2);
    }

    #[test]
    fn ambiguous_type_dispatch_fails() {
        let err = analyse(
            "map \"http://x/map\" = \"A\"\n\
             group Main(source src : Patient, target tgt : Patient) {\n\
               src.name as n -> tgt.name as tn \"names\";\n\
               src.name -> tgt.name \"implicit\";\n\
             }\n\
             group One(source s : HumanName, target t : HumanName) <<types>> {\n\
               s.family as f -> t.family = f \"f\";\n\
             }\n\
             group Two(source s : HumanName, target t : HumanName) <<types>> {\n\
               s.text as x -> t.text = x \"x\";\n\
             }",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            FhirMapError::Resolution { reason: ResolutionFailure::Ambiguous, .. }
        ));
        assert!(err.to_string().contains("Multiple possible matches"));
    }

    #[test]
    fn unknown_inputs_are_reported() {
        let err = analyse(
            "map \"http://x/map\" = \"U\"\n\
             group Main(source src : Nothing, target tgt : Patient) {\n\
               src -> tgt.active = true \"x\";\n\
             }",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unable to find structure definition for Nothing"));
    }
}
