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

//! Concept translation for the `translate` transform.

use log::debug;

use crate::core::{FhirMapError, Result, TranslationFailure};
use crate::mapping::{ConceptMap, ConceptMapEquivalence, StructureMap, UnmappedMode};
use crate::model::{FhirPathValue, Node};

use super::registry::MapRegistry;
use super::services::{Coding, TransformerServices};

/// Reserved concept map translating OIDs to code system URIs
pub const OID_TO_URI_MAP: &str = "http://hl7.org/fhir/ConceptMap/special-oid2uri";

const OID_URIS: &[(&str, &str)] = &[
    ("2.16.840.1.113883.6.1", "http://loinc.org"),
    ("2.16.840.1.113883.6.96", "http://snomed.info/sct"),
    ("2.16.840.1.113883.6.8", "http://unitsofmeasure.org"),
    ("2.16.840.1.113883.6.88", "http://www.nlm.nih.gov/research/umls/rxnorm"),
    ("2.16.840.1.113883.6.3", "http://hl7.org/fhir/sid/icd-10"),
    ("2.16.840.1.113883.6.90", "http://hl7.org/fhir/sid/icd-10-cm"),
    ("2.16.840.1.113883.12.292", "http://hl7.org/fhir/sid/cvx"),
    ("2.16.840.1.113883.4.1", "http://hl7.org/fhir/sid/us-ssn"),
    ("2.16.840.1.113883.6.73", "http://www.whocc.no/atc"),
];

/// Code system URI for a well-known OID
pub fn oid_to_uri(oid: &str) -> Option<&'static str> {
    let oid = oid.strip_prefix("urn:oid:").unwrap_or(oid);
    OID_URIS
        .iter()
        .find(|(known, _)| *known == oid)
        .map(|(_, uri)| *uri)
}

/// Coding to translate, read from a primitive code, a `Coding` or a v2 `CE`
pub fn source_coding(value: &FhirPathValue) -> Result<Coding> {
    let unsupported = || {
        FhirMapError::translation(
            TranslationFailure::Unsupported,
            format!("Unable to translate source {}", value.type_name()),
        )
    };
    let node = match value {
        FhirPathValue::Node(node) if !node.has_value() => node,
        other => {
            let code = other.as_string().ok_or_else(unsupported)?;
            return Ok(Coding::new(None, &code));
        }
    };
    let text = |name: &str| node.child(name).and_then(|c| c.value()).and_then(|v| v.as_string());
    match node.type_name().as_str() {
        "Coding" => Ok(Coding {
            system: text("system"),
            code: text("code"),
            display: None,
        }),
        "CE" => Ok(Coding {
            system: text("codeSystem"),
            code: text("code"),
            display: None,
        }),
        _ => Err(unsupported()),
    }
}

/// Look `source` up in `concept_map`.
///
/// The first source element carrying the code decides the outcome. Its
/// targets are scanned in order: an acceptable equivalence is the answer
/// and a second one is an error; `unmatched` before any answer yields
/// `None`, after an answer it is ignored. `label` names the map in
/// messages.
pub fn translate_with_map(
    concept_map: &ConceptMap,
    label: &str,
    source: &Coding,
) -> Result<Option<Coding>> {
    let code = source.code.as_deref().unwrap_or_default();
    let system_matches = |group_source: &str| {
        source
            .system
            .as_deref()
            .is_none_or(|system| system == group_source)
    };

    let found = concept_map.groups.iter().find_map(|group| {
        if !system_matches(&group.source) {
            return None;
        }
        group
            .elements
            .iter()
            .find(|element| element.code == code)
            .map(|element| (group, element))
    });

    let Some((group, element)) = found else {
        let provided = concept_map
            .groups
            .iter()
            .find(|g| system_matches(&g.source) && g.unmapped == Some(UnmappedMode::Provided));
        if let Some(group) = provided {
            debug!("Concept map {label} passes unmapped code {code} through");
            return Ok(Some(Coding {
                system: group.target.clone().or_else(|| source.system.clone()),
                code: Some(code.to_string()),
                display: None,
            }));
        }
        return Err(FhirMapError::translation(
            TranslationFailure::NoMatch,
            format!("Concept map {label} found no translation for {code}"),
        ));
    };

    if element.targets.is_empty() {
        return Err(FhirMapError::translation(
            TranslationFailure::NoTarget,
            format!("Concept map {label} lists {code} without any target"),
        ));
    }

    let mut outcome: Option<Coding> = None;
    for target in &element.targets {
        if target.equivalence.is_acceptable() {
            if outcome.is_some() {
                return Err(FhirMapError::translation(
                    TranslationFailure::Ambiguous,
                    format!("Concept map {label} found multiple matches for {code}"),
                ));
            }
            outcome = Some(Coding {
                system: group.target.clone(),
                code: target.code.clone(),
                display: None,
            });
        } else if target.equivalence == ConceptMapEquivalence::Unmatched
            && outcome.is_none()
        {
            return Ok(None);
        }
    }
    match outcome {
        Some(coding) => Ok(Some(coding)),
        None => Err(FhirMapError::translation(
            TranslationFailure::NoUsableTarget,
            format!("Concept map {label} found no usable translation for {code}"),
        )),
    }
}

/// Shape the translated coding into the requested output field
pub fn translation_output(coding: Option<Coding>, field: Option<&str>) -> Result<Option<FhirPathValue>> {
    let Some(coding) = coding else {
        return Ok(None);
    };
    let text = |value: Option<String>| value.map(FhirPathValue::String);
    Ok(match field {
        Some("code") => text(coding.code),
        Some("system") => text(coding.system),
        Some("display") => text(coding.display),
        None | Some("Coding") | Some("coding") => Some(FhirPathValue::Node(coding.to_node())),
        Some("CodeableConcept") => {
            let concept = Node::new("CodeableConcept");
            concept.add_child("coding", coding.to_node());
            Some(FhirPathValue::Node(concept))
        }
        Some(other) => {
            return Err(FhirMapError::translation(
                TranslationFailure::Unsupported,
                format!("Unknown translate output '{other}'"),
            ));
        }
    })
}

/// Run a `translate(source, map, output)` transform.
///
/// `#id` finds a concept map contained in `map`, `url#id` one contained in a
/// registered map, anything else a registered concept map. When none is
/// found the host services get the final word.
pub fn translate(
    map: &StructureMap,
    registry: &dyn MapRegistry,
    services: &dyn TransformerServices,
    source: &FhirPathValue,
    concept_map_url: &str,
    field: Option<&str>,
) -> Result<Option<FhirPathValue>> {
    let coding = source_coding(source)?;

    if concept_map_url == OID_TO_URI_MAP {
        let oid = coding.code.unwrap_or_default();
        let uri = oid_to_uri(&oid)
            .map(str::to_string)
            .unwrap_or_else(|| format!("urn:oid:{oid}"));
        return match field {
            None | Some("uri") | Some("code") => Ok(Some(FhirPathValue::String(uri))),
            Some(other) => Err(FhirMapError::translation(
                TranslationFailure::Unsupported,
                format!("OID translation cannot return '{other}'"),
            )),
        };
    }

    let (concept_map, label) = if let Some(id) = concept_map_url.strip_prefix('#') {
        let found = map.contained_concept_map(id).cloned().ok_or_else(|| {
            FhirMapError::translation(
                TranslationFailure::NoConceptMap,
                format!("Unable to translate - cannot find map {concept_map_url}"),
            )
        })?;
        (Some(found), format!("{}{concept_map_url}", map.url))
    } else if let Some((map_url, id)) = concept_map_url.split_once('#') {
        let found = registry
            .get_map(map_url)
            .and_then(|other| other.contained_concept_map(id).cloned());
        (found, concept_map_url.to_string())
    } else {
        let found = registry.get_concept_map(concept_map_url).map(|cm| (*cm).clone());
        (found, concept_map_url.to_string())
    };

    let outcome = match concept_map {
        Some(concept_map) => translate_with_map(&concept_map, &label, &coding)?,
        None => services.translate(&coding, concept_map_url)?,
    };
    translation_output(outcome, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{ConceptMapGroup, SourceElement, TargetElement};
    use crate::transform::registry::InMemoryMapRegistry;
    use crate::transform::services::DefaultServices;

    fn concept_map(targets: Vec<(Option<&str>, ConceptMapEquivalence)>) -> ConceptMap {
        ConceptMap {
            id: "cm".into(),
            url: Some("http://cm".into()),
            status: None,
            groups: vec![ConceptMapGroup {
                source: "S".into(),
                target: Some("T".into()),
                unmapped: None,
                elements: vec![SourceElement {
                    code: "x".into(),
                    targets: targets
                        .into_iter()
                        .map(|(code, equivalence)| TargetElement {
                            code: code.map(str::to_string),
                            equivalence,
                            comment: None,
                        })
                        .collect(),
                }],
            }],
        }
    }

    #[test]
    fn equal_target_translates() {
        let cm = concept_map(vec![(Some("y"), ConceptMapEquivalence::Equal)]);
        let out = translate_with_map(&cm, "cm", &Coding::new(Some("S"), "x")).unwrap().unwrap();
        assert_eq!(out.code.as_deref(), Some("y"));
        assert_eq!(out.system.as_deref(), Some("T"));
    }

    #[test]
    fn absent_code_is_an_error() {
        let cm = concept_map(vec![(Some("y"), ConceptMapEquivalence::Equal)]);
        let err = translate_with_map(&cm, "cm", &Coding::new(Some("S"), "z")).unwrap_err();
        assert!(err.to_string().contains("no translation"));
    }

    #[test]
    fn unmatched_first_is_empty_not_an_error() {
        let cm = concept_map(vec![
            (None, ConceptMapEquivalence::Unmatched),
            (Some("y"), ConceptMapEquivalence::Equal),
        ]);
        assert_eq!(translate_with_map(&cm, "cm", &Coding::new(None, "x")).unwrap(), None);
    }

    #[test]
    fn unmatched_after_a_match_is_ignored() {
        let cm = concept_map(vec![
            (Some("y"), ConceptMapEquivalence::Wider),
            (None, ConceptMapEquivalence::Unmatched),
        ]);
        let out = translate_with_map(&cm, "cm", &Coding::new(None, "x")).unwrap();
        assert_eq!(out.and_then(|c| c.code).as_deref(), Some("y"));
    }

    #[test]
    fn second_acceptable_target_is_ambiguous() {
        let cm = concept_map(vec![
            (Some("y"), ConceptMapEquivalence::Equal),
            (Some("w"), ConceptMapEquivalence::Equivalent),
        ]);
        let err = translate_with_map(&cm, "cm", &Coding::new(None, "x")).unwrap_err();
        assert!(matches!(
            err,
            FhirMapError::Translation {
                reason: TranslationFailure::Ambiguous,
                ..
            }
        ));
    }

    #[test]
    fn only_unusable_targets() {
        let cm = concept_map(vec![(Some("y"), ConceptMapEquivalence::Narrower)]);
        let err = translate_with_map(&cm, "cm", &Coding::new(None, "x")).unwrap_err();
        assert!(err.to_string().contains("found no usable translation"));
        let empty = concept_map(vec![]);
        let err = translate_with_map(&empty, "cm", &Coding::new(None, "x")).unwrap_err();
        assert!(matches!(
            err,
            FhirMapError::Translation {
                reason: TranslationFailure::NoTarget,
                ..
            }
        ));
    }

    #[test]
    fn provided_unmapped_codes_pass_through() {
        let mut cm = concept_map(vec![(Some("y"), ConceptMapEquivalence::Equal)]);
        cm.groups[0].unmapped = Some(UnmappedMode::Provided);
        let out = translate_with_map(&cm, "cm", &Coding::new(Some("S"), "q")).unwrap().unwrap();
        assert_eq!(out.code.as_deref(), Some("q"));
        assert_eq!(out.system.as_deref(), Some("T"));
    }

    #[test]
    fn contained_maps_and_output_fields() {
        let mut map = StructureMap::new("http://x/y", "Y");
        map.contained.push(concept_map(vec![(Some("y"), ConceptMapEquivalence::Equal)]));
        let registry = InMemoryMapRegistry::new();
        let source = FhirPathValue::string("x");
        let code = translate(&map, &registry, &DefaultServices, &source, "#cm", Some("code")).unwrap();
        assert_eq!(code, Some(FhirPathValue::string("y")));
        let coding = translate(&map, &registry, &DefaultServices, &source, "#cm", None)
            .unwrap()
            .unwrap();
        assert_eq!(coding.type_name(), "Coding");
        let err = translate(&map, &registry, &DefaultServices, &source, "#other", None).unwrap_err();
        assert!(err.to_string().contains("cannot find map #other"));
        let err = translate(&map, &registry, &DefaultServices, &source, "http://missing", None).unwrap_err();
        assert!(err.to_string().contains("No map found for http://missing"));
    }

    #[test]
    fn oids_become_uris() {
        let map = StructureMap::new("u", "n");
        let registry = InMemoryMapRegistry::new();
        let out = translate(
            &map,
            &registry,
            &DefaultServices,
            &FhirPathValue::string("2.16.840.1.113883.6.1"),
            OID_TO_URI_MAP,
            Some("uri"),
        )
        .unwrap();
        assert_eq!(out, Some(FhirPathValue::string("http://loinc.org")));
        assert_eq!(oid_to_uri("1.2.3"), None);
    }
}
