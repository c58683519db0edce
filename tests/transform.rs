//! Running maps end to end

use std::sync::Arc;

use octofhir_fhirmap::core::{ResolutionFailure, TranslationFailure};
use octofhir_fhirmap::transform::InMemoryMapRegistry;
use octofhir_fhirmap::{
    ErrorKind, FhirMapError, Node, StructureMapEngine, TransformerServices, parse_map,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::{Value, json};

fn run(engine: &StructureMapEngine, map: &str, source: Value) -> octofhir_fhirmap::Result<Value> {
    let map = engine.parse_map(map, "test.map")?;
    engine.transform_json(&source, None, &map, None)
}

#[test]
fn minimal_map_creates_an_empty_target() {
    let engine = StructureMapEngine::new();
    let map = parse_map(
        "map \"http://x/y\" = \"Y\"\n\
         group Main(source src : A, target tgt : B) { src -> tgt; }",
    )
    .unwrap();
    let out = engine.transform_json(&json!({"a": 1}), Some("A"), &map, Some("B")).unwrap();
    assert_eq!(out, json!({"resourceType": "B"}));
}

#[rstest]
#[case::first("first", vec!["a"])]
#[case::last("last", vec!["c"])]
#[case::not_first("not_first", vec!["b", "c"])]
#[case::not_last("not_last", vec!["a", "b"])]
fn source_list_modes(#[case] mode: &str, #[case] expected: Vec<&str>) {
    let map = format!(
        "map \"http://x/list\" = \"List\"\n\
         group Main(source src : Patient, target tgt : Patient) {{\n\
           src.name as n -> tgt.name as tn then {{\n\
             n.given {mode} as g -> tn.given = g \"given\";\n\
           }} \"name\";\n\
         }}"
    );
    let source = json!({"resourceType": "Patient", "name": [{"given": ["a", "b", "c"]}]});
    let out = run(&StructureMapEngine::new(), &map, source).unwrap();
    assert_eq!(out["name"][0]["given"], json!(expected));
}

#[test]
fn only_one_rejects_lists() {
    let map = "map \"http://x/list\" = \"List\"\n\
               group Main(source src : Patient, target tgt : Patient) {\n\
                 src.name only_one as n -> tgt.name = n \"name\";\n\
               }";
    let source = json!({"resourceType": "Patient", "name": [{"family": "A"}, {"family": "B"}]});
    let err = run(&StructureMapEngine::new(), map, source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation);
    assert!(err.to_string().contains("more than one item"));
}

#[rstest]
#[case::where_clause("src.name as n where n.family -> tgt.name = n \"keep\";")]
#[case::check_clause("src.name as n check n.given -> tgt.name = n \"keep\";")]
fn conditions_must_be_boolean(#[case] rule: &str) {
    let map = format!(
        "map \"http://x/cond\" = \"Cond\"\n\
         group Main(source src : Patient, target tgt : Patient) {{\n  {rule}\n}}"
    );
    let source = json!({"resourceType": "Patient", "name": [{"family": "Doe", "given": ["Jo"]}]});
    let err = run(&StructureMapEngine::new(), &map, source).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Evaluation, "{err}");
    assert!(err.to_string().contains("instead of a boolean"), "{err}");
}

#[rstest]
#[case::assigned_target("src.gender as g -> tgt.bogus = g \"assign\";", "Patient.bogus")]
#[case::created_target("src -> tgt.bogus as b \"make\";", "Patient.bogus")]
#[case::source_element("src.nonsense as x -> tgt.active = true \"read\";", "Patient.nonsense")]
fn unknown_elements_are_rejected(#[case] rule: &str, #[case] path: &str) {
    let map = format!(
        "map \"http://x/unknown\" = \"Unknown\"\n\
         group Main(source src : Patient, target tgt : Patient) {{\n  {rule}\n}}"
    );
    let source = json!({"resourceType": "Patient", "gender": "male"});
    let err = run(&StructureMapEngine::new(), &map, source).unwrap_err();
    assert!(
        matches!(err, FhirMapError::Resolution { reason: ResolutionFailure::NotFound, .. }),
        "{err}"
    );
    assert!(err.to_string().contains(&format!("Unknown element name {path}")), "{err}");
}

const GENDER_MAP: &str = r#"map "http://x/gender" = "Gender"

conceptmap "genders" {
  prefix s = "http://hl7.org/fhir/administrative-gender"
  prefix t = "http://example.org/gender"

  s:male == t:M
  s:female == t:F
  s:other --
}

group Main(source src : Patient, target tgt : Patient) {
  src.gender as g -> tgt.gender = translate(g, '#genders', 'code') "gender";
}
"#;

#[rstest]
#[case::equal("male", Some("M"))]
#[case::unmatched("other", None)]
fn translation_through_contained_maps(#[case] gender: &str, #[case] expected: Option<&str>) {
    let source = json!({"resourceType": "Patient", "gender": gender});
    let out = run(&StructureMapEngine::new(), GENDER_MAP, source).unwrap();
    assert_eq!(out.get("gender").and_then(Value::as_str), expected);
}

#[test]
fn untranslatable_codes_fail() {
    let source = json!({"resourceType": "Patient", "gender": "unknown"});
    let err = run(&StructureMapEngine::new(), GENDER_MAP, source).unwrap_err();
    assert!(matches!(
        err,
        FhirMapError::Translation { reason: TranslationFailure::NoMatch, .. }
    ));
    assert!(err.to_string().starts_with("Rule \"gender\""));
}

#[test]
fn dependent_groups_resolve_through_imports() {
    let registry = InMemoryMapRegistry::new();
    registry.add_map(
        parse_map(
            "map \"http://x/shared/names\" = \"Names\"\n\
             group Name(source n : HumanName, target tn : HumanName) {\n\
               n.family as f -> tn.family = f \"family\";\n\
               n.given as g -> tn.text = g \"text\";\n\
             }",
        )
        .unwrap(),
    );
    let engine = StructureMapEngine::new().with_registry(Arc::new(registry));
    let map = "map \"http://x/main\" = \"Main\"\n\
               imports \"http://x/shared/*\"\n\
               group Main(source src : Patient, target tgt : Patient) {\n\
                 src.name as n -> tgt.name as tn then Name(n, tn) \"name\";\n\
               }";
    let source = json!({"resourceType": "Patient", "name": [{"family": "Doe", "given": ["Jo"]}]});
    let out = run(&engine, map, source).unwrap();
    assert_eq!(out["name"], json!([{"family": "Doe", "text": "Jo"}]));
}

#[test]
fn type_dispatch_must_be_unambiguous() {
    let map = "map \"http://x/types\" = \"Types\"\n\
               group Main(source src : Patient, target tgt : Patient) {\n\
                 src.name -> tgt.name \"name\";\n\
               }\n\
               group One(source s : HumanName, target t : HumanName) <<types>> {\n\
                 s.family as f -> t.family = f \"f\";\n\
               }\n\
               group Two(source s : HumanName, target t : HumanName) <<types>> {\n\
                 s.text as x -> t.text = x \"x\";\n\
               }";
    let source = json!({"resourceType": "Patient", "name": [{"family": "Doe"}]});
    let err = run(&StructureMapEngine::new(), map, source).unwrap_err();
    assert!(matches!(
        err,
        FhirMapError::Resolution { reason: ResolutionFailure::Ambiguous, .. }
    ));
    assert!(err.to_string().contains("Multiple possible matches"));
}

#[test]
fn single_type_group_is_dispatched() {
    let map = "map \"http://x/types\" = \"Types\"\n\
               group Main(source src : Patient, target tgt : Patient) {\n\
                 src.name -> tgt.name \"name\";\n\
               }\n\
               group Names(source s : HumanName, target t : HumanName) <<types>> {\n\
                 s.family as f -> t.family = f \"f\";\n\
               }";
    let source = json!({"resourceType": "Patient", "name": [{"family": "Doe", "text": "dropped"}]});
    let out = run(&StructureMapEngine::new(), map, source).unwrap();
    assert_eq!(out["name"], json!([{"family": "Doe"}]));
}

#[derive(Debug, Default)]
struct Recording {
    messages: Mutex<Vec<String>>,
    resources: Mutex<Vec<String>>,
}

impl TransformerServices for Recording {
    fn log(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn create_resource(&self, resource: Node, _at_root: bool) -> octofhir_fhirmap::Result<Node> {
        self.resources.lock().push(resource.type_name());
        Ok(resource)
    }
}

#[test]
fn host_services_see_logs_and_created_resources() {
    let services = Arc::new(Recording::default());
    let engine = StructureMapEngine::new().with_services(services.clone());
    let map = "map \"http://x/log\" = \"Log\"\n\
               group Main(source src : Patient, target bundle : Bundle) {\n\
                 src -> bundle.type = 'collection' \"type\";\n\
                 src.gender as g log ('gender ' + g) -> bundle.entry as e, e.resource = create('Patient') as p then {\n\
                   g -> p.gender = g \"copy\";\n\
                 } \"entry\";\n\
               }";
    let source = json!({"resourceType": "Patient", "gender": "female"});
    let map = engine.parse_map(map, "log.map").unwrap();
    let out = engine
        .transform_json(&source, None, &map, Some("Bundle"))
        .unwrap();

    assert_eq!(out["type"], json!("collection"));
    assert_eq!(out["entry"][0]["resource"], json!({"resourceType": "Patient", "gender": "female"}));
    assert_eq!(*services.messages.lock(), vec!["[gender female]".to_string()]);
    assert_eq!(*services.resources.lock(), vec!["Patient".to_string()]);
}
