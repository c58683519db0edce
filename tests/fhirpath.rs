//! FHIRPath expressions as used inside map rules

use std::sync::Arc;

use indexmap::IndexMap;
use octofhir_fhirmap::model::Collection;
use octofhir_fhirmap::parser::Lexer;
use octofhir_fhirmap::{
    ErrorKind, FhirPathEngine, FhirPathValue, HostFunctionResolver, MockStructureProvider, Node,
    parse_expression,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serde_json::json;

fn observation() -> FhirPathValue {
    let json = json!({
        "resourceType": "Observation",
        "status": "final",
        "code": {"coding": [
            {"system": "http://loinc.org", "code": "8867-4"},
            {"system": "http://snomed.info/sct", "code": "364075005"}
        ]},
        "valueQuantity": {"value": 72, "unit": "beats/minute"}
    });
    let provider = MockStructureProvider::new();
    FhirPathValue::Node(Node::from_json(&json, None, Some(&provider)).unwrap())
}

fn eval(expression: &str) -> Collection {
    let engine = FhirPathEngine::new();
    let parsed = engine.parse(expression).unwrap();
    engine.evaluate(Some(&observation()), &parsed, None).unwrap()
}

#[rstest]
#[case("1 + 2 * 3", FhirPathValue::Integer(7))]
#[case("2 * 3 + 1", FhirPathValue::Integer(7))]
#[case("-1 + 2", FhirPathValue::Integer(-3))]
#[case("true or false and false", FhirPathValue::Boolean(true))]
#[case("false implies false", FhirPathValue::Boolean(true))]
#[case("'a' & 'b' = 'ab'", FhirPathValue::Boolean(true))]
#[case("code.coding.count()", FhirPathValue::Integer(2))]
#[case("code.coding.where(system = %loinc).code", FhirPathValue::string("8867-4"))]
#[case("code.coding.exists(system = %sct)", FhirPathValue::Boolean(true))]
#[case("status.upper()", FhirPathValue::string("FINAL"))]
#[case("iif(status = 'final', 'done', 'open')", FhirPathValue::string("done"))]
fn expressions_evaluate(#[case] expression: &str, #[case] expected: FhirPathValue) {
    assert_eq!(eval(expression), vec![expected], "{expression}");
}

#[test]
fn choice_elements_are_reached_by_base_name() {
    let values = eval("value.unit");
    assert_eq!(values, vec![FhirPathValue::string("beats/minute")]);
    assert_eq!(eval("valueQuantity.unit"), values);
}

#[test]
fn variables_take_precedence_over_elements() {
    let engine = FhirPathEngine::new();
    let parsed = engine.parse("status + '!'").unwrap();
    let mut vars = IndexMap::new();
    vars.insert("status".to_string(), FhirPathValue::string("bound"));
    let result = engine.evaluate(Some(&observation()), &parsed, Some(&vars)).unwrap();
    assert_eq!(result, vec![FhirPathValue::string("bound!")]);
}

#[rstest]
#[case("where()", "requires at least 1")]
#[case("count(1)", "can only have 0")]
#[case("a b", "unexpected token")]
#[case("status.unknownFn()", "not a valid function name")]
fn malformed_expressions_are_syntax_errors(#[case] expression: &str, #[case] message: &str) {
    let err = parse_expression(expression).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Syntax);
    assert!(err.to_string().contains(message), "{err}");
}

#[test]
fn lexer_edge_cases() {
    let lexer = Lexer::new("'\\u0041B'").unwrap();
    assert_eq!(lexer.process_constant(lexer.current()).unwrap(), "AB");

    let err = Lexer::new("'open").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lex);
    assert_eq!(err.location().map(|l| (l.line, l.column)), Some((1, 1)));

    let parsed = parse_expression("3.5 + 1").unwrap();
    assert_eq!(parsed.to_string(), "3.5 + 1");
}

#[derive(Debug)]
struct Greeting;

impl HostFunctionResolver for Greeting {
    fn arity(&self, name: &str) -> Option<(usize, Option<usize>)> {
        (name == "greet").then_some((1, Some(1)))
    }

    fn execute(
        &self,
        _name: &str,
        focus: &Collection,
        parameters: &[Collection],
    ) -> octofhir_fhirmap::Result<Collection> {
        let who = parameters[0].first().and_then(FhirPathValue::as_string).unwrap_or_default();
        let prefix = focus.first().and_then(FhirPathValue::as_string).unwrap_or_default();
        Ok(vec![FhirPathValue::string(format!("{prefix} {who}"))])
    }
}

#[test]
fn host_functions_extend_the_catalogue() {
    assert!(parse_expression("'hi'.greet('you')").is_err());

    let engine = FhirPathEngine::new().with_host(Arc::new(Greeting));
    let parsed = engine.parse("'hello'.greet('world')").unwrap();
    let result = engine.evaluate(None, &parsed, None).unwrap();
    assert_eq!(result, vec![FhirPathValue::string("hello world")]);
}
