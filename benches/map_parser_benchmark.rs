//! Map language benchmarks
//!
//! Measures lexing, map parsing, rendering and a full transform over a
//! small Patient document.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use octofhir_fhirmap::parser::Lexer;
use octofhir_fhirmap::{StructureMapEngine, parse_expression, parse_map, render};
use serde_json::json;
use std::hint::black_box;

const PATIENT_MAP: &str = r#"map "http://example.org/fhir/StructureMap/PatientCopy" = "PatientCopy"

uses "http://hl7.org/fhir/StructureDefinition/Patient" alias Patient as source
uses "http://hl7.org/fhir/StructureDefinition/Patient" alias PatientOut as target

conceptmap "genders" {
  prefix s = "http://hl7.org/fhir/administrative-gender"
  prefix t = "http://example.org/gender"

  s:male == t:M
  s:female == t:F
}

group Main(source src : Patient, target tgt : PatientOut) {
  src.id as id -> tgt.id = id "id";
  src.active as a -> tgt.active = a "active";
  src.name as n -> tgt.name as tn then {
    n.family as f -> tn.family = truncate(f, 20) "family";
    n.given as g -> tn.given = g "given";
  } "names";
  src.gender as g -> tgt.gender = translate(g, '#genders', 'code') "gender";
  src.telecom as t where t.system = 'phone' -> tgt.telecom = t "phones";
}
"#;

const EXPRESSIONS: &[(&str, &str)] = &[
    ("simple", "name.given"),
    ("filter", "name.where(use = 'official').given.first()"),
    ("arithmetic", "(1 + 2) * 3 - 4 / 2"),
    ("complex", "telecom.where(system = 'phone' and use != 'old').value.exists()"),
];

fn benchmark_lexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer");
    group.throughput(Throughput::Bytes(PATIENT_MAP.len() as u64));
    group.bench_function("patient_map", |b| {
        b.iter(|| {
            let mut lexer = Lexer::new(black_box(PATIENT_MAP)).unwrap();
            let mut tokens = 0usize;
            while !lexer.done() {
                lexer.next().unwrap();
                tokens += 1;
            }
            black_box(tokens)
        })
    });
    group.finish();
}

fn benchmark_map_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_parser");
    group.throughput(Throughput::Bytes(PATIENT_MAP.len() as u64));
    group.bench_function("parse", |b| {
        b.iter(|| black_box(parse_map(black_box(PATIENT_MAP))))
    });

    let map = parse_map(PATIENT_MAP).unwrap();
    group.bench_function("render", |b| b.iter(|| black_box(render(black_box(&map)))));
    group.finish();
}

fn benchmark_expressions(c: &mut Criterion) {
    let mut group = c.benchmark_group("fhirpath_parser");
    for (name, expression) in EXPRESSIONS {
        group.bench_with_input(BenchmarkId::from_parameter(name), expression, |b, expr| {
            b.iter(|| black_box(parse_expression(black_box(expr))))
        });
    }
    group.finish();
}

fn benchmark_transform(c: &mut Criterion) {
    let engine = StructureMapEngine::new();
    let map = engine.parse_map(PATIENT_MAP, "patient.map").unwrap();
    let patient = json!({
        "resourceType": "Patient",
        "id": "example",
        "active": true,
        "gender": "female",
        "name": [
            {"family": "Chalmers", "given": ["Peter", "James"]},
            {"family": "Windsor", "given": ["Jim"]}
        ],
        "telecom": [
            {"system": "phone", "value": "(03) 5555 6473", "use": "work"},
            {"system": "email", "value": "p@example.org"}
        ]
    });

    c.bench_function("transform_patient", |b| {
        b.iter(|| black_box(engine.transform_json(black_box(&patient), None, &map, None)))
    });
}

criterion_group!(
    benches,
    benchmark_lexer,
    benchmark_map_parser,
    benchmark_expressions,
    benchmark_transform
);
criterion_main!(benches);
