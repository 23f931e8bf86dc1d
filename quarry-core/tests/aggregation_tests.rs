//! Aggregation pipelines over the twelve-product catalog

mod fixtures;

use fixtures::*;
use quarry_core::{AggregateOptions, Collection, QuarryError, Value};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;

fn run(coll: &Collection, pipeline: JsonValue) -> Vec<JsonValue> {
    let output = coll.aggregate(&pipeline).unwrap();
    assert!(output.is_clean(), "unexpected failures: {:?}", output.failures);
    output.documents.iter().map(Value::to_json).collect()
}

fn approx(a: &JsonValue, b: f64) -> bool {
    a.as_f64().is_some_and(|a| (a - b).abs() < 1e-9)
}

#[test]
fn test_price_stats_per_category() {
    let coll = productos();
    let out = run(
        &coll,
        json!([{"$group": {
            "_id": "$categoria",
            "precioPromedio": {"$avg": "$precio"},
            "precioMinimo": {"$min": "$precio"},
            "precioMaximo": {"$max": "$precio"}
        }}]),
    );

    let mut expected: HashMap<String, Vec<f64>> = HashMap::new();
    for doc in catalogo() {
        expected
            .entry(doc["categoria"].as_str().unwrap().to_string())
            .or_default()
            .push(doc["precio"].as_f64().unwrap());
    }

    let order: Vec<&str> = out.iter().map(|d| d["_id"].as_str().unwrap()).collect();
    assert_eq!(order, vec!["Herramientas", "Eléctricas", "Seguridad", "Pinturas"]);
    for doc in &out {
        let prices = &expected[doc["_id"].as_str().unwrap()];
        let avg = prices.iter().sum::<f64>() / prices.len() as f64;
        let min = prices.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(approx(&doc["precioPromedio"], avg), "{}", doc);
        assert!(approx(&doc["precioMinimo"], min), "{}", doc);
        assert!(approx(&doc["precioMaximo"], max), "{}", doc);
    }
}

#[test]
fn test_inventory_value_per_category() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$group": {"_id": "$categoria", "valorTotalInventario": {"$sum": {"$multiply": ["$precio", "$stock"]}}}},
            {"$sort": {"valorTotalInventario": -1}}
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": "Eléctricas", "valorTotalInventario": 849_500}),
            json!({"_id": "Pinturas", "valorTotalInventario": 748_500}),
            json!({"_id": "Seguridad", "valorTotalInventario": 510_600}),
            json!({"_id": "Herramientas", "valorTotalInventario": 482_000}),
        ]
    );
}

#[test]
fn test_top_three_most_expensive() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$sort": {"precio": -1}},
            {"$limit": 3},
            {"$project": {"_id": 0, "nombre": 1, "precio": 1}}
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"nombre": "Sierra Circular 7-1/4\"", "precio": 68500}),
            json!({"nombre": "Taladro Inalámbrico 18V", "precio": 45000}),
            json!({"nombre": "Pintura Látex Interior Blanca 1 Gal", "precio": 16500}),
        ]
    );
}

#[test]
fn test_group_count_agrees_with_manual_grouping() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$group": {"_id": "$categoria", "cantidad": {"$sum": 1}}},
            {"$sort": {"cantidad": -1}}
        ]),
    );
    let mut manual: HashMap<String, i64> = HashMap::new();
    for doc in catalogo() {
        *manual.entry(doc["categoria"].as_str().unwrap().to_string()).or_default() += 1;
    }
    assert_eq!(out.len(), manual.len());
    for doc in &out {
        assert_eq!(doc["cantidad"].as_i64(), manual.get(doc["_id"].as_str().unwrap()).copied());
    }
    let total: i64 = out.iter().filter_map(|d| d["cantidad"].as_i64()).sum();
    assert_eq!(total, 12);
}

#[test]
fn test_price_histogram_buckets() {
    let coll = productos();
    let out = run(
        &coll,
        json!([{"$bucket": {
            "groupBy": "$precio",
            "boundaries": [0, 5000, 10000, 20000, 50000, 100000],
            "default": "Mayor a 100000",
            "output": {"cantidad": {"$sum": 1}, "productos": {"$push": "$sku"}}
        }}]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": 0, "cantidad": 5, "productos": ["P002", "P007", "P008", "P011", "P012"]}),
            json!({"_id": 5000, "cantidad": 4, "productos": ["P001", "P003", "P005", "P009"]}),
            json!({"_id": 10000, "cantidad": 1, "productos": ["P010"]}),
            json!({"_id": 20000, "cantidad": 1, "productos": ["P004"]}),
            json!({"_id": 50000, "cantidad": 1, "productos": ["P006"]}),
        ]
    );
}

#[test]
fn test_bucket_with_default_label() {
    let coll = Collection::in_memory("precios");
    coll.insert_many(vec![json!({"precio": 4000}), json!({"precio": 7000}), json!({"precio": 12000})])
        .unwrap();
    let out = run(
        &coll,
        json!([{"$bucket": {"groupBy": "$precio", "boundaries": [0, 5000, 10000], "default": "over"}}]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": 0, "count": 1}),
            json!({"_id": 5000, "count": 1}),
            json!({"_id": "over", "count": 1}),
        ]
    );

    let err = coll
        .aggregate(&json!([{"$bucket": {"groupBy": "$precio", "boundaries": [0, 5000, 10000]}}]))
        .unwrap_err();
    assert!(matches!(err, QuarryError::ConfigError(_)));
}

#[test]
fn test_price_histogram_auto() {
    let coll = productos();
    let out = run(
        &coll,
        json!([{"$bucketAuto": {"groupBy": "$precio", "buckets": 5, "output": {"cantidad": {"$sum": 1}}}}]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": {"min": 2100, "max": 3200}, "cantidad": 3}),
            json!({"_id": {"min": 3200, "max": 7500}, "cantidad": 3}),
            json!({"_id": {"min": 7500, "max": 9800}, "cantidad": 2}),
            json!({"_id": {"min": 9800, "max": 45000}, "cantidad": 2}),
            json!({"_id": {"min": 45000, "max": 68500}, "cantidad": 2}),
        ]
    );
}

#[test]
fn test_top_three_per_category() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$sort": {"precio": -1}},
            {"$group": {"_id": "$categoria", "productos": {"$push": {"sku": "$sku", "precio": "$precio"}}}},
            {"$project": {"_id": 1, "top3": {"$slice": ["$productos", 3]}}}
        ]),
    );
    assert_eq!(out[0]["_id"], json!("Eléctricas"));
    assert_eq!(
        out[0]["top3"],
        json!([
            {"sku": "P006", "precio": 68500},
            {"sku": "P004", "precio": 45000},
            {"sku": "P005", "precio": 9800}
        ])
    );
    assert!(out.iter().all(|doc| doc["top3"].as_array().map(Vec::len) == Some(3)));

    let cheapest = run(
        &coll,
        json!([
            {"$sort": {"precio": 1}},
            {"$group": {"_id": "$categoria", "productos": {"$push": "$sku"}}},
            {"$project": {"_id": 1, "ultimo": {"$slice": ["$productos", -1]}}},
            {"$match": {"_id": "Pinturas"}}
        ]),
    );
    assert_eq!(cheapest, vec![json!({"_id": "Pinturas", "ultimo": ["P010"]})]);
}

#[test]
fn test_percentage_of_pro_products() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$group": {
                "_id": "$categoria",
                "totalProductos": {"$sum": 1},
                "productosConPro": {"$sum": {
                    "$cond": [{"$regexMatch": {"input": "$nombre", "regex": "Pro", "options": "i"}}, 1, 0]
                }}
            }},
            {"$project": {
                "_id": 1,
                "porcentajeConPro": {"$cond": [
                    {"$eq": ["$totalProductos", 0]},
                    0,
                    {"$multiply": [{"$divide": ["$productosConPro", "$totalProductos"]}, 100]}
                ]}
            }}
        ]),
    );
    let pct: HashMap<&str, f64> = out
        .iter()
        .map(|d| (d["_id"].as_str().unwrap(), d["porcentajeConPro"].as_f64().unwrap()))
        .collect();
    assert!((pct["Herramientas"] - 100.0 / 3.0).abs() < 1e-9);
    assert!((pct["Seguridad"] - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(pct["Eléctricas"], 0.0);
    assert_eq!(pct["Pinturas"], 0.0);
}

#[test]
fn test_unique_tags_per_category() {
    let coll = productos();
    coll.update_one(
        &json!({"sku": "P001"}),
        &json!({"$set": {"tags": ["herramienta", "impacto"]}}),
        false,
    )
    .unwrap();
    coll.update_one(
        &json!({"sku": "P003"}),
        &json!({"$set": {"tags": ["herramienta", "manual", "acero"]}}),
        false,
    )
    .unwrap();
    coll.update_one(&json!({"sku": "P007"}), &json!({"$set": {"tags": []}}), false)
        .unwrap();

    let out = run(
        &coll,
        json!([
            {"$match": {"tags": {"$exists": true, "$ne": []}}},
            {"$unwind": "$tags"},
            {"$group": {"_id": "$categoria", "etiquetasUnicas": {"$addToSet": "$tags"}}}
        ]),
    );
    assert_eq!(
        out,
        vec![json!({"_id": "Herramientas", "etiquetasUnicas": ["herramienta", "impacto", "manual", "acero"]})]
    );
}

#[test]
fn test_keyword_counts_with_facet() {
    let coll = productos();
    let out = run(
        &coll,
        json!([{"$facet": {
            "Pintura": [{"$match": {"nombre": {"$regex": "Pintura", "$options": "i"}}}, {"$count": "cantidad"}],
            "Seguridad": [{"$match": {"nombre": {"$regex": "Seguridad", "$options": "i"}}}, {"$count": "cantidad"}],
            "Eléctrico": [{"$match": {"nombre": {"$regex": "Eléctrico|Inalámbrico", "$options": "i"}}}, {"$count": "cantidad"}],
            "Jardín": [{"$match": {"categoria": "Jardinería"}}, {"$count": "cantidad"}]
        }}]),
    );
    assert_eq!(
        out,
        vec![json!({
            "Pintura": [{"cantidad": 2}],
            "Seguridad": [{"cantidad": 2}],
            "Eléctrico": [{"cantidad": 1}],
            "Jardín": []
        })]
    );
}

#[test]
fn test_facet_isolation_sequential_and_parallel() {
    let coll = productos();
    let pipeline = json!([{"$facet": {
        "top3Caros": [{"$sort": {"precio": -1}}, {"$limit": 3}, {"$project": {"sku": 1}}],
        "resumenPorCategoria": [{"$group": {"_id": "$categoria", "cantidad": {"$sum": 1}}}],
        "productosConPro": [{"$match": {"nombre": {"$regex": "Pro", "$options": "i"}}}, {"$count": "cantidad"}],
        "todos": [{"$count": "n"}]
    }}]);

    let parallel = coll
        .aggregate_with_options(&pipeline, AggregateOptions::new().with_parallel_facets(true))
        .unwrap();
    let sequential = coll
        .aggregate_with_options(&pipeline, AggregateOptions::new().with_parallel_facets(false))
        .unwrap();
    assert_eq!(parallel.documents, sequential.documents);

    let doc = parallel.documents[0].to_json();
    assert_eq!(
        doc["top3Caros"],
        json!([{"_id": 6, "sku": "P006"}, {"_id": 4, "sku": "P004"}, {"_id": 10, "sku": "P010"}])
    );
    assert_eq!(doc["resumenPorCategoria"].as_array().map(Vec::len), Some(4));
    assert_eq!(doc["productosConPro"], json!([{"cantidad": 2}]));
    // sibling facets saw the full input, not the limited one
    assert_eq!(doc["todos"], json!([{"n": 12}]));
}

#[test]
fn test_classify_by_average_price() {
    let coll = productos();
    let avg = run(&coll, json!([{"$group": {"_id": null, "avgPrice": {"$avg": "$precio"}}}]));
    let avg_price = avg[0]["avgPrice"].as_f64().unwrap();
    assert!((avg_price - 175_600.0 / 12.0).abs() < 1e-9);

    let out = run(
        &coll,
        json!([
            {"$addFields": {"clasificacionPrecio": {"$cond": {
                "if": {"$gt": ["$precio", avg_price]},
                "then": "Caro",
                "else": "Barato/Promedio"
            }}}},
            {"$match": {"clasificacionPrecio": "Caro"}},
            {"$project": {"_id": 0, "sku": 1}}
        ]),
    );
    assert_eq!(out, vec![json!({"sku": "P004"}), json!({"sku": "P006"}), json!({"sku": "P010"})]);
}

#[test]
fn test_inventory_value_per_day() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$group": {
                "_id": {"$dateToString": {"format": "%Y-%m-%d", "date": "$creadoEn"}},
                "valorTotalInventario": {"$sum": {"$multiply": ["$precio", "$stock"]}}
            }},
            {"$sort": {"_id": -1}},
            {"$limit": 2}
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": "2025-03-12", "valorTotalInventario": 168_000}),
            json!({"_id": "2025-03-11", "valorTotalInventario": 168_000}),
        ]
    );
}

#[test]
fn test_stock_level_switch() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$addFields": {"nivelStock": {"$switch": {
                "branches": [
                    {"case": {"$lte": ["$stock", 10]}, "then": "Bajo"},
                    {"case": {"$lte": ["$stock", 50]}, "then": "Medio"}
                ],
                "default": "Alto"
            }}}},
            {"$group": {"_id": "$nivelStock", "skus": {"$push": "$sku"}}}
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": "Medio", "skus": ["P001", "P003", "P005", "P007", "P009", "P010", "P011"]}),
            json!({"_id": "Alto", "skus": ["P002", "P008", "P012"]}),
            json!({"_id": "Bajo", "skus": ["P004", "P006"]}),
        ]
    );
}

#[test]
fn test_price_with_tax() {
    let coll = productos();
    let out = run(
        &coll,
        json!([
            {"$addFields": {"precioConIVA": {"$multiply": ["$precio", 1.13]}}},
            {"$project": {"_id": 0, "sku": 1, "precio": 1, "precioConIVA": 1}},
            {"$limit": 1}
        ]),
    );
    assert_eq!(out[0]["sku"], json!("P001"));
    assert!(approx(&out[0]["precioConIVA"], 7500.0 * 1.13));
}

#[test]
fn test_document_errors_become_stage_failures() {
    let coll = productos();
    coll.update_one(&json!({"sku": "P002"}), &json!({"$set": {"stock": 0}}), false)
        .unwrap();
    let output = coll
        .aggregate(&json!([
            {"$project": {"sku": 1, "precioUnidad": {"$divide": ["$precio", "$stock"]}}},
            {"$count": "n"}
        ]))
        .unwrap();
    assert_eq!(output.documents, vec![Value::from_json(json!({"n": 11}))]);
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].stage_index, 0);
    assert_eq!(output.failures[0].stage, "$project");
    assert!(matches!(output.failures[0].error, QuarryError::ArithmeticError(_)));
}

#[test]
fn test_date_overflow_becomes_stage_failure() {
    let coll = productos();
    let output = coll
        .aggregate(&json!([
            {"$addFields": {"vence": {"$add": [
                "$creadoEn",
                {"$cond": [{"$eq": ["$sku", "P003"]}, i64::MIN, 86_400_000]}
            ]}}},
            {"$project": {"_id": 0, "sku": 1, "vence": 1}},
            {"$match": {"sku": "P001"}}
        ]))
        .unwrap();
    assert_eq!(
        output.documents,
        vec![Value::from_json(json!({"sku": "P001", "vence": {"$date": "2025-03-02T10:00:00Z"}}))]
    );
    assert_eq!(output.failures.len(), 1);
    assert_eq!(output.failures[0].stage, "$addFields");
    assert!(matches!(output.failures[0].error, QuarryError::ArithmeticError(_)));
}

#[test]
fn test_aggregate_does_not_modify_collection() {
    let coll = productos();
    run(
        &coll,
        json!([
            {"$addFields": {"precio": 0}},
            {"$unwind": "$tags"}
        ]),
    );
    let doc = coll.find_one(&json!({"sku": "P001"})).unwrap().unwrap();
    assert_eq!(doc.get("precio"), Some(&Value::Int(7500)));
}
