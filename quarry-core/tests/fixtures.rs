// fixtures.rs
// Shared hardware-store catalog for the integration tests

#![allow(dead_code)]

use quarry_core::{Collection, Schema, SequentialIdGenerator, Value};
use serde_json::{json, Value as JsonValue};

pub fn productos_schema() -> Schema {
    Schema::from_json(&json!({
        "$jsonSchema": {
            "bsonType": "object",
            "required": ["sku", "nombre", "categoria", "precio", "stock", "creadoEn"],
            "properties": {
                "sku": {"bsonType": "string", "pattern": "^P\\d{3,5}$", "minLength": 4, "maxLength": 6},
                "nombre": {"bsonType": "string", "minLength": 3, "maxLength": 120},
                "categoria": {
                    "bsonType": "string",
                    "enum": ["Herramientas", "Eléctricas", "Seguridad", "Pinturas",
                             "Fijaciones", "Construcción", "Jardinería"]
                },
                "precio": {"bsonType": ["int", "long", "double", "decimal"], "minimum": 0},
                "stock": {"bsonType": ["int", "long"], "minimum": 0},
                "creadoEn": {"bsonType": "date"},
                "descripcion": {"bsonType": "string", "maxLength": 500},
                "marca": {"bsonType": "string", "maxLength": 60},
                "tags": {
                    "bsonType": "array",
                    "uniqueItems": true,
                    "items": {"bsonType": "string", "minLength": 1, "maxLength": 30}
                },
                "proveedor": {
                    "bsonType": "object",
                    "required": ["nombre"],
                    "properties": {
                        "nombre": {"bsonType": "string", "minLength": 2, "maxLength": 80},
                        "telefono": {"bsonType": "string", "pattern": "^[+0-9\\s-]{7,20}$"},
                        "email": {"bsonType": "string", "pattern": "^[^@\\s]+@[^@\\s]+\\.[^@\\s]+$"}
                    },
                    "additionalProperties": true
                }
            },
            "additionalProperties": true
        }
    }))
    .unwrap()
}

fn producto(sku: &str, nombre: &str, categoria: &str, precio: i64, stock: i64, dia: u32) -> JsonValue {
    json!({
        "sku": sku,
        "nombre": nombre,
        "categoria": categoria,
        "precio": precio,
        "stock": stock,
        "creadoEn": {"$date": format!("2025-03-{:02}T10:00:00Z", dia)}
    })
}

/// The twelve catalog products, in insertion order
pub fn catalogo() -> Vec<JsonValue> {
    vec![
        producto("P001", "Martillo Pro Acero", "Herramientas", 7500, 20, 1),
        producto("P002", "Destornillador Phillips #2", "Herramientas", 2500, 60, 2),
        producto("P003", "Llave Inglesa 10\"", "Herramientas", 5200, 35, 3),
        producto("P004", "Taladro Inalámbrico 18V", "Eléctricas", 45000, 8, 4),
        producto("P005", "Brocas para Metal (Juego 13p)", "Eléctricas", 9800, 15, 5),
        producto("P006", "Sierra Circular 7-1/4\"", "Eléctricas", 68500, 5, 6),
        producto("P007", "Guantes Anticorte Talla L", "Seguridad", 3200, 50, 7),
        producto("P008", "Lentes de Seguridad Pro", "Seguridad", 2900, 70, 8),
        producto("P009", "Casco de Seguridad Azul", "Seguridad", 8200, 18, 9),
        producto("P010", "Pintura Látex Interior Blanca 1 Gal", "Pinturas", 16500, 25, 10),
        producto("P011", "Rodillo de Pintura 9\" Antigota", "Pinturas", 4200, 40, 11),
        producto("P012", "Brocha 2\" Cerdas Naturales", "Pinturas", 2100, 80, 12),
    ]
}

/// Validated in-memory collection loaded with the catalog; ids are 1..=12
pub fn productos() -> Collection {
    let coll = Collection::in_memory("productos")
        .with_schema(productos_schema())
        .with_id_generator(SequentialIdGenerator::new(0));
    coll.insert_many(catalogo()).unwrap();
    coll
}

pub fn field<'a>(doc: &'a Value, path: &str) -> &'a Value {
    doc.get_path(path)
        .unwrap_or_else(|| panic!("missing field '{}' in {:?}", path, doc))
}

pub fn skus(docs: &[Value]) -> Vec<String> {
    docs.iter()
        .filter_map(|doc| doc.get("sku").and_then(Value::as_str).map(str::to_string))
        .collect()
}
