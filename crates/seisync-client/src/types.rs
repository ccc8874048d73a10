//! SEI response shapes and their conversion into stored records.
//!
//! The API is loosely typed: ids arrive as strings or numbers, nested
//! objects may be missing, dates are `dd/mm/YYYY[ HH:MM:SS]`. Conversion
//! keeps every response verbatim in `raw` and extracts what it can.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

use seisync_core::{ActivityRecord, NewDocumentRef, ProcessRecord};

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Text of `key` in `object`: a scalar, or the first of `nested_keys`
/// present when the field is an object.
pub fn value_text(object: &JsonValue, key: &str, nested_keys: &[&str]) -> Option<String> {
    match object.get(key)? {
        JsonValue::Object(map) => nested_keys
            .iter()
            .find_map(|k| map.get(*k).and_then(scalar_text)),
        other => scalar_text(other),
    }
}

fn array_or_empty(object: &JsonValue, key: &str) -> JsonValue {
    match object.get(key) {
        Some(value @ JsonValue::Array(_)) => value.clone(),
        _ => JsonValue::Array(Vec::new()),
    }
}

/// Parse an SEI date, `dd/mm/YYYY` or `dd/mm/YYYY HH:MM:SS`.
pub fn parse_sei_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(text, "%d/%m/%Y %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%d/%m/%Y")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn date_field(object: &JsonValue, key: &str) -> Option<NaiveDateTime> {
    object.get(key).and_then(|v| v.as_str()).and_then(parse_sei_date)
}

/// First page envelope of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<JsonValue>,
    pub total_pages: u32,
}

impl Page {
    /// Read a listing page. The API answers either a bare array or an
    /// object with the items under `items_key` and `Info.TotalPaginas`.
    pub fn from_json(body: JsonValue, items_key: &str) -> Self {
        match body {
            JsonValue::Array(items) => Page {
                items,
                total_pages: 1,
            },
            JsonValue::Object(mut map) => {
                let total_pages = map
                    .get("Info")
                    .and_then(|info| info.get("TotalPaginas"))
                    .and_then(|t| match t {
                        JsonValue::Number(n) => n.as_u64(),
                        JsonValue::String(s) => s.parse().ok(),
                        _ => None,
                    })
                    .unwrap_or(1)
                    .max(1) as u32;
                let items = match map.remove(items_key) {
                    Some(JsonValue::Array(items)) => items,
                    _ => Vec::new(),
                };
                Page { items, total_pages }
            }
            _ => Page {
                items: Vec::new(),
                total_pages: 1,
            },
        }
    }
}

/// Build a [`ProcessRecord`] from a `consulta` response.
pub fn process_record_from_json(protocol: &str, unit_id: &str, body: JsonValue) -> ProcessRecord {
    ProcessRecord {
        protocol: protocol.to_string(),
        procedure_id: value_text(&body, "IdProcedimento", &[]),
        unit_id: unit_id.to_string(),
        procedure_type: value_text(&body, "TipoProcedimento", &["Nome"]),
        specification: value_text(&body, "Especificacao", &[]),
        access_level: value_text(&body, "NivelAcesso", &[]),
        legal_basis: value_text(&body, "HipoteseLegal", &["Nome"]),
        observation: value_text(&body, "Observacao", &[]),
        opened_at: date_field(&body, "DataAutuacao"),
        concluded_at: date_field(&body, "DataConclusao"),
        interested: array_or_empty(&body, "Interessados"),
        subjects: array_or_empty(&body, "Assuntos"),
        generating_unit: value_text(&body, "UnidadeGeradora", &["Descricao", "Sigla"]),
        raw: body,
    }
}

/// Build a [`NewDocumentRef`] from one listing entry. Entries without a
/// document id are dropped.
pub fn document_ref_from_json(
    protocol: &str,
    unit_id: &str,
    entry: JsonValue,
) -> Option<NewDocumentRef> {
    let document_id = value_text(&entry, "IdDocumento", &[])?;
    Some(NewDocumentRef {
        document_id,
        protocol: protocol.to_string(),
        unit_id: unit_id.to_string(),
        number: value_text(&entry, "Numero", &[]),
        doc_type: value_text(&entry, "Serie", &["Nome"]),
        document_date: date_field(&entry, "Data"),
        generating_unit: value_text(&entry, "UnidadeGeradora", &["Descricao", "Sigla"]),
        signed: entry.get("SinAssinado").and_then(|v| v.as_str()) == Some("S"),
        signers: array_or_empty(&entry, "Assinantes"),
        access_level: value_text(&entry, "NivelAcesso", &[]),
        raw: entry,
    })
}

/// Build an [`ActivityRecord`] from one `andamentos` entry.
pub fn activity_from_json(protocol: &str, entry: JsonValue) -> ActivityRecord {
    ActivityRecord {
        protocol: protocol.to_string(),
        activity_id: value_text(&entry, "IdAndamento", &[]),
        task: value_text(&entry, "Tarefa", &["Nome"]),
        description: value_text(&entry, "Descricao", &[]),
        user_login: value_text(&entry, "Usuario", &["Sigla"]),
        user_name: value_text(&entry, "Usuario", &["Nome"]),
        unit: value_text(&entry, "Unidade", &["Descricao", "Sigla"]),
        occurred_at: date_field(&entry, "DataHora"),
        attributes: array_or_empty(&entry, "Atributos"),
        raw: entry,
    }
}
