use serde_json::Value;
use uuid::Uuid;

use super::extractor::{required, ExtractionError, ExtractionResult, ISSUER_PATH};
use super::xml;
use crate::document::RawDocument;

pub const PARTITION_KEY_FIELD: &str = "pk";
pub const ID_FIELD: &str = "id";

/// A whole invoice tree ready for document-mode import.
///
/// `body` is the converted XML with `pk` and `id` added at the top level.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatDocument {
    pub id: String,
    pub pk: String,
    pub body: Value,
}

impl FlatDocument {
    pub fn into_record(self) -> Value {
        self.body
    }
}

pub fn project(document: &RawDocument) -> ExtractionResult<FlatDocument> {
    let mut tree =
        xml::to_tree(&document.content).map_err(|e| ExtractionError::parse(document, e))?;

    let pk = required(document, &tree, &ISSUER_PATH)?;
    let id = Uuid::new_v4().to_string();

    if let Value::Object(fields) = &mut tree {
        fields.insert(PARTITION_KEY_FIELD.into(), Value::String(pk.clone()));
        fields.insert(ID_FIELD.into(), Value::String(id.clone()));
    }

    Ok(FlatDocument { id, pk, body: tree })
}

#[derive(Debug, Default)]
pub struct ProjectionBatch {
    pub documents: Vec<FlatDocument>,
    pub failed: Vec<ExtractionError>,
}

pub fn project_all(documents: &[RawDocument]) -> ProjectionBatch {
    let mut batch = ProjectionBatch::default();

    for document in documents {
        match project(document) {
            Ok(flat) => batch.documents.push(flat),
            Err(e) => {
                tracing::warn!("Input data in wrong format, skipping: {}", e);
                batch.failed.push(e);
            }
        }
    }

    tracing::info!(
        "Projected {} documents ({} skipped)",
        batch.documents.len(),
        batch.failed.len()
    );

    batch
}
