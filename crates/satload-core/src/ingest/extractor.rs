use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::xml::{self, ParseError};
use crate::document::RawDocument;

pub const COMPROBANTE: &str = "cfdi:Comprobante";
pub const EMISOR: &str = "cfdi:Emisor";
pub const RECEPTOR: &str = "cfdi:Receptor";
pub const COMPLEMENTO: &str = "cfdi:Complemento";
pub const TIMBRE_FISCAL: &str = "tfd:TimbreFiscalDigital";

/// Tax identifier attribute on both parties. The schema has carried it as
/// `rfc` and as `Rfc`; both extraction paths read this one spelling.
pub const RFC_ATTR: &str = "@rfc";
pub const UUID_ATTR: &str = "@UUID";

pub const ISSUER_PATH: [&str; 3] = [COMPROBANTE, EMISOR, RFC_ATTR];
pub const RECIPIENT_PATH: [&str; 3] = [COMPROBANTE, RECEPTOR, RFC_ATTR];
pub const INVOICE_PATH: [&str; 4] = [COMPROBANTE, COMPLEMENTO, TIMBRE_FISCAL, UUID_ATTR];

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Invalid XML in {origin}: {cause}")]
    Parse {
        origin: String,
        raw: String,
        #[source]
        cause: ParseError,
    },
    #[error("Missing field {path} in {origin}")]
    MissingField {
        origin: String,
        raw: String,
        path: String,
    },
}

impl ExtractionError {
    pub(super) fn parse(document: &RawDocument, cause: ParseError) -> Self {
        Self::Parse {
            origin: document.describe(),
            raw: document.content.clone(),
            cause,
        }
    }

    fn missing(document: &RawDocument, path: &[&str]) -> Self {
        Self::MissingField {
            origin: document.describe(),
            raw: document.content.clone(),
            path: path.join("/"),
        }
    }

    /// The offending document text.
    pub fn raw(&self) -> &str {
        match self {
            Self::Parse { raw, .. } | Self::MissingField { raw, .. } => raw,
        }
    }
}

pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// Which of the two relations a document produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    IssuerToInvoice,
    InvoiceToRecipient,
}

impl RelationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssuerToInvoice => "issuer_to_invoice",
            Self::InvoiceToRecipient => "invoice_to_recipient",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceRelation {
    pub kind: RelationKind,
    pub issuer: String,
    pub recipient: String,
    pub invoice_id: String,
}

impl InvoiceRelation {
    /// Business key of the relation's source entity.
    pub fn source_key(&self) -> &str {
        match self.kind {
            RelationKind::IssuerToInvoice => &self.issuer,
            RelationKind::InvoiceToRecipient => &self.invoice_id,
        }
    }

    /// Business key of the relation's target entity.
    pub fn target_key(&self) -> &str {
        match self.kind {
            RelationKind::IssuerToInvoice => &self.invoice_id,
            RelationKind::InvoiceToRecipient => &self.recipient,
        }
    }
}

/// Both relations extracted from a single invoice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceRelationPair {
    pub issued: InvoiceRelation,
    pub billed_to: InvoiceRelation,
}

impl InvoiceRelationPair {
    #[must_use]
    pub fn new(issuer: String, recipient: String, invoice_id: String) -> Self {
        let issued = InvoiceRelation {
            kind: RelationKind::IssuerToInvoice,
            issuer,
            recipient,
            invoice_id,
        };
        let billed_to = InvoiceRelation {
            kind: RelationKind::InvoiceToRecipient,
            ..issued.clone()
        };
        Self { issued, billed_to }
    }

    pub fn relations(&self) -> [&InvoiceRelation; 2] {
        [&self.issued, &self.billed_to]
    }
}

/// Reads issuer, recipient and stamp UUID out of one invoice.
pub fn extract(document: &RawDocument) -> ExtractionResult<InvoiceRelationPair> {
    let tree = xml::to_tree(&document.content).map_err(|e| ExtractionError::parse(document, e))?;

    let issuer = required(document, &tree, &ISSUER_PATH)?;
    let recipient = required(document, &tree, &RECIPIENT_PATH)?;
    let invoice_id = required(document, &tree, &INVOICE_PATH)?;

    Ok(InvoiceRelationPair::new(issuer, recipient, invoice_id))
}

pub(super) fn required(
    document: &RawDocument,
    tree: &Value,
    path: &[&str],
) -> ExtractionResult<String> {
    xml::lookup_str(tree, path)
        .map(String::from)
        .ok_or_else(|| ExtractionError::missing(document, path))
}

#[derive(Debug, Default)]
pub struct ExtractionBatch {
    pub pairs: Vec<InvoiceRelationPair>,
    pub failed: Vec<ExtractionError>,
}

impl ExtractionBatch {
    pub fn success_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }
}

/// Extracts every document, keeping input order. Failures are logged and
/// collected; they never stop the remaining documents.
pub fn extract_all(documents: &[RawDocument]) -> ExtractionBatch {
    let mut batch = ExtractionBatch::default();

    for document in documents {
        match extract(document) {
            Ok(pair) => batch.pairs.push(pair),
            Err(e) => {
                tracing::warn!("Input data in wrong format, skipping: {}", e);
                tracing::debug!("Rejected content: {}", e.raw());
                batch.failed.push(e);
            }
        }
    }

    tracing::info!(
        "Extracted {} invoices ({} skipped)",
        batch.success_count(),
        batch.failure_count()
    );

    batch
}
