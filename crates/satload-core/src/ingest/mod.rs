mod extractor;
mod projector;
pub mod xml;

pub use extractor::{
    extract, extract_all, ExtractionBatch, ExtractionError, ExtractionResult, InvoiceRelation,
    InvoiceRelationPair, RelationKind, INVOICE_PATH, ISSUER_PATH, RECIPIENT_PATH,
};
pub use projector::{project, project_all, FlatDocument, ProjectionBatch};
pub use xml::ParseError;
