use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ingest::{InvoiceRelation, InvoiceRelationPair, RelationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexLabel {
    Issuer,
    Invoice,
    Recipient,
}

impl VertexLabel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issuer => "Issuer",
            Self::Invoice => "Invoice",
            Self::Recipient => "Recipient",
        }
    }
}

impl std::fmt::Display for VertexLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeLabel {
    Issued,
    BilledTo,
}

impl EdgeLabel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::BilledTo => "billed_to",
        }
    }
}

impl std::fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A graph vertex. Two vertices with the same label and key are the same
/// entity no matter which invoice produced them.
///
/// The stored record is addressed by `(pk, id)`, both the key, so an RFC
/// that appears as both issuer and recipient is two model vertices but one
/// stored record: the later upsert replaces the earlier label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vertex {
    #[serde(rename = "id")]
    pub key: String,
    pub label: VertexLabel,
    pub pk: String,
}

impl Vertex {
    #[must_use]
    pub fn new(label: VertexLabel, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            pk: key.clone(),
            key,
            label,
        }
    }

    pub fn identity(&self) -> (VertexLabel, &str) {
        (self.label, &self.key)
    }
}

/// A directed edge. Endpoints are referenced by key and label only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub label: EdgeLabel,
    #[serde(rename = "_isEdge")]
    pub is_edge: bool,
    #[serde(rename = "outV")]
    pub out_key: String,
    #[serde(rename = "outVLabel")]
    pub out_label: VertexLabel,
    #[serde(rename = "inV")]
    pub in_key: String,
    #[serde(rename = "inVLabel")]
    pub in_label: VertexLabel,
    /// Edges live in the partition of their source vertex.
    pub pk: String,
    #[serde(rename = "inVPk")]
    pub in_pk: String,
}

impl Edge {
    #[must_use]
    pub fn between(label: EdgeLabel, from: &Vertex, to: &Vertex) -> Self {
        Self {
            id: format!("{}{}", from.key, to.key),
            label,
            is_edge: true,
            out_key: from.key.clone(),
            out_label: from.label,
            in_key: to.key.clone(),
            in_label: to.label,
            pk: from.pk.clone(),
            in_pk: to.pk.clone(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.id
    }
}

fn endpoints(relation: &InvoiceRelation) -> (Vertex, Vertex, EdgeLabel) {
    match relation.kind {
        RelationKind::IssuerToInvoice => (
            Vertex::new(VertexLabel::Issuer, relation.source_key()),
            Vertex::new(VertexLabel::Invoice, relation.target_key()),
            EdgeLabel::Issued,
        ),
        RelationKind::InvoiceToRecipient => (
            Vertex::new(VertexLabel::Invoice, relation.source_key()),
            Vertex::new(VertexLabel::Recipient, relation.target_key()),
            EdgeLabel::BilledTo,
        ),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphModel {
    pub vertices: Vec<Vertex>,
    pub edges: Vec<Edge>,
}

impl GraphModel {
    pub fn vertex_records(&self) -> serde_json::Result<Vec<Value>> {
        self.vertices.iter().map(serde_json::to_value).collect()
    }

    pub fn edge_records(&self) -> serde_json::Result<Vec<Value>> {
        self.edges.iter().map(serde_json::to_value).collect()
    }

    /// Number of records the vertices occupy once stored, counting each key
    /// once regardless of label.
    pub fn stored_vertex_count(&self) -> usize {
        self.vertices
            .iter()
            .map(|v| (v.pk.as_str(), v.key.as_str()))
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn contains_vertex(&self, label: VertexLabel, key: &str) -> bool {
        self.vertices
            .iter()
            .any(|v| v.identity() == (label, key))
    }
}

/// Accumulates vertices and edges in first-seen order, dropping repeats.
///
/// Membership is checked against hash indexes before insertion; the output
/// is the same as a linear `contains` scan over the lists.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    model: GraphModel,
    vertex_index: HashSet<(VertexLabel, String)>,
    edge_index: HashSet<String>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<'a>(pairs: impl IntoIterator<Item = &'a InvoiceRelationPair>) -> GraphModel {
        let mut builder = Self::new();
        for pair in pairs {
            builder.add_pair(pair);
        }
        builder.finish()
    }

    pub fn add_pair(&mut self, pair: &InvoiceRelationPair) {
        for relation in pair.relations() {
            self.add_relation(relation);
        }
    }

    pub fn add_relation(&mut self, relation: &InvoiceRelation) {
        let (from, to, label) = endpoints(relation);
        let edge = Edge::between(label, &from, &to);
        self.add_vertex(from);
        self.add_vertex(to);
        self.add_edge(edge);
    }

    /// Returns `false` when an equal vertex was already present.
    pub fn add_vertex(&mut self, vertex: Vertex) -> bool {
        if !self.vertex_index.insert((vertex.label, vertex.key.clone())) {
            return false;
        }
        self.model.vertices.push(vertex);
        true
    }

    pub fn add_edge(&mut self, edge: Edge) -> bool {
        if !self.edge_index.insert(edge.id.clone()) {
            return false;
        }
        self.model.edges.push(edge);
        true
    }

    #[must_use]
    pub fn finish(self) -> GraphModel {
        tracing::debug!(
            "Built graph with {} vertices and {} edges",
            self.model.vertices.len(),
            self.model.edges.len()
        );
        self.model
    }
}
