//! External capability contracts.
//!
//! The orchestration core treats the LLM completion/evaluation capability
//! and the vector-store/knowledge-graph layer as black-box collaborators
//! behind the [`RequirementProvider`] trait. Every call either succeeds or
//! fails with a [`CallError`](crate::error::CallError) carrying the
//! transient/fatal classification that drives the worker pool retry policy.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::workflow::types::{RequirementItem, Verdict};

pub use http::HttpProvider;

/// Per-criterion score component of an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    /// Criterion name (e.g. "unambiguous", "verifiable").
    pub criterion: String,
    /// Score for this criterion, 0.0 to 1.0.
    pub score: f64,
}

/// Result of evaluating one requirement text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Overall score, 0.0 to 1.0.
    pub score: f64,
    /// Collaborator-assigned verdict.
    pub verdict: Verdict,
    /// Per-criterion breakdown.
    #[serde(default)]
    pub per_criterion: Vec<CriterionScore>,
}

impl Evaluation {
    /// Returns whether the evaluation clears the pass threshold.
    pub fn passes(&self, threshold: f64) -> bool {
        self.verdict == Verdict::Pass && self.score >= threshold
    }
}

/// An atomic suggestion used to rewrite a requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    /// Suggestion text.
    pub text: String,
    /// Optional suggestion category.
    #[serde(default)]
    pub kind: Option<String>,
}

/// A requirement mined out of a source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinedRequirement {
    /// Collaborator-assigned id, if any. The orchestrator assigns one
    /// derived from the document when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Requirement text.
    pub text: String,
    /// Location within the source document.
    #[serde(default)]
    pub source_ref: Option<String>,
}

/// Node/edge counts reported by a knowledge-graph indexing call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDelta {
    /// Nodes added or updated.
    pub nodes: usize,
    /// Edges added or updated.
    pub edges: usize,
}

/// One knowledge-graph search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Id of the matched entry.
    pub id: String,
    /// Similarity score.
    pub score: f64,
    /// Matched text.
    pub text: String,
}

/// Capability contract consumed by the workflow phases.
///
/// Implementations classify every failure as `Transient` (retry within the
/// worker pool) or `Fatal` (fail the item, isolated from its siblings).
#[async_trait]
pub trait RequirementProvider: Send + Sync {
    /// Scores a requirement text against the validation criteria.
    async fn evaluate(&self, text: &str) -> Result<Evaluation, CallError>;

    /// Proposes rewrite suggestions for a requirement text.
    async fn suggest(&self, text: &str) -> Result<Vec<Atom>, CallError>;

    /// Rewrites a requirement text applying the given suggestions.
    async fn rewrite(&self, text: &str, atoms: &[Atom]) -> Result<String, CallError>;

    /// Extracts requirement items from a source document.
    async fn mine(&self, document: &str) -> Result<Vec<MinedRequirement>, CallError>;

    /// Indexes requirement items into the knowledge graph.
    async fn build_graph(&self, items: &[RequirementItem]) -> Result<GraphDelta, CallError>;

    /// Searches the knowledge graph for related entries.
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, CallError>;
}
