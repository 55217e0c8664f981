//! The stage contract and the static pipeline DAG.
//!
//! ## Topology
//!
//! ```text
//! split_pdf ─▶ layout_analyzer ─▶ page_element_extractor
//!                                        │
//!              ┌─────────────────────────┼──────────────────────┐
//!              ▼                         ▼                      ▼
//!        image_cropper             table_cropper        extract_page_text
//!              └─────────────────────────┼──────────────────────┘
//!                                        ▼
//!                                  page_summary
//!                              ┌─────────┴─────────┐
//!                              ▼                   ▼
//!                        image_summary       table_summary ─▶ table_markdown
//! ```
//!
//! The first three nodes are *mandatory*: without them nothing downstream
//! has input, so their failure aborts the file. Everything after
//! `page_element_extractor` is optional and degrades to a partial run.
//!
//! Graphs are assembled through [`GraphBuilder`], which rejects duplicate
//! nodes, edges to unknown nodes and cycles, so the executor can assume it
//! is walking a well-formed DAG.

use crate::error::{IngestError, StageError};
use crate::state::{ArtifactState, StateUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// ── Stage identity ───────────────────────────────────────────────────────

/// Identifies one node of the pipeline graph.
///
/// Serialises to the node name (e.g. `"layout_analyzer"`), which is also
/// what the ledger records in `failed_stages`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageId {
    #[serde(rename = "split_pdf")]
    Split,
    #[serde(rename = "layout_analyzer")]
    LayoutAnalyze,
    #[serde(rename = "page_element_extractor")]
    ExtractPageElements,
    #[serde(rename = "image_cropper")]
    ImageCrop,
    #[serde(rename = "table_cropper")]
    TableCrop,
    #[serde(rename = "extract_page_text")]
    ExtractPageText,
    #[serde(rename = "page_summary")]
    PageSummarize,
    #[serde(rename = "image_summary")]
    ImageSummarize,
    #[serde(rename = "table_summary")]
    TableSummarize,
    #[serde(rename = "table_markdown")]
    TableMarkdown,
}

impl StageId {
    pub const ALL: [StageId; 10] = [
        StageId::Split,
        StageId::LayoutAnalyze,
        StageId::ExtractPageElements,
        StageId::ImageCrop,
        StageId::TableCrop,
        StageId::ExtractPageText,
        StageId::PageSummarize,
        StageId::ImageSummarize,
        StageId::TableSummarize,
        StageId::TableMarkdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Split => "split_pdf",
            StageId::LayoutAnalyze => "layout_analyzer",
            StageId::ExtractPageElements => "page_element_extractor",
            StageId::ImageCrop => "image_cropper",
            StageId::TableCrop => "table_cropper",
            StageId::ExtractPageText => "extract_page_text",
            StageId::PageSummarize => "page_summary",
            StageId::ImageSummarize => "image_summary",
            StageId::TableSummarize => "table_summary",
            StageId::TableMarkdown => "table_markdown",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Stage contract ───────────────────────────────────────────────────────

/// One processing step.
///
/// A stage reads a snapshot of the state and returns the single
/// [`StateUpdate`] it owns. It must not assume that upstream stages ran;
/// inputs are read through the `require_*` accessors on [`ArtifactState`],
/// which fail with [`StageError::MissingInput`].
///
/// `run` may be called several times for the same state when the executor
/// retries a transient failure, so implementations must be repeatable.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError>;
}

// ── Graph ────────────────────────────────────────────────────────────────

/// A node: a stage plus its incoming edges.
pub struct Node {
    pub stage: Arc<dyn Stage>,
    pub predecessors: Vec<StageId>,
    /// Failure of a mandatory node aborts the whole run.
    pub mandatory: bool,
}

impl Node {
    pub fn id(&self) -> StageId {
        self.stage.id()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("predecessors", &self.predecessors)
            .field("mandatory", &self.mandatory)
            .finish()
    }
}

/// A validated, acyclic stage graph.
///
/// Nodes are kept in declaration order; the executor uses that order to
/// apply updates deterministically at each join barrier.
#[derive(Debug)]
pub struct PipelineGraph {
    nodes: Vec<Node>,
}

impl PipelineGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    /// The fixed ingestion topology wired to the given stage implementations.
    pub fn standard(stages: StageSet) -> Result<Self, IngestError> {
        use StageId::*;

        let StageSet {
            split,
            layout,
            elements,
            image_crop,
            table_crop,
            page_text,
            page_summary,
            image_summary,
            table_summary,
            table_markdown,
        } = stages;

        let slots = [
            (Split, &split),
            (LayoutAnalyze, &layout),
            (ExtractPageElements, &elements),
            (ImageCrop, &image_crop),
            (TableCrop, &table_crop),
            (ExtractPageText, &page_text),
            (PageSummarize, &page_summary),
            (ImageSummarize, &image_summary),
            (TableSummarize, &table_summary),
            (TableMarkdown, &table_markdown),
        ];
        for (expected, stage) in slots {
            if stage.id() != expected {
                return Err(IngestError::InvalidGraph(format!(
                    "stage in the '{}' slot reports id '{}'",
                    expected,
                    stage.id()
                )));
            }
        }

        Self::builder()
            .mandatory(split, &[])
            .mandatory(layout, &[Split])
            .mandatory(elements, &[LayoutAnalyze])
            .optional(image_crop, &[ExtractPageElements])
            .optional(table_crop, &[ExtractPageElements])
            .optional(page_text, &[ExtractPageElements])
            .optional(page_summary, &[ImageCrop, TableCrop, ExtractPageText])
            .optional(image_summary, &[PageSummarize])
            .optional(table_summary, &[PageSummarize])
            .optional(table_markdown, &[TableSummarize])
            .build()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: StageId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes no other node depends on.
    pub fn terminals(&self) -> Vec<StageId> {
        let referenced: BTreeSet<StageId> = self
            .nodes
            .iter()
            .flat_map(|n| n.predecessors.iter().copied())
            .collect();
        self.nodes
            .iter()
            .map(Node::id)
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    /// A topological order, ties broken by declaration order.
    pub fn topological_order(&self) -> Vec<StageId> {
        // Validated at build time, so Kahn always drains every node.
        kahn(&self.nodes).unwrap_or_default()
    }
}

/// Builder for [`PipelineGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    /// Add a node whose failure aborts the run.
    pub fn mandatory(self, stage: Arc<dyn Stage>, predecessors: &[StageId]) -> Self {
        self.node(stage, predecessors, true)
    }

    /// Add a node whose failure only marks the run partial.
    pub fn optional(self, stage: Arc<dyn Stage>, predecessors: &[StageId]) -> Self {
        self.node(stage, predecessors, false)
    }

    pub fn node(mut self, stage: Arc<dyn Stage>, predecessors: &[StageId], mandatory: bool) -> Self {
        self.nodes.push(Node {
            stage,
            predecessors: predecessors.to_vec(),
            mandatory,
        });
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<PipelineGraph, IngestError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id()) {
                return Err(IngestError::InvalidGraph(format!(
                    "duplicate node '{}'",
                    node.id()
                )));
            }
        }

        for node in &self.nodes {
            for pred in &node.predecessors {
                if !seen.contains(pred) {
                    return Err(IngestError::InvalidGraph(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id(),
                        pred
                    )));
                }
                if *pred == node.id() {
                    return Err(IngestError::InvalidGraph(format!(
                        "node '{}' depends on itself",
                        node.id()
                    )));
                }
            }
        }

        kahn(&self.nodes)?;

        Ok(PipelineGraph { nodes: self.nodes })
    }
}

/// Kahn's algorithm over `nodes`. Fails when a cycle leaves nodes unvisited.
fn kahn(nodes: &[Node]) -> Result<Vec<StageId>, IngestError> {
    let mut indegree: BTreeMap<StageId, usize> = nodes
        .iter()
        .map(|n| (n.id(), n.predecessors.len()))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    loop {
        let next = nodes
            .iter()
            .map(Node::id)
            .find(|id| indegree.get(id) == Some(&0));
        let Some(id) = next else { break };

        indegree.remove(&id);
        order.push(id);
        for node in nodes {
            if let Some(d) = indegree.get_mut(&node.id()) {
                *d -= node.predecessors.iter().filter(|p| **p == id).count();
            }
        }
    }

    if indegree.is_empty() {
        Ok(order)
    } else {
        let stuck: Vec<&str> = indegree.keys().map(StageId::as_str).collect();
        Err(IngestError::InvalidGraph(format!(
            "cycle detected among: {}",
            stuck.join(", ")
        )))
    }
}

// ── Stage set ────────────────────────────────────────────────────────────

/// One implementation per node of the standard topology.
///
/// Production code builds this with [`crate::pipeline::standard_stages`];
/// tests swap individual slots for fakes.
#[derive(Clone)]
pub struct StageSet {
    pub split: Arc<dyn Stage>,
    pub layout: Arc<dyn Stage>,
    pub elements: Arc<dyn Stage>,
    pub image_crop: Arc<dyn Stage>,
    pub table_crop: Arc<dyn Stage>,
    pub page_text: Arc<dyn Stage>,
    pub page_summary: Arc<dyn Stage>,
    pub image_summary: Arc<dyn Stage>,
    pub table_summary: Arc<dyn Stage>,
    pub table_markdown: Arc<dyn Stage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Noop(StageId);

    #[async_trait]
    impl Stage for Noop {
        fn id(&self) -> StageId {
            self.0
        }

        async fn run(&self, _state: &ArtifactState) -> Result<StateUpdate, StageError> {
            Ok(StateUpdate::PageText(BTreeMap::new()))
        }
    }

    fn noop(id: StageId) -> Arc<dyn Stage> {
        Arc::new(Noop(id))
    }

    fn noop_set() -> StageSet {
        use StageId::*;
        StageSet {
            split: noop(Split),
            layout: noop(LayoutAnalyze),
            elements: noop(ExtractPageElements),
            image_crop: noop(ImageCrop),
            table_crop: noop(TableCrop),
            page_text: noop(ExtractPageText),
            page_summary: noop(PageSummarize),
            image_summary: noop(ImageSummarize),
            table_summary: noop(TableSummarize),
            table_markdown: noop(TableMarkdown),
        }
    }

    #[test]
    fn standard_topology_is_valid() {
        let graph = PipelineGraph::standard(noop_set()).unwrap();
        assert_eq!(graph.len(), 10);
        assert_eq!(
            graph.terminals(),
            vec![StageId::ImageSummarize, StageId::TableMarkdown]
        );

        let order = graph.topological_order();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(StageId::Split) < pos(StageId::LayoutAnalyze));
        assert!(pos(StageId::ImageCrop) < pos(StageId::PageSummarize));
        assert!(pos(StageId::TableCrop) < pos(StageId::PageSummarize));
        assert!(pos(StageId::ExtractPageText) < pos(StageId::PageSummarize));
        assert!(pos(StageId::TableSummarize) < pos(StageId::TableMarkdown));
    }

    #[test]
    fn only_the_front_of_the_graph_is_mandatory() {
        let graph = PipelineGraph::standard(noop_set()).unwrap();
        let mandatory: Vec<StageId> = graph
            .nodes()
            .iter()
            .filter(|n| n.mandatory)
            .map(Node::id)
            .collect();
        assert_eq!(
            mandatory,
            vec![
                StageId::Split,
                StageId::LayoutAnalyze,
                StageId::ExtractPageElements
            ]
        );
    }

    #[test]
    fn rejects_misplaced_stage() {
        let mut set = noop_set();
        set.table_markdown = noop(StageId::TableSummarize);
        let err = PipelineGraph::standard(set).unwrap_err();
        assert!(err.to_string().contains("table_markdown"), "got: {err}");
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let err = PipelineGraph::builder()
            .mandatory(noop(StageId::Split), &[])
            .optional(noop(StageId::Split), &[])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate"), "got: {err}");
    }

    #[test]
    fn rejects_unknown_predecessor() {
        let err = PipelineGraph::builder()
            .mandatory(noop(StageId::Split), &[])
            .optional(noop(StageId::TableMarkdown), &[StageId::TableSummarize])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown node 'table_summary'"), "got: {err}");
    }

    #[test]
    fn rejects_cycles() {
        let err = PipelineGraph::builder()
            .mandatory(noop(StageId::Split), &[])
            .optional(noop(StageId::ImageCrop), &[StageId::Split, StageId::TableCrop])
            .optional(noop(StageId::TableCrop), &[StageId::ImageCrop])
            .build()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "got: {msg}");
        assert!(msg.contains("image_cropper"), "got: {msg}");

        let err = PipelineGraph::builder()
            .mandatory(noop(StageId::Split), &[StageId::Split])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn stage_ids_serialize_as_node_names() {
        for id in StageId::ALL {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
    }
}
