//! Stage implementations for the ingestion graph.
//!
//! Each submodule implements one node (or one pair of sibling nodes) of the
//! graph, plus the helpers those nodes share. Stages only see the
//! [`ArtifactState`](crate::state::ArtifactState) snapshot the executor hands
//! them and return a single update, so each is testable on its own.
//!
//! ## Data Flow
//!
//! ```text
//! split_pdf ─▶ layout_analyzer ─▶ page_element_extractor
//!                                   ├─▶ image_cropper ─────┐
//!                                   ├─▶ table_cropper ─────┼─▶ page_summary
//!                                   └─▶ extract_page_text ─┘     ├─▶ image_summary
//!                                                                 └─▶ table_summary ─▶ table_markdown
//! ```
//!
//! 1. [`split`]: cut the source into page batches (pdfium, `spawn_blocking`)
//! 2. [`layout`]: one layout request per batch; regions mapped to document pages
//! 3. [`elements`]: validate regions, index per page in reading order; page text
//! 4. [`crop`]: render pages once and save image/table regions as PNGs
//! 5. [`summarize`]: page, image and table summaries plus table transcription
//!
//! [`render`], [`encode`], [`llm`] and [`postprocess`] are shared helpers.

pub mod crop;
pub mod elements;
pub mod encode;
pub mod layout;
pub mod llm;
pub mod postprocess;
pub mod render;
pub mod split;
pub mod summarize;

use crate::config::IngestConfig;
use crate::graph::StageSet;
use layout::LayoutAnalyzer;
use llm::SummaryModel;
use std::sync::Arc;

/// Production stage implementations for [`PipelineGraph::standard`](crate::graph::PipelineGraph::standard).
pub fn standard_stages(
    config: &IngestConfig,
    model: Arc<dyn SummaryModel>,
    analyzer: Arc<dyn LayoutAnalyzer>,
) -> StageSet {
    let artifact_dir = config.artifact_dir();
    let n = config.concurrency;

    StageSet {
        split: Arc::new(split::SplitStage::new(config.split_batch_size)),
        layout: Arc::new(layout::LayoutStage::new(analyzer, n)),
        elements: Arc::new(elements::ExtractPageElementsStage),
        image_crop: Arc::new(crop::CropStage::images(artifact_dir.clone(), config.render_width)),
        table_crop: Arc::new(crop::CropStage::tables(artifact_dir, config.render_width)),
        page_text: Arc::new(elements::ExtractPageTextStage),
        page_summary: Arc::new(summarize::PageSummarizeStage::new(Arc::clone(&model), n)),
        image_summary: Arc::new(summarize::ArtifactSummarizeStage::images(Arc::clone(&model), n)),
        table_summary: Arc::new(summarize::ArtifactSummarizeStage::tables(Arc::clone(&model), n)),
        table_markdown: Arc::new(summarize::TableMarkdownStage::new(model, n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::graph::{PipelineGraph, StageId};
    use crate::pipeline::llm::CompletionRequest;
    use crate::state::LayoutRegion;
    use async_trait::async_trait;
    use std::path::Path;

    struct Silent;

    #[async_trait]
    impl SummaryModel for Silent {
        async fn complete(&self, _: &CompletionRequest) -> Result<String, StageError> {
            Ok(String::new())
        }
    }

    #[async_trait]
    impl LayoutAnalyzer for Silent {
        async fn analyze(&self, _: &Path) -> Result<Vec<LayoutRegion>, StageError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn standard_stages_fill_every_slot() {
        let stages = standard_stages(&IngestConfig::default(), Arc::new(Silent), Arc::new(Silent));
        let graph = PipelineGraph::standard(stages).expect("slots line up with ids");
        assert_eq!(graph.len(), StageId::ALL.len());
        assert_eq!(
            graph.terminals(),
            vec![StageId::ImageSummarize, StageId::TableMarkdown]
        );
    }
}
