//! The four model-backed stages.
//!
//! | Stage | Reads | Writes | Model input |
//! |-------|-------|--------|-------------|
//! | `page_summary` | page text, images, tables | `text_summary` | page text |
//! | `image_summary` | images, text summaries | `image_summary` | crop + page summary |
//! | `table_summary` | tables, text summaries | `table_summary` | crop + page summary |
//! | `table_markdown` | tables | `table_markdown` | crop |
//!
//! Calls inside a stage run concurrently, bounded by `concurrency`. The first
//! failed call fails the stage; the executor then retries the stage as a
//! whole, so a stage's map is either complete or absent.

use crate::error::StageError;
use crate::graph::{Stage, StageId};
use crate::pipeline::llm::{CompletionRequest, SummaryModel};
use crate::pipeline::postprocess::{clean_summary, clean_table_markdown};
use crate::prompts;
use crate::state::{ArtifactState, CroppedArtifact, StateUpdate};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// ── Page summaries ───────────────────────────────────────────────────────

pub struct PageSummarizeStage {
    model: Arc<dyn SummaryModel>,
    concurrency: usize,
}

impl PageSummarizeStage {
    pub fn new(model: Arc<dyn SummaryModel>, concurrency: usize) -> Self {
        Self {
            model,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Stage for PageSummarizeStage {
    fn id(&self) -> StageId {
        StageId::PageSummarize
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let page_text = state.require_page_text()?;
        // Fan-in: both crop maps must be present even though only text is sent.
        let images = state.require_images()?;
        let tables = state.require_tables()?;
        debug!(
            "{}: summarising {} pages ({} images, {} tables)",
            state.file_name(),
            page_text.len(),
            images.len(),
            tables.len()
        );

        let requests: Vec<(usize, CompletionRequest)> = page_text
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(&page, text)| {
                (
                    page,
                    CompletionRequest {
                        system: prompts::PAGE_SUMMARY_SYSTEM_PROMPT.to_string(),
                        prompt: prompts::page_summary_prompt(page, text, &state.language),
                        image: None,
                    },
                )
            })
            .collect();

        let summaries = complete_all(&self.model, requests, self.concurrency, clean_summary).await?;
        Ok(StateUpdate::TextSummary(summaries))
    }
}

// ── Artifact summaries ───────────────────────────────────────────────────

/// Describes image or table crops, with the page summary as context.
pub struct ArtifactSummarizeStage {
    id: StageId,
    model: Arc<dyn SummaryModel>,
    concurrency: usize,
}

impl ArtifactSummarizeStage {
    pub fn images(model: Arc<dyn SummaryModel>, concurrency: usize) -> Self {
        Self {
            id: StageId::ImageSummarize,
            model,
            concurrency: concurrency.max(1),
        }
    }

    pub fn tables(model: Arc<dyn SummaryModel>, concurrency: usize) -> Self {
        Self {
            id: StageId::TableSummarize,
            model,
            concurrency: concurrency.max(1),
        }
    }

    fn request(&self, artifact: &CroppedArtifact, context: &str, language: &str) -> CompletionRequest {
        let (system, prompt) = match self.id {
            StageId::TableSummarize => (
                prompts::TABLE_SUMMARY_SYSTEM_PROMPT,
                prompts::table_summary_prompt(context, language),
            ),
            _ => (
                prompts::IMAGE_SUMMARY_SYSTEM_PROMPT,
                prompts::image_summary_prompt(context, language),
            ),
        };
        CompletionRequest {
            system: system.to_string(),
            prompt,
            image: Some(artifact.path.clone()),
        }
    }
}

#[async_trait]
impl Stage for ArtifactSummarizeStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let artifacts = match self.id {
            StageId::TableSummarize => state.require_tables()?,
            _ => state.require_images()?,
        };
        let text_summary = state.require_text_summary()?;

        let requests: Vec<(String, CompletionRequest)> = artifacts
            .iter()
            .map(|(id, artifact)| {
                let context = text_summary
                    .get(&artifact.page)
                    .map(String::as_str)
                    .unwrap_or_default();
                (id.clone(), self.request(artifact, context, &state.language))
            })
            .collect();

        let summaries = complete_all(&self.model, requests, self.concurrency, clean_summary).await?;
        Ok(match self.id {
            StageId::TableSummarize => StateUpdate::TableSummary(summaries),
            _ => StateUpdate::ImageSummary(summaries),
        })
    }
}

// ── Table transcription ──────────────────────────────────────────────────

pub struct TableMarkdownStage {
    model: Arc<dyn SummaryModel>,
    concurrency: usize,
}

impl TableMarkdownStage {
    pub fn new(model: Arc<dyn SummaryModel>, concurrency: usize) -> Self {
        Self {
            model,
            concurrency: concurrency.max(1),
        }
    }
}

#[async_trait]
impl Stage for TableMarkdownStage {
    fn id(&self) -> StageId {
        StageId::TableMarkdown
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let requests: Vec<(String, CompletionRequest)> = state
            .require_tables()?
            .iter()
            .map(|(id, artifact)| {
                (
                    id.clone(),
                    CompletionRequest {
                        system: prompts::TABLE_MARKDOWN_SYSTEM_PROMPT.to_string(),
                        prompt: prompts::table_markdown_prompt(&state.language),
                        image: Some(artifact.path.clone()),
                    },
                )
            })
            .collect();

        let tables =
            complete_all(&self.model, requests, self.concurrency, clean_table_markdown).await?;
        Ok(StateUpdate::TableMarkdown(tables))
    }
}

/// Run every request with at most `concurrency` in flight; stop at the first error.
async fn complete_all<K: Ord + Send>(
    model: &Arc<dyn SummaryModel>,
    requests: Vec<(K, CompletionRequest)>,
    concurrency: usize,
    clean: fn(&str) -> String,
) -> Result<BTreeMap<K, String>, StageError> {
    stream::iter(requests)
        .map(|(key, request)| {
            let model = Arc::clone(model);
            async move {
                let text = model.complete(&request).await?;
                Ok::<_, StageError>((key, clean(&text)))
            }
        })
        .buffer_unordered(concurrency)
        .try_collect()
        .await
}
