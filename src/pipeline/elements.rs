//! `page_element_extractor` and `extract_page_text`.
//!
//! The first validates the layout and indexes it per page by kind, in
//! reading order (top to bottom, then left to right). It is the last
//! mandatory node: a layout that does not hold together here would only
//! produce garbage crops and summaries further down.
//!
//! The second joins each page's text regions into the page text.

use crate::error::StageError;
use crate::graph::{Stage, StageId};
use crate::state::{ArtifactState, LayoutRegion, PageElements, RegionKind, StateUpdate};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Height of the horizontal bands regions are bucketed into before sorting
/// left to right. Regions whose tops fall in the same band share a line.
const LINE_BAND: f32 = 0.02;

fn line_band(region: &LayoutRegion) -> i64 {
    (region.bbox.top / LINE_BAND).floor() as i64
}

fn reading_order(a: &LayoutRegion, b: &LayoutRegion) -> Ordering {
    line_band(a)
        .cmp(&line_band(b))
        .then_with(|| a.bbox.left.total_cmp(&b.bbox.left))
}

/// Validate every region and group them per page.
pub fn index_page_elements(
    layout: &BTreeMap<usize, Vec<LayoutRegion>>,
    page_count: usize,
) -> Result<BTreeMap<usize, PageElements>, StageError> {
    let mut seen_ids = BTreeSet::new();
    let mut out = BTreeMap::new();

    for (&page, regions) in layout {
        if page == 0 || page > page_count {
            return Err(StageError::MalformedInput(format!(
                "page {} is outside the document (1..={})",
                page, page_count
            )));
        }

        let mut sorted: Vec<&LayoutRegion> = regions.iter().collect();
        sorted.sort_by(|a, b| reading_order(a, b));

        let mut elements = PageElements::default();
        for region in sorted {
            if region.page != page {
                return Err(StageError::MalformedInput(format!(
                    "region {} is filed under page {} but claims page {}",
                    region.id, page, region.page
                )));
            }
            let Some(bbox) = region.bbox.clamped_to_page() else {
                return Err(StageError::MalformedInput(format!(
                    "region {} on page {} has an invalid bounding box {:?}",
                    region.id, page, region.bbox
                )));
            };
            if !seen_ids.insert(region.id) {
                return Err(StageError::MalformedInput(format!(
                    "region id {} appears more than once",
                    region.id
                )));
            }
            let bucket = match region.kind {
                RegionKind::Text => &mut elements.texts,
                RegionKind::Image => &mut elements.images,
                RegionKind::Table => &mut elements.tables,
            };
            bucket.push(LayoutRegion {
                bbox,
                ..region.clone()
            });
        }
        out.insert(page, elements);
    }

    Ok(out)
}

/// Page text: the page's text regions joined in reading order.
pub fn page_text(elements: &PageElements) -> String {
    elements
        .texts
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The `page_element_extractor` stage.
pub struct ExtractPageElementsStage;

#[async_trait]
impl Stage for ExtractPageElementsStage {
    fn id(&self) -> StageId {
        StageId::ExtractPageElements
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let layout = state.require_layout()?;
        let page_count = state
            .page_count
            .ok_or(StageError::MissingInput { field: "page_count" })?;
        index_page_elements(layout, page_count).map(StateUpdate::PageElements)
    }
}

/// The `extract_page_text` stage.
pub struct ExtractPageTextStage;

#[async_trait]
impl Stage for ExtractPageTextStage {
    fn id(&self) -> StageId {
        StageId::ExtractPageText
    }

    async fn run(&self, state: &ArtifactState) -> Result<StateUpdate, StageError> {
        let texts = state
            .require_page_elements()?
            .iter()
            .map(|(page, elements)| (*page, page_text(elements)))
            .collect();
        Ok(StateUpdate::PageText(texts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BoundingBox;

    fn region(id: u32, kind: RegionKind, page: usize, top: f32, left: f32, text: &str) -> LayoutRegion {
        LayoutRegion {
            id,
            kind,
            page,
            bbox: BoundingBox::new(left, top, left + 0.1, top + 0.05),
            text: text.to_string(),
            source_file: "/in/r_0000_0009.pdf".into(),
            page_in_file: page - 1,
        }
    }

    #[test]
    fn groups_by_kind_in_reading_order() {
        let layout = BTreeMap::from([(
            1,
            vec![
                region(0, RegionKind::Text, 1, 0.50, 0.1, "second"),
                region(1, RegionKind::Table, 1, 0.30, 0.1, ""),
                region(2, RegionKind::Text, 1, 0.101, 0.5, "first-right"),
                region(3, RegionKind::Text, 1, 0.104, 0.1, "first-left"),
                region(4, RegionKind::Image, 1, 0.70, 0.1, ""),
            ],
        )]);
        let pages = index_page_elements(&layout, 3).unwrap();
        let p1 = &pages[&1];

        let ids: Vec<u32> = p1.texts.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 0]);
        assert_eq!(p1.tables.len(), 1);
        assert_eq!(p1.images.len(), 1);
        assert_eq!(page_text(p1), "first-left\nfirst-right\nsecond");
    }

    #[test]
    fn rejects_out_of_range_pages() {
        let layout = BTreeMap::from([(5, vec![region(0, RegionKind::Text, 5, 0.1, 0.1, "x")])]);
        assert!(matches!(
            index_page_elements(&layout, 4),
            Err(StageError::MalformedInput(_))
        ));
    }

    #[test]
    fn rejects_bad_boxes_and_duplicate_ids() {
        let mut bad = region(0, RegionKind::Text, 1, 0.1, 0.1, "x");
        bad.bbox = BoundingBox::new(0.5, 0.5, 0.2, 0.9);
        let layout = BTreeMap::from([(1, vec![bad])]);
        assert!(index_page_elements(&layout, 1).is_err());

        let layout = BTreeMap::from([
            (1, vec![region(7, RegionKind::Text, 1, 0.1, 0.1, "a")]),
            (2, vec![region(7, RegionKind::Text, 2, 0.1, 0.1, "b")]),
        ]);
        let err = index_page_elements(&layout, 2).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn overhanging_boxes_are_clipped_not_rejected() {
        let mut edge = region(0, RegionKind::Image, 1, 0.9, 0.5, "");
        edge.bbox = BoundingBox::new(0.5, 0.9, 1.0004, 0.99);
        let layout = BTreeMap::from([(1, vec![edge])]);

        let pages = index_page_elements(&layout, 1).unwrap();
        assert_eq!(pages[&1].images[0].bbox, BoundingBox::new(0.5, 0.9, 1.0, 0.99));

        let mut off_page = region(1, RegionKind::Image, 1, 0.1, 0.1, "");
        off_page.bbox = BoundingBox::new(1.2, 0.1, 1.5, 0.2);
        let layout = BTreeMap::from([(1, vec![off_page])]);
        assert!(index_page_elements(&layout, 1).is_err());
    }

    #[test]
    fn empty_pages_yield_empty_text() {
        let layout = BTreeMap::from([(1, vec![]), (2, vec![region(0, RegionKind::Image, 2, 0.1, 0.1, "")])]);
        let pages = index_page_elements(&layout, 2).unwrap();
        assert_eq!(page_text(&pages[&1]), "");
        assert_eq!(page_text(&pages[&2]), "");
    }

    #[tokio::test]
    async fn stages_read_their_inputs_through_the_state() {
        let mut state = ArtifactState::new("/in/r.pdf", "en");
        assert!(ExtractPageElementsStage.run(&state).await.is_err());

        state.apply(StateUpdate::Split {
            page_count: 1,
            derived_files: vec![],
        });
        state.apply(StateUpdate::Layout(BTreeMap::from([(
            1,
            vec![region(0, RegionKind::Text, 1, 0.1, 0.1, "hello")],
        )])));
        let update = ExtractPageElementsStage.run(&state).await.unwrap();
        state.apply(update);

        let StateUpdate::PageText(text) = ExtractPageTextStage.run(&state).await.unwrap() else {
            panic!("wrong update variant");
        };
        assert_eq!(text[&1], "hello");
    }
}
