use crate::chunking::normalize_text;
use crate::error::IngestError;
use crate::layout::{BoundingBox, ElementKind, LayoutElement, PageLayout, PageSource, TableRegion};
use crate::models::{ContentKind, ContentUnit};
use crate::ocr::OcrEngine;
use crate::table::{extract_grid, format_table};
use tracing::{debug, warn};

const REGION_TOLERANCE: f32 = 2.0;
/// Smaller images are bullets or spacers.
const MIN_FIGURE_SIDE: f32 = 4.0;

#[derive(Debug, Clone, Copy)]
struct TableBand {
    lower: f32,
    upper: f32,
}

impl TableBand {
    fn encloses(&self, bbox: &BoundingBox) -> bool {
        bbox.y0 >= self.lower - REGION_TOLERANCE && bbox.y1 <= self.upper + REGION_TOLERANCE
    }
}

pub struct ReadingOrder<'a> {
    ocr: &'a dyn OcrEngine,
}

impl<'a> ReadingOrder<'a> {
    pub fn new(ocr: &'a dyn OcrEngine) -> Self {
        Self { ocr }
    }

    /// Text of every readable page, units joined by newlines and pages by a
    /// blank line. Pages that fail to parse are logged and skipped.
    pub fn reconstruct_document(&self, source: &dyn PageSource) -> String {
        let mut pages = Vec::new();
        for index in 0..source.page_count() {
            match self.reconstruct_page(source, index) {
                Ok(units) => {
                    let text = units
                        .iter()
                        .map(|unit| unit.value.as_str())
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.trim().is_empty() {
                        pages.push(text);
                    }
                }
                Err(error) => warn!(page = index + 1, %error, "skipping unreadable page"),
            }
        }
        normalize_text(&pages.join("\n\n"))
    }

    pub fn reconstruct_page(
        &self,
        source: &dyn PageSource,
        index: usize,
    ) -> Result<Vec<ContentUnit>, IngestError> {
        let layout = source.layout(index)?;
        Ok(self.order_units(source, index, &layout))
    }

    fn order_units(
        &self,
        source: &dyn PageSource,
        index: usize,
        layout: &PageLayout,
    ) -> Vec<ContentUnit> {
        let mut elements = layout.elements.iter().collect::<Vec<_>>();
        elements.sort_by(|a, b| b.bbox.y1.total_cmp(&a.bbox.y1));

        let tables = &layout.tables;
        let mut units = Vec::new();
        let mut next_table = 0usize;
        let mut band: Option<TableBand> = None;

        for element in elements {
            if band.is_some_and(|band| !band.encloses(&element.bbox)) {
                band = None;
            }

            match &element.kind {
                ElementKind::Text { text } => {
                    if band.is_some() || inside_any_table(tables, &element.bbox) {
                        continue;
                    }
                    push_unit(&mut units, ContentKind::Text, text);
                }
                ElementKind::Figure { .. } if !worth_reading(layout, &element.bbox) => {
                    debug!(page = layout.number, "figure off page or too small")
                }
                ElementKind::Figure { .. } => match self.figure_text(source, index, element) {
                    Ok(text) if !text.trim().is_empty() => {
                        push_unit(&mut units, ContentKind::ImageText, &text)
                    }
                    Ok(_) => debug!(page = layout.number, "figure has no recognizable text"),
                    Err(error) => warn!(page = layout.number, %error, "skipping figure"),
                },
                ElementKind::Rect => {
                    if band.is_some() {
                        continue;
                    }
                    let Some(table) = tables.get(next_table) else {
                        continue;
                    };
                    if !table.bbox.intersects(&element.bbox, REGION_TOLERANCE) {
                        continue;
                    }
                    next_table += 1;
                    band = Some(TableBand {
                        lower: table.bbox.y0,
                        upper: table.bbox.y1.max(element.bbox.y1),
                    });
                    self.push_table(&mut units, layout, table);
                }
            }
        }

        for table in tables.iter().skip(next_table) {
            self.push_table(&mut units, layout, table);
        }

        units
    }

    fn figure_text(
        &self,
        source: &dyn PageSource,
        index: usize,
        element: &LayoutElement,
    ) -> Result<String, IngestError> {
        let crop = source.crop_image(index, element)?;
        Ok(self.ocr.recognize(&crop)?)
    }

    fn push_table(&self, units: &mut Vec<ContentUnit>, layout: &PageLayout, table: &TableRegion) {
        match extract_grid(layout, table) {
            Ok(grid) => push_unit(units, ContentKind::TableText, &format_table(&grid)),
            Err(error) => warn!(page = layout.number, %error, "skipping table"),
        }
    }
}

fn worth_reading(layout: &PageLayout, bbox: &BoundingBox) -> bool {
    bbox.intersects(&layout.media_box, 0.0)
        && bbox.width() >= MIN_FIGURE_SIDE
        && bbox.height() >= MIN_FIGURE_SIDE
}

fn inside_any_table(tables: &[TableRegion], bbox: &BoundingBox) -> bool {
    tables
        .iter()
        .any(|table| table.bbox.contains(bbox, REGION_TOLERANCE))
}

fn push_unit(units: &mut Vec<ContentUnit>, kind: ContentKind, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    units.push(ContentUnit {
        kind,
        value: value.to_string(),
        ordinal: units.len(),
    });
}
