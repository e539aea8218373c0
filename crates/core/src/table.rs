use crate::error::IngestError;
use crate::layout::{BoundingBox, PageLayout, TableRegion};
use std::collections::BTreeMap;

const EDGE_TOLERANCE: f32 = 2.0;
const MIN_EDGES: usize = 3;

/// Table cells by row; a missing cell is `None`.
pub type TableGrid = Vec<Vec<Option<String>>>;

/// One `|a|b|` line per row.
pub fn format_table(grid: &TableGrid) -> String {
    grid.iter()
        .map(|row| {
            let cells = row
                .iter()
                .map(|cell| cell.as_deref().unwrap_or("").replace(['\r', '\n'], " "))
                .collect::<Vec<_>>();
            format!("|{}|", cells.join("|"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Groups touching rectangles and keeps the groups whose edges form a grid
/// of at least two rows and two columns. Regions come back top-first.
pub fn detect_tables(rects: &[BoundingBox]) -> Vec<TableRegion> {
    let mut parent = (0..rects.len()).collect::<Vec<_>>();
    for left in 0..rects.len() {
        for right in left + 1..rects.len() {
            if rects[left].intersects(&rects[right], EDGE_TOLERANCE) {
                let a = find_root(&mut parent, left);
                let b = find_root(&mut parent, right);
                if a != b {
                    parent[b] = a;
                }
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for index in 0..rects.len() {
        let root = find_root(&mut parent, index);
        groups.entry(root).or_default().push(index);
    }

    let mut regions = groups
        .into_values()
        .filter(|members| members.len() > 1)
        .filter_map(|members| {
            let bbox = members
                .iter()
                .map(|&index| rects[index])
                .reduce(|acc, rect| acc.union(&rect))?;
            let column_edges = cluster_edges(
                members
                    .iter()
                    .flat_map(|&index| [rects[index].x0, rects[index].x1]),
            );
            let mut row_edges = cluster_edges(
                members
                    .iter()
                    .flat_map(|&index| [rects[index].y0, rects[index].y1]),
            );
            if column_edges.len() < MIN_EDGES || row_edges.len() < MIN_EDGES {
                return None;
            }
            row_edges.reverse();
            Some(TableRegion {
                bbox,
                row_edges,
                column_edges,
            })
        })
        .collect::<Vec<_>>();

    regions.sort_by(|a, b| b.bbox.y1.total_cmp(&a.bbox.y1));
    regions
}

fn find_root(parent: &mut [usize], mut index: usize) -> usize {
    while parent[index] != index {
        parent[index] = parent[parent[index]];
        index = parent[index];
    }
    index
}

fn cluster_edges(values: impl Iterator<Item = f32>) -> Vec<f32> {
    let mut sorted = values.collect::<Vec<_>>();
    sorted.sort_by(f32::total_cmp);

    let mut edges: Vec<f32> = Vec::new();
    for value in sorted {
        match edges.last() {
            Some(last) if value - last <= EDGE_TOLERANCE => {}
            _ => edges.push(value),
        }
    }
    edges
}

/// Places every text fragment of the page that falls inside `region` into
/// its cell. Rows and columns without any text are dropped.
pub fn extract_grid(layout: &PageLayout, region: &TableRegion) -> Result<TableGrid, IngestError> {
    let rows = region.row_edges.len().saturating_sub(1);
    let columns = region.column_edges.len().saturating_sub(1);
    if rows == 0 || columns == 0 {
        return Err(IngestError::TableExtraction(
            "table region has no cell boundaries".to_string(),
        ));
    }

    let mut grid: TableGrid = vec![vec![None; columns]; rows];
    for fragment in &layout.fragments {
        if !region
            .bbox
            .contains_point(fragment.x, fragment.y, EDGE_TOLERANCE)
        {
            continue;
        }
        let text = fragment.text.trim();
        if text.is_empty() {
            continue;
        }

        let row = region
            .row_edges
            .windows(2)
            .position(|edges| fragment.y <= edges[0] && fragment.y > edges[1]);
        let column = region
            .column_edges
            .windows(2)
            .position(|edges| fragment.x >= edges[0] - 0.5 && fragment.x < edges[1]);
        let (Some(row), Some(column)) = (row, column) else {
            continue;
        };

        let cell = &mut grid[row][column];
        match cell {
            Some(existing) => {
                existing.push(' ');
                existing.push_str(text);
            }
            None => *cell = Some(text.to_string()),
        }
    }

    let used_columns = (0..columns)
        .filter(|&column| grid.iter().any(|row| row[column].is_some()))
        .collect::<Vec<_>>();
    let grid = grid
        .into_iter()
        .filter(|row| row.iter().any(Option::is_some))
        .map(|row| {
            used_columns
                .iter()
                .map(|&column| row[column].clone())
                .collect::<Vec<_>>()
        })
        .collect::<TableGrid>();

    if grid.is_empty() {
        return Err(IngestError::TableExtraction(
            "table region contains no text".to_string(),
        ));
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TextFragment;
    use pretty_assertions::assert_eq;

    /// A 2x2 table of cell rectangles with its top-left corner at (100, 500).
    fn cell_rects() -> Vec<BoundingBox> {
        vec![
            BoundingBox::new(100.0, 480.0, 200.0, 500.0),
            BoundingBox::new(200.0, 480.0, 300.0, 500.0),
            BoundingBox::new(100.0, 460.0, 200.0, 480.0),
            BoundingBox::new(200.0, 460.0, 300.0, 480.0),
        ]
    }

    fn fragment(x: f32, y: f32, text: &str) -> TextFragment {
        TextFragment {
            x,
            y,
            text: text.to_string(),
        }
    }

    fn layout_with(fragments: Vec<TextFragment>, tables: Vec<TableRegion>) -> PageLayout {
        PageLayout {
            number: 1,
            media_box: BoundingBox::new(0.0, 0.0, 612.0, 792.0),
            elements: Vec::new(),
            fragments,
            tables,
        }
    }

    #[test]
    fn rows_render_pipe_delimited() {
        let grid: TableGrid = vec![
            vec![Some("a".to_string()), Some("b".to_string())],
            vec![Some("c".to_string()), None],
        ];
        assert_eq!(format_table(&grid), "|a|b|\n|c||");
    }

    #[test]
    fn cell_line_breaks_become_spaces() {
        let grid: TableGrid = vec![vec![Some("two\nlines".to_string()), Some("x".to_string())]];
        assert_eq!(format_table(&grid), "|two lines|x|");
    }

    #[test]
    fn touching_cells_form_a_table() {
        let tables = detect_tables(&cell_rects());
        assert_eq!(tables.len(), 1);
        let table = &tables[0];
        assert_eq!(table.bbox, BoundingBox::new(100.0, 460.0, 300.0, 500.0));
        assert_eq!(table.column_edges, vec![100.0, 200.0, 300.0]);
        assert_eq!(table.row_edges, vec![500.0, 480.0, 460.0]);
    }

    #[test]
    fn isolated_boxes_are_not_tables() {
        let rects = vec![
            BoundingBox::new(10.0, 10.0, 50.0, 50.0),
            BoundingBox::new(300.0, 300.0, 350.0, 320.0),
        ];
        assert!(detect_tables(&rects).is_empty());
    }

    #[test]
    fn separate_tables_are_sorted_top_first() {
        let mut rects = cell_rects();
        rects.extend(
            cell_rects()
                .into_iter()
                .map(|rect| BoundingBox::new(rect.x0, rect.y0 + 200.0, rect.x1, rect.y1 + 200.0)),
        );
        let tables = detect_tables(&rects);
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].bbox.y1, 700.0);
        assert_eq!(tables[1].bbox.y1, 500.0);
    }

    #[test]
    fn fragments_land_in_their_cells() {
        let region = detect_tables(&cell_rects()).remove(0);
        let layout = layout_with(
            vec![
                fragment(105.0, 485.0, "Part"),
                fragment(205.0, 485.0, "Qty"),
                fragment(105.0, 465.0, "Valve"),
                fragment(150.0, 465.0, "seal"),
                fragment(205.0, 465.0, "2"),
                fragment(400.0, 465.0, "outside"),
            ],
            vec![region.clone()],
        );

        let grid = extract_grid(&layout, &region).expect("grid should be extracted");
        assert_eq!(format_table(&grid), "|Part|Qty|\n|Valve seal|2|");
    }

    #[test]
    fn empty_rows_and_columns_are_dropped() {
        let region = detect_tables(&cell_rects()).remove(0);
        let layout = layout_with(vec![fragment(105.0, 465.0, "only")], vec![region.clone()]);
        let grid = extract_grid(&layout, &region).expect("grid should be extracted");
        assert_eq!(grid, vec![vec![Some("only".to_string())]]);
    }

    #[test]
    fn region_without_text_is_an_error() {
        let region = detect_tables(&cell_rects()).remove(0);
        let layout = layout_with(Vec::new(), vec![region.clone()]);
        assert!(matches!(
            extract_grid(&layout, &region),
            Err(IngestError::TableExtraction(_))
        ));
    }
}
