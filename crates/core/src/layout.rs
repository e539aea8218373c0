use crate::error::IngestError;
use crate::table::detect_tables;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

const LETTER: BoundingBox = BoundingBox {
    x0: 0.0,
    y0: 0.0,
    x1: 612.0,
    y1: 792.0,
};
const MAX_FORM_DEPTH: usize = 8;
const MAX_TREE_DEPTH: usize = 32;
/// Approximate glyph advance as a share of the font size; no font metrics are read.
const GLYPH_WIDTH: f32 = 0.5;
const PAINT_OPERATORS: [&str; 9] = ["S", "s", "f", "F", "f*", "B", "B*", "b", "b*"];

/// PDF user space: `y` grows upwards, so `y1` is the top edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn contains(&self, other: &BoundingBox, tolerance: f32) -> bool {
        other.x0 >= self.x0 - tolerance
            && other.y0 >= self.y0 - tolerance
            && other.x1 <= self.x1 + tolerance
            && other.y1 <= self.y1 + tolerance
    }

    pub fn contains_point(&self, x: f32, y: f32, tolerance: f32) -> bool {
        x >= self.x0 - tolerance
            && x <= self.x1 + tolerance
            && y >= self.y0 - tolerance
            && y <= self.y1 + tolerance
    }

    pub fn intersects(&self, other: &BoundingBox, tolerance: f32) -> bool {
        self.x0 <= other.x1 + tolerance
            && other.x0 <= self.x1 + tolerance
            && self.y0 <= other.y1 + tolerance
            && other.y0 <= self.y1 + tolerance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Text { text: String },
    /// An image figure; `resource` is the object id of its image XObject.
    Figure { resource: Option<ObjectId> },
    Rect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutElement {
    pub bbox: BoundingBox,
    pub kind: ElementKind,
}

impl LayoutElement {
    pub fn text(bbox: BoundingBox, text: impl Into<String>) -> Self {
        Self {
            bbox,
            kind: ElementKind::Text { text: text.into() },
        }
    }

    pub fn figure(bbox: BoundingBox, resource: Option<ObjectId>) -> Self {
        Self {
            bbox,
            kind: ElementKind::Figure { resource },
        }
    }

    pub fn rect(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            kind: ElementKind::Rect,
        }
    }

    pub fn is_rect(&self) -> bool {
        matches!(self.kind, ElementKind::Rect)
    }
}

/// A single positioned text run, anchored at its baseline origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFragment {
    pub x: f32,
    pub y: f32,
    pub text: String,
}

/// A table found on a page. Row edges run top to bottom, column edges left
/// to right.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRegion {
    pub bbox: BoundingBox,
    pub row_edges: Vec<f32>,
    pub column_edges: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    pub number: u32,
    pub media_box: BoundingBox,
    pub elements: Vec<LayoutElement>,
    pub fragments: Vec<TextFragment>,
    pub tables: Vec<TableRegion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageCrop {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
    pub width: u32,
    pub height: u32,
}

impl ImageCrop {
    pub fn extension(&self) -> &'static str {
        match self.media_type {
            "image/jpeg" => "jpg",
            "image/jp2" => "jp2",
            _ => "png",
        }
    }
}

pub trait PageSource {
    fn page_count(&self) -> usize;

    fn layout(&self, index: usize) -> Result<PageLayout, IngestError>;

    fn crop_image(&self, index: usize, element: &LayoutElement) -> Result<ImageCrop, IngestError>;
}

pub struct LopdfPageSource {
    document: Document,
    pages: Vec<(u32, ObjectId)>,
}

impl LopdfPageSource {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        let document = Document::load(path).map_err(pdf_error)?;
        Ok(Self::from_document(document))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IngestError> {
        let document = Document::load_mem(bytes).map_err(pdf_error)?;
        Ok(Self::from_document(document))
    }

    fn from_document(document: Document) -> Self {
        let pages = document.get_pages().into_iter().collect();
        Self { document, pages }
    }

    /// Plain text of one page as lopdf extracts it, without layout analysis.
    pub fn page_text(&self, index: usize) -> Result<String, IngestError> {
        let (number, _) = self.page(index)?;
        self.document.extract_text(&[number]).map_err(pdf_error)
    }

    fn page(&self, index: usize) -> Result<(u32, ObjectId), IngestError> {
        self.pages.get(index).copied().ok_or_else(|| {
            IngestError::InvalidArgument(format!(
                "page index {index} out of range ({} pages)",
                self.pages.len()
            ))
        })
    }
}

impl PageSource for LopdfPageSource {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn layout(&self, index: usize) -> Result<PageLayout, IngestError> {
        let (number, page_id) = self.page(index)?;
        let document = &self.document;

        let media_box = inherited(document, page_id, b"MediaBox")
            .and_then(|object| bbox_from_array(document, object))
            .unwrap_or(LETTER);
        let resources = inherited(document, page_id, b"Resources")
            .and_then(|object| resolve_dict(document, object));

        let data = document.get_page_content(page_id).map_err(pdf_error)?;
        let content = Content::decode(&data).map_err(pdf_error)?;

        let mut interpreter = Interpreter::new(document);
        interpreter.run(&content.operations, resources, Matrix::IDENTITY, 0);
        let (elements, fragments) = interpreter.finish();

        let rects = elements
            .iter()
            .filter(|element| element.is_rect())
            .map(|element| element.bbox)
            .collect::<Vec<_>>();
        let tables = detect_tables(&rects);

        debug!(
            page = number,
            elements = elements.len(),
            tables = tables.len(),
            "page layout analysed"
        );

        Ok(PageLayout {
            number,
            media_box,
            elements,
            fragments,
            tables,
        })
    }

    fn crop_image(&self, _index: usize, element: &LayoutElement) -> Result<ImageCrop, IngestError> {
        let ElementKind::Figure {
            resource: Some(object_id),
        } = &element.kind
        else {
            return Err(IngestError::ImageCrop(
                "figure has no addressable image resource".to_string(),
            ));
        };

        let stream = self
            .document
            .get_object(*object_id)
            .and_then(|object| object.as_stream())
            .map_err(|error| IngestError::ImageCrop(error.to_string()))?;

        image_from_stream(&self.document, stream)
    }
}

fn pdf_error(error: lopdf::Error) -> IngestError {
    IngestError::PdfParse(error.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix([f32; 6]);

impl Matrix {
    const IDENTITY: Matrix = Matrix([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    fn translate(tx: f32, ty: f32) -> Self {
        Matrix([1.0, 0.0, 0.0, 1.0, tx, ty])
    }

    fn from_operands(operands: &[Object]) -> Option<Self> {
        if operands.len() < 6 {
            return None;
        }
        let mut values = [0.0f32; 6];
        for (slot, operand) in values.iter_mut().zip(operands) {
            *slot = number(operand)?;
        }
        Some(Matrix(values))
    }

    /// `self × other` in PDF row-vector convention.
    fn multiply(&self, other: &Matrix) -> Matrix {
        let [a, b, c, d, e, f] = self.0;
        let [oa, ob, oc, od, oe, of] = other.0;
        Matrix([
            a * oa + b * oc,
            a * ob + b * od,
            c * oa + d * oc,
            c * ob + d * od,
            e * oa + f * oc + oe,
            e * ob + f * od + of,
        ])
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let [a, b, c, d, e, f] = self.0;
        (a * x + c * y + e, b * x + d * y + f)
    }

    fn vertical_scale(&self) -> f32 {
        let [_, _, c, d, _, _] = self.0;
        (c * c + d * d).sqrt()
    }

    fn transform_box(&self, x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        let corners = [
            self.apply(x0, y0),
            self.apply(x1, y0),
            self.apply(x0, y1),
            self.apply(x1, y1),
        ];
        let (mut min_x, mut min_y) = corners[0];
        let (mut max_x, mut max_y) = corners[0];
        for (x, y) in corners.iter().skip(1) {
            min_x = min_x.min(*x);
            min_y = min_y.min(*y);
            max_x = max_x.max(*x);
            max_y = max_y.max(*y);
        }
        BoundingBox::new(min_x, min_y, max_x, max_y)
    }
}

#[derive(Debug, Clone, Copy)]
struct TextState {
    matrix: Matrix,
    line_matrix: Matrix,
    font_size: f32,
    leading: f32,
}

impl Default for TextState {
    fn default() -> Self {
        Self {
            matrix: Matrix::IDENTITY,
            line_matrix: Matrix::IDENTITY,
            font_size: 12.0,
            leading: 0.0,
        }
    }
}

impl TextState {
    fn move_line(&mut self, tx: f32, ty: f32) {
        self.line_matrix = Matrix::translate(tx, ty).multiply(&self.line_matrix);
        self.matrix = self.line_matrix;
    }
}

#[derive(Debug, Default)]
struct TextBlock {
    text: String,
    bbox: Option<BoundingBox>,
    /// End `x` and baseline `y` of the previous run.
    last: Option<(f32, f32)>,
}

struct Interpreter<'a> {
    document: &'a Document,
    elements: Vec<LayoutElement>,
    fragments: Vec<TextFragment>,
}

impl<'a> Interpreter<'a> {
    fn new(document: &'a Document) -> Self {
        Self {
            document,
            elements: Vec::new(),
            fragments: Vec::new(),
        }
    }

    fn finish(self) -> (Vec<LayoutElement>, Vec<TextFragment>) {
        (self.elements, self.fragments)
    }

    fn run(
        &mut self,
        operations: &[Operation],
        resources: Option<&'a Dictionary>,
        base: Matrix,
        depth: usize,
    ) {
        let mut ctm = base;
        let mut saved: Vec<Matrix> = Vec::new();
        let mut text = TextState::default();
        let mut block: Option<TextBlock> = None;
        let mut pending_rects: Vec<BoundingBox> = Vec::new();

        for operation in operations {
            let operands = operation.operands.as_slice();
            match operation.operator.as_str() {
                "q" => saved.push(ctm),
                "Q" => ctm = saved.pop().unwrap_or(base),
                "cm" => {
                    if let Some(matrix) = Matrix::from_operands(operands) {
                        ctm = matrix.multiply(&ctm);
                    }
                }
                "BT" => {
                    self.end_block(block.take());
                    text.matrix = Matrix::IDENTITY;
                    text.line_matrix = Matrix::IDENTITY;
                    block = Some(TextBlock::default());
                }
                "ET" => self.end_block(block.take()),
                "Tf" => {
                    if let Some(size) = operands.get(1).and_then(number) {
                        text.font_size = size;
                    }
                }
                "TL" => {
                    if let Some(leading) = operands.first().and_then(number) {
                        text.leading = leading;
                    }
                }
                "Td" | "TD" => {
                    if let (Some(tx), Some(ty)) = (
                        operands.first().and_then(number),
                        operands.get(1).and_then(number),
                    ) {
                        if operation.operator == "TD" {
                            text.leading = -ty;
                        }
                        text.move_line(tx, ty);
                    }
                }
                "Tm" => {
                    if let Some(matrix) = Matrix::from_operands(operands) {
                        text.line_matrix = matrix;
                        text.matrix = matrix;
                    }
                }
                "T*" => text.move_line(0.0, -text.leading),
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show(&mut block, &mut text, &ctm, bytes);
                    }
                }
                "'" => {
                    text.move_line(0.0, -text.leading);
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show(&mut block, &mut text, &ctm, bytes);
                    }
                }
                "\"" => {
                    text.move_line(0.0, -text.leading);
                    if let Some(Object::String(bytes, _)) = operands.get(2) {
                        self.show(&mut block, &mut text, &ctm, bytes);
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = operands.first() {
                        for item in items {
                            match item {
                                Object::String(bytes, _) => {
                                    self.show(&mut block, &mut text, &ctm, bytes)
                                }
                                other => {
                                    if let Some(adjustment) = number(other) {
                                        let shift = -adjustment / 1000.0 * text.font_size;
                                        text.matrix =
                                            Matrix::translate(shift, 0.0).multiply(&text.matrix);
                                    }
                                }
                            }
                        }
                    }
                }
                "re" => {
                    if let [x, y, width, height, ..] = operands {
                        if let (Some(x), Some(y), Some(width), Some(height)) =
                            (number(x), number(y), number(width), number(height))
                        {
                            pending_rects.push(ctm.transform_box(x, y, x + width, y + height));
                        }
                    }
                }
                "n" => pending_rects.clear(),
                operator if PAINT_OPERATORS.contains(&operator) => {
                    self.elements
                        .extend(pending_rects.drain(..).map(LayoutElement::rect));
                }
                "Do" => {
                    if let Some(Object::Name(name)) = operands.first() {
                        self.draw_xobject(name, resources, &ctm, depth);
                    }
                }
                _ => {}
            }
        }

        self.end_block(block.take());
    }

    fn show(
        &mut self,
        block: &mut Option<TextBlock>,
        state: &mut TextState,
        ctm: &Matrix,
        bytes: &[u8],
    ) {
        let decoded = decode_pdf_string(bytes);
        if decoded.is_empty() {
            return;
        }

        let rendering = state.matrix.multiply(ctm);
        let (x, y) = rendering.apply(0.0, 0.0);
        let size = (state.font_size * rendering.vertical_scale()).abs().max(1.0);
        let advance = decoded.chars().count() as f32 * state.font_size * GLYPH_WIDTH;
        let (end_x, _) = rendering.apply(advance, 0.0);

        let current = block.get_or_insert_with(TextBlock::default);
        if let Some((last_end, last_y)) = current.last {
            if (y - last_y).abs() > size * 0.5 {
                current.text.push('\n');
            } else if x - last_end > size * 0.15
                && !current.text.ends_with(' ')
                && !decoded.starts_with(' ')
            {
                current.text.push(' ');
            }
        }
        current.text.push_str(&decoded);

        let run_box = BoundingBox::new(x, y - size * 0.2, end_x, y + size * 0.8);
        current.bbox = Some(match current.bbox {
            Some(existing) => existing.union(&run_box),
            None => run_box,
        });
        current.last = Some((end_x, y));

        self.fragments.push(TextFragment { x, y, text: decoded });
        state.matrix = Matrix::translate(advance, 0.0).multiply(&state.matrix);
    }

    fn end_block(&mut self, block: Option<TextBlock>) {
        let Some(block) = block else {
            return;
        };
        if let Some(bbox) = block.bbox {
            if !block.text.trim().is_empty() {
                self.elements.push(LayoutElement::text(bbox, block.text));
            }
        }
    }

    fn draw_xobject(
        &mut self,
        name: &[u8],
        resources: Option<&'a Dictionary>,
        ctm: &Matrix,
        depth: usize,
    ) {
        let document = self.document;
        let Some(entry) = resources
            .and_then(|resources| resources.get(b"XObject").ok())
            .and_then(|xobjects| resolve_dict(document, xobjects))
            .and_then(|xobjects| xobjects.get(name).ok())
        else {
            debug!(name = %String::from_utf8_lossy(name), "xobject not found in resources");
            return;
        };

        let reference = match entry {
            Object::Reference(id) => Some(*id),
            _ => None,
        };
        let Some(Object::Stream(stream)) = resolve(document, entry) else {
            return;
        };

        match stream.dict.get(b"Subtype") {
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Image" => {
                let bbox = ctm.transform_box(0.0, 0.0, 1.0, 1.0);
                self.elements.push(LayoutElement::figure(bbox, reference));
            }
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Form" => {
                if depth >= MAX_FORM_DEPTH {
                    debug!(depth, "form xobject nesting too deep; skipped");
                    return;
                }
                let operations = match stream_content(stream).and_then(|data| {
                    Content::decode(&data).map_err(pdf_error)
                }) {
                    Ok(content) => content.operations,
                    Err(error) => {
                        debug!(%error, "unreadable form xobject skipped");
                        return;
                    }
                };
                let form_matrix = stream
                    .dict
                    .get(b"Matrix")
                    .ok()
                    .and_then(|object| match resolve(document, object) {
                        Some(Object::Array(values)) => Matrix::from_operands(values),
                        _ => None,
                    })
                    .unwrap_or(Matrix::IDENTITY);
                let form_resources = stream
                    .dict
                    .get(b"Resources")
                    .ok()
                    .and_then(|object| resolve_dict(document, object))
                    .or(resources);

                self.run(
                    &operations,
                    form_resources,
                    form_matrix.multiply(ctm),
                    depth + 1,
                );
            }
            _ => {}
        }
    }
}

fn number(object: &Object) -> Option<f32> {
    match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value as f32),
        _ => None,
    }
}

/// UTF-16BE when the string carries a byte order mark, otherwise one byte per
/// character.
fn decode_pdf_string(bytes: &[u8]) -> String {
    if let Some(body) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units = body
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|&byte| byte as char).collect()
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => document.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    match resolve(document, object)? {
        Object::Dictionary(dictionary) => Some(dictionary),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

/// Looks `key` up on the page and then along its `Parent` chain.
fn inherited<'a>(document: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut current = document.get_object(page_id).ok()?.as_dict().ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return resolve(document, value);
        }
        let parent = current.get(b"Parent").ok()?;
        current = resolve_dict(document, parent)?;
    }
    None
}

fn bbox_from_array(document: &Document, object: &Object) -> Option<BoundingBox> {
    let Object::Array(values) = object else {
        return None;
    };
    let numbers = values
        .iter()
        .filter_map(|value| resolve(document, value).and_then(number))
        .collect::<Vec<_>>();
    match numbers.as_slice() {
        [x0, y0, x1, y1] => Some(BoundingBox::new(*x0, *y0, *x1, *y1)),
        _ => None,
    }
}

fn stream_content(stream: &Stream) -> Result<Vec<u8>, IngestError> {
    if stream.dict.get(b"Filter").is_ok() {
        stream.decompressed_content().map_err(pdf_error)
    } else {
        Ok(stream.content.clone())
    }
}

fn filter_names(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn dict_integer(document: &Document, dict: &Dictionary, key: &[u8]) -> Option<u32> {
    let value = resolve(document, dict.get(key).ok()?)?;
    number(value).map(|value| value.max(0.0) as u32)
}

fn color_components(document: &Document, dict: &Dictionary) -> Option<u8> {
    let space = resolve(document, dict.get(b"ColorSpace").ok()?)?;
    match space {
        Object::Name(name) => match name.as_slice() {
            b"DeviceRGB" | b"CalRGB" => Some(3),
            b"DeviceGray" | b"CalGray" => Some(1),
            _ => None,
        },
        Object::Array(items) => match items.as_slice() {
            [Object::Name(family), profile, ..] if family.as_slice() == b"ICCBased" => {
                let Some(Object::Stream(profile)) = resolve(document, profile) else {
                    return None;
                };
                dict_integer(document, &profile.dict, b"N").map(|n| n as u8)
            }
            _ => None,
        },
        _ => None,
    }
}

fn image_from_stream(document: &Document, stream: &Stream) -> Result<ImageCrop, IngestError> {
    let width = dict_integer(document, &stream.dict, b"Width").unwrap_or(0);
    let height = dict_integer(document, &stream.dict, b"Height").unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(IngestError::ImageCrop("image has no dimensions".to_string()));
    }

    let filters = filter_names(&stream.dict);
    match filters.as_slice() {
        [only] if only.as_slice() == b"DCTDecode" => {
            return Ok(ImageCrop {
                bytes: stream.content.clone(),
                media_type: "image/jpeg",
                width,
                height,
            });
        }
        [only] if only.as_slice() == b"JPXDecode" => {
            return Ok(ImageCrop {
                bytes: stream.content.clone(),
                media_type: "image/jp2",
                width,
                height,
            });
        }
        _ => {}
    }

    let bits = dict_integer(document, &stream.dict, b"BitsPerComponent").unwrap_or(8);
    if bits != 8 {
        return Err(IngestError::ImageCrop(format!(
            "unsupported image depth: {bits} bits per component"
        )));
    }

    let components = color_components(document, &stream.dict).ok_or_else(|| {
        IngestError::ImageCrop("unsupported image color space".to_string())
    })?;
    let samples = stream_content(stream)?;
    let expected = width as usize * height as usize * components as usize;
    if samples.len() < expected {
        return Err(IngestError::ImageCrop(format!(
            "image data holds {} bytes, expected {expected}",
            samples.len()
        )));
    }
    let samples = samples[..expected].to_vec();

    let image = match components {
        3 => RgbImage::from_raw(width, height, samples).map(DynamicImage::ImageRgb8),
        1 => GrayImage::from_raw(width, height, samples).map(DynamicImage::ImageLuma8),
        other => {
            return Err(IngestError::ImageCrop(format!(
                "unsupported number of color components: {other}"
            )))
        }
    }
    .ok_or_else(|| IngestError::ImageCrop("image buffer size mismatch".to_string()))?;

    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|error| IngestError::ImageCrop(error.to_string()))?;

    Ok(ImageCrop {
        bytes,
        media_type: "image/png",
        width,
        height,
    })
}
