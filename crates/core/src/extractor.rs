use crate::chunking::{normalize_text, normalize_whitespace};
use crate::config::PdfMode;
use crate::error::IngestError;
use crate::layout::{LopdfPageSource, PageSource};
use crate::ocr::OcrEngine;
use crate::reading_order::ReadingOrder;
use scraper::{ElementRef, Html, Node};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pdf,
    PlainText,
    Markdown,
    Html,
}

/// Extracted document text; `Empty` when nothing readable was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    Text(String),
    Empty,
}

impl Extraction {
    fn from_text(text: String) -> Self {
        if text.trim().is_empty() {
            Extraction::Empty
        } else {
            Extraction::Text(text)
        }
    }
}

#[derive(Clone)]
pub struct ExtractionContext {
    pub ocr: Arc<dyn OcrEngine>,
    pub pdf_mode: PdfMode,
}

impl FileFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileFormat::Pdf),
            "txt" | "text" => Some(FileFormat::PlainText),
            "md" | "markdown" => Some(FileFormat::Markdown),
            "html" | "htm" => Some(FileFormat::Html),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(Self::from_extension)
            .ok_or_else(|| IngestError::UnsupportedFormat(path.display().to_string()))
    }

    /// Label stored in the point payload as `file_format`.
    pub fn label(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "pdf",
            FileFormat::PlainText => "txt",
            FileFormat::Markdown => "md",
            FileFormat::Html => "html",
        }
    }

    /// Blocking; run on a blocking thread.
    pub fn extract(
        &self,
        path: &Path,
        context: &ExtractionContext,
    ) -> Result<Extraction, IngestError> {
        let text = match self {
            FileFormat::Pdf => extract_pdf(path, context)?,
            FileFormat::PlainText | FileFormat::Markdown => normalize_text(&read_lossy(path)?),
            FileFormat::Html => normalize_text(&strip_html(&read_lossy(path)?)),
        };

        debug!(
            path = %path.display(),
            format = self.label(),
            chars = text.len(),
            "text extracted"
        );
        Ok(Extraction::from_text(text))
    }
}

fn read_lossy(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn extract_pdf(path: &Path, context: &ExtractionContext) -> Result<String, IngestError> {
    let source = LopdfPageSource::open(path)?;
    Ok(match context.pdf_mode {
        PdfMode::Layout => ReadingOrder::new(context.ocr.as_ref()).reconstruct_document(&source),
        PdfMode::Simple => simple_pdf_text(&source),
    })
}

fn simple_pdf_text(source: &LopdfPageSource) -> String {
    let mut pages = Vec::new();
    for index in 0..source.page_count() {
        match source.page_text(index) {
            Ok(text) if !text.trim().is_empty() => pages.push(text),
            Ok(_) => {}
            Err(error) => warn!(page = index + 1, %error, "skipping unreadable page"),
        }
    }
    normalize_text(&pages.join("\n\n"))
}

const SKIPPED_TAGS: [&str; 6] = ["script", "style", "template", "noscript", "svg", "head"];
const BLOCK_TAGS: [&str; 22] = [
    "address", "article", "aside", "blockquote", "dd", "div", "dl", "dt", "footer", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "li", "p", "pre", "section", "table", "tr",
];

/// Visible text of an HTML document, one line per block element.
pub fn strip_html(raw: &str) -> String {
    let document = Html::parse_document(raw);
    let mut text = String::new();
    collect_text(document.root_element(), &mut text);

    text.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child) = ElementRef::wrap(child) else {
                    continue;
                };
                let tag = child.value().name();
                if SKIPPED_TAGS.contains(&tag) {
                    continue;
                }
                if tag == "br" {
                    out.push('\n');
                    continue;
                }

                let block = BLOCK_TAGS.contains(&tag);
                if block {
                    out.push('\n');
                }
                collect_text(child, out);
                if block {
                    out.push('\n');
                } else if matches!(tag, "td" | "th") {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tests::sample_pdf;
    use crate::ocr::DisabledOcr;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn context(pdf_mode: PdfMode) -> ExtractionContext {
        ExtractionContext {
            ocr: Arc::new(DisabledOcr),
            pdf_mode,
        }
    }

    #[test]
    fn formats_follow_the_extension() {
        assert_eq!(
            FileFormat::from_path(Path::new("a/B.PDF")).expect("pdf"),
            FileFormat::Pdf
        );
        assert_eq!(
            FileFormat::from_path(Path::new("notes.markdown")).expect("md"),
            FileFormat::Markdown
        );
        assert_eq!(FileFormat::Html.label(), "html");
        assert!(matches!(
            FileFormat::from_path(Path::new("sheet.xlsx")),
            Err(IngestError::UnsupportedFormat(_))
        ));
        assert!(FileFormat::from_path(&PathBuf::from("README")).is_err());
    }

    #[test]
    fn plain_text_is_normalized() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "Line  one\r\n\r\n\r\nLine two\n")?;

        let extraction = FileFormat::PlainText.extract(&path, &context(PdfMode::Layout))?;
        assert_eq!(extraction, Extraction::Text("Line one\n\nLine two".to_string()));
        Ok(())
    }

    #[test]
    fn blank_files_are_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("blank.md");
        fs::write(&path, " \n\t\n")?;

        let extraction = FileFormat::Markdown.extract(&path, &context(PdfMode::Layout))?;
        assert_eq!(extraction, Extraction::Empty);
        Ok(())
    }

    #[test]
    fn html_markup_is_removed() {
        let text = strip_html(
            "<html><head><style>p { color: red; }</style><script>var x = 1;</script></head>\
             <body><h1>Title</h1><p>Fish &amp; chips&nbsp;today</p><!-- hidden --></body></html>",
        );
        assert_eq!(text, "Title\nFish & chips today");
    }

    #[test]
    fn attributes_stay_out_and_entities_are_decoded() {
        let text = strip_html(
            r#"<p><a title="a > b" href="x">Link</a> don&#8217;t &eacute;t&eacute;</p><p>ok</p>"#,
        );
        assert_eq!(text, "Link don\u{2019}t \u{e9}t\u{e9}\nok");
    }

    #[test]
    fn line_breaks_and_table_cells_are_separated() {
        let text = strip_html(
            "<div>first<br>second</div><table><tr><td>a</td><td>b</td></tr></table>\
             <noscript>enable js</noscript>",
        );
        assert_eq!(text, "first\nsecond\na b");
    }

    #[test]
    fn html_files_are_extracted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("page.htm");
        fs::write(&path, "<html><body><h2>Pump</h2><p>Check &lt;daily&gt;</p></body></html>")?;

        let extraction = FileFormat::Html.extract(&path, &context(PdfMode::Layout))?;
        assert_eq!(extraction, Extraction::Text("Pump\nCheck <daily>".to_string()));
        Ok(())
    }

    #[test]
    fn layout_mode_reads_pdf_text_without_ocr() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.pdf");
        fs::write(&path, sample_pdf())?;

        let extraction = FileFormat::Pdf.extract(&path, &context(PdfMode::Layout))?;
        assert_eq!(
            extraction,
            Extraction::Text("Pump manual\nSecond line".to_string())
        );
        Ok(())
    }

    #[test]
    fn simple_mode_reads_pdf_text() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("manual.pdf");
        fs::write(&path, sample_pdf())?;

        let Extraction::Text(text) = FileFormat::Pdf.extract(&path, &context(PdfMode::Simple))?
        else {
            panic!("simple extraction should find text");
        };
        assert!(text.contains("Pump manual"), "{text:?}");
        Ok(())
    }

    #[test]
    fn corrupt_pdf_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"not a pdf at all")?;

        assert!(matches!(
            FileFormat::Pdf.extract(&path, &context(PdfMode::Layout)),
            Err(IngestError::PdfParse(_))
        ));
        Ok(())
    }
}
