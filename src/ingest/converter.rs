use std::path::{Path, PathBuf};

use futures::future::try_join_all;
use serde_json::Map;
use tracing::{debug, info, warn};

use super::{Document, IngestError, IngestResult};

/// Separates the pages of a converted document
pub const PAGE_BREAK: char = '\u{c}';

/// Extracts the text of PDF files, one document per file with pages separated by
/// [`PAGE_BREAK`]
#[derive(Debug, Clone, Default)]
pub struct PdfToDocument;

impl PdfToDocument {
    /// A converter with default settings
    pub fn new() -> Self {
        Self
    }

    /// Files are converted concurrently; documents keep the order of `paths`.
    pub async fn run(&self, paths: &[PathBuf]) -> IngestResult<Vec<Document>> {
        let conversions = paths.iter().cloned().map(|path| async move {
            let document = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || convert_file(&path)).await??
            };
            Ok::<_, IngestError>(document)
        });

        let documents = try_join_all(conversions).await?;
        Ok(documents.into_iter().flatten().collect())
    }
}

fn convert_file(path: &Path) -> IngestResult<Option<Document>> {
    let pdf = lopdf::Document::load(path)
        .map_err(|e| IngestError::Pdf(format!("{}: {}", path.display(), e)))?;

    // failed pages stay as empty segments so page numbers line up
    let mut pages = Vec::new();
    for page in pdf.get_pages().into_keys() {
        match pdf.extract_text(&[page]) {
            Ok(text) => pages.push(text),
            Err(e) => {
                warn!(path = %path.display(), page, error = %e, "Failed to extract page text");
                pages.push(String::new());
            }
        }
    }

    if pages.iter().all(|page| page.trim().is_empty()) {
        debug!(path = %path.display(), pages = pages.len(), "Skipping PDF without text");
        return Ok(None);
    }
    info!(path = %path.display(), pages = pages.len(), "Converted PDF");

    let mut meta = Map::new();
    meta.insert("file_path".to_string(), path.display().to_string().into());
    let separator = PAGE_BREAK.to_string();
    Ok(Some(Document::new(pages.join(&separator), meta)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    /// Write a PDF with one page per entry, each holding a single line of text
    pub(crate) fn write_pdf(path: &Path, pages: &[&str]) {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    #[tokio::test]
    async fn test_one_document_per_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("proxy.pdf");
        write_pdf(&path, &["Board of Directors", "Say on Pay"]);

        let docs = PdfToDocument::new().run(&[path.clone()]).await.unwrap();
        assert_eq!(docs.len(), 1);

        let pages: Vec<&str> = docs[0].content.split(PAGE_BREAK).collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].contains("Board of Directors"));
        assert!(pages[1].contains("Say on Pay"));
        assert_eq!(docs[0].file_path(), Some(path.display().to_string().as_str()));
        assert!(docs[0].meta.get("page").is_none());
    }

    #[tokio::test]
    async fn test_documents_follow_path_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.pdf");
        let second = dir.path().join("b.pdf");
        write_pdf(&first, &["Annual report"]);
        write_pdf(&second, &["Proxy statement", "Appendix"]);

        let docs = PdfToDocument::new().run(&[second, first]).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.contains("Proxy statement"));
        assert!(docs[0].content.contains(PAGE_BREAK));
        assert!(docs[1].content.contains("Annual report"));
    }

    #[tokio::test]
    async fn test_missing_file_is_a_pdf_error() {
        let dir = tempdir().unwrap();
        let result = PdfToDocument::new()
            .run(&[dir.path().join("absent.pdf")])
            .await;
        assert!(matches!(result, Err(IngestError::Pdf(_))));
    }

    #[tokio::test]
    async fn test_not_a_pdf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.pdf");
        std::fs::write(&path, "plain text, not a PDF").unwrap();

        let result = PdfToDocument::new().run(&[path]).await;
        assert!(matches!(result, Err(IngestError::Pdf(_))));
    }
}
