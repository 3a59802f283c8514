use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use zip::ZipArchive;

use super::{ExtractedText, Formatting, SizeClass, SourceLine, TextExtractor};
use crate::error::{PipelineError, Result};

/// Twips per indentation space when mapping `w:ind w:left`.
const TWIPS_PER_SPACE: u32 = 90;

/// WordprocessingML (.docx) paragraphs with style, run formatting and numbering.
pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)
            .map_err(|e| PipelineError::unsupported(path, format!("not a zip container: {e}")))?;

        let document = read_entry(&mut archive, "word/document.xml")
            .ok_or_else(|| PipelineError::unsupported(path, "missing word/document.xml"))?;
        let styles = match read_entry(&mut archive, "word/styles.xml") {
            Some(xml) => parse_style_names(&xml).unwrap_or_default(),
            None => HashMap::new(),
        };

        walk_body(&document, &styles).map_err(|reason| PipelineError::corrupt(path, reason))
    }
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Option<String> {
    let mut entry = archive.by_name(name).ok()?;
    let mut content = String::new();
    entry.read_to_string(&mut content).ok()?;
    Some(content)
}

fn get_attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == key)
        .map(|a| String::from_utf8_lossy(&a.value).to_string())
}

/// `w:val="0"` / `"false"` switches a toggle property off.
fn toggle_on(e: &BytesStart) -> bool {
    !matches!(get_attr(e, b"w:val").as_deref(), Some("0") | Some("false") | Some("none"))
}

/// styleId -> human style name from word/styles.xml.
fn parse_style_names(xml: &str) -> std::result::Result<HashMap<String, String>, String> {
    let mut reader = Reader::from_str(xml);
    let mut names = HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:style" => {
                current = get_attr(&e, b"w:styleId");
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:name" => {
                if let (Some(id), Some(name)) = (current.as_ref(), get_attr(&e, b"w:val")) {
                    names.insert(id.clone(), name);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"w:style" => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

#[derive(Default)]
struct ParagraphState {
    text: String,
    style: Option<String>,
    list_level: Option<u8>,
    indent_twips: u32,
    text_runs: usize,
    bold_runs: usize,
    italic_runs: usize,
    max_half_points: u32,
}

#[derive(Default)]
struct RunState {
    bold: bool,
    italic: bool,
    half_points: u32,
    has_text: bool,
}

impl ParagraphState {
    fn finish(self) -> SourceLine {
        let all = |n: usize| self.text_runs > 0 && n == self.text_runs;
        SourceLine {
            formatting: Formatting {
                bold: all(self.bold_runs),
                italic: all(self.italic_runs),
                size_class: (self.max_half_points > 0)
                    .then(|| SizeClass::from_half_points(self.max_half_points)),
                style: self.style,
                list_level: self.list_level,
                indent: (self.indent_twips / TWIPS_PER_SPACE) as usize,
            },
            text: self.text,
        }
    }

    fn close_run(&mut self, run: RunState) {
        if !run.has_text {
            return;
        }
        self.text_runs += 1;
        self.bold_runs += usize::from(run.bold);
        self.italic_runs += usize::from(run.italic);
        self.max_half_points = self.max_half_points.max(run.half_points);
    }
}

fn walk_body(
    xml: &str,
    styles: &HashMap<String, String>,
) -> std::result::Result<ExtractedText, String> {
    let mut reader = Reader::from_str(xml);
    let mut out = ExtractedText {
        hard_line_breaks: true,
        ..ExtractedText::default()
    };
    let mut para: Option<ParagraphState> = None;
    let mut run: Option<RunState> = None;
    let mut in_ppr = false;
    let mut in_text = false;
    let mut page_break_pending = false;
    let mut buf = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            format!("XML error at byte {}: {e}", reader.buffer_position())
        })?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"w:p" => para = Some(ParagraphState::default()),
                b"w:pPr" => in_ppr = true,
                b"w:r" => run = Some(RunState::default()),
                b"w:t" => in_text = true,
                _ => {}
            },
            Event::Empty(e) => {
                let name = e.name();
                match name.as_ref() {
                    b"w:p" => out.lines.push(SourceLine::plain("")),
                    b"w:pStyle" => {
                        if let (Some(p), Some(id)) = (para.as_mut(), get_attr(&e, b"w:val")) {
                            p.style = Some(styles.get(&id).cloned().unwrap_or(id));
                        }
                    }
                    b"w:ilvl" => {
                        if let Some(p) = para.as_mut() {
                            let lvl = get_attr(&e, b"w:val").and_then(|v| v.parse().ok());
                            p.list_level = Some(lvl.unwrap_or(0));
                        }
                    }
                    b"w:numId" => {
                        if let Some(p) = para.as_mut() {
                            p.list_level.get_or_insert(0);
                        }
                    }
                    b"w:ind" if in_ppr => {
                        if let Some(p) = para.as_mut() {
                            p.indent_twips = get_attr(&e, b"w:left")
                                .or_else(|| get_attr(&e, b"w:start"))
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0);
                        }
                    }
                    b"w:b" if !in_ppr => {
                        if let Some(r) = run.as_mut() {
                            r.bold = toggle_on(&e);
                        }
                    }
                    b"w:i" if !in_ppr => {
                        if let Some(r) = run.as_mut() {
                            r.italic = toggle_on(&e);
                        }
                    }
                    b"w:sz" if !in_ppr => {
                        if let Some(r) = run.as_mut() {
                            r.half_points = get_attr(&e, b"w:val")
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0);
                        }
                    }
                    b"w:tab" if run.is_some() => {
                        if let Some(p) = para.as_mut() {
                            p.text.push('\t');
                        }
                    }
                    b"w:br" | b"w:cr" => {
                        if get_attr(&e, b"w:type").as_deref() == Some("page") {
                            page_break_pending = true;
                        } else if let Some(p) = para.as_mut() {
                            p.text.push(' ');
                        }
                    }
                    b"w:lastRenderedPageBreak" => page_break_pending = true,
                    _ => {}
                }
            }
            Event::Text(t) if in_text => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                if let Some(p) = para.as_mut() {
                    p.text.push_str(&text);
                }
                if let Some(r) = run.as_mut() {
                    r.has_text |= !text.trim().is_empty();
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:pPr" => in_ppr = false,
                b"w:r" => {
                    if let (Some(p), Some(r)) = (para.as_mut(), run.take()) {
                        p.close_run(r);
                    }
                }
                b"w:p" => {
                    if let Some(p) = para.take() {
                        if page_break_pending && !out.lines.is_empty() {
                            out.page_breaks.push(out.lines.len());
                        }
                        page_break_pending = false;
                        out.lines.push(p.finish());
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if para.is_some() {
        return Err("document ended inside an open paragraph".to_string());
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub(crate) fn write_docx(path: &Path, body: &str) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        write!(
            zip,
            r#"<?xml version="1.0" encoding="UTF-8"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        )
        .unwrap();
        zip.start_file("word/styles.xml", SimpleFileOptions::default())
            .unwrap();
        write!(
            zip,
            r#"<?xml version="1.0" encoding="UTF-8"?><w:styles xmlns:w="x"><w:style w:styleId="Heading1"><w:name w:val="heading 1"/></w:style></w:styles>"#
        )
        .unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn paragraphs_styles_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.docx");
        write_docx(
            &path,
            r#"<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:rPr><w:b/><w:sz w:val="36"/></w:rPr><w:t>Fruits</w:t></w:r></w:p>
               <w:p><w:r><w:t xml:space="preserve">apple — a red </w:t></w:r><w:r><w:rPr><w:i/></w:rPr><w:t>fruit &amp; snack</w:t></w:r></w:p>
               <w:p><w:pPr><w:numPr><w:ilvl w:val="1"/><w:numId w:val="3"/></w:numPr></w:pPr><w:r><w:t>nested item</w:t></w:r></w:p>
               <w:p><w:r><w:br w:type="page"/><w:t>next page</w:t></w:r></w:p>"#,
        );
        let text = DocxExtractor.extract(&path).unwrap();
        assert_eq!(text.lines.len(), 4);

        let heading = &text.lines[0];
        assert_eq!(heading.text, "Fruits");
        assert_eq!(heading.formatting.style.as_deref(), Some("heading 1"));
        assert!(heading.formatting.bold);
        assert_eq!(heading.formatting.size_class, Some(SizeClass::XLarge));

        assert_eq!(text.lines[1].text, "apple — a red fruit & snack");
        assert!(!text.lines[1].formatting.bold);
        assert!(!text.lines[1].formatting.italic);

        assert_eq!(text.lines[2].formatting.list_level, Some(1));
        assert_eq!(text.page_breaks, vec![3]);
        assert!(text.hard_line_breaks);
    }

    #[test]
    fn not_a_zip_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.docx");
        std::fs::write(&path, b"plain bytes").unwrap();
        let err = DocxExtractor.extract(&path).unwrap_err();
        assert_eq!(err.kind(), "unsupported_format");
    }

    #[test]
    fn truncated_xml_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        let file = File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("word/document.xml", SimpleFileOptions::default())
            .unwrap();
        write!(zip, "<w:document><w:body><w:p><w:r><w:t>cut off").unwrap();
        zip.finish().unwrap();

        let err = DocxExtractor.extract(&path).unwrap_err();
        assert!(err.is_partial(), "expected corrupt document, got {err}");
    }
}
