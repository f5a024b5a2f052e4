//! Extraction of the grade table from an uploaded document.
//!
//! DOCX and XLSX files are zip containers; the relevant XML part is pulled
//! out of the archive and walked with a streaming reader. CSV files are a
//! single table by definition.

use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::{PipelineError, Result};
use crate::models::RosterEntry;

/// Raw cell text, row by row, exactly as the document stores it.
pub type Table = Vec<Vec<String>>;

const NAME_COLUMN: usize = 1;
const FIRST_GRADE_COLUMN: usize = 2;
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
/// Excel sheet limits: columns `A..=XFD`, rows `1..=1048576`.
const MAX_COLUMNS: usize = 16_384;
const MAX_ROWS: usize = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Docx,
    Xlsx,
    Csv,
}

impl DocumentFormat {
    /// Picks the reader from the file extension, falling back to the
    /// container layout for unknown or missing extensions.
    pub fn detect(path: &Path, bytes: &[u8]) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("docx") => Ok(DocumentFormat::Docx),
            Some("xlsx") => Ok(DocumentFormat::Xlsx),
            Some("csv") => Ok(DocumentFormat::Csv),
            _ => Self::sniff(bytes).ok_or_else(|| {
                malformed(format!(
                    "unsupported document type: {}",
                    path.to_string_lossy()
                ))
            }),
        }
    }

    fn sniff(bytes: &[u8]) -> Option<Self> {
        if !bytes.starts_with(&ZIP_MAGIC) {
            return None;
        }
        let archive = ZipArchive::new(Cursor::new(bytes)).ok()?;
        let mut names = archive.file_names();
        if names.any(|name| name == "word/document.xml") {
            return Some(DocumentFormat::Docx);
        }
        let has_workbook = archive.file_names().any(|name| name == "xl/workbook.xml");
        has_workbook.then_some(DocumentFormat::Xlsx)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn require_non_empty(self) -> Result<Self> {
        if self.entries.is_empty() {
            return Err(PipelineError::EmptyRoster);
        }
        Ok(self)
    }
}

pub fn read_table(path: &Path) -> Result<Table> {
    let bytes = std::fs::read(path).map_err(|err| {
        PipelineError::Internal(format!(
            "failed to read {}: {err}",
            path.to_string_lossy()
        ))
    })?;
    let format = DocumentFormat::detect(path, &bytes)?;
    debug!(?format, bytes = bytes.len(), "reading document table");
    read_table_from_bytes(format, &bytes)
}

pub fn read_table_from_bytes(format: DocumentFormat, bytes: &[u8]) -> Result<Table> {
    match format {
        DocumentFormat::Docx => read_docx_table(bytes),
        DocumentFormat::Xlsx => read_xlsx_table(bytes),
        DocumentFormat::Csv => read_csv_table(bytes),
    }
}

/// Turns the table into the ordered student roster.
///
/// Rows above `header_rows`, rows with fewer than two cells and rows whose
/// name cell is blank are dropped without complaint.
pub fn parse_roster(table: &Table, header_rows: usize) -> Roster {
    let entries = table
        .iter()
        .skip(header_rows)
        .filter_map(|cells| {
            if cells.len() <= NAME_COLUMN {
                return None;
            }
            let student_name = cells[NAME_COLUMN].trim();
            if student_name.is_empty() {
                return None;
            }
            let letter_grades = cells
                .iter()
                .skip(FIRST_GRADE_COLUMN)
                .map(|cell| cell.trim())
                .filter(|cell| !cell.is_empty())
                .map(str::to_uppercase)
                .collect();

            Some(RosterEntry {
                student_name: student_name.to_string(),
                letter_grades,
            })
        })
        .collect();

    Roster { entries }
}

pub fn read_docx_table(bytes: &[u8]) -> Result<Table> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?
        .ok_or_else(|| malformed("word/document.xml is missing"))?;
    first_docx_table(&xml)?.ok_or_else(|| malformed("the document contains no table"))
}

fn first_docx_table(xml: &str) -> Result<Option<Table>> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut rows: Table = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut span = 1usize;
    let mut merged_from_above = false;
    let mut in_run = false;
    let mut in_text = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"tbl" => depth += 1,
                b"tr" if depth == 1 => row.clear(),
                b"tc" if depth == 1 => {
                    paragraphs.clear();
                    span = 1;
                    merged_from_above = false;
                }
                b"vMerge" if depth == 1 => merged_from_above = continues_merge(&e)?,
                b"p" if depth == 1 => paragraphs.push(String::new()),
                b"r" if depth == 1 => in_run = true,
                b"t" if depth == 1 && in_run => in_text = true,
                _ => {}
            },
            Event::Empty(e) if depth == 1 => match e.local_name().as_ref() {
                b"gridSpan" => span = grid_span(&e)?,
                b"vMerge" => merged_from_above = continues_merge(&e)?,
                b"p" => paragraphs.push(String::new()),
                b"tab" if in_run => push_cell_text(&mut paragraphs, "\t"),
                b"br" | b"cr" if in_run => push_cell_text(&mut paragraphs, "\n"),
                _ => {}
            },
            Event::Text(text) if in_text => {
                let text = text.unescape().map_err(xml_error)?;
                push_cell_text(&mut paragraphs, &text);
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"r" if depth == 1 => in_run = false,
                b"tc" if depth == 1 => {
                    if merged_from_above {
                        // Continuation cells show the text of the cell they merge into.
                        let first = row.len();
                        let above = rows.last();
                        row.extend((first..first + span).map(|column| {
                            above
                                .and_then(|above| above.get(column))
                                .cloned()
                                .unwrap_or_default()
                        }));
                    } else {
                        let text = paragraphs.join("\n");
                        row.extend(std::iter::repeat(text).take(span));
                    }
                }
                b"tr" if depth == 1 => rows.push(std::mem::take(&mut row)),
                b"tbl" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(Some(rows));
                    }
                }
                _ => {}
            },
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn push_cell_text(paragraphs: &mut Vec<String>, text: &str) {
    match paragraphs.last_mut() {
        Some(last) => last.push_str(text),
        None => paragraphs.push(text.to_string()),
    }
}

fn grid_span(element: &BytesStart<'_>) -> Result<usize> {
    let Some(value) = attribute(element, b"w:val")? else {
        return Ok(1);
    };
    let span: usize = value
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid gridSpan value {value:?}")))?;
    if span > MAX_COLUMNS {
        return Err(malformed(format!("gridSpan {span} exceeds {MAX_COLUMNS} columns")));
    }
    Ok(span.max(1))
}

/// `w:vMerge` without a value, or with `continue`, joins the cell above.
fn continues_merge(element: &BytesStart<'_>) -> Result<bool> {
    Ok(match attribute(element, b"w:val")? {
        None => true,
        Some(value) => value.trim() == "continue",
    })
}

pub fn read_xlsx_table(bytes: &[u8]) -> Result<Table> {
    let mut archive = open_archive(bytes)?;
    let sheet_path = first_sheet_path(&mut archive)?;
    let shared = match read_entry(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let xml = read_entry(&mut archive, &sheet_path)?
        .ok_or_else(|| malformed(format!("worksheet {sheet_path} is missing")))?;
    parse_sheet(&xml, &shared)
}

fn first_sheet_path<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Result<String> {
    let workbook = read_entry(archive, "xl/workbook.xml")?
        .ok_or_else(|| malformed("xl/workbook.xml is missing"))?;

    let mut reader = Reader::from_str(&workbook);
    let mut relation_id = None;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                relation_id = attribute(&e, b"r:id")?;
                break;
            }
            Event::Eof => return Err(malformed("the workbook contains no worksheet")),
            _ => {}
        }
    }

    let fallback = "xl/worksheets/sheet1.xml".to_string();
    let (Some(relation_id), Some(rels)) = (
        relation_id,
        read_entry(archive, "xl/_rels/workbook.xml.rels")?,
    ) else {
        return Ok(fallback);
    };

    let mut reader = Reader::from_str(&rels);
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if attribute(&e, b"Id")?.as_deref() != Some(relation_id.as_str()) {
                    continue;
                }
                let target = attribute(&e, b"Target")?
                    .ok_or_else(|| malformed("worksheet relationship has no target"))?;
                return Ok(match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("xl/{target}"),
                });
            }
            Event::Eof => return Ok(fallback),
            _ => {}
        }
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;
    let mut in_phonetic = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"rPh" => in_phonetic = true,
                b"t" => in_text = !in_phonetic,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Event::Text(text) if in_text => {
                if let Some(current) = current.as_mut() {
                    current.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(strings)
}

#[derive(Debug)]
struct PendingCell {
    column: usize,
    kind: Option<String>,
    raw: String,
}

impl PendingCell {
    fn resolve(self, shared: &[String]) -> Result<String> {
        match self.kind.as_deref() {
            Some("s") => {
                let index: usize = self
                    .raw
                    .trim()
                    .parse()
                    .map_err(|_| malformed(format!("invalid shared string index {:?}", self.raw)))?;
                shared
                    .get(index)
                    .cloned()
                    .ok_or_else(|| malformed(format!("shared string {index} does not exist")))
            }
            Some("b") => Ok(if self.raw.trim() == "1" {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }),
            _ => Ok(self.raw),
        }
    }
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Table> {
    let mut reader = Reader::from_str(xml);
    let mut rows: Table = Vec::new();
    let mut cell: Option<PendingCell> = None;
    let mut capture = false;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"row" => start_row(&mut rows, &e)?,
                b"c" => {
                    let next_column = rows.last().map_or(0, Vec::len);
                    cell = Some(PendingCell {
                        column: cell_column(&e)?.unwrap_or(next_column),
                        kind: attribute(&e, b"t")?,
                        raw: String::new(),
                    });
                }
                b"v" | b"t" => capture = cell.is_some(),
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"row" => start_row(&mut rows, &e)?,
            Event::Text(text) if capture => {
                if let Some(cell) = cell.as_mut() {
                    cell.raw.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if let Some(pending) = cell.take() {
                        let column = pending.column;
                        let value = pending.resolve(shared)?;
                        if rows.is_empty() {
                            rows.push(Vec::new());
                        }
                        if let Some(row) = rows.last_mut() {
                            if row.len() <= column {
                                row.resize(column + 1, String::new());
                            }
                            row[column] = value;
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(rows)
}

fn start_row(rows: &mut Table, element: &BytesStart<'_>) -> Result<()> {
    if let Some(number) = attribute(element, b"r")? {
        let number: usize = number
            .trim()
            .parse()
            .map_err(|_| malformed(format!("invalid row number {number:?}")))?;
        if number == 0 || number > MAX_ROWS {
            return Err(malformed(format!(
                "row number {number} is outside 1..={MAX_ROWS}"
            )));
        }
        while rows.len() + 1 < number {
            rows.push(Vec::new());
        }
    }
    rows.push(Vec::new());
    Ok(())
}

fn cell_column(element: &BytesStart<'_>) -> Result<Option<usize>> {
    let Some(reference) = attribute(element, b"r")? else {
        return Ok(None);
    };
    column_index(&reference)
        .map(Some)
        .ok_or_else(|| malformed(format!("invalid cell reference {reference:?}")))
}

/// Zero-based column of an `A1`-style reference, `None` past column `XFD`.
pub fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<u8> = reference
        .bytes()
        .take_while(u8::is_ascii_alphabetic)
        .collect();
    if letters.is_empty() {
        return None;
    }
    let number = letters.iter().try_fold(0usize, |acc, letter| {
        acc.checked_mul(26)?
            .checked_add(usize::from(letter.to_ascii_uppercase() - b'A' + 1))
            .filter(|number| *number <= MAX_COLUMNS)
    })?;
    Some(number - 1)
}

pub fn read_csv_table(bytes: &[u8]) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| malformed(format!("unreadable csv: {err}")))?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    if rows.is_empty() {
        return Err(malformed("the csv file contains no table"));
    }
    Ok(rows)
}

fn open_archive(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>> {
    ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| malformed(format!("not a valid office container: {err}")))
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(malformed(format!("cannot open {name}: {err}"))),
    };
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|err| malformed(format!("cannot read {name}: {err}")))?;
    Ok(Some(content))
}

fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>> {
    let Some(attr) = element.try_get_attribute(name).map_err(xml_error)? else {
        return Ok(None);
    };
    let value: Cow<'_, str> = attr.unescape_value().map_err(xml_error)?;
    Ok(Some(value.into_owned()))
}

fn xml_error(err: impl std::fmt::Display) -> PipelineError {
    malformed(format!("invalid XML: {err}"))
}

fn malformed(message: impl Into<String>) -> PipelineError {
    PipelineError::MalformedDocument(message.into())
}
