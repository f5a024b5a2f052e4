use std::borrow::Cow;
use std::fmt::Write;

use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, Workbook};
use serde::Serialize;

use crate::document;
use crate::error::{PipelineError, Result};
use crate::models::{GradeRecord, Report, ReportRow, RiskLabel};

pub const SHEET_NAME: &str = "Reporte";
pub const COLUMNS: [&str; 5] = ["Alumno", "Notas", "Promedio", "Consejo", "Predicción Riesgo"];
const TABLE_CLASSES: &str = "table table-striped table-hover";

pub fn build_rows(records: &[GradeRecord], predictions: &[u8]) -> Vec<ReportRow> {
    records
        .iter()
        .zip(predictions)
        .map(|(record, prediction)| ReportRow {
            student_name: record.student_name.clone(),
            grades: record.grades_text(),
            average: record.rounded_average(),
            advice: record.advice.message().to_string(),
            predicted_risk: RiskLabel::from_class(*prediction),
        })
        .collect()
}

pub fn render_html(rows: &[ReportRow]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "<table border=\"1\" class=\"{TABLE_CLASSES}\">");
    let _ = writeln!(output, "  <thead>");
    let _ = writeln!(output, "    <tr style=\"text-align: right;\">");
    for column in COLUMNS {
        let _ = writeln!(output, "      <th>{}</th>", escape_html(column));
    }
    let _ = writeln!(output, "    </tr>");
    let _ = writeln!(output, "  </thead>");
    let _ = writeln!(output, "  <tbody>");
    for row in rows {
        let _ = writeln!(output, "    <tr>");
        let _ = writeln!(output, "      <td>{}</td>", escape_html(&row.student_name));
        let _ = writeln!(output, "      <td>{}</td>", escape_html(&row.grades));
        let _ = writeln!(output, "      <td>{:.2}</td>", row.average);
        let _ = writeln!(output, "      <td>{}</td>", escape_html(&row.advice));
        let _ = writeln!(output, "      <td>{}</td>", row.predicted_risk.text());
        let _ = writeln!(output, "    </tr>");
    }
    let _ = writeln!(output, "  </tbody>");
    let _ = write!(output, "</table>");

    output
}

pub fn escape_html(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }
    let mut escaped = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    Cow::Owned(escaped)
}

/// Writes the rows into a single-sheet workbook, header row first.
pub fn render_spreadsheet(rows: &[ReportRow]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let average_format = Format::new().set_num_format("0.00");

    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;
    for (col, column) in COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *column, &header_format)?;
    }
    worksheet.set_column_width(0, 28)?;
    worksheet.set_column_width(1, 18)?;
    worksheet.set_column_width(3, 80)?;
    worksheet.set_column_width(4, 18)?;

    for (index, row) in rows.iter().enumerate() {
        let sheet_row = index as u32 + 1;
        worksheet.write_string(sheet_row, 0, &row.student_name)?;
        // Blank grade lists stay blank cells.
        if !row.grades.is_empty() {
            worksheet.write_string(sheet_row, 1, &row.grades)?;
        }
        worksheet.write_number_with_format(sheet_row, 2, row.average, &average_format)?;
        worksheet.write_string(sheet_row, 3, &row.advice)?;
        worksheet.write_string(sheet_row, 4, row.predicted_risk.text())?;
    }

    Ok(workbook.save_to_buffer()?)
}

/// Reads a workbook produced by [`render_spreadsheet`] back into rows.
pub fn read_spreadsheet(bytes: &[u8]) -> Result<Vec<ReportRow>> {
    let table = document::read_xlsx_table(bytes)?;
    let Some((header, body)) = table.split_first() else {
        return Err(PipelineError::MalformedDocument(
            "report workbook is empty".to_string(),
        ));
    };
    if header.iter().map(String::as_str).ne(COLUMNS) {
        return Err(PipelineError::MalformedDocument(format!(
            "unexpected report header: {header:?}"
        )));
    }

    body.iter()
        .enumerate()
        .map(|(index, cells)| {
            let cell = |col: usize| cells.get(col).cloned().unwrap_or_default();
            let average_text = cell(2);
            let average = average_text.trim().parse::<f64>().map_err(|_| {
                PipelineError::MalformedDocument(format!(
                    "row {}: average {average_text:?} is not a number",
                    index + 2
                ))
            })?;
            let risk_text = cell(4);
            let predicted_risk = RiskLabel::from_text(&risk_text).ok_or_else(|| {
                PipelineError::MalformedDocument(format!(
                    "row {}: unknown risk text {risk_text:?}",
                    index + 2
                ))
            })?;

            Ok(ReportRow {
                student_name: cell(0),
                grades: cell(1),
                average,
                advice: cell(3),
                predicted_risk,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    generated_at: DateTime<Utc>,
    accuracy_percent: Option<f64>,
    students: usize,
    rows: &'a [ReportRow],
}

pub fn render_json(report: &Report, generated_at: DateTime<Utc>) -> Result<String> {
    let payload = JsonReport {
        generated_at,
        accuracy_percent: report.accuracy_percent(),
        students: report.rows.len(),
        rows: &report.rows,
    };
    serde_json::to_string_pretty(&payload)
        .map_err(|err| PipelineError::Internal(format!("failed to serialize report: {err}")))
}

pub fn render_summary(report: &Report) -> String {
    let mut output = String::new();
    let at_risk = report
        .rows
        .iter()
        .filter(|row| row.predicted_risk == RiskLabel::AtRisk)
        .count();

    let _ = writeln!(output, "Reporte de notas: {} alumnos", report.rows.len());
    match report.accuracy_percent() {
        Some(percent) => {
            let _ = writeln!(output, "Precisión del modelo: {percent:.2}%");
        }
        None => {
            let _ = writeln!(output, "Sin modelo: no hay alumnos en el documento.");
        }
    }
    let _ = writeln!(output, "Alumnos en riesgo (predicción): {at_risk}");

    for row in report.rows.iter().filter(|row| row.predicted_risk == RiskLabel::AtRisk) {
        let _ = writeln!(
            output,
            "- {} promedio {:.2} ({})",
            row.student_name,
            row.average,
            if row.grades.is_empty() { "sin notas" } else { row.grades.as_str() }
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grades::normalize_entry;
    use crate::models::{AdviceBucket, RosterEntry};

    fn record(name: &str, grades: &[&str]) -> GradeRecord {
        normalize_entry(&RosterEntry {
            student_name: name.to_string(),
            letter_grades: grades.iter().map(|g| g.to_string()).collect(),
        })
    }

    fn sample_rows() -> Vec<ReportRow> {
        let records = vec![
            record("Ana", &["A", "A", "B"]),
            record("Luis", &[]),
            record("José <Jr> & Co", &["C", "B"]),
        ];
        build_rows(&records, &[0, 1, 1])
    }

    fn report(rows: Vec<ReportRow>, accuracy: Option<f64>) -> Report {
        Report {
            html: render_html(&rows),
            spreadsheet: Vec::new(),
            rows,
            accuracy,
        }
    }

    #[test]
    fn rows_carry_display_values() {
        let rows = sample_rows();
        assert_eq!(rows[0].grades, "A, A, B");
        assert_eq!(rows[0].average, 18.33);
        assert_eq!(rows[0].advice, AdviceBucket::Excellent.message());
        assert_eq!(rows[0].predicted_risk, RiskLabel::NotAtRisk);
        assert_eq!(rows[1].average, 0.0);
        assert_eq!(rows[1].predicted_risk.text(), "En riesgo");
    }

    #[test]
    fn html_lists_columns_in_order_and_escapes_cells() {
        let html = render_html(&sample_rows());
        let header_positions: Vec<usize> = COLUMNS
            .iter()
            .map(|column| html.find(&format!("<th>{column}</th>")).unwrap())
            .collect();
        assert!(header_positions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(html.contains("<td>18.33</td>"));
        assert!(html.contains("<td>0.00</td>"));
        assert!(html.contains("José &lt;Jr&gt; &amp; Co"));
        assert!(html.contains("table table-striped table-hover"));
    }

    #[test]
    fn empty_report_still_renders_a_table() {
        let html = render_html(&[]);
        assert!(html.contains("<tbody>\n  </tbody>"));
        let bytes = render_spreadsheet(&[]).unwrap();
        assert!(read_spreadsheet(&bytes).unwrap().is_empty());
    }

    #[test]
    fn spreadsheet_reads_back_identical_rows() {
        let rows = sample_rows();
        let bytes = render_spreadsheet(&rows).unwrap();
        assert_eq!(read_spreadsheet(&bytes).unwrap(), rows);
    }

    #[test]
    fn spreadsheet_has_single_named_sheet_with_header() {
        let bytes = render_spreadsheet(&sample_rows()).unwrap();
        let table = document::read_xlsx_table(&bytes).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table[0], COLUMNS.map(String::from).to_vec());
        assert_eq!(table[2][0], "Luis");
        assert!(table[2][1].is_empty());
    }

    #[test]
    fn foreign_workbook_is_rejected() {
        let mut workbook = Workbook::new();
        workbook.add_worksheet().write_string(0, 0, "Otro").unwrap();
        let bytes = workbook.save_to_buffer().unwrap();
        assert!(matches!(
            read_spreadsheet(&bytes),
            Err(PipelineError::MalformedDocument(_))
        ));
    }

    #[test]
    fn json_export_includes_accuracy_and_rows() {
        let generated_at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = render_json(&report(sample_rows(), Some(0.91666)), generated_at).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["accuracy_percent"], 91.67);
        assert_eq!(value["students"], 3);
        assert_eq!(value["rows"][1]["predicted_risk"], "En riesgo");
        assert_eq!(value["rows"][0]["student_name"], "Ana");
    }

    #[test]
    fn summary_lists_students_flagged_at_risk() {
        let summary = render_summary(&report(sample_rows(), Some(0.75)));
        assert!(summary.contains("Precisión del modelo: 75.00%"));
        assert!(summary.contains("Alumnos en riesgo (predicción): 2"));
        assert!(summary.contains("- Luis promedio 0.00 (sin notas)"));
        assert!(!summary.contains("- Ana"));

        let empty = render_summary(&report(Vec::new(), None));
        assert!(empty.contains("Sin modelo"));
    }
}
