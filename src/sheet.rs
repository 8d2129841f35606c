use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::path::Path;

use anyhow::{anyhow, Context};
use serde_json::json;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MAX_COL_LETTERS: usize = 3;

/// Parse a column reference ("A".."ZZZ") into a 1-based index.
pub fn parse_col(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > MAX_COL_LETTERS {
        return None;
    }
    let mut n: u32 = 0;
    for c in s.chars() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        n = n * 26 + (c as u32 - 'A' as u32 + 1);
    }
    Some(n)
}

pub fn format_col(mut n: u32) -> String {
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    out.iter().rev().collect()
}

pub fn is_col_ref(s: &str) -> bool {
    parse_col(s).is_some()
}

pub fn is_cell_ref(s: &str) -> bool {
    CellRef::parse(s).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellRef {
    pub col: u32,
    pub row: u32,
}

impl CellRef {
    pub fn new(col: u32, row: u32) -> Self {
        Self { col, row }
    }

    /// Parse an "A9"-style reference. Rows are 1-based; no leading zeros.
    pub fn parse(s: &str) -> Option<Self> {
        let split = s.find(|c: char| c.is_ascii_digit())?;
        let (letters, digits) = s.split_at(split);
        let col = parse_col(letters)?;
        if digits.starts_with('0') {
            return None;
        }
        let row: u32 = digits.parse().ok()?;
        if row == 0 {
            return None;
        }
        Some(Self { col, row })
    }

    pub fn a1(&self) -> String {
        format!("{}{}", format_col(self.col), self.row)
    }
}

/// Resolve a mapped coordinate that may be a bare column ("D") or a fixed
/// cell ("D15") against a row.
pub fn resolve_cell(cell_or_col: &str, row: u32) -> Option<CellRef> {
    if let Some(cell) = CellRef::parse(cell_or_col) {
        return Some(cell);
    }
    parse_col(cell_or_col).map(|col| CellRef::new(col, row))
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Formula(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedRange {
    pub start: CellRef,
    pub end: CellRef,
}

impl MergedRange {
    pub fn parse(s: &str) -> Option<Self> {
        let (a, b) = s.split_once(':')?;
        let start = CellRef::parse(a)?;
        let end = CellRef::parse(b)?;
        if end.col < start.col || end.row < start.row {
            return None;
        }
        Some(Self { start, end })
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.col >= self.start.col
            && cell.col <= self.end.col
            && cell.row >= self.start.row
            && cell.row <= self.end.row
    }

    pub fn a1(&self) -> String {
        format!("{}:{}", self.start.a1(), self.end.a1())
    }
}

/// In-memory workbook behind the generator's open/set/save contract.
/// Templates are the crate's own JSON sheet model; output is a minimal
/// OOXML xlsx container with deterministic bytes.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    pub sheet_name: String,
    cells: BTreeMap<(u32, u32), CellValue>,
    merged: Vec<MergedRange>,
    hidden_rows: BTreeSet<u32>,
}

impl Workbook {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open template {}", path.to_string_lossy()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("template {} is invalid JSON", path.to_string_lossy()))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &serde_json::Value) -> anyhow::Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("sheet model must be an object"))?;
        let mut wb = Workbook {
            sheet_name: obj
                .get("sheetName")
                .and_then(|v| v.as_str())
                .unwrap_or("Folha1")
                .to_string(),
            ..Default::default()
        };

        if let Some(cells) = obj.get("cells").and_then(|v| v.as_object()) {
            for (coord, raw) in cells {
                let cell = CellRef::parse(coord)
                    .ok_or_else(|| anyhow!("invalid cell coordinate: {}", coord))?;
                let value = match raw {
                    serde_json::Value::String(s) => CellValue::Text(s.clone()),
                    serde_json::Value::Number(n) => CellValue::Number(
                        n.as_f64().ok_or_else(|| anyhow!("bad number at {}", coord))?,
                    ),
                    serde_json::Value::Object(o) => {
                        let f = o
                            .get("formula")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| anyhow!("cell {} object needs a formula", coord))?;
                        CellValue::Formula(f.to_string())
                    }
                    _ => return Err(anyhow!("unsupported cell value at {}", coord)),
                };
                wb.cells.insert((cell.row, cell.col), value);
            }
        }

        if let Some(merged) = obj.get("merged").and_then(|v| v.as_array()) {
            for m in merged {
                let s = m.as_str().ok_or_else(|| anyhow!("merged entry must be a string"))?;
                let range =
                    MergedRange::parse(s).ok_or_else(|| anyhow!("invalid merged range: {}", s))?;
                wb.merged.push(range);
            }
        }

        if let Some(rows) = obj.get("hiddenRows").and_then(|v| v.as_array()) {
            for r in rows {
                let row = r
                    .as_u64()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| anyhow!("invalid hidden row"))?;
                wb.hidden_rows.insert(row as u32);
            }
        }

        Ok(wb)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut cells = serde_json::Map::new();
        for ((row, col), value) in &self.cells {
            let coord = CellRef::new(*col, *row).a1();
            let v = match value {
                CellValue::Text(s) => json!(s),
                CellValue::Number(n) => json!(n),
                CellValue::Formula(f) => json!({ "formula": f }),
            };
            cells.insert(coord, v);
        }
        json!({
            "sheetName": self.sheet_name,
            "cells": cells,
            "merged": self.merged.iter().map(|m| m.a1()).collect::<Vec<_>>(),
            "hiddenRows": self.hidden_rows.iter().collect::<Vec<_>>(),
        })
    }

    /// Anchor of the merged range containing `cell`, or `cell` itself.
    pub fn anchor_of(&self, cell: CellRef) -> CellRef {
        for range in &self.merged {
            if range.contains(cell) {
                return range.start;
            }
        }
        cell
    }

    pub fn get(&self, cell: CellRef) -> Option<&CellValue> {
        self.cells.get(&(cell.row, cell.col))
    }

    /// Write a mapped value. Merged ranges resolve to their anchor; a
    /// formula cell is only overwritten when it is the addressed target
    /// itself, not when reached through merge resolution.
    pub fn set_cell(&mut self, target: CellRef, value: CellValue) {
        let anchor = self.anchor_of(target);
        if anchor != target {
            if let Some(CellValue::Formula(_)) = self.cells.get(&(anchor.row, anchor.col)) {
                return;
            }
        }
        self.cells.insert((anchor.row, anchor.col), value);
    }

    pub fn hide_row(&mut self, row: u32) {
        self.hidden_rows.insert(row);
    }

    pub fn is_row_hidden(&self, row: u32) -> bool {
        self.hidden_rows.contains(&row)
    }

    pub fn save_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let cursor = Cursor::new(Vec::new());
        let mut zip = ZipWriter::new(cursor);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        zip.start_file("[Content_Types].xml", opts)
            .context("failed to start content types entry")?;
        zip.write_all(CONTENT_TYPES_XML.as_bytes())
            .context("failed to write content types")?;

        zip.start_file("_rels/.rels", opts)
            .context("failed to start package rels entry")?;
        zip.write_all(ROOT_RELS_XML.as_bytes())
            .context("failed to write package rels")?;

        zip.start_file("xl/workbook.xml", opts)
            .context("failed to start workbook entry")?;
        zip.write_all(self.workbook_xml().as_bytes())
            .context("failed to write workbook")?;

        zip.start_file("xl/_rels/workbook.xml.rels", opts)
            .context("failed to start workbook rels entry")?;
        zip.write_all(WORKBOOK_RELS_XML.as_bytes())
            .context("failed to write workbook rels")?;

        zip.start_file("xl/worksheets/sheet1.xml", opts)
            .context("failed to start worksheet entry")?;
        zip.write_all(self.worksheet_xml().as_bytes())
            .context("failed to write worksheet")?;

        let cursor = zip.finish().context("failed to finalize xlsx container")?;
        Ok(cursor.into_inner())
    }

    fn workbook_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
             <workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
             xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
             <sheets><sheet name=\"{}\" sheetId=\"1\" r:id=\"rId1\"/></sheets></workbook>",
            escape_xml(&self.sheet_name)
        )
    }

    fn worksheet_xml(&self) -> String {
        // Rows appear once each, in order, covering cells and bare hidden rows.
        let mut rows: BTreeSet<u32> = self.cells.keys().map(|(row, _)| *row).collect();
        rows.extend(self.hidden_rows.iter().copied());

        let mut out = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
             <worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">\
             <sheetData>",
        );
        for row in rows {
            let hidden = if self.hidden_rows.contains(&row) {
                " hidden=\"1\""
            } else {
                ""
            };
            out.push_str(&format!("<row r=\"{}\"{}>", row, hidden));
            for ((r, col), value) in self.cells.range((row, 0)..(row + 1, 0)) {
                let coord = CellRef::new(*col, *r).a1();
                match value {
                    CellValue::Text(s) => out.push_str(&format!(
                        "<c r=\"{}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                        coord,
                        escape_xml(s)
                    )),
                    CellValue::Number(n) => {
                        out.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", coord, format_number(*n)))
                    }
                    CellValue::Formula(f) => out.push_str(&format!(
                        "<c r=\"{}\"><f>{}</f></c>",
                        coord,
                        escape_xml(f)
                    )),
                }
            }
            out.push_str("</row>");
        }
        out.push_str("</sheetData>");

        if !self.merged.is_empty() {
            out.push_str(&format!("<mergeCells count=\"{}\">", self.merged.len()));
            for m in &self.merged {
                out.push_str(&format!("<mergeCell ref=\"{}\"/>", m.a1()));
            }
            out.push_str("</mergeCells>");
        }
        out.push_str("</worksheet>");
        out
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

const CONTENT_TYPES_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
<Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
<Default Extension=\"xml\" ContentType=\"application/xml\"/>\
<Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>\
<Override PartName=\"/xl/worksheets/sheet1.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>\
</Types>";

const ROOT_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
</Relationships>";

const WORKBOOK_RELS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\n\
<Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
<Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet1.xml\"/>\
</Relationships>";
