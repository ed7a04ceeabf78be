//! Markdown → Notion block payload conversion.
//!
//! Table-aware, list-aware and fence-aware: a `| a | b |` header followed by
//! a `|---|` separator row becomes a native table block; everything
//! unrecognized becomes a paragraph.

use serde_json::{json, Value};

/// Notion rejects rich-text fragments above 2000 characters; stay under it.
const RICH_TEXT_CHUNK: usize = 1800;
const CODE_CHUNK: usize = 1500;

/// Split long content into rich-text fragments.
pub fn rich_text(content: &str, chunk_size: usize) -> Value {
    if content.is_empty() {
        return json!([{"type": "text", "text": {"content": ""}}]);
    }
    let chars: Vec<char> = content.chars().collect();
    let mut segments = Vec::new();
    for chunk in chars.chunks(chunk_size.max(1)) {
        let piece: String = chunk.iter().collect();
        segments.push(json!({"type": "text", "text": {"content": piece}}));
    }
    Value::Array(segments)
}

fn paragraph_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "paragraph",
        "paragraph": {"rich_text": rich_text(text, RICH_TEXT_CHUNK)},
    })
}

fn heading_block(text: &str, level: usize) -> Value {
    let level = level.clamp(1, 3);
    let key = format!("heading_{level}");
    let mut block = serde_json::Map::new();
    block.insert("object".into(), json!("block"));
    block.insert("type".into(), json!(key));
    block.insert(
        format!("heading_{level}"),
        json!({"rich_text": rich_text(text, RICH_TEXT_CHUNK)}),
    );
    Value::Object(block)
}

fn bulleted_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "bulleted_list_item",
        "bulleted_list_item": {"rich_text": rich_text(text, RICH_TEXT_CHUNK)},
    })
}

fn numbered_block(text: &str) -> Value {
    json!({
        "object": "block",
        "type": "numbered_list_item",
        "numbered_list_item": {"rich_text": rich_text(text, RICH_TEXT_CHUNK)},
    })
}

fn code_block(code: &str, language: Option<&str>) -> Value {
    json!({
        "object": "block",
        "type": "code",
        "code": {
            "rich_text": rich_text(code, CODE_CHUNK),
            "language": language.unwrap_or("plain text").to_lowercase(),
        },
    })
}

fn table_block(rows: &[Vec<String>]) -> Value {
    let width = rows.iter().map(Vec::len).max().unwrap_or(1);
    let children: Vec<Value> = rows
        .iter()
        .map(|row| {
            let cells: Vec<Value> = (0..width)
                .map(|i| rich_text(row.get(i).map(String::as_str).unwrap_or(""), RICH_TEXT_CHUNK))
                .collect();
            json!({
                "object": "block",
                "type": "table_row",
                "table_row": {"cells": cells},
            })
        })
        .collect();

    json!({
        "object": "block",
        "type": "table",
        "table": {
            "table_width": width,
            "has_column_header": true,
            "has_row_header": false,
            "children": children,
        },
    })
}

/// Whether a line looks like a `|---|:---:|` table separator row.
fn is_table_separator(line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.contains('-') || !trimmed.contains('|') {
        return false;
    }
    trimmed
        .chars()
        .all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Split a `| a | b |` row into trimmed cell strings.
fn split_table_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

/// Convert markdown into Notion block payloads.
pub fn markdown_to_blocks(markdown: &str) -> Vec<Value> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks: Vec<Value> = Vec::new();
    let mut in_code = false;
    let mut code_lines: Vec<String> = Vec::new();
    let mut code_lang: Option<String> = None;

    let mut i = 0;
    while i < lines.len() {
        let raw_line = lines[i];
        let line = raw_line.trim_end();

        if line.trim().starts_with("```") {
            let fence_lang = line.trim()[3..].trim();
            if !in_code {
                in_code = true;
                code_lines.clear();
                code_lang = if fence_lang.is_empty() {
                    None
                } else {
                    Some(fence_lang.to_string())
                };
            } else {
                blocks.push(code_block(&code_lines.join("\n"), code_lang.as_deref()));
                in_code = false;
                code_lines.clear();
                code_lang = None;
            }
            i += 1;
            continue;
        }

        if in_code {
            code_lines.push(raw_line.to_string());
            i += 1;
            continue;
        }

        let stripped = line.trim();
        if stripped.is_empty() {
            i += 1;
            continue;
        }

        // Table: header row + separator row, then data rows.
        if stripped.starts_with('|')
            && i + 1 < lines.len()
            && is_table_separator(lines[i + 1])
        {
            let mut rows = vec![split_table_row(stripped)];
            let mut j = i + 2;
            while j < lines.len() && lines[j].trim().starts_with('|') {
                rows.push(split_table_row(lines[j].trim()));
                j += 1;
            }
            blocks.push(table_block(&rows));
            i = j;
            continue;
        }

        if let Some(rest) = stripped.strip_prefix("# ") {
            blocks.push(heading_block(rest.trim(), 1));
        } else if let Some(rest) = stripped.strip_prefix("## ") {
            blocks.push(heading_block(rest.trim(), 2));
        } else if let Some(rest) = stripped.strip_prefix("### ") {
            blocks.push(heading_block(rest.trim(), 3));
        } else if let Some(rest) = stripped.strip_prefix("- ") {
            blocks.push(bulleted_block(rest.trim()));
        } else if let Some(rest) = stripped.strip_prefix("* ") {
            blocks.push(bulleted_block(rest.trim()));
        } else if let Some((prefix, rest)) = stripped.split_once(". ") {
            if prefix.chars().all(|c| c.is_ascii_digit()) && !prefix.is_empty() {
                blocks.push(numbered_block(rest.trim()));
            } else {
                blocks.push(paragraph_block(stripped));
            }
        } else {
            blocks.push(paragraph_block(stripped));
        }
        i += 1;
    }

    // An unterminated fence still lands as a code block.
    if in_code {
        blocks.push(code_block(&code_lines.join("\n"), code_lang.as_deref()));
    }

    if blocks.is_empty() {
        blocks.push(paragraph_block(markdown.trim()));
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_with_separator_becomes_native_table() {
        let markdown = "| Name | Count |\n|---|---|\n| a | 1 |\n| b | 2 |";
        let blocks = markdown_to_blocks(markdown);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"].as_str(), Some("table"));
        assert_eq!(blocks[0]["table"]["table_width"].as_i64(), Some(2));
        let rows = blocks[0]["table"]["children"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["type"].as_str(), Some("table_row"));
    }

    #[test]
    fn pipe_lines_without_separator_stay_paragraphs() {
        let markdown = "| just a weird line |\nnormal text";
        let blocks = markdown_to_blocks(markdown);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["type"].as_str(), Some("paragraph"));
    }

    #[test]
    fn headings_lists_and_fences_convert() {
        let markdown = "# Title\n## Section\n- bullet\n1. first\n```rust\nfn main() {}\n```\nplain";
        let blocks = markdown_to_blocks(markdown);
        let kinds: Vec<&str> = blocks.iter().map(|b| b["type"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                "heading_1",
                "heading_2",
                "bulleted_list_item",
                "numbered_list_item",
                "code",
                "paragraph"
            ]
        );
        assert_eq!(blocks[4]["code"]["language"].as_str(), Some("rust"));
    }

    #[test]
    fn long_text_splits_into_rich_text_fragments() {
        let long = "a".repeat(4000);
        let value = rich_text(&long, 1800);
        let segments = value.as_array().unwrap();
        assert_eq!(segments.len(), 3);
    }

    #[test]
    fn empty_markdown_yields_one_paragraph() {
        let blocks = markdown_to_blocks("");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"].as_str(), Some("paragraph"));
    }
}
