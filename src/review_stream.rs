//! Extracts plain text from the reviewer's stream-JSON output.
//!
//! The reviewer writes one JSON object per line. Text lives either in
//! `assistant` messages (`message.content[*]` entries of type `text`) or in
//! `content_block_delta` objects (`delta.text`). Anything else, including
//! malformed lines, is ignored.

use std::{
    io::{BufRead, BufReader},
    path::Path,
};

use serde_json::Value;

/// Pure, deterministic extraction: concatenates text fragments in file order.
pub fn extract_review_text(lines: impl IntoIterator<Item = String>) -> String {
    let mut text = String::new();

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => continue,
        };

        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let content = value
                    .get("message")
                    .and_then(|message| message.get("content"))
                    .and_then(Value::as_array);
                if let Some(items) = content {
                    for item in items {
                        if item.get("type").and_then(Value::as_str) == Some("text") {
                            if let Some(fragment) = item.get("text").and_then(Value::as_str) {
                                text.push_str(fragment);
                            }
                        }
                    }
                }
            }
            Some("content_block_delta") => {
                let fragment = value
                    .get("delta")
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str);
                if let Some(fragment) = fragment {
                    text.push_str(fragment);
                }
            }
            _ => {}
        }
    }

    text
}

/// Converts a stream-JSON artifact into its markdown rendition.
pub fn convert_json_to_markdown(json_path: &Path, markdown_path: &Path) -> anyhow::Result<()> {
    let file = fs_err::File::open(json_path)?;
    let lines = BufReader::new(file).lines().map_while(Result::ok);
    let text = extract_review_text(lines);
    fs_err::write(markdown_path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(input: &[&str]) -> Vec<String> {
        input.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn assistant_text_fragments_concatenate_in_order() {
        let text = extract_review_text(lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello, "}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"world"}]}}"#,
        ]));
        assert_eq!(text, "Hello, world");
    }

    #[test]
    fn multiple_content_items_in_one_message() {
        let text = extract_review_text(lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"a"},{"type":"tool_use","id":"x"},{"type":"text","text":"b"}]}}"#,
        ]));
        assert_eq!(text, "ab");
    }

    #[test]
    fn deltas_are_appended() {
        let text = extract_review_text(lines(&[
            r#"{"type":"content_block_delta","delta":{"text":"one"}}"#,
            r#"{"type":"content_block_delta","delta":{"text":" two"}}"#,
        ]));
        assert_eq!(text, "one two");
    }

    #[test]
    fn malformed_lines_do_not_change_the_output() {
        let text = extract_review_text(lines(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"keep"}]}}"#,
            "this is not json",
            r#"{"type":"assistant","message":"not an object"}"#,
            "",
            r#"{"unterminated": "#,
        ]));
        assert_eq!(text, "keep");
    }

    #[test]
    fn non_text_events_are_ignored() {
        let text = extract_review_text(lines(&[
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"result","result":"done"}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"grep"}]}}"#,
        ]));
        assert_eq!(text, "");
    }

    #[test]
    fn empty_input_yields_empty_text() {
        assert_eq!(extract_review_text(Vec::<String>::new()), "");
    }

    #[test]
    fn file_conversion_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("review.json");
        let md_path = dir.path().join("review.md");

        std::fs::write(
            &json_path,
            concat!(
                r#"{"type":"system","subtype":"init"}"#,
                "\n",
                r###"{"type":"assistant","message":{"content":[{"type":"text","text":"## Review\n"}]}}"###,
                "\n",
                "garbage line\n",
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looks fine."}]}}"#,
                "\n",
            ),
        )
        .unwrap();

        convert_json_to_markdown(&json_path, &md_path).unwrap();

        let markdown = std::fs::read_to_string(&md_path).unwrap();
        insta::assert_snapshot!(markdown, @r###"
        ## Review
        Looks fine.
        "###);
    }
}
