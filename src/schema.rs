// ai-writer-service/src/schema.rs
//
// Turns raw model text into a `GenerationResult` or a typed failure.
// Strict decode first; one explicit coercion table on the lenient path.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::models::{
    DocSection, DocumentView, GenerationResult, RequestedViews, Slide, TableView, ViewKind,
    DEFAULT_AUTHOR, DEFAULT_TITLE,
};

/// A validated result plus whether the repair pass was needed to get it.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub result: GenerationResult,
    pub repaired: bool,
}

/// Internal decode outcome; collapsed to `Result` at the public boundary.
enum Decoded {
    Strict(GenerationResult),
    Repaired(GenerationResult),
    Incomplete(Vec<ViewKind>),
}

/// Parse raw model output into a `GenerationResult`.
///
/// The model is instructed to return exactly one JSON object, but real
/// output may be wrapped in prose or code fences. Structural near-misses
/// are repaired; a missing required view fails loudly instead of
/// rendering an empty document.
pub fn parse(
    raw: &str,
    required: RequestedViews,
    fallback_language: &str,
) -> Result<Parsed, ValidationError> {
    let object = extract_json_object(raw)
        .ok_or_else(|| ValidationError::Malformed("no JSON object found in output".into()))?;

    let value: Value = serde_json::from_str(object)
        .map_err(|e| ValidationError::Malformed(format!("invalid JSON: {e}")))?;

    let decoded = match decode_strict(&value, required) {
        Some(result) => Decoded::Strict(result),
        None => {
            debug!("Strict decode failed, attempting repair");
            decode_lenient(&value, required, fallback_language)
        }
    };

    match decoded {
        Decoded::Strict(mut result) => {
            normalize_table(&mut result.table);
            Ok(Parsed {
                result,
                repaired: false,
            })
        }
        Decoded::Repaired(mut result) => {
            normalize_table(&mut result.table);
            Ok(Parsed {
                result,
                repaired: true,
            })
        }
        Decoded::Incomplete(missing) => Err(ValidationError::IncompleteOutput { missing }),
    }
}

// ============================================================
// JSON extraction
// ============================================================

/// Slice out the first top-level JSON object, honouring nested braces and
/// braces embedded in string values. Returns `None` when no balanced
/// object exists.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let bytes = raw.as_bytes();
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================
// Strict decode: exact wire mirror, no defaults
// ============================================================

#[derive(Deserialize)]
struct StrictOutput {
    document: StrictDocument,
    slides: Vec<StrictSlide>,
    table: StrictTable,
}

#[derive(Deserialize)]
struct StrictDocument {
    title: String,
    author: String,
    language: String,
    sections: Vec<StrictSection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrictSection {
    heading: String,
    paragraph: String,
    bullets: Vec<String>,
    image_keyword: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrictSlide {
    title: String,
    bullets: Vec<String>,
    image_keyword: Option<String>,
}

#[derive(Deserialize)]
struct StrictTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn decode_strict(value: &Value, required: RequestedViews) -> Option<GenerationResult> {
    let strict: StrictOutput = serde_json::from_value(value.clone()).ok()?;

    let result = GenerationResult {
        document: DocumentView {
            title: strict.document.title,
            author: strict.document.author,
            language: strict.document.language,
            sections: strict
                .document
                .sections
                .into_iter()
                .map(|s| DocSection {
                    heading: s.heading,
                    paragraph: s.paragraph,
                    bullets: s.bullets,
                    image_keyword: s.image_keyword,
                    resolved_image_url: None,
                })
                .collect(),
        },
        slides: strict
            .slides
            .into_iter()
            .map(|s| Slide {
                title: s.title,
                bullets: s.bullets,
                image_keyword: s.image_keyword,
                resolved_image_url: None,
            })
            .collect(),
        table: TableView {
            headers: strict.table.headers,
            rows: strict.table.rows,
        },
    };

    holds_invariants(&result, required).then_some(result)
}

fn holds_invariants(result: &GenerationResult, required: RequestedViews) -> bool {
    let document_ok = !result.document.sections.is_empty()
        && result
            .document
            .sections
            .iter()
            .all(|s| !s.heading.trim().is_empty());
    let slides_ok = !required.slides || !result.slides.is_empty();
    let table_ok = !required.table || !result.table.headers.is_empty();
    document_ok && slides_ok && table_ok
}

// ============================================================
// Lenient decode: documented defaults + one coercion table
// ============================================================

/// Scalar coercion: strings pass through, numbers and booleans become
/// their display form. Objects and arrays are not strings.
fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Sequence coercion: a scalar where a sequence was expected becomes a
/// one-element sequence; null and missing become empty.
fn coerce_seq(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other],
    }
}

fn coerce_string_seq(value: Option<&Value>) -> Vec<String> {
    coerce_seq(value)
        .into_iter()
        .filter_map(coerce_string)
        .collect()
}

fn nonempty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(coerce_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn decode_lenient(value: &Value, required: RequestedViews, fallback_language: &str) -> Decoded {
    let mut missing = Vec::new();

    // Document view: required for every request.
    let document = match value.get("document") {
        Some(doc @ Value::Object(_)) => {
            let sections: Vec<DocSection> = coerce_seq(doc.get("sections"))
                .into_iter()
                .filter_map(lenient_section)
                .collect();
            if sections.is_empty() {
                missing.push(ViewKind::Document);
                None
            } else {
                Some(DocumentView {
                    title: nonempty_string(doc.get("title"))
                        .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
                    author: nonempty_string(doc.get("author"))
                        .unwrap_or_else(|| DEFAULT_AUTHOR.to_string()),
                    language: nonempty_string(doc.get("language"))
                        .unwrap_or_else(|| fallback_language.to_string()),
                    sections,
                })
            }
        }
        _ => {
            missing.push(ViewKind::Document);
            None
        }
    };

    // Slide view: required only when a slide format was requested.
    let slides: Vec<Slide> = coerce_seq(value.get("slides"))
        .into_iter()
        .filter_map(lenient_slide)
        .collect();
    if required.slides && slides.is_empty() {
        missing.push(ViewKind::Slides);
    }

    // Table view: advisory; malformed shapes degrade to the empty table.
    let table = match value.get("table") {
        Some(tbl @ Value::Object(_)) => {
            let mut table = TableView::empty();
            let headers = coerce_string_seq(tbl.get("headers"));
            if headers.len() == table.headers.len() {
                table.headers = headers;
            } else if !headers.is_empty() {
                warn!(
                    got = headers.len(),
                    expected = table.headers.len(),
                    "Table headers have wrong arity, using the fixed contract"
                );
            }
            table.rows = coerce_seq(tbl.get("rows"))
                .into_iter()
                .map(|row| coerce_string_seq(Some(row)))
                .collect();
            Some(table)
        }
        _ => None,
    };
    if required.table && table.is_none() {
        missing.push(ViewKind::Table);
    }

    if !missing.is_empty() {
        return Decoded::Incomplete(missing);
    }

    Decoded::Repaired(GenerationResult {
        document: document.expect("document present when not missing"),
        slides,
        table: table.unwrap_or_else(TableView::empty),
    })
}

fn lenient_section(value: &Value) -> Option<DocSection> {
    let heading = nonempty_string(value.get("heading"))?;
    Some(DocSection {
        heading,
        paragraph: value
            .get("paragraph")
            .and_then(coerce_string)
            .unwrap_or_default(),
        bullets: coerce_string_seq(value.get("bullets")),
        image_keyword: nonempty_string(value.get("imageKeyword")),
        resolved_image_url: None,
    })
}

fn lenient_slide(value: &Value) -> Option<Slide> {
    // A bare string where a slide object was expected becomes a
    // title-only slide.
    if let Some(title) = coerce_string(value) {
        let title = title.trim().to_string();
        if title.is_empty() {
            return None;
        }
        return Some(Slide {
            title,
            bullets: Vec::new(),
            image_keyword: None,
            resolved_image_url: None,
        });
    }

    let title = nonempty_string(value.get("title"))?;
    Some(Slide {
        title,
        bullets: coerce_string_seq(value.get("bullets")),
        image_keyword: nonempty_string(value.get("imageKeyword")),
        resolved_image_url: None,
    })
}

// ============================================================
// Table arity
// ============================================================

/// Truncate or pad every row to header arity. Logged, never failed:
/// table data is advisory, not load-bearing.
fn normalize_table(table: &mut TableView) {
    let arity = table.headers.len();
    for row in &mut table.rows {
        if row.len() > arity {
            warn!(got = row.len(), expected = arity, "Truncating oversized table row");
            row.truncate(arity);
        } else if row.len() < arity {
            warn!(got = row.len(), expected = arity, "Padding undersized table row");
            row.resize(arity, String::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TABLE_HEADERS;

    const WELL_FORMED: &str = r#"{
        "document": {
            "title": "Renewable Energy",
            "author": "AI Writer",
            "language": "en",
            "sections": [
                {"heading": "Solar", "paragraph": "Sunlight in, power out.", "bullets": ["cheap", "clean"], "imageKeyword": "solar panels"},
                {"heading": "Wind", "paragraph": "Turbines.", "bullets": [], "imageKeyword": "wind turbines"}
            ]
        },
        "slides": [
            {"title": "Overview", "bullets": ["solar", "wind"], "imageKeyword": "energy"}
        ],
        "table": {
            "headers": ["Section", "Key Points", "Image Keyword"],
            "rows": [["Solar", "cheap, clean", "solar panels"], ["Wind", "steady", "wind turbines"]]
        }
    }"#;

    fn all_views() -> RequestedViews {
        RequestedViews::all()
    }

    #[test]
    fn test_strict_path_no_repair() {
        let parsed = parse(WELL_FORMED, all_views(), "en").unwrap();
        assert!(!parsed.repaired);
        assert_eq!(parsed.result.document.sections.len(), 2);
        assert_eq!(parsed.result.slides.len(), 1);
        assert_eq!(parsed.result.table.rows.len(), 2);
    }

    #[test]
    fn test_strict_matches_direct_decode() {
        let parsed = parse(WELL_FORMED, all_views(), "en").unwrap();
        let direct: GenerationResult = serde_json::from_str(WELL_FORMED).unwrap();
        assert_eq!(parsed.result, direct);
    }

    #[test]
    fn test_code_fence_wrapping_is_stripped() {
        let wrapped = format!("Here is your document:\n```json\n{WELL_FORMED}\n```\nEnjoy!");
        let parsed = parse(&wrapped, all_views(), "en").unwrap();
        assert!(!parsed.repaired);
        assert_eq!(parsed.result.document.title, "Renewable Energy");
    }

    #[test]
    fn test_braces_inside_string_values_do_not_confuse_the_scan() {
        let raw = r#"prose {"document": {"title": "T", "author": "A", "language": "en",
            "sections": [{"heading": "H", "paragraph": "use {curly} carefully, even \"quoted {\" ones",
                          "bullets": [], "imageKeyword": null}]},
            "slides": [], "table": {"headers": ["Section", "Key Points", "Image Keyword"], "rows": []}} trailing"#;
        let parsed = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: false,
            },
            "en",
        )
        .unwrap();
        assert!(parsed.result.document.sections[0]
            .paragraph
            .contains("{curly}"));
    }

    #[test]
    fn test_extract_handles_nested_objects() {
        let raw = r#"x {"a": {"b": {"c": 1}}} y"#;
        assert_eq!(extract_json_object(raw), Some(r#"{"a": {"b": {"c": 1}}}"#));
    }

    #[test]
    fn test_no_object_is_malformed() {
        let err = parse("I'm sorry, I can't do that.", all_views(), "en").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_unbalanced_object_is_malformed() {
        let err = parse(r#"{"document": {"title": "T""#, all_views(), "en").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_lenient_supplies_defaults() {
        let raw = r#"{
            "document": {
                "sections": [{"heading": "Only", "paragraph": "One."}]
            }
        }"#;
        let parsed = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: false,
            },
            "de",
        )
        .unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.result.document.title, DEFAULT_TITLE);
        assert_eq!(parsed.result.document.author, DEFAULT_AUTHOR);
        assert_eq!(parsed.result.document.language, "de");
        assert!(parsed.result.slides.is_empty());
        assert_eq!(parsed.result.table.headers, TABLE_HEADERS.to_vec());
    }

    #[test]
    fn test_scalar_coerced_to_one_element_sequence() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": {"heading": "H", "paragraph": "P", "bullets": "just one point"}
            },
            "slides": ["Intro slide"],
            "table": {"headers": ["Section", "Key Points", "Image Keyword"], "rows": []}
        }"#;
        let parsed = parse(raw, all_views(), "en").unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.result.document.sections.len(), 1);
        assert_eq!(
            parsed.result.document.sections[0].bullets,
            vec!["just one point".to_string()]
        );
        assert_eq!(parsed.result.slides[0].title, "Intro slide");
    }

    #[test]
    fn test_sections_with_empty_headings_are_dropped() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": [
                    {"heading": "  ", "paragraph": "dropped"},
                    {"heading": "Kept", "paragraph": "stays"}
                ]
            }
        }"#;
        let parsed = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: false,
            },
            "en",
        )
        .unwrap();
        assert_eq!(parsed.result.document.sections.len(), 1);
        assert_eq!(parsed.result.document.sections[0].heading, "Kept");
    }

    #[test]
    fn test_missing_required_view_fails_loudly() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": [{"heading": "H", "paragraph": "P"}]
            }
        }"#;
        let err = parse(raw, all_views(), "en").unwrap_err();
        match err {
            ValidationError::IncompleteOutput { missing } => {
                assert!(missing.contains(&ViewKind::Slides));
                assert!(missing.contains(&ViewKind::Table));
                assert!(!missing.contains(&ViewKind::Document));
            }
            other => panic!("expected IncompleteOutput, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_document_fails_even_when_only_pdf_requested() {
        let raw = r#"{"document": {"title": "T", "author": "A", "language": "en", "sections": []}}"#;
        let err = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: false,
            },
            "en",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::IncompleteOutput { .. }
        ));
    }

    #[test]
    fn test_row_arity_normalized_for_all_inputs() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": [{"heading": "H", "paragraph": "P", "bullets": []}]
            },
            "slides": [{"title": "S", "bullets": []}],
            "table": {
                "headers": ["Section", "Key Points", "Image Keyword"],
                "rows": [["a"], ["a", "b", "c", "d"], ["x", "y", "z"]]
            }
        }"#;
        let parsed = parse(raw, all_views(), "en").unwrap();
        for row in &parsed.result.table.rows {
            assert_eq!(row.len(), 3);
        }
        assert_eq!(parsed.result.table.rows[0], vec!["a", "", ""]);
        assert_eq!(parsed.result.table.rows[1], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_numeric_cells_coerced_to_strings() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": [{"heading": "H", "paragraph": "P"}]
            },
            "slides": [],
            "table": {
                "headers": ["Section", "Key Points", "Image Keyword"],
                "rows": [[1, true, "x"]]
            }
        }"#;
        let parsed = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: true,
            },
            "en",
        )
        .unwrap();
        assert_eq!(parsed.result.table.rows[0], vec!["1", "true", "x"]);
    }

    #[test]
    fn test_wrong_header_arity_falls_back_to_contract() {
        let raw = r#"{
            "document": {
                "title": "T", "author": "A", "language": "en",
                "sections": [{"heading": "H", "paragraph": "P"}]
            },
            "slides": [],
            "table": {"headers": ["Only", "Two"], "rows": [["a", "b"]]}
        }"#;
        let parsed = parse(
            raw,
            RequestedViews {
                document: true,
                slides: false,
                table: true,
            },
            "en",
        )
        .unwrap();
        assert_eq!(parsed.result.table.headers, TABLE_HEADERS.to_vec());
        assert_eq!(parsed.result.table.rows[0], vec!["a", "b", ""]);
    }
}
