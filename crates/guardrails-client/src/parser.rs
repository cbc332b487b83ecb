use guardrails_core::error::AppError;
use guardrails_core::models::StructuralElement;
use guardrails_core::traits::DocumentParser;
use scraper::{ElementRef, Html};

/// HTML structure parser using scraper (html5ever).
///
/// Emits every element in document order with its depth below `<html>` and
/// its attribute names. Text, comments and the doctype are not elements and
/// never appear. html5ever recovers from any input, so this parser does not
/// fail; malformed markup is normalised the way a browser would, including
/// the implied `<head>` and `<body>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlStructureParser;

impl HtmlStructureParser {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentParser for HtmlStructureParser {
    fn parse(&self, body: &str) -> Result<Vec<StructuralElement>, AppError> {
        let document = Html::parse_document(body);
        Ok(skeleton(document.root_element()))
    }
}

/// Pre-order walk with an explicit stack so deeply nested documents cannot
/// exhaust the call stack.
fn skeleton(root: ElementRef<'_>) -> Vec<StructuralElement> {
    let mut elements = Vec::new();
    let mut stack = vec![(root, 0usize)];

    while let Some((element, depth)) = stack.pop() {
        let value = element.value();
        elements.push(StructuralElement::new(
            value.name(),
            depth,
            value.attrs().map(|(name, _)| name),
        ));

        let children: Vec<ElementRef<'_>> =
            element.children().filter_map(ElementRef::wrap).collect();
        stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
    }

    elements
}

#[cfg(test)]
mod tests {
    use guardrails_core::diffwatch::fingerprint;

    use super::*;

    fn parse(html: &str) -> Vec<StructuralElement> {
        HtmlStructureParser::new().parse(html).unwrap()
    }

    fn outline(html: &str) -> Vec<(String, usize)> {
        parse(html).into_iter().map(|e| (e.tag, e.depth)).collect()
    }

    const BOX_SCORE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Lakers vs Celtics</title></head>
<body>
  <!-- generated -->
  <h1 class="headline">Final</h1>
  <table id="box"><tr><td data-stat="pts">102</td></tr></table>
</body>
</html>"#;

    #[test]
    fn test_document_order_and_depth() {
        let got = outline(BOX_SCORE);
        let tags: Vec<&str> = got.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            tags,
            ["html", "head", "title", "body", "h1", "table", "tbody", "tr", "td"]
        );
        assert_eq!(got[0].1, 0);
        assert_eq!(got[2], ("title".to_string(), 2));
        assert_eq!(got[8], ("td".to_string(), 5));
    }

    #[test]
    fn test_attribute_names_only() {
        let elements = parse(BOX_SCORE);
        let td = elements.iter().find(|e| e.tag == "td").unwrap();
        assert_eq!(
            td.attributes.iter().map(String::as_str).collect::<Vec<_>>(),
            ["data-stat"]
        );
    }

    #[test]
    fn test_uppercase_markup_is_lowercased() {
        let elements = parse("<DIV CLASS='x' ID=y>hi</DIV>");
        let div = elements.iter().find(|e| e.tag == "div").unwrap();
        assert!(div.attributes.contains("class"));
        assert!(div.attributes.contains("id"));
    }

    #[test]
    fn test_text_comments_and_values_do_not_change_fingerprint() {
        let edited = BOX_SCORE
            .replace("Final", "Final/OT")
            .replace("102", "110")
            .replace("headline", "headline big")
            .replace("<!-- generated -->", "<!-- regenerated at 10:04 -->");
        assert_eq!(fingerprint(&parse(BOX_SCORE)), fingerprint(&parse(&edited)));
    }

    #[test]
    fn test_added_nested_element_changes_fingerprint() {
        let edited = BOX_SCORE.replace(
            "<td data-stat=\"pts\">102</td>",
            "<td data-stat=\"pts\"><span>102</span></td>",
        );
        assert_ne!(fingerprint(&parse(BOX_SCORE)), fingerprint(&parse(&edited)));
    }

    #[test]
    fn test_empty_body_still_has_skeleton() {
        assert_eq!(
            outline(""),
            [
                ("html".to_string(), 0),
                ("head".to_string(), 1),
                ("body".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let html = format!("{}{}", "<div>".repeat(3_000), "</div>".repeat(3_000));
        let elements = parse(&html);
        assert!(elements.len() > 3_000);
    }
}
