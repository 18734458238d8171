use mathdown_core::{
    export_html, Document, DocumentValue, ElementKind, ElementNode, ListKind, Marks, Node,
    TextNode, TextRole,
};

fn rich_document() -> Document {
    Document {
        children: vec![
            Node::Element(ElementNode {
                kind: ElementKind::Heading { level: 1 },
                children: vec![Node::text("Notes")],
            }),
            Node::Element(ElementNode {
                kind: ElementKind::Paragraph,
                children: vec![
                    Node::Text(TextNode {
                        text: "bold".to_string(),
                        marks: Marks {
                            bold: true,
                            ..Marks::default()
                        },
                        role: TextRole::Plain,
                    }),
                    Node::math("$E=mc^2$", true),
                    Node::Text(TextNode {
                        text: "link".to_string(),
                        marks: Marks {
                            link: Some("https://example.com".to_string()),
                            ..Marks::default()
                        },
                        role: TextRole::Plain,
                    }),
                ],
            }),
            Node::math("$$\\int_0^1 x\\,dx$$", false),
            Node::divider(),
            Node::image("https://example.com/a.png"),
            Node::Element(ElementNode {
                kind: ElementKind::List {
                    list: ListKind::Ordered,
                },
                children: vec![Node::Element(ElementNode {
                    kind: ElementKind::ListItem { indent: 2 },
                    children: vec![Node::text("item")],
                })],
            }),
            Node::Element(ElementNode {
                kind: ElementKind::CodeBlock {
                    language: Some("rust".to_string()),
                },
                children: vec![
                    Node::text("fn main() {"),
                    Node::line_break(),
                    Node::text("}"),
                ],
            }),
            Node::Element(ElementNode {
                kind: ElementKind::Quote,
                children: vec![Node::text("quoted")],
            }),
        ],
    }
}

#[test]
fn math_node_round_trips_through_json() {
    let value = DocumentValue::from_document(Document {
        children: vec![Node::paragraph(""), Node::math("$E=mc^2$", true)],
    });
    let json = value.to_json_pretty().unwrap();
    let back = DocumentValue::from_json_str(&json).unwrap();
    assert_eq!(back, value);

    // Node records carry their type tags and construct fields.
    assert!(json.contains("\"type\": \"math\""));
    assert!(json.contains("\"equation\": \"$E=mc^2$\""));
    assert!(json.contains("\"inline\": true"));
}

#[test]
fn full_document_round_trips_through_json() {
    let value = DocumentValue::from_document(rich_document());
    let json = value.to_json_pretty().unwrap();
    let back = DocumentValue::from_json_str(&json).unwrap();
    assert_eq!(back, value);
    assert_eq!(back.schema, "mathdown");
    assert_eq!(back.version, 1);
}

#[test]
fn envelope_fields_default_on_import() {
    let back = DocumentValue::from_json_str(r#"{ "document": { "children": [] } }"#).unwrap();
    assert_eq!(back.schema, "mathdown");
    assert_eq!(back.version, 1);
    assert!(back.document.children.is_empty());
}

#[test]
fn unselected_image_flag_is_not_persisted() {
    let value = DocumentValue::from_document(Document {
        children: vec![Node::image("https://example.com/a.png")],
    });
    let json = value.to_json_pretty().unwrap();
    assert!(!json.contains("selected"));
}

#[test]
fn html_export_marks_constructs_for_reimport() {
    let html = export_html(&rich_document());

    assert!(html.contains("<h1>Notes</h1>"));
    assert!(html.contains(
        "<span data-math=\"true\" data-math-inline=\"true\">$E=mc^2$</span>"
    ));
    assert!(html.contains("data-math-inline=\"false\""));
    assert!(html.contains("<strong>bold</strong>"));
    assert!(html.contains("<a href=\"https://example.com\">link</a>"));
    assert!(html.contains("<hr>"));
    assert!(html.contains(
        "<figure data-image-container=\"true\"><img src=\"https://example.com/a.png\"></figure>"
    ));
    assert!(html.contains("<ol><li data-indent=\"2\">item</li></ol>"));
    assert!(html.contains("<pre><code class=\"language-rust\">fn main() {<br>}</code></pre>"));
    assert!(html.contains("<blockquote>quoted</blockquote>"));
}

#[test]
fn html_export_escapes_text_and_attributes() {
    let doc = Document {
        children: vec![
            Node::Element(ElementNode {
                kind: ElementKind::Paragraph,
                children: vec![Node::text("a < b & c > d")],
            }),
            Node::image("https://example.com/?a=1&b=\"2\""),
        ],
    };
    let html = export_html(&doc);
    assert!(html.contains("<p>a &lt; b &amp; c &gt; d</p>"));
    assert!(html.contains("src=\"https://example.com/?a=1&amp;b=&quot;2&quot;\""));
}

#[test]
fn editable_nodes_export_as_their_rendered_form() {
    let doc = Document {
        children: vec![
            Node::Element(ElementNode {
                kind: ElementKind::Paragraph,
                children: vec![Node::math_source("x^2")],
            }),
            Node::Element(ElementNode {
                kind: ElementKind::MathSourceBlock,
                children: vec![Node::text("y^2")],
            }),
        ],
    };
    let html = export_html(&doc);
    assert!(html.contains(
        "<span data-math=\"true\" data-math-inline=\"true\">$x^2$</span>"
    ));
    assert!(html.contains(
        "<span data-math=\"true\" data-math-inline=\"false\">$$y^2$$</span>"
    ));
}
