//! Exported rendering form: an HTML fragment in which recognized constructs
//! carry marker attributes, so a consumer can reconstruct the node types on
//! re-import.

use crate::core::{Document, ElementKind, ListKind, Node, TextNode, TextRole, VoidKind, VoidNode};
use crate::plugin::rendered_inline_from_source;

pub fn export_html(doc: &Document) -> String {
    let mut out = String::new();
    for node in &doc.children {
        write_node(&mut out, node);
    }
    out
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Text(text) => write_text(out, text),
        Node::Void(void) => write_void(out, void),
        Node::Element(el) => {
            let (open, close) = element_tags(&el.kind);
            out.push_str(&open);
            if matches!(el.kind, ElementKind::MathSourceBlock) {
                // An editable block exports as its rendered form.
                let content = crate::core::inline_text_content(&el.children);
                write_math(out, &format!("$${content}$$"), false);
            } else {
                for child in &el.children {
                    write_node(out, child);
                }
            }
            out.push_str(&close);
        }
    }
}

fn element_tags(kind: &ElementKind) -> (String, String) {
    match kind {
        ElementKind::Paragraph => ("<p>".to_string(), "</p>".to_string()),
        ElementKind::Heading { level } => {
            let level = (*level).clamp(1, 6);
            (format!("<h{level}>"), format!("</h{level}>"))
        }
        ElementKind::Quote => ("<blockquote>".to_string(), "</blockquote>".to_string()),
        ElementKind::List {
            list: ListKind::Bulleted,
        } => ("<ul>".to_string(), "</ul>".to_string()),
        ElementKind::List {
            list: ListKind::Ordered,
        } => ("<ol>".to_string(), "</ol>".to_string()),
        ElementKind::ListItem { indent } => {
            if *indent > 0 {
                (format!("<li data-indent=\"{indent}\">"), "</li>".to_string())
            } else {
                ("<li>".to_string(), "</li>".to_string())
            }
        }
        ElementKind::CodeBlock { language } => {
            let open = match language {
                Some(language) => format!(
                    "<pre><code class=\"language-{}\">",
                    escape_attr(language)
                ),
                None => "<pre><code>".to_string(),
            };
            (open, "</code></pre>".to_string())
        }
        ElementKind::MathSourceBlock => (String::new(), String::new()),
    }
}

fn write_text(out: &mut String, text: &TextNode) {
    if text.role == TextRole::MathSource {
        // An inline editable exports as its rendered form.
        if let Node::Void(VoidNode {
            kind: VoidKind::Math { equation, inline },
        }) = rendered_inline_from_source(&text.text)
        {
            write_math(out, &equation, inline);
        }
        return;
    }

    let mut open = String::new();
    let mut close = String::new();
    if let Some(url) = &text.marks.link {
        open.push_str(&format!("<a href=\"{}\">", escape_attr(url)));
        close.insert_str(0, "</a>");
    }
    if text.marks.bold {
        open.push_str("<strong>");
        close.insert_str(0, "</strong>");
    }
    if text.marks.italic {
        open.push_str("<em>");
        close.insert_str(0, "</em>");
    }
    if text.marks.code {
        open.push_str("<code>");
        close.insert_str(0, "</code>");
    }

    out.push_str(&open);
    out.push_str(&escape_text(&text.text));
    out.push_str(&close);
}

fn write_void(out: &mut String, void: &VoidNode) {
    match &void.kind {
        VoidKind::Math { equation, inline } => write_math(out, equation, *inline),
        VoidKind::Image { src, .. } => {
            out.push_str(&format!(
                "<figure data-image-container=\"true\"><img src=\"{}\"></figure>",
                escape_attr(src)
            ));
        }
        VoidKind::Divider => out.push_str("<hr>"),
        VoidKind::LineBreak => out.push_str("<br>"),
    }
}

fn write_math(out: &mut String, equation: &str, inline: bool) {
    out.push_str(&format!(
        "<span data-math=\"true\" data-math-inline=\"{inline}\">{}</span>",
        escape_text(equation)
    ));
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}
