//! Bidirectional markup translation between Matrix HTML and the provider's
//! plaintext-with-delimiters dialect (WhatsApp-style `*bold*` / `_italic_`).
//!
//! Remote→Matrix is pattern substitution; Matrix→remote walks the HTML tree
//! of a formatted body and flattens it back to delimited plain text.

use std::sync::OnceLock;

use regex::Regex;

/// Compiled substitution patterns for the remote→Matrix direction.
struct RemotePatterns {
    italic: Regex,
    bold: Regex,
    strike: Regex,
    code_block: Regex,
}

fn remote_patterns() -> &'static RemotePatterns {
    static PATTERNS: OnceLock<RemotePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| RemotePatterns {
        // Each delimiter pair requires a boundary character (or string edge)
        // on both sides so delimiters inside words are left alone.
        italic: Regex::new(r"([\s>~*]|^)_(.+?)_([^a-zA-Z\d]|$)").expect("static pattern compiles"),
        bold: Regex::new(r"([\s>_~]|^)\*(.+?)\*([^a-zA-Z\d]|$)").expect("static pattern compiles"),
        strike: Regex::new(r"([\s>_*]|^)~(.+?)~([^a-zA-Z\d]|$)").expect("static pattern compiles"),
        code_block: Regex::new(r"(?s)```(.+?)```").expect("static pattern compiles"),
    })
}

/// Convert a remote plain-text message to Matrix HTML.
///
/// Returns `(html, plain)`. `html` is `None` when no substitution fired,
/// signalling the caller to send the message as unformatted text.
pub fn remote_to_matrix(text: &str) -> (Option<String>, String) {
    let patterns = remote_patterns();
    let html = patterns
        .italic
        .replace_all(text, "${1}<em>${2}</em>${3}")
        .into_owned();
    let html = patterns
        .bold
        .replace_all(&html, "${1}<strong>${2}</strong>${3}")
        .into_owned();
    let html = patterns
        .strike
        .replace_all(&html, "${1}<del>${2}</del>${3}")
        .into_owned();

    // Line breaks become <br/> outside fenced code only; fenced content
    // keeps its raw line structure.
    let mut out = String::new();
    let mut fenced = false;
    let mut last = 0;
    for caps in patterns.code_block.captures_iter(&html) {
        let code = caps.get(0).expect("group 0 always present");
        let inner = &caps[1];
        out.push_str(&html[last..code.start()].replace('\n', "<br/>"));
        if inner.contains('\n') {
            out.push_str("<pre><code>");
            out.push_str(inner);
            out.push_str("</code></pre>");
        } else {
            out.push_str("<code>");
            out.push_str(inner);
            out.push_str("</code>");
        }
        fenced = true;
        last = code.end();
    }
    out.push_str(&html[last..].replace('\n', "<br/>"));

    if fenced || html != text {
        (Some(out), text.to_owned())
    } else {
        (None, text.to_owned())
    }
}

/// Convert Matrix HTML (a formatted message body) to the remote dialect.
///
/// Unrecognized tags pass their children through unchanged, so plain text
/// and unknown markup survive the walk intact.
pub fn matrix_to_remote(html: &str) -> String {
    let nodes = parse_nodes(html);
    let mut out = String::new();
    for node in &nodes {
        out.push_str(&render(node));
    }
    out.trim_end().to_owned()
}

/// A node in the parsed HTML fragment.
enum Node {
    Text(String),
    Element {
        tag: String,
        href: Option<String>,
        children: Vec<Node>,
    },
}

/// Tags that never carry children.
fn is_void(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img")
}

/// Parse an HTML fragment into a node tree.
///
/// Deliberately forgiving: mismatched close tags pop to the nearest matching
/// open tag, stray close tags are dropped, and a bare `<` is literal text.
fn parse_nodes(input: &str) -> Vec<Node> {
    // (tag, href, children) per open element; index 0 is the root.
    let mut stack: Vec<(String, Option<String>, Vec<Node>)> =
        vec![(String::new(), None, Vec::new())];
    let mut rest = input;

    while let Some(lt) = rest.find('<') {
        let (text, after) = rest.split_at(lt);
        if !text.is_empty() {
            if let Some(top) = stack.last_mut() {
                top.2.push(Node::Text(decode_entities(text)));
            }
        }
        let Some(gt) = after.find('>') else {
            // Unterminated tag: treat the remainder as literal text.
            if let Some(top) = stack.last_mut() {
                top.2.push(Node::Text(decode_entities(after)));
            }
            rest = "";
            break;
        };
        let tag_body = after.get(1..gt).unwrap_or_default();
        rest = after.get(gt.saturating_add(1)..).unwrap_or_default();

        if let Some(name) = tag_body.strip_prefix('/') {
            close_tag(&mut stack, name.trim().to_ascii_lowercase().as_str());
        } else {
            let body = tag_body.trim_end_matches('/').trim();
            let name = body
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            let href = extract_href(body);
            if is_void(&name) || tag_body.ends_with('/') {
                if let Some(top) = stack.last_mut() {
                    top.2.push(Node::Element {
                        tag: name,
                        href,
                        children: Vec::new(),
                    });
                }
            } else {
                stack.push((name, href, Vec::new()));
            }
        }
    }
    if !rest.is_empty() {
        if let Some(top) = stack.last_mut() {
            top.2.push(Node::Text(decode_entities(rest)));
        }
    }

    // Fold any still-open elements into their parents.
    while stack.len() > 1 {
        fold_top(&mut stack);
    }
    stack.pop().map(|(_, _, children)| children).unwrap_or_default()
}

/// Pop the top open element and attach it to its parent as a child.
fn fold_top(stack: &mut Vec<(String, Option<String>, Vec<Node>)>) {
    if let Some((tag, href, children)) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.2.push(Node::Element {
                tag,
                href,
                children,
            });
        }
    }
}

/// Handle a close tag: fold elements until the matching open tag is closed.
fn close_tag(stack: &mut Vec<(String, Option<String>, Vec<Node>)>, name: &str) {
    let Some(pos) = stack.iter().rposition(|(tag, _, _)| tag == name) else {
        return;
    };
    if pos == 0 {
        return;
    }
    while stack.len() > pos {
        fold_top(stack);
    }
}

/// Pull an `href` attribute value out of a tag body, if present.
fn extract_href(tag_body: &str) -> Option<String> {
    let idx = tag_body.find("href=")?;
    let value = tag_body.get(idx.saturating_add(5)..)?;
    let mut chars = value.chars();
    match chars.next() {
        Some(quote @ ('"' | '\'')) => {
            let inner = chars.as_str();
            inner.find(quote).map(|end| {
                decode_entities(inner.get(..end).unwrap_or_default())
            })
        }
        Some(first) => {
            let mut out = String::new();
            out.push(first);
            out.extend(chars.take_while(|c| !c.is_whitespace()));
            Some(out)
        }
        None => None,
    }
}

/// Decode the HTML entities Matrix clients commonly emit.
fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Render a node to the remote dialect.
fn render(node: &Node) -> String {
    let (tag, href, children) = match node {
        Node::Text(text) => return text.clone(),
        Node::Element {
            tag,
            href,
            children,
        } => (tag.as_str(), href, children),
    };
    let inner: String = children.iter().map(render).collect();
    match tag {
        "b" | "strong" => format!("*{inner}*"),
        "i" | "em" => format!("_{inner}_"),
        "del" | "s" | "strike" => format!("~{inner}~"),
        "code" => format!("```{inner}```"),
        "pre" => {
            // <pre><code>...</code></pre> must not double-wrap.
            if let [Node::Element {
                tag: child_tag,
                children: grandchildren,
                ..
            }] = children.as_slice()
            {
                if child_tag == "code" {
                    let code: String = grandchildren.iter().map(render).collect();
                    return format!("```{code}```");
                }
            }
            format!("```{inner}```")
        }
        "a" => match href {
            Some(url) if url != &inner => format!("{inner} ({url})"),
            _ => inner,
        },
        "blockquote" => inner
            .trim()
            .lines()
            .map(|line| format!("> {line}"))
            .collect::<Vec<_>>()
            .join("\n"),
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = tag.get(1..).and_then(|n| n.parse::<usize>().ok()).unwrap_or(1);
            format!("{} {inner}", "#".repeat(level))
        }
        "br" => "\n".to_owned(),
        "p" | "div" => format!("{inner}\n"),
        _ => inner,
    }
}
