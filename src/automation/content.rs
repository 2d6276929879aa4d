//! 页面内容提取
//!
//! 两步：页面内脚本只复制可见节点（跳过 display:none / 透明 / 零尺寸 / script / style），
//! 再在服务端按元素与属性白名单精简，去掉空标签并截断到上限，避免把整页 HTML 塞给模型。

use scraper::{ElementRef, Html, Node};

/// 在页面中执行：返回仅含可见节点的 HTML
pub const VISIBLE_DOM_SCRIPT: &str = r#"(() => {
  const hidden = (el) => {
    for (let e = el; e; e = e.parentElement) {
      if (!e.isConnected) return true;
      const s = window.getComputedStyle(e);
      if (s.display === 'none' || s.visibility === 'hidden' || s.visibility === 'collapse') return true;
      if (parseFloat(s.opacity) === 0) return true;
      const r = e.getBoundingClientRect();
      if (r.width === 0 && r.height === 0) return true;
    }
    return false;
  };
  const doc = document.implementation.createHTMLDocument('');
  for (const child of document.head.children) {
    if (child.tagName === 'TITLE' || child.tagName === 'META') doc.head.appendChild(child.cloneNode(true));
  }
  const copy = (src, dst) => {
    for (const child of src.childNodes) {
      if (child.nodeType === Node.ELEMENT_NODE) {
        if (['SCRIPT', 'STYLE', 'NOSCRIPT'].includes(child.tagName) || hidden(child)) continue;
        const el = doc.createElement(child.tagName);
        for (const a of child.attributes) el.setAttribute(a.name, a.value);
        dst.appendChild(el);
        copy(child, el);
      } else if (child.nodeType === Node.TEXT_NODE && child.textContent.trim()) {
        dst.appendChild(doc.createTextNode(child.textContent));
      }
    }
  };
  copy(document.body, doc.body);
  return doc.documentElement.outerHTML;
})()"#;

const ELEMENTS_TO_KEEP: &[&str] = &[
    "html", "head", "body", "title", "meta", "h1", "h2", "h3", "h4", "h5", "h6", "p", "div", "span",
    "article", "section", "main", "header", "footer", "nav", "ul", "ol", "li", "dl", "dt", "dd", "table",
    "tr", "td", "th", "thead", "tbody", "tfoot", "form", "input", "select", "option", "button", "textarea",
    "label", "a", "img", "aside", "figure", "figcaption", "code", "pre",
];

const ELEMENTS_TO_REMOVE: &[&str] = &[
    "script", "style", "noscript", "iframe", "canvas", "svg", "video", "audio", "track", "source", "object",
    "embed", "param", "link",
];

const ATTRIBUTES_TO_KEEP: &[&str] = &[
    "id", "class", "name", "type", "value", "href", "src", "alt", "title", "placeholder", "aria-label",
    "role", "data-testid", "content", "charset", "http-equiv",
];

const DATA_PREFIXES_TO_KEEP: &[&str] = &["data-id", "data-testid", "data-qa", "data-test", "data-cy"];

const META_NAMES_TO_KEEP: &[&str] = &["description", "keywords", "viewport", "author"];

/// 即使为空也保留
const KEEP_IF_EMPTY: &[&str] = &["html", "head", "body", "main", "header", "footer", "meta", "title"];

/// 带有这些属性的空标签也保留
const SIGNIFICANT_ATTRIBUTES: &[&str] = &["id", "href", "src", "role", "aria-label", "data-testid"];

const VOID_ELEMENTS: &[&str] = &["img", "input", "br", "hr", "meta"];

fn element_specific(element: &str, attr: &str) -> bool {
    let allowed: &[&str] = match element {
        "a" => &["href", "target", "rel"],
        "img" => &["src", "alt", "width", "height"],
        "input" => &["type", "name", "value", "placeholder", "required", "checked", "disabled"],
        "meta" => &["name", "content", "charset", "http-equiv"],
        _ => &[],
    };
    allowed.contains(&attr)
}

fn keep_attribute(element: &str, attr: &str) -> bool {
    ATTRIBUTES_TO_KEEP.contains(&attr)
        || element_specific(element, attr)
        || DATA_PREFIXES_TO_KEEP.iter().any(|p| attr.starts_with(p))
}

fn keep_meta(el: &ElementRef<'_>) -> bool {
    let v = el.value();
    match v.attr("name") {
        Some(name) => META_NAMES_TO_KEEP.contains(&name.to_ascii_lowercase().as_str()),
        None => v.attr("http-equiv").is_some() || v.attr("charset").is_some(),
    }
}

/// 白名单精简并截断到 max_chars 个字符（0 表示不截断）
pub fn simplify_html(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);
    let mut out = String::new();
    render(doc.root_element(), &mut out);
    truncate_chars(out, max_chars)
}

fn render(el: ElementRef<'_>, out: &mut String) {
    let name = el.value().name().to_ascii_lowercase();
    let name = name.as_str();
    if ELEMENTS_TO_REMOVE.contains(&name) || (name == "meta" && !keep_meta(&el)) {
        return;
    }

    let mut inner = String::new();
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            render(child_el, &mut inner);
        } else if let Node::Text(text) = child.value() {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !collapsed.is_empty() {
                escape_into(&mut inner, &collapsed, false);
            }
        }
    }

    // 不在白名单内的元素只保留其内容
    if !ELEMENTS_TO_KEEP.contains(&name) {
        out.push_str(&inner);
        return;
    }

    let attrs: Vec<(&str, &str)> = el
        .value()
        .attrs()
        .filter(|(attr, _)| keep_attribute(name, attr))
        .collect();

    let is_void = VOID_ELEMENTS.contains(&name);
    if inner.is_empty()
        && !is_void
        && !KEEP_IF_EMPTY.contains(&name)
        && !attrs.iter().any(|(a, _)| SIGNIFICANT_ATTRIBUTES.contains(a))
    {
        return;
    }

    out.push('<');
    out.push_str(name);
    for (attr, value) in attrs {
        out.push(' ');
        out.push_str(attr);
        out.push_str("=\"");
        escape_into(out, value, true);
        out.push('"');
    }
    out.push('>');
    if is_void {
        return;
    }
    out.push_str(&inner);
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn escape_into(out: &mut String, s: &str, attribute: bool) {
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn truncate_chars(s: String, max_chars: usize) -> String {
    if max_chars == 0 || s.chars().count() <= max_chars {
        return s;
    }
    let mut cut: String = s.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
