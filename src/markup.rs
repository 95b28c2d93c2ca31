//! Rewriting of model-produced HTML.
//!
//! Model output is untrusted free-form text. It is parsed with html5ever (through
//! `scraper`), which recovers from any malformed input, and serialized back one
//! element at a time. Every element goes through the same policy: links are
//! folded back into the fictional path space, `<img>` sources are pointed at the
//! image route, and anything that runs code or leaves the fiction is dropped.
//! Nothing here fails; problems are reported as [`MarkupWarning`]s.

use std::collections::BTreeSet;

use scraper::{ElementRef, Html, Node};
use serde::Serialize;
use url::Url;

use crate::{
    imagery::{description_from_filename, image_url, normalize_description},
    models::{sanitize_segment, PagePath},
};

const GENERIC_IMAGE_DESCRIPTION: &str = "abstract illustration";
const INTERNAL_HOST: &str = "alt-internet.invalid";
const MAX_PARSE_WARNINGS: usize = 8;
const EXCERPT_LEN: usize = 600;

const DROPPED_ELEMENTS: [&str; 10] =
    ["script", "base", "link", "iframe", "frame", "frameset", "object", "embed", "applet", "portal"];
const VOID_ELEMENTS: [&str; 14] =
    ["area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr"];
/// Attributes carrying a URL; their value is mapped into the path space.
const URL_ATTRIBUTES: [&str; 7] = ["href", "src", "action", "formaction", "poster", "cite", "background"];
/// Attributes with no in-fiction meaning.
const STRIPPED_ATTRIBUTES: [&str; 5] = ["srcset", "imagesrcset", "ping", "target", "formtarget"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkupWarning {
    Malformed { message: String },
    UnsafeLink { target: String },
    ElementRemoved { tag: String },
    HandlerRemoved { attribute: String },
    MissingImageDescription,
    LeadingCommentary { bytes: usize },
    MissingDocument,
    Truncated,
}

pub struct RewriteContext<'a> {
    pub scenario_id: &'a str,
    pub current: &'a PagePath,
}

#[derive(Debug, Default)]
pub struct Rewritten {
    pub html: String,
    pub links: BTreeSet<String>,
    pub image_descriptions: Vec<String>,
    pub warnings: Vec<MarkupWarning>,
    pub title: Option<String>,
    /// Leading visible text of the page, whitespace collapsed.
    pub excerpt: String,
}

/// Parses `raw` and serializes it back as a complete document.
pub fn rewrite(raw: &str, ctx: &RewriteContext<'_>) -> Rewritten {
    let document = Html::parse_document(raw);
    let mut writer = Writer { scenario_id: ctx.scenario_id, current: ctx.current, out: Rewritten::default() };

    let mut reported = BTreeSet::new();
    for message in &document.errors {
        if reported.len() >= MAX_PARSE_WARNINGS {
            break;
        }
        if reported.insert(message.to_string()) {
            writer.out.warnings.push(MarkupWarning::Malformed { message: message.to_string() });
        }
    }

    writer.out.html.push_str("<!DOCTYPE html>\n");
    writer.element(document.root_element());
    writer.out
}

struct Writer<'a> {
    scenario_id: &'a str,
    current: &'a PagePath,
    out: Rewritten,
}

impl Writer<'_> {
    fn element(&mut self, el: ElementRef<'_>) {
        let name = el.value().name();
        if DROPPED_ELEMENTS.contains(&name) || is_meta_refresh(el) {
            self.out.warnings.push(MarkupWarning::ElementRemoved { tag: name.to_string() });
            return;
        }

        let attributes = if name == "img" { self.image_attributes(el) } else { self.attributes(el, &[]) };
        self.out.html.push('<');
        self.out.html.push_str(name);
        for (key, value) in &attributes {
            self.out.html.push(' ');
            self.out.html.push_str(key);
            self.out.html.push_str("=\"");
            self.out.html.push_str(&escape_attr(value));
            self.out.html.push('"');
        }
        self.out.html.push('>');
        if VOID_ELEMENTS.contains(&name) {
            return;
        }

        for child in el.children() {
            match child.value() {
                Node::Text(text) => {
                    if name == "style" {
                        self.out.html.push_str(text);
                    } else {
                        self.out.html.push_str(&escape_text(text));
                        self.collect_text(name, text);
                    }
                }
                Node::Comment(comment) => {
                    self.out.html.push_str("<!--");
                    self.out.html.push_str(comment);
                    self.out.html.push_str("-->");
                }
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.element(child);
                    }
                }
                _ => {}
            }
        }

        self.out.html.push_str("</");
        self.out.html.push_str(name);
        self.out.html.push('>');
    }

    /// Applies the attribute policy, skipping the names in `skip`. Output is
    /// sorted by name so serialization does not depend on parser internals.
    fn attributes(&mut self, el: ElementRef<'_>, skip: &[&str]) -> Vec<(String, String)> {
        let tag = el.value().name();
        let mut kept = Vec::new();
        for (key, value) in el.value().attrs() {
            let key = key.to_ascii_lowercase();
            if skip.contains(&key.as_str()) || STRIPPED_ATTRIBUTES.contains(&key.as_str()) {
                continue;
            }
            if key.starts_with("on") {
                self.out.warnings.push(MarkupWarning::HandlerRemoved { attribute: key });
                continue;
            }
            if URL_ATTRIBUTES.contains(&key.as_str()) {
                let navigates = matches!(
                    (tag, key.as_str()),
                    ("a" | "area", "href") | ("form", "action") | (_, "formaction")
                );
                let target = self.link(value, navigates);
                kept.push((key, target));
                continue;
            }
            kept.push((key, value.to_string()));
        }
        kept.sort();
        kept
    }

    fn image_attributes(&mut self, el: ElementRef<'_>) -> Vec<(String, String)> {
        let value = el.value();
        let from_src = value
            .attr("src")
            .filter(|src| !src.trim_start().to_ascii_lowercase().starts_with("data:"))
            .map(description_from_filename)
            .filter(|d| !d.is_empty());
        let from_alt = || value.attr("alt").map(normalize_description).filter(|d| !d.is_empty());

        let description = match from_src.or_else(from_alt) {
            Some(d) => d,
            None => {
                self.out.warnings.push(MarkupWarning::MissingImageDescription);
                GENERIC_IMAGE_DESCRIPTION.to_string()
            }
        };
        let alt = value
            .attr("alt")
            .filter(|alt| !alt.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| description.clone());

        let mut attributes = vec![
            ("src".to_string(), image_url(self.scenario_id, &description)),
            ("alt".to_string(), alt),
        ];
        attributes.extend(self.attributes(el, &["src", "alt"]));
        self.out.image_descriptions.push(description);
        attributes
    }

    fn link(&mut self, target: &str, navigates: bool) -> String {
        match normalize_link(target, self.current) {
            Ok(path) => {
                if navigates && path.starts_with('/') {
                    self.out.links.insert(strip_suffix(&path).to_string());
                }
                path
            }
            Err(warning) => {
                self.out.warnings.push(warning);
                "#".to_string()
            }
        }
    }

    fn collect_text(&mut self, parent: &str, text: &str) {
        match parent {
            "title" => {
                let title = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if self.out.title.is_none() && !title.is_empty() {
                    self.out.title = Some(title);
                }
            }
            "noscript" | "textarea" => {}
            _ => {
                for word in text.split_whitespace() {
                    if self.out.excerpt.len() + word.len() + 1 > EXCERPT_LEN {
                        break;
                    }
                    if !self.out.excerpt.is_empty() {
                        self.out.excerpt.push(' ');
                    }
                    self.out.excerpt.push_str(word);
                }
            }
        }
    }
}

fn is_meta_refresh(el: ElementRef<'_>) -> bool {
    el.value().name() == "meta"
        && el
            .value()
            .attr("http-equiv")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh"))
}

/// Maps a link target onto a root-relative path inside the fictional internet.
/// Relative targets resolve against `current`; foreign hosts become
/// `/<tld>/<domain>/...`; any scheme other than http(s) is refused.
pub fn normalize_link(target: &str, current: &PagePath) -> Result<String, MarkupWarning> {
    let target = target.trim();
    if target.starts_with('#') {
        return Ok(target.to_string());
    }
    let unsafe_link = || MarkupWarning::UnsafeLink { target: target.to_string() };

    let base = Url::parse(&format!("http://{INTERNAL_HOST}{current}")).map_err(|_| unsafe_link())?;
    let resolved = base.join(target).map_err(|_| unsafe_link())?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return Err(unsafe_link());
    }

    let mut segments = match resolved.host_str() {
        Some(INTERNAL_HOST) => Vec::new(),
        Some(host) => host_segments(host),
        None => return Err(unsafe_link()),
    };
    for raw in resolved.path_segments().into_iter().flatten() {
        let decoded = urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string());
        if let Some(segment) = sanitize_segment(&decoded) {
            segments.push(segment);
        }
    }

    let mut path = format!("/{}", segments.join("/"));
    if let Some(query) = resolved.query() {
        path.push('?');
        path.push_str(query);
    }
    if let Some(fragment) = resolved.fragment() {
        path.push('#');
        path.push_str(fragment);
    }
    Ok(path)
}

fn host_segments(host: &str) -> Vec<String> {
    let host = host.strip_prefix("www.").unwrap_or(host);
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.split_last() {
        Some((tld, rest)) if !rest.is_empty() => {
            [tld.to_string(), rest.join(".")].into_iter().filter_map(|s| sanitize_segment(&s)).collect()
        }
        Some((only, _)) => sanitize_segment(only).into_iter().collect(),
        None => Vec::new(),
    }
}

fn strip_suffix(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

pub fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_text(value: &str) -> String {
    value.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagery::Fingerprint;
    use pretty_assertions::assert_eq;

    fn run(raw: &str) -> Rewritten {
        let current = PagePath::parse("com/news/main");
        rewrite(raw, &RewriteContext { scenario_id: "retrofuturist", current: &current })
    }

    fn count(out: &Rewritten, pred: impl Fn(&MarkupWarning) -> bool) -> usize {
        out.warnings.iter().filter(|w| pred(w)).count()
    }

    #[test]
    fn links_fold_into_the_path_space() {
        let current = PagePath::parse("com/news/main");
        assert_eq!(normalize_link("/org/library", &current).unwrap(), "/org/library");
        assert_eq!(normalize_link("//com/shop", &current).unwrap(), "/com/shop");
        assert_eq!(normalize_link("weather", &current).unwrap(), "/com/news/weather");
        assert_eq!(normalize_link("../../gov/census", &current).unwrap(), "/gov/census");
        assert_eq!(
            normalize_link("https://www.Atomic-Times.com/front/page?ed=1#top", &current).unwrap(),
            "/com/atomic-times/front/page?ed=1#top"
        );
        assert_eq!(normalize_link("http://localhost", &current).unwrap(), "/localhost");
        assert_eq!(normalize_link("#section", &current).unwrap(), "#section");
        assert_eq!(normalize_link("", &current).unwrap(), "/com/news/main");
        assert_eq!(normalize_link("/a b/<c>", &current).unwrap(), "/a-b/c");
    }

    #[test]
    fn script_like_schemes_are_neutralized() {
        let current = PagePath::home();
        for target in ["javascript:alert(1)", "mailto:ed@atom.net", "data:text/html,hi", "ftp://atom.net/x"] {
            assert!(matches!(normalize_link(target, &current), Err(MarkupWarning::UnsafeLink { .. })));
        }
    }

    #[test]
    fn anchors_are_rewritten_and_collected() {
        let out = run(r#"<p>Read <a href="https://www.atom.com/today" target="_blank">today</a> or <A HREF='sports'>sports</A>.</p>"#);
        assert!(out
            .html
            .contains(r#"<p>Read <a href="/com/atom/today">today</a> or <a href="/com/news/sports">sports</a>.</p>"#));
        let links: Vec<&str> = out.links.iter().map(String::as_str).collect();
        assert_eq!(links, ["/com/atom/today", "/com/news/sports"]);
        assert_eq!(count(&out, |w| matches!(w, MarkupWarning::UnsafeLink { .. })), 0);
    }

    #[test]
    fn stray_quotes_do_not_hide_links() {
        let out = run(r#"<p title=it's>Visit <a href="https://real.example.com/">real</a> it's here</p>"#);
        assert!(!out.html.contains("https://"));
        assert!(out.html.contains(r#"<a href="/com/real.example">real</a>"#));
        assert!(out.links.contains("/com/real.example"));
    }

    #[test]
    fn escape_hatches_are_removed() {
        let out = run(concat!(
            r#"<base href="https://x.example/">"#,
            r#"<meta http-equiv="refresh" content="0;url=https://x.example/">"#,
            r#"<p onclick="location='https://x.example/'">tap</p>"#,
            r#"<iframe src="https://x.example/"></iframe>"#,
            r#"<object data="https://x.example/o"></object><embed src="https://x.example/e">"#,
            r#"<form><button formaction="https://x.example/go">Go</button></form>"#,
        ));

        assert!(!out.html.contains("x.example"), "{}", out.html);
        assert!(out.html.contains(r#"<button formaction="/example/x/go">Go</button>"#));
        assert!(out.links.contains("/example/x/go"));
        for tag in ["base", "meta", "iframe", "object", "embed"] {
            assert!(
                out.warnings.contains(&MarkupWarning::ElementRemoved { tag: tag.into() }),
                "{tag} not reported"
            );
        }
        assert!(out.warnings.contains(&MarkupWarning::HandlerRemoved { attribute: "onclick".into() }));
    }

    #[test]
    fn images_point_at_the_image_route() {
        let out = run(r#"<img src="chrome-rocket-diner-at-dusk.jpg" srcset="a.jpg 2x">"#);
        let fingerprint = Fingerprint::compute("retrofuturist", "chrome rocket diner at dusk");
        assert!(out.html.contains(&format!(
            r#"<img src="/_image/retrofuturist/{fingerprint}?description=chrome%20rocket%20diner%20at%20dusk" alt="chrome rocket diner at dusk">"#
        )));
        assert!(!out.html.contains("srcset"));
        assert_eq!(out.image_descriptions, ["chrome rocket diner at dusk"]);
    }

    #[test]
    fn images_fall_back_to_alt_then_generic() {
        let out = run(r#"<img src="data:image/png;base64,AAAA" alt="Atomic Vacuum Cleaner"/><img>"#);
        assert_eq!(out.image_descriptions, ["atomic vacuum cleaner", GENERIC_IMAGE_DESCRIPTION]);
        assert_eq!(count(&out, |w| *w == MarkupWarning::MissingImageDescription), 1);
        assert!(out.html.contains(r#"alt="Atomic Vacuum Cleaner""#));
        assert!(!out.html.contains("data:"));
    }

    #[test]
    fn malformed_markup_is_recovered() {
        let out = run(r#"<html><body><h1>News</h1><a href="/com/x">ok</a> 3 < 4 <img src="half-written"#);
        assert!(out.html.starts_with("<!DOCTYPE html>\n<html>"));
        assert!(out.html.contains(r#"<h1>News</h1><a href="/com/x">ok</a> 3 &lt; 4 "#));
        assert!(out.html.ends_with("</body></html>"));
        assert!(count(&out, |w| matches!(w, MarkupWarning::Malformed { .. })) > 0);
        assert_eq!(out.links.len(), 1);
    }

    #[test]
    fn scripts_are_dropped_and_styles_kept_verbatim() {
        let out = run("<style>a > b { color: red }</style><script>if (a<b) go()</script><p>hi</p>");
        assert!(out.html.contains("<style>a > b { color: red }</style>"));
        assert!(out.html.contains("<p>hi</p>"));
        assert!(!out.html.contains("go()"));
        assert!(out.warnings.contains(&MarkupWarning::ElementRemoved { tag: "script".into() }));
    }

    #[test]
    fn forms_stay_inside_the_fiction() {
        let out = run(r#"<form action="https://search.atom.net/find" method="get"><input name="q"></form>"#);
        assert!(out.html.contains(r#"<form action="/net/search.atom/find" method="get"><input name="q"></form>"#));
    }

    #[test]
    fn title_and_excerpt_are_collected() {
        let out = run("<title> Atomnet   Daily </title><style>p{}</style><h1>Rocket prices</h1><p>fall   again</p>");
        assert_eq!(out.title.as_deref(), Some("Atomnet Daily"));
        assert_eq!(out.excerpt, "Rocket prices fall again");
    }
}
