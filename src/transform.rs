//! link rewriting for mirrored html and css.
//!
//! every url a document references is re-rooted under the mirror so that
//! following it lands back on this proxy. there is no html or css parser here:
//! each rule is a regex over the raw bytes, run as its own pass over the whole
//! document, and the passes run in a fixed order.
//!
//! the order matters because passes feed each other. a same-directory value
//! `img.png` on `/a/b/page.html` first becomes `/a/b/img.png`, and the later
//! root-relative pass turns that into `/<base host>/a/b/img.png`. absolute
//! urls go last, since `/<their host>/...` would otherwise be picked up by the
//! root-relative pass as a path on the base host.
//!
//! rewriting is not idempotent. feed each fetched document through exactly once.

use crate::util::Result;
use log::debug;
use regex::bytes::{Captures, Regex};
use url::Url;

/// bytes that end an url value: quotes, tag close, blanks and `)`
const VALUE: &str = r#"[^"'> \t)]"#;

/// where an url reference appears in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// `src=`, `href=`, `action=`, `url=`, `background=` attributes
    Tag,
    /// `@import "..."`
    CssImport,
    /// `url(...)`
    CssUrl,
}

impl Context {
    fn pattern(self) -> &'static str {
        match self {
            Context::Tag => {
                r#"\b(?P<tag>src|href|action|url|background)(?P<equals>[\t ]*=[\t ]*)(?P<quote>["']?)"#
            }
            Context::CssImport => r#"@import(?P<spacing>[\t ]+)(?P<quote>["']?)"#,
            Context::CssUrl => r#"\burl\((?P<quote>["']?)"#,
        }
    }

    /// re-emits everything the context matched ahead of the url itself
    fn write_lead(self, caps: &Captures<'_>, out: &mut Vec<u8>) {
        match self {
            Context::Tag => {
                out.extend_from_slice(group(caps, "tag"));
                out.extend_from_slice(group(caps, "equals"));
            }
            Context::CssImport => {
                out.extend_from_slice(b"@import");
                out.extend_from_slice(group(caps, "spacing"));
            }
            Context::CssUrl => out.extend_from_slice(b"url("),
        }
        out.extend_from_slice(group(caps, "quote"));
    }
}

/// the kinds of url reference, in the order their passes run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// `img.png`: anchored under the accessed directory
    SameDirectory,
    /// `../img.png`, `./img.png`
    Traversal,
    /// `/img.png`: re-rooted under the base host
    RootRelative,
    /// a bare `/`
    RootDirectory,
    /// `//host/path`, `http://host/path`, `https://host/path`
    Absolute,
}

impl Shape {
    pub const ORDER: [Shape; 5] = [
        Shape::SameDirectory,
        Shape::Traversal,
        Shape::RootRelative,
        Shape::RootDirectory,
        Shape::Absolute,
    ];

    fn pattern(self) -> String {
        match self {
            Shape::SameDirectory => format!("(?P<url>{VALUE}+)"),
            Shape::Traversal => format!(r"(?P<relative>\.\.?)/(?P<url>{VALUE}*)"),
            Shape::RootRelative => format!("/(?P<url>{VALUE}*)"),
            Shape::RootDirectory => "(?P<slash>/)".to_string(),
            Shape::Absolute => format!("(?:https?:)?//(?P<url>{VALUE}+)"),
        }
    }

    fn contexts(self) -> &'static [Context] {
        match self {
            Shape::RootDirectory => &[Context::Tag],
            _ => &[Context::Tag, Context::CssImport, Context::CssUrl],
        }
    }

    /// the checks a regex without look-around cannot express
    fn accepts(self, caps: &Captures<'_>, haystack: &[u8]) -> bool {
        match self {
            Shape::SameDirectory | Shape::Traversal | Shape::RootRelative => {
                !is_excluded_start(group(caps, "url"))
            }
            Shape::RootDirectory => {
                let Some(slash) = caps.name("slash") else {
                    return false;
                };
                let from_slash = &haystack[slash.start()..];
                // `//` is a scheme-relative url, unless it is the `//>` of `src=/` in `<img src=//>`
                if from_slash.starts_with(b"//") && from_slash.get(2) != Some(&b'>') {
                    return false;
                }
                haystack[slash.end()..]
                    .iter()
                    .find(|b| !matches!(**b, b' ' | b'\t' | b'\n'))
                    .map_or(false, |b| matches!(*b, b'"' | b'\'' | b')' | b'>' | b'/'))
            }
            Shape::Absolute => true,
        }
    }

    fn write_target(self, caps: &Captures<'_>, ctx: &RewriteContext, out: &mut Vec<u8>) {
        match self {
            Shape::SameDirectory => {
                out.extend_from_slice(ctx.accessed_dir.as_bytes());
                out.extend_from_slice(group(caps, "url"));
            }
            Shape::Traversal => {
                out.extend_from_slice(ctx.accessed_dir.as_bytes());
                out.push(b'/');
                out.extend_from_slice(group(caps, "relative"));
                out.push(b'/');
                out.extend_from_slice(group(caps, "url"));
            }
            Shape::RootRelative => {
                write_base(ctx, out);
                out.extend_from_slice(group(caps, "url"));
            }
            Shape::RootDirectory => write_base(ctx, out),
            Shape::Absolute => {
                out.push(b'/');
                out.extend_from_slice(group(caps, "url"));
            }
        }
    }
}

fn write_base(ctx: &RewriteContext, out: &mut Vec<u8>) {
    out.push(b'/');
    out.extend_from_slice(ctx.base_host.as_bytes());
    out.push(b'/');
}

fn group<'h>(caps: &Captures<'h>, name: &str) -> &'h [u8] {
    caps.name(name).map_or(&[][..], |m| m.as_bytes())
}

fn starts_with_ignore_case(value: &[u8], prefix: &[u8]) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// values left to a later pass: rooted paths, absolute urls and nested `url(`
fn is_excluded_start(value: &[u8]) -> bool {
    value.starts_with(b"/")
        || starts_with_ignore_case(value, b"http://")
        || starts_with_ignore_case(value, b"https://")
        || starts_with_ignore_case(value, b"url(")
}

/// per-document inputs of a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteContext {
    pub base_host: String,
    pub accessed_url: String,
    /// directory part of the accessed url's path, always ending in `/`
    pub accessed_dir: String,
}

impl RewriteContext {
    /// the accessed url must parse, but the directory is cut from its raw
    /// text: `.`/`..` segments and escapes stay exactly as the origin wrote them
    pub fn new(base_host: &str, accessed_url: &str) -> Result<Self> {
        Url::parse(accessed_url)?;
        let path = raw_path(accessed_url);
        let accessed_dir = match path.rfind('/') {
            Some(idx) => path[..=idx].to_string(),
            None => "/".to_string(),
        };
        Ok(Self {
            base_host: base_host.to_string(),
            accessed_url: accessed_url.to_string(),
            accessed_dir,
        })
    }
}

/// the path of an absolute url as written: after the authority, before any
/// query or fragment
fn raw_path(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = match rest.find(|c: char| c == '?' || c == '#') {
        Some(end) => &rest[..end],
        None => rest,
    };
    rest.find('/').map_or("", |start| &rest[start..])
}

/// one shape in one context, applied as a single pass
#[derive(Debug)]
pub struct Rule {
    context: Context,
    shape: Shape,
    pattern: Regex,
}

impl Rule {
    pub fn new(context: Context, shape: Shape) -> Result<Self> {
        let pattern = Regex::new(&format!(
            "(?i-u){}{}",
            context.pattern(),
            shape.pattern()
        ))?;
        Ok(Self {
            context,
            shape,
            pattern,
        })
    }

    #[cfg(test)]
    pub fn context(&self) -> Context {
        self.context
    }

    #[cfg(test)]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn apply(&self, content: &[u8], ctx: &RewriteContext) -> Vec<u8> {
        let mut out = Vec::with_capacity(content.len());
        let mut copied = 0;
        let mut at = 0;
        while at < content.len() {
            let Some(caps) = self.pattern.captures_at(content, at) else {
                break;
            };
            let Some(found) = caps.get(0) else {
                break;
            };
            if !self.shape.accepts(&caps, content) {
                // a rejected candidate may still hide a match one byte further on
                at = found.start() + 1;
                continue;
            }
            out.extend_from_slice(&content[copied..found.start()]);
            self.context.write_lead(&caps, &mut out);
            self.shape.write_target(&caps, ctx, &mut out);
            copied = found.end();
            at = found.end();
        }
        out.extend_from_slice(&content[copied..]);
        out
    }
}

/// the full ordered rule set
#[derive(Debug)]
pub struct Rewriter {
    rules: Vec<Rule>,
}

impl Rewriter {
    pub fn new() -> Result<Self> {
        let mut rules = Vec::new();
        for shape in Shape::ORDER {
            for &context in shape.contexts() {
                rules.push(Rule::new(context, shape)?);
            }
        }
        Ok(Self { rules })
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rewrite(&self, ctx: &RewriteContext, content: &[u8]) -> Vec<u8> {
        debug!(
            "rewriting {} bytes of '{}' under /{}/",
            content.len(),
            ctx.accessed_url,
            ctx.base_host
        );
        let mut current = content.to_vec();
        for rule in &self.rules {
            current = rule.apply(&current, ctx);
        }
        current
    }

    /// convenience over [`RewriteContext::new`] + [`Rewriter::rewrite`]
    pub fn rewrite_document(
        &self,
        base_host: &str,
        accessed_url: &str,
        content: &[u8],
    ) -> Result<Vec<u8>> {
        let ctx = RewriteContext::new(base_host, accessed_url)?;
        Ok(self.rewrite(&ctx, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // every way a reference can be embedded; `%s` marks the url
    const TEMPLATES: &[&str] = &[
        r#"<img src="%s"/>"#,
        "<img src='%s'/>",
        "<img src=%s/>",
        r#"<img src="%s'/>"#,
        r#"<img src='%s"/>"#,
        "<img src  \t=  '%s'/>",
        "<img src  \t=  \t '%s'/>",
        "<img src = '%s'/>",
        r#"<a href="%s">"#,
        "<a href='%s'>",
        "<a href=%s>",
        r#"<a href="%s'>"#,
        r#"<a href='%s">"#,
        "<a href \t = \t'%s'>",
        "<a href \t  = '%s'>",
        "<a href =  \t'%s'>",
        "<td background=%s>",
        "<td background='%s'>",
        r#"<td background="%s">"#,
        r#"<form action="%s">"#,
        "<form action='%s'>",
        "<form action=%s>",
        r#"<form action="%s'>"#,
        r#"<form action='%s">"#,
        "<form action \t = \t'%s'>",
        "<form action \t  = '%s'>",
        "<form action =  \t'%s'>",
        "@import '%s';",
        "@import '%s'\nnext line here",
        "@import \t '%s';",
        "@import %s;",
        "@import %s",
        r#"@import "%s";"#,
        "@import \"%s\"\nnext line here",
        "@import url(%s)",
        "@import url('%s')",
        r#"@import url("%s")"#,
        "background: transparent url(%s) repeat-x left;",
        r#"background: transparent url("%s") repeat-x left;"#,
        "background: transparent url('%s') repeat-x left;",
        r#"<meta http-equiv="Refresh" content="0; URL=%s">"#,
    ];

    fn check(base_host: &str, accessed_url: &str, original: &str, expected: &str) {
        let rewriter = Rewriter::new().unwrap();
        for template in TEMPLATES {
            let input = template.replace("%s", original);
            let want = template.replace("%s", expected);
            let got = rewriter
                .rewrite_document(base_host, accessed_url, input.as_bytes())
                .unwrap();
            assert_eq!(
                String::from_utf8_lossy(&got),
                want,
                "accessed {} with input {}",
                accessed_url,
                input
            );
        }
    }

    #[test]
    fn scheme_relative_url() {
        check(
            "slashdot.org",
            "http://slashdot.org",
            "//images.slashdot.org/iestyles.css?T_2_5_0_204",
            "/images.slashdot.org/iestyles.css?T_2_5_0_204",
        );
    }

    #[test]
    fn absolute_url() {
        check(
            "slashdot.org",
            "http://slashdot.org",
            "http://slashdot.org/slashdot_files/all-minified.js",
            "/slashdot.org/slashdot_files/all-minified.js",
        );
    }

    #[test]
    fn relative_url_at_site_root() {
        check(
            "slashdot.org",
            "http://slashdot.org",
            "images/foo.html",
            "/slashdot.org/images/foo.html",
        );
    }

    #[test]
    fn parent_directory_traversal() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/foobar/is/the/path.html",
            "../layout/mh_phone-home.png",
            "/a248.e.akamai.net/foobar/is/the/../layout/mh_phone-home.png",
        );
    }

    #[test]
    fn current_directory_traversal() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/foobar/is/the/path.html",
            "./layout/mh_phone-home.png",
            "/a248.e.akamai.net/foobar/is/the/./layout/mh_phone-home.png",
        );
    }

    #[test]
    fn same_directory() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/foobar/is/the/path.html",
            "mh_phone-home.png",
            "/a248.e.akamai.net/foobar/is/the/mh_phone-home.png",
        );
    }

    #[test]
    fn same_directory_without_parent() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/path.html",
            "mh_phone-home.png",
            "/a248.e.akamai.net/mh_phone-home.png",
        );
    }

    #[test]
    fn same_directory_deep_path() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/7/248/2041/1447/store.apple.com/rs1/css/aos-screen.css",
            "aos-layout.css",
            "/a248.e.akamai.net/7/248/2041/1447/store.apple.com/rs1/css/aos-layout.css",
        );
    }

    #[test]
    fn root_directory() {
        check(
            "a248.e.akamai.net",
            "http://a248.e.akamai.net/foobar/is/the/path.html",
            "/",
            "/a248.e.akamai.net/",
        );
    }

    #[test]
    fn secure_content() {
        check(
            "slashdot.org",
            "https://slashdot.org",
            "https://images.slashdot.org/iestyles.css?T_2_5_0_204",
            "/images.slashdot.org/iestyles.css?T_2_5_0_204",
        );
    }

    #[test]
    fn secure_link_on_plain_page() {
        check(
            "slashdot.org",
            "http://slashdot.org",
            "https://images.slashdot.org/iestyles.css?T_2_5_0_204",
            "/images.slashdot.org/iestyles.css?T_2_5_0_204",
        );
    }

    #[test]
    fn accessed_dir_always_ends_in_slash() {
        let cases = [
            ("http://slashdot.org", "/"),
            ("http://slashdot.org/", "/"),
            ("http://example.com/path.html", "/"),
            ("http://example.com/a/b/", "/a/b/"),
            ("http://example.com/a/b/c.html?q=1", "/a/b/"),
            ("http://example.com/a/b/c.html#top/x", "/a/b/"),
            ("http://example.com?next=/a/b", "/"),
            ("http://example.com:8080/a/x", "/a/"),
        ];
        for (url, dir) in cases {
            let ctx = RewriteContext::new("example.com", url).unwrap();
            assert_eq!(ctx.accessed_dir, dir, "for {}", url);
        }
    }

    #[test]
    fn accessed_dir_keeps_dot_segments_as_written() {
        let ctx = RewriteContext::new("ex.com", "http://ex.com/a/./c/../b.html").unwrap();
        assert_eq!(ctx.accessed_dir, "/a/./c/../");

        let ctx = RewriteContext::new("ex.com", "http://ex.com/a%20b/c d/x.html").unwrap();
        assert_eq!(ctx.accessed_dir, "/a%20b/c d/");

        let rewriter = Rewriter::new().unwrap();
        let got = rewriter
            .rewrite_document("ex.com", "http://ex.com/a/./c/../b.html", br#"<a href="q">"#)
            .unwrap();
        assert_eq!(got, br#"<a href="/ex.com/a/./c/../q">"#.to_vec());
    }

    #[test]
    fn rejects_unparseable_accessed_url() {
        assert!(RewriteContext::new("example.com", "not a url").is_err());
    }

    #[test]
    fn rules_run_shape_major_in_fixed_order() {
        let rewriter = Rewriter::new().unwrap();
        let shapes: Vec<Shape> = rewriter.rules().iter().map(Rule::shape).collect();
        assert_eq!(rewriter.rules().len(), 13);
        assert_eq!(shapes[0], Shape::SameDirectory);
        assert_eq!(shapes[3], Shape::Traversal);
        assert_eq!(shapes[6], Shape::RootRelative);
        assert_eq!(shapes[9], Shape::RootDirectory);
        assert_eq!(rewriter.rules()[9].context(), Context::Tag);
        assert_eq!(shapes[12], Shape::Absolute);
    }

    #[test]
    fn single_rules_are_independent_passes() {
        let ctx = RewriteContext::new("example.com", "http://example.com/docs/index.html").unwrap();

        let same_dir = Rule::new(Context::Tag, Shape::SameDirectory).unwrap();
        assert_eq!(
            same_dir.apply(br#"<a href="intro.html">"#, &ctx),
            br#"<a href="/docs/intro.html">"#.to_vec()
        );
        // rooted and absolute values are left for later passes
        assert_eq!(
            same_dir.apply(br#"<a href="/x"><a href="http://y/z">"#, &ctx),
            br#"<a href="/x"><a href="http://y/z">"#.to_vec()
        );

        let traversal = Rule::new(Context::CssUrl, Shape::Traversal).unwrap();
        assert_eq!(
            traversal.apply(b"url(../img/bg.png)", &ctx),
            b"url(/docs//../img/bg.png)".to_vec()
        );

        let root = Rule::new(Context::CssImport, Shape::RootRelative).unwrap();
        assert_eq!(
            root.apply(b"@import '/theme.css';", &ctx),
            b"@import '/example.com/theme.css';".to_vec()
        );

        let absolute = Rule::new(Context::Tag, Shape::Absolute).unwrap();
        assert_eq!(
            absolute.apply(br#"<script src="HTTPS://cdn.example.net/app.js">"#, &ctx),
            br#"<script src="/cdn.example.net/app.js">"#.to_vec()
        );
    }

    #[test]
    fn attribute_names_are_case_insensitive() {
        let rewriter = Rewriter::new().unwrap();
        let got = rewriter
            .rewrite_document(
                "example.com",
                "http://example.com/a/page.html",
                br#"<IMG SRC="pic.gif"><A HREF='/top'>"#,
            )
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&got),
            r#"<IMG SRC="/example.com/a/pic.gif"><A HREF='/example.com/top'>"#
        );
    }

    #[test]
    fn leaves_non_reference_text_alone() {
        let rewriter = Rewriter::new().unwrap();
        let doc = b"<p>plain text with a/slash and ../dots</p>";
        let got = rewriter
            .rewrite_document("example.com", "http://example.com/", doc)
            .unwrap();
        assert_eq!(got, doc.to_vec());
    }

    #[test]
    fn tolerates_non_utf8_bodies() {
        let rewriter = Rewriter::new().unwrap();
        let mut doc = b"<p>\xff\xfe</p><img src=\"x.png\">".to_vec();
        doc.extend_from_slice(b"\x80");
        let got = rewriter
            .rewrite_document("example.com", "http://example.com/", &doc)
            .unwrap();
        assert_eq!(
            got,
            b"<p>\xff\xfe</p><img src=\"/example.com/x.png\">\x80".to_vec()
        );
    }

    #[test]
    fn rewriting_twice_double_prefixes() {
        let rewriter = Rewriter::new().unwrap();
        let ctx = RewriteContext::new("example.com", "http://example.com/").unwrap();
        let once = rewriter.rewrite(&ctx, br#"<a href="/about">"#);
        let twice = rewriter.rewrite(&ctx, &once);
        assert_eq!(once, br#"<a href="/example.com/about">"#.to_vec());
        assert_eq!(twice, br#"<a href="/example.com/example.com/about">"#.to_vec());
    }

    // one quoted, one single-quoted, one `@import` and one css `url()` embedding
    const EMBEDDINGS: &[&str] = &[
        r#"<a href="%s">"#,
        "<img src='%s'/>",
        "@import '%s';",
        "background: url(%s) repeat;",
    ];

    fn rewrite_in_every_embedding(
        accessed_url: &str,
        base_host: &str,
        value: &str,
        expected: &str,
    ) -> std::result::Result<(), TestCaseError> {
        let rewriter = Rewriter::new().unwrap();
        for embedding in EMBEDDINGS {
            let input = embedding.replace("%s", value);
            let got = rewriter
                .rewrite_document(base_host, accessed_url, input.as_bytes())
                .unwrap();
            prop_assert_eq!(
                String::from_utf8_lossy(&got).into_owned(),
                embedding.replace("%s", expected)
            );
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn same_directory_values_land_under_the_accessed_dir(
            host in "[a-z]{1,12}\\.(com|org|net)",
            dir in "(/[a-z0-9_-]{1,8}){0,3}/",
            page in "[a-z]{1,8}\\.html",
            value in "[a-z0-9][a-z0-9_.-]{0,12}(/[a-z0-9_.-]{1,8}){0,2}",
        ) {
            let accessed_url = format!("http://{}{}{}", host, dir, page);
            let expected = format!("/{}{}{}", host, dir, value);
            rewrite_in_every_embedding(&accessed_url, &host, &value, &expected)?;
        }

        #[test]
        fn root_relative_values_land_under_the_base_host(
            host in "[a-z]{1,12}\\.(com|org|net)",
            dir in "(/[a-z0-9_-]{1,8}){0,3}/",
            value in "[a-z0-9_.-]{1,12}(/[a-z0-9_.-]{1,8}){0,2}",
        ) {
            let accessed_url = format!("http://{}{}index.html", host, dir);
            let expected = format!("/{}/{}", host, value);
            rewrite_in_every_embedding(&accessed_url, &host, &format!("/{}", value), &expected)?;
        }

        #[test]
        fn absolute_values_land_under_their_own_host(
            base in "[a-z]{1,12}\\.(com|org|net)",
            scheme in prop_oneof![Just("http://"), Just("https://"), Just("//")],
            host in "[a-z]{1,12}\\.(com|org|net)",
            path in "(/[a-z0-9_.-]{1,8}){0,3}",
        ) {
            let accessed_url = format!("http://{}/page.html", base);
            let value = format!("{}{}{}", scheme, host, path);
            let expected = format!("/{}{}", host, path);
            rewrite_in_every_embedding(&accessed_url, &base, &value, &expected)?;
        }
    }
}
