//! Fenced code block extraction for live previews.

use regex::Regex;
use std::sync::OnceLock;

/// The HTML, CSS and JavaScript bodies pulled out of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBundle {
    pub html: String,
    pub css: String,
    pub js: String,
}

struct Fences {
    html: Regex,
    css: Regex,
    js: Regex,
}

fn fences() -> &'static Fences {
    static FENCES: OnceLock<Fences> = OnceLock::new();
    FENCES.get_or_init(|| Fences {
        html: Regex::new(r"```html\n([\s\S]*?)\n```").expect("valid html fence pattern"),
        css: Regex::new(r"```css\n([\s\S]*?)\n```").expect("valid css fence pattern"),
        js: Regex::new(r"```(?:javascript|js)\n([\s\S]*?)\n```").expect("valid js fence pattern"),
    })
}

fn first_body(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

impl CodeBundle {
    /// Extract all three bodies, leaving missing languages empty.
    pub fn from_text(text: &str) -> Self {
        extract_code(text).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.html.is_empty() && self.css.is_empty() && self.js.is_empty()
    }
}

/// Find the first `html`, `css` and `javascript`/`js` fenced blocks.
///
/// Returns `Some` exactly when at least one of the three fences is present,
/// which is the signal that a preview is available. Language tags are
/// case-sensitive.
pub fn extract_code(text: &str) -> Option<CodeBundle> {
    let f = fences();
    let html = first_body(&f.html, text);
    let css = first_body(&f.css, text);
    let js = first_body(&f.js, text);

    if html.is_none() && css.is_none() && js.is_none() {
        return None;
    }

    Some(CodeBundle {
        html: html.unwrap_or_default(),
        css: css.unwrap_or_default(),
        js: js.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_fences_means_no_preview() {
        assert!(extract_code("just some prose").is_none());
        assert_eq!(CodeBundle::from_text("just some prose"), CodeBundle::default());
    }

    #[test]
    fn test_all_three_languages() {
        let text = "Here you go:\n```html\n<h1>Hi</h1>\n```\n\n```css\nh1 { color: red; }\n```\n\n```javascript\nconsole.log(1);\n```\n";
        let bundle = extract_code(text).unwrap();
        assert_eq!(bundle.html, "<h1>Hi</h1>");
        assert_eq!(bundle.css, "h1 { color: red; }");
        assert_eq!(bundle.js, "console.log(1);");
    }

    #[test]
    fn test_missing_languages_are_empty() {
        let bundle = extract_code("```css\nbody {}\n```").unwrap();
        assert_eq!(bundle.css, "body {}");
        assert!(bundle.html.is_empty());
        assert!(bundle.js.is_empty());
    }

    #[test]
    fn test_js_short_tag() {
        let bundle = extract_code("```js\nalert('x')\n```").unwrap();
        assert_eq!(bundle.js, "alert('x')");
    }

    #[test]
    fn test_first_block_wins() {
        let text = "```html\n<p>one</p>\n```\n```html\n<p>two</p>\n```";
        assert_eq!(extract_code(text).unwrap().html, "<p>one</p>");
    }

    #[test]
    fn test_tag_is_case_sensitive() {
        assert!(extract_code("```HTML\n<p>x</p>\n```").is_none());
    }

    #[test]
    fn test_bodies_are_trimmed() {
        let bundle = extract_code("```html\n\n   <div></div>   \n\n```").unwrap();
        assert_eq!(bundle.html, "<div></div>");
    }

    #[test]
    fn test_unterminated_fence_is_ignored() {
        assert!(extract_code("```html\n<p>never closed").is_none());
    }

    #[test]
    fn test_other_languages_do_not_count() {
        assert!(extract_code("```rust\nfn main() {}\n```").is_none());
    }
}
