//! Sandboxed previews of extracted HTML/CSS/JS.
//!
//! The combined document is embedded as a `data:` URL in an iframe with a
//! fixed sandbox attribute. Scripts, modals, forms and same-origin access are
//! allowed; top-level navigation is not. Same-origin plus scripts means this
//! is a convenience viewer, not an isolation boundary.

use anyhow::{anyhow, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::extract::CodeBundle;

/// Sandbox capabilities granted to the preview frame.
pub const SANDBOX_PERMISSIONS: &str = "allow-scripts allow-modals allow-forms allow-same-origin";

const HOST_PAGE_FILE: &str = "preview.html";
const DOCUMENT_FILE: &str = "preview-document.html";

/// Characters left unescaped by JavaScript's `encodeURIComponent`.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Assemble one self-contained HTML document from a bundle.
pub fn build_document(bundle: &CodeBundle) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n  <head>\n    <style>{}</style>\n  </head>\n  <body>\n    {}\n    <script>{}</script>\n  </body>\n</html>\n",
        bundle.css, bundle.html, bundle.js
    )
}

/// Encode a document as a `data:text/html` URL.
pub fn data_url(document: &str) -> String {
    format!(
        "data:text/html;charset=utf-8,{}",
        utf8_percent_encode(document, URI_COMPONENT)
    )
}

/// Escape text for use inside a double-quoted HTML attribute.
fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// The isolated viewing surface: a page hosting the document in a
/// sandboxed iframe, with a link to open it in a new tab.
pub fn build_host_page(bundle: &CodeBundle) -> String {
    let url = escape_attr(&data_url(&build_document(bundle)));
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Preview</title>
    <style>
      body {{ margin: 0; font-family: sans-serif; background: #f4f4f5; }}
      header {{ display: flex; justify-content: space-between; align-items: center; padding: 8px 12px; background: #e4e4e7; border-bottom: 1px solid #d4d4d8; }}
      header span {{ font-size: 14px; font-weight: 600; }}
      header a {{ font-size: 14px; color: #2563eb; text-decoration: none; }}
      iframe {{ width: 100%; height: calc(100vh - 42px); border: none; background: white; }}
    </style>
  </head>
  <body>
    <header>
      <span>Preview</span>
      <a href="{url}" target="_blank" rel="noopener">Open in New Window</a>
    </header>
    <iframe title="Code Preview" sandbox="{sandbox}" src="{url}"></iframe>
  </body>
</html>
"#,
        url = url,
        sandbox = SANDBOX_PERMISSIONS,
    )
}

/// Writes preview pages to disk and hands them to the system browser.
pub struct Previewer {
    dir: PathBuf,
}

impl Previewer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Previewer rooted in the platform cache directory.
    pub fn default_location() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow!("Could not determine cache directory"))?;
        Ok(Self::new(cache_dir.join("sandchat").join("preview")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the sandboxed host page and return its path.
    pub fn write_host_page(&self, bundle: &CodeBundle) -> Result<PathBuf> {
        self.write(HOST_PAGE_FILE, &build_host_page(bundle))
    }

    /// Write the bare combined document and return its path.
    pub fn write_document(&self, bundle: &CodeBundle) -> Result<PathBuf> {
        self.write(DOCUMENT_FILE, &build_document(bundle))
    }

    /// Open the sandboxed preview in the browser.
    pub fn show(&self, bundle: &CodeBundle) -> Result<PathBuf> {
        let path = self.write_host_page(bundle)?;
        info!(path = %path.display(), "opening sandboxed preview");
        open::that(&path)?;
        Ok(path)
    }

    /// Open the combined document on its own in a new browser tab.
    pub fn open_in_new_tab(&self, bundle: &CodeBundle) -> Result<PathBuf> {
        let path = self.write_document(bundle)?;
        info!(path = %path.display(), "opening preview document");
        open::that(&path)?;
        Ok(path)
    }

    fn write(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(file_name);
        fs::write(&path, contents)?;
        debug!(path = %path.display(), bytes = contents.len(), "wrote preview file");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> CodeBundle {
        CodeBundle {
            html: "<button id=\"b\">Go</button>".to_string(),
            css: "button { color: red; }".to_string(),
            js: "document.getElementById('b').onclick = () => alert('hi');".to_string(),
        }
    }

    #[test]
    fn test_document_places_each_part() {
        let doc = build_document(&bundle());
        let head_end = doc.find("</head>").unwrap();
        let style = doc.find("<style>button { color: red; }</style>").unwrap();
        let body = doc.find("<body>").unwrap();
        let html = doc.find("<button id=\"b\">Go</button>").unwrap();
        let script = doc.find("<script>document.getElementById").unwrap();

        assert!(style < head_end);
        assert!(body < html && html < script);
    }

    #[test]
    fn test_empty_bundle_still_builds() {
        let doc = build_document(&CodeBundle::default());
        assert!(doc.starts_with("<!DOCTYPE html>"));
        assert!(doc.contains("<style></style>"));
        assert!(doc.contains("<script></script>"));
    }

    #[test]
    fn test_data_url_matches_encode_uri_component() {
        assert_eq!(
            data_url("<p a=\"b\">x & y's (1)!</p>"),
            "data:text/html;charset=utf-8,%3Cp%20a%3D%22b%22%3Ex%20%26%20y's%20(1)!%3C%2Fp%3E"
        );
        assert_eq!(data_url("é"), "data:text/html;charset=utf-8,%C3%A9");
    }

    #[test]
    fn test_host_page_sandboxes_the_frame() {
        let page = build_host_page(&bundle());
        assert!(page.contains(
            r#"sandbox="allow-scripts allow-modals allow-forms allow-same-origin""#
        ));
        assert!(!page.contains("allow-top-navigation"));
        assert!(page.contains("src=\"data:text/html;charset=utf-8,"));
        assert!(page.contains("Open in New Window"));
    }

    #[test]
    fn test_previewer_writes_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let previewer = Previewer::new(dir.path().join("nested"));

        let host = previewer.write_host_page(&bundle()).unwrap();
        let doc = previewer.write_document(&bundle()).unwrap();

        assert!(fs::read_to_string(host).unwrap().contains("<iframe"));
        assert_eq!(fs::read_to_string(doc).unwrap(), build_document(&bundle()));
    }
}
