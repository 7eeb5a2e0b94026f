//! Typed markdown tree for rendering chat messages.
//!
//! `parse` turns message text into [`Block`]s using pulldown-cmark, and a
//! [`MarkdownVisitor`] maps each node kind to whatever the front end draws.
//! The parser never touches the view layer.

use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};

use crate::extract::{extract_code, CodeBundle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, content: Vec<Inline> },
    Paragraph(Vec<Inline>),
    /// Fenced or indented code. `language` is the declared fence tag.
    CodeBlock { language: Option<String>, code: String },
    List { start: Option<u64>, items: Vec<Vec<Block>> },
    BlockQuote(Vec<Block>),
    Rule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inline {
    Text(String),
    Code(String),
    Strong(Vec<Inline>),
    Emphasis(Vec<Inline>),
    Strikethrough(Vec<Inline>),
    Link { url: String, content: Vec<Inline> },
    SoftBreak,
    HardBreak,
}

/// A message parsed for display, plus its previewable code (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub blocks: Vec<Block>,
    pub bundle: Option<CodeBundle>,
}

/// Parse the message and run code extraction over the full text.
pub fn render_message(content: &str) -> RenderedMessage {
    RenderedMessage {
        blocks: parse(content),
        bundle: extract_code(content),
    }
}

/// One callback per node kind. Block callbacks receive their children
/// already rendered.
pub trait MarkdownVisitor {
    type Output;

    fn heading(&mut self, level: u8, content: &[Inline]) -> Self::Output;
    fn paragraph(&mut self, content: &[Inline]) -> Self::Output;
    fn code_block(&mut self, language: Option<&str>, code: &str) -> Self::Output;
    fn list(&mut self, start: Option<u64>, items: Vec<Vec<Self::Output>>) -> Self::Output;
    fn block_quote(&mut self, children: Vec<Self::Output>) -> Self::Output;
    fn rule(&mut self) -> Self::Output;
}

/// Walk blocks in order, rendering each through the visitor.
pub fn render<V: MarkdownVisitor>(blocks: &[Block], visitor: &mut V) -> Vec<V::Output> {
    blocks.iter().map(|b| render_block(b, visitor)).collect()
}

fn render_block<V: MarkdownVisitor>(block: &Block, visitor: &mut V) -> V::Output {
    match block {
        Block::Heading { level, content } => visitor.heading(*level, content),
        Block::Paragraph(content) => visitor.paragraph(content),
        Block::CodeBlock { language, code } => visitor.code_block(language.as_deref(), code),
        Block::List { start, items } => {
            let rendered = items.iter().map(|item| render(item, visitor)).collect();
            visitor.list(*start, rendered)
        }
        Block::BlockQuote(children) => {
            let rendered = render(children, visitor);
            visitor.block_quote(rendered)
        }
        Block::Rule => visitor.rule(),
    }
}

/// Flatten inline nodes to plain text.
pub fn plain_text(inlines: &[Inline]) -> String {
    let mut out = String::new();
    for inline in inlines {
        match inline {
            Inline::Text(t) | Inline::Code(t) => out.push_str(t),
            Inline::Strong(c) | Inline::Emphasis(c) | Inline::Strikethrough(c) => {
                out.push_str(&plain_text(c))
            }
            Inline::Link { content, .. } => out.push_str(&plain_text(content)),
            Inline::SoftBreak => out.push(' '),
            Inline::HardBreak => out.push('\n'),
        }
    }
    out
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Containers still open while folding the event stream.
enum Frame {
    Root(Vec<Block>),
    Heading(u8, Vec<Inline>),
    Paragraph(Vec<Inline>),
    CodeBlock(Option<String>, String),
    List(Option<u64>, Vec<Vec<Block>>),
    Item(Vec<Block>, Vec<Inline>),
    BlockQuote(Vec<Block>),
    Strong(Vec<Inline>),
    Emphasis(Vec<Inline>),
    Strikethrough(Vec<Inline>),
    Link(String, Vec<Inline>),
    Other,
}

struct TreeBuilder {
    stack: Vec<Frame>,
}

impl TreeBuilder {
    fn new() -> Self {
        Self {
            stack: vec![Frame::Root(Vec::new())],
        }
    }

    fn push_inline(&mut self, inline: Inline) {
        for frame in self.stack.iter_mut().rev() {
            match frame {
                Frame::Heading(_, c)
                | Frame::Paragraph(c)
                | Frame::Strong(c)
                | Frame::Emphasis(c)
                | Frame::Strikethrough(c)
                | Frame::Link(_, c)
                | Frame::Item(_, c) => {
                    c.push(inline);
                    return;
                }
                Frame::CodeBlock(_, code) => {
                    if let Inline::Text(t) = &inline {
                        code.push_str(t);
                    }
                    return;
                }
                // Images and other unmodelled tags pass their text through
                Frame::Other => continue,
                _ => break,
            }
        }
        // Inline content outside a paragraph, e.g. an HTML block
        self.push_block(Block::Paragraph(vec![inline]));
    }

    fn push_block(&mut self, block: Block) {
        // Tight list items carry inline text directly; close it into a
        // paragraph before a nested block lands.
        if let Some(Frame::Item(blocks, pending)) = self.stack.last_mut() {
            if !pending.is_empty() {
                blocks.push(Block::Paragraph(std::mem::take(pending)));
            }
            blocks.push(block);
            return;
        }
        match self.stack.last_mut() {
            Some(Frame::Root(blocks)) | Some(Frame::BlockQuote(blocks)) => blocks.push(block),
            _ => {
                if let Some(Frame::Root(blocks)) = self.stack.first_mut() {
                    blocks.push(block);
                }
            }
        }
    }

    fn start(&mut self, tag: Tag) {
        let frame = match tag {
            Tag::Heading { level, .. } => Frame::Heading(heading_level(level), Vec::new()),
            Tag::Paragraph => Frame::Paragraph(Vec::new()),
            Tag::CodeBlock(kind) => {
                let language = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .map(|s| s.to_string())
                        .filter(|s| !s.is_empty()),
                    CodeBlockKind::Indented => None,
                };
                Frame::CodeBlock(language, String::new())
            }
            Tag::List(start) => Frame::List(start, Vec::new()),
            Tag::Item => Frame::Item(Vec::new(), Vec::new()),
            Tag::BlockQuote { .. } => Frame::BlockQuote(Vec::new()),
            Tag::Strong => Frame::Strong(Vec::new()),
            Tag::Emphasis => Frame::Emphasis(Vec::new()),
            Tag::Strikethrough => Frame::Strikethrough(Vec::new()),
            Tag::Link { dest_url, .. } => Frame::Link(dest_url.to_string(), Vec::new()),
            _ => Frame::Other,
        };
        self.stack.push(frame);
    }

    fn end(&mut self) {
        // Never pop the root
        if self.stack.len() <= 1 {
            return;
        }
        let Some(frame) = self.stack.pop() else {
            return;
        };
        match frame {
            Frame::Heading(level, content) => self.push_block(Block::Heading { level, content }),
            Frame::Paragraph(content) => self.push_block(Block::Paragraph(content)),
            Frame::CodeBlock(language, mut code) => {
                if code.ends_with('\n') {
                    code.pop();
                }
                self.push_block(Block::CodeBlock { language, code });
            }
            Frame::List(start, items) => self.push_block(Block::List { start, items }),
            Frame::Item(mut blocks, pending) => {
                if !pending.is_empty() {
                    blocks.push(Block::Paragraph(pending));
                }
                if let Some(Frame::List(_, items)) = self.stack.last_mut() {
                    items.push(blocks);
                }
            }
            Frame::BlockQuote(children) => self.push_block(Block::BlockQuote(children)),
            Frame::Strong(c) => self.push_inline(Inline::Strong(c)),
            Frame::Emphasis(c) => self.push_inline(Inline::Emphasis(c)),
            Frame::Strikethrough(c) => self.push_inline(Inline::Strikethrough(c)),
            Frame::Link(url, content) => self.push_inline(Inline::Link { url, content }),
            Frame::Root(_) | Frame::Other => {}
        }
    }

    fn finish(mut self) -> Vec<Block> {
        while self.stack.len() > 1 {
            self.end();
        }
        match self.stack.pop() {
            Some(Frame::Root(blocks)) => blocks,
            _ => Vec::new(),
        }
    }
}

/// Parse markdown text into a block tree.
pub fn parse(text: &str) -> Vec<Block> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(text, options);

    let mut builder = TreeBuilder::new();
    for event in parser {
        match event {
            Event::Start(tag) => builder.start(tag),
            Event::End(_) => builder.end(),
            Event::Text(text) => builder.push_inline(Inline::Text(text.to_string())),
            Event::Code(code) => builder.push_inline(Inline::Code(code.to_string())),
            Event::Html(html) | Event::InlineHtml(html) => {
                builder.push_inline(Inline::Text(html.to_string()))
            }
            Event::SoftBreak => builder.push_inline(Inline::SoftBreak),
            Event::HardBreak => builder.push_inline(Inline::HardBreak),
            Event::Rule => builder.push_block(Block::Rule),
            _ => {}
        }
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Inline {
        Inline::Text(s.to_string())
    }

    #[test]
    fn test_heading_and_paragraph() {
        let blocks = parse("# Title\n\nHello **world**");
        assert_eq!(
            blocks,
            vec![
                Block::Heading { level: 1, content: vec![text("Title")] },
                Block::Paragraph(vec![text("Hello "), Inline::Strong(vec![text("world")])]),
            ]
        );
    }

    #[test]
    fn test_fenced_code_keeps_language() {
        let blocks = parse("```html\n<p>hi</p>\n```");
        assert_eq!(
            blocks,
            vec![Block::CodeBlock {
                language: Some("html".to_string()),
                code: "<p>hi</p>".to_string(),
            }]
        );
    }

    #[test]
    fn test_untagged_fence_has_no_language() {
        let blocks = parse("```\nplain\n```");
        assert_eq!(
            blocks,
            vec![Block::CodeBlock { language: None, code: "plain".to_string() }]
        );
    }

    #[test]
    fn test_inline_code() {
        let blocks = parse("run `cargo` now");
        assert_eq!(
            blocks,
            vec![Block::Paragraph(vec![
                text("run "),
                Inline::Code("cargo".to_string()),
                text(" now"),
            ])]
        );
    }

    #[test]
    fn test_tight_list_items() {
        let blocks = parse("- one\n- two\n");
        assert_eq!(
            blocks,
            vec![Block::List {
                start: None,
                items: vec![
                    vec![Block::Paragraph(vec![text("one")])],
                    vec![Block::Paragraph(vec![text("two")])],
                ],
            }]
        );
    }

    #[test]
    fn test_ordered_list_start() {
        let blocks = parse("3. three\n4. four\n");
        match &blocks[0] {
            Block::List { start, items } => {
                assert_eq!(*start, Some(3));
                assert_eq!(items.len(), 2);
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_blockquote_nests_blocks() {
        let blocks = parse("> quoted");
        assert_eq!(
            blocks,
            vec![Block::BlockQuote(vec![Block::Paragraph(vec![text("quoted")])])]
        );
    }

    #[test]
    fn test_render_message_attaches_bundle() {
        let rendered = render_message("Try this:\n\n```css\nbody { margin: 0; }\n```\n");
        assert_eq!(rendered.blocks.len(), 2);
        assert_eq!(rendered.bundle.unwrap().css, "body { margin: 0; }");

        assert!(render_message("no code here").bundle.is_none());
    }

    struct Outline;

    impl MarkdownVisitor for Outline {
        type Output = String;

        fn heading(&mut self, level: u8, content: &[Inline]) -> String {
            format!("h{}:{}", level, plain_text(content))
        }
        fn paragraph(&mut self, content: &[Inline]) -> String {
            format!("p:{}", plain_text(content))
        }
        fn code_block(&mut self, language: Option<&str>, code: &str) -> String {
            format!("code[{}]:{}", language.unwrap_or(""), code)
        }
        fn list(&mut self, _start: Option<u64>, items: Vec<Vec<String>>) -> String {
            let items: Vec<String> = items.into_iter().map(|i| i.join("+")).collect();
            format!("list({})", items.join(","))
        }
        fn block_quote(&mut self, children: Vec<String>) -> String {
            format!("quote({})", children.join(","))
        }
        fn rule(&mut self) -> String {
            "rule".to_string()
        }
    }

    #[test]
    fn test_visitor_walks_in_order() {
        let blocks = parse("## Steps\n\n- a\n- b\n\n---\n\n> note\n\n```js\nx()\n```");
        let out = render(&blocks, &mut Outline);
        assert_eq!(
            out,
            vec![
                "h2:Steps",
                "list(p:a,p:b)",
                "rule",
                "quote(p:note)",
                "code[js]:x()",
            ]
        );
    }
}
