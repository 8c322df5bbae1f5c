//! Query AST and parser.
//!
//! Dialect: `*` matches everything; bare terms search all text fields;
//! `@field:term` targets one field; `@field:[lo hi]` is a numeric interval;
//! `@field:{a|b}` matches any listed tag; `-expr` negates; `|` unions;
//! juxtaposition intersects; parentheses group. A trailing
//! `=>[KNN k @field $param]` (optionally `EF n`) turns the preceding
//! expression into the allow-list of a vector search.

use std::collections::HashMap;

/// Named parameters referenced from the query text (vector blobs).
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    values: HashMap<String, Vec<u8>>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Interpret a parameter as a little-endian f32 vector.
    pub fn get_vector(&self, name: &str) -> Option<Vec<f32>> {
        let raw = self.get(name)?;
        if raw.len() % 4 != 0 {
            return None;
        }
        Some(
            raw.chunks_exact(4)
                .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4 byte chunk")))
                .collect(),
        )
    }
}

/// Result reshaping applied after filtering.
#[derive(Clone, Debug)]
pub struct SortOption {
    pub field: String,
    pub descending: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AstNode {
    /// Matches every document.
    Star,
    /// A (possibly field-scoped) text or tag term.
    Term {
        field: Option<String>,
        term: String,
    },
    /// Numeric interval, both bounds inclusive.
    Range { field: String, lo: f64, hi: f64 },
    /// Any of the listed tags.
    Tags { field: String, tags: Vec<String> },
    Not(Box<AstNode>),
    And(Vec<AstNode>),
    Or(Vec<AstNode>),
    /// Vector search over candidates produced by `base`.
    Knn {
        base: Box<AstNode>,
        field: String,
        k: usize,
        ef: Option<usize>,
        param: String,
    },
}

pub fn parse_query(input: &str) -> anyhow::Result<AstNode> {
    let mut parser = Parser::new(input);
    let node = parser.parse_or()?;
    parser.skip_ws();

    // Optional KNN tail.
    if parser.eat_str("=>") {
        parser.skip_ws();
        anyhow::ensure!(parser.eat('['), "expected '[' after '=>'");
        parser.skip_ws();
        let kw = parser.ident()?;
        anyhow::ensure!(kw.eq_ignore_ascii_case("KNN"), "expected KNN clause");
        parser.skip_ws();
        let k = parser.number()? as usize;
        parser.skip_ws();
        anyhow::ensure!(parser.eat('@'), "expected @field in KNN clause");
        let field = parser.ident()?;
        parser.skip_ws();
        anyhow::ensure!(parser.eat('$'), "expected $param in KNN clause");
        let param = parser.ident()?;
        parser.skip_ws();
        let mut ef = None;
        if !parser.eat(']') {
            let kw = parser.ident()?;
            anyhow::ensure!(kw.eq_ignore_ascii_case("EF"), "expected EF or ']'");
            parser.skip_ws();
            ef = Some(parser.number()? as usize);
            parser.skip_ws();
            anyhow::ensure!(parser.eat(']'), "unterminated KNN clause");
        }
        parser.skip_ws();
        anyhow::ensure!(parser.done(), "trailing input after KNN clause");
        return Ok(AstNode::Knn {
            base: Box::new(node),
            field,
            k,
            ef,
            param,
        });
    }

    anyhow::ensure!(parser.done(), "trailing query input");
    Ok(node)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn done(&self) -> bool {
        self.rest().is_empty()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn ident(&mut self) -> anyhow::Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        anyhow::ensure!(self.pos > start, "expected identifier at byte {}", start);
        Ok(self.input[start..self.pos].to_string())
    }

    fn number(&mut self) -> anyhow::Result<f64> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        text.parse()
            .map_err(|_| anyhow::anyhow!("invalid number {text:?}"))
    }

    /// `or := and ('|' and)*`
    fn parse_or(&mut self) -> anyhow::Result<AstNode> {
        let mut nodes = vec![self.parse_and()?];
        loop {
            self.skip_ws();
            if self.eat('|') {
                nodes.push(self.parse_and()?);
            } else {
                break;
            }
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().expect("one node")
        } else {
            AstNode::Or(nodes)
        })
    }

    /// `and := unary+` (juxtaposition)
    fn parse_and(&mut self) -> anyhow::Result<AstNode> {
        let mut nodes = vec![self.parse_unary()?];
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some('|') | Some(')') => break,
                Some('=') if self.rest().starts_with("=>") => break,
                _ => nodes.push(self.parse_unary()?),
            }
        }
        Ok(if nodes.len() == 1 {
            nodes.pop().expect("one node")
        } else {
            AstNode::And(nodes)
        })
    }

    fn parse_unary(&mut self) -> anyhow::Result<AstNode> {
        self.skip_ws();
        if self.eat('-') {
            return Ok(AstNode::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat('(') {
            let node = self.parse_or()?;
            self.skip_ws();
            anyhow::ensure!(self.eat(')'), "unbalanced parenthesis");
            return Ok(node);
        }
        if self.eat('*') {
            return Ok(AstNode::Star);
        }
        if self.eat('@') {
            return self.parse_field_predicate();
        }
        let term = self.ident()?;
        Ok(AstNode::Term { field: None, term })
    }

    fn parse_field_predicate(&mut self) -> anyhow::Result<AstNode> {
        let field = self.ident()?;
        anyhow::ensure!(self.eat(':'), "expected ':' after @{field}");
        self.skip_ws();

        if self.eat('[') {
            self.skip_ws();
            let lo = self.number()?;
            self.skip_ws();
            let hi = self.number()?;
            self.skip_ws();
            anyhow::ensure!(self.eat(']'), "unterminated numeric range");
            return Ok(AstNode::Range { field, lo, hi });
        }

        if self.eat('{') {
            let mut tags = Vec::new();
            loop {
                self.skip_ws();
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == '|' || c == '}' {
                        break;
                    }
                    self.pos += c.len_utf8();
                }
                let tag = self.input[start..self.pos].trim();
                if !tag.is_empty() {
                    tags.push(tag.to_string());
                }
                if self.eat('}') {
                    break;
                }
                anyhow::ensure!(self.eat('|'), "unterminated tag set");
            }
            anyhow::ensure!(!tags.is_empty(), "empty tag set for @{field}");
            return Ok(AstNode::Tags { field, tags });
        }

        let term = self.ident()?;
        Ok(AstNode::Term {
            field: Some(field),
            term,
        })
    }
}
