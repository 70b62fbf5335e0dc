//! XPath 1.0 tokenizer
//!
//! Produces tokens with byte spans into the source expression. Names are
//! classified with the disambiguation rules of XPath 1.0 section 3.7, so a
//! caller can tell element name tests apart from function names, node type
//! tests, axis names and operator names without parsing the full grammar.

use std::fmt;

/// One lexical token of an XPath expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    /// String literal, without its quotes
    Literal(&'a str),
    Number(&'a str),
    /// `$name`, without the dollar sign
    Variable(&'a str),
    /// Name test: `name`, `prefix:name`, `prefix:*` or `*`
    NameTest {
        prefix: Option<&'a str>,
        local: &'a str,
    },
    /// Name followed by `(`, possibly qualified
    FunctionName(&'a str),
    /// `comment`, `text`, `processing-instruction` or `node` followed by `(`
    NodeType(&'a str),
    /// Name followed by `::`
    AxisName(&'a str),
    /// `and`, `or`, `mod`, `div`, `*`, `/`, `//`, `|`, `+`, `-`, `=`, `!=`, `<`, `<=`, `>`, `>=`
    Operator(&'a str),
    /// `(`, `)`, `[`, `]`, `.`, `..`, `@`, `,`, `::`
    Punct(&'a str),
}

/// A token and its byte range in the source expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spanned<'a> {
    pub token: Token<'a>,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexErrorKind {
    UnterminatedLiteral,
    UnexpectedChar(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LexError {
    pub kind: LexErrorKind,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LexErrorKind::UnterminatedLiteral => {
                write!(f, "unfinished literal starting at offset {}", self.position)
            }
            LexErrorKind::UnexpectedChar(c) => {
                write!(f, "invalid character {:?} at offset {}", c, self.position)
            }
        }
    }
}

impl std::error::Error for LexError {}

const NODE_TYPES: &[&str] = &["comment", "text", "processing-instruction", "node"];

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || !c.is_ascii() && !c.is_whitespace()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit() || c == '-' || c == '.'
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    tokens: Vec<Spanned<'a>>,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    /// Next non-whitespace text after `from`.
    fn rest_after(&self, from: usize) -> &'a str {
        let input = self.input;
        input[from..].trim_start()
    }

    fn push(&mut self, token: Token<'a>, start: usize) {
        self.tokens.push(Spanned {
            token,
            start,
            end: self.pos,
        });
    }

    /// XPath 1.0 section 3.7: a preceding token that is not `@`, `::`, `(`,
    /// `[`, `,` or an operator turns `*` into multiplication and a name into
    /// an operator name.
    fn operator_expected(&self) -> bool {
        match self.tokens.last().map(|t| t.token) {
            None => false,
            Some(Token::Punct("@" | "::" | "(" | "[" | ",")) => false,
            Some(Token::Operator(_)) => false,
            Some(_) => true,
        }
    }

    fn scan_ncname(&mut self) -> &'a str {
        let input = self.input;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_name_char(c) {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        &input[start..self.pos]
    }

    fn lex_literal(&mut self, quote: char) -> Result<(), LexError> {
        let input = self.input;
        let start = self.pos;
        let body_start = start + 1;
        match self.input[body_start..].find(quote) {
            Some(len) => {
                self.pos = body_start + len + 1;
                let body = &input[body_start..body_start + len];
                self.push(Token::Literal(body), start);
                Ok(())
            }
            None => Err(LexError {
                kind: LexErrorKind::UnterminatedLiteral,
                position: start,
            }),
        }
    }

    fn lex_number(&mut self) {
        let input = self.input;
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        self.push(Token::Number(&input[start..self.pos]), start);
    }

    fn lex_name(&mut self) {
        let input = self.input;
        let start = self.pos;

        if self.operator_expected() {
            let name = self.scan_ncname();
            self.push(Token::Operator(name), start);
            return;
        }

        let first = self.scan_ncname();
        let mut prefix = None;
        let mut local = first;

        // QName or prefix:* (but not an axis `name::`)
        if self.peek() == Some(':') && self.peek_at(1) != Some(':') {
            match self.peek_at(1) {
                Some('*') => {
                    self.pos += 2;
                    self.push(
                        Token::NameTest {
                            prefix: Some(first),
                            local: "*",
                        },
                        start,
                    );
                    return;
                }
                Some(c) if is_name_start(c) => {
                    self.pos += 1;
                    prefix = Some(first);
                    local = self.scan_ncname();
                }
                _ => {}
            }
        }

        let after = self.rest_after(self.pos);
        let qualified = &input[start..self.pos];
        if after.starts_with('(') {
            if prefix.is_none() && NODE_TYPES.contains(&local) {
                self.push(Token::NodeType(local), start);
            } else {
                self.push(Token::FunctionName(qualified), start);
            }
        } else if prefix.is_none() && after.starts_with("::") {
            self.push(Token::AxisName(local), start);
        } else {
            self.push(Token::NameTest { prefix, local }, start);
        }
    }

    fn run(mut self) -> Result<Vec<Spanned<'a>>, LexError> {
        let input = self.input;
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let c = match self.peek() {
                Some(c) => c,
                None => break,
            };

            match c {
                '\'' | '"' => self.lex_literal(c)?,
                '0'..='9' => self.lex_number(),
                '.' => {
                    if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) {
                        self.lex_number();
                    } else if self.peek_at(1) == Some('.') {
                        self.pos += 2;
                        self.push(Token::Punct(".."), start);
                    } else {
                        self.pos += 1;
                        self.push(Token::Punct("."), start);
                    }
                }
                '$' => {
                    self.pos += 1;
                    let name_start = self.pos;
                    self.scan_ncname();
                    if self.peek() == Some(':') && self.peek_at(1).is_some_and(is_name_start) {
                        self.pos += 1;
                        self.scan_ncname();
                    }
                    if self.pos == name_start {
                        return Err(LexError {
                            kind: LexErrorKind::UnexpectedChar('$'),
                            position: start,
                        });
                    }
                    self.push(Token::Variable(&input[name_start..self.pos]), start);
                }
                '*' => {
                    self.pos += 1;
                    if self.operator_expected() {
                        self.push(Token::Operator("*"), start);
                    } else {
                        self.push(
                            Token::NameTest {
                                prefix: None,
                                local: "*",
                            },
                            start,
                        );
                    }
                }
                '/' => {
                    if self.peek_at(1) == Some('/') {
                        self.pos += 2;
                        self.push(Token::Operator("//"), start);
                    } else {
                        self.pos += 1;
                        self.push(Token::Operator("/"), start);
                    }
                }
                ':' if self.peek_at(1) == Some(':') => {
                    self.pos += 2;
                    self.push(Token::Punct("::"), start);
                }
                '!' if self.peek_at(1) == Some('=') => {
                    self.pos += 2;
                    self.push(Token::Operator("!="), start);
                }
                '<' | '>' => {
                    if self.peek_at(1) == Some('=') {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                    self.push(Token::Operator(&input[start..self.pos]), start);
                }
                '|' | '+' | '-' | '=' => {
                    self.pos += 1;
                    self.push(Token::Operator(&input[start..self.pos]), start);
                }
                '(' | ')' | '[' | ']' | '@' | ',' => {
                    self.pos += 1;
                    self.push(Token::Punct(&input[start..self.pos]), start);
                }
                c if is_name_start(c) => self.lex_name(),
                c => {
                    return Err(LexError {
                        kind: LexErrorKind::UnexpectedChar(c),
                        position: start,
                    })
                }
            }
        }
        Ok(self.tokens)
    }
}

/// Tokenize an XPath 1.0 expression.
pub fn tokenize(input: &str) -> Result<Vec<Spanned<'_>>, LexError> {
    Lexer {
        input,
        pos: 0,
        tokens: Vec::new(),
    }
    .run()
}
