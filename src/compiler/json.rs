//! Graph JSON parsing: a hand lexer and recursive-descent parser that
//! track line/column on every value.
//!
//! The dialect is JSON plus `//` line comments and bare identifiers for
//! the keywords, which graph editors in the wild emit. The manifest
//! loader does not use this parser; diagnostics are the reason this one
//! exists.

use crate::diag::{DiagKind, Diagnostics, SourceLoc};

#[derive(Clone, Debug, PartialEq)]
pub enum JsonKind {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

/// A parsed value together with where it started in the source.
#[derive(Clone, Debug, PartialEq)]
pub struct JsonValue {
    pub kind: JsonKind,
    pub loc: SourceLoc,
}

impl JsonValue {
    /// Object field lookup.
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        match &self.kind {
            JsonKind::Object(fields) => fields.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            JsonKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.kind {
            JsonKind::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.kind {
            JsonKind::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[JsonValue]> {
        match &self.kind {
            JsonKind::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_object(&self) -> bool {
        matches!(&self.kind, JsonKind::Object(_))
    }
}

/// Parses a complete document; reports `ParseError` diagnostics and
/// returns `None` on the first hard error.
pub fn parse(source: &str, file: &str, diag: &mut Diagnostics) -> Option<JsonValue> {
    let mut p = Parser {
        bytes: source.as_bytes(),
        pos: 0,
        line: 1,
        column: 1,
        file,
    };
    p.skip_trivia();
    let value = match p.parse_value(diag) {
        Ok(v) => v,
        Err(()) => return None,
    };
    p.skip_trivia();
    if p.pos < p.bytes.len() {
        diag.error(
            DiagKind::ParseError,
            Some(p.loc()),
            "trailing content after document",
        );
        return None;
    }
    Some(value)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    file: &'a str,
}

impl<'a> Parser<'a> {
    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file, self.line, self.column)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.bump();
                }
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn expect(&mut self, byte: u8, diag: &mut Diagnostics) -> Result<(), ()> {
        self.skip_trivia();
        if self.peek() == Some(byte) {
            self.bump();
            Ok(())
        } else {
            diag.error(
                DiagKind::ParseError,
                Some(self.loc()),
                format!("expected '{}'", byte as char),
            );
            Err(())
        }
    }

    fn parse_value(&mut self, diag: &mut Diagnostics) -> Result<JsonValue, ()> {
        self.skip_trivia();
        let loc = self.loc();
        match self.peek() {
            Some(b'{') => self.parse_object(loc, diag),
            Some(b'[') => self.parse_array(loc, diag),
            Some(b'"') => {
                let s = self.parse_string(diag)?;
                Ok(JsonValue {
                    kind: JsonKind::Str(s),
                    loc,
                })
            }
            Some(b) if b == b'-' || b == b'+' || b.is_ascii_digit() => {
                self.parse_number(loc, diag)
            }
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.parse_ident(loc, diag),
            _ => {
                diag.error(DiagKind::ParseError, Some(loc), "unexpected token");
                Err(())
            }
        }
    }

    fn parse_object(
        &mut self,
        loc: SourceLoc,
        diag: &mut Diagnostics,
    ) -> Result<JsonValue, ()> {
        self.bump(); // '{'
        let mut fields = Vec::new();
        self.skip_trivia();
        if self.peek() == Some(b'}') {
            self.bump();
            return Ok(JsonValue {
                kind: JsonKind::Object(fields),
                loc,
            });
        }
        loop {
            self.skip_trivia();
            if self.peek() != Some(b'"') {
                diag.error(
                    DiagKind::ParseError,
                    Some(self.loc()),
                    "expected object key",
                );
                return Err(());
            }
            let key = self.parse_string(diag)?;
            self.expect(b':', diag)?;
            let value = self.parse_value(diag)?;
            fields.push((key, value));
            self.skip_trivia();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b'}') => {
                    self.bump();
                    return Ok(JsonValue {
                        kind: JsonKind::Object(fields),
                        loc,
                    });
                }
                _ => {
                    diag.error(
                        DiagKind::ParseError,
                        Some(self.loc()),
                        "expected ',' or '}'",
                    );
                    return Err(());
                }
            }
        }
    }

    fn parse_array(&mut self, loc: SourceLoc, diag: &mut Diagnostics) -> Result<JsonValue, ()> {
        self.bump(); // '['
        let mut items = Vec::new();
        self.skip_trivia();
        if self.peek() == Some(b']') {
            self.bump();
            return Ok(JsonValue {
                kind: JsonKind::Array(items),
                loc,
            });
        }
        loop {
            items.push(self.parse_value(diag)?);
            self.skip_trivia();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b']') => {
                    self.bump();
                    return Ok(JsonValue {
                        kind: JsonKind::Array(items),
                        loc,
                    });
                }
                _ => {
                    diag.error(
                        DiagKind::ParseError,
                        Some(self.loc()),
                        "expected ',' or ']'",
                    );
                    return Err(());
                }
            }
        }
    }

    fn parse_string(&mut self, diag: &mut Diagnostics) -> Result<String, ()> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'/') => out.push('/'),
                    Some(b'b') => out.push('\u{8}'),
                    Some(b'f') => out.push('\u{c}'),
                    Some(b'n') => out.push('\n'),
                    Some(b'r') => out.push('\r'),
                    Some(b't') => out.push('\t'),
                    Some(b'u') => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let digit = self.bump().and_then(|b| (b as char).to_digit(16));
                            match digit {
                                Some(d) => code = code * 16 + d,
                                None => {
                                    diag.error(
                                        DiagKind::ParseError,
                                        Some(self.loc()),
                                        "invalid \\u escape",
                                    );
                                    return Err(());
                                }
                            }
                        }
                        out.push(std::char::from_u32(code).unwrap_or('\u{fffd}'));
                    }
                    _ => {
                        diag.error(
                            DiagKind::ParseError,
                            Some(self.loc()),
                            "invalid escape sequence",
                        );
                        return Err(());
                    }
                },
                Some(b) if b < 0x80 => out.push(b as char),
                Some(b) => {
                    // Re-assemble multi-byte UTF-8 from the source slice.
                    let start = self.pos - 1;
                    let len = utf8_len(b);
                    for _ in 1..len {
                        self.bump();
                    }
                    match std::str::from_utf8(&self.bytes[start..start + len]) {
                        Ok(s) => out.push_str(s),
                        Err(_) => out.push('\u{fffd}'),
                    }
                }
                None => {
                    diag.error(
                        DiagKind::ParseError,
                        Some(self.loc()),
                        "unterminated string",
                    );
                    return Err(());
                }
            }
        }
    }

    fn parse_number(&mut self, loc: SourceLoc, diag: &mut Diagnostics) -> Result<JsonValue, ()> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit()
                || b == b'-'
                || b == b'+'
                || b == b'.'
                || b == b'e'
                || b == b'E'
            {
                self.bump();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        match text.parse::<f64>() {
            Ok(n) => Ok(JsonValue {
                kind: JsonKind::Number(n),
                loc,
            }),
            Err(_) => {
                diag.error(
                    DiagKind::ParseError,
                    Some(loc),
                    format!("malformed number '{}'", text),
                );
                Err(())
            }
        }
    }

    fn parse_ident(&mut self, loc: SourceLoc, diag: &mut Diagnostics) -> Result<JsonValue, ()> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let word = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("");
        match word {
            "true" => Ok(JsonValue {
                kind: JsonKind::Bool(true),
                loc,
            }),
            "false" => Ok(JsonValue {
                kind: JsonKind::Bool(false),
                loc,
            }),
            "null" => Ok(JsonValue {
                kind: JsonKind::Null,
                loc,
            }),
            _ => {
                diag.error(
                    DiagKind::ParseError,
                    Some(loc),
                    format!("unexpected identifier '{}'", word),
                );
                Err(())
            }
        }
    }
}

fn utf8_len(first: u8) -> usize {
    if first & 0xe0 == 0xc0 {
        2
    } else if first & 0xf0 == 0xe0 {
        3
    } else if first & 0xf8 == 0xf0 {
        4
    } else {
        1
    }
}
