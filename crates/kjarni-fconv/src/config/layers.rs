//! Parser for the layer and attention expressions.
//!
//! Layers are written as list arithmetic over `(channels, kernel)` tuples:
//!
//! ```text
//! expr  := term ('+' term)*
//! term  := list ('*' int)?
//! list  := '[' tuple (',' tuple)* ','? ']'
//! tuple := '(' int ',' int ')'
//! ```
//!
//! so `[(512, 3)] * 9 + [(1024, 3)] * 4` is nine 512-channel layers followed
//! by four 1024-channel layers.

use anyhow::Result;

use crate::config::ConvSpec;
use crate::error::FConvError;

/// Upper bound on the number of layers one expression may produce.
pub const MAX_LAYERS: usize = 1024;

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> FConvError {
        FConvError::InvalidExpression {
            expr: self.src.to_string(),
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: u8) -> Result<(), FConvError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c as char)))
        }
    }

    fn at_end(&mut self) -> bool {
        self.peek().is_none()
    }

    fn int(&mut self) -> Result<usize, FConvError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected an integer"));
        }
        self.src[start..self.pos].parse::<usize>().map_err(|e| {
            self.pos = start;
            self.error(e.to_string())
        })
    }

    fn word(&mut self) -> &'a str {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_alphabetic() {
            self.pos += 1;
        }
        &self.src[start..self.pos]
    }

    fn boolean(&mut self) -> Result<bool, FConvError> {
        let start = self.pos;
        match self.word() {
            "True" | "true" => Ok(true),
            "False" | "false" => Ok(false),
            _ => {
                self.pos = start;
                self.skip_ws();
                Err(self.error("expected True or False"))
            }
        }
    }

    fn tuple(&mut self) -> Result<ConvSpec, FConvError> {
        self.expect(b'(')?;
        let out_channels = self.int()?;
        self.expect(b',')?;
        let kernel_size = self.int()?;
        self.expect(b')')?;
        Ok(ConvSpec {
            out_channels,
            kernel_size,
        })
    }

    fn list(&mut self) -> Result<Vec<ConvSpec>, FConvError> {
        self.expect(b'[')?;
        let mut items = vec![self.tuple()?];
        while self.eat(b',') {
            if self.peek() == Some(b']') {
                break;
            }
            items.push(self.tuple()?);
        }
        self.expect(b']')?;
        Ok(items)
    }

    fn term(&mut self) -> Result<Vec<ConvSpec>, FConvError> {
        let items = self.list()?;
        if self.eat(b'*') {
            let start = self.pos;
            let times = self.int()?;
            return match items.len().checked_mul(times) {
                Some(total) if total <= MAX_LAYERS => Ok(items.repeat(times)),
                _ => {
                    self.pos = start;
                    self.skip_ws();
                    Err(self.error(format!("repeat count {} exceeds {} layers", times, MAX_LAYERS)))
                }
            };
        }
        Ok(items)
    }

    fn layers(&mut self) -> Result<Vec<ConvSpec>, FConvError> {
        let mut layers = self.term()?;
        while self.eat(b'+') {
            let start = self.pos;
            let term = self.term()?;
            if layers.len() + term.len() > MAX_LAYERS {
                self.pos = start;
                self.skip_ws();
                return Err(self.error(format!("expression exceeds {} layers", MAX_LAYERS)));
            }
            layers.extend(term);
        }
        if !self.at_end() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(layers)
    }
}

/// Parses a layer expression such as `[(512, 3)] * 20`.
pub fn parse_layers(expr: &str) -> Result<Vec<ConvSpec>> {
    let layers = Parser::new(expr).layers()?;
    if layers.is_empty() {
        return Err(FConvError::InvalidExpression {
            expr: expr.to_string(),
            offset: 0,
            reason: "expression yields no layers".to_string(),
        }
        .into());
    }
    Ok(layers)
}

/// Parses an attention expression and expands it to one flag per layer.
///
/// A bare `True`/`False` applies to every layer; a list must name every layer.
pub fn parse_attention(expr: &str, num_layers: usize) -> Result<Vec<bool>> {
    let mut p = Parser::new(expr);
    let flags = if p.peek() == Some(b'[') {
        p.expect(b'[')?;
        let mut flags = Vec::new();
        if p.peek() != Some(b']') {
            flags.push(p.boolean()?);
            while p.eat(b',') {
                if p.peek() == Some(b']') {
                    break;
                }
                flags.push(p.boolean()?);
            }
        }
        p.expect(b']')?;
        flags
    } else {
        vec![p.boolean()?; num_layers]
    };
    if !p.at_end() {
        return Err(p.error("unexpected trailing input").into());
    }
    if flags.len() != num_layers {
        return Err(FConvError::InvalidConfig(format!(
            "Attention is expected to be a list of booleans of length equal to the number of layers ({} given, {} layers)",
            flags.len(),
            num_layers
        ))
        .into());
    }
    Ok(flags)
}
