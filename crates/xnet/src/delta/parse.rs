//! Reader for the text form of the delta tables:
//!
//! ```text
//! usercmd_t none
//! {
//!     DEFINE_DELTA( forwardmove, DT_SIGNED | DT_FLOAT, 12, 1.0 ),
//!     DEFINE_DELTA_POST( waveHeight, DT_SIGNED | DT_FLOAT, 16, 16.0, 8.0 )
//! }
//! ```

use super::field::FieldFlags;
use super::table::{DeltaRegistry, EncodeTarget, RecordKind};
use crate::error::ConfigError;

struct Tokens<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Tokens<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
        }
    }

    fn skip_space_and_comments(&mut self) {
        let bytes = self.src.as_bytes();
        while self.pos < bytes.len() {
            match bytes[self.pos] {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c.is_ascii_whitespace() => self.pos += 1,
                b'/' if bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if bytes.get(self.pos + 1) == Some(&b'*') => {
                    self.pos += 2;
                    while self.pos < bytes.len()
                        && !(bytes[self.pos] == b'*' && bytes.get(self.pos + 1) == Some(&b'/'))
                    {
                        if bytes[self.pos] == b'\n' {
                            self.line += 1;
                        }
                        self.pos += 1;
                    }
                    self.pos = (self.pos + 2).min(bytes.len());
                }
                _ => break,
            }
        }
    }

    fn next(&mut self) -> Option<&'a str> {
        self.skip_space_and_comments();
        let bytes = self.src.as_bytes();
        let start = self.pos;
        let first = *bytes.get(start)?;

        if matches!(first, b'{' | b'}' | b'(' | b')' | b',' | b'|' | b';') {
            self.pos += 1;
            return Some(&self.src[start..self.pos]);
        }

        if first == b'"' {
            self.pos += 1;
            while self.pos < bytes.len() && bytes[self.pos] != b'"' {
                self.pos += 1;
            }
            let token = &self.src[start + 1..self.pos];
            self.pos = (self.pos + 1).min(bytes.len());
            return Some(token);
        }

        while self.pos < bytes.len() {
            let c = bytes[self.pos];
            if c.is_ascii_whitespace() || matches!(c, b'{' | b'}' | b'(' | b')' | b',' | b'|' | b';')
            {
                break;
            }
            self.pos += 1;
        }
        Some(&self.src[start..self.pos])
    }

    fn require(&mut self) -> Result<&'a str, ConfigError> {
        self.next()
            .ok_or(ConfigError::UnexpectedEof { line: self.line })
    }

    fn expect(&mut self, expected: &'static str) -> Result<(), ConfigError> {
        let token = self.require()?;
        if token != expected {
            return Err(ConfigError::Expected {
                line: self.line,
                expected,
                found: token.to_string(),
            });
        }
        Ok(())
    }

    fn number<T: std::str::FromStr>(&mut self) -> Result<T, ConfigError> {
        let token = self.require()?;
        token.parse().map_err(|_| ConfigError::BadNumber {
            line: self.line,
            value: token.to_string(),
        })
    }
}

/// Loads every table block of `text` into `registry`. A block replaces any
/// earlier definition of the same table.
pub fn parse_description(text: &str, registry: &mut DeltaRegistry) -> Result<(), ConfigError> {
    let mut tokens = Tokens::new(text);

    while let Some(name) = tokens.next() {
        let kind = RecordKind::from_name(name).ok_or_else(|| ConfigError::UnknownStruct {
            line: tokens.line,
            name: name.to_string(),
        })?;

        let target_token = tokens.require()?;
        let target = EncodeTarget::from_token(target_token).ok_or_else(|| ConfigError::Expected {
            line: tokens.line,
            expected: "none, gamedll or clientdll",
            found: target_token.to_string(),
        })?;

        let encoder = match target {
            EncodeTarget::None => None,
            _ => Some(tokens.require()?.to_string()),
        };

        tokens.expect("{")?;

        let table = registry.table_mut(kind);
        table.clear();
        table.set_encoder(target, encoder);
        parse_table(&mut tokens, kind, registry)?;
    }

    registry.resolve_encoders();
    Ok(())
}

fn parse_table(
    tokens: &mut Tokens<'_>,
    kind: RecordKind,
    registry: &mut DeltaRegistry,
) -> Result<(), ConfigError> {
    loop {
        match tokens.require()? {
            "}" => break,
            "," | ";" => continue,
            "DEFINE_DELTA" => parse_field(tokens, kind, registry, false)?,
            "DEFINE_DELTA_POST" => parse_field(tokens, kind, registry, true)?,
            other => {
                return Err(ConfigError::Expected {
                    line: tokens.line,
                    expected: "DEFINE_DELTA",
                    found: other.to_string(),
                });
            }
        }
    }

    log::debug!("{kind}: {} fields", registry.table(kind).len());
    Ok(())
}

fn parse_field(
    tokens: &mut Tokens<'_>,
    kind: RecordKind,
    registry: &mut DeltaRegistry,
    post: bool,
) -> Result<(), ConfigError> {
    tokens.expect("(")?;
    let name = tokens.require()?;
    tokens.expect(",")?;

    let mut flags = FieldFlags::empty();
    loop {
        match tokens.require()? {
            "," => break,
            "|" => continue,
            flag => {
                flags |= FieldFlags::from_token(flag).ok_or_else(|| ConfigError::UnknownFlag {
                    line: tokens.line,
                    flag: flag.to_string(),
                })?;
            }
        }
    }

    let bits: u32 = tokens.number()?;
    tokens.expect(",")?;
    let multiplier: f32 = tokens.number()?;

    let post_multiplier = if post {
        tokens.expect(",")?;
        tokens.number()?
    } else {
        1.0
    };

    tokens.expect(")")?;

    registry
        .table_mut(kind)
        .add_field(name, flags, bits, multiplier, post_multiplier)
}
