//! Tokenizer for the expression language

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    /// `"..."`
    String(String),
    /// `[...]`
    Query(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Or,
    And,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source
    pub pos: usize,
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        let kind = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b'+' => {
                i += 1;
                TokenKind::Plus
            }
            b'-' => {
                i += 1;
                TokenKind::Minus
            }
            b'*' => {
                i += 1;
                TokenKind::Star
            }
            b'/' => {
                i += 1;
                TokenKind::Slash
            }
            b'|' | b'&' | b'=' => {
                if bytes.get(i + 1) != Some(&c) {
                    return Err(ParseError::new(start, format!("unexpected {:?}", c as char)));
                }
                i += 2;
                match c {
                    b'|' => TokenKind::Or,
                    b'&' => TokenKind::And,
                    _ => TokenKind::Eq,
                }
            }
            b'!' | b'>' | b'<' => {
                let eq = bytes.get(i + 1) == Some(&b'=');
                i += if eq { 2 } else { 1 };
                match (c, eq) {
                    (b'!', true) => TokenKind::Ne,
                    (b'!', false) => TokenKind::Not,
                    (b'>', true) => TokenKind::Ge,
                    (b'>', false) => TokenKind::Gt,
                    (_, true) => TokenKind::Le,
                    (_, false) => TokenKind::Lt,
                }
            }
            b'"' => {
                let (s, end) = lex_string(src, i)?;
                i = end;
                TokenKind::String(s)
            }
            b'[' => {
                let close = src[i..]
                    .find(']')
                    .ok_or_else(|| ParseError::new(start, "unterminated query literal"))?;
                let text = src[i + 1..i + close].trim().to_string();
                i += close + 1;
                TokenKind::Query(text)
            }
            b'0'..=b'9' | b'.' => {
                let end = scan_number(bytes, i);
                let text = &src[i..end];
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ParseError::new(start, format!("bad number {text:?}")))?;
                i = end;
                TokenKind::Number(n)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                TokenKind::Ident(src[start..i].to_string())
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(ParseError::new(start, format!("unexpected {ch:?}")));
            }
        };
        tokens.push(Token { kind, pos: start });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

/// Returns the unescaped contents and the offset just past the closing quote
fn lex_string(src: &str, start: usize) -> Result<(String, usize), ParseError> {
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();
    while let Some((off, ch)) = chars.next() {
        match ch {
            '"' => return Ok((out, start + 1 + off + 1)),
            '\\' => match chars.next() {
                Some((_, '"')) => out.push('"'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, 'n')) => out.push('\n'),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => break,
            },
            _ => out.push(ch),
        }
    }
    Err(ParseError::new(start, "unterminated string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a || b && !c != 1 >= 2 <= 3 == 4"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Or,
                TokenKind::Ident("b".into()),
                TokenKind::And,
                TokenKind::Not,
                TokenKind::Ident("c".into()),
                TokenKind::Ne,
                TokenKind::Number(1.0),
                TokenKind::Ge,
                TokenKind::Number(2.0),
                TokenKind::Le,
                TokenKind::Number(3.0),
                TokenKind::Eq,
                TokenKind::Number(4.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"q("avg:m{host=x}", "5m") [sum:rate:m{a=b}] 1.5e3"#),
            vec![
                TokenKind::Ident("q".into()),
                TokenKind::LParen,
                TokenKind::String("avg:m{host=x}".into()),
                TokenKind::Comma,
                TokenKind::String("5m".into()),
                TokenKind::RParen,
                TokenKind::Query("sum:rate:m{a=b}".into()),
                TokenKind::Number(1500.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("a | b").is_err());
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("[avg:m").is_err());
        assert!(tokenize("1 $ 2").is_err());
        assert_eq!(tokenize("1 = 2").unwrap_err().pos, 2);
    }
}
