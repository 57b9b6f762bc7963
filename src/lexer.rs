//! Token stream for the surface language.
//!
//! Newlines are significant: the scanner emits [`Token::Line`] and the parser
//! decides where they terminate statements. Strings carry raw bytes because
//! escapes like `\xff` can produce sequences that are not valid UTF-8.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Colon,
    Dot,
    DotDot,
    DotDotDot,
    Comma,
    Star,
    Slash,
    Percent,
    Plus,
    Minus,
    Pipe,
    PipePipe,
    Caret,
    Amp,
    AmpAmp,
    Bang,
    BangEq,
    Tilde,
    Question,
    Eq,
    EqEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LtLt,
    GtGt,
    Name(String),
    /// Instance field reference: a name starting with `_`.
    Field(String),
    Str(Vec<u8>),
    Number(f64),
    KwBreak,
    KwContinue,
    KwClass,
    KwConstruct,
    KwElse,
    KwFalse,
    KwFor,
    KwForeign,
    KwIf,
    KwImport,
    KwIn,
    KwIs,
    KwNull,
    KwReturn,
    KwStatic,
    KwSuper,
    KwThis,
    KwTrue,
    KwVar,
    KwWhile,
    Dollar,
    Line,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(n) => write!(f, "{}", n),
            Token::Field(n) => write!(f, "{}", n),
            Token::Str(_) => write!(f, "string"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Line => write!(f, "newline"),
            Token::Eof => write!(f, "end of file"),
            other => {
                let text = match other {
                    Token::LeftParen => "(",
                    Token::RightParen => ")",
                    Token::LeftBracket => "[",
                    Token::RightBracket => "]",
                    Token::LeftBrace => "{",
                    Token::RightBrace => "}",
                    Token::Colon => ":",
                    Token::Dot => ".",
                    Token::DotDot => "..",
                    Token::DotDotDot => "...",
                    Token::Comma => ",",
                    Token::Star => "*",
                    Token::Slash => "/",
                    Token::Percent => "%",
                    Token::Plus => "+",
                    Token::Minus => "-",
                    Token::Pipe => "|",
                    Token::PipePipe => "||",
                    Token::Caret => "^",
                    Token::Amp => "&",
                    Token::AmpAmp => "&&",
                    Token::Bang => "!",
                    Token::BangEq => "!=",
                    Token::Tilde => "~",
                    Token::Question => "?",
                    Token::Eq => "=",
                    Token::EqEq => "==",
                    Token::Lt => "<",
                    Token::Gt => ">",
                    Token::LtEq => "<=",
                    Token::GtEq => ">=",
                    Token::LtLt => "<<",
                    Token::GtGt => ">>",
                    Token::KwBreak => "break",
                    Token::KwContinue => "continue",
                    Token::KwClass => "class",
                    Token::KwConstruct => "construct",
                    Token::KwElse => "else",
                    Token::KwFalse => "false",
                    Token::KwFor => "for",
                    Token::KwForeign => "foreign",
                    Token::KwIf => "if",
                    Token::KwImport => "import",
                    Token::KwIn => "in",
                    Token::KwIs => "is",
                    Token::KwNull => "null",
                    Token::KwReturn => "return",
                    Token::KwStatic => "static",
                    Token::KwSuper => "super",
                    Token::KwThis => "this",
                    Token::KwTrue => "true",
                    Token::KwVar => "var",
                    Token::KwWhile => "while",
                    Token::Dollar => "$",
                    _ => "?",
                };
                write!(f, "{}", text)
            }
        }
    }
}

/// A token tagged with the source line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub line: u32,
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: u32,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Lexer {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    /// Consume `expected` if it is next; report whether it was.
    fn matches(&mut self, expected: char) -> bool {
        if self.current() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), String> {
        // Supports nesting; the opening "/*" is already consumed.
        let mut depth = 1usize;
        while depth > 0 {
            match self.advance() {
                Some('/') if self.current() == Some('*') => {
                    self.advance();
                    depth += 1;
                }
                Some('*') if self.current() == Some('/') => {
                    self.advance();
                    depth -= 1;
                }
                Some(_) => {}
                None => return Err("Unterminated block comment.".to_string()),
            }
        }
        Ok(())
    }

    fn read_string(&mut self) -> Result<Vec<u8>, String> {
        let mut bytes = Vec::new();
        loop {
            let Some(ch) = self.advance() else {
                return Err("Unterminated string.".to_string());
            };
            match ch {
                '"' => return Ok(bytes),
                '\\' => {
                    let Some(esc) = self.advance() else {
                        return Err("Unterminated string.".to_string());
                    };
                    match esc {
                        '0' => bytes.push(0),
                        'a' => bytes.push(0x07),
                        'b' => bytes.push(0x08),
                        'e' => bytes.push(0x1b),
                        'f' => bytes.push(0x0c),
                        'n' => bytes.push(b'\n'),
                        'r' => bytes.push(b'\r'),
                        't' => bytes.push(b'\t'),
                        'v' => bytes.push(0x0b),
                        '"' => bytes.push(b'"'),
                        '\\' => bytes.push(b'\\'),
                        '%' => bytes.push(b'%'),
                        '$' => bytes.push(b'$'),
                        'x' => bytes.push(self.read_hex_escape(2)? as u8),
                        'u' => {
                            let cp = self.read_hex_escape(4)?;
                            push_utf8(&mut bytes, cp);
                        }
                        'U' => {
                            let cp = self.read_hex_escape(8)?;
                            push_utf8(&mut bytes, cp);
                        }
                        other => {
                            return Err(format!("Invalid escape character '{}'.", other));
                        }
                    }
                }
                _ => {
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn read_hex_escape(&mut self, digits: usize) -> Result<u32, String> {
        let mut value = 0u32;
        for _ in 0..digits {
            let Some(ch) = self.advance() else {
                return Err("Incomplete escape sequence.".to_string());
            };
            let digit = ch
                .to_digit(16)
                .ok_or_else(|| "Invalid escape sequence.".to_string())?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    fn read_number(&mut self, first: char) -> Result<f64, String> {
        let mut text = String::new();
        text.push(first);
        if first == '0' && (self.current() == Some('x') || self.current() == Some('X')) {
            self.advance();
            let mut hex = String::new();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
            if hex.is_empty() {
                return Err("Invalid hex literal.".to_string());
            }
            return u64::from_str_radix(&hex, 16)
                .map(|v| v as f64)
                .map_err(|_| "Invalid hex literal.".to_string());
        }
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        // A '.' is part of the number only when a digit follows; `1..2` is a
        // range expression on the literal 1.
        if self.current() == Some('.') && self.peek(1).map_or(false, |c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(ch) = self.current() {
                if ch.is_ascii_digit() {
                    text.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let mut lookahead = 1;
            if matches!(self.peek(1), Some('+') | Some('-')) {
                lookahead = 2;
            }
            if self.peek(lookahead).map_or(false, |c| c.is_ascii_digit()) {
                text.push('e');
                self.advance();
                if matches!(self.current(), Some('+') | Some('-')) {
                    if let Some(sign) = self.advance() {
                        text.push(sign);
                    }
                }
                while let Some(ch) = self.current() {
                    if ch.is_ascii_digit() {
                        text.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }
        text.parse::<f64>()
            .map_err(|_| "Invalid number literal.".to_string())
    }

    fn read_name(&mut self, first: char) -> Token {
        let mut name = String::new();
        name.push(first);
        while let Some(ch) = self.current() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if first == '_' {
            return Token::Field(name);
        }
        match name.as_str() {
            "break" => Token::KwBreak,
            "continue" => Token::KwContinue,
            "class" => Token::KwClass,
            "construct" => Token::KwConstruct,
            "else" => Token::KwElse,
            "false" => Token::KwFalse,
            "for" => Token::KwFor,
            "foreign" => Token::KwForeign,
            "if" => Token::KwIf,
            "import" => Token::KwImport,
            "in" => Token::KwIn,
            "is" => Token::KwIs,
            "null" => Token::KwNull,
            "return" => Token::KwReturn,
            "static" => Token::KwStatic,
            "super" => Token::KwSuper,
            "this" => Token::KwThis,
            "true" => Token::KwTrue,
            "var" => Token::KwVar,
            "while" => Token::KwWhile,
            _ => Token::Name(name),
        }
    }

    /// Produce the next token. Errors carry a message; the line is available
    /// from the returned span of the previous token or [`Lexer::line`].
    pub fn next_token(&mut self) -> Result<SpannedToken, (u32, String)> {
        loop {
            let line = self.line;
            let Some(ch) = self.advance() else {
                return Ok(SpannedToken {
                    token: Token::Eof,
                    line,
                });
            };
            let token = match ch {
                ' ' | '\t' | '\r' => continue,
                '\n' => Token::Line,
                '/' if self.current() == Some('/') => {
                    self.skip_line_comment();
                    continue;
                }
                '/' if self.current() == Some('*') => {
                    self.advance();
                    self.skip_block_comment().map_err(|m| (line, m))?;
                    continue;
                }
                '(' => Token::LeftParen,
                ')' => Token::RightParen,
                '[' => Token::LeftBracket,
                ']' => Token::RightBracket,
                '{' => Token::LeftBrace,
                '}' => Token::RightBrace,
                ':' => Token::Colon,
                ',' => Token::Comma,
                '*' => Token::Star,
                '/' => Token::Slash,
                '%' => Token::Percent,
                '+' => Token::Plus,
                '-' => Token::Minus,
                '^' => Token::Caret,
                '~' => Token::Tilde,
                '?' => Token::Question,
                '$' => Token::Dollar,
                '|' => {
                    if self.matches('|') {
                        Token::PipePipe
                    } else {
                        Token::Pipe
                    }
                }
                '&' => {
                    if self.matches('&') {
                        Token::AmpAmp
                    } else {
                        Token::Amp
                    }
                }
                '!' => {
                    if self.matches('=') {
                        Token::BangEq
                    } else {
                        Token::Bang
                    }
                }
                '=' => {
                    if self.matches('=') {
                        Token::EqEq
                    } else {
                        Token::Eq
                    }
                }
                '<' => {
                    if self.matches('<') {
                        Token::LtLt
                    } else if self.matches('=') {
                        Token::LtEq
                    } else {
                        Token::Lt
                    }
                }
                '>' => {
                    if self.matches('>') {
                        Token::GtGt
                    } else if self.matches('=') {
                        Token::GtEq
                    } else {
                        Token::Gt
                    }
                }
                '.' => {
                    if self.matches('.') {
                        if self.matches('.') {
                            Token::DotDotDot
                        } else {
                            Token::DotDot
                        }
                    } else {
                        Token::Dot
                    }
                }
                '"' => Token::Str(self.read_string().map_err(|m| (line, m))?),
                c if c.is_ascii_digit() => {
                    Token::Number(self.read_number(c).map_err(|m| (line, m))?)
                }
                c if c.is_ascii_alphabetic() || c == '_' => self.read_name(c),
                other => {
                    return Err((line, format!("Invalid character '{}'.", other)));
                }
            };
            return Ok(SpannedToken { token, line });
        }
    }
}

fn push_utf8(bytes: &mut Vec<u8>, code_point: u32) {
    match char::from_u32(code_point) {
        Some(ch) => {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        }
        // Out-of-range escapes degrade to the replacement character.
        None => bytes.extend_from_slice("\u{fffd}".as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let spanned = lexer.next_token().expect("lex error");
            let done = spanned.token == Token::Eof;
            tokens.push(spanned.token);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn test_operators_and_ranges() {
        let tokens = lex_all("1..5 2...3");
        assert_eq!(
            tokens,
            vec![
                Token::Number(1.0),
                Token::DotDot,
                Token::Number(5.0),
                Token::Number(2.0),
                Token::DotDotDot,
                Token::Number(3.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = lex_all("3.25 0x1f 1e3 2.5e-2");
        assert_eq!(
            tokens,
            vec![
                Token::Number(3.25),
                Token::Number(31.0),
                Token::Number(1000.0),
                Token::Number(0.025),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_and_fields() {
        let tokens = lex_all("class Foo { _bar }");
        assert_eq!(
            tokens,
            vec![
                Token::KwClass,
                Token::Name("Foo".to_string()),
                Token::LeftBrace,
                Token::Field("_bar".to_string()),
                Token::RightBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex_all(r#""a\n\x41é""#);
        assert_eq!(
            tokens[0],
            Token::Str(vec![b'a', b'\n', 0x41, 0xc3, 0xa9])
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let tokens = lex_all("a // comment\nb /* x /* nested */ y */ c");
        assert_eq!(
            tokens,
            vec![
                Token::Name("a".to_string()),
                Token::Line,
                Token::Name("b".to_string()),
                Token::Name("c".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        let tokens = lex_all("<< >> <= >= == != && || | &");
        assert_eq!(
            tokens,
            vec![
                Token::LtLt,
                Token::GtGt,
                Token::LtEq,
                Token::GtEq,
                Token::EqEq,
                Token::BangEq,
                Token::AmpAmp,
                Token::PipePipe,
                Token::Pipe,
                Token::Amp,
                Token::Eof,
            ]
        );
    }
}
