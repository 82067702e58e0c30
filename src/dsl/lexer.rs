use super::ast::Span;
use super::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Number(f64),
    Str(String),
    /// `$"..."`, split into text and embedded-code segments.
    Interpolated(Vec<InterpSegment>),
    True,
    False,
    Null,

    // Identifiers & keywords
    Ident(String),
    Var,
    If,
    Else,
    While,
    For,
    Return,
    Print,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,   // ++
    MinusMinus, // --
    Lt,
    Gt,
    Le,       // <=
    Ge,       // >=
    EqEq,     // ==
    Ne,       // !=
    And,      // &&
    Or,       // ||
    Bang,     // !
    Eq,       // =
    FatArrow, // =>

    Eof,
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpSegment {
    Text(String),
    /// Source of an embedded expression and its byte offset in the script.
    Code { source: String, offset: usize },
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    lex_fragment(source, 0)
}

/// Lex a piece of a larger script whose first byte sits at `base` in the
/// original source. Used for the code segments of interpolated strings.
pub fn lex_fragment(source: &str, base: usize) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    let mut lexer = Lexer::new(source, base);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    base: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, base: usize) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            base,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments();
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b'{' => self.single(Token::LBrace),
                b'}' => self.single(Token::RBrace),
                b'[' => self.single(Token::LBracket),
                b']' => self.single(Token::RBracket),
                b',' => self.single(Token::Comma),
                b'.' => self.single(Token::Dot),
                b':' => self.single(Token::Colon),
                b';' => self.single(Token::Semicolon),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'%' => self.single(Token::Percent),
                b'+' => self.one_or_two(b'+', Token::PlusPlus, Token::Plus),
                b'-' => self.one_or_two(b'-', Token::MinusMinus, Token::Minus),
                b'<' => self.one_or_two(b'=', Token::Le, Token::Lt),
                b'>' => self.one_or_two(b'=', Token::Ge, Token::Gt),
                b'!' => self.one_or_two(b'=', Token::Ne, Token::Bang),
                b'=' => {
                    self.pos += 1;
                    if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.push(Token::EqEq, start, self.pos);
                    } else if self.peek() == Some(b'>') {
                        self.pos += 1;
                        self.push(Token::FatArrow, start, self.pos);
                    } else {
                        self.push(Token::Eq, start, self.pos);
                    }
                }
                b'|' => {
                    self.pos += 1;
                    if self.peek() == Some(b'|') {
                        self.pos += 1;
                        self.push(Token::Or, start, self.pos);
                    } else {
                        self.error("Expected '||' for logical OR", start, self.pos);
                    }
                }
                b'&' => {
                    self.pos += 1;
                    if self.peek() == Some(b'&') {
                        self.pos += 1;
                        self.push(Token::And, start, self.pos);
                    } else {
                        self.error("Expected '&&' for logical AND", start, self.pos);
                    }
                }
                b'$' if self.bytes.get(self.pos + 1) == Some(&b'"') => {
                    self.pos += 2;
                    self.lex_interpolated(start);
                }
                b'"' => {
                    self.pos += 1;
                    self.lex_string(start);
                }
                b'0'..=b'9' => {
                    self.lex_number(start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    self.lex_ident(start);
                }
                _ => {
                    let ch = self.source[start..].chars().next().unwrap_or('?');
                    self.pos += ch.len_utf8();
                    self.error(format!("Unexpected character: '{ch}'"), start, self.pos);
                }
            }
        }

        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(self.base + self.pos, self.base + self.pos),
        });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        self.tokens.push(SpannedToken {
            token,
            span: Span::new(self.base + start, self.base + end),
        });
    }

    fn error(&mut self, message: impl Into<String>, start: usize, end: usize) {
        self.errors.push(CompileError::lexer(
            message,
            Span::new(self.base + start, self.base + end),
        ));
    }

    fn single(&mut self, token: Token) {
        let start = self.pos;
        self.pos += 1;
        self.push(token, start, self.pos);
    }

    /// Lex `X` or `X<next>` depending on the following byte.
    fn one_or_two(&mut self, next: u8, double: Token, single: Token) {
        let start = self.pos;
        self.pos += 1;
        if self.peek() == Some(next) {
            self.pos += 1;
            self.push(double, start, self.pos);
        } else {
            self.push(single, start, self.pos);
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos + 1 >= self.bytes.len() {
                            self.pos = self.bytes.len();
                            self.error("Unterminated block comment", start, self.pos);
                            break;
                        }
                        if self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Read one (possibly escaped) character of a string body. Returns
    /// `None` at the closing quote, end of line or end of input.
    fn string_char(&mut self) -> Option<char> {
        let ch = self.source[self.pos..].chars().next()?;
        match ch {
            '"' | '\n' => None,
            '\\' => {
                let escaped = self.source[self.pos + 1..].chars().next();
                let out = match escaped {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some(c @ ('"' | '\\' | '{' | '}')) => c,
                    Some(other) => {
                        self.error(
                            format!("Unknown escape sequence '\\{other}'"),
                            self.pos,
                            self.pos + 1 + other.len_utf8(),
                        );
                        other
                    }
                    None => {
                        self.pos += 1;
                        return None;
                    }
                };
                self.pos += 1 + escaped.map_or(0, char::len_utf8);
                Some(out)
            }
            c => {
                self.pos += c.len_utf8();
                Some(c)
            }
        }
    }

    fn close_string(&mut self, start: usize) {
        if self.peek() == Some(b'"') {
            self.pos += 1;
        } else {
            self.error("Unterminated string literal", start, self.pos);
        }
    }

    fn lex_string(&mut self, start: usize) {
        let mut s = String::new();
        while let Some(c) = self.string_char() {
            s.push(c);
        }
        self.close_string(start);
        self.push(Token::Str(s), start, self.pos);
    }

    fn lex_interpolated(&mut self, start: usize) {
        let mut segments = Vec::new();
        let mut text = String::new();
        loop {
            if self.peek() == Some(b'{') {
                if !text.is_empty() {
                    segments.push(InterpSegment::Text(std::mem::take(&mut text)));
                }
                self.pos += 1;
                let code_start = self.pos;
                let mut depth = 0usize;
                while let Some(b) = self.peek() {
                    match b {
                        b'}' if depth == 0 => break,
                        b'}' => depth -= 1,
                        b'{' => depth += 1,
                        b'"' | b'\n' => break,
                        _ => {}
                    }
                    self.pos += 1;
                }
                if self.peek() == Some(b'}') {
                    segments.push(InterpSegment::Code {
                        source: self.source[code_start..self.pos].to_string(),
                        offset: self.base + code_start,
                    });
                    self.pos += 1;
                } else {
                    self.error("Unterminated '{' in interpolated string", code_start - 1, self.pos);
                    break;
                }
                continue;
            }
            match self.string_char() {
                Some(c) => text.push(c),
                None => break,
            }
        }
        if !text.is_empty() {
            segments.push(InterpSegment::Text(text));
        }
        self.close_string(start);
        self.push(Token::Interpolated(segments), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos < self.bytes.len()
            && self.bytes[self.pos] == b'.'
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1; // skip '.'
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = &self.source[start..self.pos];
        match text.parse::<f64>() {
            Ok(v) => self.push(Token::Number(v), start, self.pos),
            Err(_) => self.error(format!("Invalid number: {text}"), start, self.pos),
        }
    }

    fn lex_ident(&mut self, start: usize) {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        let token = match word {
            "var" => Token::Var,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "return" => Token::Return,
            "print" => Token::Print,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            _ => Token::Ident(word.to_string()),
        };
        self.push(token, start, self.pos);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn simple_tokens() {
        let tokens = tok("1 + 2.5");
        assert_eq!(tokens, vec![Token::Number(1.0), Token::Plus, Token::Number(2.5), Token::Eof]);
    }

    #[test]
    fn keywords() {
        let tokens = tok("var if else while for return print null");
        assert_eq!(tokens, vec![
            Token::Var, Token::If, Token::Else, Token::While,
            Token::For, Token::Return, Token::Print, Token::Null, Token::Eof,
        ]);
    }

    #[test]
    fn operators() {
        let tokens = tok("+ - * / % < > <= >= == != && || ! ++ -- = =>");
        assert_eq!(tokens, vec![
            Token::Plus, Token::Minus, Token::Star, Token::Slash, Token::Percent,
            Token::Lt, Token::Gt, Token::Le, Token::Ge, Token::EqEq, Token::Ne,
            Token::And, Token::Or, Token::Bang, Token::PlusPlus, Token::MinusMinus,
            Token::Eq, Token::FatArrow, Token::Eof,
        ]);
    }

    #[test]
    fn brackets_and_punctuation() {
        let tokens = tok("a[0].b: c;");
        assert_eq!(tokens, vec![
            Token::Ident("a".into()), Token::LBracket, Token::Number(0.0), Token::RBracket,
            Token::Dot, Token::Ident("b".into()), Token::Colon, Token::Ident("c".into()),
            Token::Semicolon, Token::Eof,
        ]);
    }

    #[test]
    fn string_escapes() {
        let tokens = tok(r#""a\"b\n""#);
        assert_eq!(tokens, vec![Token::Str("a\"b\n".into()), Token::Eof]);
    }

    #[test]
    fn unterminated_string_is_error() {
        let errors = lex("\"abc").unwrap_err();
        assert!(errors[0].message.contains("Unterminated"));
    }

    #[test]
    fn comments_stripped() {
        let tokens = tok("x // line\n/* block\n comment */ y");
        assert_eq!(tokens, vec![Token::Ident("x".into()), Token::Ident("y".into()), Token::Eof]);
    }

    #[test]
    fn interpolated_segments() {
        let tokens = tok(r#"$"sum {a + b}!""#);
        assert_eq!(tokens, vec![
            Token::Interpolated(vec![
                InterpSegment::Text("sum ".into()),
                InterpSegment::Code { source: "a + b".into(), offset: 7 },
                InterpSegment::Text("!".into()),
            ]),
            Token::Eof,
        ]);
    }

    #[test]
    fn fragment_spans_are_offset() {
        let tokens = lex_fragment("a + b", 10).unwrap();
        assert_eq!(tokens[0].span, Span::new(10, 11));
        assert_eq!(tokens[2].span, Span::new(14, 15));
    }

    #[test]
    fn unexpected_character() {
        let errors = lex("a # b").unwrap_err();
        assert!(errors[0].message.contains("Unexpected character"));
    }
}
