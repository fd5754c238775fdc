// src/parser/lexer.rs
//! Lexical analyzer (tokenizer) for the script language

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,

    // Identifiers and literals
    Identifier(String),
    Number(f64),
    String(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,

    EqEq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,

    Concat,
    Ellipsis,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,

    Comma,
    Semicolon,
    Colon,
    Dot,
    Assign,

    // Special
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Identifier(s) => return write!(f, "'{}'", s),
            Token::Number(n) => return write!(f, "'{}'", n),
            Token::String(s) => return write!(f, "'{}'", s),
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::Elseif => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Caret => "^",
            Token::Hash => "#",
            Token::EqEq => "==",
            Token::NotEq => "~=",
            Token::Gt => ">",
            Token::Gte => ">=",
            Token::Lt => "<",
            Token::Lte => "<=",
            Token::Concat => "..",
            Token::Ellipsis => "...",
            Token::LeftParen => "(",
            Token::RightParen => ")",
            Token::LeftBrace => "{",
            Token::RightBrace => "}",
            Token::LeftBracket => "[",
            Token::RightBracket => "]",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Colon => ":",
            Token::Dot => ".",
            Token::Assign => "=",
            Token::Eof => return f.write_str("<eof>"),
        };
        write!(f, "'{}'", text)
    }
}

/// Keywords cannot be used as names or registered function names
pub fn is_keyword(word: &str) -> bool {
    keyword(word).is_some()
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word {
        "and" => Token::And,
        "break" => Token::Break,
        "do" => Token::Do,
        "else" => Token::Else,
        "elseif" => Token::Elseif,
        "end" => Token::End,
        "false" => Token::False,
        "for" => Token::For,
        "function" => Token::Function,
        "if" => Token::If,
        "in" => Token::In,
        "local" => Token::Local,
        "nil" => Token::Nil,
        "not" => Token::Not,
        "or" => Token::Or,
        "repeat" => Token::Repeat,
        "return" => Token::Return,
        "then" => Token::Then,
        "true" => Token::True,
        "until" => Token::Until,
        "while" => Token::While,
        _ => return None,
    };
    Some(token)
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    line: u32,
    token_line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for LexError {}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let mut lexer = Self {
            input: input.chars().collect(),
            position: 0,
            line: 1,
            token_line: 1,
        };
        // A leading shebang line is ignored
        if lexer.input.first() == Some(&'#') {
            while !lexer.is_at_end() && lexer.current_char() != '\n' {
                lexer.position += 1;
            }
        }
        lexer
    }

    /// Line on which the most recently returned token started
    pub fn line(&self) -> u32 {
        self.token_line
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments()?;
        self.token_line = self.line;

        if self.is_at_end() {
            return Ok(Token::Eof);
        }

        let ch = self.current_char();

        let token = match ch {
            '(' => Token::LeftParen,
            ')' => Token::RightParen,
            '{' => Token::LeftBrace,
            '}' => Token::RightBrace,
            ']' => Token::RightBracket,
            ';' => Token::Semicolon,
            ':' => Token::Colon,
            ',' => Token::Comma,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '#' => Token::Hash,
            '[' => {
                if let Some(level) = self.long_bracket_level() {
                    let text = self.read_long_bracket(level)?;
                    return Ok(Token::String(text));
                }
                Token::LeftBracket
            }
            '=' => return Ok(self.either('=', Token::EqEq, Token::Assign)),
            '<' => return Ok(self.either('=', Token::Lte, Token::Lt)),
            '>' => return Ok(self.either('=', Token::Gte, Token::Gt)),
            '~' => {
                self.advance();
                if self.match_char('=') {
                    return Ok(Token::NotEq);
                }
                return Err(self.error("unexpected symbol near '~'"));
            }
            '.' => {
                if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    return self.read_number();
                }
                self.advance();
                if self.match_char('.') {
                    if self.match_char('.') {
                        return Ok(Token::Ellipsis);
                    }
                    return Ok(Token::Concat);
                }
                return Ok(Token::Dot);
            }
            '"' | '\'' => return self.read_string(ch),
            _ => {
                if ch.is_ascii_digit() {
                    return self.read_number();
                }
                if ch.is_alphabetic() || ch == '_' {
                    return Ok(self.read_identifier());
                }
                return Err(self.error(&format!("unexpected symbol near '{}'", ch)));
            }
        };

        self.advance();
        Ok(token)
    }

    fn either(&mut self, next: char, matched: Token, single: Token) -> Token {
        self.advance();
        if self.match_char(next) {
            matched
        } else {
            single
        }
    }

    fn read_identifier(&mut self) -> Token {
        let start = self.position;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let identifier: String = self.input[start..self.position].iter().collect();
        keyword(&identifier).unwrap_or(Token::Identifier(identifier))
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;

        if self.current_char() == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();
            while !self.is_at_end() && self.current_char().is_ascii_hexdigit() {
                self.advance();
            }
            let digits: String = self.input[start + 2..self.position].iter().collect();
            return u64::from_str_radix(&digits, 16)
                .map(|n| Token::Number(n as f64))
                .map_err(|_| self.error(&format!("malformed number near '0x{}'", digits)));
        }

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else if ch == 'e' || ch == 'E' {
                self.advance();
                if !self.is_at_end() && matches!(self.current_char(), '+' | '-') {
                    self.advance();
                }
            } else {
                break;
            }
        }

        // Trailing letters make the literal malformed (`3x`)
        while !self.is_at_end() && (self.current_char().is_alphanumeric() || self.current_char() == '_') {
            self.advance();
        }

        let text: String = self.input[start..self.position].iter().collect();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(&format!("malformed number near '{}'", text)))
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        self.advance(); // opening quote

        let mut result = String::new();

        loop {
            if self.is_at_end() {
                return Err(self.error("unfinished string"));
            }
            let ch = self.current_char();
            if ch == quote {
                self.advance();
                break;
            }
            if ch == '\n' {
                return Err(self.error("unfinished string"));
            }

            if ch != '\\' {
                result.push(ch);
                self.advance();
                continue;
            }

            self.advance();
            if self.is_at_end() {
                return Err(self.error("unfinished string"));
            }
            let escaped = self.current_char();
            match escaped {
                'n' => result.push('\n'),
                't' => result.push('\t'),
                'r' => result.push('\r'),
                'a' => result.push('\u{7}'),
                'b' => result.push('\u{8}'),
                'f' => result.push('\u{c}'),
                'v' => result.push('\u{b}'),
                '\\' => result.push('\\'),
                '"' => result.push('"'),
                '\'' => result.push('\''),
                '\n' => result.push('\n'),
                'x' => {
                    self.advance();
                    let mut code = 0u32;
                    for _ in 0..2 {
                        let digit = self.current_digit(16)
                            .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                        code = code * 16 + digit;
                        self.advance();
                    }
                    result.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                    continue;
                }
                c if c.is_ascii_digit() => {
                    let mut code = 0u32;
                    for _ in 0..3 {
                        match self.current_digit(10) {
                            Some(digit) => {
                                code = code * 10 + digit;
                                self.advance();
                            }
                            None => break,
                        }
                    }
                    if code > 255 {
                        return Err(self.error("decimal escape too large"));
                    }
                    result.push(char::from_u32(code).unwrap_or('\u{fffd}'));
                    continue;
                }
                other => {
                    return Err(self.error(&format!("invalid escape sequence '\\{}'", other)));
                }
            }
            self.advance();
        }

        Ok(Token::String(result))
    }

    fn current_digit(&self, radix: u32) -> Option<u32> {
        if self.is_at_end() {
            return None;
        }
        self.current_char().to_digit(radix)
    }

    /// Level of a long bracket (`[[` is 0, `[==[` is 2) starting at the
    /// current position, if one starts here
    fn long_bracket_level(&self) -> Option<usize> {
        let mut offset = self.position + 1;
        let mut level = 0;
        while offset < self.input.len() && self.input[offset] == '=' {
            level += 1;
            offset += 1;
        }
        if offset < self.input.len() && self.input[offset] == '[' {
            Some(level)
        } else {
            None
        }
    }

    fn read_long_bracket(&mut self, level: usize) -> Result<String, LexError> {
        // Skip `[`, the `=` run, and `[`
        for _ in 0..level + 2 {
            self.advance();
        }
        // A newline right after the opening bracket is not part of the text
        if !self.is_at_end() && self.current_char() == '\r' {
            self.advance();
        }
        if !self.is_at_end() && self.current_char() == '\n' {
            self.advance();
        }

        let mut result = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch == ']' && self.closes_long_bracket(level) {
                for _ in 0..level + 2 {
                    self.advance();
                }
                return Ok(result);
            }
            result.push(ch);
            self.advance();
        }
        Err(self.error("unfinished long string"))
    }

    fn closes_long_bracket(&self, level: usize) -> bool {
        let mut offset = self.position + 1;
        for _ in 0..level {
            if offset >= self.input.len() || self.input[offset] != '=' {
                return false;
            }
            offset += 1;
        }
        offset < self.input.len() && self.input[offset] == ']'
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        while !self.is_at_end() {
            let ch = self.current_char();

            if ch.is_whitespace() {
                self.advance();
            } else if ch == '-' && self.peek() == Some('-') {
                self.advance();
                self.advance();
                if !self.is_at_end() && self.current_char() == '[' {
                    if let Some(level) = self.long_bracket_level() {
                        self.read_long_bracket(level)?;
                        continue;
                    }
                }
                while !self.is_at_end() && self.current_char() != '\n' {
                    self.advance();
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn match_char(&mut self, expected: char) -> bool {
        if !self.is_at_end() && self.current_char() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn current_char(&self) -> char {
        self.input[self.position]
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self) {
        if !self.is_at_end() {
            if self.current_char() == '\n' {
                self.line += 1;
            }
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn error(&self, message: &str) -> LexError {
        LexError {
            message: message.to_string(),
            line: self.line,
        }
    }
}
