// JSONata expression parser: tokenizer plus Pratt (top-down operator
// precedence) parser. Produces the raw AST; `optimizer::process_ast` turns
// it into the final evaluable form.

use regex::RegexBuilder;
use thiserror::Error;

use crate::ast::{AstNode, BinaryOp, CompiledRegex, SortTerm, UnaryOp};
use crate::signature::{Signature, SignatureError};

/// Static (compile-time) errors: lexical, syntactic, and the structural
/// errors raised by the optimizer pass. Every variant carries a stable code
/// surfaced through `code()` and leads its message with it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParserError {
    #[error("S0101 @ {position}: string literal must be terminated by a matching quote")]
    UnterminatedString { position: usize },

    #[error("S0102 @ {position}: number out of range: {token}")]
    NumberOutOfRange { token: String, position: usize },

    #[error("S0103 @ {position}: unsupported escape sequence: \\{escape}")]
    UnsupportedEscape { escape: char, position: usize },

    #[error("S0104 @ {position}: the escape sequence \\u must be followed by 4 hex digits")]
    InvalidUnicodeEscape { position: usize },

    #[error("S0105 @ {position}: quoted property name must be terminated with a backquote")]
    UnterminatedQuotedName { position: usize },

    #[error("S0106 @ {position}: comment has no closing tag")]
    UnterminatedComment { position: usize },

    #[error("S0201 @ {position}: syntax error: {token}")]
    SyntaxError { token: String, position: usize },

    #[error("S0202 @ {position}: expected {expected}, got {found}")]
    Expected {
        expected: String,
        found: String,
        position: usize,
    },

    #[error("S0203 @ {position}: expected {expected} before end of expression")]
    ExpectedBeforeEnd { expected: String, position: usize },

    #[error("S0207 @ {position}: unexpected end of expression")]
    UnexpectedEnd { position: usize },

    #[error("S0208 @ {position}: parameter {value} of function definition must be a variable name (start with $)")]
    InvalidFunctionParam { value: String, position: usize },

    #[error("S0209 @ {position}: a predicate cannot follow a grouping expression in a step")]
    PredicateAfterGroup { position: usize },

    #[error("S0210 @ {position}: each step can only have one grouping expression")]
    MultipleGroups { position: usize },

    #[error("S0211 @ {position}: the symbol {token} cannot be used as a unary operator")]
    InvalidUnary { token: String, position: usize },

    #[error("S0212 @ {position}: the left side of := must be a variable name (start with $)")]
    BindTargetNotVariable { position: usize },

    #[error("S0213 @ {position}: the literal value {value} cannot be used as a step within a path expression")]
    LiteralPathStep { value: String, position: usize },

    #[error("S0214 @ {position}: the right side of {token} must be a variable name (start with $)")]
    BindRhsNotVariable { token: String, position: usize },

    #[error("S0215 @ {position}: a context variable binding must precede any predicates on a step")]
    ContextBindingAfterPredicate { position: usize },

    #[error("S0216 @ {position}: a context variable binding must precede the 'order-by' clause on a step")]
    ContextBindingAfterSort { position: usize },

    #[error("S0217 @ {position}: the object representing the 'parent' cannot be derived from this expression")]
    UnresolvedAncestor { position: usize },

    #[error("S0301 @ {position}: empty regular expressions are not allowed")]
    EmptyRegex { position: usize },

    #[error("S0302 @ {position}: no terminating / in regular expression")]
    UnterminatedRegex { position: usize },

    #[error("S0302 @ {position}: unable to compile regular expression: {reason}")]
    InvalidRegex { reason: String, position: usize },

    #[error("S0401 @ {position}: invalid type signature: {reason}")]
    InvalidSignature { reason: String, position: usize },
}

impl ParserError {
    /// The stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            ParserError::UnterminatedString { .. } => "S0101",
            ParserError::NumberOutOfRange { .. } => "S0102",
            ParserError::UnsupportedEscape { .. } => "S0103",
            ParserError::InvalidUnicodeEscape { .. } => "S0104",
            ParserError::UnterminatedQuotedName { .. } => "S0105",
            ParserError::UnterminatedComment { .. } => "S0106",
            ParserError::SyntaxError { .. } => "S0201",
            ParserError::Expected { .. } => "S0202",
            ParserError::ExpectedBeforeEnd { .. } => "S0203",
            ParserError::UnexpectedEnd { .. } => "S0207",
            ParserError::InvalidFunctionParam { .. } => "S0208",
            ParserError::PredicateAfterGroup { .. } => "S0209",
            ParserError::MultipleGroups { .. } => "S0210",
            ParserError::InvalidUnary { .. } => "S0211",
            ParserError::BindTargetNotVariable { .. } => "S0212",
            ParserError::LiteralPathStep { .. } => "S0213",
            ParserError::BindRhsNotVariable { .. } => "S0214",
            ParserError::ContextBindingAfterPredicate { .. } => "S0215",
            ParserError::ContextBindingAfterSort { .. } => "S0216",
            ParserError::UnresolvedAncestor { .. } => "S0217",
            ParserError::EmptyRegex { .. } => "S0301",
            ParserError::UnterminatedRegex { .. } => "S0302",
            ParserError::InvalidRegex { .. } => "S0302",
            ParserError::InvalidSignature { .. } => "S0401",
        }
    }

    /// Source character offset the error refers to.
    pub fn position(&self) -> usize {
        match self {
            ParserError::UnterminatedString { position }
            | ParserError::NumberOutOfRange { position, .. }
            | ParserError::UnsupportedEscape { position, .. }
            | ParserError::InvalidUnicodeEscape { position }
            | ParserError::UnterminatedQuotedName { position }
            | ParserError::UnterminatedComment { position }
            | ParserError::SyntaxError { position, .. }
            | ParserError::Expected { position, .. }
            | ParserError::ExpectedBeforeEnd { position, .. }
            | ParserError::UnexpectedEnd { position }
            | ParserError::InvalidFunctionParam { position, .. }
            | ParserError::PredicateAfterGroup { position }
            | ParserError::MultipleGroups { position }
            | ParserError::InvalidUnary { position, .. }
            | ParserError::BindTargetNotVariable { position }
            | ParserError::LiteralPathStep { position, .. }
            | ParserError::BindRhsNotVariable { position, .. }
            | ParserError::ContextBindingAfterPredicate { position }
            | ParserError::ContextBindingAfterSort { position }
            | ParserError::UnresolvedAncestor { position }
            | ParserError::EmptyRegex { position }
            | ParserError::UnterminatedRegex { position }
            | ParserError::InvalidRegex { position, .. }
            | ParserError::InvalidSignature { position, .. } => *position,
        }
    }
}

// ── Tokens ───────────────────────────────────────────────────────────────────

/// Token kinds produced by the tokenizer.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Str(String),
    Integer(i64),
    Float(f64),
    Regex(CompiledRegex),
    True,
    False,
    Null,

    // Names
    Name(String),
    EscapedName(String),
    Variable(String),

    // Keyword operators
    And,
    Or,
    In,

    // Operators
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    Percent,
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Ampersand,
    Dot,
    DotDot,
    Question,
    Coalesce,
    Elvis,
    Colon,
    ColonEqual,
    Semicolon,
    Comma,
    ApplyTo,
    Caret,
    At,
    Hash,
    Pipe,

    // Delimiters
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    Eof,
}

impl TokenKind {
    /// Short printable form used in error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Str(s) => format!("\"{}\"", s),
            TokenKind::Integer(n) => n.to_string(),
            TokenKind::Float(n) => n.to_string(),
            TokenKind::Regex(r) => r.to_string(),
            TokenKind::True => "true".to_string(),
            TokenKind::False => "false".to_string(),
            TokenKind::Null => "null".to_string(),
            TokenKind::Name(n) | TokenKind::EscapedName(n) => n.clone(),
            TokenKind::Variable(v) => format!("${}", v),
            TokenKind::And => "and".to_string(),
            TokenKind::Or => "or".to_string(),
            TokenKind::In => "in".to_string(),
            TokenKind::Plus => "+".to_string(),
            TokenKind::Minus => "-".to_string(),
            TokenKind::Star => "*".to_string(),
            TokenKind::DoubleStar => "**".to_string(),
            TokenKind::Slash => "/".to_string(),
            TokenKind::Percent => "%".to_string(),
            TokenKind::Equal => "=".to_string(),
            TokenKind::NotEqual => "!=".to_string(),
            TokenKind::LessThan => "<".to_string(),
            TokenKind::LessThanOrEqual => "<=".to_string(),
            TokenKind::GreaterThan => ">".to_string(),
            TokenKind::GreaterThanOrEqual => ">=".to_string(),
            TokenKind::Ampersand => "&".to_string(),
            TokenKind::Dot => ".".to_string(),
            TokenKind::DotDot => "..".to_string(),
            TokenKind::Question => "?".to_string(),
            TokenKind::Coalesce => "??".to_string(),
            TokenKind::Elvis => "?:".to_string(),
            TokenKind::Colon => ":".to_string(),
            TokenKind::ColonEqual => ":=".to_string(),
            TokenKind::Semicolon => ";".to_string(),
            TokenKind::Comma => ",".to_string(),
            TokenKind::ApplyTo => "~>".to_string(),
            TokenKind::Caret => "^".to_string(),
            TokenKind::At => "@".to_string(),
            TokenKind::Hash => "#".to_string(),
            TokenKind::Pipe => "|".to_string(),
            TokenKind::LeftParen => "(".to_string(),
            TokenKind::RightParen => ")".to_string(),
            TokenKind::LeftBracket => "[".to_string(),
            TokenKind::RightBracket => "]".to_string(),
            TokenKind::LeftBrace => "{".to_string(),
            TokenKind::RightBrace => "}".to_string(),
            TokenKind::Eof => "(end)".to_string(),
        }
    }

    /// True when the token leaves the cursor in prefix (expression-start)
    /// position, which is exactly where a following `/` is a regex
    /// delimiter rather than division.
    fn leaves_prefix_context(&self) -> bool {
        !matches!(
            self,
            TokenKind::Str(_)
                | TokenKind::Integer(_)
                | TokenKind::Float(_)
                | TokenKind::Regex(_)
                | TokenKind::True
                | TokenKind::False
                | TokenKind::Null
                | TokenKind::Name(_)
                | TokenKind::EscapedName(_)
                | TokenKind::Variable(_)
                | TokenKind::Percent
                | TokenKind::RightParen
                | TokenKind::RightBracket
                | TokenKind::RightBrace
                | TokenKind::Eof
        )
    }
}

/// A token with its source character offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: usize,
}

// ── Tokenizer ────────────────────────────────────────────────────────────────

/// Pull-model tokenizer. `next(prefix)` produces one token; `prefix`
/// disambiguates `/` as a regex delimiter (expression position) versus the
/// division operator (operator position).
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
}

impl Tokenizer {
    pub fn new(input: &str) -> Self {
        Tokenizer {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        if self.position < self.input.len() {
            self.position += 1;
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), ParserError> {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => self.advance(),
                Some('/') if self.peek(1) == Some('*') => {
                    let start = self.position;
                    self.advance();
                    self.advance();
                    loop {
                        match self.current() {
                            None => return Err(ParserError::UnterminatedComment { position: start }),
                            Some('*') if self.peek(1) == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => self.advance(),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<String, ParserError> {
        let start = self.position;
        let mut result = String::new();
        self.advance(); // opening quote

        loop {
            match self.current() {
                None => return Err(ParserError::UnterminatedString { position: start }),
                Some(ch) if ch == quote => {
                    self.advance();
                    return Ok(result);
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        None => return Err(ParserError::UnterminatedString { position: start }),
                        Some('"') => result.push('"'),
                        Some('\'') => result.push('\''),
                        Some('\\') => result.push('\\'),
                        Some('/') => result.push('/'),
                        Some('b') => result.push('\u{0008}'),
                        Some('f') => result.push('\u{000C}'),
                        Some('n') => result.push('\n'),
                        Some('r') => result.push('\r'),
                        Some('t') => result.push('\t'),
                        Some('u') => {
                            let escape_pos = self.position;
                            self.advance();
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.current() {
                                    Some(h) if h.is_ascii_hexdigit() => {
                                        hex.push(h);
                                        self.advance();
                                    }
                                    _ => {
                                        return Err(ParserError::InvalidUnicodeEscape {
                                            position: escape_pos,
                                        })
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16)
                                .map_err(|_| ParserError::InvalidUnicodeEscape {
                                    position: escape_pos,
                                })?;
                            match char::from_u32(code) {
                                Some(ch) => result.push(ch),
                                None => {
                                    return Err(ParserError::InvalidUnicodeEscape {
                                        position: escape_pos,
                                    })
                                }
                            }
                            continue; // already past the 4 digits
                        }
                        Some(ch) => {
                            return Err(ParserError::UnsupportedEscape {
                                escape: ch,
                                position: self.position,
                            })
                        }
                    }
                    self.advance();
                }
                Some(ch) => {
                    result.push(ch);
                    self.advance();
                }
            }
        }
    }

    /// JSON numeric literal grammar: no leading zero (except bare 0),
    /// optional fraction requiring a digit after the point, optional
    /// exponent. A trailing `.` with no digit is left unconsumed, so
    /// `1..5` tokenizes as `1`, `..`, `5`.
    fn read_number(&mut self) -> Result<TokenKind, ParserError> {
        let start = self.position;

        if self.current() == Some('0') {
            self.advance();
        } else {
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let mut is_float = false;
        if self.current() == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.advance();
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        if matches!(self.current(), Some('e') | Some('E'))
            && (self.peek(1).is_some_and(|c| c.is_ascii_digit())
                || (matches!(self.peek(1), Some('+') | Some('-'))
                    && self.peek(2).is_some_and(|c| c.is_ascii_digit())))
        {
            is_float = true;
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.current().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text: String = self.input[start..self.position].iter().collect();
        if !is_float {
            if let Ok(n) = text.parse::<i64>() {
                return Ok(TokenKind::Integer(n));
            }
        }
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(TokenKind::Float(n)),
            _ => Err(ParserError::NumberOutOfRange {
                token: text,
                position: start,
            }),
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.position;
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.position].iter().collect()
    }

    fn read_backquoted_name(&mut self) -> Result<String, ParserError> {
        let start = self.position;
        self.advance(); // opening backquote
        let name_start = self.position;
        while let Some(ch) = self.current() {
            if ch == '`' {
                let name: String = self.input[name_start..self.position].iter().collect();
                self.advance();
                return Ok(name);
            }
            self.advance();
        }
        Err(ParserError::UnterminatedQuotedName { position: start })
    }

    fn read_regex(&mut self) -> Result<CompiledRegex, ParserError> {
        let start = self.position;
        self.advance(); // opening '/'
        let mut pattern = String::new();
        loop {
            match self.current() {
                None => return Err(ParserError::UnterminatedRegex { position: start }),
                Some('\\') => {
                    pattern.push('\\');
                    self.advance();
                    match self.current() {
                        None => return Err(ParserError::UnterminatedRegex { position: start }),
                        Some(ch) => {
                            pattern.push(ch);
                            self.advance();
                        }
                    }
                }
                Some('/') => {
                    self.advance();
                    break;
                }
                Some(ch) => {
                    pattern.push(ch);
                    self.advance();
                }
            }
        }
        if pattern.is_empty() {
            return Err(ParserError::EmptyRegex { position: start });
        }
        let mut flags = String::new();
        while let Some(ch) = self.current() {
            if ch == 'i' || ch == 'm' {
                if !flags.contains(ch) {
                    flags.push(ch);
                }
                self.advance();
            } else {
                break;
            }
        }
        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .build()
            .map_err(|e| ParserError::InvalidRegex {
                reason: e.to_string(),
                position: start,
            })?;
        Ok(CompiledRegex {
            pattern,
            flags,
            regex,
        })
    }

    /// Scan the raw text of a `<...>` type signature, starting just after
    /// the opening `<` (which the caller has already consumed), balancing
    /// nested angle brackets.
    fn read_signature_tail(&mut self) -> Result<String, ParserError> {
        let start = self.position;
        let mut text = String::from("<");
        let mut depth = 1usize;
        while let Some(ch) = self.current() {
            match ch {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        text.push('>');
                        self.advance();
                        return Ok(text);
                    }
                }
                _ => {}
            }
            text.push(ch);
            self.advance();
        }
        Err(ParserError::ExpectedBeforeEnd {
            expected: ">".to_string(),
            position: start,
        })
    }

    /// Produce the next token. Never returns a partially-formed token.
    pub fn next(&mut self, prefix: bool) -> Result<Token, ParserError> {
        self.skip_whitespace_and_comments()?;
        let position = self.position;
        let kind = match self.current() {
            None => TokenKind::Eof,

            Some('"') => TokenKind::Str(self.read_string('"')?),
            Some('\'') => TokenKind::Str(self.read_string('\'')?),
            Some('`') => TokenKind::EscapedName(self.read_backquoted_name()?),

            Some(ch) if ch.is_ascii_digit() => self.read_number()?,

            Some('$') => {
                self.advance();
                if self.current() == Some('$') {
                    self.advance();
                    TokenKind::Variable("$".to_string())
                } else {
                    TokenKind::Variable(self.read_identifier())
                }
            }

            Some('/') if prefix => TokenKind::Regex(self.read_regex()?),

            // two-character operators, greedy
            Some('.') if self.peek(1) == Some('.') => {
                self.advance();
                self.advance();
                TokenKind::DotDot
            }
            Some(':') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::ColonEqual
            }
            Some('!') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::NotEqual
            }
            Some('<') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::LessThanOrEqual
            }
            Some('>') if self.peek(1) == Some('=') => {
                self.advance();
                self.advance();
                TokenKind::GreaterThanOrEqual
            }
            Some('*') if self.peek(1) == Some('*') => {
                self.advance();
                self.advance();
                TokenKind::DoubleStar
            }
            Some('~') if self.peek(1) == Some('>') => {
                self.advance();
                self.advance();
                TokenKind::ApplyTo
            }
            Some('?') if self.peek(1) == Some('?') => {
                self.advance();
                self.advance();
                TokenKind::Coalesce
            }
            Some('?') if self.peek(1) == Some(':') => {
                self.advance();
                self.advance();
                TokenKind::Elvis
            }

            // single-character operators and delimiters
            Some('.') => {
                self.advance();
                TokenKind::Dot
            }
            Some('+') => {
                self.advance();
                TokenKind::Plus
            }
            Some('-') => {
                self.advance();
                TokenKind::Minus
            }
            Some('*') => {
                self.advance();
                TokenKind::Star
            }
            Some('/') => {
                self.advance();
                TokenKind::Slash
            }
            Some('%') => {
                self.advance();
                TokenKind::Percent
            }
            Some('=') => {
                self.advance();
                TokenKind::Equal
            }
            Some('<') => {
                self.advance();
                TokenKind::LessThan
            }
            Some('>') => {
                self.advance();
                TokenKind::GreaterThan
            }
            Some('&') => {
                self.advance();
                TokenKind::Ampersand
            }
            Some('?') => {
                self.advance();
                TokenKind::Question
            }
            Some(':') => {
                self.advance();
                TokenKind::Colon
            }
            Some(';') => {
                self.advance();
                TokenKind::Semicolon
            }
            Some(',') => {
                self.advance();
                TokenKind::Comma
            }
            Some('^') => {
                self.advance();
                TokenKind::Caret
            }
            Some('@') => {
                self.advance();
                TokenKind::At
            }
            Some('#') => {
                self.advance();
                TokenKind::Hash
            }
            Some('|') => {
                self.advance();
                TokenKind::Pipe
            }
            Some('(') => {
                self.advance();
                TokenKind::LeftParen
            }
            Some(')') => {
                self.advance();
                TokenKind::RightParen
            }
            Some('[') => {
                self.advance();
                TokenKind::LeftBracket
            }
            Some(']') => {
                self.advance();
                TokenKind::RightBracket
            }
            Some('{') => {
                self.advance();
                TokenKind::LeftBrace
            }
            Some('}') => {
                self.advance();
                TokenKind::RightBrace
            }

            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                let ident = self.read_identifier();
                match ident.as_str() {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    "null" => TokenKind::Null,
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "in" => TokenKind::In,
                    _ => TokenKind::Name(ident),
                }
            }

            Some(ch) => {
                return Err(ParserError::SyntaxError {
                    token: ch.to_string(),
                    position,
                })
            }
        };
        Ok(Token { kind, position })
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Pratt parser. `nud` handles tokens in prefix position, `led` in infix
/// position, with binding powers assigned by precedence tier.
pub struct Parser {
    tokenizer: Tokenizer,
    token: Token,
}

/// Left binding power by token kind. Zero means the token never acts as an
/// infix operator and terminates the enclosing expression.
fn lbp(kind: &TokenKind) -> u8 {
    match kind {
        TokenKind::LeftParen | TokenKind::LeftBracket => 80,
        TokenKind::At | TokenKind::Hash => 80,
        TokenKind::Dot => 75,
        TokenKind::LeftBrace => 70,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 60,
        TokenKind::Plus | TokenKind::Minus | TokenKind::Ampersand => 50,
        TokenKind::Equal
        | TokenKind::NotEqual
        | TokenKind::LessThan
        | TokenKind::LessThanOrEqual
        | TokenKind::GreaterThan
        | TokenKind::GreaterThanOrEqual
        | TokenKind::In
        | TokenKind::Caret
        | TokenKind::ApplyTo => 40,
        TokenKind::And => 30,
        TokenKind::Or => 25,
        TokenKind::Question
        | TokenKind::DotDot
        | TokenKind::Coalesce
        | TokenKind::Elvis => 20,
        TokenKind::ColonEqual => 10,
        _ => 0,
    }
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParserError> {
        let mut tokenizer = Tokenizer::new(input);
        let token = tokenizer.next(true)?;
        Ok(Parser { tokenizer, token })
    }

    /// Consume the current token, fetching the next one. The regex/division
    /// ambiguity is resolved here: the next `/` is a regex delimiter exactly
    /// when the consumed token leaves the cursor in prefix position.
    fn advance(&mut self) -> Result<(), ParserError> {
        let prefix = self.token.kind.leaves_prefix_context();
        self.token = self.tokenizer.next(prefix)?;
        Ok(())
    }

    fn expect(&mut self, expected: TokenKind) -> Result<(), ParserError> {
        if self.token.kind == TokenKind::Eof {
            return Err(ParserError::ExpectedBeforeEnd {
                expected: expected.describe(),
                position: self.token.position,
            });
        }
        if std::mem::discriminant(&self.token.kind) != std::mem::discriminant(&expected) {
            return Err(ParserError::Expected {
                expected: expected.describe(),
                found: self.token.kind.describe(),
                position: self.token.position,
            });
        }
        self.advance()
    }

    // ── Core loop ────────────────────────────────────────────────────────

    fn expression(&mut self, rbp: u8) -> Result<AstNode, ParserError> {
        let mut left = self.nud()?;
        while rbp < lbp(&self.token.kind) {
            left = self.led(left)?;
        }
        Ok(left)
    }

    // ── Prefix handlers ──────────────────────────────────────────────────

    fn nud(&mut self) -> Result<AstNode, ParserError> {
        let token = self.token.clone();
        match token.kind {
            TokenKind::Str(s) => {
                self.advance()?;
                Ok(AstNode::String(s))
            }
            TokenKind::Integer(n) => {
                self.advance()?;
                Ok(AstNode::Integer(n))
            }
            TokenKind::Float(n) => {
                self.advance()?;
                Ok(AstNode::Float(n))
            }
            TokenKind::True => {
                self.advance()?;
                Ok(AstNode::Bool(true))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(AstNode::Bool(false))
            }
            TokenKind::Null => {
                self.advance()?;
                Ok(AstNode::Null)
            }
            TokenKind::Regex(regex) => {
                self.advance()?;
                Ok(AstNode::Regex(regex))
            }
            TokenKind::Variable(name) => {
                self.advance()?;
                Ok(AstNode::Variable(name))
            }
            TokenKind::Name(name) => {
                self.advance()?;
                // `function` / `λ` introduce a lambda literal when followed
                // by a parameter list; otherwise they are ordinary names
                if (name == "function" || name == "λ")
                    && self.token.kind == TokenKind::LeftParen
                {
                    return self.parse_lambda();
                }
                Ok(AstNode::Name {
                    value: name,
                    escaped: false,
                })
            }
            TokenKind::EscapedName(name) => {
                self.advance()?;
                Ok(AstNode::Name {
                    value: name,
                    escaped: true,
                })
            }
            TokenKind::Star => {
                self.advance()?;
                Ok(AstNode::Wildcard)
            }
            TokenKind::DoubleStar => {
                self.advance()?;
                Ok(AstNode::Descendant)
            }
            TokenKind::Percent => {
                self.advance()?;
                Ok(AstNode::Parent {
                    position: token.position,
                })
            }
            TokenKind::Question => {
                self.advance()?;
                Ok(AstNode::Placeholder)
            }
            TokenKind::Minus => {
                self.advance()?;
                let operand = self.expression(70)?;
                // fold literal numbers so `-5` is a literal, not a unary op
                Ok(match operand {
                    AstNode::Integer(n) => AstNode::Integer(-n),
                    AstNode::Float(n) => AstNode::Float(-n),
                    other => AstNode::Unary {
                        op: UnaryOp::Negate,
                        expr: Box::new(other),
                    },
                })
            }
            TokenKind::LeftParen => {
                self.advance()?;
                let mut expressions = Vec::new();
                while self.token.kind != TokenKind::RightParen {
                    expressions.push(self.expression(0)?);
                    if self.token.kind != TokenKind::Semicolon {
                        break;
                    }
                    self.advance()?;
                }
                self.expect(TokenKind::RightParen)?;
                Ok(AstNode::Block(expressions))
            }
            TokenKind::LeftBracket => {
                self.advance()?;
                let mut items = Vec::new();
                if self.token.kind != TokenKind::RightBracket {
                    loop {
                        items.push(self.expression(0)?);
                        if self.token.kind != TokenKind::Comma {
                            break;
                        }
                        self.advance()?;
                    }
                }
                self.expect(TokenKind::RightBracket)?;
                Ok(AstNode::Array { items })
            }
            TokenKind::LeftBrace => {
                self.advance()?;
                let pairs = self.parse_object_pairs()?;
                Ok(AstNode::Object(pairs))
            }
            TokenKind::Pipe => {
                self.advance()?;
                let pattern = self.expression(0)?;
                self.expect(TokenKind::Pipe)?;
                let update = self.expression(0)?;
                let delete = if self.token.kind == TokenKind::Comma {
                    self.advance()?;
                    Some(std::sync::Arc::new(self.expression(0)?))
                } else {
                    None
                };
                self.expect(TokenKind::Pipe)?;
                Ok(AstNode::Transform {
                    pattern: std::sync::Arc::new(pattern),
                    update: std::sync::Arc::new(update),
                    delete,
                })
            }
            TokenKind::Eof => Err(ParserError::UnexpectedEnd {
                position: token.position,
            }),
            other => Err(ParserError::InvalidUnary {
                token: other.describe(),
                position: token.position,
            }),
        }
    }

    fn parse_object_pairs(&mut self) -> Result<Vec<(AstNode, AstNode)>, ParserError> {
        let mut pairs = Vec::new();
        if self.token.kind != TokenKind::RightBrace {
            loop {
                let key = self.expression(0)?;
                self.expect(TokenKind::Colon)?;
                let value = self.expression(0)?;
                pairs.push((key, value));
                if self.token.kind != TokenKind::Comma {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(TokenKind::RightBrace)?;
        Ok(pairs)
    }

    fn parse_lambda(&mut self) -> Result<AstNode, ParserError> {
        self.expect(TokenKind::LeftParen)?;
        let mut params = Vec::new();
        if self.token.kind != TokenKind::RightParen {
            loop {
                match &self.token.kind {
                    TokenKind::Variable(name) => {
                        params.push(name.clone());
                        self.advance()?;
                    }
                    other => {
                        return Err(ParserError::InvalidFunctionParam {
                            value: other.describe(),
                            position: self.token.position,
                        })
                    }
                }
                if self.token.kind != TokenKind::Comma {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(TokenKind::RightParen)?;

        // optional type signature between the parameter list and the body
        let signature = if self.token.kind == TokenKind::LessThan {
            let sig_position = self.token.position;
            let text = self.tokenizer.read_signature_tail()?;
            // re-prime the lookahead past the signature
            self.token = self.tokenizer.next(true)?;
            let sig = Signature::parse(&text).map_err(|e| match e {
                SignatureError::InvalidSignature { reason } => ParserError::InvalidSignature {
                    reason,
                    position: sig_position,
                },
                other => ParserError::InvalidSignature {
                    reason: other.to_string(),
                    position: sig_position,
                },
            })?;
            Some(sig)
        } else {
            None
        };

        self.expect(TokenKind::LeftBrace)?;
        let body = self.expression(0)?;
        self.expect(TokenKind::RightBrace)?;

        Ok(AstNode::Lambda {
            params,
            signature,
            body: std::sync::Arc::new(body),
            thunk: false,
        })
    }

    // ── Infix handlers ───────────────────────────────────────────────────

    fn led(&mut self, left: AstNode) -> Result<AstNode, ParserError> {
        let token = self.token.clone();
        match token.kind {
            TokenKind::Dot => {
                self.advance()?;
                let rhs = self.expression(75)?;
                Ok(AstNode::Map {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                    position: token.position,
                })
            }

            TokenKind::LeftBracket => {
                self.advance()?;
                if self.token.kind == TokenKind::RightBracket {
                    // empty brackets: keep the singleton array
                    self.advance()?;
                    Ok(AstNode::KeepArray {
                        input: Box::new(left),
                    })
                } else {
                    let predicate = self.expression(0)?;
                    self.expect(TokenKind::RightBracket)?;
                    Ok(AstNode::FilterWrap {
                        input: Box::new(left),
                        predicate: Box::new(predicate),
                        position: token.position,
                    })
                }
            }

            TokenKind::LeftParen => {
                self.advance()?;
                let mut args = Vec::new();
                if self.token.kind != TokenKind::RightParen {
                    loop {
                        args.push(self.expression(0)?);
                        if self.token.kind != TokenKind::Comma {
                            break;
                        }
                        self.advance()?;
                    }
                }
                self.expect(TokenKind::RightParen)?;
                let is_partial = args.iter().any(|a| matches!(a, AstNode::Placeholder));
                if is_partial {
                    Ok(AstNode::Partial {
                        procedure: Box::new(left),
                        args,
                    })
                } else {
                    Ok(AstNode::Call {
                        procedure: Box::new(left),
                        args,
                    })
                }
            }

            TokenKind::LeftBrace => {
                self.advance()?;
                let pairs = self.parse_object_pairs()?;
                Ok(AstNode::GroupWrap {
                    input: Box::new(left),
                    pairs,
                    position: token.position,
                })
            }

            TokenKind::Caret => {
                self.advance()?;
                self.expect(TokenKind::LeftParen)?;
                let mut terms = Vec::new();
                loop {
                    let descending = match self.token.kind {
                        TokenKind::LessThan => {
                            self.advance()?;
                            false
                        }
                        TokenKind::GreaterThan => {
                            self.advance()?;
                            true
                        }
                        _ => false,
                    };
                    let expr = self.expression(0)?;
                    terms.push(SortTerm { expr, descending });
                    if self.token.kind != TokenKind::Comma {
                        break;
                    }
                    self.advance()?;
                }
                self.expect(TokenKind::RightParen)?;
                Ok(AstNode::SortWrap {
                    input: Box::new(left),
                    terms,
                    position: token.position,
                })
            }

            TokenKind::Question => {
                self.advance()?;
                let then_branch = self.expression(0)?;
                let else_branch = if self.token.kind == TokenKind::Colon {
                    self.advance()?;
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Ok(AstNode::Conditional {
                    condition: Box::new(left),
                    then_branch: Box::new(then_branch),
                    else_branch,
                })
            }

            TokenKind::ColonEqual => {
                let name = match left {
                    AstNode::Variable(name) => name,
                    _ => {
                        return Err(ParserError::BindTargetNotVariable {
                            position: token.position,
                        })
                    }
                };
                self.advance()?;
                // right-associative
                let value = self.expression(lbp(&TokenKind::ColonEqual) - 1)?;
                Ok(AstNode::Bind {
                    name,
                    value: Box::new(value),
                })
            }

            TokenKind::ApplyTo => {
                self.advance()?;
                let rhs = self.expression(40)?;
                Ok(AstNode::Apply {
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                })
            }

            TokenKind::At => {
                self.advance()?;
                let rhs = self.expression(80)?;
                match rhs {
                    AstNode::Variable(var) => Ok(AstNode::FocusBind {
                        input: Box::new(left),
                        var,
                        position: token.position,
                    }),
                    _ => Err(ParserError::BindRhsNotVariable {
                        token: "@".to_string(),
                        position: token.position,
                    }),
                }
            }

            TokenKind::Hash => {
                self.advance()?;
                let rhs = self.expression(80)?;
                match rhs {
                    AstNode::Variable(var) => Ok(AstNode::IndexBind {
                        input: Box::new(left),
                        var,
                        position: token.position,
                    }),
                    _ => Err(ParserError::BindRhsNotVariable {
                        token: "#".to_string(),
                        position: token.position,
                    }),
                }
            }

            // plain binary operators
            _ => {
                let op = match token.kind {
                    TokenKind::Plus => BinaryOp::Add,
                    TokenKind::Minus => BinaryOp::Subtract,
                    TokenKind::Star => BinaryOp::Multiply,
                    TokenKind::Slash => BinaryOp::Divide,
                    TokenKind::Percent => BinaryOp::Modulo,
                    TokenKind::Equal => BinaryOp::Equal,
                    TokenKind::NotEqual => BinaryOp::NotEqual,
                    TokenKind::LessThan => BinaryOp::LessThan,
                    TokenKind::LessThanOrEqual => BinaryOp::LessThanOrEqual,
                    TokenKind::GreaterThan => BinaryOp::GreaterThan,
                    TokenKind::GreaterThanOrEqual => BinaryOp::GreaterThanOrEqual,
                    TokenKind::And => BinaryOp::And,
                    TokenKind::Or => BinaryOp::Or,
                    TokenKind::In => BinaryOp::In,
                    TokenKind::Ampersand => BinaryOp::Concatenate,
                    TokenKind::DotDot => BinaryOp::Range,
                    TokenKind::Coalesce => BinaryOp::Coalesce,
                    TokenKind::Elvis => BinaryOp::Default,
                    other => {
                        return Err(ParserError::SyntaxError {
                            token: other.describe(),
                            position: token.position,
                        })
                    }
                };
                let power = lbp(&token.kind);
                self.advance()?;
                let rhs = self.expression(power)?;
                Ok(AstNode::Binary {
                    op,
                    lhs: Box::new(left),
                    rhs: Box::new(rhs),
                })
            }
        }
    }

    /// Parse the whole input to a raw AST.
    pub fn parse(&mut self) -> Result<AstNode, ParserError> {
        let ast = self.expression(0)?;
        if self.token.kind != TokenKind::Eof {
            return Err(ParserError::SyntaxError {
                token: self.token.kind.describe(),
                position: self.token.position,
            });
        }
        Ok(ast)
    }
}

/// Parse a JSONata expression string into a raw (unoptimized) AST.
///
/// Most callers want [`crate::compile`], which also runs the optimizer pass.
pub fn parse(expression: &str) -> Result<AstNode, ParserError> {
    Parser::new(expression)?.parse()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<TokenKind> {
        let mut tokenizer = Tokenizer::new(input);
        let mut out = Vec::new();
        loop {
            let token = tokenizer.next(false).unwrap();
            let done = token.kind == TokenKind::Eof;
            out.push(token.kind);
            if done {
                break;
            }
        }
        out
    }

    // ── Tokenizer ────────────────────────────────────────────────────────

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(
            tokens("42 3.14 2.5e10 1E-5 0"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Float(3.14),
                TokenKind::Float(2.5e10),
                TokenKind::Float(1e-5),
                TokenKind::Integer(0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_range_does_not_eat_dot() {
        // `1..5` is number, range, number — the trailing dot of `1.` is not
        // consumed without a following digit
        assert_eq!(
            tokens("1..5"),
            vec![
                TokenKind::Integer(1),
                TokenKind::DotDot,
                TokenKind::Integer(5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_strings_and_escapes() {
        assert_eq!(
            tokens(r#""hello" 'world' "a\nb" "A""#),
            vec![
                TokenKind::Str("hello".to_string()),
                TokenKind::Str("world".to_string()),
                TokenKind::Str("a\nb".to_string()),
                TokenKind::Str("A".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_unterminated_string() {
        let mut tokenizer = Tokenizer::new("\"abc");
        let err = tokenizer.next(false).unwrap_err();
        assert_eq!(err.code(), "S0101");
    }

    #[test]
    fn test_lexer_bad_escape() {
        let mut tokenizer = Tokenizer::new(r#""a\q""#);
        assert_eq!(tokenizer.next(false).unwrap_err().code(), "S0103");
    }

    #[test]
    fn test_lexer_comments() {
        assert_eq!(
            tokens("a /* note */ b"),
            vec![
                TokenKind::Name("a".to_string()),
                TokenKind::Name("b".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_unterminated_comment() {
        let mut tokenizer = Tokenizer::new("/* never closed");
        assert_eq!(tokenizer.next(false).unwrap_err().code(), "S0106");
    }

    #[test]
    fn test_lexer_keywords_and_variables() {
        assert_eq!(
            tokens("true and $x or $ in"),
            vec![
                TokenKind::True,
                TokenKind::And,
                TokenKind::Variable("x".to_string()),
                TokenKind::Or,
                TokenKind::Variable("".to_string()),
                TokenKind::In,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_root_variable() {
        assert_eq!(
            tokens("$$"),
            vec![TokenKind::Variable("$".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_lexer_backquoted_names() {
        assert_eq!(
            tokens("`field name`"),
            vec![
                TokenKind::EscapedName("field name".to_string()),
                TokenKind::Eof
            ]
        );
        let mut tokenizer = Tokenizer::new("`oops");
        assert_eq!(tokenizer.next(false).unwrap_err().code(), "S0105");
    }

    #[test]
    fn test_lexer_two_char_operators() {
        assert_eq!(
            tokens(".. := != <= >= ** ~> ?? ?:"),
            vec![
                TokenKind::DotDot,
                TokenKind::ColonEqual,
                TokenKind::NotEqual,
                TokenKind::LessThanOrEqual,
                TokenKind::GreaterThanOrEqual,
                TokenKind::DoubleStar,
                TokenKind::ApplyTo,
                TokenKind::Coalesce,
                TokenKind::Elvis,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lexer_regex_in_prefix_position() {
        let mut tokenizer = Tokenizer::new("/ab+/i");
        let token = tokenizer.next(true).unwrap();
        match token.kind {
            TokenKind::Regex(r) => {
                assert_eq!(r.pattern, "ab+");
                assert_eq!(r.flags, "i");
            }
            other => panic!("expected regex, got {:?}", other),
        }
    }

    #[test]
    fn test_lexer_slash_is_division_in_infix_position() {
        let mut tokenizer = Tokenizer::new("/");
        assert_eq!(tokenizer.next(false).unwrap().kind, TokenKind::Slash);
    }

    #[test]
    fn test_lexer_regex_errors() {
        let mut tokenizer = Tokenizer::new("/never");
        assert_eq!(tokenizer.next(true).unwrap_err().code(), "S0302");
        let mut tokenizer = Tokenizer::new("//");
        assert_eq!(tokenizer.next(true).unwrap_err().code(), "S0301");
    }

    // ── Parser shapes ────────────────────────────────────────────────────

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("42").unwrap(), AstNode::Integer(42));
        assert_eq!(parse("3.5").unwrap(), AstNode::Float(3.5));
        assert_eq!(parse("\"hi\"").unwrap(), AstNode::String("hi".to_string()));
        assert_eq!(parse("true").unwrap(), AstNode::Bool(true));
        assert_eq!(parse("null").unwrap(), AstNode::Null);
        assert_eq!(parse("-5").unwrap(), AstNode::Integer(-5));
    }

    #[test]
    fn test_parse_name_and_variable() {
        assert_eq!(
            parse("foo").unwrap(),
            AstNode::Name {
                value: "foo".to_string(),
                escaped: false
            }
        );
        assert_eq!(
            parse("$x").unwrap(),
            AstNode::Variable("x".to_string())
        );
    }

    #[test]
    fn test_parse_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        match parse("1 + 2 * 3").unwrap() {
            AstNode::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => {
                assert_eq!(*lhs, AstNode::Integer(1));
                assert!(matches!(
                    *rhs,
                    AstNode::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            other => panic!("expected Add, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_dot_builds_interim_map() {
        match parse("a.b.c").unwrap() {
            AstNode::Map { lhs, .. } => {
                assert!(matches!(*lhs, AstNode::Map { .. }));
            }
            other => panic!("expected Map chain, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_predicate_wrap() {
        match parse("items[price > 10]").unwrap() {
            AstNode::FilterWrap { input, .. } => {
                assert!(matches!(*input, AstNode::Name { .. }));
            }
            other => panic!("expected FilterWrap, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_empty_brackets_keep_array() {
        assert!(matches!(
            parse("items[]").unwrap(),
            AstNode::KeepArray { .. }
        ));
    }

    #[test]
    fn test_parse_group_wrap() {
        assert!(matches!(
            parse("items{kind: price}").unwrap(),
            AstNode::GroupWrap { .. }
        ));
    }

    #[test]
    fn test_parse_function_call_and_partial() {
        match parse("$sum(1, 2)").unwrap() {
            AstNode::Call { procedure, args } => {
                assert_eq!(*procedure, AstNode::Variable("sum".to_string()));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected Call, got {:?}", other),
        }
        assert!(matches!(
            parse("$mult3(1, 2, ?)").unwrap(),
            AstNode::Partial { .. }
        ));
    }

    #[test]
    fn test_parse_conditional() {
        match parse("x > 0 ? 1 : -1").unwrap() {
            AstNode::Conditional {
                else_branch: Some(e),
                ..
            } => {
                assert_eq!(*e, AstNode::Integer(-1));
            }
            other => panic!("expected Conditional, got {:?}", other),
        }
        assert!(matches!(
            parse("x ? 1").unwrap(),
            AstNode::Conditional {
                else_branch: None,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_bind() {
        match parse("$x := 5").unwrap() {
            AstNode::Bind { name, value } => {
                assert_eq!(name, "x");
                assert_eq!(*value, AstNode::Integer(5));
            }
            other => panic!("expected Bind, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bind_rejects_non_variable() {
        assert_eq!(parse("x := 5").unwrap_err().code(), "S0212");
    }

    #[test]
    fn test_parse_bind_right_associative() {
        match parse("$a := $b := 2").unwrap() {
            AstNode::Bind { name, value } => {
                assert_eq!(name, "a");
                assert!(matches!(*value, AstNode::Bind { .. }));
            }
            other => panic!("expected Bind, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda() {
        match parse("function($a, $b){ $a + $b }").unwrap() {
            AstNode::Lambda {
                params, signature, ..
            } => {
                assert_eq!(params, vec!["a".to_string(), "b".to_string()]);
                assert!(signature.is_none());
            }
            other => panic!("expected Lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda_with_signature() {
        match parse("function($x)<n:n>{ $x * 2 }").unwrap() {
            AstNode::Lambda { signature, .. } => {
                assert_eq!(signature.unwrap().source(), "<n:n>");
            }
            other => panic!("expected Lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_lambda_rejects_non_variable_param() {
        assert_eq!(parse("function(a){ a }").unwrap_err().code(), "S0208");
    }

    #[test]
    fn test_parse_block() {
        match parse("($x := 1; $x + 1)").unwrap() {
            AstNode::Block(exprs) => assert_eq!(exprs.len(), 2),
            other => panic!("expected Block, got {:?}", other),
        }
        // single parenthesized expression is still a block scope
        assert!(matches!(parse("(1)").unwrap(), AstNode::Block(_)));
    }

    #[test]
    fn test_parse_sort() {
        match parse("products^(>price, name)").unwrap() {
            AstNode::SortWrap { terms, .. } => {
                assert_eq!(terms.len(), 2);
                assert!(terms[0].descending);
                assert!(!terms[1].descending);
            }
            other => panic!("expected SortWrap, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_transform() {
        assert!(matches!(
            parse("|items|{\"done\": true}|").unwrap(),
            AstNode::Transform { delete: None, .. }
        ));
        assert!(matches!(
            parse("|items|{\"done\": true}, \"tmp\"|").unwrap(),
            AstNode::Transform {
                delete: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_parse_focus_and_index_binds() {
        assert!(matches!(
            parse("items@$item").unwrap(),
            AstNode::FocusBind { .. }
        ));
        assert!(matches!(
            parse("items#$i").unwrap(),
            AstNode::IndexBind { .. }
        ));
        assert_eq!(parse("items#3").unwrap_err().code(), "S0214");
    }

    #[test]
    fn test_parse_apply_and_chain() {
        assert!(matches!(parse("a ~> $sum").unwrap(), AstNode::Apply { .. }));
    }

    #[test]
    fn test_parse_wildcards_and_parent() {
        assert!(matches!(parse("*").unwrap(), AstNode::Wildcard));
        assert!(matches!(parse("**").unwrap(), AstNode::Descendant));
        assert!(matches!(parse("%").unwrap(), AstNode::Parent { .. }));
    }

    #[test]
    fn test_parse_regex_literal() {
        assert!(matches!(parse("/a+b/").unwrap(), AstNode::Regex(_)));
        // after an operand, slash is division
        assert!(matches!(
            parse("a / b").unwrap(),
            AstNode::Binary {
                op: BinaryOp::Divide,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_errors_carry_positions() {
        let err = parse("1 + ").unwrap_err();
        assert_eq!(err.code(), "S0207");
        assert_eq!(err.position(), 4);

        let err = parse("a b").unwrap_err();
        assert_eq!(err.code(), "S0201");
    }

    #[test]
    fn test_parse_unexpected_infix_as_prefix() {
        assert_eq!(parse(":= 1").unwrap_err().code(), "S0211");
        assert_eq!(parse("and 1").unwrap_err().code(), "S0211");
    }

    #[test]
    fn test_parse_mid_expression_end_is_distinct() {
        // `(1` runs out before the closing paren
        assert_eq!(parse("(1").unwrap_err().code(), "S0203");
    }
}
