//! Recursive descent parser for expressions and definition blocks

use thiserror::Error;

use super::ast::*;
use crate::record::Value;

/// Deepest nesting accepted, both for brackets and prefix operators while
/// parsing and for the height of the resulting tree.
pub const MAX_NESTING: usize = 200;

/// Parse error with position information
#[derive(Debug, Clone, PartialEq, Error)]
#[error("at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Parse a single expression.
pub fn parse_expression(input: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(input, false).tokenize()?;
    let mut parser = Parser::new(tokens);
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(expr)
}

/// Parse a definition block: `name = expr` and `name(a, b) = expr`
/// statements separated by newlines or `;`.
pub fn parse_definitions(input: &str) -> Result<Vec<Statement>, ParseError> {
    let tokens = Lexer::new(input, true).tokenize()?;
    let mut parser = Parser::new(tokens);
    parser.parse_statements()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,

    And,
    Or,
    Not,
    In,
    If,
    Else,

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,

    /// Statement separator (newline or `;`), only emitted for definition blocks
    Sep,
    Eof,
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    statements: bool,
    /// Bracket depth; newlines inside brackets never separate statements
    depth: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str, statements: bool) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
            statements,
            depth: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            let (token, pos) = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push((token, pos));
            if done {
                return Ok(tokens);
            }
        }
    }

    fn bump_if(&mut self, expected: char) -> bool {
        if let Some(&(_, c)) = self.chars.peek()
            && c == expected
        {
            self.chars.next();
            return true;
        }
        false
    }

    fn next_token(&mut self) -> Result<(Token, usize), ParseError> {
        // Whitespace and comments
        while let Some(&(pos, ch)) = self.chars.peek() {
            if ch == '#' {
                while let Some(&(_, c)) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.chars.next();
                }
            } else if (ch == '\n' || ch == ';') && self.statements && self.depth == 0 {
                self.chars.next();
                return Ok((Token::Sep, pos));
            } else if ch.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }

        let Some((pos, ch)) = self.chars.next() else {
            return Ok((Token::Eof, self.input.len()));
        };

        let token = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '%' => Token::Percent,
            '.' if !self.peek_digit() => Token::Dot,
            ',' => Token::Comma,
            '(' => {
                self.depth += 1;
                Token::LParen
            }
            ')' => {
                self.depth = self.depth.saturating_sub(1);
                Token::RParen
            }
            '[' => {
                self.depth += 1;
                Token::LBracket
            }
            ']' => {
                self.depth = self.depth.saturating_sub(1);
                Token::RBracket
            }
            '*' => {
                if self.bump_if('*') {
                    Token::StarStar
                } else {
                    Token::Star
                }
            }
            '/' => {
                if self.bump_if('/') {
                    Token::SlashSlash
                } else {
                    Token::Slash
                }
            }
            '=' => {
                if self.bump_if('=') {
                    Token::EqEq
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.bump_if('=') {
                    Token::Ne
                } else {
                    return Err(ParseError::new("expected '!=' (use 'not' for negation)", pos));
                }
            }
            '<' => {
                if self.bump_if('=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.bump_if('=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '\'' | '"' => Token::Str(self.string_literal(ch, pos)?),
            c if c.is_ascii_digit() || c == '.' => self.number(pos)?,
            c if c.is_alphabetic() || c == '_' => self.word(pos),
            _ => {
                return Err(ParseError::new(
                    format!("unexpected character: '{}'", ch),
                    pos,
                ));
            }
        };
        Ok((token, pos))
    }

    fn peek_digit(&mut self) -> bool {
        self.chars
            .peek()
            .map(|&(_, c)| c.is_ascii_digit())
            .unwrap_or(false)
    }

    fn string_literal(&mut self, quote: char, start: usize) -> Result<String, ParseError> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(s),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => s.push('\n'),
                    Some((_, 't')) => s.push('\t'),
                    Some((_, c)) => s.push(c),
                    None => break,
                },
                Some((_, c)) => s.push(c),
                None => break,
            }
        }
        Err(ParseError::new("unclosed string literal", start))
    }

    fn number(&mut self, start: usize) -> Result<Token, ParseError> {
        let mut is_float = self.input[start..].starts_with('.');
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.chars.next();
            } else if c == '.' && !is_float {
                // `1.` is a float but `1.real` style attribute access is not supported
                is_float = true;
                self.chars.next();
            } else if (c == 'e' || c == 'E') && self.exponent_follows(i) {
                is_float = true;
                self.chars.next();
                if let Some(&(_, sign)) = self.chars.peek()
                    && (sign == '+' || sign == '-')
                {
                    self.chars.next();
                }
            } else {
                break;
            }
        }
        let end = self.chars.peek().map(|&(i, _)| i).unwrap_or(self.input.len());
        let text: String = self.input[start..end].chars().filter(|&c| c != '_').collect();

        if is_float {
            text.parse()
                .map(Token::Float)
                .map_err(|_| ParseError::new(format!("invalid float: {}", text), start))
        } else {
            text.parse()
                .map(Token::Int)
                .map_err(|_| ParseError::new(format!("invalid integer: {}", text), start))
        }
    }

    fn exponent_follows(&self, e_pos: usize) -> bool {
        let rest = &self.input[e_pos + 1..];
        let rest = rest.strip_prefix(['+', '-']).unwrap_or(rest);
        rest.starts_with(|c: char| c.is_ascii_digit())
    }

    fn word(&mut self, start: usize) -> Token {
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.chars.next();
            } else {
                break;
            }
        }
        let end = self.chars.peek().map(|&(i, _)| i).unwrap_or(self.input.len());
        match &self.input[start..end] {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            "if" => Token::If,
            "else" => Token::Else,
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "null" | "None" => Token::Null,
            ident => Token::Ident(ident.to_string()),
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    /// Open brackets and prefix operators around the current token
    depth: usize,
    /// Height of the expression most recently parsed
    height: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            height: 0,
        }
    }

    fn too_deep(&self) -> ParseError {
        self.error("expression nested too deeply")
    }

    /// Run `parse` one nesting level down.
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Record a new node whose tallest child is `child_height` high.
    fn grow(&mut self, child_height: usize) -> Result<(), ParseError> {
        if child_height >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.height = child_height + 1;
        Ok(())
    }

    fn current(&self) -> &Token {
        // tokenize() always ends the stream with Eof
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, p)| *p)
            .unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.current() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.current()))))
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        if *self.current() == Token::Eof {
            Ok(())
        } else {
            Err(self.error(format!(
                "unexpected {} after expression",
                describe(self.current())
            )))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.position())
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        if let Token::Ident(name) = self.current() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(format!("expected {}, found {}", what, describe(self.current()))))
        }
    }

    /// block = (sep* statement)* sep*
    fn parse_statements(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(&Token::Sep) {}
            if *self.current() == Token::Eof {
                return Ok(statements);
            }
            statements.push(self.parse_statement()?);
            if !matches!(self.current(), Token::Sep | Token::Eof) {
                return Err(self.error(format!(
                    "expected end of definition, found {}",
                    describe(self.current())
                )));
            }
        }
    }

    /// statement = ident "=" expr | ident "(" params ")" "=" expr
    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let name = self.expect_ident("a definition name")?;

        if self.eat(&Token::LParen) {
            let mut params = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    let param = self.expect_ident("a parameter name")?;
                    if params.contains(&param) {
                        return Err(self.error(format!("duplicate parameter '{}'", param)));
                    }
                    params.push(param);
                    if self.eat(&Token::RParen) {
                        break;
                    }
                    self.expect(Token::Comma, "',' or ')'")?;
                }
            }
            self.expect(Token::Assign, "'='")?;
            let body = self.parse_expr()?;
            return Ok(Statement::Function { name, params, body });
        }

        self.expect(Token::Assign, "'='")?;
        let expr = self.parse_expr()?;
        Ok(Statement::Const { name, expr })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_conditional)
    }

    /// conditional = or_expr ("if" or_expr "else" expr)?
    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let then_expr = self.parse_or()?;
        if self.eat(&Token::If) {
            let mut height = self.height;
            let condition = self.parse_or()?;
            height = height.max(self.height);
            self.expect(Token::Else, "'else'")?;
            let else_expr = self.parse_expr()?;
            self.grow(height.max(self.height))?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }
        Ok(then_expr)
    }

    /// or_expr = and_expr ("or" and_expr)*
    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let left_height = self.height;
            let right = self.parse_and()?;
            self.grow(left_height.max(self.height))?;
            left = Expr::Logical {
                left: Box::new(left),
                op: LogicOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = not_expr ("and" not_expr)*
    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let left_height = self.height;
            let right = self.parse_not()?;
            self.grow(left_height.max(self.height))?;
            left = Expr::Logical {
                left: Box::new(left),
                op: LogicOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// not_expr = "not" not_expr | comparison
    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let inner = self.nested(Self::parse_not)?;
            self.grow(self.height)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    /// comparison = additive (comp_op additive)*
    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_additive()?;
        let mut height = self.height;
        let mut rest = Vec::new();

        loop {
            let op = match self.current() {
                Token::EqEq => CompareOp::Eq,
                Token::Ne => CompareOp::Ne,
                Token::Lt => CompareOp::Lt,
                Token::Le => CompareOp::Le,
                Token::Gt => CompareOp::Gt,
                Token::Ge => CompareOp::Ge,
                Token::In => CompareOp::In,
                Token::Not if *self.peek_next() == Token::In => {
                    self.advance();
                    CompareOp::NotIn
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.parse_additive()?));
            height = height.max(self.height);
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            self.grow(height)?;
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    /// additive = term (("+"|"-") term)*
    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let left_height = self.height;
            let right = self.parse_term()?;
            self.grow(left_height.max(self.height))?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    /// term = unary (("*"|"/"|"//"|"%") unary)*
    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::SlashSlash => BinaryOp::FloorDiv,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let left_height = self.height;
            let right = self.parse_unary()?;
            self.grow(left_height.max(self.height))?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    /// unary = ("-"|"+") unary | power
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.current() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.parse_power(),
        };
        self.advance();
        let expr = self.nested(Self::parse_unary)?;
        self.grow(self.height)?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    /// power = postfix ("**" unary)?
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::StarStar) {
            let base_height = self.height;
            let exponent = self.nested(Self::parse_unary)?;
            self.grow(base_height.max(self.height))?;
            return Ok(binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    /// postfix = primary ("(" args ")" | "." ident ["(" args ")"] | "[" expr "]")*
    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current() {
                Token::LParen => {
                    let Expr::Name(func) = expr else {
                        return Err(self.error("only named functions can be called"));
                    };
                    self.advance();
                    let args = self.parse_args(Token::RParen, "')'")?;
                    self.grow(self.height)?;
                    expr = Expr::Call { func, args };
                }
                Token::Dot => {
                    self.advance();
                    let target_height = self.height;
                    let name = self.expect_ident("an attribute name after '.'")?;
                    if self.eat(&Token::LParen) {
                        let args = self.parse_args(Token::RParen, "')'")?;
                        self.grow(target_height.max(self.height))?;
                        expr = Expr::Method {
                            target: Box::new(expr),
                            name,
                            args,
                        };
                    } else {
                        self.grow(target_height)?;
                        expr = Expr::Attr {
                            target: Box::new(expr),
                            name,
                        };
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let target_height = self.height;
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket, "']'")?;
                    self.grow(target_height.max(self.height))?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Comma-separated expressions up to `close`; the opening token is consumed.
    ///
    /// Leaves the height of the tallest argument (0 for none) in `self.height`.
    fn parse_args(&mut self, close: Token, what: &str) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        let mut height = 0;
        if !self.eat(&close) {
            loop {
                args.push(self.parse_expr()?);
                height = height.max(self.height);
                if self.eat(&close) {
                    break;
                }
                self.expect(Token::Comma, &format!("',' or {}", what))?;
                // Trailing comma
                if self.eat(&close) {
                    break;
                }
            }
        }
        self.height = height;
        Ok(args)
    }

    /// primary = literal | ident | "(" expr ")" | "[" args "]"
    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let expr = match self.current().clone() {
            Token::Int(i) => Expr::Literal(Value::Int(i)),
            Token::Float(f) => Expr::Literal(Value::Float(f)),
            Token::Str(s) => Expr::Literal(Value::Str(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => Expr::Name(name),
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "')'")?;
                return Ok(expr);
            }
            Token::LBracket => {
                self.advance();
                let items = self.parse_args(Token::RBracket, "']'")?;
                self.grow(self.height)?;
                return Ok(Expr::List(items));
            }
            other => {
                return Err(self.error(format!("unexpected {}", describe(&other))));
            }
        };
        self.advance();
        self.height = 1;
        Ok(expr)
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("name '{}'", name),
        Token::Int(i) => format!("number {}", i),
        Token::Float(f) => format!("number {}", f),
        Token::Str(s) => format!("string '{}'", s),
        Token::Sep => "end of statement".to_string(),
        Token::Eof => "end of input".to_string(),
        Token::Assign => "'=' (use '==' to compare)".to_string(),
        other => format!("{:?}", other).to_lowercase(),
    }
}
