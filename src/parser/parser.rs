// src/parser/parser.rs
//! Parser that converts tokens into an Abstract Syntax Tree

use super::ast::*;
use super::lexer::{LexError, Lexer, Token};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError {
            message: err.message,
            line: err.line,
        }
    }
}

/// Binding powers (left, right) of binary operators
fn binary_priority(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let entry = match token {
        Token::Lt => (BinaryOp::Lt, 3, 3),
        Token::Gt => (BinaryOp::Gt, 3, 3),
        Token::Lte => (BinaryOp::Lte, 3, 3),
        Token::Gte => (BinaryOp::Gte, 3, 3),
        Token::NotEq => (BinaryOp::NotEq, 3, 3),
        Token::EqEq => (BinaryOp::Eq, 3, 3),
        Token::Concat => (BinaryOp::Concat, 5, 4),
        Token::Plus => (BinaryOp::Add, 6, 6),
        Token::Minus => (BinaryOp::Sub, 6, 6),
        Token::Star => (BinaryOp::Mul, 7, 7),
        Token::Slash => (BinaryOp::Div, 7, 7),
        Token::Percent => (BinaryOp::Mod, 7, 7),
        Token::Caret => (BinaryOp::Pow, 10, 9),
        _ => return None,
    };
    Some(entry)
}

const UNARY_PRIORITY: u8 = 8;

/// Per-function parsing state
struct FunctionState {
    locals: Vec<LocalInfo>,
    upvalues: Vec<Upvalue>,
    scopes: Vec<Vec<(String, LocalId)>>,
    is_vararg: bool,
    loop_depth: usize,
}

impl FunctionState {
    fn new(is_vararg: bool) -> Self {
        Self {
            locals: Vec::new(),
            upvalues: Vec::new(),
            scopes: vec![Vec::new()],
            is_vararg,
            loop_depth: 0,
        }
    }

    fn find_local(&self, name: &str) -> Option<LocalId> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

enum Resolved {
    Local(LocalId),
    Upvalue(usize),
}

pub struct Parser {
    lexer: Lexer,
    current_token: Token,
    current_line: u32,
    lookahead: Option<(Token, u32)>,
    functions: Vec<FunctionState>,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next_token()?;
        let current_line = lexer.line();

        Ok(Self {
            lexer,
            current_token,
            current_line,
            lookahead: None,
            functions: Vec::new(),
        })
    }

    /// Parse a whole chunk into its implicit top-level function
    pub fn parse(&mut self) -> Result<Function, ParseError> {
        self.functions.push(FunctionState::new(true));
        let body = self.parse_block()?;
        if self.current_token != Token::Eof {
            return Err(self.error(format!("'<eof>' expected near {}", self.current_token)));
        }
        let state = self.pop_function()?;

        Ok(Function {
            name: "main chunk".to_string(),
            line: 0,
            params: Vec::new(),
            is_vararg: true,
            locals: state.locals,
            upvalues: state.upvalues,
            body,
        })
    }

    // ----- blocks and statements -----

    fn block_follows(&self) -> bool {
        matches!(
            self.current_token,
            Token::Else | Token::Elseif | Token::End | Token::Until | Token::Eof
        )
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let mut stats = Vec::new();

        while !self.block_follows() {
            if self.current_token == Token::Return {
                stats.push(self.parse_return()?);
                break;
            }
            if let Some(stat) = self.parse_statement()? {
                stats.push(stat);
            }
        }

        Ok(stats)
    }

    /// Parse a block in its own scope
    fn parse_scoped_block(&mut self) -> Result<Block, ParseError> {
        self.enter_scope()?;
        let block = self.parse_block()?;
        self.leave_scope()?;
        Ok(block)
    }

    fn parse_loop_body(&mut self) -> Result<Block, ParseError> {
        self.state_mut()?.loop_depth += 1;
        let block = self.parse_scoped_block()?;
        self.state_mut()?.loop_depth -= 1;
        Ok(block)
    }

    fn parse_statement(&mut self) -> Result<Option<Stat>, ParseError> {
        let line = self.current_line;

        let kind = match &self.current_token {
            Token::Semicolon => {
                self.advance()?;
                return Ok(None);
            }
            Token::If => self.parse_if()?,
            Token::While => {
                self.advance()?;
                let condition = self.parse_expression()?;
                self.expect(Token::Do)?;
                let body = self.parse_loop_body()?;
                self.expect_closing(Token::End, Token::While, line)?;
                StatKind::While { condition, body }
            }
            Token::Do => {
                self.advance()?;
                let block = self.parse_scoped_block()?;
                self.expect_closing(Token::End, Token::Do, line)?;
                StatKind::Do(block)
            }
            Token::For => self.parse_for(line)?,
            Token::Repeat => {
                self.advance()?;
                self.state_mut()?.loop_depth += 1;
                self.enter_scope()?;
                let body = self.parse_block()?;
                self.expect_closing(Token::Until, Token::Repeat, line)?;
                // The condition sees the body's locals
                let condition = self.parse_expression()?;
                self.leave_scope()?;
                self.state_mut()?.loop_depth -= 1;
                StatKind::Repeat { body, condition }
            }
            Token::Function => self.parse_function_stat(line)?,
            Token::Local => {
                self.advance()?;
                if self.current_token == Token::Function {
                    self.advance()?;
                    let name = self.expect_identifier()?;
                    let var = self.declare_local(&name)?;
                    let function = self.parse_function_body(name, false, line)?;
                    StatKind::LocalFunction {
                        var,
                        function: Box::new(function),
                    }
                } else {
                    self.parse_local()?
                }
            }
            Token::Break => {
                self.advance()?;
                if self.state()?.loop_depth == 0 {
                    return Err(self.error("no loop to break"));
                }
                StatKind::Break
            }
            _ => self.parse_expression_statement()?,
        };

        Ok(Some(Stat { line, kind }))
    }

    fn parse_return(&mut self) -> Result<Stat, ParseError> {
        let line = self.current_line;
        self.advance()?;

        let values = if self.block_follows() || self.current_token == Token::Semicolon {
            Vec::new()
        } else {
            self.parse_expression_list()?
        };
        if self.current_token == Token::Semicolon {
            self.advance()?;
        }
        if !self.block_follows() {
            return Err(self.error(format!("'end' expected near {}", self.current_token)));
        }

        Ok(Stat {
            line,
            kind: StatKind::Return(values),
        })
    }

    fn parse_if(&mut self) -> Result<StatKind, ParseError> {
        let line = self.current_line;
        let mut branches = Vec::new();
        let mut else_block = None;

        // `if` or `elseif`
        self.advance()?;
        loop {
            let condition = self.parse_expression()?;
            self.expect(Token::Then)?;
            let block = self.parse_scoped_block()?;
            branches.push((condition, block));

            match self.current_token {
                Token::Elseif => {
                    self.advance()?;
                }
                Token::Else => {
                    self.advance()?;
                    else_block = Some(self.parse_scoped_block()?);
                    self.expect_closing(Token::End, Token::If, line)?;
                    break;
                }
                _ => {
                    self.expect_closing(Token::End, Token::If, line)?;
                    break;
                }
            }
        }

        Ok(StatKind::If {
            branches,
            else_block,
        })
    }

    fn parse_for(&mut self, line: u32) -> Result<StatKind, ParseError> {
        self.advance()?;
        let first = self.expect_identifier()?;

        if self.current_token == Token::Assign {
            self.advance()?;
            let start = self.parse_expression()?;
            self.expect(Token::Comma)?;
            let limit = self.parse_expression()?;
            let step = if self.current_token == Token::Comma {
                self.advance()?;
                Some(self.parse_expression()?)
            } else {
                None
            };
            self.expect(Token::Do)?;

            self.enter_scope()?;
            let var = self.declare_local(&first)?;
            let body = self.parse_loop_body()?;
            self.leave_scope()?;
            self.expect_closing(Token::End, Token::For, line)?;

            return Ok(StatKind::NumericFor {
                var,
                start,
                limit,
                step,
                body,
            });
        }

        let mut names = vec![first];
        while self.current_token == Token::Comma {
            self.advance()?;
            names.push(self.expect_identifier()?);
        }
        if self.current_token != Token::In {
            return Err(self.error(format!("'=' or 'in' expected near {}", self.current_token)));
        }
        self.advance()?;
        let values = self.parse_expression_list()?;
        self.expect(Token::Do)?;

        self.enter_scope()?;
        let mut vars = Vec::with_capacity(names.len());
        for name in &names {
            vars.push(self.declare_local(name)?);
        }
        let body = self.parse_loop_body()?;
        self.leave_scope()?;
        self.expect_closing(Token::End, Token::For, line)?;

        Ok(StatKind::GenericFor { vars, values, body })
    }

    fn parse_function_stat(&mut self, line: u32) -> Result<StatKind, ParseError> {
        self.advance()?;

        let first = self.expect_identifier()?;
        let mut display = first.clone();
        let mut target = self.resolve(&first)?;
        let mut is_method = false;

        loop {
            match self.current_token {
                Token::Dot => {
                    self.advance()?;
                    let key = self.expect_identifier()?;
                    display.push('.');
                    display.push_str(&key);
                    target = Expr::Index(Box::new(target), Box::new(Expr::Str(key)));
                }
                Token::Colon => {
                    self.advance()?;
                    let key = self.expect_identifier()?;
                    display.push(':');
                    display.push_str(&key);
                    target = Expr::Index(Box::new(target), Box::new(Expr::Str(key)));
                    is_method = true;
                    break;
                }
                _ => break,
            }
        }

        let function = self.parse_function_body(display, is_method, line)?;
        Ok(StatKind::Assign {
            targets: vec![target],
            values: vec![Expr::Function(Box::new(function))],
        })
    }

    fn parse_local(&mut self) -> Result<StatKind, ParseError> {
        let mut names = vec![self.expect_identifier()?];
        while self.current_token == Token::Comma {
            self.advance()?;
            names.push(self.expect_identifier()?);
        }

        // Values are parsed before the names come into scope
        let values = if self.current_token == Token::Assign {
            self.advance()?;
            self.parse_expression_list()?
        } else {
            Vec::new()
        };

        let mut ids = Vec::with_capacity(names.len());
        for name in &names {
            ids.push(self.declare_local(name)?);
        }

        Ok(StatKind::Local { names: ids, values })
    }

    fn parse_expression_statement(&mut self) -> Result<StatKind, ParseError> {
        let first = self.parse_suffixed_expression()?;

        if matches!(self.current_token, Token::Assign | Token::Comma) {
            let mut targets = vec![first];
            while self.current_token == Token::Comma {
                self.advance()?;
                targets.push(self.parse_suffixed_expression()?);
            }
            if targets.iter().any(|t| !t.is_assignable()) {
                return Err(self.error(format!("syntax error near {}", self.current_token)));
            }
            self.expect(Token::Assign)?;
            let values = self.parse_expression_list()?;
            return Ok(StatKind::Assign { targets, values });
        }

        match first {
            Expr::Call { .. } | Expr::Method { .. } => Ok(StatKind::Call(first)),
            _ => Err(self.error(format!("syntax error near {}", self.current_token))),
        }
    }

    fn parse_function_body(
        &mut self,
        name: String,
        is_method: bool,
        line: u32,
    ) -> Result<Function, ParseError> {
        self.functions.push(FunctionState::new(false));

        let mut params = Vec::new();
        if is_method {
            params.push(self.declare_local("self")?);
        }

        self.expect(Token::LeftParen)?;
        if self.current_token != Token::RightParen {
            loop {
                match &self.current_token {
                    Token::Ellipsis => {
                        self.advance()?;
                        self.state_mut()?.is_vararg = true;
                        break;
                    }
                    Token::Identifier(_) => {
                        let param = self.expect_identifier()?;
                        params.push(self.declare_local(&param)?);
                    }
                    other => {
                        return Err(self.error(format!("<name> expected near {}", other)));
                    }
                }
                if self.current_token != Token::Comma {
                    break;
                }
                self.advance()?;
            }
        }
        self.expect(Token::RightParen)?;

        let body = self.parse_block()?;
        self.expect_closing(Token::End, Token::Function, line)?;

        let state = self.pop_function()?;
        Ok(Function {
            name,
            line,
            params,
            is_vararg: state.is_vararg,
            locals: state.locals,
            upvalues: state.upvalues,
            body,
        })
    }

    // ----- expressions -----

    fn parse_expression_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![self.parse_expression()?];
        while self.current_token == Token::Comma {
            self.advance()?;
            exprs.push(self.parse_expression()?);
        }
        Ok(exprs)
    }

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_subexpression(0)
    }

    fn parse_subexpression(&mut self, limit: u8) -> Result<Expr, ParseError> {
        let unary = match self.current_token {
            Token::Not => Some(UnaryOp::Not),
            Token::Minus => Some(UnaryOp::Neg),
            Token::Hash => Some(UnaryOp::Len),
            _ => None,
        };

        let mut left = if let Some(op) = unary {
            self.advance()?;
            let operand = self.parse_subexpression(UNARY_PRIORITY)?;
            match (op, operand) {
                (UnaryOp::Neg, Expr::Number(n)) => Expr::Number(-n),
                (op, operand) => Expr::Unary {
                    op,
                    operand: Box::new(operand),
                },
            }
        } else {
            self.parse_simple_expression()?
        };

        loop {
            // `and`/`or` short-circuit and get their own nodes
            let (left_priority, right_priority, kind) = match &self.current_token {
                Token::Or => (1, 1, None),
                Token::And => (2, 2, None),
                token => match binary_priority(token) {
                    Some((op, l, r)) => (l, r, Some(op)),
                    None => break,
                },
            };
            if left_priority <= limit {
                break;
            }

            let is_and = self.current_token == Token::And;
            self.advance()?;
            let right = self.parse_subexpression(right_priority)?;

            left = match kind {
                Some(op) => Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                None if is_and => Expr::And(Box::new(left), Box::new(right)),
                None => Expr::Or(Box::new(left), Box::new(right)),
            };
        }

        Ok(left)
    }

    fn parse_simple_expression(&mut self) -> Result<Expr, ParseError> {
        let expr = match &self.current_token {
            Token::Number(n) => Expr::Number(*n),
            Token::String(s) => Expr::Str(s.clone()),
            Token::Nil => Expr::Nil,
            Token::True => Expr::True,
            Token::False => Expr::False,
            Token::Ellipsis => {
                if !self.state()?.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                Expr::Vararg
            }
            Token::LeftBrace => return self.parse_table(),
            Token::Function => {
                let line = self.current_line;
                self.advance()?;
                let function = self.parse_function_body("anonymous".to_string(), false, line)?;
                return Ok(Expr::Function(Box::new(function)));
            }
            _ => return self.parse_suffixed_expression(),
        };

        self.advance()?;
        Ok(expr)
    }

    fn parse_primary_expression(&mut self) -> Result<Expr, ParseError> {
        match &self.current_token {
            Token::Identifier(_) => {
                let name = self.expect_identifier()?;
                self.resolve(&name)
            }
            Token::LeftParen => {
                self.advance()?;
                let inner = self.parse_expression()?;
                self.expect(Token::RightParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            other => Err(self.error(format!("unexpected symbol near {}", other))),
        }
    }

    fn parse_suffixed_expression(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary_expression()?;

        loop {
            match &self.current_token {
                Token::Dot => {
                    self.advance()?;
                    let key = self.expect_identifier()?;
                    expr = Expr::Index(Box::new(expr), Box::new(Expr::Str(key)));
                }
                Token::LeftBracket => {
                    self.advance()?;
                    let key = self.parse_expression()?;
                    self.expect(Token::RightBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                }
                Token::Colon => {
                    self.advance()?;
                    let name = self.expect_identifier()?;
                    let args = self.parse_call_arguments()?;
                    expr = Expr::Method {
                        object: Box::new(expr),
                        name,
                        args,
                    };
                }
                Token::LeftParen | Token::String(_) | Token::LeftBrace => {
                    let args = self.parse_call_arguments()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        match &self.current_token {
            Token::String(s) => {
                let arg = Expr::Str(s.clone());
                self.advance()?;
                Ok(vec![arg])
            }
            Token::LeftBrace => Ok(vec![self.parse_table()?]),
            Token::LeftParen => {
                let line = self.current_line;
                self.advance()?;
                if self.current_token == Token::RightParen {
                    self.advance()?;
                    return Ok(Vec::new());
                }
                let args = self.parse_expression_list()?;
                self.expect_closing(Token::RightParen, Token::LeftParen, line)?;
                Ok(args)
            }
            other => Err(self.error(format!("function arguments expected near {}", other))),
        }
    }

    fn parse_table(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line;
        self.expect(Token::LeftBrace)?;
        let mut fields = Vec::new();

        while self.current_token != Token::RightBrace {
            let named = matches!(self.current_token, Token::Identifier(_))
                && self.peek()? == &Token::Assign;
            let field = match &self.current_token {
                Token::LeftBracket => {
                    self.advance()?;
                    let key = self.parse_expression()?;
                    self.expect(Token::RightBracket)?;
                    self.expect(Token::Assign)?;
                    TableField::Keyed(key, self.parse_expression()?)
                }
                Token::Identifier(name) if named => {
                    let key = Expr::Str(name.clone());
                    self.advance()?;
                    self.advance()?;
                    TableField::Keyed(key, self.parse_expression()?)
                }
                _ => TableField::Positional(self.parse_expression()?),
            };
            fields.push(field);

            match self.current_token {
                Token::Comma | Token::Semicolon => self.advance()?,
                _ => break,
            }
        }

        self.expect_closing(Token::RightBrace, Token::LeftBrace, line)?;
        Ok(Expr::Table(fields))
    }

    // ----- scopes and name resolution -----

    fn state(&self) -> Result<&FunctionState, ParseError> {
        self.functions
            .last()
            .ok_or_else(|| self.error("no function being parsed"))
    }

    fn state_mut(&mut self) -> Result<&mut FunctionState, ParseError> {
        let line = self.current_line;
        self.functions.last_mut().ok_or(ParseError {
            message: "no function being parsed".to_string(),
            line,
        })
    }

    fn pop_function(&mut self) -> Result<FunctionState, ParseError> {
        self.functions
            .pop()
            .ok_or_else(|| self.error("no function being parsed"))
    }

    fn enter_scope(&mut self) -> Result<(), ParseError> {
        self.state_mut()?.scopes.push(Vec::new());
        Ok(())
    }

    fn leave_scope(&mut self) -> Result<(), ParseError> {
        self.state_mut()?.scopes.pop();
        Ok(())
    }

    fn declare_local(&mut self, name: &str) -> Result<LocalId, ParseError> {
        let state = self.state_mut()?;
        let id = state.locals.len();
        state.locals.push(LocalInfo {
            name: name.to_string(),
            captured: false,
        });
        if let Some(scope) = state.scopes.last_mut() {
            scope.push((name.to_string(), id));
        }
        Ok(id)
    }

    fn resolve(&mut self, name: &str) -> Result<Expr, ParseError> {
        let Some(level) = self.functions.len().checked_sub(1) else {
            return Err(self.error("no function being parsed"));
        };
        Ok(match self.resolve_at(level, name) {
            Some(Resolved::Local(id)) => Expr::Local(id),
            Some(Resolved::Upvalue(index)) => Expr::Upvalue(index),
            None => Expr::Global(name.to_string()),
        })
    }

    fn resolve_at(&mut self, level: usize, name: &str) -> Option<Resolved> {
        if let Some(id) = self.functions[level].find_local(name) {
            return Some(Resolved::Local(id));
        }
        if let Some(index) = self.functions[level]
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Some(Resolved::Upvalue(index));
        }
        if level == 0 {
            return None;
        }

        let source = match self.resolve_at(level - 1, name)? {
            Resolved::Local(id) => {
                self.functions[level - 1].locals[id].captured = true;
                UpvalueSource::Local(id)
            }
            Resolved::Upvalue(index) => UpvalueSource::Upvalue(index),
        };
        let upvalues = &mut self.functions[level].upvalues;
        upvalues.push(Upvalue {
            name: name.to_string(),
            source,
        });
        Some(Resolved::Upvalue(upvalues.len() - 1))
    }

    // ----- token helpers -----

    fn advance(&mut self) -> Result<(), ParseError> {
        let (token, line) = match self.lookahead.take() {
            Some(next) => next,
            None => {
                let token = self.lexer.next_token()?;
                (token, self.lexer.line())
            }
        };
        self.current_token = token;
        self.current_line = line;
        Ok(())
    }

    fn peek(&mut self) -> Result<&Token, ParseError> {
        if self.lookahead.is_none() {
            let token = self.lexer.next_token()?;
            self.lookahead = Some((token, self.lexer.line()));
        }
        match &self.lookahead {
            Some((token, _)) => Ok(token),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        if self.current_token == expected {
            self.advance()
        } else {
            Err(self.error(format!("{} expected near {}", expected, self.current_token)))
        }
    }

    /// Expect the token closing a construct opened on `line`
    fn expect_closing(&mut self, expected: Token, opener: Token, line: u32) -> Result<(), ParseError> {
        if self.current_token == expected {
            return self.advance();
        }
        if line == self.current_line {
            Err(self.error(format!("{} expected near {}", expected, self.current_token)))
        } else {
            Err(self.error(format!(
                "{} expected (to close {} at line {}) near {}",
                expected, opener, line, self.current_token
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match &self.current_token {
            Token::Identifier(name) => {
                let name = name.clone();
                self.advance()?;
                Ok(name)
            }
            other => Err(self.error(format!("<name> expected near {}", other))),
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.current_line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Function {
        Parser::new(source).unwrap().parse().unwrap()
    }

    fn parse_err(source: &str) -> ParseError {
        match Parser::new(source).and_then(|mut p| p.parse()) {
            Ok(_) => panic!("expected a parse error for {:?}", source),
            Err(e) => e,
        }
    }

    #[test]
    fn test_parse_main_function() {
        let chunk = parse("function main(input)\n  return input\nend");
        assert_eq!(chunk.body.len(), 1);

        match &chunk.body[0].kind {
            StatKind::Assign { targets, values } => {
                assert_eq!(targets[0], Expr::Global("main".into()));
                match &values[0] {
                    Expr::Function(f) => {
                        assert_eq!(f.name, "main");
                        assert_eq!(f.params.len(), 1);
                        assert_eq!(f.body[0].kind, StatKind::Return(vec![Expr::Local(0)]));
                        assert_eq!(f.body[0].line, 2);
                    }
                    other => panic!("expected function, got {:?}", other),
                }
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_operator_precedence() {
        let chunk = parse("x = 1 + 2 * 3 ^ 2 .. 'a'");
        let StatKind::Assign { values, .. } = &chunk.body[0].kind else {
            panic!("expected assignment");
        };
        // `..` binds looser than arithmetic
        match &values[0] {
            Expr::Binary { op: BinaryOp::Concat, left, .. } => match left.as_ref() {
                Expr::Binary { op: BinaryOp::Add, right, .. } => {
                    assert!(matches!(right.as_ref(), Expr::Binary { op: BinaryOp::Mul, .. }));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }

        let chunk = parse("x = not a == b or c and d");
        let StatKind::Assign { values, .. } = &chunk.body[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(values[0], Expr::Or(..)));
    }

    #[test]
    fn test_upvalue_resolution() {
        let chunk = parse(
            "local count = 0\n\
             local function bump() count = count + 1 return count end",
        );
        assert!(chunk.locals[0].captured);

        let StatKind::LocalFunction { function, var } = &chunk.body[1].kind else {
            panic!("expected local function");
        };
        assert_eq!(*var, 1);
        assert_eq!(function.upvalues.len(), 1);
        assert_eq!(function.upvalues[0].source, UpvalueSource::Local(0));
        // `bump` never names itself, so it stays a plain slot
        assert!(!chunk.locals[1].captured);
    }

    #[test]
    fn test_local_shadowing_uses_outer_value() {
        let chunk = parse("local x = 1\nlocal x = x + 1");
        let StatKind::Local { names, values } = &chunk.body[1].kind else {
            panic!("expected local");
        };
        assert_eq!(names, &vec![1]);
        assert!(matches!(&values[0], Expr::Binary { left, .. } if **left == Expr::Local(0)));
    }

    #[test]
    fn test_table_constructor() {
        let chunk = parse("t = { 1, 2; x = 3, ['y'] = 4, f() }");
        let StatKind::Assign { values, .. } = &chunk.body[0].kind else {
            panic!("expected assignment");
        };
        let Expr::Table(fields) = &values[0] else {
            panic!("expected table");
        };
        assert_eq!(fields.len(), 5);
        assert!(matches!(fields[2], TableField::Keyed(Expr::Str(_), _)));
        assert!(matches!(fields[4], TableField::Positional(Expr::Call { .. })));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse_err("function main(\n").line, 2);
        assert!(parse_err("x = = 1").message.contains("unexpected symbol"));
        assert!(parse_err("break").message.contains("no loop"));
        assert!(parse_err("if x then").message.contains("'end' expected"));
        assert!(parse_err("f() = 1").message.contains("syntax error"));
        assert!(parse_err("function f() return ... end").message.contains("..."));
    }

    #[test]
    fn test_method_and_repeat_scope() {
        let chunk = parse(
            "function obj:greet(name) return self.prefix .. name end\n\
             repeat local done = true until done",
        );
        let StatKind::Assign { values, .. } = &chunk.body[0].kind else {
            panic!("expected assignment");
        };
        let Expr::Function(f) = &values[0] else {
            panic!("expected function");
        };
        assert_eq!(f.params.len(), 2);
        assert_eq!(f.locals[0].name, "self");

        let StatKind::Repeat { condition, .. } = &chunk.body[1].kind else {
            panic!("expected repeat");
        };
        assert_eq!(*condition, Expr::Local(0));
    }
}
