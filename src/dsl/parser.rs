#![allow(clippy::wildcard_imports)]

use super::ast::*;
use super::error::CompileError;
use super::lexer::{lex_fragment, InterpSegment, SpannedToken, Token};

pub fn parse(tokens: Vec<SpannedToken>) -> Result<Script, Vec<CompileError>> {
    let mut parser = Parser::new(tokens);
    parser.parse_script()
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    next_id: u32,
    errors: Vec<CompileError>,
}

impl Parser {
    fn new(tokens: Vec<SpannedToken>) -> Self {
        Self {
            tokens,
            pos: 0,
            next_id: 0,
            errors: Vec::new(),
        }
    }

    fn parse_script(&mut self) -> Result<Script, Vec<CompileError>> {
        let mut body = Vec::new();

        while !self.at_eof() {
            match self.parse_stmt() {
                Ok(s) => body.push(s),
                Err(e) => {
                    self.errors.push(e);
                    self.recover_to_semicolon();
                }
            }
        }

        if self.errors.is_empty() {
            Ok(Script {
                body,
                node_count: self.next_id,
            })
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).map_or(&Token::Eof, |t| &t.token)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens.get(self.pos + offset).map_or(&Token::Eof, |t| &t.token)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map_or(Span::new(0, 0), |t| t.span)
    }

    /// Span of the most recently consumed token.
    fn prev_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.tokens.get(p))
            .map_or_else(|| self.span(), |t| t.span)
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<Span, CompileError> {
        if self.peek() == expected {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("Expected {expected:?}, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), CompileError> {
        if let Token::Ident(name) = self.peek().clone() {
            let sp = self.span();
            self.advance();
            Ok((name, sp))
        } else {
            Err(CompileError::parser(
                format!("Expected identifier, got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn expect_semicolon(&mut self) -> Result<Span, CompileError> {
        if matches!(self.peek(), Token::Semicolon) {
            let sp = self.span();
            self.advance();
            Ok(sp)
        } else {
            Err(CompileError::parser(
                format!("Expected ';', got {:?}", self.peek()),
                self.span(),
            ))
        }
    }

    fn recover_to_semicolon(&mut self) {
        while !matches!(self.peek(), Token::Semicolon | Token::Eof) {
            self.advance();
        }
        if matches!(self.peek(), Token::Semicolon) {
            self.advance();
        }
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn expr(&mut self, kind: ExprKind, span: Span) -> Expr {
        Expr {
            id: self.next_id(),
            kind,
            span,
        }
    }

    fn stmt(&mut self, kind: StmtKind, span: Span) -> Stmt {
        Stmt {
            id: self.next_id(),
            kind,
            span,
        }
    }

    // ── Statements ────────────────────────────────────────────────

    fn parse_block(&mut self) -> Result<(Vec<Stmt>, Span), CompileError> {
        let start = self.expect(&Token::LBrace)?;
        let mut stmts = Vec::new();
        while !matches!(self.peek(), Token::RBrace | Token::Eof) {
            stmts.push(self.parse_stmt()?);
        }
        let end = self.expect(&Token::RBrace)?;
        Ok((stmts, start.merge(end)))
    }

    fn parse_stmt(&mut self) -> Result<Stmt, CompileError> {
        let start = self.span();
        match self.peek() {
            Token::Var => {
                let stmt = self.parse_var()?;
                self.expect_semicolon()?;
                Ok(stmt)
            }
            Token::LBrace => {
                let (stmts, span) = self.parse_block()?;
                Ok(self.stmt(StmtKind::Block(stmts), span))
            }
            Token::If => {
                self.advance();
                self.expect(&Token::LParen)?;
                let condition = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let then_branch = self.parse_stmt()?;
                let else_branch = if matches!(self.peek(), Token::Else) {
                    self.advance();
                    Some(Box::new(self.parse_stmt()?))
                } else {
                    None
                };
                let end = else_branch.as_ref().map_or(then_branch.span, |e| e.span);
                Ok(self.stmt(
                    StmtKind::If {
                        condition,
                        then_branch: Box::new(then_branch),
                        else_branch,
                    },
                    start.merge(end),
                ))
            }
            Token::While => {
                self.advance();
                self.expect(&Token::LParen)?;
                let condition = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                let body = self.parse_stmt()?;
                let span = start.merge(body.span);
                Ok(self.stmt(
                    StmtKind::While {
                        condition,
                        body: Box::new(body),
                    },
                    span,
                ))
            }
            Token::For => self.parse_for(),
            Token::Return => {
                self.advance();
                let value = if matches!(self.peek(), Token::Semicolon) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let end = self.expect_semicolon()?;
                Ok(self.stmt(StmtKind::Return(value), start.merge(end)))
            }
            Token::Print => {
                self.advance();
                let value = self.parse_expr()?;
                let end = self.expect_semicolon()?;
                Ok(self.stmt(StmtKind::Print(value), start.merge(end)))
            }
            _ => {
                let stmt = self.parse_simple_stmt()?;
                let end = self.expect_semicolon()?;
                Ok(Stmt {
                    span: stmt.span.merge(end),
                    ..stmt
                })
            }
        }
    }

    /// `var name [= expr]` without the terminator.
    fn parse_var(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(&Token::Var)?;
        let (name, name_span) = self.expect_ident()?;
        let init = if matches!(self.peek(), Token::Eq) {
            self.advance();
            Some(self.parse_expr()?)
        } else {
            None
        };
        let end = init.as_ref().map_or(name_span, |e| e.span);
        Ok(self.stmt(
            StmtKind::Var {
                name,
                name_span,
                init,
            },
            start.merge(end),
        ))
    }

    /// Assignment, increment/decrement or expression statement, without the terminator.
    fn parse_simple_stmt(&mut self) -> Result<Stmt, CompileError> {
        let target = self.parse_expr()?;
        match self.peek() {
            Token::Eq => {
                Self::check_assign_target(&target)?;
                self.advance();
                let value = self.parse_expr()?;
                let span = target.span.merge(value.span);
                Ok(self.stmt(StmtKind::Assign { target, value }, span))
            }
            Token::PlusPlus | Token::MinusMinus => {
                Self::check_assign_target(&target)?;
                let op = if matches!(self.peek(), Token::PlusPlus) {
                    IncOp::Increment
                } else {
                    IncOp::Decrement
                };
                let end = self.span();
                self.advance();
                let span = target.span.merge(end);
                Ok(self.stmt(StmtKind::Increment { target, op }, span))
            }
            _ => {
                let span = target.span;
                Ok(self.stmt(StmtKind::Expr(target), span))
            }
        }
    }

    fn check_assign_target(target: &Expr) -> Result<(), CompileError> {
        match target.kind {
            ExprKind::Ident(_) | ExprKind::Member { .. } | ExprKind::Index { .. } => Ok(()),
            _ => Err(CompileError::parser("Invalid assignment target", target.span)),
        }
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        let start = self.expect(&Token::For)?;
        self.expect(&Token::LParen)?;
        let init = match self.peek() {
            Token::Semicolon => None,
            Token::Var => Some(Box::new(self.parse_var()?)),
            _ => Some(Box::new(self.parse_simple_stmt()?)),
        };
        self.expect_semicolon()?;
        let condition = if matches!(self.peek(), Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_semicolon()?;
        let step = if matches!(self.peek(), Token::RParen) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };
        self.expect(&Token::RParen)?;
        let body = self.parse_stmt()?;
        let span = start.merge(body.span);
        Ok(self.stmt(
            StmtKind::For {
                init,
                condition,
                step,
                body: Box::new(body),
            },
            span,
        ))
    }

    // ── Expression parsing (precedence climbing) ──────────────────

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            let span = left.span.merge(right.span);
            left = self.expr(
                ExprKind::Logical {
                    op: LogicOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_equality()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            let span = left.span.merge(right.span);
            left = self.expr(
                ExprKind::Logical {
                    op: LogicOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }
        Ok(left)
    }

    fn binary(&mut self, op: BinOp, left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        self.expr(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinOp::Eq,
                Token::Ne => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinOp::Lt,
                Token::Gt => BinOp::Gt,
                Token::Le => BinOp::Le,
                Token::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_add()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = self.binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Bang => UnaryOp::Not,
            _ => return self.parse_postfix(),
        };
        let start = self.span();
        self.advance();
        let operand = self.parse_unary()?;
        let span = start.merge(operand.span);
        Ok(self.expr(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let (name, name_span) = self.expect_ident()?;
                    let span = expr.span.merge(name_span);
                    expr = self.expr(
                        ExprKind::Member {
                            object: Box::new(expr),
                            name,
                            name_span,
                        },
                        span,
                    );
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let end = self.expect(&Token::RBracket)?;
                    let span = expr.span.merge(end);
                    expr = self.expr(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                Token::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let span = expr.span.merge(self.prev_span());
                    expr = self.expr(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            args.push(self.parse_expr()?);
            while matches!(self.peek(), Token::Comma) {
                self.advance();
                args.push(self.parse_expr()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    /// True if the tokens at the cursor start a lambda: `x =>` or `(a, b) =>`.
    fn at_lambda(&self) -> bool {
        match self.peek() {
            Token::Ident(_) => matches!(self.peek_at(1), Token::FatArrow),
            Token::LParen => {
                let mut offset = 1;
                loop {
                    match self.peek_at(offset) {
                        Token::RParen => return matches!(self.peek_at(offset + 1), Token::FatArrow),
                        Token::Ident(_) | Token::Comma => offset += 1,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        if self.at_lambda() {
            return self.parse_lambda();
        }
        let span = self.span();
        match self.peek().clone() {
            Token::Number(v) => {
                self.advance();
                Ok(self.expr(ExprKind::Literal(Literal::Number(v)), span))
            }
            Token::Str(s) => {
                self.advance();
                Ok(self.expr(ExprKind::Literal(Literal::Str(s)), span))
            }
            Token::True | Token::False => {
                let value = matches!(self.peek(), Token::True);
                self.advance();
                Ok(self.expr(ExprKind::Literal(Literal::Bool(value)), span))
            }
            Token::Null => {
                self.advance();
                Ok(self.expr(ExprKind::Literal(Literal::Null), span))
            }
            Token::Ident(name) => {
                self.advance();
                Ok(self.expr(ExprKind::Ident(name), span))
            }
            Token::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(&Token::RParen)?;
                Ok(self.expr(ExprKind::Grouping(Box::new(inner)), span.merge(end)))
            }
            Token::LBrace => self.parse_object(),
            Token::LBracket => self.parse_array(),
            Token::Interpolated(segments) => {
                self.advance();
                self.parse_interpolated(segments, span)
            }
            _ => Err(CompileError::parser(
                format!("Unexpected token: {:?}", self.peek()),
                self.span(),
            )),
        }
    }

    fn parse_lambda(&mut self) -> Result<Expr, CompileError> {
        let start = self.span();
        let mut params = Vec::new();
        if matches!(self.peek(), Token::LParen) {
            self.advance();
            if !matches!(self.peek(), Token::RParen) {
                loop {
                    let (name, span) = self.expect_ident()?;
                    let id = self.next_id();
                    params.push(Param { id, name, span });
                    if matches!(self.peek(), Token::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
            self.expect(&Token::RParen)?;
        } else {
            let (name, span) = self.expect_ident()?;
            let id = self.next_id();
            params.push(Param { id, name, span });
        }
        self.expect(&Token::FatArrow)?;

        let (body, end) = if matches!(self.peek(), Token::LBrace) {
            let (stmts, span) = self.parse_block()?;
            (LambdaBody::Block(stmts), span)
        } else {
            let expr = self.parse_expr()?;
            let span = expr.span;
            (LambdaBody::Expr(Box::new(expr)), span)
        };
        Ok(self.expr(ExprKind::Lambda(Box::new(Lambda { params, body })), start.merge(end)))
    }

    fn parse_object(&mut self) -> Result<Expr, CompileError> {
        let start = self.expect(&Token::LBrace)?;
        let mut props = Vec::new();
        while !matches!(self.peek(), Token::RBrace) {
            let key_span = self.span();
            let name = match self.peek().clone() {
                Token::Ident(name) | Token::Str(name) => {
                    self.advance();
                    name
                }
                other => {
                    return Err(CompileError::parser(
                        format!("Expected property name, got {other:?}"),
                        key_span,
                    ));
                }
            };
            self.expect(&Token::Colon)?;
            let value = self.parse_expr()?;
            let span = key_span.merge(value.span);
            props.push(Property { name, value, span });
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        let end = self.expect(&Token::RBrace)?;
        Ok(self.expr(ExprKind::Object(props), start.merge(end)))
    }

    fn parse_array(&mut self) -> Result<Expr, CompileError> {
        let start = self.expect(&Token::LBracket)?;
        let mut elements = Vec::new();
        while !matches!(self.peek(), Token::RBracket) {
            elements.push(self.parse_expr()?);
            if matches!(self.peek(), Token::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        let end = self.expect(&Token::RBracket)?;
        Ok(self.expr(ExprKind::Array(elements), start.merge(end)))
    }

    /// Parse each code segment with its own token stream, sharing the node id counter.
    fn parse_interpolated(
        &mut self,
        segments: Vec<InterpSegment>,
        span: Span,
    ) -> Result<Expr, CompileError> {
        let mut parts = Vec::new();
        for segment in segments {
            match segment {
                InterpSegment::Text(text) => parts.push(InterpPart::Text(text)),
                InterpSegment::Code { source, offset } => {
                    let tokens = match lex_fragment(&source, offset) {
                        Ok(tokens) => tokens,
                        Err(mut errors) => {
                            let first = errors.remove(0);
                            self.errors.extend(errors);
                            return Err(first);
                        }
                    };
                    let saved_tokens = std::mem::replace(&mut self.tokens, tokens);
                    let saved_pos = std::mem::replace(&mut self.pos, 0);
                    let parsed = self.parse_expr().and_then(|expr| {
                        if self.at_eof() {
                            Ok(expr)
                        } else {
                            Err(CompileError::parser(
                                format!("Unexpected token in interpolation: {:?}", self.peek()),
                                self.span(),
                            ))
                        }
                    });
                    self.tokens = saved_tokens;
                    self.pos = saved_pos;
                    parts.push(InterpPart::Expr(parsed?));
                }
            }
        }
        Ok(self.expr(ExprKind::Interpolated(parts), span))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::lexer::lex;

    fn parse_str(s: &str) -> Script {
        let tokens = lex(s).unwrap();
        parse(tokens).unwrap()
    }

    fn parse_err(s: &str) -> Vec<CompileError> {
        let tokens = lex(s).unwrap();
        parse(tokens).unwrap_err()
    }

    fn only_expr(script: &Script) -> &Expr {
        match &script.body[0].kind {
            StmtKind::Expr(e) | StmtKind::Return(Some(e)) => e,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn parse_var_declarations() {
        let script = parse_str("var x = 1; var y;");
        assert_eq!(script.body.len(), 2);
        assert!(matches!(&script.body[0].kind, StmtKind::Var { name, init: Some(_), .. } if name == "x"));
        assert!(matches!(&script.body[1].kind, StmtKind::Var { name, init: None, .. } if name == "y"));
    }

    #[test]
    fn parse_precedence() {
        let script = parse_str("return 2 + 3 * 4;");
        let ExprKind::Binary { op, right, .. } = &only_expr(&script).kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn parse_if_else() {
        let script = parse_str("var v; if (false) v = 1; else v = \"s\";");
        let StmtKind::If { else_branch, then_branch, .. } = &script.body[1].kind else {
            panic!("expected if");
        };
        assert!(matches!(then_branch.kind, StmtKind::Assign { .. }));
        assert!(else_branch.is_some());
    }

    #[test]
    fn parse_for_loop() {
        let script = parse_str("for (var i = 0; i < 10; i++) { print i; }");
        let StmtKind::For { init, condition, step, .. } = &script.body[0].kind else {
            panic!("expected for");
        };
        assert!(init.is_some() && condition.is_some());
        assert!(matches!(step.as_ref().unwrap().kind, StmtKind::Increment { op: IncOp::Increment, .. }));
    }

    #[test]
    fn parse_lambda_forms() {
        let script = parse_str("var f = (a, b) => a + b; var g = x => { return x; }; var h = () => 1;");
        for stmt in &script.body {
            let StmtKind::Var { init: Some(init), .. } = &stmt.kind else {
                panic!("expected var");
            };
            assert!(matches!(init.kind, ExprKind::Lambda(_)));
        }
    }

    #[test]
    fn grouping_is_not_lambda() {
        let script = parse_str("return (a) + 1;");
        assert!(matches!(only_expr(&script).kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn parse_object_and_array_literals() {
        let script = parse_str("var a = {x: 1, \"y\": [1, 2,]};");
        let StmtKind::Var { init: Some(init), .. } = &script.body[0].kind else {
            panic!("expected var");
        };
        let ExprKind::Object(props) = &init.kind else {
            panic!("expected object");
        };
        assert_eq!(props.len(), 2);
        assert_eq!(props[1].name, "y");
        assert!(matches!(&props[1].value.kind, ExprKind::Array(items) if items.len() == 2));
    }

    #[test]
    fn parse_member_index_and_call_chain() {
        let script = parse_str("a.b[0](1, 2).c;");
        let ExprKind::Member { object, name, .. } = &only_expr(&script).kind else {
            panic!("expected member");
        };
        assert_eq!(name, "c");
        assert!(matches!(object.kind, ExprKind::Call { ref args, .. } if args.len() == 2));
    }

    #[test]
    fn parse_interpolated_string() {
        let script = parse_str("print $\"sum {a + b}\";");
        let StmtKind::Print(e) = &script.body[0].kind else {
            panic!("expected print");
        };
        let ExprKind::Interpolated(parts) = &e.kind else {
            panic!("expected interpolation");
        };
        assert!(matches!(&parts[0], InterpPart::Text(t) if t == "sum "));
        let InterpPart::Expr(inner) = &parts[1] else {
            panic!("expected code part");
        };
        assert!(matches!(inner.kind, ExprKind::Binary { op: BinOp::Add, .. }));
        assert_eq!(inner.span, Span::new(13, 18));
    }

    #[test]
    fn node_ids_are_unique() {
        let script = parse_str("var a = {x: 1}; a.x = a.x + 1;");
        let mut seen = std::collections::HashSet::new();
        fn walk_expr(e: &Expr, seen: &mut std::collections::HashSet<NodeId>) {
            assert!(seen.insert(e.id));
            match &e.kind {
                ExprKind::Binary { left, right, .. } => {
                    walk_expr(left, seen);
                    walk_expr(right, seen);
                }
                ExprKind::Member { object, .. } => walk_expr(object, seen),
                ExprKind::Object(props) => props.iter().for_each(|p| walk_expr(&p.value, seen)),
                _ => {}
            }
        }
        for stmt in &script.body {
            assert!(seen.insert(stmt.id));
            match &stmt.kind {
                StmtKind::Var { init: Some(e), .. } => walk_expr(e, &mut seen),
                StmtKind::Assign { target, value } => {
                    walk_expr(target, &mut seen);
                    walk_expr(value, &mut seen);
                }
                _ => {}
            }
        }
        assert_eq!(seen.len() as u32, script.node_count);
    }

    #[test]
    fn invalid_assignment_target() {
        let errors = parse_err("1 = 2;");
        assert!(errors[0].message.contains("Invalid assignment target"));
    }

    #[test]
    fn missing_semicolon_reports_and_recovers() {
        let errors = parse_err("var a = 1 var b = 2; var c = ;");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("Expected ';'"));
    }
}
