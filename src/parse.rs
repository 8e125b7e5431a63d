//! Análisis sintáctico.
//!
//! Un descenso recursivo clásico sobre la secuencia de tokens. Los
//! bloques ya llegan delimitados por los tokens sintéticos `INDENT` y
//! `DEDENT` del lexer, por lo cual la gramática se lee igual que la de
//! un lenguaje con llaves. Las expresiones se analizan por precedencia
//! ascendente, de `or` hacia los operadores postfijos.
//!
//! No hay recuperación de errores: el primer token inesperado detiene
//! el análisis con su ubicación exacta.

use crate::ast::*;
use crate::lex::{self, Keyword, Op, Token};
use crate::source::{Located, Span};

use thiserror::Error;

/// Error de análisis sintáctico.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("struct initializers require `field=value` pairs")]
    PositionalStructField,

    #[error("Array size must be an integer literal")]
    ArraySize,

    #[error("invalid f-string fragment: {0}")]
    BadFString(String),

    #[error("expected a pattern, found {0}")]
    BadPattern(String),
}

type Parse<T> = Result<T, Located<ParseError>>;

/// Construye el AST de una unidad de traducción a partir de sus tokens.
pub fn parse(tokens: Vec<Located<Token>>) -> Parse<Program> {
    Parser::new(tokens).program()
}

struct Parser {
    tokens: Vec<Located<Token>>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Located<Token>>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn current(&self) -> &Token {
        self.tokens[self.pos.min(self.tokens.len() - 1)].as_ref()
    }

    fn peek(&self, offset: usize) -> &Token {
        let pos = (self.pos + offset).min(self.tokens.len() - 1);
        self.tokens[pos].as_ref()
    }

    fn span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].span()
    }

    fn prev_span(&self) -> Span {
        let pos = self.pos.saturating_sub(1);
        self.tokens[pos].span()
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check_op(&self, op: Op) -> bool {
        matches!(self.current(), Token::Op(found) if *found == op)
    }

    fn match_op(&mut self, op: Op) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: Op) -> Parse<Span> {
        if self.check_op(op) {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(self.unexpected(&format!("`{}`", op)))
        }
    }

    fn check_kw(&self, keyword: Keyword) -> bool {
        matches!(self.current(), Token::Keyword(found) if *found == keyword)
    }

    fn match_kw(&mut self, keyword: Keyword) -> bool {
        if self.check_kw(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, keyword: Keyword) -> Parse<Span> {
        if self.check_kw(keyword) {
            let span = self.span();
            self.advance();
            Ok(span)
        } else {
            Err(self.unexpected(&format!("keyword `{}`", keyword)))
        }
    }

    fn expect_ident(&mut self) -> Parse<Located<String>> {
        match self.current() {
            Token::Ident(_) => {
                let span = self.span();
                match self.advance() {
                    Token::Ident(name) => Ok(Located::at(name, span)),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    fn expect_newline(&mut self) -> Parse<()> {
        match self.current() {
            Token::Newline => {
                self.advance();
                Ok(())
            }
            // Un fin de archivo limpio cierra la última línea lógica
            Token::Eof => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.current(), Token::Newline) {
            self.advance();
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    fn unexpected(&self, expected: &str) -> Located<ParseError> {
        Located::at(
            ParseError::Unexpected {
                expected: expected.to_owned(),
                found: self.current().to_string(),
            },
            self.span(),
        )
    }

    // ---------------------------------------------------------------
    // Tipos
    // ---------------------------------------------------------------

    fn type_annotation(&mut self) -> Parse<Type> {
        if self.match_kw(Keyword::Volatile) {
            let inner = self.type_annotation()?;
            return Ok(Type::Volatile(Box::new(inner)));
        }

        let name = match self.current() {
            Token::Ident(name) => name.clone(),
            _ => return Err(self.unexpected("a type")),
        };
        self.advance();

        if let Some(primitive) = primitive_type(&name) {
            return Ok(primitive);
        }

        match name.as_str() {
            "Ptr" => {
                self.expect_op(Op::LBracket)?;
                let inner = self.type_annotation()?;
                self.expect_op(Op::RBracket)?;
                Ok(Type::Ptr(Box::new(inner)))
            }

            "Array" => {
                self.expect_op(Op::LBracket)?;
                let size = match self.current() {
                    Token::Int(n) if *n > 0 => *n as u32,
                    _ => return Err(Located::at(ParseError::ArraySize, self.span())),
                };
                self.advance();
                self.expect_op(Op::Comma)?;
                let element = self.type_annotation()?;
                self.expect_op(Op::RBracket)?;
                Ok(Type::Array(size, Box::new(element)))
            }

            "Fn" => {
                self.expect_op(Op::LBracket)?;
                let ret = self.type_annotation()?;
                let mut params = Vec::new();
                while self.match_op(Op::Comma) {
                    params.push(self.type_annotation()?);
                }
                self.expect_op(Op::RBracket)?;
                Ok(Type::Fn {
                    ret: Box::new(ret),
                    params,
                })
            }

            "List" => {
                self.expect_op(Op::LBracket)?;
                let inner = self.type_annotation()?;
                self.expect_op(Op::RBracket)?;
                Ok(Type::List(Box::new(inner)))
            }

            "Dict" => {
                self.expect_op(Op::LBracket)?;
                let key = self.type_annotation()?;
                self.expect_op(Op::Comma)?;
                let value = self.type_annotation()?;
                self.expect_op(Op::RBracket)?;
                Ok(Type::Dict(Box::new(key), Box::new(value)))
            }

            "Tuple" => {
                self.expect_op(Op::LBracket)?;
                let mut elements = vec![self.type_annotation()?];
                while self.match_op(Op::Comma) {
                    elements.push(self.type_annotation()?);
                }
                self.expect_op(Op::RBracket)?;
                Ok(Type::Tuple(elements))
            }

            "Optional" => {
                self.expect_op(Op::LBracket)?;
                let inner = self.type_annotation()?;
                self.expect_op(Op::RBracket)?;
                Ok(Type::Optional(Box::new(inner)))
            }

            _ => Ok(Type::Named(name)),
        }
    }

    // ---------------------------------------------------------------
    // Expresiones, de menor a mayor precedencia
    // ---------------------------------------------------------------

    fn expression(&mut self) -> Parse<Expr> {
        let start = self.span();
        let expr = self.or_expr()?;

        // Condicional `x if c else y`
        if self.match_kw(Keyword::If) {
            let cond = self.or_expr()?;
            self.expect_kw(Keyword::Else)?;
            let otherwise = self.expression()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(expr),
                    otherwise: Box::new(otherwise),
                },
                span,
            ));
        }

        Ok(expr)
    }

    fn binary(&mut self, start: Span, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        let span = start.to(self.prev_span());
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        )
    }

    fn or_expr(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.and_expr()?;
        while self.match_kw(Keyword::Or) {
            let right = self.and_expr()?;
            left = self.binary(start, BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.not_expr()?;
        while self.match_kw(Keyword::And) {
            let right = self.not_expr()?;
            left = self.binary(start, BinOp::And, left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Parse<Expr> {
        let start = self.span();
        if self.match_kw(Keyword::Not) {
            let operand = self.not_expr()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            ));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.bitor()?;

        loop {
            let op = match self.current() {
                Token::Op(Op::Eq) => BinOp::Eq,
                Token::Op(Op::Ne) => BinOp::Ne,
                Token::Op(Op::Lt) => BinOp::Lt,
                Token::Op(Op::Le) => BinOp::Le,
                Token::Op(Op::Gt) => BinOp::Gt,
                Token::Op(Op::Ge) => BinOp::Ge,
                Token::Keyword(Keyword::In) => BinOp::In,
                Token::Keyword(Keyword::Is) => BinOp::Is,
                Token::Keyword(Keyword::Not) if matches!(self.peek(1), Token::Keyword(Keyword::In)) => {
                    self.advance();
                    BinOp::NotIn
                }
                _ => break,
            };
            self.advance();

            let op = if op == BinOp::Is && self.match_kw(Keyword::Not) {
                BinOp::IsNot
            } else {
                op
            };

            let right = self.bitor()?;
            left = self.binary(start, op, left, right);
        }

        Ok(left)
    }

    fn bitor(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.bitxor()?;
        while self.match_op(Op::Pipe) {
            let right = self.bitxor()?;
            left = self.binary(start, BinOp::BitOr, left, right);
        }
        Ok(left)
    }

    fn bitxor(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.bitand()?;
        while self.match_op(Op::Caret) {
            let right = self.bitand()?;
            left = self.binary(start, BinOp::BitXor, left, right);
        }
        Ok(left)
    }

    fn bitand(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.shift()?;
        while self.match_op(Op::Amp) {
            let right = self.shift()?;
            left = self.binary(start, BinOp::BitAnd, left, right);
        }
        Ok(left)
    }

    fn shift(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.additive()?;
        loop {
            if self.match_op(Op::Shl) {
                let right = self.additive()?;
                left = self.binary(start, BinOp::Shl, left, right);
            } else if self.match_op(Op::Shr) {
                let right = self.additive()?;
                left = self.binary(start, BinOp::Shr, left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn additive(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.multiplicative()?;
        loop {
            if self.match_op(Op::Plus) {
                let right = self.multiplicative()?;
                left = self.binary(start, BinOp::Add, left, right);
            } else if self.match_op(Op::Minus) {
                let right = self.multiplicative()?;
                left = self.binary(start, BinOp::Sub, left, right);
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut left = self.unary()?;
        loop {
            let op = if self.match_op(Op::Star) {
                BinOp::Mul
            } else if self.match_op(Op::Slash) {
                BinOp::Div
            } else if self.match_op(Op::SlashSlash) {
                BinOp::IntDiv
            } else if self.match_op(Op::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.unary()?;
            left = self.binary(start, op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Parse<Expr> {
        let start = self.span();

        if self.match_op(Op::Minus) {
            let operand = self.unary()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                span,
            ));
        }

        if self.match_op(Op::Tilde) {
            let operand = self.unary()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::BitNot,
                    operand: Box::new(operand),
                },
                span,
            ));
        }

        if self.match_op(Op::Amp) {
            let operand = self.unary()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(ExprKind::AddressOf(Box::new(operand)), span));
        }

        if self.match_op(Op::Star) {
            let operand = self.unary()?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(ExprKind::Deref(Box::new(operand)), span));
        }

        self.power()
    }

    fn power(&mut self) -> Parse<Expr> {
        let start = self.span();
        let left = self.postfix()?;

        // `**` asocia a la derecha
        if self.match_op(Op::StarStar) {
            let right = self.power()?;
            return Ok(self.binary(start, BinOp::Pow, left, right));
        }

        Ok(left)
    }

    fn postfix(&mut self) -> Parse<Expr> {
        let start = self.span();
        let mut expr = self.primary()?;

        loop {
            if self.match_op(Op::LParen) {
                let (args, kwargs) = self.call_arguments()?;
                let span = start.to(self.prev_span());
                expr = Expr::new(
                    ExprKind::Call {
                        func: Box::new(expr),
                        args,
                        kwargs,
                    },
                    span,
                );
            } else if self.match_op(Op::LBracket) {
                expr = self.index_or_slice(start, expr)?;
            } else if self.match_op(Op::Dot) {
                let name = self.expect_ident()?.into_inner();
                if self.match_op(Op::LParen) {
                    let (args, _) = self.call_arguments()?;
                    let span = start.to(self.prev_span());
                    expr = Expr::new(
                        ExprKind::MethodCall {
                            base: Box::new(expr),
                            name,
                            args,
                        },
                        span,
                    );
                } else {
                    let span = start.to(self.prev_span());
                    expr = Expr::new(
                        ExprKind::Attr {
                            base: Box::new(expr),
                            name,
                        },
                        span,
                    );
                }
            } else if self.check_op(Op::LBrace) {
                // Inicialización de struct: `T{campo=valor, …}`
                let name = match &expr.kind {
                    ExprKind::Ident { name, .. } => name.clone(),
                    _ => break,
                };
                self.advance();
                let fields = self.struct_fields()?;
                let span = start.to(self.prev_span());
                expr = Expr::new(ExprKind::StructLit { name, fields }, span);
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn call_arguments(&mut self) -> Parse<(Vec<Expr>, Vec<(String, Expr)>)> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();

        if !self.check_op(Op::RParen) {
            loop {
                let arg = self.expression()?;
                if self.check_op(Op::Assign) {
                    match arg.kind {
                        ExprKind::Ident { name, .. } => {
                            self.advance();
                            kwargs.push((name, self.expression()?));
                        }
                        _ => return Err(self.unexpected("`,` or `)`")),
                    }
                } else {
                    args.push(arg);
                }

                if !self.match_op(Op::Comma) {
                    break;
                }
                if self.check_op(Op::RParen) {
                    break;
                }
            }
        }

        self.expect_op(Op::RParen)?;
        Ok((args, kwargs))
    }

    fn index_or_slice(&mut self, start: Span, base: Expr) -> Parse<Expr> {
        // `[a:b:c]` con los tres componentes opcionales
        let first = if self.check_op(Op::Colon) {
            None
        } else {
            Some(self.expression()?)
        };

        if self.match_op(Op::Colon) {
            let stop = if self.check_op(Op::RBracket) || self.check_op(Op::Colon) {
                None
            } else {
                Some(Box::new(self.expression()?))
            };

            let step = if self.match_op(Op::Colon) {
                if self.check_op(Op::RBracket) {
                    None
                } else {
                    Some(Box::new(self.expression()?))
                }
            } else {
                None
            };

            self.expect_op(Op::RBracket)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Slice {
                    base: Box::new(base),
                    start: first.map(Box::new),
                    stop,
                    step,
                },
                span,
            ));
        }

        let index = first.ok_or_else(|| self.unexpected("an index expression"))?;
        self.expect_op(Op::RBracket)?;
        let span = start.to(self.prev_span());
        Ok(Expr::new(
            ExprKind::Index {
                base: Box::new(base),
                index: Box::new(index),
            },
            span,
        ))
    }

    fn struct_fields(&mut self) -> Parse<Vec<(String, Expr)>> {
        let mut fields = Vec::new();

        while !self.check_op(Op::RBrace) {
            let name = match self.current() {
                Token::Ident(_) if matches!(self.peek(1), Token::Op(Op::Assign)) => {
                    self.expect_ident()?.into_inner()
                }
                _ => return Err(Located::at(ParseError::PositionalStructField, self.span())),
            };
            self.expect_op(Op::Assign)?;
            fields.push((name, self.expression()?));

            if !self.match_op(Op::Comma) {
                break;
            }
        }

        self.expect_op(Op::RBrace)?;
        Ok(fields)
    }

    fn primary(&mut self) -> Parse<Expr> {
        let start = self.span();

        match self.current().clone() {
            Token::Int(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(value), start))
            }

            Token::Float(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(value), start))
            }

            Token::Str(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Str(value), start))
            }

            Token::Char(value) => {
                self.advance();
                Ok(Expr::new(ExprKind::Char(value), start))
            }

            Token::FString(raw) => {
                self.advance();
                let parts = self.fstring_parts(&raw, start)?;
                Ok(Expr::new(ExprKind::FString(parts), start))
            }

            Token::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), start))
            }

            Token::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), start))
            }

            Token::Keyword(Keyword::None) => {
                self.advance();
                Ok(Expr::new(ExprKind::NoneLit, start))
            }

            Token::Keyword(Keyword::Lambda) => {
                self.advance();
                let mut params = Vec::new();
                if !self.check_op(Op::Colon) {
                    params.push(self.expect_ident()?.into_inner());
                    while self.match_op(Op::Comma) {
                        params.push(self.expect_ident()?.into_inner());
                    }
                }
                self.expect_op(Op::Colon)?;
                let body = self.expression()?;
                let span = start.to(self.prev_span());
                Ok(Expr::new(
                    ExprKind::Lambda {
                        params,
                        body: Box::new(body),
                    },
                    span,
                ))
            }

            Token::Keyword(Keyword::Asm) => {
                self.advance();
                self.expect_op(Op::LParen)?;
                let text = match self.current().clone() {
                    Token::Str(text) => {
                        self.advance();
                        text
                    }
                    _ => return Err(self.unexpected("a string literal")),
                };
                self.expect_op(Op::RParen)?;
                let span = start.to(self.prev_span());
                Ok(Expr::new(ExprKind::Asm(text), span))
            }

            Token::Ident(name) => self.primary_ident(name, start),

            Token::Op(Op::LBracket) => self.list_or_comprehension(start),

            Token::Op(Op::LBrace) => self.dict_literal(start),

            Token::Op(Op::LParen) => self.paren_or_tuple(start),

            _ => Err(self.unexpected("an expression")),
        }
    }

    fn primary_ident(&mut self, name: String, start: Span) -> Parse<Expr> {
        self.advance();

        // `cast[T](e)`: conversión explícita sin chequeo
        if name == "cast" && self.check_op(Op::LBracket) {
            self.advance();
            let ty = self.type_annotation()?;
            self.expect_op(Op::RBracket)?;
            self.expect_op(Op::LParen)?;
            let expr = self.expression()?;
            self.expect_op(Op::RParen)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Cast {
                    ty,
                    expr: Box::new(expr),
                },
                span,
            ));
        }

        // `sizeof(T)`
        if name == "sizeof" && self.check_op(Op::LParen) {
            self.advance();
            let ty = self.type_annotation()?;
            self.expect_op(Op::RParen)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(ExprKind::Sizeof(ty), span));
        }

        // Conversión con sintaxis de llamada: `int32(x)`
        if self.check_op(Op::LParen) {
            if let Some(target) = primitive_type(&name) {
                if !matches!(target, Type::Void) {
                    self.advance();
                    let expr = self.expression()?;
                    self.expect_op(Op::RParen)?;
                    let span = start.to(self.prev_span());
                    return Ok(Expr::new(
                        ExprKind::Cast {
                            ty: target,
                            expr: Box::new(expr),
                        },
                        span,
                    ));
                }
            }
        }

        // `Ptr[T](e)` es una conversión a puntero tipado
        if name == "Ptr" && self.check_op(Op::LBracket) {
            self.advance();
            let inner = self.type_annotation()?;
            self.expect_op(Op::RBracket)?;
            self.expect_op(Op::LParen)?;
            let expr = self.expression()?;
            self.expect_op(Op::RParen)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Cast {
                    ty: Type::Ptr(Box::new(inner)),
                    expr: Box::new(expr),
                },
                span,
            ));
        }

        Ok(Expr::new(
            ExprKind::Ident {
                name,
                binding: None,
            },
            start,
        ))
    }

    fn list_or_comprehension(&mut self, start: Span) -> Parse<Expr> {
        self.advance(); // `[`

        if self.match_op(Op::RBracket) {
            return Ok(Expr::new(ExprKind::ListLit(Vec::new()), start));
        }

        let first = self.expression()?;

        // Comprensión: `[e for v in iterable if cond]`
        if self.match_kw(Keyword::For) {
            let var = self.expect_ident()?.into_inner();
            self.expect_kw(Keyword::In)?;
            // `or_expr` evita que el `if` del filtro se lea como
            // condicional ternario
            let iter = self.or_expr()?;
            let cond = if self.match_kw(Keyword::If) {
                Some(Box::new(self.or_expr()?))
            } else {
                None
            };
            self.expect_op(Op::RBracket)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(
                ExprKind::Comp {
                    element: Box::new(first),
                    var,
                    iter: Box::new(iter),
                    cond,
                    slots: None,
                },
                span,
            ));
        }

        let mut elements = vec![first];
        while self.match_op(Op::Comma) {
            if self.check_op(Op::RBracket) {
                break;
            }
            elements.push(self.expression()?);
        }
        self.expect_op(Op::RBracket)?;
        let span = start.to(self.prev_span());
        Ok(Expr::new(ExprKind::ListLit(elements), span))
    }

    fn dict_literal(&mut self, start: Span) -> Parse<Expr> {
        self.advance(); // `{`

        if self.match_op(Op::RBrace) {
            return Ok(Expr::new(ExprKind::DictLit(Vec::new()), start));
        }

        let first = self.expression()?;
        self.expect_op(Op::Colon)?;
        let value = self.expression()?;
        let mut pairs = vec![(first, value)];

        while self.match_op(Op::Comma) {
            if self.check_op(Op::RBrace) {
                break;
            }
            let key = self.expression()?;
            self.expect_op(Op::Colon)?;
            let value = self.expression()?;
            pairs.push((key, value));
        }

        self.expect_op(Op::RBrace)?;
        let span = start.to(self.prev_span());
        Ok(Expr::new(ExprKind::DictLit(pairs), span))
    }

    fn paren_or_tuple(&mut self, start: Span) -> Parse<Expr> {
        self.advance(); // `(`

        if self.match_op(Op::RParen) {
            return Ok(Expr::new(ExprKind::TupleLit(Vec::new()), start));
        }

        let first = self.expression()?;

        if self.match_op(Op::Comma) {
            let mut elements = vec![first];
            while !self.check_op(Op::RParen) {
                elements.push(self.expression()?);
                if !self.match_op(Op::Comma) {
                    break;
                }
            }
            self.expect_op(Op::RParen)?;
            let span = start.to(self.prev_span());
            return Ok(Expr::new(ExprKind::TupleLit(elements), span));
        }

        self.expect_op(Op::RParen)?;
        Ok(first)
    }

    /// Separa el cuerpo de una f-string en fragmentos literales y de
    /// expresión. Cada región `{…}` se vuelve a analizar con un parser
    /// anidado sobre sus propios tokens.
    fn fstring_parts(&mut self, raw: &str, span: Span) -> Parse<Vec<FsPart>> {
        let chars: Vec<char> = raw.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;

        let bad = |message: String| Located::at(ParseError::BadFString(message), span);

        while i < chars.len() {
            match chars[i] {
                '{' if chars.get(i + 1) == Some(&'{') => {
                    literal.push('{');
                    i += 2;
                }
                '}' if chars.get(i + 1) == Some(&'}') => {
                    literal.push('}');
                    i += 2;
                }
                '{' => {
                    let close = chars[i + 1..]
                        .iter()
                        .position(|&c| c == '}')
                        .ok_or_else(|| bad("unterminated `{`".to_owned()))?;

                    let inner: String = chars[i + 1..i + 1 + close].iter().collect();
                    if inner.trim().is_empty() {
                        return Err(bad("empty expression".to_owned()));
                    }

                    if !literal.is_empty() {
                        parts.push(FsPart::Lit(std::mem::take(&mut literal)));
                    }

                    let tokens = lex::tokenize(&inner)
                        .map_err(|error| bad(error.val().to_string()))?;
                    let mut nested = Parser::new(tokens);
                    let expr = nested
                        .expression()
                        .map_err(|error| bad(error.val().to_string()))?;
                    nested.skip_newlines();
                    if !nested.at_end() {
                        return Err(bad("trailing tokens after expression".to_owned()));
                    }

                    parts.push(FsPart::Expr(expr));
                    i += close + 2;
                }
                c => {
                    literal.push(c);
                    i += 1;
                }
            }
        }

        if !literal.is_empty() {
            parts.push(FsPart::Lit(literal));
        }

        Ok(parts)
    }

    // ---------------------------------------------------------------
    // Sentencias
    // ---------------------------------------------------------------

    fn block(&mut self) -> Parse<Vec<Stmt>> {
        self.expect_op(Op::Colon)?;
        self.expect_newline()?;
        self.skip_newlines();

        match self.current() {
            Token::Indent => {
                self.advance();
            }
            _ => return Err(self.unexpected("an indented block")),
        }

        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.current(), Token::Dedent | Token::Eof) {
                break;
            }
            stmts.push(self.statement()?);
        }

        match self.current() {
            Token::Dedent => {
                self.advance();
            }
            Token::Eof => (),
            _ => return Err(self.unexpected("dedent")),
        }

        Ok(stmts)
    }

    fn statement(&mut self) -> Parse<Stmt> {
        let start = self.span();

        match self.current() {
            Token::Keyword(Keyword::Return) => {
                self.advance();
                let value = if matches!(self.current(), Token::Newline | Token::Eof) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Return(value), start))
            }

            Token::Keyword(Keyword::If) => {
                self.advance();
                let cond = self.expression()?;
                let then = self.block()?;

                let mut elifs = Vec::new();
                while self.match_kw(Keyword::Elif) {
                    let cond = self.expression()?;
                    let body = self.block()?;
                    elifs.push((cond, body));
                }

                let otherwise = if self.match_kw(Keyword::Else) {
                    Some(self.block()?)
                } else {
                    None
                };

                Ok(Stmt::new(
                    StmtKind::If {
                        cond,
                        then,
                        elifs,
                        otherwise,
                    },
                    start,
                ))
            }

            Token::Keyword(Keyword::While) => {
                self.advance();
                let cond = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::new(StmtKind::While { cond, body }, start))
            }

            Token::Keyword(Keyword::For) => {
                self.advance();
                let mut vars = vec![self.expect_ident()?.into_inner()];
                while self.match_op(Op::Comma) {
                    vars.push(self.expect_ident()?.into_inner());
                }
                self.expect_kw(Keyword::In)?;
                let iter = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::new(StmtKind::For { vars, iter, body }, start))
            }

            Token::Keyword(Keyword::Break) => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Break, start))
            }

            Token::Keyword(Keyword::Continue) => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Continue, start))
            }

            Token::Keyword(Keyword::Pass) => {
                self.advance();
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Pass, start))
            }

            Token::Keyword(Keyword::Global) => {
                self.advance();
                let mut names = vec![self.expect_ident()?.into_inner()];
                while self.match_op(Op::Comma) {
                    names.push(self.expect_ident()?.into_inner());
                }
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Global(names), start))
            }

            Token::Keyword(Keyword::Defer) => {
                self.advance();
                let stmt = self.statement()?;
                Ok(Stmt::new(StmtKind::Defer(Box::new(stmt)), start))
            }

            Token::Keyword(Keyword::Assert) => {
                self.advance();
                let cond = self.expression()?;
                let message = if self.match_op(Op::Comma) {
                    Some(self.expression()?)
                } else {
                    None
                };
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Assert { cond, message }, start))
            }

            Token::Keyword(Keyword::Raise) => {
                self.advance();
                let exc = if matches!(self.current(), Token::Newline | Token::Eof) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Raise(exc), start))
            }

            Token::Keyword(Keyword::Yield) => {
                self.advance();
                let value = if matches!(self.current(), Token::Newline | Token::Eof) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Yield(value), start))
            }

            Token::Keyword(Keyword::Match) => self.match_statement(start),

            Token::Keyword(Keyword::Try) => self.try_statement(start),

            Token::Keyword(Keyword::With) => self.with_statement(start),

            Token::Keyword(Keyword::Asm) => {
                self.advance();
                self.expect_op(Op::LParen)?;
                let text = match self.current().clone() {
                    Token::Str(text) => {
                        self.advance();
                        text
                    }
                    _ => return Err(self.unexpected("a string literal")),
                };
                self.expect_op(Op::RParen)?;
                self.expect_newline()?;
                Ok(Stmt::new(StmtKind::Asm(text), start))
            }

            Token::Ident(_) => self.ident_statement(start),

            _ => self.expr_statement(start),
        }
    }

    /// Sentencias que comienzan con identificador: declaración con
    /// tipo, asignación simple o compuesta, desempaquetado de tuplas,
    /// o una expresión cualquiera.
    fn ident_statement(&mut self, start: Span) -> Parse<Stmt> {
        // Desempaquetado `a, b = e`
        if matches!(self.peek(1), Token::Op(Op::Comma)) {
            let checkpoint = self.pos;
            if let Some(stmt) = self.try_tuple_assign(start)? {
                return Ok(stmt);
            }
            self.pos = checkpoint;
        }

        // Declaración tipada `x: T [= e]`
        if matches!(self.peek(1), Token::Op(Op::Colon)) {
            let name = self.expect_ident()?.into_inner();
            self.expect_op(Op::Colon)?;
            let ty = self.type_annotation()?;
            let value = if self.match_op(Op::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect_newline()?;
            return Ok(Stmt::new(
                StmtKind::VarDecl {
                    name,
                    ty,
                    value,
                    slot: None,
                },
                start,
            ));
        }

        self.expr_statement(start)
    }

    fn try_tuple_assign(&mut self, start: Span) -> Parse<Option<Stmt>> {
        let mut targets = vec![self.expect_ident()?.into_inner()];

        while self.match_op(Op::Comma) {
            match self.current() {
                Token::Ident(_) => targets.push(self.expect_ident()?.into_inner()),
                _ => return Ok(None),
            }
        }

        if !self.match_op(Op::Assign) {
            return Ok(None);
        }

        let first = self.expression()?;
        let value = if self.match_op(Op::Comma) {
            let mut elements = vec![first];
            elements.push(self.expression()?);
            while self.match_op(Op::Comma) {
                elements.push(self.expression()?);
            }
            let span = start.to(self.prev_span());
            Expr::new(ExprKind::TupleLit(elements), span)
        } else {
            first
        };

        self.expect_newline()?;
        Ok(Some(Stmt::new(
            StmtKind::TupleAssign {
                targets,
                value,
                slots: Vec::new(),
            },
            start,
        )))
    }

    fn expr_statement(&mut self, start: Span) -> Parse<Stmt> {
        let expr = self.expression()?;

        if self.match_op(Op::Assign) {
            let value = self.expression()?;
            self.expect_newline()?;
            return Ok(Stmt::new(
                StmtKind::Assign {
                    target: expr,
                    value,
                },
                start,
            ));
        }

        if let Some(op) = compound_op(self.current()) {
            self.advance();
            let value = self.expression()?;
            self.expect_newline()?;
            return Ok(Stmt::new(
                StmtKind::AugAssign {
                    target: expr,
                    op,
                    value,
                },
                start,
            ));
        }

        self.expect_newline()?;
        Ok(Stmt::new(StmtKind::Expr(expr), start))
    }

    fn match_statement(&mut self, start: Span) -> Parse<Stmt> {
        self.advance(); // `match`
        let scrutinee = self.expression()?;
        self.expect_op(Op::Colon)?;
        self.expect_newline()?;
        self.skip_newlines();

        match self.current() {
            Token::Indent => {
                self.advance();
            }
            _ => return Err(self.unexpected("an indented block")),
        }

        let mut arms = Vec::new();
        loop {
            self.skip_newlines();
            if !self.match_kw(Keyword::Case) {
                break;
            }
            let pattern = self.pattern()?;
            let body = self.block()?;
            arms.push((pattern, body));
        }

        match self.current() {
            Token::Dedent => {
                self.advance();
            }
            Token::Eof => (),
            _ => return Err(self.unexpected("`case` or dedent")),
        }

        Ok(Stmt::new(StmtKind::Match { scrutinee, arms }, start))
    }

    fn pattern(&mut self) -> Parse<Pattern> {
        match self.current().clone() {
            Token::Ident(name) if name == "_" => {
                self.advance();
                Ok(Pattern::Wildcard)
            }
            Token::Ident(name) => {
                self.advance();
                Ok(Pattern::Binding(name))
            }
            Token::Int(value) => {
                self.advance();
                Ok(Pattern::Int(value))
            }
            Token::Op(Op::Minus) => {
                self.advance();
                match self.current().clone() {
                    Token::Int(value) => {
                        self.advance();
                        Ok(Pattern::Int(-value))
                    }
                    other => Err(Located::at(
                        ParseError::BadPattern(other.to_string()),
                        self.span(),
                    )),
                }
            }
            Token::Char(value) => {
                self.advance();
                Ok(Pattern::Char(value))
            }
            Token::Str(value) => {
                self.advance();
                Ok(Pattern::Str(value))
            }
            Token::Keyword(Keyword::True) => {
                self.advance();
                Ok(Pattern::Bool(true))
            }
            Token::Keyword(Keyword::False) => {
                self.advance();
                Ok(Pattern::Bool(false))
            }
            other => Err(Located::at(
                ParseError::BadPattern(other.to_string()),
                self.span(),
            )),
        }
    }

    fn try_statement(&mut self, start: Span) -> Parse<Stmt> {
        self.advance(); // `try`
        let body = self.block()?;

        let mut handlers = Vec::new();
        while self.check_kw(Keyword::Except) {
            let handler_span = self.span();
            self.advance();

            let mut exception = None;
            let mut as_name = None;
            if !self.check_op(Op::Colon) {
                exception = Some(self.expect_ident()?.into_inner());
                if self.match_kw(Keyword::As) {
                    as_name = Some(self.expect_ident()?.into_inner());
                }
            }

            let handler_body = self.block()?;
            handlers.push(Handler {
                exception,
                as_name,
                body: handler_body,
                span: handler_span,
            });
        }

        let otherwise = if self.match_kw(Keyword::Else) {
            self.block()?
        } else {
            Vec::new()
        };

        let finally = if self.match_kw(Keyword::Finally) {
            self.block()?
        } else {
            Vec::new()
        };

        Ok(Stmt::new(
            StmtKind::Try {
                body,
                handlers,
                otherwise,
                finally,
            },
            start,
        ))
    }

    fn with_statement(&mut self, start: Span) -> Parse<Stmt> {
        self.advance(); // `with`

        let mut items = Vec::new();
        loop {
            let context = self.expression()?;
            let as_name = if self.match_kw(Keyword::As) {
                Some(self.expect_ident()?.into_inner())
            } else {
                None
            };
            items.push((context, as_name));

            if !self.match_op(Op::Comma) {
                break;
            }
        }

        // Varios contextos anidan de adentro hacia afuera
        let mut inner = self.block()?;
        for (context, as_name) in items.into_iter().rev() {
            let stmt = Stmt::new(
                StmtKind::With {
                    context,
                    as_name,
                    slot: None,
                    body: inner,
                },
                start,
            );
            inner = vec![stmt];
        }

        Ok(inner.pop().expect("with statement without items"))
    }

    // ---------------------------------------------------------------
    // Declaraciones
    // ---------------------------------------------------------------

    fn program(&mut self) -> Parse<Program> {
        let mut decls = Vec::new();
        self.skip_newlines();

        while !self.at_end() {
            let mut decorators = Vec::new();
            while self.match_op(Op::At) {
                let name = self.expect_ident()?;
                decorators.push(name);
                self.expect_newline()?;
                self.skip_newlines();
            }

            match self.current() {
                Token::Keyword(Keyword::From) | Token::Keyword(Keyword::Import) => {
                    decls.push(Decl::Import(self.import_decl()?));
                }

                Token::Keyword(Keyword::Extern) => {
                    decls.push(Decl::Extern(self.extern_decl()?));
                }

                Token::Keyword(Keyword::Def) => {
                    decls.push(Decl::Function(self.function(decorators)?));
                }

                Token::Keyword(Keyword::Class) => {
                    decls.push(Decl::Class(self.class(decorators)?));
                }

                Token::Keyword(Keyword::Struct) => {
                    decls.push(Decl::Struct(self.struct_decl(decorators)?));
                }

                Token::Keyword(Keyword::Union) => {
                    decls.push(Decl::Union(self.union_decl(decorators)?));
                }

                Token::Ident(_) if matches!(self.peek(1), Token::Op(Op::Colon)) => {
                    let span = self.span();
                    let name = self.expect_ident()?.into_inner();
                    self.expect_op(Op::Colon)?;
                    let ty = self.type_annotation()?;
                    let init = if self.match_op(Op::Assign) {
                        Some(self.expression()?)
                    } else {
                        None
                    };
                    self.expect_newline()?;
                    decls.push(Decl::Global(GlobalVar {
                        name,
                        ty,
                        init,
                        span,
                    }));
                }

                _ => return Err(self.unexpected("a top-level declaration")),
            }

            self.skip_newlines();
        }

        Ok(Program { decls })
    }

    fn parameter(&mut self) -> Parse<Param> {
        let span = self.span();
        let name = self.expect_ident()?.into_inner();
        self.expect_op(Op::Colon)?;
        let ty = self.type_annotation()?;
        let default = if self.match_op(Op::Assign) {
            Some(self.expression()?)
        } else {
            None
        };

        Ok(Param {
            name,
            ty,
            default,
            span,
        })
    }

    fn function(&mut self, decorators: Vec<Located<String>>) -> Parse<FunctionDef> {
        let span = self.span();
        self.expect_kw(Keyword::Def)?;
        let name = self.expect_ident()?.into_inner();

        self.expect_op(Op::LParen)?;
        let mut params = Vec::new();
        if !self.check_op(Op::RParen) {
            loop {
                // `self` no lleva anotación; el verificador lo repone
                // al aplanar los métodos de una clase
                if matches!(self.current(), Token::Ident(name) if name == "self")
                    && matches!(self.peek(1), Token::Op(Op::Comma) | Token::Op(Op::RParen))
                {
                    self.advance();
                } else {
                    params.push(self.parameter()?);
                }

                if !self.match_op(Op::Comma) {
                    break;
                }
            }
        }
        self.expect_op(Op::RParen)?;

        let ret = if self.match_op(Op::Arrow) {
            self.type_annotation()?
        } else {
            Type::Void
        };

        let body = self.block()?;

        Ok(FunctionDef {
            name,
            params,
            ret,
            body,
            decorators,
            span,
            interrupt: false,
            frame: Vec::new(),
        })
    }

    fn class(&mut self, decorators: Vec<Located<String>>) -> Parse<ClassDef> {
        let span = self.span();
        self.expect_kw(Keyword::Class)?;
        let name = self.expect_ident()?.into_inner();

        let mut bases = Vec::new();
        if self.match_op(Op::LParen) {
            if !self.check_op(Op::RParen) {
                bases.push(self.expect_ident()?.into_inner());
                while self.match_op(Op::Comma) {
                    bases.push(self.expect_ident()?.into_inner());
                }
            }
            self.expect_op(Op::RParen)?;
        }

        self.expect_op(Op::Colon)?;
        self.expect_newline()?;
        self.skip_newlines();

        match self.current() {
            Token::Indent => {
                self.advance();
            }
            _ => return Err(self.unexpected("an indented block")),
        }

        let mut fields = Vec::new();
        let mut methods = Vec::new();

        loop {
            self.skip_newlines();
            if matches!(self.current(), Token::Dedent | Token::Eof) {
                break;
            }

            if self.match_kw(Keyword::Pass) {
                self.expect_newline()?;
                continue;
            }

            let mut method_decorators = Vec::new();
            while self.match_op(Op::At) {
                method_decorators.push(self.expect_ident()?);
                self.expect_newline()?;
                self.skip_newlines();
            }

            if self.check_kw(Keyword::Def) {
                methods.push(self.function(method_decorators)?);
                continue;
            }

            if !method_decorators.is_empty() {
                return Err(self.unexpected("a method after decorator"));
            }

            let field_name = self.expect_ident()?.into_inner();
            self.expect_op(Op::Colon)?;
            let field_type = self.type_annotation()?;
            let default = if self.match_op(Op::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect_newline()?;
            fields.push((field_name, field_type, default));
        }

        match self.current() {
            Token::Dedent => {
                self.advance();
            }
            Token::Eof => (),
            _ => return Err(self.unexpected("dedent")),
        }

        Ok(ClassDef {
            name,
            bases,
            fields,
            methods,
            decorators,
            span,
        })
    }

    fn struct_decl(&mut self, decorators: Vec<Located<String>>) -> Parse<StructDef> {
        let span = self.span();
        self.expect_kw(Keyword::Struct)?;
        let name = self.expect_ident()?.into_inner();
        let fields = self.field_block()?;

        Ok(StructDef {
            name,
            fields,
            packed: false,
            decorators,
            span,
        })
    }

    fn union_decl(&mut self, decorators: Vec<Located<String>>) -> Parse<UnionDef> {
        let span = self.span();
        self.expect_kw(Keyword::Union)?;
        let name = self.expect_ident()?.into_inner();
        let fields = self.field_block()?;

        Ok(UnionDef {
            name,
            fields,
            decorators,
            span,
        })
    }

    fn field_block(&mut self) -> Parse<Vec<(String, Type)>> {
        self.expect_op(Op::Colon)?;
        self.expect_newline()?;
        self.skip_newlines();

        match self.current() {
            Token::Indent => {
                self.advance();
            }
            _ => return Err(self.unexpected("an indented block")),
        }

        let mut fields = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.current(), Token::Dedent | Token::Eof) {
                break;
            }

            if self.match_kw(Keyword::Pass) {
                self.expect_newline()?;
                continue;
            }

            let name = self.expect_ident()?.into_inner();
            self.expect_op(Op::Colon)?;
            let ty = self.type_annotation()?;
            self.expect_newline()?;
            fields.push((name, ty));
        }

        match self.current() {
            Token::Dedent => {
                self.advance();
            }
            Token::Eof => (),
            _ => return Err(self.unexpected("dedent")),
        }

        Ok(fields)
    }

    fn extern_decl(&mut self) -> Parse<ExternDef> {
        let span = self.span();
        self.expect_kw(Keyword::Extern)?;
        self.expect_kw(Keyword::Def)?;
        let name = self.expect_ident()?.into_inner();

        self.expect_op(Op::LParen)?;
        let mut params = Vec::new();
        if !self.check_op(Op::RParen) {
            params.push(self.parameter()?);
            while self.match_op(Op::Comma) {
                params.push(self.parameter()?);
            }
        }
        self.expect_op(Op::RParen)?;

        let ret = if self.match_op(Op::Arrow) {
            self.type_annotation()?
        } else {
            Type::Void
        };

        self.expect_newline()?;
        Ok(ExternDef {
            name,
            params,
            ret,
            span,
        })
    }

    fn import_decl(&mut self) -> Parse<ImportDecl> {
        let span = self.span();

        if self.match_kw(Keyword::From) {
            let mut parts = vec![self.expect_ident()?.into_inner()];
            while self.match_op(Op::Dot) {
                parts.push(self.expect_ident()?.into_inner());
            }
            let module = parts.join(".");

            self.expect_kw(Keyword::Import)?;

            if self.match_op(Op::Star) {
                self.expect_newline()?;
                return Ok(ImportDecl {
                    module,
                    names: Vec::new(),
                    alias: None,
                    star: true,
                    span,
                });
            }

            let mut names = vec![self.expect_ident()?.into_inner()];
            while self.match_op(Op::Comma) {
                names.push(self.expect_ident()?.into_inner());
            }
            self.expect_newline()?;

            return Ok(ImportDecl {
                module,
                names,
                alias: None,
                star: false,
                span,
            });
        }

        self.expect_kw(Keyword::Import)?;
        let mut parts = vec![self.expect_ident()?.into_inner()];
        while self.match_op(Op::Dot) {
            parts.push(self.expect_ident()?.into_inner());
        }
        let module = parts.join(".");

        let alias = if self.match_kw(Keyword::As) {
            Some(self.expect_ident()?.into_inner())
        } else {
            None
        };

        self.expect_newline()?;
        Ok(ImportDecl {
            module,
            names: Vec::new(),
            alias,
            star: false,
            span,
        })
    }
}

/// Mapa de nombres de tipos primitivos; `int` y `float` son alias.
fn primitive_type(name: &str) -> Option<Type> {
    let ty = match name {
        "int8" => Type::Int8,
        "int16" => Type::Int16,
        "int32" | "int" => Type::Int32,
        "int64" => Type::Int64,
        "uint8" => Type::Uint8,
        "uint16" => Type::Uint16,
        "uint32" => Type::Uint32,
        "uint64" => Type::Uint64,
        "float32" | "float" => Type::Float32,
        "float64" => Type::Float64,
        "bool" => Type::Bool,
        "char" => Type::Char,
        "str" => Type::Str,
        "void" => Type::Void,
        _ => return None,
    };

    Some(ty)
}

fn compound_op(token: &Token) -> Option<BinOp> {
    let op = match token {
        Token::Op(Op::PlusAssign) => BinOp::Add,
        Token::Op(Op::MinusAssign) => BinOp::Sub,
        Token::Op(Op::StarAssign) => BinOp::Mul,
        Token::Op(Op::SlashAssign) => BinOp::Div,
        Token::Op(Op::PercentAssign) => BinOp::Mod,
        Token::Op(Op::AmpAssign) => BinOp::BitAnd,
        Token::Op(Op::PipeAssign) => BinOp::BitOr,
        Token::Op(Op::CaretAssign) => BinOp::BitXor,
        Token::Op(Op::ShlAssign) => BinOp::Shl,
        Token::Op(Op::ShrAssign) => BinOp::Shr,
        _ => return None,
    };

    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_source(source: &str) -> Program {
        let tokens = lex::tokenize(source).expect("lexing failed");
        parse(tokens).expect("parsing failed")
    }

    fn parse_error(source: &str) -> ParseError {
        let tokens = lex::tokenize(source).expect("lexing failed");
        parse(tokens).expect_err("parsing should fail").into_inner()
    }

    fn only_function(program: &Program) -> &FunctionDef {
        match &program.decls[0] {
            Decl::Function(function) => function,
            other => panic!("expected a function, got {:?}", other),
        }
    }

    #[test]
    fn function_signature() {
        let program = parse_source("def add(a: int32, b: int32) -> int32:\n    return a + b\n");
        let function = only_function(&program);
        assert_eq!(function.name, "add");
        assert_eq!(function.params.len(), 2);
        assert_eq!(function.params[1].ty, Type::Int32);
        assert_eq!(function.ret, Type::Int32);
        assert!(matches!(function.body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn missing_annotation_is_rejected() {
        let error = parse_error("def f(a):\n    pass\n");
        assert!(matches!(error, ParseError::Unexpected { .. }));
    }

    #[test]
    fn precedence_shapes_the_tree() {
        let program = parse_source("def f() -> int32:\n    return 1 + 2 * 3\n");
        let function = only_function(&program);
        let StmtKind::Return(Some(expr)) = &function.body[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn parse_is_deterministic() {
        let source = "def f(x: int32) -> int32:\n    if x > 0:\n        return x\n    return 0 - x\n";
        let first = format!("{:?}", parse_source(source));
        let second = format!("{:?}", parse_source(source));
        assert_eq!(first, second);
    }

    #[test]
    fn type_syntax() {
        let program = parse_source(
            "def f(p: Ptr[char], a: Array[8, int16], g: Fn[int32, int32], o: Optional[Ptr[int32]]) -> void:\n    pass\n",
        );
        let function = only_function(&program);
        assert_eq!(function.params[0].ty, Type::Ptr(Box::new(Type::Char)));
        assert_eq!(
            function.params[1].ty,
            Type::Array(8, Box::new(Type::Int16))
        );
        assert_eq!(
            function.params[2].ty,
            Type::Fn {
                ret: Box::new(Type::Int32),
                params: vec![Type::Int32],
            }
        );
    }

    #[test]
    fn slice_forms() {
        let program = parse_source("def f(s: str) -> void:\n    x = s[1:4:1]\n    y = s[:2]\n    z = s[3:]\n");
        let function = only_function(&program);
        let StmtKind::Assign { value, .. } = &function.body[0].kind else {
            panic!("expected assignment");
        };
        assert!(matches!(
            &value.kind,
            ExprKind::Slice { start: Some(_), stop: Some(_), step: Some(_), .. }
        ));
    }

    #[test]
    fn struct_literal_requires_named_fields() {
        let error = parse_error("def f() -> void:\n    p = Point{1, 2}\n");
        assert!(matches!(error, ParseError::PositionalStructField));
    }

    #[test]
    fn fstring_fragments() {
        let program = parse_source("def f(x: int32) -> void:\n    print(f\"x vale {x + 1}!\")\n");
        let function = only_function(&program);
        let StmtKind::Expr(expr) = &function.body[0].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected call");
        };
        let ExprKind::FString(parts) = &args[0].kind else {
            panic!("expected f-string");
        };
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], FsPart::Lit(text) if text == "x vale "));
        assert!(matches!(&parts[1], FsPart::Expr(_)));
        assert!(matches!(&parts[2], FsPart::Lit(text) if text == "!"));
    }

    #[test]
    fn match_reduces_to_patterns() {
        let program = parse_source(
            "def f(x: int32) -> void:\n    match x:\n        case 1:\n            pass\n        case other:\n            pass\n        case _:\n            pass\n",
        );
        let function = only_function(&program);
        let StmtKind::Match { arms, .. } = &function.body[0].kind else {
            panic!("expected match");
        };
        assert!(matches!(arms[0].0, Pattern::Int(1)));
        assert!(matches!(&arms[1].0, Pattern::Binding(name) if name == "other"));
        assert!(matches!(arms[2].0, Pattern::Wildcard));
    }

    #[test]
    fn decorated_struct() {
        let program = parse_source("@packed\nstruct Reg:\n    ctrl: uint8\n    data: uint16\n");
        match &program.decls[0] {
            Decl::Struct(def) => {
                assert_eq!(def.fields.len(), 2);
                assert_eq!(def.decorators[0].val(), "packed");
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn imports() {
        let program = parse_source("from lib.io import print_str, print_int\nimport kernel.sched as sched\n");
        match &program.decls[0] {
            Decl::Import(import) => {
                assert_eq!(import.module, "lib.io");
                assert_eq!(import.names, vec!["print_str", "print_int"]);
            }
            other => panic!("expected import, got {:?}", other),
        }
        match &program.decls[1] {
            Decl::Import(import) => {
                assert_eq!(import.module, "kernel.sched");
                assert_eq!(import.alias.as_deref(), Some("sched"));
            }
            other => panic!("expected import, got {:?}", other),
        }
    }

    #[test]
    fn empty_source_is_empty_program() {
        assert!(parse_source("").decls.is_empty());
        assert!(parse_source("# solo comentarios\n\n").decls.is_empty());
    }
}
