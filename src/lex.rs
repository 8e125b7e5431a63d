//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone el texto fuente en
//! unidades léxicas denominadas tokens. Los espacios en blanco y los
//! comentarios se descartan durante esta operación. Cada token emitido
//! está asociado a una ubicación en el código fuente original, lo cual
//! permite rastrear errores tanto en los mismos como en constructos
//! más elevados de fases posteriores.
//!
//! # Layout
//! El lenguaje delimita bloques por indentación significativa, al estilo
//! de Python. Esa regla vive únicamente aquí: la columna del primer
//! carácter no blanco de cada línea lógica define un nivel; subir de
//! nivel emite un token sintético [`Token::Indent`] y bajar emite un
//! [`Token::Dedent`] por cada nivel cerrado. Las fases posteriores ven
//! esos tokens como si fueran llaves explícitas. Dentro de paréntesis,
//! corchetes o llaves balanceados los saltos de línea y la indentación
//! se suprimen por completo.
//!
//! # Contenido de un token
//! Operadores, puntuación y palabras clave se identifican por el hecho
//! de lo que son y no incluyen lexemas. Los identificadores sí incluyen
//! su lexema original. Las constantes literales se resuelven a sus
//! valores: los enteros ya vienen decodificados de su radix y las
//! cadenas ya tienen sus secuencias de escape procesadas. Los nombres
//! de tipos (`int32`, `Ptr`, …) no son palabras clave; se emiten como
//! identificadores y se resuelven después.

use crate::source::{Located, Position, Span};
use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// Ancho de un tabulador en columnas de indentación.
const TAB_WIDTH: u32 = 8;

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexError {
    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("bad character {0:?} in input stream")]
    BadChar(char),

    /// Literal de cadena o carácter sin terminar.
    #[error("unterminated {0} literal")]
    Unterminated(&'static str),

    /// Secuencia de escape inválida dentro de un literal.
    #[error("invalid escape sequence `\\{0}`")]
    BadEscape(char),

    /// Escape hexadecimal `\xNN` malformado.
    #[error("invalid hex escape `\\x{0}`")]
    BadHexEscape(String),

    /// Una constante entera se encuentra fuera de rango.
    #[error("integer literal overflow")]
    IntOverflow,

    /// Constante numérica con dígitos inválidos para su radix.
    #[error("invalid digits in {0} literal")]
    BadRadix(&'static str),

    /// La línea mezcla tabuladores y espacios en su indentación.
    #[error("inconsistent use of tabs and spaces in indentation")]
    MixedIndent,

    /// Un nivel de indentación no corresponde a ningún nivel abierto.
    #[error("unindent does not match any outer indentation level")]
    BadDedent,

    /// `!` suelto; el lenguaje usa `not`.
    #[error("unexpected `!` (use `not` for negation, `!=` for inequality)")]
    LoneBang,
}

/// Objeto resultante del análisis léxico.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Identificador o nombre de tipo.
    Ident(String),

    /// Literal entero, ya decodificado de su radix.
    Int(i64),

    /// Literal de punto flotante.
    Float(f64),

    /// Literal de cadena con escapes ya procesados.
    Str(String),

    /// Cuerpo crudo de una f-string; los fragmentos `{…}` se
    /// interpretan en el parser.
    FString(String),

    /// Literal de carácter.
    Char(char),

    /// Palabra clave.
    Keyword(Keyword),

    /// Operador o puntuación.
    Op(Op),

    /// Fin de línea lógica.
    Newline,

    /// Apertura sintética de bloque.
    Indent,

    /// Cierre sintético de bloque.
    Dedent,

    /// Fin del flujo de entrada.
    Eof,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(fmt, "identifier `{}`", name),
            Token::Int(value) => write!(fmt, "literal `{}`", value),
            Token::Float(value) => write!(fmt, "literal `{}`", value),
            Token::Str(_) => fmt.write_str("string literal"),
            Token::FString(_) => fmt.write_str("f-string literal"),
            Token::Char(c) => write!(fmt, "character literal `{:?}`", c),
            Token::Keyword(keyword) => write!(fmt, "keyword `{}`", keyword),
            Token::Op(op) => write!(fmt, "`{}`", op),
            Token::Newline => fmt.write_str("end of line"),
            Token::Indent => fmt.write_str("indent"),
            Token::Dedent => fmt.write_str("dedent"),
            Token::Eof => fmt.write_str("end of file"),
        }
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Def,
    Return,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Break,
    Continue,
    True,
    False,
    None,
    Class,
    Struct,
    Union,
    Pass,
    Global,
    Import,
    From,
    As,
    Lambda,
    And,
    Or,
    Not,
    Is,
    Try,
    Except,
    Finally,
    Raise,
    With,
    Match,
    Case,
    Asm,
    Extern,
    Volatile,
    Assert,
    Defer,
    Yield,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("def", Keyword::Def),
    ("return", Keyword::Return),
    ("if", Keyword::If),
    ("elif", Keyword::Elif),
    ("else", Keyword::Else),
    ("while", Keyword::While),
    ("for", Keyword::For),
    ("in", Keyword::In),
    ("break", Keyword::Break),
    ("continue", Keyword::Continue),
    ("True", Keyword::True),
    ("False", Keyword::False),
    ("None", Keyword::None),
    ("class", Keyword::Class),
    ("struct", Keyword::Struct),
    ("union", Keyword::Union),
    ("pass", Keyword::Pass),
    ("global", Keyword::Global),
    ("import", Keyword::Import),
    ("from", Keyword::From),
    ("as", Keyword::As),
    ("lambda", Keyword::Lambda),
    ("and", Keyword::And),
    ("or", Keyword::Or),
    ("not", Keyword::Not),
    ("is", Keyword::Is),
    ("try", Keyword::Try),
    ("except", Keyword::Except),
    ("finally", Keyword::Finally),
    ("raise", Keyword::Raise),
    ("with", Keyword::With),
    ("match", Keyword::Match),
    ("case", Keyword::Case),
    ("asm", Keyword::Asm),
    ("extern", Keyword::Extern),
    ("volatile", Keyword::Volatile),
    ("assert", Keyword::Assert),
    ("defer", Keyword::Defer),
    ("yield", Keyword::Yield),
];

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, _) = KEYWORDS
            .iter()
            .find(|&&(_, keyword)| keyword == *self)
            .expect("keyword missing from table");

        fmt.write_str(name)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        KEYWORDS
            .iter()
            .find(|&&(name, _)| name == string)
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Un operador o signo de puntuación.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    StarStar,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Arrow,
    Colon,
    Comma,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    At,
}

impl Display for Op {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Op::Plus => "+",
            Op::Minus => "-",
            Op::Star => "*",
            Op::Slash => "/",
            Op::SlashSlash => "//",
            Op::Percent => "%",
            Op::StarStar => "**",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Assign => "=",
            Op::PlusAssign => "+=",
            Op::MinusAssign => "-=",
            Op::StarAssign => "*=",
            Op::SlashAssign => "/=",
            Op::PercentAssign => "%=",
            Op::AmpAssign => "&=",
            Op::PipeAssign => "|=",
            Op::CaretAssign => "^=",
            Op::ShlAssign => "<<=",
            Op::ShrAssign => ">>=",
            Op::Amp => "&",
            Op::Pipe => "|",
            Op::Caret => "^",
            Op::Tilde => "~",
            Op::Shl => "<<",
            Op::Shr => ">>",
            Op::Arrow => "->",
            Op::Colon => ":",
            Op::Comma => ",",
            Op::Dot => ".",
            Op::LParen => "(",
            Op::RParen => ")",
            Op::LBracket => "[",
            Op::RBracket => "]",
            Op::LBrace => "{",
            Op::RBrace => "}",
            Op::At => "@",
        };

        fmt.write_str(symbol)
    }
}

/// Reduce un texto fuente completo a su secuencia de tokens, terminada
/// en [`Token::Eof`]. Los `INDENT`/`DEDENT` emitidos quedan balanceados
/// incluso si el archivo termina dentro de un bloque.
pub fn tokenize(source: &str) -> Result<Vec<Located<Token>>, Located<LexError>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    here: Position,
    tokens: Vec<Located<Token>>,
    indent_stack: Vec<u32>,
    brackets: u32,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Lexer {
            chars: source.chars().collect(),
            pos: 0,
            here: Position::default(),
            tokens: Vec::new(),
            indent_stack: vec![0],
            brackets: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.current()?;
        self.pos += 1;
        self.here = match c {
            '\n' => self.here.newline(),
            _ => self.here.advance(),
        };

        Some(c)
    }

    fn push(&mut self, token: Token, start: Position) {
        let span = Span::new(start, self.here);
        self.tokens.push(Located::at(token, span));
    }

    fn fail<T>(&self, error: LexError, at: Position) -> Result<T, Located<LexError>> {
        Err(Located::at(error, Span::point(at)))
    }

    fn run(mut self) -> Result<Vec<Located<Token>>, Located<LexError>> {
        let mut at_line_start = true;

        while let Some(c) = self.current() {
            let start = self.here;

            // La indentación solo se evalúa al inicio de una línea
            // lógica y nunca dentro de delimitadores balanceados
            if at_line_start && self.brackets == 0 && !matches!(c, '\n' | '\r') {
                self.layout(start)?;
                at_line_start = false;
                continue;
            }

            match c {
                ' ' | '\t' => {
                    self.advance();
                }

                '#' => {
                    while !matches!(self.current(), Some('\n') | None) {
                        self.advance();
                    }
                }

                '\n' => {
                    self.advance();
                    if self.brackets == 0 {
                        self.push(Token::Newline, start);
                        at_line_start = true;
                    }
                }

                '\r' => {
                    // CRLF se normaliza a una sola línea lógica
                    self.advance();
                    if self.current() == Some('\n') {
                        self.advance();
                    }
                    if self.brackets == 0 {
                        self.push(Token::Newline, start);
                        at_line_start = true;
                    }
                }

                '\\' if self.peek(1) == Some('\n') => {
                    // Continuación explícita de línea
                    self.advance();
                    self.advance();
                }

                '\'' if self.looks_like_char() => {
                    let c = self.char_literal(start)?;
                    self.push(Token::Char(c), start);
                }

                '"' | '\'' => {
                    let value = self.string_literal(c, start)?;
                    self.push(Token::Str(value), start);
                }

                'f' if matches!(self.peek(1), Some('"') | Some('\'')) => {
                    self.advance();
                    let quote = self.current().unwrap();
                    let value = self.fstring_literal(quote, start)?;
                    self.push(Token::FString(value), start);
                }

                'r' | 'b' if matches!(self.peek(1), Some('"') | Some('\'')) => {
                    self.advance();
                    let quote = self.current().unwrap();
                    let value = self.string_literal(quote, start)?;
                    self.push(Token::Str(value), start);
                }

                _ if c.is_ascii_digit() => {
                    let token = self.number(start)?;
                    self.push(token, start);
                }

                _ if c.is_alphabetic() || c == '_' => {
                    let word = self.word();
                    let token = match Keyword::from_str(&word) {
                        Ok(keyword) => Token::Keyword(keyword),
                        Err(()) => Token::Ident(word),
                    };
                    self.push(token, start);
                }

                _ => {
                    let op = self.operator(c, start)?;
                    self.push(Token::Op(op), start);
                }
            }
        }

        // Al agotar la entrada toda línea abierta se cierra y los
        // niveles de indentación pendientes se balancean
        if !matches!(
            self.tokens.last().map(Located::as_ref),
            Some(Token::Newline) | None
        ) {
            let at = self.here;
            self.push(Token::Newline, at);
        }

        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            let at = self.here;
            self.push(Token::Dedent, at);
        }

        let at = self.here;
        self.push(Token::Eof, at);
        Ok(self.tokens)
    }

    /// Mide la indentación de la línea actual y emite los tokens
    /// sintéticos que correspondan. Las líneas en blanco y las que
    /// solo contienen un comentario no afectan la indentación.
    fn layout(&mut self, start: Position) -> Result<(), Located<LexError>> {
        let mut level = 0;
        let mut saw_space = false;
        let mut saw_tab = false;

        while let Some(c) = self.current() {
            match c {
                ' ' => {
                    saw_space = true;
                    level += 1;
                }
                '\t' => {
                    saw_tab = true;
                    level = (level / TAB_WIDTH + 1) * TAB_WIDTH;
                }
                _ => break,
            }
            self.advance();
        }

        if saw_space && saw_tab {
            return self.fail(LexError::MixedIndent, start);
        }

        if matches!(self.current(), Some('\n') | Some('\r') | Some('#') | None) {
            return Ok(());
        }

        let current = *self.indent_stack.last().unwrap();
        if level > current {
            self.indent_stack.push(level);
            self.push(Token::Indent, start);
        } else if level < current {
            while *self.indent_stack.last().unwrap() > level {
                self.indent_stack.pop();
                self.push(Token::Dedent, start);
            }

            if *self.indent_stack.last().unwrap() != level {
                return self.fail(LexError::BadDedent, start);
            }
        }

        Ok(())
    }

    /// Distingue `'x'` (carácter) de `'...'` (cadena con comillas
    /// simples) con una mirada hacia adelante.
    fn looks_like_char(&self) -> bool {
        match self.peek(1) {
            Some('\\') => self.peek(3) == Some('\''),
            Some(c) if c != '\'' && c != '"' && c != '\n' => self.peek(2) == Some('\''),
            _ => false,
        }
    }

    fn char_literal(&mut self, start: Position) -> Result<char, Located<LexError>> {
        self.advance(); // comilla inicial

        let c = match self.advance() {
            Some('\\') => self.escape('\'', start)?,
            Some(c) => c,
            None => return self.fail(LexError::Unterminated("character"), start),
        };

        match self.advance() {
            Some('\'') => Ok(c),
            _ => self.fail(LexError::Unterminated("character"), start),
        }
    }

    fn string_literal(&mut self, quote: char, start: Position) -> Result<String, Located<LexError>> {
        // Las cadenas con triple comilla admiten saltos de línea y no
        // procesan escapes; se usan sobre todo para bloques `asm`
        if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
            return self.triple_string(quote, start);
        }

        self.advance(); // comilla inicial
        let mut value = String::new();

        loop {
            match self.advance() {
                None | Some('\n') => return self.fail(LexError::Unterminated("string"), start),
                Some(c) if c == quote => break,
                Some('\\') => value.push(self.escape(quote, start)?),
                Some(c) => value.push(c),
            }
        }

        Ok(value)
    }

    fn triple_string(&mut self, quote: char, start: Position) -> Result<String, Located<LexError>> {
        self.advance();
        self.advance();
        self.advance();

        let mut value = String::new();
        loop {
            if self.current() == Some(quote)
                && self.peek(1) == Some(quote)
                && self.peek(2) == Some(quote)
            {
                self.advance();
                self.advance();
                self.advance();
                return Ok(value);
            }

            match self.advance() {
                Some(c) => value.push(c),
                None => return self.fail(LexError::Unterminated("string"), start),
            }
        }
    }

    fn fstring_literal(&mut self, quote: char, start: Position) -> Result<String, Located<LexError>> {
        self.advance(); // comilla inicial
        let mut value = String::new();

        loop {
            match self.advance() {
                None | Some('\n') => return self.fail(LexError::Unterminated("f-string"), start),
                Some(c) if c == quote => break,
                Some('\\') => match self.current() {
                    // Llaves escapadas quedan dobladas para que el
                    // escaneo de fragmentos del parser las preserve
                    Some('{') => {
                        self.advance();
                        value.push_str("{{");
                    }
                    Some('}') => {
                        self.advance();
                        value.push_str("}}");
                    }
                    _ => value.push(self.escape(quote, start)?),
                },
                Some(c) => value.push(c),
            }
        }

        Ok(value)
    }

    fn escape(&mut self, quote: char, start: Position) -> Result<char, Located<LexError>> {
        let c = match self.advance() {
            Some(c) => c,
            None => return self.fail(LexError::Unterminated("string"), start),
        };

        match c {
            'n' => Ok('\n'),
            'r' => Ok('\r'),
            't' => Ok('\t'),
            '0' => Ok('\0'),
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'x' => {
                let mut digits = String::new();
                for _ in 0..2 {
                    match self.advance() {
                        Some(d) => digits.push(d),
                        None => return self.fail(LexError::Unterminated("string"), start),
                    }
                }

                match u8::from_str_radix(&digits, 16) {
                    Ok(byte) => Ok(byte as char),
                    Err(_) => self.fail(LexError::BadHexEscape(digits), self.here),
                }
            }
            c if c == quote => Ok(quote),
            c => self.fail(LexError::BadEscape(c), self.here),
        }
    }

    fn number(&mut self, start: Position) -> Result<Token, Located<LexError>> {
        if self.current() == Some('0') {
            match self.peek(1).map(|c| c.to_ascii_lowercase()) {
                Some('x') => return self.radix_literal(16, "hex", is_hex_digit, start),
                Some('b') => return self.radix_literal(2, "binary", |c| matches!(c, '0' | '1'), start),
                Some('o') => return self.radix_literal(8, "octal", |c| ('0'..='7').contains(&c), start),
                _ => (),
            }
        }

        let mut digits = String::new();
        let mut is_float = false;

        self.digits(&mut digits);

        if self.current() == Some('.') && self.peek(1) != Some('.') {
            is_float = true;
            digits.push('.');
            self.advance();
            self.digits(&mut digits);
        }

        if matches!(self.current(), Some('e') | Some('E')) {
            is_float = true;
            digits.push('e');
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                digits.push(self.advance().unwrap());
            }
            self.digits(&mut digits);
        }

        if is_float {
            match digits.parse::<f64>() {
                Ok(value) => Ok(Token::Float(value)),
                Err(_) => self.fail(LexError::BadRadix("float"), start),
            }
        } else {
            match digits.parse::<u64>() {
                Ok(value) => Ok(Token::Int(value as i64)),
                Err(_) => self.fail(LexError::IntOverflow, start),
            }
        }
    }

    fn radix_literal(
        &mut self,
        radix: u32,
        what: &'static str,
        good: fn(char) -> bool,
        start: Position,
    ) -> Result<Token, Located<LexError>> {
        self.advance(); // '0'
        self.advance(); // marca de radix

        let mut digits = String::new();
        while let Some(c) = self.current() {
            if c == '_' {
                self.advance();
            } else if good(c) {
                digits.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if digits.is_empty() {
            return self.fail(LexError::BadRadix(what), start);
        }

        match u64::from_str_radix(&digits, radix) {
            Ok(value) => Ok(Token::Int(value as i64)),
            Err(_) => self.fail(LexError::IntOverflow, start),
        }
    }

    fn digits(&mut self, into: &mut String) {
        while let Some(c) = self.current() {
            if c == '_' {
                self.advance();
            } else if c.is_ascii_digit() {
                into.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.advance();
            } else {
                break;
            }
        }

        word
    }

    fn operator(&mut self, c: char, start: Position) -> Result<Op, Located<LexError>> {
        self.advance();

        let with_assign = |lexer: &mut Lexer, plain, assigned| {
            if lexer.current() == Some('=') {
                lexer.advance();
                assigned
            } else {
                plain
            }
        };

        let op = match c {
            '+' => with_assign(self, Op::Plus, Op::PlusAssign),
            '-' => {
                if self.current() == Some('>') {
                    self.advance();
                    Op::Arrow
                } else {
                    with_assign(self, Op::Minus, Op::MinusAssign)
                }
            }
            '*' => {
                if self.current() == Some('*') {
                    self.advance();
                    Op::StarStar
                } else {
                    with_assign(self, Op::Star, Op::StarAssign)
                }
            }
            '/' => {
                if self.current() == Some('/') {
                    self.advance();
                    Op::SlashSlash
                } else {
                    with_assign(self, Op::Slash, Op::SlashAssign)
                }
            }
            '%' => with_assign(self, Op::Percent, Op::PercentAssign),
            '=' => with_assign(self, Op::Assign, Op::Eq),
            '!' => {
                if self.current() == Some('=') {
                    self.advance();
                    Op::Ne
                } else {
                    return self.fail(LexError::LoneBang, start);
                }
            }
            '<' => {
                if self.current() == Some('<') {
                    self.advance();
                    with_assign(self, Op::Shl, Op::ShlAssign)
                } else {
                    with_assign(self, Op::Lt, Op::Le)
                }
            }
            '>' => {
                if self.current() == Some('>') {
                    self.advance();
                    with_assign(self, Op::Shr, Op::ShrAssign)
                } else {
                    with_assign(self, Op::Gt, Op::Ge)
                }
            }
            '&' => with_assign(self, Op::Amp, Op::AmpAssign),
            '|' => with_assign(self, Op::Pipe, Op::PipeAssign),
            '^' => with_assign(self, Op::Caret, Op::CaretAssign),
            '~' => Op::Tilde,
            ':' => Op::Colon,
            ',' => Op::Comma,
            '.' => Op::Dot,
            '@' => Op::At,
            '(' => {
                self.brackets += 1;
                Op::LParen
            }
            '[' => {
                self.brackets += 1;
                Op::LBracket
            }
            '{' => {
                self.brackets += 1;
                Op::LBrace
            }
            ')' => {
                self.brackets = self.brackets.saturating_sub(1);
                Op::RParen
            }
            ']' => {
                self.brackets = self.brackets.saturating_sub(1);
                Op::RBracket
            }
            '}' => {
                self.brackets = self.brackets.saturating_sub(1);
                Op::RBrace
            }
            c => return self.fail(LexError::BadChar(c), start),
        };

        Ok(op)
    }
}

fn is_hex_digit(c: char) -> bool {
    c.is_ascii_hexdigit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .expect("lexing failed")
            .into_iter()
            .map(Located::into_inner)
            .collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = kinds("def main():\n    pass\n");
        assert_eq!(
            tokens,
            vec![
                Token::Keyword(Keyword::Def),
                Token::Ident("main".into()),
                Token::Op(Op::LParen),
                Token::Op(Op::RParen),
                Token::Op(Op::Colon),
                Token::Newline,
                Token::Indent,
                Token::Keyword(Keyword::Pass),
                Token::Newline,
                Token::Dedent,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn type_names_are_identifiers() {
        let tokens = kinds("int32\n");
        assert_eq!(tokens[0], Token::Ident("int32".into()));
    }

    #[test]
    fn numeric_radixes() {
        let tokens = kinds("42 0x2A 0b101010 0o52\n");
        let ints: Vec<_> = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Int(v) => Some(*v),
                _ => None,
            })
            .collect();
        assert_eq!(ints, vec![42, 42, 42, 42]);
    }

    #[test]
    fn int32_boundary_literal() {
        // `-2147483648` llega como negación unaria sobre el literal
        let tokens = kinds("-2147483648\n");
        assert_eq!(tokens[0], Token::Op(Op::Minus));
        assert_eq!(tokens[1], Token::Int(2147483648));
    }

    #[test]
    fn string_escapes() {
        let tokens = kinds(r#""a\n\t\\\"\x41\0""#);
        assert_eq!(tokens[0], Token::Str("a\n\t\\\"A\0".into()));
    }

    #[test]
    fn bad_escape_is_rejected() {
        let error = tokenize(r#""\q""#).unwrap_err();
        assert!(matches!(error.val(), LexError::BadEscape('q')));
    }

    #[test]
    fn char_literals() {
        let tokens = kinds("'a' '\\n' '\\0'\n");
        assert_eq!(tokens[0], Token::Char('a'));
        assert_eq!(tokens[1], Token::Char('\n'));
        assert_eq!(tokens[2], Token::Char('\0'));
    }

    #[test]
    fn indent_dedent_balance() {
        let source = "if a:\n    if b:\n        pass\npass\n";
        let tokens = kinds(source);

        let mut depth = 0i32;
        for token in &tokens {
            match token {
                Token::Indent => depth += 1,
                Token::Dedent => {
                    depth -= 1;
                    assert!(depth >= 0, "dedent below zero");
                }
                _ => (),
            }
        }
        assert_eq!(depth, 0);
    }

    #[test]
    fn deep_nesting() {
        let mut source = String::new();
        for level in 0..70 {
            source.push_str(&" ".repeat(level * 2));
            source.push_str("if x:\n");
        }
        source.push_str(&" ".repeat(70 * 2));
        source.push_str("pass\n");

        let tokens = kinds(&source);
        let indents = tokens.iter().filter(|t| **t == Token::Indent).count();
        let dedents = tokens.iter().filter(|t| **t == Token::Dedent).count();
        assert_eq!(indents, 70);
        assert_eq!(dedents, 70);
    }

    #[test]
    fn blank_and_comment_lines_keep_level() {
        let source = "if a:\n    x = 1\n\n    # comentario\n    y = 2\n";
        let tokens = kinds(source);
        let indents = tokens.iter().filter(|t| **t == Token::Indent).count();
        assert_eq!(indents, 1);
    }

    #[test]
    fn brackets_suppress_layout() {
        let source = "f(1,\n   2,\n   3)\n";
        let tokens = kinds(source);
        assert!(!tokens.contains(&Token::Indent));
        let newlines = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn mixed_indent_is_rejected() {
        let error = tokenize("if a:\n\t  pass\n").unwrap_err();
        assert!(matches!(error.val(), LexError::MixedIndent));
    }

    #[test]
    fn bad_dedent_is_rejected() {
        let error = tokenize("if a:\n        x = 1\n    y = 2\n").unwrap_err();
        assert!(matches!(error.val(), LexError::BadDedent));
    }

    #[test]
    fn crlf_is_normalized() {
        let tokens = kinds("x = 1\r\ny = 2\r\n");
        let newlines = tokens.iter().filter(|t| **t == Token::Newline).count();
        assert_eq!(newlines, 2);
    }

    #[test]
    fn fstring_token_keeps_raw_fragments() {
        let tokens = kinds("f\"hola {nombre}!\"\n");
        assert_eq!(tokens[0], Token::FString("hola {nombre}!".into()));
    }

    #[test]
    fn lexeme_roundtrip_relex() {
        // Reconstruir el programa a partir de los lexemas y volver a
        // escanear produce la misma secuencia de tokens
        let source = "def f(a: int32) -> int32:\n    return a + 1\n";
        let first = kinds(source);

        let mut rebuilt = String::new();
        let mut level = 0usize;
        let mut line_open = false;
        for token in &first {
            match token {
                Token::Newline => {
                    rebuilt.push('\n');
                    line_open = false;
                }
                Token::Indent => level += 1,
                Token::Dedent => level -= 1,
                Token::Eof => (),
                other => {
                    if !line_open {
                        rebuilt.push_str(&"    ".repeat(level));
                        line_open = true;
                    }
                    let text = match other {
                        Token::Ident(name) => name.clone(),
                        Token::Int(v) => v.to_string(),
                        Token::Keyword(k) => k.to_string(),
                        Token::Op(op) => op.to_string(),
                        _ => unreachable!("unexpected token in sample"),
                    };
                    rebuilt.push_str(&text);
                    rebuilt.push(' ');
                }
            }
        }

        assert_eq!(kinds(&rebuilt), first);
    }
}
