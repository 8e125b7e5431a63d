//! Rastreo de ubicaciones originales en código fuente.
//!
//! Los distintos objetos internos que el compilador construye
//! llevan cuenta de posiciones o rangos de ubicaciones en el
//! código fuente original, lo cual permite señalar un punto
//! exacto o aproximado en donde ocurre un error de abstracción
//! arbitraria.

use std::fmt::{self, Debug, Display, Formatter};

/// Una posición línea-columna en un archivo. Ambas comienzan en 1.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Position {
    /// Construye a partir de línea y columna explícitas.
    pub fn at(line: u32, column: u32) -> Self {
        Position { line, column }
    }

    /// Obtiene el número de línea.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Obtiene el número de columna.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Incrementa el número de columna.
    pub fn advance(self) -> Position {
        Position {
            line: self.line,
            column: self.column + 1,
        }
    }

    /// Incrementa el número de línea y retorna a la columna 1.
    pub fn newline(self) -> Position {
        Position {
            line: self.line + 1,
            column: 1,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Display for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}

impl Debug for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Un rango de posiciones dentro de un mismo archivo.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Span {
    start: Position,
    end: Position,
}

impl Span {
    /// Construye un rango a partir de sus extremos.
    pub fn new(start: Position, end: Position) -> Self {
        Span { start, end }
    }

    /// Rango de una sola posición.
    pub fn point(at: Position) -> Self {
        Span { start: at, end: at }
    }

    /// Unifica dos rangos. Se asume el mismo origen.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }

    /// Obtiene la posición de inicio.
    pub fn start(&self) -> Position {
        self.start
    }

    /// Obtiene la posición de fin.
    pub fn end(&self) -> Position {
        self.end
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::point(Position::default())
    }
}

impl Display for Span {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.start, formatter)
    }
}

impl Debug for Span {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Un objeto cualquiera con una ubicación original asociada.
#[derive(Debug, Clone)]
pub struct Located<T> {
    span: Span,
    value: T,
}

impl<T> Located<T> {
    /// Construye a partir de un valor y una ubicación.
    pub fn at(value: T, span: Span) -> Self {
        Located { value, span }
    }

    /// Obtiene el valor.
    pub fn val(&self) -> &T {
        &self.value
    }

    /// Obtiene la ubicación.
    pub fn span(&self) -> Span {
        self.span
    }

    /// Descarta la ubicación y toma ownership del valor.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Descompone y toma ownership de las dos partes.
    pub fn split(self) -> (Span, T) {
        (self.span, self.value)
    }

    /// Transforma el valor con la misma ubicación.
    pub fn map<U, F>(self, map: F) -> Located<U>
    where
        F: FnOnce(T) -> U,
    {
        Located {
            value: map(self.value),
            span: self.span,
        }
    }
}

impl<T> AsRef<T> for Located<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
