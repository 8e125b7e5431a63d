//! Diagnósticos de compilación.
//!
//! Cada fase del compilador produce su propio tipo de error, siempre
//! acompañado de una ubicación. Este módulo los reduce a una forma
//! común de una sola línea, `<archivo>:<línea>:<columna>: <fase>:
//! <mensaje>`, que es lo que el driver imprime en stderr.

use crate::codegen::EmitError;
use crate::source::{Located, Position, Span};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Fase del compilador que originó un diagnóstico.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    Lex,
    Parse,
    Type,
    Emit,
}

impl Display for Stage {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Stage::Lex => "lex",
            Stage::Parse => "parse",
            Stage::Type => "type",
            Stage::Emit => "emit",
        };

        formatter.write_str(tag)
    }
}

/// Un diagnóstico terminal, listo para mostrarse al usuario.
#[derive(Debug)]
pub struct Diagnostic {
    file: String,
    position: Position,
    stage: Stage,
    message: String,
}

impl Diagnostic {
    /// Reduce un error de fase ubicado a su forma imprimible.
    pub fn from_located<E: Error>(file: &str, stage: Stage, error: Located<E>) -> Self {
        let (span, error) = error.split();
        Diagnostic {
            file: file.to_owned(),
            position: span.start(),
            stage,
            message: error.to_string(),
        }
    }

    /// Reduce un error del generador de código. Estos no siempre
    /// llevan ubicación; en tal caso se señala el inicio del archivo.
    pub fn emit_error(file: &str, error: EmitError) -> Self {
        Diagnostic {
            file: file.to_owned(),
            position: error.position().unwrap_or_default(),
            stage: Stage::Emit,
            message: error.to_string(),
        }
    }

    /// Fase que produjo el diagnóstico.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Ubicación señalada.
    pub fn span(&self) -> Span {
        Span::point(self.position)
    }
}

impl Display for Diagnostic {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}:{}: {}: {}",
            self.file, self.position, self.stage, self.message
        )
    }
}

impl Error for Diagnostic {}
