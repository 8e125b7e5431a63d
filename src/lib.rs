#[macro_use]
mod macros;

pub mod arch;
pub mod ast;
pub mod error;
pub mod lex;
pub mod parse;
pub mod semantic;
pub mod source;

pub mod codegen;

use crate::arch::Arch;
use crate::error::{Diagnostic, Stage};

/// Compila una unidad de traducción completa: fuente UTF-8 a texto
/// ensamblador GAS. Cada invocación es independiente; no hay estado
/// compartido entre unidades.
pub fn compile(source: &str, filename: &str, arch: Arch) -> Result<String, Diagnostic> {
    let tokens = lex::tokenize(source)
        .map_err(|error| Diagnostic::from_located(filename, Stage::Lex, error))?;

    let program = parse::parse(tokens)
        .map_err(|error| Diagnostic::from_located(filename, Stage::Parse, error))?;

    let analysis = semantic::check(program, arch)
        .map_err(|error| Diagnostic::from_located(filename, Stage::Type, error))?;

    let unit = unit_name(filename);
    let mut output = Vec::new();
    codegen::emit(&analysis, arch, &unit, &mut output)
        .map_err(|error| Diagnostic::emit_error(filename, error))?;

    Ok(String::from_utf8(output).expect("codegen emitted invalid UTF-8"))
}

/// Deriva un nombre de unidad apto para símbolos a partir del nombre
/// del archivo fuente.
fn unit_name(filename: &str) -> String {
    let stem = std::path::Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("unit");

    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();

    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }

    name
}
