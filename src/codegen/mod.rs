//! Generación de código para una unidad de traducción.
//!
//! Este módulo orquesta la emisión: directivas de cabecera, las
//! funciones en orden de aparición, la función sintética de
//! inicialización de globales no constantes, la tabla `.vectors`
//! cuando hay manejadores de interrupción, y las secciones de datos.
//! Los literales de cadena se internan por contenido en orden de
//! primera aparición, por lo cual dos compilaciones del mismo fuente
//! producen salidas idénticas byte a byte.

mod frame;
mod thumb;

use crate::arch::Arch;
use crate::ast::*;
use crate::semantic::Analysis;
use crate::source::{Position, Span};

use std::collections::HashMap;
use std::io::{self, Write};

use thiserror::Error;

/// Error del generador. Las variantes internas señalan invariantes
/// rotos aguas arriba, no errores del programa fuente.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EmitError {
    pub fn position(&self) -> Option<Position> {
        None
    }
}

/// Valor constante reducible a directivas de datos.
enum ConstInit {
    Word(i64),
    Wide(i64),
    StrRef(usize),
}

/// Entrada de un literal de diccionario en `.data`.
pub(crate) enum DictCell {
    Word(i64),
    StrRef(usize),
}

/// Estado compartido de la unidad durante la emisión: la tabla de
/// internado de cadenas y los blobs de diccionario descubiertos al
/// recorrer las funciones.
pub(crate) struct UnitState {
    strings: Vec<String>,
    by_content: HashMap<String, usize>,
    dicts: Vec<Vec<DictCell>>,
}

impl UnitState {
    fn new() -> Self {
        UnitState {
            strings: Vec::new(),
            by_content: HashMap::new(),
            dicts: Vec::new(),
        }
    }

    /// Interna una cadena por contenido; devuelve el índice de su
    /// etiqueta `.LC<k>`.
    pub(crate) fn intern(&mut self, text: &str) -> usize {
        if let Some(&index) = self.by_content.get(text) {
            return index;
        }

        let index = self.strings.len();
        self.strings.push(text.to_owned());
        self.by_content.insert(text.to_owned(), index);
        index
    }

    pub(crate) fn add_dict(&mut self, cells: Vec<DictCell>) -> usize {
        self.dicts.push(cells);
        self.dicts.len() - 1
    }
}

/// Emite el ensamblador de una unidad completa.
pub fn emit<W: Write>(
    analysis: &Analysis,
    arch: Arch,
    unit: &str,
    out: &mut W,
) -> Result<(), EmitError> {
    let mut state = UnitState::new();

    writeln!(out, "@ Pynux generated ARM Thumb-2 assembly")?;
    writeln!(out, "@ Target: {}", arch.cpu())?;
    writeln!(out)?;
    writeln!(out, "\t.syntax unified")?;
    writeln!(out, "\t.cpu {}", arch.cpu())?;
    writeln!(out, "\t.thumb")?;
    writeln!(out)?;
    writeln!(out, "\t.section .text")?;

    let mut has_main = false;
    let mut kernel_main = false;
    let mut interrupts: Vec<&str> = Vec::new();

    for decl in &analysis.program.decls {
        if let Decl::Function(function) = decl {
            match function.name.as_str() {
                "main" => has_main = true,
                "kernel_main" => kernel_main = true,
                _ => (),
            }
            if function.interrupt {
                interrupts.push(&function.name);
            }

            thumb::emit_function(out, function, arch, &analysis.layouts, &mut state)?;
        }
    }

    // Inicialización en runtime de globales cuyo valor no es reducible
    // a directivas de datos
    let deferred: Vec<&GlobalVar> = analysis
        .program
        .decls
        .iter()
        .filter_map(|decl| match decl {
            Decl::Global(global) => match &global.init {
                Some(init) if const_init(init, &mut state).is_none() => Some(global),
                _ => None,
            },
            _ => None,
        })
        .collect();

    if !deferred.is_empty() {
        let init = synth_init_function(unit, &deferred);
        thumb::emit_function(out, &init, arch, &analysis.layouts, &mut state)?;
    }

    if !has_main && kernel_main {
        writeln!(out)?;
        writeln!(out, "\t.global main")?;
        writeln!(out, "\t.thumb_set main, kernel_main")?;
    }

    if !interrupts.is_empty() {
        writeln!(out)?;
        writeln!(out, "\t.section .vectors, \"a\"")?;
        for handler in &interrupts {
            writeln!(out, "\t.word {}", handler)?;
        }
    }

    emit_data(analysis, &mut state, out)?;
    emit_bss(analysis, out)?;
    emit_rodata(&state, out)?;

    Ok(())
}

/// Sección `.data`: globales con inicializador constante, globales
/// diferidas (en cero) y blobs de diccionario `[count, k0, v0, …]`.
fn emit_data<W: Write>(
    analysis: &Analysis,
    state: &mut UnitState,
    out: &mut W,
) -> Result<(), EmitError> {
    let mut lines: Vec<String> = Vec::new();

    for decl in &analysis.program.decls {
        let Decl::Global(global) = decl else {
            continue;
        };
        let Some(init) = &global.init else {
            continue;
        };

        let size = global.ty.size_of(&analysis.layouts);
        lines.push(format!("\t.global {}", global.name));
        lines.push(format!("{}:", global.name));

        match const_init(init, state) {
            Some(ConstInit::Word(value)) => match size {
                1 => lines.push(format!("\t.byte {}", value as u8)),
                2 => lines.push(format!("\t.short {}", value as u16)),
                _ => lines.push(format!("\t.word {}", value as u32)),
            },
            Some(ConstInit::Wide(value)) => {
                let value = value as u64;
                lines.push(format!("\t.word {}", value as u32));
                lines.push(format!("\t.word {}", (value >> 32) as u32));
            }
            Some(ConstInit::StrRef(index)) => {
                lines.push(format!("\t.word .LC{}", index));
            }
            // El valor lo escribe `__init_<unidad>` en el arranque
            None => lines.push(format!("\t.space {}", size)),
        }
        lines.push("\t.align 2".to_owned());
    }

    for (index, cells) in state.dicts.iter().enumerate() {
        lines.push(format!(".LD{}:", index));
        lines.push(format!("\t.word {}", cells.len() / 2));
        for cell in cells {
            match cell {
                DictCell::Word(value) => lines.push(format!("\t.word {}", *value as u32)),
                DictCell::StrRef(string) => lines.push(format!("\t.word .LC{}", string)),
            }
        }
    }

    if !lines.is_empty() {
        writeln!(out)?;
        writeln!(out, "\t.section .data")?;
        for line in lines {
            writeln!(out, "{}", line)?;
        }
    }

    Ok(())
}

/// Sección `.bss`: globales sin inicializador.
fn emit_bss<W: Write>(analysis: &Analysis, out: &mut W) -> Result<(), EmitError> {
    let zeroed: Vec<(&str, u32)> = analysis
        .program
        .decls
        .iter()
        .filter_map(|decl| match decl {
            Decl::Global(global) if global.init.is_none() => {
                Some((global.name.as_str(), global.ty.size_of(&analysis.layouts)))
            }
            _ => None,
        })
        .collect();

    if zeroed.is_empty() {
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "\t.section .bss")?;
    for (name, size) in zeroed {
        writeln!(out, "\t.global {}", name)?;
        writeln!(out, "{}:", name)?;
        writeln!(out, "\t.space {}", size)?;
        writeln!(out, "\t.align 2")?;
    }

    Ok(())
}

/// Sección `.rodata`: literales de cadena deduplicados por contenido.
fn emit_rodata<W: Write>(state: &UnitState, out: &mut W) -> Result<(), EmitError> {
    if state.strings.is_empty() {
        return Ok(());
    }

    writeln!(out)?;
    writeln!(out, "\t.section .rodata")?;
    for (index, text) in state.strings.iter().enumerate() {
        writeln!(out, ".LC{}:", index)?;
        writeln!(out, "\t.asciz \"{}\"", escape_asm(text))?;
        writeln!(out, "\t.align 2")?;
    }

    Ok(())
}

/// Escapa una cadena para `.asciz`: comillas, barras, controles
/// comunes por nombre y el resto de no imprimibles en octal.
fn escape_asm(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            c if (c as u32) < 32 => escaped.push_str(&format!("\\{:03o}", c as u32)),
            c => escaped.push(c),
        }
    }

    escaped
}

/// Reduce un inicializador a directivas de datos si es constante.
fn const_init(expr: &Expr, state: &mut UnitState) -> Option<ConstInit> {
    let wide = expr
        .ty
        .as_ref()
        .map(|ty| thumb::is_wide(ty))
        .unwrap_or(false);

    match fold_const(expr, state)? {
        ConstInit::Word(value) if wide => Some(ConstInit::Wide(value)),
        other => Some(other),
    }
}

fn fold_const(expr: &Expr, state: &mut UnitState) -> Option<ConstInit> {
    match &expr.kind {
        ExprKind::Int(value) => Some(ConstInit::Word(*value)),
        ExprKind::Char(value) => Some(ConstInit::Word(*value as i64)),
        ExprKind::Bool(value) => Some(ConstInit::Word(*value as i64)),
        ExprKind::NoneLit => Some(ConstInit::Word(0)),
        ExprKind::Float(value) => {
            let wide = matches!(expr.ty.as_ref().map(Type::strip), Some(Type::Float64));
            if wide {
                Some(ConstInit::Wide(value.to_bits() as i64))
            } else {
                Some(ConstInit::Word((*value as f32).to_bits() as i64))
            }
        }
        ExprKind::Str(text) => Some(ConstInit::StrRef(state.intern(text))),
        ExprKind::Unary { op, operand } => {
            let inner = match fold_const(operand, state)? {
                ConstInit::Word(value) => value,
                _ => return None,
            };
            match op {
                UnaryOp::Neg => Some(ConstInit::Word(-inner)),
                UnaryOp::BitNot => Some(ConstInit::Word(!inner)),
                UnaryOp::Not => None,
            }
        }
        _ => None,
    }
}

/// Celdas de un literal de diccionario; `None` si alguna entrada no
/// es constante (el verificador ya lo impide).
pub(crate) fn dict_cells(
    pairs: &[(Expr, Expr)],
    state: &mut UnitState,
) -> Option<Vec<DictCell>> {
    let mut cells = Vec::with_capacity(pairs.len() * 2);

    for (key, value) in pairs {
        for expr in [key, value] {
            let cell = match fold_const(expr, state)? {
                ConstInit::Word(word) => DictCell::Word(word),
                ConstInit::StrRef(index) => DictCell::StrRef(index),
                ConstInit::Wide(_) => return None,
            };
            cells.push(cell);
        }
    }

    Some(cells)
}

/// Función sintética `__init_<unidad>` con las asignaciones de
/// globales no constantes; los nodos llegan ya tipados del análisis.
fn synth_init_function(unit: &str, deferred: &[&GlobalVar]) -> FunctionDef {
    let body = deferred
        .iter()
        .map(|global| {
            let mut target = Expr::new(
                ExprKind::Ident {
                    name: global.name.clone(),
                    binding: Some(Binding::Global(global.name.clone())),
                },
                global.span,
            );
            target.ty = Some(global.ty.clone());

            Stmt::new(
                StmtKind::Assign {
                    target,
                    value: global.init.clone().expect("deferred global without init"),
                },
                global.span,
            )
        })
        .collect();

    FunctionDef {
        name: format!("__init_{}", unit),
        params: Vec::new(),
        ret: Type::Void,
        body,
        decorators: Vec::new(),
        span: Span::default(),
        interrupt: false,
        frame: Vec::new(),
    }
}
