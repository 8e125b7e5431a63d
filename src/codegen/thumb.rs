//! Emisión Thumb-2 por función.
//!
//! # Disciplina de máquina de pila
//! Cada expresión deja su valor en `r0` (par `r0:r1` para 64 bits).
//! Una operación binaria evalúa el lado izquierdo, lo apila, evalúa el
//! derecho y desapila el izquierdo en `r1`; ninguna expresión mantiene
//! registros vivos a través de otra. `r4..r7` se preservan en el
//! prólogo y solo `r4` se usa como scratch puntual, nunca entre
//! sentencias.
//!
//! # Temporales y alineamiento
//! Los temporales se apilan de a pares de 8 bytes (`push {r0, r1}`)
//! para que `sp` conserve el alineamiento de 8 en cada `bl`, incluso
//! dentro de subexpresiones. El emisor lleva la cuenta de esos bytes
//! y compensa los offsets de los slots, que son fijos respecto del
//! `sp` post-prólogo.
//!
//! # Secuencias portables
//! Se emiten las formas de 16 bits con bandera (`adds`, `subs`,
//! `muls`, …) válidas tanto en ARMv6-M como en ARMv7-M. Las
//! diferencias de ISA quedan confinadas a `movw`, a los bloques
//! `it`/`ite` frente a rombos de saltos, y a `clz`/`rbit`/`ldrex`.

use super::frame::{FrameLayout, LoopLabels};
use super::{dict_cells, EmitError, UnitState};
use crate::arch::Arch;
use crate::ast::*;

use std::io::Write;

type Emit = Result<(), EmitError>;

/// Tipos que ocupan el par `r0:r1`.
pub(crate) fn is_wide(ty: &Type) -> bool {
    match ty.strip() {
        Type::Int64 | Type::Uint64 | Type::Float64 => true,
        Type::Optional(inner) => is_wide(inner),
        _ => false,
    }
}

/// Tipos cuyo valor es la dirección del agregado, no su contenido.
fn is_aggregate(ty: &Type) -> bool {
    matches!(ty.strip(), Type::Array(_, _) | Type::Named(_))
}

pub(crate) fn emit_function<W: Write>(
    out: &mut W,
    func: &FunctionDef,
    arch: Arch,
    layouts: &Layouts,
    state: &mut UnitState,
) -> Emit {
    let saved = prologue_bytes(func, arch);
    let frame = FrameLayout::new(&func.frame, layouts, saved);

    let mut emitter = FunctionEmitter {
        out,
        func,
        arch,
        layouts,
        state,
        frame,
        labels: 0,
        loops: Vec::new(),
        temp_depth: 0,
        defers: Vec::new(),
    };

    emitter.function()
}

fn prologue_bytes(func: &FunctionDef, arch: Arch) -> u32 {
    if func.interrupt && arch.has_it_blocks() {
        24 // r0-r3, ip, lr
    } else {
        20 // r4-r7, lr (o r0-r3, lr en un manejador v6-M)
    }
}

struct FunctionEmitter<'a, W> {
    out: &'a mut W,
    func: &'a FunctionDef,
    arch: Arch,
    layouts: &'a Layouts,
    state: &'a mut UnitState,
    frame: FrameLayout,
    labels: u32,
    loops: Vec<LoopLabels>,
    temp_depth: u32,
    defers: Vec<&'a Stmt>,
}

impl<'a, W: Write> FunctionEmitter<'a, W> {
    fn internal<T>(&self, message: impl Into<String>) -> Result<T, EmitError> {
        Err(EmitError::Internal(format!(
            "{} (in `{}`)",
            message.into(),
            self.func.name
        )))
    }

    fn ty_of(&self, expr: &Expr) -> Result<Type, EmitError> {
        match &expr.ty {
            Some(ty) => Ok(ty.clone()),
            None => self.internal("expression reached the emitter without a type"),
        }
    }

    fn new_label(&mut self) -> String {
        self.labels += 1;
        format!(".L{}_{}", self.func.name, self.labels)
    }

    fn size_of(&self, ty: &Type) -> u32 {
        ty.size_of(self.layouts)
    }

    // ---------------------------------------------------------------
    // Pila de temporales
    // ---------------------------------------------------------------

    /// Apila `r0` (y `r1`) como par de 8 bytes.
    fn push_temp(&mut self) -> Emit {
        emit!(self, "push {{r0, r1}}")?;
        self.temp_depth += 8;
        Ok(())
    }

    /// Recupera la palabra baja de un par apilado.
    fn pop_temp(&mut self, reg: &str) -> Emit {
        emit!(self, "pop {{{}}}", reg)?;
        emit!(self, "add sp, sp, #4")?;
        self.temp_depth -= 8;
        Ok(())
    }

    /// Recupera un par completo en `r0:r1`.
    fn pop_wide(&mut self) -> Emit {
        emit!(self, "pop {{r0, r1}}")?;
        self.temp_depth -= 8;
        Ok(())
    }

    /// Recupera un par completo en `r2:r3`.
    fn pop_pair_high(&mut self) -> Emit {
        emit!(self, "pop {{r2, r3}}")?;
        self.temp_depth -= 8;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Constantes, slots y accesos con tamaño
    // ---------------------------------------------------------------

    fn const32(&mut self, reg: &str, value: i64) -> Emit {
        let value = value as i32;
        if (0..=255).contains(&value) {
            emit!(self, "movs {}, #{}", reg, value)
        } else if self.arch.has_movw() && (0..=65535).contains(&value) {
            emit!(self, "movw {}, #{}", reg, value)
        } else {
            emit!(self, "ldr {}, ={}", reg, value)
        }
    }

    fn slot_offset(&self, slot: u32) -> u32 {
        self.frame.offset(slot) + self.temp_depth
    }

    /// Dirección de un slot (más un desplazamiento) en `reg`.
    fn slot_addr(&mut self, reg: &str, slot: u32, extra: u32) -> Emit {
        let offset = self.slot_offset(slot) + extra;
        if offset <= 1020 && offset % 4 == 0 {
            emit!(self, "add {}, sp, #{}", reg, offset)
        } else {
            emit!(self, "ldr {}, ={}", reg, offset)?;
            emit!(self, "add {}, sp, {}", reg, reg)
        }
    }

    fn load_word_slot(&mut self, reg: &str, slot: u32, extra: u32) -> Emit {
        let offset = self.slot_offset(slot) + extra;
        if offset <= 1020 {
            emit!(self, "ldr {}, [sp, #{}]", reg, offset)
        } else {
            self.slot_addr(reg, slot, extra)?;
            emit!(self, "ldr {0}, [{0}]", reg)
        }
    }

    fn store_word_slot(&mut self, reg: &str, slot: u32, extra: u32) -> Emit {
        let offset = self.slot_offset(slot) + extra;
        if offset <= 1020 {
            emit!(self, "str {}, [sp, #{}]", reg, offset)
        } else {
            self.slot_addr("r3", slot, extra)?;
            emit!(self, "str {}, [r3]", reg)
        }
    }

    /// Carga el valor de un slot en `r0` (`r0:r1` si es ancho) según
    /// su tipo.
    fn load_local(&mut self, slot: u32, ty: &Type) -> Emit {
        if is_aggregate(ty) {
            return self.slot_addr("r0", slot, 0);
        }
        if is_wide(ty) {
            self.load_word_slot("r0", slot, 0)?;
            return self.load_word_slot("r1", slot, 4);
        }

        match self.size_of(ty) {
            1 => {
                self.slot_addr("r3", slot, 0)?;
                emit!(self, "ldrb r0, [r3]")?;
                if ty.is_signed() {
                    emit!(self, "sxtb r0, r0")?;
                }
                Ok(())
            }
            2 => {
                self.slot_addr("r3", slot, 0)?;
                emit!(self, "ldrh r0, [r3]")?;
                if ty.is_signed() {
                    emit!(self, "sxth r0, r0")?;
                }
                Ok(())
            }
            _ => self.load_word_slot("r0", slot, 0),
        }
    }

    /// Guarda `r0` (`r0:r1` si es ancho) en un slot.
    fn store_local(&mut self, slot: u32, ty: &Type) -> Emit {
        if is_wide(ty) {
            self.store_word_slot("r0", slot, 0)?;
            return self.store_word_slot("r1", slot, 4);
        }

        match self.size_of(ty) {
            1 if !is_aggregate(ty) => {
                self.slot_addr("r3", slot, 0)?;
                emit!(self, "strb r0, [r3]")
            }
            2 if !is_aggregate(ty) => {
                self.slot_addr("r3", slot, 0)?;
                emit!(self, "strh r0, [r3]")
            }
            _ => self.store_word_slot("r0", slot, 0),
        }
    }

    /// Carga desde la dirección contenida en `addr` hacia `r0`
    /// (`r0:r1` si corresponde).
    fn sized_load(&mut self, addr: &str, ty: &Type) -> Emit {
        if is_aggregate(ty) {
            if addr != "r0" {
                emit!(self, "mov r0, {}", addr)?;
            }
            return Ok(());
        }
        if is_wide(ty) {
            emit!(self, "ldr r1, [{}, #4]", addr)?;
            return emit!(self, "ldr r0, [{}]", addr).map_err(Into::into);
        }

        match self.size_of(ty) {
            1 => {
                emit!(self, "ldrb r0, [{}]", addr)?;
                if ty.is_signed() {
                    emit!(self, "sxtb r0, r0")?;
                }
                Ok(())
            }
            2 => {
                emit!(self, "ldrh r0, [{}]", addr)?;
                if ty.is_signed() {
                    emit!(self, "sxth r0, r0")?;
                }
                Ok(())
            }
            _ => emit!(self, "ldr r0, [{}]", addr).map_err(Into::into),
        }
    }

    /// Guarda `r0` (`r0:r1`) en la dirección contenida en `addr`
    /// (que no puede ser `r0` ni `r1`).
    fn sized_store(&mut self, addr: &str, ty: &Type) -> Emit {
        if is_wide(ty) {
            emit!(self, "str r0, [{}]", addr)?;
            return emit!(self, "str r1, [{}, #4]", addr).map_err(Into::into);
        }

        match self.size_of(ty) {
            1 => emit!(self, "strb r0, [{}]", addr).map_err(Into::into),
            2 => emit!(self, "strh r0, [{}]", addr).map_err(Into::into),
            _ => emit!(self, "str r0, [{}]", addr).map_err(Into::into),
        }
    }

    /// Escala `r0` por el tamaño de un elemento; puede usar `r2`.
    fn scale_index(&mut self, elem_size: u32) -> Emit {
        match elem_size {
            1 => Ok(()),
            2 => emit!(self, "lsls r0, r0, #1").map_err(Into::into),
            4 => emit!(self, "lsls r0, r0, #2").map_err(Into::into),
            8 => emit!(self, "lsls r0, r0, #3").map_err(Into::into),
            size => {
                self.const32("r2", size as i64)?;
                emit!(self, "muls r0, r2, r0").map_err(Into::into)
            }
        }
    }

    /// Materializa un booleano a partir de la condición vigente.
    fn bool_from(&mut self, cond: &str) -> Emit {
        if self.arch.has_it_blocks() {
            emit!(self, "ite {}", cond)?;
            emit!(self, "mov{} r0, #1", cond)?;
            emit!(self, "mov{} r0, #0", inverse_cond(cond))
        } else {
            let yes = self.new_label();
            let done = self.new_label();
            emit!(self, "b{} {}", cond, yes)?;
            emit!(self, "movs r0, #0")?;
            emit!(self, "b {}", done)?;
            emit_label!(self, "{}", yes)?;
            emit!(self, "movs r0, #1")?;
            emit_label!(self, "{}", done)
        }
    }

    // ---------------------------------------------------------------
    // Función completa
    // ---------------------------------------------------------------

    fn function(&mut self) -> Emit {
        writeln!(self.out)?;
        emit!(self, ".global {}", self.func.name)?;
        emit!(self, ".type {}, %function", self.func.name)?;
        emit_label!(self, "{}", self.func.name)?;

        if self.func.interrupt {
            if self.arch.has_it_blocks() {
                emit!(self, "push {{r0-r3, ip, lr}}")?;
            } else {
                emit!(self, "push {{r0-r3, lr}}")?;
            }
        } else {
            emit!(self, "push {{r4-r7, lr}}")?;
        }

        if self.frame.size() > 0 {
            emit!(self, "sub sp, sp, #{}", self.frame.size())?;
        }

        self.spill_params()?;

        let func = self.func;
        for stmt in &func.body {
            self.stmt(stmt)?;
        }

        let ends_in_return = matches!(
            func.body.last().map(|stmt| &stmt.kind),
            Some(StmtKind::Return(_))
        );
        if !ends_in_return {
            self.run_defers()?;
            emit!(self, "movs r0, #0")?;
            self.epilogue()?;
        }

        emit!(self, ".size {0}, . - {0}", self.func.name)?;
        emit!(self, ".ltorg")?;
        Ok(())
    }

    /// Copia los parámetros entrantes a sus slots: los primeros
    /// cuatro desde `r0..r3`, el resto desde el área del llamador.
    fn spill_params(&mut self) -> Emit {
        let saved = prologue_bytes(self.func, self.arch);

        let func = self.func;
        for (index, param) in func.params.iter().enumerate() {
            let slot = index as u32;

            if index < 4 {
                let reg = format!("r{}", index);
                match self.size_of(&param.ty) {
                    1 if !is_aggregate(&param.ty) => {
                        self.slot_addr("r4", slot, 0)?;
                        emit!(self, "strb {}, [r4]", reg)?;
                    }
                    2 if !is_aggregate(&param.ty) => {
                        self.slot_addr("r4", slot, 0)?;
                        emit!(self, "strh {}, [r4]", reg)?;
                    }
                    _ => self.store_word_slot(&reg, slot, 0)?,
                }
            } else {
                // arg[4] quedó en `[sp, #0]` del llamador
                let incoming = self.frame.size() + saved + 4 * (index as u32 - 4);
                emit!(self, "ldr r4, [sp, #{}]", incoming)?;
                match self.size_of(&param.ty) {
                    1 if !is_aggregate(&param.ty) => {
                        self.slot_addr("r5", slot, 0)?;
                        emit!(self, "strb r4, [r5]")?;
                    }
                    2 if !is_aggregate(&param.ty) => {
                        self.slot_addr("r5", slot, 0)?;
                        emit!(self, "strh r4, [r5]")?;
                    }
                    _ => self.store_word_slot("r4", slot, 0)?,
                }
            }
        }

        Ok(())
    }

    fn epilogue(&mut self) -> Emit {
        if self.frame.size() > 0 {
            emit!(self, "add sp, sp, #{}", self.frame.size())?;
        }

        if self.func.interrupt {
            if self.arch.has_it_blocks() {
                emit!(self, "pop {{r0-r3, ip, lr}}")?;
                emit!(self, "bx lr")
            } else {
                emit!(self, "pop {{r0-r3, pc}}")
            }
        } else {
            emit!(self, "pop {{r4-r7, pc}}")
        }
    }

    fn run_defers(&mut self) -> Emit {
        let defers = self.defers.clone();
        for stmt in defers.iter().rev() {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Sentencias
    // ---------------------------------------------------------------

    fn stmt(&mut self, stmt: &'a Stmt) -> Emit {
        match &stmt.kind {
            StmtKind::VarDecl {
                ty, value, slot, ..
            } => {
                let slot = match slot {
                    Some(slot) => *slot,
                    None => return self.internal("variable declaration without a slot"),
                };

                match value {
                    Some(init) if matches!(init.kind, ExprKind::StructLit { .. }) => {
                        self.struct_init(slot, init)
                    }
                    Some(init) => {
                        self.expr(init)?;
                        self.store_local(slot, ty)
                    }
                    None => Ok(()),
                }
            }

            StmtKind::Assign { target, value } => {
                self.expr(value)?;
                self.assign_into(target)
            }

            StmtKind::AugAssign { target, op, value } => {
                let target_ty = self.ty_of(target)?;
                let value_ty = self.ty_of(value)?;
                self.expr(target)?;
                self.push_temp()?;
                self.expr(value)?;
                if is_wide(&target_ty) {
                    self.pop_pair_high()?;
                    self.wide_binop_core(*op, &target_ty)?;
                } else {
                    self.pop_temp("r1")?;
                    self.binop_core(*op, &target_ty, &value_ty)?;
                }
                self.assign_into(target)
            }

            StmtKind::TupleAssign { slots, value, .. } => {
                self.expr(value)?;
                self.push_temp()?;
                for (position, slot) in slots.iter().enumerate() {
                    emit!(self, "ldr r1, [sp]")?;
                    emit!(self, "ldr r0, [r1, #{}]", position * 4)?;
                    let ty = self.func.frame[*slot as usize].ty.clone();
                    self.store_local(*slot, &ty)?;
                }
                self.pop_temp("r0")
            }

            StmtKind::If {
                cond,
                then,
                elifs,
                otherwise,
            } => self.if_stmt(cond, then, elifs, otherwise.as_deref()),

            StmtKind::While { cond, body } => {
                let start = self.new_label();
                let end = self.new_label();

                self.loops.push(LoopLabels {
                    break_to: end.clone(),
                    continue_to: start.clone(),
                });

                emit_label!(self, "{}", start)?;
                self.expr(cond)?;
                emit!(self, "cmp r0, #0")?;
                emit!(self, "beq {}", end)?;

                for stmt in body {
                    self.stmt(stmt)?;
                }

                emit!(self, "b {}", start)?;
                emit_label!(self, "{}", end)?;
                self.loops.pop();
                Ok(())
            }

            StmtKind::ForRange {
                slot,
                start,
                stop,
                step,
                bounds,
                body,
                ..
            } => self.for_range(*slot, start, stop, step, *bounds, body),

            StmtKind::ForIter {
                slot,
                iter,
                cursor,
                body,
                ..
            } => self.for_iter(std::slice::from_ref(slot), iter, *cursor, body),

            StmtKind::ForUnpack {
                slots,
                iter,
                cursor,
                body,
                ..
            } => self.for_iter(slots, iter, *cursor, body),

            StmtKind::Break => match self.loops.last() {
                Some(labels) => {
                    let target = labels.break_to.clone();
                    emit!(self, "b {}", target).map_err(Into::into)
                }
                None => self.internal("`break` escaped the checker"),
            },

            StmtKind::Continue => match self.loops.last() {
                Some(labels) => {
                    let target = labels.continue_to.clone();
                    emit!(self, "b {}", target).map_err(Into::into)
                }
                None => self.internal("`continue` escaped the checker"),
            },

            StmtKind::Return(value) => {
                self.run_defers()?;
                if let Some(value) = value {
                    self.expr(value)?;
                }
                self.epilogue()
            }

            StmtKind::Raise(exc) => match exc {
                Some(exc) => {
                    self.expr(exc)?;
                    emit!(self, "bl __pynux_raise").map_err(Into::into)
                }
                None => emit!(self, "bl __pynux_reraise").map_err(Into::into),
            },

            StmtKind::Try {
                body,
                handlers,
                otherwise,
                finally,
            } => self.try_stmt(body, handlers, otherwise, finally),

            StmtKind::With {
                context,
                as_name,
                slot,
                body,
            } => {
                let slot = match slot {
                    Some(slot) => *slot,
                    None => return self.internal("with statement without a slot"),
                };

                self.expr(context)?;
                emit!(self, "bl __pynux_context_enter")?;
                self.store_word_slot("r0", slot, 0)?;

                if as_name.is_some() {
                    // El slot nombrado quedó inmediatamente después en
                    // el frame; localizarlo por nombre
                    if let Some(named) = as_name
                        .as_ref()
                        .and_then(|name| self.find_slot(name))
                    {
                        self.store_word_slot("r0", named, 0)?;
                    }
                }

                for stmt in body {
                    self.stmt(stmt)?;
                }

                self.load_word_slot("r0", slot, 0)?;
                emit!(self, "bl __pynux_context_exit").map_err(Into::into)
            }

            StmtKind::Asm(text) => {
                for line in text.lines() {
                    writeln!(self.out, "{}", line)?;
                }
                Ok(())
            }

            StmtKind::Assert { cond, message } => {
                let ok = self.new_label();
                self.expr(cond)?;
                emit!(self, "cmp r0, #0")?;
                emit!(self, "bne {}", ok)?;
                match message {
                    Some(message) => {
                        self.expr(message)?;
                        emit!(self, "bl __pynux_assert_fail_msg")?;
                    }
                    None => emit!(self, "bl __pynux_assert_fail")?,
                }
                emit_label!(self, "{}", ok)
            }

            StmtKind::Defer(inner) => {
                self.defers.push(inner);
                Ok(())
            }

            StmtKind::Global(_) => Ok(()),

            StmtKind::Pass => emit!(self, "@ pass").map_err(Into::into),

            StmtKind::Expr(expr) => match &expr.kind {
                ExprKind::FString(parts) => self.print_fstring(parts),
                _ => self.expr(expr),
            },

            StmtKind::For { .. } => self.internal("surface `for` escaped the checker"),
            StmtKind::Match { .. } => self.internal("`match` escaped the checker"),
            StmtKind::Yield(_) => self.internal("`yield` escaped the checker"),
        }
    }

    fn find_slot(&self, name: &str) -> Option<u32> {
        self.func
            .frame
            .iter()
            .position(|slot| slot.name == name)
            .map(|index| index as u32)
    }

    fn if_stmt(
        &mut self,
        cond: &'a Expr,
        then: &'a [Stmt],
        elifs: &'a [(Expr, Vec<Stmt>)],
        otherwise: Option<&'a [Stmt]>,
    ) -> Emit {
        let end = self.new_label();
        let mut next = self.new_label();

        self.expr(cond)?;
        emit!(self, "cmp r0, #0")?;
        if elifs.is_empty() && otherwise.is_none() {
            emit!(self, "beq {}", end)?;
        } else {
            emit!(self, "beq {}", next)?;
        }

        for stmt in then {
            self.stmt(stmt)?;
        }
        emit!(self, "b {}", end)?;

        for (index, (elif_cond, elif_body)) in elifs.iter().enumerate() {
            emit_label!(self, "{}", next)?;
            next = self.new_label();

            self.expr(elif_cond)?;
            emit!(self, "cmp r0, #0")?;
            if index + 1 < elifs.len() || otherwise.is_some() {
                emit!(self, "beq {}", next)?;
            } else {
                emit!(self, "beq {}", end)?;
            }

            for stmt in elif_body {
                self.stmt(stmt)?;
            }
            emit!(self, "b {}", end)?;
        }

        if let Some(body) = otherwise {
            emit_label!(self, "{}", next)?;
            for stmt in body {
                self.stmt(stmt)?;
            }
        }

        emit_label!(self, "{}", end)
    }

    fn for_range(
        &mut self,
        var: u32,
        start: &'a Expr,
        stop: &'a Expr,
        step: &'a Expr,
        bounds: (u32, u32),
        body: &'a [Stmt],
    ) -> Emit {
        let (stop_slot, step_slot) = bounds;

        self.expr(start)?;
        self.store_word_slot("r0", var, 0)?;
        self.expr(stop)?;
        self.store_word_slot("r0", stop_slot, 0)?;
        self.expr(step)?;
        self.store_word_slot("r0", step_slot, 0)?;

        let head = self.new_label();
        let next = self.new_label();
        let end = self.new_label();

        self.loops.push(LoopLabels {
            break_to: end.clone(),
            continue_to: next.clone(),
        });

        // Un paso negativo conocido invierte la comparación
        let descending = matches!(
            step.kind,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ) || matches!(step.kind, ExprKind::Int(value) if value < 0);

        emit_label!(self, "{}", head)?;
        self.load_word_slot("r0", var, 0)?;
        self.load_word_slot("r1", stop_slot, 0)?;
        emit!(self, "cmp r0, r1")?;
        if descending {
            emit!(self, "ble {}", end)?;
        } else {
            emit!(self, "bge {}", end)?;
        }

        for stmt in body {
            self.stmt(stmt)?;
        }

        emit_label!(self, "{}", next)?;
        self.load_word_slot("r0", var, 0)?;
        self.load_word_slot("r1", step_slot, 0)?;
        emit!(self, "adds r0, r0, r1")?;
        self.store_word_slot("r0", var, 0)?;
        emit!(self, "b {}", head)?;
        emit_label!(self, "{}", end)?;

        self.loops.pop();
        Ok(())
    }

    /// Iteración sobre el layout de lista `[len, cap, e0, e1, …]`;
    /// con varios slots destino cada elemento es una tupla.
    fn for_iter(
        &mut self,
        targets: &[u32],
        iter: &'a Expr,
        cursor: (u32, u32, u32),
        body: &'a [Stmt],
    ) -> Emit {
        let (idx, len, held) = cursor;

        self.expr(iter)?;
        self.store_word_slot("r0", held, 0)?;
        emit!(self, "ldr r0, [r0]")?;
        self.store_word_slot("r0", len, 0)?;
        emit!(self, "movs r0, #0")?;
        self.store_word_slot("r0", idx, 0)?;

        let head = self.new_label();
        let next = self.new_label();
        let end = self.new_label();

        self.loops.push(LoopLabels {
            break_to: end.clone(),
            continue_to: next.clone(),
        });

        emit_label!(self, "{}", head)?;
        self.load_word_slot("r0", idx, 0)?;
        self.load_word_slot("r1", len, 0)?;
        emit!(self, "cmp r0, r1")?;
        emit!(self, "bge {}", end)?;

        // Elemento corriente: `*(base + 8 + idx*4)`
        emit!(self, "lsls r0, r0, #2")?;
        self.load_word_slot("r1", held, 0)?;
        emit!(self, "adds r0, r0, r1")?;
        emit!(self, "adds r0, r0, #8")?;
        emit!(self, "ldr r0, [r0]")?;

        if targets.len() == 1 {
            let slot = targets[0];
            let ty = self.func.frame[slot as usize].ty.clone();
            self.store_local(slot, &ty)?;
        } else {
            emit!(self, "mov r2, r0")?;
            for (position, slot) in targets.iter().enumerate() {
                emit!(self, "ldr r0, [r2, #{}]", position * 4)?;
                let ty = self.func.frame[*slot as usize].ty.clone();
                self.store_local(*slot, &ty)?;
            }
        }

        for stmt in body {
            self.stmt(stmt)?;
        }

        emit_label!(self, "{}", next)?;
        self.load_word_slot("r0", idx, 0)?;
        emit!(self, "adds r0, r0, #1")?;
        self.store_word_slot("r0", idx, 0)?;
        emit!(self, "b {}", head)?;
        emit_label!(self, "{}", end)?;

        self.loops.pop();
        Ok(())
    }

    /// `try` emite la estructura completa; sin desenrollado en el
    /// runtime los manejadores quedan fuera del flujo normal.
    fn try_stmt(
        &mut self,
        body: &'a [Stmt],
        handlers: &'a [Handler],
        otherwise: &'a [Stmt],
        finally: &'a [Stmt],
    ) -> Emit {
        let after_body = self.new_label();
        let finally_label = self.new_label();

        for stmt in body {
            self.stmt(stmt)?;
        }
        emit!(self, "b {}", after_body)?;

        for handler in handlers {
            let label = self.new_label();
            emit_label!(self, "{}", label)?;
            if let Some(as_name) = &handler.as_name {
                if let Some(slot) = self.find_slot(as_name) {
                    self.store_word_slot("r0", slot, 0)?;
                }
            }
            for stmt in &handler.body {
                self.stmt(stmt)?;
            }
            emit!(self, "b {}", finally_label)?;
        }

        emit_label!(self, "{}", after_body)?;
        for stmt in otherwise {
            self.stmt(stmt)?;
        }

        emit_label!(self, "{}", finally_label)?;
        for stmt in finally {
            self.stmt(stmt)?;
        }

        Ok(())
    }

    /// Inicialización de un slot de struct: el área se limpia y luego
    /// cada campo nombrado se escribe en su offset.
    fn struct_init(&mut self, slot: u32, init: &'a Expr) -> Emit {
        let ExprKind::StructLit { name, fields } = &init.kind else {
            return self.internal("struct_init on a non-struct literal");
        };

        let layout = match self.layouts.get(name) {
            Some(layout) => layout.clone(),
            None => return self.internal(format!("missing layout for `{}`", name)),
        };

        self.slot_addr("r0", slot, 0)?;
        emit!(self, "movs r1, #0")?;
        self.const32("r2", layout.size as i64)?;
        emit!(self, "bl __pynux_memset")?;

        for (field_name, value) in fields {
            let field = match layout.field(field_name) {
                Some(field) => field.clone(),
                None => return self.internal(format!("missing field `{}`", field_name)),
            };

            self.expr(value)?;
            if is_wide(&field.ty) {
                self.slot_addr("r2", slot, field.offset)?;
                self.sized_store("r2", &field.ty)?;
            } else {
                self.slot_addr("r3", slot, field.offset)?;
                self.sized_store("r3", &field.ty)?;
            }
        }

        Ok(())
    }

    /// Escribe el valor en `r0` (`r0:r1`) en el destino de una
    /// asignación.
    fn assign_into(&mut self, target: &'a Expr) -> Emit {
        let target_ty = self.ty_of(target)?;

        match &target.kind {
            ExprKind::Ident { binding, .. } => match binding {
                Some(Binding::Local(slot)) => self.store_local(*slot, &target_ty),
                Some(Binding::Global(symbol)) => {
                    emit!(self, "ldr r2, ={}", symbol)?;
                    self.sized_store("r2", &target_ty)
                }
                _ => self.internal("assignment to an unbound name"),
            },

            ExprKind::Index { base, index } => {
                let base_ty = self.ty_of(base)?;

                // Diccionarios: el almacén pasa por el runtime
                if matches!(base_ty.strip(), Type::Dict(_, _)) {
                    self.push_temp()?; // valor
                    self.expr(base)?;
                    self.push_temp()?;
                    self.expr(index)?;
                    emit!(self, "mov r1, r0")?;
                    self.pop_temp("r0")?; // diccionario
                    self.pop_temp("r2")?; // valor
                    return emit!(self, "bl __pynux_dict_set_int").map_err(Into::into);
                }

                self.push_temp()?; // valor
                self.element_addr(base, index, &base_ty)?;
                emit!(self, "mov r2, r0")?;
                if is_wide(&target_ty) {
                    self.pop_wide()?;
                } else {
                    self.pop_temp("r0")?;
                }
                self.sized_store("r2", &target_ty)
            }

            ExprKind::Attr { .. } | ExprKind::Deref(_) => {
                self.push_temp()?; // valor
                self.lvalue_addr(target)?;
                emit!(self, "mov r2, r0")?;
                if is_wide(&target_ty) {
                    self.pop_wide()?;
                } else {
                    self.pop_temp("r0")?;
                }
                self.sized_store("r2", &target_ty)
            }

            _ => self.internal("unassignable target escaped the checker"),
        }
    }

    // ---------------------------------------------------------------
    // Direcciones de lvalues
    // ---------------------------------------------------------------

    /// Deja en `r0` la dirección de un lvalue.
    fn lvalue_addr(&mut self, expr: &'a Expr) -> Emit {
        match &expr.kind {
            ExprKind::Ident { binding, .. } => match binding {
                Some(Binding::Local(slot)) => self.slot_addr("r0", *slot, 0),
                Some(Binding::Global(symbol)) | Some(Binding::Func(symbol)) => {
                    emit!(self, "ldr r0, ={}", symbol).map_err(Into::into)
                }
                None => self.internal("unresolved name reached the emitter"),
            },

            ExprKind::Attr { base, name } => {
                let base_ty = self.ty_of(base)?;
                let (struct_name, through_pointer) = match base_ty.strip() {
                    Type::Named(struct_name) => (struct_name.clone(), false),
                    Type::Ptr(inner) => match inner.strip() {
                        Type::Named(struct_name) => (struct_name.clone(), true),
                        _ => return self.internal("field access on a non-struct pointer"),
                    },
                    _ => return self.internal("field access on a non-struct value"),
                };

                if through_pointer {
                    self.expr(base)?;
                } else {
                    self.lvalue_addr(base)?;
                }

                let offset = match self.layouts.get(&struct_name) {
                    Some(layout) => match layout.field(name) {
                        Some(field) => field.offset,
                        None => return self.internal(format!("missing field `{}`", name)),
                    },
                    None => {
                        return self.internal(format!("missing layout for `{}`", struct_name))
                    }
                };

                if offset > 0 {
                    if offset <= 255 {
                        emit!(self, "adds r0, r0, #{}", offset)?;
                    } else {
                        self.const32("r1", offset as i64)?;
                        emit!(self, "adds r0, r0, r1")?;
                    }
                }
                Ok(())
            }

            ExprKind::Index { base, index } => {
                let base_ty = self.ty_of(base)?;
                self.element_addr(base, index, &base_ty)
            }

            ExprKind::Deref(inner) => self.expr(inner),

            _ => self.internal("address of a non-lvalue escaped the checker"),
        }
    }

    /// Dirección del elemento `base[index]` en `r0`.
    fn element_addr(&mut self, base: &'a Expr, index: &'a Expr, base_ty: &Type) -> Emit {
        let elem_size = match base_ty.strip() {
            Type::Tuple(_) => 4,
            other => other
                .element()
                .map(|element| self.size_of(element))
                .unwrap_or(4),
        };
        let header = if matches!(base_ty.strip(), Type::List(_)) {
            8
        } else {
            0
        };

        // La base de un arreglo es su propia dirección; un puntero o
        // una lista aportan su valor
        if matches!(base_ty.strip(), Type::Array(_, _)) {
            self.lvalue_addr(base)?;
        } else {
            self.expr(base)?;
        }

        // Índice constante: desplazamiento directo
        if let ExprKind::Int(position) = index.kind {
            let displacement = header + position as u32 * elem_size;
            if displacement > 0 {
                if displacement <= 255 {
                    emit!(self, "adds r0, r0, #{}", displacement)?;
                } else {
                    self.const32("r1", displacement as i64)?;
                    emit!(self, "adds r0, r0, r1")?;
                }
            }
            return Ok(());
        }

        self.push_temp()?;
        self.expr(index)?;
        self.scale_index(elem_size)?;
        self.pop_temp("r1")?;
        emit!(self, "adds r0, r1, r0")?;
        if header > 0 {
            emit!(self, "adds r0, r0, #{}", header)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Expresiones
    // ---------------------------------------------------------------

    fn expr(&mut self, expr: &'a Expr) -> Emit {
        let ty = self.ty_of(expr)?;

        match &expr.kind {
            ExprKind::Int(value) => {
                if is_wide(&ty) {
                    let value = *value as u64;
                    self.const32("r0", (value as u32) as i64)?;
                    self.const32("r1", ((value >> 32) as u32) as i64)
                } else {
                    self.const32("r0", *value)
                }
            }

            ExprKind::Float(value) => {
                if is_wide(&ty) {
                    let bits = value.to_bits();
                    self.const32("r0", (bits as u32) as i64)?;
                    self.const32("r1", ((bits >> 32) as u32) as i64)
                } else {
                    let bits = (*value as f32).to_bits();
                    emit!(self, "ldr r0, ={}  @ float {}", bits, value).map_err(Into::into)
                }
            }

            ExprKind::Str(text) => {
                let label = self.state.intern(text);
                emit!(self, "ldr r0, =.LC{}", label).map_err(Into::into)
            }

            ExprKind::Char(value) => self.const32("r0", *value as i64),

            ExprKind::Bool(value) => self.const32("r0", *value as i64),

            ExprKind::NoneLit => emit!(self, "movs r0, #0").map_err(Into::into),

            ExprKind::FString(_) => {
                self.internal("f-string evaluated for its value")
            }

            ExprKind::Ident { binding, .. } => match binding {
                Some(Binding::Local(slot)) => {
                    let slot_ty = self.func.frame[*slot as usize].ty.clone();
                    self.load_local(*slot, &slot_ty)
                }
                Some(Binding::Global(symbol)) => {
                    if is_aggregate(&ty) {
                        emit!(self, "ldr r0, ={}", symbol).map_err(Into::into)
                    } else {
                        emit!(self, "ldr r2, ={}", symbol)?;
                        self.sized_load("r2", &ty)
                    }
                }
                Some(Binding::Func(symbol)) => {
                    emit!(self, "ldr r0, ={}", symbol).map_err(Into::into)
                }
                None => self.internal("unresolved name reached the emitter"),
            },

            ExprKind::Attr { .. } => {
                self.lvalue_addr(expr)?;
                if is_wide(&ty) {
                    self.sized_load("r0", &ty)
                } else {
                    emit!(self, "mov r2, r0")?;
                    self.sized_load("r2", &ty)
                }
            }

            ExprKind::Index { base, index } => {
                let base_ty = self.ty_of(base)?;

                if let Type::Dict(key, _) = base_ty.strip() {
                    let helper = if matches!(key.strip(), Type::Str) {
                        "__pynux_dict_get_str"
                    } else {
                        "__pynux_dict_get_int"
                    };
                    self.expr(base)?;
                    self.push_temp()?;
                    self.expr(index)?;
                    emit!(self, "mov r1, r0")?;
                    self.pop_temp("r0")?;
                    return emit!(self, "bl {}", helper).map_err(Into::into);
                }

                // Elemento palabra de un arreglo local con índice
                // constante: un solo acceso relativo a `sp`
                if let (
                    ExprKind::Ident {
                        binding: Some(Binding::Local(slot)),
                        ..
                    },
                    ExprKind::Int(position),
                ) = (&base.kind, &index.kind)
                {
                    if matches!(base_ty.strip(), Type::Array(_, _))
                        && self.size_of(&ty) == 4
                        && !is_aggregate(&ty)
                    {
                        let extra = *position as u32 * 4;
                        return self.load_word_slot("r0", *slot, extra);
                    }
                }

                self.element_addr(base, index, &base_ty)?;
                if is_wide(&ty) {
                    self.sized_load("r0", &ty)
                } else {
                    emit!(self, "mov r2, r0")?;
                    self.sized_load("r2", &ty)
                }
            }

            ExprKind::Slice {
                base,
                start,
                stop,
                step,
            } => {
                self.expr(base)?;
                self.push_temp()?;

                match start {
                    Some(start) => self.expr(start)?,
                    None => emit!(self, "movs r0, #0")?,
                }
                self.push_temp()?;

                match stop {
                    Some(stop) => self.expr(stop)?,
                    // `-1` es el centinela de "hasta el final"
                    None => emit!(self, "ldr r0, =-1")?,
                }
                self.push_temp()?;

                match step {
                    Some(step) => self.expr(step)?,
                    None => emit!(self, "movs r0, #1")?,
                }

                emit!(self, "mov r3, r0")?;
                self.pop_temp("r2")?;
                self.pop_temp("r1")?;
                self.pop_temp("r0")?;
                emit!(self, "bl __pynux_slice").map_err(Into::into)
            }

            ExprKind::Call { func, args, .. } => self.call(func, args),

            ExprKind::Intrinsic { name, args } => self.intrinsic(name, args),

            ExprKind::Unary { op, operand } => {
                self.expr(operand)?;
                let operand_ty = self.ty_of(operand)?;

                match op {
                    UnaryOp::Neg if is_wide(&operand_ty) => {
                        emit!(self, "mvns r0, r0")?;
                        emit!(self, "mvns r1, r1")?;
                        emit!(self, "movs r2, #0")?;
                        emit!(self, "adds r0, r0, #1")?;
                        emit!(self, "adcs r1, r1, r2").map_err(Into::into)
                    }
                    UnaryOp::Neg => emit!(self, "rsbs r0, r0, #0").map_err(Into::into),
                    UnaryOp::BitNot if is_wide(&operand_ty) => {
                        emit!(self, "mvns r0, r0")?;
                        emit!(self, "mvns r1, r1").map_err(Into::into)
                    }
                    UnaryOp::BitNot => emit!(self, "mvns r0, r0").map_err(Into::into),
                    UnaryOp::Not => {
                        emit!(self, "movs r1, #1")?;
                        emit!(self, "eors r0, r0, r1").map_err(Into::into)
                    }
                }
            }

            ExprKind::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),

            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let alt = self.new_label();
                let end = self.new_label();

                self.expr(cond)?;
                emit!(self, "cmp r0, #0")?;
                emit!(self, "beq {}", alt)?;
                self.expr(then)?;
                emit!(self, "b {}", end)?;
                emit_label!(self, "{}", alt)?;
                self.expr(otherwise)?;
                emit_label!(self, "{}", end)
            }

            ExprKind::AddressOf(operand) => self.lvalue_addr(operand),

            ExprKind::Deref(operand) => {
                self.expr(operand)?;
                if is_wide(&ty) {
                    self.sized_load("r0", &ty)
                } else {
                    emit!(self, "mov r2, r0")?;
                    self.sized_load("r2", &ty)
                }
            }

            ExprKind::Cast { ty: target, expr: inner } => {
                self.expr(inner)?;
                let source = self.ty_of(inner)?;
                self.convert(&source, target)
            }

            ExprKind::Sizeof(of) => {
                let size = self.size_of(of);
                self.const32("r0", size as i64)
            }

            ExprKind::ListLit(elements) => self.list_literal(elements),

            ExprKind::DictLit(pairs) => {
                let cells = match dict_cells(pairs, self.state) {
                    Some(cells) => cells,
                    None => {
                        return self.internal("non-constant dict literal escaped the checker")
                    }
                };
                let label = self.state.add_dict(cells);
                emit!(self, "ldr r0, =.LD{}", label).map_err(Into::into)
            }

            ExprKind::TupleLit(elements) => self.tuple_literal(elements),

            ExprKind::Comp {
                element,
                iter,
                cond,
                slots,
                ..
            } => self.comprehension(element, iter, cond.as_deref(), *slots),

            ExprKind::Asm(text) => {
                for line in text.lines() {
                    writeln!(self.out, "{}", line)?;
                }
                Ok(())
            }

            ExprKind::StructLit { .. } => {
                self.internal("struct literal outside of a declaration")
            }

            ExprKind::Lambda { .. } => self.internal("lambda escaped the checker"),

            ExprKind::MethodCall { .. } => self.internal("method call escaped the checker"),
        }
    }

    /// Conversión explícita entre representaciones en registro.
    fn convert(&mut self, source: &Type, target: &Type) -> Emit {
        if is_wide(target) && !is_wide(source) {
            if source.is_signed() {
                emit!(self, "asrs r1, r0, #31")?;
            } else {
                emit!(self, "movs r1, #0")?;
            }
            return Ok(());
        }

        if is_wide(source) && !is_wide(target) {
            // La palabra baja ya está en r0
        }

        match target.strip() {
            Type::Int8 => emit!(self, "sxtb r0, r0").map_err(Into::into),
            Type::Uint8 | Type::Char | Type::Bool => {
                emit!(self, "uxtb r0, r0").map_err(Into::into)
            }
            Type::Int16 => emit!(self, "sxth r0, r0").map_err(Into::into),
            Type::Uint16 => emit!(self, "uxth r0, r0").map_err(Into::into),
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Operaciones binarias
    // ---------------------------------------------------------------

    fn binary(&mut self, op: BinOp, lhs: &'a Expr, rhs: &'a Expr) -> Emit {
        // `and`/`or` cortocircuitan: el lado derecho no se evalúa si
        // el izquierdo decide
        if matches!(op, BinOp::And | BinOp::Or) {
            let decided = self.new_label();
            let done = self.new_label();

            self.expr(lhs)?;
            emit!(self, "cmp r0, #0")?;
            match op {
                BinOp::And => emit!(self, "beq {}", decided)?,
                _ => emit!(self, "bne {}", decided)?,
            }

            self.expr(rhs)?;
            emit!(self, "cmp r0, #0")?;
            match op {
                BinOp::And => emit!(self, "beq {}", decided)?,
                _ => emit!(self, "bne {}", decided)?,
            }

            match op {
                BinOp::And => emit!(self, "movs r0, #1")?,
                _ => emit!(self, "movs r0, #0")?,
            }
            emit!(self, "b {}", done)?;
            emit_label!(self, "{}", decided)?;
            match op {
                BinOp::And => emit!(self, "movs r0, #0")?,
                _ => emit!(self, "movs r0, #1")?,
            }
            emit_label!(self, "{}", done)?;
            return Ok(());
        }

        let lhs_ty = self.ty_of(lhs)?;

        if is_wide(&lhs_ty) {
            self.expr(lhs)?;
            self.push_temp()?;
            self.expr(rhs)?;
            self.pop_pair_high()?;
            return self.wide_binop_core(op, &lhs_ty);
        }

        let rhs_ty = self.ty_of(rhs)?;
        self.expr(lhs)?;
        self.push_temp()?;
        self.expr(rhs)?;
        self.pop_temp("r1")?;
        self.binop_core(op, &lhs_ty, &rhs_ty)
    }

    /// Núcleo de 32 bits: LHS en `r1`, RHS en `r0`, resultado en `r0`.
    fn binop_core(&mut self, op: BinOp, lhs_ty: &Type, rhs_ty: &Type) -> Emit {
        let signed = lhs_ty.is_signed();

        // Aritmética de punteros: el entero se escala por el tamaño
        // del elemento apuntado; dos punteros restados devuelven una
        // cuenta de elementos
        if lhs_ty.is_pointer() || matches!(lhs_ty.strip(), Type::Array(_, _) | Type::Str) {
            if matches!(op, BinOp::Add | BinOp::Sub) {
                let elem_size = lhs_ty
                    .element()
                    .map(|element| self.size_of(element))
                    .unwrap_or(1);

                if op == BinOp::Sub
                    && (rhs_ty.is_pointer()
                        || matches!(rhs_ty.strip(), Type::Array(_, _) | Type::Str))
                {
                    emit!(self, "subs r0, r1, r0")?;
                    return match elem_size {
                        1 => Ok(()),
                        2 => emit!(self, "asrs r0, r0, #1").map_err(Into::into),
                        4 => emit!(self, "asrs r0, r0, #2").map_err(Into::into),
                        8 => emit!(self, "asrs r0, r0, #3").map_err(Into::into),
                        size => {
                            self.const32("r1", size as i64)?;
                            emit!(self, "bl __aeabi_idiv").map_err(Into::into)
                        }
                    };
                }

                return match op {
                    BinOp::Add => {
                        self.scale_index(elem_size)?;
                        emit!(self, "adds r0, r1, r0").map_err(Into::into)
                    }
                    _ => {
                        self.scale_index(elem_size)?;
                        emit!(self, "subs r0, r1, r0").map_err(Into::into)
                    }
                };
            }
        }

        match op {
            BinOp::Add => emit!(self, "adds r0, r1, r0").map_err(Into::into),
            BinOp::Sub => emit!(self, "subs r0, r1, r0").map_err(Into::into),
            BinOp::Mul => emit!(self, "muls r0, r1, r0").map_err(Into::into),

            BinOp::Div | BinOp::IntDiv => {
                self.swap_operands()?;
                if signed {
                    emit!(self, "bl __aeabi_idiv").map_err(Into::into)
                } else {
                    emit!(self, "bl __aeabi_uidivmod").map_err(Into::into)
                }
            }

            BinOp::Mod => {
                self.swap_operands()?;
                if signed {
                    emit!(self, "bl __aeabi_idivmod")?;
                } else {
                    emit!(self, "bl __aeabi_uidivmod")?;
                }
                emit!(self, "mov r0, r1").map_err(Into::into)
            }

            BinOp::Pow => {
                self.swap_operands()?;
                emit!(self, "bl __pynux_pow").map_err(Into::into)
            }

            BinOp::BitAnd => emit!(self, "ands r0, r0, r1").map_err(Into::into),
            BinOp::BitOr => emit!(self, "orrs r0, r0, r1").map_err(Into::into),
            BinOp::BitXor => emit!(self, "eors r0, r0, r1").map_err(Into::into),

            BinOp::Shl => {
                emit!(self, "lsls r1, r1, r0")?;
                emit!(self, "mov r0, r1").map_err(Into::into)
            }
            BinOp::Shr => {
                if signed {
                    emit!(self, "asrs r1, r1, r0")?;
                } else {
                    emit!(self, "lsrs r1, r1, r0")?;
                }
                emit!(self, "mov r0, r1").map_err(Into::into)
            }

            BinOp::In | BinOp::NotIn => {
                self.swap_operands()?;
                emit!(self, "bl __pynux_in")?;
                if op == BinOp::NotIn {
                    emit!(self, "movs r1, #1")?;
                    emit!(self, "eors r0, r0, r1")?;
                }
                Ok(())
            }

            BinOp::Eq | BinOp::Is => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from("eq")
            }
            BinOp::Ne | BinOp::IsNot => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from("ne")
            }
            BinOp::Lt => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from(if signed { "lt" } else { "lo" })
            }
            BinOp::Le => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from(if signed { "le" } else { "ls" })
            }
            BinOp::Gt => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from(if signed { "gt" } else { "hi" })
            }
            BinOp::Ge => {
                emit!(self, "cmp r1, r0")?;
                self.bool_from(if signed { "ge" } else { "hs" })
            }

            BinOp::And | BinOp::Or => self.internal("short-circuit op in binop_core"),
        }
    }

    /// Intercambia LHS (`r1`) y RHS (`r0`) antes de un helper que
    /// espera sus operandos en orden AAPCS.
    fn swap_operands(&mut self) -> Emit {
        emit!(self, "mov r2, r0")?;
        emit!(self, "mov r0, r1")?;
        emit!(self, "mov r1, r2").map_err(Into::into)
    }

    /// Núcleo de 64 bits: LHS en `r2:r3`, RHS en `r0:r1`.
    fn wide_binop_core(&mut self, op: BinOp, lhs_ty: &Type) -> Emit {
        let signed = lhs_ty.is_signed();

        match op {
            BinOp::Add => {
                emit!(self, "adds r0, r2, r0")?;
                emit!(self, "adcs r1, r1, r3").map_err(Into::into)
            }

            BinOp::Sub => {
                emit!(self, "subs r0, r2, r0")?;
                emit!(self, "sbcs r3, r3, r1")?;
                emit!(self, "mov r1, r3").map_err(Into::into)
            }

            BinOp::BitAnd => {
                emit!(self, "ands r0, r0, r2")?;
                emit!(self, "ands r1, r1, r3").map_err(Into::into)
            }
            BinOp::BitOr => {
                emit!(self, "orrs r0, r0, r2")?;
                emit!(self, "orrs r1, r1, r3").map_err(Into::into)
            }
            BinOp::BitXor => {
                emit!(self, "eors r0, r0, r2")?;
                emit!(self, "eors r1, r1, r3").map_err(Into::into)
            }

            BinOp::Eq | BinOp::Ne => {
                emit!(self, "eors r0, r0, r2")?;
                emit!(self, "eors r1, r1, r3")?;
                emit!(self, "orrs r0, r0, r1")?;
                emit!(self, "cmp r0, #0")?;
                self.bool_from(if op == BinOp::Eq { "eq" } else { "ne" })
            }

            BinOp::Lt | BinOp::Ge => {
                // Bandera de LHS - RHS
                emit!(self, "subs r2, r2, r0")?;
                emit!(self, "sbcs r3, r3, r1")?;
                let cond = match (op, signed) {
                    (BinOp::Lt, true) => "lt",
                    (BinOp::Lt, false) => "lo",
                    (_, true) => "ge",
                    (_, false) => "hs",
                };
                self.bool_from(cond)
            }

            BinOp::Gt | BinOp::Le => {
                // Bandera de RHS - LHS
                emit!(self, "subs r0, r0, r2")?;
                emit!(self, "sbcs r1, r1, r3")?;
                let cond = match (op, signed) {
                    (BinOp::Gt, true) => "lt",
                    (BinOp::Gt, false) => "lo",
                    (_, true) => "ge",
                    (_, false) => "hs",
                };
                self.bool_from(cond)
            }

            other => self.internal(format!("64-bit `{}` escaped the checker", other)),
        }
    }

    // ---------------------------------------------------------------
    // Llamadas
    // ---------------------------------------------------------------

    fn call(&mut self, func: &'a Expr, args: &'a [Expr]) -> Emit {
        let direct: Option<String> = match &func.kind {
            ExprKind::Ident {
                binding: Some(Binding::Func(symbol)),
                ..
            } => Some(symbol.clone()),
            _ => None,
        };

        // Caso trivial: sin argumentos
        if args.is_empty() {
            return match &direct {
                Some(symbol) => emit!(self, "bl {}", symbol).map_err(Into::into),
                None => {
                    // El puntero a función se evalúa en `r0`
                    self.expr(func)?;
                    emit!(self, "blx r0").map_err(Into::into)
                }
            };
        }

        // Un solo argumento: ya queda en `r0`
        if args.len() == 1 && direct.is_some() {
            self.expr(&args[0])?;
            return emit!(self, "bl {}", direct.unwrap()).map_err(Into::into);
        }

        // El destino indirecto se evalúa primero y espera en la pila
        if direct.is_none() {
            self.expr(func)?;
            self.push_temp()?;
        }

        // Área para los argumentos que van por la pila, alineada a 8
        let stack_args = args.len().saturating_sub(4) as u32;
        let area = (stack_args * 4 + 7) & !7;
        if area > 0 {
            emit!(self, "sub sp, sp, #{}", area)?;
            self.temp_depth += area;
        }
        let base_depth = self.temp_depth;

        for (index, arg) in args.iter().enumerate() {
            self.expr(arg)?;
            if index < 4 {
                self.push_temp()?;
            } else {
                let offset = (self.temp_depth - base_depth) + 4 * (index as u32 - 4);
                emit!(self, "str r0, [sp, #{}]", offset)?;
            }
        }

        for index in (0..args.len().min(4)).rev() {
            self.pop_temp(&format!("r{}", index))?;
        }

        match direct {
            Some(symbol) => {
                emit!(self, "bl {}", symbol)?;
                if area > 0 {
                    emit!(self, "add sp, sp, #{}", area)?;
                    self.temp_depth -= area;
                }
            }
            None => {
                emit!(self, "ldr r4, [sp, #{}]", area)?;
                emit!(self, "blx r4")?;
                emit!(self, "add sp, sp, #{}", area + 8)?;
                self.temp_depth -= area + 8;
            }
        }

        Ok(())
    }

    // ---------------------------------------------------------------
    // Literales compuestos
    // ---------------------------------------------------------------

    /// Lista en el heap: `[len, cap, e0, e1, …]`.
    fn list_literal(&mut self, elements: &'a [Expr]) -> Emit {
        let count = elements.len() as u32;
        self.const32("r0", ((count + 2) * 4) as i64)?;
        emit!(self, "bl malloc")?;
        self.push_temp()?;

        self.const32("r1", count as i64)?;
        emit!(self, "ldr r0, [sp]")?;
        emit!(self, "str r1, [r0]")?;
        emit!(self, "str r1, [r0, #4]")?;

        for (index, element) in elements.iter().enumerate() {
            self.expr(element)?;
            emit!(self, "ldr r1, [sp]")?;
            self.store_at_offset((index as u32 + 2) * 4)?;
        }

        self.pop_temp("r0")
    }

    /// `*(r1 + offset) = r0`, robusto frente a offsets fuera del
    /// rango inmediato corto.
    fn store_at_offset(&mut self, offset: u32) -> Emit {
        if offset <= 124 {
            emit!(self, "str r0, [r1, #{}]", offset).map_err(Into::into)
        } else {
            self.const32("r2", offset as i64)?;
            emit!(self, "adds r2, r2, r1")?;
            emit!(self, "str r0, [r2]").map_err(Into::into)
        }
    }

    /// Tupla en el heap: elementos contiguos de una palabra.
    fn tuple_literal(&mut self, elements: &'a [Expr]) -> Emit {
        let count = elements.len() as u32;
        self.const32("r0", (count.max(1) * 4) as i64)?;
        emit!(self, "bl malloc")?;
        self.push_temp()?;

        for (index, element) in elements.iter().enumerate() {
            self.expr(element)?;
            emit!(self, "ldr r1, [sp]")?;
            self.store_at_offset(index as u32 * 4)?;
        }

        self.pop_temp("r0")
    }

    /// Comprensión sobre `range`: lista acotada con append en línea.
    fn comprehension(
        &mut self,
        element: &'a Expr,
        iter: &'a Expr,
        cond: Option<&'a Expr>,
        slots: Option<(u32, u32)>,
    ) -> Emit {
        let (var_slot, end_slot) = match slots {
            Some(slots) => slots,
            None => return self.internal("comprehension without slots"),
        };

        let ExprKind::Call { args, .. } = &iter.kind else {
            return self.internal("comprehension over a non-range iterable");
        };

        // Respaldo acotado: cabecera de 8 bytes y 64 elementos
        self.const32("r0", 264)?;
        emit!(self, "bl malloc")?;
        self.push_temp()?;
        emit!(self, "movs r1, #0")?;
        emit!(self, "str r1, [r0]")?;

        match args.len() {
            1 => {
                emit!(self, "movs r0, #0")?;
                self.store_word_slot("r0", var_slot, 0)?;
                self.expr(&args[0])?;
                self.store_word_slot("r0", end_slot, 0)?;
            }
            _ => {
                self.expr(&args[0])?;
                self.store_word_slot("r0", var_slot, 0)?;
                self.expr(&args[1])?;
                self.store_word_slot("r0", end_slot, 0)?;
            }
        }

        let step = match args.get(2).map(|arg| &arg.kind) {
            Some(ExprKind::Int(step)) => *step,
            _ => 1,
        };

        let head = self.new_label();
        let next = self.new_label();
        let end = self.new_label();

        emit_label!(self, "{}", head)?;
        self.load_word_slot("r0", var_slot, 0)?;
        self.load_word_slot("r1", end_slot, 0)?;
        emit!(self, "cmp r0, r1")?;
        if step < 0 {
            emit!(self, "ble {}", end)?;
        } else {
            emit!(self, "bge {}", end)?;
        }

        if let Some(cond) = cond {
            self.expr(cond)?;
            emit!(self, "cmp r0, #0")?;
            emit!(self, "beq {}", next)?;
        }

        self.expr(element)?;
        // Append: `lista[len] = r0; len += 1`
        emit!(self, "ldr r1, [sp]")?;
        emit!(self, "ldr r2, [r1]")?;
        emit!(self, "lsls r3, r2, #2")?;
        emit!(self, "adds r3, r3, r1")?;
        emit!(self, "adds r3, r3, #8")?;
        emit!(self, "str r0, [r3]")?;
        emit!(self, "adds r2, r2, #1")?;
        emit!(self, "str r2, [r1]")?;

        emit_label!(self, "{}", next)?;
        self.load_word_slot("r0", var_slot, 0)?;
        if step.abs() <= 255 && step >= 0 {
            emit!(self, "adds r0, r0, #{}", step)?;
        } else {
            self.const32("r1", step)?;
            emit!(self, "adds r0, r0, r1")?;
        }
        self.store_word_slot("r0", var_slot, 0)?;
        emit!(self, "b {}", head)?;
        emit_label!(self, "{}", end)?;

        self.pop_temp("r0")
    }

    // ---------------------------------------------------------------
    // Intrínsecos
    // ---------------------------------------------------------------

    fn intrinsic(&mut self, name: &str, args: &'a [Expr]) -> Emit {
        match name {
            "print" => {
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        emit!(self, "movs r0, #32")?;
                        emit!(self, "bl uart_putc")?;
                    }
                    self.print_value(arg)?;
                }
                emit!(self, "bl print_newline").map_err(Into::into)
            }

            "input" => {
                if let Some(prompt) = args.first() {
                    self.expr(prompt)?;
                    emit!(self, "bl print_str")?;
                }
                emit!(self, "movs r0, #128")?;
                emit!(self, "bl malloc")?;
                self.push_temp()?;
                emit!(self, "bl __pynux_read_line")?;
                self.pop_temp("r0")
            }

            "len" => {
                let arg = &args[0];
                let arg_ty = self.ty_of(arg)?;

                if let ExprKind::Str(text) = &arg.kind {
                    return self.const32("r0", text.chars().count() as i64);
                }
                match arg_ty.strip() {
                    Type::Array(count, _) => self.const32("r0", *count as i64),
                    Type::List(_) => {
                        self.expr(arg)?;
                        emit!(self, "ldr r0, [r0]").map_err(Into::into)
                    }
                    _ => {
                        self.expr(arg)?;
                        emit!(self, "bl __pynux_strlen").map_err(Into::into)
                    }
                }
            }

            "ord" => {
                let arg = &args[0];
                let arg_ty = self.ty_of(arg)?;
                self.expr(arg)?;
                if is_string(&arg_ty) {
                    emit!(self, "ldrb r0, [r0]")?;
                }
                Ok(())
            }

            "chr" => self.expr(&args[0]),

            "abs" => {
                self.expr(&args[0])?;
                emit!(self, "cmp r0, #0")?;
                if self.arch.has_it_blocks() {
                    emit!(self, "it lt")?;
                    emit!(self, "rsblt r0, r0, #0").map_err(Into::into)
                } else {
                    let done = self.new_label();
                    emit!(self, "bge {}", done)?;
                    emit!(self, "rsbs r0, r0, #0")?;
                    emit_label!(self, "{}", done)
                }
            }

            "min" | "max" => {
                let signed = self
                    .ty_of(&args[0])
                    .map(|ty| ty.is_signed())
                    .unwrap_or(true);
                self.expr(&args[0])?;
                for arg in &args[1..] {
                    self.push_temp()?;
                    self.expr(arg)?;
                    self.pop_temp("r1")?;
                    // r1 = acumulado, r0 = candidato
                    emit!(self, "cmp r1, r0")?;
                    let keep_acc = match (name, signed) {
                        ("min", true) => "lt",
                        ("min", false) => "lo",
                        (_, true) => "gt",
                        (_, false) => "hi",
                    };
                    if self.arch.has_it_blocks() {
                        emit!(self, "it {}", keep_acc)?;
                        emit!(self, "mov{} r0, r1", keep_acc)?;
                    } else {
                        let skip = self.new_label();
                        emit!(self, "b{} {}", inverse_cond(keep_acc), skip)?;
                        emit!(self, "mov r0, r1")?;
                        emit_label!(self, "{}", skip)?;
                    }
                }
                Ok(())
            }

            "dmb" | "dsb" | "isb" | "wfi" | "wfe" | "sev" | "clrex" => {
                emit!(self, "{}", name).map_err(Into::into)
            }

            "clz" => {
                self.expr(&args[0])?;
                emit!(self, "clz r0, r0").map_err(Into::into)
            }
            "rbit" => {
                self.expr(&args[0])?;
                emit!(self, "rbit r0, r0").map_err(Into::into)
            }
            "rev" => {
                self.expr(&args[0])?;
                emit!(self, "rev r0, r0").map_err(Into::into)
            }
            "rev16" => {
                self.expr(&args[0])?;
                emit!(self, "rev16 r0, r0").map_err(Into::into)
            }

            "critical_enter" => {
                emit!(self, "mrs r0, primask")?;
                emit!(self, "cpsid i").map_err(Into::into)
            }
            "critical_exit" => {
                self.expr(&args[0])?;
                emit!(self, "msr primask, r0").map_err(Into::into)
            }

            "atomic_load" => {
                self.expr(&args[0])?;
                emit!(self, "ldr r0, [r0]").map_err(Into::into)
            }
            "atomic_store" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.pop_temp("r1")?;
                emit!(self, "str r0, [r1]").map_err(Into::into)
            }

            "atomic_add" | "atomic_sub" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.pop_temp("r1")?;
                // r1 = puntero, r0 = delta
                let retry = self.new_label();
                emit_label!(self, "{}", retry)?;
                emit!(self, "ldrex r2, [r1]")?;
                if name == "atomic_add" {
                    emit!(self, "adds r3, r2, r0")?;
                } else {
                    emit!(self, "subs r3, r2, r0")?;
                }
                emit!(self, "strex r4, r3, [r1]")?;
                emit!(self, "cmp r4, #0")?;
                emit!(self, "bne {}", retry)?;
                emit!(self, "mov r0, r2").map_err(Into::into)
            }

            "atomic_cas" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.push_temp()?;
                self.expr(&args[2])?;
                emit!(self, "mov r2, r0")?;
                self.pop_temp("r1")?;
                self.pop_temp("r0")?;
                // r0 = puntero, r1 = esperado, r2 = nuevo
                let retry = self.new_label();
                let fail = self.new_label();
                let done = self.new_label();
                emit_label!(self, "{}", retry)?;
                emit!(self, "ldrex r3, [r0]")?;
                emit!(self, "cmp r3, r1")?;
                emit!(self, "bne {}", fail)?;
                emit!(self, "strex r4, r2, [r0]")?;
                emit!(self, "cmp r4, #0")?;
                emit!(self, "bne {}", retry)?;
                emit!(self, "movs r0, #1")?;
                emit!(self, "b {}", done)?;
                emit_label!(self, "{}", fail)?;
                emit!(self, "clrex")?;
                emit!(self, "movs r0, #0")?;
                emit_label!(self, "{}", done)
            }

            "bit_set" | "bit_clear" | "bit_toggle" | "bit_test" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.pop_temp("r1")?;
                // r1 = valor, r0 = posición
                emit!(self, "movs r2, #1")?;
                emit!(self, "lsls r2, r2, r0")?;
                match name {
                    "bit_set" => {
                        emit!(self, "orrs r1, r1, r2")?;
                        emit!(self, "mov r0, r1").map_err(Into::into)
                    }
                    "bit_clear" => {
                        emit!(self, "bics r1, r1, r2")?;
                        emit!(self, "mov r0, r1").map_err(Into::into)
                    }
                    "bit_toggle" => {
                        emit!(self, "eors r1, r1, r2")?;
                        emit!(self, "mov r0, r1").map_err(Into::into)
                    }
                    _ => {
                        emit!(self, "ands r1, r1, r2")?;
                        emit!(self, "mov r0, r1")?;
                        emit!(self, "cmp r0, #0")?;
                        self.bool_from("ne")
                    }
                }
            }

            "bits_get" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.push_temp()?;
                self.expr(&args[2])?;
                emit!(self, "mov r2, r0")?;
                self.pop_temp("r1")?;
                self.pop_temp("r0")?;
                // r0 = valor, r1 = posición, r2 = ancho
                emit!(self, "lsrs r0, r0, r1")?;
                emit!(self, "movs r3, #1")?;
                emit!(self, "lsls r3, r3, r2")?;
                emit!(self, "subs r3, r3, #1")?;
                emit!(self, "ands r0, r0, r3").map_err(Into::into)
            }

            "bits_set" => {
                self.expr(&args[0])?;
                self.push_temp()?;
                self.expr(&args[1])?;
                self.push_temp()?;
                self.expr(&args[2])?;
                self.push_temp()?;
                self.expr(&args[3])?;
                emit!(self, "mov r3, r0")?;
                self.pop_temp("r2")?;
                self.pop_temp("r1")?;
                self.pop_temp("r0")?;
                // r0 = valor, r1 = bits nuevos, r2 = posición, r3 = ancho
                emit!(self, "movs r4, #1")?;
                emit!(self, "lsls r4, r4, r3")?;
                emit!(self, "subs r4, r4, #1")?;
                emit!(self, "lsls r4, r4, r2")?;
                emit!(self, "bics r0, r0, r4")?;
                emit!(self, "lsls r1, r1, r2")?;
                emit!(self, "ands r1, r1, r4")?;
                emit!(self, "orrs r0, r0, r1").map_err(Into::into)
            }

            _ => self.internal(format!("unknown intrinsic `{}`", name)),
        }
    }

    // ---------------------------------------------------------------
    // Impresión dirigida por tipos
    // ---------------------------------------------------------------

    fn print_value(&mut self, arg: &'a Expr) -> Emit {
        if let ExprKind::FString(parts) = &arg.kind {
            return self.print_fstring(parts);
        }

        let ty = self.ty_of(arg)?;
        self.expr(arg)?;
        self.print_typed(&ty)
    }

    /// El valor a imprimir ya está en `r0`; el tipo decide el
    /// formateador del runtime.
    fn print_typed(&mut self, ty: &Type) -> Emit {
        match ty.strip() {
            Type::Char => emit!(self, "bl uart_putc").map_err(Into::into),

            Type::Bool => {
                let when_false = self.new_label();
                let done = self.new_label();
                let yes = self.state.intern("True");
                let no = self.state.intern("False");

                emit!(self, "cmp r0, #0")?;
                emit!(self, "beq {}", when_false)?;
                emit!(self, "ldr r0, =.LC{}", yes)?;
                emit!(self, "b {}", done)?;
                emit_label!(self, "{}", when_false)?;
                emit!(self, "ldr r0, =.LC{}", no)?;
                emit_label!(self, "{}", done)?;
                emit!(self, "bl print_str").map_err(Into::into)
            }

            ty if is_string(ty) => emit!(self, "bl print_str").map_err(Into::into),

            ty if ty.is_pointer() => emit!(self, "bl print_hex").map_err(Into::into),

            _ => emit!(self, "bl print_int").map_err(Into::into),
        }
    }

    fn print_fstring(&mut self, parts: &'a [FsPart]) -> Emit {
        for part in parts {
            match part {
                FsPart::Lit(text) => {
                    let label = self.state.intern(text);
                    emit!(self, "ldr r0, =.LC{}", label)?;
                    emit!(self, "bl print_str")?;
                }
                FsPart::Expr(inner) => {
                    let ty = self.ty_of(inner)?;
                    self.expr(inner)?;
                    self.print_typed(&ty)?;
                }
            }
        }
        Ok(())
    }
}

fn is_string(ty: &Type) -> bool {
    match ty.strip() {
        Type::Str => true,
        Type::Ptr(inner) => **inner == Type::Char,
        _ => false,
    }
}

fn inverse_cond(cond: &str) -> &'static str {
    match cond {
        "eq" => "ne",
        "ne" => "eq",
        "lt" => "ge",
        "ge" => "lt",
        "le" => "gt",
        "gt" => "le",
        "lo" => "hs",
        "hs" => "lo",
        "ls" => "hi",
        "hi" => "ls",
        _ => unreachable!("unknown condition code"),
    }
}
