//! Análisis semántico y verificación de tipos.
//!
//! El verificador recorre el AST una vez por función, con dos ámbitos
//! a la vista: el de módulo (globales, firmas de función, layouts de
//! agregados, imports) y el local (slots del frame en construcción).
//! Cada expresión queda anotada con su tipo resuelto y cada
//! identificador con un binding, de modo que el generador no vuelve a
//! resolver nombres.
//!
//! Además del chequeo, aquí se realizan las reescrituras que le
//! convienen al generador: `for … in range(…)` se reduce a un lazo
//! contado, `match` a una cadena `if`/`elif`, los métodos a funciones
//! libres, la comparación de cadenas a `__pynux_strcmp`, y los
//! decoradores `@interrupt` y `@packed` a banderas en la declaración.
//!
//! Las firmas del runtime (§ ABI) se preregistran para que una unidad
//! pueda invocar `print_str` o `malloc` sin declararlas.

use crate::arch::Arch;
use crate::ast::*;
use crate::source::{Located, Span};
use std::collections::{HashMap, HashSet};

use thiserror::Error;

pub type Semantic<T> = Result<T, Located<SemanticError>>;

/// Error de análisis semántico.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SemanticError {
    #[error("symbol `{0}` is undefined")]
    Undefined(String),

    #[error("duplicate definition of `{0}`")]
    Duplicate(String),

    #[error("type mismatch: expected `{expected}`, found `{found}`")]
    Mismatch { expected: Type, found: Type },

    #[error("operator `{op}` cannot combine `{lhs}` and `{rhs}`")]
    BadOperands { op: BinOp, lhs: Type, rhs: Type },

    #[error("unary `{op}` is not defined for `{ty}`")]
    BadUnary { op: &'static str, ty: Type },

    #[error("`{name}` expects {expected} argument(s), found {found}")]
    BadArity {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("`{0}` is not callable")]
    NotCallable(Type),

    #[error("unknown keyword argument `{name}` for `{func}`")]
    UnknownKwarg { name: String, func: String },

    #[error("cannot take the address of this expression")]
    NotAddressable,

    #[error("cannot assign to this expression")]
    NotAssignable,

    #[error("`{0}` cannot be indexed")]
    NotIndexable(Type),

    #[error("`{0}` cannot be iterated")]
    NotIterable(Type),

    #[error("tuple indices must be integer literals")]
    TupleIndex,

    #[error("tuple elements must fit in a single word")]
    TupleElement,

    #[error("`break` outside of a loop")]
    BreakOutsideLoop,

    #[error("`continue` outside of a loop")]
    ContinueOutsideLoop,

    #[error("void function returns a value")]
    ReturnValueInVoid,

    #[error("function must return `{0}`")]
    MissingReturnValue(Type),

    #[error("local `{0}` may be used before assignment")]
    UninitializedLocal(String),

    #[error("unknown decorator `@{0}`")]
    UnknownDecorator(String),

    #[error("generators are not supported; remove `yield`")]
    GeneratorsUnsupported,

    #[error("lambda expressions are not supported")]
    LambdasUnsupported,

    #[error("no soft-float runtime: arithmetic on `{0}` is not supported")]
    FloatArithmetic(Type),

    #[error("64-bit `{0}` has no runtime helper")]
    WideOperation(BinOp),

    #[error("string-keyed dictionaries are read-only")]
    DictSetStr,

    #[error("`range` is only valid in a `for` loop")]
    RangeOutsideFor,

    #[error("`{ty}` has no method `{name}`")]
    UnknownMethod { ty: Type, name: String },

    #[error("`{ty}` has no field `{name}`")]
    UnknownField { ty: String, name: String },

    #[error("slicing is only defined on strings")]
    BadSlice,

    #[error("struct initializers may only initialize a typed declaration")]
    StructLitContext,

    #[error("`{0}` is not a struct or union type")]
    NotAStruct(String),

    #[error("dict literal entries must be compile-time constants")]
    NonConstDict,

    #[error("f-strings can only appear where their text is printed")]
    FStringContext,

    #[error("expression has no value")]
    VoidValue,

    #[error("`{name}` requires ARMv7-M, target is {arch}")]
    TargetMissing { name: String, arch: Arch },

    #[error("parameter defaults must be literal constants")]
    BadDefault,

    #[error("`@interrupt` handlers take no parameters and return nothing")]
    BadInterrupt,

    #[error("comprehension steps must be integer literals")]
    CompStep,

    #[error("64-bit parameters are not supported by the call lowering")]
    WideParam,
}

/// Resultado del análisis: el programa decorado junto con los layouts
/// calculados, todo lo que el generador necesita.
#[derive(Debug)]
pub struct Analysis {
    pub program: Program,
    pub layouts: Layouts,
}

/// Verifica una unidad completa.
pub fn check(program: Program, arch: Arch) -> Semantic<Analysis> {
    let mut module = ModuleScope::new(arch);
    let program = module.collect(program)?;

    let mut checked = Vec::with_capacity(program.decls.len());
    for decl in program.decls {
        match decl {
            Decl::Function(function) => {
                let function = module.check_function(function)?;
                checked.push(Decl::Function(function));
            }

            Decl::Class(class) => {
                // Los métodos ya fueron aplanados a funciones libres;
                // se verifican y emiten en el lugar de la clase
                for method in module.take_methods(&class.name) {
                    let method = module.check_function(method)?;
                    checked.push(Decl::Function(method));
                }
            }

            Decl::Global(global) => {
                let global = module.check_global(global)?;
                checked.push(Decl::Global(global));
            }

            other @ (Decl::Struct(_) | Decl::Union(_) | Decl::Extern(_) | Decl::Import(_)) => {
                checked.push(other);
            }
        }
    }

    Ok(Analysis {
        program: Program { decls: checked },
        layouts: module.layouts,
    })
}

/// Firma invocable registrada en el ámbito de módulo.
#[derive(Clone)]
struct FnSig {
    /// `None` para símbolos importados cuya firma no es visible; las
    /// llamadas a estos no se verifican (el linker resuelve).
    params: Option<Vec<Param>>,
    ret: Type,
}

struct ModuleScope {
    arch: Arch,
    layouts: Layouts,
    functions: HashMap<String, FnSig>,
    globals: HashMap<String, Type>,
    modules: HashSet<String>,
    star_import: bool,
    pending_methods: HashMap<String, Vec<FunctionDef>>,
}

impl ModuleScope {
    fn new(arch: Arch) -> Self {
        let mut scope = ModuleScope {
            arch,
            layouts: Layouts::new(),
            functions: HashMap::new(),
            globals: HashMap::new(),
            modules: HashSet::new(),
            star_import: false,
            pending_methods: HashMap::new(),
        };

        for (name, params, ret) in runtime_signatures() {
            scope.functions.insert(
                name.to_owned(),
                FnSig {
                    params: Some(
                        params
                            .iter()
                            .map(|ty| Param {
                                name: String::new(),
                                ty: ty.clone(),
                                default: None,
                                span: Span::default(),
                            })
                            .collect(),
                    ),
                    ret,
                },
            );
        }

        scope
    }

    /// Primera pasada: registra todo nombre de nivel superior y
    /// calcula los layouts de los agregados en orden de declaración.
    fn collect(&mut self, program: Program) -> Semantic<Program> {
        let mut decls = Vec::with_capacity(program.decls.len());

        for decl in program.decls {
            match decl {
                Decl::Struct(mut def) => {
                    let mut packed = false;
                    for decorator in &def.decorators {
                        match decorator.val().as_str() {
                            "packed" => packed = true,
                            other => {
                                return Err(Located::at(
                                    SemanticError::UnknownDecorator(other.to_owned()),
                                    decorator.span(),
                                ))
                            }
                        }
                    }
                    def.packed = packed;

                    self.register_layout(&def.name, &def.fields, packed, false, def.span)?;
                    decls.push(Decl::Struct(def));
                }

                Decl::Union(def) => {
                    for decorator in &def.decorators {
                        return Err(Located::at(
                            SemanticError::UnknownDecorator(decorator.val().clone()),
                            decorator.span(),
                        ));
                    }

                    self.register_layout(&def.name, &def.fields, false, true, def.span)?;
                    decls.push(Decl::Union(def));
                }

                Decl::Class(class) => {
                    self.register_class(&class)?;
                    decls.push(Decl::Class(class));
                }

                Decl::Function(function) => {
                    self.register_function(&function)?;
                    decls.push(Decl::Function(function));
                }

                Decl::Extern(extern_def) => {
                    self.declare_function(
                        &extern_def.name,
                        Some(extern_def.params.clone()),
                        extern_def.ret.clone(),
                        extern_def.span,
                    )?;
                    decls.push(Decl::Extern(extern_def));
                }

                Decl::Global(global) => {
                    if self.globals.contains_key(&global.name)
                        || (self.functions.contains_key(&global.name)
                            && runtime_signatures()
                                .iter()
                                .all(|(n, _, _)| *n != global.name))
                    {
                        return Err(Located::at(
                            SemanticError::Duplicate(global.name.clone()),
                            global.span,
                        ));
                    }
                    self.resolve_type(&global.ty, global.span)?;
                    self.globals.insert(global.name.clone(), global.ty.clone());
                    decls.push(Decl::Global(global));
                }

                Decl::Import(import) => {
                    // El enlace es plano: un nombre importado se reduce
                    // a su símbolo; la existencia la valida el linker
                    if import.star {
                        self.star_import = true;
                    }
                    for name in &import.names {
                        self.functions.entry(name.clone()).or_insert(FnSig {
                            params: None,
                            ret: Type::Int32,
                        });
                    }
                    match &import.alias {
                        Some(alias) => {
                            self.modules.insert(alias.clone());
                        }
                        None if !import.star && import.names.is_empty() => {
                            self.modules.insert(import.module.clone());
                        }
                        None => (),
                    }
                    decls.push(Decl::Import(import));
                }
            }
        }

        Ok(Program { decls })
    }

    fn register_layout(
        &mut self,
        name: &str,
        fields: &[(String, Type)],
        packed: bool,
        is_union: bool,
        span: Span,
    ) -> Semantic<()> {
        if self.layouts.contains_key(name) {
            return Err(Located::at(
                SemanticError::Duplicate(name.to_owned()),
                span,
            ));
        }

        let layout = self.layout_of(fields, packed, is_union, span)?;
        self.layouts.insert(name.to_owned(), layout);
        Ok(())
    }

    fn layout_of(
        &self,
        fields: &[(String, Type)],
        packed: bool,
        is_union: bool,
        span: Span,
    ) -> Semantic<StructLayout> {
        let mut infos = Vec::with_capacity(fields.len());
        let mut offset = 0u32;
        let mut size = 0u32;
        let mut align = 1u32;

        for (field_name, field_type) in fields {
            self.resolve_type(field_type, span)?;

            let field_size = field_type.size_of(&self.layouts);
            let field_align = if packed {
                1
            } else {
                field_type.align_of(&self.layouts)
            };

            align = align.max(field_align);

            let place = if is_union {
                0
            } else {
                round_up(offset, field_align)
            };

            infos.push(FieldInfo {
                name: field_name.clone(),
                ty: field_type.clone(),
                offset: place,
            });

            if is_union {
                size = size.max(field_size);
            } else {
                offset = place + field_size;
                size = offset;
            }
        }

        Ok(StructLayout {
            fields: infos,
            size: round_up(size, align),
            align,
            packed,
            is_union,
        })
    }

    /// Aplana una clase: los campos de las bases primero, luego los
    /// propios; cada método se vuelve una función libre
    /// `Clase_metodo(self: Ptr[Clase], …)`.
    fn register_class(&mut self, class: &ClassDef) -> Semantic<()> {
        for decorator in &class.decorators {
            return Err(Located::at(
                SemanticError::UnknownDecorator(decorator.val().clone()),
                decorator.span(),
            ));
        }

        let mut fields: Vec<(String, Type)> = Vec::new();
        for base in &class.bases {
            let layout = self.layouts.get(base).ok_or_else(|| {
                Located::at(SemanticError::Undefined(base.clone()), class.span)
            })?;
            for field in &layout.fields {
                fields.push((field.name.clone(), field.ty.clone()));
            }
        }
        for (name, ty, _default) in &class.fields {
            fields.push((name.clone(), ty.clone()));
        }

        self.register_layout(&class.name, &fields, false, false, class.span)?;

        let mut lowered = Vec::with_capacity(class.methods.len());
        for method in &class.methods {
            let mut method = method.clone();
            method.name = format!("{}_{}", class.name, method.name);
            method.params.insert(
                0,
                Param {
                    name: "self".to_owned(),
                    ty: Type::Ptr(Box::new(Type::Named(class.name.clone()))),
                    default: None,
                    span: method.span,
                },
            );
            self.register_function(&method)?;
            lowered.push(method);
        }
        self.pending_methods.insert(class.name.clone(), lowered);

        Ok(())
    }

    fn take_methods(&mut self, class: &str) -> Vec<FunctionDef> {
        self.pending_methods.remove(class).unwrap_or_default()
    }

    fn register_function(&mut self, function: &FunctionDef) -> Semantic<()> {
        for param in &function.params {
            if matches!(
                param.ty.strip(),
                Type::Int64 | Type::Uint64 | Type::Float64
            ) {
                return Err(Located::at(SemanticError::WideParam, param.span));
            }
            // Los agregados viajan por puntero
            if let Type::Named(name) = param.ty.strip() {
                return Err(Located::at(
                    SemanticError::Mismatch {
                        expected: Type::Ptr(Box::new(Type::Named(name.clone()))),
                        found: param.ty.clone(),
                    },
                    param.span,
                ));
            }
            if let Some(default) = &param.default {
                if !is_literal(default) {
                    return Err(Located::at(SemanticError::BadDefault, param.span));
                }
            }
        }

        self.declare_function(
            &function.name,
            Some(function.params.clone()),
            function.ret.clone(),
            function.span,
        )
    }

    fn declare_function(
        &mut self,
        name: &str,
        params: Option<Vec<Param>>,
        ret: Type,
        span: Span,
    ) -> Semantic<()> {
        if self.globals.contains_key(name) {
            return Err(Located::at(
                SemanticError::Duplicate(name.to_owned()),
                span,
            ));
        }

        // Redefinir un símbolo del runtime está permitido (una unidad
        // puede aportar su propia versión); redefinir uno propio no
        if self.functions.contains_key(name)
            && runtime_signatures().iter().all(|(n, _, _)| *n != name)
        {
            return Err(Located::at(
                SemanticError::Duplicate(name.to_owned()),
                span,
            ));
        }

        self.functions.insert(name.to_owned(), FnSig { params, ret });
        Ok(())
    }

    fn resolve_type(&self, ty: &Type, span: Span) -> Semantic<()> {
        match ty.strip() {
            Type::Named(name) => {
                if self.layouts.contains_key(name) {
                    Ok(())
                } else {
                    Err(Located::at(SemanticError::Undefined(name.clone()), span))
                }
            }
            Type::Ptr(inner)
            | Type::Array(_, inner)
            | Type::Optional(inner)
            | Type::List(inner) => self.resolve_type(inner, span),
            Type::Dict(key, value) => {
                self.resolve_type(key, span)?;
                self.resolve_type(value, span)
            }
            Type::Tuple(elements) => {
                for element in elements {
                    self.resolve_type(element, span)?;
                }
                Ok(())
            }
            Type::Fn { ret, params } => {
                self.resolve_type(ret, span)?;
                for param in params {
                    self.resolve_type(param, span)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_global(&mut self, mut global: GlobalVar) -> Semantic<GlobalVar> {
        if let Some(init) = &mut global.init {
            let mut checker = Checker::new(self, Type::Void);
            checker.value_expr(init)?;
            if !checker.assignable(&global.ty, init) {
                return Err(Located::at(
                    SemanticError::Mismatch {
                        expected: global.ty.clone(),
                        found: init.ty.clone().unwrap_or(Type::Void),
                    },
                    init.span,
                ));
            }
        }

        Ok(global)
    }

    fn check_function(&mut self, mut function: FunctionDef) -> Semantic<FunctionDef> {
        let mut interrupt = false;
        for decorator in &function.decorators {
            match decorator.val().as_str() {
                "interrupt" => interrupt = true,
                other => {
                    return Err(Located::at(
                        SemanticError::UnknownDecorator(other.to_owned()),
                        decorator.span(),
                    ))
                }
            }
        }

        if interrupt && (!function.params.is_empty() || function.ret != Type::Void) {
            return Err(Located::at(SemanticError::BadInterrupt, function.span));
        }
        function.interrupt = interrupt;

        let mut checker = Checker::new(self, function.ret.clone());
        for param in &function.params {
            checker.module.resolve_type(&param.ty, param.span)?;
            let slot = checker.new_slot(&param.name, param.ty.clone());
            checker.assigned.insert(slot);
        }
        checker.module.resolve_type(&function.ret, function.span)?;

        let body = std::mem::take(&mut function.body);
        function.body = checker.stmts(body)?;
        function.frame = checker.slots;

        Ok(function)
    }
}

// -------------------------------------------------------------------
// Verificación por función
// -------------------------------------------------------------------

struct Checker<'a> {
    module: &'a ModuleScope,
    ret: Type,
    slots: Vec<Slot>,
    names: HashMap<String, u32>,
    assigned: HashSet<u32>,
    declared_global: HashSet<String>,
    loop_depth: u32,
    hidden: u32,
}

impl<'a> Checker<'a> {
    fn new(module: &'a ModuleScope, ret: Type) -> Self {
        Checker {
            module,
            ret,
            slots: Vec::new(),
            names: HashMap::new(),
            assigned: HashSet::new(),
            declared_global: HashSet::new(),
            loop_depth: 0,
            hidden: 0,
        }
    }

    fn new_slot(&mut self, name: &str, ty: Type) -> u32 {
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            name: name.to_owned(),
            ty,
        });
        self.names.insert(name.to_owned(), index);
        index
    }

    /// Slot auxiliar invisible para el programa fuente.
    fn hidden_slot(&mut self, tag: &str, ty: Type) -> u32 {
        let name = format!("<{}{}>", tag, self.hidden);
        self.hidden += 1;
        let index = self.slots.len() as u32;
        self.slots.push(Slot { name, ty });
        self.assigned.insert(index);
        index
    }

    fn fail<T>(&self, error: SemanticError, span: Span) -> Semantic<T> {
        Err(Located::at(error, span))
    }

    // ---------------------------------------------------------------
    // Sentencias
    // ---------------------------------------------------------------

    fn stmts(&mut self, stmts: Vec<Stmt>) -> Semantic<Vec<Stmt>> {
        stmts.into_iter().map(|stmt| self.stmt(stmt)).collect()
    }

    fn stmt(&mut self, mut stmt: Stmt) -> Semantic<Stmt> {
        let span = stmt.span;

        match &mut stmt.kind {
            StmtKind::VarDecl {
                name,
                ty,
                value,
                slot,
            } => {
                self.module.resolve_type(ty, span)?;

                match value {
                    Some(init) if matches!(init.kind, ExprKind::StructLit { .. }) => {
                        self.struct_literal(init, ty)?;
                    }
                    Some(init) => {
                        self.value_expr(init)?;
                        if !self.assignable(ty, init) {
                            return self.fail(
                                SemanticError::Mismatch {
                                    expected: ty.clone(),
                                    found: init.ty.clone().unwrap_or(Type::Void),
                                },
                                init.span,
                            );
                        }
                    }
                    None => (),
                }

                let index = self.new_slot(name, ty.clone());
                if value.is_some() {
                    self.assigned.insert(index);
                }
                *slot = Some(index);
                Ok(stmt)
            }

            StmtKind::Assign { target, value } => {
                self.value_expr(value)?;

                // La asignación simple a un nombre nunca visto
                // introduce una local con el tipo del lado derecho
                if let ExprKind::Ident { name, binding } = &mut target.kind {
                    let is_global = self.declared_global.contains(name);
                    if !is_global && !self.names.contains_key(name) {
                        let ty = value.ty.clone().unwrap_or(Type::Void);
                        let index = self.new_slot(name, ty.clone());
                        self.assigned.insert(index);
                        *binding = Some(Binding::Local(index));
                        target.ty = Some(ty);
                        return Ok(stmt);
                    }
                }

                let target_ty = self.lvalue(target)?;
                if !self.assignable(&target_ty, value) {
                    return self.fail(
                        SemanticError::Mismatch {
                            expected: target_ty,
                            found: value.ty.clone().unwrap_or(Type::Void),
                        },
                        value.span,
                    );
                }
                Ok(stmt)
            }

            StmtKind::AugAssign { target, op, value } => {
                let target_ty = self.lvalue(target)?;
                self.value_expr(value)?;
                let result = self.binary_type(*op, target, value, span, &target_ty)?;
                if !types_agree(&result, &target_ty) {
                    return self.fail(
                        SemanticError::Mismatch {
                            expected: target_ty,
                            found: result,
                        },
                        span,
                    );
                }
                Ok(stmt)
            }

            StmtKind::TupleAssign {
                targets,
                value,
                slots,
            } => {
                self.value_expr(value)?;

                let element_types: Vec<Type> = match value.ty.as_ref().map(Type::strip) {
                    Some(Type::Tuple(elements)) => elements.clone(),
                    other => {
                        return self.fail(
                            SemanticError::NotIterable(other.cloned().unwrap_or(Type::Void)),
                            value.span,
                        )
                    }
                };

                if element_types.len() != targets.len() {
                    return self.fail(
                        SemanticError::BadArity {
                            name: "tuple unpacking".to_owned(),
                            expected: element_types.len(),
                            found: targets.len(),
                        },
                        span,
                    );
                }

                for (target, ty) in targets.iter().zip(&element_types) {
                    let index = match self.names.get(target) {
                        Some(&index) => {
                            let slot_ty = self.slots[index as usize].ty.clone();
                            if !types_agree(ty, &slot_ty) {
                                return self.fail(
                                    SemanticError::Mismatch {
                                        expected: slot_ty,
                                        found: ty.clone(),
                                    },
                                    span,
                                );
                            }
                            index
                        }
                        None => self.new_slot(target, ty.clone()),
                    };
                    self.assigned.insert(index);
                    slots.push(index);
                }
                Ok(stmt)
            }

            StmtKind::If {
                cond,
                then,
                elifs,
                otherwise,
            } => {
                self.condition(cond)?;
                *then = self.stmts(std::mem::take(then))?;
                for (elif_cond, elif_body) in elifs.iter_mut() {
                    self.condition(elif_cond)?;
                    *elif_body = self.stmts(std::mem::take(elif_body))?;
                }
                if let Some(body) = otherwise {
                    *body = self.stmts(std::mem::take(body))?;
                }
                Ok(stmt)
            }

            StmtKind::While { cond, body } => {
                self.condition(cond)?;
                self.loop_depth += 1;
                *body = self.stmts(std::mem::take(body))?;
                self.loop_depth -= 1;
                Ok(stmt)
            }

            StmtKind::For { vars, iter, body } => {
                let vars = std::mem::take(vars);
                let iter = std::mem::replace(iter, Expr::new(ExprKind::NoneLit, span));
                let body = std::mem::take(body);
                self.for_stmt(vars, iter, body, span)
            }

            StmtKind::Break => {
                if self.loop_depth == 0 {
                    return self.fail(SemanticError::BreakOutsideLoop, span);
                }
                Ok(stmt)
            }

            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return self.fail(SemanticError::ContinueOutsideLoop, span);
                }
                Ok(stmt)
            }

            StmtKind::Return(value) => {
                match value {
                    Some(value) => {
                        if self.ret == Type::Void {
                            return self.fail(SemanticError::ReturnValueInVoid, span);
                        }
                        self.value_expr(value)?;
                        let ret = self.ret.clone();
                        if !self.assignable(&ret, value) {
                            return self.fail(
                                SemanticError::Mismatch {
                                    expected: ret,
                                    found: value.ty.clone().unwrap_or(Type::Void),
                                },
                                value.span,
                            );
                        }
                    }
                    None => {
                        if self.ret != Type::Void {
                            return self.fail(
                                SemanticError::MissingReturnValue(self.ret.clone()),
                                span,
                            );
                        }
                    }
                }
                Ok(stmt)
            }

            StmtKind::Raise(exc) => {
                if let Some(exc) = exc {
                    self.value_expr(exc)?;
                }
                Ok(stmt)
            }

            StmtKind::Try {
                body,
                handlers,
                otherwise,
                finally,
            } => {
                *body = self.stmts(std::mem::take(body))?;
                for handler in handlers.iter_mut() {
                    if let Some(as_name) = &handler.as_name {
                        let index = self.new_slot(as_name, Type::Int32);
                        self.assigned.insert(index);
                    }
                    handler.body = self.stmts(std::mem::take(&mut handler.body))?;
                }
                *otherwise = self.stmts(std::mem::take(otherwise))?;
                *finally = self.stmts(std::mem::take(finally))?;
                Ok(stmt)
            }

            StmtKind::With {
                context,
                as_name,
                slot,
                body,
            } => {
                self.value_expr(context)?;
                let index = self.hidden_slot("with", Type::Ptr(Box::new(Type::Uint8)));
                *slot = Some(index);

                if let Some(as_name) = as_name {
                    let named = self.new_slot(as_name, Type::Ptr(Box::new(Type::Uint8)));
                    self.assigned.insert(named);
                }

                *body = self.stmts(std::mem::take(body))?;
                Ok(stmt)
            }

            StmtKind::Match { scrutinee, arms } => {
                let scrutinee = std::mem::replace(scrutinee, Expr::new(ExprKind::NoneLit, span));
                let arms = std::mem::take(arms);
                self.match_stmt(scrutinee, arms, span)
            }

            StmtKind::Asm(_) | StmtKind::Pass => Ok(stmt),

            StmtKind::Assert { cond, message } => {
                self.condition(cond)?;
                if let Some(message) = message {
                    self.value_expr(message)?;
                }
                Ok(stmt)
            }

            StmtKind::Defer(inner) => {
                let checked = self.stmt((**inner).clone())?;
                *inner = Box::new(checked);
                Ok(stmt)
            }

            StmtKind::Global(names) => {
                for name in names.iter() {
                    if !self.module.globals.contains_key(name) {
                        return self.fail(SemanticError::Undefined(name.clone()), span);
                    }
                    self.declared_global.insert(name.clone());
                }
                Ok(stmt)
            }

            StmtKind::Yield(_) => self.fail(SemanticError::GeneratorsUnsupported, span),

            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                Ok(stmt)
            }

            StmtKind::ForRange { .. }
            | StmtKind::ForIter { .. }
            | StmtKind::ForUnpack { .. } => Ok(stmt),
        }
    }

    /// Reduce la forma superficial del `for` a la variante que el
    /// generador sabe emitir.
    fn for_stmt(
        &mut self,
        vars: Vec<String>,
        mut iter: Expr,
        body: Vec<Stmt>,
        span: Span,
    ) -> Semantic<Stmt> {
        // `for i in range(a, b, c)` es azúcar reconocida aquí
        if let ExprKind::Call { func, args, kwargs } = &mut iter.kind {
            if matches!(&func.kind, ExprKind::Ident { name, .. } if name == "range")
                && !self.names.contains_key("range")
            {
                if vars.len() != 1 {
                    return self.fail(
                        SemanticError::NotIterable(Type::Int32),
                        span,
                    );
                }
                if !kwargs.is_empty() || args.is_empty() || args.len() > 3 {
                    return self.fail(
                        SemanticError::BadArity {
                            name: "range".to_owned(),
                            expected: 1,
                            found: args.len().max(kwargs.len()),
                        },
                        span,
                    );
                }

                for arg in args.iter_mut() {
                    self.value_expr(arg)?;
                    if !self.assignable(&Type::Int32, arg) {
                        return self.fail(
                            SemanticError::Mismatch {
                                expected: Type::Int32,
                                found: arg.ty.clone().unwrap_or(Type::Void),
                            },
                            arg.span,
                        );
                    }
                }

                let mut args = std::mem::take(args);
                let (start, stop, step) = match args.len() {
                    1 => (synth_int(0, span), args.remove(0), synth_int(1, span)),
                    2 => {
                        let stop = args.remove(1);
                        (args.remove(0), stop, synth_int(1, span))
                    }
                    _ => {
                        let step = args.remove(2);
                        let stop = args.remove(1);
                        (args.remove(0), stop, step)
                    }
                };

                let var = vars.into_iter().next().unwrap();
                let slot = self.new_slot(&var, Type::Int32);
                self.assigned.insert(slot);
                let bounds = (
                    self.hidden_slot("stop", Type::Int32),
                    self.hidden_slot("step", Type::Int32),
                );

                self.loop_depth += 1;
                let body = self.stmts(body)?;
                self.loop_depth -= 1;

                return Ok(Stmt::new(
                    StmtKind::ForRange {
                        var,
                        slot,
                        start,
                        stop,
                        step,
                        bounds,
                        body,
                    },
                    span,
                ));
            }
        }

        // Cualquier otro iterable debe tener layout de lista
        self.value_expr(&mut iter)?;
        let element = match iter.ty.as_ref().map(Type::strip) {
            Some(Type::List(element)) => (**element).clone(),
            other => {
                return self.fail(
                    SemanticError::NotIterable(other.cloned().unwrap_or(Type::Void)),
                    iter.span,
                )
            }
        };

        let cursor = (
            self.hidden_slot("idx", Type::Int32),
            self.hidden_slot("len", Type::Int32),
            self.hidden_slot("iter", Type::Ptr(Box::new(Type::Uint8))),
        );

        if vars.len() == 1 {
            let var = vars.into_iter().next().unwrap();
            let slot = self.new_slot(&var, element.clone());
            self.assigned.insert(slot);

            self.loop_depth += 1;
            let body = self.stmts(body)?;
            self.loop_depth -= 1;

            return Ok(Stmt::new(
                StmtKind::ForIter {
                    var,
                    slot,
                    iter,
                    cursor,
                    body,
                },
                span,
            ));
        }

        // Desempaquetado: los elementos deben ser tuplas de la misma
        // aridad que la lista de variables
        let element_types = match element.strip() {
            Type::Tuple(elements) if elements.len() == vars.len() => elements.clone(),
            other => return self.fail(SemanticError::NotIterable(other.clone()), iter.span),
        };

        let mut slots = Vec::with_capacity(vars.len());
        for (var, ty) in vars.iter().zip(&element_types) {
            let slot = self.new_slot(var, ty.clone());
            self.assigned.insert(slot);
            slots.push(slot);
        }

        self.loop_depth += 1;
        let body = self.stmts(body)?;
        self.loop_depth -= 1;

        Ok(Stmt::new(
            StmtKind::ForUnpack {
                vars,
                slots,
                iter,
                cursor,
                body,
            },
            span,
        ))
    }

    /// `match` sobre patrones simples se reduce a una cadena
    /// `if`/`elif` sobre un slot oculto.
    fn match_stmt(
        &mut self,
        scrutinee: Expr,
        arms: Vec<(Pattern, Vec<Stmt>)>,
        span: Span,
    ) -> Semantic<Stmt> {
        let holder = format!("<match{}>", self.hidden);
        self.hidden += 1;

        let decl = Stmt::new(
            StmtKind::VarDecl {
                name: holder.clone(),
                ty: Type::Int32, // se afina tras verificar el escrutinio
                value: Some(scrutinee),
                slot: None,
            },
            span,
        );

        // Primero se verifica la declaración para conocer el tipo real
        let decl = {
            let StmtKind::VarDecl { mut value, .. } = decl.kind else {
                unreachable!()
            };
            let init = value.as_mut().unwrap();
            self.value_expr(init)?;
            let scrutinee_ty = init.ty.clone().unwrap_or(Type::Void);
            let slot = self.new_slot(&holder, scrutinee_ty.clone());
            self.assigned.insert(slot);
            Stmt::new(
                StmtKind::VarDecl {
                    name: holder.clone(),
                    ty: scrutinee_ty,
                    value,
                    slot: Some(slot),
                },
                span,
            )
        };

        let (slot, scrutinee_ty) = match &decl.kind {
            StmtKind::VarDecl { slot, ty, .. } => (slot.unwrap(), ty.clone()),
            _ => unreachable!(),
        };

        let holder_expr = || {
            let mut expr = Expr::new(
                ExprKind::Ident {
                    name: holder.clone(),
                    binding: Some(Binding::Local(slot)),
                },
                span,
            );
            expr.ty = Some(scrutinee_ty.clone());
            expr
        };

        // Brazos con literal se comparan; un binding o `_` siempre
        // calza y vuelve terminal la cadena
        let mut branches: Vec<(Expr, Vec<Stmt>)> = Vec::new();
        let mut fallback: Option<Vec<Stmt>> = None;

        for (pattern, body) in arms {
            if fallback.is_some() {
                break;
            }

            match pattern {
                Pattern::Wildcard => {
                    fallback = Some(body);
                }
                Pattern::Binding(name) => {
                    let mut prefixed = vec![Stmt::new(
                        StmtKind::VarDecl {
                            name,
                            ty: scrutinee_ty.clone(),
                            value: Some(holder_expr()),
                            slot: None,
                        },
                        span,
                    )];
                    prefixed.extend(body);
                    fallback = Some(prefixed);
                }
                literal => {
                    let lit_expr = match literal {
                        Pattern::Int(value) => Expr::new(ExprKind::Int(value), span),
                        Pattern::Char(value) => Expr::new(ExprKind::Char(value), span),
                        Pattern::Str(value) => Expr::new(ExprKind::Str(value), span),
                        Pattern::Bool(value) => Expr::new(ExprKind::Bool(value), span),
                        Pattern::Wildcard | Pattern::Binding(_) => unreachable!(),
                    };

                    let cond = Expr::new(
                        ExprKind::Binary {
                            op: BinOp::Eq,
                            lhs: Box::new(holder_expr()),
                            rhs: Box::new(lit_expr),
                        },
                        span,
                    );
                    branches.push((cond, body));
                }
            }
        }

        let chain = if branches.is_empty() {
            match fallback {
                Some(body) => body,
                None => Vec::new(),
            }
        } else {
            let mut branches = branches.into_iter();
            let (cond, then) = branches.next().unwrap();
            vec![Stmt::new(
                StmtKind::If {
                    cond,
                    then,
                    elifs: branches.collect(),
                    otherwise: fallback,
                },
                span,
            )]
        };

        // La cadena construida se verifica como código ordinario; las
        // condiciones sintetizadas aún no tienen tipos
        let mut checked = vec![decl];
        for stmt in chain {
            checked.push(self.stmt(stmt)?);
        }

        // Un bloque `if` sintético envuelve la secuencia completa para
        // reinsertarla como una única sentencia
        let mut always = Expr::new(ExprKind::Bool(true), span);
        always.ty = Some(Type::Bool);
        Ok(Stmt::new(
            StmtKind::If {
                cond: always,
                then: checked,
                elifs: Vec::new(),
                otherwise: None,
            },
            span,
        ))
    }

    /// Condiciones aceptan `bool`, enteros y punteros; la comparación
    /// contra cero la decide el generador.
    fn condition(&mut self, cond: &mut Expr) -> Semantic<()> {
        self.value_expr(cond)?;
        let ty = cond.ty.clone().unwrap_or(Type::Void);
        match ty.strip() {
            Type::Bool | Type::Char => Ok(()),
            ty if ty.is_integer() && !ty.is_wide() => Ok(()),
            ty if ty.is_pointer() => Ok(()),
            Type::Optional(_) => Ok(()),
            _ => self.fail(
                SemanticError::Mismatch {
                    expected: Type::Bool,
                    found: ty,
                },
                cond.span,
            ),
        }
    }

    // ---------------------------------------------------------------
    // Expresiones
    // ---------------------------------------------------------------

    /// Verifica una expresión que debe producir un valor.
    fn value_expr(&mut self, expr: &mut Expr) -> Semantic<()> {
        self.expr(expr)?;
        match expr.ty.as_ref() {
            Some(Type::Void) => match &expr.kind {
                ExprKind::FString(_) => self.fail(SemanticError::FStringContext, expr.span),
                _ => self.fail(SemanticError::VoidValue, expr.span),
            },
            Some(_) => Ok(()),
            None => self.fail(SemanticError::VoidValue, expr.span),
        }
    }

    fn expr(&mut self, expr: &mut Expr) -> Semantic<()> {
        let span = expr.span;

        let ty: Type = match &mut expr.kind {
            ExprKind::Int(value) => {
                if i32::try_from(*value).is_ok() || u32::try_from(*value).is_ok() {
                    Type::Int32
                } else {
                    Type::Int64
                }
            }
            ExprKind::Float(_) => Type::Float32,
            ExprKind::Str(_) => Type::Str,
            ExprKind::Char(_) => Type::Char,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::NoneLit => Type::Ptr(Box::new(Type::Void)),

            ExprKind::FString(parts) => {
                for part in parts.iter_mut() {
                    if let FsPart::Expr(inner) = part {
                        self.value_expr(inner)?;
                        let inner_ty = inner.ty.clone().unwrap();
                        if !printable(&inner_ty) {
                            return self.fail(
                                SemanticError::Mismatch {
                                    expected: Type::Int32,
                                    found: inner_ty,
                                },
                                inner.span,
                            );
                        }
                    }
                }
                // El valor de una f-string es su efecto de impresión
                Type::Void
            }

            ExprKind::Ident { name, binding } => {
                let (resolved, ty) = self.resolve_name(name, span)?;
                *binding = Some(resolved);
                ty
            }

            ExprKind::Attr { base, name } => {
                // Un acceso `modulo.simbolo` se reduce al símbolo plano
                if let Some(symbol) = self.module_member(base, name) {
                    let ty = self.function_type(&symbol);
                    expr.kind = ExprKind::Ident {
                        name: symbol.clone(),
                        binding: Some(Binding::Func(symbol)),
                    };
                    expr.ty = Some(ty);
                    return Ok(());
                }

                self.value_expr(base)?;
                let base_ty = base.ty.clone().unwrap();
                self.field_type(&base_ty, name, span)?
            }

            ExprKind::Index { base, index } => {
                self.value_expr(base)?;
                self.value_expr(index)?;
                let base_ty = base.ty.clone().unwrap();

                match base_ty.strip() {
                    Type::Dict(key, value) => {
                        let key_ty = (**key).clone();
                        if !self.assignable(&key_ty, index) {
                            return self.fail(
                                SemanticError::Mismatch {
                                    expected: key_ty,
                                    found: index.ty.clone().unwrap_or(Type::Void),
                                },
                                index.span,
                            );
                        }
                        (**value).clone()
                    }

                    Type::Tuple(elements) => {
                        let position = match index.kind {
                            ExprKind::Int(position) => position,
                            _ => return self.fail(SemanticError::TupleIndex, index.span),
                        };
                        match elements.get(position as usize) {
                            Some(element) => element.clone(),
                            None => return self.fail(SemanticError::TupleIndex, index.span),
                        }
                    }

                    _ => {
                        self.integer_index(index)?;
                        match base_ty.element() {
                            Some(element) => element.clone(),
                            None => {
                                return self.fail(SemanticError::NotIndexable(base_ty), span)
                            }
                        }
                    }
                }
            }

            ExprKind::Slice {
                base,
                start,
                stop,
                step,
            } => {
                self.value_expr(base)?;
                let base_ty = base.ty.clone().unwrap();
                if !is_string(&base_ty) {
                    return self.fail(SemanticError::BadSlice, span);
                }

                for bound in [start, stop, step].into_iter().flatten() {
                    self.value_expr(bound)?;
                    self.integer_index(bound)?;
                }

                Type::Str
            }

            ExprKind::MethodCall { .. } => return self.method_call(expr),

            ExprKind::Call { .. } => return self.call(expr),

            ExprKind::Unary { op, operand } => {
                self.value_expr(operand)?;
                let operand_ty = operand.ty.clone().unwrap();

                match op {
                    UnaryOp::Not => {
                        if !matches!(operand_ty.strip(), Type::Bool) {
                            return self.fail(
                                SemanticError::BadUnary {
                                    op: "not",
                                    ty: operand_ty,
                                },
                                span,
                            );
                        }
                        Type::Bool
                    }
                    UnaryOp::Neg => {
                        if operand_ty.is_float() {
                            return self.fail(
                                SemanticError::FloatArithmetic(operand_ty),
                                span,
                            );
                        }
                        if !operand_ty.is_signed() {
                            return self.fail(
                                SemanticError::BadUnary {
                                    op: "-",
                                    ty: operand_ty,
                                },
                                span,
                            );
                        }
                        operand_ty
                    }
                    UnaryOp::BitNot => {
                        if !operand_ty.is_integer() {
                            return self.fail(
                                SemanticError::BadUnary {
                                    op: "~",
                                    ty: operand_ty,
                                },
                                span,
                            );
                        }
                        operand_ty
                    }
                }
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                self.value_expr(lhs)?;
                self.value_expr(rhs)?;

                // La igualdad de cadenas compara contenido, no
                // direcciones
                if matches!(op, BinOp::Eq | BinOp::Ne)
                    && is_string(lhs.ty.as_ref().unwrap())
                    && is_string(rhs.ty.as_ref().unwrap())
                {
                    let lhs = (**lhs).clone();
                    let rhs = (**rhs).clone();
                    let cmp = synth_call(
                        "__pynux_strcmp",
                        vec![lhs, rhs],
                        Type::Int32,
                        span,
                    );
                    let mut zero = synth_int(0, span);
                    zero.ty = Some(Type::Int32);
                    expr.kind = ExprKind::Binary {
                        op,
                        lhs: Box::new(cmp),
                        rhs: Box::new(zero),
                    };
                    expr.ty = Some(Type::Bool);
                    return Ok(());
                }

                let hint = Type::Void;
                self.binary_type(op, lhs, rhs, span, &hint)?
            }

            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                self.condition(cond)?;
                self.value_expr(then)?;
                self.value_expr(otherwise)?;

                let then_ty = then.ty.clone().unwrap();
                if self.assignable(&then_ty, otherwise) {
                    then_ty
                } else {
                    let other_ty = otherwise.ty.clone().unwrap();
                    if self.assignable(&other_ty, then) {
                        other_ty
                    } else {
                        return self.fail(
                            SemanticError::Mismatch {
                                expected: then_ty,
                                found: other_ty,
                            },
                            span,
                        );
                    }
                }
            }

            ExprKind::AddressOf(operand) => {
                self.value_expr(operand)?;
                if !is_lvalue(operand) {
                    return self.fail(SemanticError::NotAddressable, span);
                }
                Type::Ptr(Box::new(operand.ty.clone().unwrap()))
            }

            ExprKind::Deref(operand) => {
                self.value_expr(operand)?;
                let operand_ty = operand.ty.clone().unwrap();
                match operand_ty.strip() {
                    Type::Ptr(inner) => (**inner).clone(),
                    Type::Str => Type::Char,
                    _ => return self.fail(SemanticError::NotIndexable(operand_ty), span),
                }
            }

            ExprKind::Cast { ty, expr: inner } => {
                self.module.resolve_type(ty, span)?;
                self.value_expr(inner)?;
                // `cast` es deliberadamente incondicional
                ty.clone()
            }

            ExprKind::Sizeof(ty) => {
                self.module.resolve_type(ty, span)?;
                Type::Int32
            }

            ExprKind::Lambda { .. } => {
                return self.fail(SemanticError::LambdasUnsupported, span)
            }

            ExprKind::ListLit(elements) => {
                let mut element_ty: Option<Type> = None;
                for element in elements.iter_mut() {
                    self.value_expr(element)?;
                    match &element_ty {
                        None => element_ty = element.ty.clone(),
                        Some(ty) => {
                            let ty = ty.clone();
                            if !self.assignable(&ty, element) {
                                return self.fail(
                                    SemanticError::Mismatch {
                                        expected: ty,
                                        found: element.ty.clone().unwrap_or(Type::Void),
                                    },
                                    element.span,
                                );
                            }
                        }
                    }
                }
                Type::List(Box::new(element_ty.unwrap_or(Type::Int32)))
            }

            ExprKind::DictLit(pairs) => {
                let mut key_ty: Option<Type> = None;
                let mut value_ty: Option<Type> = None;

                for (key, value) in pairs.iter_mut() {
                    self.value_expr(key)?;
                    self.value_expr(value)?;

                    if !is_const_expr(key) || !is_const_expr(value) {
                        return self.fail(SemanticError::NonConstDict, span);
                    }

                    let this_key = key.ty.clone().unwrap();
                    if !matches!(this_key.strip(), Type::Str)
                        && !(this_key.is_integer() && !this_key.is_wide())
                    {
                        return self.fail(
                            SemanticError::Mismatch {
                                expected: Type::Int32,
                                found: this_key,
                            },
                            key.span,
                        );
                    }

                    match &key_ty {
                        None => key_ty = key.ty.clone(),
                        Some(ty) => {
                            let ty = ty.clone();
                            if !self.assignable(&ty, key) {
                                return self.fail(
                                    SemanticError::Mismatch {
                                        expected: ty,
                                        found: key.ty.clone().unwrap_or(Type::Void),
                                    },
                                    key.span,
                                );
                            }
                        }
                    }
                    match &value_ty {
                        None => value_ty = value.ty.clone(),
                        Some(ty) => {
                            let ty = ty.clone();
                            if !self.assignable(&ty, value) {
                                return self.fail(
                                    SemanticError::Mismatch {
                                        expected: ty,
                                        found: value.ty.clone().unwrap_or(Type::Void),
                                    },
                                    value.span,
                                );
                            }
                        }
                    }
                }

                Type::Dict(
                    Box::new(key_ty.unwrap_or(Type::Int32)),
                    Box::new(value_ty.unwrap_or(Type::Int32)),
                )
            }

            ExprKind::TupleLit(elements) => {
                let mut types = Vec::with_capacity(elements.len());
                for element in elements.iter_mut() {
                    self.value_expr(element)?;
                    let ty = element.ty.clone().unwrap();
                    if ty.size_of(&self.module.layouts) > 4 {
                        return self.fail(SemanticError::TupleElement, element.span);
                    }
                    types.push(ty);
                }
                Type::Tuple(types)
            }

            ExprKind::StructLit { .. } => {
                return self.fail(SemanticError::StructLitContext, span)
            }

            ExprKind::Comp {
                element,
                var,
                iter,
                cond,
                slots,
            } => {
                // Solo comprensiones sobre `range(…)`
                let range_ok = matches!(
                    &iter.kind,
                    ExprKind::Call { func, .. }
                        if matches!(&func.kind, ExprKind::Ident { name, .. } if name == "range")
                );
                if !range_ok {
                    return self.fail(SemanticError::RangeOutsideFor, iter.span);
                }

                if let ExprKind::Call { args, .. } = &mut iter.kind {
                    if args.is_empty() || args.len() > 3 {
                        return self.fail(
                            SemanticError::BadArity {
                                name: "range".to_owned(),
                                expected: 1,
                                found: args.len(),
                            },
                            iter.span,
                        );
                    }
                    for arg in args.iter_mut() {
                        self.value_expr(arg)?;
                    }
                    // El generador pliega el paso como constante
                    if let Some(step) = args.get(2) {
                        if !literal_int(step) {
                            return self.fail(SemanticError::CompStep, step.span);
                        }
                    }
                }
                iter.ty = Some(Type::Void);

                let var_slot = self.new_slot(var, Type::Int32);
                self.assigned.insert(var_slot);
                let end_slot = self.hidden_slot("compend", Type::Int32);
                *slots = Some((var_slot, end_slot));

                self.value_expr(element)?;
                if let Some(cond) = cond {
                    self.condition(cond)?;
                }

                Type::List(Box::new(element.ty.clone().unwrap()))
            }

            ExprKind::Asm(_) => Type::Int32,

            ExprKind::Intrinsic { .. } => {
                unreachable!("intrinsics are produced, not consumed, by the checker")
            }
        };

        expr.ty = Some(ty);
        Ok(())
    }

    fn integer_index(&mut self, index: &mut Expr) -> Semantic<()> {
        let ty = index.ty.clone().unwrap_or(Type::Void);
        if (ty.is_integer() && !ty.is_wide()) || matches!(ty.strip(), Type::Char) {
            Ok(())
        } else {
            self.fail(
                SemanticError::Mismatch {
                    expected: Type::Int32,
                    found: ty,
                },
                index.span,
            )
        }
    }

    fn resolve_name(&self, name: &str, span: Span) -> Semantic<(Binding, Type)> {
        if let Some(&slot) = self.names.get(name) {
            if !self.assigned.contains(&slot) {
                return self.fail(SemanticError::UninitializedLocal(name.to_owned()), span);
            }
            return Ok((Binding::Local(slot), self.slots[slot as usize].ty.clone()));
        }

        if let Some(ty) = self.module.globals.get(name) {
            return Ok((Binding::Global(name.to_owned()), ty.clone()));
        }

        if self.module.functions.contains_key(name) {
            return Ok((Binding::Func(name.to_owned()), self.function_type(name)));
        }

        // Bajo un `from x import *` cualquier nombre puede venir de
        // otra unidad; se registra el símbolo y el linker decide
        if self.module.star_import {
            return Ok((Binding::Func(name.to_owned()), Type::Int32));
        }

        self.fail(SemanticError::Undefined(name.to_owned()), span)
    }

    fn function_type(&self, name: &str) -> Type {
        match self.module.functions.get(name) {
            Some(FnSig {
                params: Some(params),
                ret,
            }) => Type::Fn {
                ret: Box::new(ret.clone()),
                params: params.iter().map(|param| param.ty.clone()).collect(),
            },
            Some(FnSig { params: None, ret }) => Type::Fn {
                ret: Box::new(ret.clone()),
                params: Vec::new(),
            },
            None => Type::Fn {
                ret: Box::new(Type::Int32),
                params: Vec::new(),
            },
        }
    }

    /// Reconoce `alias.simbolo` y `modulo.sub.simbolo`.
    fn module_member(&self, base: &Expr, name: &str) -> Option<String> {
        fn path_of(expr: &Expr) -> Option<String> {
            match &expr.kind {
                ExprKind::Ident { name, .. } => Some(name.clone()),
                ExprKind::Attr { base, name } => {
                    Some(format!("{}.{}", path_of(base)?, name))
                }
                _ => None,
            }
        }

        let path = path_of(base)?;
        if self.module.modules.contains(&path) {
            Some(name.to_owned())
        } else {
            None
        }
    }

    fn field_type(&self, base_ty: &Type, name: &str, span: Span) -> Semantic<Type> {
        let struct_name = match base_ty.strip() {
            Type::Named(struct_name) => struct_name.clone(),
            Type::Ptr(inner) => match inner.strip() {
                Type::Named(struct_name) => struct_name.clone(),
                _ => {
                    return self.fail(
                        SemanticError::UnknownField {
                            ty: base_ty.to_string(),
                            name: name.to_owned(),
                        },
                        span,
                    )
                }
            },
            _ => {
                return self.fail(
                    SemanticError::UnknownField {
                        ty: base_ty.to_string(),
                        name: name.to_owned(),
                    },
                    span,
                )
            }
        };

        let layout = self.module.layouts.get(&struct_name).ok_or_else(|| {
            Located::at(SemanticError::NotAStruct(struct_name.clone()), span)
        })?;

        match layout.field(name) {
            Some(field) => Ok(field.ty.clone()),
            None => self.fail(
                SemanticError::UnknownField {
                    ty: struct_name,
                    name: name.to_owned(),
                },
                span,
            ),
        }
    }

    /// Tipa y, si el objetivo es un lvalue válido, devuelve su tipo.
    fn lvalue(&mut self, target: &mut Expr) -> Semantic<Type> {
        match &target.kind {
            ExprKind::Ident { .. }
            | ExprKind::Index { .. }
            | ExprKind::Attr { .. }
            | ExprKind::Deref(_) => {
                self.value_expr(target)?;

                // Un almacén con llave de cadena no existe en el ABI
                if let ExprKind::Index { base, .. } = &target.kind {
                    if let Some(Type::Dict(key, _)) = base.ty.as_ref().map(Type::strip) {
                        if matches!(key.strip(), Type::Str) {
                            return self.fail(SemanticError::DictSetStr, target.span);
                        }
                    }
                }

                Ok(target.ty.clone().unwrap())
            }
            _ => self.fail(SemanticError::NotAssignable, target.span),
        }
    }

    fn struct_literal(&mut self, init: &mut Expr, target: &Type) -> Semantic<()> {
        let span = init.span;
        let ExprKind::StructLit { name, fields } = &mut init.kind else {
            unreachable!()
        };

        let target_name = match target.strip() {
            Type::Named(target_name) => target_name.clone(),
            _ => return self.fail(SemanticError::StructLitContext, span),
        };
        if *name != target_name {
            return self.fail(
                SemanticError::Mismatch {
                    expected: target.clone(),
                    found: Type::Named(name.clone()),
                },
                span,
            );
        }

        let layout = self
            .module
            .layouts
            .get(&target_name)
            .cloned()
            .ok_or_else(|| Located::at(SemanticError::NotAStruct(target_name.clone()), span))?;

        for (field_name, value) in fields.iter_mut() {
            let field = layout.field(field_name).ok_or_else(|| {
                Located::at(
                    SemanticError::UnknownField {
                        ty: target_name.clone(),
                        name: field_name.clone(),
                    },
                    span,
                )
            })?;

            self.value_expr(value)?;
            if !self.assignable(&field.ty, value) {
                return self.fail(
                    SemanticError::Mismatch {
                        expected: field.ty.clone(),
                        found: value.ty.clone().unwrap_or(Type::Void),
                    },
                    value.span,
                );
            }
        }

        init.ty = Some(Type::Named(target_name));
        Ok(())
    }

    // ---------------------------------------------------------------
    // Llamadas
    // ---------------------------------------------------------------

    fn method_call(&mut self, expr: &mut Expr) -> Semantic<()> {
        let span = expr.span;
        let ExprKind::MethodCall { base, name, args } = &mut expr.kind else {
            unreachable!()
        };

        // `alias.simbolo(args)` es una llamada plana
        if let ExprKind::Ident { name: base_name, .. } = &base.kind {
            if self.module.modules.contains(base_name) {
                let symbol = name.clone();
                let args = std::mem::take(args);
                let mut call = Expr::new(
                    ExprKind::Call {
                        func: Box::new(Expr::new(
                            ExprKind::Ident {
                                name: symbol,
                                binding: None,
                            },
                            span,
                        )),
                        args,
                        kwargs: Vec::new(),
                    },
                    span,
                );
                self.call(&mut call)?;
                *expr = call;
                return Ok(());
            }
        }

        self.value_expr(base)?;
        let base_ty = base.ty.clone().unwrap();

        // Métodos de cadena → familia `__pynux_str_*`
        if is_string(&base_ty) {
            if let Some((symbol, extra, ret)) = string_method(name) {
                if args.len() != extra {
                    return self.fail(
                        SemanticError::BadArity {
                            name: name.clone(),
                            expected: extra,
                            found: args.len(),
                        },
                        span,
                    );
                }

                let mut call_args = vec![(**base).clone()];
                for arg in args.iter_mut() {
                    self.value_expr(arg)?;
                    call_args.push(arg.clone());
                }

                *expr = synth_call(symbol, call_args, ret, span);
                return Ok(());
            }

            return self.fail(
                SemanticError::UnknownMethod {
                    ty: base_ty,
                    name: name.clone(),
                },
                span,
            );
        }

        // Métodos de clase → `Clase_metodo(self, …)`
        let class_name = match base_ty.strip() {
            Type::Named(class_name) => Some(class_name.clone()),
            Type::Ptr(inner) => match inner.strip() {
                Type::Named(class_name) => Some(class_name.clone()),
                _ => None,
            },
            _ => None,
        };

        if let Some(class_name) = class_name {
            let symbol = format!("{}_{}", class_name, name);
            if self.module.functions.contains_key(&symbol) {
                let self_arg = if matches!(base_ty.strip(), Type::Named(_)) {
                    let mut addr = Expr::new(ExprKind::AddressOf(base.clone()), base.span);
                    addr.ty = Some(Type::Ptr(Box::new(base_ty.clone())));
                    addr
                } else {
                    (**base).clone()
                };

                let mut call_args = vec![self_arg];
                call_args.append(args);

                let mut call = Expr::new(
                    ExprKind::Call {
                        func: Box::new(Expr::new(
                            ExprKind::Ident {
                                name: symbol,
                                binding: None,
                            },
                            span,
                        )),
                        args: call_args,
                        kwargs: Vec::new(),
                    },
                    span,
                );
                self.call(&mut call)?;
                *expr = call;
                return Ok(());
            }
        }

        // Último recurso: una función libre con el objeto como primer
        // argumento
        if self.module.functions.contains_key(name.as_str()) {
            let mut call_args = vec![(**base).clone()];
            call_args.append(args);

            let mut call = Expr::new(
                ExprKind::Call {
                    func: Box::new(Expr::new(
                        ExprKind::Ident {
                            name: name.clone(),
                            binding: None,
                        },
                        span,
                    )),
                    args: call_args,
                    kwargs: Vec::new(),
                },
                span,
            );
            self.call(&mut call)?;
            *expr = call;
            return Ok(());
        }

        self.fail(
            SemanticError::UnknownMethod {
                ty: base_ty,
                name: name.clone(),
            },
            span,
        )
    }

    fn call(&mut self, expr: &mut Expr) -> Semantic<()> {
        let span = expr.span;
        let ExprKind::Call { func, args, kwargs } = &mut expr.kind else {
            unreachable!()
        };

        // Los nombres intrínsecos resuelven antes que todo lo demás,
        // salvo que una local los oculte
        if let ExprKind::Ident { name, .. } = &func.kind {
            if !self.names.contains_key(name) && is_intrinsic(name) {
                if !kwargs.is_empty() {
                    return self.fail(
                        SemanticError::UnknownKwarg {
                            name: kwargs[0].0.clone(),
                            func: name.clone(),
                        },
                        span,
                    );
                }

                let name = name.clone();
                let mut taken = std::mem::take(args);
                let ty = self.intrinsic(&name, &mut taken, span)?;
                expr.kind = ExprKind::Intrinsic { name, args: taken };
                expr.ty = Some(ty);
                return Ok(());
            }
        }

        // Resolución del destino: función conocida o puntero a función
        let (symbol, sig): (Option<String>, Option<FnSig>) = match &mut func.kind {
            ExprKind::Ident { name, binding } => {
                if self.names.contains_key(name.as_str()) {
                    self.value_expr(func)?;
                    (None, None)
                } else {
                    let (resolved, ty) = self.resolve_name(name, span)?;
                    *binding = Some(resolved.clone());
                    func.ty = Some(ty);
                    match resolved {
                        Binding::Func(symbol) => {
                            let sig = self.module.functions.get(&symbol).cloned();
                            (Some(symbol), sig)
                        }
                        _ => (None, None),
                    }
                }
            }
            _ => {
                self.value_expr(func)?;
                (None, None)
            }
        };

        // Llamada indirecta a través de un valor `Fn[…]`
        if symbol.is_none() {
            let func_ty = func.ty.clone().unwrap_or(Type::Void);
            let Type::Fn { ret, params } = func_ty.strip().clone() else {
                return self.fail(SemanticError::NotCallable(func_ty), span);
            };

            if !kwargs.is_empty() {
                return self.fail(
                    SemanticError::UnknownKwarg {
                        name: kwargs[0].0.clone(),
                        func: "function pointer".to_owned(),
                    },
                    span,
                );
            }
            if args.len() != params.len() {
                return self.fail(
                    SemanticError::BadArity {
                        name: "function pointer".to_owned(),
                        expected: params.len(),
                        found: args.len(),
                    },
                    span,
                );
            }
            for (arg, param_ty) in args.iter_mut().zip(&params) {
                self.value_expr(arg)?;
                if !self.assignable(param_ty, arg) {
                    return self.fail(
                        SemanticError::Mismatch {
                            expected: param_ty.clone(),
                            found: arg.ty.clone().unwrap_or(Type::Void),
                        },
                        arg.span,
                    );
                }
            }

            expr.ty = Some(*ret);
            return Ok(());
        }

        let symbol = symbol.unwrap();
        let Some(sig) = sig else {
            // Símbolo importado sin firma: los argumentos viajan por
            // AAPCS sin verificación
            for arg in args.iter_mut() {
                self.value_expr(arg)?;
            }
            expr.ty = Some(Type::Int32);
            return Ok(());
        };

        match sig.params {
            None => {
                for arg in args.iter_mut() {
                    self.value_expr(arg)?;
                }
                if !kwargs.is_empty() {
                    for (_, value) in kwargs.iter_mut() {
                        self.value_expr(value)?;
                    }
                }
                expr.ty = Some(sig.ret);
                Ok(())
            }

            Some(params) => {
                // Los kwargs y los defaults se reducen a posicionales
                let mut filled: Vec<Option<Expr>> = vec![None; params.len()];
                if args.len() > params.len() {
                    return self.fail(
                        SemanticError::BadArity {
                            name: symbol,
                            expected: params.len(),
                            found: args.len(),
                        },
                        span,
                    );
                }

                for (index, arg) in std::mem::take(args).into_iter().enumerate() {
                    filled[index] = Some(arg);
                }

                for (kw_name, kw_value) in std::mem::take(kwargs) {
                    let position = params.iter().position(|param| param.name == kw_name);
                    match position {
                        Some(position) if filled[position].is_none() => {
                            filled[position] = Some(kw_value);
                        }
                        _ => {
                            return self.fail(
                                SemanticError::UnknownKwarg {
                                    name: kw_name,
                                    func: symbol,
                                },
                                span,
                            )
                        }
                    }
                }

                let mut final_args = Vec::with_capacity(params.len());
                for (slot, param) in filled.into_iter().zip(&params) {
                    match slot {
                        Some(arg) => final_args.push(arg),
                        None => match &param.default {
                            Some(default) => final_args.push(default.clone()),
                            None => {
                                return self.fail(
                                    SemanticError::BadArity {
                                        name: symbol,
                                        expected: params.len(),
                                        found: final_args.len(),
                                    },
                                    span,
                                )
                            }
                        },
                    }
                }

                for (arg, param) in final_args.iter_mut().zip(&params) {
                    self.value_expr(arg)?;
                    if !self.assignable(&param.ty, arg) {
                        return self.fail(
                            SemanticError::Mismatch {
                                expected: param.ty.clone(),
                                found: arg.ty.clone().unwrap_or(Type::Void),
                            },
                            arg.span,
                        );
                    }
                }

                *args = final_args;
                expr.ty = Some(sig.ret);
                Ok(())
            }
        }
    }

    // ---------------------------------------------------------------
    // Intrínsecos
    // ---------------------------------------------------------------

    fn require_v7(&self, name: &str, span: Span) -> Semantic<()> {
        if self.module.arch.has_v7_ops() {
            Ok(())
        } else {
            self.fail(
                SemanticError::TargetMissing {
                    name: name.to_owned(),
                    arch: self.module.arch,
                },
                span,
            )
        }
    }

    fn arity(&self, name: &str, args: &[Expr], expected: usize, span: Span) -> Semantic<()> {
        if args.len() == expected {
            Ok(())
        } else {
            self.fail(
                SemanticError::BadArity {
                    name: name.to_owned(),
                    expected,
                    found: args.len(),
                },
                span,
            )
        }
    }

    fn int_args(&mut self, args: &mut [Expr]) -> Semantic<()> {
        for arg in args.iter_mut() {
            let ty = arg.ty.clone().unwrap_or(Type::Void);
            if !(ty.is_integer() && !ty.is_wide()) && !matches!(ty.strip(), Type::Char | Type::Bool)
            {
                return self.fail(
                    SemanticError::Mismatch {
                        expected: Type::Int32,
                        found: ty,
                    },
                    arg.span,
                );
            }
        }
        Ok(())
    }

    fn intrinsic(&mut self, name: &str, args: &mut Vec<Expr>, span: Span) -> Semantic<Type> {
        // `print` admite f-strings; todo lo demás exige valores
        if name == "print" {
            for arg in args.iter_mut() {
                self.expr(arg)?;
                let ty = arg.ty.clone().unwrap_or(Type::Void);
                if !matches!(arg.kind, ExprKind::FString(_)) && !printable(&ty) {
                    return self.fail(
                        SemanticError::Mismatch {
                            expected: Type::Int32,
                            found: ty,
                        },
                        arg.span,
                    );
                }
            }
            return Ok(Type::Void);
        }

        for arg in args.iter_mut() {
            self.value_expr(arg)?;
        }

        match name {
            "range" => self.fail(SemanticError::RangeOutsideFor, span),

            "len" => {
                self.arity(name, args, 1, span)?;
                let ty = args[0].ty.clone().unwrap();
                match ty.strip() {
                    Type::Str | Type::Array(_, _) | Type::List(_) => Ok(Type::Int32),
                    Type::Ptr(inner) if **inner == Type::Char => Ok(Type::Int32),
                    _ => self.fail(SemanticError::NotIterable(ty), span),
                }
            }

            "ord" => {
                self.arity(name, args, 1, span)?;
                let ty = args[0].ty.clone().unwrap();
                match ty.strip() {
                    Type::Char | Type::Str => Ok(Type::Int32),
                    Type::Ptr(inner) if **inner == Type::Char => Ok(Type::Int32),
                    _ => self.fail(
                        SemanticError::Mismatch {
                            expected: Type::Char,
                            found: ty,
                        },
                        span,
                    ),
                }
            }

            "chr" => {
                self.arity(name, args, 1, span)?;
                self.int_args(args)?;
                Ok(Type::Char)
            }

            "abs" => {
                self.arity(name, args, 1, span)?;
                let ty = args[0].ty.clone().unwrap();
                if !ty.is_signed() || ty.is_wide() {
                    return self.fail(
                        SemanticError::BadUnary {
                            op: "abs",
                            ty,
                        },
                        span,
                    );
                }
                Ok(ty)
            }

            "min" | "max" => {
                if args.len() < 2 {
                    return self.fail(
                        SemanticError::BadArity {
                            name: name.to_owned(),
                            expected: 2,
                            found: args.len(),
                        },
                        span,
                    );
                }
                self.int_args(args)?;
                Ok(args[0].ty.clone().unwrap())
            }

            "input" => {
                if args.len() > 1 {
                    return self.fail(
                        SemanticError::BadArity {
                            name: name.to_owned(),
                            expected: 1,
                            found: args.len(),
                        },
                        span,
                    );
                }
                if let Some(prompt) = args.first() {
                    if !is_string(prompt.ty.as_ref().unwrap()) {
                        return self.fail(
                            SemanticError::Mismatch {
                                expected: Type::Str,
                                found: prompt.ty.clone().unwrap(),
                            },
                            prompt.span,
                        );
                    }
                }
                Ok(Type::Str)
            }

            "dmb" | "dsb" | "isb" | "wfi" | "wfe" | "sev" | "clrex" => {
                self.arity(name, args, 0, span)?;
                Ok(Type::Void)
            }

            "clz" | "rbit" => {
                self.require_v7(name, span)?;
                self.arity(name, args, 1, span)?;
                self.int_args(args)?;
                Ok(Type::Int32)
            }

            "rev" | "rev16" => {
                self.arity(name, args, 1, span)?;
                self.int_args(args)?;
                Ok(Type::Int32)
            }

            "critical_enter" => {
                self.arity(name, args, 0, span)?;
                Ok(Type::Int32)
            }

            "critical_exit" => {
                self.arity(name, args, 1, span)?;
                self.int_args(args)?;
                Ok(Type::Void)
            }

            "atomic_load" => {
                self.arity(name, args, 1, span)?;
                self.pointer_arg(&args[0])?;
                Ok(Type::Int32)
            }

            "atomic_store" => {
                self.arity(name, args, 2, span)?;
                self.pointer_arg(&args[0])?;
                Ok(Type::Void)
            }

            "atomic_add" | "atomic_sub" => {
                self.require_v7(name, span)?;
                self.arity(name, args, 2, span)?;
                self.pointer_arg(&args[0])?;
                Ok(Type::Int32)
            }

            "atomic_cas" => {
                self.require_v7(name, span)?;
                self.arity(name, args, 3, span)?;
                self.pointer_arg(&args[0])?;
                Ok(Type::Bool)
            }

            "bit_set" | "bit_clear" | "bit_toggle" => {
                self.arity(name, args, 2, span)?;
                self.int_args(args)?;
                Ok(args[0].ty.clone().unwrap())
            }

            "bit_test" => {
                self.arity(name, args, 2, span)?;
                self.int_args(args)?;
                Ok(Type::Bool)
            }

            "bits_get" => {
                self.arity(name, args, 3, span)?;
                self.int_args(args)?;
                Ok(Type::Int32)
            }

            "bits_set" => {
                self.arity(name, args, 4, span)?;
                self.int_args(args)?;
                Ok(Type::Int32)
            }

            _ => unreachable!("unhandled intrinsic `{}`", name),
        }
    }

    fn pointer_arg(&self, arg: &Expr) -> Semantic<()> {
        let ty = arg.ty.clone().unwrap_or(Type::Void);
        if ty.is_pointer() {
            Ok(())
        } else {
            self.fail(
                SemanticError::Mismatch {
                    expected: Type::Ptr(Box::new(Type::Int32)),
                    found: ty,
                },
                arg.span,
            )
        }
    }

    // ---------------------------------------------------------------
    // Tipado de operadores y asignabilidad
    // ---------------------------------------------------------------

    fn binary_type(
        &mut self,
        op: BinOp,
        lhs: &mut Expr,
        rhs: &mut Expr,
        span: Span,
        _hint: &Type,
    ) -> Semantic<Type> {
        let lhs_ty = lhs.ty.clone().unwrap();
        let rhs_ty = rhs.ty.clone().unwrap();

        let operands = |lhs: &Type, rhs: &Type| SemanticError::BadOperands {
            op,
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        };

        if lhs_ty.is_float() || rhs_ty.is_float() {
            return self.fail(SemanticError::FloatArithmetic(lhs_ty.clone()), span);
        }

        match op {
            BinOp::And | BinOp::Or => {
                if matches!(lhs_ty.strip(), Type::Bool) && matches!(rhs_ty.strip(), Type::Bool) {
                    Ok(Type::Bool)
                } else {
                    self.fail(operands(&lhs_ty, &rhs_ty), span)
                }
            }

            BinOp::In | BinOp::NotIn => {
                let ok = matches!(lhs_ty.strip(), Type::Char) && is_string(&rhs_ty);
                if ok {
                    Ok(Type::Bool)
                } else {
                    self.fail(operands(&lhs_ty, &rhs_ty), span)
                }
            }

            BinOp::Is | BinOp::IsNot => {
                if (lhs_ty.is_pointer() || matches!(lhs_ty.strip(), Type::Optional(_)))
                    && (rhs_ty.is_pointer() || matches!(rhs_ty.strip(), Type::Optional(_)))
                {
                    Ok(Type::Bool)
                } else {
                    self.fail(operands(&lhs_ty, &rhs_ty), span)
                }
            }

            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                // `p == None` y simétricos
                if matches!(op, BinOp::Eq | BinOp::Ne) {
                    let none_l = matches!(lhs.kind, ExprKind::NoneLit);
                    let none_r = matches!(rhs.kind, ExprKind::NoneLit);
                    if (none_l
                        && (rhs_ty.is_pointer() || matches!(rhs_ty.strip(), Type::Optional(_))))
                        || (none_r
                            && (lhs_ty.is_pointer()
                                || matches!(lhs_ty.strip(), Type::Optional(_))))
                    {
                        return Ok(Type::Bool);
                    }
                }

                if lhs_ty.is_pointer() && lhs_ty.strip() == rhs_ty.strip() {
                    return Ok(Type::Bool);
                }

                if matches!(lhs_ty.strip(), Type::Bool) && matches!(rhs_ty.strip(), Type::Bool) {
                    return Ok(Type::Bool);
                }

                if matches!(lhs_ty.strip(), Type::Char) && matches!(rhs_ty.strip(), Type::Char) {
                    return Ok(Type::Bool);
                }

                match self.unify_arith(lhs, rhs) {
                    Some(_) => Ok(Type::Bool),
                    None => self.fail(operands(&lhs_ty, &rhs_ty), span),
                }
            }

            BinOp::Add | BinOp::Sub => {
                // Aritmética de punteros, escalada por el generador
                if lhs_ty.is_pointer() {
                    if rhs_ty.is_integer() && !rhs_ty.is_wide() {
                        return Ok(lhs_ty);
                    }
                    if op == BinOp::Sub && lhs_ty.strip() == rhs_ty.strip() {
                        return Ok(Type::Int32);
                    }
                    return self.fail(operands(&lhs_ty, &rhs_ty), span);
                }
                if matches!(lhs_ty.strip(), Type::Array(_, _)) {
                    // El arreglo decae a puntero a su primer elemento
                    if rhs_ty.is_integer() && !rhs_ty.is_wide() {
                        let element = lhs_ty.element().cloned().unwrap_or(Type::Uint8);
                        return Ok(Type::Ptr(Box::new(element)));
                    }
                    return self.fail(operands(&lhs_ty, &rhs_ty), span);
                }

                match self.unify_arith(lhs, rhs) {
                    Some(unified) => Ok(unified),
                    None => self.fail(operands(&lhs_ty, &rhs_ty), span),
                }
            }

            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => match self.unify_arith(lhs, rhs) {
                Some(unified) => Ok(unified),
                None => self.fail(operands(&lhs_ty, &rhs_ty), span),
            },

            BinOp::Mul
            | BinOp::Div
            | BinOp::IntDiv
            | BinOp::Mod
            | BinOp::Pow
            | BinOp::Shl
            | BinOp::Shr => match self.unify_arith(lhs, rhs) {
                Some(unified) => {
                    if unified.is_wide() {
                        self.fail(SemanticError::WideOperation(op), span)
                    } else {
                        Ok(unified)
                    }
                }
                None => self.fail(operands(&lhs_ty, &rhs_ty), span),
            },
        }
    }

    /// Unifica dos operandos enteros: misma signedness, el menor se
    /// ensancha al mayor; un literal adopta el tipo del otro lado.
    fn unify_arith(&mut self, lhs: &mut Expr, rhs: &mut Expr) -> Option<Type> {
        let lhs_ty = lhs.ty.clone().unwrap();
        let rhs_ty = rhs.ty.clone().unwrap();

        if !lhs_ty.is_integer() && !literal_int(lhs) {
            return None;
        }
        if !rhs_ty.is_integer() && !literal_int(rhs) {
            return None;
        }

        if lhs_ty.strip() == rhs_ty.strip() {
            return Some(lhs_ty.strip().clone());
        }

        // Un literal se pliega al tipo del operando contrario
        if literal_int(lhs) && rhs_ty.is_integer() {
            if self.coerce_literal(lhs, &rhs_ty) {
                return Some(rhs_ty.strip().clone());
            }
        }
        if literal_int(rhs) && lhs_ty.is_integer() {
            if self.coerce_literal(rhs, &lhs_ty) {
                return Some(lhs_ty.strip().clone());
            }
        }

        if lhs_ty.is_integer()
            && rhs_ty.is_integer()
            && lhs_ty.is_signed() == rhs_ty.is_signed()
        {
            let lhs_size = lhs_ty.size_of(&self.module.layouts);
            let rhs_size = rhs_ty.size_of(&self.module.layouts);
            let unified = if lhs_size >= rhs_size {
                lhs_ty.strip().clone()
            } else {
                rhs_ty.strip().clone()
            };

            // El operando angosto se extiende explícitamente al
            // cruzar a 64 bits
            self.insert_widening(lhs, &unified);
            self.insert_widening(rhs, &unified);
            return Some(unified);
        }

        None
    }

    /// Envuelve un valor de 32 bits en una conversión cuando el tipo
    /// destino ocupa el par de registros.
    fn insert_widening(&mut self, value: &mut Expr, target: &Type) {
        let target_size = target.size_of(&self.module.layouts);
        let value_size = value
            .ty
            .as_ref()
            .map(|ty| ty.size_of(&self.module.layouts))
            .unwrap_or(4);

        if target_size == 8 && value_size < 8 {
            let span = value.span;
            let inner = std::mem::replace(value, Expr::new(ExprKind::NoneLit, span));
            let mut cast = Expr::new(
                ExprKind::Cast {
                    ty: target.clone(),
                    expr: Box::new(inner),
                },
                span,
            );
            cast.ty = Some(target.clone());
            *value = cast;
        }
    }

    /// Reescribe el tipo de un literal entero si su valor cabe en el
    /// tipo objetivo.
    fn coerce_literal(&self, expr: &mut Expr, target: &Type) -> bool {
        let value = match expr.kind {
            ExprKind::Int(value) => value,
            ExprKind::Unary {
                op: UnaryOp::Neg,
                ref operand,
            } => match operand.kind {
                ExprKind::Int(value) => -value,
                _ => return false,
            },
            _ => return false,
        };

        if fits(value, target) {
            expr.ty = Some(target.strip().clone());
            if let ExprKind::Unary { operand, .. } = &mut expr.kind {
                operand.ty = Some(target.strip().clone());
            }
            true
        } else {
            false
        }
    }

    /// Reglas de asignabilidad del lenguaje.
    fn assignable(&mut self, target: &Type, value: &mut Expr) -> bool {
        let value_ty = match value.ty.clone() {
            Some(ty) => ty,
            None => return false,
        };

        let target = target.strip().clone();
        let found = value_ty.strip().clone();

        if target == found {
            return true;
        }

        // Un literal adopta cualquier tipo entero donde su valor quepa
        if literal_int(value) && target.is_integer() && self.coerce_literal(value, &target) {
            return true;
        }

        // Ensanchamiento implícito entre enteros del mismo signo; al
        // cruzar a 64 bits se materializa como conversión para que el
        // generador extienda el par de registros
        if target.is_integer()
            && found.is_integer()
            && target.is_signed() == found.is_signed()
            && target.size_of(&self.module.layouts) >= found.size_of(&self.module.layouts)
        {
            self.insert_widening(value, &target);
            return true;
        }

        // `Array[N, T]` decae a `Ptr[T]`
        if let (Type::Ptr(target_elem), Type::Array(_, found_elem)) = (&target, &found) {
            if target_elem.strip() == found_elem.strip() {
                return true;
            }
        }

        // `None` puebla punteros y opcionales
        if matches!(value.kind, ExprKind::NoneLit)
            && (target.is_pointer() || matches!(target, Type::Optional(_)))
        {
            value.ty = Some(target.clone());
            return true;
        }

        // `str` y `Ptr[char]` son intercambiables
        if (matches!(target, Type::Str)
            && matches!(&found, Type::Ptr(inner) if **inner == Type::Char))
            || (matches!(found, Type::Str)
                && matches!(&target, Type::Ptr(inner) if **inner == Type::Char))
        {
            return true;
        }

        // `T` entra y sale de `Optional[T]`
        if let Type::Optional(inner) = &target {
            if inner.strip() == &found {
                return true;
            }
            if literal_int(value) && inner.is_integer() && self.coerce_literal(value, inner) {
                return true;
            }
        }
        if let Type::Optional(inner) = &found {
            if inner.strip() == &target {
                return true;
            }
        }

        // Una lista vacía sirve para cualquier `List[T]`
        if matches!(target, Type::List(_)) {
            if let ExprKind::ListLit(elements) = &value.kind {
                if elements.is_empty() {
                    value.ty = Some(target.clone());
                    return true;
                }
            }
        }

        // Literal flotante hacia el tipo ancho
        if matches!(target, Type::Float64)
            && matches!(found, Type::Float32)
            && matches!(value.kind, ExprKind::Float(_))
        {
            value.ty = Some(Type::Float64);
            return true;
        }

        false
    }
}

// -------------------------------------------------------------------
// Utilitarios del módulo
// -------------------------------------------------------------------

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

fn literal_int(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Int(_) => true,
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => matches!(operand.kind, ExprKind::Int(_)),
        _ => false,
    }
}

fn is_literal(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Char(_)
            | ExprKind::Bool(_)
            | ExprKind::NoneLit
    ) || literal_int(expr)
}

fn is_string(ty: &Type) -> bool {
    match ty.strip() {
        Type::Str => true,
        Type::Ptr(inner) => **inner == Type::Char,
        _ => false,
    }
}

fn is_lvalue(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Ident { .. } | ExprKind::Index { .. } | ExprKind::Attr { .. } | ExprKind::Deref(_)
    )
}

/// Tipos que `print` y las f-strings saben mostrar.
fn printable(ty: &Type) -> bool {
    let ty = ty.strip();
    is_string(ty)
        || matches!(ty, Type::Bool | Type::Char)
        || (ty.is_integer() && !ty.is_wide())
        || ty.is_pointer()
}

/// ¿Se puede emitir como palabra constante en `.data`?
fn is_const_expr(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Int(_) | ExprKind::Char(_) | ExprKind::Bool(_) | ExprKind::Str(_) => true,
        ExprKind::NoneLit => true,
        ExprKind::Unary { op, operand } => {
            matches!(op, UnaryOp::Neg | UnaryOp::BitNot) && is_const_expr(operand)
        }
        _ => false,
    }
}

fn fits(value: i64, target: &Type) -> bool {
    match target.strip() {
        Type::Int8 => i8::try_from(value).is_ok(),
        Type::Int16 => i16::try_from(value).is_ok(),
        Type::Int32 => i32::try_from(value).is_ok(),
        Type::Int64 => true,
        Type::Uint8 => u8::try_from(value).is_ok(),
        Type::Uint16 => u16::try_from(value).is_ok(),
        Type::Uint32 => u32::try_from(value).is_ok(),
        Type::Uint64 => value >= 0,
        _ => false,
    }
}

fn synth_int(value: i64, span: Span) -> Expr {
    let mut expr = Expr::new(ExprKind::Int(value), span);
    expr.ty = Some(Type::Int32);
    expr
}

/// Llamada sintética a un símbolo del runtime, ya tipada.
fn synth_call(symbol: &str, args: Vec<Expr>, ret: Type, span: Span) -> Expr {
    let mut func = Expr::new(
        ExprKind::Ident {
            name: symbol.to_owned(),
            binding: Some(Binding::Func(symbol.to_owned())),
        },
        span,
    );
    func.ty = Some(Type::Fn {
        ret: Box::new(ret.clone()),
        params: Vec::new(),
    });

    let mut call = Expr::new(
        ExprKind::Call {
            func: Box::new(func),
            args,
            kwargs: Vec::new(),
        },
        span,
    );
    call.ty = Some(ret);
    call
}

fn is_intrinsic(name: &str) -> bool {
    matches!(
        name,
        "print"
            | "input"
            | "range"
            | "len"
            | "ord"
            | "chr"
            | "abs"
            | "min"
            | "max"
            | "dmb"
            | "dsb"
            | "isb"
            | "wfi"
            | "wfe"
            | "sev"
            | "clrex"
            | "clz"
            | "rbit"
            | "rev"
            | "rev16"
            | "critical_enter"
            | "critical_exit"
            | "atomic_load"
            | "atomic_store"
            | "atomic_add"
            | "atomic_sub"
            | "atomic_cas"
            | "bit_set"
            | "bit_clear"
            | "bit_toggle"
            | "bit_test"
            | "bits_get"
            | "bits_set"
    )
}

/// Métodos de cadena: símbolo del runtime, argumentos extra y retorno.
fn string_method(name: &str) -> Option<(&'static str, usize, Type)> {
    let method = match name {
        "upper" => ("__pynux_str_upper", 0, Type::Str),
        "lower" => ("__pynux_str_lower", 0, Type::Str),
        "strip" => ("__pynux_str_strip", 0, Type::Str),
        "startswith" => ("__pynux_str_startswith", 1, Type::Bool),
        "endswith" => ("__pynux_str_endswith", 1, Type::Bool),
        "find" => ("__pynux_str_find", 1, Type::Int32),
        "isdigit" => ("__pynux_str_isdigit", 0, Type::Bool),
        "isalpha" => ("__pynux_str_isalpha", 0, Type::Bool),
        _ => return None,
    };

    Some(method)
}

/// Firmas del runtime preregistradas en todo módulo.
fn runtime_signatures() -> Vec<(&'static str, Vec<Type>, Type)> {
    let ptr_char = || Type::Ptr(Box::new(Type::Char));
    let ptr_byte = || Type::Ptr(Box::new(Type::Uint8));

    vec![
        ("uart_init", vec![], Type::Void),
        ("uart_putc", vec![Type::Int32], Type::Void),
        ("uart_getc", vec![], Type::Int32),
        ("uart_available", vec![], Type::Int32),
        ("print_str", vec![ptr_char()], Type::Void),
        ("print_int", vec![Type::Int32], Type::Void),
        ("print_hex", vec![Type::Uint32], Type::Void),
        ("print_newline", vec![], Type::Void),
        ("malloc", vec![Type::Uint32], ptr_byte()),
        ("free", vec![ptr_byte()], Type::Void),
        ("__pynux_strlen", vec![ptr_char()], Type::Int32),
        ("__pynux_strcmp", vec![ptr_char(), ptr_char()], Type::Int32),
        ("__pynux_strcpy", vec![ptr_char(), ptr_char()], ptr_char()),
        ("__pynux_strcat", vec![ptr_char(), ptr_char()], ptr_char()),
        (
            "__pynux_memcpy",
            vec![ptr_byte(), ptr_byte(), Type::Int32],
            ptr_byte(),
        ),
        (
            "__pynux_memset",
            vec![ptr_byte(), Type::Int32, Type::Int32],
            ptr_byte(),
        ),
        ("__pynux_read_line", vec![ptr_char()], ptr_char()),
        ("__pynux_in", vec![Type::Int32, ptr_char()], Type::Int32),
        ("__pynux_str_upper", vec![ptr_char()], ptr_char()),
        ("__pynux_str_lower", vec![ptr_char()], ptr_char()),
        ("__pynux_str_strip", vec![ptr_char()], ptr_char()),
        (
            "__pynux_str_startswith",
            vec![ptr_char(), ptr_char()],
            Type::Int32,
        ),
        (
            "__pynux_str_endswith",
            vec![ptr_char(), ptr_char()],
            Type::Int32,
        ),
        (
            "__pynux_str_find",
            vec![ptr_char(), ptr_char()],
            Type::Int32,
        ),
        ("__pynux_str_isdigit", vec![ptr_char()], Type::Int32),
        ("__pynux_str_isalpha", vec![ptr_char()], Type::Int32),
        (
            "__pynux_slice",
            vec![ptr_char(), Type::Int32, Type::Int32, Type::Int32],
            ptr_char(),
        ),
        (
            "__pynux_dict_get_int",
            vec![ptr_byte(), Type::Int32],
            Type::Int32,
        ),
        (
            "__pynux_dict_set_int",
            vec![ptr_byte(), Type::Int32, Type::Int32],
            Type::Void,
        ),
        (
            "__pynux_dict_get_str",
            vec![ptr_byte(), ptr_char()],
            Type::Int32,
        ),
        ("__pynux_assert_fail", vec![], Type::Void),
        ("__pynux_assert_fail_msg", vec![ptr_char()], Type::Void),
        ("__pynux_raise", vec![Type::Int32], Type::Void),
        ("__pynux_reraise", vec![], Type::Void),
        ("__pynux_pow", vec![Type::Int32, Type::Int32], Type::Int32),
        ("__pynux_generator_next", vec![ptr_byte()], ptr_byte()),
        ("__pynux_context_enter", vec![ptr_byte()], ptr_byte()),
        ("__pynux_context_exit", vec![ptr_byte()], Type::Void),
    ]
}

fn types_agree(left: &Type, right: &Type) -> bool {
    left.strip() == right.strip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex;
    use crate::parse;

    fn analyze(source: &str) -> Analysis {
        let tokens = lex::tokenize(source).expect("lexing failed");
        let program = parse::parse(tokens).expect("parsing failed");
        check(program, Arch::CortexM3).expect("checking failed")
    }

    fn analyze_err(source: &str) -> SemanticError {
        let tokens = lex::tokenize(source).expect("lexing failed");
        let program = parse::parse(tokens).expect("parsing failed");
        check(program, Arch::CortexM3)
            .expect_err("checking should fail")
            .into_inner()
    }

    #[test]
    fn natural_alignment_pads_fields() {
        let analysis = analyze("struct Mixed:\n    a: uint8\n    b: uint32\n    c: uint16\n");
        let layout = &analysis.layouts["Mixed"];

        assert_eq!(layout.field("a").unwrap().offset, 0);
        assert_eq!(layout.field("b").unwrap().offset, 4);
        assert_eq!(layout.field("c").unwrap().offset, 8);
        assert_eq!(layout.size, 12);
    }

    #[test]
    fn packed_layout_has_no_padding() {
        let analysis = analyze("@packed\nstruct Wire:\n    a: uint8\n    b: uint32\n");
        let layout = &analysis.layouts["Wire"];

        assert_eq!(layout.field("b").unwrap().offset, 1);
        assert_eq!(layout.size, 5);
    }

    #[test]
    fn union_fields_share_offset_zero() {
        let analysis = analyze("union Raw:\n    word: uint32\n    bytes: Array[4, uint8]\n");
        let layout = &analysis.layouts["Raw"];

        assert!(layout.is_union);
        assert_eq!(layout.field("word").unwrap().offset, 0);
        assert_eq!(layout.field("bytes").unwrap().offset, 0);
        assert_eq!(layout.size, 4);
    }

    #[test]
    fn classes_flatten_base_fields_first() {
        let analysis = analyze(
            "class Animal:\n    legs: int32\nclass Dog(Animal):\n    good: bool\n",
        );
        let layout = &analysis.layouts["Dog"];

        assert_eq!(layout.field("legs").unwrap().offset, 0);
        assert_eq!(layout.field("good").unwrap().offset, 4);
    }

    #[test]
    fn every_expression_ends_up_typed() {
        let analysis = analyze(
            "def f(a: int32) -> int32:\n    b: int32 = a + 1\n    if b > a:\n        return b\n    return a\n",
        );

        fn walk_expr(expr: &Expr) {
            assert!(expr.ty.is_some(), "untyped expression: {:?}", expr.kind);
            match &expr.kind {
                ExprKind::Binary { lhs, rhs, .. } => {
                    walk_expr(lhs);
                    walk_expr(rhs);
                }
                ExprKind::Unary { operand, .. } => walk_expr(operand),
                ExprKind::Call { func, args, .. } => {
                    walk_expr(func);
                    args.iter().for_each(walk_expr);
                }
                _ => (),
            }
        }

        for decl in &analysis.program.decls {
            if let Decl::Function(function) = decl {
                for stmt in &function.body {
                    match &stmt.kind {
                        StmtKind::VarDecl { value: Some(value), .. } => walk_expr(value),
                        StmtKind::Return(Some(value)) => walk_expr(value),
                        StmtKind::If { cond, .. } => walk_expr(cond),
                        _ => (),
                    }
                }
            }
        }
    }

    #[test]
    fn idents_resolve_to_bindings() {
        let analysis = analyze("g: int32 = 1\ndef f(a: int32) -> int32:\n    return a + g\n");
        let Decl::Function(function) = &analysis.program.decls[1] else {
            panic!("expected the function");
        };
        let StmtKind::Return(Some(value)) = &function.body[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Binary { lhs, rhs, .. } = &value.kind else {
            panic!("expected binary");
        };

        assert!(matches!(
            &lhs.kind,
            ExprKind::Ident { binding: Some(Binding::Local(0)), .. }
        ));
        assert!(matches!(
            &rhs.kind,
            ExprKind::Ident { binding: Some(Binding::Global(name)), .. } if name == "g"
        ));
    }

    #[test]
    fn range_for_is_desugared() {
        let analysis = analyze("def f() -> void:\n    for i in range(2, 8, 2):\n        pass\n");
        let Decl::Function(function) = &analysis.program.decls[0] else {
            panic!("expected the function");
        };

        assert!(matches!(function.body[0].kind, StmtKind::ForRange { .. }));
        // La variable y los dos límites ocultos del lazo
        assert_eq!(function.frame.len(), 3);
    }

    #[test]
    fn duplicate_functions_are_rejected() {
        let error = analyze_err("def f() -> void:\n    pass\ndef f() -> void:\n    pass\n");
        assert!(matches!(error, SemanticError::Duplicate(name) if name == "f"));
    }

    #[test]
    fn widening_across_signedness_is_rejected() {
        let error = analyze_err(
            "def f(a: int32, b: uint32) -> int32:\n    return a + b\n",
        );
        assert!(matches!(error, SemanticError::BadOperands { .. }));
    }

    #[test]
    fn implicit_widening_keeps_signedness() {
        analyze("def f(a: int16) -> int32:\n    b: int32 = a\n    return b\n");
    }

    #[test]
    fn narrowing_requires_a_cast() {
        let error = analyze_err("def f(a: int32) -> void:\n    b: int8 = a\n");
        assert!(matches!(error, SemanticError::Mismatch { .. }));

        analyze("def f(a: int32) -> void:\n    b: int8 = cast[int8](a)\n");
    }

    #[test]
    fn interrupt_handlers_cannot_take_parameters() {
        let error = analyze_err("@interrupt\ndef h(x: int32):\n    pass\n");
        assert!(matches!(error, SemanticError::BadInterrupt));
    }

    #[test]
    fn string_methods_lower_to_runtime_calls() {
        let analysis = analyze("def f(s: str) -> bool:\n    return s.isdigit()\n");
        let Decl::Function(function) = &analysis.program.decls[0] else {
            panic!("expected the function");
        };
        let StmtKind::Return(Some(value)) = &function.body[0].kind else {
            panic!("expected return");
        };
        let ExprKind::Call { func, args, .. } = &value.kind else {
            panic!("expected a lowered call, got {:?}", value.kind);
        };

        assert!(matches!(
            &func.kind,
            ExprKind::Ident { binding: Some(Binding::Func(symbol)), .. }
                if symbol == "__pynux_str_isdigit"
        ));
        assert_eq!(args.len(), 1);
    }
}
