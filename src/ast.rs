//! Árbol de sintaxis abstracta.
//!
//! El AST es el contrato compartido entre parser, verificador de tipos
//! y generador de código. El parser lo construye, el verificador lo
//! decora (cada expresión adquiere su tipo resuelto y cada
//! identificador un binding) y el generador lo consume sin volver a
//! resolver nombres. Ningún nodo guarda punteros hacia arriba; el
//! contexto necesario se pasa como parámetro en cada fase.

use crate::source::Span;
use std::collections::HashMap;
use std::fmt::{self, Display};

/// Un tipo del lenguaje.
///
/// Los tipos con nombre (`struct`, `union`, `class`) se refieren por su
/// identificador; su layout vive en [`Layouts`], calculado una única
/// vez por el verificador y estable durante toda la compilación.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool,
    Char,
    Void,

    /// Alias de `Ptr[char]` con el invariante adicional de terminar
    /// en `\0`.
    Str,

    Ptr(Box<Type>),
    Array(u32, Box<Type>),
    Fn {
        ret: Box<Type>,
        params: Vec<Type>,
    },
    Optional(Box<Type>),
    List(Box<Type>),
    Dict(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),

    /// Referencia a un `struct`, `union` o `class` por nombre.
    Named(String),

    /// Calificador de acceso a memoria; transparente para el chequeo.
    Volatile(Box<Type>),
}

impl Type {
    /// Tamaño en bytes de un valor de este tipo.
    pub fn size_of(&self, layouts: &Layouts) -> u32 {
        match self {
            Type::Int8 | Type::Uint8 | Type::Bool | Type::Char => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Int32 | Type::Uint32 | Type::Float32 => 4,
            Type::Int64 | Type::Uint64 | Type::Float64 => 8,
            Type::Void => 0,
            Type::Str | Type::Ptr(_) | Type::Fn { .. } => 4,
            // Listas, diccionarios y tuplas viajan como punteros a su
            // representación en memoria
            Type::List(_) | Type::Dict(_, _) | Type::Tuple(_) => 4,
            Type::Array(n, element) => n * element.size_of(layouts),
            Type::Optional(inner) => inner.size_of(layouts),
            Type::Named(name) => layouts.get(name).map_or(4, |layout| layout.size),
            Type::Volatile(inner) => inner.size_of(layouts),
        }
    }

    /// Alineamiento natural del tipo.
    pub fn align_of(&self, layouts: &Layouts) -> u32 {
        match self {
            Type::Array(_, element) => element.align_of(layouts),
            Type::Named(name) => layouts.get(name).map_or(4, |layout| layout.align),
            Type::Optional(inner) | Type::Volatile(inner) => inner.align_of(layouts),
            other => other.size_of(layouts).max(1).min(8),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.strip(),
            Type::Int8
                | Type::Int16
                | Type::Int32
                | Type::Int64
                | Type::Uint8
                | Type::Uint16
                | Type::Uint32
                | Type::Uint64
        )
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self.strip(),
            Type::Int8 | Type::Int16 | Type::Int32 | Type::Int64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self.strip(), Type::Float32 | Type::Float64)
    }

    /// Tipos que viajan como dirección de memoria.
    pub fn is_pointer(&self) -> bool {
        matches!(self.strip(), Type::Ptr(_) | Type::Str | Type::Fn { .. })
    }

    pub fn is_wide(&self) -> bool {
        matches!(
            self.strip(),
            Type::Int64 | Type::Uint64 | Type::Float64
        )
    }

    /// Descarta el calificador `volatile`.
    pub fn strip(&self) -> &Type {
        match self {
            Type::Volatile(inner) => inner.strip(),
            other => other,
        }
    }

    /// Tipo del elemento apuntado o contenido, si lo hay.
    pub fn element(&self) -> Option<&Type> {
        match self.strip() {
            Type::Ptr(inner) | Type::Array(_, inner) | Type::List(inner) => Some(inner),
            Type::Str => Some(&Type::Char),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int8 => fmt.write_str("int8"),
            Type::Int16 => fmt.write_str("int16"),
            Type::Int32 => fmt.write_str("int32"),
            Type::Int64 => fmt.write_str("int64"),
            Type::Uint8 => fmt.write_str("uint8"),
            Type::Uint16 => fmt.write_str("uint16"),
            Type::Uint32 => fmt.write_str("uint32"),
            Type::Uint64 => fmt.write_str("uint64"),
            Type::Float32 => fmt.write_str("float32"),
            Type::Float64 => fmt.write_str("float64"),
            Type::Bool => fmt.write_str("bool"),
            Type::Char => fmt.write_str("char"),
            Type::Void => fmt.write_str("void"),
            Type::Str => fmt.write_str("str"),
            Type::Ptr(inner) => write!(fmt, "Ptr[{}]", inner),
            Type::Array(n, inner) => write!(fmt, "Array[{}, {}]", n, inner),
            Type::Fn { ret, params } => {
                write!(fmt, "Fn[{}", ret)?;
                for param in params {
                    write!(fmt, ", {}", param)?;
                }
                fmt.write_str("]")
            }
            Type::Optional(inner) => write!(fmt, "Optional[{}]", inner),
            Type::List(inner) => write!(fmt, "List[{}]", inner),
            Type::Dict(key, value) => write!(fmt, "Dict[{}, {}]", key, value),
            Type::Tuple(elements) => {
                fmt.write_str("Tuple[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        fmt.write_str(", ")?;
                    }
                    write!(fmt, "{}", element)?;
                }
                fmt.write_str("]")
            }
            Type::Named(name) => fmt.write_str(name),
            Type::Volatile(inner) => write!(fmt, "volatile {}", inner),
        }
    }
}

/// Campo de un tipo agregado, con su offset ya calculado.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub ty: Type,
    pub offset: u32,
}

/// Layout en memoria de un `struct`, `union` o `class` aplanado.
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub fields: Vec<FieldInfo>,
    pub size: u32,
    pub align: u32,
    pub packed: bool,
    pub is_union: bool,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Tabla de layouts por nombre, propiedad de una unidad de compilación.
pub type Layouts = HashMap<String, StructLayout>;

/// Operador binario.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    In,
    NotIn,
    Is,
    IsNot,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl Display for BinOp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::IntDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::In => "in",
            BinOp::NotIn => "not in",
            BinOp::Is => "is",
            BinOp::IsNot => "is not",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        };

        fmt.write_str(symbol)
    }
}

/// Operador unario.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Resultado de la resolución de un nombre.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Slot local (parámetro o variable) dentro del frame actual.
    Local(u32),

    /// Variable global, direccionada por símbolo.
    Global(String),

    /// Función o símbolo externo invocable.
    Func(String),
}

/// Una expresión: su forma, su ubicación y, después del chequeo, su
/// tipo resuelto.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr {
            kind,
            span,
            ty: None,
        }
    }
}

/// Fragmento de una f-string.
#[derive(Debug, Clone)]
pub enum FsPart {
    Lit(String),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Char(char),
    Bool(bool),
    NoneLit,
    FString(Vec<FsPart>),

    Ident {
        name: String,
        binding: Option<Binding>,
    },

    Attr {
        base: Box<Expr>,
        name: String,
    },

    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },

    Slice {
        base: Box<Expr>,
        start: Option<Box<Expr>>,
        stop: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },

    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },

    /// Azúcar `obj.metodo(args)`; el verificador la reescribe a una
    /// llamada ordinaria.
    MethodCall {
        base: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },

    AddressOf(Box<Expr>),
    Deref(Box<Expr>),

    Cast {
        ty: Type,
        expr: Box<Expr>,
    },

    Sizeof(Type),

    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },

    ListLit(Vec<Expr>),
    DictLit(Vec<(Expr, Expr)>),
    TupleLit(Vec<Expr>),

    StructLit {
        name: String,
        fields: Vec<(String, Expr)>,
    },

    Comp {
        element: Box<Expr>,
        var: String,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
        /// Slots ocultos de la iteración, asignados por el verificador.
        slots: Option<(u32, u32)>,
    },

    /// Ensamblador textual, copiado sin cambios a la salida.
    Asm(String),

    /// Nombre del lenguaje resuelto directamente a instrucciones o a
    /// una llamada del ABI; lo produce el verificador.
    Intrinsic {
        name: String,
        args: Vec<Expr>,
    },
}

/// Patrón de un brazo `case`.
#[derive(Debug, Clone)]
pub enum Pattern {
    Wildcard,
    Int(i64),
    Char(char),
    Str(String),
    Bool(bool),
    /// Identificador: liga el valor inspeccionado y siempre calza.
    Binding(String),
}

/// Una sentencia.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Stmt { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// Declaración con anotación: `x: T = e`.
    VarDecl {
        name: String,
        ty: Type,
        value: Option<Expr>,
        slot: Option<u32>,
    },

    Assign {
        target: Expr,
        value: Expr,
    },

    AugAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },

    /// Desempaquetado `a, b = e`.
    TupleAssign {
        targets: Vec<String>,
        value: Expr,
        slots: Vec<u32>,
    },

    If {
        cond: Expr,
        then: Vec<Stmt>,
        elifs: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },

    While {
        cond: Expr,
        body: Vec<Stmt>,
    },

    /// Forma superficial de `for v in e`; el verificador la reescribe
    /// a una de las variantes siguientes.
    For {
        vars: Vec<String>,
        iter: Expr,
        body: Vec<Stmt>,
    },

    /// `for v in range(...)`, ya reconocido por el verificador.
    ForRange {
        var: String,
        slot: u32,
        start: Expr,
        stop: Expr,
        step: Expr,
        /// Slots ocultos para el límite y el paso.
        bounds: (u32, u32),
        body: Vec<Stmt>,
    },

    /// Iteración sobre un valor con layout de lista.
    ForIter {
        var: String,
        slot: u32,
        iter: Expr,
        /// Slots ocultos: índice, longitud, colección.
        cursor: (u32, u32, u32),
        body: Vec<Stmt>,
    },

    /// Iteración con desempaquetado de tuplas.
    ForUnpack {
        vars: Vec<String>,
        slots: Vec<u32>,
        iter: Expr,
        cursor: (u32, u32, u32),
        body: Vec<Stmt>,
    },

    Break,
    Continue,

    Return(Option<Expr>),

    Raise(Option<Expr>),

    Try {
        body: Vec<Stmt>,
        handlers: Vec<Handler>,
        otherwise: Vec<Stmt>,
        finally: Vec<Stmt>,
    },

    With {
        context: Expr,
        as_name: Option<String>,
        /// Slot oculto que retiene el contexto para la salida.
        slot: Option<u32>,
        body: Vec<Stmt>,
    },

    Match {
        scrutinee: Expr,
        arms: Vec<(Pattern, Vec<Stmt>)>,
    },

    Asm(String),

    Assert {
        cond: Expr,
        message: Option<Expr>,
    },

    Defer(Box<Stmt>),

    Global(Vec<String>),

    Yield(Option<Expr>),

    Pass,

    Expr(Expr),
}

/// Manejador `except`.
#[derive(Debug, Clone)]
pub struct Handler {
    pub exception: Option<String>,
    pub as_name: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// Parámetro formal de una función.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub default: Option<Expr>,
    pub span: Span,
}

/// Slot del frame de una función: parámetros primero, locales después.
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub body: Vec<Stmt>,
    pub decorators: Vec<crate::source::Located<String>>,
    pub span: Span,

    /// Marcado por el verificador a partir de `@interrupt`.
    pub interrupt: bool,

    /// Frame descubierto por el verificador; el generador solo asigna
    /// offsets.
    pub frame: Vec<Slot>,
}

#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub name: String,
    pub ty: Type,
    pub init: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<(String, Type)>,
    pub packed: bool,
    pub decorators: Vec<crate::source::Located<String>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct UnionDef {
    pub name: String,
    pub fields: Vec<(String, Type)>,
    pub decorators: Vec<crate::source::Located<String>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<String>,
    pub fields: Vec<(String, Type, Option<Expr>)>,
    pub methods: Vec<FunctionDef>,
    pub decorators: Vec<crate::source::Located<String>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ExternDef {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Type,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ImportDecl {
    pub module: String,
    pub names: Vec<String>,
    pub alias: Option<String>,
    pub star: bool,
    pub span: Span,
}

/// Declaración de nivel superior.
#[derive(Debug, Clone)]
pub enum Decl {
    Function(FunctionDef),
    Global(GlobalVar),
    Struct(StructDef),
    Union(UnionDef),
    Class(ClassDef),
    Extern(ExternDef),
    Import(ImportDecl),
}

/// Una unidad de traducción completa.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub decls: Vec<Decl>,
}
