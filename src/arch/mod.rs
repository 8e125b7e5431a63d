//! Parámetros de la arquitectura objetivo.
//!
//! Las tres variantes comparten el mismo modelo de programación
//! Thumb; difieren en la directiva `.cpu` y en qué instrucciones son
//! legales. ARMv6-M (Cortex-M0+) carece de bloques `it`, de `movw` y
//! de los accesos exclusivos `ldrex`/`strex`, por lo cual el emisor y
//! el verificador consultan estas capacidades en vez de asumirlas.

use std::fmt::{self, Display};
use std::str::FromStr;

/// Procesador objetivo de una unidad de traducción.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    CortexM0Plus,
    CortexM3,
    CortexM4,
}

impl Arch {
    /// Nombre para la directiva `.cpu`.
    pub fn cpu(&self) -> &'static str {
        match self {
            Arch::CortexM0Plus => "cortex-m0plus",
            Arch::CortexM3 => "cortex-m3",
            Arch::CortexM4 => "cortex-m4",
        }
    }

    /// Bloques `it`/`ite` para ejecución condicional.
    pub fn has_it_blocks(&self) -> bool {
        !matches!(self, Arch::CortexM0Plus)
    }

    /// Carga inmediata de 16 bits con `movw`.
    pub fn has_movw(&self) -> bool {
        !matches!(self, Arch::CortexM0Plus)
    }

    /// `clz`, `rbit` y los accesos exclusivos `ldrex`/`strex`.
    pub fn has_v7_ops(&self) -> bool {
        !matches!(self, Arch::CortexM0Plus)
    }

    /// Valores aceptados por la opción `--target`.
    pub fn names() -> [&'static str; 3] {
        ["cortex-m0plus", "cortex-m3", "cortex-m4"]
    }
}

impl Default for Arch {
    fn default() -> Self {
        Arch::CortexM3
    }
}

impl Display for Arch {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.cpu())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        match string {
            "cortex-m0plus" => Ok(Arch::CortexM0Plus),
            "cortex-m3" => Ok(Arch::CortexM3),
            "cortex-m4" => Ok(Arch::CortexM4),
            other => Err(format!("unknown target: {}", other)),
        }
    }
}
