//! Layout del stack frame y etiquetas de control de flujo.
//!
//! El verificador entrega los slots de cada función (parámetros
//! primero, locales después); aquí se les asigna un offset fijo en
//! bytes respecto de `sp` tal como queda tras el prólogo. Los slots
//! crecen hacia abajo al reservarse pero se direccionan con offsets
//! positivos desde `sp`, siempre alineados a 4 bytes.
//!
//! El tamaño total del frame se redondea de modo que, sumado a los
//! registros que el prólogo apila, `sp` conserve el alineamiento de
//! 8 bytes que exige AAPCS en cada punto de llamada.

use crate::ast::{Layouts, Slot};

/// Offsets asignados a los slots de una función.
pub struct FrameLayout {
    offsets: Vec<u32>,
    size: u32,
}

impl FrameLayout {
    /// Calcula offsets para `slots`, con `saved` bytes ya apilados por
    /// el prólogo.
    pub fn new(slots: &[Slot], layouts: &Layouts, saved: u32) -> Self {
        let mut offsets = Vec::with_capacity(slots.len());
        let mut cursor = 0u32;

        for slot in slots {
            offsets.push(cursor);
            let size = slot.ty.size_of(layouts).max(4);
            cursor += (size + 3) & !3;
        }

        // `sp` entra 8-alineado a la función; tras apilar `saved`
        // bytes, el frame debe devolver ese alineamiento
        let mut size = (cursor + 3) & !3;
        while (size + saved) % 8 != 0 {
            size += 4;
        }

        FrameLayout { offsets, size }
    }

    /// Offset del slot respecto de `sp` post-prólogo.
    pub fn offset(&self, slot: u32) -> u32 {
        self.offsets[slot as usize]
    }

    /// Bytes que el prólogo resta de `sp`.
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Destinos de `break` y `continue` del lazo en curso.
pub struct LoopLabels {
    pub break_to: String,
    pub continue_to: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Type;

    fn slot(name: &str, ty: Type) -> Slot {
        Slot {
            name: name.to_owned(),
            ty,
        }
    }

    #[test]
    fn offsets_are_word_aligned() {
        let layouts = Layouts::new();
        let frame = FrameLayout::new(
            &[
                slot("a", Type::Int32),
                slot("b", Type::Char),
                slot("c", Type::Int64),
                slot("d", Type::Int32),
            ],
            &layouts,
            20,
        );

        assert_eq!(frame.offset(0), 0);
        assert_eq!(frame.offset(1), 4);
        assert_eq!(frame.offset(2), 8);
        assert_eq!(frame.offset(3), 16);
    }

    #[test]
    fn frame_restores_eight_byte_alignment() {
        let layouts = Layouts::new();

        for locals in 0..6 {
            let slots: Vec<Slot> = (0..locals)
                .map(|i| slot(&format!("x{}", i), Type::Int32))
                .collect();
            let frame = FrameLayout::new(&slots, &layouts, 20);
            assert_eq!((frame.size() + 20) % 8, 0, "locals = {}", locals);
        }
    }

    #[test]
    fn arrays_take_their_full_extent() {
        let layouts = Layouts::new();
        let frame = FrameLayout::new(
            &[
                slot("buffer", Type::Array(10, Box::new(Type::Char))),
                slot("n", Type::Int32),
            ],
            &layouts,
            20,
        );

        assert_eq!(frame.offset(0), 0);
        assert_eq!(frame.offset(1), 12);
    }
}
