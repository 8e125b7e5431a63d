macro_rules! emit {
    ($self:expr, $($format:tt)*) => {{
        write!($self.out, "\t")?;
        writeln!($self.out, $($format)*).map_err(crate::codegen::EmitError::from)
    }};
}

macro_rules! emit_label {
    ($self:expr, $($format:tt)*) => {{
        write!($self.out, $($format)*)?;
        writeln!($self.out, ":").map_err(crate::codegen::EmitError::from)
    }};
}
