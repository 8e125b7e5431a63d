//! Escenarios de compilación de punta a punta: fuente → ensamblador.
//!
//! Las aserciones inspeccionan el texto emitido; la semántica en
//! hardware se valida aparte enlazando contra el runtime.

use pynux::arch::Arch;
use pynux::compile;
use pynux::error::Stage;

fn emit(source: &str) -> String {
    compile(source, "test.py", Arch::CortexM3).expect("compilation failed")
}

fn emit_for(source: &str, arch: Arch) -> String {
    compile(source, "test.py", arch).expect("compilation failed")
}

fn emit_err(source: &str) -> pynux::error::Diagnostic {
    compile(source, "test.py", Arch::CortexM3).expect_err("compilation should fail")
}

#[test]
fn hello_uart() {
    let asm = emit("def main() -> int32:\n    print_str(\"Hi!\\n\")\n    return 0\n");

    assert!(asm.starts_with("@ Pynux generated ARM Thumb-2 assembly"));
    assert!(asm.contains("\t.syntax unified"));
    assert!(asm.contains("\t.cpu cortex-m3"));
    assert!(asm.contains("\t.thumb"));
    assert!(asm.contains("\t.global main"));
    assert!(asm.contains("main:"));
    assert!(asm.contains("\tbl print_str"));
    assert!(asm.contains(".asciz \"Hi!\\n\""));
    assert!(asm.contains("\tpop {r4-r7, pc}"));
}

#[test]
fn arguments_flow_through_registers() {
    let asm = emit(
        "def add(a: int32, b: int32) -> int32:\n    return a + b\ndef main() -> int32:\n    print_int(add(2, 40))\n    return 0\n",
    );

    assert!(asm.contains("add:"));
    assert!(asm.contains("\tbl add"));
    assert!(asm.contains("\tbl print_int"));
    assert!(asm.contains("\tadds r0, r1, r0"));
}

#[test]
fn for_range_loops_with_counter() {
    let asm = emit("def main() -> int32:\n    for i in range(3):\n        print_int(i)\n    return 0\n");

    assert!(asm.contains(".Lmain_"));
    assert!(asm.contains("\tcmp r0, r1"));
    assert!(asm.contains("\tbge .Lmain_"));
    assert!(asm.contains("\tadds r0, r0, r1"));
    assert!(asm.contains("\tbl print_int"));
}

#[test]
fn globals_live_in_data() {
    let asm = emit(
        "c: int32 = 0\ndef main() -> int32:\n    global c\n    c = 7\n    print_int(c)\n    return 0\n",
    );

    assert!(asm.contains("\t.section .data"));
    assert!(asm.contains("\t.global c"));
    assert!(asm.contains("c:"));
    assert!(asm.contains("\t.word 0"));
    assert!(asm.contains("\tldr r2, =c"));
}

#[test]
fn slicing_calls_the_helper() {
    let asm = emit(
        "def main() -> int32:\n    s: Ptr[char] = \"abcdef\"\n    print_str(s[1:4:1])\n    return 0\n",
    );

    assert!(asm.contains("\tbl __pynux_slice"));
    assert!(asm.contains(".asciz \"abcdef\""));
}

#[test]
fn open_slice_passes_the_sentinel() {
    let asm = emit("def main() -> int32:\n    s: str = \"abc\"\n    print_str(s[1:])\n    return 0\n");

    assert!(asm.contains("\tldr r0, =-1"));
    assert!(asm.contains("\tbl __pynux_slice"));
}

#[test]
fn signed_division_uses_aeabi() {
    let asm = emit("def main() -> int32:\n    x: int32 = -10\n    print_int(x / 3)\n    return 0\n");

    assert!(asm.contains("\tbl __aeabi_idiv"));
}

#[test]
fn modulo_takes_the_remainder_register() {
    let asm = emit("def main() -> int32:\n    x: int32 = 10\n    return x % 3\n");

    assert!(asm.contains("\tbl __aeabi_idivmod"));
    assert!(asm.contains("\tmov r0, r1"));
}

#[test]
fn empty_source_emits_only_the_header() {
    let asm = emit("");

    assert!(asm.contains("\t.syntax unified"));
    assert!(!asm.contains("push"));
    assert!(!asm.contains(".section .data"));
    assert!(!asm.contains(".section .rodata"));
}

#[test]
fn comments_only_source_is_empty_too() {
    let asm = emit("# nada\n\n# que compilar\n");
    assert!(!asm.contains("push"));
}

#[test]
fn identical_strings_share_one_label() {
    let asm = emit(
        "def main() -> int32:\n    print_str(\"x\")\n    print_str(\"x\")\n    print_str(\"x\")\n    return 0\n",
    );

    assert_eq!(asm.matches(".asciz \"x\"").count(), 1);
    assert_eq!(asm.matches("ldr r0, =.LC0").count(), 3);
}

#[test]
fn output_is_reproducible() {
    let source = "def f(a: int32) -> int32:\n    return a * 2 + 1\ndef main() -> int32:\n    print_int(f(20))\n    return 0\n";
    assert_eq!(emit(source), emit(source));
}

#[test]
fn int32_boundary_roundtrips() {
    let asm = emit("def main() -> int32:\n    x: int32 = -2147483648\n    return x\n");
    assert!(asm.contains("=-2147483648") || asm.contains("=2147483648"));
}

#[test]
fn deep_nesting_compiles() {
    let mut source = String::from("def main() -> int32:\n");
    for level in 0..64 {
        source.push_str(&"    ".repeat(level + 1));
        source.push_str("if True:\n");
    }
    source.push_str(&"    ".repeat(65));
    source.push_str("pass\n");
    source.push_str("    return 0\n");

    emit(&source);
}

#[test]
fn callee_saved_registers_balance() {
    let asm = emit(
        "def f(a: int32) -> int32:\n    if a > 0:\n        return a\n    return 0 - a\ndef main() -> int32:\n    return f(3)\n",
    );

    for body in asm.split(".type").skip(1) {
        let pushes = body.matches("push {r4-r7, lr}").count();
        let pops = body.split(".size").next().unwrap().matches("pop {r4-r7, pc}").count();
        assert_eq!(pushes, 1);
        assert!(pops >= 1);
    }
}

#[test]
fn temporaries_are_pushed_in_pairs() {
    let asm = emit("def main() -> int32:\n    a: int32 = 1\n    b: int32 = 2\n    return a + b * 3 - a\n");

    let pushes = asm.matches("push {r0, r1}").count();
    let pops = asm.matches("add sp, sp, #4").count();
    assert!(pushes > 0);
    assert_eq!(pushes, pops);
    assert!(!asm.contains("push {r0}\n"));
}

#[test]
fn kernel_main_gets_an_alias() {
    let asm = emit("def kernel_main() -> int32:\n    return 0\n");

    assert!(asm.contains("\t.thumb_set main, kernel_main"));
}

#[test]
fn interrupt_handlers_are_listed_in_vectors() {
    let asm = emit(
        "@interrupt\ndef systick_handler():\n    pass\ndef main() -> int32:\n    return 0\n",
    );

    assert!(asm.contains("\tpush {r0-r3, ip, lr}"));
    assert!(asm.contains("\tbx lr"));
    assert!(asm.contains("\t.section .vectors, \"a\""));
    assert!(asm.contains("\t.word systick_handler"));
}

#[test]
fn with_statement_pairs_enter_and_exit() {
    let asm = emit(
        "def main() -> int32:\n    dev: Ptr[uint8] = None\n    with dev as handle:\n        print_hex(cast[uint32](handle))\n    return 0\n",
    );

    assert!(asm.contains("\tbl __pynux_context_enter"));
    assert!(asm.contains("\tbl __pynux_context_exit"));
}

#[test]
fn match_lowers_to_comparisons() {
    let asm = emit(
        "def classify(x: int32) -> int32:\n    match x:\n        case 0:\n            return 10\n        case 1:\n            return 20\n        case _:\n            return 30\n    return 0\n",
    );

    // La cadena if/elif generada compara contra cada literal
    assert!(asm.contains("\tcmp r1, r0"));
    assert!(asm.contains(".Lclassify_"));
}

#[test]
fn string_equality_compares_content() {
    let asm = emit(
        "def main() -> int32:\n    s: str = \"hola\"\n    if s == \"hola\":\n        return 1\n    return 0\n",
    );

    assert!(asm.contains("\tbl __pynux_strcmp"));
}

#[test]
fn boolean_operators_short_circuit() {
    let asm = emit(
        "def check(a: bool, b: bool) -> bool:\n    return a and b\n",
    );

    // El operando derecho queda tras un salto condicional
    let and_pos = asm.find("cmp r0, #0").unwrap();
    assert!(asm[and_pos..].contains("beq .Lcheck_"));
}

#[test]
fn assertions_call_the_runtime() {
    let asm = emit("def main() -> int32:\n    assert 1 > 0, \"broken\"\n    return 0\n");

    assert!(asm.contains("\tbl __pynux_assert_fail_msg"));
    assert!(asm.contains(".asciz \"broken\""));
}

#[test]
fn fstrings_print_by_static_type() {
    let asm = emit(
        "def main() -> int32:\n    n: int32 = 42\n    s: str = \"x\"\n    print(f\"n={n} s={s}!\")\n    return 0\n",
    );

    assert!(asm.contains("\tbl print_int"));
    assert!(asm.contains("\tbl print_str"));
    assert!(asm.contains(".asciz \"n=\""));
}

#[test]
fn struct_fields_use_their_offsets() {
    let asm = emit(
        "struct Point:\n    x: int32\n    y: int32\ndef main() -> int32:\n    p: Point = Point{x=1, y=2}\n    return p.y\n",
    );

    assert!(asm.contains("\tbl __pynux_memset"));
    assert!(asm.contains("adds r0, r0, #4"));
}

#[test]
fn packed_structs_drop_padding() {
    let asm = emit(
        "@packed\nstruct Reg:\n    a: uint8\n    b: uint32\ndef main() -> int32:\n    r: Reg = Reg{a=1, b=2}\n    return cast[int32](r.b)\n",
    );

    // Sin relleno, `b` queda en el offset 1
    assert!(asm.contains("adds r0, r0, #1"));
}

#[test]
fn methods_become_free_functions() {
    let asm = emit(
        "class Counter:\n    value: int32\n    def bump(self) -> int32:\n        self.value = self.value + 1\n        return self.value\ndef main() -> int32:\n    c: Counter = Counter{value=0}\n    return c.bump()\n",
    );

    assert!(asm.contains("Counter_bump:"));
    assert!(asm.contains("\tbl Counter_bump"));
}

#[test]
fn dict_literals_land_in_data() {
    let asm = emit(
        "def main() -> int32:\n    d: Dict[int32, int32] = {1: 10, 2: 20}\n    return d[1]\n",
    );

    assert!(asm.contains(".LD0:"));
    assert!(asm.contains("\t.word 2"));
    assert!(asm.contains("\tldr r0, =.LD0"));
    assert!(asm.contains("\tbl __pynux_dict_get_int"));
}

#[test]
fn deferred_global_initializers_get_an_init_function() {
    let asm = emit(
        "def seed() -> int32:\n    return 5\nstart: int32 = 0\ntotal: int32 = 7\ndef main() -> int32:\n    return start\n",
    );

    // Sin inicializadores no constantes no se emite la función
    assert!(!asm.contains("__init_test"));

    let asm = emit("def seed() -> int32:\n    return 5\ntotal: int32 = seed()\ndef main() -> int32:\n    return total\n");
    assert!(asm.contains("__init_test:"));
    assert!(asm.contains("\tbl seed"));
    assert!(asm.contains("\t.space 4"));
}

#[test]
fn cortex_m0plus_avoids_it_blocks() {
    let source = "def main() -> int32:\n    a: int32 = 1\n    if a < 2:\n        return 1\n    return 0\n";

    let m3 = emit_for(source, Arch::CortexM3);
    let m0 = emit_for(source, Arch::CortexM0Plus);

    assert!(m3.contains("\t.cpu cortex-m3"));
    assert!(m0.contains("\t.cpu cortex-m0plus"));
    assert!(m3.contains("\tite lt"));
    assert!(!m0.contains("\tite"));
    assert!(!m0.contains("movw"));
}

#[test]
fn inline_assembly_is_verbatim() {
    let asm = emit("def main() -> int32:\n    asm(\"\"\"\nmy_label:\n    nop\n\"\"\")\n    return 0\n");

    assert!(asm.contains("my_label:\n"));
    assert!(asm.contains("    nop\n"));
}

#[test]
fn stacked_arguments_restore_sp() {
    let asm = emit(
        "def six(a: int32, b: int32, c: int32, d: int32, e: int32, f: int32) -> int32:\n    return a + f\ndef main() -> int32:\n    return six(1, 2, 3, 4, 5, 6)\n",
    );

    assert!(asm.contains("\tsub sp, sp, #8"));
    assert!(asm.contains("\tstr r0, [sp, #32]"));
    assert!(asm.contains("\tbl six"));
    assert!(asm.contains("\tadd sp, sp, #8"));
}

// -------------------------------------------------------------------
// Diagnósticos
// -------------------------------------------------------------------

#[test]
fn lex_errors_carry_their_stage() {
    let err = emit_err("def main() -> int32:\n    s = \"sin cerrar\n");
    assert_eq!(err.stage(), Stage::Lex);
    assert!(err.to_string().starts_with("test.py:"));
    assert!(err.to_string().contains(": lex: "));
}

#[test]
fn parse_errors_report_what_was_found() {
    let err = emit_err("def main() -> int32:\nreturn 0\n");
    assert_eq!(err.stage(), Stage::Parse);
    assert!(err.to_string().contains("expected"));
}

#[test]
fn unknown_names_are_type_errors() {
    let err = emit_err("def main() -> int32:\n    return nope\n");
    assert_eq!(err.stage(), Stage::Type);
    assert!(err.to_string().contains("`nope`"));
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let err = emit_err("def main() -> int32:\n    break\n    return 0\n");
    assert!(err.to_string().contains("break"));
}

#[test]
fn yield_is_rejected() {
    let err = emit_err("def gen() -> int32:\n    yield 1\n");
    assert!(err.to_string().contains("generators"));
}

#[test]
fn float_arithmetic_is_rejected() {
    let err = emit_err("def main() -> int32:\n    x: float32 = 1.5\n    y: float32 = x + 1.0\n    return 0\n");
    assert!(err.to_string().contains("soft-float"));
}

#[test]
fn float_storage_is_allowed() {
    let asm = emit("def main() -> int32:\n    x: float32 = 1.5\n    return 0\n");
    assert!(asm.contains("@ float 1.5"));
}

#[test]
fn string_keyed_dict_stores_are_rejected() {
    let err = emit_err(
        "def main() -> int32:\n    d: Dict[str, int32] = {\"a\": 1}\n    d[\"a\"] = 2\n    return 0\n",
    );
    assert!(err.to_string().contains("read-only"));
}

#[test]
fn wide_multiplication_is_rejected() {
    let err = emit_err("def main() -> int32:\n    a: int64 = 1\n    b: int64 = a * a\n    return 0\n");
    assert!(err.to_string().contains("64-bit"));
}

#[test]
fn wide_addition_is_supported() {
    let asm = emit("def main() -> int32:\n    a: int64 = 1\n    b: int64 = a + a\n    return cast[int32](b)\n");
    assert!(asm.contains("\tadcs r1, r1, r3"));
}

#[test]
fn exclusive_ops_need_v7() {
    let source = "def main() -> int32:\n    x: int32 = 0\n    atomic_add(&x, 1)\n    return x\n";

    let err = compile(source, "test.py", Arch::CortexM0Plus).expect_err("m0+ lacks ldrex");
    assert!(err.to_string().contains("ARMv7-M"));

    let asm = emit_for(source, Arch::CortexM4);
    assert!(asm.contains("\tldrex"));
    assert!(asm.contains("\tstrex"));
}

#[test]
fn uninitialized_locals_are_flagged() {
    let err = emit_err("def main() -> int32:\n    x: int32\n    return x\n");
    assert!(err.to_string().contains("before assignment"));
}

#[test]
fn range_outside_for_is_rejected() {
    let err = emit_err("def main() -> int32:\n    x = range(3)\n    return 0\n");
    assert!(err.to_string().contains("range"));
}
