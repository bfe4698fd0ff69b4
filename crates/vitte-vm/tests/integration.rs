//! Scénarios de bout en bout, à la frontière publique du crate (pas
//! d'accès aux internes du module `heap`/`frame` comme le fait
//! `src/lib.rs` pour ses propres tests unitaires).

use vitte_bytecode::{ImageBuilder, Op};
use vitte_vm::{Value, Vm, VmError, VmOptions};

#[test]
fn arithmetic_result_is_readable_from_a_global() {
    let mut b = ImageBuilder::new();
    let name = b.add_str("total");
    let seven = b.add_int(7);
    let five = b.add_int(5);
    b.op_u8(Op::PushConstString, name);
    b.op_u8(Op::PushConstInt, seven);
    b.op_u8(Op::PushConstInt, five);
    b.op(Op::Add);
    b.op(Op::Set);
    b.op(Op::End);

    let mut vm = Vm::new(b.build());
    vm.run().unwrap();
    assert!(matches!(vm.get_global("total"), Some(Value::Int(12))));
}

#[test]
fn subtraction_keeps_beneath_minus_top_order() {
    let mut b = ImageBuilder::new();
    let twenty = b.add_int(20);
    let six = b.add_int(6);
    b.op_u8(Op::PushConstInt, twenty);
    b.op_u8(Op::PushConstInt, six);
    b.op(Op::Sub);
    b.op(Op::End);

    let mut vm = Vm::new(b.build());
    vm.run().unwrap();
    assert!(matches!(vm.top(), Value::Int(14)));
}

#[test]
fn comparisons_use_beneath_as_left_operand() {
    let mut b = ImageBuilder::new();
    let small = b.add_int(1);
    let big = b.add_int(9);
    b.op_u8(Op::PushConstInt, small);
    b.op_u8(Op::PushConstInt, big);
    b.op(Op::Less);
    b.op(Op::End);

    let mut vm = Vm::new(b.build());
    vm.run().unwrap();
    assert!(matches!(vm.top(), Value::Bool(true)));
}

#[test]
fn array_roundtrip_through_stdlib_natives() {
    let mut b = ImageBuilder::new();
    let make_array = b.add_str("make_array");
    let len = b.add_str("len");
    let three = b.add_int(3);
    // make_array(3) -> tableau : l'argument est empilé avant la
    // référence native, que `Call` dépile en premier.
    b.op_u8(Op::PushConstInt, three);
    b.op_u8(Op::PushConstString, make_array);
    b.op(Op::Get);
    b.op(Op::Call);
    b.op_u8(Op::SetLocal, 0);

    // len(locals[0]) -> 3
    b.op_u8(Op::GetLocal, 0);
    b.op_u8(Op::PushConstString, len);
    b.op(Op::Get);
    b.op(Op::Call);
    b.op(Op::End);

    let mut vm = Vm::with_options(b.build(), VmOptions::default().with_stdlib(true));
    vm.run().unwrap();
    assert!(matches!(vm.top(), Value::Int(3)));
}

#[test]
fn const_strings_are_fresh_allocations_each_time() {
    let mut b = ImageBuilder::new();
    let hi = b.add_str("hi");
    b.op_u8(Op::PushConstString, hi);
    b.op_u8(Op::SetLocal, 0);
    b.op_u8(Op::PushConstString, hi);
    b.op_u8(Op::SetLocal, 1);
    b.op_u8(Op::GetLocal, 0);
    b.op_u8(Op::GetLocal, 1);
    b.op(Op::Equals);
    b.op(Op::End);

    let mut vm = Vm::new(b.build());
    vm.run().unwrap();
    // Contenu égal malgré deux allocations distinctes (comparaison par
    // contenu pour les chaînes, pas par identité).
    assert!(matches!(vm.top(), Value::Bool(true)));
}

#[test]
fn type_mismatch_on_add_is_reported_as_type_error() {
    let mut b = ImageBuilder::new();
    b.op(Op::PushTrue);
    b.op(Op::PushTrue);
    b.op(Op::Add);
    b.op(Op::End);

    let mut vm = Vm::new(b.build());
    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmError::TypeError(_)));
}

#[test]
fn jump_if_not_skips_the_then_branch_when_condition_is_false() {
    let mut b = ImageBuilder::new();
    let skipped = b.add_int(1);
    let taken = b.add_int(2);
    b.op(Op::PushFalse);
    let patch = b.op_addr(Op::JumpIfNot, 0);
    b.op_u8(Op::PushConstInt, skipped);
    b.op(Op::End);
    let else_branch = b.here();
    b.op_u8(Op::PushConstInt, taken);
    b.op(Op::End);
    b.patch_addr(patch, else_branch);

    let mut vm = Vm::new(b.build());
    vm.run().unwrap();
    assert!(matches!(vm.top(), Value::Int(2)));
}
