//! Petit stdlib optionnel, greffé en natives (C8) quand
//! `VmOptions::stdlib` est activé.

use crate::error::VmResult;
use crate::value::Value;
use crate::Vm;

/// Installe `print`, `clock_ms`, `make_array` et `len` comme globales
/// natives. Purement un confort de test/démo — aucune de ces fonctions ne
/// fait partie du jeu d'opcodes du cœur VM (§4.6) ; elles passent par le
/// pont natif comme n'importe quelle fonction hôte (C8).
pub fn install(vm: &mut Vm) {
    vm.define_native("print", native_print);
    vm.define_native("clock_ms", native_clock_ms);
    vm.define_native("make_array", native_make_array);
    vm.define_native("len", native_len);
}

fn native_print(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let s = vm.format_value(&v);
    vm.host_print(&s);
    vm.push(Value::Null)
}

fn native_clock_ms(vm: &mut Vm) -> VmResult<()> {
    let ms = vm.host_now_elapsed_ms();
    vm.push(Value::Int(ms))
}

fn native_make_array(vm: &mut Vm) -> VmResult<()> {
    let size = vm.pop().expect_int()?;
    let size = size.max(0) as usize;
    let handle = vm.make_array(size);
    vm.push(Value::MemoryObj(handle))
}

fn native_len(vm: &mut Vm) -> VmResult<()> {
    let v = vm.pop();
    let n = vm.container_len(&v)?;
    vm.push(Value::Int(n as i32))
}
