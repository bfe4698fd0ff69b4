//! vitte-vm — machine virtuelle à pile pour le bytecode Vitte.
//!
//! Ce crate consomme une [`Image`] déjà compilée (voir `vitte-bytecode`) et
//! l'exécute pas à pas : dispatch d'opcodes, arithmétique/comparaison
//! typées, contrôle de flux par sauts absolus, un modèle de variables
//! double (frame locale indexée + table globale nommée), et un tas
//! d'objets (chaînes, tableaux) géré par comptage de références + un
//! `sweep` linéaire différé. Le compilateur qui produit l'`Image` est un
//! collaborateur externe, hors périmètre de ce crate.
//!
//! ### Exemple
//!
//! ```
//! use vitte_bytecode::{ImageBuilder, Op};
//! use vitte_vm::Vm;
//!
//! let mut b = ImageBuilder::new();
//! let x = b.add_int(2);
//! let y = b.add_int(3);
//! let name = b.add_str("x");
//! b.op_u8(Op::PushConstString, name);
//! b.op_u8(Op::PushConstInt, x);
//! b.op_u8(Op::PushConstInt, y);
//! b.op(Op::Add);
//! b.op(Op::Set);
//! b.op(Op::End);
//!
//! let mut vm = Vm::new(b.build());
//! vm.run().unwrap();
//! assert!(matches!(vm.get_global("x"), Some(vitte_vm::Value::Int(5))));
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]
#![warn(missing_docs)]

mod error;
mod frame;
mod heap;
mod options;
mod stack;
mod stdlib;
mod value;

pub use error::{VmError, VmResult};
pub use heap::{Heap, HeapHandle, HeapNode, SweepReport};
pub use options::{DefaultHost, Host, VmOptions};
pub use stack::OperandStack;
pub use value::{NativeFn, UserData, Value};

use std::time::Instant;

use vitte_bytecode::{read_addr, read_u8, Image, Op};

use frame::{Globals, Locals};

/// Résultat du dispatch d'un opcode : avance normalement, ou saute
/// directement à une adresse (Jump/JumpIfNot pris) — voir §4.5 et §4.7.
enum StepOutcome {
    Advance,
    Jump(usize),
}

/// Opcodes dont le handler déclenche un `sweep` de fin d'étape (§4.2, §5).
fn triggers_sweep(op: Op) -> bool {
    matches!(op, Op::Set | Op::SetLocal | Op::SetArray | Op::ShrinkLocal)
}

/// Machine virtuelle.
pub struct Vm {
    image: Image,
    pc: usize,
    ended: bool,
    stack: OperandStack,
    locals: Locals,
    globals: Globals,
    heap: Heap,
    options: VmOptions,
    gas_left: Option<u64>,
    host: Box<dyn Host>,
    started_at: Instant,
}

impl Vm {
    /// Construit une VM avec les options par défaut.
    pub fn new(image: Image) -> Self {
        Self::with_options(image, VmOptions::default())
    }

    /// Construit une VM avec des options explicites.
    pub fn with_options(image: Image, options: VmOptions) -> Self {
        let mut vm = Self {
            image,
            pc: 0,
            ended: false,
            stack: OperandStack::new(),
            locals: Locals::new(),
            globals: Globals::new(),
            heap: Heap::new(),
            gas_left: options.gas_limit,
            host: Box::<DefaultHost>::default(),
            options,
            started_at: Instant::now(),
        };
        if vm.options.stdlib {
            stdlib::install(&mut vm);
        }
        vm
    }

    /// Installe un hôte personnalisé (I/O, horloge).
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    // ---- Introspection (C5, §6) --------------------------------------

    /// Compteur de programme courant.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Vrai si `pc` a dépassé la fin du flux d'opcodes, ou si `End` a été
    /// exécuté (le drapeau de fin est latché, voir §4.6).
    pub fn is_at_end(&self) -> bool {
        self.ended || self.pc >= self.image.len()
    }

    // ---- Pile d'opérandes, pour les handlers et les natives (C3, C8) --

    /// Empile une valeur (`StackOverflow` si `VmOptions::stack_limit` est
    /// dépassée).
    pub fn push(&mut self, v: Value) -> VmResult<()> {
        self.stack.push(v, self.options.stack_limit)
    }

    /// Dépile la valeur au sommet, `Value::Null` si la pile est vide.
    pub fn pop(&mut self) -> Value {
        self.stack.pop()
    }

    /// Lit la valeur au sommet sans la dépiler, `Value::Null` si vide.
    pub fn top(&self) -> Value {
        self.stack.top()
    }

    // ---- Variables (C4) ------------------------------------------------

    /// Déclare/écrase une globale.
    pub fn define_global(&mut self, name: impl Into<String>, val: Value) {
        // Une globale définie par l'hôte avant exécution ne référence
        // jamais le tas sur son premier appel ; si elle le fait, on
        // propage quand même le refcount pour rester cohérent.
        let _ = self.globals.set(&mut self.heap, name.into(), val);
    }

    /// Lit une globale (vue brute, sans `UndefinedName`).
    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get_raw(name)
    }

    /// Déclare une fonction native comme globale.
    pub fn define_native(&mut self, name: impl Into<String>, f: NativeFn) {
        self.define_global(name, Value::NativeFunction(f));
    }

    /// Charge un local (`UndefinedLocal` hors bornes).
    pub fn get_local(&self, i: usize) -> VmResult<Value> {
        self.locals.get(i)
    }

    /// Stocke un local, en ajustant le refcount tas (§4.4). N'effectue PAS
    /// de `sweep` — c'est le dispatch d'opcode qui s'en charge pour
    /// `SetLocal` (§4.5) ; utilisé tel quel comme primitive pour les
    /// natives qui veulent écrire un local directement.
    pub fn set_local(&mut self, i: usize, v: Value) -> VmResult<()> {
        self.locals.set(&mut self.heap, i, v)
    }

    /// Dépile `n` locaux depuis la fin (§4.4), sans `sweep` implicite.
    pub fn shrink_locals(&mut self, n: usize) -> VmResult<()> {
        self.locals.shrink(&mut self.heap, n)
    }

    // ---- Tas (C2, §6) ---------------------------------------------------

    /// Alloue un tableau de `size` éléments `Null`.
    pub fn make_array(&mut self, size: usize) -> HeapHandle {
        self.heap.allocate_array(vec![Value::Null; size])
    }

    /// Alloue (ou réutilise, si `!always_new`) une chaîne depuis `bytes`.
    pub fn make_string(&mut self, bytes: &[u8], always_new: bool) -> HeapHandle {
        self.heap.intern_or_allocate(bytes, always_new)
    }

    /// Force un passage de `sweep` manuel (les opcodes mutateurs en
    /// déclenchent déjà un automatiquement, voir §4.2).
    pub fn sweep(&mut self) -> SweepReport {
        self.heap.sweep()
    }

    /// Nombre d'objets vivants sur le tas (diagnostic/tests).
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Formate une valeur pour l'affichage, en déréférençant le tas.
    pub fn format_value(&self, v: &Value) -> String {
        self.heap.format_value(v)
    }

    fn container_len(&self, v: &Value) -> VmResult<usize> {
        let handle = v.expect_memory()?;
        self.heap.container_len(handle)
    }

    fn read_string_value(&self, v: &Value) -> VmResult<String> {
        let handle = v.expect_memory()?;
        let bytes = self.heap.str_bytes(handle)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VmError::TypeError("nom non-UTF8".to_string()))
    }

    // ---- Hôte (print/clock, C8, stdlib optionnel) ----------------------

    pub(crate) fn host_print(&mut self, s: &str) {
        self.host.print(s);
    }

    pub(crate) fn host_now_elapsed_ms(&mut self) -> i32 {
        let now = self.host.now();
        now.saturating_duration_since(self.started_at).as_millis() as i32
    }

    // ---- Diagnostics (C10, §6) ------------------------------------------

    /// Vidage lisible de la pile d'opérandes courante.
    pub fn dump_stack(&self) -> String {
        self.stack
            .as_slice()
            .iter()
            .map(|v| self.format_value(v))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Vidage lisible des globales courantes.
    pub fn dump_globals(&self) -> String {
        let mut entries: Vec<String> = self
            .globals
            .iter()
            .map(|(name, v)| format!("{name} = {}", self.format_value(v)))
            .collect();
        entries.sort();
        entries.join("\n")
    }

    /// Vidage lisible des locaux courants.
    pub fn dump_locals(&self) -> String {
        (0..self.locals.len())
            .map(|i| {
                let v = self.locals.get(i).unwrap_or(Value::Null);
                format!("[{i}] = {}", self.format_value(&v))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // ---- Dispatch (C5) ---------------------------------------------------

    /// Exécute un opcode. Ne fait rien si la VM est déjà à la fin.
    pub fn step(&mut self) -> VmResult<()> {
        if let Some(gas) = self.gas_left.as_mut() {
            if *gas == 0 {
                return Err(VmError::OutOfGas);
            }
            *gas -= 1;
        }

        if self.is_at_end() {
            return Ok(());
        }

        let pc = self.pc;
        let byte = self.image.operations[pc];
        let Some(op) = Op::decode(byte) else {
            log::error!("opcode inconnu 0x{byte:02x} à pc={pc}");
            self.pc = pc + 1;
            return Ok(());
        };

        if self.options.trace {
            log::trace!("[pc={pc:04}] {op}");
        }

        let operand_start = pc + 1;
        let outcome = self.dispatch(op, operand_start)?;

        self.pc = match outcome {
            StepOutcome::Advance => operand_start + op.operand_len(),
            StepOutcome::Jump(dst) => dst,
        };

        if triggers_sweep(op) {
            let report = self.heap.sweep();
            log::debug!("sweep après {op}: freed={} retained={}", report.freed, report.retained);
        }

        Ok(())
    }

    /// Exécute jusqu'à ce que la VM atteigne la fin du flux ou que `End`
    /// ait été exécuté.
    pub fn run(&mut self) -> VmResult<()> {
        while !self.is_at_end() {
            self.step()?;
        }
        Ok(())
    }

    fn read_u8_operand(&self, at: usize) -> VmResult<u8> {
        read_u8(&self.image.operations, at).map_err(|e| VmError::IndexError(e.to_string()))
    }

    fn read_addr_operand(&self, at: usize) -> VmResult<usize> {
        read_addr(&self.image.operations, at).map_err(|e| VmError::IndexError(e.to_string()))
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, op: Op, operand_at: usize) -> VmResult<StepOutcome> {
        use Op::*;
        match op {
            PushConstInt => {
                let idx = self.read_u8_operand(operand_at)? as usize;
                let v = *self
                    .image
                    .ints
                    .get(idx)
                    .ok_or_else(|| VmError::IndexError(format!("constante entière {idx} absente")))?;
                self.push(Value::Int(v))?;
            }
            PushConstChar => {
                let c = self.read_u8_operand(operand_at)?;
                self.push(Value::Char(c))?;
            }
            PushConstString => {
                let idx = self.read_u8_operand(operand_at)? as usize;
                let s = self
                    .image
                    .ids
                    .get(idx)
                    .ok_or_else(|| VmError::IndexError(format!("constante chaîne {idx} absente")))?
                    .clone();
                let handle = self.heap.intern_or_allocate(s.as_bytes(), true);
                self.push(Value::MemoryObj(handle))?;
            }
            PushTrue => self.push(Value::Bool(true))?,
            PushFalse => self.push(Value::Bool(false))?,

            Add => {
                let b = self.pop().expect_int()?;
                let a = self.pop().expect_int()?;
                self.push(Value::Int(a.wrapping_add(b)))?;
            }
            Sub => {
                let top = self.pop().expect_int()?;
                let beneath = self.pop().expect_int()?;
                self.push(Value::Int(beneath.wrapping_sub(top)))?;
            }
            Negate => {
                let v = self.pop();
                let out = match v {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Number(n) => Value::Number(-n),
                    other => {
                        return Err(VmError::TypeError(format!(
                            "Negate attend Int ou Number, trouvé {}",
                            other.type_name()
                        )))
                    }
                };
                self.push(out)?;
            }

            Equals | NotEq => {
                let b = self.pop();
                let a = self.pop();
                let eq = self.heap.values_equal(&a, &b)?;
                self.push(Value::Bool(if matches!(op, NotEq) { !eq } else { eq }))?;
            }

            Less | More | LessOrEq | MoreOrEq => {
                let top = self.pop();
                let beneath = self.pop();
                let result = match (&beneath, &top) {
                    (Value::Int(l), Value::Int(r)) => compare_ord(op, *l as f64, *r as f64),
                    (Value::Number(l), Value::Number(r)) => compare_ord(op, *l as f64, *r as f64),
                    (l, r) => {
                        return Err(VmError::TypeError(format!(
                            "comparaison entre {} et {}",
                            l.type_name(),
                            r.type_name()
                        )))
                    }
                };
                self.push(Value::Bool(result))?;
            }

            And => {
                let b = self.pop().expect_bool()?;
                let a = self.pop().expect_bool()?;
                self.push(Value::Bool(a && b))?;
            }
            Or => {
                let b = self.pop().expect_bool()?;
                let a = self.pop().expect_bool()?;
                self.push(Value::Bool(a || b))?;
            }
            Not => {
                let v = self.pop().expect_bool()?;
                self.push(Value::Bool(!v))?;
            }

            Get => {
                let name_val = self.pop();
                let name = self.read_string_value(&name_val)?;
                let v = self.globals.get(&name)?;
                self.push(v)?;
            }
            Set => {
                let value = self.pop();
                let name_val = self.pop();
                let name = self.read_string_value(&name_val)?;
                self.globals.set(&mut self.heap, name, value)?;
            }

            GetLocal => {
                let id = self.read_u8_operand(operand_at)? as usize;
                let v = self.locals.get(id)?;
                self.push(v)?;
            }
            SetLocal => {
                let id = self.read_u8_operand(operand_at)? as usize;
                let value = self.pop();
                self.locals.set(&mut self.heap, id, value)?;
            }

            GetArray => {
                let index = self.pop().expect_int()?;
                let container = self.pop();
                let handle = container.expect_memory()?;
                let elem = self.read_container_elem(handle, index)?;
                self.push(elem)?;
            }
            SetArray => {
                let value = self.pop();
                let container = self.pop();
                let index = self.pop().expect_int()?;
                let handle = container.expect_memory()?;
                self.write_container_elem(handle, index, value)?;
            }

            ShrinkLocal => {
                let n = self.read_u8_operand(operand_at)? as usize;
                self.locals.shrink(&mut self.heap, n)?;
            }

            Jump => {
                let dst = self.read_addr_operand(operand_at)?;
                return Ok(StepOutcome::Jump(dst));
            }
            JumpIfNot => {
                let dst = self.read_addr_operand(operand_at)?;
                let cond = self.pop().expect_bool()?;
                if !cond {
                    return Ok(StepOutcome::Jump(dst));
                }
            }

            Call => {
                let func = self.pop().expect_native()?;
                if let Err(err) = func(self) {
                    log::warn!("fonction native en erreur: {err}");
                    return Err(err);
                }
            }

            End => {
                self.ended = true;
            }
        }
        Ok(StepOutcome::Advance)
    }

    fn read_container_elem(&self, handle: HeapHandle, index: i32) -> VmResult<Value> {
        if let Ok(arr) = self.heap.array_values(handle) {
            let idx = non_negative_index(index, arr.len())?;
            return Ok(arr[idx].clone());
        }
        let bytes = self.heap.str_bytes(handle)?;
        let idx = non_negative_index(index, bytes.len())?;
        Ok(Value::Char(bytes[idx]))
    }

    fn write_container_elem(&mut self, handle: HeapHandle, index: i32, value: Value) -> VmResult<()> {
        if self.heap.array_values(handle).is_ok() {
            let len = self.heap.container_len(handle)?;
            let idx = non_negative_index(index, len)?;
            return self.heap.set_array_elem(handle, idx, value);
        }
        let len = self.heap.container_len(handle)?;
        let idx = non_negative_index(index, len)?;
        let byte = value.expect_char()?;
        self.heap.set_str_byte(handle, idx, byte)
    }
}

fn non_negative_index(index: i32, len: usize) -> VmResult<usize> {
    if index < 0 || index as usize >= len {
        return Err(VmError::IndexError(format!("index {index} hors bornes (taille {len})")));
    }
    Ok(index as usize)
}

fn compare_ord(op: Op, l: f64, r: f64) -> bool {
    match op {
        Op::Less => l < r,
        Op::More => l > r,
        Op::LessOrEq => l <= r,
        Op::MoreOrEq => l >= r,
        _ => unreachable!("compare_ord appelé avec un opcode non-comparaison"),
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.heap.shutdown();
    }
}
