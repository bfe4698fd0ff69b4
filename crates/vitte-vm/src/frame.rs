//! Store de variables : frame locale indexée + table de globales nommées (C4).
//!
//! Il n'y a qu'une seule frame locale pour tout le programme : ce jeu
//! d'opcodes n'a pas d'appel de fonction bytecode imbriqué (`Call` invoque
//! une fonction native synchrone, pas un sous-programme avec sa propre
//! frame) — voir §4.8.

use std::collections::HashMap;

use crate::error::{VmError, VmResult};
use crate::heap::Heap;
use crate::value::Value;

/// Frame de variables locales, indexée de façon dense.
#[derive(Default)]
pub struct Locals {
    slots: Vec<Value>,
}

impl Locals {
    /// Frame vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre de slots actuellement occupés.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Vrai si la frame ne contient aucun slot.
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Charge le local `i`, `UndefinedLocal` si hors bornes.
    pub fn get(&self, i: usize) -> VmResult<Value> {
        self.slots.get(i).cloned().ok_or(VmError::UndefinedLocal(i))
    }

    /// Stocke `v` au slot `i`, en agrandissant la frame si besoin.
    ///
    /// Ajuste le refcount tas de l'ancienne et de la nouvelle valeur quand
    /// elles portent une référence mémoire (§4.4).
    pub fn set(&mut self, heap: &mut Heap, i: usize, v: Value) -> VmResult<()> {
        if i >= self.slots.len() {
            self.slots.resize(i + 1, Value::Null);
        }
        if let Some(old) = self.slots[i].heap_handle() {
            heap.decref(old)?;
        }
        if let Some(new) = v.heap_handle() {
            heap.incref(new)?;
        }
        self.slots[i] = v;
        Ok(())
    }

    /// Dépile `n` slots depuis la fin, décrémentant le refcount tas de
    /// chacun. Saturé à la taille actuelle de la frame : `ShrinkLocal 0` est
    /// un no-op, et enchaîner deux shrinks équivaut à un seul de la somme
    /// tant que la frame a assez de slots (§8).
    pub fn shrink(&mut self, heap: &mut Heap, n: usize) -> VmResult<()> {
        let n = n.min(self.slots.len());
        for _ in 0..n {
            if let Some(v) = self.slots.pop() {
                if let Some(h) = v.heap_handle() {
                    heap.decref(h)?;
                }
            }
        }
        Ok(())
    }
}

/// Table de variables globales, nommées.
#[derive(Default)]
pub struct Globals {
    map: HashMap<String, Value>,
}

impl Globals {
    /// Table vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lit une globale, `UndefinedName` si absente.
    pub fn get(&self, name: &str) -> VmResult<Value> {
        self.map.get(name).cloned().ok_or_else(|| VmError::UndefinedName(name.to_string()))
    }

    /// Assigne une globale (créée si absente), en ajustant les refcounts
    /// tas comme pour [`Locals::set`].
    pub fn set(&mut self, heap: &mut Heap, name: String, v: Value) -> VmResult<()> {
        if let Some(old) = self.map.get(&name).and_then(Value::heap_handle) {
            heap.decref(old)?;
        }
        if let Some(new) = v.heap_handle() {
            heap.incref(new)?;
        }
        self.map.insert(name, v);
        Ok(())
    }

    /// Accès direct en lecture, sans passer par le `Result` (utilisé par les
    /// dumpers de diagnostic et les hôtes qui veulent inspecter l'état).
    pub fn get_raw(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    /// Itère les paires nom/valeur (diagnostic).
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_set_get_roundtrip() {
        let mut heap = Heap::new();
        let mut locals = Locals::new();
        locals.set(&mut heap, 3, Value::Int(9)).unwrap();
        assert_eq!(locals.len(), 4);
        assert!(matches!(locals.get(3).unwrap(), Value::Int(9)));
        assert!(matches!(locals.get(0).unwrap(), Value::Null));
    }

    #[test]
    fn get_out_of_range_is_undefined_local() {
        let locals = Locals::new();
        assert!(matches!(locals.get(0), Err(VmError::UndefinedLocal(0))));
    }

    #[test]
    fn set_local_adjusts_heap_refcount() {
        let mut heap = Heap::new();
        let mut locals = Locals::new();
        let h = heap.allocate_string(b"x".to_vec());
        locals.set(&mut heap, 0, Value::MemoryObj(h)).unwrap();
        heap.sweep();
        assert_eq!(heap.len(), 1); // refcount 1, survives sweep

        locals.set(&mut heap, 0, Value::Null).unwrap();
        heap.sweep();
        assert_eq!(heap.len(), 0); // refcount back to 0, reclaimed
    }

    #[test]
    fn shrink_is_saturating_and_idempotent_when_zero() {
        let mut heap = Heap::new();
        let mut locals = Locals::new();
        locals.set(&mut heap, 0, Value::Int(1)).unwrap();
        locals.shrink(&mut heap, 0).unwrap();
        assert_eq!(locals.len(), 1);
        locals.shrink(&mut heap, 5).unwrap();
        assert_eq!(locals.len(), 0);
    }

    #[test]
    fn global_set_get_roundtrip() {
        let mut heap = Heap::new();
        let mut globals = Globals::new();
        globals.set(&mut heap, "x".into(), Value::Int(5)).unwrap();
        assert!(matches!(globals.get("x").unwrap(), Value::Int(5)));
        assert!(matches!(globals.get("missing"), Err(VmError::UndefinedName(_))));
    }
}
