//! Tas d'objets référencés et mutables (C2).
//!
//! La source historique range les objets du tas dans une liste intrusive
//! simplement chaînée, ancrée sur un sentinelle racine ; chaque nœud porte
//! un compteur de références et un drapeau `dead` dérivé de `refcount == 0`.
//! On réimplémente ça ici en **arène à emplacements**, ce que §9 autorise
//! explicitement ("an implementation may substitute an arena with
//! generational indices ... without changing observable behavior"), avec
//! un compteur de génération par emplacement pour détecter en toute sûreté
//! une référence devenue caduque après un `sweep` — là où la liste d'origine
//! aurait simplement déréférencé un pointeur mort.

use std::fmt;

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Référence stable vers un objet du tas.
///
/// Composée d'un index d'emplacement et d'une génération : si l'emplacement
/// est libéré par un `sweep` puis réutilisé, toute poignée encore détenue
/// ailleurs (typiquement sur la pile d'opérandes, qui n'est pas comptée —
/// voir §5) porte l'ancienne génération et échoue proprement au lieu de
/// pointer vers le mauvais objet.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

/// Variante d'objet du tas : chaîne mutable ou tableau de taille fixe.
#[derive(Debug, Clone)]
pub enum HeapNode {
    /// Séquence d'octets mutable.
    Str(Vec<u8>),
    /// Vecteur de valeurs à capacité fixe.
    Array(Vec<Value>),
}

enum Slot {
    Free { next_free: Option<u32> },
    Occupied { generation: u32, refcount: u32, node: HeapNode },
}

/// Tas de la VM : alloue, compte les références et balaie les objets morts.
pub struct Heap {
    slots: Vec<Slot>,
    /// Génération à attribuer à la *prochaine* occupation de chaque
    /// emplacement (indexé comme `slots`). Incrémentée à chaque `sweep`
    /// libérant l'emplacement, ce qui invalide toute poignée caduque.
    next_generations: Vec<u32>,
    free_head: Option<u32>,
}

/// Compte-rendu d'un passage de `sweep`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Nombre d'objets libérés lors de ce passage.
    pub freed: usize,
    /// Nombre d'objets encore vivants après ce passage.
    pub retained: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Tas vide.
    pub fn new() -> Self {
        Self { slots: Vec::new(), next_generations: Vec::new(), free_head: None }
    }

    /// Nombre d'objets actuellement vivants (hors emplacements libres).
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied { .. }))
            .count()
    }

    /// Vrai si le tas ne contient aucun objet vivant.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc_slot(&mut self, node: HeapNode) -> HeapHandle {
        if let Some(index) = self.free_head {
            let Slot::Free { next_free } = self.slots[index as usize] else {
                unreachable!("free_head points at an occupied slot")
            };
            self.free_head = next_free;
            let generation = self.next_generations[index as usize];
            self.slots[index as usize] = Slot::Occupied { generation, refcount: 0, node };
            return HeapHandle { index, generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { generation: 0, refcount: 0, node });
        self.next_generations.push(1);
        HeapHandle { index, generation: 0 }
    }

    /// Alloue une nouvelle chaîne avec refcount 0.
    ///
    /// Le nouvel objet est immédiatement visible au prochain `sweep` ; il
    /// appartient à l'appelant de l'assigner dans un slot compté avant que
    /// cela n'arrive (voir §4.2).
    pub fn allocate_string(&mut self, bytes: Vec<u8>) -> HeapHandle {
        self.alloc_slot(HeapNode::Str(bytes))
    }

    /// Alloue un nouveau tableau avec refcount 0.
    pub fn allocate_array(&mut self, values: Vec<Value>) -> HeapHandle {
        self.alloc_slot(HeapNode::Array(values))
    }

    /// Renvoie une chaîne existante égale à `bytes` si `always_new` est
    /// faux et qu'une telle chaîne existe déjà ; sinon alloue toujours une
    /// copie fraîche. Utilisé par `PushConstString` avec `always_new = true`
    /// (les constantes ne doivent jamais être aliasées) et par les appelants
    /// natifs qui souhaitent partager une chaîne existante.
    pub fn intern_or_allocate(&mut self, bytes: &[u8], always_new: bool) -> HeapHandle {
        if !always_new {
            for (index, slot) in self.slots.iter().enumerate() {
                if let Slot::Occupied { generation, node: HeapNode::Str(s), .. } = slot {
                    if s.as_slice() == bytes {
                        return HeapHandle { index: index as u32, generation: *generation };
                    }
                }
            }
        }
        self.allocate_string(bytes.to_vec())
    }

    fn slot(&self, handle: HeapHandle) -> VmResult<&Slot> {
        match self.slots.get(handle.index as usize) {
            Some(slot @ Slot::Occupied { generation, .. }) if *generation == handle.generation => {
                Ok(slot)
            }
            _ => Err(VmError::IndexError(format!("référence tas caduque: {handle:?}"))),
        }
    }

    fn slot_mut(&mut self, handle: HeapHandle) -> VmResult<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { generation, .. }) if *generation != handle.generation => {
                Err(VmError::IndexError(format!("référence tas caduque: {handle:?}")))
            }
            Some(slot @ Slot::Occupied { .. }) => Ok(slot),
            _ => Err(VmError::IndexError(format!("référence tas caduque: {handle:?}"))),
        }
    }

    fn node(&self, handle: HeapHandle) -> VmResult<&HeapNode> {
        match self.slot(handle)? {
            Slot::Occupied { node, .. } => Ok(node),
            Slot::Free { .. } => unreachable!(),
        }
    }

    fn node_mut(&mut self, handle: HeapHandle) -> VmResult<&mut HeapNode> {
        match self.slot_mut(handle)? {
            Slot::Occupied { node, .. } => Ok(node),
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Lit le contenu d'une chaîne, `TypeError` si `handle` est un tableau.
    pub fn str_bytes(&self, handle: HeapHandle) -> VmResult<&[u8]> {
        match self.node(handle)? {
            HeapNode::Str(s) => Ok(s),
            HeapNode::Array(_) => Err(VmError::TypeError("attendu une chaîne, trouvé un tableau".into())),
        }
    }

    /// Longueur du conteneur (chaîne ou tableau) référencé par `handle`.
    pub fn container_len(&self, handle: HeapHandle) -> VmResult<usize> {
        match self.node(handle)? {
            HeapNode::Str(s) => Ok(s.len()),
            HeapNode::Array(a) => Ok(a.len()),
        }
    }

    /// Lit le contenu d'un tableau, `TypeError` si `handle` est une chaîne.
    pub fn array_values(&self, handle: HeapHandle) -> VmResult<&[Value]> {
        match self.node(handle)? {
            HeapNode::Array(a) => Ok(a),
            HeapNode::Str(_) => Err(VmError::TypeError("attendu un tableau, trouvé une chaîne".into())),
        }
    }

    /// Écrit un octet de chaîne à `index`, `IndexError` hors bornes.
    pub fn set_str_byte(&mut self, handle: HeapHandle, index: usize, byte: u8) -> VmResult<()> {
        match self.node_mut(handle)? {
            HeapNode::Str(s) => {
                let slot = s
                    .get_mut(index)
                    .ok_or_else(|| VmError::IndexError(format!("index de chaîne {index} hors bornes")))?;
                *slot = byte;
                Ok(())
            }
            HeapNode::Array(_) => Err(VmError::TypeError("attendu une chaîne, trouvé un tableau".into())),
        }
    }

    /// Écrit un élément de tableau à `index`, `IndexError` hors bornes.
    pub fn set_array_elem(&mut self, handle: HeapHandle, index: usize, value: Value) -> VmResult<()> {
        match self.node_mut(handle)? {
            HeapNode::Array(a) => {
                let slot = a
                    .get_mut(index)
                    .ok_or_else(|| VmError::IndexError(format!("index de tableau {index} hors bornes")))?;
                *slot = value;
                Ok(())
            }
            HeapNode::Str(_) => Err(VmError::TypeError("attendu un tableau, trouvé une chaîne".into())),
        }
    }

    /// Incrémente le refcount d'un objet (écriture dans un slot local/global).
    pub fn incref(&mut self, handle: HeapHandle) -> VmResult<()> {
        match self.slot_mut(handle)? {
            Slot::Occupied { refcount, .. } => {
                *refcount += 1;
                Ok(())
            }
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Décrémente le refcount d'un objet (écrasement/suppression d'un slot).
    pub fn decref(&mut self, handle: HeapHandle) -> VmResult<()> {
        match self.slot_mut(handle)? {
            Slot::Occupied { refcount, .. } => {
                *refcount = refcount.saturating_sub(1);
                Ok(())
            }
            Slot::Free { .. } => unreachable!(),
        }
    }

    /// Compare deux valeurs pour `Equals`/`NotEq` (§4.1).
    ///
    /// `MemoryObj` compare les chaînes octet-à-octet et les tableaux par
    /// identité (même poignée). `UserData` compare par identité du `Rc`.
    /// `NativeFunction` n'est jamais comparable.
    pub fn values_equal(&self, a: &Value, b: &Value) -> VmResult<bool> {
        match (a, b) {
            (Value::Null, Value::Null) => Ok(true),
            (Value::Int(x), Value::Int(y)) => Ok(x == y),
            (Value::Number(x), Value::Number(y)) => Ok(x == y),
            (Value::Char(x), Value::Char(y)) => Ok(x == y),
            (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
            (Value::MemoryObj(ha), Value::MemoryObj(hb)) => {
                match (self.node(*ha)?, self.node(*hb)?) {
                    (HeapNode::Str(x), HeapNode::Str(y)) => Ok(x == y),
                    (HeapNode::Array(_), HeapNode::Array(_)) => Ok(ha == hb),
                    _ => Err(VmError::TypeError(
                        "comparaison entre une chaîne et un tableau".into(),
                    )),
                }
            }
            (Value::NativeFunction(_), Value::NativeFunction(_)) => {
                Err(VmError::TypeError("les fonctions natives ne sont pas comparables".into()))
            }
            (Value::UserData(x), Value::UserData(y)) => Ok(std::rc::Rc::ptr_eq(x, y)),
            (x, y) => Err(VmError::TypeError(format!(
                "types incompatibles pour l'égalité: {} et {}",
                x.type_name(),
                y.type_name()
            ))),
        }
    }

    /// Formate une valeur pour `print`/les dumpers de diagnostic,
    /// déréférençant les objets du tas.
    pub fn format_value(&self, v: &Value) -> String {
        match v {
            Value::Null => "null".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Char(c) => (*c as char).to_string(),
            Value::Bool(b) => b.to_string(),
            Value::NativeFunction(_) => "<native>".to_string(),
            Value::UserData(_) => "<userdata>".to_string(),
            Value::MemoryObj(h) => match self.node(*h) {
                Ok(HeapNode::Str(s)) => String::from_utf8_lossy(s).into_owned(),
                Ok(HeapNode::Array(a)) => {
                    let items: Vec<String> = a.iter().map(|v| self.format_value(v)).collect();
                    format!("[{}]", items.join(", "))
                }
                Err(_) => "<tas invalide>".to_string(),
            },
        }
    }

    /// Passe linéaire depuis le début de l'arène : libère tout objet dont
    /// le refcount est 0. Ne s'exécute qu'en fin des opcodes mutateurs
    /// (`Set`, `SetLocal`, `SetArray`, `ShrinkLocal`) — voir §4.2 et §5.
    pub fn sweep(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        for index in 0..self.slots.len() {
            let should_free = matches!(
                &self.slots[index],
                Slot::Occupied { refcount: 0, .. }
            );
            if should_free {
                self.slots[index] = Slot::Free { next_free: self.free_head };
                self.free_head = Some(index as u32);
                self.next_generations[index] = self.next_generations[index].wrapping_add(1);
                report.freed += 1;
            } else if matches!(&self.slots[index], Slot::Occupied { .. }) {
                report.retained += 1;
            }
        }
        report
    }

    /// Libère tout, sans égard au refcount (arrêt de la VM).
    pub fn shutdown(&mut self) {
        self.slots.clear();
        self.next_generations.clear();
        self.free_head = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_sweep_reclaims_zero_refcount() {
        let mut heap = Heap::new();
        let h = heap.allocate_string(b"hi".to_vec());
        assert_eq!(heap.len(), 1);
        let report = heap.sweep();
        assert_eq!(report.freed, 1);
        assert_eq!(heap.len(), 0);
        assert!(heap.str_bytes(h).is_err());
    }

    #[test]
    fn incref_protects_from_sweep() {
        let mut heap = Heap::new();
        let h = heap.allocate_string(b"hi".to_vec());
        heap.incref(h).unwrap();
        heap.sweep();
        assert_eq!(heap.len(), 1);
        heap.decref(h).unwrap();
        heap.sweep();
        assert_eq!(heap.len(), 0);
    }

    #[test]
    fn repeated_sweep_is_idempotent() {
        let mut heap = Heap::new();
        heap.allocate_string(b"x".to_vec());
        heap.incref(HeapHandle { index: 0, generation: 0 }).unwrap();
        heap.sweep();
        let r2 = heap.sweep();
        assert_eq!(r2.freed, 0);
        assert_eq!(r2.retained, 1);
    }

    #[test]
    fn intern_or_allocate_respects_always_new() {
        let mut heap = Heap::new();
        let a = heap.intern_or_allocate(b"x", true);
        let b = heap.intern_or_allocate(b"x", true);
        assert_ne!(a, b);
        let c = heap.intern_or_allocate(b"x", false);
        assert_eq!(a, c);
    }

    #[test]
    fn stale_handle_after_reuse_is_an_error() {
        let mut heap = Heap::new();
        let old = heap.allocate_string(b"x".to_vec());
        heap.sweep(); // refcount 0 -> freed, slot recycled on next alloc
        let _new = heap.allocate_string(b"y".to_vec());
        assert!(heap.str_bytes(old).is_err());
    }

    #[test]
    fn values_equal_strings_by_content_arrays_by_identity() {
        let mut heap = Heap::new();
        let s1 = heap.allocate_string(b"ab".to_vec());
        let s2 = heap.allocate_string(b"ab".to_vec());
        assert!(heap.values_equal(&Value::MemoryObj(s1), &Value::MemoryObj(s2)).unwrap());

        let a1 = heap.allocate_array(vec![Value::Int(1)]);
        let a2 = heap.allocate_array(vec![Value::Int(1)]);
        assert!(!heap.values_equal(&Value::MemoryObj(a1), &Value::MemoryObj(a2)).unwrap());
        assert!(heap.values_equal(&Value::MemoryObj(a1), &Value::MemoryObj(a1)).unwrap());
    }

    #[test]
    fn native_functions_are_never_comparable() {
        fn noop(_: &mut crate::Vm) -> VmResult<()> {
            Ok(())
        }
        let heap = Heap::new();
        let r = heap.values_equal(&Value::NativeFunction(noop), &Value::NativeFunction(noop));
        assert!(r.is_err());
    }

    #[test]
    fn user_data_compares_by_rc_identity() {
        let heap = Heap::new();
        let shared: std::rc::Rc<dyn std::any::Any> = std::rc::Rc::new(42i32);
        let a = Value::UserData(shared.clone());
        let b = Value::UserData(shared.clone());
        let other = Value::UserData(std::rc::Rc::new(42i32));

        assert!(heap.values_equal(&a, &b).unwrap());
        assert!(!heap.values_equal(&a, &other).unwrap());
    }
}
