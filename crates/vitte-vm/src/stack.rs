//! Pile d'opérandes (C3).
//!
//! La pile n'est pas une racine de comptage de références (§5) : les
//! opérations de bas niveau ne paniquent donc jamais sur sous-remplissage.
//! `pop`/`top` renvoient `Value::Null` quand la pile est vide ; c'est le
//! handler d'opcode qui, en attendant un type précis, transforme ce `Null`
//! inattendu en `TypeError` — et c'est ainsi que l'invariant « la
//! profondeur de pile ne descend jamais sous zéro » (§8) se vérifie sans
//! jamais paniquer.

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// Pile LIFO de valeurs.
#[derive(Default)]
pub struct OperandStack {
    values: Vec<Value>,
}

impl OperandStack {
    /// Pile vide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Profondeur actuelle.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Vrai si la pile est vide.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Empile une valeur. `StackOverflow` si `limit` est dépassée.
    pub fn push(&mut self, v: Value, limit: Option<usize>) -> VmResult<()> {
        if let Some(max) = limit {
            if self.values.len() >= max {
                return Err(VmError::StackOverflow);
            }
        }
        self.values.push(v);
        Ok(())
    }

    /// Dépile et renvoie la valeur au sommet, ou `Value::Null` si vide.
    pub fn pop(&mut self) -> Value {
        self.values.pop().unwrap_or(Value::Null)
    }

    /// Lit la valeur au sommet sans la dépiler, ou `Value::Null` si vide.
    pub fn top(&self) -> Value {
        self.values.last().cloned().unwrap_or(Value::Null)
    }

    /// Vue de diagnostic sur le contenu courant, du fond vers le sommet.
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }
}
