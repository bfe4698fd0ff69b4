//! Erreurs surfacées par la VM au driver.

use std::fmt::{self, Display};

/// Résultat standard de la VM.
pub type VmResult<T> = Result<T, VmError>;

/// Erreurs que `step`/`run` peuvent renvoyer.
///
/// Un opcode inconnu n'apparaît volontairement PAS ici : il est journalisé
/// (niveau `error`) et le compteur de programme avance d'un octet — voir
/// `Vm::step`. Toutes les autres erreurs interrompent l'étape en cours ;
/// la pile et les variables reflètent alors tout ce qui a été muté avant
/// l'opcode fautif, et `pc` reste pointé dessus.
#[derive(Debug)]
pub enum VmError {
    /// Un opérande avait le mauvais type pour l'opcode courant.
    TypeError(String),
    /// Lecture d'une globale absente de la table.
    UndefinedName(String),
    /// Lecture/écriture d'un local hors bornes.
    UndefinedLocal(usize),
    /// Index de tableau/chaîne hors bornes.
    IndexError(String),
    /// Une fonction native a signalé un échec.
    NativeError(String),
    /// La pile d'opérandes a dépassé `VmOptions::stack_limit`.
    StackOverflow,
    /// Le budget d'étapes (`VmOptions::gas_limit`) est épuisé.
    OutOfGas,
}

impl Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::TypeError(s) => write!(f, "type error: {s}"),
            VmError::UndefinedName(name) => write!(f, "undefined global: {name:?}"),
            VmError::UndefinedLocal(id) => write!(f, "undefined local slot: {id}"),
            VmError::IndexError(s) => write!(f, "index error: {s}"),
            VmError::NativeError(s) => write!(f, "native error: {s}"),
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::OutOfGas => write!(f, "out of gas"),
        }
    }
}

impl std::error::Error for VmError {}
