//! Configuration de construction/exécution de la VM (C11).
//!
//! Rien ici n'affecte la sémantique des opcodes de §4.6 — ce sont des
//! garde-fous opérationnels que l'hôte peut activer ou non.

use std::time::Instant;

/// Options de construction de la VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Profondeur maximale de la pile d'opérandes. `None` = illimitée.
    pub stack_limit: Option<usize>,
    /// Budget d'étapes (`step`) avant `VmError::OutOfGas`. `None` = illimité.
    pub gas_limit: Option<u64>,
    /// Journalise chaque opcode dispatché (niveau `trace`, voir C10).
    pub trace: bool,
    /// Installe un petit stdlib (`print`, `clock_ms`) comme globales natives.
    pub stdlib: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            stack_limit: Some(1 << 20),
            gas_limit: None,
            trace: false,
            stdlib: false,
        }
    }
}

impl VmOptions {
    /// Active/désactive la journalisation d'opcodes.
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    /// Active/désactive l'installation du petit stdlib.
    pub fn with_stdlib(mut self, on: bool) -> Self {
        self.stdlib = on;
        self
    }

    /// Définit le budget de gas.
    pub fn with_gas_limit(mut self, gas: Option<u64>) -> Self {
        self.gas_limit = gas;
        self
    }

    /// Définit la profondeur maximale de pile.
    pub fn with_stack_limit(mut self, limit: Option<usize>) -> Self {
        self.stack_limit = limit;
        self
    }
}

/// Environnement hôte pour les I/O exposées aux fonctions natives (ex:
/// `print`). Permet de rediriger la sortie en test sans toucher la VM.
pub trait Host: 'static {
    /// Émet une ligne de sortie utilisateur.
    fn print(&mut self, s: &str);
    /// Horodatage haute résolution (pour `clock_ms`).
    fn now(&mut self) -> Instant {
        Instant::now()
    }
}

/// Hôte par défaut : écrit sur `stdout`, horloge système.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, s: &str) {
        println!("{s}");
    }
}
