// src/regression/mod.rs

pub mod formula;
pub mod glm;

pub use formula::{Formula, Term};
pub use glm::{fit_many, fit_quasipoisson, FittedModel, GlmOptions};
