//! Secure code execution and grading for ProgramPrimitives exercises.
//!
//! Data flow: `Grader` → `PreCheck` → `ExecutionEngine` (single run) or
//! `TestRunner` (one engine call per case) → `scorer` on submit.

pub mod engine;
pub mod grader;
pub mod languages;
pub mod policy;
pub mod precheck;
pub mod runner;
pub mod scorer;


pub use engine::{create_engine, ExecutionEngine, ExecutionLimits, ExecutionRequest};
pub use grader::Grader;
pub use languages::{LanguageConfig, LanguageConfigManager};
pub use policy::{PolicyRegistry, PolicyRule, Verdict};
pub use precheck::PreCheck;
pub use runner::TestRunner;
