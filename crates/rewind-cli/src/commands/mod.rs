//! Subcommand implementations

pub mod analyze;
pub mod disasm;
pub mod transform;

use anyhow::Context;
use rewind_bytecode::ClassFile;
use rewind_engine::TransformOptions;
use std::path::Path;

/// Read a class from its JSON file
pub fn read_class(path: &Path) -> anyhow::Result<ClassFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    ClassFile::from_json(&text).with_context(|| format!("{} is not a valid class file", path.display()))
}

/// Options from `config`, or the defaults
pub fn load_options(config: Option<&Path>) -> anyhow::Result<TransformOptions> {
    match config {
        Some(path) => TransformOptions::load(path)
            .with_context(|| format!("failed to load options from {}", path.display())),
        None => Ok(TransformOptions::default()),
    }
}
