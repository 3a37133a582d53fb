//! `rewind disasm`: human-readable class listing

use super::read_class;
use anyhow::Context;
use rewind_bytecode::pretty::disassemble_class;
use rewind_engine::{AsyncTransformer, TransformOptions};
use std::path::Path;

pub fn execute(input: &Path, transformed: bool) -> anyhow::Result<()> {
    let mut class = read_class(input)?;
    if transformed {
        AsyncTransformer::new(TransformOptions::default())
            .transform_class(&mut class)
            .with_context(|| format!("failed to transform {}", input.display()))?;
    }
    print!("{}", disassemble_class(&class));
    Ok(())
}
