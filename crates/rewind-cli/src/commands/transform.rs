//! `rewind transform`: rewrite a class and write it back as JSON

use super::{load_options, read_class};
use anyhow::Context;
use rewind_engine::{AsyncTransformer, CollectingSink};
use std::path::Path;
use std::sync::Arc;

pub fn execute(
    input: &Path,
    output: Option<&Path>,
    config: Option<&Path>,
    no_verify: bool,
) -> anyhow::Result<()> {
    let mut options = load_options(config)?;
    if no_verify {
        options.verify_output = false;
    }
    let mut class = read_class(input)?;

    let sink = Arc::new(CollectingSink::new());
    let transformer = AsyncTransformer::new(options).with_sink(sink.clone());
    let report = transformer
        .transform_class(&mut class)
        .with_context(|| format!("failed to transform {}", input.display()))?;

    for diagnostic in sink.take() {
        eprintln!("{}", diagnostic);
    }
    eprintln!(
        "{}: {} transformed, {} unchanged, {} continuation(s)",
        class.name,
        report.transformed,
        report.unchanged,
        report.continuations.len()
    );

    let json = class.to_json().context("failed to serialize class")?;
    match output {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{}", json),
    }
    Ok(())
}
