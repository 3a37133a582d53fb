//! `rewind analyze`: frame listing for one method

use super::{load_options, read_class};
use anyhow::{anyhow, Context};
use rewind_engine::transform::analyzer::analyze;
use rewind_engine::transform::locate::locate;
use std::path::Path;

pub fn execute(input: &Path, method_name: &str, config: Option<&Path>) -> anyhow::Result<()> {
    let options = load_options(config)?;
    let class = read_class(input)?;
    let method = class
        .methods
        .iter()
        .find(|m| m.name == method_name)
        .ok_or_else(|| anyhow!("{} has no method named {}", class.name, method_name))?;

    let frames = analyze(&class.name, method, options.visit_budget)
        .with_context(|| format!("frame analysis of {}.{} failed", class.name, method_name))?;

    println!("{}.{}{}", class.name, method.name, method.sig);
    for (pos, (id, insn)) in method.code.iter().enumerate() {
        match frames.at(id) {
            Some(frame) => println!("{:4}  {:<40} {}", pos, insn.to_string(), frame),
            None => println!("{:4}  {:<40} (unreachable)", pos, insn.to_string()),
        }
    }

    let sites = locate(&class.name, method, &frames, &options, None);
    println!();
    println!("{} suspension point(s), max stack {}", sites.len(), frames.max_stack());
    for site in &sites {
        let line = site.line.map(|l| format!("line {}", l)).unwrap_or_else(|| "no line".into());
        println!(
            "  state {} at {} ({}): {}",
            site.resume_id, site.position, line, site.frame
        );
    }
    Ok(())
}
