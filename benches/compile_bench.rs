//! Quick benchmark to watch compile-pipeline performance

use aiml::Compiler;
use std::time::Instant;

fn synthetic_document(states: usize) -> String {
    let mut doc = String::from("<workflow id=\"w\">\n");
    doc.push_str("  <data id=\"score\" type=\"number\">0</data>\n");
    for i in 0..states {
        doc.push_str(&format!(
            "  <state id=\"s{i}\">\n    <llm model=\"m\" prompt=\"step {i} for ${{score}}\"/>\n    <transition target=\"s{}\" cond={{score > {i}}}/>\n  </state>\n",
            (i + 1) % states.max(1),
        ));
    }
    doc.push_str("</workflow>\n");
    doc
}

fn main() {
    let compiler = Compiler::new();
    for states in [5usize, 25, 100] {
        let doc = synthetic_document(states);
        let iterations = 200;

        let start = Instant::now();
        for _ in 0..iterations {
            let compiled = compiler.compile(&doc).expect("compiles");
            assert!(compiled.graph.len() > states);
        }
        let elapsed = start.elapsed();
        println!(
            "{states:>4} states: {:>8.2?} total, {:>8.2?} per compile ({} bytes)",
            elapsed,
            elapsed / iterations,
            doc.len()
        );
    }
}
