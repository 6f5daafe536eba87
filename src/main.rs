//! AIML CLI - compile, inspect and run workflow documents

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use aiml::engine::{Engine, RunInput};
use aiml::provider::create_provider;
use aiml::step::StepChunk;
use aiml::{Compiler, Diagnostic, Severity};

#[derive(Parser)]
#[command(name = "aiml")]
#[command(about = "AIML - agent workflow compiler and runtime")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a document and print its diagnostics
    Check {
        /// Path to the .aiml file
        file: String,
    },

    /// Dump the execution graph of a compiled document
    Graph {
        /// Path to the .aiml file
        file: String,
    },

    /// Compile and run a document
    Run {
        /// Path to the .aiml file
        file: String,

        /// User message to run with
        #[arg(short, long, default_value = "")]
        input: String,

        /// Provider to execute llm actions with
        #[arg(short, long, default_value = "mock")]
        provider: String,

        /// Print chunks as they stream instead of the final response
        #[arg(long)]
        stream: bool,

        /// Print the run's event trace afterwards
        #[arg(long)]
        trace: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Graph { file } => graph(&file),
        Commands::Run { file, input, provider, stream, trace } => {
            run(&file, &input, &provider, stream, trace).await
        }
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }
}

fn compile_file(file: &str) -> Result<aiml::CompiledWorkflow> {
    let source = fs::read_to_string(file).with_context(|| format!("failed to read {file}"))?;
    let compiled = Compiler::new()
        .compile(&source)
        .with_context(|| format!("failed to compile {file}"))?;
    Ok(compiled)
}

fn print_diagnostic(diagnostic: &Diagnostic) {
    let severity = match diagnostic.severity {
        Severity::Error => "error".red().bold(),
        Severity::Warning => "warning".yellow().bold(),
    };
    println!(
        "{severity}[{}] {} {}",
        diagnostic.code,
        diagnostic.message,
        format!(
            "({}:{})",
            diagnostic.range.line_start, diagnostic.range.column_start
        )
        .dimmed()
    );
}

fn check(file: &str) -> Result<()> {
    let compiled = compile_file(file)?;
    for diagnostic in compiled.diagnostics.iter() {
        print_diagnostic(diagnostic);
    }
    if compiled.is_runnable() {
        println!(
            "{} {} ({} states, {} graph nodes)",
            "ok".green().bold(),
            file,
            compiled.tree.iter().filter(|e| e.is_state_like()).count(),
            compiled.graph.len()
        );
        Ok(())
    } else {
        anyhow::bail!(
            "{} error(s) in {file}",
            compiled.diagnostics.error_count()
        )
    }
}

fn graph(file: &str) -> Result<()> {
    let compiled = compile_file(file)?;
    for node in compiled.graph.iter() {
        let edges: Vec<String> = node
            .next
            .iter()
            .map(|e| {
                let target = &compiled.graph.get(e.target).id;
                match (&e.when, e.entry) {
                    (_, true) => format!("entry→{target}"),
                    (Some(cond), _) => format!("→{target} when [{cond}]"),
                    (None, _) => format!("→{target}"),
                }
            })
            .collect();
        println!(
            "{} {} ({}) {}",
            node.id.bold(),
            node.kind.to_string().dimmed(),
            node.sub_type,
            edges.join("  ")
        );
        if !node.parallel.is_empty() {
            let branches: Vec<&str> = node
                .parallel
                .iter()
                .map(|&b| compiled.graph.get(b).id.as_str())
                .collect();
            println!("  parallel: {}", branches.join(", "));
        }
    }
    Ok(())
}

async fn run(file: &str, input: &str, provider_name: &str, stream: bool, trace: bool) -> Result<()> {
    let compiled = compile_file(file)?;
    for diagnostic in compiled.diagnostics.iter() {
        print_diagnostic(diagnostic);
    }
    if !compiled.is_runnable() {
        anyhow::bail!("document has errors, refusing to run");
    }

    let provider = create_provider(provider_name)?;
    let engine = Engine::new(provider);
    let handle = engine.start(Arc::new(compiled), RunInput::message(input));

    if stream {
        let mut reader = handle.reader();
        while let Some(chunk) = reader.next().await {
            match chunk {
                StepChunk::Text { delta } => print!("{delta}"),
                StepChunk::Error { message } => eprint!("{}", message.red()),
                other => println!("{}", format!("{other:?}").dimmed()),
            }
        }
        println!();
    }

    let events = handle.events().clone();
    let summary = handle.wait().await?;

    if !stream {
        println!("{}", summary.content);
    }
    if let Some(error) = &summary.error {
        eprintln!("{} {}", "routed error:".yellow().bold(), error);
    }
    if trace {
        for event in events.events() {
            println!(
                "{} {}",
                format!("[{:>6}ms]", event.timestamp_ms).dimmed(),
                format!("{:?}", event.kind)
            );
        }
    }
    println!(
        "{} run {} finished in {} ({} tokens)",
        "ok".green().bold(),
        summary.run_id,
        format!("{}ms", summary.duration_ms),
        summary.usage.total_tokens
    );
    Ok(())
}
