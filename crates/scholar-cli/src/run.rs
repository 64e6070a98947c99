//! Run command implementation for Scholar CLI.
//!
//! Executes a source file in a fresh local kernel and prints its outputs.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use scholar_core::kernel::MimeBundle;
use scholar_core::{CellOutput, ExecutionResult, Kernel, KernelCommand, KernelConfig, ProcessLauncher};

use crate::colors;

/// Execute a file (or stdin when `file` is `-`).
pub fn execute(file: &str, python: Option<PathBuf>, timeout_secs: Option<u64>) -> anyhow::Result<()> {
    let source = read_source(file)?;

    let command = match python {
        Some(python) => KernelCommand::python(python),
        None => KernelCommand::detect_python()?,
    };
    let mut config = KernelConfig::default();
    if let Some(secs) = timeout_secs.filter(|s| *s > 0) {
        config.execution_timeout = Duration::from_secs(secs);
    }

    let start = Instant::now();
    let kernel = Kernel::spawn(Arc::new(ProcessLauncher::new(command)), config)?;
    let result = kernel.execute(&source);
    kernel.shutdown();

    print_result(&result)?;

    match &result {
        ExecutionResult::Failed { error } => anyhow::bail!("Execution failed: {}", error),
        ExecutionResult::TimedOut { .. } => anyhow::bail!(
            "Execution timed out after {}s",
            kernel.config().execution_timeout.as_secs()
        ),
        ExecutionResult::Completed { outputs } => {
            if let Some(CellOutput::Error { ename, .. }) = outputs.iter().find(|o| o.is_error()) {
                anyhow::bail!("Code raised {}", ename);
            }
        }
    }

    eprintln!(
        "{}Completed in {:.2}s{}",
        colors::DIM,
        start.elapsed().as_secs_f64(),
        colors::RESET
    );
    Ok(())
}

fn read_source(file: &str) -> anyhow::Result<String> {
    if file == "-" {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        return Ok(source);
    }
    std::fs::read_to_string(file).map_err(|e| anyhow::anyhow!("Cannot read {}: {}", file, e))
}

fn print_result(result: &ExecutionResult) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    for output in result.outputs() {
        match output {
            CellOutput::Stream { name, text } if name == "stderr" => stderr.write_all(text.as_bytes())?,
            CellOutput::Stream { text, .. } => stdout.write_all(text.as_bytes())?,
            CellOutput::ExecuteResult {
                data,
                execution_count,
            } => {
                let label = execution_count.map(|n| format!("Out[{}]", n)).unwrap_or_else(|| "Out".to_string());
                writeln!(stdout, "{}{}:{} {}", colors::GREEN, label, colors::RESET, plain_text(data))?;
            }
            CellOutput::DisplayData { data } => writeln!(stdout, "{}", plain_text(data))?,
            CellOutput::Error { traceback, .. } => {
                for line in traceback {
                    writeln!(stderr, "{}{}{}", colors::RED, line, colors::RESET)?;
                }
            }
        }
    }
    if result.timed_out() {
        writeln!(stderr, "{}(output truncated by timeout){}", colors::YELLOW, colors::RESET)?;
    }
    stdout.flush()
}

/// Best plain-text rendering of a MIME bundle.
fn plain_text(data: &MimeBundle) -> String {
    match data.get("text/plain") {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => data
            .keys()
            .next()
            .map(|mime| format!("<{}>", mime))
            .unwrap_or_default(),
    }
}
