use std::fs;
use std::path::PathBuf;
use std::process;

use ariadne::{Color, Label, Report, ReportKind, Source};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pylower_common::config::{self, ConfigError};
use pylower_common::{CodeUnit, Diagnostic, DiagnosticBag, LoweringOptions, Position};
use pylower_compiler::{semantic, verify_unit, Compiler};

/// Lower a Python-like AST into stack-machine code units.
#[derive(Parser)]
#[command(
    name = "pylowerc",
    version,
    about,
    long_about = "Lower a Python-like AST into stack-machine code units.\n\nReads the AST as JSON, resolves scopes, lowers every unit and checks its\nstack discipline. Options come from the nearest pylower.toml and the flags below.\n\nExamples:\n  pylowerc mod.json                   Print a listing of every unit\n  pylowerc mod.json -o mod.ir.json    Write the IR as JSON\n  pylowerc mod.json --emit-ir         Print the IR JSON to stdout\n  pylowerc mod.json --check --source mod.py\n                                      Only report errors, against the source text"
)]
struct Cli {
    /// Input AST in JSON form.
    input: PathBuf,

    /// Source file the AST was parsed from, used to render diagnostics.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Write the IR JSON to this path.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the IR JSON to stdout.
    #[arg(long = "emit-ir")]
    emit_ir: bool,

    /// Print a listing even when writing the IR elsewhere.
    #[arg(long)]
    listing: bool,

    /// Check for errors without printing any output.
    #[arg(long)]
    check: bool,

    /// Optimization level (overrides pylower.toml).
    #[arg(short = 'O', value_name = "LEVEL")]
    optimize: Option<u8>,

    /// Nesting limit for lowering (overrides pylower.toml).
    #[arg(long = "max-depth", value_name = "N")]
    max_depth: Option<usize>,

    /// Never lower comprehensions in place.
    #[arg(long = "no-inline")]
    no_inline: bool,

    /// Log at debug level unless PYLOWER_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("PYLOWER_LOG").unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let json = match fs::read_to_string(&cli.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read '{}': {}", cli.input.display(), e);
            process::exit(1);
        }
    };
    let source = cli.source.as_ref().map(|path| match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read '{}': {}", path.display(), e);
            process::exit(1);
        }
    });
    let file_name = cli
        .source
        .as_deref()
        .unwrap_or(&cli.input)
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    // === Configuration ===
    let mut diags = DiagnosticBag::new();
    let options = load_options(&cli, &mut diags);
    debug!(?options, "lowering options");

    // === AST ===
    let module = match pylower_compiler::parse_module(&json) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: invalid AST in '{}': {}", cli.input.display(), e);
            process::exit(1);
        }
    };

    // === Lowering ===
    let lowered = semantic::analyze(&module, &options)
        .and_then(|table| Compiler::new(&table, &options, file_name.as_str())?.compile_module(&module));
    let unit = match lowered {
        Ok(unit) => unit,
        Err(err) => {
            diags.report(err.to_diagnostic());
            for diag in diags.diagnostics() {
                print_diagnostic(diag, source.as_deref(), &file_name);
            }
            process::exit(1);
        }
    };

    // === Stack verification ===
    let mut units = 0;
    for_each_unit(&unit, &mut |u| {
        units += 1;
        match verify_unit(u) {
            Ok(depth) => debug!(unit = %u.qualname, depth, "stack verified"),
            Err(e) => diags.report(
                Diagnostic::error(format!("{}: {}", u.qualname, e))
                    .with_suggestion("this is a lowering bug; please report it with the input AST"),
            ),
        }
    });
    for diag in diags.diagnostics() {
        print_diagnostic(diag, source.as_deref(), &file_name);
    }
    if diags.has_errors() {
        process::exit(1);
    }
    info!(units, "lowered {}", file_name);

    if cli.check {
        println!("No errors found.");
        return;
    }

    if cli.emit_ir || cli.output.is_some() {
        let json = match serde_json::to_string_pretty(&unit) {
            Ok(j) => j,
            Err(e) => {
                eprintln!("error: failed to serialize IR: {}", e);
                process::exit(1);
            }
        };
        if cli.emit_ir {
            println!("{}", json);
        }
        if let Some(path) = &cli.output {
            if let Err(e) = fs::write(path, &json) {
                eprintln!("error: could not write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!(
                "Lowered {} -> {} ({} units, {} bytes)",
                cli.input.display(),
                path.display(),
                units,
                json.len()
            );
        }
        if !cli.listing {
            return;
        }
    }

    print!("{}", unit.listing());
}

/// Options from the nearest `pylower.toml`, then command-line overrides.
fn load_options(cli: &Cli, diags: &mut DiagnosticBag) -> LoweringOptions {
    let start = cli.source.as_deref().unwrap_or(&cli.input);
    let abs = fs::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
    let mut options = match config::find_and_load_config(&abs) {
        Ok(options) => options,
        Err(ConfigError::NotFound(_)) => LoweringOptions::default(),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    };
    if let Some(level) = cli.optimize {
        options.optimize = level;
    }
    if options.optimize > 2 {
        diags.report(Diagnostic::warning(format!(
            "optimization level {} behaves like level 2",
            options.optimize
        )));
    }
    if let Some(depth) = cli.max_depth {
        if depth == 0 {
            eprintln!("error: --max-depth must be at least 1");
            process::exit(1);
        }
        options.max_recursion_depth = depth;
    }
    if cli.no_inline {
        options.inline_comprehensions = false;
    }
    options
}

fn for_each_unit(unit: &CodeUnit, f: &mut impl FnMut(&CodeUnit)) {
    f(unit);
    for child in unit.children() {
        for_each_unit(child, f);
    }
}

/// Byte offset of `pos`, recomputed from line and column when the AST
/// carried no offsets.
fn offset_in(source: &str, pos: Position) -> usize {
    if pos.offset > 0 || (pos.line <= 1 && pos.column == 0) {
        return pos.offset as usize;
    }
    let line_start: usize = source
        .split_inclusive('\n')
        .take(pos.line.saturating_sub(1) as usize)
        .map(str::len)
        .sum();
    (line_start + pos.column as usize).min(source.len())
}

fn print_diagnostic(diag: &Diagnostic, source: Option<&str>, file_name: &str) {
    let (Some(source), Some(span)) = (source, diag.span) else {
        eprintln!("{}", with_file(diag, file_name));
        if let Some(ref suggestion) = diag.suggestion {
            eprintln!("   = help: {}", suggestion);
        }
        return;
    };

    let kind = if diag.is_error() {
        ReportKind::Error
    } else {
        ReportKind::Warning
    };
    let start = offset_in(source, span.start);
    let end = offset_in(source, span.end).max(start + 1);
    let color = if diag.is_error() { Color::Red } else { Color::Yellow };

    let mut report = Report::build(kind, file_name, start)
        .with_message(&diag.message)
        .with_label(
            Label::new((file_name, start..end))
                .with_message(&diag.message)
                .with_color(color),
        );
    if let Some(ref suggestion) = diag.suggestion {
        report = report.with_help(suggestion);
    }
    if report.finish().eprint((file_name, Source::from(source))).is_err() {
        eprintln!("{}", with_file(diag, file_name));
    }
}

/// `error: message` with a `file:line:col` pointer when the span is known.
fn with_file(diag: &Diagnostic, file_name: &str) -> String {
    let prefix = if diag.is_error() { "error" } else { "warning" };
    match diag.span {
        Some(span) => format!("{}: {}\n  --> {}:{}", prefix, diag.message, file_name, span),
        None => format!("{}: {}", prefix, diag.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_fall_back_to_line_and_column() {
        let source = "x = 1\nbreak\n";
        assert_eq!(offset_in(source, Position::new(2, 0, 0)), 6);
        assert_eq!(offset_in(source, Position::new(1, 4, 0)), 4);
        assert_eq!(offset_in(source, Position::new(2, 0, 9)), 9);
        assert_eq!(offset_in(source, Position::new(9, 3, 0)), source.len());
    }

    #[test]
    fn plain_diagnostic_points_at_file() {
        let diag = Diagnostic::error("'break' outside loop")
            .with_span(pylower_common::Span::lines(2, 0, 2, 5));
        assert_eq!(
            with_file(&diag, "mod.py"),
            "error: 'break' outside loop\n  --> mod.py:2:0"
        );
    }

    #[test]
    fn cli_parses_overrides() {
        let cli = Cli::parse_from(["pylowerc", "m.json", "-O", "2", "--max-depth", "50", "--no-inline"]);
        assert_eq!(cli.optimize, Some(2));
        assert_eq!(cli.max_depth, Some(50));
        assert!(cli.no_inline);
        assert!(!cli.check);
    }
}
