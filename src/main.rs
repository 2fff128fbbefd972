use std::fs;
use std::io::{self, Read};

use clap::Parser as ClapParser;
use tansy_lang::{Error, Value, parse};

#[derive(ClapParser)]
#[command(name = "tansy")]
#[command(about = "Tansy - a JSONata-style query and transformation language for JSON")]
#[command(version)]
struct Cli {
    /// The expression to evaluate
    expr: Option<String>,

    /// Read the expression from a file instead
    #[arg(short = 'e', long = "expression", value_name = "file")]
    expression_file: Option<String>,

    /// JSON input file ('-' for stdin; defaults to stdin when piped)
    #[arg(short, long, value_name = "file")]
    input: Option<String>,

    /// Variable bindings as a JSON object
    #[arg(short, long, value_name = "json")]
    bindings: Option<String>,

    /// Compact JSON output (don't prettify)
    #[arg(short, long)]
    compact: bool,

    /// Only validate syntax, don't evaluate
    #[arg(long)]
    syntax_only: bool,

    /// Evaluation timeout in milliseconds
    #[arg(long, value_name = "ms")]
    timeout: Option<u64>,

    /// Maximum evaluation depth
    #[arg(long, value_name = "frames")]
    max_depth: Option<usize>,
}

#[derive(Debug)]
enum CliError {
    NoExpression,
    Parse(Error),
    Eval(Error),
    Json(serde_json::Error),
    Io(io::Error),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::NoExpression => {
                write!(f, "No expression provided. Pass one as an argument or via -e.")
            }
            CliError::Parse(e) => write!(f, "Parse error: {}", e),
            CliError::Eval(e) => write!(f, "Evaluation error: {}", e),
            CliError::Json(e) => write!(f, "Invalid JSON: {}", e),
            CliError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Json(e)
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Io(e)
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn read_input(arg: Option<&str>) -> Result<Option<String>, CliError> {
    match arg {
        Some("-") => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(Some(buffer))
        }
        Some(path) => Ok(Some(fs::read_to_string(path)?)),
        None if !atty::is(atty::Stream::Stdin) => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(Some(buffer))
        }
        None => Ok(None),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let source = match (&cli.expr, &cli.expression_file) {
        (Some(expr), _) => expr.clone(),
        (None, Some(path)) => fs::read_to_string(path)?,
        (None, None) => return Err(CliError::NoExpression),
    };

    let expression = parse(&source).map_err(CliError::Parse)?;
    if cli.syntax_only {
        println!("Syntax is valid");
        return Ok(());
    }

    let input = match read_input(cli.input.as_deref())? {
        Some(text) => {
            let json: serde_json::Value = serde_json::from_str(&text)?;
            Value::from_json(&json)
        }
        None => Value::Undefined,
    };

    let mut bindings: Vec<(String, Value)> = Vec::new();
    if let Some(text) = &cli.bindings {
        let json: serde_json::Value = serde_json::from_str(text)?;
        if let serde_json::Value::Object(map) = json {
            for (name, value) in map {
                bindings.push((name, Value::from_json(&value)));
            }
        }
    }
    let binding_refs: Vec<(&str, Value)> = bindings
        .iter()
        .map(|(name, value)| (name.as_str(), value.clone()))
        .collect();

    let bounds = match (cli.timeout, cli.max_depth) {
        (None, None) => None,
        (timeout, depth) => Some((timeout.unwrap_or(10_000), depth.unwrap_or(1_000))),
    };

    let result = expression
        .evaluate_with_options(input, &binding_refs, bounds)
        .map_err(CliError::Eval)?;

    match result.to_json() {
        Some(json) => {
            let rendered = if cli.compact {
                serde_json::to_string(&json)
            } else {
                serde_json::to_string_pretty(&json)
            }?;
            println!("{}", rendered);
        }
        None => println!(),
    }
    Ok(())
}
