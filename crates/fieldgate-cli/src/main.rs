//! Fieldgate CLI
//!
//! Validates a GraphQL query against a fieldgate rule file and prints the
//! verdict as JSON. Handy for checking rules before wiring them into a
//! server.
//!
//! # Usage
//!
//! ```bash
//! fieldgate --rules rules.graphql --query query.graphql --role customer --debug
//! echo '{ books { title } }' | fieldgate --rules rules.graphql \
//!     --params '{"userClaims": {"roles": ["customer"], "uid": 1234}}'
//! ```
//!
//! Exit status is 0 when the query is allowed, 1 when it is denied and 2 when
//! validation could not run.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fieldgate::{Authorization, Caller, DefaultPolicy, Verdict};
use serde_json::Value;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "fieldgate")]
#[command(about = "Authorize a GraphQL query against fieldgate rules")]
struct Args {
    /// GraphQL file holding the annotated rules
    #[arg(short, long)]
    rules: PathBuf,

    /// Query file to validate (`-` reads standard input)
    #[arg(short, long, default_value = "-")]
    query: String,

    /// JSON file with runtime variable bindings
    #[arg(long)]
    variables: Option<PathBuf>,

    /// Validation parameters as JSON, e.g. '{"userClaims": {"roles": ["customer"]}}'
    #[arg(long, conflicts_with = "role")]
    params: Option<String>,

    /// Caller role (repeatable)
    #[arg(long)]
    role: Vec<String>,

    /// Policy for fields the rules don't describe
    #[arg(long, value_enum, default_value_t = PolicyArg::Drop)]
    default_policy: PolicyArg,

    /// Report why a query was denied instead of "Not authorized!"
    #[arg(long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Drop,
    Accept,
}

impl From<PolicyArg> for DefaultPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Drop => DefaultPolicy::Drop,
            PolicyArg::Accept => DefaultPolicy::Accept,
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        "fieldgate=trace,fieldgate_cli=debug"
    } else {
        "fieldgate=warn,fieldgate_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(verdict) => {
            match serde_json::to_string_pretty(&verdict) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    error!("failed to encode verdict: {err}");
                    return ExitCode::from(2);
                }
            }
            if verdict.is_allowed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<Verdict> {
    let rules = read_file(&args.rules)?;
    let mut auth = Authorization::new(&rules)
        .with_context(|| format!("failed to compile rules from {}", args.rules.display()))?
        .with_policy(args.default_policy.into())
        .with_debug(args.debug);
    info!(rules = %args.rules.display(), policy = %auth.default_policy(), "loaded rules");

    // The CLI surfaces per-leaf evaluation when asked to be chatty.
    if args.verbose {
        auth.set_custom_check(|node| {
            debug!(path = %node.path, rule = %node.rule_path, value = ?node.value, "evaluated leaf");
            Vec::new()
        });
    }

    let query = if args.query == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read query from stdin")?;
        buf
    } else {
        read_file(Path::new(&args.query))?
    };

    let variables = match &args.variables {
        Some(path) => serde_json::from_str(&read_file(path)?)
            .with_context(|| format!("failed to parse variables in {}", path.display()))?,
        None => Value::Object(Default::default()),
    };

    let params = match &args.params {
        Some(raw) => serde_json::from_str(raw).context("failed to parse --params")?,
        None if !args.role.is_empty() => Caller::new(args.role.iter().cloned()).params().clone(),
        None => anyhow::bail!("no caller given; pass --params or at least one --role"),
    };

    let verdict = auth.validate_with_variables(&query, &variables, &params)?;
    debug!(allowed = verdict.is_allowed, "validation finished");
    Ok(verdict)
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
