use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use lintbridge::{
    BridgeConfig, Coordinator, FilePollingChannel, LintChannel, LintResult, Supervisor,
    TracingReporter,
};

#[derive(Debug, PartialEq, Eq)]
struct Args {
    file: PathBuf,
    config: Option<PathBuf>,
    worker_dir: Option<PathBuf>,
    file_name: Option<String>,
    poll: bool,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: lintbridge <file.css> [--config <rules.json>] [--worker-dir <dir>] [--file-name <name>] [--poll]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <file.css>             CSS file to lint");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --config <rules.json>  Rule configuration [default: {{}}]");
            eprintln!("  --worker-dir <dir>     Worker project directory [default: $LINTBRIDGE_WORKER_DIR or .]");
            eprintln!("  --file-name <name>     File name reported to the worker [default: target.css]");
            eprintln!("  --poll                 Talk to the worker through .input.json/.output.json");
            process::exit(2);
        }
    };

    lintbridge::logging::init_tracing();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut file: Option<PathBuf> = None;
    let mut config = None;
    let mut worker_dir = None;
    let mut file_name = None;
    let mut poll = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                config = Some(PathBuf::from(
                    args.get(i).ok_or("--config requires a value")?,
                ));
            }
            "--worker-dir" => {
                i += 1;
                worker_dir = Some(PathBuf::from(
                    args.get(i).ok_or("--worker-dir requires a value")?,
                ));
            }
            "--file-name" => {
                i += 1;
                file_name = Some(args.get(i).ok_or("--file-name requires a value")?.clone());
            }
            "--poll" => poll = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if file.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                file = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let file = file.ok_or("missing required argument: <file.css>")?;
    Ok(Args {
        file,
        config,
        worker_dir,
        file_name,
        poll,
    })
}

/// Lint once and print the result. `Ok(false)` when the worker reported a failure.
async fn run(args: Args) -> anyhow::Result<bool> {
    let mut bridge = BridgeConfig::from_env().context("invalid environment configuration")?;
    if let Some(dir) = args.worker_dir {
        bridge = bridge.with_worker_dir(dir);
    }
    if let Some(name) = args.file_name {
        bridge = bridge.with_file_name(name);
    }

    let code = read(&args.file).await?;
    let config = match &args.config {
        Some(path) => read(path).await?,
        None => "{}".to_string(),
    };

    let result = if args.poll {
        let channel = FilePollingChannel::from_config(&bridge);
        channel
            .wait_for_boot()
            .await
            .context("polling worker did not boot")?;
        lint(Arc::new(channel), &bridge, code, config).await?
    } else {
        let supervisor = Arc::new(Supervisor::from_config(
            &bridge,
            Arc::new(TracingReporter),
        ));
        supervisor.start().await.context("failed to start worker")?;
        let result = lint(supervisor.clone(), &bridge, code, config).await;
        supervisor.shutdown().await;
        result?
    };

    report(&args.file, &result);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

async fn read(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

async fn lint(
    channel: Arc<dyn LintChannel>,
    bridge: &BridgeConfig,
    code: String,
    config: String,
) -> anyhow::Result<LintResult> {
    let coordinator =
        Arc::new(Coordinator::new(channel).with_file_name(bridge.file_name.clone()));
    tracing::debug!(file_name = %bridge.file_name, "Submitting lint request");
    Ok(coordinator.submit(code, config).await?)
}

/// Human-readable diagnostics on stderr.
fn report(file: &Path, result: &LintResult) {
    match result {
        LintResult::Success { result, .. } => {
            for warning in &result.warnings {
                let span = warning.span();
                let mut line = format!(
                    "{}:{}:{}: {:?}: {}",
                    file.display(),
                    span.start_line,
                    span.start_column,
                    warning.severity,
                    warning.text
                );
                if let Some(url) = warning.doc_url() {
                    line.push_str(&format!(" <{url}>"));
                }
                eprintln!("{line}");
            }
        }
        LintResult::Failure { message } => eprintln!("{}: {message}", file.display()),
    }
}
