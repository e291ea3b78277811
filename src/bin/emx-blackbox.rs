//! emx-blackbox CLI
//!
//! Run a build tool once inside a fresh black-box test environment, or
//! print the default workspace document.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emx_blackbox::{DefaultWorkspaceFile, EnvConfig, TestEnvironment, ToolsSetup, TxtarFixture};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emx-blackbox")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "Black-box test environments for build tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the default WORKSPACE document
    Workspace,

    /// Prepare one environment, run the build tool in it, and dispose
    Run {
        /// Build tool binary [env: BLACKBOX_TOOL]
        #[arg(long)]
        tool: Option<PathBuf>,

        /// Test name, used for the working directory
        #[arg(short = 'n', long, default_value = "cli")]
        name: String,

        /// Keep the working directory afterwards (for debugging)
        #[arg(short = 'k', long = "keep")]
        keep: bool,

        /// Root directory for working directories [env: BLACKBOX_WORK_ROOT]
        #[arg(long = "workdir")]
        workdir: Option<PathBuf>,

        /// txtar archives to unpack into the workspace, in order
        #[arg(short = 'f', long = "fixture")]
        fixtures: Vec<PathBuf>,

        /// Do not write the default WORKSPACE file
        #[arg(long = "no-workspace")]
        no_workspace: bool,

        /// Kill the tool after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Environment variables to set (KEY=VALUE)
        #[arg(short = 'e', long = "env")]
        env_vars: Vec<String>,

        /// Arguments passed to the tool
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Workspace => {
            println!("{}", emx_blackbox::workspace_with_default_repos());
            ExitCode::SUCCESS
        }
        Command::Run {
            tool,
            name,
            keep,
            workdir,
            fixtures,
            no_workspace,
            timeout,
            env_vars,
            args,
        } => {
            let mut config = EnvConfig::from_env();
            if let Some(tool) = tool {
                config.tool = Some(tool);
            }
            if let Some(workdir) = workdir {
                config.workdir_root = Some(workdir);
            }
            config.preserve_work |= keep;
            match run_once(config, &name, &fixtures, !no_workspace, timeout, &env_vars, args) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {:#}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn run_once(
    mut config: EnvConfig,
    name: &str,
    fixtures: &[PathBuf],
    write_workspace: bool,
    timeout: Option<u64>,
    env_vars: &[String],
    args: Vec<String>,
) -> Result<ExitCode> {
    for var in env_vars {
        let (k, v) = var
            .split_once('=')
            .with_context(|| format!("invalid env var {:?}, expected KEY=VALUE", var))?;
        config = config.env(k, v);
    }
    let keep = config.preserve_work;

    let mut tools: Vec<Box<dyn ToolsSetup>> = Vec::new();
    if write_workspace {
        tools.push(Box::new(DefaultWorkspaceFile));
    }
    for fixture in fixtures {
        tools.push(Box::new(TxtarFixture::from_file(fixture)?));
    }

    let env = TestEnvironment::local(config).context("failed to start test environment")?;
    // Dispose on every path, including a failed run.
    let outcome = (|| -> Result<ExitCode> {
        let ctx = env.prepare_environment(name, &tools)?;
        let result = match timeout {
            Some(secs) => ctx.run_tool_with_timeout(args, Duration::from_secs(secs))?,
            None => ctx.run_tool(args)?,
        };
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        if keep {
            eprintln!("workdir: {}", ctx.work_dir().display());
        }
        if result.timed_out {
            eprintln!("timed out after {}ms", result.duration.as_millis());
        }
        if result.truncated {
            eprintln!("output incomplete: a stream was still open after the kill");
        }
        Ok(match result.exit_code {
            _ if result.timed_out => ExitCode::FAILURE,
            Some(0) => ExitCode::SUCCESS,
            Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            None => ExitCode::FAILURE,
        })
    })();
    env.dispose()?;
    outcome
}
