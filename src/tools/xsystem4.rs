use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Result};
use clap::Parser;

use xsystem4::ain::Ain;
use xsystem4::audit::audit;
use xsystem4::config::Config;
use xsystem4::hll;
use xsystem4::vm::Vm;

/// Execute a System 4 program image.
#[derive(Clone, Debug, Parser)]
#[command(name = "xsystem4")]
struct Args {
    /// Audit the AIN file for compatibility instead of executing it
    #[arg(short, long)]
    audit: bool,
    /// Game configuration (.ini) or program image (.ain)
    input: PathBuf,
}

fn run(args: &Args) -> Result<i32> {
    let extension = args
        .input
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .map(str::to_ascii_lowercase);

    let (config, ain_path) = match extension.as_deref() {
        Some("ini") => {
            let config = Config::from_ini(&args.input)?;
            let path = config.ain_path()?;
            (config, path)
        }
        Some("ain") => (Config::default_for(&args.input), args.input.clone()),
        _ => bail!("Not an AIN/INI file: {}", args.input.display()),
    };

    let ain = Ain::open(&ain_path).map_err(|e| anyhow!("{}: {e}", ain_path.display()))?;

    if args.audit {
        let linked = hll::link(&ain)?;
        audit(&mut std::io::stdout().lock(), &ain, &linked)?;
        return Ok(0);
    }

    let mut vm = Vm::new(ain, config)?;
    Ok(vm.run()?)
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(status) => ExitCode::from(status.clamp(0, 255) as u8),
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
