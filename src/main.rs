use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use wlmirror_lib::logging::init_logging;
use wlmirror_lib::{CaptureConfig, CaptureResult};

/// Without flags, negotiates geometry and format for the output and prints
/// them. Frame capture itself needs a renderer with a current EGL context.
#[derive(Parser, Debug)]
#[command(version, about = "Zero-copy Wayland output capture")]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/wlmirror/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Output to probe, by connector name or description
    #[arg(short, long)]
    output: Option<String>,
    /// List outputs and exit
    #[arg(short, long)]
    list_outputs: bool,
    /// Log filter, overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

fn read_config(args: &Args) -> CaptureResult<CaptureConfig> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::read(path)?,
        None => CaptureConfig::read_or_default()?,
    };
    if let Some(output) = &args.output {
        config.output_name = Some(output.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

fn run(args: &Args, config: &CaptureConfig) -> CaptureResult<()> {
    if args.list_outputs {
        for output in wlmirror_lib::list_outputs()? {
            println!(
                "{}\t{}x{} @ {:.2} Hz\tscale {}\t{}",
                output.display_name(),
                output.mode.width,
                output.mode.height,
                output.refresh_hz(),
                output.scale,
                output.description.as_deref().unwrap_or(&output.make_model())
            );
        }
        return Ok(());
    }

    let (output, negotiated) = wlmirror_lib::probe(config)?;
    println!(
        "{}: {}x{} {}",
        output.display_name(),
        negotiated.width,
        negotiated.height,
        negotiated.format
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match read_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("wlmirror: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.log_settings()) {
        eprintln!("wlmirror: {}", e);
    }
    config.validate();

    match run(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[CONFIG] {}", e);
            eprintln!("wlmirror: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_is_the_default_action() {
        let args = Args::try_parse_from(["wlmirror", "--output", "DP-1"]).unwrap();
        assert!(!args.list_outputs);
        assert_eq!(args.output.as_deref(), Some("DP-1"));
        assert!(Args::try_parse_from(["wlmirror", "--probe"]).is_err());
    }

    #[test]
    fn test_cli_overrides_apply_before_validation() {
        let path = std::env::temp_dir().join(format!("wlmirror-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "fallbackFormat": "NOPE" }"#).unwrap();
        let args = Args::try_parse_from([
            "wlmirror",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
        ])
        .unwrap();

        let config = read_config(&args).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.fallback_format, "NOPE");
        assert_eq!(config.log_settings().level, "debug");
    }
}
