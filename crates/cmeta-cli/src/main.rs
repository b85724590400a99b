#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::Parser;
use clap::error::ErrorKind;
use cmeta_block::is_block_or_regular;
use cmeta_check::{CheckOptions, exit_code, run_cache_check};
use std::path::PathBuf;

/// Validates cache metadata on a device or file.
#[derive(Parser)]
#[command(name = "cache_check", version)]
struct Cli {
    /// Cache metadata device or file.
    device: PathBuf,

    /// Suppress diagnostic output.
    #[arg(short, long)]
    quiet: bool,

    /// Check only the superblock.
    #[arg(long)]
    super_block_only: bool,

    /// Do not walk the mapping array.
    #[arg(long)]
    skip_mappings: bool,

    /// Do not walk the hint array.
    #[arg(long)]
    skip_hints: bool,

    /// Do not walk the discard bitset.
    #[arg(long)]
    skip_discards: bool,

    /// Succeed even when non-fatal damage was found.
    #[arg(long)]
    ignore_non_fatal_errors: bool,

    /// Clear the needs_check flag in the superblock if the check succeeds.
    #[arg(long)]
    clear_needs_check_flag: bool,
}

impl Cli {
    fn check_options(&self) -> CheckOptions {
        CheckOptions {
            check_mappings: !self.super_block_only && !self.skip_mappings,
            check_hints: !self.super_block_only && !self.skip_hints,
            check_discards: !self.super_block_only && !self.skip_discards,
            ignore_non_fatal: self.ignore_non_fatal_errors,
            quiet: self.quiet,
            clear_needs_check: self.clear_needs_check_flag,
        }
    }
}

fn main() {
    // Argument errors exit 1 after printing usage; --help/--version exit 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            if !cli.quiet {
                eprintln!("{error:#}");
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let usable = is_block_or_regular(&cli.device)
        .with_context(|| cli.device.display().to_string())?;
    if !usable {
        bail!("{}: Not a block device or regular file", cli.device.display());
    }

    let opts = cli.check_options();
    let mut stderr = std::io::stderr();
    let outcome = run_cache_check(&cli.device, &opts, &mut stderr)?;
    Ok(exit_code(&opts, outcome.error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn default_flags_walk_everything() {
        let opts = parse(&["cache_check", "md"]).check_options();
        assert!(opts.check_mappings);
        assert!(opts.check_hints);
        assert!(opts.check_discards);
        assert!(!opts.ignore_non_fatal);
        assert!(!opts.quiet);
        assert!(!opts.clear_needs_check);
    }

    #[test]
    fn super_block_only_disables_the_walks() {
        let opts = parse(&["cache_check", "--super-block-only", "md"]).check_options();
        assert!(!opts.check_mappings);
        assert!(!opts.check_hints);
        assert!(!opts.check_discards);
    }

    #[test]
    fn individual_skip_flags() {
        let opts = parse(&["cache_check", "--skip-hints", "md"]).check_options();
        assert!(opts.check_mappings);
        assert!(!opts.check_hints);
        assert!(opts.check_discards);

        let opts = parse(&["cache_check", "--skip-mappings", "--skip-discards", "md"])
            .check_options();
        assert!(!opts.check_mappings);
        assert!(opts.check_hints);
        assert!(!opts.check_discards);
    }

    #[test]
    fn short_quiet_flag() {
        assert!(parse(&["cache_check", "-q", "md"]).quiet);
    }

    #[test]
    fn device_is_required() {
        assert!(Cli::try_parse_from(["cache_check"]).is_err());
    }

    #[test]
    fn run_rejects_non_files() {
        let dir = tempfile::tempdir().expect("dir");
        let cli = Cli::try_parse_from([
            "cache_check",
            dir.path().to_str().expect("utf8 path"),
        ])
        .expect("parse");
        let err = run(&cli).expect_err("directories are not metadata");
        assert!(
            err.to_string()
                .contains("Not a block device or regular file")
        );
    }
}
