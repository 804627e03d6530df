use crate::core::Mode;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "grun",
    version,
    about = "A GPU-aware batch job runner for a single host."
)]
pub struct Cli {
    /// The YAML batch file describing GPUs and jobs
    #[arg(long)]
    pub config: PathBuf,

    /// Admission mode: whole devices, or per-GPU memory quotas
    #[arg(long, value_enum, default_value_t = Mode::Exclusive)]
    pub mode: Mode,

    /// Upper bound on concurrently running jobs (default: number of
    /// configured GPUs)
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Seconds to wait after a denied admission before moving on
    #[arg(long, default_value_t = 3)]
    pub interval_for_waiting_gpu: u64,

    /// Seconds to wait between scheduling passes
    #[arg(long, default_value_t = 1)]
    pub interval_for_loop: u64,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_flags_parse() {
        let cli = Cli::parse_from([
            "grun",
            "--config",
            "batch.yaml",
            "--mode",
            "memory",
            "--max-workers",
            "4",
            "--interval-for-waiting-gpu",
            "5",
            "--interval-for-loop",
            "2",
        ]);
        assert_eq!(cli.config, PathBuf::from("batch.yaml"));
        assert_eq!(cli.mode, Mode::Memory);
        assert_eq!(cli.max_workers, Some(4));
        assert_eq!(cli.interval_for_waiting_gpu, 5);
        assert_eq!(cli.interval_for_loop, 2);
    }

    #[test]
    fn test_defaults_match_the_documented_surface() {
        let cli = Cli::parse_from(["grun", "--config", "batch.yaml"]);
        assert_eq!(cli.mode, Mode::Exclusive);
        assert_eq!(cli.max_workers, None);
        assert_eq!(cli.interval_for_waiting_gpu, 3);
        assert_eq!(cli.interval_for_loop, 1);
    }

    #[test]
    fn test_config_flag_is_required() {
        assert!(Cli::try_parse_from(["grun"]).is_err());
    }
}
