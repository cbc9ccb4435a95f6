//! Command-line interface.
//!
//! Deliberately thin: configuration comes from the environment, so the
//! only flag locates the optional `.env` file that seeds it.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "iphoto-downloader",
    version,
    about = "Sync photos from iCloud Photos to a local directory tree",
    after_help = "All configuration is read from environment variables; \
                  see the user guide for the recognized options."
)]
pub struct Cli {
    /// Path to a .env file with the configuration (default: ./.env if present)
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_without_arguments() {
        let cli = Cli::try_parse_from(["iphoto-downloader"]).unwrap();
        assert!(cli.env_file.is_none());
    }

    #[test]
    fn parses_env_file() {
        let cli =
            Cli::try_parse_from(["iphoto-downloader", "--env-file", "/etc/iphoto.env"]).unwrap();
        assert_eq!(cli.env_file, Some(PathBuf::from("/etc/iphoto.env")));
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["iphoto-downloader", "--frobnicate"]).is_err());
    }
}
