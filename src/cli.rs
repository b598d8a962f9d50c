use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "batchzip")]
#[command(version)]
#[command(about = "Batch processing over folders and store-only ZIP archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  batchzip extract assets/ base.zip -o out.zip      copy every input file into out.zip + out.zip.cache\n  \
  batchzip extract base.zip/models -f .mdl$ -o m    copy the .mdl files under models/ into the folder m\n  \
  batchzip pack textures/ sounds/                   pack each folder into <folder>.zip\n  \
  batchzip find out.zip '^models/*.skel$'           first member matching a pattern")]
pub struct Cli {
    /// Override a setting (repeatable), e.g. -s threads=4
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE", global = true)]
    pub set: Vec<String>,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy every input file into one archive, or into a folder
    Extract {
        /// Folders, archives, plain files or paths inside an archive
        #[arg(value_name = "INPUTS", required = true)]
        inputs: Vec<PathBuf>,

        /// Output archive, or output folder with -d
        #[arg(short = 'o', value_name = "OUTPUT")]
        output: PathBuf,

        /// Write plain files into the output folder instead of an archive
        #[arg(short = 'd')]
        to_folder: bool,

        /// Only process files matching a pattern (repeatable)
        #[arg(short = 'f', long = "filter", value_name = "PATTERN")]
        filters: Vec<String>,

        /// Report how many files would be written, write nothing
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Pack each folder into <folder>.zip with its cache
    Pack {
        #[arg(value_name = "FOLDERS", required = true)]
        folders: Vec<PathBuf>,
    },

    /// List the files of an archive
    List {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        /// Show offsets and sizes
        #[arg(short = 'v')]
        verbose: bool,
    },

    /// Find archive members matching a pattern
    Find {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        /// [^]substring[*substring][$]
        #[arg(value_name = "PATTERN")]
        pattern: String,

        /// Print every match instead of the first
        #[arg(short = 'a')]
        all: bool,
    },
}

impl Cli {
    pub fn is_quiet(&self) -> bool {
        self.quiet > 0
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Default settings with every `--set` override applied in order.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = Settings::default();
        for pair in &self.set {
            settings.apply_pair(pair)?;
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extract() {
        let cli = Cli::try_parse_from([
            "batchzip", "-s", "threads=3", "extract", "a", "b.zip", "-o", "out.zip", "-f",
            ".txt$", "-s", "generate_cache=no",
        ])
        .unwrap();

        let settings = cli.settings().unwrap();
        assert_eq!(settings.threads, 3);
        assert!(!settings.generate_cache);

        match cli.command {
            Command::Extract {
                inputs,
                output,
                to_folder,
                filters,
                dry_run,
            } => {
                assert_eq!(inputs, [PathBuf::from("a"), PathBuf::from("b.zip")]);
                assert_eq!(output, PathBuf::from("out.zip"));
                assert!(!to_folder && !dry_run);
                assert_eq!(filters, [".txt$"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_bad_setting() {
        let cli = Cli::try_parse_from(["batchzip", "-s", "threads", "list", "a.zip"]).unwrap();
        assert!(cli.settings().is_err());
        assert!(Cli::try_parse_from(["batchzip", "extract", "a"]).is_err());
    }
}
