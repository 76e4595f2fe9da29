use std::path::PathBuf;

use clap::Parser;

use crate::worker::OutputForm;

#[derive(Parser, Debug)]
#[command(
    version = env!("CARGO_PKG_VERSION"),
    about = "Preprocess mammography studies into a labeled image dataset",
    long_about = None
)]
pub struct Cli {
    /// Number of parallel workers
    #[arg(short = 'p', long = "processor", default_value_t = num_cpus::get())]
    pub processor: usize,

    /// Forward GPU use to the ROI extractors (0 or 1)
    #[arg(
        short = 'g',
        long = "gpu",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=1)
    )]
    pub gpu: u8,

    /// Corpus name under `data` in the configuration
    #[arg(short = 'c', long = "corpus")]
    pub corpus: String,

    /// Dataset name under the selected corpus
    #[arg(short = 'd', long = "dataset")]
    pub dataset: String,

    /// Output directory layout
    #[arg(short = 'f', long = "form", value_enum)]
    pub form: OutputForm,

    /// Split the dataset into train and validation subsets (0 or 1)
    #[arg(
        short = 'v',
        long = "valid",
        value_parser = clap::value_parser!(u8).range(0..=1)
    )]
    pub valid: Option<u8>,

    /// Configuration file
    #[arg(long = "config", default_value = "config/preprocessing.yaml")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    pub fn gpu(&self) -> bool {
        self.gpu == 1
    }

    pub fn valid(&self) -> bool {
        self.valid == Some(1)
    }

    pub fn workers(&self) -> usize {
        self.processor.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["mammo-prep", "-c", "dream", "-d", "training", "-f", "class"])
            .unwrap();
        assert_eq!(cli.form, OutputForm::Class);
        assert!(cli.gpu());
        assert!(!cli.valid());
        assert!(cli.workers() >= 1);
        assert_eq!(cli.config, PathBuf::from("config/preprocessing.yaml"));
    }

    #[test]
    fn test_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "mammo-prep", "-p", "3", "-g", "0", "-c", "dream", "-d", "training", "-f", "robust",
            "-v", "1", "--config", "custom.yaml", "--verbose",
        ])
        .unwrap();
        assert_eq!(cli.workers(), 3);
        assert!(!cli.gpu());
        assert!(cli.valid());
        assert_eq!(cli.form, OutputForm::Robust);
        assert!(cli.verbose);
    }

    #[test]
    fn test_invalid_form_rejected() {
        let result = Cli::try_parse_from(["mammo-prep", "-c", "dream", "-d", "training", "-f", "invalid"]);
        assert!(result.is_err());
        let result = Cli::try_parse_from(["mammo-prep", "-c", "dream", "-d", "training", "-f", "class", "-g", "2"]);
        assert!(result.is_err());
    }
}
