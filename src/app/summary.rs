use std::fmt::Write;

use crate::config::{Cli, Config};

fn params_text(value: &serde_yaml::Value) -> String {
    match value.as_mapping() {
        Some(map) if map.is_empty() => "{}".to_string(),
        _ => serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value)),
    }
}

/// Setup banner printed before any work starts.
pub fn setup_summary(cli: &Cli, config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# ENVIRONMENT");
    let _ = writeln!(out, "|-- {:10} {}", "processor", cli.workers());
    let _ = writeln!(out, "|-- {:10} {}", "gpu", cli.gpu);

    let _ = writeln!(out, "# DATASET");
    let _ = writeln!(out, "|-- {:10} {}", "corpus", cli.corpus);
    let _ = writeln!(out, "|-- {:10} {}", "dataset", cli.dataset);

    let _ = writeln!(out, "# SAMPLING");
    let _ = writeln!(
        out,
        "|-- {:10} {}",
        "method",
        config.sampling.as_deref().unwrap_or("none")
    );
    let _ = writeln!(
        out,
        "|-- {:10} {:?} (seed {}, train ratio {})",
        "order", config.partition.order, config.partition.seed, config.partition.train_ratio
    );

    let _ = writeln!(out, "# PRE-PROCESSING PIPELINE");
    for stage in &config.pipeline.prev_roi {
        let _ = writeln!(out, "\t{}", stage);
        let _ = writeln!(out, "\t|\t> {}", params_text(&config.module_params(stage)));
    }
    if config.pipeline.roi {
        let _ = writeln!(out, "\troi extraction (ON)");
        for target in config.roi_targets() {
            let _ = writeln!(out, "\t\t|-- {} {}", target, params_text(&config.roi_params(target)));
        }
    } else {
        let _ = writeln!(out, "\t|-- roi extraction (OFF)");
    }
    for stage in &config.pipeline.post_roi {
        let _ = writeln!(out, "\t{}", stage);
        let _ = writeln!(out, "\t|\t> {}", params_text(&config.module_params(stage)));
    }
    let _ = writeln!(out, "\tchannels {}", config.channel.join(", "));

    let _ = writeln!(out, "# RESULT");
    let _ = writeln!(out, "|-- generating form    {}", cli.form);
    let _ = writeln!(out, "|-- generating valid   {}", cli.valid());
    let _ = writeln!(out, "|-- directory");
    let _ = writeln!(out, "\t|-- {:10} {}", "result", config.result_dir.display());
    let _ = write!(
        out,
        "\t|-- {:10} {}",
        "log",
        config
            .log_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    out
}
