//! Merges a config file's flags in ahead of argv before handing both to
//! `argh`, so the config file is written in the same syntax as the command
//! line without introducing a TOML/YAML dependency for it.

use anyhow::Context;

use crate::cli::Args;

/// Parses `std::env::args()`, pre-pending any flags found in `--config
/// <path>` (searched for first, since argh itself has no notion of a config
/// file). Comment lines (`#...`) and blank lines in the config file are
/// skipped.
pub fn load_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let config_path = find_config_flag(&argv);

    let mut merged = Vec::new();
    if let Some(path) = config_path {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file '{path}'"))?;
        merged.extend(tokenize_config(&text));
    }
    merged.extend(argv);

    let owned: Vec<&str> = merged.iter().map(String::as_str).collect();
    Args::from_args(&[env!("CARGO_PKG_NAME")], &owned).map_err(|early_exit| {
        anyhow::anyhow!("{}", early_exit.output)
    })
}

fn find_config_flag(argv: &[String]) -> Option<String> {
    argv.iter()
        .position(|a| a == "--config")
        .and_then(|i| argv.get(i + 1))
        .cloned()
}

/// Splits a config file into whitespace-delimited tokens, one flag/value per
/// line, ignoring blank lines and `#`-comments.
fn tokenize_config(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| line.split_whitespace().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_skipping_comments_and_blanks() {
        let text = "# comment\n--socket-path /tmp/x\n\n--test-mode\n";
        let tokens = tokenize_config(text);
        assert_eq!(tokens, vec!["--socket-path", "/tmp/x", "--test-mode"]);
    }
}
