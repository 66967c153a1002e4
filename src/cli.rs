use std::fs::read_to_string;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::name::{ Name, mk_anon };

#[derive(StructOpt, Debug)]
#[structopt(raw(setting = "structopt::clap::AppSettings::ColoredHelp"))]
#[structopt(name = "kernel_core",
            about = "Demonstration driver for the term algebra/convertibility kernel core",
            author = "ammkrn",
            version = "0.1.0")]
pub struct Opt {
    #[structopt(short = "d", long = "debug")]
    pub debug: bool,

    /// Disables eta-reduction in the demonstration converter's environment,
    /// matching `converter_options.txt`'s `eta` toggle if both are given the
    /// flag here wins.
    #[structopt(long = "no-eta")]
    pub no_eta: bool,

    /// Disables proof irrelevance in the demonstration converter's
    /// environment.
    #[structopt(long = "no-proof-irrel")]
    pub no_proof_irrel: bool,

    /// Which of the builtin scenarios to run; "all" runs every one in turn.
    #[structopt(short = "s", long = "scenario", default_value = "all")]
    pub scenario: String,
}

/// Mirrors the teacher's `pp_options.txt`/`pp_names.txt` story: plain-text,
/// line-scanned, not serde, looked up first in the current directory and
/// then in a `config/` subdirectory.
#[derive(Debug, Clone)]
pub struct ConverterOptions {
    pub home_module_idx: usize,
    pub extra_opaque: Vec<Name>,
    pub memoize: bool,
    pub eta: bool,
    pub proof_irrel: bool,
}

impl ConverterOptions {
    pub fn new_default() -> Self {
        ConverterOptions { home_module_idx: 0, extra_opaque: Vec::new(), memoize: true, eta: true, proof_irrel: true }
    }
}

// Fast and loose on purpose, same as the teacher's pp_options reader;
// an unparseable line is silently skipped rather than treated as an error.
fn find_true_else_false(s: &str) -> bool {
    s.contains("true")
}

fn find_first_usize(s: &str) -> Option<usize> {
    s.split_whitespace().find_map(|ws| ws.parse::<usize>().ok())
}

pub fn try_read_converter_options() -> Option<ConverterOptions> {
    let mut cwd = std::env::current_dir().ok()?;
    let mut cwd_separate_cfg = cwd.clone();
    cwd.push(PathBuf::from("converter_options.txt"));
    cwd_separate_cfg.push(PathBuf::from("config/converter_options.txt"));

    let mut opts = ConverterOptions::new_default();
    let contents = read_to_string(cwd).ok().or_else(|| read_to_string(cwd_separate_cfg).ok())?;

    for line in contents.lines() {
        match line {
            s if s.starts_with('#') => (),
            s if s.contains("home_module") => opts.home_module_idx = find_first_usize(s).unwrap_or(opts.home_module_idx),
            s if s.contains("memoize") => opts.memoize = find_true_else_false(s),
            s if s.contains("eta") => opts.eta = find_true_else_false(s),
            s if s.contains("proof_irrel") => opts.proof_irrel = find_true_else_false(s),
            s if s.contains("extra_opaque") => {
                if let Ok(n) = s.rsplit(':').next().unwrap_or("").trim().parse::<Name>() {
                    opts.extra_opaque.push(n);
                }
            }
            _ => (),
        }
    }

    Some(opts)
}

impl std::str::FromStr for Name {
    type Err = String;
    fn from_str(s: &str) -> Result<Name, String> {
        let mut base = mk_anon();

        if s.is_empty() {
            return Err("cannot parse the empty/anonymous name".to_string());
        }

        for f in s.split_terminator('.') {
            match f.parse::<u64>() {
                Ok(n) => base = base.extend_num(n),
                _ => {
                    if f.is_empty() {
                        return Err("name component cannot be empty".to_string());
                    } else {
                        base = base.extend_str(f);
                    }
                }
            }
        }

        Ok(base)
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn name_from_str_round_trips_dotted_path() {
        let n: Name = "foo.bar.3".parse().unwrap();
        assert_eq!(format!("{}", n), "foo.bar.3");
    }

    #[test]
    fn default_converter_options_match_teacher_defaults() {
        let opts = ConverterOptions::new_default();
        assert!(opts.eta && opts.proof_irrel && opts.memoize);
        assert!(opts.extra_opaque.is_empty());
    }
}
