use solverbot_data::{Job, JobArgs};
use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

// characters that make a printed argument need quoting
const NEEDS_QUOTING: &[char] = &[' ', '?', '*', '\'', '"', '$', ';', '&', '|'];

/// arguments every solver run starts from
const DEFAULT_ARGS: &[(&str, Option<&str>)] = &[
    ("--d2", None),
    ("--blankDists", None),
    (
        "--popRatioFactorPoints",
        Some("0,1.4,30000,1.4,80000,500,100000,50,120000,500"),
    ),
    ("-g", Some("150000")),
    ("--statLog", Some("statlog")),
    ("--maxSpreadFraction", Some("0.01")),
    ("-o", Some("final.dsz")),
];

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Flag(String),
    Pair(String, String),
}

impl Arg {
    fn name(&self) -> &str {
        match self {
            Arg::Flag(name) | Arg::Pair(name, _) => name,
        }
    }
}

/// Ordered solver command line, pairs keep their position when overridden
#[derive(Debug, Clone, PartialEq)]
pub struct SolverArgs {
    args: Vec<Arg>,
}

impl Default for SolverArgs {
    fn default() -> Self {
        Self {
            args: DEFAULT_ARGS
                .iter()
                .map(|(name, value)| match value {
                    Some(value) => Arg::Pair(name.to_string(), value.to_string()),
                    None => Arg::Flag(name.to_string()),
                })
                .collect(),
        }
    }
}

impl SolverArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pair(mut self, name: &str, value: &str) -> Self {
        self.args
            .push(Arg::Pair(name.to_string(), value.to_string()));
        self
    }

    /// kwargs replace the first argument of the same name or are appended, flags are appended
    pub fn update(mut self, extra: &JobArgs) -> Self {
        for (name, value) in &extra.kwargs {
            let replacement = Arg::Pair(name.clone(), value.clone());

            match self.args.iter_mut().find(|arg| arg.name() == name) {
                Some(existing) => *existing = replacement,
                None => self.args.push(replacement),
            }
        }

        for flag in &extra.args {
            self.args.push(Arg::Flag(flag.clone()));
        }

        self
    }

    pub fn into_vec(self) -> Vec<String> {
        self.args
            .into_iter()
            .flat_map(|arg| match arg {
                Arg::Flag(name) => vec![name],
                Arg::Pair(name, value) => vec![name, value],
            })
            .collect()
    }
}

/// `<data>/<REGION>/<region>.pb`
pub fn dataset_path(data_dir: &Path, job: &Job) -> PathBuf {
    data_dir
        .join(&job.region)
        .join(format!("{}.pb", job.region.to_lowercase()))
}

/// full argument list for one run of `job`
pub fn job_command_args(job: &Job, data_dir: &Path, full_priority: bool) -> Vec<String> {
    let mut args = SolverArgs::new()
        .update(&job.common)
        .update(&job.solver)
        .pair("-P", &dataset_path(data_dir, job).to_string_lossy());

    if !full_priority {
        args = args.pair("-nice", "19");
    }

    args.into_vec()
}

/// quote an argument for a copy-pasteable command line
pub fn shell_escape(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        Cow::Borrowed("''")
    } else if arg.contains(NEEDS_QUOTING) {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    } else {
        Cow::Borrowed(arg)
    }
}
