use std::collections::HashSet;
use std::path::PathBuf;

use crate::tasks::TaskOption;


/// Options the node adds to every task unless post-processing is skipped.
pub const POST_PROCESSING_OPTIONS: [&str; 3] = ["pc-ept", "cog", "gltf"];


/// The set of option names the engine advertises.
pub trait OptionSchema: Send + Sync {
    fn supports(&self, name: &str) -> bool;
}


#[derive(Clone, Debug, Default)]
pub struct KnownOptions {
    names: HashSet<String>,
}

impl KnownOptions {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect() }
    }

    /// Schema used when the configuration does not list the engine's options.
    pub fn post_processing() -> Self {
        Self::new(POST_PROCESSING_OPTIONS)
    }
}

impl OptionSchema for KnownOptions {
    fn supports(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}


pub fn with_post_processing_defaults(
    mut options: Vec<TaskOption>,
    schema: &dyn OptionSchema,
) -> Vec<TaskOption> {
    for name in POST_PROCESSING_OPTIONS {
        if schema.supports(name) && !options.iter().any(|opt| opt.name == name) {
            options.push(TaskOption::new(name, true));
        }
    }
    options
}


/// Turns options into command-line arguments: `true` becomes a bare flag,
/// `false` and null are dropped, everything else is `--name value`.
pub fn flatten_options(options: &[TaskOption]) -> Vec<String> {
    let mut args = Vec::new();
    for option in options {
        match &option.value {
            serde_json::Value::Bool(true) => {
                args.push(format!("--{}", option.name));
            }
            serde_json::Value::Bool(false) | serde_json::Value::Null => {}
            serde_json::Value::String(value) => {
                args.push(format!("--{}", option.name));
                args.push(value.clone());
            }
            value => {
                args.push(format!("--{}", option.name));
                args.push(value.to_string());
            }
        }
    }
    args
}


pub fn exit_code_message(code: i32) -> String {
    match code {
        1 | 139 | 134 => "Cannot process dataset".to_string(),
        137 => "Not enough memory".to_string(),
        132 => "Cannot process dataset: unsupported CPU".to_string(),
        3 => "Installation issue".to_string(),
        _ => format!("Processing failed ({})", code),
    }
}


/// Resolved inputs of one engine run.
#[derive(Clone, Debug, Default)]
pub struct Invocation {
    pub options: Vec<TaskOption>,
    pub project_path: PathBuf,
    pub gcp: Option<PathBuf>,
    pub geo: Option<PathBuf>,
    pub image_groups: Option<PathBuf>,
    pub task_id: String,
}

impl Invocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = flatten_options(&self.options);
        let injected = [
            ("gcp", &self.gcp),
            ("geo", &self.geo),
            ("split-image-groups", &self.image_groups),
        ];
        for (name, path) in injected {
            if let Some(path) = path {
                args.push(format!("--{}", name));
                args.push(path.to_string_lossy().into_owned());
            }
        }
        args.push("--project-path".to_string());
        args.push(self.project_path.to_string_lossy().into_owned());
        args.push(self.task_id.clone());
        args
    }
}
