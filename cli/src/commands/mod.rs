pub mod backup;
pub mod create_set;
pub mod generate_key;
pub mod recover;
pub mod restore;

/// How a command finished, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    WithErrors,
}

impl Outcome {
    pub fn from_errors(has_errors: bool) -> Self {
        if has_errors {
            Self::WithErrors
        } else {
            Self::Clean
        }
    }
}
